/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Transport error taxonomy. Every error that originates from a specific
//! candidate address carries that address as a field.

use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// TCP connect failed or was reset
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// TLS handshake failed
    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Peer certificate did not carry the expected organization
    #[error("certificate of {addr} belongs to {organization:?}, not the trusted identity")]
    Trust {
        addr: SocketAddr,
        organization: Option<String>,
    },

    /// A connect, handshake or read phase ran out of time
    #[error("{phase} timed out for {addr}")]
    Timeout { addr: SocketAddr, phase: Phase },

    /// Upstream answered with something we cannot use
    #[error("protocol violation: {message}")]
    Protocol { message: String },

    /// The resolver returned no candidates
    #[error("no candidate addresses for '{host}'")]
    Resolve { host: String },

    /// Every race round failed
    #[error("all {attempts} rounds failed for '{host}': {last}")]
    Exhausted {
        host: String,
        attempts: usize,
        #[source]
        last: Box<TransportError>,
    },

    /// The local client went away while we were writing to it
    #[error("client connection closed")]
    ClientGone,

    /// Reading or writing a persisted file failed
    #[error("failed to persist '{path}': {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The IP discovery collaborator failed
    #[error("IP discovery failed: {message}")]
    Discovery { message: String },
}

/// Connection phase that timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Handshake,
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connect => write!(f, "connect"),
            Phase::Handshake => write!(f, "handshake"),
            Phase::Read => write!(f, "read"),
        }
    }
}

/// Coarse classification deciding how an error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts and resets: retried locally
    TransientNetwork,
    /// Unexpected status or missing headers: treated like a transient failure
    ProtocolViolation,
    /// Certificate identity mismatch: address penalised and skipped
    TrustViolation,
    /// The client went away or local I/O failed: abort, never retry
    FatalLocal,
    /// Nothing worked after every round
    ResourceExhaustion,
}

impl TransportError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Connect { .. }
            | TransportError::Handshake { .. }
            | TransportError::Timeout { .. } => ErrorClass::TransientNetwork,
            TransportError::Protocol { .. } => ErrorClass::ProtocolViolation,
            TransportError::Trust { .. } => ErrorClass::TrustViolation,
            TransportError::Exhausted { .. }
            | TransportError::Resolve { .. }
            | TransportError::Discovery { .. } => ErrorClass::ResourceExhaustion,
            TransportError::ClientGone
            | TransportError::Persist { .. }
            | TransportError::Config { .. } => ErrorClass::FatalLocal,
        }
    }

    /// Check if this error may be retried against another address
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransientNetwork | ErrorClass::ProtocolViolation | ErrorClass::TrustViolation
        )
    }

    /// Address the failure originated from, if any
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            TransportError::Connect { addr, .. }
            | TransportError::Handshake { addr, .. }
            | TransportError::Trust { addr, .. }
            | TransportError::Timeout { addr, .. } => Some(*addr),
            TransportError::Exhausted { last, .. } => last.addr(),
            _ => None,
        }
    }

    /// True when the peer reset the connection
    pub fn is_reset(&self) -> bool {
        match self {
            TransportError::Connect { source, .. } | TransportError::Handshake { source, .. } => {
                source.kind() == std::io::ErrorKind::ConnectionReset
            }
            _ => false,
        }
    }

    /// True when the peer closed the socket in the middle of a TLS handshake
    pub fn is_unexpected_eof(&self) -> bool {
        match self {
            TransportError::Handshake { source, .. } => {
                source.kind() == std::io::ErrorKind::UnexpectedEof
            }
            _ => false,
        }
    }

    pub fn connect(addr: SocketAddr, source: std::io::Error) -> Self {
        TransportError::Connect { addr, source }
    }

    pub fn handshake(addr: SocketAddr, source: std::io::Error) -> Self {
        TransportError::Handshake { addr, source }
    }

    pub fn timeout(addr: SocketAddr, phase: Phase) -> Self {
        TransportError::Timeout { addr, phase }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        TransportError::Protocol {
            message: message.into(),
        }
    }

    pub fn persist(path: impl Into<String>, source: std::io::Error) -> Self {
        TransportError::Persist {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.7:443".parse().unwrap()
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::timeout(addr(), Phase::Handshake);
        assert_eq!(format!("{}", err), "handshake timed out for 203.0.113.7:443");
    }

    #[test]
    fn test_origin_address_survives_exhaustion() {
        let last = TransportError::Trust {
            addr: addr(),
            organization: Some("Evil Corp".to_string()),
        };
        let err = TransportError::Exhausted {
            host: "example.org".to_string(),
            attempts: 2,
            last: Box::new(last),
        };
        assert_eq!(err.addr(), Some(addr()));
        assert_eq!(err.class(), ErrorClass::ResourceExhaustion);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classification() {
        assert!(TransportError::protocol("missing Content-Range").is_retryable());
        assert!(TransportError::Trust { addr: addr(), organization: None }.is_retryable());
        assert!(!TransportError::ClientGone.is_retryable());

        let reset = TransportError::connect(
            addr(),
            std::io::Error::from(std::io::ErrorKind::ConnectionReset),
        );
        assert!(reset.is_reset());
        assert_eq!(reset.class(), ErrorClass::TransientNetwork);

        let eof = TransportError::handshake(
            addr(),
            std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
        );
        assert!(eof.is_unexpected_eof());
        assert!(!reset.is_unexpected_eof());
    }
}
