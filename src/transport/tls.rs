/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! TLS context: cipher selection, trust roots, SNI choice and the
//! organization check for trusted front-ends. Certificates are checked
//! against the CA chain, not the name that was dialed.

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::verifier::ChainOnlyVerifier;
use crate::config::{CipherProfile, LinkConfig};
use crate::error::{TransportError, TransportResult};

/// Suites offered to the trusted front-end, strongest first
pub const GWS_CIPHERS: &str = "TLS13_AES_128_GCM_SHA256:\
TLS13_AES_256_GCM_SHA384:\
TLS13_CHACHA20_POLY1305_SHA256:\
ECDHE-ECDSA-AES128-GCM-SHA256:\
ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-AES256-GCM-SHA384:\
ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-ECDSA-CHACHA20-POLY1305:\
ECDHE-RSA-CHACHA20-POLY1305";

/// OpenSSL-style names mapped to their IANA spelling
const OPENSSL_ALIASES: &[(&str, &str)] = &[
    ("ECDHE-ECDSA-AES128-GCM-SHA256", "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"),
    ("ECDHE-ECDSA-AES256-GCM-SHA384", "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384"),
    ("ECDHE-RSA-AES128-GCM-SHA256", "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
    ("ECDHE-RSA-AES256-GCM-SHA384", "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384"),
    ("ECDHE-ECDSA-CHACHA20-POLY1305", "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"),
    ("ECDHE-RSA-CHACHA20-POLY1305", "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"),
];

fn canonical_name(name: &str) -> &str {
    OPENSSL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map_or(name, |(_, iana)| iana)
}

/// Pick suites from `available` named in the colon-separated `list`, in list order.
///
/// Names the provider does not implement are skipped.
pub fn select_cipher_suites(
    list: &str,
    available: &[SupportedCipherSuite],
) -> Vec<SupportedCipherSuite> {
    let mut selected: Vec<SupportedCipherSuite> = Vec::new();
    for name in list.split(':').map(str::trim).filter(|n| !n.is_empty()) {
        let wanted = canonical_name(name);
        if let Some(suite) = available
            .iter()
            .find(|suite| format!("{:?}", suite.suite()) == wanted)
        {
            if !selected.iter().any(|s| s.suite() == suite.suite()) {
                selected.push(*suite);
            }
        }
    }
    selected
}

/// Subject organization of a DER-encoded certificate
pub fn organization_of(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let organization = cert
        .subject()
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    organization
}

fn load_roots(bundle: Option<&Path>) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match bundle {
        Some(path) => {
            let file = File::open(path)
                .map_err(|e| TransportError::persist(path.display().to_string(), e))?;
            let certs: Vec<CertificateDer<'static>> =
                rustls_pemfile::certs(&mut BufReader::new(file))
                    .collect::<Result<_, _>>()
                    .map_err(|e| TransportError::persist(path.display().to_string(), e))?;
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!("loaded {} roots from {} ({} ignored)", added, path.display(), ignored);
            if added == 0 {
                return Err(TransportError::Config {
                    message: format!("no usable certificates in {}", path.display()),
                });
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// Client-side TLS settings shared by every racer
pub struct TlsContext {
    connector: TlsConnector,
    platform_suffix: String,
    platform_server_name: String,
    trusted_organization: String,
}

impl TlsContext {
    pub fn from_config(link: &LinkConfig) -> TransportResult<Self> {
        let mut provider: CryptoProvider = ring::default_provider();
        let list = match (&link.ciphers, link.cipher_profile) {
            (Some(explicit), _) => Some(explicit.as_str()),
            (None, CipherProfile::Gws) => Some(GWS_CIPHERS),
            (None, CipherProfile::Default) => None,
        };
        if let Some(list) = list {
            provider.cipher_suites = select_cipher_suites(list, &provider.cipher_suites);
        }

        let has_tls13 = provider
            .cipher_suites
            .iter()
            .any(|s| matches!(s, SupportedCipherSuite::Tls13(_)));
        let has_tls12 = provider
            .cipher_suites
            .iter()
            .any(|s| matches!(s, SupportedCipherSuite::Tls12(_)));
        let versions: &[&'static rustls::SupportedProtocolVersion] = match (has_tls12, has_tls13) {
            (true, true) => &[&rustls::version::TLS13, &rustls::version::TLS12],
            (true, false) => &[&rustls::version::TLS12],
            (false, true) => &[&rustls::version::TLS13],
            (false, false) => {
                return Err(TransportError::Config {
                    message: "cipher list selects no supported suite".to_string(),
                })
            }
        };

        let roots = load_roots(link.ca_bundle.as_deref())?;
        let provider = Arc::new(provider);
        let verifier = ChainOnlyVerifier::with_roots(roots, provider.clone()).map_err(|e| {
            TransportError::Config {
                message: e.to_string(),
            }
        })?;
        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)
            .map_err(|e| TransportError::Config {
                message: e.to_string(),
            })?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            platform_suffix: link.platform_suffix.clone(),
            platform_server_name: link.platform_server_name.clone(),
            trusted_organization: link.trusted_organization.clone(),
        })
    }

    /// SNI for a logical host: platform-hosted aliases present the front name
    pub fn server_name_for<'a>(&'a self, host: &'a str) -> &'a str {
        if !self.platform_suffix.is_empty() && host.ends_with(&self.platform_suffix) {
            &self.platform_server_name
        } else {
            host
        }
    }

    pub async fn handshake(
        &self,
        tcp: TcpStream,
        host: &str,
        addr: SocketAddr,
    ) -> TransportResult<TlsStream<TcpStream>> {
        let sni = self.server_name_for(host);
        let server_name = ServerName::try_from(sni.to_string()).map_err(|_| {
            TransportError::Config {
                message: format!("'{}' is not a valid server name", sni),
            }
        })?;
        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::handshake(addr, e))
    }

    /// Fail unless the peer's leaf certificate names the trusted organization
    pub fn verify_organization(
        &self,
        stream: &TlsStream<TcpStream>,
        addr: SocketAddr,
    ) -> TransportResult<()> {
        let organization = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .and_then(|leaf| organization_of(leaf.as_ref()));
        if organization.as_deref() == Some(self.trusted_organization.as_str()) {
            Ok(())
        } else {
            Err(TransportError::Trust { addr, organization })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ca_bundle_path, fixture_certs, FRONT_CERT, IMPOSTOR_CERT};

    #[test]
    fn test_gws_profile_selects_known_suites_in_order() {
        let provider = ring::default_provider();
        let selected = select_cipher_suites(GWS_CIPHERS, &provider.cipher_suites);
        assert!(!selected.is_empty());
        assert_eq!(
            format!("{:?}", selected[0].suite()),
            "TLS13_AES_128_GCM_SHA256"
        );
        assert!(selected
            .iter()
            .any(|s| format!("{:?}", s.suite()) == "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"));
    }

    #[test]
    fn test_unknown_and_duplicate_names_are_skipped() {
        let provider = ring::default_provider();
        let selected = select_cipher_suites(
            "RC4-MD5:ECDHE-RSA-AES128-GCM-SHA256:TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            &provider.cipher_suites,
        );
        assert_eq!(selected.len(), 1);
        assert!(select_cipher_suites("RC4-MD5:DES-CBC3-SHA", &provider.cipher_suites).is_empty());
    }

    #[test]
    fn test_context_builds_for_each_profile() {
        let mut link = LinkConfig::default();
        assert!(TlsContext::from_config(&link).is_ok());
        link.cipher_profile = CipherProfile::Default;
        assert!(TlsContext::from_config(&link).is_ok());
        link.ciphers = Some("ECDHE-RSA-AES128-GCM-SHA256".to_string());
        assert!(TlsContext::from_config(&link).is_ok());
        link.ciphers = Some("NULL-MD5".to_string());
        assert!(TlsContext::from_config(&link).is_err());
    }

    #[test]
    fn test_platform_alias_uses_front_name() {
        let ctx = TlsContext::from_config(&LinkConfig::default()).unwrap();
        assert_eq!(ctx.server_name_for("myapp.appspot.com"), "www.google.com");
        assert_eq!(ctx.server_name_for("example.org"), "example.org");
    }

    #[test]
    fn test_organization_of_garbage_is_none() {
        assert_eq!(organization_of(b"not a certificate"), None);
    }

    #[test]
    fn test_organization_of_certificate() {
        let front = fixture_certs(FRONT_CERT).remove(0);
        assert_eq!(organization_of(front.as_ref()).as_deref(), Some("Frontrace Test Trust"));
        let impostor = fixture_certs(IMPOSTOR_CERT).remove(0);
        assert_eq!(organization_of(impostor.as_ref()).as_deref(), Some("Mallory Ltd"));
    }

    #[test]
    fn test_bundle_replaces_builtin_roots() {
        let link = LinkConfig {
            ca_bundle: Some(ca_bundle_path()),
            ..LinkConfig::default()
        };
        assert!(TlsContext::from_config(&link).is_ok());

        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();
        let link = LinkConfig {
            ca_bundle: Some(empty),
            ..LinkConfig::default()
        };
        assert!(matches!(TlsContext::from_config(&link), Err(TransportError::Config { .. })));
    }
}
