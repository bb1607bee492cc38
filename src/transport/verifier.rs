/*
 * frontrace - Connection racing transport core for front-end forwarding proxies.
 * Copyright (C) 2025  frontrace contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Server certificate verification against the CA chain only.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{VerifierBuilderError, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};
use std::sync::Arc;

/// Wraps the WebPKI verifier and accepts a certificate whose chain checks out
/// whatever names it carries.
///
/// Front-ends are dialed by IP and serve many names. Trusted ones are pinned
/// by organization once the handshake is done.
#[derive(Debug)]
pub struct ChainOnlyVerifier {
    inner: Arc<dyn ServerCertVerifier>,
}

impl ChainOnlyVerifier {
    pub fn new(inner: Arc<dyn ServerCertVerifier>) -> Self {
        Self { inner }
    }

    pub fn with_roots(
        roots: RootCertStore,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, VerifierBuilderError> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
        Ok(Self::new(inner))
    }
}

fn is_name_mismatch(err: &TlsError) -> bool {
    matches!(
        err,
        TlsError::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
        )
    )
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        // the name is checked after the chain, so a name error means the chain held
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(err) if is_name_mismatch(&err) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{fixture_certs, CA_CERT, FRONT_CERT};
    use rustls::crypto::ring;

    fn verifier() -> ChainOnlyVerifier {
        let mut roots = RootCertStore::empty();
        roots.add_parsable_certificates(fixture_certs(CA_CERT));
        ChainOnlyVerifier::with_roots(roots, Arc::new(ring::default_provider())).unwrap()
    }

    #[test]
    fn test_name_mismatch_is_accepted() {
        let leaf = fixture_certs(FRONT_CERT).remove(0);
        let verifier = verifier();
        let now = UnixTime::now();
        for name in ["front.test", "www.google.com"] {
            let name = ServerName::try_from(name).unwrap();
            assert!(verifier.verify_server_cert(&leaf, &[], &name, &[], now).is_ok());
        }
    }

    #[test]
    fn test_unknown_chain_is_rejected() {
        let leaf = fixture_certs(FRONT_CERT).remove(0);
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let verifier =
            ChainOnlyVerifier::with_roots(roots, Arc::new(ring::default_provider())).unwrap();
        let name = ServerName::try_from("front.test").unwrap();
        let err = verifier
            .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert!(!is_name_mismatch(&err));
    }
}
