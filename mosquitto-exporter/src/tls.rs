//! Transport selection and TLS material loading for the broker connection.
//!
//! Broken TLS material never aborts the exporter: problems are logged and the
//! connection goes ahead without the offending piece.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rumqttc::tokio_rustls::rustls;
use rumqttc::{TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{error, info, warn};

use crate::config::{BrokerEndpoint, TlsConfig};
use crate::error::{ExporterError, Result};

/// Pick the transport for an endpoint, loading TLS material when needed.
pub fn build_transport(endpoint: &BrokerEndpoint, tls: &TlsConfig) -> Transport {
    let identity = match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => {
            if !endpoint.tls {
                warn!(
                    "To use TLS the endpoint URL will have to begin with 'ssl://', 'tls://' or 'mqtts://'"
                );
            }
            Some((cert.as_str(), key.as_str()))
        }
        (Some(_), None) | (None, Some(_)) => {
            warn!(
                "For TLS to work both certificate and private key are needed. Skipping TLS client authentication."
            );
            None
        }
        (None, None) => None,
    };

    if !endpoint.tls {
        return Transport::Tcp;
    }

    let config = client_config(tls.ca_cert.as_deref(), identity);
    Transport::tls_with_config(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Build the rustls client configuration.
fn client_config(ca_cert: Option<&str>, identity: Option<(&str, &str)>) -> ClientConfig {
    let roots = ca_cert.and_then(|path| match load_root_store(path) {
        Ok(store) => Some(store),
        Err(e) => {
            error!(path, error = %e, "Failed to load CA certificate");
            None
        }
    });

    if roots.is_none() {
        warn!("No usable CA certificate, broker certificate will not be verified");
    }

    let builder = || match roots.clone() {
        Some(store) => ClientConfig::builder().with_root_certificates(store),
        None => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert)),
    };

    if let Some((cert_path, key_path)) = identity {
        let loaded = load_certs(cert_path).and_then(|certs| {
            let key = load_private_key(key_path)?;
            builder()
                .with_client_auth_cert(certs, key)
                .map_err(|e| ExporterError::tls(e.to_string()))
        });

        match loaded {
            Ok(config) => {
                info!(cert = cert_path, "Loaded TLS client certificate");
                return config;
            }
            Err(e) => {
                error!(
                    cert = cert_path,
                    key = key_path,
                    error = %e,
                    "Failed to load certificate/keypair"
                );
            }
        }
    }

    builder().with_no_client_auth()
}

/// Read every certificate from a PEM file.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;

    if certs.is_empty() {
        return Err(ExporterError::tls(format!("no certificate found in {}", path)));
    }
    Ok(certs)
}

/// Read the first private key from a PEM file.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| ExporterError::tls(format!("no private key found in {}", path)))
}

fn load_root_store(path: &str) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in load_certs(path)? {
        store
            .add(cert)
            .map_err(|e| ExporterError::tls(e.to_string()))?;
    }
    Ok(store)
}

/// Accepts whatever certificate the broker presents.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
