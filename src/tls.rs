//! TLS client configuration for `ldaps://` connections.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pemfile::certs;
use std::fs;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::TlsConfig;

/// Build a connector from the `tls` config section (system roots when absent).
pub fn connector(tls: Option<&TlsConfig>) -> Result<TlsConnector> {
    let tls = tls.cloned().unwrap_or_default();
    let config = if tls.skip_verify.unwrap_or(false) {
        warn!("TLS certificate verification disabled");
        tls_client_config_insecure()?
    } else {
        let extra = match tls.ca_file.as_deref() {
            Some(path) => load_certs_from_file(path)?,
            None => Vec::new(),
        };
        tls_client_config_with_ca(extra)?
    };
    Ok(TlsConnector::from(config))
}

fn load_certs_from_file(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path).with_context(|| format!("Open CA file: {}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path);
    }
    Ok(certs)
}

/// System root certificates plus `extra` trust anchors.
fn tls_client_config_with_ca(extra: Vec<CertificateDer<'static>>) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().context("Load system CA certs")? {
        if let Err(e) = root_store.add(cert) {
            debug!(error = %e, "skipping unusable system certificate");
        }
    }
    for cert in extra {
        root_store
            .add(cert)
            .context("Add CA certificate to root store")?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn tls_client_config_insecure() -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = UncheckedChainVerifier {
        provider: Arc::clone(&provider),
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Accepts any certificate chain and host name, but still checks that the
/// server holds the key of the certificate it presented.
#[derive(Debug)]
struct UncheckedChainVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for UncheckedChainVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        debug!(server = ?server_name, bytes = end_entity.len(), "accepting unverified certificate");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
