//! SHA-1 thumbprint of the top certificate served by an OIDC issuer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ring::digest::{SHA1_FOR_LEGACY_USE_ONLY, digest};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Host part of an issuer URL such as `https://oidc.eks.us-east-1.amazonaws.com/id/ABC`.
pub fn issuer_host(issuer_url: &str) -> &str {
    let without_scheme = issuer_url
        .strip_prefix("https://")
        .unwrap_or(issuer_url);
    without_scheme.split('/').next().unwrap_or(without_scheme)
}

/// Lowercase hex SHA-1 of a DER certificate.
pub fn fingerprint(cert: &[u8]) -> String {
    hex::encode(digest(&SHA1_FOR_LEGACY_USE_ONLY, cert))
}

/// Connect to the issuer host and fingerprint the last certificate of the served chain.
pub async fn issuer_thumbprint(issuer_url: &str) -> Result<String> {
    let host = issuer_host(issuer_url).to_string();
    debug!("Fetching TLS chain from {}", host);

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(ChainCapture))
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name =
        ServerName::try_from(host.clone()).context("Issuer host is not a valid server name")?;

    let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let stream = TcpStream::connect((host.as_str(), 443)).await?;
        connector.connect(server_name, stream).await
    })
    .await
    .with_context(|| format!("TLS handshake with {host} timed out"))?
    .with_context(|| format!("TLS handshake with {host} failed"))?;

    let chain = tls
        .get_ref()
        .1
        .peer_certificates()
        .ok_or_else(|| anyhow::anyhow!("{host} presented no certificates"))?;
    let top = chain
        .last()
        .ok_or_else(|| anyhow::anyhow!("{host} presented an empty chain"))?;

    Ok(fingerprint(top.as_ref()))
}

/// Accepts any chain; the handshake only exists to read the certificates.
///
/// IAM validates EKS issuers against its own trusted CA library and ignores the
/// thumbprint for them, so the fingerprint is only a registration input.
#[derive(Debug)]
struct ChainCapture;

impl rustls::client::danger::ServerCertVerifier for ChainCapture {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
