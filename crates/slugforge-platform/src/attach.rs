// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rendezvous dial to a worker's attach channel.
//!
//! The platform hands back an attach URL for a freshly allocated
//! worker. Dialing it is a tiny text handshake: connect (TLS for
//! anything but `tcp://`, which test rigs use), send the URL path
//! without its leading slash followed by CRLF, then read and discard
//! one newline-terminated line. What remains is the worker's stdio as
//! a bidirectional byte stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::error::PlatformError;

/// The worker's stdio stream, TLS or plain.
pub type AttachStream = Box<dyn AttachIo>;

/// Object-safe bound for the attach stream.
pub trait AttachIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AttachIo for T {}

impl std::fmt::Debug for dyn AttachIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AttachStream")
    }
}

/// Dial `attach_url` and complete the rendezvous handshake.
///
/// `insecure` skips certificate verification (for development only!).
pub async fn dial_attach(attach_url: &str, insecure: bool) -> Result<AttachStream, PlatformError> {
    let url = Url::parse(attach_url).map_err(|e| PlatformError::InvalidUrl {
        url: attach_url.to_string(),
        reason: e.to_string(),
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| PlatformError::InvalidUrl {
            url: attach_url.to_string(),
            reason: "missing host".to_string(),
        })?
        .to_string();
    let port = url.port().unwrap_or(443);

    debug!(%host, port, scheme = url.scheme(), "dialing attach channel");
    let tcp = TcpStream::connect((host.as_str(), port)).await?;

    let mut stream: AttachStream = if url.scheme() == "tcp" {
        Box::new(tcp)
    } else {
        let connector = TlsConnector::from(Arc::new(tls_config(insecure)));
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|e| PlatformError::Tls(e.to_string()))?;
        Box::new(connector.connect(server_name, tcp).await?)
    };

    let secret = url.path().trim_start_matches('/');
    stream
        .write_all(format!("{secret}\r\n").as_bytes())
        .await?;

    // One line of acknowledgement; contents are ignored.
    read_line(&mut stream).await?;
    debug!("attach channel established");
    Ok(stream)
}

fn tls_config(insecure: bool) -> rustls::ClientConfig {
    if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }
}

async fn read_line<S>(stream: &mut S) -> Result<(), PlatformError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            return Ok(());
        }
    }
}

/// Certificate verifier that skips all verification (for development only!)
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
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
