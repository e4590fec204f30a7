//! Shared WebSocket transport for Validator, Monitor, and Synchronizer
//! (§4.1, §5).
//!
//! Clearnet relays are dialed directly over TLS (`tokio-rustls`, with an
//! optional certificate-verification bypass for probes that need to inspect
//! an invalid cert rather than refuse it); tor/i2p/loki relays are dialed
//! through a local SOCKS5 proxy via `tokio-socks`, since that's how every
//! non-clearnet Nostr relay is actually reached.

use crate::model::Network;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum DialError {
    #[error("socks5 proxy dial failed: {0}")]
    Socks(#[from] tokio_socks::Error),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("relay url has no host")]
    NoHost,
}

/// Where a non-clearnet relay's WebSocket TCP stream should be dialed
/// through. Finder/Monitor/Synchronizer each run one of these per enabled
/// network (§5).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub socks5_addr: String,
}

/// Connects to `url`, proxying through `proxy` when `network` isn't
/// clearnet, and completes the WebSocket upgrade. Bounded by `timeout`.
pub async fn dial(
    url: &str,
    network: Network,
    proxy: Option<&ProxyConfig>,
    allow_insecure_tls: bool,
    timeout: Duration,
) -> Result<Socket, DialError> {
    tokio::time::timeout(timeout, dial_inner(url, network, proxy, allow_insecure_tls))
        .await
        .map_err(|_| DialError::Timeout(timeout))?
}

async fn dial_inner(
    url: &str,
    network: Network,
    proxy: Option<&ProxyConfig>,
    allow_insecure_tls: bool,
) -> Result<Socket, DialError> {
    let connector = if allow_insecure_tls {
        Some(insecure_connector())
    } else {
        None
    };

    match network {
        Network::Clearnet => {
            let (socket, _resp) =
                tokio_tungstenite::connect_async_tls_with_config(url, None, false, connector)
                    .await?;
            Ok(socket)
        }
        Network::Tor | Network::I2p | Network::Loki => {
            let proxy = proxy.ok_or(DialError::NoHost)?;
            let parsed = url::Url::parse(url).map_err(|_| DialError::NoHost)?;
            let host = parsed.host_str().ok_or(DialError::NoHost)?;
            let port = parsed.port_or_known_default().unwrap_or(80);

            let stream = Socks5Stream::connect(proxy.socks5_addr.as_str(), (host, port))
                .await?
                .into_inner();
            let (socket, _resp) = tokio_tungstenite::client_async_with_config(
                url,
                MaybeTlsStream::Plain(stream),
                Some(WebSocketConfig::default()),
            )
            .await?;
            Ok(socket)
        }
    }
}

fn insecure_connector() -> Connector {
    Connector::Rustls(Arc::new(insecure_client_config()))
}

/// Builds a `rustls::ClientConfig` that accepts every certificate. Shared
/// with the SSL probe, which makes its own raw TLS connection to extract a
/// leaf certificate's fields even when the chain doesn't validate (§4.8).
pub(crate) fn insecure_client_config() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

/// Accepts every certificate. Used only when a probe is deliberately
/// checking whether a relay's cert is valid (§4.8 SSL probe) — the probe
/// still records what it saw, it just doesn't want the transport layer to
/// refuse the connection before it can look.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
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
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}
