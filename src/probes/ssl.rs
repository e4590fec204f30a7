//! NIP-66 TLS certificate probe (§4.8): clearnet only.
//!
//! Two connections are made deliberately: one with certificate verification
//! on, to record whether the relay's cert is trusted by webpki's root
//! store, and one with verification off (via [`crate::ws::dial`]'s insecure
//! path) purely to extract the leaf certificate's fields even when it's
//! invalid or self-signed. A relay with a broken cert still gets its
//! `valid: false` and subject/issuer/expiry recorded rather than being
//! skipped outright.

use super::ProbeOutcome;
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use x509_parser::prelude::*;

/// Probes the host:port extracted from `url` (which must be a `wss://`
/// clearnet relay url). Never raises.
pub async fn probe(url: &str, timeout: Duration) -> ProbeOutcome {
    let mut logs = Vec::new();
    let Some((host, port)) = host_port(url) else {
        return ProbeOutcome::failed("url is not a clearnet wss:// relay", logs);
    };
    logs.push(format!("connecting to {host}:{port}"));

    let cert = match tokio::time::timeout(timeout, fetch_leaf_cert(&host, port)).await {
        Ok(Ok(c)) => c,
        Ok(Err(e)) => return ProbeOutcome::failed(format!("tls connect failed: {e}"), logs),
        Err(_) => return ProbeOutcome::failed("timed out fetching certificate", logs),
    };

    let verified = tokio::time::timeout(timeout, verifies_with_webpki_roots(&host, port))
        .await
        .unwrap_or(false);
    logs.push(format!("webpki verification: {verified}"));

    let (not_before, not_after, subject, issuer) = match X509Certificate::from_der(&cert) {
        Ok((_, parsed)) => (
            parsed.validity().not_before.timestamp(),
            parsed.validity().not_after.timestamp(),
            parsed.subject().to_string(),
            parsed.issuer().to_string(),
        ),
        Err(e) => return ProbeOutcome::failed(format!("failed parsing certificate: {e}"), logs),
    };

    ProbeOutcome::ok(
        json!({
            "valid": verified,
            "subject": subject,
            "issuer": issuer,
            "not_before": not_before,
            "not_after": not_after,
        }),
        logs,
    )
}

fn host_port(url: &str) -> Option<(String, u16)> {
    let parsed = url::Url::parse(url).ok()?;
    if parsed.scheme() != "wss" {
        return None;
    }
    let host = parsed.host_str()?.to_string();
    let port = parsed.port().unwrap_or(443);
    Some((host, port))
}

/// Connects with certificate verification disabled and returns the leaf
/// certificate's raw DER bytes, regardless of trust.
async fn fetch_leaf_cert(host: &str, port: u16) -> std::io::Result<Vec<u8>> {
    let stream = TcpStream::connect((host, port)).await?;
    let config = crate::ws::insecure_client_config();
    let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let tls_stream = connector.connect(server_name, stream).await?;
    let (_, session) = tls_stream.get_ref();
    session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|c| c.as_ref().to_vec())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no peer certificate"))
}

/// Connects with the default webpki-backed verifier; success means the
/// chain validated.
async fn verifies_with_webpki_roots(host: &str, port: u16) -> bool {
    let Ok(stream) = TcpStream::connect((host, port)).await else {
        return false;
    };
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
    let Ok(server_name) = rustls::pki_types::ServerName::try_from(host.to_string()) else {
        return false;
    };
    connector.connect(server_name, stream).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_rejects_non_wss() {
        assert!(host_port("ws://abc.onion").is_none());
    }

    #[test]
    fn host_port_defaults_to_443() {
        let (host, port) = host_port("wss://relay.example.com").unwrap();
        assert_eq!(host, "relay.example.com");
        assert_eq!(port, 443);
    }
}
