//! Validated relay URLs (§3).

use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RelayError {
    #[error("failed to parse url: {0}")]
    Parse(String),
    #[error("url must not contain a query string")]
    HasQuery,
    #[error("url must not contain a fragment")]
    HasFragment,
    #[error("url has no host")]
    NoHost,
    #[error("scheme {scheme} is invalid for network {network:?}, expected {expected}")]
    WrongScheme {
        scheme: String,
        network: Network,
        expected: &'static str,
    },
    #[error("host resolves to a private or loopback address: {0}")]
    PrivateAddress(String),
}

/// The network reached by a relay's authority (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Clearnet,
    Tor,
    I2p,
    Loki,
}

impl Network {
    /// Classifies a host by its top-level label, per §3: `.onion` -> tor,
    /// `.i2p` -> i2p, `.loki` -> loki, anything else -> clearnet.
    fn from_host(host: &str) -> Self {
        if host.ends_with(".onion") {
            Network::Tor
        } else if host.ends_with(".i2p") {
            Network::I2p
        } else if host.ends_with(".loki") {
            Network::Loki
        } else {
            Network::Clearnet
        }
    }

    pub fn expected_scheme(self) -> &'static str {
        match self {
            Network::Clearnet => "wss",
            Network::Tor | Network::I2p | Network::Loki => "ws",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Clearnet => "clearnet",
            Network::Tor => "tor",
            Network::I2p => "i2p",
            Network::Loki => "loki",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clearnet" => Some(Network::Clearnet),
            "tor" => Some(Network::Tor),
            "i2p" => Some(Network::I2p),
            "loki" => Some(Network::Loki),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated WebSocket relay endpoint. Immutable after construction; the
/// constructor performs all validation from §3's Relay invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    url: String,
    network: Network,
    discovered_at: i64,
}

impl Relay {
    /// Validates and canonicalizes `raw_url`, deriving its network and
    /// freezing `discovered_at`. Rejects non-RFC3986 URLs, query strings,
    /// fragments, scheme/network mismatches, and private/loopback
    /// addresses.
    pub fn new(raw_url: &str, discovered_at: i64) -> Result<Self, RelayError> {
        let parsed = Url::parse(raw_url).map_err(|e| RelayError::Parse(e.to_string()))?;

        if parsed.query().is_some() {
            return Err(RelayError::HasQuery);
        }
        if parsed.fragment().is_some() {
            return Err(RelayError::HasFragment);
        }

        let host = parsed.host_str().ok_or(RelayError::NoHost)?.to_lowercase();
        let network = Network::from_host(&host);

        let scheme = parsed.scheme().to_lowercase();
        let expected = network.expected_scheme();
        if scheme != expected {
            return Err(RelayError::WrongScheme {
                scheme,
                network,
                expected,
            });
        }

        if network == Network::Clearnet {
            if let Ok(ip) = host.parse::<IpAddr>() {
                if is_private_or_loopback(&ip) {
                    return Err(RelayError::PrivateAddress(host.clone()));
                }
            } else if is_local_hostname(&host) {
                return Err(RelayError::PrivateAddress(host.clone()));
            }
        }

        let canonical = canonicalize(&scheme, &host, parsed.port(), parsed.path());

        Ok(Self {
            url: canonical,
            network,
            discovered_at,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn discovered_at(&self) -> i64 {
        self.discovered_at
    }
}

fn canonicalize(scheme: &str, host: &str, port: Option<u16>, path: &str) -> String {
    let path = if path == "/" { "" } else { path };
    match port {
        Some(p) => format!("{scheme}://{host}:{p}{path}"),
        None => format!("{scheme}://{host}{path}"),
    }
}

fn is_private_or_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || is_unique_local_v6(v6),
    }
}

fn is_unique_local_v6(v6: &std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

fn is_local_hostname(host: &str) -> bool {
    host == "localhost" || host.ends_with(".local")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_clearnet_wss_without_port() {
        let r = Relay::new("wss://relay.example.com", 1_700_000_000).unwrap();
        assert_eq!(r.url(), "wss://relay.example.com");
        assert_eq!(r.network(), Network::Clearnet);
    }

    #[test]
    fn rejects_clearnet_ws_scheme() {
        assert!(Relay::new("ws://relay.example.com", 0).is_err());
    }

    #[test]
    fn classifies_onion_as_tor_and_requires_ws() {
        let r = Relay::new("ws://abcdefghijklmnop.onion", 0).unwrap();
        assert_eq!(r.network(), Network::Tor);
    }

    #[test]
    fn rejects_private_ip() {
        assert!(Relay::new("wss://127.0.0.1", 0).is_err());
        assert!(Relay::new("wss://10.0.0.5", 0).is_err());
        assert!(Relay::new("wss://192.168.1.1", 0).is_err());
    }

    #[test]
    fn rejects_query_and_fragment() {
        assert!(Relay::new("wss://relay.example.com?x=1", 0).is_err());
        assert!(Relay::new("wss://relay.example.com#frag", 0).is_err());
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let r1 = Relay::new("WSS://Relay.Example.com/", 0).unwrap();
        let r2 = Relay::new(r1.url(), 0).unwrap();
        assert_eq!(r1.url(), r2.url());
    }
}
