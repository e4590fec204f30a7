//! Monitor (§4.6): assesses every validated relay due for a check and
//! publishes the findings as signed NIP-66 events.

use crate::config::MonitorConfig;
use crate::db::{Database, DatabaseError, RelayMetadataRecord};
use crate::lifecycle::Service;
use crate::model::{Metadata, MetadataType, Network, Relay};
use crate::probes::{self, ProbeOutcome};
use crate::services::NetworkSemaphores;
use crate::ws::ProxyConfig;
use async_trait::async_trait;
use futures::future::join_all;
use maxminddb::Reader;
use nostr::{EventBuilder, Keys, Kind, Tag};
use reqwest::Client;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;

const SERVICE_NAME: &str = "monitor";

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("signing key is required when publish is enabled")]
    MissingKeys,
    #[error("nostr event builder error: {0}")]
    EventBuilder(#[from] nostr::event::builder::Error),
}

/// The seven possible metadata rows produced by one relay's check, mirroring
/// the `CheckResult` tuple of §4.6 step 3. Each field is `None` when its
/// probe didn't produce meaningful data.
#[derive(Default)]
struct CheckResult {
    nip11: Option<ProbeOutcome>,
    rtt: Option<ProbeOutcome>,
    ssl: Option<ProbeOutcome>,
    geo: Option<ProbeOutcome>,
    net: Option<ProbeOutcome>,
    dns: Option<ProbeOutcome>,
    http: Option<ProbeOutcome>,
}

/// Loads and periodically refreshes MaxMind City/ASN databases off the
/// async event loop (§4.6 "GeoIP database management").
pub struct GeoIpManager {
    dir: PathBuf,
    max_age: Duration,
    city_url: Option<String>,
    asn_url: Option<String>,
    city: RwLock<Option<Arc<Reader<Vec<u8>>>>>,
    asn: RwLock<Option<Arc<Reader<Vec<u8>>>>>,
}

impl GeoIpManager {
    pub fn new(cfg: &MonitorConfig) -> Self {
        Self {
            dir: PathBuf::from(&cfg.geoip_dir),
            max_age: Duration::from_secs(cfg.geoip_max_age_days as u64 * 86_400),
            city_url: cfg.geoip_city_url.clone(),
            asn_url: cfg.geoip_asn_url.clone(),
            city: RwLock::new(None),
            asn: RwLock::new(None),
        }
    }

    pub async fn refresh(&self) {
        self.refresh_one("GeoLite2-City.mmdb", &self.city_url, &self.city).await;
        self.refresh_one("GeoLite2-ASN.mmdb", &self.asn_url, &self.asn).await;
    }

    async fn refresh_one(
        &self,
        filename: &str,
        url: &Option<String>,
        slot: &RwLock<Option<Arc<Reader<Vec<u8>>>>>,
    ) {
        let path = self.dir.join(filename);
        let needs_download = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => modified.elapsed().map(|age| age > self.max_age).unwrap_or(true),
            Err(_) => true,
        };

        if needs_download {
            if let Some(url) = url {
                if let Err(e) = download(url, &path).await {
                    tracing::warn!(target: "bigbrotr::monitor", %filename, error = %e, "geoip download failed");
                }
            }
        }

        if !path.exists() {
            return;
        }
        let path_owned = path.clone();
        let loaded = tokio::task::spawn_blocking(move || Reader::open_readfile(path_owned)).await;
        match loaded {
            Ok(Ok(reader)) => {
                *slot.write().await = Some(Arc::new(reader));
            }
            Ok(Err(e)) => tracing::warn!(target: "bigbrotr::monitor", %filename, error = %e, "geoip load failed"),
            Err(e) => tracing::warn!(target: "bigbrotr::monitor", %filename, error = %e, "geoip load task panicked"),
        }
    }

    async fn city(&self) -> Option<Arc<Reader<Vec<u8>>>> {
        self.city.read().await.clone()
    }

    async fn asn(&self) -> Option<Arc<Reader<Vec<u8>>>> {
        self.asn.read().await.clone()
    }
}

async fn download(url: &str, dest: &Path) -> Result<(), String> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| e.to_string())?;
    }
    let bytes = reqwest::get(url)
        .await
        .map_err(|e| e.to_string())?
        .bytes()
        .await
        .map_err(|e| e.to_string())?;
    tokio::fs::write(dest, &bytes).await.map_err(|e| e.to_string())
}

pub struct Monitor {
    db: Database,
    config: MonitorConfig,
    semaphores: NetworkSemaphores,
    proxy: Option<ProxyConfig>,
    http: Client,
    geoip: Arc<GeoIpManager>,
    keys: Option<Keys>,
}

impl Monitor {
    pub fn new(
        db: Database,
        config: MonitorConfig,
        proxy: Option<ProxyConfig>,
        geoip: Arc<GeoIpManager>,
        keys: Option<Keys>,
    ) -> Self {
        let semaphores = NetworkSemaphores::new(&config.network_concurrency);
        Self {
            db,
            config,
            semaphores,
            proxy,
            http: Client::new(),
            geoip,
            keys,
        }
    }

    async fn check_one(&self, relay: Relay) -> (Relay, CheckResult) {
        let sem = self.semaphores.for_network(relay.network());
        let _permit = sem.acquire().await.expect("semaphore is never closed");
        let timeout = Duration::from_secs(30);

        let nip11 = probes::nip11::probe(&self.http, relay.url(), timeout).await;
        let http = probes::http::probe(&self.http, relay.url(), timeout).await;
        let rtt = probes::rtt::probe(
            relay.url(),
            relay.network(),
            self.proxy.as_ref(),
            self.config.allow_insecure_tls_fallback,
            timeout,
            self.keys.as_ref(),
        )
        .await;

        let (ssl, dns, geo, net) = if relay.network() == Network::Clearnet {
            let host = url::Url::parse(relay.url())
                .ok()
                .and_then(|u| u.host_str().map(str::to_string));

            let ssl = probes::ssl::probe(relay.url(), timeout).await;
            let dns = match &host {
                Some(h) => probes::dns::probe(h, timeout).await,
                None => ProbeOutcome::failed("no host", vec![]),
            };

            // Geo/Net need an address, not a hostname: prefer the A record
            // the DNS probe already resolved, falling back to AAAA, rather
            // than re-resolving or only handling IP-literal relay hosts.
            let ip = host
                .as_deref()
                .and_then(|h| h.parse::<IpAddr>().ok())
                .or_else(|| resolved_ip(&dns));
            let geo = match (ip, self.geoip.city().await) {
                (Some(ip), Some(reader)) => probes::geo::probe(&reader, ip),
                (None, _) => ProbeOutcome::failed("host did not resolve to an address", vec![]),
                (_, None) => ProbeOutcome::failed("geoip city database unavailable", vec![]),
            };
            let net = match (ip, self.geoip.asn().await) {
                (Some(ip), Some(reader)) => probes::net::probe(&reader, ip),
                (None, _) => ProbeOutcome::failed("host did not resolve to an address", vec![]),
                (_, None) => ProbeOutcome::failed("geoip asn database unavailable", vec![]),
            };
            (ssl, dns, geo, net)
        } else {
            let skipped = || ProbeOutcome::failed("not applicable on overlay networks", vec![]);
            (skipped(), skipped(), skipped(), skipped())
        };

        (
            relay,
            CheckResult {
                nip11: some_if_ok(nip11),
                rtt: some_if_ok(rtt),
                ssl: some_if_ok(ssl),
                geo: some_if_ok(geo),
                net: some_if_ok(net),
                dns: some_if_ok(dns),
                http: some_if_ok(http),
            },
        )
    }

    fn build_records(&self, relay: &Relay, result: &CheckResult, now: i64) -> Vec<RelayMetadataRecord> {
        let entries: [(MetadataType, &Option<ProbeOutcome>); 7] = [
            (MetadataType::Nip11Info, &result.nip11),
            (MetadataType::Nip66Rtt, &result.rtt),
            (MetadataType::Nip66Ssl, &result.ssl),
            (MetadataType::Nip66Geo, &result.geo),
            (MetadataType::Nip66Net, &result.net),
            (MetadataType::Nip66Dns, &result.dns),
            (MetadataType::Nip66Http, &result.http),
        ];
        entries
            .into_iter()
            .filter_map(|(kind, outcome)| {
                outcome.as_ref().map(|o| RelayMetadataRecord {
                    relay: relay.clone(),
                    metadata: Metadata::new(kind, o.data.clone()),
                    generated_at: now,
                })
            })
            .collect()
    }

    /// Builds the kind-30166 addressable event for `relay` from its
    /// successful probe results, per the tag taxonomy in §4.6.
    fn build_relay_event(&self, relay: &Relay, result: &CheckResult, keys: &Keys) -> Result<nostr::Event, MonitorError> {
        let mut tags = vec![Tag::identifier(relay.url().to_string())];

        if let Some(rtt) = &result.rtt {
            push_int_tag(&mut tags, "rtt-open", &rtt.data, "open_ms");
            push_int_tag(&mut tags, "rtt-read", &rtt.data, "read_ms");
            push_int_tag(&mut tags, "rtt-write", &rtt.data, "write_ms");
        }
        if let Some(ssl) = &result.ssl {
            if ssl.data["valid"].as_bool() == Some(true) {
                tags.push(Tag::custom(nostr::TagKind::Custom("ssl".into()), ["true".to_string()]));
            }
            push_int_tag(&mut tags, "ssl-expires", &ssl.data, "not_after");
            if let Some(issuer) = ssl.data["issuer"].as_str() {
                tags.push(Tag::custom(nostr::TagKind::Custom("ssl-issuer".into()), [issuer.to_string()]));
            }
        }
        if let Some(net) = &result.net {
            push_int_tag(&mut tags, "net-asn", &net.data, "asn");
            if let Some(org) = net.data["organization"].as_str() {
                tags.push(Tag::custom(nostr::TagKind::Custom("net-asn-org".into()), [org.to_string()]));
            }
        }
        if let Some(dns) = &result.dns {
            if let Some(ip) = dns.data["a"].as_array().and_then(|a| a.first()).and_then(|v| v.as_str()) {
                tags.push(Tag::custom(nostr::TagKind::Custom("net-ip".into()), [ip.to_string()]));
            }
            if let Some(ip) = dns.data["aaaa"].as_array().and_then(|a| a.first()).and_then(|v| v.as_str()) {
                tags.push(Tag::custom(nostr::TagKind::Custom("net-ipv6".into()), [ip.to_string()]));
            }
        }
        if let Some(geo) = &result.geo {
            if let Some(gh) = geo.data["geohash"].as_str() {
                tags.push(Tag::custom(nostr::TagKind::Custom("g".into()), [gh.to_string()]));
            }
            if let Some(country) = geo.data["country"].as_str() {
                tags.push(Tag::custom(nostr::TagKind::Custom("geo-country".into()), [country.to_string()]));
            }
            if let Some(city) = geo.data["city"].as_str() {
                tags.push(Tag::custom(nostr::TagKind::Custom("geo-city".into()), [city.to_string()]));
            }
        }

        let event = EventBuilder::new(Kind::Custom(30166), "", tags)
            .to_event(keys)?;
        Ok(event)
    }

    /// Builds the kind-10166 monitor announcement: capabilities, supported
    /// networks, and check frequency (§4.6 step 5, §6).
    fn build_announcement_event(&self, keys: &Keys) -> Result<nostr::Event, MonitorError> {
        let mut tags = vec![Tag::custom(
            nostr::TagKind::Custom("frequency".into()),
            [self.config.service.interval_seconds.to_string()],
        )];
        for capability in ["nip11", "rtt", "ssl", "dns", "geo", "net", "http"] {
            tags.push(Tag::custom(
                nostr::TagKind::Custom("c".into()),
                [capability.to_string()],
            ));
        }
        for network in ["clearnet", "tor", "i2p", "loki"] {
            tags.push(Tag::custom(
                nostr::TagKind::Custom("n".into()),
                [network.to_string()],
            ));
        }
        Ok(EventBuilder::new(Kind::Custom(10166), "", tags).to_event(keys)?)
    }

    /// Builds the optional kind-0 profile event (§4.6 step 5, §6: "Kind 0:
    /// profile metadata (JSON in content)").
    fn build_profile_event(&self, keys: &Keys) -> Result<nostr::Event, MonitorError> {
        let content = serde_json::json!({
            "name": "bigbrotr-monitor",
            "about": "automated Nostr relay observatory monitor",
        })
        .to_string();
        Ok(EventBuilder::new(Kind::Custom(0), content, Vec::<Tag>::new()).to_event(keys)?)
    }

    /// Whether the last publication of `kind` is older than `interval_secs`,
    /// defaulting to "due" when no prior publication is recorded.
    async fn publication_due(&self, kind: u16, interval_secs: u64, now: i64) -> bool {
        match self
            .db
            .get_service_state(
                SERVICE_NAME,
                crate::model::StateType::Publication,
                &kind.to_string(),
            )
            .await
        {
            Ok(Some(state)) => now - state.payload.as_i64().unwrap_or(0) >= interval_secs as i64,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(target: "bigbrotr::monitor", error = %e, "failed reading publication state, assuming due");
                true
            }
        }
    }

    async fn maybe_announce(&self, keys: &Keys, now: i64) {
        if !self.publication_due(10166, self.config.announce_interval_secs, now).await {
            return;
        }
        match self.build_announcement_event(keys) {
            Ok(event) => {
                self.broadcast(event).await;
                self.record_publication(10166, now).await;
            }
            Err(e) => tracing::warn!(target: "bigbrotr::monitor", error = %e, "failed building kind-10166 announcement"),
        }
    }

    async fn maybe_publish_profile(&self, keys: &Keys, now: i64) {
        if !self.config.publish_profile {
            return;
        }
        if !self.publication_due(0, self.config.profile_interval_secs, now).await {
            return;
        }
        match self.build_profile_event(keys) {
            Ok(event) => {
                self.broadcast(event).await;
                self.record_publication(0, now).await;
            }
            Err(e) => tracing::warn!(target: "bigbrotr::monitor", error = %e, "failed building kind-0 profile"),
        }
    }
}

/// Extracts the first resolved address from a successful DNS probe outcome,
/// preferring IPv4 (§4.8 Geo/Net: "resolve host -> IP, prefer IPv4").
fn resolved_ip(dns: &ProbeOutcome) -> Option<IpAddr> {
    if !dns.success {
        return None;
    }
    dns.data["a"]
        .as_array()
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .or_else(|| {
            dns.data["aaaa"]
                .as_array()
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
        })
}

fn push_int_tag(tags: &mut Vec<Tag>, name: &str, data: &serde_json::Value, field: &str) {
    if let Some(n) = data[field].as_i64() {
        tags.push(Tag::custom(
            nostr::TagKind::Custom(name.into()),
            [n.to_string()],
        ));
    }
}

fn some_if_ok(outcome: ProbeOutcome) -> Option<ProbeOutcome> {
    if outcome.success {
        Some(outcome)
    } else {
        None
    }
}

#[async_trait]
impl Service for Monitor {
    type Error = MonitorError;

    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    async fn run_cycle(&self) -> Result<(), MonitorError> {
        self.geoip.refresh().await;

        let cutoff = now_unix() - self.config.service.interval_seconds as i64;
        let due = self
            .db
            .relays_due_for_check(MetadataType::Nip66Rtt, cutoff, self.config.chunk_size)
            .await?;
        if due.is_empty() {
            return Ok(());
        }

        let checks = join_all(due.into_iter().map(|r| self.check_one(r))).await;

        let now = now_unix();
        let mut records = Vec::new();
        for (relay, result) in &checks {
            records.extend(self.build_records(relay, result, now));
        }
        if !records.is_empty() {
            self.db.insert_relay_metadata_cascade(&records).await?;
        }

        if !self.config.publication_relays.is_empty() {
            let keys = self.keys.as_ref().ok_or(MonitorError::MissingKeys)?;
            for (relay, result) in &checks {
                match self.build_relay_event(relay, result, keys) {
                    Ok(event) => self.broadcast(event).await,
                    Err(e) => tracing::warn!(
                        target: "bigbrotr::monitor",
                        relay = relay.url(), error = %e, "failed building kind-30166 event"
                    ),
                }
            }
            self.record_publication(Kind::Custom(30166).as_u16(), now).await;

            self.maybe_announce(keys, now).await;
            self.maybe_publish_profile(keys, now).await;
        }

        Ok(())
    }
}

impl Monitor {
    /// Publishes `event` to every configured publication relay, each over
    /// its own short-lived connection (§4.6 step 5).
    async fn broadcast(&self, event: nostr::Event) {
        for url in &self.config.publication_relays {
            let Ok(relay) = Relay::new(url, 0) else { continue };
            let proxy = self.proxy.as_ref();
            let msg = nostr::message::ClientMessage::event(event.clone());
            let dial = crate::ws::dial(
                relay.url(),
                relay.network(),
                proxy,
                self.config.allow_insecure_tls_fallback,
                Duration::from_secs(10),
            )
            .await;
            match dial {
                Ok(mut socket) => {
                    use futures::SinkExt;
                    if let Err(e) = socket
                        .send(tokio_tungstenite::tungstenite::Message::Text(msg.as_json()))
                        .await
                    {
                        tracing::warn!(target: "bigbrotr::monitor", url, error = %e, "publish failed");
                    }
                    let _ = socket.close(None).await;
                }
                Err(e) => tracing::warn!(target: "bigbrotr::monitor", url, error = %e, "publish dial failed"),
            }
        }
    }

    async fn record_publication(&self, kind: u16, now: i64) {
        let state = crate::model::ServiceState::new(
            SERVICE_NAME,
            crate::model::StateType::Publication,
            kind.to_string(),
            serde_json::json!(now),
            now,
        );
        if let Err(e) = self
            .db
            .upsert_service_state(std::slice::from_ref(&state))
            .await
        {
            tracing::warn!(target: "bigbrotr::monitor", error = %e, "failed recording publication");
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
