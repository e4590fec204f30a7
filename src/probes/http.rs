//! NIP-66 plain-HTTP reachability probe (§4.8): records whether a relay's
//! host answers ordinary HTTP requests and what it serves when it does —
//! distinct from the NIP-11 probe, which specifically requests the Nostr
//! relay info document.

use super::ProbeOutcome;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

pub async fn probe(client: &Client, url: &str, timeout: Duration) -> ProbeOutcome {
    let mut logs = Vec::new();
    let Some(http_url) = to_http_url(url) else {
        return ProbeOutcome::failed("could not derive http(s) url from relay url", logs);
    };
    logs.push(format!("requesting {http_url}"));

    let response = client.get(&http_url).timeout(timeout).send().await;
    let response = match response {
        Ok(r) => r,
        Err(e) => return ProbeOutcome::failed(format!("request failed: {e}"), logs),
    };

    let status = response.status().as_u16();
    let server_header = response
        .headers()
        .get("server")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    logs.push(format!("received status {status}"));

    ProbeOutcome::ok(json!({ "status": status, "server": server_header }), logs)
}

fn to_http_url(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("wss://") {
        Some(format!("https://{rest}"))
    } else if let Some(rest) = url.strip_prefix("ws://") {
        Some(format!("http://{rest}"))
    } else {
        None
    }
}
