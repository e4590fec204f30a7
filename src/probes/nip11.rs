//! NIP-11 relay information document probe (§4.8).

use super::ProbeOutcome;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Declared string fields of a NIP-11 relay information document (§9:
/// "declarative field parsing"). A field absent or of the wrong JSON type is
/// silently dropped rather than failing the whole document.
const STRING_FIELDS: &[&str] = &[
    "name",
    "description",
    "pubkey",
    "contact",
    "software",
    "version",
    "icon",
    "privacy_policy",
    "terms_of_service",
    "payments_url",
];

/// Fetches `url` with `Accept: application/nostr+json` and returns the
/// parsed document as `data` on success. Never raises: connection refusal,
/// non-200 status, and invalid JSON are all reported as `success: false`.
pub async fn probe(client: &Client, url: &str, timeout: Duration) -> ProbeOutcome {
    let mut logs = vec![format!("requesting {url}")];

    let http_url = match to_http_url(url) {
        Some(u) => u,
        None => return ProbeOutcome::failed("could not derive http(s) url from relay url", logs),
    };
    logs.push(format!("resolved to {http_url}"));

    let response = client
        .get(&http_url)
        .header("Accept", "application/nostr+json")
        .timeout(timeout)
        .send()
        .await;

    let response = match response {
        Ok(r) => r,
        Err(e) => return ProbeOutcome::failed(format!("request failed: {e}"), logs),
    };

    let status = response.status();
    logs.push(format!("received status {status}"));
    if !status.is_success() {
        return ProbeOutcome::failed(format!("non-success status: {status}"), logs);
    }

    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => return ProbeOutcome::failed(format!("failed reading body: {e}"), logs),
    };

    match serde_json::from_str(&body) {
        Ok(data) => ProbeOutcome::ok(parse_document(data), logs),
        Err(e) => ProbeOutcome::failed(format!("invalid json: {e}"), logs),
    }
}

/// Folds the raw document through a per-field parser table: each field is
/// converted and validated independently, and a malformed value for one
/// field is dropped without discarding its siblings (§4.8, §9).
fn parse_document(raw: Value) -> Value {
    let mut out = Map::new();

    for field in STRING_FIELDS {
        if let Some(v) = raw.get(*field).and_then(Value::as_str) {
            out.insert((*field).to_string(), json!(v));
        }
    }

    if let Some(nips) = raw.get("supported_nips").and_then(Value::as_array) {
        let mut values: Vec<u64> = nips.iter().filter_map(Value::as_u64).collect();
        values.sort_unstable();
        values.dedup();
        out.insert("supported_nips".to_string(), json!(values));
    }

    if let Some(tags) = raw.get("tags").and_then(Value::as_array) {
        let values: Vec<&str> = tags.iter().filter_map(Value::as_str).collect();
        if !values.is_empty() {
            out.insert("tags".to_string(), json!(values));
        }
    }

    if let Some(countries) = raw.get("relay_countries").and_then(Value::as_array) {
        let values: Vec<&str> = countries.iter().filter_map(Value::as_str).collect();
        if !values.is_empty() {
            out.insert("relay_countries".to_string(), json!(values));
        }
    }

    if let Some(languages) = raw.get("language_tags").and_then(Value::as_array) {
        let values: Vec<&str> = languages.iter().filter_map(Value::as_str).collect();
        if !values.is_empty() {
            out.insert("language_tags".to_string(), json!(values));
        }
    }

    if let Some(limitation) = raw.get("limitation").and_then(Value::as_object) {
        out.insert("limitation".to_string(), Value::Object(limitation.clone()));
    }

    if let Some(fees) = raw.get("fees").and_then(Value::as_object) {
        out.insert("fees".to_string(), Value::Object(fees.clone()));
    }

    Value::Object(out)
}

/// `wss://host[:port][/path]` -> `https://host[:port][/path]`, `ws://` ->
/// `http://`. NIP-11 is fetched over plain HTTP(S), never the WebSocket
/// upgrade.
fn to_http_url(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("wss://") {
        Some(format!("https://{rest}"))
    } else if let Some(rest) = url.strip_prefix("ws://") {
        Some(format!("http://{rest}"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_wss_to_https() {
        assert_eq!(
            to_http_url("wss://relay.example.com/path"),
            Some("https://relay.example.com/path".to_string())
        );
    }

    #[test]
    fn converts_ws_to_http() {
        assert_eq!(
            to_http_url("ws://abc.onion"),
            Some("http://abc.onion".to_string())
        );
    }

    #[test]
    fn supported_nips_are_sorted_and_deduped() {
        let raw = serde_json::json!({
            "name": "test relay",
            "supported_nips": [11, 1, 2, 1, 42, "not a number"],
        });
        let parsed = parse_document(raw);
        assert_eq!(parsed["supported_nips"], serde_json::json!([1, 2, 11, 42]));
    }

    #[test]
    fn unknown_and_malformed_fields_are_dropped_independently() {
        let raw = serde_json::json!({
            "name": "test relay",
            "description": 42,
            "some_unrecognized_field": "ignored",
        });
        let parsed = parse_document(raw);
        assert_eq!(parsed["name"], "test relay");
        assert!(parsed.get("description").is_none());
        assert!(parsed.get("some_unrecognized_field").is_none());
    }

    #[tokio::test]
    async fn reports_failure_on_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .with_status(503)
            .create_async()
            .await;
        let http_addr = server.url();
        let ws_addr = http_addr.replacen("http://", "ws://", 1);

        let client = Client::new();
        let outcome = probe(&client, &ws_addr, Duration::from_secs(5)).await;
        mock.assert_async().await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn reports_success_and_parses_document() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"name":"test relay"}"#)
            .create_async()
            .await;
        let http_addr = server.url();
        let ws_addr = http_addr.replacen("http://", "ws://", 1);

        let client = Client::new();
        let outcome = probe(&client, &ws_addr, Duration::from_secs(5)).await;
        mock.assert_async().await;
        assert!(outcome.success);
        assert_eq!(outcome.data["name"], "test relay");
    }
}
