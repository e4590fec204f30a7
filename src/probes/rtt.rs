//! NIP-66 round-trip-time probe (§4.8): open, read, write phases.
//!
//! Each phase measures milliseconds elapsed and is independent of the
//! others succeeding — a relay that accepts connections but rejects writes
//! still gets an `open`/`read` measurement, with `write: null` (§4.8 cascading
//! failure: a later phase's failure never discards an earlier phase's data).

use crate::model::Network;
use crate::ws::{self, ProxyConfig};
use futures::{SinkExt, StreamExt};
use nostr::message::{ClientMessage, RelayMessage};
use nostr::{EventBuilder, Filter, Keys, Kind};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;

use super::ProbeOutcome;

/// Measures connect+handshake latency, then (if that succeeds) subscribes
/// with an empty filter to measure read latency, then (if a signing key is
/// given) publishes an ephemeral event and waits for its own echo to
/// measure write latency.
pub async fn probe(
    url: &str,
    network: Network,
    proxy: Option<&ProxyConfig>,
    allow_insecure_tls: bool,
    timeout: Duration,
    keys: Option<&Keys>,
) -> ProbeOutcome {
    let mut logs = vec![format!("opening connection to {url}")];

    let open_start = Instant::now();
    let socket = ws::dial(url, network, proxy, allow_insecure_tls, timeout).await;
    let mut socket = match socket {
        Ok(s) => s,
        Err(e) => return ProbeOutcome::failed(format!("open failed: {e}"), logs),
    };
    let open_ms = open_start.elapsed().as_millis() as u64;
    logs.push(format!("open phase: {open_ms}ms"));

    let mut data = json!({ "open_ms": open_ms, "read_ms": null, "write_ms": null });

    let read_ms = match read_phase(&mut socket, timeout, &mut logs).await {
        Ok(ms) => ms,
        Err(e) => {
            logs.push(format!("read phase failed: {e}"));
            let _ = socket.close(None).await;
            return ProbeOutcome::ok(data, logs);
        }
    };
    data["read_ms"] = json!(read_ms);
    logs.push(format!("read phase: {read_ms}ms"));

    if let Some(keys) = keys {
        match write_phase(&mut socket, keys, timeout, &mut logs).await {
            Ok(ms) => {
                data["write_ms"] = json!(ms);
                logs.push(format!("write phase: {ms}ms"));
            }
            Err(e) => logs.push(format!("write phase failed: {e}")),
        }
    }

    let _ = socket.close(None).await;
    ProbeOutcome::ok(data, logs)
}

async fn read_phase(
    socket: &mut ws::Socket,
    timeout: Duration,
    logs: &mut Vec<String>,
) -> Result<u64, String> {
    let sub_id = nostr::SubscriptionId::generate();
    let filter = Filter::new().limit(0);
    let req = ClientMessage::req(sub_id.clone(), vec![filter]);
    logs.push("sending REQ".to_string());

    let start = Instant::now();
    socket
        .send(Message::Text(req.as_json()))
        .await
        .map_err(|e| e.to_string())?;

    tokio::time::timeout(timeout, wait_for_eose(socket, &sub_id))
        .await
        .map_err(|_| "timed out waiting for EOSE".to_string())??;

    let elapsed = start.elapsed().as_millis() as u64;
    let close = ClientMessage::close(sub_id);
    let _ = socket.send(Message::Text(close.as_json())).await;
    Ok(elapsed)
}

async fn wait_for_eose(socket: &mut ws::Socket, sub_id: &nostr::SubscriptionId) -> Result<(), String> {
    loop {
        let msg = socket
            .next()
            .await
            .ok_or_else(|| "connection closed".to_string())?
            .map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        if let Ok(RelayMessage::EndOfStoredEvents(id)) = RelayMessage::from_json(&text) {
            if &id == sub_id {
                return Ok(());
            }
        }
    }
}

/// Publishes a probe event, then verifies the relay actually stored it by
/// subscribing with an id-filter and waiting for the event to echo back
/// (binding decision: see `DESIGN.md` Open Question 1). Non-arrival by
/// `timeout` is reported as `"echo timeout"`, not a protocol error.
async fn write_phase(
    socket: &mut ws::Socket,
    keys: &Keys,
    timeout: Duration,
    logs: &mut Vec<String>,
) -> Result<u64, String> {
    let event = EventBuilder::new(Kind::Custom(22456), "bigbrotr rtt probe", Vec::<nostr::Tag>::new())
        .to_event(keys)
        .map_err(|e| e.to_string())?;
    logs.push(format!("publishing probe event {}", event.id));

    let sub_id = nostr::SubscriptionId::generate();
    let filter = Filter::new().id(event.id);
    let req = ClientMessage::req(sub_id.clone(), vec![filter]);

    let start = Instant::now();
    let msg = ClientMessage::event(event.clone());
    socket
        .send(Message::Text(msg.as_json()))
        .await
        .map_err(|e| e.to_string())?;
    socket
        .send(Message::Text(req.as_json()))
        .await
        .map_err(|e| e.to_string())?;

    let result = tokio::time::timeout(timeout, wait_for_echo(socket, &sub_id, &event.id)).await;
    let elapsed = start.elapsed().as_millis() as u64;
    let close = ClientMessage::close(sub_id);
    let _ = socket.send(Message::Text(close.as_json())).await;

    match result {
        Ok(Ok(())) => Ok(elapsed),
        Ok(Err(e)) => Err(e),
        Err(_) => Err("echo timeout".to_string()),
    }
}

async fn wait_for_echo(
    socket: &mut ws::Socket,
    sub_id: &nostr::SubscriptionId,
    event_id: &nostr::EventId,
) -> Result<(), String> {
    loop {
        let msg = socket
            .next()
            .await
            .ok_or_else(|| "connection closed".to_string())?
            .map_err(|e| e.to_string())?;
        let Message::Text(text) = msg else { continue };
        if let Ok(RelayMessage::Event { subscription_id, event }) = RelayMessage::from_json(&text) {
            if &subscription_id == sub_id && event.id == *event_id {
                return Ok(());
            }
        }
    }
}
