//! NIP-66 network (ASN) probe (§4.8): MaxMind GeoLite2-ASN lookup.

use super::ProbeOutcome;
use maxminddb::geoip2;
use maxminddb::Reader;
use serde_json::json;
use std::net::IpAddr;

/// Looks `ip` up in an already-opened GeoLite2-ASN database.
pub fn probe(reader: &Reader<Vec<u8>>, ip: IpAddr) -> ProbeOutcome {
    let logs = vec![format!("looking up ASN for {ip}")];

    let asn: geoip2::Asn = match reader.lookup(ip) {
        Ok(a) => a,
        Err(e) => return ProbeOutcome::failed(format!("lookup failed: {e}"), logs),
    };

    match asn.autonomous_system_number {
        Some(number) => ProbeOutcome::ok(
            json!({
                "asn": number,
                "organization": asn.autonomous_system_organization,
            }),
            logs,
        ),
        None => ProbeOutcome::failed("no ASN data for address", logs),
    }
}
