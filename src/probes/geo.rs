//! NIP-66 geolocation probe (§4.8): MaxMind GeoLite2-City lookup + geohash.

use super::ProbeOutcome;
use maxminddb::geoip2;
use maxminddb::Reader;
use serde_json::json;
use std::net::IpAddr;

/// Looks `ip` up in an already-opened GeoLite2-City database (Monitor loads
/// and periodically refreshes one reader shared across probes; see
/// `services::monitor`).
pub fn probe(reader: &Reader<Vec<u8>>, ip: IpAddr) -> ProbeOutcome {
    let logs = vec![format!("looking up {ip}")];

    let city: geoip2::City = match reader.lookup(ip) {
        Ok(c) => c,
        Err(e) => return ProbeOutcome::failed(format!("lookup failed: {e}"), logs),
    };

    let lat = city.location.as_ref().and_then(|l| l.latitude);
    let lon = city.location.as_ref().and_then(|l| l.longitude);
    let country = city
        .country
        .as_ref()
        .and_then(|c| c.iso_code)
        .map(str::to_string);
    let city_name = city
        .city
        .as_ref()
        .and_then(|c| c.names.as_ref())
        .and_then(|n| n.get("en"))
        .map(|s| s.to_string());

    let geohash_str = match (lat, lon) {
        (Some(lat), Some(lon)) => geohash::encode(geohash::Coord { x: lon, y: lat }, 9).ok(),
        _ => None,
    };

    if country.is_none() && lat.is_none() {
        return ProbeOutcome::failed("no geolocation data for address", logs);
    }

    ProbeOutcome::ok(
        json!({
            "country": country,
            "city": city_name,
            "latitude": lat,
            "longitude": lon,
            "geohash": geohash_str,
        }),
        logs,
    )
}
