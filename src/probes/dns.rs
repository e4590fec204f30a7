//! NIP-66 DNS resolution probe (§4.8): clearnet only.
//!
//! A, AAAA, CNAME, PTR, and NS (for the registered domain, via the public
//! suffix list) are each resolved independently — a failure or absence of
//! one record type never discards data already gathered from another.

use super::ProbeOutcome;
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use trust_dns_resolver::proto::rr::RecordType;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// Resolves `host`'s A/AAAA/CNAME/PTR/NS records.
pub async fn probe(host: &str, timeout: Duration) -> ProbeOutcome {
    let mut logs = vec![format!("resolving {host}")];
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

    let (v4, v6) = match tokio::time::timeout(timeout, resolver.lookup_ip(host)).await {
        Ok(Ok(lookup)) => {
            let mut v4 = Vec::new();
            let mut v6 = Vec::new();
            for ip in lookup.iter() {
                match ip {
                    IpAddr::V4(a) => v4.push(a.to_string()),
                    IpAddr::V6(a) => v6.push(a.to_string()),
                }
            }
            logs.push(format!("resolved {} A, {} AAAA", v4.len(), v6.len()));
            (v4, v6)
        }
        Ok(Err(e)) => {
            logs.push(format!("A/AAAA lookup failed: {e}"));
            (Vec::new(), Vec::new())
        }
        Err(_) => {
            logs.push("A/AAAA lookup timed out".to_string());
            (Vec::new(), Vec::new())
        }
    };

    let cname = match tokio::time::timeout(timeout, resolver.lookup(host, RecordType::CNAME)).await
    {
        Ok(Ok(lookup)) => {
            let names: Vec<String> = lookup
                .iter()
                .filter_map(|r| r.as_cname().map(|n| n.to_string()))
                .collect();
            logs.push(format!("resolved {} CNAME", names.len()));
            names
        }
        Ok(Err(e)) => {
            logs.push(format!("CNAME lookup failed: {e}"));
            Vec::new()
        }
        Err(_) => {
            logs.push("CNAME lookup timed out".to_string());
            Vec::new()
        }
    };

    let ptr = match v4.first().or_else(|| v6.first()).and_then(|s| s.parse::<IpAddr>().ok()) {
        Some(ip) => match tokio::time::timeout(timeout, resolver.reverse_lookup(ip)).await {
            Ok(Ok(lookup)) => {
                let names: Vec<String> = lookup.iter().map(|n| n.to_string()).collect();
                logs.push(format!("resolved {} PTR", names.len()));
                names
            }
            Ok(Err(e)) => {
                logs.push(format!("PTR lookup failed: {e}"));
                Vec::new()
            }
            Err(_) => {
                logs.push("PTR lookup timed out".to_string());
                Vec::new()
            }
        },
        None => {
            logs.push("no resolved address to reverse-lookup".to_string());
            Vec::new()
        }
    };

    let registered_domain = psl::domain_str(host).unwrap_or(host);
    let ns = match tokio::time::timeout(timeout, resolver.ns_lookup(registered_domain)).await {
        Ok(Ok(lookup)) => {
            let names: Vec<String> = lookup.iter().map(|n| n.to_string()).collect();
            logs.push(format!("resolved {} NS for {registered_domain}", names.len()));
            names
        }
        Ok(Err(e)) => {
            logs.push(format!("NS lookup for {registered_domain} failed: {e}"));
            Vec::new()
        }
        Err(_) => {
            logs.push(format!("NS lookup for {registered_domain} timed out"));
            Vec::new()
        }
    };

    if v4.is_empty() && v6.is_empty() {
        return ProbeOutcome::failed("no A/AAAA addresses returned", logs);
    }

    ProbeOutcome::ok(
        json!({
            "a": v4,
            "aaaa": v6,
            "cname": cname,
            "ptr": ptr,
            "ns": ns,
            "registered_domain": registered_domain,
        }),
        logs,
    )
}
