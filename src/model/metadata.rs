//! Content-addressed health-check metadata (§3, §4.9).

use crate::model::canonical_json::canonical_json;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("id mismatch on reconstruction: expected {expected}, computed {computed}")]
    IdMismatch { expected: String, computed: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataType {
    Nip11Info,
    Nip66Rtt,
    Nip66Ssl,
    Nip66Geo,
    Nip66Net,
    Nip66Dns,
    Nip66Http,
}

impl MetadataType {
    pub fn as_str(self) -> &'static str {
        match self {
            MetadataType::Nip11Info => "nip11_info",
            MetadataType::Nip66Rtt => "nip66_rtt",
            MetadataType::Nip66Ssl => "nip66_ssl",
            MetadataType::Nip66Geo => "nip66_geo",
            MetadataType::Nip66Net => "nip66_net",
            MetadataType::Nip66Dns => "nip66_dns",
            MetadataType::Nip66Http => "nip66_http",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "nip11_info" => Some(MetadataType::Nip11Info),
            "nip66_rtt" => Some(MetadataType::Nip66Rtt),
            "nip66_ssl" => Some(MetadataType::Nip66Ssl),
            "nip66_geo" => Some(MetadataType::Nip66Geo),
            "nip66_net" => Some(MetadataType::Nip66Net),
            "nip66_dns" => Some(MetadataType::Nip66Dns),
            "nip66_http" => Some(MetadataType::Nip66Http),
            _ => None,
        }
    }
}

/// A deep-frozen, content-addressed metadata payload. The id is derived at
/// construction time and re-derived on reconstruction from stored values as
/// an integrity check (§4.9, §8).
#[derive(Debug, Clone)]
pub struct Metadata {
    id: String,
    metadata_type: MetadataType,
    data: Value,
    canonical: String,
}

impl Metadata {
    pub fn new(metadata_type: MetadataType, data: Value) -> Self {
        let canonical = canonical_json(&data);
        let id = hex::encode(Sha256::digest(canonical.as_bytes()));
        Self {
            id,
            metadata_type,
            data,
            canonical,
        }
    }

    /// Reconstructs a `Metadata` from stored `(id, type, data)`, re-deriving
    /// the id as an integrity check (§8: round-trip invariant).
    pub fn from_db_params(
        id: String,
        metadata_type: MetadataType,
        data: Value,
    ) -> Result<Self, MetadataError> {
        let reconstructed = Self::new(metadata_type, data);
        if reconstructed.id != id {
            return Err(MetadataError::IdMismatch {
                expected: id,
                computed: reconstructed.id,
            });
        }
        Ok(reconstructed)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn metadata_type(&self) -> MetadataType {
        self.metadata_type
    }
    pub fn data(&self) -> &Value {
        &self.data
    }
    pub fn canonical_json(&self) -> &str {
        &self.canonical
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_is_sha256_of_canonical_json() {
        let m = Metadata::new(MetadataType::Nip11Info, json!({"name": "relay"}));
        let expected = hex::encode(Sha256::digest(
            canonical_json(&json!({"name": "relay"})).as_bytes(),
        ));
        assert_eq!(m.id(), expected);
    }

    #[test]
    fn identical_bytes_different_types_have_same_id_but_are_distinct_rows() {
        let data = json!({"a": 1});
        let a = Metadata::new(MetadataType::Nip11Info, data.clone());
        let b = Metadata::new(MetadataType::Nip66Rtt, data);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.metadata_type().as_str(), b.metadata_type().as_str());
    }

    #[test]
    fn round_trip_reconstruction_succeeds() {
        let m = Metadata::new(MetadataType::Nip66Dns, json!({"a": [1, 2]}));
        let round = Metadata::from_db_params(m.id().to_string(), m.metadata_type(), m.data().clone())
            .unwrap();
        assert_eq!(round.id(), m.id());
    }

    #[test]
    fn round_trip_rejects_tampered_id() {
        let err = Metadata::from_db_params(
            "deadbeef".to_string(),
            MetadataType::Nip66Dns,
            json!({"a": 1}),
        );
        assert!(err.is_err());
    }
}
