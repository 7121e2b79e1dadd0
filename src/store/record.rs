//! Persisted shape of one encrypted cache entry.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One cache entry as written to the `Cache` table.
///
/// Immutable once written; updating a key replaces the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub key: String,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    /// Server modification time, or local write time for ad-hoc entries.
    pub version: i64,
    /// Milliseconds since the Unix epoch.
    pub cached_at: i64,
}

impl CacheRecord {
    /// Bytes this record counts against the store budget.
    pub fn size(&self) -> u64 {
        (self.ciphertext.len() + self.iv.len()) as u64
    }
}

mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_binary_fields_as_base64() {
        let record = CacheRecord {
            key: "profile:abc".to_string(),
            ciphertext: vec![1, 2, 3],
            iv: vec![0; 12],
            version: 42,
            cached_at: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ciphertext"], "AQID");
        assert_eq!(json["cachedAt"], 1_700_000_000_000i64);

        let back: CacheRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.size(), 15);
    }

    #[test]
    fn rejects_invalid_base64() {
        let json = r#"{"key":"k","ciphertext":"!!","iv":"","version":1,"cachedAt":1}"#;
        assert!(serde_json::from_str::<CacheRecord>(json).is_err());
    }
}
