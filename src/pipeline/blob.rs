//! Keyed per-row maps and their JSON storage blobs
//!
//! Deviation, cross and percentile maps are stored as a JSON object in a
//! single text column. In memory they are a [`KeyedMap`] whose keys are a
//! closed set of typed keys. Every configured key is present; a missing
//! value is an explicit `None` that serializes as JSON `null`.

use log::{debug, warn};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{AshareError, Result};

/// A key that can appear in a stored blob
pub trait BlobKey: Ord + Copy + fmt::Debug {
    /// Storage name, e.g. `ma_5`
    fn encode(&self) -> String;

    /// Parse a storage name, `None` if the key is not known
    fn decode(key: &str) -> Option<Self>;
}

/// A value that can appear in a stored blob
pub trait BlobValue: Sized + Clone + PartialEq {
    fn to_json(&self) -> Value;
    fn from_json(value: &Value) -> Option<Self>;
}

impl BlobValue for f64 {
    fn to_json(&self) -> Value {
        serde_json::Number::from_f64(*self)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }

    fn from_json(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

/// Ordered map from typed key to a nullable value
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedMap<K: BlobKey, V: BlobValue> {
    entries: BTreeMap<K, Option<V>>,
}

impl<K: BlobKey, V: BlobValue> Default for KeyedMap<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: BlobKey, V: BlobValue> KeyedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key; `None` records an explicit null
    pub fn insert(&mut self, key: K, value: Option<V>) {
        self.entries.insert(key, value);
    }

    /// Value for a key, `None` when absent or null
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).and_then(|v| v.as_ref())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, Option<&V>)> {
        self.entries.iter().map(|(k, v)| (k, v.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode as a compact JSON object
    pub fn to_blob(&self) -> String {
        let object: Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, v)| {
                let value = v.as_ref().map(BlobValue::to_json).unwrap_or(Value::Null);
                (k.encode(), value)
            })
            .collect();
        Value::Object(object).to_string()
    }

    /// Decode a stored blob. A blob that is not a JSON object decodes as an
    /// empty map; unknown keys and ill-typed values are skipped.
    pub fn from_blob(blob: &str) -> Self {
        match Self::decode_with(blob, false) {
            Ok(map) => map,
            Err(e) => {
                warn!("{}, treating as empty", e);
                Self::default()
            }
        }
    }

    /// Decode a stored blob, failing on anything that is not a known key
    /// with a well-typed value
    pub fn decode_strict(blob: &str) -> Result<Self> {
        Self::decode_with(blob, true)
    }

    fn decode_with(blob: &str, strict: bool) -> Result<Self> {
        let value: Value = serde_json::from_str(blob).map_err(|e| {
            AshareError::MalformedReferenceData(format!("invalid blob '{}': {}", blob, e))
        })?;
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(AshareError::MalformedReferenceData(format!(
                    "blob is not an object: {}",
                    other
                )))
            }
        };

        let mut map = Self::default();
        for (name, raw) in &object {
            let Some(key) = K::decode(name) else {
                if strict {
                    return Err(AshareError::MalformedReferenceData(format!(
                        "unknown key '{}'",
                        name
                    )));
                }
                debug!("Skipping unknown blob key '{}'", name);
                continue;
            };

            if raw.is_null() {
                map.insert(key, None);
                continue;
            }
            match V::from_json(raw) {
                Some(v) => map.insert(key, Some(v)),
                None if strict => {
                    return Err(AshareError::MalformedReferenceData(format!(
                        "bad value for '{}': {}",
                        name, raw
                    )))
                }
                None => debug!("Skipping ill-typed value for '{}': {}", name, raw),
            }
        }
        Ok(map)
    }
}

impl<K: BlobKey, V: BlobValue> FromIterator<(K, Option<V>)> for KeyedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Key of a moving-average column, `ma_<period>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaKey(pub usize);

impl BlobKey for MaKey {
    fn encode(&self) -> String {
        format!("ma_{}", self.0)
    }

    fn decode(key: &str) -> Option<Self> {
        parse_period(key.strip_prefix("ma_")?).map(MaKey)
    }
}

impl fmt::Display for MaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ma_{}", self.0)
    }
}

/// Key of a weighted moving-average column, `wma_<period>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WmaKey(pub usize);

impl BlobKey for WmaKey {
    fn encode(&self) -> String {
        format!("wma_{}", self.0)
    }

    fn decode(key: &str) -> Option<Self> {
        parse_period(key.strip_prefix("wma_")?).map(WmaKey)
    }
}

pub(crate) fn parse_period(s: &str) -> Option<usize> {
    // reject "+5", "05" and friends so encode/decode stay a bijection
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) || (s.len() > 1 && s.starts_with('0'))
    {
        return None;
    }
    s.parse().ok().filter(|&p| p > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    type Map = KeyedMap<MaKey, f64>;

    #[test]
    fn test_blob_keeps_nulls() {
        let map: Map = [(MaKey(5), Some(0.0123)), (MaKey(10), None)]
            .into_iter()
            .collect();
        let blob = map.to_blob();
        assert_eq!(blob, r#"{"ma_10":null,"ma_5":0.0123}"#);
        assert_eq!(Map::from_blob(&blob), map);
    }

    #[test]
    fn test_malformed_blob_is_empty() {
        assert!(Map::from_blob("not json").is_empty());
        assert!(Map::from_blob("[1, 2]").is_empty());
        assert!(Map::decode_strict("not json").is_err());
    }

    #[test]
    fn test_unknown_keys_skipped() {
        let map = Map::from_blob(r#"{"ma_5": 0.1, "ema_12": 3.0, "ma_x": 1.0, "ma_10": "bad"}"#);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&MaKey(5)), Some(&0.1));

        assert!(Map::decode_strict(r#"{"ema_12": 3.0}"#).is_err());
        assert!(Map::decode_strict(r#"{"ma_10": "bad"}"#).is_err());
    }

    #[test]
    fn test_parse_period() {
        assert_eq!(parse_period("20"), Some(20));
        assert_eq!(parse_period("0"), None);
        assert_eq!(parse_period("05"), None);
        assert_eq!(parse_period("+5"), None);
        assert_eq!(parse_period(""), None);
    }
}
