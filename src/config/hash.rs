//! Configuration normalization and hashing for change detection.
//!
//! Resource configurations are loosely typed key-value payloads. Before two
//! configurations are compared, both are brought into a canonical form so that
//! formatting differences (`"3"` vs `3`, `"True"` vs `true`, surrounding
//! whitespace, key order) never produce spurious updates.
//!
//! The normalization rule:
//!
//! - object keys are trimmed and sorted, members whose value is `null` are dropped
//! - strings are trimmed
//! - strings that spell an integer without leading zeros become integers
//! - `"true"` and `"false"` (in any case) become booleans
//! - floats with an integral value become integers
//! - array order is preserved and elements are normalized recursively
//!
//! Decimal strings such as `"1.20"` are kept as strings, because version
//! numbers and similar identifiers are commonly written that way.

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns the canonical form of a configuration value.
    #[must_use]
    pub fn normalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut entries: Vec<(String, Value)> = map
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.trim().to_string(), Self::normalize(v)))
                    .collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                let mut normalized = Map::new();
                for (key, value) in entries {
                    normalized.insert(key, value);
                }
                Value::Object(normalized)
            }
            Value::Array(items) => Value::Array(items.iter().map(Self::normalize).collect()),
            Value::String(s) => Self::normalize_str(s),
            Value::Number(n) => Self::normalize_number(n),
            Value::Bool(_) | Value::Null => value.clone(),
        }
    }

    fn normalize_str(raw: &str) -> Value {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return Value::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Value::Bool(false);
        }
        if Self::is_canonical_integer(trimmed) {
            if let Ok(n) = trimmed.parse::<i64>() {
                return Value::Number(n.into());
            }
            if let Ok(n) = trimmed.parse::<u64>() {
                return Value::Number(n.into());
            }
        }
        Value::String(trimmed.to_string())
    }

    /// An optional minus sign followed by digits, with no leading zero unless
    /// the number is zero itself.
    fn is_canonical_integer(s: &str) -> bool {
        let digits = s.strip_prefix('-').unwrap_or(s);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return false;
        }
        !(s.starts_with('-') && digits == "0")
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn normalize_number(n: &Number) -> Value {
        if n.is_i64() || n.is_u64() {
            return Value::Number(n.clone());
        }
        if let Some(f) = n.as_f64()
            && f.is_finite()
            && f.fract() == 0.0
            && f.abs() < 9.0e15
        {
            return Value::Number((f as i64).into());
        }
        Value::Number(n.clone())
    }

    /// Returns true when two configurations are equal after normalization.
    #[must_use]
    pub fn equivalent(a: &Value, b: &Value) -> bool {
        Self::normalize(a) == Self::normalize(b)
    }

    /// Computes the SHA-256 hash of the canonical JSON of a normalized value.
    #[must_use]
    pub fn hash_value(&self, value: &Value) -> String {
        let canonical = Self::normalize(value);
        // serde_json maps are ordered by key unless preserve_order is enabled,
        // and normalize() inserts keys in sorted order either way.
        let encoded = serde_json::to_string(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes a hash over an ordered set of `(id, hash)` pairs.
    ///
    /// Used to derive the desired-state version from the per-resource hashes.
    #[must_use]
    pub fn hash_entries<'a, I>(&self, entries: I) -> String
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut hasher = Sha256::new();
        for (id, hash) in entries {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
            hasher.update(hash.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_scalars() {
        assert_eq!(ConfigHasher::normalize(&json!(" 3 ")), json!(3));
        assert_eq!(ConfigHasher::normalize(&json!("-2")), json!(-2));
        assert_eq!(ConfigHasher::normalize(&json!("TRUE")), json!(true));
        assert_eq!(ConfigHasher::normalize(&json!("False")), json!(false));
        assert_eq!(ConfigHasher::normalize(&json!(3.0)), json!(3));
        assert_eq!(ConfigHasher::normalize(&json!(2.5)), json!(2.5));
    }

    #[test]
    fn test_normalize_keeps_version_like_strings() {
        assert_eq!(ConfigHasher::normalize(&json!("1.20")), json!("1.20"));
        assert_eq!(ConfigHasher::normalize(&json!("007")), json!("007"));
        assert_eq!(ConfigHasher::normalize(&json!("-0")), json!("-0"));
        assert_eq!(ConfigHasher::normalize(&json!("9.9.2")), json!("9.9.2"));
    }

    #[test]
    fn test_normalize_objects() {
        let a = json!({ " size ": "3", "labels": { "b": 1, "a": null }, "spot": "true" });
        let b = json!({ "spot": true, "size": 3, "labels": { "b": 1.0 } });
        assert!(ConfigHasher::equivalent(&a, &b));
    }

    #[test]
    fn test_array_order_is_semantic() {
        let a = json!({ "subnets": ["a", "b"] });
        let b = json!({ "subnets": ["b", "a"] });
        assert!(!ConfigHasher::equivalent(&a, &b));
    }

    #[test]
    fn test_hash_ignores_formatting() {
        let hasher = ConfigHasher::new();
        let a = json!({ "version": "9.9.2", "replicas": "2" });
        let b = json!({ "replicas": 2, "version": " 9.9.2" });
        assert_eq!(hasher.hash_value(&a), hasher.hash_value(&b));
        assert_ne!(
            hasher.hash_value(&a),
            hasher.hash_value(&json!({ "version": "9.9.3", "replicas": 2 }))
        );
    }

    #[test]
    fn test_hash_entries_is_order_sensitive() {
        let hasher = ConfigHasher::new();
        let ab = hasher.hash_entries([("a", "1"), ("b", "2")]);
        let ba = hasher.hash_entries([("b", "2"), ("a", "1")]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
