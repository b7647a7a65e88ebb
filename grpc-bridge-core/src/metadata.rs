//! Ordered RPC metadata.
//!
//! Metadata is a list of `(key, value)` pairs. Keys ending in
//! [`BINARY_HEADER_SUFFIX`] carry raw bytes; every other key carries a
//! string. Repeated keys are kept in insertion order, the same way repeated
//! header fields are concatenated on the wire.

use bytes::Bytes;

/// Key suffix marking a binary-valued entry.
pub const BINARY_HEADER_SUFFIX: &str = "-bin";

/// Errors raised when constructing metadata entries.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    /// Key is empty, contains characters outside `[a-z0-9-_.]`, or is a pseudo-header.
    #[error("invalid metadata key: {0:?}")]
    InvalidKey(String),

    /// A binary value was given for a non `-bin` key.
    #[error("binary value requires a key ending in \"-bin\": {0:?}")]
    BinaryValueForAsciiKey(String),

    /// A string value was given for a `-bin` key.
    #[error("key ending in \"-bin\" requires a binary value: {0:?}")]
    AsciiValueForBinaryKey(String),
}

/// A single metadata value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Ascii(s) => Some(s),
            MetadataValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MetadataValue::Ascii(s) => s.as_bytes(),
            MetadataValue::Binary(b) => b,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, MetadataValue::Binary(_))
    }
}

/// Returns true when `key` names a binary entry.
pub fn is_binary_key(key: &str) -> bool {
    key.ends_with(BINARY_HEADER_SUFFIX)
}

fn validate_key(key: &str) -> Result<(), MetadataError> {
    let valid = !key.is_empty()
        && key
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(MetadataError::InvalidKey(key.to_string()))
    }
}

/// Ordered, multi-valued metadata.
///
/// # Example
///
/// ```
/// use grpc_bridge_core::{Metadata, MetadataValue};
///
/// let mut md = Metadata::new();
/// md.append_ascii("x-tenant", "acme").unwrap();
/// md.append_binary("trace-bin", vec![0x01, 0x02]).unwrap();
/// md.append_ascii("x-tenant", "beta").unwrap();
///
/// let tenants: Vec<_> = md.get_all("x-tenant").filter_map(MetadataValue::as_str).collect();
/// assert_eq!(tenants, ["acme", "beta"]);
/// assert_eq!(md.get("trace-bin").unwrap().as_bytes(), &[0x01, 0x02]);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a string entry. Keys are lowercased before validation.
    pub fn append_ascii<K, V>(&mut self, key: K, value: V) -> Result<(), MetadataError>
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let key = key.as_ref().to_ascii_lowercase();
        validate_key(&key)?;
        if is_binary_key(&key) {
            return Err(MetadataError::AsciiValueForBinaryKey(key));
        }
        self.entries.push((key, MetadataValue::Ascii(value.into())));
        Ok(())
    }

    /// Append a binary entry. The key must end in `-bin`.
    pub fn append_binary<K, V>(&mut self, key: K, value: V) -> Result<(), MetadataError>
    where
        K: AsRef<str>,
        V: Into<Bytes>,
    {
        let key = key.as_ref().to_ascii_lowercase();
        validate_key(&key)?;
        if !is_binary_key(&key) {
            return Err(MetadataError::BinaryValueForAsciiKey(key));
        }
        self.entries.push((key, MetadataValue::Binary(value.into())));
        Ok(())
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Every value stored under `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a MetadataValue> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Drop every entry stored under `key`, returning how many were removed.
    pub fn remove_all(&mut self, key: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Append every entry of `other`, preserving its order.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }
}

impl IntoIterator for Metadata {
    type Item = (String, MetadataValue);
    type IntoIter = std::vec::IntoIter<(String, MetadataValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_keys_keep_insertion_order() {
        let mut md = Metadata::new();
        md.append_ascii("a", "1").unwrap();
        md.append_ascii("b", "2").unwrap();
        md.append_ascii("a", "3").unwrap();

        let keys: Vec<_> = md.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b", "a"]);
        let values: Vec<_> = md.get_all("a").filter_map(MetadataValue::as_str).collect();
        assert_eq!(values, ["1", "3"]);
    }

    #[test]
    fn test_binary_suffix_enforced() {
        let mut md = Metadata::new();
        assert_eq!(
            md.append_ascii("trace-bin", "x"),
            Err(MetadataError::AsciiValueForBinaryKey("trace-bin".into()))
        );
        assert_eq!(
            md.append_binary("trace", vec![1u8]),
            Err(MetadataError::BinaryValueForAsciiKey("trace".into()))
        );
        assert!(md.is_empty());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let mut md = Metadata::new();
        assert!(md.append_ascii("", "x").is_err());
        assert!(md.append_ascii(":path", "/x").is_err());
        assert!(md.append_ascii("has space", "x").is_err());
    }

    #[test]
    fn test_keys_lowercased() {
        let mut md = Metadata::new();
        md.append_ascii("X-Request-Id", "42").unwrap();
        assert_eq!(md.get("x-request-id").and_then(MetadataValue::as_str), Some("42"));
    }

    #[test]
    fn test_get_outlives_lookup_key() {
        let mut md = Metadata::new();
        md.append_ascii("x-tenant", "acme").unwrap();
        md.append_ascii("x-tenant", "beta").unwrap();

        let first = {
            let key = String::from("X-Tenant");
            md.get(&key)
        };
        assert_eq!(first.and_then(MetadataValue::as_str), Some("acme"));
        assert!(md.get("missing").is_none());
    }

    #[test]
    fn test_remove_all() {
        let mut md = Metadata::new();
        md.append_ascii("user-agent", "a").unwrap();
        md.append_ascii("x", "b").unwrap();
        md.append_ascii("user-agent", "c").unwrap();

        assert_eq!(md.remove_all("user-agent"), 2);
        assert_eq!(md.len(), 1);
        assert_eq!(md.remove_all("missing"), 0);
    }
}
