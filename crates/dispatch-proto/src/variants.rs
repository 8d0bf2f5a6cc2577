//! `Variants` - the tagged-union payload used for task results.
//!
//! The transport never inspects the shape of a task result; it just moves
//! `Variants` values between the solver's `compute` and `set_result` calls.

use serde::{Deserialize, Serialize};

/// A single typed value inside a `Variants` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VariantItem {
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes_vec")] Vec<u8>),
}

/// A task result: zero or more typed values, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variants(pub Vec<VariantItem>);

impl Variants {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn single(item: VariantItem) -> Self {
        Self(vec![item])
    }

    pub fn push(&mut self, item: VariantItem) {
        self.0.push(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &VariantItem> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<i32> for VariantItem {
    fn from(v: i32) -> Self {
        VariantItem::I32(v)
    }
}

impl From<i64> for VariantItem {
    fn from(v: i64) -> Self {
        VariantItem::I64(v)
    }
}

impl From<f64> for VariantItem {
    fn from(v: f64) -> Self {
        VariantItem::F64(v)
    }
}

impl From<String> for VariantItem {
    fn from(v: String) -> Self {
        VariantItem::Str(v)
    }
}

impl From<Vec<u8>> for VariantItem {
    fn from(v: Vec<u8>) -> Self {
        VariantItem::Bytes(v)
    }
}

/// msgpack serializes `Vec<u8>` as an array of integers by default; base64
/// round-tripping through JSON is unnecessary here since rmp_serde handles
/// raw bytes natively via `serde_bytes`. Kept as a thin module so the field
/// attribute reads the same way `hooteproto`'s `base64_bytes` module does.
mod serde_bytes_vec {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(bytes, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_bytes::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: &Variants) -> Variants {
        let bytes = rmp_serde::to_vec(v).unwrap();
        rmp_serde::from_slice(&bytes).unwrap()
    }

    #[test]
    fn i32_roundtrip() {
        let v = Variants::single(VariantItem::I32(-42));
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn i64_roundtrip() {
        let v = Variants::single(VariantItem::I64(i64::MAX));
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn f64_roundtrip() {
        let v = Variants::single(VariantItem::F64(3.14159265358979));
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn string_roundtrip() {
        let v = Variants::single(VariantItem::Str("square of 7 is 49".to_string()));
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn bytes_roundtrip() {
        let v = Variants::single(VariantItem::Bytes(vec![0, 1, 2, 255, 254]));
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn mixed_sequence_roundtrip() {
        let v = Variants(vec![
            VariantItem::I32(1),
            VariantItem::Str("ok".to_string()),
            VariantItem::F64(0.5),
        ]);
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn empty_is_empty() {
        let v = Variants::empty();
        assert!(v.is_empty());
        assert_eq!(roundtrip(&v), v);
    }
}
