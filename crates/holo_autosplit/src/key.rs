//! Shard keys, shard key patterns and chunk ranges.
//!
//! Key values use a fixed cross-type order: `MinKey` < integers < strings <
//! `MaxKey`. Keys compare field by field, so the global minimum/maximum of a
//! pattern is simply `MinKey`/`MaxKey` in every field.

use std::collections::BTreeSet;
use std::fmt;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// One field value of a shard key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValue {
    MinKey,
    Int(i64),
    Str(String),
    MaxKey,
}

impl KeyValue {
    /// Convert a document field into a key value. Only integers and strings
    /// can be shard key values.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(KeyValue::Int),
            serde_json::Value::String(s) => Some(KeyValue::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::MinKey => f.write_str("MinKey"),
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Str(v) => write!(f, "{v:?}"),
            KeyValue::MaxKey => f.write_str("MaxKey"),
        }
    }
}

/// A full shard key: one value per pattern field, compared lexicographically.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<KeyValue>);

impl ShardKey {
    pub fn int(value: i64) -> Self {
        Self(vec![KeyValue::Int(value)])
    }

    pub fn str(value: impl Into<String>) -> Self {
        Self(vec![KeyValue::Str(value.into())])
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (idx, value) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(" }")
    }
}

/// How a shard key field is laid out across chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFieldKind {
    Ascending,
    Hashed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    pub kind: KeyFieldKind,
}

/// Ordered list of the fields a collection is sharded on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<KeyField>,
}

impl ShardKeyPattern {
    pub fn new(fields: Vec<KeyField>) -> anyhow::Result<Self> {
        if fields.is_empty() {
            anyhow::bail!("shard key pattern must have at least one field");
        }
        let mut seen = BTreeSet::new();
        for field in &fields {
            if field.name.is_empty() {
                anyhow::bail!("shard key field names must not be empty");
            }
            if !seen.insert(field.name.as_str()) {
                anyhow::bail!("duplicate shard key field '{}'", field.name);
            }
        }
        if fields.len() > 1 && fields.iter().any(|f| f.kind == KeyFieldKind::Hashed) {
            anyhow::bail!("hashed shard keys must consist of a single field");
        }
        Ok(Self { fields })
    }

    /// Pattern with every named field ascending.
    pub fn ascending(names: &[&str]) -> anyhow::Result<Self> {
        Self::new(
            names
                .iter()
                .map(|name| KeyField {
                    name: (*name).to_string(),
                    kind: KeyFieldKind::Ascending,
                })
                .collect(),
        )
    }

    pub fn hashed(name: &str) -> anyhow::Result<Self> {
        Self::new(vec![KeyField {
            name: name.to_string(),
            kind: KeyFieldKind::Hashed,
        }])
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn global_min(&self) -> ShardKey {
        ShardKey(vec![KeyValue::MinKey; self.fields.len()])
    }

    pub fn global_max(&self) -> ShardKey {
        ShardKey(vec![KeyValue::MaxKey; self.fields.len()])
    }

    /// True when the pattern is a plain list of ascending fields, i.e. key
    /// order follows document value order. Hashed patterns are not ordered.
    pub fn is_ordered(&self) -> bool {
        self.fields
            .iter()
            .all(|field| field.kind == KeyFieldKind::Ascending)
    }

    /// Extract the shard key of a document. Dotted field names descend into
    /// nested objects. Returns `None` when a field is missing or not a valid
    /// key value.
    pub fn extract_key_from_doc(&self, doc: &serde_json::Value) -> Option<ShardKey> {
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let mut current = doc;
            for part in field.name.split('.') {
                current = current.get(part)?;
            }
            let value = KeyValue::from_json(current)?;
            values.push(match field.kind {
                KeyFieldKind::Ascending => value,
                KeyFieldKind::Hashed => KeyValue::Int(hash_key_value(&value)),
            });
        }
        Some(ShardKey(values))
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (idx, field) in self.fields.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            match field.kind {
                KeyFieldKind::Ascending => write!(f, "{}: 1", field.name)?,
                KeyFieldKind::Hashed => write!(f, "{}: \"hashed\"", field.name)?,
            }
        }
        f.write_str(" }")
    }
}

/// Hash of a hashed shard key field. XXH3 over a tagged encoding, so the
/// value is the same on every platform and toolchain.
fn hash_key_value(value: &KeyValue) -> i64 {
    xxh3_64(&encode_key_value(value)) as i64
}

fn encode_key_value(value: &KeyValue) -> Vec<u8> {
    match value {
        KeyValue::MinKey => vec![0],
        KeyValue::Int(v) => {
            let mut out = Vec::with_capacity(9);
            out.push(1);
            out.extend_from_slice(&v.to_le_bytes());
            out
        }
        KeyValue::Str(v) => {
            let mut out = Vec::with_capacity(v.len() + 1);
            out.push(2);
            out.extend_from_slice(v.as_bytes());
            out
        }
        KeyValue::MaxKey => vec![3],
    }
}

/// Half-open key range `[min, max)` owned by one chunk.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: ShardKey,
    pub max: ShardKey,
}

impl ChunkRange {
    pub fn new(min: ShardKey, max: ShardKey) -> anyhow::Result<Self> {
        if min >= max {
            anyhow::bail!("chunk range min {min} must be less than max {max}");
        }
        Ok(Self { min, max })
    }

    pub fn contains_key(&self, key: &ShardKey) -> bool {
        &self.min <= key && key < &self.max
    }

    /// True when `key` lies strictly between `min` and `max`, which is where
    /// a split point has to fall.
    pub fn is_strictly_inside(&self, key: &ShardKey) -> bool {
        &self.min < key && key < &self.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}
