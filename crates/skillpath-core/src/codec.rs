//! Keyed-collection codec: the boundary between in-memory keyed collections
//! and the flat JSON documents the store persists.
//!
//! `flatten` stringifies keys and serializes values (nested collections,
//! sequences and structured values recurse through serde; scalars, including
//! explicit nulls, pass through unchanged). `unflatten` is the one-level
//! inverse: it rebuilds the collection without assuming the value shape, so
//! callers recurse further when the element type is known at the call site.
//! No validation happens at this layer.

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
#[error("codec error: {0}")]
pub struct CodecError(#[from] serde_json::Error);

/// Turn a keyed collection into a flat key-value document.
pub fn flatten<K, V>(collection: &BTreeMap<K, V>) -> Result<Map<String, Value>, CodecError>
where
    K: Display,
    V: Serialize,
{
    let mut document = Map::with_capacity(collection.len());
    for (key, value) in collection {
        document.insert(key.to_string(), serde_json::to_value(value)?);
    }
    Ok(document)
}

/// One-level inverse of [`flatten`]: rebuild a keyed collection from a
/// document's entries, leaving each value as raw JSON.
pub fn unflatten(document: &Map<String, Value>) -> BTreeMap<String, Value> {
    document
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// [`unflatten`] plus element decoding, for callers that know the value type.
pub fn unflatten_typed<T: DeserializeOwned>(
    document: &Map<String, Value>,
) -> Result<BTreeMap<String, T>, CodecError> {
    let mut collection = BTreeMap::new();
    for (key, value) in document {
        collection.insert(key.clone(), serde_json::from_value(value.clone())?);
    }
    Ok(collection)
}
