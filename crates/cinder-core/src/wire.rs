//! Serialized meta forms exchanged between peers and the merge server.
//!
//! Two shapes are in circulation:
//!
//! - v2 (batched): `{ "metas": [SerializedMeta, ..], "keys": [string, ..] }`
//! - v1 (legacy): `[ { cid, data, parents, key | keys }, .. ]` where `key`
//!   may be a single string or an array
//!
//! [`decode_meta_payload`] accepts both and normalizes to [`SerializedMetaKey`].

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// A reference to a committed head, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerializedMeta {
    pub cid: String,
    /// base64 encoded payload
    pub data: String,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl SerializedMeta {
    /// Wrap a payload; the cid is the address of the raw payload bytes.
    pub fn from_payload(payload: &[u8], parents: Vec<String>) -> Self {
        SerializedMeta {
            cid: crate::Hasher::hash(payload).to_hex(),
            data: STANDARD.encode(payload),
            parents,
        }
    }

    /// The decoded payload bytes.
    pub fn payload(&self) -> Result<Vec<u8>> {
        Ok(STANDARD.decode(self.data.as_bytes())?)
    }

    /// The decoded payload, checked against the claimed cid.
    pub fn verified_payload(&self) -> Result<Vec<u8>> {
        let expected: crate::Hash = self.cid.parse()?;
        let payload = self.payload()?;
        let actual = crate::Hasher::hash(&payload);
        if actual != expected {
            return Err(CoreError::AddressMismatch { expected, actual });
        }
        Ok(payload)
    }
}

/// Batched metas plus gossiped key strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMetaKey {
    #[serde(default)]
    pub metas: Vec<SerializedMeta>,
    #[serde(default)]
    pub keys: Vec<String>,
}

/// One element of the legacy array form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyMetaKey {
    #[serde(flatten)]
    pub meta: SerializedMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<String>>,
}

/// Which shape to emit when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaFormat {
    V1,
    #[default]
    V2,
}

#[derive(Default)]
struct Normalizer {
    metas: Vec<SerializedMeta>,
    seen: HashSet<String>,
    keys: Vec<String>,
    seen_keys: HashSet<String>,
}

impl Normalizer {
    fn key(&mut self, key: &str) {
        if self.seen_keys.insert(key.to_string()) {
            self.keys.push(key.to_string());
        }
    }

    fn keys_from(&mut self, value: Option<&Value>) {
        match value {
            Some(Value::String(s)) => self.key(s),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Value::String(s) = item {
                        self.key(s);
                    }
                }
            }
            _ => {}
        }
    }

    fn entry(&mut self, item: &Value) {
        self.keys_from(item.get("key"));
        self.keys_from(item.get("keys"));

        let Some(cid) = item.get("cid").and_then(Value::as_str) else {
            return;
        };
        let data = match item.get("data") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(_) => return,
        };
        let parents = match item.get("parents") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|p| p.as_str().map(str::to_string))
                .collect(),
            Some(_) => return,
        };
        // later duplicates replace earlier ones but keep their position
        if self.seen.insert(cid.to_string()) {
            self.metas.push(SerializedMeta {
                cid: cid.to_string(),
                data,
                parents,
            });
        } else if let Some(existing) = self.metas.iter_mut().find(|m| m.cid == cid) {
            existing.data = data;
            existing.parents = parents;
        }
    }

    fn finish(self) -> SerializedMetaKey {
        SerializedMetaKey {
            metas: self.metas,
            keys: self.keys,
        }
    }
}

/// Normalize an already parsed JSON value in either shape.
pub fn normalize_meta_value(value: &Value) -> Result<SerializedMetaKey> {
    let mut norm = Normalizer::default();
    match value {
        Value::Array(items) => {
            for item in items {
                norm.entry(item);
            }
        }
        Value::Object(obj) => {
            let metas = obj.get("metas");
            let keys = obj.get("keys");
            if !matches!(metas, None | Some(Value::Array(_)))
                || !matches!(keys, None | Some(Value::Array(_)))
            {
                return Err(CoreError::Parsing(
                    "not a valid serialized meta key".to_string(),
                ));
            }
            norm.keys_from(keys);
            if let Some(Value::Array(items)) = metas {
                for item in items {
                    norm.entry(item);
                }
            }
        }
        _ => {
            return Err(CoreError::Parsing(
                "not a valid serialized meta key".to_string(),
            ))
        }
    }
    Ok(norm.finish())
}

/// Decode raw bytes in either shape.
pub fn decode_meta_payload(raw: &[u8]) -> Result<SerializedMetaKey> {
    let value: Value = serde_json::from_slice(raw)?;
    normalize_meta_value(&value)
}

/// Encode metas and key strings in the requested shape.
pub fn encode_meta_payload(
    metas: &[SerializedMeta],
    keys: &[String],
    format: MetaFormat,
) -> Result<Vec<u8>> {
    match format {
        MetaFormat::V1 => {
            let legacy: Vec<LegacyMetaKey> = metas
                .iter()
                .map(|m| LegacyMetaKey {
                    meta: m.clone(),
                    key: Some(keys.to_vec()),
                })
                .collect();
            Ok(serde_json::to_vec(&legacy)?)
        }
        MetaFormat::V2 => Ok(serde_json::to_vec(&SerializedMetaKey {
            metas: metas.to_vec(),
            keys: keys.to_vec(),
        })?),
    }
}
