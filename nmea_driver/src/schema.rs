//! Schema model for connection parameters and device state.
//!
//! A schema is a flat list of keys a host can render and validate
//! against; it serialises with serde so it can cross any host boundary.
//! Enum ids for discovered ports and addresses come from [`stable_id`]
//! so a selection made before a restart still resolves afterwards.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Deterministic id for a port path or address string, stable across
/// restarts and machines.
pub fn stable_id(text: &str) -> i64 {
    let digest = Sha256::digest(text.as_bytes());
    i64::from(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAccess {
    ReadWrite,
    Read,
}

/// One selectable value of an enum key.
#[derive(Debug, Clone, Serialize)]
pub struct EnumValue {
    pub id: i64,
    pub key: String,
    pub label: String,
}

impl EnumValue {
    pub fn new(id: i64, key: &str, label: &str) -> EnumValue {
        EnumValue {
            id,
            key: key.to_string(),
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum KeyKind {
    String {
        default: String,
    },
    Integer {
        default: i64,
        min: i64,
        max: i64,
        step: i64,
    },
    Double {
        default: f64,
        min: f64,
        max: f64,
        step: f64,
    },
    Enum {
        default: i64,
        values: Vec<EnumValue>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaKey {
    pub id: String,
    pub label: String,
    pub access: KeyAccess,
    #[serde(flatten)]
    pub kind: KeyKind,
}

/// An ordered set of schema keys.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Schema {
    pub keys: Vec<SchemaKey>,
}

impl Schema {
    pub fn new() -> Schema {
        Schema { keys: Vec::new() }
    }

    pub fn add_string(&mut self, id: &str, label: &str, default: &str) -> &mut SchemaKey {
        self.push_key(id, label, KeyKind::String {
            default: default.to_string(),
        })
    }

    pub fn add_integer(
        &mut self,
        id: &str,
        label: &str,
        default: i64,
        min: i64,
        max: i64,
        step: i64,
    ) -> &mut SchemaKey {
        self.push_key(id, label, KeyKind::Integer { default, min, max, step })
    }

    pub fn add_double(
        &mut self,
        id: &str,
        label: &str,
        default: f64,
        min: f64,
        max: f64,
        step: f64,
    ) -> &mut SchemaKey {
        self.push_key(id, label, KeyKind::Double { default, min, max, step })
    }

    pub fn add_enum(
        &mut self,
        id: &str,
        label: &str,
        default: i64,
        values: Vec<EnumValue>,
    ) -> &mut SchemaKey {
        self.push_key(id, label, KeyKind::Enum { default, values })
    }

    fn push_key(&mut self, id: &str, label: &str, kind: KeyKind) -> &mut SchemaKey {
        self.keys.push(SchemaKey {
            id: id.to_string(),
            label: label.to_string(),
            access: KeyAccess::ReadWrite,
            kind,
        });
        let last = self.keys.len() - 1;
        &mut self.keys[last]
    }

    pub fn key(&self, id: &str) -> Option<&SchemaKey> {
        self.keys.iter().find(|key| key.id == id)
    }

    /// Validates one parameter against the schema: the key must exist
    /// and the value must match its type and range.
    pub fn check(&self, id: &str, value: &serde_json::Value) -> bool {
        let Some(key) = self.key(id) else { return false };

        match &key.kind {
            KeyKind::String { .. } => value.is_string(),
            KeyKind::Integer { min, max, .. } => value
                .as_i64()
                .map(|v| v >= *min && v <= *max)
                .unwrap_or(false),
            KeyKind::Double { min, max, .. } => value
                .as_f64()
                .map(|v| v >= *min && v <= *max)
                .unwrap_or(false),
            KeyKind::Enum { values, .. } => value
                .as_i64()
                .map(|v| values.iter().any(|entry| entry.id == v))
                .unwrap_or(false),
        }
    }
}
