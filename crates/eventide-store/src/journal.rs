//! Journal row model shared by the Postgres and in-memory stores.
//!
//! Every user-table write is shadowed by one journal row; replaying rows
//! newest-first with [`JournalOp::inverse_description`] semantics restores
//! the table to any earlier checkpoint (insert → delete by key, update →
//! restore the before-image, delete → re-insert the before-image).

use serde_json::{Map, Value};

use eventide_core::checkpoint::Checkpoint;
use eventide_core::error::StoreError;

use crate::schema::TableSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Insert,
    Update,
    Delete,
}

impl JournalOp {
    pub fn code(&self) -> i16 {
        match self {
            Self::Insert => 0,
            Self::Update => 1,
            Self::Delete => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Insert),
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            _ => None,
        }
    }

    /// What applying the inverse does to the user table.
    pub fn inverse_description(&self) -> &'static str {
        match self {
            Self::Insert => "delete by key",
            Self::Update => "restore before-image",
            Self::Delete => "re-insert before-image",
        }
    }
}

/// One journal row. `before_image` is the full row as it existed before
/// the shadowed write; `None` for inserts.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub op: JournalOp,
    pub checkpoint: Checkpoint,
    pub key: Value,
    pub before_image: Option<Value>,
}

// ─── Key handling shared by the Postgres and in-memory stores ────────────────

/// Normalize a lookup key into `(canonical string, key object)`.
///
/// A bare scalar is shorthand for the single primary-key column.
pub fn normalize_key(schema: &TableSchema, key: &Value) -> Result<(String, Value), StoreError> {
    let mut object = Map::new();
    match key {
        Value::Object(map) => {
            for pk in &schema.primary_key {
                let v = map.get(pk).ok_or_else(|| {
                    StoreError::Serialization(format!(
                        "key for '{}' is missing column '{pk}'",
                        schema.name
                    ))
                })?;
                object.insert(pk.clone(), v.clone());
            }
        }
        scalar => {
            if schema.primary_key.len() != 1 {
                return Err(StoreError::Serialization(format!(
                    "table '{}' has a composite key; pass an object",
                    schema.name
                )));
            }
            object.insert(schema.primary_key[0].clone(), scalar.clone());
        }
    }
    let canonical = serde_json::to_string(&Value::Object(object.clone()))
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok((canonical, Value::Object(object)))
}

/// Extract the key object out of a full row, rejecting null key columns.
pub fn key_of_row(schema: &TableSchema, row: &Value) -> Result<(String, Value), StoreError> {
    let map = row.as_object().ok_or_else(|| {
        StoreError::Serialization(format!("row for '{}' is not an object", schema.name))
    })?;
    for pk in &schema.primary_key {
        match map.get(pk) {
            None | Some(Value::Null) => {
                return Err(StoreError::NotNullConstraint {
                    table: schema.name.clone(),
                    detail: format!("primary key column '{pk}' is null"),
                })
            }
            Some(_) => {}
        }
    }
    normalize_key(schema, row)
}

/// Overlay patch columns onto a row object.
pub fn merge_patch(row: &mut Value, patch: Map<String, Value>) {
    if let Value::Object(map) = row {
        for (k, v) in patch {
            map.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn op_code_roundtrip() {
        for op in [JournalOp::Insert, JournalOp::Update, JournalOp::Delete] {
            assert_eq!(JournalOp::from_code(op.code()), Some(op));
        }
        assert_eq!(JournalOp::from_code(9), None);
    }

    fn two_key_table() -> TableSchema {
        TableSchema {
            name: "pairs".into(),
            columns: vec![
                crate::schema::ColumnSchema {
                    name: "chain".into(),
                    sql_type: "BIGINT".into(),
                    nullable: false,
                },
                crate::schema::ColumnSchema {
                    name: "addr".into(),
                    sql_type: "TEXT".into(),
                    nullable: false,
                },
            ],
            primary_key: vec!["chain".into(), "addr".into()],
            onchain: true,
        }
    }

    #[test]
    fn scalar_key_requires_single_column_pk() {
        let err = normalize_key(&two_key_table(), &json!("abc")).unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));

        let (canonical, object) =
            normalize_key(&two_key_table(), &json!({ "chain": 1, "addr": "0xa", "extra": 9 }))
                .unwrap();
        // Only key columns survive (serde_json orders object keys).
        assert_eq!(canonical, r#"{"addr":"0xa","chain":1}"#);
        assert_eq!(object, json!({ "chain": 1, "addr": "0xa" }));
    }

    #[test]
    fn null_key_column_rejected() {
        let err = key_of_row(&two_key_table(), &json!({ "chain": 1, "addr": null })).unwrap_err();
        assert!(matches!(err, StoreError::NotNullConstraint { .. }));
    }
}
