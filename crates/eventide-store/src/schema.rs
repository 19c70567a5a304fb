//! The compiled user schema description.
//!
//! The outer schema layer compiles the user's table declarations down to
//! this shape before the engine starts. The store derives physical table
//! names, journal twins, DDL, and the schema fingerprint from it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Name of the instance metadata table; user tables must not collide.
pub const META_TABLE: &str = "_eventide_meta";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// SQL type as declared (`TEXT`, `BIGINT`, `NUMERIC(78,0)`, …).
    pub sql_type: String,
    #[serde(default)]
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    /// Primary key column names, in order.
    pub primary_key: Vec<String>,
    /// Only onchain tables may be written from handlers.
    pub onchain: bool,
}

impl TableSchema {
    /// Physical table name for an instance.
    pub fn physical_name(&self, instance_id: &str) -> String {
        format!("{instance_id}__{}", self.name)
    }

    /// Journal twin name for an instance.
    pub fn journal_name(&self, instance_id: &str) -> String {
        format!("{instance_id}_reorg__{}", self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub tables: Vec<TableSchema>,
}

/// The schema was rejected before any DDL ran.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("table name '{0}' is reserved")]
    ReservedName(String),

    #[error("table '{table}' primary key references unknown column '{column}'")]
    UnknownKeyColumn { table: String, column: String },

    #[error("table '{0}' has no primary key")]
    MissingPrimaryKey(String),
}

impl SchemaDescription {
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Reject reserved and inconsistent declarations. View names share the
    /// namespace with the metadata table and the prefixed physical tables.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for table in &self.tables {
            if table.name == META_TABLE || table.name.contains("__") {
                return Err(SchemaError::ReservedName(table.name.clone()));
            }
            if table.primary_key.is_empty() {
                return Err(SchemaError::MissingPrimaryKey(table.name.clone()));
            }
            for key in &table.primary_key {
                if !table.columns.iter().any(|c| &c.name == key) {
                    return Err(SchemaError::UnknownKeyColumn {
                        table: table.name.clone(),
                        column: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Deterministic hash over the whole declaration; part of the build id.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for table in &self.tables {
            hasher.update(table.name.as_bytes());
            hasher.update([table.onchain as u8]);
            for column in &table.columns {
                hasher.update(column.name.as_bytes());
                hasher.update(column.sql_type.as_bytes());
                hasher.update([column.nullable as u8]);
            }
            hasher.update(b"|pk:");
            for key in &table.primary_key {
                hasher.update(key.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    /// `CREATE TABLE` statement for one table's physical twin.
    pub fn create_table_sql(&self, table: &TableSchema, pg_schema: &str, instance_id: &str) -> String {
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| {
                format!(
                    "\"{}\" {}{}",
                    c.name,
                    c.sql_type,
                    if c.nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();
        let pk: Vec<String> = table.primary_key.iter().map(|k| format!("\"{k}\"")).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\".\"{}\" ({}, PRIMARY KEY ({}))",
            pg_schema,
            table.physical_name(instance_id),
            columns.join(", "),
            pk.join(", ")
        )
    }

    /// `CREATE TABLE` statement for one table's journal twin.
    pub fn create_journal_sql(
        &self,
        table: &TableSchema,
        pg_schema: &str,
        instance_id: &str,
    ) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\".\"{}\" (
                journal_id   BIGSERIAL PRIMARY KEY,
                operation    SMALLINT NOT NULL,
                checkpoint   TEXT     NOT NULL,
                key          JSONB    NOT NULL,
                before_image JSONB
            )",
            pg_schema,
            table.journal_name(instance_id)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::counter_schema;

    #[test]
    fn physical_and_journal_names() {
        let schema = counter_schema();
        let table = schema.table("counters").unwrap();
        assert_eq!(table.physical_name("a1b2"), "a1b2__counters");
        assert_eq!(table.journal_name("a1b2"), "a1b2_reorg__counters");
    }

    #[test]
    fn reserved_names_rejected() {
        let mut schema = counter_schema();
        schema.tables[0].name = META_TABLE.into();
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::ReservedName(_))
        ));

        let mut schema = counter_schema();
        schema.tables[0].name = "weird__name".into();
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::ReservedName(_))
        ));
    }

    #[test]
    fn primary_key_must_exist() {
        let mut schema = counter_schema();
        schema.tables[0].primary_key = vec!["nope".into()];
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::UnknownKeyColumn { .. })
        ));

        let mut schema = counter_schema();
        schema.tables[0].primary_key.clear();
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::MissingPrimaryKey(_))
        ));
    }

    #[test]
    fn fingerprint_tracks_declaration() {
        let a = counter_schema();
        let mut b = counter_schema();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.tables[0].columns[1].sql_type = "INTEGER".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn ddl_shape() {
        let schema = counter_schema();
        let table = schema.table("counters").unwrap();
        let sql = schema.create_table_sql(table, "public", "a1b2");
        assert!(sql.contains("\"public\".\"a1b2__counters\""));
        assert!(sql.contains("\"value\" BIGINT NOT NULL"));
        assert!(sql.contains("PRIMARY KEY (\"id\")"));
    }
}
