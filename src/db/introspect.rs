use duckdb::Connection;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::db::rows::{to_json, to_strings};
use crate::db::schema::{ColumnInfo, ConstraintInfo, SchemaSnapshot, TableInfo};
use crate::db::store::{quote_ident, quote_literal, StoreError};

/// Reads structural metadata from the store. Never mutates it.
pub trait SchemaIntrospector: Send + Sync {
    fn snapshot(&self, conn: &Connection) -> Result<SchemaSnapshot, StoreError>;
}

pub struct DuckDbIntrospector {
    sample_rows: usize,
}

static REFERENCES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)REFERENCES\s+"?([A-Za-z0-9_]+)"?\s*\(([^)]*)\)"#)
        .expect("static regex is valid")
});

impl DuckDbIntrospector {
    pub fn new(sample_rows: usize) -> Self {
        Self { sample_rows }
    }

    pub(crate) fn list_tables(&self, conn: &Connection) -> Result<Vec<String>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'main' AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tables)
    }

    fn columns(&self, conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, StoreError> {
        let sql = format!("PRAGMA table_info({})", quote_literal(table));
        let mut stmt = conn.prepare(&sql)?;
        let columns = stmt
            .query_map([], |row| {
                // `pk` is BOOLEAN in current DuckDB, an integer in older builds
                let is_primary_key = match row.get::<_, bool>(5) {
                    Ok(value) => value,
                    Err(_) => row.get::<_, i32>(5)? != 0,
                };

                Ok(ColumnInfo {
                    name: row.get(1)?,
                    declared_type: row.get(2)?,
                    is_primary_key,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    pub(crate) fn constraints(&self, conn: &Connection, table: &str) -> Result<Vec<ConstraintInfo>, StoreError> {
        let mut constraints = Vec::new();

        let mut stmt = conn.prepare(
            "SELECT constraint_type, CAST(constraint_column_names AS VARCHAR), constraint_text \
             FROM duckdb_constraints() \
             WHERE schema_name = 'main' AND table_name = ? \
               AND constraint_type IN ('UNIQUE', 'FOREIGN KEY') \
             ORDER BY constraint_index",
        )?;
        let mut rows = stmt.query([table])?;
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let columns = to_strings(row.get(1)?);
            let text: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();

            if kind == "UNIQUE" {
                constraints.push(ConstraintInfo::UniqueIndex {
                    name: None,
                    columns,
                });
            } else if let Some(caps) = REFERENCES.captures(&text) {
                constraints.push(ConstraintInfo::ForeignKey {
                    columns,
                    referenced_table: caps[1].to_string(),
                    referenced_columns: caps[2]
                        .split(',')
                        .map(|c| c.trim().trim_matches('"').to_string())
                        .filter(|c| !c.is_empty())
                        .collect(),
                });
            } else {
                debug!("Skipping foreign key on {} without a readable target: {}", table, text);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT index_name, CAST(expressions AS VARCHAR) FROM duckdb_indexes() \
             WHERE schema_name = 'main' AND table_name = ? AND is_unique \
             ORDER BY index_name",
        )?;
        let mut rows = stmt.query([table])?;
        while let Some(row) = rows.next()? {
            constraints.push(ConstraintInfo::UniqueIndex {
                name: Some(row.get(0)?),
                columns: to_strings(row.get(1)?),
            });
        }

        Ok(constraints)
    }

    fn sample_rows(&self, conn: &Connection, table: &str) -> Result<Vec<Vec<serde_json::Value>>, StoreError> {
        let sql = format!("SELECT * FROM {} LIMIT {}", quote_ident(table), self.sample_rows);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let column_count = rows.as_ref().map(|s| s.column_count()).unwrap_or(0);

        let mut samples = Vec::new();
        while let Some(row) = rows.next()? {
            let mut tuple = Vec::with_capacity(column_count);
            for i in 0..column_count {
                tuple.push(to_json(row.get(i)?));
            }
            samples.push(tuple);
        }
        Ok(samples)
    }
}

impl Default for DuckDbIntrospector {
    fn default() -> Self {
        Self::new(5)
    }
}

impl SchemaIntrospector for DuckDbIntrospector {
    fn snapshot(&self, conn: &Connection) -> Result<SchemaSnapshot, StoreError> {
        let mut tables = BTreeMap::new();

        for name in self.list_tables(conn)? {
            let info = TableInfo {
                columns: self.columns(conn, &name)?,
                constraints: self.constraints(conn, &name)?,
                sample_rows: self.sample_rows(conn, &name)?,
            };
            debug!(
                "Introspected table {}: {} columns, {} constraints, {} sample rows",
                name,
                info.columns.len(),
                info.constraints.len(),
                info.sample_rows.len()
            );
            tables.insert(name, info);
        }

        info!("Schema snapshot taken: {} tables", tables.len());
        Ok(SchemaSnapshot::new(tables))
    }
}
