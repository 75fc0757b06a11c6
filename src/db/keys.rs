//! Primary and foreign key management for existing tables.
//!
//! DuckDB cannot add or drop key constraints with `ALTER TABLE`, so every
//! change rebuilds the table inside one transaction: the rows are copied
//! aside, the table is recreated with the new key set and the rows are copied
//! back. Column defaults, NOT NULL, UNIQUE and CHECK constraints and indexes
//! are carried over. Any failure rolls the whole change back.

use duckdb::{Connection, Row};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::db::introspect::DuckDbIntrospector;
use crate::db::schema::ConstraintInfo;
use crate::db::schema_cache::SchemaCache;
use crate::db::store::{quote_ident, quote_literal, Store, StoreError};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    #[error("column '{column}' does not exist in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    #[error("table '{0}' does not have a primary key")]
    NoPrimaryKey(String),

    #[error("column '{column}' in table '{table}' is not a primary key")]
    NotPrimaryKey { table: String, column: String },

    #[error("no foreign key found on column '{column}' in table '{table}'")]
    NoForeignKey { table: String, column: String },

    #[error("table '{table}' is referenced by a foreign key on '{by}'; remove that key first")]
    Referenced { table: String, by: String },

    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyChange {
    /// Makes `column` the table's only primary key column.
    SetPrimaryKey { column: String },
    RemovePrimaryKey,
    /// `referenced_column` must be the primary key of `referenced_table`.
    AddForeignKey {
        column: String,
        referenced_table: String,
        referenced_column: String,
    },
    RemoveForeignKey { column: String },
}

/// Applies key changes through its own connection and invalidates the
/// [`SchemaCache`] after each one.
pub struct KeyManager {
    store: Arc<Store>,
    cache: Arc<SchemaCache>,
}

impl KeyManager {
    pub fn new(store: Arc<Store>, cache: Arc<SchemaCache>) -> Self {
        Self { store, cache }
    }

    pub async fn apply(&self, table: &str, change: KeyChange) -> Result<(), KeyError> {
        let mut conn = self.store.connect()?;
        let table_name = table.to_string();
        let description = format!("{:?}", change);

        tokio::task::spawn_blocking(move || apply_change(&mut conn, &table_name, &change))
            .await
            .map_err(StoreError::from)??;

        self.cache.invalidate().await;
        info!("Applied {} to table '{}'", description, table);
        Ok(())
    }

    pub async fn set_primary_key(&self, table: &str, column: &str) -> Result<(), KeyError> {
        self.apply(
            table,
            KeyChange::SetPrimaryKey {
                column: column.to_string(),
            },
        )
        .await
    }

    pub async fn remove_primary_key(&self, table: &str) -> Result<(), KeyError> {
        self.apply(table, KeyChange::RemovePrimaryKey).await
    }

    pub async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        referenced_table: &str,
        referenced_column: &str,
    ) -> Result<(), KeyError> {
        self.apply(
            table,
            KeyChange::AddForeignKey {
                column: column.to_string(),
                referenced_table: referenced_table.to_string(),
                referenced_column: referenced_column.to_string(),
            },
        )
        .await
    }

    pub async fn remove_foreign_key(&self, table: &str, column: &str) -> Result<(), KeyError> {
        self.apply(
            table,
            KeyChange::RemoveForeignKey {
                column: column.to_string(),
            },
        )
        .await
    }
}

#[derive(Debug, Clone)]
struct ColumnDef {
    name: String,
    declared_type: String,
    not_null: bool,
    default: Option<String>,
    primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct ForeignKeyDef {
    columns: Vec<String>,
    referenced_table: String,
    referenced_columns: Vec<String>,
}

/// Everything needed to recreate a table.
#[derive(Debug)]
struct TableDefinition {
    columns: Vec<ColumnDef>,
    unique: Vec<Vec<String>>,
    checks: Vec<String>,
    foreign_keys: Vec<ForeignKeyDef>,
    /// `CREATE INDEX` statements, replayed after the rebuild
    indexes: Vec<String>,
}

impl TableDefinition {
    fn read(conn: &Connection, introspector: &DuckDbIntrospector, table: &str) -> Result<Self, KeyError> {
        let mut unique = Vec::new();
        let mut foreign_keys = Vec::new();
        for constraint in introspector.constraints(conn, table)? {
            match constraint {
                // Named entries are indexes, replayed from their own SQL
                ConstraintInfo::UniqueIndex { name: Some(_), .. } => {}
                ConstraintInfo::UniqueIndex { name: None, columns } => unique.push(columns),
                ConstraintInfo::ForeignKey {
                    columns,
                    referenced_table,
                    referenced_columns,
                } => foreign_keys.push(ForeignKeyDef {
                    columns,
                    referenced_table,
                    referenced_columns,
                }),
            }
        }

        Ok(Self {
            columns: read_columns(conn, table)?,
            unique,
            checks: query_strings(
                conn,
                "SELECT constraint_text FROM duckdb_constraints() \
                 WHERE schema_name = 'main' AND table_name = ? AND constraint_type = 'CHECK' \
                 ORDER BY constraint_index",
                table,
            )?,
            foreign_keys,
            indexes: query_strings(
                conn,
                "SELECT sql FROM duckdb_indexes() \
                 WHERE schema_name = 'main' AND table_name = ? AND sql IS NOT NULL \
                 ORDER BY index_name",
                table,
            )?,
        })
    }

    fn require_column(&self, table: &str, column: &str) -> Result<(), KeyError> {
        if self.columns.iter().any(|c| c.name == column) {
            Ok(())
        } else {
            Err(KeyError::ColumnNotFound {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }

    fn create_sql(&self, table: &str) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", quote_ident(&c.name), c.declared_type);
                if c.not_null && !c.primary_key {
                    def.push_str(" NOT NULL");
                }
                if let Some(default) = &c.default {
                    def.push_str(" DEFAULT ");
                    def.push_str(default);
                }
                def
            })
            .collect();

        let primary_key: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect();
        if !primary_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", ident_list(&primary_key)));
        }
        for columns in &self.unique {
            parts.push(format!("UNIQUE ({})", ident_list(columns)));
        }
        parts.extend(self.checks.iter().cloned());
        for fk in &self.foreign_keys {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                ident_list(&fk.columns),
                quote_ident(&fk.referenced_table),
                ident_list(&fk.referenced_columns)
            ));
        }

        format!("CREATE TABLE {} ({})", quote_ident(table), parts.join(", "))
    }
}

fn ident_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

// `notnull` and `pk` are BOOLEAN in current DuckDB, integers in older builds
fn flag(row: &Row<'_>, index: usize) -> duckdb::Result<bool> {
    match row.get::<_, bool>(index) {
        Ok(value) => Ok(value),
        Err(_) => Ok(row.get::<_, i32>(index)? != 0),
    }
}

fn read_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnDef>, KeyError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_literal(table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnDef {
                name: row.get(1)?,
                declared_type: row.get(2)?,
                not_null: flag(row, 3)?,
                default: row.get(4)?,
                primary_key: flag(row, 5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn query_strings(conn: &Connection, sql: &str, table: &str) -> Result<Vec<String>, KeyError> {
    let mut stmt = conn.prepare(sql)?;
    let values = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(values)
}

fn apply_change(conn: &mut Connection, table: &str, change: &KeyChange) -> Result<(), KeyError> {
    let introspector = DuckDbIntrospector::default();
    let tables = introspector.list_tables(conn)?;
    if !tables.iter().any(|t| t == table) {
        return Err(KeyError::TableNotFound(table.to_string()));
    }

    let mut definition = TableDefinition::read(conn, &introspector, table)?;

    match change {
        KeyChange::SetPrimaryKey { column } => {
            definition.require_column(table, column)?;
            for c in &mut definition.columns {
                c.primary_key = c.name == *column;
            }
        }
        KeyChange::RemovePrimaryKey => {
            if !definition.columns.iter().any(|c| c.primary_key) {
                return Err(KeyError::NoPrimaryKey(table.to_string()));
            }
            for c in &mut definition.columns {
                c.primary_key = false;
            }
        }
        KeyChange::AddForeignKey {
            column,
            referenced_table,
            referenced_column,
        } => {
            definition.require_column(table, column)?;
            if !tables.iter().any(|t| t == referenced_table) {
                return Err(KeyError::TableNotFound(referenced_table.clone()));
            }

            let referenced = read_columns(conn, referenced_table)?;
            match referenced.iter().find(|c| c.name == *referenced_column) {
                None => {
                    return Err(KeyError::ColumnNotFound {
                        table: referenced_table.clone(),
                        column: referenced_column.clone(),
                    });
                }
                Some(c) if !c.primary_key => {
                    return Err(KeyError::NotPrimaryKey {
                        table: referenced_table.clone(),
                        column: referenced_column.clone(),
                    });
                }
                Some(_) => {}
            }

            // At most one foreign key per column
            definition.foreign_keys.retain(|fk| fk.columns != [column.as_str()]);
            definition.foreign_keys.push(ForeignKeyDef {
                columns: vec![column.clone()],
                referenced_table: referenced_table.clone(),
                referenced_columns: vec![referenced_column.clone()],
            });
        }
        KeyChange::RemoveForeignKey { column } => {
            definition.require_column(table, column)?;
            let before = definition.foreign_keys.len();
            definition.foreign_keys.retain(|fk| !fk.columns.contains(column));
            if definition.foreign_keys.len() == before {
                return Err(KeyError::NoForeignKey {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }
    }

    // DuckDB refuses to drop a table other tables point at
    for other in tables.iter().filter(|t| t.as_str() != table) {
        let points_here = introspector.constraints(conn, other)?.into_iter().any(|c| {
            matches!(c, ConstraintInfo::ForeignKey { referenced_table, .. } if referenced_table == table)
        });
        if points_here {
            return Err(KeyError::Referenced {
                table: table.to_string(),
                by: other.clone(),
            });
        }
    }

    rebuild(conn, table, &definition)
}

fn rebuild(conn: &mut Connection, table: &str, definition: &TableDefinition) -> Result<(), KeyError> {
    let target = quote_ident(table);
    let staging = quote_ident(&format!("{}__rekey", table));
    let create = definition.create_sql(table);
    debug!("Rebuilding table '{}': {}", table, create);

    let tx = conn.transaction()?;
    tx.execute_batch(&format!(
        "CREATE TABLE {staging} AS SELECT * FROM {target};
         DROP TABLE {target};
         {create};
         INSERT INTO {target} SELECT * FROM {staging};
         DROP TABLE {staging};"
    ))?;
    for index in &definition.indexes {
        tx.execute_batch(index)?;
    }
    tx.commit()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::introspect::SchemaIntrospector;

    fn manager_with(ddl: &str) -> (KeyManager, Arc<Store>, Arc<SchemaCache>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.connect().unwrap().execute_batch(ddl).unwrap();
        let cache = Arc::new(SchemaCache::new(true));
        (
            KeyManager::new(Arc::clone(&store), Arc::clone(&cache)),
            store,
            cache,
        )
    }

    const TEAMS_AND_RESULTS: &str = "
        CREATE TABLE teams (team_id INTEGER, label VARCHAR);
        INSERT INTO teams VALUES (1, 'red'), (2, 'blue');
        CREATE TABLE results (id INTEGER, team_id INTEGER, score DOUBLE NOT NULL);
        INSERT INTO results VALUES (1, 1, 10.0), (2, 2, 20.0), (3, 1, 30.0);";

    fn snapshot(store: &Store) -> crate::db::schema::SchemaSnapshot {
        DuckDbIntrospector::default()
            .snapshot(&store.connect().unwrap())
            .unwrap()
    }

    fn count(store: &Store, table: &str) -> i64 {
        store
            .connect()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn primary_keys_are_set_and_removed_without_losing_rows() {
        let (keys, store, _) = manager_with(TEAMS_AND_RESULTS);

        keys.set_primary_key("results", "id").await.unwrap();
        let schema = snapshot(&store);
        let results = schema.table("results").unwrap();
        assert!(results.column("id").unwrap().is_primary_key);
        assert!(!results.column("team_id").unwrap().is_primary_key);
        assert_eq!(count(&store, "results"), 3);

        // Moving the key replaces it
        keys.set_primary_key("results", "score").await.unwrap();
        let schema = snapshot(&store);
        assert!(!schema.table("results").unwrap().column("id").unwrap().is_primary_key);
        assert!(schema.table("results").unwrap().column("score").unwrap().is_primary_key);

        keys.remove_primary_key("results").await.unwrap();
        let schema = snapshot(&store);
        assert!(schema.table("results").unwrap().columns.iter().all(|c| !c.is_primary_key));
        assert_eq!(count(&store, "results"), 3);

        let err = keys.remove_primary_key("results").await.unwrap_err();
        assert!(matches!(err, KeyError::NoPrimaryKey(t) if t == "results"));
    }

    #[tokio::test]
    async fn foreign_keys_reach_the_schema_snapshot() {
        let (keys, store, _) = manager_with(TEAMS_AND_RESULTS);

        keys.set_primary_key("teams", "team_id").await.unwrap();
        keys.add_foreign_key("results", "team_id", "teams", "team_id")
            .await
            .unwrap();

        let schema = snapshot(&store);
        assert_eq!(
            schema.table("results").unwrap().constraints,
            vec![ConstraintInfo::ForeignKey {
                columns: vec!["team_id".to_string()],
                referenced_table: "teams".to_string(),
                referenced_columns: vec!["team_id".to_string()],
            }]
        );
        assert_eq!(count(&store, "results"), 3);

        // The referenced table cannot be rebuilt while the key exists
        let err = keys.remove_primary_key("teams").await.unwrap_err();
        assert!(matches!(err, KeyError::Referenced { ref by, .. } if by == "results"), "{err}");

        keys.remove_foreign_key("results", "team_id").await.unwrap();
        assert!(snapshot(&store).table("results").unwrap().constraints.is_empty());
        keys.remove_primary_key("teams").await.unwrap();

        let err = keys.remove_foreign_key("results", "team_id").await.unwrap_err();
        assert!(matches!(err, KeyError::NoForeignKey { .. }));
    }

    #[tokio::test]
    async fn invalid_targets_are_rejected() {
        let (keys, _, _) = manager_with(TEAMS_AND_RESULTS);

        let err = keys.set_primary_key("missing", "id").await.unwrap_err();
        assert!(matches!(err, KeyError::TableNotFound(t) if t == "missing"));

        let err = keys.set_primary_key("results", "nope").await.unwrap_err();
        assert!(matches!(err, KeyError::ColumnNotFound { ref column, .. } if column == "nope"));

        let err = keys
            .add_foreign_key("results", "team_id", "teams", "label")
            .await
            .unwrap_err();
        assert!(matches!(err, KeyError::NotPrimaryKey { ref column, .. } if column == "label"));

        let err = keys
            .add_foreign_key("results", "team_id", "players", "id")
            .await
            .unwrap_err();
        assert!(matches!(err, KeyError::TableNotFound(t) if t == "players"));
    }

    #[tokio::test]
    async fn failed_rebuilds_leave_the_table_untouched() {
        let (keys, store, _) = manager_with(TEAMS_AND_RESULTS);

        // team_id repeats, so it cannot be a primary key
        let err = keys.set_primary_key("results", "team_id").await.unwrap_err();
        assert!(matches!(err, KeyError::Database(_)), "{err}");

        let schema = snapshot(&store);
        let results = schema.table("results").unwrap();
        assert!(results.columns.iter().all(|c| !c.is_primary_key));
        assert_eq!(count(&store, "results"), 3);
        assert!(schema.table("results__rekey").is_none());
    }

    #[tokio::test]
    async fn key_changes_invalidate_the_schema_cache() {
        let (keys, store, cache) = manager_with(TEAMS_AND_RESULTS);
        let introspector: Arc<dyn SchemaIntrospector> = Arc::new(DuckDbIntrospector::default());
        cache
            .get_or_refresh(&store.session().unwrap(), introspector)
            .await
            .unwrap();

        keys.set_primary_key("teams", "team_id").await.unwrap();
        assert!(cache.cached().await.is_none());
    }

    #[tokio::test]
    async fn rebuilds_keep_other_constraints_and_indexes() {
        let (keys, store, _) = manager_with(
            "CREATE TABLE items (id INTEGER, code VARCHAR UNIQUE, qty INTEGER DEFAULT 1 CHECK (qty >= 0));
             CREATE INDEX items_qty ON items (qty);
             INSERT INTO items VALUES (1, 'a', 3), (2, 'b', 4);",
        );

        keys.set_primary_key("items", "id").await.unwrap();

        let conn = store.connect().unwrap();
        assert!(conn.execute_batch("INSERT INTO items VALUES (3, 'a', 1)").is_err());
        assert!(conn.execute_batch("INSERT INTO items VALUES (4, 'd', -1)").is_err());
        conn.execute_batch("INSERT INTO items (id, code) VALUES (5, 'e')").unwrap();
        let qty: i32 = conn
            .query_row("SELECT qty FROM items WHERE id = 5", [], |row| row.get(0))
            .unwrap();
        assert_eq!(qty, 1);

        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM duckdb_indexes() WHERE index_name = 'items_qty'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 1);
    }
}
