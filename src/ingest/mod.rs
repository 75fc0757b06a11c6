//! Bulk loading of CSV and Parquet files, one table per file.
//!
//! Loading goes through its own connection from the [`Store`] and always
//! invalidates the [`SchemaCache`] once a table has been created or replaced.
pub mod csv;
pub mod naming;
pub mod parquet;

use duckdb::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::schema_cache::SchemaCache;
use crate::db::store::{quote_ident, Store, StoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),

    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("cannot derive a table name from '{0}'")]
    InvalidName(String),

    #[error("no columns found in '{0}'")]
    NoColumns(String),

    #[error("table '{table}' has {actual} rows, expected {expected}")]
    Verification {
        table: String,
        expected: i64,
        actual: i64,
    },
}

pub trait FileIngestor: Send + Sync {
    /// A SELECT that reads the whole file with normalized column names.
    fn select_sql(&self, conn: &Connection, path: &Path) -> Result<String, IngestError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IngestMode {
    /// Leave existing tables alone
    #[default]
    Skip,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Created,
    Replaced,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestedTable {
    pub table: String,
    pub source: PathBuf,
    pub rows: i64,
    pub status: IngestStatus,
}

pub struct IngestManager {
    store: Arc<Store>,
    cache: Arc<SchemaCache>,
}

impl IngestManager {
    pub fn new(store: Arc<Store>, cache: Arc<SchemaCache>) -> Self {
        Self { store, cache }
    }

    /// Loads a single file, or every CSV/Parquet file directly inside a
    /// directory (in name order).
    pub async fn ingest_path(
        &self,
        path: &Path,
        mode: IngestMode,
    ) -> Result<Vec<IngestedTable>, IngestError> {
        let files = data_files(path)?;
        if files.is_empty() {
            warn!("No CSV or Parquet files found at {}", path.display());
            return Ok(Vec::new());
        }

        let conn = self.store.connect()?;
        let (loaded, failure) = tokio::task::spawn_blocking(move || {
            let mut loaded = Vec::with_capacity(files.len());
            for file in &files {
                match ingest_file(&conn, file, mode) {
                    Ok(table) => loaded.push(table),
                    Err(e) => return (loaded, Some(e)),
                }
            }
            (loaded, None)
        })
        .await
        .map_err(StoreError::from)?;

        // A failed file may have been written before it failed verification
        if failure.is_some() || loaded.iter().any(|t| t.status != IngestStatus::Skipped) {
            self.cache.invalidate().await;
        }

        match failure {
            Some(e) => {
                warn!(
                    "Ingestion of {} stopped after {} file(s): {}",
                    path.display(),
                    loaded.len(),
                    e
                );
                Err(e)
            }
            None => Ok(loaded),
        }
    }
}

fn ingestor_for(path: &Path) -> Result<Box<dyn FileIngestor>, IngestError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .ok_or_else(|| IngestError::UnsupportedFileType("No extension".to_string()))?;

    match extension.to_lowercase().as_str() {
        "csv" => Ok(Box::new(csv::CsvIngestor::new())),
        "parquet" => Ok(Box::new(parquet::ParquetIngestor::new())),
        other => Err(IngestError::UnsupportedFileType(other.to_string())),
    }
}

fn data_files(path: &Path) -> Result<Vec<PathBuf>, IngestError> {
    if !path.is_dir() {
        ingestor_for(path)?;
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let file = entry?.path();
        if file.is_file() && ingestor_for(&file).is_ok() {
            files.push(file);
        }
    }
    files.sort();
    Ok(files)
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, IngestError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'main' AND table_name = ?",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn count_rows(conn: &Connection, from: &str) -> Result<i64, IngestError> {
    let count = conn.query_row(&format!("SELECT COUNT(*) FROM {}", from), [], |row| row.get(0))?;
    Ok(count)
}

fn ingest_file(conn: &Connection, path: &Path, mode: IngestMode) -> Result<IngestedTable, IngestError> {
    let table = naming::table_name_for(path)
        .ok_or_else(|| IngestError::InvalidName(path.display().to_string()))?;
    let path = path.canonicalize()?;

    let exists = table_exists(conn, &table)?;
    if exists && mode == IngestMode::Skip {
        info!("Table '{}' already exists, skipping {}", table, path.display());
        return Ok(IngestedTable {
            rows: count_rows(conn, &quote_ident(&table))?,
            table,
            source: path,
            status: IngestStatus::Skipped,
        });
    }

    let select = ingestor_for(&path)?.select_sql(conn, &path)?;
    let expected = count_rows(conn, &format!("({})", select))?;

    let create_sql = format!("CREATE OR REPLACE TABLE {} AS {}", quote_ident(&table), select);
    info!("Loading {} into table '{}'", path.display(), table);
    conn.execute_batch(&create_sql)?;

    let actual = count_rows(conn, &quote_ident(&table))?;
    if actual != expected {
        return Err(IngestError::Verification {
            table,
            expected,
            actual,
        });
    }

    info!("Created table '{}' with {} rows", table, actual);
    Ok(IngestedTable {
        table,
        source: path,
        rows: actual,
        status: if exists {
            IngestStatus::Replaced
        } else {
            IngestStatus::Created
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn manager() -> (IngestManager, Arc<Store>, Arc<SchemaCache>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cache = Arc::new(SchemaCache::new(true));
        (
            IngestManager::new(Arc::clone(&store), Arc::clone(&cache)),
            store,
            cache,
        )
    }

    #[tokio::test]
    async fn loads_a_csv_file_into_a_named_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Exam Results.csv");
        fs::write(&path, "ID,Student Name,Score\n1,Ada,91.5\n2,Grace,88\n").unwrap();

        let (manager, store, _) = manager();
        let loaded = manager.ingest_path(&path, IngestMode::Skip).await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].table, "exam_results");
        assert_eq!(loaded[0].rows, 2);
        assert_eq!(loaded[0].status, IngestStatus::Created);

        let name: String = store
            .connect()
            .unwrap()
            .query_row(
                "SELECT student_name FROM exam_results WHERE id = 2",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(name, "Grace");
    }

    #[tokio::test]
    async fn existing_tables_are_skipped_unless_replacing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        fs::write(&path, "a\n1\n").unwrap();

        let (manager, _, _) = manager();
        manager.ingest_path(&path, IngestMode::Skip).await.unwrap();

        fs::write(&path, "a\n1\n2\n3\n").unwrap();
        let skipped = manager.ingest_path(&path, IngestMode::Skip).await.unwrap();
        assert_eq!(skipped[0].status, IngestStatus::Skipped);
        assert_eq!(skipped[0].rows, 1);

        let replaced = manager.ingest_path(&path, IngestMode::Replace).await.unwrap();
        assert_eq!(replaced[0].status, IngestStatus::Replaced);
        assert_eq!(replaced[0].rows, 3);
    }

    #[tokio::test]
    async fn directories_load_every_supported_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.csv"), "x\n1\n").unwrap();
        fs::write(dir.path().join("a.csv"), "y\n2\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let (manager, _, _) = manager();
        let loaded = manager.ingest_path(dir.path(), IngestMode::Skip).await.unwrap();

        let tables: Vec<&str> = loaded.iter().map(|t| t.table.as_str()).collect();
        assert_eq!(tables, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn loading_invalidates_the_schema_cache() {
        use crate::db::introspect::{DuckDbIntrospector, SchemaIntrospector};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.csv");
        fs::write(&path, "a\n1\n").unwrap();

        let (manager, store, cache) = manager();
        let introspector: Arc<dyn SchemaIntrospector> = Arc::new(DuckDbIntrospector::default());
        cache
            .get_or_refresh(&store.session().unwrap(), introspector)
            .await
            .unwrap();
        assert!(cache.cached().await.is_some());

        manager.ingest_path(&path, IngestMode::Skip).await.unwrap();
        assert!(cache.cached().await.is_none());
    }

    #[tokio::test]
    async fn partial_directory_loads_still_invalidate_the_cache() {
        use crate::db::introspect::{DuckDbIntrospector, SchemaIntrospector};

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "x\n1\n").unwrap();
        fs::write(dir.path().join("b.csv"), "").unwrap();

        let (manager, store, cache) = manager();
        let introspector: Arc<dyn SchemaIntrospector> = Arc::new(DuckDbIntrospector::default());
        let session = store.session().unwrap();
        cache
            .get_or_refresh(&session, Arc::clone(&introspector))
            .await
            .unwrap();

        let err = manager.ingest_path(dir.path(), IngestMode::Skip).await.unwrap_err();
        assert!(matches!(err, IngestError::NoColumns(_)), "{err}");
        assert!(cache.cached().await.is_none());

        let schema = cache.get_or_refresh(&session, introspector).await.unwrap();
        assert!(schema.table("a").is_some());
        assert!(schema.table("b").is_none());
    }

    #[tokio::test]
    async fn unsupported_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.xlsx");
        fs::write(&path, "").unwrap();

        let (manager, _, _) = manager();
        let err = manager.ingest_path(&path, IngestMode::Skip).await.unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFileType(ext) if ext == "xlsx"));
    }
}
