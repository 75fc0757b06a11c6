use duckdb::Connection;
use std::path::Path;
use tracing::debug;

use crate::db::store::quote_literal;
use crate::ingest::naming::column_names;
use crate::ingest::{FileIngestor, IngestError};

/// Comma-separated files with a header row.
///
/// The header is read with the `csv` crate so the names can be normalized;
/// DuckDB infers the column types.
pub struct CsvIngestor {
    sample_size: i64,
}

impl CsvIngestor {
    pub fn new() -> Self {
        Self {
            sample_size: -1, // whole file
        }
    }

    pub fn with_sample_size(sample_size: i64) -> Self {
        Self { sample_size }
    }
}

impl Default for CsvIngestor {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIngestor for CsvIngestor {
    fn select_sql(&self, _conn: &Connection, path: &Path) -> Result<String, IngestError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)?;
        let headers = reader.headers()?.clone();

        if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
            return Err(IngestError::NoColumns(path.display().to_string()));
        }

        let names = column_names(headers.iter())
            .iter()
            .map(|n| quote_literal(n))
            .collect::<Vec<_>>()
            .join(", ");
        debug!("CSV columns for {}: [{}]", path.display(), names);

        Ok(format!(
            "SELECT * FROM read_csv_auto({}, header = true, delim = ',', sample_size = {}, names = [{}])",
            quote_literal(&path.to_string_lossy()),
            self.sample_size,
            names
        ))
    }
}
