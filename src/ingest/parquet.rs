use duckdb::Connection;
use std::path::Path;

use crate::db::store::{quote_ident, quote_literal};
use crate::ingest::naming::column_names;
use crate::ingest::{FileIngestor, IngestError};

pub struct ParquetIngestor;

impl ParquetIngestor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ParquetIngestor {
    fn default() -> Self {
        Self::new()
    }
}

impl FileIngestor for ParquetIngestor {
    fn select_sql(&self, conn: &Connection, path: &Path) -> Result<String, IngestError> {
        let source = format!("read_parquet({})", quote_literal(&path.to_string_lossy()));

        // Column names as stored in the file
        let mut stmt = conn.prepare(&format!("DESCRIBE SELECT * FROM {}", source))?;
        let originals = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        if originals.is_empty() {
            return Err(IngestError::NoColumns(path.display().to_string()));
        }

        let renamed = column_names(originals.iter().map(String::as_str));
        let projection = originals
            .iter()
            .zip(&renamed)
            .map(|(from, to)| format!("{} AS {}", quote_ident(from), quote_ident(to)))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(format!("SELECT {} FROM {}", projection, source))
    }
}
