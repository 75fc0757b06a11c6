use duckdb::Connection;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: duckdb::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("database connection lock poisoned")]
    Poisoned,

    #[error("database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// The DuckDB database instance every request connects to.
///
/// Holds one root connection only to keep the instance alive; each pipeline
/// invocation gets its own connection cloned from it via [`Store::session`],
/// released when the [`Session`] is dropped.
pub struct Store {
    path: String,
    root: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|source| StoreError::Open {
            path: path.to_string(),
            source,
        })?;

        info!("Opened DuckDB database at {}", path);
        Ok(Self {
            path: path.to_string(),
            root: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// A fresh connection to the same database instance.
    pub fn connect(&self) -> Result<Connection, StoreError> {
        let root = self.root.lock().map_err(|_| StoreError::Poisoned)?;
        let conn = root.try_clone()?;
        Ok(conn)
    }

    pub fn session(&self) -> Result<Session, StoreError> {
        let conn = self.connect()?;
        is_valid(&conn)?;
        debug!("Acquired session connection to {}", self.path);
        Ok(Session {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn is_valid(conn: &Connection) -> Result<(), StoreError> {
    conn.execute("SELECT 1", [])?;
    Ok(())
}

/// One connection, scoped to a single pipeline invocation.
#[derive(Clone)]
pub struct Session {
    conn: Arc<Mutex<Connection>>,
}

impl Session {
    /// Runs blocking database work on the session connection.
    pub async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await?
    }
}

/// Quotes an identifier for DuckDB, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal for DuckDB, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
