use duckdb::Connection;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

use crate::db::rows::{to_json, unique_column_names, RowMap};
use crate::db::statement::{leading_verb, split_statements};

/// Leading verbs accepted under [`QueryPolicy::ReadOnly`].
pub const READ_ONLY_VERBS: &[&str] = &[
    "SELECT", "WITH", "VALUES", "FROM", "TABLE", "SHOW", "DESCRIBE", "SUMMARIZE", "EXPLAIN",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPolicy {
    ReadOnly,
    AllowMutations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionError {
    pub message: String,
}

/// Rows or a failure, never both. An empty `Rows` is a successful outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Rows(Vec<RowMap>),
    Failed(ExecutionError),
}

impl ExecutionResult {
    fn failed(message: impl Into<String>) -> Self {
        ExecutionResult::Failed(ExecutionError {
            message: message.into(),
        })
    }
}

pub trait QueryExecutor: Send + Sync {
    /// Runs exactly `sql`; engine failures come back as [`ExecutionResult::Failed`].
    fn execute(&self, conn: &Connection, sql: &str) -> ExecutionResult;
}

pub struct DuckDbExecutor {
    policy: QueryPolicy,
}

impl DuckDbExecutor {
    pub fn new(policy: QueryPolicy) -> Self {
        Self { policy }
    }

    fn check_policy(&self, sql: &str) -> Result<(), String> {
        // DuckDB runs every statement before the last one when preparing
        let statements = split_statements(sql).len();
        if statements > 1 {
            return Err(format!(
                "Expected a single statement, found {}; nothing was run",
                statements
            ));
        }

        if self.policy == QueryPolicy::AllowMutations {
            return Ok(());
        }

        match leading_verb(sql) {
            Some(verb) if READ_ONLY_VERBS.contains(&verb.as_str()) => Ok(()),
            Some(verb) => Err(format!(
                "Statements starting with {} are not permitted; only read-only queries may run",
                verb
            )),
            None => Err("The statement is empty".to_string()),
        }
    }
}

/// Runs `sql` with no policy check and collects every row as a [`RowMap`].
pub fn fetch_rows(conn: &Connection, sql: &str) -> Result<Vec<RowMap>, duckdb::Error> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let columns = unique_column_names(
        rows.as_ref()
            .map(|s| s.column_names().into_iter().map(|n| n.to_string()).collect())
            .unwrap_or_default(),
    );

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = RowMap::new();
        for (i, name) in columns.iter().enumerate() {
            map.insert(name.clone(), to_json(row.get(i)?));
        }
        out.push(map);
    }
    Ok(out)
}

impl Default for DuckDbExecutor {
    fn default() -> Self {
        Self::new(QueryPolicy::ReadOnly)
    }
}

impl QueryExecutor for DuckDbExecutor {
    fn execute(&self, conn: &Connection, sql: &str) -> ExecutionResult {
        if let Err(message) = self.check_policy(sql) {
            warn!("Rejected generated statement: {}", message);
            return ExecutionResult::failed(message);
        }

        let start_time = Instant::now();
        match fetch_rows(conn, sql) {
            Ok(rows) => {
                info!(
                    "Query executed successfully. Row count: {}, Execution time: {}ms",
                    rows.len(),
                    start_time.elapsed().as_millis()
                );
                ExecutionResult::Rows(rows)
            }
            Err(e) => {
                warn!("Query execution failed: {}", e);
                ExecutionResult::failed(e.to_string())
            }
        }
    }
}
