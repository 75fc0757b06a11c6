use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintInfo {
    UniqueIndex {
        name: Option<String>,
        columns: Vec<String>,
    },
    ForeignKey {
        columns: Vec<String>,
        referenced_table: String,
        referenced_columns: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub columns: Vec<ColumnInfo>,
    pub constraints: Vec<ConstraintInfo>,
    /// Row tuples in the store's natural order, in column order.
    pub sample_rows: Vec<Vec<Value>>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Point-in-time structure of the store. Never patched; rebuilt on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableInfo>,
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

impl SchemaSnapshot {
    pub fn new(tables: BTreeMap<String, TableInfo>) -> Self {
        Self {
            tables,
            taken_at: chrono::Utc::now(),
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Markdown description of every table for the translation prompt.
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::from("# DATABASE SCHEMA\n\n");

        if self.tables.is_empty() {
            out.push_str("No tables found in this database.\n");
            return out;
        }

        for (name, table) in &self.tables {
            let _ = writeln!(out, "### Table: {}\n", name);

            if table.columns.is_empty() {
                out.push_str("Table has no columns.\n\n");
                continue;
            }

            out.push_str("| Column Name | Data Type | Primary Key |\n");
            out.push_str("|------------|-----------|-------------|\n");
            for column in &table.columns {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} |",
                    column.name,
                    column.declared_type,
                    if column.is_primary_key { "YES" } else { "NO" }
                );
            }
            out.push('\n');

            if !table.constraints.is_empty() {
                out.push_str("#### Constraints:\n\n");
                for constraint in &table.constraints {
                    let _ = writeln!(out, "- {}", describe_constraint(constraint));
                }
                out.push('\n');
            }

            out.push_str("#### Sample Data:\n\n");
            if table.sample_rows.is_empty() {
                out.push_str("(no rows)\n\n");
                continue;
            }

            out.push_str("| ");
            for column in &table.columns {
                let _ = write!(out, "{} | ", column.name);
            }
            out.push_str("\n| ");
            for _ in &table.columns {
                out.push_str("--- | ");
            }
            out.push('\n');

            for row in &table.sample_rows {
                out.push_str("| ");
                for value in row {
                    let _ = write!(out, "{} | ", display_cell(value));
                }
                out.push('\n');
            }
            out.push('\n');
        }

        out
    }
}

fn describe_constraint(constraint: &ConstraintInfo) -> String {
    match constraint {
        ConstraintInfo::UniqueIndex { name, columns } => match name {
            Some(name) => format!("UNIQUE ({}) via index {}", columns.join(", "), name),
            None => format!("UNIQUE ({})", columns.join(", ")),
        },
        ConstraintInfo::ForeignKey {
            columns,
            referenced_table,
            referenced_columns,
        } => format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            columns.join(", "),
            referenced_table,
            referenced_columns.join(", ")
        ),
    }
}

fn display_cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
