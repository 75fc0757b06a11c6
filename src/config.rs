use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::db::executor::QueryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// DuckDB file, or `:memory:`
    pub path: String,
    pub sample_rows: usize,
    pub query_policy: QueryPolicy,
    pub cache_schema: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote" or "ollama"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub context_limit_tokens: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub data_dir: String,
    pub log_format: LogFormat,
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory for uploaded files
    #[arg(long)]
    pub data_dir: Option<String>,

    /// DuckDB database file to query
    #[arg(short, long, value_name = "FILE")]
    pub database: Option<String>,

    /// Load a CSV/Parquet file or directory before starting (repeatable)
    #[arg(long, value_name = "PATH")]
    pub ingest: Vec<PathBuf>,

    /// Answer a single question, print the result as JSON and exit
    #[arg(long, value_name = "QUESTION")]
    pub ask: Option<String>,
}

const ENV_PREFIX: &str = "NL_SQL";

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Self::with_defaults(Config::builder())?;

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/nl-sql/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        // NL_SQL__LLM__API_KEY, NL_SQL__WEB__PORT, ...
        config_builder = config_builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        if config.llm.api_key.is_none() {
            config.llm.api_key = std::env::var("OPENAI_API_KEY").ok();
        }

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(database) = &args.database {
            config.database.path = database.clone();
        }

        Ok(config)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let defaults = AppConfig::default();
        builder
            .set_default("database.path", defaults.database.path)?
            .set_default("database.sample_rows", defaults.database.sample_rows as u64)?
            .set_default("database.query_policy", "read_only")?
            .set_default("database.cache_schema", defaults.database.cache_schema)?
            .set_default("web.host", defaults.web.host)?
            .set_default("web.port", defaults.web.port as u64)?
            .set_default("web.max_upload_bytes", defaults.web.max_upload_bytes as u64)?
            .set_default("llm.backend", defaults.llm.backend)?
            .set_default("llm.model", defaults.llm.model)?
            .set_default("llm.temperature", defaults.llm.temperature as f64)?
            .set_default("llm.max_tokens", defaults.llm.max_tokens as u64)?
            .set_default("llm.timeout_secs", defaults.llm.timeout_secs)?
            .set_default(
                "llm.context_limit_tokens",
                defaults.llm.context_limit_tokens as u64,
            )?
            .set_default("data_dir", defaults.data_dir)?
            .set_default("log_format", "pretty")
    }
}

// Default implementation
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: "nl-sql.duckdb".to_string(),
                sample_rows: 5,
                query_policy: QueryPolicy::ReadOnly,
                cache_schema: true,
            },
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                max_upload_bytes: 256 * 1024 * 1024,
            },
            llm: LlmConfig {
                backend: "remote".to_string(),
                model: "gpt-4o".to_string(),
                api_key: None,
                api_url: None,
                temperature: 0.0,
                max_tokens: 1024,
                timeout_secs: 60,
                context_limit_tokens: 128_000,
            },
            data_dir: "data".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_a_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        std::fs::File::create(&path).unwrap();

        let args = CliArgs {
            config: Some(path),
            ..CliArgs::default()
        };
        let config = AppConfig::new(&args).unwrap();

        assert_eq!(config.database.sample_rows, 5);
        assert_eq!(config.database.query_policy, QueryPolicy::ReadOnly);
        assert_eq!(config.llm.max_tokens, 1024);
        assert_eq!(config.llm.temperature, 0.0);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn file_values_and_cli_overrides_are_layered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_format = "json"

[database]
path = "sales.duckdb"
query_policy = "allow_mutations"

[llm]
backend = "ollama"
model = "qwen2.5-coder"

[web]
port = 8080
"#
        )
        .unwrap();

        let args = CliArgs {
            config: Some(path),
            port: Some(9090),
            database: Some("other.duckdb".to_string()),
            ..CliArgs::default()
        };
        let config = AppConfig::new(&args).unwrap();

        assert_eq!(config.database.path, "other.duckdb");
        assert_eq!(config.database.query_policy, QueryPolicy::AllowMutations);
        assert_eq!(config.llm.backend, "ollama");
        assert_eq!(config.llm.model, "qwen2.5-coder");
        assert_eq!(config.web.port, 9090);
        assert_eq!(config.web.host, "127.0.0.1");
        assert_eq!(config.log_format, LogFormat::Json);
    }
}
