use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::db::executor::{fetch_rows, DuckDbExecutor, ExecutionResult, QueryExecutor};
use crate::db::introspect::{DuckDbIntrospector, SchemaIntrospector};
use crate::db::rows::RowMap;
use crate::db::schema::SchemaSnapshot;
use crate::db::schema_cache::SchemaCache;
use crate::db::store::{quote_ident, Store, StoreError};
use crate::engine::synthesizer::AnswerSynthesizer;
use crate::engine::translator::{QueryTranslator, TranslationResult};
use crate::error::PipelineError;
use crate::llm::{GenerationSettings, LanguageModel};

pub const SYNTHESIS_FAILED_MESSAGE: &str =
    "An answer could not be written for this question right now. The query and its results are included; please try again.";

/// Where a request is in the pipeline. Only used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Introspecting,
    Translating,
    OutOfDomain,
    Executing,
    Synthesizing,
    Done,
}

/// How a request ended. Fatal errors never reach an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Answered,
    OutOfDomain,
    ExecutionFailed { message: String },
    SynthesisFailed { message: String },
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Answered => "answered",
            Outcome::OutOfDomain => "out_of_domain",
            Outcome::ExecutionFailed { .. } => "execution_failed",
            Outcome::SynthesisFailed { .. } => "synthesis_failed",
        }
    }
}

/// The result of one question. Only the first three fields are part of the
/// serialized form.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerEnvelope {
    pub generative_result: String,
    pub sql: String,
    pub sql_result: Vec<RowMap>,
    #[serde(skip)]
    pub outcome: Outcome,
    #[serde(skip)]
    pub translation: TranslationResult,
}

impl AnswerEnvelope {
    fn out_of_domain(translation: TranslationResult) -> Self {
        let mut message = translation.out_of_domain_message.clone();
        if !translation.recommended_next_questions.is_empty() {
            message.push_str("\n\nHere are some recommended questions:\n\n");
            for (i, question) in translation.recommended_next_questions.iter().enumerate() {
                let _ = writeln!(message, "{}. {}", i + 1, question);
            }
        }

        Self {
            generative_result: message,
            sql: String::new(),
            sql_result: Vec::new(),
            outcome: Outcome::OutOfDomain,
            translation,
        }
    }

    fn execution_failed(translation: TranslationResult, message: String) -> Self {
        Self {
            generative_result: format!("The generated query could not be executed: {}", message),
            sql: translation.sql.clone(),
            sql_result: Vec::new(),
            outcome: Outcome::ExecutionFailed { message },
            translation,
        }
    }

    fn answered(translation: TranslationResult, rows: Vec<RowMap>, answer: String) -> Self {
        Self {
            generative_result: answer,
            sql: translation.sql.clone(),
            sql_result: rows,
            outcome: Outcome::Answered,
            translation,
        }
    }

    fn synthesis_failed(translation: TranslationResult, rows: Vec<RowMap>, message: String) -> Self {
        Self {
            generative_result: SYNTHESIS_FAILED_MESSAGE.to_string(),
            sql: translation.sql.clone(),
            sql_result: rows,
            outcome: Outcome::SynthesisFailed { message },
            translation,
        }
    }
}

/// A bounded slice of one table, for browsing.
#[derive(Debug, Clone, Serialize)]
pub struct TablePage {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<RowMap>,
    pub limit: usize,
}

/// Question in, [`AnswerEnvelope`] out.
///
/// Every call acquires its own database session and drops it before
/// returning, whatever the outcome. The schema cache is the only state shared
/// between calls.
pub struct Pipeline {
    store: Arc<Store>,
    cache: Arc<SchemaCache>,
    introspector: Arc<dyn SchemaIntrospector>,
    translator: QueryTranslator,
    executor: Arc<dyn QueryExecutor>,
    synthesizer: AnswerSynthesizer,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<SchemaCache>,
        introspector: Arc<dyn SchemaIntrospector>,
        translator: QueryTranslator,
        executor: Arc<dyn QueryExecutor>,
        synthesizer: AnswerSynthesizer,
    ) -> Self {
        Self {
            store,
            cache,
            introspector,
            translator,
            executor,
            synthesizer,
        }
    }

    /// Wires the DuckDB collaborators and `model` the way `config` asks.
    pub fn from_config(
        store: Arc<Store>,
        cache: Arc<SchemaCache>,
        model: Arc<dyn LanguageModel>,
        config: &AppConfig,
    ) -> Self {
        let settings = GenerationSettings {
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        };

        Self::new(
            store,
            cache,
            Arc::new(DuckDbIntrospector::new(config.database.sample_rows)),
            QueryTranslator::new(Arc::clone(&model))
                .with_settings(settings)
                .with_context_limit(config.llm.context_limit_tokens),
            Arc::new(DuckDbExecutor::new(config.database.query_policy)),
            AnswerSynthesizer::new(model).with_settings(settings),
        )
    }

    pub async fn ask(&self, question: &str) -> Result<AnswerEnvelope, PipelineError> {
        let start_time = Instant::now();
        let question = question.trim();
        info!("Processing question: {}", question);

        debug!(stage = ?Stage::Introspecting, "pipeline stage");
        let session = self.store.session()?;
        let schema = self
            .cache
            .get_or_refresh(&session, Arc::clone(&self.introspector))
            .await?;

        debug!(stage = ?Stage::Translating, tables = schema.tables.len(), "pipeline stage");
        let translation = self.translator.translate(question, &schema).await?;

        if translation.out_of_domain {
            debug!(stage = ?Stage::OutOfDomain, "pipeline stage");
            info!("Question is out of domain");
            return Ok(AnswerEnvelope::out_of_domain(translation));
        }

        debug!(stage = ?Stage::Executing, "pipeline stage");
        let executor = Arc::clone(&self.executor);
        let sql = translation.sql.clone();
        let result = session
            .run(move |conn| Ok(executor.execute(conn, &sql)))
            .await?;
        drop(session);

        let rows = match result {
            ExecutionResult::Rows(rows) => rows,
            ExecutionResult::Failed(e) => {
                info!("Generated query failed after {}ms", start_time.elapsed().as_millis());
                return Ok(AnswerEnvelope::execution_failed(translation, e.message));
            }
        };

        debug!(stage = ?Stage::Synthesizing, rows = rows.len(), "pipeline stage");
        let envelope = match self.synthesizer.synthesize(question, &rows).await {
            Ok(answer) => AnswerEnvelope::answered(translation, rows, answer),
            Err(e) => {
                warn!("Answer synthesis failed: {}", e);
                AnswerEnvelope::synthesis_failed(translation, rows, e.to_string())
            }
        };

        debug!(stage = ?Stage::Done, "pipeline stage");
        info!(
            "Question answered in {}ms ({} rows)",
            start_time.elapsed().as_millis(),
            envelope.sql_result.len()
        );
        Ok(envelope)
    }

    /// The current schema, introspecting if nothing is cached.
    pub async fn schema(&self) -> Result<Arc<SchemaSnapshot>, StoreError> {
        let session = self.store.session()?;
        self.cache
            .get_or_refresh(&session, Arc::clone(&self.introspector))
            .await
    }

    pub async fn refresh_schema(&self) -> Result<Arc<SchemaSnapshot>, StoreError> {
        let session = self.store.session()?;
        self.cache
            .refresh(&session, Arc::clone(&self.introspector))
            .await
    }

    pub async fn invalidate_schema(&self) {
        self.cache.invalidate().await;
    }

    /// Up to `limit` rows of `table`, or `None` when no such table exists.
    pub async fn table_page(&self, table: &str, limit: usize) -> Result<Option<TablePage>, StoreError> {
        let schema = self.schema().await?;
        let Some(info) = schema.table(table) else {
            return Ok(None);
        };
        let columns = info.columns.iter().map(|c| c.name.clone()).collect();

        let sql = format!("SELECT * FROM {} LIMIT {}", quote_ident(table), limit);
        let rows = self
            .store
            .session()?
            .run(move |conn| Ok(fetch_rows(conn, &sql)?))
            .await?;

        Ok(Some(TablePage {
            table: table.to_string(),
            columns,
            rows,
            limit,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translation(out_of_domain: bool, questions: &[&str]) -> TranslationResult {
        TranslationResult {
            out_of_domain,
            out_of_domain_message: if out_of_domain {
                "That question is not about this data.".to_string()
            } else {
                String::new()
            },
            query_cleaning: String::new(),
            query_expansion: String::new(),
            recommended_next_questions: questions.iter().map(|q| q.to_string()).collect(),
            sql: if out_of_domain {
                String::new()
            } else {
                "SELECT 1".to_string()
            },
        }
    }

    #[test]
    fn out_of_domain_message_lists_recommendations() {
        let envelope = AnswerEnvelope::out_of_domain(translation(
            true,
            &["What is the average score?", "Who scored highest?"],
        ));

        assert_eq!(
            envelope.generative_result,
            "That question is not about this data.\n\nHere are some recommended questions:\n\n\
             1. What is the average score?\n2. Who scored highest?\n"
        );
        assert_eq!(envelope.sql, "");
        assert!(envelope.sql_result.is_empty());
        assert_eq!(envelope.outcome, Outcome::OutOfDomain);
    }

    #[test]
    fn out_of_domain_without_recommendations_is_just_the_message() {
        let envelope = AnswerEnvelope::out_of_domain(translation(true, &[]));
        assert_eq!(envelope.generative_result, "That question is not about this data.");
    }

    #[test]
    fn execution_failures_keep_the_sql() {
        let envelope =
            AnswerEnvelope::execution_failed(translation(false, &[]), "no such column".to_string());

        assert_eq!(envelope.sql, "SELECT 1");
        assert!(envelope.generative_result.contains("no such column"));
        assert!(envelope.sql_result.is_empty());
        assert!(matches!(envelope.outcome, Outcome::ExecutionFailed { .. }));
    }

    #[test]
    fn only_the_three_public_fields_serialize() {
        let envelope = AnswerEnvelope::answered(translation(false, &[]), vec![], "42".to_string());
        let value = serde_json::to_value(&envelope).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["generative_result", "sql", "sql_result"]);
    }
}
