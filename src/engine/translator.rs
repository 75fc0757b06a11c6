use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

use crate::db::schema::SchemaSnapshot;
use crate::db::statement::split_statements;
use crate::error::TranslationError;
use crate::llm::{GenerationSettings, LanguageModel};

pub const TRANSLATION_SYSTEM_PROMPT: &str = "You are a helpful research assistant and a SQL expert for DuckDB databases. Respond ONLY with a valid JSON object containing the specified keys and values, without any additional text, code blocks, or formatting.";

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```(\w+)?").unwrap());

/// The model's structured reading of a question.
///
/// `sql` is empty exactly when `out_of_domain` is true, and otherwise holds a
/// single statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslationResult {
    pub out_of_domain: bool,
    pub out_of_domain_message: String,
    pub query_cleaning: String,
    pub query_expansion: String,
    pub recommended_next_questions: Vec<String>,
    pub sql: String,
}

pub struct QueryTranslator {
    model: Arc<dyn LanguageModel>,
    settings: GenerationSettings,
    context_limit_tokens: u32,
}

impl QueryTranslator {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            settings: GenerationSettings::default(),
            context_limit_tokens: 128_000,
        }
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_context_limit(mut self, tokens: u32) -> Self {
        self.context_limit_tokens = tokens;
        self
    }

    pub async fn translate(
        &self,
        question: &str,
        schema: &SchemaSnapshot,
    ) -> Result<TranslationResult, TranslationError> {
        let prompt = self.build_prompt(question, schema);
        debug!("Prepared translation prompt ({} chars)", prompt.len());

        let request = self.settings.request(TRANSLATION_SYSTEM_PROMPT, prompt);
        let raw = self
            .model
            .complete(&request)
            .await
            .map_err(TranslationError::Unavailable)?;

        match parse_translation(&raw) {
            Ok(result) => {
                info!(
                    "Translated question (out_of_domain: {}, sql: {})",
                    result.out_of_domain, result.sql
                );
                Ok(result)
            }
            Err(e) => {
                warn!("Discarding malformed translation: {}\nRaw response: {}", e, raw);
                Err(e)
            }
        }
    }

    pub fn build_prompt(&self, question: &str, schema: &SchemaSnapshot) -> String {
        format!(
            r#"You are a DuckDB expert tasked with returning a SQL query based on a user's natural language question, the data schema, and a few example rows of the data.

The data schema is as follows:

{schema}

The user's question is: {question}

The question will be run against a DuckDB database.

CONTEXTUAL INSTRUCTIONS:
- Understand the context of the request to ensure the SQL query correctly identifies and filters for the relevant entities.
- Be mindful of pronouns and ambiguous terms, ensuring they are mapped to the correct entities and columns.

SQL INSTRUCTIONS:
- It is critical not to use parameterized queries. Write every literal value directly into the statement.
- Don't use placeholder symbols such as '?' or ':name'. For example, never write 'WHERE LOWER(track_name) LIKE ?'.
- Don't make up any new columns, only use the tables and columns listed in the schema above.
- When doing computation, round to two decimal places. For example, 12.54321 should be 12.54. Prefer floats over integers.
- Don't use '=' to compare strings. Use case-insensitive 'LIKE' comparisons instead, for example 'WHERE LOWER(pi_name) LIKE '%john%smith%''.
- Use the 'IN' operator for multiple fixed values instead of multiple 'LIKE' clauses.
- Include wildcard placeholders to accommodate variations in data spacing, for example 'WHERE LOWER(pi_name) LIKE '%john%smith%'' for 'John Smith'.
- In long string comparisons involving multiple keywords, use 'OR' across the non-stop-words, for example 'WHERE LOWER(text) LIKE '%gps%' OR LOWER(text) LIKE '%navigation%''.
- Aim to return comprehensive and relevant information by defaulting to broader, lowercase comparisons.
- When filtering on date columns, format the dates as 'YYYY-MM-DD HH:MM:SS' and account for leap years and other date edge cases.
- Return only the necessary data. Use 'DISTINCT', 'WHERE', 'GROUP BY', 'ORDER BY', 'LIMIT' and 'JOIN' to refine what comes back.
- The answer will be written by a language model with a maximum context length of {limit} tokens. Make sure the query cannot return enough rows to exceed it.
- Only generate a single SQL statement.
- Consider DuckDB's specific syntax and functions, as all queries will run on a DuckDB database.

LLM RESPONSE INSTRUCTIONS:
- First determine if the user's question is out of domain (i.e., unrelated to the content of the database).
- If the question is out of domain, return these keys:
    "out_of_domain": true,
    "out_of_domain_message": "A message indicating that the question is out of domain.",
    "query_cleaning": "Cleaned version of the user's question, removing any extraneous or irrelevant parts.",
    "query_expansion": "Expanded version of the question, including any inferred or related details.",
    "recommended_next_questions": ["A few relevant questions that show the kind of questions the database can answer."],
    "sql": ""
- If the question is in domain, return these keys:
    "out_of_domain": false,
    "out_of_domain_message": "",
    "query_cleaning": "Cleaned version of the user's question, removing any extraneous or irrelevant parts.",
    "query_expansion": "Expanded version of the question, including any inferred or related details.",
    "recommended_next_questions": ["Suggested follow-up questions based on the user's current question."],
    "sql": "Your SQL query here."
- Return exactly these six keys as a single JSON object and nothing else.
- Use the JSON literals true and false for booleans and double quotes for every string. Do not wrap the object in code fences.
"#,
            schema = schema.render_for_prompt(),
            question = question,
            limit = self.context_limit_tokens,
        )
    }
}

/// Parses model output into a [`TranslationResult`], rejecting anything that
/// does not hold the six expected keys or breaks the sql/out-of-domain pairing.
pub fn parse_translation(raw: &str) -> Result<TranslationResult, TranslationError> {
    let malformed = |reason: String| TranslationError::Malformed {
        reason,
        raw: raw.to_string(),
    };

    let unfenced = CODE_FENCE.replace_all(raw.trim(), "");
    let object = extract_object(&unfenced)
        .ok_or_else(|| malformed("no JSON object found in the response".to_string()))?;
    let normalized = normalize_booleans(object);

    let mut result: TranslationResult =
        serde_json::from_str(&normalized).map_err(|e| malformed(e.to_string()))?;
    result.sql = result.sql.trim().to_string();

    if result.out_of_domain {
        if !result.sql.is_empty() {
            return Err(malformed(
                "out-of-domain translation carries a SQL statement".to_string(),
            ));
        }
        if result.recommended_next_questions.is_empty() {
            warn!("Out-of-domain translation came back without recommended questions");
        }
    } else {
        if result.sql.is_empty() {
            return Err(malformed("in-domain translation has no SQL".to_string()));
        }
        let statements = split_statements(&result.sql).len();
        if statements != 1 {
            return Err(malformed(format!(
                "expected a single SQL statement, found {}",
                statements
            )));
        }
    }

    Ok(result)
}

fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Rewrites Python-style `True`/`False` outside of string literals.
fn normalize_booleans(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut chars = json.char_indices().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some((i, c)) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '"' {
            in_string = true;
            out.push(c);
        } else if c.is_ascii_alphabetic() {
            let mut end = i + c.len_utf8();
            while let Some(&(j, next)) = chars.peek() {
                if !next.is_ascii_alphanumeric() {
                    break;
                }
                end = j + next.len_utf8();
                chars.next();
            }
            match &json[i..end] {
                "True" => out.push_str("true"),
                "False" => out.push_str("false"),
                word => out.push_str(word),
            }
        } else {
            out.push(c);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{ColumnInfo, TableInfo};
    use crate::llm::{CompletionRequest, LlmError};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct CannedModel {
        reply: Result<String, String>,
        seen: Mutex<Vec<CompletionRequest>>,
    }

    impl CannedModel {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for CannedModel {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply.clone().map_err(LlmError::ConnectionError)
        }
    }

    fn schema() -> SchemaSnapshot {
        let mut tables = BTreeMap::new();
        tables.insert(
            "results".to_string(),
            TableInfo {
                columns: vec![ColumnInfo {
                    name: "score".to_string(),
                    declared_type: "DOUBLE".to_string(),
                    is_primary_key: false,
                }],
                constraints: vec![],
                sample_rows: vec![],
            },
        );
        SchemaSnapshot::new(tables)
    }

    const IN_DOMAIN: &str = r#"{"out_of_domain": false, "out_of_domain_message": "", "query_cleaning": "average score", "query_expansion": "mean of score across results", "recommended_next_questions": ["What is the max score?"], "sql": "SELECT AVG(score) FROM results;"}"#;

    #[test]
    fn parses_a_plain_object() {
        let result = parse_translation(IN_DOMAIN).unwrap();
        assert!(!result.out_of_domain);
        assert_eq!(result.sql, "SELECT AVG(score) FROM results;");
        assert_eq!(result.recommended_next_questions.len(), 1);
    }

    #[test]
    fn strips_code_fences_and_surrounding_text() {
        let raw = format!("Here you go:\n```json\n{}\n```", IN_DOMAIN);
        assert_eq!(parse_translation(&raw).unwrap(), parse_translation(IN_DOMAIN).unwrap());
    }

    #[test]
    fn accepts_python_booleans_outside_strings_only() {
        let raw = r#"{"out_of_domain": True, "out_of_domain_message": "True crime is not covered", "query_cleaning": "", "query_expansion": "", "recommended_next_questions": ["Is it False that scores rose?"], "sql": ""}"#;
        let result = parse_translation(raw).unwrap();

        assert!(result.out_of_domain);
        assert_eq!(result.out_of_domain_message, "True crime is not covered");
        assert_eq!(result.recommended_next_questions[0], "Is it False that scores rose?");
    }

    #[test]
    fn rejects_non_json() {
        let err = parse_translation("I'm sorry, I can't help with that.").unwrap_err();
        assert!(matches!(err, TranslationError::Malformed { .. }));
    }

    #[test]
    fn rejects_missing_and_extra_keys() {
        let missing = r#"{"out_of_domain": false, "sql": "SELECT 1"}"#;
        assert!(parse_translation(missing).is_err());

        let extra = IN_DOMAIN.replace("\"sql\"", "\"explanation\": \"x\", \"sql\"");
        assert!(parse_translation(&extra).is_err());
    }

    #[test]
    fn rejects_mismatched_sql_and_domain_flag() {
        let ood_with_sql = IN_DOMAIN.replace("\"out_of_domain\": false", "\"out_of_domain\": true");
        assert!(parse_translation(&ood_with_sql).is_err());

        let in_domain_without_sql = IN_DOMAIN.replace("SELECT AVG(score) FROM results;", "  ");
        assert!(parse_translation(&in_domain_without_sql).is_err());
    }

    #[test]
    fn rejects_multiple_statements() {
        let raw = IN_DOMAIN.replace(
            "SELECT AVG(score) FROM results;",
            "SELECT 1; DROP TABLE results;",
        );
        match parse_translation(&raw) {
            Err(TranslationError::Malformed { reason, raw: kept }) => {
                assert!(reason.contains("single"));
                assert!(kept.contains("DROP TABLE"));
            }
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn semicolons_inside_literals_are_one_statement() {
        let raw = IN_DOMAIN.replace(
            "SELECT AVG(score) FROM results;",
            "SELECT * FROM results WHERE LOWER(name) LIKE '%a;b%'",
        );
        assert!(parse_translation(&raw).is_ok());
    }

    #[tokio::test]
    async fn prompt_carries_schema_question_and_settings() {
        let model = CannedModel::replying(IN_DOMAIN);
        let translator = QueryTranslator::new(model.clone())
            .with_settings(GenerationSettings {
                temperature: 0.0,
                max_tokens: 256,
            })
            .with_context_limit(32_000);

        translator.translate("What is the average score?", &schema()).await.unwrap();

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].system, TRANSLATION_SYSTEM_PROMPT);
        assert_eq!(seen[0].max_tokens, 256);
        assert!(seen[0].prompt.contains("### Table: results"));
        assert!(seen[0].prompt.contains("What is the average score?"));
        assert!(seen[0].prompt.contains("32000 tokens"));
    }

    #[test]
    fn prompt_asks_for_loose_string_matching() {
        let prompt = QueryTranslator::new(CannedModel::replying(IN_DOMAIN))
            .build_prompt("Who is John Smith?", &schema());

        assert!(prompt.contains("Include wildcard placeholders to accommodate variations in data spacing"));
        assert!(prompt.contains("defaulting to broader, lowercase comparisons"));
        assert!(prompt.contains("Only generate a single SQL statement."));
    }

    #[tokio::test]
    async fn model_failures_are_unavailable() {
        let model = Arc::new(CannedModel {
            reply: Err("timed out".to_string()),
            seen: Mutex::new(Vec::new()),
        });
        let err = QueryTranslator::new(model)
            .translate("anything", &schema())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::Unavailable(_)));
    }
}
