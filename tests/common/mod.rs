#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use nl_sql::config::AppConfig;
use nl_sql::db::schema_cache::SchemaCache;
use nl_sql::db::store::Store;
use nl_sql::engine::Pipeline;
use nl_sql::llm::{CompletionRequest, LanguageModel, LlmError};

/// Replies with queued responses in order and records every request.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(LlmError::ConnectionError(message)),
            None => Err(LlmError::ResponseError("script exhausted".to_string())),
        }
    }
}

pub fn in_domain(sql: &str) -> Result<String, String> {
    Ok(serde_json::json!({
        "out_of_domain": false,
        "out_of_domain_message": "",
        "query_cleaning": "cleaned",
        "query_expansion": "expanded",
        "recommended_next_questions": ["Which name has the highest score?"],
        "sql": sql,
    })
    .to_string())
}

pub fn out_of_domain(message: &str, questions: &[&str]) -> Result<String, String> {
    Ok(serde_json::json!({
        "out_of_domain": true,
        "out_of_domain_message": message,
        "query_cleaning": "",
        "query_expansion": "",
        "recommended_next_questions": questions,
        "sql": "",
    })
    .to_string())
}

pub fn reply(text: &str) -> Result<String, String> {
    Ok(text.to_string())
}

pub fn failure(message: &str) -> Result<String, String> {
    Err(message.to_string())
}

/// In-memory store holding `results(id, name, score)` with two rows.
pub fn results_store() -> Arc<Store> {
    let store = Store::open_in_memory().unwrap();
    store
        .connect()
        .unwrap()
        .execute_batch(
            "CREATE TABLE results (id INTEGER PRIMARY KEY, name VARCHAR, score DOUBLE);
             INSERT INTO results VALUES (1, 'a', 10.0), (2, 'b', 20.0);",
        )
        .unwrap();
    Arc::new(store)
}

pub fn pipeline(store: &Arc<Store>, model: Arc<ScriptedModel>) -> (Pipeline, Arc<SchemaCache>) {
    let cache = Arc::new(SchemaCache::new(true));
    let pipeline = Pipeline::from_config(
        Arc::clone(store),
        Arc::clone(&cache),
        model,
        &AppConfig::default(),
    );
    (pipeline, cache)
}
