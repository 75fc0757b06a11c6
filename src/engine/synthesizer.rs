use std::sync::Arc;
use tracing::{debug, info};

use crate::db::rows::RowMap;
use crate::error::SynthesisError;
use crate::llm::{GenerationSettings, LanguageModel, LlmError};

pub const SYNTHESIS_SYSTEM_PROMPT: &str = "You are a helpful research assistant. Respond ONLY with the answer to the user's question, without any additional text, code blocks, or formatting.";

/// Turns a question and its result rows into a prose answer grounded only in
/// those rows.
pub struct AnswerSynthesizer {
    model: Arc<dyn LanguageModel>,
    settings: GenerationSettings,
}

impl AnswerSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn synthesize(&self, question: &str, rows: &[RowMap]) -> Result<String, SynthesisError> {
        let prompt = build_prompt(question, rows);
        debug!("Prepared synthesis prompt for {} rows", rows.len());

        let request = self.settings.request(SYNTHESIS_SYSTEM_PROMPT, prompt);
        let answer = self.model.complete(&request).await?;

        if answer.trim().is_empty() {
            return Err(SynthesisError(LlmError::ResponseError(
                "empty answer".to_string(),
            )));
        }

        info!("Synthesized answer ({} chars)", answer.len());
        Ok(answer.trim().to_string())
    }
}

pub fn build_prompt(question: &str, rows: &[RowMap]) -> String {
    // RowMap is a serde_json map, so this cannot fail
    let data = serde_json::to_string(rows).unwrap_or_else(|_| "[]".to_string());

    let no_rows = if rows.is_empty() {
        "\nNo rows matched the question. Say plainly that the information needed to answer it was not found.\n"
    } else {
        ""
    };

    format!(
        r#"Based on the question:

**{question}**

the following data was found:

SQL Data in JSON format: {data}
{no_rows}
Do not make reference to the data sources themselves, only reference the data. For example, don't mention 'the data', 'JSON', 'SQL data', 'databases', etc.

Unless specified in the question, don't show your work for mathematical calculations. Only provide the final answer.

Use organizing techniques like lists, bullet points, or paragraphs to structure your response.

**This is a retrieval-augmented generation task, so it is critical that you only generate the answer based on the data provided in this prompt.**
**If you need to make any assumptions, please state them clearly.**
**If you think the data provided is insufficient to generate the answer, please state that as well.**
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CompletionRequest;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct EchoModel {
        reply: String,
        prompts: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(request.clone());
            Ok(self.reply.clone())
        }
    }

    fn model(reply: &str) -> Arc<EchoModel> {
        Arc::new(EchoModel {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn row(value: serde_json::Value) -> RowMap {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn rows_are_embedded_as_json() {
        let model = model("  The average score is 15.0.\n");
        let synthesizer = AnswerSynthesizer::new(model.clone());

        let answer = synthesizer
            .synthesize("What is the average score?", &[row(json!({"avg(score)": 15.0}))])
            .await
            .unwrap();

        assert_eq!(answer, "The average score is 15.0.");
        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts[0].system, SYNTHESIS_SYSTEM_PROMPT);
        assert!(prompts[0].prompt.contains(r#"[{"avg(score)":15.0}]"#));
        assert!(prompts[0].prompt.contains("**What is the average score?**"));
        assert!(!prompts[0].prompt.contains("No rows matched"));
    }

    #[tokio::test]
    async fn empty_results_are_called_out() {
        let model = model("No matching customers were found.");
        AnswerSynthesizer::new(model.clone())
            .synthesize("Who bought a unicorn?", &[])
            .await
            .unwrap();

        let prompt = &model.prompts.lock().unwrap()[0].prompt;
        assert!(prompt.contains("SQL Data in JSON format: []"));
        assert!(prompt.contains("No rows matched"));
        assert!(prompt.contains("insufficient"));
    }

    #[tokio::test]
    async fn blank_answers_are_failures() {
        let err = AnswerSynthesizer::new(model("   "))
            .synthesize("anything", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError(LlmError::ResponseError(_))));
    }
}
