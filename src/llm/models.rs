use serde::{Deserialize, Serialize};

/// A single-turn completion: one system instruction, one user prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Sampling settings shared by both call sites.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationSettings {
    pub fn request(&self, system: &str, prompt: String) -> CompletionRequest {
        CompletionRequest {
            system: system.to_string(),
            prompt,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 1024,
        }
    }
}
