pub mod orchestrator;
pub mod synthesizer;
pub mod translator;

pub use orchestrator::{AnswerEnvelope, Outcome, Pipeline, TablePage};
pub use synthesizer::AnswerSynthesizer;
pub use translator::{QueryTranslator, TranslationResult};
