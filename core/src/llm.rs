//! Seams to the language model backend.
//!
//! The core never talks HTTP. Binaries plug in a client that implements
//! these traits; tests plug in canned responders.

use serde_json::Value;

use crate::error::GenerationError;

pub const DEFAULT_EMBEDDING_DIMS: usize = 1536;

pub trait EmbeddingService: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError>;

    fn dimensions(&self) -> usize {
        DEFAULT_EMBEDDING_DIMS
    }
}

/// Optional sampling knobs. Some models reject them outright.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the backend for a JSON object response.
    pub json: bool,
}

impl GenerationOptions {
    #[must_use]
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

pub trait TextGenerationService: Send + Sync {
    fn generate_with(
        &self,
        system: &str,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError>;

    /// Generate, retrying once without options when the backend rejects one.
    fn generate(
        &self,
        system: &str,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        match self.generate_with(system, prompt, options) {
            Err(GenerationError::UnsupportedParameter(detail)) if !options.is_default() => {
                tracing::warn!("backend rejected generation options, retrying without: {detail}");
                self.generate_with(system, prompt, &GenerationOptions::default())
            }
            other => other,
        }
    }

    /// Generate a JSON object. Prose around the object is tolerated.
    fn generate_json(&self, system: &str, prompt: &str) -> Result<Value, GenerationError> {
        let options = GenerationOptions {
            json: true,
            ..GenerationOptions::default()
        };
        let text = self.generate(system, prompt, &options)?;
        extract_json_object(&text)
            .ok_or_else(|| GenerationError::Malformed("no JSON object in response".to_string()))
    }
}

/// Parse `text` as JSON, or the outermost `{...}` inside it.
#[must_use]
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Cosine similarity of two vectors. Mismatched or zero vectors score 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
