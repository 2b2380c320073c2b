use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use whisper_core::error::GenerationError;
use whisper_core::llm::{EmbeddingService, GenerationOptions, TextGenerationService};
use whisper_core::openai::{
    ChatResponse, EmbeddingRequest, EmbeddingResponse, chat_request, chat_text, first_embedding,
};

use crate::config::LanguageModelConfig;

/// Blocking facade over an OpenAI-compatible HTTP API. Must not be called
/// from an async task; the CLI and server drive it from blocking threads.
pub struct OpenAiClient {
    client: reqwest::Client,
    rt: tokio::runtime::Handle,
    base_url: String,
    api_key: String,
    chat_model: String,
    embed_model: String,
}

fn transport_error(err: &reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout
    } else {
        GenerationError::Unavailable(err.to_string())
    }
}

impl OpenAiClient {
    /// `Ok(None)` when no API key is configured.
    pub fn from_config(config: &LanguageModelConfig) -> Result<Option<Self>> {
        let Some(api_key) = config.api_key.clone() else {
            tracing::info!("OPENAI_API_KEY not set; replies fall back to canned text");
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .user_agent(format!("whisper-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Some(Self {
            client,
            rt: tokio::runtime::Handle::current(),
            base_url: config.base_url.clone(),
            api_key,
            chat_model: config.chat_model.clone(),
            embed_model: config.embed_model.clone(),
        }))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GenerationError> {
        let resp = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerationError::from_response_body(status.as_u16(), &body));
        }
        resp.json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))
    }

    pub async fn chat_async(
        &self,
        system: &str,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        let req = chat_request(&self.chat_model, system, prompt, options);
        let resp: ChatResponse = self.post_json("chat/completions", &req).await?;
        chat_text(resp)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GenerationError::Malformed("empty completion".to_string()))
    }

    pub async fn embed_async(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        let req = EmbeddingRequest {
            model: &self.embed_model,
            input: text,
        };
        let resp: EmbeddingResponse = self.post_json("embeddings", &req).await?;
        first_embedding(resp)
            .ok_or_else(|| GenerationError::Malformed("no embedding returned".to_string()))
    }
}

impl TextGenerationService for OpenAiClient {
    fn generate_with(
        &self,
        system: &str,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, GenerationError> {
        self.rt.block_on(self.chat_async(system, prompt, options))
    }
}

impl EmbeddingService for OpenAiClient {
    fn embed(&self, text: &str) -> Result<Vec<f32>, GenerationError> {
        self.rt.block_on(self.embed_async(text))
    }
}
