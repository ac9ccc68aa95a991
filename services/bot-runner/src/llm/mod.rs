//! LLM providers used for signal generation

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod prompt;

use async_trait::async_trait;
use control_plane::models::LlmProvider;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use openai::OpenAiClient;
pub use prompt::{build_prompt, parse_reply, LlmReply, SYSTEM_PROMPT};

use crate::config::RunnerSettings;

/// Completion requests give up after this long
pub const LLM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} returned {status}: {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("LLM response had no text content")]
    EmptyResponse,

    #[error("unparseable LLM reply: {0}")]
    Parse(String),

    #[error("no API key configured for {0}")]
    NotConfigured(&'static str),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> LlmProvider;

    /// One-shot completion returning the raw text reply
    async fn complete(&self, model: &str, system: &str, prompt: &str) -> Result<String, LlmError>;
}

pub(crate) fn http_client() -> Result<reqwest::Client, LlmError> {
    Ok(reqwest::Client::builder().timeout(LLM_TIMEOUT).build()?)
}

/// Trim long error bodies before they reach logs and run records
pub(crate) fn truncate(body: String) -> String {
    const MAX: usize = 300;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Clients for the providers that have an API key
#[derive(Clone, Default)]
pub struct LlmRegistry {
    clients: HashMap<LlmProvider, Arc<dyn LlmClient>>,
}

impl LlmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &RunnerSettings) -> Result<Self, LlmError> {
        let mut registry = Self::new();
        let key = |k: &Option<String>| k.clone().filter(|v| !v.is_empty());

        if let Some(api_key) = key(&settings.openai_api_key) {
            registry = registry.with_client(Arc::new(OpenAiClient::new(&api_key)?));
        }
        if let Some(api_key) = key(&settings.anthropic_api_key) {
            registry = registry.with_client(Arc::new(AnthropicClient::new(&api_key)?));
        }
        if let Some(api_key) = key(&settings.gemini_api_key) {
            registry = registry.with_client(Arc::new(GeminiClient::new(&api_key)?));
        }
        Ok(registry)
    }

    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.clients.insert(client.provider(), client);
        self
    }

    pub fn get(&self, provider: LlmProvider) -> Option<Arc<dyn LlmClient>> {
        self.clients.get(&provider).cloned()
    }

    pub fn configured(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.clients.keys().map(|p| p.as_str()).collect();
        names.sort_unstable();
        names
    }
}
