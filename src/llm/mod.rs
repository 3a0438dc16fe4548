pub mod gemini;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

pub use gemini::GeminiConfig;

const DEMO_RESPONSES: &[&str] = &[
    "I'm here to help! This is a demo response since the Gemini API key isn't configured yet. To get real AI responses, please add your Gemini API key to the environment variables.",
    "Hello! I'm your AI assistant. Currently running in demo mode. Add your Gemini API key to enable full AI functionality.",
    "Thanks for your message! I'm working in demo mode right now. For real AI responses, configure your Gemini API key.",
    "I'd love to help you with that! This is a demo response - add your Gemini API key to get intelligent responses.",
    "Great question! I'm currently in demo mode. Set up your Gemini API key for full AI functionality.",
];

pub const EMPTY_RESPONSE_REPLY: &str = "Sorry, I couldn't generate a response. Please try again.";
pub const API_KEY_REPLY: &str =
    "API key error: Please check if your Gemini API key is valid and has the correct permissions.";
pub const UNAVAILABLE_REPLY: &str =
    "Sorry, I couldn't get an answer from Gemini. Please try again later.";

/// Turns a prompt into reply text. Implementations never fail: problems are
/// reported as the reply itself.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn complete(&self, prompt: &str) -> String;
}

/// Hosted-model gateway; falls back to canned replies when no key is set.
#[derive(Debug, Clone)]
pub struct InferenceGateway {
    provider: Option<GeminiConfig>,
    client: Client,
}

impl InferenceGateway {
    pub fn demo() -> Self {
        Self {
            provider: None,
            client: Client::new(),
        }
    }

    pub fn gemini(config: GeminiConfig) -> Self {
        Self {
            provider: Some(config),
            client: Client::new(),
        }
    }

    /// Demo mode unless a non-empty key is present.
    pub fn from_parts(api_key: Option<String>, base_url: Option<String>, model: Option<String>) -> Self {
        match api_key.filter(|k| !k.trim().is_empty()) {
            Some(api_key) => {
                let mut config = GeminiConfig::new(api_key);
                if let Some(base_url) = base_url {
                    config.base_url = base_url;
                }
                if let Some(model) = model {
                    config.model = model;
                }
                Self::gemini(config)
            }
            None => Self::demo(),
        }
    }

    pub fn is_demo(&self) -> bool {
        self.provider.is_none()
    }
}

fn demo_reply() -> String {
    DEMO_RESPONSES
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(DEMO_RESPONSES[0])
        .to_string()
}

#[async_trait]
impl Inference for InferenceGateway {
    async fn complete(&self, prompt: &str) -> String {
        let Some(config) = &self.provider else {
            debug!("no API key configured, answering in demo mode");
            return demo_reply();
        };

        match gemini::generate(&self.client, config, prompt).await {
            Ok(Some(text)) => text,
            Ok(None) => EMPTY_RESPONSE_REPLY.to_string(),
            Err(LlmError::Api { status: 403, message }) => {
                warn!(%message, "model endpoint rejected the API key");
                API_KEY_REPLY.to_string()
            }
            // Only a successful status reaches the body parse.
            Err(LlmError::Parse(e)) => {
                warn!(error = %e, "model returned an unreadable body");
                EMPTY_RESPONSE_REPLY.to_string()
            }
            Err(e) => {
                warn!(error = %e, "model request failed");
                UNAVAILABLE_REPLY.to_string()
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

impl Serialize for LlmError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
