use crate::db::Database;
use crate::llm::InferenceGateway;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

/// Process configuration. Flags win over environment variables (a `.env`
/// file is loaded first); the inference settings fall back to values stored
/// with `/config set`.
#[derive(Debug, Clone, Parser)]
#[command(name = "ai-chatbot", version, about = "Terminal AI chat client")]
pub struct Config {
    /// SQLite file holding users, conversations and settings.
    #[arg(long = "database", env = "CHAT_DATABASE_PATH", default_value = "ai-chatbot.db")]
    pub database_path: PathBuf,

    /// Gemini API key; demo mode when absent.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "GEMINI_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "GEMINI_BASE_URL")]
    pub base_url: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!(error = %e, "ignoring unreadable .env file");
            }
        }
        Self::parse()
    }

    /// Builds the inference gateway, reading missing values from the
    /// settings table.
    pub fn inference_gateway(&self, db: &Database) -> InferenceGateway {
        let stored = |key: &str| match db.get_setting(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "failed to read setting");
                None
            }
        };
        let gateway = InferenceGateway::from_parts(
            self.api_key.clone().or_else(|| stored("gemini_api_key")),
            self.base_url.clone().or_else(|| stored("gemini_base_url")),
            self.model.clone().or_else(|| stored("gemini_model")),
        );
        if gateway.is_demo() {
            info!("no Gemini API key configured, running in demo mode");
        }
        gateway
    }
}
