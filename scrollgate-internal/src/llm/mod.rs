pub mod dummy;
pub mod openai_compatible;

pub use dummy::DummyProvider;
pub use openai_compatible::OpenAiCompatibleProvider;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, ErrorDetails};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LlmProviderKind {
    #[default]
    OpenaiCompatible,
    Dummy,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProviderKind,

    #[serde(default = "default_base_url")]
    pub base_url: Url,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Loaded from `SCROLLGATE_LLM_API_KEY`, never from the config file
    #[serde(skip)]
    pub api_key: Option<SecretString>,
}

#[expect(clippy::expect_used)]
fn default_base_url() -> Url {
    Url::parse("https://api.openai.com/v1/").expect("default base url is valid")
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_system_prompt() -> String {
    "You are a concise, helpful assistant. Use the session context when it is relevant and ignore it otherwise.".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::default(),
            base_url: default_base_url(),
            default_model: default_model(),
            system_prompt: default_system_prompt(),
            timeout_ms: default_timeout_ms(),
            api_key: None,
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.timeout_ms == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`llm.timeout_ms` must be greater than 0".to_string(),
            }));
        }
        if self.default_model.trim().is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "`llm.default_model` must not be empty".to_string(),
            }));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmResponse {
    pub content: String,
    /// Tokens the provider billed, when it reports them
    pub total_tokens: Option<u64>,
    pub model: String,
}

/// Upstream chat completion backend
#[derive(Debug)]
pub enum LlmProvider {
    OpenAiCompatible(OpenAiCompatibleProvider),
    Dummy(DummyProvider),
}

impl LlmProvider {
    pub fn new(config: &LlmConfig, http_client: reqwest::Client) -> Self {
        match config.provider {
            LlmProviderKind::OpenaiCompatible => {
                LlmProvider::OpenAiCompatible(OpenAiCompatibleProvider::new(config, http_client))
            }
            LlmProviderKind::Dummy => LlmProvider::Dummy(DummyProvider),
        }
    }

    pub fn kind(&self) -> LlmProviderKind {
        match self {
            LlmProvider::OpenAiCompatible(_) => LlmProviderKind::OpenaiCompatible,
            LlmProvider::Dummy(_) => LlmProviderKind::Dummy,
        }
    }

    pub async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, Error> {
        match self {
            LlmProvider::OpenAiCompatible(provider) => provider.complete(request).await,
            LlmProvider::Dummy(provider) => provider.complete(request),
        }
    }
}
