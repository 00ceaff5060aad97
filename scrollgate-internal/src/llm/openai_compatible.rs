use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, ErrorDetails};
use crate::llm::{ChatMessage, LlmConfig, LlmRequest, LlmResponse};

const PROVIDER_TYPE: &str = "openai_compatible";

/// Client for any server speaking the OpenAI chat completions API
#[derive(Debug)]
pub struct OpenAiCompatibleProvider {
    api_base: Url,
    api_key: Option<SecretString>,
    timeout: Duration,
    http_client: reqwest::Client,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    total_tokens: u64,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &LlmConfig, http_client: reqwest::Client) -> Self {
        Self {
            api_base: config.base_url.clone(),
            api_key: config
                .api_key
                .as_ref()
                .map(|key| SecretString::from(key.expose_secret().to_string())),
            timeout: Duration::from_millis(config.timeout_ms),
            http_client,
        }
    }

    pub async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, Error> {
        let request_url = get_chat_url(&self.api_base)?;
        let body = OpenAiRequest {
            model: &request.model,
            messages: &request.messages,
        };

        let mut request_builder = self
            .http_client
            .post(request_url)
            .timeout(self.timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            request_builder = request_builder.bearer_auth(key.expose_secret());
        }

        let res = request_builder
            .send()
            .await
            .map_err(|e| self.handle_reqwest_error(e))?;

        let status = res.status();
        let raw_response = res.text().await.map_err(|e| self.handle_reqwest_error(e))?;
        if !status.is_success() {
            return Err(Error::new(ErrorDetails::InferenceClient {
                message: format!("{PROVIDER_TYPE}: {raw_response}"),
                status_code: Some(status),
            }));
        }

        let response: OpenAiResponse = serde_json::from_str(&raw_response).map_err(|e| {
            Error::new(ErrorDetails::Inference {
                message: format!("Error parsing {PROVIDER_TYPE} response: {e}"),
            })
        })?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                Error::new(ErrorDetails::Inference {
                    message: format!("{PROVIDER_TYPE} response contained no message content"),
                })
            })?;

        Ok(LlmResponse {
            content,
            total_tokens: response.usage.map(|usage| usage.total_tokens),
            model: response.model.unwrap_or_else(|| request.model.clone()),
        })
    }

    fn handle_reqwest_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            return Error::new(ErrorDetails::InferenceTimeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        Error::new(ErrorDetails::InferenceClient {
            message: format!("{PROVIDER_TYPE}: {e}"),
            status_code: e.status(),
        })
    }
}

fn get_chat_url(base_url: &Url) -> Result<Url, Error> {
    let mut url = base_url.clone();
    if !url.path().ends_with('/') {
        url.set_path(&format!("{}/", url.path()));
    }
    url.join("chat/completions").map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Invalid `llm.base_url`: {e}"),
        })
    })
}
