use crate::error::{Error, ErrorDetails};
use crate::llm::{LlmRequest, LlmResponse, Role};

/// Deterministic offline provider.
///
/// Echoes the last user message. The model name selects behavior: `error` fails, `no_usage`
/// omits the token count. Otherwise the reported count is the number of whitespace-separated
/// words across all messages plus the reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyProvider;

impl DummyProvider {
    pub fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, Error> {
        if request.model == "error" {
            return Err(Error::new(ErrorDetails::Inference {
                message: "dummy provider error".to_string(),
            }));
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let content = format!("echo: {last_user}");

        let total_tokens = (request.model != "no_usage").then(|| {
            request
                .messages
                .iter()
                .map(|m| m.content.split_whitespace().count() as u64)
                .sum::<u64>()
                + content.split_whitespace().count() as u64
        });

        Ok(LlmResponse {
            content,
            total_tokens,
            model: request.model.clone(),
        })
    }
}
