//! Request pipeline for chat-style requests.
//!
//! Order matters: the rate limiter and the token budget both run before the upstream call, so a
//! rejected request never costs tokens. Everything after the upstream call is best effort.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Error, ErrorDetails};
use crate::llm::{ChatMessage, LlmProvider, LlmRequest};
use crate::rate_limit::{EndpointClass, RateLimitDecision, RateLimitHeaders, RateLimiter};
use crate::session_memory::{SessionMemoryCache, SessionMemorySnapshot, SessionMemoryUpdate};
use crate::storage::{SessionKind, SessionRecord, StoreConnectionInfo};
use crate::usage_limit::{estimate_tokens, TokenLedger};

const MAX_USER_ID_CHARS: usize = 128;
const MAX_TEXT_CHARS: usize = 32_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatParams {
    #[serde(alias = "user_id")]
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub kind: SessionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub session_id: Uuid,
    pub output: String,
    pub model: String,
    pub tokens_used: u64,
    pub processing_time_ms: u64,
    pub remaining_tokens: u64,
}

#[derive(Debug)]
pub struct ChatOutcome {
    pub response: ChatResponse,
    /// Rate limit state after admission, for the response headers
    pub rate_limit: RateLimitHeaders,
}

/// Composes admission, budgeting, inference and bookkeeping for one request
#[derive(Debug)]
pub struct ChatPipeline {
    rate_limiter: Arc<RateLimiter>,
    ledger: Arc<TokenLedger>,
    session_memory: Arc<SessionMemoryCache>,
    llm: Arc<LlmProvider>,
    store: StoreConnectionInfo,
    clock: Clock,
    default_model: String,
    system_prompt: String,
}

impl ChatPipeline {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        ledger: Arc<TokenLedger>,
        session_memory: Arc<SessionMemoryCache>,
        llm: Arc<LlmProvider>,
        store: StoreConnectionInfo,
        clock: Clock,
        default_model: String,
        system_prompt: String,
    ) -> Self {
        Self {
            rate_limiter,
            ledger,
            session_memory,
            llm,
            store,
            clock,
            default_model,
            system_prompt,
        }
    }

    #[instrument(skip_all, fields(user_id = %params.user_id, kind = %params.kind))]
    pub async fn handle(&self, params: ChatParams) -> Result<ChatOutcome, Error> {
        let started = Instant::now();
        validate_params(&params)?;
        let ChatParams {
            user_id,
            text,
            model,
            kind,
        } = params;

        let rate_limit = match self
            .rate_limiter
            .check_limit(&user_id, EndpointClass::HighCost)
        {
            RateLimitDecision::Allow(headers) => headers,
            RateLimitDecision::Deny(headers) => {
                return Err(Error::new(ErrorDetails::RateLimitExceeded {
                    identifier: user_id,
                    class: EndpointClass::HighCost,
                    headers,
                }));
            }
        };

        let estimated_tokens =
            estimate_tokens(&text, self.ledger.config().prompt_overhead_tokens);
        let budget = self.ledger.check_budget(&user_id, estimated_tokens).await?;
        if !budget.is_allowed() {
            return Err(Error::new(ErrorDetails::BudgetExhausted {
                message: budget
                    .message
                    .unwrap_or_else(|| self.ledger.config().denial_message.clone()),
                user_id,
                total_used: budget.total_used,
                cap: self.ledger.monthly_cap(),
            }));
        }

        let snapshot = match self.session_memory.get_snapshot(&user_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Session memory unavailable, continuing without context: {e}");
                SessionMemorySnapshot::empty(&user_id, self.clock.now())
            }
        };

        let request = LlmRequest {
            model: model.unwrap_or_else(|| self.default_model.clone()),
            messages: self.build_messages(&snapshot, &text),
        };
        let response = match self.llm.complete(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.ledger.record_actual_usage(&user_id, 0).await;
                return Err(e);
            }
        };

        let tokens_used = response.total_tokens.unwrap_or(estimated_tokens);
        self.ledger.record_actual_usage(&user_id, tokens_used).await;

        let processing_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let record = SessionRecord {
            id: Uuid::now_v7(),
            user_id,
            kind,
            text,
            derived_output: response.content,
            model: response.model,
            token_count: tokens_used,
            processing_time_ms,
            created_at: self.clock.now(),
        };
        if let Err(e) = self.store.insert_session(&record).await {
            warn!("Failed to persist session {}: {e}", record.id);
        }
        self.session_memory
            .update(&record.user_id, SessionMemoryUpdate::from_session(&record))
            .await;

        let remaining_tokens = self
            .ledger
            .monthly_cap()
            .saturating_sub(budget.total_used.saturating_add(tokens_used));
        debug!(
            session_id = %record.id,
            tokens_used,
            remaining_tokens,
            processing_time_ms,
            "Completed chat request"
        );

        Ok(ChatOutcome {
            response: ChatResponse {
                session_id: record.id,
                output: record.derived_output,
                model: record.model,
                tokens_used,
                processing_time_ms,
                remaining_tokens,
            },
            rate_limit,
        })
    }

    fn build_messages(&self, snapshot: &SessionMemorySnapshot, text: &str) -> Vec<ChatMessage> {
        let context = snapshot.render_context();
        let system = if context.is_empty() {
            self.system_prompt.clone()
        } else {
            format!("{}\n\nSession context:\n{context}", self.system_prompt)
        };
        vec![ChatMessage::system(system), ChatMessage::user(text)]
    }
}

fn validate_params(params: &ChatParams) -> Result<(), Error> {
    let invalid = |message: &str| {
        Err(Error::new(ErrorDetails::InvalidRequest {
            message: message.to_string(),
        }))
    };
    if params.user_id.trim().is_empty() {
        return invalid("`userId` must not be empty");
    }
    if params.user_id.chars().count() > MAX_USER_ID_CHARS {
        return invalid("`userId` is too long");
    }
    if params.text.trim().is_empty() {
        return invalid("`text` must not be empty");
    }
    if params.text.chars().count() > MAX_TEXT_CHARS {
        return invalid("`text` exceeds the maximum request length");
    }
    if params.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
        return invalid("`model` must not be empty when provided");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_parser::Config;
    use crate::rate_limit::EndpointLimit;
    use crate::storage::MockStore;
    use crate::testing::get_unit_test_app_state_data;

    fn params(user_id: &str, text: &str) -> ChatParams {
        ChatParams {
            user_id: user_id.to_string(),
            text: text.to_string(),
            model: None,
            kind: SessionKind::Chat,
        }
    }

    fn mock_store(store: &StoreConnectionInfo) -> MockStore {
        match store {
            StoreConnectionInfo::Mock { store } => store.clone(),
            StoreConnectionInfo::Sqlite { .. } => panic!("unit tests use the mock store"),
        }
    }

    #[tokio::test]
    async fn test_successful_request_updates_everything() {
        let state = get_unit_test_app_state_data(Arc::new(Config::default()), true);
        let store = mock_store(&state.store);
        let month = state.clock.current_month();

        let outcome = state
            .pipeline
            .handle(params("u1", "hello there friend"))
            .await
            .unwrap();

        assert_eq!(outcome.response.output, "echo: hello there friend");
        assert_eq!(outcome.response.model, state.config.llm.default_model);
        assert_eq!(outcome.rate_limit.limit, 30);
        assert_eq!(outcome.rate_limit.remaining, 29);

        let usage = store.get_usage("u1", &month).unwrap().unwrap();
        assert_eq!(usage.token_count, outcome.response.tokens_used);
        assert_eq!(
            outcome.response.remaining_tokens,
            650_000 - outcome.response.tokens_used
        );

        let sessions = store.recent_sessions("u1", 10).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, outcome.response.session_id);

        let snapshot = state.session_memory.get_snapshot("u1").await.unwrap();
        assert_eq!(snapshot.recent_sessions[0].id, outcome.response.session_id);
        assert_eq!(snapshot.counters.total_sessions, 1);
    }

    #[tokio::test]
    async fn test_second_request_sees_session_context() {
        let state = get_unit_test_app_state_data(Arc::new(Config::default()), true);
        state
            .pipeline
            .handle(params("u1", "first question"))
            .await
            .unwrap();

        let snapshot = state.session_memory.get_snapshot("u1").await.unwrap();
        let messages = state.pipeline.build_messages(&snapshot, "second");
        assert!(messages[0].content.contains("Session context:"));
        assert!(messages[0].content.contains("- first question"));
        assert_eq!(messages[1], ChatMessage::user("second"));
    }

    #[tokio::test]
    async fn test_burst_rejection_skips_budget() {
        let mut config = Config::default();
        config.rate_limits.high_cost = EndpointLimit::new(30, 60_000, 2);
        let state = get_unit_test_app_state_data(Arc::new(config), true);

        state.pipeline.handle(params("u1", "a")).await.unwrap();
        state.pipeline.handle(params("u1", "b")).await.unwrap();
        let err = state.pipeline.handle(params("u1", "c")).await.unwrap_err();

        assert!(matches!(
            err.get_details(),
            ErrorDetails::RateLimitExceeded {
                class: EndpointClass::HighCost,
                ..
            }
        ));
        assert_eq!(state.ledger.metrics().checks, 2);
    }

    #[tokio::test]
    async fn test_exhausted_budget_never_calls_provider() {
        let state = get_unit_test_app_state_data(Arc::new(Config::default()), true);
        let store = mock_store(&state.store);
        let month = state.clock.current_month();
        store.add_usage("u1", &month, 649_990).unwrap();

        let err = state
            .pipeline
            .handle(params("u1", "one more please"))
            .await
            .unwrap_err();

        match err.get_details() {
            ErrorDetails::BudgetExhausted {
                total_used, cap, ..
            } => {
                assert_eq!(*cap, 650_000);
                assert!(*total_used >= 650_000);
            }
            details => panic!("unexpected error: {details:?}"),
        }
        assert!(store.recent_sessions("u1", 10).unwrap().is_empty());
        assert!(store.get_usage("u1", &month).unwrap().unwrap().is_blocked);
    }

    #[tokio::test]
    async fn test_provider_failure_records_nothing() {
        let state = get_unit_test_app_state_data(Arc::new(Config::default()), true);
        let store = mock_store(&state.store);
        let month = state.clock.current_month();

        let mut request = params("u1", "hello");
        request.model = Some("error".to_string());
        let err = state.pipeline.handle(request).await.unwrap_err();

        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
        let usage = store.get_usage("u1", &month).unwrap().unwrap();
        assert_eq!(usage.token_count, 0);
        assert!(!usage.is_blocked);
        assert!(store.recent_sessions("u1", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_estimate_used_when_provider_omits_usage() {
        let state = get_unit_test_app_state_data(Arc::new(Config::default()), true);

        let mut request = params("u1", "one two three");
        request.model = Some("no_usage".to_string());
        let outcome = state.pipeline.handle(request).await.unwrap();

        assert_eq!(outcome.response.tokens_used, estimate_tokens("one two three", 150));
    }

    #[tokio::test]
    async fn test_scan_sessions_feed_last_scan() {
        let state = get_unit_test_app_state_data(Arc::new(Config::default()), true);
        state.session_memory.get_snapshot("u1").await.unwrap();

        let mut request = params("u1", "scan this");
        request.kind = SessionKind::Scan;
        let outcome = state.pipeline.handle(request).await.unwrap();

        let snapshot = state.session_memory.get_snapshot("u1").await.unwrap();
        let last_scan = snapshot.last_scan.unwrap();
        assert_eq!(last_scan.id, outcome.response.session_id);
        assert_eq!(last_scan.derived_output, "echo: scan this");
    }

    #[tokio::test]
    async fn test_storage_outage_fails_open() {
        let state = get_unit_test_app_state_data(Arc::new(Config::default()), false);

        let outcome = state.pipeline.handle(params("u1", "still works")).await.unwrap();
        assert_eq!(outcome.response.output, "echo: still works");
        assert_eq!(state.ledger.metrics().fail_open_events, 1);
    }

    #[tokio::test]
    async fn test_invalid_params() {
        let state = get_unit_test_app_state_data(Arc::new(Config::default()), true);

        for request in [
            params("", "text"),
            params("u1", "   "),
            params(&"x".repeat(MAX_USER_ID_CHARS + 1), "text"),
            ChatParams {
                model: Some(" ".to_string()),
                ..params("u1", "text")
            },
        ] {
            let err = state.pipeline.handle(request).await.unwrap_err();
            assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
        }
        assert_eq!(state.rate_limiter.metrics().allowed, 0);
    }

    #[test]
    fn test_params_accept_both_spellings() {
        let camel: ChatParams =
            serde_json::from_str(r#"{"userId": "u1", "text": "hi", "kind": "decree"}"#).unwrap();
        assert_eq!(camel.user_id, "u1");
        assert_eq!(camel.kind, SessionKind::Decree);

        let snake: ChatParams =
            serde_json::from_str(r#"{"user_id": "u1", "text": "hi", "model": "m"}"#).unwrap();
        assert_eq!(snake.model.as_deref(), Some("m"));
        assert_eq!(snake.kind, SessionKind::Chat);
    }
}
