use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::rate_limit::{EndpointClass, RateLimitHeaders};

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    BudgetExhausted {
        user_id: String,
        message: String,
        total_used: u64,
        cap: u64,
    },
    Config {
        message: String,
    },
    Inference {
        message: String,
    },
    InferenceClient {
        message: String,
        status_code: Option<StatusCode>,
    },
    InferenceTimeout {
        timeout_ms: u64,
    },
    InvalidRequest {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    Observability {
        message: String,
    },
    RateLimitExceeded {
        identifier: String,
        class: EndpointClass,
        headers: RateLimitHeaders,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    Storage {
        message: String,
    },
    Unauthorized {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::BudgetExhausted { .. } => tracing::Level::INFO,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::Inference { .. } => tracing::Level::ERROR,
            ErrorDetails::InferenceClient { .. } => tracing::Level::ERROR,
            ErrorDetails::InferenceTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::JsonRequest { .. } => tracing::Level::WARN,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::RateLimitExceeded { .. } => tracing::Level::INFO,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::DEBUG,
            ErrorDetails::Storage { .. } => tracing::Level::ERROR,
            ErrorDetails::Unauthorized { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::BudgetExhausted { .. } => StatusCode::PAYMENT_REQUIRED,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Inference { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::InferenceClient { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::InferenceTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        }
    }

    /// The `type` and `code` fields of the client-facing error object
    fn error_kind(&self) -> (&'static str, &'static str) {
        match self {
            ErrorDetails::BudgetExhausted { .. } => ("insufficient_quota", "monthly_token_limit"),
            ErrorDetails::InvalidRequest { .. } => ("invalid_request_error", "invalid_request"),
            ErrorDetails::JsonRequest { .. } => ("invalid_request_error", "invalid_json"),
            ErrorDetails::RateLimitExceeded { .. } => ("rate_limit_error", "rate_limit_exceeded"),
            ErrorDetails::RouteNotFound { .. } => ("not_found_error", "route_not_found"),
            ErrorDetails::Unauthorized { .. } => ("authentication_error", "unauthorized"),
            ErrorDetails::Inference { .. } | ErrorDetails::InferenceClient { .. } => {
                ("upstream_error", "model_provider_error")
            }
            ErrorDetails::InferenceTimeout { .. } => ("upstream_error", "model_provider_timeout"),
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::Observability { .. }
            | ErrorDetails::Storage { .. } => ("internal_server_error", "internal_error"),
        }
    }

    /// Message returned to clients. Internal failures never leak their details.
    fn client_message(&self) -> String {
        match self {
            ErrorDetails::BudgetExhausted { message, .. } => message.clone(),
            ErrorDetails::RateLimitExceeded { headers, .. } => match headers.retry_after {
                Some(seconds) => format!("Rate limit exceeded. Retry after {seconds} seconds."),
                None => "Rate limit exceeded".to_string(),
            },
            ErrorDetails::Inference { .. } | ErrorDetails::InferenceClient { .. } => {
                "The model provider failed to complete the request".to_string()
            }
            ErrorDetails::InferenceTimeout { .. } => {
                "The model provider timed out. Retry with a shorter input.".to_string()
            }
            ErrorDetails::Storage { .. } => "Storage is temporarily unavailable".to_string(),
            ErrorDetails::AppState { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::Observability { .. } => "Internal server error".to_string(),
            ErrorDetails::InvalidRequest { .. }
            | ErrorDetails::JsonRequest { .. }
            | ErrorDetails::RouteNotFound { .. }
            | ErrorDetails::Unauthorized { .. } => self.to_string(),
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::BudgetExhausted {
                user_id,
                total_used,
                cap,
                ..
            } => {
                write!(
                    f,
                    "Monthly token budget exhausted for user `{user_id}` ({total_used}/{cap} tokens)"
                )
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::Inference { message } => {
                write!(f, "Error from model provider: {message}")
            }
            ErrorDetails::InferenceClient {
                message,
                status_code,
            } => match status_code {
                Some(status) => write!(f, "Model provider returned {status}: {message}"),
                None => write!(f, "Model provider request failed: {message}"),
            },
            ErrorDetails::InferenceTimeout { timeout_ms } => {
                write!(f, "Model provider timed out after {timeout_ms}ms")
            }
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::JsonRequest { message } => write!(f, "{message}"),
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::RateLimitExceeded {
                identifier,
                class,
                headers,
            } => {
                write!(
                    f,
                    "Rate limit exceeded for `{identifier}` on class `{class}` (limit {})",
                    headers.limit
                )
            }
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::Storage { message } => write!(f, "Error in durable store: {message}"),
            ErrorDetails::Unauthorized { message } => write!(f, "{message}"),
        }
    }
}

impl Error {
    /// Get the JSON response body that would be sent to clients
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let (error_type, code) = self.0.error_kind();
        let mut body = json!({
            "error": {
                "message": self.0.client_message(),
                "type": error_type,
                "code": code,
            }
        });
        if let ErrorDetails::BudgetExhausted {
            total_used, cap, ..
        } = self.get_details()
        {
            body["error"]["total_used"] = json!(total_used);
            body["error"]["monthly_cap"] = json!(cap);
        }
        (self.status_code(), body)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        let mut response = (status_code, Json(body)).into_response();
        if let ErrorDetails::RateLimitExceeded { headers, .. } = self.get_details() {
            response.headers_mut().extend(headers.to_header_map());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_hides_details() {
        let error = Error::new(ErrorDetails::Storage {
            message: "database is locked".to_string(),
        });
        let (status, body) = error.to_response_json();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["error"]["message"],
            "Storage is temporarily unavailable"
        );
        assert!(!body.to_string().contains("locked"));
        assert_eq!(error.get_details().level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_budget_exhausted_response() {
        let error = Error::new(ErrorDetails::BudgetExhausted {
            user_id: "user-1".to_string(),
            message: "Upgrade to continue".to_string(),
            total_used: 650_300,
            cap: 650_000,
        });
        let (status, body) = error.to_response_json();
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["message"], "Upgrade to continue");
        assert_eq!(body["error"]["type"], "insufficient_quota");
        assert_eq!(body["error"]["total_used"], 650_300);
        assert_eq!(body["error"]["monthly_cap"], 650_000);
    }

    #[test]
    fn test_rate_limit_response_carries_headers() {
        let error = Error::new_without_logging(ErrorDetails::RateLimitExceeded {
            identifier: "user-1".to_string(),
            class: EndpointClass::HighCost,
            headers: RateLimitHeaders {
                limit: 30,
                remaining: 0,
                reset_at_ms: 1_700_000_060_000,
                retry_after: Some(42),
            },
        });
        assert_eq!(
            error.to_string(),
            "Rate limit exceeded for `user-1` on class `high_cost` (limit 30)"
        );
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "42");
        assert_eq!(response.headers()["x-ratelimit-limit"], "30");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    }

    #[test]
    fn test_inference_client_error_is_generic() {
        let error = Error::new(ErrorDetails::InferenceClient {
            message: "{\"error\":\"invalid api key sk-123\"}".to_string(),
            status_code: Some(StatusCode::UNAUTHORIZED),
        });
        let (status, body) = error.to_response_json();
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(!body.to_string().contains("sk-123"));
    }
}
