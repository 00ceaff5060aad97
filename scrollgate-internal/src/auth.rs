use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::error::{Error, ErrorDetails};

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Shared admin credential. With no key configured every admin request is rejected.
#[derive(Clone, Debug)]
pub struct AdminAuth {
    key: Option<Arc<SecretString>>,
}

impl AdminAuth {
    pub fn new(key: Option<&SecretString>) -> Self {
        Self {
            key: key.map(|k| Arc::new(SecretString::from(k.expose_secret().to_string()))),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    fn validate(&self, presented: &str) -> Result<(), Error> {
        match &self.key {
            None => Err(Error::new(ErrorDetails::Unauthorized {
                message: "Admin API is disabled".to_string(),
            })),
            Some(key) if keys_match(key, presented) => Ok(()),
            Some(_) => Err(Error::new(ErrorDetails::Unauthorized {
                message: "Invalid admin API key".to_string(),
            })),
        }
    }
}

fn keys_match(expected: &SecretString, presented: &str) -> bool {
    expected
        .expose_secret()
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into()
}

pub async fn require_admin_key(
    State(auth): State<AdminAuth>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let Some(presented) = presented_key(request.headers()) else {
        return Err(Error::new(ErrorDetails::Unauthorized {
            message: "Missing admin API key".to_string(),
        }));
    };
    auth.validate(&presented)?;
    Ok(next.run(request).await)
}

/// Bearer token from `authorization`, else the raw `x-admin-key` header
fn presented_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v));
    bearer
        .or_else(|| {
            headers
                .get(ADMIN_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
