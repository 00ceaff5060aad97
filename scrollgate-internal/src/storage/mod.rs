//! Durable store for token usage records and session rows.
//!
//! [`StoreConnectionInfo`] is the handle the rest of the gateway holds. Production runs against
//! SQLite; unit tests use the in-memory mock, which can be flipped unhealthy to simulate outages.

pub mod mock;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
pub use mock::MockStore;
pub use sqlite::SqliteStore;

/// Per-user, per-month token accumulator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenUsageRecord {
    pub user_id: String,
    /// Calendar month, `YYYY-MM`
    pub month: String,
    pub token_count: u64,
    pub is_blocked: bool,
    pub last_reset_at: Option<DateTime<Utc>>,
}

impl TokenUsageRecord {
    pub fn new(user_id: &str, month: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            month: month.to_string(),
            token_count: 0,
            is_blocked: false,
            last_reset_at: None,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Chat,
    Scan,
    Decree,
}

/// One processed request, as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub kind: SessionKind,
    pub text: String,
    pub derived_output: String,
    pub model: String,
    pub token_count: u64,
    pub processing_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum StoreConnectionInfo {
    Sqlite { store: SqliteStore },
    Mock { store: MockStore },
}

impl StoreConnectionInfo {
    /// Open (creating if needed) the SQLite database at `path` and apply the schema
    pub async fn new_sqlite(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let store = SqliteStore::connect(path).await?;
        store.ensure_schema().await?;
        Ok(StoreConnectionInfo::Sqlite { store })
    }

    pub fn new_mock(healthy: bool) -> Self {
        StoreConnectionInfo::Mock {
            store: MockStore::new(healthy),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreConnectionInfo::Sqlite { .. } => "sqlite",
            StoreConnectionInfo::Mock { .. } => "mock",
        }
    }

    pub async fn health(&self) -> Result<(), Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => store.health().await,
            StoreConnectionInfo::Mock { store } => store.health(),
        }
    }

    /// Fetch the usage record for `(user_id, month)`, creating a zeroed one if absent.
    /// The flag is true when this call created the row.
    pub async fn get_or_create_usage(
        &self,
        user_id: &str,
        month: &str,
    ) -> Result<(TokenUsageRecord, bool), Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => store.get_or_create_usage(user_id, month).await,
            StoreConnectionInfo::Mock { store } => store.get_or_create_usage(user_id, month),
        }
    }

    pub async fn get_usage(
        &self,
        user_id: &str,
        month: &str,
    ) -> Result<Option<TokenUsageRecord>, Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => store.get_usage(user_id, month).await,
            StoreConnectionInfo::Mock { store } => store.get_usage(user_id, month),
        }
    }

    /// Set the block flag and raise the counter to at least `token_count`
    pub async fn block_usage(
        &self,
        user_id: &str,
        month: &str,
        token_count: u64,
    ) -> Result<(), Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => {
                store.block_usage(user_id, month, token_count).await
            }
            StoreConnectionInfo::Mock { store } => store.block_usage(user_id, month, token_count),
        }
    }

    /// Add `tokens` to the month's counter, creating the row if needed. Returns the new total.
    pub async fn add_usage(&self, user_id: &str, month: &str, tokens: u64) -> Result<u64, Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => store.add_usage(user_id, month, tokens).await,
            StoreConnectionInfo::Mock { store } => store.add_usage(user_id, month, tokens),
        }
    }

    /// Zero the counter and clear the block for every record of `month`. Returns rows touched.
    pub async fn reset_month(&self, month: &str, reset_at: DateTime<Utc>) -> Result<u64, Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => store.reset_month(month, reset_at).await,
            StoreConnectionInfo::Mock { store } => store.reset_month(month, reset_at),
        }
    }

    pub async fn insert_session(&self, session: &SessionRecord) -> Result<(), Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => store.insert_session(session).await,
            StoreConnectionInfo::Mock { store } => store.insert_session(session),
        }
    }

    /// The user's most recent sessions, newest first
    pub async fn recent_sessions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<SessionRecord>, Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => store.recent_sessions(user_id, limit).await,
            StoreConnectionInfo::Mock { store } => store.recent_sessions(user_id, limit),
        }
    }

    pub async fn latest_session_of_kind(
        &self,
        user_id: &str,
        kind: SessionKind,
    ) -> Result<Option<SessionRecord>, Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => {
                store.latest_session_of_kind(user_id, kind).await
            }
            StoreConnectionInfo::Mock { store } => store.latest_session_of_kind(user_id, kind),
        }
    }

    pub async fn count_sessions_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, Error> {
        match self {
            StoreConnectionInfo::Sqlite { store } => {
                store.count_sessions_since(user_id, since).await
            }
            StoreConnectionInfo::Mock { store } => store.count_sessions_since(user_id, since),
        }
    }
}
