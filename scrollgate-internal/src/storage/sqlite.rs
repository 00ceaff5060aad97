use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::storage::{SessionKind, SessionRecord, TokenUsageRecord};

const TOKEN_USAGE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS token_usage (
    user_id TEXT NOT NULL,
    month TEXT NOT NULL,
    token_count INTEGER NOT NULL DEFAULT 0,
    is_blocked INTEGER NOT NULL DEFAULT 0,
    last_reset_at TEXT,
    PRIMARY KEY (user_id, month)
);
"#;

const SESSIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    text TEXT NOT NULL,
    derived_output TEXT NOT NULL,
    model TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    processing_time_ms INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

const SESSION_COLUMNS: &str =
    "id, user_id, kind, text, derived_output, model, token_count, processing_time_ms, created_at";

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
    path: PathBuf,
}

fn storage_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::new(ErrorDetails::Storage {
        message: format!("{context}: {e}"),
    })
}

/// Fixed-width UTC timestamps so that lexical order matches chronological order
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| storage_error("invalid timestamp in store", e))
}

fn to_db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn usage_from_row(row: &SqliteRow) -> Result<TokenUsageRecord, Error> {
    let read = |e| storage_error("failed to read token_usage row", e);
    let last_reset_at: Option<String> = row.try_get("last_reset_at").map_err(read)?;
    Ok(TokenUsageRecord {
        user_id: row.try_get("user_id").map_err(read)?,
        month: row.try_get("month").map_err(read)?,
        token_count: from_db_int(row.try_get("token_count").map_err(read)?),
        is_blocked: row.try_get::<i64, _>("is_blocked").map_err(read)? != 0,
        last_reset_at: last_reset_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord, Error> {
    let read = |e| storage_error("failed to read sessions row", e);
    let id: String = row.try_get("id").map_err(read)?;
    let kind: String = row.try_get("kind").map_err(read)?;
    let created_at: String = row.try_get("created_at").map_err(read)?;
    Ok(SessionRecord {
        id: Uuid::parse_str(&id).map_err(|e| storage_error("invalid session id", e))?,
        user_id: row.try_get("user_id").map_err(read)?,
        kind: SessionKind::from_str(&kind).map_err(|e| storage_error("invalid session kind", e))?,
        text: row.try_get("text").map_err(read)?,
        derived_output: row.try_get("derived_output").map_err(read)?,
        model: row.try_get("model").map_err(read)?,
        token_count: from_db_int(row.try_get("token_count").map_err(read)?),
        processing_time_ms: from_db_int(row.try_get("processing_time_ms").map_err(read)?),
        created_at: parse_ts(&created_at)?,
    })
}

impl SqliteStore {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path_buf = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path_buf)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::AppState {
                    message: format!(
                        "Failed to open SQLite database at `{}`: {e}",
                        path_buf.display()
                    ),
                })
            })?;

        Ok(Self {
            pool: Arc::new(pool),
            path: path_buf,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ensure_schema(&self) -> Result<(), Error> {
        for statement in [
            TOKEN_USAGE_TABLE_SQL,
            "CREATE INDEX IF NOT EXISTS idx_token_usage_month ON token_usage (month);",
            SESSIONS_TABLE_SQL,
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_created ON sessions (user_id, created_at);",
        ] {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| storage_error("failed to apply schema", e))?;
        }
        Ok(())
    }

    pub async fn health(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| storage_error("health check failed", e))?;
        Ok(())
    }

    pub async fn get_or_create_usage(
        &self,
        user_id: &str,
        month: &str,
    ) -> Result<(TokenUsageRecord, bool), Error> {
        let inserted = sqlx::query(
            "INSERT INTO token_usage (user_id, month, token_count, is_blocked) VALUES (?, ?, 0, 0) \
             ON CONFLICT (user_id, month) DO NOTHING",
        )
        .bind(user_id)
        .bind(month)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_error("failed to create token_usage row", e))?
        .rows_affected();

        let record = self.get_usage(user_id, month).await?.ok_or_else(|| {
            Error::new(ErrorDetails::Storage {
                message: format!("token_usage row for `{user_id}` in {month} vanished after insert"),
            })
        })?;
        Ok((record, inserted == 1))
    }

    pub async fn get_usage(
        &self,
        user_id: &str,
        month: &str,
    ) -> Result<Option<TokenUsageRecord>, Error> {
        let row = sqlx::query(
            "SELECT user_id, month, token_count, is_blocked, last_reset_at FROM token_usage \
             WHERE user_id = ? AND month = ?",
        )
        .bind(user_id)
        .bind(month)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage_error("failed to read token_usage", e))?;

        row.as_ref().map(usage_from_row).transpose()
    }

    pub async fn block_usage(
        &self,
        user_id: &str,
        month: &str,
        token_count: u64,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE token_usage SET token_count = MAX(token_count, ?), is_blocked = 1 \
             WHERE user_id = ? AND month = ?",
        )
        .bind(to_db_int(token_count))
        .bind(user_id)
        .bind(month)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_error("failed to block token_usage", e))?;
        Ok(())
    }

    pub async fn add_usage(&self, user_id: &str, month: &str, tokens: u64) -> Result<u64, Error> {
        let row = sqlx::query(
            "INSERT INTO token_usage (user_id, month, token_count, is_blocked) VALUES (?, ?, ?, 0) \
             ON CONFLICT (user_id, month) DO UPDATE SET token_count = token_count + excluded.token_count \
             RETURNING token_count",
        )
        .bind(user_id)
        .bind(month)
        .bind(to_db_int(tokens))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| storage_error("failed to add token usage", e))?;

        let total: i64 = row
            .try_get("token_count")
            .map_err(|e| storage_error("failed to read token_count", e))?;
        Ok(from_db_int(total))
    }

    pub async fn reset_month(&self, month: &str, reset_at: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE token_usage SET token_count = 0, is_blocked = 0, last_reset_at = ? WHERE month = ?",
        )
        .bind(format_ts(reset_at))
        .bind(month)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_error("failed to reset token_usage", e))?;
        Ok(result.rows_affected())
    }

    pub async fn insert_session(&self, session: &SessionRecord) -> Result<(), Error> {
        sqlx::query(&format!(
            "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(session.id.to_string())
        .bind(&session.user_id)
        .bind(session.kind.as_ref())
        .bind(&session.text)
        .bind(&session.derived_output)
        .bind(&session.model)
        .bind(to_db_int(session.token_count))
        .bind(to_db_int(session.processing_time_ms))
        .bind(format_ts(session.created_at))
        .execute(&*self.pool)
        .await
        .map_err(|e| storage_error("failed to insert session", e))?;
        Ok(())
    }

    pub async fn recent_sessions(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<SessionRecord>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage_error("failed to read sessions", e))?;

        rows.iter().map(session_from_row).collect()
    }

    pub async fn latest_session_of_kind(
        &self,
        user_id: &str,
        kind: SessionKind,
    ) -> Result<Option<SessionRecord>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ? AND kind = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(user_id)
        .bind(kind.as_ref())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage_error("failed to read sessions", e))?;

        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn count_sessions_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM sessions WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(format_ts(since))
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| storage_error("failed to count sessions", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| storage_error("failed to read session count", e))?;
        Ok(from_db_int(total))
    }
}
