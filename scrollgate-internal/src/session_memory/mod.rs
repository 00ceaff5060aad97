//! Per-user advisory context derived from persisted sessions.
//!
//! Snapshots are cached in-process and may be stale. Nothing that bills or authorizes a request
//! reads from here.

pub mod cache;

pub use cache::{SessionMemoryCache, SessionMemoryMetricsSnapshot};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::storage::{SessionKind, SessionRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionMemoryConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,

    /// Rows read from the store when rebuilding a snapshot
    #[serde(default = "default_history_window")]
    pub history_window: u32,

    /// Sessions kept in `recent_sessions`
    #[serde(default = "default_recent_limit")]
    pub recent_limit: u32,
}

fn default_ttl_secs() -> u64 {
    1_800
}

fn default_max_capacity() -> u64 {
    10_000
}

fn default_history_window() -> u32 {
    50
}

fn default_recent_limit() -> u32 {
    10
}

impl Default for SessionMemoryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_capacity: default_max_capacity(),
            history_window: default_history_window(),
            recent_limit: default_recent_limit(),
        }
    }
}

impl SessionMemoryConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.ttl_secs == 0 || self.max_capacity == 0 || self.recent_limit == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`session_memory.ttl_secs`, `max_capacity` and `recent_limit` must be greater than 0"
                    .to_string(),
            }));
        }
        if self.history_window < self.recent_limit {
            return Err(Error::new(ErrorDetails::Config {
                message: "`session_memory.history_window` must be at least `recent_limit`"
                    .to_string(),
            }));
        }
        Ok(())
    }
}

/// A session as held in memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEntry {
    pub id: Uuid,
    pub kind: SessionKind,
    pub text: String,
    pub derived_output: String,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&SessionRecord> for SessionEntry {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            text: record.text.clone(),
            derived_output: record.derived_output.clone(),
            token_count: record.token_count,
            created_at: record.created_at,
        }
    }
}

/// Aggregates over a user's sessions
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollingCounters {
    pub total_sessions: u64,
    pub total_tokens: u64,
    pub average_tokens: f64,
    /// UTC hour with the most sessions; ties go to the earliest hour
    pub most_active_hour: Option<u32>,
    pub hour_histogram: [u64; 24],
}

impl RollingCounters {
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a SessionRecord>) -> Self {
        let mut counters = Self::default();
        for row in rows {
            counters.add(row.token_count, row.created_at);
        }
        counters
    }

    pub fn record(&mut self, entry: &SessionEntry) {
        self.add(entry.token_count, entry.created_at);
    }

    fn add(&mut self, tokens: u64, at: DateTime<Utc>) {
        self.total_sessions += 1;
        self.total_tokens = self.total_tokens.saturating_add(tokens);
        self.average_tokens = self.total_tokens as f64 / self.total_sessions as f64;
        if let Some(slot) = self.hour_histogram.get_mut(at.hour() as usize) {
            *slot += 1;
        }
        self.most_active_hour = self
            .hour_histogram
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .fold(None, |best: Option<(usize, u64)>, (hour, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((hour, *count)),
            })
            .map(|(hour, _)| hour as u32);
    }
}

/// Cached view of one user's recent activity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMemorySnapshot {
    pub user_id: String,
    /// Newest first
    pub recent_sessions: Vec<SessionEntry>,
    pub last_scan: Option<SessionEntry>,
    pub last_decree: Option<String>,
    pub counters: RollingCounters,
    pub built_at: DateTime<Utc>,
}

impl SessionMemorySnapshot {
    pub fn empty(user_id: &str, built_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            recent_sessions: Vec::new(),
            last_scan: None,
            last_decree: None,
            counters: RollingCounters::default(),
            built_at,
        }
    }

    /// Compact context block appended to the system prompt
    pub fn render_context(&self) -> String {
        let mut lines = Vec::new();
        if self.counters.total_sessions > 0 {
            let mut line = format!(
                "Prior sessions: {} (average {:.0} tokens)",
                self.counters.total_sessions, self.counters.average_tokens
            );
            if let Some(hour) = self.counters.most_active_hour {
                line.push_str(&format!(", most active around {hour:02}:00 UTC"));
            }
            lines.push(line);
        }
        if let Some(scan) = &self.last_scan {
            lines.push(format!(
                "Last scan: {}",
                truncate_chars(&scan.derived_output, 280)
            ));
        }
        if let Some(decree) = &self.last_decree {
            lines.push(format!("Last decree: {}", truncate_chars(decree, 280)));
        }
        let recent: Vec<String> = self
            .recent_sessions
            .iter()
            .take(3)
            .map(|s| format!("- {}", truncate_chars(&s.text, 160)))
            .collect();
        if !recent.is_empty() {
            lines.push("Recent requests:".to_string());
            lines.extend(recent);
        }
        lines.join("\n")
    }

    fn apply(&mut self, update: SessionMemoryUpdate, recent_limit: usize) {
        if let Some(session) = update.session {
            self.counters.record(&session);
            self.recent_sessions.insert(0, session);
            self.recent_sessions.truncate(recent_limit);
        }
        if let Some(scan) = update.last_scan {
            self.last_scan = Some(scan);
        }
        if let Some(decree) = update.last_decree {
            self.last_decree = Some(decree);
        }
    }
}

/// Fields merged into a cached snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionMemoryUpdate {
    pub session: Option<SessionEntry>,
    pub last_scan: Option<SessionEntry>,
    pub last_decree: Option<String>,
}

impl SessionMemoryUpdate {
    pub fn from_session(record: &SessionRecord) -> Self {
        let entry = SessionEntry::from(record);
        Self {
            last_scan: (record.kind == SessionKind::Scan).then(|| entry.clone()),
            last_decree: (record.kind == SessionKind::Decree)
                .then(|| record.derived_output.clone()),
            session: Some(entry),
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(kind: SessionKind, tokens: u64, hour: u32) -> SessionRecord {
        SessionRecord {
            id: Uuid::now_v7(),
            user_id: "u1".to_string(),
            kind,
            text: "hello there".to_string(),
            derived_output: format!("{kind} result"),
            model: "m".to_string(),
            token_count: tokens,
            processing_time_ms: 5,
            created_at: Utc.with_ymd_and_hms(2026, 10, 18, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_counters_pick_earliest_busiest_hour() {
        let rows = [
            record(SessionKind::Chat, 100, 14),
            record(SessionKind::Chat, 200, 9),
            record(SessionKind::Chat, 300, 14),
            record(SessionKind::Chat, 400, 9),
        ];
        let counters = RollingCounters::from_rows(&rows);
        assert_eq!(counters.total_sessions, 4);
        assert_eq!(counters.total_tokens, 1_000);
        assert!((counters.average_tokens - 250.0).abs() < f64::EPSILON);
        assert_eq!(counters.most_active_hour, Some(9));
        assert_eq!(counters.hour_histogram[14], 2);
    }

    #[test]
    fn test_update_from_session_tracks_kind() {
        let scan = record(SessionKind::Scan, 10, 1);
        let update = SessionMemoryUpdate::from_session(&scan);
        assert_eq!(update.last_scan.as_ref().map(|s| s.id), Some(scan.id));
        assert!(update.last_decree.is_none());

        let decree = record(SessionKind::Decree, 10, 1);
        let update = SessionMemoryUpdate::from_session(&decree);
        assert!(update.last_scan.is_none());
        assert_eq!(update.last_decree.as_deref(), Some("decree result"));
    }

    #[test]
    fn test_apply_keeps_newest_first_and_bounded() {
        let mut snapshot = SessionMemorySnapshot::empty("u1", Utc::now());
        let rows: Vec<SessionRecord> = (0..4).map(|h| record(SessionKind::Chat, 1, h)).collect();
        for row in &rows {
            snapshot.apply(SessionMemoryUpdate::from_session(row), 3);
        }
        let ids: Vec<Uuid> = snapshot.recent_sessions.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![rows[3].id, rows[2].id, rows[1].id]);
        assert_eq!(snapshot.counters.total_sessions, 4);
    }

    #[test]
    fn test_render_context() {
        assert_eq!(
            SessionMemorySnapshot::empty("u1", Utc::now()).render_context(),
            ""
        );

        let mut snapshot = SessionMemorySnapshot::empty("u1", Utc::now());
        snapshot.apply(
            SessionMemoryUpdate::from_session(&record(SessionKind::Decree, 120, 7)),
            10,
        );
        let context = snapshot.render_context();
        assert!(context.contains("Prior sessions: 1 (average 120 tokens), most active around 07:00 UTC"));
        assert!(context.contains("Last decree: decree result"));
        assert!(context.contains("- hello there"));
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé...");
        assert_eq!(truncate_chars("hi", 5), "hi");
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionMemoryConfig::default().validate().is_ok());
        let config = SessionMemoryConfig {
            history_window: 5,
            recent_limit: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
