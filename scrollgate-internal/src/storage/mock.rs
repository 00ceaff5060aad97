use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::{Error, ErrorDetails};
use crate::storage::{SessionKind, SessionRecord, TokenUsageRecord};

#[derive(Debug, Default)]
struct MockTables {
    usage: HashMap<(String, String), TokenUsageRecord>,
    sessions: Vec<SessionRecord>,
}

/// In-memory store for unit tests. Every operation fails while the store is unhealthy, and
/// every write fails while it is read-only.
#[derive(Clone, Debug)]
pub struct MockStore {
    tables: Arc<Mutex<MockTables>>,
    healthy: Arc<AtomicBool>,
    writable: Arc<AtomicBool>,
}

impl MockStore {
    pub fn new(healthy: bool) -> Self {
        Self {
            tables: Arc::new(Mutex::new(MockTables::default())),
            healthy: Arc::new(AtomicBool::new(healthy)),
            writable: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    fn lock_for_write(&self) -> Result<MutexGuard<'_, MockTables>, Error> {
        if !self.writable.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorDetails::Storage {
                message: "mock store is read-only".to_string(),
            }));
        }
        self.lock()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockTables>, Error> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorDetails::Storage {
                message: "mock store unavailable".to_string(),
            }));
        }
        self.tables.lock().map_err(|e| {
            Error::new(ErrorDetails::Storage {
                message: format!("mock store lock poisoned: {e}"),
            })
        })
    }

    pub fn health(&self) -> Result<(), Error> {
        self.lock().map(|_| ())
    }

    pub fn get_or_create_usage(
        &self,
        user_id: &str,
        month: &str,
    ) -> Result<(TokenUsageRecord, bool), Error> {
        let mut tables = self.lock()?;
        let key = (user_id.to_string(), month.to_string());
        let created = !tables.usage.contains_key(&key);
        if created && !self.writable.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorDetails::Storage {
                message: "mock store is read-only".to_string(),
            }));
        }
        let record = tables
            .usage
            .entry(key)
            .or_insert_with(|| TokenUsageRecord::new(user_id, month))
            .clone();
        Ok((record, created))
    }

    pub fn get_usage(&self, user_id: &str, month: &str) -> Result<Option<TokenUsageRecord>, Error> {
        let tables = self.lock()?;
        Ok(tables
            .usage
            .get(&(user_id.to_string(), month.to_string()))
            .cloned())
    }

    pub fn block_usage(&self, user_id: &str, month: &str, token_count: u64) -> Result<(), Error> {
        let mut tables = self.lock_for_write()?;
        if let Some(record) = tables
            .usage
            .get_mut(&(user_id.to_string(), month.to_string()))
        {
            record.token_count = record.token_count.max(token_count);
            record.is_blocked = true;
        }
        Ok(())
    }

    pub fn add_usage(&self, user_id: &str, month: &str, tokens: u64) -> Result<u64, Error> {
        let mut tables = self.lock_for_write()?;
        let record = tables
            .usage
            .entry((user_id.to_string(), month.to_string()))
            .or_insert_with(|| TokenUsageRecord::new(user_id, month));
        record.token_count = record.token_count.saturating_add(tokens);
        Ok(record.token_count)
    }

    pub fn reset_month(&self, month: &str, reset_at: DateTime<Utc>) -> Result<u64, Error> {
        let mut tables = self.lock_for_write()?;
        let mut touched = 0;
        for record in tables.usage.values_mut().filter(|r| r.month == month) {
            record.token_count = 0;
            record.is_blocked = false;
            record.last_reset_at = Some(reset_at);
            touched += 1;
        }
        Ok(touched)
    }

    pub fn insert_session(&self, session: &SessionRecord) -> Result<(), Error> {
        self.lock_for_write()?.sessions.push(session.clone());
        Ok(())
    }

    pub fn recent_sessions(&self, user_id: &str, limit: u32) -> Result<Vec<SessionRecord>, Error> {
        let tables = self.lock()?;
        let mut sessions: Vec<SessionRecord> = tables
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        sessions.truncate(limit as usize);
        Ok(sessions)
    }

    pub fn latest_session_of_kind(
        &self,
        user_id: &str,
        kind: SessionKind,
    ) -> Result<Option<SessionRecord>, Error> {
        let tables = self.lock()?;
        Ok(tables
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.kind == kind)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    pub fn count_sessions_since(&self, user_id: &str, since: DateTime<Utc>) -> Result<u64, Error> {
        let tables = self.lock()?;
        Ok(tables
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.created_at >= since)
            .count() as u64)
    }
}
