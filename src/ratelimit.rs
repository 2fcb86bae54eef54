use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

use crate::config::{LOGIN_LOCK_SECONDS, LOGIN_MAX_FAILED};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FailRecord {
    failed: u32,
    locked_until: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    /// Unix seconds at which the lock expires.
    LockedUntil(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Accepted,
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    AttemptsLeft(u32),
    LockedUntil(i64),
}

/// Per-client login failure counter with a lockout window, persisted after
/// every mutation. Not a security boundary: clients behind the same proxy
/// header share a bucket, and "unknown" clients share one.
#[derive(Debug)]
pub struct LoginLimiter {
    records: HashMap<String, FailRecord>,
    path: Option<PathBuf>,
    max_failed: u32,
    lock_seconds: i64,
}

impl LoginLimiter {
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut limiter = Self {
            records: HashMap::new(),
            path,
            max_failed: LOGIN_MAX_FAILED,
            lock_seconds: LOGIN_LOCK_SECONDS,
        };
        limiter.load_snapshot();
        limiter
    }

    fn load_snapshot(&mut self) {
        let Some(path) = &self.path else { return };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match serde_json::from_str::<HashMap<String, FailRecord>>(&raw) {
            Ok(records) => self.records = records,
            Err(e) => warn!(
                "Could not load login rate limit state from {}: {}",
                path.display(),
                e
            ),
        }
    }

    pub fn check_lock(&self, client: &str) -> LockStatus {
        self.check_lock_at(client, Utc::now().timestamp())
    }

    pub fn check_lock_at(&self, client: &str, now: i64) -> LockStatus {
        match self.records.get(client) {
            Some(rec) if rec.locked_until > now => LockStatus::LockedUntil(rec.locked_until),
            _ => LockStatus::Unlocked,
        }
    }

    pub fn record_attempt(&mut self, client: &str, success: bool) -> AttemptResult {
        self.record_attempt_at(client, success, Utc::now().timestamp())
    }

    pub fn record_attempt_at(&mut self, client: &str, success: bool, now: i64) -> AttemptResult {
        if success {
            // Lockout state does not survive a correct password.
            if self.records.remove(client).is_some() {
                self.save();
            }
            return AttemptResult::Accepted;
        }
        let mut rec = self.records.get(client).cloned().unwrap_or_default();
        // An expired lock resets the record so the client is not
        // double-penalized by stale state.
        if rec.locked_until > 0 && rec.locked_until <= now {
            rec = FailRecord::default();
        }
        rec.failed += 1;
        let result = if rec.failed >= self.max_failed {
            rec.locked_until = now + self.lock_seconds;
            AttemptResult::Rejected(Rejection::LockedUntil(rec.locked_until))
        } else {
            AttemptResult::Rejected(Rejection::AttemptsLeft(self.max_failed - rec.failed))
        };
        self.records.insert(client.to_string(), rec);
        self.save();
        result
    }

    fn save(&mut self) {
        let Some(path) = &self.path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = serde_json::to_string(&self.records)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(path, json).map_err(anyhow::Error::from));
        if let Err(e) = result {
            warn!(
                "Could not save login rate limit state to {}: {}",
                path.display(),
                e
            );
        }
    }
}
