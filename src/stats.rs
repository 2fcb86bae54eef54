use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::config::now_local;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    last_at: Option<String>,
    #[serde(default)]
    date: String,
    #[serde(default)]
    count: u32,
}

/// Last-upload timestamp and per-day counter for the status page. The
/// counter resets when the wall-clock date (fixed zone) rolls over; reads
/// reload from disk on a stale day so a status page in another process
/// sees recent uploads.
#[derive(Debug)]
pub struct BackupStats {
    last_at: Option<DateTime<FixedOffset>>,
    date: String,
    count: u32,
    path: Option<PathBuf>,
}

impl BackupStats {
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut stats = Self {
            last_at: None,
            date: String::new(),
            count: 0,
            path,
        };
        stats.reload();
        stats
    }

    fn reload(&mut self) {
        let Some(path) = &self.path else { return };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snap) => {
                self.last_at = snap
                    .last_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
                self.date = snap.date.chars().take(10).collect();
                self.count = snap.count;
            }
            Err(e) => warn!("Could not load backup stats from {}: {}", path.display(), e),
        }
    }

    /// Call after every successful backup (file, link, or note).
    pub fn record_upload(&mut self) {
        self.record_upload_at(now_local());
    }

    pub fn record_upload_at(&mut self, now: DateTime<FixedOffset>) {
        let today = now.format("%Y-%m-%d").to_string();
        if self.date != today {
            self.date = today;
            self.count = 0;
        }
        self.count += 1;
        self.last_at = Some(now);
        self.save();
    }

    pub fn last_backup_at(&mut self) -> Option<DateTime<FixedOffset>> {
        if self.last_at.is_none() {
            self.reload();
        }
        self.last_at
    }

    pub fn count_today(&mut self) -> u32 {
        self.count_today_at(now_local())
    }

    pub fn count_today_at(&mut self, now: DateTime<FixedOffset>) -> u32 {
        let today = now.format("%Y-%m-%d").to_string();
        if self.date != today {
            self.reload();
        }
        if self.date != today {
            return 0;
        }
        self.count
    }

    fn save(&self) {
        let Some(path) = &self.path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let snap = Snapshot {
            last_at: self.last_at.map(|t| t.to_rfc3339()),
            date: self.date.clone(),
            count: self.count,
        };
        let result = serde_json::to_string(&snap)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(path, json).map_err(anyhow::Error::from));
        if let Err(e) = result {
            warn!("Could not save backup stats to {}: {}", path.display(), e);
        }
    }
}
