use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// When to write the snapshot back to disk.
///
/// `Batched` trades durability for I/O: on a crash, adds since the last save
/// are lost and the corresponding keys will be treated as new again
/// (at-least-once, not exactly-once).
#[derive(Debug, Clone, Copy)]
pub enum SavePolicy {
    EveryMutation,
    Batched { every: u32, interval: Duration },
}

/// Bounded set of seen keys with insertion-order eviction, snapshotted to a
/// flat JSON array. A missing or corrupt snapshot yields an empty set.
///
/// With `path = None` the set is purely in-memory (feature disabled).
#[derive(Debug)]
pub struct SeenSet {
    keys: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
    path: Option<PathBuf>,
    policy: SavePolicy,
    dirty: u32,
    last_save: Instant,
}

impl SeenSet {
    pub fn load(path: Option<PathBuf>, capacity: usize, policy: SavePolicy) -> Self {
        let mut set = Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity,
            path,
            policy,
            dirty: 0,
            last_save: Instant::now(),
        };
        set.load_snapshot();
        set
    }

    fn load_snapshot(&mut self) {
        let Some(path) = &self.path else { return };
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(list) => {
                // Keep only the newest entries when the snapshot is over capacity.
                let skip = list.len().saturating_sub(self.capacity);
                for key in list.into_iter().skip(skip) {
                    if self.keys.insert(key.clone()) {
                        self.order.push_back(key);
                    }
                }
                info!("Loaded {} seen keys from {}", self.keys.len(), path.display());
            }
            Err(e) => warn!("Could not load seen keys from {}: {}", path.display(), e),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        !key.is_empty() && self.keys.contains(key)
    }

    /// Idempotent: re-adding a known key neither reorders nor persists.
    pub fn add(&mut self, key: &str) {
        if key.is_empty() || !self.keys.insert(key.to_string()) {
            return;
        }
        self.order.push_back(key.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.dirty += 1;
        match self.policy {
            SavePolicy::EveryMutation => self.save(),
            SavePolicy::Batched { every, interval } => {
                if self.dirty >= every || self.last_save.elapsed() >= interval {
                    self.save();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Persist pending adds, if any. Called on graceful shutdown so the
    /// batched store loses at most its final window.
    pub fn flush(&mut self) {
        if self.dirty > 0 {
            self.save();
        }
    }

    fn save(&mut self) {
        let Some(path) = &self.path else {
            self.dirty = 0;
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let list: Vec<&String> = self.order.iter().collect();
        let result = serde_json::to_string(&list)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(path, json).map_err(anyhow::Error::from));
        match result {
            Ok(()) => {
                self.dirty = 0;
                self.last_save = Instant::now();
            }
            Err(e) => warn!("Could not save seen keys to {}: {}", path.display(), e),
        }
    }
}
