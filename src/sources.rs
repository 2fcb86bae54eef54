use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

const MAX_FOLDER_LEN: usize = 32;

/// Sanitize a destination folder name: alphanumeric, `_` and `-` survive,
/// everything else becomes `_`; capped at 32 chars; never empty.
pub fn safe_folder_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FOLDER_LEN)
        .collect();
    if cleaned.is_empty() {
        "other".to_string()
    } else {
        cleaned
    }
}

/// Mapping from short user-entered keys (e.g. "1") to sanitized folder
/// names. Loaded from a file when configured, else from the `SOURCE_MAP`
/// env var (`key:value,key:value`); editable via the admin page.
#[derive(Debug)]
pub struct SourceMap {
    entries: HashMap<String, String>,
    path: Option<PathBuf>,
}

impl SourceMap {
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut map = Self {
            entries: HashMap::new(),
            path,
        };
        map.reload();
        map
    }

    pub fn reload(&mut self) {
        self.entries.clear();
        if let Some(path) = &self.path {
            if path.exists() {
                match std::fs::read_to_string(path)
                    .map_err(anyhow::Error::from)
                    .and_then(|raw| {
                        serde_json::from_str::<HashMap<String, String>>(&raw)
                            .map_err(anyhow::Error::from)
                    }) {
                    Ok(data) => {
                        for (k, v) in data {
                            let (k, v) = (k.trim().to_string(), v.trim().to_string());
                            if !k.is_empty() && !v.is_empty() {
                                self.entries.insert(k, safe_folder_name(&v));
                            }
                        }
                        info!(
                            "Loaded source map from {} ({} entries)",
                            path.display(),
                            self.entries.len()
                        );
                        return;
                    }
                    Err(e) => {
                        warn!("Could not load source map from {}: {}", path.display(), e)
                    }
                }
            }
        }
        for part in env::var("SOURCE_MAP").unwrap_or_default().split(',') {
            if let Some((k, v)) = part.trim().split_once(':') {
                let (k, v) = (k.trim(), v.trim());
                if !k.is_empty() && !v.is_empty() {
                    self.entries.insert(k.to_string(), safe_folder_name(v));
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted numeric keys first, then lexicographic — for the
    /// admin editor.
    pub fn sorted_entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by_key(|(k, _)| match k.parse::<u64>() {
            Ok(n) => (0, n, String::new()),
            Err(_) => (1, 0, k.clone()),
        });
        entries
    }

    /// Parse the admin form: newline-delimited `key:value` pairs, values
    /// sanitized, malformed lines skipped.
    pub fn parse_mapping(text: &str) -> HashMap<String, String> {
        let mut data = HashMap::new();
        for line in text.lines() {
            if let Some((k, v)) = line.trim().split_once(':') {
                let (k, v) = (k.trim(), v.trim());
                if !k.is_empty() && !v.is_empty() {
                    data.insert(k.to_string(), safe_folder_name(v));
                }
            }
        }
        data
    }

    /// Persist a new mapping to the backing file and make it active.
    pub fn save_mapping(&mut self, data: &HashMap<String, String>) -> anyhow::Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("SOURCE_MAP_FILE not set; cannot save"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(data)?)?;
        self.reload();
        Ok(())
    }
}

/// Per-user last-chosen source folder, default "other". Persisted on every
/// change when a backing file is configured.
#[derive(Debug)]
pub struct UserSources {
    entries: HashMap<String, String>,
    path: Option<PathBuf>,
}

impl UserSources {
    pub fn load(path: Option<PathBuf>) -> Self {
        let mut entries = HashMap::new();
        if let Some(p) = &path {
            if p.exists() {
                match std::fs::read_to_string(p)
                    .map_err(anyhow::Error::from)
                    .and_then(|raw| {
                        serde_json::from_str::<HashMap<String, String>>(&raw)
                            .map_err(anyhow::Error::from)
                    }) {
                    Ok(data) => {
                        info!(
                            "Loaded source state from {} ({} entries)",
                            p.display(),
                            data.len()
                        );
                        entries = data;
                    }
                    Err(e) => warn!("Could not load source state from {}: {}", p.display(), e),
                }
            }
        }
        Self { entries, path }
    }

    pub fn get(&self, user_id: &str) -> String {
        self.entries
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| "other".to_string())
    }

    pub fn set(&mut self, user_id: &str, folder: &str) {
        self.entries
            .insert(user_id.to_string(), folder.to_string());
        self.save();
    }

    fn save(&self) {
        let Some(path) = &self.path else { return };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = serde_json::to_string(&self.entries)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(path, json).map_err(anyhow::Error::from));
        if let Err(e) = result {
            warn!("Could not save source state to {}: {}", path.display(), e);
        }
    }
}
