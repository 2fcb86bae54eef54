use chrono::{DateTime, FixedOffset};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::now_local;
use crate::error::UploadError;
use crate::sources::safe_folder_name;
use crate::webdav::WebdavApi;

const MAX_UPLOAD_ATTEMPTS: u32 = 3;
const MAX_STEM_LEN: usize = 80;
const MAX_TITLE_LEN: usize = 60;
const DAILY_NOTE_NAME: &str = "notes.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Image,
    Video,
    Audio,
    File,
    Link,
}

impl ItemType {
    pub fn from_line_type(message_type: &str) -> Option<Self> {
        match message_type {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    /// Subfolder under the date folder.
    pub fn subfolder(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Link => "link",
            Self::Audio | Self::File => "files",
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Image => "img",
            Self::Video => "vid",
            Self::Audio => "aud",
            Self::Link => "link",
            Self::File => "file",
        }
    }

    /// Fixed extension by type; empty means "use the suggested name's".
    fn extension(self) -> &'static str {
        match self {
            Self::Image => ".jpg",
            Self::Video => ".mp4",
            Self::Audio => ".m4a",
            Self::File => "",
            Self::Link => ".txt",
        }
    }
}

/// Sanitize a filename stem: alphanumeric, space, `_`, `-` and `.` survive,
/// everything else becomes `_`; whitespace runs collapse to a single `_`;
/// capped at 80 chars, stripped of leading/trailing `.`/`_`; never empty.
pub fn sanitize_stem(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join("_");
    let capped: String = joined.chars().take(MAX_STEM_LEN).collect();
    let trimmed = capped.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Sanitize a display title for use in a filename. Unlike stems, an empty
/// result is allowed (the title is optional).
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || matches!(c, '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join("_");
    let capped: String = joined.chars().take(MAX_TITLE_LEN).collect();
    capped.trim_matches(|c| c == '.' || c == '_').to_string()
}

fn file_stem_of(name: &str) -> &str {
    Path::new(name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
}

fn suffix_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
}

/// Remote destination path for an item: a pure function of the clock, type,
/// source and suggested name.
///
/// `base/source/YYYY-MM-DD/subfolder/filename`, where `file` items keep a
/// sanitized stem of their suggested name and other types get a
/// `prefix_yyyymmdd_hhmmss_millis` name. Collisions within one millisecond
/// are possible and accepted (last writer wins).
pub fn destination(
    now: DateTime<FixedOffset>,
    item: ItemType,
    source: &str,
    suggested_name: &str,
    base: &str,
) -> String {
    let ext = match item.extension() {
        "" => suffix_of(suggested_name).unwrap_or_default(),
        ext => ext.to_string(),
    };
    let name = match item {
        ItemType::File => format!("{}{}", sanitize_stem(file_stem_of(suggested_name)), ext),
        ItemType::Link => {
            let stamp = format!(
                "link_{}_{}_{}",
                now.format("%Y%m%d"),
                now.format("%H%M%S"),
                now.format("%3f")
            );
            // An optional page title joins the generated name.
            let title = sanitize_title(file_stem_of(suggested_name));
            if title.is_empty() || title == "link" {
                format!("{stamp}{ext}")
            } else {
                format!("{stamp}_{title}{ext}")
            }
        }
        _ => format!(
            "{}_{}_{}_{}{}",
            item.prefix(),
            now.format("%Y%m%d"),
            now.format("%H%M%S"),
            now.format("%3f"),
            ext
        ),
    };
    format!(
        "{}/{}/{}/{}/{}",
        base.trim_matches('/'),
        safe_folder_name(source),
        now.format("%Y-%m-%d"),
        item.subfolder(),
        name
    )
}

/// Every ancestor collection of a remote file path, shallowest first.
fn ancestor_dirs(remote_path: &str) -> Vec<String> {
    let segments: Vec<&str> = remote_path.split('/').collect();
    (1..segments.len())
        .map(|i| segments[..i].join("/"))
        .collect()
}

/// Run `op` up to `max_attempts` times, sleeping `1.5s * attempt` between
/// failures; the last error is surfaced.
pub async fn with_retries<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, UploadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UploadError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(e) => {
                warn!("Upload attempt {}/{} failed: {}", attempt, max_attempts, e);
                tokio::time::sleep(Duration::from_millis(1500 * u64::from(attempt))).await;
            }
        }
    }
}

/// Computes destinations and performs the MKCOL-then-PUT write sequence
/// with bounded retries.
pub struct Uploader {
    webdav: Arc<dyn WebdavApi>,
    base_path: String,
}

impl Uploader {
    pub fn new(webdav: Arc<dyn WebdavApi>, base_path: impl Into<String>) -> Self {
        Self {
            webdav,
            base_path: base_path.into(),
        }
    }

    /// Upload `content` and return the remote path it was written to.
    pub async fn upload(
        &self,
        content: &[u8],
        item: ItemType,
        source: &str,
        suggested_name: &str,
    ) -> Result<String, UploadError> {
        let remote_path = destination(now_local(), item, source, suggested_name, &self.base_path);
        self.write_with_retries(&remote_path, content).await?;
        Ok(remote_path)
    }

    async fn write_with_retries(
        &self,
        remote_path: &str,
        content: &[u8],
    ) -> Result<(), UploadError> {
        let dirs = ancestor_dirs(remote_path);
        with_retries(MAX_UPLOAD_ATTEMPTS, || {
            let webdav = self.webdav.clone();
            let dirs = dirs.clone();
            let path = remote_path.to_string();
            let content = content.to_vec();
            async move {
                for dir in &dirs {
                    webdav.mkcol(dir).await?;
                }
                webdav.put(&path, content).await
            }
        })
        .await
    }

    /// Append a timestamped block to the date folder's notes file,
    /// creating it when missing. Read-then-write with no concurrency
    /// control: two texts in the same instant may lose one block.
    pub async fn append_daily_note(
        &self,
        source: &str,
        text: &str,
    ) -> Result<String, UploadError> {
        let now = now_local();
        let remote_dir = format!(
            "{}/{}/{}",
            self.base_path.trim_matches('/'),
            safe_folder_name(source),
            now.format("%Y-%m-%d")
        );
        let remote_path = format!("{remote_dir}/{DAILY_NOTE_NAME}");
        let existing = self
            .webdav
            .get(&remote_path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        let block = format!("\n---\n{}\n{}\n", now.format("%H:%M"), text.trim());
        let content = format!("{existing}{block}").trim().to_string();
        for dir in ancestor_dirs(&remote_path) {
            self.webdav.mkcol(&dir).await?;
        }
        self.webdav.put(&remote_path, content.into_bytes()).await?;
        Ok(remote_path)
    }
}
