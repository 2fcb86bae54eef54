use chrono::{DateTime, FixedOffset, Utc};
use std::env;
use std::path::PathBuf;

pub const ADMIN_COOKIE_NAME: &str = "admin_session";
pub const ADMIN_SESSION_SECONDS: i64 = 3600;

pub const LOGIN_MAX_FAILED: u32 = 5;
pub const LOGIN_LOCK_SECONDS: i64 = 15 * 60;

pub const DEFAULT_BASE_PATH: &str = "LINE_Backup";
const DEFAULT_PORT: u16 = 8080;

/// Required for the webhook-to-Nextcloud path; missing keys disable that
/// path (500 at /callback) but never stop the process.
pub const REQUIRED_ENV_KEYS: [&str; 5] = [
    "LINE_CHANNEL_SECRET",
    "LINE_CHANNEL_ACCESS_TOKEN",
    "NEXTCLOUD_URL",
    "NEXTCLOUD_USER",
    "NEXTCLOUD_PASSWORD",
];

pub const RECOMMENDED_ENV_KEYS: [&str; 2] = ["ADMIN_PASSWORD", "SOURCE_MAP_FILE"];

/// Folder dates and filename times use Taipei time (UTC+8, no DST).
pub fn tz() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("UTC+8 is a valid offset")
}

pub fn now_local() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&tz())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub line_channel_secret: String,
    pub line_channel_access_token: String,
    pub nextcloud_url: String,
    pub nextcloud_user: String,
    pub nextcloud_password: String,
    pub nextcloud_base_path: String,
    /// When true: reply on receipt and push success/error. When false: silent.
    pub enable_line_replies: bool,
    /// When true: plain text (no URL) is appended to a daily notes.txt.
    pub enable_text_backup: bool,
    /// Max accepted file size in MB; 0 = no limit.
    pub max_file_size_mb: f64,
    /// Empty = admin pages are open (a warning is shown).
    pub admin_password: String,
    pub source_map_file: Option<PathBuf>,
    pub source_state_file: Option<PathBuf>,
    pub processed_ids_file: Option<PathBuf>,
    pub uploaded_hashes_file: Option<PathBuf>,
    pub login_rate_limit_file: Option<PathBuf>,
    pub stats_file: Option<PathBuf>,
    pub port: u16,
}

fn env_trimmed(key: &str) -> String {
    env::var(key).unwrap_or_default().trim().to_string()
}

fn env_flag(key: &str) -> bool {
    matches!(
        env_trimmed(key).to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Path-valued setting with a default; an explicitly empty value disables
/// the feature backed by that file.
fn env_path(key: &str, default: &str) -> Option<PathBuf> {
    let value = match env::var(key) {
        Ok(v) => v.trim().to_string(),
        Err(_) => default.to_string(),
    };
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

impl Config {
    pub fn from_env() -> Self {
        let base_path = env_trimmed("NEXTCLOUD_BASE_PATH");
        let base_path = base_path.trim_matches('/');
        let port = env_trimmed("PORT").parse().unwrap_or(DEFAULT_PORT);
        Self {
            line_channel_secret: env_trimmed("LINE_CHANNEL_SECRET"),
            line_channel_access_token: env_trimmed("LINE_CHANNEL_ACCESS_TOKEN"),
            nextcloud_url: env_trimmed("NEXTCLOUD_URL")
                .trim_end_matches('/')
                .to_string(),
            nextcloud_user: env_trimmed("NEXTCLOUD_USER"),
            nextcloud_password: env_trimmed("NEXTCLOUD_PASSWORD"),
            nextcloud_base_path: if base_path.is_empty() {
                DEFAULT_BASE_PATH.to_string()
            } else {
                base_path.to_string()
            },
            enable_line_replies: env_flag("ENABLE_LINE_REPLIES"),
            enable_text_backup: env_flag("ENABLE_TEXT_BACKUP"),
            max_file_size_mb: env_trimmed("MAX_FILE_SIZE_MB").parse().unwrap_or(0.0),
            admin_password: env_trimmed("ADMIN_PASSWORD"),
            source_map_file: env_path("SOURCE_MAP_FILE", "data/source_map.json"),
            source_state_file: env_path("SOURCE_STATE_FILE", "data/source_state.json"),
            processed_ids_file: env_path("PROCESSED_IDS_FILE", "data/processed_ids.json"),
            uploaded_hashes_file: env_path("UPLOADED_HASHES_FILE", "data/uploaded_hashes.json"),
            login_rate_limit_file: env_path("LOGIN_RATE_LIMIT_FILE", "data/login_rate_limit.json"),
            stats_file: env_path("STATS_FILE", "data/backup_stats.json"),
            port,
        }
    }

    pub fn line_configured(&self) -> bool {
        !self.line_channel_secret.is_empty() && !self.line_channel_access_token.is_empty()
    }

    pub fn nextcloud_configured(&self) -> bool {
        !self.nextcloud_url.is_empty()
            && !self.nextcloud_user.is_empty()
            && !self.nextcloud_password.is_empty()
    }

    /// (missing required, missing recommended) for the status page.
    pub fn missing_keys(&self) -> (Vec<&'static str>, Vec<&'static str>) {
        let required = [
            ("LINE_CHANNEL_SECRET", self.line_channel_secret.is_empty()),
            (
                "LINE_CHANNEL_ACCESS_TOKEN",
                self.line_channel_access_token.is_empty(),
            ),
            ("NEXTCLOUD_URL", self.nextcloud_url.is_empty()),
            ("NEXTCLOUD_USER", self.nextcloud_user.is_empty()),
            ("NEXTCLOUD_PASSWORD", self.nextcloud_password.is_empty()),
        ];
        let recommended = [
            ("ADMIN_PASSWORD", self.admin_password.is_empty()),
            ("SOURCE_MAP_FILE", self.source_map_file.is_none()),
        ];
        let pick = |keys: &[(&'static str, bool)]| {
            keys.iter()
                .filter(|(_, missing)| *missing)
                .map(|(k, _)| *k)
                .collect::<Vec<_>>()
        };
        (pick(&required), pick(&recommended))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            line_channel_secret: String::new(),
            line_channel_access_token: String::new(),
            nextcloud_url: String::new(),
            nextcloud_user: String::new(),
            nextcloud_password: String::new(),
            nextcloud_base_path: DEFAULT_BASE_PATH.to_string(),
            enable_line_replies: false,
            enable_text_backup: false,
            max_file_size_mb: 0.0,
            admin_password: String::new(),
            source_map_file: None,
            source_state_file: None,
            processed_ids_file: None,
            uploaded_hashes_file: None,
            login_rate_limit_file: None,
            stats_file: None,
            port: DEFAULT_PORT,
        }
    }
}
