use anyhow::Result;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::admin;
use crate::config::Config;
use crate::handlers::process_event;
use crate::line::{validate_signature, LineApi, LineClient, WebhookPayload};
use crate::ratelimit::LoginLimiter;
use crate::sources::{SourceMap, UserSources};
use crate::stats::BackupStats;
use crate::store::{SavePolicy, SeenSet};
use crate::upload::Uploader;
use crate::webdav::{WebdavApi, WebdavClient};

const MAX_BODY_BYTES: usize = 1024 * 1024;
const MAX_CONCURRENT_JOBS: usize = 8;

/// Message-ID dedup window; LINE redeliveries arrive within minutes, so a
/// modest window is plenty.
const PROCESSED_IDS_CAPACITY: usize = 10_000;
/// Content hashes are small and long-lived; keep many more of them.
const UPLOADED_HASHES_CAPACITY: usize = 50_000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub line: Arc<dyn LineApi>,
    pub webdav: Arc<dyn WebdavApi>,
    pub uploader: Arc<Uploader>,
    pub processed_ids: Arc<Mutex<SeenSet>>,
    pub uploaded_hashes: Arc<Mutex<SeenSet>>,
    pub login_limiter: Arc<Mutex<LoginLimiter>>,
    pub source_map: Arc<Mutex<SourceMap>>,
    pub user_sources: Arc<Mutex<UserSources>>,
    pub stats: Arc<Mutex<BackupStats>>,
    pub processing_sem: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: Config, line: Arc<dyn LineApi>, webdav: Arc<dyn WebdavApi>) -> Self {
        let uploader = Arc::new(Uploader::new(
            webdav.clone(),
            config.nextcloud_base_path.clone(),
        ));
        // Message IDs arrive in bursts; batching their snapshot keeps disk
        // writes off the hot path. Hashes guard real dedup decisions and
        // are persisted immediately.
        let processed_ids = SeenSet::load(
            config.processed_ids_file.clone(),
            PROCESSED_IDS_CAPACITY,
            SavePolicy::Batched {
                every: 50,
                interval: Duration::from_secs(60),
            },
        );
        let uploaded_hashes = SeenSet::load(
            config.uploaded_hashes_file.clone(),
            UPLOADED_HASHES_CAPACITY,
            SavePolicy::EveryMutation,
        );
        let login_limiter = LoginLimiter::load(config.login_rate_limit_file.clone());
        let source_map = SourceMap::load(config.source_map_file.clone());
        let user_sources = UserSources::load(config.source_state_file.clone());
        let stats = BackupStats::load(config.stats_file.clone());
        Self {
            config: Arc::new(config),
            line,
            webdav,
            uploader,
            processed_ids: Arc::new(Mutex::new(processed_ids)),
            uploaded_hashes: Arc::new(Mutex::new(uploaded_hashes)),
            login_limiter: Arc::new(Mutex::new(login_limiter)),
            source_map: Arc::new(Mutex::new(source_map)),
            user_sources: Arc::new(Mutex::new(user_sources)),
            stats: Arc::new(Mutex::new(stats)),
            processing_sem: Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS)),
        }
    }

    /// Persist any batched state. Called once on graceful shutdown.
    pub async fn flush(&self) {
        self.processed_ids.lock().await.flush();
        self.uploaded_hashes.lock().await.flush();
    }
}

pub async fn run_server() -> Result<()> {
    let config = Config::from_env();
    let (missing_required, missing_recommended) = config.missing_keys();
    if !missing_required.is_empty() {
        warn!(
            "Missing required settings: {} (webhook processing disabled)",
            missing_required.join(", ")
        );
    }
    if !missing_recommended.is_empty() {
        warn!("Missing recommended settings: {}", missing_recommended.join(", "));
    }
    let line: Arc<dyn LineApi> =
        Arc::new(LineClient::new(config.line_channel_access_token.clone())?);
    let webdav: Arc<dyn WebdavApi> = Arc::new(WebdavClient::from_config(&config)?);
    let port = config.port;
    let state = AppState::new(config, line, webdav);
    if state.source_map.lock().await.is_empty() {
        warn!("Source map is empty; all backups go to the default folder");
    }
    let app = build_router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    // Batched state is flushed even when the server loop ends in error.
    state.flush().await;
    served?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/callback", post(handle_callback))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/admin", get(admin::admin_get).post(admin::admin_post))
        .route(
            "/admin/login",
            get(admin::login_get).post(admin::login_post),
        )
        .route("/admin/logout", get(admin::logout))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.config.line_configured() || !state.config.nextcloud_configured() {
        warn!("Rejecting webhook: service is not fully configured");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Not configured").into_response();
    }

    let signature = headers
        .get("x-line-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !validate_signature(&state.config.line_channel_secret, &body, signature) {
        warn!("Webhook signature verification failed");
        return (StatusCode::BAD_REQUEST, "Bad signature").into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            warn!("Rejecting webhook: invalid JSON body: {}", e);
            return (StatusCode::BAD_REQUEST, "Bad request").into_response();
        }
    };

    // Ack immediately; processing (downloads, uploads, retries) can take
    // far longer than LINE's webhook timeout.
    for event in payload.events {
        let state = state.clone();
        tokio::spawn(async move {
            let Ok(_permit) = state.processing_sem.clone().acquire_owned().await else {
                return;
            };
            process_event(state, event).await;
        });
    }

    (StatusCode::OK, "OK").into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    if !state.config.nextcloud_configured() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "reason": "nextcloud not configured" })),
        )
            .into_response();
    }
    match state.webdav.exists("").await {
        Ok(true) => Json(json!({ "status": "ok" })).into_response(),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "reason": "webdav root not found" })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "reason": e.to_string() })),
        )
            .into_response(),
    }
}

async fn status(State(state): State<AppState>) -> Html<String> {
    let line_ok = state.config.line_configured();
    let nextcloud_ok = state.config.nextcloud_configured()
        && state.webdav.exists("").await.unwrap_or(false);
    let (last_backup, count_today) = {
        let mut stats = state.stats.lock().await;
        let last = stats
            .last_backup_at()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "—".to_string());
        (last, stats.count_today())
    };
    let (missing_required, missing_recommended) = state.config.missing_keys();
    let missing = if missing_required.is_empty() && missing_recommended.is_empty() {
        String::new()
    } else {
        let mut items = String::new();
        for key in missing_required {
            items.push_str(&format!("<li><b>{key}</b> (required)</li>"));
        }
        for key in missing_recommended {
            items.push_str(&format!("<li>{key}</li>"));
        }
        format!("<h2>Missing settings</h2><ul>{items}</ul>")
    };
    let mark = |ok: bool| if ok { "✅" } else { "❌" };
    Html(format!(
        "<!doctype html><html><head><title>Backup Status</title>\
         <style>body{{font-family:sans-serif;max-width:40em;margin:4em auto}}</style>\
         </head><body><h1>Backup Status</h1><ul>\
         <li>LINE: {}</li>\
         <li>Nextcloud: {}</li>\
         <li>Last backup: {}</li>\
         <li>Backups today: {}</li>\
         </ul>{}</body></html>",
        mark(line_ok),
        mark(nextcloud_ok),
        last_backup,
        count_today,
        missing
    ))
}

async fn landing(headers: HeaderMap) -> Response {
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);
    if wants_json {
        return Json(json!({
            "service": "linecloud",
            "version": env!("CARGO_PKG_VERSION"),
        }))
        .into_response();
    }
    Html(
        "<!doctype html><html><head><title>linecloud</title></head>\
         <body><h1>linecloud</h1>\
         <p>LINE-to-Nextcloud backup relay. See <a href=\"/status\">/status</a>.</p>\
         </body></html>"
            .to_string(),
    )
    .into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
