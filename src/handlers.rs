use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::app::AppState;
use crate::error::BackupError;
use crate::line::{EventMessage, WebhookEvent};
use crate::link_meta::fetch_page_title;
use crate::upload::ItemType;

/// Sender notifications never include more error text than this.
const MAX_ERROR_NOTIFY_LEN: usize = 500;

/// Handle one webhook event end to end. Never returns an error: every
/// failure is logged and, when replies are enabled, pushed back to the
/// sender.
pub async fn process_event(state: AppState, event: WebhookEvent) {
    if event.event_type != "message" {
        return;
    }
    let Some(message) = event.message.clone() else {
        return;
    };
    match ItemType::from_line_type(&message.message_type) {
        Some(item) => handle_media(&state, &event, &message, item).await,
        None if message.message_type == "text" => handle_text(&state, &event, &message).await,
        None => info!("Ignoring {} message {}", message.message_type, message.id),
    }
}

async fn handle_media(
    state: &AppState,
    event: &WebhookEvent,
    message: &EventMessage,
    item: ItemType,
) {
    // Mark the delivery before downloading anything: a redelivered webhook
    // must not trigger a second download even if the first is still running.
    {
        let mut seen = state.processed_ids.lock().await;
        if seen.contains(&message.id) {
            info!("Skipping already-processed message {}", message.id);
            return;
        }
        seen.add(&message.id);
    }

    try_reply(state, event, "Received file, preparing download...").await;

    let source = source_for(state, event.user_id()).await;
    // Media without a client-supplied name still gets a meaningful stem.
    let suggested_name = message
        .file_name
        .clone()
        .unwrap_or_else(|| format!("{}_{}", message.message_type, message.id));
    let result = backup_media(state, &message.id, item, &source, &suggested_name).await;
    notify_outcome(state, event, result).await;
}

async fn backup_media(
    state: &AppState,
    message_id: &str,
    item: ItemType,
    source: &str,
    suggested_name: &str,
) -> Result<String, BackupError> {
    let content = state
        .line
        .fetch_content(message_id)
        .await
        .map_err(BackupError::Fetch)?;
    if content.is_empty() {
        return Err(BackupError::Validation(
            "Downloaded content was empty".to_string(),
        ));
    }
    let limit_mb = state.config.max_file_size_mb;
    if limit_mb > 0.0 {
        let size_mb = content.len() as f64 / (1024.0 * 1024.0);
        if size_mb > limit_mb {
            return Err(BackupError::Validation(format!(
                "File too large: {size_mb:.1} MB (limit {limit_mb} MB)"
            )));
        }
    }
    let hash = content_gate(state, &content).await?;
    let path = state
        .uploader
        .upload(&content, item, source, suggested_name)
        .await?;
    record_success(state, hash.as_deref()).await;
    info!("Backed up message {} to {}", message_id, path);
    Ok(path)
}

async fn handle_text(state: &AppState, event: &WebhookEvent, message: &EventMessage) {
    let Some(user_id) = event.user_id() else {
        return;
    };
    let text = message.text.as_deref().unwrap_or("").trim().to_string();
    if text.is_empty() {
        return;
    }

    if let Some(folder) = source_command(state, &text).await {
        state.user_sources.lock().await.set(user_id, &folder);
        info!("User {} switched source to {}", user_id, folder);
        try_reply(state, event, &format!("Source set to: {folder}")).await;
        return;
    }

    let urls = extract_urls(&text);
    if !urls.is_empty() {
        // Link texts go through the same delivery gate as media: a
        // redelivered webhook must not re-upload or re-notify.
        {
            let mut seen = state.processed_ids.lock().await;
            if seen.contains(&message.id) {
                info!("Skipping already-processed message {}", message.id);
                return;
            }
            seen.add(&message.id);
        }
        let source = source_for(state, Some(user_id)).await;
        for url in urls {
            let result = backup_link(state, &url, &source).await;
            notify_outcome(state, event, result).await;
        }
        return;
    }

    if state.config.enable_text_backup {
        let source = source_for(state, Some(user_id)).await;
        match state.uploader.append_daily_note(&source, &text).await {
            Ok(path) => {
                record_success(state, None).await;
                info!("Appended note to {}", path);
                try_reply(state, event, "Added to today's notes.").await;
            }
            Err(e) => notify_outcome(state, event, Err(e.into())).await,
        }
    }
}

/// "0", "other" and "reset" return to the default folder; any other text
/// that matches a source map key selects that mapping.
async fn source_command(state: &AppState, text: &str) -> Option<String> {
    let lowered = text.to_lowercase();
    if matches!(lowered.as_str(), "0" | "other" | "reset") {
        return Some("other".to_string());
    }
    state.source_map.lock().await.get(text).map(str::to_string)
}

async fn backup_link(state: &AppState, url: &str, source: &str) -> Result<String, BackupError> {
    let hash = link_gate(state, url).await?;
    let title = fetch_page_title(url).await;
    let suggested_name = if title.is_empty() {
        "link.txt".to_string()
    } else {
        format!("{title}.txt")
    };
    let content = if title.is_empty() {
        format!("{url}\n")
    } else {
        format!("{title}\n{url}\n")
    };
    let path = state
        .uploader
        .upload(content.as_bytes(), ItemType::Link, source, &suggested_name)
        .await?;
    record_success(state, hash.as_deref()).await;
    info!("Backed up link {} to {}", url, path);
    Ok(path)
}

/// Duplicate-content gate for media bytes. `None` when hashing is disabled.
async fn content_gate(state: &AppState, content: &[u8]) -> Result<Option<String>, BackupError> {
    if state.config.uploaded_hashes_file.is_none() {
        return Ok(None);
    }
    let hash = sha256_hex(content);
    if state.uploaded_hashes.lock().await.contains(&hash) {
        return Err(BackupError::Duplicate);
    }
    Ok(Some(hash))
}

/// Same gate keyed on the URL itself, so a re-sent link is caught without
/// refetching the page.
async fn link_gate(state: &AppState, url: &str) -> Result<Option<String>, BackupError> {
    if state.config.uploaded_hashes_file.is_none() {
        return Ok(None);
    }
    let hash = sha256_hex(url.as_bytes());
    if state.uploaded_hashes.lock().await.contains(&hash) {
        return Err(BackupError::Duplicate);
    }
    Ok(Some(hash))
}

/// Hashes are recorded only after the upload succeeded, so a failed upload
/// can be retried by re-sending.
async fn record_success(state: &AppState, hash: Option<&str>) {
    if let Some(hash) = hash {
        state.uploaded_hashes.lock().await.add(hash);
    }
    state.stats.lock().await.record_upload();
}

async fn source_for(state: &AppState, user_id: Option<&str>) -> String {
    match user_id {
        Some(id) => state.user_sources.lock().await.get(id),
        None => "other".to_string(),
    }
}

async fn notify_outcome(
    state: &AppState,
    event: &WebhookEvent,
    result: Result<String, BackupError>,
) {
    let text = match result {
        Ok(path) => format!("✅ Backed up to {path}"),
        Err(BackupError::Duplicate) => "Already backed up, skipping.".to_string(),
        Err(e) => {
            error!("Backup failed: {}", e);
            let detail: String = e.to_string().chars().take(MAX_ERROR_NOTIFY_LEN).collect();
            format!("❌ Backup failed: {detail}")
        }
    };
    try_push(state, event, &text).await;
}

/// Best-effort reply within the event's reply window. No-op when replies
/// are disabled.
async fn try_reply(state: &AppState, event: &WebhookEvent, text: &str) {
    if !state.config.enable_line_replies {
        return;
    }
    let Some(token) = event.reply_token.as_deref() else {
        return;
    };
    if let Err(e) = state.line.reply(token, text).await {
        warn!("Could not send reply: {}", e);
    }
}

/// Best-effort push to the sender. Used for outcomes, which typically land
/// after the reply token has been consumed by the ack.
async fn try_push(state: &AppState, event: &WebhookEvent, text: &str) {
    if !state.config.enable_line_replies {
        return;
    }
    let Some(user_id) = event.user_id() else {
        return;
    };
    if let Err(e) = state.line.push(user_id, text).await {
        warn!("Could not send push: {}", e);
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Find `http://` / `https://` URLs in free text. A URL runs until
/// whitespace or an HTML-ish delimiter, with trailing punctuation trimmed.
pub fn extract_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut from = 0;
    while let Some(found) = text[from..].find("http") {
        let start = from + found;
        let rest = &text[start..];
        if !rest.starts_with("http://") && !rest.starts_with("https://") {
            from = start + "http".len();
            continue;
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '"' | '\''))
            .unwrap_or(rest.len());
        let url = rest[..end].trim_end_matches(['.', ',', ';', '!', '?', ')', ']']);
        if url.len() > "https://".len() {
            urls.push(url.to_string());
        }
        from = start + end.max("http".len());
    }
    urls
}
