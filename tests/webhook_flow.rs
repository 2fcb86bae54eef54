use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use linecloud::app::{build_router, AppState};
use linecloud::config::{now_local, Config};
use linecloud::error::UploadError;
use linecloud::line::LineApi;
use linecloud::webdav::WebdavApi;
use serde_json::json;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::util::ServiceExt;

const CHANNEL_SECRET: &str = "test-secret";

struct FakeLine {
    replies: Mutex<Vec<(String, String)>>,
    pushes: Mutex<Vec<(String, String)>>,
    content: HashMap<String, Vec<u8>>,
}

impl FakeLine {
    fn with_content(content: HashMap<String, Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            content,
        })
    }
}

#[async_trait::async_trait]
impl LineApi for FakeLine {
    async fn reply(&self, reply_token: &str, text: &str) -> anyhow::Result<()> {
        self.replies
            .lock()
            .unwrap()
            .push((reply_token.to_string(), text.to_string()));
        Ok(())
    }

    async fn push(&self, user_id: &str, text: &str) -> anyhow::Result<()> {
        self.pushes
            .lock()
            .unwrap()
            .push((user_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn fetch_content(&self, message_id: &str) -> anyhow::Result<Vec<u8>> {
        self.content
            .get(message_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no content for message {}", message_id))
    }
}

struct FakeWebdav {
    mkcols: Mutex<Vec<String>>,
    puts: Mutex<Vec<(String, Vec<u8>)>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl FakeWebdav {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mkcols: Mutex::new(Vec::new()),
            puts: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait::async_trait]
impl WebdavApi for FakeWebdav {
    async fn mkcol(&self, path: &str) -> Result<(), UploadError> {
        self.mkcols.lock().unwrap().push(path.to_string());
        Ok(())
    }

    async fn put(&self, path: &str, content: Vec<u8>) -> Result<(), UploadError> {
        self.puts
            .lock()
            .unwrap()
            .push((path.to_string(), content.clone()));
        self.files.lock().unwrap().insert(path.to_string(), content);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, UploadError> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn exists(&self, _path: &str) -> Result<bool, UploadError> {
        Ok(true)
    }
}

fn test_config() -> Config {
    Config {
        line_channel_secret: CHANNEL_SECRET.to_string(),
        line_channel_access_token: "test-token".to_string(),
        nextcloud_url: "https://cloud.example.com".to_string(),
        nextcloud_user: "user".to_string(),
        nextcloud_password: "pass".to_string(),
        enable_line_replies: true,
        admin_password: "hunter2".to_string(),
        ..Config::default()
    }
}

fn app_with_fakes(config: Config, line: Arc<FakeLine>, webdav: Arc<FakeWebdav>) -> Router {
    build_router(AppState::new(config, line, webdav))
}

fn sign_body(body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(CHANNEL_SECRET.as_bytes()).expect("static key is valid");
    mac.update(body.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn webhook_request(body: String) -> Request<Body> {
    Request::post("/callback")
        .header("content-type", "application/json")
        .header("x-line-signature", sign_body(&body))
        .body(Body::from(body))
        .expect("failed to build request")
}

fn media_event(message_id: &str, message_type: &str, file_name: Option<&str>) -> String {
    json!({
        "events": [{
            "type": "message",
            "replyToken": format!("rt-{message_id}"),
            "source": { "userId": "U1", "type": "user" },
            "message": {
                "id": message_id,
                "type": message_type,
                "fileName": file_name
            }
        }]
    })
    .to_string()
}

fn text_event(text: &str) -> String {
    json!({
        "events": [{
            "type": "message",
            "replyToken": "rt-text",
            "source": { "userId": "U1", "type": "user" },
            "message": { "id": format!("t-{}", text.len()), "type": "text", "text": text }
        }]
    })
    .to_string()
}

async fn wait_for_put_count(webdav: &Arc<FakeWebdav>, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if webdav.puts.lock().unwrap().len() >= expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for {} puts (got {})",
                expected,
                webdav.puts.lock().unwrap().len()
            );
        }
        tokio::task::yield_now().await;
    }
}

async fn wait_for_push_count(line: &Arc<FakeLine>, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if line.pushes.lock().unwrap().len() >= expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for {} pushes (got {})",
                expected,
                line.pushes.lock().unwrap().len()
            );
        }
        tokio::task::yield_now().await;
    }
}

async fn assert_no_puts(webdav: &Arc<FakeWebdav>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(webdav.puts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rejects_a_bad_signature() {
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line, webdav.clone());

    let body = media_event("m1", "image", None);
    let req = Request::post("/callback")
        .header("content-type", "application/json")
        .header("x-line-signature", "bm90IGEgcmVhbCBzaWduYXR1cmU=")
        .body(Body::from(body))
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_no_puts(&webdav).await;
}

#[tokio::test]
async fn refuses_webhooks_when_unconfigured() {
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(Config::default(), line, webdav);

    let res = app
        .oneshot(webhook_request(media_event("m1", "image", None)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn backs_up_an_image_to_the_dated_folder() {
    let line = FakeLine::with_content(HashMap::from([("m1".to_string(), vec![0u8; 128])]));
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line.clone(), webdav.clone());

    let res = app
        .oneshot(webhook_request(media_event("m1", "image", None)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    wait_for_put_count(&webdav, 1).await;
    wait_for_push_count(&line, 1).await;
    let today = now_local().format("%Y-%m-%d").to_string();
    let puts = webdav.puts.lock().unwrap();
    let (path, content) = &puts[0];
    assert!(path.starts_with(&format!("LINE_Backup/other/{today}/image/img_")));
    assert!(path.ends_with(".jpg"));
    assert_eq!(content.len(), 128);

    // Every ancestor collection was created before the write.
    let mkcols = webdav.mkcols.lock().unwrap();
    assert_eq!(
        *mkcols,
        vec![
            "LINE_Backup".to_string(),
            "LINE_Backup/other".to_string(),
            format!("LINE_Backup/other/{today}"),
            format!("LINE_Backup/other/{today}/image"),
        ]
    );

    let replies = line.replies.lock().unwrap();
    assert_eq!(replies[0].1, "Received file, preparing download...");
    let pushes = line.pushes.lock().unwrap();
    assert!(pushes[0].1.starts_with("✅ Backed up to LINE_Backup/"));
}

#[tokio::test]
async fn a_redelivered_event_is_processed_once() {
    let line = FakeLine::with_content(HashMap::from([("m1".to_string(), vec![1u8; 16])]));
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line, webdav.clone());

    let body = media_event("m1", "image", None);
    for _ in 0..2 {
        let res = app
            .clone()
            .oneshot(webhook_request(body.clone()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    wait_for_put_count(&webdav, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(webdav.puts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn a_redelivered_link_message_is_processed_once() {
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line.clone(), webdav.clone());

    let body = json!({
        "events": [{
            "type": "message",
            "replyToken": "rt-link",
            "source": { "userId": "U1", "type": "user" },
            "message": {
                "id": "m-link-1",
                "type": "text",
                "text": "read http://127.0.0.1:1/article later"
            }
        }]
    })
    .to_string();

    for _ in 0..2 {
        let res = app
            .clone()
            .oneshot(webhook_request(body.clone()))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    wait_for_put_count(&webdav, 1).await;
    wait_for_push_count(&line, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The redelivery neither uploads again nor notifies again.
    assert_eq!(webdav.puts.lock().unwrap().len(), 1);
    assert_eq!(line.pushes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn text_without_a_sender_is_ignored() {
    let mut config = test_config();
    config.enable_text_backup = true;
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(config, line, webdav.clone());

    let body = json!({
        "events": [{
            "type": "message",
            "message": {
                "id": "m-anon",
                "type": "text",
                "text": "see http://127.0.0.1:1/page"
            }
        }]
    })
    .to_string();
    let res = app.oneshot(webhook_request(body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_no_puts(&webdav).await;
}

#[tokio::test]
async fn identical_content_is_skipped_by_the_hash_gate() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.uploaded_hashes_file = Some(dir.path().join("uploaded_hashes.json"));

    let line = FakeLine::with_content(HashMap::from([
        ("m1".to_string(), b"same bytes".to_vec()),
        ("m2".to_string(), b"same bytes".to_vec()),
    ]));
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(config, line.clone(), webdav.clone());

    let res = app
        .clone()
        .oneshot(webhook_request(media_event("m1", "image", None)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    wait_for_put_count(&webdav, 1).await;
    wait_for_push_count(&line, 1).await;

    // Different message ID, same bytes: the upload is skipped.
    let res = app
        .oneshot(webhook_request(media_event("m2", "image", None)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    wait_for_push_count(&line, 2).await;

    assert_eq!(webdav.puts.lock().unwrap().len(), 1);
    let pushes = line.pushes.lock().unwrap();
    assert_eq!(pushes[1].1, "Already backed up, skipping.");
}

#[tokio::test]
async fn a_file_keeps_its_name_and_suffix() {
    let line = FakeLine::with_content(HashMap::from([("m1".to_string(), b"pdf".to_vec())]));
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line, webdav.clone());

    let res = app
        .oneshot(webhook_request(media_event("m1", "file", Some("My Report.PDF"))))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    wait_for_put_count(&webdav, 1).await;
    let puts = webdav.puts.lock().unwrap();
    assert!(puts[0].0.ends_with("/files/My_Report.PDF"));
}

#[tokio::test]
async fn an_unnamed_file_falls_back_to_a_typed_stem() {
    let line = FakeLine::with_content(HashMap::from([("m9".to_string(), b"data".to_vec())]));
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line, webdav.clone());

    let res = app
        .oneshot(webhook_request(media_event("m9", "file", None)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    wait_for_put_count(&webdav, 1).await;
    let puts = webdav.puts.lock().unwrap();
    assert!(puts[0].0.ends_with("/files/file_m9"));
}

#[tokio::test]
async fn a_mapped_key_switches_the_sender_folder() {
    let dir = tempfile::tempdir().unwrap();
    let map_path = dir.path().join("source_map.json");
    std::fs::write(&map_path, r#"{"1":"Amigo"}"#).unwrap();
    let mut config = test_config();
    config.source_map_file = Some(map_path);

    let line = FakeLine::with_content(HashMap::from([("m1".to_string(), vec![7u8; 8])]));
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(config, line.clone(), webdav.clone());

    let res = app
        .clone()
        .oneshot(webhook_request(text_event("1")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while line.replies.lock().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no reply received");
        tokio::task::yield_now().await;
    }
    assert_eq!(line.replies.lock().unwrap()[0].1, "Source set to: Amigo");

    let res = app
        .oneshot(webhook_request(media_event("m1", "image", None)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    wait_for_put_count(&webdav, 1).await;
    assert!(webdav.puts.lock().unwrap()[0].0.contains("/Amigo/"));
}

#[tokio::test]
async fn oversized_files_are_rejected_without_upload() {
    let mut config = test_config();
    config.max_file_size_mb = 0.001; // ~1 KB

    let line = FakeLine::with_content(HashMap::from([("m1".to_string(), vec![0u8; 10 * 1024])]));
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(config, line.clone(), webdav.clone());

    let res = app
        .oneshot(webhook_request(media_event("m1", "video", None)))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    wait_for_push_count(&line, 1).await;
    let pushes = line.pushes.lock().unwrap();
    assert!(pushes[0].1.starts_with("❌ Backup failed: File too large"));
    assert_no_puts(&webdav).await;
}

#[tokio::test]
async fn a_link_message_is_backed_up_as_text() {
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line, webdav.clone());

    // Unroutable address: the title fetch fails fast and the link gets a
    // plain generated name.
    let res = app
        .oneshot(webhook_request(text_event(
            "worth reading http://127.0.0.1:1/article",
        )))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    wait_for_put_count(&webdav, 1).await;
    let puts = webdav.puts.lock().unwrap();
    let (path, content) = &puts[0];
    assert!(path.contains("/link/link_"));
    assert!(path.ends_with(".txt"));
    let body = String::from_utf8(content.clone()).unwrap();
    assert!(body.contains("http://127.0.0.1:1/article"));
}

#[tokio::test]
async fn plain_text_lands_in_the_daily_note() {
    let mut config = test_config();
    config.enable_text_backup = true;

    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(config, line, webdav.clone());

    let res = app
        .clone()
        .oneshot(webhook_request(text_event("buy milk")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    wait_for_put_count(&webdav, 1).await;

    let res = app
        .oneshot(webhook_request(text_event("and also eggs")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    wait_for_put_count(&webdav, 2).await;

    let puts = webdav.puts.lock().unwrap();
    assert!(puts[1].0.ends_with("/notes.txt"));
    let body = String::from_utf8(puts[1].1.clone()).unwrap();
    assert!(body.contains("buy milk"));
    assert!(body.ends_with("and also eggs"));
}

#[tokio::test]
async fn health_reports_ok_with_a_reachable_backend() {
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line, webdav);

    let res = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn status_page_renders_without_credentials() {
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(Config::default(), line, webdav);

    let res = app
        .oneshot(Request::get("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), 64 * 1024).await.unwrap();
    let html = String::from_utf8(body.to_vec()).unwrap();
    assert!(html.contains("Backup Status"));
    assert!(html.contains("LINE_CHANNEL_SECRET"));
}

fn login_request(ip: &str, password: &str) -> Request<Body> {
    Request::post("/admin/login")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("x-forwarded-for", ip)
        .body(Body::from(format!("password={password}")))
        .unwrap()
}

async fn body_text(res: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(res.into_body(), 64 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn admin_requires_a_session() {
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line, webdav);

    let res = app
        .oneshot(Request::get("/admin").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(res.headers().get("location").unwrap(), "/admin/login");
}

#[tokio::test]
async fn a_correct_password_opens_an_admin_session() {
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line, webdav);

    let res = app
        .clone()
        .oneshot(login_request("5.6.7.8", "hunter2"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SEE_OTHER);
    assert_eq!(res.headers().get("location").unwrap(), "/admin");
    let cookie = res
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .expect("session cookie is set")
        .to_string();
    assert!(cookie.starts_with("admin_session="));

    let session = cookie.split(';').next().unwrap().to_string();
    let res = app
        .oneshot(
            Request::get("/admin")
                .header("cookie", session)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(body_text(res).await.contains("Source Mapping"));
}

#[tokio::test]
async fn repeated_failures_lock_the_client_out() {
    let line = FakeLine::with_content(HashMap::new());
    let webdav = FakeWebdav::new();
    let app = app_with_fakes(test_config(), line, webdav);

    for attempt in 1..=4 {
        let res = app
            .clone()
            .oneshot(login_request("1.2.3.4", "wrong"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let html = body_text(res).await;
        assert!(html.contains(&format!("{} attempt(s) left", 5 - attempt)));
    }

    let res = app
        .clone()
        .oneshot(login_request("1.2.3.4", "wrong"))
        .await
        .unwrap();
    let html = body_text(res).await;
    assert!(html.contains("locked for 15 minutes"));

    // Even the right password is refused while the lock holds.
    let res = app
        .clone()
        .oneshot(login_request("1.2.3.4", "hunter2"))
        .await
        .unwrap();
    let html = body_text(res).await;
    assert!(html.contains("Try again in"));

    // A different client is unaffected.
    let res = app
        .oneshot(login_request("9.9.9.9", "hunter2"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SEE_OTHER);
}
