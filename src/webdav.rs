use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;

use crate::config::Config;
use crate::error::UploadError;

const MKCOL_TIMEOUT: Duration = Duration::from_secs(30);
const PUT_TIMEOUT: Duration = Duration::from_secs(120);
const GET_TIMEOUT: Duration = Duration::from_secs(30);
const PROPFIND_TIMEOUT: Duration = Duration::from_secs(10);

/// How much of an error body is kept in surfaced errors.
const BODY_SNIPPET_LEN: usize = 200;

/// Remote file storage over WebDAV verbs. The protocol is used as an
/// opaque transport: MKCOL to create a folder, PUT to write, GET to read,
/// PROPFIND as an existence probe.
#[async_trait]
pub trait WebdavApi: Send + Sync {
    /// Idempotent: an already-existing collection is success.
    async fn mkcol(&self, path: &str) -> Result<(), UploadError>;
    async fn put(&self, path: &str, content: Vec<u8>) -> Result<(), UploadError>;
    /// `None` when there is no existing content at `path`.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, UploadError>;
    async fn exists(&self, path: &str) -> Result<bool, UploadError>;
}

#[derive(Debug, Clone)]
pub struct WebdavClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl WebdavClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let user_agent = format!("linecloud/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()
            .context("Failed to build WebDAV HTTP client")?;
        Ok(Self {
            client,
            base_url: config.nextcloud_url.trim_end_matches('/').to_string(),
            username: config.nextcloud_user.clone(),
            password: config.nextcloud_password.clone(),
        })
    }

    /// Full URL for a path under the user's WebDAV root, segments
    /// percent-encoded.
    fn url_for(&self, path: &str) -> String {
        let encoded = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|seg| urlencoding::encode(seg).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if encoded.is_empty() {
            format!("{}/remote.php/webdav/", self.base_url)
        } else {
            format!("{}/remote.php/webdav/{}", self.base_url, encoded)
        }
    }

    async fn send(
        &self,
        verb: &'static str,
        method: Method,
        path: &str,
        timeout: Duration,
        body: Option<Vec<u8>>,
        depth_zero: bool,
    ) -> Result<reqwest::Response, UploadError> {
        let mut req = self
            .client
            .request(method, self.url_for(path))
            .basic_auth(&self.username, Some(&self.password))
            .timeout(timeout);
        if let Some(body) = body {
            req = req.body(body);
        }
        if depth_zero {
            req = req.header("Depth", "0");
        }
        req.send().await.map_err(|source| UploadError::Transport {
            verb,
            path: path.to_string(),
            source,
        })
    }

    async fn status_error(
        verb: &'static str,
        path: &str,
        res: reqwest::Response,
    ) -> UploadError {
        let status = res.status().as_u16();
        let body = res.text().await.unwrap_or_default();
        let body = body.chars().take(BODY_SNIPPET_LEN).collect();
        UploadError::RemoteStatus {
            verb,
            path: path.to_string(),
            status,
            body,
        }
    }
}

#[async_trait]
impl WebdavApi for WebdavClient {
    async fn mkcol(&self, path: &str) -> Result<(), UploadError> {
        let method = Method::from_bytes(b"MKCOL").expect("MKCOL is a valid method");
        let res = self
            .send("MKCOL", method, path, MKCOL_TIMEOUT, None, false)
            .await?;
        match res.status().as_u16() {
            // 405 = collection already exists.
            201 | 204 | 405 => Ok(()),
            _ => Err(Self::status_error("MKCOL", path, res).await),
        }
    }

    async fn put(&self, path: &str, content: Vec<u8>) -> Result<(), UploadError> {
        let res = self
            .send("PUT", Method::PUT, path, PUT_TIMEOUT, Some(content), false)
            .await?;
        match res.status().as_u16() {
            200 | 201 | 204 => Ok(()),
            _ => Err(Self::status_error("PUT", path, res).await),
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, UploadError> {
        let res = self
            .send("GET", Method::GET, path, GET_TIMEOUT, None, false)
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(Self::status_error("GET", path, res).await);
        }
        let bytes = res.bytes().await.map_err(|source| UploadError::Transport {
            verb: "GET",
            path: path.to_string(),
            source,
        })?;
        Ok(Some(bytes.to_vec()))
    }

    async fn exists(&self, path: &str) -> Result<bool, UploadError> {
        let method = Method::from_bytes(b"PROPFIND").expect("PROPFIND is a valid method");
        let res = self
            .send("PROPFIND", method, path, PROPFIND_TIMEOUT, None, true)
            .await?;
        match res.status().as_u16() {
            200 | 207 => Ok(true),
            404 => Ok(false),
            _ => Err(Self::status_error("PROPFIND", path, res).await),
        }
    }
}
