use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const FETCH_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_BODY_BYTES: usize = 100 * 1024;
const MAX_TITLE_LEN: usize = 200;

/// Fetch the `<title>` of a web page for nicer link backup filenames.
/// Best effort: any failure (timeout, bad status, no title tag) yields an
/// empty string and the caller falls back to a plain name.
pub async fn fetch_page_title(url: &str) -> String {
    match try_fetch_title(url).await {
        Ok(title) => title,
        Err(e) => {
            debug!("Could not fetch page title for {}: {}", url, e);
            String::new()
        }
    }
}

async fn try_fetch_title(url: &str) -> anyhow::Result<String> {
    let client = Client::builder()
        .connect_timeout(FETCH_TIMEOUT)
        .timeout(FETCH_TIMEOUT)
        .user_agent(format!("linecloud/{}", env!("CARGO_PKG_VERSION")))
        .build()?;
    let mut res = client.get(url).send().await?.error_for_status()?;

    // Only the head matters; stop reading once we have enough.
    let mut body = Vec::new();
    while let Some(chunk) = res.chunk().await? {
        body.extend_from_slice(&chunk);
        if body.len() >= MAX_BODY_BYTES {
            break;
        }
    }
    let html = String::from_utf8_lossy(&body);
    Ok(extract_title(&html))
}

/// Pull the text of the first `<title>` element out of an HTML fragment.
/// A tolerant scan, not a parser: handles attributes on the tag, entity
/// escapes for the common five, and collapses whitespace.
pub fn extract_title(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let Some(open) = lower.find("<title") else {
        return String::new();
    };
    let Some(gt) = lower[open..].find('>') else {
        return String::new();
    };
    let start = open + gt + 1;
    let Some(close) = lower[start..].find("</title") else {
        return String::new();
    };
    let raw = &html[start..start + close];
    let unescaped = raw
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    let collapsed = unescaped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_TITLE_LEN).collect()
}
