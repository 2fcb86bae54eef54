use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Form;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::net::SocketAddr;
use tracing::{info, warn};

use crate::app::AppState;
use crate::config::{ADMIN_COOKIE_NAME, ADMIN_SESSION_SECONDS};
use crate::ratelimit::{AttemptResult, LockStatus, Rejection};
use crate::sources::SourceMap;

/// Domain separator hashed with the admin password to derive the session
/// cookie value.
const SESSION_CONTEXT: &[u8] = b"line-backup-admin";

/// Deterministic session token: the cookie holds an HMAC of a fixed context
/// under the admin password, so sessions survive restarts and there is no
/// server-side session table. Rotating the password invalidates all
/// sessions.
pub fn session_token(admin_password: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(admin_password.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(SESSION_CONTEXT);
    hex::encode(mac.finalize().into_bytes())
}

fn authenticated(state: &AppState, jar: &CookieJar) -> bool {
    if state.config.admin_password.is_empty() {
        // No password configured: pages are open, a warning is rendered.
        return true;
    }
    let expected = session_token(&state.config.admin_password);
    jar.get(ADMIN_COOKIE_NAME)
        .map(|c| {
            let value = c.value();
            value.len() == expected.len()
                && constant_time_eq(value.as_bytes(), expected.as_bytes())
        })
        .unwrap_or(false)
}

fn session_cookie(state: &AppState) -> Cookie<'static> {
    Cookie::build((ADMIN_COOKIE_NAME, session_token(&state.config.admin_password)))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(cookie::time::Duration::seconds(ADMIN_SESSION_SECONDS))
        .build()
}

/// Client identity for login rate limiting: first proxy header hop, then
/// the socket address.
pub fn client_ip(headers: &HeaderMap, addr: Option<&ConnectInfo<SocketAddr>>) -> String {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| addr.map(|ConnectInfo(a)| a.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
pub struct MappingForm {
    #[serde(default)]
    mapping: String,
}

pub async fn login_get(State(state): State<AppState>, jar: CookieJar) -> Response {
    if authenticated(&state, &jar) {
        return Redirect::to("/admin").into_response();
    }
    Html(login_page(None)).into_response()
}

pub async fn login_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    if state.config.admin_password.is_empty() {
        return Redirect::to("/admin").into_response();
    }
    let ip = client_ip(&headers, addr.as_ref());

    let mut limiter = state.login_limiter.lock().await;
    if let LockStatus::LockedUntil(until) = limiter.check_lock(&ip) {
        let mins = ((until - Utc::now().timestamp()) / 60).max(1);
        warn!("Rejected login from locked client {}", ip);
        return Html(login_page(Some(&format!(
            "Too many failed attempts. Try again in {mins} minute(s)."
        ))))
        .into_response();
    }

    let expected = &state.config.admin_password;
    let ok = form.password.len() == expected.len()
        && constant_time_eq(form.password.as_bytes(), expected.as_bytes());
    match limiter.record_attempt(&ip, ok) {
        AttemptResult::Accepted => {
            info!("Admin login from {}", ip);
            let jar = jar.add(session_cookie(&state));
            (jar, Redirect::to("/admin")).into_response()
        }
        AttemptResult::Rejected(Rejection::AttemptsLeft(left)) => {
            warn!("Failed admin login from {} ({} attempts left)", ip, left);
            Html(login_page(Some(&format!(
                "Wrong password. {left} attempt(s) left before lockout."
            ))))
            .into_response()
        }
        AttemptResult::Rejected(Rejection::LockedUntil(_)) => {
            warn!("Client {} locked out after repeated failures", ip);
            Html(login_page(Some(
                "Too many failed attempts. This IP is locked for 15 minutes.",
            )))
            .into_response()
        }
    }
}

pub async fn admin_get(State(state): State<AppState>, jar: CookieJar) -> Response {
    if !authenticated(&state, &jar) {
        return Redirect::to("/admin/login").into_response();
    }
    let page = admin_page(&state, None).await;
    if state.config.admin_password.is_empty() {
        return Html(page).into_response();
    }
    // Sliding expiry: every authenticated view refreshes the cookie.
    (jar.add(session_cookie(&state)), Html(page)).into_response()
}

pub async fn admin_post(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<MappingForm>,
) -> Response {
    if !authenticated(&state, &jar) {
        return Redirect::to("/admin/login").into_response();
    }
    let data = SourceMap::parse_mapping(&form.mapping);
    let message = match state.source_map.lock().await.save_mapping(&data) {
        Ok(()) => format!("Mapping saved ({} entries).", data.len()),
        Err(e) => {
            warn!("Could not save source map: {}", e);
            format!("Could not save mapping: {e}")
        }
    };
    Html(admin_page(&state, Some(&message)).await).into_response()
}

pub async fn logout(jar: CookieJar) -> Response {
    let jar = jar.remove(Cookie::build((ADMIN_COOKIE_NAME, "")).path("/").build());
    (jar, Redirect::to("/admin/login")).into_response()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn login_page(error: Option<&str>) -> String {
    let banner = error
        .map(|e| format!("<p class=\"error\">{}</p>", escape_html(e)))
        .unwrap_or_default();
    format!(
        "<!doctype html><html><head><title>Admin Login</title>\
         <style>body{{font-family:sans-serif;max-width:30em;margin:4em auto}}\
         .error{{color:#b00}}</style></head><body>\
         <h1>Admin Login</h1>{banner}\
         <form method=\"post\" action=\"/admin/login\">\
         <input type=\"password\" name=\"password\" autofocus> \
         <button type=\"submit\">Log in</button></form>\
         </body></html>"
    )
}

async fn admin_page(state: &AppState, message: Option<&str>) -> String {
    let mapping_text = {
        let map = state.source_map.lock().await;
        map.sorted_entries()
            .into_iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let banner = message
        .map(|m| format!("<p class=\"notice\">{}</p>", escape_html(m)))
        .unwrap_or_default();
    let warning = if state.config.admin_password.is_empty() {
        "<p class=\"error\">ADMIN_PASSWORD is not set; this page is open to anyone.</p>"
    } else {
        ""
    };
    format!(
        "<!doctype html><html><head><title>Source Mapping</title>\
         <style>body{{font-family:sans-serif;max-width:40em;margin:4em auto}}\
         textarea{{width:100%;height:16em}}\
         .error{{color:#b00}}.notice{{color:#060}}</style></head><body>\
         <h1>Source Mapping</h1>{warning}{banner}\
         <p>One <code>key:folder</code> pair per line. Senders type the key\
         to switch their backup folder.</p>\
         <form method=\"post\" action=\"/admin\">\
         <textarea name=\"mapping\">{}</textarea>\
         <p><button type=\"submit\">Save</button> \
         <a href=\"/admin/logout\">Log out</a></p></form>\
         </body></html>",
        escape_html(&mapping_text)
    )
}
