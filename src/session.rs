//! Session and identity resolution.
//!
//! Client-held state is a `sid` cookie keying an in-memory registry. A
//! request with no valid cookie derives an anonymous identity from its
//! network address. There is no identity verification; any party able to
//! submit a username can claim it, an accepted trust gap for this tool.

use crate::state::{AppState, SessionEntry, Sessions, SESSION_TTL_SECS};
use crate::store::{self, StoreError};
use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

const SESSION_COOKIE: &str = "sid";

/// Identity resolved for one request, plus the cookie to set when a new
/// session was minted.
#[derive(Debug)]
pub struct ResolvedIdentity {
    pub user_id: i64,
    pub username: String,
    pub set_cookie: Option<String>,
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Resolve an identity from an existing session cookie, touching the
/// entry's last-used time.
pub async fn resolve_existing(state: &AppState, headers: &HeaderMap) -> Option<(i64, String)> {
    let sid = cookie_value(headers, SESSION_COOKIE)?;
    let mut sessions = state.sessions.write().await;
    let entry = sessions.get_mut(&sid)?;
    entry.last_used = Instant::now();
    Some((entry.user_id, entry.username.clone()))
}

/// Resolve the identity for a request: session cookie first, otherwise the
/// newest anonymous identity for the client address (created on first
/// contact), binding a fresh session for it.
pub async fn resolve_or_create(
    state: &AppState,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> Result<ResolvedIdentity, StoreError> {
    if let Some((user_id, username)) = resolve_existing(state, headers).await {
        return Ok(ResolvedIdentity {
            user_id,
            username,
            set_cookie: None,
        });
    }

    let ip_address = addr.ip().to_string();
    let store = state.store.clone();
    let user =
        tokio::task::spawn_blocking(move || store.resolve_anonymous(&ip_address, store::now_ms()))
            .await??;
    let cookie = bind(state, user.id, user.username.clone()).await;
    info!(user_id = user.id, username = %user.username, "session created");
    Ok(ResolvedIdentity {
        user_id: user.id,
        username: user.username,
        set_cookie: Some(cookie),
    })
}

/// Mint a session for an identity and return the cookie to set.
pub async fn bind(state: &AppState, user_id: i64, username: String) -> String {
    let sid = uuid::Uuid::new_v4().to_string();
    state.sessions.write().await.insert(
        sid.clone(),
        SessionEntry {
            user_id,
            username,
            created_at: Instant::now(),
            last_used: Instant::now(),
        },
    );
    format!("{SESSION_COOKIE}={sid}; Path=/; HttpOnly")
}

/// Drop the session named by the request's cookie, if any.
pub async fn clear(state: &AppState, headers: &HeaderMap) {
    if let Some(sid) = cookie_value(headers, SESSION_COOKIE) {
        if state.sessions.write().await.remove(&sid).is_some() {
            info!("session cleared");
        }
    }
}

/// Cookie value that erases the client-held session state.
pub fn clear_cookie() -> String {
    format!("{SESSION_COOKIE}=; Path=/; Max-Age=0")
}

pub async fn cleanup_expired_sessions(sessions: &Sessions) {
    let mut sessions = sessions.write().await;
    let now = Instant::now();
    let ttl = Duration::from_secs(SESSION_TTL_SECS);

    let expired: Vec<String> = sessions
        .iter()
        .filter(|(_, entry)| now.duration_since(entry.last_used) > ttl)
        .map(|(sid, _)| sid.clone())
        .collect();

    for sid in expired {
        if sessions.remove(&sid).is_some() {
            info!("Cleaning up expired session: {}", sid);
        }
    }
}
