//! HTTP server implementation using Axum.

use crate::live;
use crate::session;
use crate::state::AppState;
use crate::store::{ExportedFile, ExportedLibrary, StoreError};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

const INDEX_HTML: &str = include_str!("index.html");
const DEFAULT_FILENAME: &str = "main.py";
const DEFAULT_CONTENT: &str = "# Write code here...";
const RECENT_LOG_LIMIT: usize = 50;

// Request/Response types
#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    project_name: String,
}

#[derive(Serialize)]
struct LibraryEntry {
    name: String,
    version: String,
}

#[derive(Serialize)]
struct LogEntry {
    terminal_type: String,
    command: String,
    output: String,
}

#[derive(Serialize)]
struct UserDataResponse {
    filename: String,
    content: String,
    libraries: Vec<LibraryEntry>,
    logs: Vec<LogEntry>,
}

#[derive(Serialize)]
struct ProjectsResponse {
    projects: Vec<String>,
}

#[derive(Serialize)]
struct ExportResponse {
    username: String,
    project_name: String,
    code_files: Vec<ExportedFile>,
    libraries: Vec<ExportedLibrary>,
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/logout", get(logout))
        .route("/login", post(login))
        .route("/ws", get(live::ws_handler))
        .route("/api/user_data", get(user_data))
        .route("/api/projects", get(projects))
        .route("/api/export/:username/:project_name", get(export))
        .route("/admin", get(admin))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) {
    // Spawn session cleanup task
    let sessions_clone = state.sessions.clone();
    tokio::spawn(async move {
        let mut interval = interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            session::cleanup_expired_sessions(&sessions_clone).await;
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}

async fn health() -> &'static str {
    "OK"
}

fn internal<E: std::fmt::Display>(e: E) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn attach_cookie(mut response: Response, cookie: Option<String>) -> Response {
    if let Some(cookie) = cookie {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

async fn index(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    match session::resolve_or_create(&state, &headers, addr).await {
        Ok(resolved) => attach_cookie(Html(INDEX_HTML).into_response(), resolved.set_cookie),
        Err(e) => internal(e),
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    session::clear(&state, &headers).await;
    attach_cookie(
        Redirect::to("/").into_response(),
        Some(session::clear_cookie()),
    )
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Form(req): Form<LoginRequest>,
) -> Response {
    let username = req.username.trim().to_string();
    let project_name = req.project_name.trim().to_string();
    if username.is_empty() || project_name.is_empty() {
        return Redirect::to("/").into_response();
    }

    let store = state.store.clone();
    let ip_address = addr.ip().to_string();
    let (login_username, login_project) = (username.clone(), project_name.clone());
    let user = match tokio::task::spawn_blocking(move || {
        store.resolve_login(
            &login_username,
            &login_project,
            &ip_address,
            crate::store::now_ms(),
        )
    })
    .await
    {
        Ok(Ok(user)) => user,
        Ok(Err(e)) => return internal(e),
        Err(e) => return internal(e),
    };

    info!(user_id = user.id, username = %username, project = %project_name, "login");
    let cookie = session::bind(&state, user.id, user.username).await;
    attach_cookie(Redirect::to("/").into_response(), Some(cookie))
}

async fn user_data(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let resolved = match session::resolve_or_create(&state, &headers, addr).await {
        Ok(resolved) => resolved,
        Err(e) => return internal(e),
    };

    let store = state.store.clone();
    let user_id = resolved.user_id;
    let data = tokio::task::spawn_blocking(move || -> Result<_, StoreError> {
        let file = store.default_file(user_id)?;
        let libraries = store.libraries(user_id)?;
        let logs = store.terminal_logs(user_id, RECENT_LOG_LIMIT)?;
        Ok((file, libraries, logs))
    })
    .await;

    let (file, libraries, logs) = match data {
        Ok(Ok(data)) => data,
        Ok(Err(e)) => return internal(e),
        Err(e) => return internal(e),
    };

    let (filename, content) =
        file.unwrap_or_else(|| (DEFAULT_FILENAME.to_string(), DEFAULT_CONTENT.to_string()));
    let body = UserDataResponse {
        filename,
        content,
        libraries: libraries
            .into_iter()
            .map(|lib| LibraryEntry {
                name: lib.name,
                version: lib.version,
            })
            .collect(),
        logs: logs
            .into_iter()
            .map(|log| LogEntry {
                terminal_type: log.terminal_type,
                command: log.command,
                output: log.output,
            })
            .collect(),
    };
    attach_cookie(Json(body).into_response(), resolved.set_cookie)
}

async fn projects(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let resolved = match session::resolve_or_create(&state, &headers, addr).await {
        Ok(resolved) => resolved,
        Err(e) => return internal(e),
    };

    let store = state.store.clone();
    let username = resolved.username.clone();
    let projects = match tokio::task::spawn_blocking(move || store.projects(&username)).await {
        Ok(Ok(projects)) => projects,
        Ok(Err(e)) => return internal(e),
        Err(e) => return internal(e),
    };
    attach_cookie(
        Json(ProjectsResponse { projects }).into_response(),
        resolved.set_cookie,
    )
}

async fn export(
    State(state): State<AppState>,
    Path((username, project_name)): Path<(String, String)>,
) -> Response {
    let store = state.store.clone();
    let (export_username, export_project) = (username.clone(), project_name.clone());
    let result =
        tokio::task::spawn_blocking(move || store.export(&export_username, &export_project)).await;

    match result {
        Ok(Ok(Some(data))) => Json(ExportResponse {
            username,
            project_name,
            code_files: data.code_files,
            libraries: data.libraries,
        })
        .into_response(),
        Ok(Ok(None)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Project not found" })),
        )
            .into_response(),
        Ok(Err(e)) => internal(e),
        Err(e) => internal(e),
    }
}

async fn admin(State(state): State<AppState>) -> Response {
    let store = state.store.clone();
    let counts = match tokio::task::spawn_blocking(move || store.counts()).await {
        Ok(Ok(counts)) => counts,
        Ok(Err(e)) => return internal(e),
        Err(e) => return internal(e),
    };

    Html(format!(
        "<h1>webpad admin</h1>\n\
         <p>Total Users: {}</p>\n\
         <p>Code Files: {}</p>\n\
         <p>Unique Libraries: {}</p>\n\
         <p><a href=\"/\">Back to IDE</a></p>",
        counts.users, counts.code_files, counts.distinct_libraries
    ))
    .into_response()
}
