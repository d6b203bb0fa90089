use crate::{
    config::Config,
    db,
    error::StoreError,
    handler::ChatHub,
    store::{self, SqliteStore},
};
use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chat_protocol::{PresenceEntry, RegisterUser, User, UserProfile};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub hub: ChatHub,
    pub config: Config,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let path = config.database.clone();
        let pool = tokio::task::spawn_blocking(move || db::open_pool(path)).await??;
        let store = Arc::new(SqliteStore::new(pool));
        Ok(Self {
            hub: ChatHub::new(store, config.history_limit),
            config,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/users", post(upsert_user).get(lookup_user))
        .route("/api/users/search", get(search_users))
        .route("/api/users/online", get(online_users))
        .route("/api/messages/:room_id", get(room_history))
        .route("/ws", get(ws_handler))
        .layer(cors_layer(&state.config.frontend_url))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);
    match HeaderValue::from_str(frontend_url) {
        Ok(origin) => base.allow_origin(origin).allow_credentials(true),
        Err(_) => {
            warn!(frontend_url, "invalid frontend origin, cross-origin requests disabled");
            base
        }
    }
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResp>);

fn err(status: StatusCode, msg: &str) -> ApiError {
    (status, Json(ErrorResp { error: msg.into() }))
}

fn store_err(e: StoreError) -> ApiError {
    error!(error = %e, "store request failed");
    err(StatusCode::INTERNAL_SERVER_ERROR, "store_unavailable")
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "Server is healthy" }))
}

async fn upsert_user(
    State(state): State<AppState>,
    Json(req): Json<RegisterUser>,
) -> Result<impl IntoResponse, ApiError> {
    let profile = UserProfile::from(req);
    if profile.user_id.trim().is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "user_id_required"));
    }
    let user = store::blocking(state.hub.store(), move |s| s.upsert_user(&profile))
        .await
        .map_err(store_err)?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Deserialize)]
struct LookupQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

async fn lookup_user(
    State(state): State<AppState>,
    Query(q): Query<LookupQuery>,
) -> Result<Json<Vec<User>>, ApiError> {
    let Some(user_id) = q.user_id.filter(|u| !u.trim().is_empty()) else {
        return Err(err(StatusCode::BAD_REQUEST, "user_id_required"));
    };
    let user = store::blocking(state.hub.store(), move |s| s.find_user(&user_id))
        .await
        .map_err(store_err)?;
    Ok(Json(user.into_iter().collect()))
}

#[derive(Deserialize)]
struct SearchQuery {
    query: Option<String>,
}

async fn search_users(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<Vec<User>>, ApiError> {
    let Some(query) = q.query.filter(|q| !q.trim().is_empty()) else {
        return Err(err(StatusCode::BAD_REQUEST, "query_required"));
    };
    let needle = query.clone();
    let users = store::blocking(state.hub.store(), move |s| s.search_users(&needle))
        .await
        .map_err(store_err)?;
    debug!(query = %query, found = users.len(), "user search");
    Ok(Json(users))
}

async fn online_users(State(state): State<AppState>) -> Json<Vec<PresenceEntry>> {
    Json(state.hub.registry().presence().list())
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn room_history(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let msgs = store::blocking(state.hub.store(), move |s| s.list_by_room(&room_id, q.limit))
        .await
        .map_err(store_err)?;
    Ok(Json(msgs))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(stream: WebSocket, hub: ChatHub) {
    let (guard, rx) = hub.connect();
    let id = guard.id();
    let (mut sender, mut receiver) = stream.split();
    let mut outbound = ReceiverStream::new(rx);
    // ends once the mailbox is closed by disconnect or pruned as stalled
    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "unserializable event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });
    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => hub.handle_text(id, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %id, error = %e, "socket read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }
    drop(guard);
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

/// Run the HTTP server with the provided configuration.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    info!(%addr, database = %state.config.database.display(), "chat server listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn app() -> Router {
        let state = AppState::new(Config::in_memory("127.0.0.1:0")).await.unwrap();
        build_router(state)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let resp = app()
            .await
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["status"], "Server is healthy");
    }

    #[tokio::test]
    async fn search_requires_query() {
        let resp = app()
            .await
            .oneshot(
                Request::get("/api/users/search?query=%20")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upsert_requires_user_id() {
        let resp = app()
            .await
            .oneshot(
                Request::post("/api/users")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"username":"nobody"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn cors_allows_frontend_origin() {
        let resp = app()
            .await
            .oneshot(
                Request::get("/api/health")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "http://localhost:5173"
        );
    }
}
