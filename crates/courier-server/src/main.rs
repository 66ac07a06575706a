use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, Request, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use courier_gateway::connection;
use courier_gateway::dispatcher::Dispatcher;
use courier_gateway::error::GatewayError;
use courier_gateway::rooms;
use courier_types::api::Claims;
use courier_types::models::Identity;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("COURIER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("COURIER_DB_PATH").unwrap_or_else(|_| "courier.db".into());
    let host = std::env::var("COURIER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("COURIER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init the message store
    let db = Arc::new(courier_db::Database::open(&PathBuf::from(&db_path))?);

    let state = ServerState {
        dispatcher: Dispatcher::new(db),
        jwt_secret,
    };

    // Routes
    let history_routes = Router::new()
        .route("/rooms/{room_id}/messages", get(room_history))
        .layer(middleware::from_fn(require_auth))
        .with_state(state.clone());

    let ws_route = Router::new().route("/ws", get(ws_upgrade)).with_state(state);

    let app = Router::new()
        .merge(history_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Courier gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Authenticate at the HTTP upgrade layer, then hand the socket to the
/// gateway with a verified identity attached.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    // Browsers cannot set headers on WebSocket requests, so the token may
    // arrive as a query parameter instead.
    let token = query
        .token
        .or_else(|| bearer_token(&headers))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let identity =
        verify_token(&state.jwt_secret, &token).ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, identity)
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    200
}

/// Room history for an authenticated, room-member caller.
async fn room_history(
    State(state): State<ServerState>,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    Extension(identity): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    // History is as private as delivery: same membership check as the gateway.
    rooms::resolve_audience(&room_id, &identity.user_id).map_err(|_| StatusCode::FORBIDDEN)?;

    let mut messages = state
        .dispatcher
        .room_history(&room_id, query.limit.min(500))
        .await
        .map_err(|e| match e {
            GatewayError::Unauthorized(_) => StatusCode::FORBIDDEN,
            GatewayError::Protocol(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        })?;

    // The assistant room is shared storage; callers only see their own side.
    if room_id == rooms::AI_ROOM {
        messages.retain(|m| m.sender_id == identity.user_id);
    }

    Ok(Json(messages))
}

/// Extract and validate the JWT from the Authorization header.
async fn require_auth(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let secret =
        std::env::var("COURIER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());

    let identity = verify_token(&secret, token).ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
}

fn verify_token(secret: &str, token: &str) -> Option<Identity> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    Some(token_data.claims.into())
}
