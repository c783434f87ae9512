//! HTTP and WebSocket surface of the gateway.
//!
//! `/ws/client/` upgrades to a WebSocket driven by a
//! [`Session`](crate::session::Session). The
//! `/briscola/...` routes are a thin token and admin API in front of the
//! [`TokenIssuer`](crate::auth::TokenIssuer) and the broker.

use crate::{
  auth::Role,
  config::AllowedOrigins,
  error::{AuthError, PubSubError},
  protocol::{ControlCommand, ControlKind, GAME_ENDED},
  pubsub::{channels, PubSubExt},
  session::{Gateway, Outbound, SessionState},
};
use axum::{
  body::Bytes,
  extract::{
    ws::{Message, WebSocket},
    Path, Query, State, WebSocketUpgrade,
  },
  http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderMap, HeaderValue, Method, StatusCode,
  },
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tower_http::{
  compression::CompressionLayer,
  cors::{AllowOrigin, Any, CorsLayer},
  trace::TraceLayer,
};

const GAME_ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const GAME_ID_LEN: usize = 6;

/// How long a closing connection waits for queued frames to be written.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ApiError {
  #[error("bad request: {0}")]
  BadRequest(String),
  #[error("forbidden: {0}")]
  Forbidden(String),
  #[error("broker unavailable: {0}")]
  Unavailable(String),
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match &self {
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
      ApiError::Unavailable(e) => {
        tracing::error!("Broker error in API request: {e}");
        StatusCode::SERVICE_UNAVAILABLE
      }
    };
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}

/// Token validation failures on admin routes are authorization failures.
impl From<AuthError> for ApiError {
  fn from(e: AuthError) -> Self {
    ApiError::Forbidden(e.to_string())
  }
}

impl From<PubSubError> for ApiError {
  fn from(e: PubSubError) -> Self {
    ApiError::Unavailable(e.to_string())
  }
}

#[derive(Clone)]
pub struct AppState {
  pub gateway: Gateway,
  pub default_ttl_minutes: i64,
}

/// Gateway HTTP server.
pub struct Server {
  state: AppState,
  cors: AllowedOrigins,
}

impl Server {
  pub fn new(gateway: Gateway) -> Self {
    Self {
      state: AppState {
        gateway,
        default_ttl_minutes: 60,
      },
      cors: AllowedOrigins::Any,
    }
  }

  /// Lifetime of tokens minted without an explicit ttl.
  pub fn with_default_ttl_minutes(mut self, minutes: i64) -> Self {
    self.state.default_ttl_minutes = minutes;
    self
  }

  /// Origins allowed by CORS.
  pub fn with_cors(mut self, origins: AllowedOrigins) -> Self {
    self.cors = origins;
    self
  }

  pub fn router(&self) -> Router {
    Router::new()
      .route("/ws/client/", get(ws_handler))
      .route("/briscola/create/", get(create_game).post(create_game))
      .route("/briscola/token/{game_id}/", post(issue_token))
      .route("/briscola/join/observer/{game_id}/", post(join_observer))
      .route("/briscola/health/", get(health))
      .route("/briscola/game/{game_id}/status/", get(game_status))
      .route("/briscola/game/{game_id}/", post(end_game).delete(end_game))
      .route("/briscola/game/{game_id}/sync/", post(sync_game))
      .layer(cors_layer(&self.cors))
      .layer(TraceLayer::new_for_http())
      .layer(CompressionLayer::new())
      .with_state(self.state.clone())
  }

  /// Start matchmaking and serve until the listener fails.
  pub async fn listen(self, addr: &str) -> anyhow::Result<()> {
    self.state.gateway.matchmaking.start().await?;
    let app = self.router();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
  }
}

fn cors_layer(origins: &AllowedOrigins) -> CorsLayer {
  let layer = CorsLayer::new()
    .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
    .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

  match origins {
    AllowedOrigins::Any => layer.allow_origin(Any),
    AllowedOrigins::List(list) => {
      let values: Vec<HeaderValue> = list
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
          Ok(v) => Some(v),
          Err(_) => {
            tracing::warn!("Ignoring invalid CORS origin '{o}'");
            None
          }
        })
        .collect();
      layer.allow_origin(AllowOrigin::list(values))
    }
  }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
  ws.on_upgrade(move |socket| handle_ws(socket, state.gateway))
}

/// Bridge one WebSocket to a [`Session`](crate::session::Session) until either side goes away.
async fn handle_ws(ws: WebSocket, gateway: Gateway) {
  let (mut sender_ws, mut receiver_ws) = ws.split();
  let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
  let (mut session, mut events) = gateway.open_session(tx);
  let id = session.id();

  // Pump outbound frames rx -> ws
  let mut writer = tokio::spawn(async move {
    while let Some(out) = rx.recv().await {
      let frame = match out {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Close => {
          let _ = sender_ws.send(Message::Close(None)).await;
          break;
        }
      };
      if sender_ws.send(frame).await.is_err() {
        tracing::debug!("Failed to write to connection {id}");
        break;
      }
    }
  });

  let mut writer_done = false;
  loop {
    tokio::select! {
      frame = receiver_ws.next() => match frame {
        Some(Ok(Message::Text(text))) => session.receive(text.as_str()).await,
        Some(Ok(Message::Close(_))) | None => {
          tracing::debug!("Connection {id} closed by client");
          break;
        }
        Some(Ok(_)) => {}
        Some(Err(e)) => {
          tracing::debug!("Connection {id} read error: {e}");
          break;
        }
      },
      Some(signal) = events.recv() => {
        session.handle_signal(signal).await;
        if session.state() == SessionState::Closed {
          break;
        }
      }
      _ = &mut writer => {
        writer_done = true;
        break;
      }
    }
  }

  session.close().await;
  // Dropping the session closes the outbound queue so the writer can finish.
  drop(session);
  if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
    writer.abort();
  }
}

fn generate_game_id() -> String {
  let mut rng = rand::thread_rng();
  (0..GAME_ID_LEN)
    .map(|_| GAME_ID_CHARS[rng.gen_range(0..GAME_ID_CHARS.len())] as char)
    .collect()
}

fn bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
  headers
    .get(AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
    .ok_or_else(|| ApiError::Forbidden("missing host token".to_string()))
}

fn require_host(state: &AppState, headers: &HeaderMap, game_id: &str) -> Result<(), ApiError> {
  let token = bearer(headers)?;
  state.gateway.issuer.require_host(token, game_id)?;
  Ok(())
}

fn mint(
  state: &AppState,
  game_id: &str,
  role: Role,
  ttl_minutes: i64,
  player_id: Option<u32>,
  display_name: Option<String>,
) -> Result<String, ApiError> {
  state
    .gateway
    .issuer
    .mint(game_id, role, ttl_minutes.saturating_mul(60), player_id, display_name)
    .map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Parse an optional JSON body; an empty body is `T::default()`.
fn json_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(T::default());
  }
  serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

#[derive(Debug, Deserialize)]
struct TtlQuery {
  ttl: Option<i64>,
}

async fn create_game(State(state): State<AppState>, Query(query): Query<TtlQuery>) -> Result<Json<Value>, ApiError> {
  let ttl_minutes = query.ttl.unwrap_or(state.default_ttl_minutes);
  let game_id = generate_game_id();
  let host_token = mint(&state, &game_id, Role::Host, ttl_minutes, None, None)?;

  state
    .gateway
    .pubsub
    .publish(&channels::control(&game_id), &ControlCommand::for_game(ControlKind::Create, &game_id))
    .await?;
  tracing::info!("Game {} created over HTTP", game_id);

  Ok(Json(json!({
    "game_id": game_id,
    "host_token": host_token,
    "ttl_minutes": ttl_minutes,
  })))
}

#[derive(Debug, Default, Deserialize)]
struct TokenRequest {
  role: Option<String>,
  player_id: Option<u32>,
  display_name: Option<String>,
  ttl_minutes: Option<i64>,
}

async fn issue_token(
  State(state): State<AppState>,
  Path(game_id): Path<String>,
  headers: HeaderMap,
  body: Bytes,
) -> Result<Json<Value>, ApiError> {
  require_host(&state, &headers, &game_id)?;

  let req: TokenRequest = json_body(&body)?;
  let role = match req.role.as_deref() {
    Some("player") => Role::Player,
    Some("observer") => Role::Observer,
    _ => return Err(ApiError::BadRequest("invalid role".to_string())),
  };
  if role == Role::Player && req.player_id.is_none() {
    return Err(ApiError::BadRequest("player_id required for player token".to_string()));
  }

  let ttl_minutes = req.ttl_minutes.unwrap_or(state.default_ttl_minutes);
  let token = mint(&state, &game_id, role, ttl_minutes, req.player_id, req.display_name)?;
  tracing::debug!("Issued {} token for {}", role, game_id);
  Ok(Json(json!({ "token": token, "ttl_minutes": ttl_minutes })))
}

#[derive(Debug, Default, Deserialize)]
struct ObserverRequest {
  display_name: Option<String>,
  ttl_minutes: Option<i64>,
}

async fn join_observer(
  State(state): State<AppState>,
  Path(game_id): Path<String>,
  Query(query): Query<TtlQuery>,
  body: Bytes,
) -> Result<Json<Value>, ApiError> {
  let req: ObserverRequest = json_body(&body)?;
  let ttl_minutes = req.ttl_minutes.or(query.ttl).unwrap_or(state.default_ttl_minutes);
  let token = mint(&state, &game_id, Role::Observer, ttl_minutes, None, req.display_name)?;
  Ok(Json(json!({
    "game_id": game_id,
    "token": token,
    "ttl_minutes": ttl_minutes,
    "role": Role::Observer,
  })))
}

async fn broker_ok(state: &AppState) -> bool {
  match state.gateway.pubsub.health_check().await {
    Ok(()) => true,
    Err(e) => {
      tracing::warn!("Broker health check failed: {e}");
      false
    }
  }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
  let redis = broker_ok(&state).await;
  Json(json!({
    "status": if redis { "ok" } else { "degraded" },
    "redis": redis,
  }))
}

async fn game_status(State(state): State<AppState>, Path(game_id): Path<String>) -> Json<Value> {
  let redis = broker_ok(&state).await;
  let seats = state.gateway.registry.seats(&game_id).await;
  Json(json!({
    "game_id": game_id,
    "redis": redis,
    "observers_open": true,
    "seats_connected": seats,
  }))
}

async fn end_game(
  State(state): State<AppState>,
  Path(game_id): Path<String>,
  headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
  require_host(&state, &headers, &game_id)?;

  let pubsub = &state.gateway.pubsub;
  pubsub
    .publish(&channels::control(&game_id), &ControlCommand::for_game(ControlKind::Stop, &game_id))
    .await?;
  pubsub
    .publish(&channels::events(&game_id), &json!({ "message_type": GAME_ENDED, "game_id": game_id }))
    .await?;
  tracing::info!("Game {} ended by host", game_id);
  Ok(Json(json!({ "status": "deleted", "game_id": game_id })))
}

async fn sync_game(
  State(state): State<AppState>,
  Path(game_id): Path<String>,
  headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
  require_host(&state, &headers, &game_id)?;
  state
    .gateway
    .pubsub
    .publish(&channels::control(&game_id), &ControlCommand::for_game(ControlKind::Sync, &game_id))
    .await?;
  Ok(Json(json!({ "status": "sync_requested", "game_id": game_id })))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{auth::TokenIssuer, pubsub::InMemoryPubSub};
  use axum::body::Body;
  use http_body_util::BodyExt;
  use std::sync::Arc;
  use tower::ServiceExt;

  fn setup() -> (Router, Gateway, Arc<InMemoryPubSub>) {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let gateway = Gateway::new(TokenIssuer::new("test-secret"), pubsub.clone());
    let router = Server::new(gateway.clone()).router();
    (router, gateway, pubsub)
  }

  async fn call(router: Router, method: &str, uri: &str, bearer: Option<&str>, body: &str) -> (StatusCode, Value) {
    let mut req = axum::http::Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
      req = req.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let res = router
      .oneshot(req.body(Body::from(body.to_string())).unwrap())
      .await
      .unwrap();
    let status = res.status();
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
  }

  #[test]
  fn game_ids_are_six_uppercase_alphanumerics() {
    for _ in 0..100 {
      let id = generate_game_id();
      assert_eq!(id.len(), GAME_ID_LEN);
      assert!(id.bytes().all(|b| GAME_ID_CHARS.contains(&b)));
    }
  }

  #[tokio::test]
  async fn create_returns_host_token() {
    let (router, gateway, _) = setup();
    let (status, body) = call(router, "POST", "/briscola/create/?ttl=5", None, "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ttl_minutes"], 5);

    let game_id = body["game_id"].as_str().unwrap();
    let claims = gateway
      .issuer
      .require_host(body["host_token"].as_str().unwrap(), game_id)
      .unwrap();
    assert_eq!(claims.game_id, game_id);
    assert_eq!(game_id.len(), GAME_ID_LEN);
  }

  #[tokio::test]
  async fn token_requires_host_bearer() {
    let (router, gateway, _) = setup();
    let (status, _) = call(router.clone(), "POST", "/briscola/token/TEST01/", None, r#"{"role":"player","player_id":0}"#).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let player = gateway.issuer.mint("TEST01", Role::Player, 600, Some(0), None).unwrap();
    let (status, _) = call(router.clone(), "POST", "/briscola/token/TEST01/", Some(&player), r#"{"role":"player","player_id":0}"#).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let other_host = gateway.issuer.mint("OTHER1", Role::Host, 600, None, None).unwrap();
    let (status, _) = call(router, "POST", "/briscola/token/TEST01/", Some(&other_host), r#"{"role":"observer"}"#).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
  }

  #[tokio::test]
  async fn token_validates_body() {
    let (router, gateway, _) = setup();
    let host = gateway.issuer.mint("TEST01", Role::Host, 600, None, None).unwrap();

    let (status, _) = call(router.clone(), "POST", "/briscola/token/TEST01/", Some(&host), r#"{"role":"host"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(router.clone(), "POST", "/briscola/token/TEST01/", Some(&host), r#"{"role":"player"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(router.clone(), "POST", "/briscola/token/TEST01/", Some(&host), "{oops").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
      router,
      "POST",
      "/briscola/token/TEST01/",
      Some(&host),
      r#"{"role":"player","player_id":3,"display_name":"Ann","ttl_minutes":10}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ttl_minutes"], 10);
    let claims = gateway.issuer.validate(body["token"].as_str().unwrap(), Some("TEST01")).unwrap();
    assert_eq!(claims.role, Role::Player);
    assert_eq!(claims.player_id, Some(3));
    assert_eq!(claims.display_name.as_deref(), Some("Ann"));
  }

  #[tokio::test]
  async fn observer_join_needs_no_auth() {
    let (router, gateway, _) = setup();
    let (status, body) = call(router, "POST", "/briscola/join/observer/TEST01/", None, r#"{"display_name":"Bob"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "observer");
    let claims = gateway.issuer.validate(body["token"].as_str().unwrap(), Some("TEST01")).unwrap();
    assert_eq!(claims.role, Role::Observer);
    assert_eq!(claims.player_id, None);
  }

  #[tokio::test]
  async fn health_and_status() {
    let (router, gateway, _) = setup();
    let (status, body) = call(router.clone(), "GET", "/briscola/health/", None, "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status":"ok","redis":true}));

    let (tx, _rx) = mpsc::unbounded_channel();
    gateway
      .registry
      .claim(crate::registry::SeatKey::new("TEST01", 2), crate::registry::Owner::new(crate::registry::ConnectionId::new(), tx))
      .await;
    let (_, body) = call(router, "GET", "/briscola/game/TEST01/status/", None, "").await;
    assert_eq!(body["game_id"], "TEST01");
    assert_eq!(body["observers_open"], true);
    assert_eq!(body["seats_connected"], json!([2]));
  }

  #[tokio::test]
  async fn end_game_publishes_stop_and_game_ended() {
    let (router, gateway, pubsub) = setup();
    let host = gateway.issuer.mint("TEST01", Role::Host, 600, None, None).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subs = Vec::new();
    for topic in [channels::control("TEST01"), channels::events("TEST01")] {
      let tx = tx.clone();
      let name = topic.clone();
      subs.push(
        pubsub
          .subscribe(&topic, move |bytes| {
            let tx = tx.clone();
            let name = name.clone();
            async move {
              tx.send((name, serde_json::from_slice::<Value>(&bytes).unwrap())).ok();
            }
          })
          .await
          .unwrap(),
      );
    }

    let (status, body) = call(router.clone(), "DELETE", "/briscola/game/TEST01/", Some(&host), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deleted");

    let mut seen = Vec::new();
    for _ in 0..2 {
      seen.push(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap());
    }
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(seen[0], (channels::control("TEST01"), json!({"command":"stop","game_id":"TEST01"})));
    assert_eq!(seen[1], (channels::events("TEST01"), json!({"message_type":"game.ended","game_id":"TEST01"})));

    let (status, _) = call(router, "POST", "/briscola/game/TEST01/sync/", None, "").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
  }
}
