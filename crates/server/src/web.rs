use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use futures_util::stream::StreamExt;
use lookout_protocol::{
    can_access_device, AdminInbound, AdminOutbound, AgentInbound, AllowedTenants,
    ComplianceEventDto, HubConfig, LoginRequest, LoginResponse, LoginUser, PutAliasRequest,
    PutAliasResponse, RawFrame, Tenant,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::{ServeDir, ServeFile};

use crate::auth::{self, Claims};
use crate::consent::{self, RequestOutcome};
use crate::error::HubError;
use crate::frames::{FrameRouter, ViewerGate};
use crate::sessions::SessionRegistry;
use crate::store::{now_millis, Store};

/// Shared application state threaded through every handler.
pub struct AppState {
    pub config: HubConfig,
    pub store: Arc<Store>,
    pub sessions: Arc<SessionRegistry>,
    pub frames: Arc<FrameRouter>,
    pub viewers: Arc<ViewerGate>,
    pub login_limiter: LoginRateLimiter,
    pub started_at: std::time::Instant,
    pub metrics_logins_attempted: AtomicU64,
    pub metrics_logins_failed: AtomicU64,
    pub metrics_frames_accepted: AtomicU64,
    pub metrics_frames_dropped: AtomicU64,
}

/// Simple per-key rate limiter for login attempts. Allows at most `max_attempts` in
/// `window_secs`. Bounded to prevent memory exhaustion from enumeration attacks; runs
/// TTL cleanup every `ttl_cleanup_interval` calls to `check()`.
pub struct LoginRateLimiter {
    attempts: std::sync::Mutex<std::collections::HashMap<String, Vec<std::time::Instant>>>,
    max_attempts: usize,
    window: std::time::Duration,
    max_keys: usize,
    call_count: AtomicU64,
    ttl_cleanup_interval: u64,
}

impl LoginRateLimiter {
    pub fn new(max_attempts: usize, window_secs: u64) -> Self {
        Self {
            attempts: std::sync::Mutex::new(std::collections::HashMap::new()),
            max_attempts,
            window: std::time::Duration::from_secs(window_secs),
            max_keys: 10_000,
            call_count: AtomicU64::new(0),
            ttl_cleanup_interval: 100,
        }
    }

    pub fn check(&self, key: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = std::time::Instant::now();

        let count = self.call_count.fetch_add(1, Ordering::Relaxed);
        if count.is_multiple_of(self.ttl_cleanup_interval) || attempts.len() > self.max_keys / 2 {
            attempts.retain(|_k, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                !timestamps.is_empty()
            });
        }

        if attempts.len() >= self.max_keys && !attempts.contains_key(key) {
            return false;
        }

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max_attempts {
            return false;
        }

        entry.push(now);
        true
    }

    pub fn clear(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(key);
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );

    response
}

/// Marks a REST response as never cacheable, per section 6.1.
async fn no_store(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-store"));
    response
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/login", axum::routing::post(login))
        .route("/api/devices", get(list_devices))
        .route("/api/logs", get(list_logs))
        .route("/api/device-aliases", get(list_aliases))
        .route("/api/device-aliases/{id}", put(put_alias))
        .route("/api/compliance/events", get(list_compliance))
        .route("/api/devices/{id}/frame", get(get_frame))
        .route("/api/devices/{id}/mjpeg", get(get_mjpeg))
        .route("/api/health", get(health))
        .route("/api/metrics", get(metrics))
        .layer(axum::middleware::from_fn(no_store))
        .layer(RequestBodyLimitLayer::new(65_536))
        .fallback(api_not_found)
        .with_state(Arc::clone(&state));

    let ws = Router::new().route("/", get(ws_upgrade)).with_state(state.clone());

    let index_html = std::path::Path::new(&state.config.web_root).join("index.html");
    let serve_dir = ServeDir::new(&state.config.web_root).not_found_service(ServeFile::new(index_html));

    Router::new()
        .merge(ws)
        .merge(api)
        .fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

async fn api_not_found(method: axum::http::Method, uri: axum::http::Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "API route not found",
            "method": method.as_str(),
            "path": uri.path(),
        })),
    )
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Extract and validate a JWT from `Authorization: Bearer` or `?token=`. Identical
/// verifier either way, since `<img>`/multipart clients cannot set custom headers.
fn extract_claims(headers: &HeaderMap, token_query: Option<&str>, jwt_secret: &str) -> Result<Claims, HubError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(token_query)
        .ok_or(HubError::Unauthenticated)?;

    auth::validate_jwt(token, jwt_secret).map_err(|e| {
        tracing::warn!("invalid JWT: {e}");
        HubError::Unauthenticated
    })
}

fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

async fn login(State(state): State<Arc<AppState>>, Json(req): Json<LoginRequest>) -> impl IntoResponse {
    tracing::info!(username = %req.username, "login request");

    if !is_valid_username(&req.username) {
        return HubError::BadRequest("invalid username".into()).into_response();
    }

    state.metrics_logins_attempted.fetch_add(1, Ordering::Relaxed);

    if !state.login_limiter.check(&req.username) {
        tracing::warn!(username = %req.username, "login rate limited");
        tracing::warn!(target: "audit", event = "rate_limited", username = %req.username);
        state
            .store
            .append_log("warn", "login rate limited", Some(json!({"username": req.username})))
            .await;
        state.metrics_logins_failed.fetch_add(1, Ordering::Relaxed);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "too many login attempts, try again later" })),
        )
            .into_response();
    }

    let allowed_tenants = match auth::authenticate(&req.username, &req.password) {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(username = %req.username, "authentication failed");
            tracing::info!(target: "audit", event = "login_failure", username = %req.username);
            state
                .store
                .append_log("warn", "login failed", Some(json!({"username": req.username})))
                .await;
            state.metrics_logins_failed.fetch_add(1, Ordering::Relaxed);
            return e.into_response();
        }
    };

    state.login_limiter.clear(&req.username);
    tracing::info!(target: "audit", event = "login_success", username = %req.username);
    state
        .store
        .append_log("info", "login succeeded", Some(json!({"username": req.username})))
        .await;

    let token = match auth::generate_jwt(&req.username, &allowed_tenants, &state.config.jwt_secret, state.config.token_ttl_secs) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("failed to generate JWT: {e}");
            return HubError::Persistence("token generation failed".into()).into_response();
        }
    };

    Json(LoginResponse {
        token,
        user: LoginUser {
            id: req.username.clone(),
            username: req.username,
            allowed_tenants,
        },
    })
    .into_response()
}

async fn list_devices(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let claims = match extract_claims(&headers, None, &state.config.jwt_secret) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let allowed = AllowedTenants(claims.allowed_tenants);
    let devices: Vec<_> = state
        .store
        .get_devices()
        .await
        .into_iter()
        .filter(|d| can_access_device(&allowed, Some(&Tenant::new(d.tenant.clone()))))
        .collect();
    Json(devices).into_response()
}

async fn list_logs(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = extract_claims(&headers, None, &state.config.jwt_secret) {
        return e.into_response();
    }
    Json(state.store.list_logs().await).into_response()
}

async fn list_aliases(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let claims = match extract_claims(&headers, None, &state.config.jwt_secret) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let allowed = AllowedTenants(claims.allowed_tenants);
    let mut out = std::collections::HashMap::new();
    for (device_id, alias) in state.store.list_aliases().await {
        let tenant = state.store.device_tenant(&device_id).await;
        if can_access_device(&allowed, tenant.as_ref()) {
            out.insert(device_id, alias);
        }
    }
    Json(out).into_response()
}

#[derive(Deserialize)]
struct ComplianceQuery {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
}

async fn list_compliance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ComplianceQuery>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, None, &state.config.jwt_secret) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let allowed = AllowedTenants(claims.allowed_tenants);

    let mut events: Vec<ComplianceEventDto> = Vec::new();
    for evt in state.store.list_compliance(query.device_id.as_deref()).await {
        let tenant = state.store.device_tenant(&evt.device_id).await;
        if can_access_device(&allowed, tenant.as_ref()) {
            events.push(evt);
        }
    }
    events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Json(events).into_response()
}

async fn put_alias(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    Json(req): Json<PutAliasRequest>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, None, &state.config.jwt_secret) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let allowed = AllowedTenants(claims.allowed_tenants);
    let tenant = state.store.device_tenant(&device_id).await;
    if !can_access_device(&allowed, tenant.as_ref()) {
        return HubError::TenantForbidden.into_response();
    }

    let Some(label) = req.label else {
        return HubError::BadRequest("missing label".into()).into_response();
    };

    match state.store.put_alias(&device_id, &label, now_millis()).await {
        Ok(alias) => {
            tracing::info!(target: "audit", event = "alias_updated", device_id = %device_id, label = %alias.label);
            state
                .store
                .append_log(
                    "info",
                    "alias updated",
                    Some(json!({"deviceId": device_id, "label": alias.label})),
                )
                .await;
            Json(PutAliasResponse {
                ok: true,
                device_id,
                label: alias.label,
                updated_at: alias.updated_at,
            })
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn get_frame(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, query.token.as_deref(), &state.config.jwt_secret) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let allowed = AllowedTenants(claims.allowed_tenants);
    let tenant = state.store.device_tenant(&device_id).await;
    if !can_access_device(&allowed, tenant.as_ref()) {
        return HubError::TenantForbidden.into_response();
    }

    match state.frames.latest(&device_id).await {
        Some((bytes, mime)) => (
            [(axum::http::header::CONTENT_TYPE, mime)],
            bytes.as_slice().to_vec(),
        )
            .into_response(),
        None => HubError::NotFound.into_response(),
    }
}

async fn get_mjpeg(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    let claims = match extract_claims(&headers, query.token.as_deref(), &state.config.jwt_secret) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    let allowed = AllowedTenants(claims.allowed_tenants);
    let tenant = state.store.device_tenant(&device_id).await;
    if !can_access_device(&allowed, tenant.as_ref()) {
        return HubError::TenantForbidden.into_response();
    }

    let attachment = state.viewers.attach(&device_id, &state.sessions).await;
    let frames = Arc::clone(&state.frames);
    let interval_ms = state.config.min_frame_interval_ms.max(1);

    let tick_stream = futures_util::stream::unfold(
        (attachment, device_id),
        move |(attachment, device_id)| {
            let frames = Arc::clone(&frames);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(interval_ms)).await;
                let part = match frames.latest(&device_id).await {
                    Some((bytes, mime)) => {
                        let mut part = Vec::new();
                        part.extend_from_slice(b"--frame\r\nContent-Type: ");
                        part.extend_from_slice(mime.as_bytes());
                        part.extend_from_slice(b"\r\nContent-Length: ");
                        part.extend_from_slice(bytes.len().to_string().as_bytes());
                        part.extend_from_slice(b"\r\n\r\n");
                        part.extend_from_slice(&bytes);
                        part.extend_from_slice(b"\r\n");
                        Some(part)
                    }
                    None => None,
                };
                // Always yield `Some` so the stream keeps ticking while no frame has
                // arrived yet; a `None` part is filtered out below rather than ending
                // the attachment.
                Some((part, (attachment, device_id)))
            }
        },
    )
    .filter_map(|part| async move { part.map(|bytes| Ok::<_, std::io::Error>(bytes::Bytes::from(bytes))) });

    axum::response::Response::builder()
        .status(StatusCode::OK)
        .header(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .body(Body::from_stream(tick_stream))
        .expect("static mjpeg response headers are always valid")
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "ts": now_millis() }))
}

async fn metrics(State(state): State<Arc<AppState>>, headers: HeaderMap, Query(query): Query<TokenQuery>) -> impl IntoResponse {
    if state.config.metrics_require_auth
        && let Err(e) = extract_claims(&headers, query.token.as_deref(), &state.config.jwt_secret)
    {
        return e.into_response();
    }

    let agent_sessions = state.sessions.agent_count().await;
    let admin_sessions = state.sessions.admin_count().await;
    let uptime_secs = state.started_at.elapsed().as_secs();
    let logins_attempted = state.metrics_logins_attempted.load(Ordering::Relaxed);
    let logins_failed = state.metrics_logins_failed.load(Ordering::Relaxed);
    let frames_accepted = state.metrics_frames_accepted.load(Ordering::Relaxed);
    let frames_dropped = state.metrics_frames_dropped.load(Ordering::Relaxed);

    let body = format!(
        "# HELP lookout_agent_sessions Number of active agent sessions\n\
         # TYPE lookout_agent_sessions gauge\n\
         lookout_agent_sessions {agent_sessions}\n\
         \n\
         # HELP lookout_admin_sessions Number of active admin sessions\n\
         # TYPE lookout_admin_sessions gauge\n\
         lookout_admin_sessions {admin_sessions}\n\
         \n\
         # HELP lookout_uptime_seconds Server uptime in seconds\n\
         # TYPE lookout_uptime_seconds gauge\n\
         lookout_uptime_seconds {uptime_secs}\n\
         \n\
         # HELP lookout_total_logins_attempted Total login attempts\n\
         # TYPE lookout_total_logins_attempted counter\n\
         lookout_total_logins_attempted {logins_attempted}\n\
         \n\
         # HELP lookout_total_logins_failed Total failed login attempts\n\
         # TYPE lookout_total_logins_failed counter\n\
         lookout_total_logins_failed {logins_failed}\n\
         \n\
         # HELP lookout_frames_accepted_total Total frames accepted by the frame router\n\
         # TYPE lookout_frames_accepted_total counter\n\
         lookout_frames_accepted_total {frames_accepted}\n\
         \n\
         # HELP lookout_frames_dropped_total Total frames dropped by the throttle\n\
         # TYPE lookout_frames_dropped_total counter\n\
         lookout_frames_dropped_total {frames_dropped}\n"
    );

    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[derive(Deserialize)]
struct WsQuery {
    role: Option<String>,
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    tenant: Option<String>,
    v: Option<String>,
    token: Option<String>,
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    match query.role.as_deref() {
        Some("agent") => {
            let Some(device_id) = query.device_id.clone() else {
                return (StatusCode::BAD_REQUEST, "missing deviceId").into_response();
            };
            ws.on_upgrade(move |socket| handle_agent_ws(socket, state, device_id, query))
        }
        Some("admin") => {
            let Some(token) = query.token.clone() else {
                return (StatusCode::UNAUTHORIZED, "missing token").into_response();
            };
            let claims = match auth::validate_jwt(&token, &state.config.jwt_secret) {
                Ok(c) => c,
                Err(_) => return (StatusCode::UNAUTHORIZED, "invalid token").into_response(),
            };
            ws.on_upgrade(move |socket| handle_admin_ws(socket, state, claims))
        }
        _ => (StatusCode::BAD_REQUEST, "missing or unknown role").into_response(),
    }
}

const WS_CLOSE_PROTOCOL_ERROR: u16 = 1008;

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Single receive loop for an agent session: reads the socket and drains its own
/// mailbox via `select!`, the only writer to this socket.
async fn handle_agent_ws(mut socket: WebSocket, state: Arc<AppState>, device_id: String, query: WsQuery) {
    let tenant = match query.tenant.as_deref() {
        Some(t) if !t.is_empty() => Tenant::new(t),
        _ => match state.config.default_tenant.as_deref() {
            Some(default) => Tenant::new(default),
            None => {
                close_with(&mut socket, WS_CLOSE_PROTOCOL_ERROR, "missing tenant, no default configured").await;
                return;
            }
        },
    };

    if let Err(mismatch) = state.store.upsert_device(&device_id, Some(&tenant)).await {
        tracing::warn!(device_id = %device_id, %mismatch, "rejecting agent with mismatched tenant");
        close_with(&mut socket, WS_CLOSE_PROTOCOL_ERROR, "tenant mismatch").await;
        return;
    }

    let agent_version = query.v.clone();
    state.store.set_connected(&device_id, true, Some(now_millis())).await;
    state.store.set_agent_version(&device_id, agent_version.clone()).await;

    let (mut handle, identity) = state.sessions.admit_agent(&device_id, tenant.clone()).await;
    tracing::info!(device_id = %device_id, tenant = %tenant, version = ?agent_version, "agent session admitted");
    state
        .store
        .append_log(
            "info",
            "agent session admitted",
            Some(json!({"deviceId": device_id, "tenant": tenant.as_str(), "agentVersion": agent_version})),
        )
        .await;

    state
        .sessions
        .broadcast_to_tenant(
            &tenant,
            &AdminOutbound::DevicePresence {
                device_id: device_id.clone(),
                online: true,
                last_seen: Some(now_millis()),
                agent_version: agent_version.clone(),
            },
        )
        .await;

    loop {
        tokio::select! {
            outbound = handle.rx.recv() => {
                match outbound {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = handle.kill.notified() => break,
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_agent_text_message(&state, &device_id, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        handle_agent_frame(&state, &device_id, RawFrame::jpeg(data.to_vec())).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(device_id = %device_id, "agent socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    // Only this identity's own departure should ever flip presence/connected to
    // offline — a session that lost a supplant race must not clobber the session
    // that replaced it (the spec's "at most one AgentSession per device" invariant).
    // The offline broadcast is sent before the session is actually removed from SR,
    // per section 5's ordering guarantee.
    if state.sessions.is_current_agent(&device_id, identity).await {
        state
            .sessions
            .broadcast_to_tenant(
                &tenant,
                &AdminOutbound::DevicePresence {
                    device_id: device_id.clone(),
                    online: false,
                    last_seen: None,
                    agent_version: agent_version.clone(),
                },
            )
            .await;
    }

    let removed = state.sessions.remove_agent(&device_id, identity).await;
    if removed {
        state.store.set_connected(&device_id, false, None).await;
    }
    tracing::info!(device_id = %device_id, "agent session closed");
    state
        .store
        .append_log("info", "agent session closed", Some(json!({"deviceId": device_id})))
        .await;
}

async fn handle_agent_text_message(state: &Arc<AppState>, device_id: &str, text: &str) {
    match AgentInbound::from_json(text) {
        Ok(AgentInbound::Ping) => {
            state.store.touch_last_seen(device_id, now_millis()).await;
            state.sessions.send_to_agent(device_id, &lookout_protocol::AgentOutbound::Pong).await;
        }
        Ok(AgentInbound::ConsentResponse { accepted }) => {
            tracing::info!(target: "audit", event = "consent_response", device_id = %device_id, accepted);
            state
                .store
                .append_log(
                    "info",
                    "consent response",
                    Some(json!({"deviceId": device_id, "accepted": accepted})),
                )
                .await;
            consent::broadcast_consent_response(&state.store, &state.sessions, device_id, accepted).await;
        }
        Ok(AgentInbound::Frame { payload }) => match RawFrame::decode_embedded(&payload) {
            Ok(frame) => handle_agent_frame(state, device_id, frame).await,
            Err(e) => tracing::warn!(device_id = %device_id, "malformed frame payload: {e}"),
        },
        Err(e) => tracing::warn!(device_id = %device_id, "malformed agent message, ignoring: {e}"),
    }
}

async fn handle_agent_frame(state: &Arc<AppState>, device_id: &str, frame: RawFrame) {
    state.store.touch_last_seen(device_id, now_millis()).await;
    if state.frames.accept(device_id, frame).await {
        state.metrics_frames_accepted.fetch_add(1, Ordering::Relaxed);
    } else {
        state.metrics_frames_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

async fn handle_admin_ws(mut socket: WebSocket, state: Arc<AppState>, claims: Claims) {
    let allowed = AllowedTenants(claims.allowed_tenants.clone());
    let (session_id, mut handle) = state.sessions.admit_admin(claims.sub.clone(), allowed.clone()).await;
    tracing::info!(username = %claims.sub, %session_id, "admin session admitted");
    state
        .store
        .append_log(
            "info",
            "admin session admitted",
            Some(json!({"username": claims.sub, "sessionId": session_id.to_string()})),
        )
        .await;

    let devices: Vec<_> = state
        .store
        .get_devices()
        .await
        .into_iter()
        .filter(|d| can_access_device(&allowed, Some(&Tenant::new(d.tenant.clone()))))
        .collect();
    let _ = socket
        .send(Message::Text(
            AdminOutbound::DevicesSnapshot { devices }.to_json().into(),
        ))
        .await;

    loop {
        tokio::select! {
            outbound = handle.rx.recv() => {
                match outbound {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = handle.kill.notified() => break,
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_admin_text_message(&state, &claims, &allowed, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(username = %claims.sub, "admin socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.sessions.remove_admin(session_id).await;
    tracing::info!(username = %claims.sub, %session_id, "admin session closed");
    state
        .store
        .append_log(
            "info",
            "admin session closed",
            Some(json!({"username": claims.sub, "sessionId": session_id.to_string()})),
        )
        .await;
}

async fn handle_admin_text_message(state: &Arc<AppState>, claims: &Claims, allowed: &AllowedTenants, text: &str) {
    let inbound: AdminInbound = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(username = %claims.sub, "malformed admin message, ignoring: {e}");
            return;
        }
    };

    match inbound {
        AdminInbound::RequestRemoteAccess { device_id } => {
            match consent::request_remote_access(&state.store, &state.sessions, allowed, &device_id).await {
                RequestOutcome::Forbidden => {
                    tracing::warn!(username = %claims.sub, device_id = %device_id, "remote access request forbidden");
                    state
                        .store
                        .append_log(
                            "warn",
                            "remote access request forbidden",
                            Some(json!({"username": claims.sub, "deviceId": device_id})),
                        )
                        .await;
                }
                RequestOutcome::AgentOffline => {
                    let tenant = state.store.device_tenant(&device_id).await;
                    state
                        .sessions
                        .broadcast_to_device_tenant(
                            tenant.as_ref(),
                            &AdminOutbound::ConsentResponse {
                                device_id,
                                accepted: false,
                                reason: Some("agent_offline".to_string()),
                            },
                        )
                        .await;
                }
                RequestOutcome::SentToAgent => {
                    consent::forward_to_agent(&state.sessions, &device_id, &claims.sub).await;
                    let tenant = state.store.device_tenant(&device_id).await;
                    state
                        .sessions
                        .broadcast_to_device_tenant(
                            tenant.as_ref(),
                            &AdminOutbound::ConsentStatus {
                                device_id,
                                status: "sent_to_agent".to_string(),
                            },
                        )
                        .await;
                }
            }
        }
    }
}
