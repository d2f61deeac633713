//! Axum HTTP handlers for the Villa service.
//!
//! Thin adapters over the component services: nickname reservation and
//! claim, profile reads and updates, origin validation, developer app
//! registration, and handshake origin resolution and launch. Profile writes
//! carry a gateway ownership proof in the body. Expected outcomes come
//! back as structured JSON with a 4xx status; storage outages as 503.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use villa_apps::{AppError, IssuedApp};
use villa_core::{
    normalize_origin, validate_origin, validate_origins_value, Address, Avatar, Timestamp,
    VillaError,
};
use villa_handshake::{HandshakeError, ResolveInput, ResponderParams, TransportMode};
use villa_profile::ClaimError;

use crate::error::{RootError, RootResult};
use crate::{Services, VillaState};

const API_KEY_HEADER: &str = "x-api-key";

type Reply = (StatusCode, Json<Value>);

/// Shared application state for Axum handlers.
pub struct AppState {
    pub services: Arc<Services>,
    pub cors_origins: Vec<String>,
}

impl AppState {
    pub fn from_state(state: &VillaState) -> RootResult<Self> {
        Ok(Self {
            services: state.services()?,
            cors_origins: state.config.server.cors_origins.clone(),
        })
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let values: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(&normalize_origin(o)) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "skipping CORS origin that is not a valid header value");
                None
            }
        })
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(values))
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(API_KEY_HEADER)]),
    )
}

/// Build the Axum router with all endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.cors_origins);

    let router = Router::new()
        .route("/health", get(handle_health))
        .route("/nicknames/{nickname}/availability", get(handle_availability))
        .route("/nicknames/reserve", post(handle_reserve))
        .route("/profiles/claim", post(handle_claim))
        .route("/profiles/{address}", get(handle_profile))
        .route("/profiles/{address}/avatar", put(handle_set_avatar))
        .route("/profiles/{address}/nickname", post(handle_change_nickname))
        .route("/profiles/{address}/eligibility", get(handle_eligibility))
        .route("/origins/validate", post(handle_validate_origins))
        .route("/apps", post(handle_register_app))
        .route("/apps/{app_id}", get(handle_get_app))
        .route("/apps/{app_id}/origins", put(handle_update_origins))
        .route("/apps/{app_id}/api-key", post(handle_rotate_key))
        .route("/handshake/resolve", post(handle_resolve))
        .route("/handshake/launch", post(handle_launch))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    match cors {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn storage_reply(e: &VillaError) -> Reply {
    let status = match e {
        VillaError::Validation(_) => StatusCode::BAD_REQUEST,
        VillaError::UniqueViolation { .. } => StatusCode::CONFLICT,
        VillaError::NotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, "storage failure");
    }
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        "internal error".to_string()
    } else {
        e.to_string()
    };
    (status, Json(json!({ "error": message })))
}

fn claim_reply(e: &ClaimError) -> Reply {
    let message = e.to_string();
    match e {
        ClaimError::Invalid(msg) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))),
        ClaimError::Unchanged => (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))),
        ClaimError::NicknameTaken { nickname } | ClaimError::ReservationRequired { nickname } => (
            StatusCode::CONFLICT,
            Json(json!({ "error": message, "nickname": nickname })),
        ),
        ClaimError::AlreadyClaimed(_) | ClaimError::NotClaimed(_) | ClaimError::ConcurrentChange => {
            (StatusCode::CONFLICT, Json(json!({ "error": message })))
        }
        ClaimError::ProfileNotFound(_) => (StatusCode::NOT_FOUND, Json(json!({ "error": message }))),
        ClaimError::PolicyDenied(eligibility) => {
            let mut body = serde_json::to_value(eligibility).unwrap_or_else(|_| json!({}));
            body["error"] = json!(eligibility.reason.as_deref().unwrap_or("nickname change denied"));
            body["canChangeNickname"] = json!(false);
            (StatusCode::FORBIDDEN, Json(body))
        }
        ClaimError::ProofRejected => (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))),
        ClaimError::Verifier(_) => {
            error!(error = %e, "ownership verifier failure");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "ownership verifier unavailable" })),
            )
        }
        ClaimError::Storage(e) => storage_reply(e),
    }
}

fn app_reply(e: &AppError) -> Reply {
    match e {
        AppError::Invalid(msg) => (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))),
        AppError::InvalidOrigins(check) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::to_value(check).unwrap_or_else(|_| json!({ "valid": false }))),
        ),
        AppError::MalformedAppId | AppError::MalformedApiKey | AppError::Unauthorized => {
            (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })))
        }
        AppError::CredentialCollision => {
            error!("credential allocation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
        }
        AppError::Storage(e) => storage_reply(e),
    }
}

fn handshake_reply(e: &HandshakeError) -> Reply {
    match e {
        HandshakeError::InvalidOrigin(_) | HandshakeError::InvalidParams(_) | HandshakeError::Wire(_) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
        }
        HandshakeError::Lookup(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        ),
        _ => {
            error!(error = %e, "handshake failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
        }
    }
}

/// Status and body for a failed request.
pub fn error_reply(err: RootError) -> Reply {
    match &err {
        RootError::Claim(e) => claim_reply(e),
        RootError::App(e) => app_reply(e),
        RootError::Handshake(e) => handshake_reply(e),
        RootError::Storage(e) => storage_reply(e),
        RootError::NotInitialized => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": err.to_string() })),
        ),
        _ => {
            error!(error = %err, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
        }
    }
}

fn reply<T: serde::Serialize>(status: StatusCode, body: &T) -> Reply {
    match serde_json::to_value(body) {
        Ok(value) => (status, Json(value)),
        Err(e) => error_reply(e.into()),
    }
}

fn parse_address(raw: &str) -> Result<Address, Reply> {
    Address::parse(raw).map_err(|e| error_reply(e.into()))
}

fn api_key(headers: &HeaderMap) -> Result<&str, Reply> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "missing x-api-key header" })),
            )
        })
}

/// Untyped origin list from a request body, checked before it is trusted.
fn origin_list(value: &Value) -> Result<Vec<String>, Reply> {
    let check = validate_origins_value(value);
    if !check.valid {
        return Err(error_reply(AppError::InvalidOrigins(check).into()));
    }
    serde_json::from_value(value.clone()).map_err(|e| error_reply(e.into()))
}

fn issued_body(issued: &IssuedApp) -> Value {
    json!({
        "appId": issued.app.app_id,
        "apiKey": issued.api_key.expose(),
        "ownerAddress": issued.app.owner_address,
        "allowedOrigins": issued.app.allowed_origins,
        "rateLimit": issued.app.rate_limit,
        "createdAt": issued.app.created_at,
    })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// GET /health
async fn handle_health(State(state): State<Arc<AppState>>) -> Reply {
    let storage = state.services.storage_kind;
    match state.services.nicknames.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "storage": storage,
            })),
        ),
        Err(e) => {
            warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "version": env!("CARGO_PKG_VERSION"),
                    "storage": storage,
                })),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Nicknames and profiles
// ---------------------------------------------------------------------------

/// GET /nicknames/{nickname}/availability
async fn handle_availability(
    State(state): State<Arc<AppState>>,
    Path(nickname): Path<String>,
) -> Reply {
    let registry = &state.services.nicknames;
    let key = match registry.parse_nickname(&nickname) {
        Ok(n) => n.normalized(),
        Err(e) => return error_reply(e.into()),
    };
    match registry.check_available(&nickname, Timestamp::now()).await {
        Ok(available) => (
            StatusCode::OK,
            Json(json!({ "nickname": key, "available": available })),
        ),
        Err(e) => error_reply(e.into()),
    }
}

#[derive(Deserialize)]
struct ReserveRequest {
    nickname: String,
    address: String,
}

/// POST /nicknames/reserve
async fn handle_reserve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReserveRequest>,
) -> Reply {
    let address = match parse_address(&req.address) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .services
        .nicknames
        .reserve(&req.nickname, &address, Timestamp::now())
        .await
    {
        Ok(reservation) => reply(StatusCode::CREATED, &reservation),
        Err(e) => error_reply(e.into()),
    }
}

#[derive(Deserialize)]
struct ClaimRequest {
    nickname: String,
    address: String,
    proof: String,
}

/// POST /profiles/claim
async fn handle_claim(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClaimRequest>,
) -> Reply {
    let address = match parse_address(&req.address) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .services
        .nicknames
        .claim(&req.nickname, &address, &req.proof, Timestamp::now())
        .await
    {
        Ok(profile) => reply(StatusCode::CREATED, &profile),
        Err(e) => error_reply(e.into()),
    }
}

/// GET /profiles/{address}
async fn handle_profile(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Reply {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state.services.nicknames.profile(&address).await {
        Ok(Some(profile)) => reply(StatusCode::OK, &profile),
        Ok(None) => error_reply(ClaimError::ProfileNotFound(address).into()),
        Err(e) => error_reply(e.into()),
    }
}

#[derive(Deserialize)]
struct SetAvatarRequest {
    avatar: Avatar,
    /// Gateway token for the `avatar` scope; missing is rejected like invalid.
    #[serde(default)]
    proof: String,
}

/// PUT /profiles/{address}/avatar
async fn handle_set_avatar(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Json(req): Json<SetAvatarRequest>,
) -> Reply {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .services
        .nicknames
        .set_avatar(&address, &req.avatar, &req.proof, Timestamp::now())
        .await
    {
        Ok(profile) => reply(StatusCode::OK, &profile),
        Err(e) => error_reply(e.into()),
    }
}

#[derive(Deserialize)]
struct ChangeNicknameRequest {
    nickname: String,
    /// Gateway token for the `change` scope and the new nickname.
    #[serde(default)]
    proof: String,
}

/// POST /profiles/{address}/nickname
async fn handle_change_nickname(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Json(req): Json<ChangeNicknameRequest>,
) -> Reply {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .services
        .nicknames
        .change_nickname(&address, &req.nickname, &req.proof, Timestamp::now())
        .await
    {
        Ok(profile) => reply(StatusCode::OK, &profile),
        Err(e) => error_reply(e.into()),
    }
}

/// GET /profiles/{address}/eligibility
async fn handle_eligibility(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Reply {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(r) => return r,
    };
    match state
        .services
        .nicknames
        .eligibility(&address, Timestamp::now())
        .await
    {
        Ok(eligibility) => reply(StatusCode::OK, &eligibility),
        Err(e) => error_reply(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Origins
// ---------------------------------------------------------------------------

/// POST /origins/validate -- `{"origin": ".."}` or `{"origins": [..]}`.
/// Always 200; the verdict is in the body.
async fn handle_validate_origins(Json(body): Json<Value>) -> Reply {
    if let Some(origin) = body.get("origin").and_then(Value::as_str) {
        return reply(StatusCode::OK, &validate_origin(origin));
    }
    let origins = body.get("origins").unwrap_or(&Value::Null);
    reply(StatusCode::OK, &validate_origins_value(origins))
}

// ---------------------------------------------------------------------------
// Developer apps
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterAppRequest {
    owner_address: String,
    #[serde(default)]
    allowed_origins: Value,
    rate_limit: Option<u32>,
}

/// POST /apps -- the API key is in this response only.
async fn handle_register_app(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterAppRequest>,
) -> Reply {
    let owner = match parse_address(&req.owner_address) {
        Ok(a) => a,
        Err(r) => return r,
    };
    let origins = match origin_list(&req.allowed_origins) {
        Ok(o) => o,
        Err(r) => return r,
    };
    match state
        .services
        .apps
        .register(&owner, &origins, req.rate_limit, Timestamp::now())
        .await
    {
        Ok(issued) => (StatusCode::CREATED, Json(issued_body(&issued))),
        Err(e) => error_reply(e.into()),
    }
}

/// GET /apps/{app_id}
async fn handle_get_app(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    let key = match api_key(&headers) {
        Ok(k) => k,
        Err(r) => return r,
    };
    match state.services.apps.authenticate(&app_id, key).await {
        Ok(app) => reply(StatusCode::OK, &app),
        Err(e) => error_reply(e.into()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateOriginsRequest {
    #[serde(default)]
    allowed_origins: Value,
}

/// PUT /apps/{app_id}/origins
async fn handle_update_origins(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<UpdateOriginsRequest>,
) -> Reply {
    let key = match api_key(&headers) {
        Ok(k) => k,
        Err(r) => return r,
    };
    let origins = match origin_list(&req.allowed_origins) {
        Ok(o) => o,
        Err(r) => return r,
    };
    match state
        .services
        .apps
        .update_origins(&app_id, key, &origins, Timestamp::now())
        .await
    {
        Ok(app) => reply(StatusCode::OK, &app),
        Err(e) => error_reply(e.into()),
    }
}

/// POST /apps/{app_id}/api-key -- rotate; the old key stops working.
async fn handle_rotate_key(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    headers: HeaderMap,
) -> Reply {
    let key = match api_key(&headers) {
        Ok(k) => k,
        Err(r) => return r,
    };
    match state
        .services
        .apps
        .rotate_api_key(&app_id, key, Timestamp::now())
        .await
    {
        Ok(issued) => (StatusCode::OK, Json(issued_body(&issued))),
        Err(e) => error_reply(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolveRequest {
    referrer: Option<String>,
    origin: Option<String>,
    host: Option<String>,
    #[serde(default)]
    has_opener: bool,
    mode: Option<TransportMode>,
}

/// POST /handshake/resolve -- the target origin the responder page may post
/// to. `targetOrigin: null` means it must post nothing.
async fn handle_resolve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResolveRequest>,
) -> Reply {
    let mode = TransportMode::detect(req.has_opener, req.mode);
    let input = ResolveInput {
        referrer: req.referrer,
        origin_param: req.origin,
        host: req.host,
    };
    let close_delay_ms = delay_ms(state.services.handshake.close_delay(mode));
    match state.services.origins.resolve(&input).await {
        Some(resolution) => (
            StatusCode::OK,
            Json(json!({
                "targetOrigin": resolution.origin,
                "source": resolution.source,
                "mode": mode,
                "willPost": true,
                "closeDelayMs": close_delay_ms,
            })),
        ),
        None => {
            warn!(referrer = ?input.referrer, "no trusted target origin resolved");
            (
                StatusCode::OK,
                Json(json!({
                    "targetOrigin": Value::Null,
                    "source": Value::Null,
                    "mode": mode,
                    "willPost": false,
                    "closeDelayMs": close_delay_ms,
                })),
            )
        }
    }
}

fn delay_ms(delay: Option<Duration>) -> Option<u64> {
    delay.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchRequest {
    app_id: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    origin: Option<String>,
    mode: Option<TransportMode>,
}

/// POST /handshake/launch -- the responder URL an initiator should open, and
/// the origin it must require on every message it accepts.
async fn handle_launch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LaunchRequest>,
) -> Reply {
    if let Some(origin) = &req.origin {
        let check = validate_origin(origin);
        if let Some(reason) = check.reason {
            return error_reply(HandshakeError::InvalidOrigin(format!("{}: {}", origin, reason)).into());
        }
    }
    let mode = req.mode.unwrap_or_default();
    let params = ResponderParams {
        app_id: req.app_id,
        scopes: req.scopes,
        origin: req.origin.as_deref().map(normalize_origin),
        mode: req.mode,
    };
    let settings = &state.services.handshake;
    match settings.launch_url(&params) {
        Ok(url) => (
            StatusCode::OK,
            Json(json!({
                "url": url.as_str(),
                "responderOrigin": settings.responder_origin(),
                "mode": mode,
                "closeDelayMs": delay_ms(settings.close_delay(mode)),
            })),
        ),
        Err(e) => error_reply(e.into()),
    }
}
