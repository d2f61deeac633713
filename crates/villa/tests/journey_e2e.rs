//! End-to-end journeys through the HTTP router.
//!
//! Journey 1: reserve, claim, and change a nickname
//! Journey 2: taken nickname and policy denial as structured 4xx results
//! Journey 3: developer app registration, key auth, origin updates, rotation
//! Journey 4: handshake target resolution against the allowlists
//! Journey 5: origin validation endpoint and CORS
//! Journey 6: ownership proofs on profile writes

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use villa::http::{build_router, AppState};
use villa::{initialize_with_verifier, shutdown, VillaConfig};
use villa_core::{Address, Nickname, NicknameRules};
use villa_profile::{GatewayProofVerifier, ProofScope};

const SECRET: &[u8] = b"journey-gateway-secret";
const ALICE_ADDR: &str = "0x00000000000000000000000000000000000000a1";
const BOB_ADDR: &str = "0x00000000000000000000000000000000000000b2";

async fn journey_router(config: VillaConfig) -> Router {
    let verifier = Arc::new(GatewayProofVerifier::new(SECRET.to_vec()).unwrap());
    let state = initialize_with_verifier(config, verifier).await.unwrap();
    build_router(Arc::new(AppState::from_state(&state).unwrap()))
}

fn sign(address: &str, scope: ProofScope) -> String {
    let verifier = GatewayProofVerifier::new(SECRET.to_vec()).unwrap();
    verifier.sign(&Address::parse(address).unwrap(), &scope).unwrap()
}

fn normalized(nickname: &str) -> villa_core::NormalizedNickname {
    Nickname::parse(nickname, &NicknameRules::default())
        .unwrap()
        .normalized()
}

fn proof(address: &str, nickname: &str) -> String {
    sign(address, ProofScope::Claim(normalized(nickname)))
}

fn change_proof(address: &str, nickname: &str) -> String {
    sign(address, ProofScope::NicknameChange(normalized(nickname)))
}

fn avatar_proof(address: &str) -> String {
    sign(address, ProofScope::Avatar)
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    api_key: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    let body = match body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn reserve(app: &Router, nickname: &str, address: &str) -> (StatusCode, Value) {
    send(
        app,
        "POST",
        "/nicknames/reserve",
        Some(json!({ "nickname": nickname, "address": address })),
        None,
    )
    .await
}

async fn reserve_and_claim(app: &Router, nickname: &str, address: &str) -> (StatusCode, Value) {
    let (status, _) = reserve(app, nickname, address).await;
    assert_eq!(status, StatusCode::CREATED);
    send(
        app,
        "POST",
        "/profiles/claim",
        Some(json!({ "nickname": nickname, "address": address, "proof": proof(address, nickname) })),
        None,
    )
    .await
}

// ============================================================================
// Journey 1: reserve, claim, change
// ============================================================================

#[tokio::test]
async fn test_journey_claim_and_change() {
    let app = journey_router(VillaConfig::default()).await;

    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], "memory");

    let (status, body) = send(&app, "GET", "/nicknames/Alice/availability", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "nickname": "alice", "available": true }));

    let (status, body) = reserve_and_claim(&app, "Alice", ALICE_ADDR).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["nickname"], "Alice");
    assert_eq!(body["nicknameNormalized"], "alice");
    assert_eq!(body["nicknameChangeCount"], 0);

    let (status, body) = send(&app, "GET", &format!("/profiles/{}", ALICE_ADDR), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["address"], ALICE_ADDR);

    let (status, body) = send(
        &app,
        "GET",
        &format!("/profiles/{}/eligibility", ALICE_ADDR),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["canChangeNickname"], true);
    assert_eq!(body["changesRemaining"], 1);

    // A rename goes through the same reservation as a claim
    let (status, body) = reserve(&app, "alice_v2", ALICE_ADDR).await;
    assert_eq!(status, StatusCode::CREATED);
    let expires_at = body["expiresAt"].as_str().unwrap();
    assert!(expires_at.ends_with('Z'), "{}", expires_at);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/profiles/{}/nickname", ALICE_ADDR),
        Some(json!({ "nickname": "alice_v2", "proof": change_proof(ALICE_ADDR, "alice_v2") })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nickname"], "alice_v2");
    assert_eq!(body["nicknameChangeCount"], 1);
    assert!(body["lastNicknameChangeAt"].is_string());

    // The old handle is free again
    let (_, body) = send(&app, "GET", "/nicknames/alice/availability", None, None).await;
    assert_eq!(body["available"], true);

    let (status, body) = send(
        &app,
        "PUT",
        &format!("/profiles/{}/avatar", ALICE_ADDR),
        Some(json!({
            "avatar": { "type": "generated", "style": "avataaars", "seed": "female", "gender": "female" },
            "proof": avatar_proof(ALICE_ADDR),
        })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["avatar"]["selection"], "female");
    assert_eq!(body["nickname"], "alice_v2");
}

// ============================================================================
// Journey 2: conflicts and policy denial
// ============================================================================

#[tokio::test]
async fn test_journey_taken_nickname_is_a_conflict() {
    let app = journey_router(VillaConfig::default()).await;
    let (status, _) = reserve_and_claim(&app, "alice", ALICE_ADDR).await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, body) = send(&app, "GET", "/nicknames/Alice/availability", None, None).await;
    assert_eq!(body["available"], false);

    let (status, body) = send(
        &app,
        "POST",
        "/nicknames/reserve",
        Some(json!({ "nickname": "ALICE", "address": BOB_ADDR })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["nickname"], "alice");

    // Even with a well-formed proof the claim is a structured conflict
    let (status, body) = send(
        &app,
        "POST",
        "/profiles/claim",
        Some(json!({ "nickname": "alice", "address": BOB_ADDR, "proof": proof(BOB_ADDR, "alice") })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["nickname"], "alice");
}

#[tokio::test]
async fn test_journey_policy_denial() {
    let app = journey_router(VillaConfig::default()).await;
    reserve_and_claim(&app, "bobby", BOB_ADDR).await;

    let uri = format!("/profiles/{}/nickname", BOB_ADDR);
    reserve(&app, "bobby2", BOB_ADDR).await;
    let change = json!({ "nickname": "bobby2", "proof": change_proof(BOB_ADDR, "bobby2") });
    let (status, _) = send(&app, "POST", &uri, Some(change), None).await;
    assert_eq!(status, StatusCode::OK);

    let change = json!({ "nickname": "bobby3", "proof": change_proof(BOB_ADDR, "bobby3") });
    let (status, body) = send(&app, "POST", &uri, Some(change), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["canChangeNickname"], false);
    assert_eq!(body["changesRemaining"], 0);
    assert_eq!(body["error"], "Nickname change limit reached");
}

#[tokio::test]
async fn test_journey_bad_input() {
    let app = journey_router(VillaConfig::default()).await;

    let (status, _) = send(&app, "GET", "/nicknames/ab/availability", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/nicknames/reserve",
        Some(json!({ "nickname": "carol", "address": "0x1234" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "GET", &format!("/profiles/{}", BOB_ADDR), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Claim without a reservation
    let (status, _) = send(
        &app,
        "POST",
        "/profiles/claim",
        Some(json!({ "nickname": "carol", "address": BOB_ADDR, "proof": proof(BOB_ADDR, "carol") })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Reservation held, wrong proof
    send(
        &app,
        "POST",
        "/nicknames/reserve",
        Some(json!({ "nickname": "carol", "address": BOB_ADDR })),
        None,
    )
    .await;
    let (status, _) = send(
        &app,
        "POST",
        "/profiles/claim",
        Some(json!({ "nickname": "carol", "address": BOB_ADDR, "proof": "00".repeat(32) })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Journey 3: developer apps
// ============================================================================

#[tokio::test]
async fn test_journey_developer_app() {
    let app = journey_router(VillaConfig::default()).await;

    let (status, body) = send(
        &app,
        "POST",
        "/apps",
        Some(json!({ "ownerAddress": ALICE_ADDR, "allowedOrigins": ["https://shop.example.com", "http://evil.com"] })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["valid"], false);
    assert_eq!(body["failingOrigin"], "http://evil.com");

    let (status, body) = send(
        &app,
        "POST",
        "/apps",
        Some(json!({ "ownerAddress": ALICE_ADDR, "allowedOrigins": ["https://shop.example.com"] })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let app_id = body["appId"].as_str().unwrap().to_string();
    let key = body["apiKey"].as_str().unwrap().to_string();
    assert!(villa_apps::is_valid_app_id(&app_id));
    assert!(villa_apps::is_valid_api_key(&key));
    assert_eq!(body["rateLimit"], 100);

    let uri = format!("/apps/{}", app_id);
    let (status, _) = send(&app, "GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, "GET", &uri, None, Some(&key)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowedOrigins"], json!(["https://shop.example.com"]));
    assert!(body.get("apiKeyHash").is_none());
    assert!(body.get("apiKey").is_none());

    let (status, body) = send(
        &app,
        "PUT",
        &format!("/apps/{}/origins", app_id),
        Some(json!({ "allowedOrigins": ["https://shop.example.com", "https://m.shop.example.com"] })),
        Some(&key),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowedOrigins"].as_array().unwrap().len(), 2);

    let (status, body) = send(
        &app,
        "PUT",
        &format!("/apps/{}/origins", app_id),
        Some(json!({ "allowedOrigins": ["https://a.com", "https://a.com"] })),
        Some(&key),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Duplicate origins not allowed");

    let (status, body) = send(&app, "POST", &format!("/apps/{}/api-key", app_id), None, Some(&key)).await;
    assert_eq!(status, StatusCode::OK);
    let new_key = body["apiKey"].as_str().unwrap().to_string();
    assert_ne!(new_key, key);

    let (status, _) = send(&app, "GET", &uri, None, Some(&key)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, "GET", &uri, None, Some(&new_key)).await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Journey 4: handshake target resolution
// ============================================================================

#[tokio::test]
async fn test_journey_handshake_resolution() {
    let app = journey_router(VillaConfig::default()).await;
    send(
        &app,
        "POST",
        "/apps",
        Some(json!({ "ownerAddress": ALICE_ADDR, "allowedOrigins": ["https://partner.example"] })),
        None,
    )
    .await;

    let (status, body) = send(
        &app,
        "POST",
        "/handshake/resolve",
        Some(json!({ "referrer": "https://partner.example/checkout", "host": "villa.cash" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["targetOrigin"], "https://partner.example");
    assert_eq!(body["source"], "referrer");
    assert_eq!(body["mode"], "iframe");
    assert_eq!(body["willPost"], true);

    let (_, body) = send(
        &app,
        "POST",
        "/handshake/resolve",
        Some(json!({ "origin": "https://attacker.example", "host": "villa.cash", "hasOpener": true })),
        None,
    )
    .await;
    assert_eq!(body["targetOrigin"], Value::Null);
    assert_eq!(body["willPost"], false);
    assert_eq!(body["mode"], "popup");

    let (_, body) = send(
        &app,
        "POST",
        "/handshake/resolve",
        Some(json!({ "host": "localhost:8443" })),
        None,
    )
    .await;
    assert_eq!(body["targetOrigin"], "https://localhost");
    assert_eq!(body["source"], "local_fallback");
}

#[tokio::test]
async fn test_journey_handshake_uses_configured_responder() {
    let mut config = VillaConfig::default();
    config.handshake.responder_url = "https://id.example.org/connect".into();
    config.handshake.popup_close_delay_ms = 2750;
    let app = journey_router(config).await;

    let (_, body) = send(
        &app,
        "POST",
        "/handshake/resolve",
        Some(json!({ "referrer": "https://villa.cash/home", "host": "villa.cash", "hasOpener": true })),
        None,
    )
    .await;
    assert_eq!(body["mode"], "popup");
    assert_eq!(body["closeDelayMs"], 2750);

    let (_, body) = send(
        &app,
        "POST",
        "/handshake/resolve",
        Some(json!({ "referrer": "https://villa.cash/home", "host": "villa.cash" })),
        None,
    )
    .await;
    assert_eq!(body["mode"], "iframe");
    assert_eq!(body["closeDelayMs"], Value::Null);

    let (status, body) = send(
        &app,
        "POST",
        "/handshake/launch",
        Some(json!({ "appId": "app_demo", "origin": "https://Shop.Example.com/", "mode": "popup" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let url = body["url"].as_str().unwrap();
    assert!(url.starts_with("https://id.example.org/connect?appId=app_demo"), "{}", url);
    assert!(url.contains("shop.example.com"), "{}", url);
    assert!(url.ends_with("mode=popup"), "{}", url);
    assert_eq!(body["responderOrigin"], "https://id.example.org");
    assert_eq!(body["closeDelayMs"], 2750);

    let (status, _) = send(
        &app,
        "POST",
        "/handshake/launch",
        Some(json!({ "origin": "http://evil.com" })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ============================================================================
// Journey 5: origin validation, CORS, lifecycle
// ============================================================================

#[tokio::test]
async fn test_journey_validate_origins() {
    let app = journey_router(VillaConfig::default()).await;

    let (status, body) = send(
        &app,
        "POST",
        "/origins/validate",
        Some(json!({ "origins": ["https://a.com", "https://a.com"] })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
    assert_eq!(body["error"], "Duplicate origins not allowed");

    let (_, body) = send(
        &app,
        "POST",
        "/origins/validate",
        Some(json!({ "origin": "https://*.example.com" })),
        None,
    )
    .await;
    assert_eq!(body["valid"], false);
    assert!(body["reason"].as_str().unwrap().contains("Wildcards"));

    let (_, body) = send(&app, "POST", "/origins/validate", Some(json!({ "origins": "x" })), None).await;
    assert_eq!(body["error"], "Origins must be an array");
}

#[tokio::test]
async fn test_journey_cors_preflight() {
    let mut config = VillaConfig::default();
    config.server.cors_origins = vec!["https://app.villa.cash".into()];
    let app = journey_router(config).await;

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/nicknames/reserve")
        .header("origin", "https://app.villa.cash")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "https://app.villa.cash"
    );

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/nicknames/reserve")
        .header("origin", "https://elsewhere.example")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert!(response.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn test_journey_router_needs_live_services() {
    let verifier = Arc::new(GatewayProofVerifier::new(SECRET.to_vec()).unwrap());
    let mut state = initialize_with_verifier(VillaConfig::default(), verifier)
        .await
        .unwrap();
    shutdown(&mut state).await.unwrap();
    assert!(matches!(
        AppState::from_state(&state),
        Err(villa::RootError::NotInitialized)
    ));
}

// ============================================================================
// Journey 6: ownership proofs on profile writes
// ============================================================================

#[tokio::test]
async fn test_journey_profile_writes_need_proof() {
    let app = journey_router(VillaConfig::default()).await;
    reserve_and_claim(&app, "alice", ALICE_ADDR).await;
    reserve(&app, "mallory", ALICE_ADDR).await;

    let rename = format!("/profiles/{}/nickname", ALICE_ADDR);
    let (status, _) = send(&app, "POST", &rename, Some(json!({ "nickname": "mallory" })), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A claim token or another address's token does not authorize a rename
    for forged in [proof(ALICE_ADDR, "mallory"), change_proof(BOB_ADDR, "mallory")] {
        let (status, _) = send(
            &app,
            "POST",
            &rename,
            Some(json!({ "nickname": "mallory", "proof": forged })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    let avatar = format!("/profiles/{}/avatar", ALICE_ADDR);
    let selection = json!({ "type": "custom", "url": "https://cdn.example/a.png" });
    let (status, _) = send(&app, "PUT", &avatar, Some(json!({ "avatar": selection })), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(
        &app,
        "PUT",
        &avatar,
        Some(json!({ "avatar": selection, "proof": avatar_proof(BOB_ADDR) })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, body) = send(&app, "GET", &format!("/profiles/{}", ALICE_ADDR), None, None).await;
    assert_eq!(body["nickname"], "alice");
    assert_eq!(body["nicknameChangeCount"], 0);
    assert_eq!(body["avatar"], Value::Null);
}

#[tokio::test]
async fn test_journey_rename_respects_other_reservation() {
    let app = journey_router(VillaConfig::default()).await;
    reserve_and_claim(&app, "alice", ALICE_ADDR).await;

    let (status, _) = reserve(&app, "xavier", BOB_ADDR).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/profiles/{}/nickname", ALICE_ADDR),
        Some(json!({ "nickname": "Xavier", "proof": change_proof(ALICE_ADDR, "Xavier") })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["nickname"], "xavier");

    // Bob still gets the nickname he reserved
    let (status, body) = send(
        &app,
        "POST",
        "/profiles/claim",
        Some(json!({ "nickname": "xavier", "address": BOB_ADDR, "proof": proof(BOB_ADDR, "xavier") })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["address"], BOB_ADDR);

    let (_, body) = send(&app, "GET", &format!("/profiles/{}", ALICE_ADDR), None, None).await;
    assert_eq!(body["nickname"], "alice");
}
