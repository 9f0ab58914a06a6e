//! HTTP surface tests driven through the router without a socket

use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use stakeroom::{
    api::{ApiServer, AppState},
    config::ServerConfig,
    metrics::EngineMetrics,
    Clock, KvStore, MemoryStore, PriceBook, SessionCoordinator, StakeroomConfig, SystemClock,
};
use std::sync::Arc;
use tower::ServiceExt;

const ADMIN_KEY: &str = "test-admin-key";

fn app() -> Router {
    app_with_key(Some(ADMIN_KEY))
}

fn app_with_key(admin_api_key: Option<&str>) -> Router {
    let config = StakeroomConfig::in_memory();
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let prices = Arc::new(PriceBook::new());
    let coordinator = Arc::new(SessionCoordinator::new(
        store,
        prices.clone(),
        clock.clone(),
        &config,
        Arc::new(EngineMetrics::new().unwrap()),
    ));

    let state = Arc::new(AppState {
        coordinator,
        prices,
        clock,
        admin_api_key: admin_api_key.map(str::to_string),
        version: "test".to_string(),
    });
    let server_config = ServerConfig {
        admin_api_key: admin_api_key.map(str::to_string),
        ..ServerConfig::default()
    };
    ApiServer::new(server_config, state).create_app()
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, value)
}

/// Open an account and credit it through a confirmed deposit
async fn fund(app: &Router, account_id: &str, amount: u64) {
    let (status, _, _) = send(app, "POST", "/accounts", &[], Some(json!({"account_id": account_id}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(
        app,
        "POST",
        "/balance/deposit",
        &[("x-account-id", account_id)],
        Some(json!({"amount": amount})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deposit"]["status"], "Pending");

    let confirm = format!("/deposits/{}/confirm", body["deposit"]["id"].as_str().unwrap());
    let (status, _, body) = send(app, "POST", &confirm, &[("x-api-key", ADMIN_KEY)], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deposit"]["status"], "Confirmed");
}

#[tokio::test]
async fn test_health_and_request_id_echo() {
    let app = app();
    let (status, headers, body) = send(&app, "GET", "/health", &[("x-request-id", "abc-123")], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Running");
    assert_eq!(headers.get("x-request-id").unwrap(), "abc-123");

    let (_, headers, _) = send(&app, "GET", "/health", &[], None).await;
    assert!(headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn test_balance_requires_account_header() {
    let app = app();
    fund(&app, "alice", 100).await;

    let (status, _, body) = send(&app, "GET", "/balance", &[], None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, _, body) = send(&app, "GET", "/balance", &[("x-account-id", "alice")], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 100);
    assert_eq!(body["available"], 100);

    let (status, _, body) = send(&app, "GET", "/balance", &[("x-account-id", "nobody")], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "UNKNOWN_ENTITY");
}

#[tokio::test]
async fn test_admin_endpoints_require_key() {
    let app = app();
    let push = json!({"coin": "BTC", "price": 100});

    let (status, _, body) = send(&app, "POST", "/prices", &[], Some(push.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _, body) = send(&app, "POST", "/prices", &[("x-api-key", ADMIN_KEY)], Some(push)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["coin"], "BTC");
}

#[tokio::test]
async fn test_wager_flow_and_error_codes() {
    let app = app();
    let alice = [("x-account-id", "alice")];
    fund(&app, "alice", 100).await;
    send(
        &app,
        "POST",
        "/prices",
        &[("x-api-key", ADMIN_KEY)],
        Some(json!({"coin": "BTC", "price": 64000})),
    )
    .await;

    let (status, _, body) = send(&app, "POST", "/wagers/check", &alice, Some(json!({"amount": 500}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], false);
    assert_eq!(body["available"], 100);

    let bet = json!({"amount": 40, "coin": "btc", "horizon_hours": 6, "direction": "up"});
    let (status, _, body) = send(&app, "POST", "/wagers", &alice, Some(bet.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["entry_price"], 64000);
    let wager_id = body["wager_id"].as_str().unwrap().to_string();

    let (status, _, body) = send(&app, "POST", "/wagers", &alice, Some(bet)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DUPLICATE_WAGER");

    let too_much = json!({"amount": 500, "coin": "BTC", "horizon_hours": 12, "direction": "down"});
    let (status, _, body) = send(&app, "POST", "/wagers", &alice, Some(too_much)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "INSUFFICIENT_FUNDS");
    assert!(body["request_id"].as_str().is_some());

    let bad_horizon = json!({"amount": 5, "coin": "BTC", "horizon_hours": 7, "direction": "up"});
    let (status, _, _) = send(&app, "POST", "/wagers", &alice, Some(bad_horizon)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(&app, "GET", &format!("/wagers/{}", wager_id), &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["wager"]["status"], "Placed");

    let (_, _, body) = send(&app, "GET", "/wagers", &alice, None).await;
    assert_eq!(body["wagers"].as_array().unwrap().len(), 1);

    let (_, _, body) = send(&app, "GET", "/balance", &alice, None).await;
    assert_eq!(body["balance"], 60);
}

#[tokio::test]
async fn test_room_flow_over_http() {
    let app = app();
    for account in ["host", "guest"] {
        fund(&app, account, 100).await;
    }

    let (status, _, body) = send(
        &app,
        "POST",
        "/rooms",
        &[("x-account-id", "host")],
        Some(json!({"name": "dice night", "reward": 50, "kind": "dice"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reward"], 50);
    let room_id = body["room_id"].as_str().unwrap().to_string();

    let (_, _, body) = send(&app, "GET", "/rooms?kind=dice", &[], None).await;
    let rooms = body["rooms"].as_array().unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0]["name"], "dice night");

    let (_, _, body) = send(&app, "GET", "/rooms?kind=blackjack", &[], None).await;
    assert!(body["rooms"].as_array().unwrap().is_empty());

    let join = format!("/rooms/{}/join", room_id);
    let (status, _, body) = send(&app, "POST", &join, &[("x-account-id", "guest")], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "InProgress");

    fund(&app, "late", 100).await;
    let (status, _, body) = send(&app, "POST", &join, &[("x-account-id", "late")], None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ROOM_FULL");

    let result = format!("/rooms/{}/result", room_id);
    let outcome = json!({"outcome": {"type": "winner", "account_id": "guest"}});
    let (status, _, _) = send(&app, "POST", &result, &[("x-api-key", ADMIN_KEY)], Some(outcome)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&app, "GET", &format!("/rooms/{}", room_id), &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pool"], 100);
    assert_eq!(body["seats_taken"], 2);

    let (status, _, _) = send(&app, "GET", "/rooms/does-not-exist", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let app = app();
    let (status, _, body) = send(&app, "POST", "/accounts", &[], Some(json!({"referrer": "bob"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let app = app();
    send(&app, "POST", "/accounts", &[], Some(json!({"account_id": "alice"}))).await;

    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("stakeroom_operations_total{op=\"open_account\",result=\"ok\"} 1"));
}

#[tokio::test]
async fn test_unauthenticated_callers_cannot_mint_balance() {
    let app = app();
    let alice = [("x-account-id", "alice")];

    let (status, _, body) = send(
        &app,
        "POST",
        "/accounts",
        &[],
        Some(json!({"account_id": "alice", "initial_balance": 1_000_000})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    let (status, _, _) = send(&app, "POST", "/accounts", &[], Some(json!({"account_id": "alice"}))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(&app, "POST", "/balance/deposit", &alice, Some(json!({"amount": 500}))).await;
    assert_eq!(status, StatusCode::OK);
    let confirm = format!("/deposits/{}/confirm", body["deposit"]["id"].as_str().unwrap());

    let (status, _, body) = send(&app, "POST", &confirm, &alice, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
    let (status, _, _) = send(&app, "POST", &confirm, &[("x-api-key", "guess")], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, _, body) = send(&app, "GET", "/balance", &alice, None).await;
    assert_eq!(body["balance"], 0);
    assert_eq!(body["available"], 0);

    let (_, _, body) = send(&app, "GET", "/balance/deposits", &alice, None).await;
    let deposits = body["deposits"].as_array().unwrap();
    assert_eq!(deposits.len(), 1);
    assert_eq!(deposits[0]["status"], "Pending");
}

#[tokio::test]
async fn test_admin_routes_closed_without_configured_key() {
    let app = app_with_key(None);
    let push = json!({"coin": "BTC", "price": 100});

    let (status, _, body) = send(&app, "POST", "/prices", &[], Some(push.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
    let (status, _, _) = send(&app, "POST", "/prices", &[("x-api-key", "")], Some(push)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    send(&app, "POST", "/accounts", &[], Some(json!({"account_id": "alice"}))).await;
    let (_, _, body) = send(
        &app,
        "POST",
        "/balance/deposit",
        &[("x-account-id", "alice")],
        Some(json!({"amount": 50})),
    )
    .await;
    let confirm = format!("/deposits/{}/confirm", body["deposit"]["id"].as_str().unwrap());
    let (status, _, _) = send(&app, "POST", &confirm, &[("x-api-key", "anything")], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, _, body) = send(&app, "GET", "/balance", &[("x-account-id", "alice")], None).await;
    assert_eq!(body["balance"], 0);

    // Player routes are unaffected
    let (status, _, _) = send(&app, "GET", "/health", &[], None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_referral_rewards_over_http() {
    let app = app();
    fund(&app, "parent", 1).await;

    let (status, _, _) = send(
        &app,
        "POST",
        "/accounts",
        &[],
        Some(json!({"account_id": "child", "referrer": "parent"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = send(
        &app,
        "POST",
        "/accounts",
        &[],
        Some(json!({"account_id": "orphan", "referrer": "nobody"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "UNKNOWN_ENTITY");

    let child = [("x-account-id", "child")];
    let (_, _, body) = send(&app, "POST", "/balance/deposit", &child, Some(json!({"amount": 4000}))).await;
    let confirm = format!("/deposits/{}/confirm", body["deposit"]["id"].as_str().unwrap());
    send(&app, "POST", &confirm, &[("x-api-key", ADMIN_KEY)], None).await;

    let (_, _, body) = send(&app, "GET", "/referrals", &child, None).await;
    assert_eq!(body["referrer"], "parent");

    let parent = [("x-account-id", "parent")];
    let (status, _, body) = send(&app, "GET", "/referrals", &parent, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["referrals"], 1);
    assert_eq!(body["pending"], 100);

    let (status, _, body) = send(&app, "POST", "/referrals/claim", &parent, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["claimed"], 100);
    assert_eq!(body["balance"], 101);

    let (_, _, body) = send(&app, "GET", "/referrals", &parent, None).await;
    assert_eq!(body["pending"], 0);
    assert_eq!(body["earned_total"], 100);

    let (status, _, _) = send(&app, "POST", "/referrals", &child, Some(json!({"referrer": "parent"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_lottery_over_http() {
    let app = app();
    let admin = [("x-api-key", ADMIN_KEY)];
    fund(&app, "alice", 100).await;
    fund(&app, "bob", 100).await;

    let (status, _, _) = send(&app, "GET", "/lottery", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let ends_at = chrono::Utc::now() + chrono::Duration::hours(1);
    let schedule = json!({"ends_at": ends_at});
    let (status, _, _) = send(&app, "POST", "/lottery/open", &[], Some(schedule.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, body) = send(&app, "POST", "/lottery/open", &admin, Some(schedule)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["round"]["status"], "Open");

    let later = json!({"ends_at": ends_at + chrono::Duration::hours(1)});
    let (status, _, _) = send(&app, "POST", "/lottery/end", &admin, Some(later)).await;
    assert_eq!(status, StatusCode::OK);

    send(&app, "POST", "/lottery/entries", &[("x-account-id", "alice")], Some(json!({"amount": 30}))).await;
    let (status, _, body) = send(
        &app,
        "POST",
        "/lottery/entries",
        &[("x-account-id", "bob")],
        Some(json!({"amount": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pot"], 90);

    let (_, _, body) = send(&app, "GET", "/lottery/top?limit=1", &[], None).await;
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["account_id"], "bob");

    let (_, _, body) = send(&app, "GET", "/balance", &[("x-account-id", "alice")], None).await;
    assert_eq!(body["available"], 70);

    let close = json!({"type": "winner", "account_id": "alice"});
    let (status, _, body) = send(&app, "POST", "/lottery/close", &admin, Some(close)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["round"]["status"], "Drawn");
    assert_eq!(body["round"]["winner"], "alice");

    let (_, _, body) = send(&app, "GET", "/balance", &[("x-account-id", "alice")], None).await;
    assert_eq!(body["balance"], 160);
    let (_, _, body) = send(&app, "GET", "/balance", &[("x-account-id", "bob")], None).await;
    assert_eq!(body["balance"], 40);
}
