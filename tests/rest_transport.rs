//! REST transport tests against a mock Axum server.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{delete, get},
    Router,
};
use serde_json::{json, Value};
use vavox::core::config::Credentials;
use vavox::core::kernel::signer::{current_timestamp_millis, HmacSigner};
use vavox::{BitvavoBuilder, BitvavoClient, ExchangeConfig, ExchangeError};

const BAN_EXPIRES_AT: u64 = 99_999_999_999_999;

#[derive(Clone, Default)]
struct TestServerState {
    request_count: Arc<AtomicUsize>,
    reset_at: u64,
    last_headers: Arc<Mutex<Option<HashMap<String, String>>>>,
    last_query: Arc<Mutex<Option<String>>>,
}

fn json_response(status: StatusCode, headers: &[(&str, String)], body: &Value) -> Response {
    let mut builder = Response::builder()
        .status(status)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn capture_headers(state: &TestServerState, headers: &HeaderMap) {
    let captured = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    *state.last_headers.lock().unwrap() = Some(captured);
}

async fn mock_time(State(state): State<TestServerState>) -> Response {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    json_response(
        StatusCode::OK,
        &[
            ("Bitvavo-Ratelimit-Remaining", "42".to_string()),
            ("Bitvavo-Ratelimit-ResetAt", state.reset_at.to_string()),
        ],
        &json!({"time": 1_700_000_000_123_u64}),
    )
}

async fn mock_markets(State(state): State<TestServerState>) -> Response {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    json_response(
        StatusCode::TOO_MANY_REQUESTS,
        &[],
        &json!({
            "errorCode": 105,
            "error": format!(
                "Your IP or API key has been banned for not respecting the rate limit. The ban expires at {}.",
                BAN_EXPIRES_AT
            )
        }),
    )
}

async fn mock_balance(State(state): State<TestServerState>, headers: HeaderMap) -> Response {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    capture_headers(&state, &headers);

    if headers.contains_key("bitvavo-access-signature") {
        json_response(
            StatusCode::OK,
            &[],
            &json!([{"symbol": "EUR", "available": "100", "inOrder": "0"}]),
        )
    } else {
        json_response(
            StatusCode::FORBIDDEN,
            &[],
            &json!({"errorCode": 300, "error": "Authentication is required for this endpoint."}),
        )
    }
}

async fn mock_cancel(
    State(state): State<TestServerState>,
    headers: HeaderMap,
    uri: axum::http::Uri,
) -> Response {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    capture_headers(&state, &headers);
    *state.last_query.lock().unwrap() = uri.query().map(str::to_string);
    json_response(StatusCode::OK, &[], &json!({"orderId": "abc"}))
}

async fn start_server() -> (SocketAddr, TestServerState) {
    let state = TestServerState {
        reset_at: current_timestamp_millis() + 60_000,
        ..TestServerState::default()
    };

    let app = Router::new()
        .route("/v2/time", get(mock_time))
        .route("/v2/markets", get(mock_markets))
        .route("/v2/balance", get(mock_balance))
        .route("/v2/order", delete(mock_cancel))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

    (addr, state)
}

fn client(addr: SocketAddr, credentials: Option<(&str, &str)>) -> BitvavoClient {
    let mut config = match credentials {
        Some((key, secret)) => ExchangeConfig::new(key.to_string(), secret.to_string()),
        None => ExchangeConfig::read_only(),
    };
    config = config.rest_url(format!("http://{}/v2", addr));
    BitvavoBuilder::new().with_config(config).build().unwrap()
}

#[tokio::test]
async fn test_response_headers_update_governor() {
    let (addr, state) = start_server().await;
    let client = client(addr, None);

    let time = client.rest().time().await.unwrap();

    assert_eq!(time.time, 1_700_000_000_123);
    assert_eq!(client.remaining_budget(), 42);
    assert_eq!(client.governor().reset_at(), state.reset_at);
    assert!(client.governor().is_timer_active());
    assert_eq!(client.governor().timers_started(), 1);
}

#[tokio::test]
async fn test_rate_limit_error_blocks_further_calls() {
    let (addr, state) = start_server().await;
    let client = client(addr, None);

    let result = client.rest().markets(None).await;
    match result {
        Err(ExchangeError::ApiError { code, .. }) => assert_eq!(code, 105),
        other => panic!("Expected rate-limit ApiError, got {:?}", other),
    }
    assert_eq!(client.remaining_budget(), 0);
    assert_eq!(client.governor().reset_at(), BAN_EXPIRES_AT);

    let result = client.rest().time().await;
    assert!(matches!(
        result,
        Err(ExchangeError::RateLimitExceeded { reset_at: BAN_EXPIRES_AT })
    ));
    assert_eq!(state.request_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_private_call_without_credentials_makes_no_request() {
    let (addr, state) = start_server().await;
    let client = client(addr, None);

    let result = client.rest().balance(None).await;

    assert!(matches!(result, Err(ExchangeError::MissingCredentials(_))));
    assert_eq!(state.request_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_private_call_is_signed() {
    let (addr, state) = start_server().await;
    let client = client(addr, Some(("test-key", "test-secret")));

    let balance = client.rest().balance(None).await.unwrap();
    assert_eq!(balance[0]["symbol"], "EUR");

    let headers = state.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers["bitvavo-access-key"], "test-key");
    assert_eq!(headers["bitvavo-access-window"], "10000");

    let timestamp: u64 = headers["bitvavo-access-timestamp"].parse().unwrap();
    let expected = HmacSigner::new(Credentials::new(
        "test-key".to_string(),
        "test-secret".to_string(),
        10_000,
    ))
    .signature(timestamp, "GET", "/balance", "")
    .unwrap();
    assert_eq!(headers["bitvavo-access-signature"], expected);
}

#[tokio::test]
async fn test_signed_query_matches_sent_query() {
    let (addr, state) = start_server().await;
    let client = client(addr, Some(("test-key", "test-secret")));

    client.rest().cancel_order("BTC-EUR", "abc").await.unwrap();

    let query = state.last_query.lock().unwrap().clone().unwrap();
    assert_eq!(query, "market=BTC-EUR&orderId=abc");

    let headers = state.last_headers.lock().unwrap().clone().unwrap();
    let timestamp: u64 = headers["bitvavo-access-timestamp"].parse().unwrap();
    let expected = HmacSigner::new(Credentials::new(
        "test-key".to_string(),
        "test-secret".to_string(),
        10_000,
    ))
    .signature(timestamp, "DELETE", &format!("/order?{}", query), "")
    .unwrap();
    assert_eq!(headers["bitvavo-access-signature"], expected);
}

#[tokio::test]
async fn test_reserved_characters_are_signed_as_sent() {
    let (addr, state) = start_server().await;
    let client = client(addr, Some(("test-key", "test-secret")));

    client.rest().cancel_order("BTC-EUR", "a b&c=d/é").await.unwrap();

    let query = state.last_query.lock().unwrap().clone().unwrap();
    assert_eq!(query, "market=BTC-EUR&orderId=a+b%26c%3Dd%2F%C3%A9");

    let headers = state.last_headers.lock().unwrap().clone().unwrap();
    let timestamp: u64 = headers["bitvavo-access-timestamp"].parse().unwrap();
    let expected = HmacSigner::new(Credentials::new(
        "test-key".to_string(),
        "test-secret".to_string(),
        10_000,
    ))
    .signature(timestamp, "DELETE", &format!("/order?{}", query), "")
    .unwrap();
    assert_eq!(headers["bitvavo-access-signature"], expected);
}
