use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::body::to_bytes;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use haggle_domain::listing::{ListingStatus, ListingSummary};
use haggle_infra::config::AppConfig;
use haggle_infra::listings::InMemoryListingDirectory;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower_util::ServiceExt;

use crate::observability;
use crate::routes;
use crate::state::AppState;

const SECRET: &str = "test-secret";

#[derive(Serialize)]
struct Claims {
    sub: String,
    exp: usize,
}

fn test_config() -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        port: 0,
        log_level: "info".to_string(),
        jwt_secret: SECRET.to_string(),
        auth_dev_bypass_enabled: false,
        listing_backend: "memory".to_string(),
        listing_base_url: "http://127.0.0.1:4000".to_string(),
        listing_timeout_ms: 1_000,
        listing_retry_max_attempts: 1,
        listing_retry_backoff_base_ms: 10,
        listing_retry_backoff_max_ms: 100,
        listing_seed_path: None,
    }
}

fn test_token(sub: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_secs();
    let claims = Claims {
        sub: sub.to_string(),
        exp: (now + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("token")
}

fn test_app_state() -> AppState {
    let listings = InMemoryListingDirectory::with_listings([
        ListingSummary::active("phone-1", "seller"),
        ListingSummary {
            status: ListingStatus::Sold,
            ..ListingSummary::active("phone-sold", "seller")
        },
    ]);
    AppState::with_listing_directory(test_config(), Arc::new(listings))
}

fn test_app() -> axum::Router {
    routes::router(test_app_state())
}

async fn call(
    app: &axum::Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("authorization", format!("Bearer {}", test_token(user)));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request");

    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn open_chat(app: &axum::Router) -> String {
    let (status, body) = call(
        app,
        "POST",
        "/v1/chats",
        Some("buyer"),
        Some(json!({ "listing_id": "phone-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["conversation_id"]
        .as_str()
        .expect("conversation id")
        .to_string()
}

#[tokio::test]
async fn health_is_public() {
    let app = test_app();
    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["environment"], "test");
}

#[tokio::test]
async fn chat_routes_require_token() {
    let app = test_app();
    let (status, body) = call(&app, "GET", "/v1/chats", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let request = Request::builder()
        .method("GET")
        .uri("/v1/chats/unread-count")
        .header("authorization", "Bearer not-a-jwt")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_chat_is_idempotent_per_pair() {
    let app = test_app();
    let id = open_chat(&app).await;

    let (status, body) = call(
        &app,
        "POST",
        "/v1/chats",
        Some("buyer"),
        Some(json!({ "listing_id": "phone-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conversation_id"], id.as_str());
    assert_eq!(body["participants"], json!(["buyer", "seller"]));
    assert_eq!(body["unread_count"], json!({ "buyer": 0, "seller": 0 }));
}

#[tokio::test]
async fn create_chat_rejects_bad_listings() {
    let app = test_app();
    let cases = [
        ("seller", "phone-1", StatusCode::BAD_REQUEST),
        ("buyer", "phone-404", StatusCode::NOT_FOUND),
        ("buyer", "phone-sold", StatusCode::BAD_REQUEST),
        ("buyer", "", StatusCode::BAD_REQUEST),
    ];
    for (user, listing_id, expected) in cases {
        let (status, body) = call(
            &app,
            "POST",
            "/v1/chats",
            Some(user),
            Some(json!({ "listing_id": listing_id })),
        )
        .await;
        assert_eq!(status, expected, "{user} on {listing_id:?}: {body}");
    }
}

#[tokio::test]
async fn messages_drive_unread_counts() {
    let app = test_app();
    let id = open_chat(&app).await;

    let (status, message) = call(
        &app,
        "POST",
        &format!("/v1/chats/{id}/messages"),
        Some("buyer"),
        Some(json!({ "content": "Is this still available?" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["type"], "text");
    assert_eq!(message["sender_id"], "buyer");

    let (_, unread) = call(&app, "GET", "/v1/chats/unread-count", Some("seller"), None).await;
    assert_eq!(unread["unread_count"], 1);

    let (_, chats) = call(&app, "GET", "/v1/chats", Some("seller"), None).await;
    assert_eq!(chats[0]["conversation_id"], id.as_str());
    assert_eq!(chats[0]["unread_count"], 1);
    assert_eq!(
        chats[0]["last_message"]["content"],
        "Is this still available?"
    );

    let (status, conversation) =
        call(&app, "GET", &format!("/v1/chats/{id}"), Some("seller"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conversation["unread_count"]["seller"], 0);

    let (_, unread) = call(&app, "GET", "/v1/chats/unread-count", Some("seller"), None).await;
    assert_eq!(unread["unread_count"], 0);

    let (status, body) = call(
        &app,
        "PUT",
        &format!("/v1/chats/{id}/read"),
        Some("seller"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "conversation_id": id, "unread_count": 0 }));
}

#[tokio::test]
async fn message_validation_errors() {
    let app = test_app();
    let id = open_chat(&app).await;
    let uri = format!("/v1/chats/{id}/messages");

    for payload in [
        json!({ "content": "   " }),
        json!({ "content": "x".repeat(2_001) }),
        json!({ "content": "pic", "type": "image" }),
        json!({ "content": "hmm", "type": "video" }),
    ] {
        let (status, body) = call(&app, "POST", &uri, Some("buyer"), Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(body["error"]["code"], "validation_error");
    }

    let (status, image) = call(
        &app,
        "POST",
        &uri,
        Some("buyer"),
        Some(json!({ "content": "pic", "type": "image", "image_url": "https://cdn/p.jpg" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(image["image_url"], "https://cdn/p.jpg");
}

#[tokio::test]
async fn outsiders_are_forbidden_and_unknown_chats_missing() {
    let app = test_app();
    let id = open_chat(&app).await;

    let (status, body) = call(&app, "GET", &format!("/v1/chats/{id}"), Some("mallory"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let (status, _) = call(
        &app,
        "POST",
        &format!("/v1/chats/{id}/offer"),
        Some("mallory"),
        Some(json!({ "offer_price": 10.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&app, "GET", "/v1/chats/does-not-exist", Some("buyer"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn offer_negotiation_over_http() {
    let app = test_app();
    let id = open_chat(&app).await;

    let (status, offer) = call(
        &app,
        "POST",
        &format!("/v1/chats/{id}/offer"),
        Some("buyer"),
        Some(json!({ "offer_price": 80.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["offer_status"], "pending");
    assert_eq!(offer["content"], "Offer: 80");
    let offer_id = offer["message_id"].as_str().expect("offer id").to_string();

    let (status, _) = call(
        &app,
        "PATCH",
        &format!("/v1/chats/{id}/offer/{offer_id}"),
        Some("buyer"),
        Some(json!({ "status": "accepted" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &app,
        "PATCH",
        &format!("/v1/chats/{id}/offer/{offer_id}"),
        Some("seller"),
        Some(json!({ "status": "countered" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, countered) = call(
        &app,
        "PATCH",
        &format!("/v1/chats/{id}/offer/{offer_id}"),
        Some("seller"),
        Some(json!({ "status": "countered", "counter_offer": 90.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(countered["offer"]["offer_status"], "countered");
    assert_eq!(countered["message"]["content"], "Counter offer: 90");
    assert_eq!(countered["message"]["counter_of"], offer_id.as_str());
    let counter_id = countered["message"]["message_id"]
        .as_str()
        .expect("counter id")
        .to_string();

    let (status, accepted) = call(
        &app,
        "PATCH",
        &format!("/v1/chats/{id}/offer/{counter_id}"),
        Some("buyer"),
        Some(json!({ "status": "accepted" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["message"]["type"], "system");
    assert_eq!(accepted["message"]["content"], "Accepted offer of 90");

    let (status, body) = call(
        &app,
        "PATCH",
        &format!("/v1/chats/{id}/offer/{counter_id}"),
        Some("buyer"),
        Some(json!({ "status": "rejected" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["message"], "offer has already been responded to");
}

#[tokio::test]
async fn blocking_hides_chat_and_stops_messages() {
    let app = test_app();
    let id = open_chat(&app).await;
    call(
        &app,
        "POST",
        &format!("/v1/chats/{id}/messages"),
        Some("buyer"),
        Some(json!({ "content": "hello" })),
    )
    .await;

    let (status, conversation) = call(
        &app,
        "PATCH",
        &format!("/v1/chats/{id}/status"),
        Some("seller"),
        Some(json!({ "status": "blocked" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conversation["status"], "blocked");
    assert_eq!(conversation["blocked_by"], "seller");

    let (status, _) = call(
        &app,
        "POST",
        &format!("/v1/chats/{id}/messages"),
        Some("buyer"),
        Some(json!({ "content": "hello?" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, chats) = call(&app, "GET", "/v1/chats", Some("seller"), None).await;
    assert_eq!(chats, json!([]));
    let (_, unread) = call(&app, "GET", "/v1/chats/unread-count", Some("seller"), None).await;
    assert_eq!(unread["unread_count"], 1);

    let (status, _) = call(
        &app,
        "PATCH",
        &format!("/v1/chats/{id}/status"),
        Some("seller"),
        Some(json!({ "status": "deleted" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &app,
        "PATCH",
        &format!("/v1/chats/{id}/status"),
        Some("buyer"),
        Some(json!({ "status": "active" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "forbidden");

    let (status, conversation) = call(
        &app,
        "PATCH",
        &format!("/v1/chats/{id}/status"),
        Some("seller"),
        Some(json!({ "status": "active" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(conversation["status"], "active");
    assert!(conversation.get("blocked_by").is_none());
}

#[tokio::test]
async fn metrics_endpoint_is_exposed() {
    let _ = observability::init_metrics();
    let app = test_app();

    let (status, _) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("text/plain"))
    );
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = String::from_utf8(body.to_vec()).expect("metrics body");
    assert!(body.contains("haggle_api_http_requests_total"));
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn spawn_server(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind api");
    let addr = listener.local_addr().expect("api addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve api");
    });
    format!("ws://{addr}/v1/chats/ws")
}

async fn connect(base: &str, user: &str) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(format!("{base}?token={}", test_token(user)))
        .await
        .expect("connect");
    socket
}

async fn next_event(socket: &mut Socket) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("frame");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

async fn send_frame(socket: &mut Socket, frame: Value) {
    socket
        .send(WsMessage::Text(frame.to_string()))
        .await
        .expect("send frame");
}

#[tokio::test]
async fn websocket_delivers_presence_room_and_typing_events() {
    let app = test_app();
    let id = open_chat(&app).await;
    let base = spawn_server(app.clone()).await;

    let mut seller = connect(&base, "seller").await;
    let connected = next_event(&mut seller).await;
    assert_eq!(connected["event"], "connected");
    assert_eq!(connected["data"]["user_id"], "seller");

    let (status, _) = call(
        &app,
        "POST",
        &format!("/v1/chats/{id}/messages"),
        Some("buyer"),
        Some(json!({ "content": "hello over the wire" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let event = next_event(&mut seller).await;
    assert_eq!(event["event"], "new-message");
    assert_eq!(event["data"]["conversation_id"], id.as_str());
    assert_eq!(event["data"]["message"]["content"], "hello over the wire");

    send_frame(&mut seller, json!({ "action": "join", "conversation_id": "nope" })).await;
    assert_eq!(next_event(&mut seller).await["event"], "error");

    send_frame(&mut seller, json!({ "action": "join", "conversation_id": id })).await;
    let joined = next_event(&mut seller).await;
    assert_eq!(joined["event"], "joined");

    let mut buyer = connect(&base, "buyer").await;
    assert_eq!(next_event(&mut buyer).await["event"], "connected");
    send_frame(&mut buyer, json!({ "action": "join", "conversation_id": id })).await;
    assert_eq!(next_event(&mut buyer).await["event"], "joined");

    send_frame(
        &mut seller,
        json!({ "action": "typing", "conversation_id": id, "is_typing": true }),
    )
    .await;
    let typing = next_event(&mut buyer).await;
    assert_eq!(typing["event"], "user-typing");
    assert_eq!(typing["data"]["user_id"], "seller");

    let (status, _) = call(
        &app,
        "GET",
        &format!("/v1/chats/{id}"),
        Some("seller"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let read = next_event(&mut buyer).await;
    assert_eq!(read["event"], "messages-read");
    assert_eq!(read["data"]["reader_id"], "seller");

    let read_echo = next_event(&mut seller).await;
    assert_eq!(read_echo["event"], "messages-read");
}
