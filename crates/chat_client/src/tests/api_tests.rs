use super::*;

use std::sync::{Arc, Mutex};

use axum::{
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use shared::domain::{ClientKey, UserId};
use tokio::net::TcpListener;

use crate::{
    error::{ChatFailure, FailureContext, FailureKind},
    test_support::{message, spawn_backend, BackendState, BUYER, PRODUCT, SELLER},
};

fn send_request(body: &str) -> SendMessageRequest {
    SendMessageRequest {
        receiver_id: UserId::new(SELLER),
        product_id: ProductId::new(PRODUCT),
        message: body.to_string(),
        client_key: ClientKey::new("key-1"),
    }
}

#[tokio::test]
async fn fetches_partner_and_history_from_envelopes() {
    let backend = BackendState::default();
    backend.history.lock().expect("lock").extend([
        message("a", SELLER, "Offer: 92/kg ex-works", "2024-01-01T09:00:00Z"),
        message("b", BUYER, "Can you do 90?", "2024-01-01T09:02:00Z"),
    ]);
    let api = HttpChatApi::new(spawn_backend(backend.clone()).await);

    let partner = api
        .fetch_partner(&ProductId::new(PRODUCT))
        .await
        .expect("partner");
    assert_eq!(partner.seller.user_id, UserId::new(SELLER));
    assert_eq!(partner.product.grade.as_deref(), Some("HD50MA180"));

    let history = api
        .fetch_history(&ProductId::new(PRODUCT), 50)
        .await
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].message, "Can you do 90?");
}

#[tokio::test]
async fn unsuccessful_envelope_becomes_rejection() {
    let api = HttpChatApi::new(spawn_backend(BackendState::default()).await);

    let err = api
        .fetch_partner(&ProductId::new("unknown"))
        .await
        .expect_err("unknown product");

    match err {
        ApiError::Rejected(message) => assert_eq!(message, "product unknown not found"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn persist_returns_saved_message_with_client_key() {
    let backend = BackendState::default();
    let api = HttpChatApi::new(spawn_backend(backend.clone()).await);

    let saved = api
        .persist_message(&send_request("Need COA for lot 42"))
        .await
        .expect("persist");

    assert_eq!(saved.id.as_str(), "srv-1");
    assert_eq!(saved.client_key, Some(ClientKey::new("key-1")));
    assert_eq!(backend.persisted.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn gateway_errors_classify_as_service_unavailable() {
    let backend = BackendState::default();
    *backend.fail_send_with.lock().expect("lock") = Some(StatusCode::SERVICE_UNAVAILABLE);
    let api = HttpChatApi::new(spawn_backend(backend.clone()).await);

    let err = api
        .persist_message(&send_request("hello"))
        .await
        .expect_err("503");

    assert!(matches!(err, ApiError::Unavailable { status: 503 }));
    let failure = ChatFailure::from_api(FailureContext::SendMessage, &err);
    assert_eq!(failure.kind(), FailureKind::ServiceUnavailable);
    assert!(failure.banner().contains("temporarily unavailable"));
}

#[tokio::test]
async fn client_errors_keep_the_server_message() {
    let backend = BackendState::default();
    *backend.fail_partner_with.lock().expect("lock") = Some(StatusCode::FORBIDDEN);
    let api = HttpChatApi::new(spawn_backend(backend).await);

    let err = api
        .fetch_partner(&ProductId::new(PRODUCT))
        .await
        .expect_err("403");

    assert!(matches!(err, ApiError::Rejected(ref message) if message == "partner lookup failed"));
    let failure = ChatFailure::from_api(FailureContext::LoadConversation, &err);
    assert_eq!(failure.kind(), FailureKind::Generic);
}

#[tokio::test]
async fn unreachable_backend_is_a_network_error() {
    let api = HttpChatApi::new("http://127.0.0.1:1/api");

    let err = api
        .fetch_history(&ProductId::new(PRODUCT), 10)
        .await
        .expect_err("nothing listening");

    assert!(matches!(err, ApiError::Network(_)));
}

#[tokio::test]
async fn bearer_token_and_history_limit_are_sent() {
    let seen: Arc<Mutex<Vec<(Option<String>, Option<String>)>>> = Arc::default();
    let recorder = Arc::clone(&seen);
    let app = Router::new().route(
        "/api/chat/products/:product_id/messages",
        get(
            move |headers: HeaderMap, uri: axum::http::Uri| {
                let recorder = Arc::clone(&recorder);
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    recorder
                        .lock()
                        .expect("lock")
                        .push((auth, uri.query().map(str::to_string)));
                    Json(Envelope::ok(Vec::<ChatMessage>::new()))
                }
            },
        ),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let api = HttpChatApi::new(format!("http://{addr}/api/"))
        .with_bearer_token(Some("secret-token".to_string()));
    api.fetch_history(&ProductId::new(PRODUCT), 10_000)
        .await
        .expect("history");

    let blank = HttpChatApi::new(format!("http://{addr}/api")).with_bearer_token(Some("  ".to_string()));
    blank
        .fetch_history(&ProductId::new(PRODUCT), 0)
        .await
        .expect("history");

    let seen = seen.lock().expect("lock").clone();
    assert_eq!(
        seen,
        vec![
            (Some("Bearer secret-token".to_string()), Some("limit=500".to_string())),
            (None, Some("limit=1".to_string())),
        ]
    );
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/api")
}

#[tokio::test]
async fn success_without_data_is_rejected() {
    let app = Router::new().route(
        "/api/chat/products/:product_id/partner",
        get(|| async { Json(serde_json::json!({"success": true})) }),
    );
    let api = HttpChatApi::new(serve(app).await);

    let err = api
        .fetch_partner(&ProductId::new(PRODUCT))
        .await
        .expect_err("no data");

    assert!(matches!(err, ApiError::Rejected(ref message) if message == "response carried no data"));
}

#[tokio::test]
async fn slow_backend_times_out_as_network_error() {
    let app = Router::new().route(
        "/api/chat/products/:product_id/messages",
        get(|| async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Json(Envelope::ok(Vec::<ChatMessage>::new()))
        }),
    );
    let api = HttpChatApi::with_timeout(serve(app).await, std::time::Duration::from_millis(100));

    let err = api
        .fetch_history(&ProductId::new(PRODUCT), 10)
        .await
        .expect_err("timed out");

    assert!(matches!(err, ApiError::Network(_)));
}
