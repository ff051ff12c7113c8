//! Stubs shared by the unit tests: an in-memory transport with call counters,
//! an axum-backed chat API and message builders.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ChatPartner, ClientKey, CounterpartyInfo, MessageId, MessageKind, ProductId, ProductInfo,
        UserId,
    },
    protocol::{ChatMessage, Envelope, SendMessageRequest, TransportEvent, TransportRequest},
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, watch},
};

use crate::{
    error::TransportError,
    transport::{ChatTransport, LinkState},
};

pub const SELLER: &str = "seller-9";
pub const BUYER: &str = "buyer-1";
pub const PRODUCT: &str = "hdpe-100";

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    rfc3339.parse().expect("timestamp")
}

pub fn message(id: &str, sender: &str, body: &str, created_at: &str) -> ChatMessage {
    let receiver = if sender == SELLER { BUYER } else { SELLER };
    ChatMessage {
        id: MessageId::new(id),
        message: body.to_string(),
        sender_id: UserId::new(sender),
        receiver_id: UserId::new(receiver),
        sender_name: sender.to_string(),
        sender_company: None,
        sender_avatar: None,
        product_id: ProductId::new(PRODUCT),
        kind: MessageKind::Text,
        read: false,
        created_at: at(created_at),
        client_key: None,
    }
}

pub fn optimistic(body: &str, created_at: &str, client_key: Option<&str>) -> ChatMessage {
    let mut message = message("ignored", BUYER, body, created_at);
    message.id = MessageId::temporary();
    message.client_key = client_key.map(ClientKey::new);
    message
}

pub fn partner() -> ChatPartner {
    ChatPartner {
        seller: CounterpartyInfo {
            user_id: UserId::new(SELLER),
            name: "Ravi".to_string(),
            company: Some("Gujarat Polymers".to_string()),
            avatar: None,
        },
        product: ProductInfo {
            product_id: ProductId::new(PRODUCT),
            name: "HDPE Injection Grade".to_string(),
            grade: Some("HD50MA180".to_string()),
            image: None,
        },
    }
}

#[derive(Default)]
pub struct TransportCalls {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub joins: AtomicUsize,
    pub leaves: AtomicUsize,
    pub presence_subscribes: AtomicUsize,
    pub presence_unsubscribes: AtomicUsize,
    pub presence_requests: AtomicUsize,
}

impl TransportCalls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// In-memory transport. `connect` brings the link up only when
/// `accept_connections` is set; tests flip the link directly otherwise.
pub struct MockTransport {
    pub calls: TransportCalls,
    pub emitted: Mutex<Vec<TransportRequest>>,
    pub accept_connections: Mutex<bool>,
    link: watch::Sender<LinkState>,
    events: broadcast::Sender<TransportEvent>,
}

impl MockTransport {
    pub fn new(accept_connections: bool) -> Arc<Self> {
        let (link, _) = watch::channel(LinkState::Down);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            calls: TransportCalls::default(),
            emitted: Mutex::new(Vec::new()),
            accept_connections: Mutex::new(accept_connections),
            link,
            events,
        })
    }

    pub fn set_accept(&self, accept: bool) {
        *self.accept_connections.lock().expect("lock") = accept;
    }

    pub fn set_link(&self, state: LinkState) {
        self.link.send_replace(state);
    }

    pub fn push_event(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn emitted(&self) -> Vec<TransportRequest> {
        self.emitted.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn connect(&self, _user_id: &UserId) -> Result<(), TransportError> {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        if *self.accept_connections.lock().expect("lock") {
            self.link.send_replace(LinkState::Up);
            Ok(())
        } else {
            Err(TransportError::Connect("connection refused".to_string()))
        }
    }

    fn disconnect(&self) {
        self.calls.disconnects.fetch_add(1, Ordering::SeqCst);
        self.link.send_replace(LinkState::Down);
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    fn join_room(&self, _product_id: &ProductId) {
        self.calls.joins.fetch_add(1, Ordering::SeqCst);
    }

    fn leave_room(&self, _product_id: &ProductId) {
        self.calls.leaves.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe_presence(&self, _user_id: &UserId) {
        self.calls.presence_subscribes.fetch_add(1, Ordering::SeqCst);
    }

    fn unsubscribe_presence(&self, _user_id: &UserId) {
        self.calls.presence_unsubscribes.fetch_add(1, Ordering::SeqCst);
    }

    fn request_presence(&self, _user_id: &UserId) {
        self.calls.presence_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn emit(&self, request: TransportRequest) -> Result<(), TransportError> {
        if !self.link.borrow().is_up() {
            return Err(TransportError::NotConnected);
        }
        self.emitted.lock().expect("lock").push(request);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// State behind the stub chat backend.
#[derive(Clone, Default)]
pub struct BackendState {
    pub history: Arc<Mutex<Vec<ChatMessage>>>,
    pub persisted: Arc<Mutex<Vec<SendMessageRequest>>>,
    pub history_calls: Arc<AtomicUsize>,
    pub fail_send_with: Arc<Mutex<Option<StatusCode>>>,
    pub fail_partner_with: Arc<Mutex<Option<StatusCode>>>,
    pub partners: Arc<Mutex<HashMap<String, ChatPartner>>>,
}

async fn partner_handler(
    State(state): State<BackendState>,
    Path(product_id): Path<String>,
) -> (StatusCode, Json<Envelope<ChatPartner>>) {
    if let Some(status) = *state.fail_partner_with.lock().expect("lock") {
        return (status, Json(Envelope::failure("partner lookup failed")));
    }
    match state.partners.lock().expect("lock").get(&product_id).cloned() {
        Some(partner) => (StatusCode::OK, Json(Envelope::ok(partner))),
        None => (
            StatusCode::OK,
            Json(Envelope::failure(format!("product {product_id} not found"))),
        ),
    }
}

async fn history_handler(
    State(state): State<BackendState>,
    Path(_product_id): Path<String>,
) -> Json<Envelope<Vec<ChatMessage>>> {
    state.history_calls.fetch_add(1, Ordering::SeqCst);
    Json(Envelope::ok(state.history.lock().expect("lock").clone()))
}

async fn send_handler(
    State(state): State<BackendState>,
    Json(request): Json<SendMessageRequest>,
) -> (StatusCode, Json<Envelope<ChatMessage>>) {
    if let Some(status) = *state.fail_send_with.lock().expect("lock") {
        return (status, Json(Envelope::failure("send failed")));
    }
    let mut persisted = state.persisted.lock().expect("lock");
    persisted.push(request.clone());
    let saved = ChatMessage {
        id: MessageId::new(format!("srv-{}", persisted.len())),
        message: request.message,
        sender_id: UserId::new(BUYER),
        receiver_id: request.receiver_id,
        sender_name: "Dana".to_string(),
        sender_company: None,
        sender_avatar: None,
        product_id: request.product_id,
        kind: MessageKind::Text,
        read: false,
        created_at: Utc::now(),
        client_key: Some(request.client_key),
    };
    (StatusCode::OK, Json(Envelope::ok(saved)))
}

pub async fn spawn_backend(state: BackendState) -> String {
    state
        .partners
        .lock()
        .expect("lock")
        .insert(PRODUCT.to_string(), partner());

    let app = Router::new()
        .route("/api/chat/products/:product_id/partner", get(partner_handler))
        .route("/api/chat/products/:product_id/messages", get(history_handler))
        .route("/api/chat/messages", post(send_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/api")
}
