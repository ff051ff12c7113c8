//! One open chat surface: a buyer talking to the seller of one product.
//!
//! The surface moves `Idle -> Loading -> Ready` while the connection
//! supervisor drives an independent connection sub-state. `close` (or drop)
//! releases the room and the presence subscription exactly once and returns
//! the surface to `Idle`; responses that land after that are discarded.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{
        ChatPartner, ClientKey, ConnectionState, LocalUser, MessageId, MessageKind,
        PresenceState, ProductId, UserId,
    },
    protocol::{ChatMessage, SendMessageRequest, TransportEvent, TransportRequest},
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    config::ChatSettings,
    error::{ChatFailure, FailureContext},
    presence::PresenceTracker,
    retry::RetryPolicy,
    supervisor::ConnectionSupervisor,
    timeline::{Merge, MessageTimeline},
    transport::ChatTransport,
    typing::{TypingIndicator, DEFAULT_TYPING_TIMEOUT},
};

const OFFLINE_ADVISORY: &str =
    "You are offline. Your message was saved and will sync once the connection is restored.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Idle,
    Loading,
    Ready,
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    SurfaceChanged(SurfaceState),
    TimelineUpdated { len: usize },
    ConnectionChanged(ConnectionState),
    PresenceChanged(PresenceState),
    CounterpartyTyping(bool),
    Advisory(String),
    Error(ChatFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmptyMessage,
    NotAuthenticated,
    UnknownCounterparty,
    SendInFlight,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing was sent and nothing changed.
    Skipped(SkipReason),
    /// Persisted and handed to the transport; the echo will land in the timeline.
    Live(ChatMessage),
    /// Persisted while offline; carries the optimistic placeholder.
    Queued(ChatMessage),
    /// Persisted after the surface closed; the view was left untouched.
    Persisted(ChatMessage),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub history_limit: u32,
    pub retry: RetryPolicy,
    pub typing_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            history_limit: 100,
            retry: RetryPolicy::default(),
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
        }
    }
}

impl From<&ChatSettings> for SessionOptions {
    fn from(settings: &ChatSettings) -> Self {
        Self {
            history_limit: settings.history_limit,
            retry: settings.retry,
            typing_timeout: settings.typing_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub surface: SurfaceState,
    pub connection: ConnectionState,
    pub presence: PresenceState,
    pub counterparty_typing: bool,
    pub partner: Option<ChatPartner>,
    pub timeline: MessageTimeline,
    pub draft: String,
    pub banner: Option<String>,
    pub advisory: Option<String>,
}

struct SessionState {
    surface: SurfaceState,
    partner: Option<ChatPartner>,
    timeline: MessageTimeline,
    draft: String,
    banner: Option<ChatFailure>,
    advisory: Option<String>,
    seen_connections: u64,
    seen_outages: u64,
}

pub struct ChatSession {
    product_id: ProductId,
    local_user: Option<LocalUser>,
    history_limit: u32,
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn ChatTransport>,
    supervisor: ConnectionSupervisor,
    presence: PresenceTracker,
    remote_typing: TypingIndicator,
    local_typing: TypingIndicator,
    send_permit: Arc<tokio::sync::Mutex<()>>,
    active: AtomicBool,
    epoch: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
    resync: Mutex<Option<JoinHandle<()>>>,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatSession {
    pub fn new(
        product_id: ProductId,
        local_user: Option<LocalUser>,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn ChatTransport>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            product_id,
            local_user,
            history_limit: options.history_limit,
            supervisor: ConnectionSupervisor::new(Arc::clone(&transport), options.retry),
            presence: PresenceTracker::new(Arc::clone(&transport)),
            remote_typing: TypingIndicator::new(options.typing_timeout),
            local_typing: TypingIndicator::new(options.typing_timeout),
            api,
            transport,
            send_permit: Arc::new(tokio::sync::Mutex::new(())),
            active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            pump: Mutex::new(None),
            resync: Mutex::new(None),
            inner: Mutex::new(SessionState {
                surface: SurfaceState::Idle,
                partner: None,
                timeline: MessageTimeline::new(),
                draft: String::new(),
                banner: None,
                advisory: None,
                seen_connections: 0,
                seen_outages: 0,
            }),
            events,
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn set_surface(&self, surface: SurfaceState) {
        let changed = {
            let mut guard = self.state();
            std::mem::replace(&mut guard.surface, surface) != surface
        };
        if changed {
            self.emit(ChatEvent::SurfaceChanged(surface));
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.status()
    }

    pub fn surface_state(&self) -> SurfaceState {
        self.state().surface
    }

    pub fn counterparty(&self) -> Option<UserId> {
        self.state()
            .partner
            .as_ref()
            .map(|partner| partner.seller.user_id.clone())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let guard = self.state();
        SessionSnapshot {
            surface: guard.surface,
            connection: self.supervisor.status(),
            presence: self.presence.current(),
            counterparty_typing: self.remote_typing.is_active(),
            partner: guard.partner.clone(),
            timeline: guard.timeline.clone(),
            draft: guard.draft.clone(),
            banner: guard.banner.as_ref().map(ChatFailure::banner),
            advisory: guard.advisory.clone(),
        }
    }

    /// Loads partner info and history, then brings up the realtime side.
    pub async fn open(self: &Arc<Self>) -> Result<(), ChatFailure> {
        if self.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.set_surface(SurfaceState::Loading);
        info!(product_id = %self.product_id, "opening chat surface");

        let (partner, history) = tokio::join!(
            self.api.fetch_partner(&self.product_id),
            self.api.fetch_history(&self.product_id, self.history_limit)
        );

        if !self.is_current(epoch) {
            debug!(product_id = %self.product_id, "discarding load result for closed surface");
            return Ok(());
        }

        let (partner, history) = match (partner, history) {
            (Ok(partner), Ok(history)) => (partner, history),
            (Err(err), _) | (_, Err(err)) => {
                let failure = ChatFailure::from_api(FailureContext::LoadConversation, &err);
                warn!(product_id = %self.product_id, %err, "failed to load conversation");
                self.state().banner = Some(failure.clone());
                self.set_surface(SurfaceState::Idle);
                self.emit(ChatEvent::Error(failure.clone()));
                return Err(failure);
            }
        };

        let counterparty = partner.seller.user_id.clone();
        let len = {
            let mut guard = self.state();
            guard.timeline.replace_history(history);
            guard.partner = Some(partner);
            guard.banner = None;
            guard.seen_connections = 0;
            guard.seen_outages = 0;
            guard.timeline.len()
        };
        self.emit(ChatEvent::TimelineUpdated { len });
        self.set_surface(SurfaceState::Ready);

        self.active.store(true, Ordering::SeqCst);
        self.spawn_pump();
        match &self.local_user {
            Some(user) => self
                .supervisor
                .open(user.user_id.clone(), self.product_id.clone()),
            None => warn!(product_id = %self.product_id, "no signed-in user; realtime disabled"),
        }
        self.presence.track(&counterparty);
        Ok(())
    }

    fn spawn_pump(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut events = self.transport.subscribe_events();
        let mut status = self.supervisor.subscribe();
        let mut remote_typing = self.remote_typing.subscribe();
        let mut local_typing = self.local_typing.subscribe();
        let mut presence = self.presence.subscribe();

        let task = tokio::spawn(async move {
            let initial = *status.borrow_and_update();
            if let Some(session) = weak.upgrade() {
                session.emit(ChatEvent::ConnectionChanged(initial));
            }
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => {
                            let Some(session) = weak.upgrade() else { break };
                            session.handle_transport_event(event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "chat event pump lagged behind transport");
                            let Some(session) = weak.upgrade() else { break };
                            session.spawn_resync();
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = *status.borrow_and_update();
                        let Some(session) = weak.upgrade() else { break };
                        session.handle_connection_change(next);
                    },
                    changed = presence.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = *presence.borrow_and_update();
                        let Some(session) = weak.upgrade() else { break };
                        session.emit(ChatEvent::PresenceChanged(next));
                    },
                    changed = remote_typing.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let typing = *remote_typing.borrow_and_update();
                        let Some(session) = weak.upgrade() else { break };
                        session.emit(ChatEvent::CounterpartyTyping(typing));
                    },
                    changed = local_typing.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let typing = *local_typing.borrow_and_update();
                        let Some(session) = weak.upgrade() else { break };
                        session.emit_typing(typing);
                    },
                }
            }
        });

        let mut slot = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn involves_local_user(&self, message: &ChatMessage) -> bool {
        match &self.local_user {
            Some(user) => message.sender_id == user.user_id || message.receiver_id == user.user_id,
            None => true,
        }
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        match event {
            TransportEvent::NewMessage { message } => {
                if message.product_id != self.product_id || !self.involves_local_user(&message) {
                    return;
                }
                let from_counterparty = self.counterparty().as_ref() == Some(&message.sender_id);
                let (merge, len) = {
                    let mut guard = self.state();
                    let merge = guard.timeline.ingest_live(message);
                    (merge, guard.timeline.len())
                };
                if from_counterparty {
                    self.remote_typing.clear();
                }
                if merge != Merge::Duplicate {
                    self.emit(ChatEvent::TimelineUpdated { len });
                }
            }
            TransportEvent::MessageSent {
                message_id,
                client_key,
            } => {
                debug!(message_id = %message_id, client_key = ?client_key, "message delivery acknowledged");
            }
            TransportEvent::Typing {
                user_id,
                product_id,
                is_typing,
            } => {
                if product_id != self.product_id || self.counterparty() != Some(user_id) {
                    return;
                }
                if is_typing {
                    self.remote_typing.mark_active();
                } else {
                    self.remote_typing.clear();
                }
            }
            event @ (TransportEvent::UserStatus { .. } | TransportEvent::UserStatusResponse { .. }) => {
                self.presence.apply(&event);
            }
            TransportEvent::Error(err) => {
                warn!(code = ?err.code, message = %err.message, "transport reported an error");
            }
        }
    }

    fn handle_connection_change(self: &Arc<Self>, next: ConnectionState) {
        self.emit(ChatEvent::ConnectionChanged(next));
        if next != ConnectionState::Connected {
            return;
        }
        // The status watch can coalesce a whole drop-and-reconnect into one
        // Connected, so outages are read from the supervisor's counters.
        let connections = self.supervisor.connection_count();
        let outages = self.supervisor.outage_count();
        let needs_sync = {
            let mut guard = self.state();
            if connections == guard.seen_connections {
                return;
            }
            let missed_outage = outages != guard.seen_outages;
            guard.seen_connections = connections;
            guard.seen_outages = outages;
            guard.advisory = None;
            missed_outage || guard.timeline.pending_count() > 0
        };
        self.presence.refresh();
        if needs_sync {
            self.spawn_resync();
        }
    }

    /// Re-fetches history off the pump so messages missed while away appear
    /// and optimistic placeholders get their server ids. A newer resync
    /// replaces one still in flight.
    fn spawn_resync(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let api = Arc::clone(&self.api);
        let product_id = self.product_id.clone();
        let limit = self.history_limit;
        let epoch = self.epoch.load(Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let result = api.fetch_history(&product_id, limit).await;
            let Some(session) = weak.upgrade() else { return };
            match result {
                Ok(history) if session.is_current(epoch) => {
                    let len = {
                        let mut guard = session.state();
                        guard.timeline.replace_history(history);
                        guard.timeline.len()
                    };
                    info!(product_id = %product_id, len, "history resynced");
                    session.emit(ChatEvent::TimelineUpdated { len });
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(product_id = %product_id, %err, "history resync failed");
                }
            }
        });

        let mut slot = self
            .resync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn emit_typing(&self, is_typing: bool) {
        let Some(receiver_id) = self.counterparty() else {
            return;
        };
        if !self.supervisor.status().is_connected() {
            return;
        }
        let request = TransportRequest::Typing {
            receiver_id,
            product_id: self.product_id.clone(),
            is_typing,
        };
        if let Err(err) = self.transport.emit(request) {
            debug!(%err, "typing indicator not delivered");
        }
    }

    /// Sends `text` to the counterparty. Persists over HTTP first, then
    /// delivers live when connected or inserts an optimistic placeholder.
    pub async fn send(&self, text: &str) -> Result<SendOutcome, ChatFailure> {
        let body = text.trim();
        if body.is_empty() {
            return Ok(SendOutcome::Skipped(SkipReason::EmptyMessage));
        }
        if !self.active.load(Ordering::SeqCst) {
            return Ok(SendOutcome::Skipped(SkipReason::Closed));
        }
        let Some(user) = self.local_user.clone() else {
            return Ok(SendOutcome::Skipped(SkipReason::NotAuthenticated));
        };
        let Some(receiver_id) = self.counterparty() else {
            return Ok(SendOutcome::Skipped(SkipReason::UnknownCounterparty));
        };
        let Ok(_permit) = Arc::clone(&self.send_permit).try_lock_owned() else {
            return Ok(SendOutcome::Skipped(SkipReason::SendInFlight));
        };

        let epoch = self.epoch.load(Ordering::SeqCst);
        let request = SendMessageRequest {
            receiver_id: receiver_id.clone(),
            product_id: self.product_id.clone(),
            message: body.to_string(),
            client_key: ClientKey::generate(),
        };

        let saved = match self.api.persist_message(&request).await {
            Ok(saved) => saved,
            Err(err) => {
                let failure = ChatFailure::from_api(FailureContext::SendMessage, &err);
                warn!(product_id = %self.product_id, %err, "failed to persist message");
                if self.is_current(epoch) {
                    self.state().banner = Some(failure.clone());
                    self.emit(ChatEvent::Error(failure.clone()));
                }
                return Err(failure);
            }
        };

        if !self.is_current(epoch) {
            return Ok(SendOutcome::Persisted(saved));
        }
        if self.local_typing.clear() {
            self.emit_typing(false);
        }

        if self.supervisor.status().is_connected() {
            let live = TransportRequest::SendMessage {
                receiver_id: receiver_id.clone(),
                product_id: self.product_id.clone(),
                message: request.message.clone(),
                client_key: request.client_key.clone(),
            };
            match self.transport.emit(live) {
                Ok(()) => return Ok(SendOutcome::Live(saved)),
                Err(err) => {
                    warn!(%err, "live delivery failed; keeping message locally until reconnect");
                }
            }
        }

        let placeholder = ChatMessage {
            id: MessageId::temporary(),
            message: request.message,
            sender_id: user.user_id,
            receiver_id,
            sender_name: user.name,
            sender_company: user.company,
            sender_avatar: user.avatar,
            product_id: self.product_id.clone(),
            kind: MessageKind::Text,
            read: false,
            created_at: Utc::now(),
            client_key: Some(request.client_key),
        };
        let len = {
            let mut guard = self.state();
            guard.timeline.push_optimistic(placeholder.clone());
            guard.advisory = Some(OFFLINE_ADVISORY.to_string());
            guard.timeline.len()
        };
        self.emit(ChatEvent::TimelineUpdated { len });
        self.emit(ChatEvent::Advisory(OFFLINE_ADVISORY.to_string()));
        Ok(SendOutcome::Queued(placeholder))
    }

    pub fn draft(&self) -> String {
        self.state().draft.clone()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        self.state().draft = text.into();
    }

    /// Sends the composer contents. The draft is cleared up front and put
    /// back verbatim when nothing was sent.
    pub async fn send_draft(&self) -> Result<SendOutcome, ChatFailure> {
        let original = std::mem::take(&mut self.state().draft);
        let result = self.send(&original).await;
        let sent = matches!(
            result,
            Ok(SendOutcome::Live(_) | SendOutcome::Queued(_) | SendOutcome::Persisted(_))
        );
        if !sent {
            let mut guard = self.state();
            guard.draft = if guard.draft.is_empty() {
                original
            } else {
                format!("{original}\n{}", guard.draft)
            };
        }
        result
    }

    /// Composer keystroke: announces typing to the counterparty, debounced.
    pub fn notify_typing(&self) {
        if self.active.load(Ordering::SeqCst) {
            self.local_typing.mark_active();
        }
    }

    pub fn retry_connection(&self) {
        if self.active.load(Ordering::SeqCst) {
            self.supervisor.retry();
        }
    }

    pub fn dismiss_error(&self) {
        self.state().banner = None;
    }

    pub fn dismiss_advisory(&self) {
        self.state().advisory = None;
    }

    /// Tears the surface down. Only the first call after a successful open
    /// does anything; later calls return false.
    pub fn close(&self) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if !self.active.swap(false, Ordering::SeqCst) {
            self.set_surface(SurfaceState::Idle);
            return false;
        }

        if let Some(task) = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        if let Some(task) = self
            .resync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        if self.local_typing.clear() {
            self.emit_typing(false);
        }
        self.remote_typing.clear();
        self.presence.release();
        self.supervisor.close();

        {
            let mut guard = self.state();
            guard.partner = None;
            guard.timeline.clear();
            guard.advisory = None;
            guard.seen_connections = 0;
            guard.seen_outages = 0;
        }
        self.set_surface(SurfaceState::Idle);
        info!(product_id = %self.product_id, "chat surface closed");
        true
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
