use std::sync::{Arc, Mutex, MutexGuard};

use shared::{
    domain::{PresenceState, UserId},
    protocol::TransportEvent,
};
use tokio::sync::watch;
use tracing::debug;

use crate::transport::{ChatTransport, PresenceSubscription};

/// Tracks whether the current counterparty is reachable.
pub struct PresenceTracker {
    transport: Arc<dyn ChatTransport>,
    state: watch::Sender<PresenceState>,
    subscription: Mutex<Option<PresenceSubscription>>,
}

impl PresenceTracker {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        let (state, _) = watch::channel(PresenceState::Unknown);
        Self {
            transport,
            state,
            subscription: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<PresenceSubscription>> {
        self.subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> watch::Receiver<PresenceState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> PresenceState {
        *self.state.borrow()
    }

    pub fn tracked(&self) -> Option<UserId> {
        self.slot()
            .as_ref()
            .map(|sub| sub.user_id().clone())
    }

    /// Starts tracking `user_id`, releasing the previous counterparty first.
    /// Always follows up with a pull since the push stream may be stale.
    pub fn track(&self, user_id: &UserId) {
        {
            let mut guard = self.slot();
            let same = guard
                .as_ref()
                .is_some_and(|sub| sub.user_id() == user_id);
            if !same {
                if let Some(mut previous) = guard.take() {
                    previous.release();
                }
                self.state.send_replace(PresenceState::Unknown);
                *guard = Some(PresenceSubscription::subscribe(
                    Arc::clone(&self.transport),
                    user_id.clone(),
                ));
                debug!(user_id = %user_id, "presence: subscribed");
            }
        }
        self.transport.request_presence(user_id);
    }

    pub fn refresh(&self) {
        if let Some(user_id) = self.tracked() {
            self.transport.request_presence(&user_id);
        }
    }

    /// Applies a transport event. Returns the new state when it flipped.
    pub fn apply(&self, event: &TransportEvent) -> Option<PresenceState> {
        let (user_id, is_online) = match event {
            TransportEvent::UserStatus { user_id, is_online }
            | TransportEvent::UserStatusResponse { user_id, is_online } => (user_id, *is_online),
            _ => return None,
        };
        let tracked = self.tracked()?;
        if &tracked != user_id {
            return None;
        }
        let next = PresenceState::from_online(is_online);
        self.state
            .send_if_modified(|current| std::mem::replace(current, next) != next)
            .then_some(next)
    }

    /// Unsubscribes from the tracked counterparty. Idempotent.
    pub fn release(&self) {
        let released = self.slot().take();
        if let Some(mut subscription) = released {
            subscription.release();
            debug!(user_id = %subscription.user_id(), "presence: unsubscribed");
        }
        self.state.send_replace(PresenceState::Unknown);
    }
}
