//! Realtime transport abstraction.
//!
//! One connection is shared by every open chat surface of the signed-in user.
//! Room membership and presence subscriptions are reference counted by the
//! transport; the handles below release exactly one registration each.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ProductId, UserId},
    protocol::{TransportEvent, TransportRequest},
};
use tokio::sync::{broadcast, watch};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Up,
}

impl LinkState {
    pub fn is_up(self) -> bool {
        self == Self::Up
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Opens the connection for `user_id`, or reuses it when already up for
    /// the same user. Returns once the attempt finished; the outcome is also
    /// published through [`ChatTransport::link_state`].
    async fn connect(&self, user_id: &UserId) -> Result<(), TransportError>;
    fn disconnect(&self);
    fn link_state(&self) -> watch::Receiver<LinkState>;
    fn join_room(&self, product_id: &ProductId);
    fn leave_room(&self, product_id: &ProductId);
    fn subscribe_presence(&self, user_id: &UserId);
    fn unsubscribe_presence(&self, user_id: &UserId);
    fn request_presence(&self, user_id: &UserId);
    fn emit(&self, request: TransportRequest) -> Result<(), TransportError>;
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Transport used when no realtime endpoint is configured. The link never
/// comes up, so every surface ends in offline mode.
pub struct MissingTransport {
    link: watch::Sender<LinkState>,
    events: broadcast::Sender<TransportEvent>,
}

impl MissingTransport {
    pub fn new() -> Self {
        let (link, _) = watch::channel(LinkState::Down);
        let (events, _) = broadcast::channel(16);
        Self { link, events }
    }
}

impl Default for MissingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for MissingTransport {
    async fn connect(&self, _user_id: &UserId) -> Result<(), TransportError> {
        Err(TransportError::Connect(
            "realtime transport is unavailable".to_string(),
        ))
    }

    fn disconnect(&self) {}

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    fn join_room(&self, _product_id: &ProductId) {}

    fn leave_room(&self, _product_id: &ProductId) {}

    fn subscribe_presence(&self, _user_id: &UserId) {}

    fn unsubscribe_presence(&self, _user_id: &UserId) {}

    fn request_presence(&self, _user_id: &UserId) {}

    fn emit(&self, _request: TransportRequest) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Membership of one product room. Leaves the room once, on `release` or drop.
pub struct RoomMembership {
    transport: Arc<dyn ChatTransport>,
    product_id: ProductId,
    joined: bool,
}

impl RoomMembership {
    pub fn join(transport: Arc<dyn ChatTransport>, product_id: ProductId) -> Self {
        transport.join_room(&product_id);
        Self {
            transport,
            product_id,
            joined: true,
        }
    }

    pub fn product_id(&self) -> &ProductId {
        &self.product_id
    }

    pub fn release(&mut self) {
        if std::mem::take(&mut self.joined) {
            self.transport.leave_room(&self.product_id);
        }
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        self.release();
    }
}

/// Presence subscription for one counterparty. Unsubscribes once.
pub struct PresenceSubscription {
    transport: Arc<dyn ChatTransport>,
    user_id: UserId,
    active: bool,
}

impl PresenceSubscription {
    pub fn subscribe(transport: Arc<dyn ChatTransport>, user_id: UserId) -> Self {
        transport.subscribe_presence(&user_id);
        Self {
            transport,
            user_id,
            active: true,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            self.transport.unsubscribe_presence(&self.user_id);
        }
    }
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        self.release();
    }
}
