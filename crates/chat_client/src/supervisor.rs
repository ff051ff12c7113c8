//! Keeps the realtime transport connected for the lifetime of a chat surface.
//!
//! Status moves `Connecting -> Connected`, drops to `Disconnected` when the
//! link goes away and starts a fresh bounded cycle, and settles on `Offline`
//! once the retry budget is spent. Offline holds until `retry()` or until the
//! shared link comes up on behalf of another surface.
//! Transport failures are logged and reflected in the status, never returned.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

use shared::domain::{ConnectionState, ProductId, UserId};
use tokio::{sync::watch, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    retry::RetryPolicy,
    transport::{ChatTransport, LinkState, RoomMembership},
};

struct Shared {
    transport: Arc<dyn ChatTransport>,
    policy: RetryPolicy,
    status: watch::Sender<ConnectionState>,
    failed_attempts: AtomicU32,
    connections: AtomicU64,
    outages: AtomicU64,
}

impl Shared {
    fn set_status(&self, next: ConnectionState) {
        let changed = self
            .status
            .send_if_modified(|current| std::mem::replace(current, next) != next);
        if changed {
            if matches!(next, ConnectionState::Disconnected | ConnectionState::Offline) {
                self.outages.fetch_add(1, Ordering::SeqCst);
            }
            debug!(status = next.label(), "connection status changed");
        }
    }
}

#[derive(Default)]
struct RunState {
    target: Option<(UserId, ProductId)>,
    membership: Option<RoomMembership>,
    task: Option<JoinHandle<()>>,
}

pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
    run: Mutex<RunState>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn ChatTransport>, policy: RetryPolicy) -> Self {
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                transport,
                policy,
                status,
                failed_attempts: AtomicU32::new(0),
                connections: AtomicU64::new(0),
                outages: AtomicU64::new(0),
            }),
            run: Mutex::new(RunState::default()),
        }
    }

    fn run_state(&self) -> MutexGuard<'_, RunState> {
        self.run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> ConnectionState {
        *self.shared.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }

    pub fn failed_attempts(&self) -> u32 {
        self.shared.failed_attempts.load(Ordering::SeqCst)
    }

    /// How many times the link came up since the last `open`. Bumped before
    /// `Connected` is published, so a change here marks a fresh connection
    /// even when the status watch coalesced the outage away.
    pub fn connection_count(&self) -> u64 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// How many times the status fell to `Disconnected` or `Offline` since
    /// the last `open`.
    pub fn outage_count(&self) -> u64 {
        self.shared.outages.load(Ordering::SeqCst)
    }

    /// Starts supervising the connection for `user_id` and takes membership
    /// of the product room. Calling it again for the same target is a no-op.
    pub fn open(&self, user_id: UserId, product_id: ProductId) {
        let mut run = self.run_state();
        if run.task.is_some() && run.target.as_ref() == Some(&(user_id.clone(), product_id.clone()))
        {
            return;
        }
        Self::stop(&mut run);

        info!(user_id = %user_id, product_id = %product_id, "opening chat connection");
        run.membership = Some(RoomMembership::join(
            Arc::clone(&self.shared.transport),
            product_id.clone(),
        ));
        run.target = Some((user_id.clone(), product_id));
        self.shared.failed_attempts.store(0, Ordering::SeqCst);
        self.shared.connections.store(0, Ordering::SeqCst);
        self.shared.outages.store(0, Ordering::SeqCst);
        self.shared.set_status(ConnectionState::Connecting);
        run.task = Some(tokio::spawn(supervise(Arc::clone(&self.shared), user_id)));
    }

    /// Manual retry: resets the budget and re-invokes connect.
    pub fn retry(&self) {
        let mut run = self.run_state();
        let Some((user_id, product_id)) = run.target.clone() else {
            return;
        };
        if let Some(task) = run.task.take() {
            task.abort();
        }
        info!(user_id = %user_id, product_id = %product_id, "manual connection retry");
        self.shared.failed_attempts.store(0, Ordering::SeqCst);
        self.shared.set_status(ConnectionState::Connecting);
        run.task = Some(tokio::spawn(supervise(Arc::clone(&self.shared), user_id)));
    }

    /// Stops supervision and leaves the room. Safe to call repeatedly; only
    /// the first call after `open` has any effect. Returns whether it did.
    pub fn close(&self) -> bool {
        let mut run = self.run_state();
        let was_open = run.target.is_some();
        Self::stop(&mut run);
        if was_open {
            self.shared.set_status(ConnectionState::Disconnected);
        }
        was_open
    }

    fn stop(run: &mut RunState) {
        if let Some(task) = run.task.take() {
            task.abort();
        }
        if let Some(mut membership) = run.membership.take() {
            membership.release();
        }
        run.target = None;
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        Self::stop(&mut self.run_state());
    }
}

/// Runs bounded connect attempts. Returns whether the link came up.
async fn connect_with_retries(
    shared: &Shared,
    user_id: &UserId,
    link: &mut watch::Receiver<LinkState>,
) -> bool {
    let mut failed = 0u32;
    loop {
        shared.set_status(ConnectionState::Connecting);
        if let Err(err) = shared.transport.connect(user_id).await {
            warn!(user_id = %user_id, attempt = failed + 1, %err, "transport connect failed");
        }

        let wait = shared.policy.delay_for(failed);
        if let Ok(Ok(_)) = timeout(wait, link.wait_for(|state| state.is_up())).await {
            return true;
        }

        failed += 1;
        shared.failed_attempts.store(failed, Ordering::SeqCst);
        if shared.policy.is_exhausted(failed) {
            return false;
        }
    }
}

async fn supervise(shared: Arc<Shared>, user_id: UserId) {
    let mut link = shared.transport.link_state();

    loop {
        if !connect_with_retries(&shared, &user_id, &mut link).await {
            warn!(
                user_id = %user_id,
                attempts = shared.failed_attempts.load(Ordering::SeqCst),
                "retries exhausted; switching to offline mode"
            );
            shared.set_status(ConnectionState::Offline);
            // The transport is shared, so another surface may revive the link.
            if link.wait_for(|state| state.is_up()).await.is_err() {
                return;
            }
            info!(user_id = %user_id, "shared link came back up");
        }

        shared.failed_attempts.store(0, Ordering::SeqCst);
        shared.connections.fetch_add(1, Ordering::SeqCst);
        shared.set_status(ConnectionState::Connected);

        if link.wait_for(|state| *state == LinkState::Down).await.is_err() {
            shared.set_status(ConnectionState::Offline);
            return;
        }
        warn!(user_id = %user_id, "transport link dropped");
        shared.set_status(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
