use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(1);

/// A debounced "is typing" flag. Every `mark_active` re-arms the timer; the
/// flag drops back to `false` once the timeout passes without new activity.
pub struct TypingIndicator {
    state: Arc<watch::Sender<bool>>,
    generation: Arc<AtomicU64>,
    timeout: Duration,
    reset_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TypingIndicator {
    pub fn new(timeout: Duration) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            timeout,
            reset_task: std::sync::Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        *self.state.borrow()
    }

    /// Returns true when this call flipped the flag from idle to active.
    pub fn mark_active(&self) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let flipped = self.state.send_if_modified(|typing| !std::mem::replace(typing, true));

        let state = Arc::clone(&self.state);
        let current = Arc::clone(&self.generation);
        let timeout = self.timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if current.load(Ordering::SeqCst) == generation {
                state.send_if_modified(|typing| std::mem::replace(typing, false));
            }
        });

        let mut slot = self
            .reset_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        flipped
    }

    /// Drops the flag immediately. Returns true when it was active.
    pub fn clear(&self) -> bool {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self
            .reset_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
        self.state
            .send_if_modified(|typing| std::mem::replace(typing, false))
    }
}

impl Default for TypingIndicator {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TIMEOUT)
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        if let Some(task) = self
            .reset_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
