//! Merged message list for one chat surface.
//!
//! Three sources feed the list: the history fetch, live transport pushes and
//! optimistic local inserts. Ids are unique across the list. An optimistic
//! entry is replaced in place once its authoritative copy shows up, matched by
//! client key or, for echoes without one, by sender, product and body within
//! [`RECONCILE_WINDOW_SECS`].

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use shared::{domain::MessageId, protocol::ChatMessage};

pub const RECONCILE_WINDOW_SECS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Appended,
    Reconciled,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineRow<'a> {
    DaySeparator(NaiveDate),
    Message(&'a ChatMessage),
}

#[derive(Debug, Default, Clone)]
pub struct MessageTimeline {
    messages: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_optimistic()).count()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    /// Replaces the list with a fresh history page. Optimistic entries with
    /// no authoritative copy in `history` are kept after it.
    pub fn replace_history(&mut self, mut history: Vec<ChatMessage>) {
        history.sort_by_key(|m| m.created_at);
        let pending: Vec<ChatMessage> = self
            .messages
            .drain(..)
            .filter(|m| m.is_optimistic())
            .filter(|optimistic| !history.iter().any(|m| confirms(m, optimistic)))
            .collect();

        self.ids.clear();
        for message in history.into_iter().chain(pending) {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }
    }

    pub fn ingest_live(&mut self, message: ChatMessage) -> Merge {
        if self.ids.contains(&message.id) {
            return Merge::Duplicate;
        }

        if !message.is_optimistic() {
            if let Some(index) = self
                .messages
                .iter()
                .position(|existing| existing.is_optimistic() && confirms(&message, existing))
            {
                let replaced = std::mem::replace(&mut self.messages[index], message);
                self.ids.remove(&replaced.id);
                self.ids.insert(self.messages[index].id.clone());
                return Merge::Reconciled;
            }
        }

        self.ids.insert(message.id.clone());
        self.messages.push(message);
        Merge::Appended
    }

    pub fn push_optimistic(&mut self, message: ChatMessage) -> Merge {
        debug_assert!(message.is_optimistic());
        self.ingest_live(message)
    }

    /// Rows for rendering, with a separator wherever the calendar day in `tz`
    /// differs from the previous message's day.
    pub fn rows<Tz: TimeZone>(&self, tz: &Tz) -> Vec<TimelineRow<'_>> {
        let mut rows = Vec::with_capacity(self.messages.len() + 1);
        let mut previous_day = None;
        for message in &self.messages {
            let day = local_day(message.created_at, tz);
            if previous_day != Some(day) {
                rows.push(TimelineRow::DaySeparator(day));
                previous_day = Some(day);
            }
            rows.push(TimelineRow::Message(message));
        }
        rows
    }
}

fn local_day<Tz: TimeZone>(at: DateTime<Utc>, tz: &Tz) -> NaiveDate {
    at.with_timezone(tz).date_naive()
}

/// Whether `authoritative` is the server copy of the optimistic `placeholder`.
fn confirms(authoritative: &ChatMessage, placeholder: &ChatMessage) -> bool {
    if authoritative.is_optimistic() {
        return false;
    }
    match (&authoritative.client_key, &placeholder.client_key) {
        (Some(a), Some(b)) => a == b,
        _ => {
            authoritative.sender_id == placeholder.sender_id
                && authoritative.product_id == placeholder.product_id
                && authoritative.message == placeholder.message
                && (authoritative.created_at - placeholder.created_at)
                    .num_seconds()
                    .abs()
                    <= RECONCILE_WINDOW_SECS
        }
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
