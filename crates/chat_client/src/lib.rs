//! Client side of the marketplace product chat.
//!
//! A [`ChatSession`] is one open conversation about a product. It loads the
//! seller and history over HTTP, keeps the shared realtime transport
//! supervised, tracks the seller's presence and merges live, fetched and
//! optimistic messages into one timeline.

pub mod api;
pub mod config;
pub mod error;
pub mod presence;
pub mod retry;
pub mod session;
pub mod supervisor;
pub mod timeline;
pub mod transport;
pub mod typing;
pub mod ws_transport;

pub use api::{ChatApi, HttpChatApi};
pub use config::{load_settings, ChatSettings};
pub use error::{ApiError, ChatFailure, FailureContext, FailureKind, TransportError};
pub use presence::PresenceTracker;
pub use retry::RetryPolicy;
pub use session::{
    ChatEvent, ChatSession, SendOutcome, SessionOptions, SessionSnapshot, SkipReason,
    SurfaceState,
};
pub use supervisor::ConnectionSupervisor;
pub use timeline::{Merge, MessageTimeline, TimelineRow};
pub use transport::{ChatTransport, LinkState, MissingTransport};
pub use typing::TypingIndicator;
pub use ws_transport::WsTransport;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
