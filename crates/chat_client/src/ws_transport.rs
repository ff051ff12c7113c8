use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ProductId, UserId},
    protocol::{TransportEvent, TransportRequest},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::TransportError,
    transport::{ChatTransport, LinkState},
};

/// Websocket implementation of [`ChatTransport`] speaking JSON text frames.
pub struct WsTransport {
    ws_url: String,
    link: watch::Sender<LinkState>,
    events: broadcast::Sender<TransportEvent>,
    inner: Arc<Mutex<WsState>>,
}

#[derive(Default)]
struct WsState {
    user_id: Option<UserId>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
    generation: u64,
    rooms: HashMap<ProductId, usize>,
    presence: HashMap<UserId, usize>,
}

impl WsState {
    fn send(&self, request: TransportRequest) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        let text = encode_frame(&request)?;
        outbound.send(text).map_err(|_| TransportError::NotConnected)
    }

    fn send_if_connected(&self, request: TransportRequest) {
        if self.outbound.is_some() {
            if let Err(err) = self.send(request) {
                debug!(%err, "dropping frame for closed websocket");
            }
        }
    }

    fn shutdown(&mut self) {
        self.outbound = None;
        self.generation += 1;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn encode_frame(request: &TransportRequest) -> Result<String, TransportError> {
    serde_json::to_string(request).map_err(|err| TransportError::Encode(err.to_string()))
}

pub(crate) fn build_connect_url(ws_url: &str, user_id: &UserId) -> Result<Url> {
    let mut url = Url::parse(ws_url).with_context(|| format!("invalid websocket url: {ws_url}"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(anyhow!("websocket url must use ws:// or wss://, got {other}://")),
    }
    url.query_pairs_mut().append_pair("user_id", user_id.as_str());
    Ok(url)
}

impl WsTransport {
    pub fn new(ws_url: impl Into<String>) -> Self {
        let (link, _) = watch::channel(LinkState::Down);
        let (events, _) = broadcast::channel(1024);
        Self {
            ws_url: ws_url.into(),
            link,
            events,
            inner: Arc::new(Mutex::new(WsState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, WsState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn open_socket(&self, user_id: &UserId) -> Result<()> {
        let url = build_connect_url(&self.ws_url, user_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let mut guard = self.state();
        guard.shutdown();
        let generation = guard.generation;

        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(%err, "websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let events = self.events.clone();
        let link = self.link.clone();
        let inner = Arc::clone(&self.inner);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<TransportEvent>(&text) {
                        Ok(event) => {
                            let _ = events.send(event);
                        }
                        Err(err) => warn!(%err, "invalid transport event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "websocket receive failed");
                        break;
                    }
                }
            }
            {
                let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if guard.generation != generation {
                    debug!(generation, "stale websocket closed");
                    return;
                }
                guard.outbound = None;
            }
            link.send_if_modified(|state| {
                let changed = state.is_up();
                *state = LinkState::Down;
                changed
            });
            info!(generation, "websocket closed");
        });

        let replay = guard
            .rooms
            .keys()
            .map(|product_id| TransportRequest::JoinRoom {
                product_id: product_id.clone(),
            })
            .chain(guard.presence.keys().map(|user_id| {
                TransportRequest::SubscribePresence {
                    user_id: user_id.clone(),
                }
            }));
        for request in replay {
            match encode_frame(&request) {
                Ok(text) => {
                    let _ = outbound_tx.send(text);
                }
                Err(err) => warn!(%err, "failed to replay registration"),
            }
        }

        guard.user_id = Some(user_id.clone());
        guard.outbound = Some(outbound_tx);
        guard.tasks = vec![writer, reader];
        drop(guard);

        self.link.send_replace(LinkState::Up);
        info!(user_id = %user_id, "websocket connected");
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for WsTransport {
    async fn connect(&self, user_id: &UserId) -> Result<(), TransportError> {
        {
            let guard = self.state();
            let alive = guard
                .outbound
                .as_ref()
                .is_some_and(|outbound| !outbound.is_closed());
            if alive && self.link.borrow().is_up() && guard.user_id.as_ref() == Some(user_id) {
                return Ok(());
            }
        }

        self.open_socket(user_id)
            .await
            .map_err(|err| TransportError::Connect(format!("{err:#}")))
    }

    fn disconnect(&self) {
        let mut guard = self.state();
        guard.shutdown();
        guard.user_id = None;
        drop(guard);
        self.link.send_replace(LinkState::Down);
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    fn join_room(&self, product_id: &ProductId) {
        let mut guard = self.state();
        let count = guard.rooms.entry(product_id.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            guard.send_if_connected(TransportRequest::JoinRoom {
                product_id: product_id.clone(),
            });
        }
    }

    fn leave_room(&self, product_id: &ProductId) {
        let mut guard = self.state();
        let Some(count) = guard.rooms.get_mut(product_id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            guard.rooms.remove(product_id);
            guard.send_if_connected(TransportRequest::LeaveRoom {
                product_id: product_id.clone(),
            });
        }
    }

    fn subscribe_presence(&self, user_id: &UserId) {
        let mut guard = self.state();
        let count = guard.presence.entry(user_id.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            guard.send_if_connected(TransportRequest::SubscribePresence {
                user_id: user_id.clone(),
            });
        }
    }

    fn unsubscribe_presence(&self, user_id: &UserId) {
        let mut guard = self.state();
        let Some(count) = guard.presence.get_mut(user_id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            guard.presence.remove(user_id);
            guard.send_if_connected(TransportRequest::UnsubscribePresence {
                user_id: user_id.clone(),
            });
        }
    }

    fn request_presence(&self, user_id: &UserId) {
        self.state()
            .send_if_connected(TransportRequest::RequestPresence {
                user_id: user_id.clone(),
            });
    }

    fn emit(&self, request: TransportRequest) -> Result<(), TransportError> {
        if !self.link.borrow().is_up() {
            return Err(TransportError::NotConnected);
        }
        self.state().send(request)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.state().shutdown();
    }
}

#[cfg(test)]
#[path = "tests/ws_transport_tests.rs"]
mod tests;
