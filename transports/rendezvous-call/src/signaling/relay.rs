//! Rendezvous relay
//!
//! Routes identifier-addressed frames between connected clients without
//! looking at their payload. The [`RelayHub`] holds the routing table and is
//! shared by the in-process [`MemoryConnector`](super::memory::MemoryConnector)
//! and the WebSocket [`RelayServer`].

use super::protocol::WireFrame;
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Registration token distinguishing successive channels of one identifier
pub type ConnectionId = u64;

#[derive(Default)]
struct HubState {
    clients: HashMap<String, (ConnectionId, mpsc::UnboundedSender<String>)>,
    dial_attempts: HashMap<String, u32>,
    next_connection: ConnectionId,
    unreachable: bool,
}

/// Identifier-addressed routing table
#[derive(Clone, Default)]
pub struct RelayHub {
    state: Arc<Mutex<HubState>>,
}

impl RelayHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a channel for `id`, replacing any older one
    pub fn register(&self, id: &str) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.next_connection += 1;
        let conn = state.next_connection;
        if state.clients.insert(id.to_string(), (conn, tx)).is_some() {
            info!("Client {} reconnected, replacing previous channel", id);
        } else {
            info!("Client {} connected", id);
        }
        (conn, rx)
    }

    /// Remove the registration of `id` if it is still `conn`
    pub fn unregister(&self, id: &str, conn: ConnectionId) {
        let mut state = self.lock();
        if matches!(state.clients.get(id), Some((current, _)) if *current == conn) {
            state.clients.remove(id);
            info!("Client {} disconnected", id);
        }
    }

    /// Drop the channel of `id` as if the server lost it
    pub fn disconnect(&self, id: &str) -> bool {
        let removed = self.lock().clients.remove(id).is_some();
        if removed {
            info!("Client {} dropped by relay", id);
        }
        removed
    }

    /// Refuse (`false`) or accept (`true`) new dials
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Whether new dials are accepted
    pub fn is_reachable(&self) -> bool {
        !self.lock().unreachable
    }

    /// Whether `id` currently has a channel
    pub fn is_connected(&self, id: &str) -> bool {
        self.lock().clients.contains_key(id)
    }

    /// Count a dial attempt for `id`
    pub(crate) fn record_dial(&self, id: &str) {
        *self.lock().dial_attempts.entry(id.to_string()).or_insert(0) += 1;
    }

    /// Number of dials made by `id` through an in-process connector
    pub fn dial_attempts(&self, id: &str) -> u32 {
        self.lock().dial_attempts.get(id).copied().unwrap_or(0)
    }

    /// Stamp `from` on a frame and forward it to its `to` identifier
    ///
    /// Undecodable frames and unknown targets are logged and dropped.
    pub fn route(&self, from: &str, text: &str) {
        let mut frame: WireFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Read error for {}: {}", from, e);
                return;
            }
        };
        frame.from = Some(from.to_string());

        let stamped = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to re-encode frame from {}: {}", from, e);
                return;
            }
        };

        let state = self.lock();
        match state.clients.get(&frame.to) {
            Some((_, tx)) => {
                if tx.send(stamped).is_err() {
                    warn!("Write error to {}: channel closed", frame.to);
                } else {
                    debug!("Routed {} frame {} -> {}", frame.kind, from, frame.to);
                }
            }
            None => warn!("Client {} not found", frame.to),
        }
    }
}

/// WebSocket front end of a [`RelayHub`]
///
/// Clients connect to `/ws?id=<identifier>`; connections without the
/// identifier are refused with HTTP 400.
pub struct RelayServer {
    hub: RelayHub,
    id_param: String,
}

impl RelayServer {
    /// Create a server around `hub` using the `id` query parameter
    pub fn new(hub: RelayHub) -> Self {
        Self {
            hub,
            id_param: "id".to_string(),
        }
    }

    /// Use a different query parameter for the identifier
    pub fn with_id_param(mut self, name: impl Into<String>) -> Self {
        self.id_param = name.into();
        self
    }

    /// Bind `addr` and start accepting connections
    pub async fn start(self, addr: SocketAddr) -> Result<RelayServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Rendezvous relay listening on ws://{}/ws", local_addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let hub = self.hub;
        let id_param = Arc::new(self.id_param);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted connection from {}", peer_addr);
                            let hub = hub.clone();
                            let id_param = Arc::clone(&id_param);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, hub, &id_param).await {
                                    warn!("Connection from {} ended with error: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    },
                    _ = &mut shutdown_rx => {
                        info!("Rendezvous relay received shutdown signal");
                        break;
                    }
                }
            }
        });

        Ok(RelayServerHandle {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}

/// Handle for a running [`RelayServer`]
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RelayServerHandle {
    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients should dial
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

fn query_value(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

async fn handle_connection(stream: TcpStream, hub: RelayHub, id_param: &str) -> Result<()> {
    let mut id = None;
    let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        match query_value(req.uri().query(), id_param) {
            Some(value) => {
                id = Some(value);
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("Missing id parameter".to_string()));
                *err.status_mut() = StatusCode::BAD_REQUEST;
                Err(err)
            }
        }
    })
    .await
    .map_err(|e| Error::WebSocketError(format!("Handshake failed: {}", e)))?;

    let id = id.ok_or_else(|| Error::WebSocketError("Missing id parameter".to_string()))?;
    let (conn, mut rx) = hub.register(&id);
    let (mut write, mut read) = ws.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => hub.route(&id, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Read error for {}: {}", id, e);
                break;
            }
        }
    }

    hub.unregister(&id, conn);
    writer.abort();
    Ok(())
}
