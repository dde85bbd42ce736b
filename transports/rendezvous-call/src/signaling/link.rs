//! Rendezvous link
//!
//! Owns the single control channel to the rendezvous server. A supervisor
//! task holds the socket halves, forwards inbound frames to the registered
//! handler in arrival order, and re-dials after unexpected closure according
//! to the [`ReconnectPolicy`]. Reconnection never blocks the caller: `send`
//! fails fast with [`Error::LinkNotOpen`] until the link is open again.

use super::connector::{Connector, FramePair};
use super::protocol::{ControlMessage, Identifier};
use crate::config::{ClientConfig, ReconnectPolicy};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Connection state of the rendezvous link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Initial dial in progress
    Connecting,
    /// Channel established; `send` is allowed
    Open,
    /// Closed by the caller, or never opened
    Closed,
    /// Waiting for or performing reconnection attempt `attempt` (1-based;
    /// 0 while the lost channel is being discarded)
    Reconnecting {
        /// Current attempt number
        attempt: u32,
    },
    /// Reconnection budget exhausted
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Open => write!(f, "open"),
            LinkState::Closed => write!(f, "closed"),
            LinkState::Reconnecting { attempt } => write!(f, "reconnecting ({})", attempt),
            LinkState::Failed => write!(f, "failed"),
        }
    }
}

/// Event delivered to the link's handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Raw inbound text frame
    Message(String),
    /// The channel dropped unexpectedly; attempt `attempt` is scheduled
    Reconnecting {
        /// Attempt number (1-based)
        attempt: u32,
    },
    /// A reconnection attempt succeeded
    Restored,
    /// Every reconnection attempt failed
    Failed {
        /// Attempts made
        attempts: u32,
    },
    /// The link was closed by the caller
    Closed,
}

/// How [`RendezvousLink::close`] ends the current channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Caller-initiated shutdown; no reconnection is attempted
    Final,
    /// Drop the channel and let the reconnection policy re-establish it
    Resume,
}

/// Handler receiving every [`LinkEvent`]
pub type LinkHandler = Arc<dyn Fn(LinkEvent) + Send + Sync>;

type HandlerSlot = Arc<RwLock<Option<LinkHandler>>>;

enum Control {
    Close(CloseMode),
}

/// Resilient control channel addressed by the local identifier
pub struct RendezvousLink {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    handler: HandlerSlot,
    state_tx: Arc<watch::Sender<LinkState>>,
    state_rx: watch::Receiver<LinkState>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    control: Option<mpsc::UnboundedSender<Control>>,
    task: Option<JoinHandle<()>>,
    self_id: Option<Identifier>,
}

impl RendezvousLink {
    /// Create a closed link that dials through `connector`
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Closed);
        Self {
            config,
            connector,
            handler: Arc::new(RwLock::new(None)),
            state_tx: Arc::new(state_tx),
            state_rx,
            outbound: None,
            control: None,
            task: None,
            self_id: None,
        }
    }

    /// Register the sole consumer of link events, replacing any previous one
    pub async fn on_message<F>(&self, handler: F)
    where
        F: Fn(LinkEvent) + Send + Sync + 'static,
    {
        *self.handler.write().await = Some(Arc::new(handler));
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Subscribe to link state changes
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Identifier the link is addressed by, once connected
    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    /// Open the control channel addressed by `self_id`
    ///
    /// The initial dial is not retried; a failure is returned to the caller
    /// as [`Error::LinkUnreachable`] with zero attempts.
    #[instrument(skip(self), fields(self_id = %self_id))]
    pub async fn connect(&mut self, self_id: &str) -> Result<()> {
        if self.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(Error::InvalidState(format!(
                "Rendezvous link is already {}",
                self.state()
            )));
        }

        let url = self.config.signaling_endpoint(self_id)?;
        self.state_tx.send_replace(LinkState::Connecting);

        let pair = match self.connector.dial(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Failed to open rendezvous link: {}", e);
                self.state_tx.send_replace(LinkState::Failed);
                return Err(Error::LinkUnreachable { attempts: 0 });
            }
        };

        info!("Rendezvous link open");
        self.state_tx.send_replace(LinkState::Open);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            url,
            connector: Arc::clone(&self.connector),
            policy: self.config.reconnect,
            handler: Arc::clone(&self.handler),
            state_tx: Arc::clone(&self.state_tx),
            outbound_rx,
            control_rx,
        };

        self.task = Some(tokio::spawn(supervisor.run(pair)));
        self.outbound = Some(outbound_tx);
        self.control = Some(control_tx);
        self.self_id = Some(self_id.to_string());
        Ok(())
    }

    /// Send a control message
    ///
    /// Fails with [`Error::LinkNotOpen`] unless the link is [`LinkState::Open`].
    pub fn send(&self, message: &ControlMessage) -> Result<()> {
        if self.state() != LinkState::Open {
            return Err(Error::LinkNotOpen);
        }
        let outbound = self.outbound.as_ref().ok_or(Error::LinkNotOpen)?;
        let text = message.encode()?;
        debug!("Sending {} to {}", message.kind(), message.to());
        outbound.send(text).map_err(|_| Error::LinkNotOpen)
    }

    /// Close the control channel
    ///
    /// [`CloseMode::Final`] waits for the supervisor to exit and leaves the
    /// link [`LinkState::Closed`]; calling it again is a no-op.
    pub async fn close(&mut self, mode: CloseMode) {
        match mode {
            CloseMode::Resume => {
                if let Some(control) = &self.control {
                    let _ = control.send(Control::Close(CloseMode::Resume));
                }
            }
            CloseMode::Final => {
                if let Some(control) = self.control.take() {
                    let _ = control.send(Control::Close(CloseMode::Final));
                }
                self.outbound = None;
                if let Some(task) = self.task.take() {
                    if let Err(e) = task.await {
                        warn!("Rendezvous link supervisor ended abnormally: {}", e);
                    }
                }
                self.state_tx.send_replace(LinkState::Closed);
            }
        }
    }

    /// Whether a supervisor task is still running
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for RendezvousLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum Interrupt {
    Final,
    Dropped,
}

struct Supervisor {
    url: Url,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    handler: HandlerSlot,
    state_tx: Arc<watch::Sender<LinkState>>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Supervisor {
    async fn emit(&self, event: LinkEvent) {
        let handler = self.handler.read().await.clone();
        match handler {
            Some(handler) => handler(event),
            None => debug!("No link handler registered, dropping {:?}", event),
        }
    }

    async fn run(mut self, mut pair: FramePair) {
        loop {
            match self.pump(&mut pair).await {
                Interrupt::Final => {
                    let _ = pair.sink.close().await;
                    self.finish_closed().await;
                    return;
                }
                Interrupt::Dropped => drop(pair),
            }

            // Leave Open before draining so `send` fails fast from here on.
            self.state_tx
                .send_replace(LinkState::Reconnecting { attempt: 0 });
            self.drain_stale();

            pair = match self.reconnect().await {
                Some(pair) => pair,
                None => return,
            };
        }
    }

    /// Discard frames queued for a lost channel
    fn drain_stale(&mut self) {
        let mut dropped = 0;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Discarded {} frame(s) queued for the lost channel", dropped);
        }
    }

    async fn pump(&mut self, pair: &mut FramePair) -> Interrupt {
        loop {
            tokio::select! {
                frame = pair.stream.next() => match frame {
                    Some(Ok(text)) => self.emit(LinkEvent::Message(text)).await,
                    Some(Err(e)) => {
                        warn!("Rendezvous link read error: {}", e);
                        return Interrupt::Dropped;
                    }
                    None => {
                        warn!("Rendezvous link closed unexpectedly");
                        return Interrupt::Dropped;
                    }
                },
                Some(text) = self.outbound_rx.recv() => {
                    if let Err(e) = pair.sink.send(text).await {
                        warn!("Rendezvous link write error: {}", e);
                        return Interrupt::Dropped;
                    }
                }
                control = self.control_rx.recv() => match control {
                    Some(Control::Close(CloseMode::Resume)) => {
                        info!("Rendezvous link dropped for resume");
                        return Interrupt::Dropped;
                    }
                    Some(Control::Close(CloseMode::Final)) | None => return Interrupt::Final,
                },
            }
        }
    }

    async fn reconnect(&mut self) -> Option<FramePair> {
        let mut attempts = 0;
        loop {
            if !self.policy.should_retry(attempts) {
                warn!(
                    "Rendezvous link failed after {} reconnection attempts",
                    attempts
                );
                self.state_tx.send_replace(LinkState::Failed);
                self.emit(LinkEvent::Failed { attempts }).await;
                return None;
            }

            attempts += 1;
            info!(
                attempt = attempts,
                "Reconnecting rendezvous link (attempt {}/{}, delay {:?})",
                attempts,
                self.policy.max_attempts,
                self.policy.delay()
            );
            self.state_tx
                .send_replace(LinkState::Reconnecting { attempt: attempts });
            self.emit(LinkEvent::Reconnecting { attempt: attempts }).await;

            if self.wait_for_close(tokio::time::sleep(self.policy.delay())).await.is_none() {
                self.finish_closed().await;
                return None;
            }

            let connector = Arc::clone(&self.connector);
            let url = self.url.clone();
            match self.wait_for_close(async move { connector.dial(&url).await }).await {
                None => {
                    self.finish_closed().await;
                    return None;
                }
                Some(Ok(pair)) => {
                    info!(attempt = attempts, "Rendezvous link restored");
                    self.drain_stale();
                    self.state_tx.send_replace(LinkState::Open);
                    self.emit(LinkEvent::Restored).await;
                    return Some(pair);
                }
                Some(Err(e)) => warn!(attempt = attempts, "Reconnection attempt failed: {}", e),
            }
        }
    }

    /// Run `fut` unless a final close arrives first
    async fn wait_for_close<F: std::future::Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                control = self.control_rx.recv() => match control {
                    Some(Control::Close(CloseMode::Resume)) => {
                        debug!("Resume requested while already reconnecting");
                    }
                    Some(Control::Close(CloseMode::Final)) | None => return None,
                },
            }
        }
    }

    async fn finish_closed(&self) {
        info!("Rendezvous link closed");
        self.state_tx.send_replace(LinkState::Closed);
        self.emit(LinkEvent::Closed).await;
    }
}
