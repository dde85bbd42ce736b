//! Call flow test harness
//!
//! Provides infrastructure for integration testing of signaling clients:
//! - In-process relay hub shared by every party
//! - Optional WebSocket relay on a random port
//! - Clients wired to audited fake microphones
//! - Scripted parties driven by a bare link and negotiation engine
//!
//! Basic usage pattern:
//!
//! 1. Create a `CallHarness`
//! 2. Create clients using `harness.create_client()`
//! 3. Drive them and wait with `wait_for_state()`
//! 4. Inspect the hub and microphone audits

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rendezvous_call::peer::EngineEventSink;
use rendezvous_call::{
    CallState, ClientConfig, ControlMessage, DrainPlayback, LinkEvent, MemoryConnector,
    NegotiationEngine, RelayHub, RelayServer, RendezvousLink, SignalingClient, SilentMicrophone,
};
use rendezvous_call::signaling::RelayServerHandle;
use tokio::sync::mpsc;
use tracing::info;

/// Signaling URL used by in-process clients; the memory connector only reads its query
pub const MEMORY_URL: &str = "ws://relay.local/ws";

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Client error: {0}")]
    ClientError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl From<rendezvous_call::Error> for HarnessError {
    fn from(e: rendezvous_call::Error) -> Self {
        HarnessError::ClientError(e.to_string())
    }
}

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,rendezvous_call=debug")
        .with_test_writer()
        .try_init();
}

/// Shared relay for a group of test parties
pub struct CallHarness {
    hub: RelayHub,
    config: ClientConfig,
}

impl CallHarness {
    /// Harness over an in-process hub with default timing
    pub fn new() -> Self {
        Self::with_config(ClientConfig::with_signaling_url(MEMORY_URL))
    }

    /// Harness whose clients use `config`
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            hub: RelayHub::new(),
            config,
        }
    }

    /// Harness with a fast reconnection policy
    pub fn with_reconnect(max_attempts: u32, delay_ms: u64) -> Self {
        let mut config = ClientConfig::with_signaling_url(MEMORY_URL);
        config.reconnect.max_attempts = max_attempts;
        config.reconnect.delay_ms = delay_ms;
        Self::with_config(config)
    }

    /// Routing table every party dials into
    pub fn hub(&self) -> &RelayHub {
        &self.hub
    }

    /// Client configuration handed to new parties
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Build a client dialing the hub and capturing from `mic`
    pub fn create_client(&self, mic: &SilentMicrophone) -> HarnessResult<SignalingClient> {
        self.create_client_with_playback(mic, &DrainPlayback::new())
    }

    /// Build a client that plays remote audio into `playback`
    pub fn create_client_with_playback(
        &self,
        mic: &SilentMicrophone,
        playback: &DrainPlayback,
    ) -> HarnessResult<SignalingClient> {
        let client = SignalingClient::builder(self.config.clone())
            .connector(Arc::new(MemoryConnector::new(self.hub.clone())))
            .media(Arc::new(mic.clone()))
            .playback(Arc::new(playback.clone()))
            .build()?;
        Ok(client)
    }

    /// Build and initialize a client registered as `id`
    pub async fn ready_client(
        &self,
        id: &str,
        mic: &SilentMicrophone,
    ) -> HarnessResult<SignalingClient> {
        self.ready_client_with_playback(id, mic, &DrainPlayback::new())
            .await
    }

    /// Build and initialize a client registered as `id` playing into `playback`
    pub async fn ready_client_with_playback(
        &self,
        id: &str,
        mic: &SilentMicrophone,
        playback: &DrainPlayback,
    ) -> HarnessResult<SignalingClient> {
        let client = self.create_client_with_playback(mic, playback)?;
        client.initialize(id).await?;
        wait_for_state(&client, |s| *s == CallState::Ready, Duration::from_secs(5)).await?;
        info!("Test client {} ready", id);
        Ok(client)
    }

    /// Party driven directly through a link and an engine
    pub async fn scripted_party(&self, id: &str) -> HarnessResult<ScriptedParty> {
        let (tx, frames) = mpsc::unbounded_channel();

        let mut link = RendezvousLink::new(
            self.config.clone(),
            Arc::new(MemoryConnector::new(self.hub.clone())),
        );
        link.on_message(move |event| {
            if let LinkEvent::Message(text) = event {
                let _ = tx.send(text);
            }
        })
        .await;
        link.connect(id).await?;

        let sink: EngineEventSink = Arc::new(|_, _| {});
        let mut engine = NegotiationEngine::new(
            self.config.clone(),
            Arc::new(SilentMicrophone::new()),
            Arc::new(DrainPlayback::new()),
            sink,
        );
        engine.set_self_id(id);
        engine.prepare_local_side().await?;

        Ok(ScriptedParty {
            link,
            engine,
            frames,
        })
    }
}

/// A party whose every step is driven by the test
pub struct ScriptedParty {
    pub link: RendezvousLink,
    pub engine: NegotiationEngine,
    frames: mpsc::UnboundedReceiver<String>,
}

impl ScriptedParty {
    /// Send an offer to `remote`
    pub async fn offer(&mut self, remote: &str) -> HarnessResult<()> {
        self.engine.create_outbound_offer(remote, &self.link).await?;
        Ok(())
    }

    /// Next control message received within `timeout`
    pub async fn next_message(&mut self, timeout: Duration) -> HarnessResult<ControlMessage> {
        let text = tokio::time::timeout(timeout, self.frames.recv())
            .await
            .map_err(|_| HarnessError::Timeout("no control message received".to_string()))?
            .ok_or_else(|| HarnessError::ProtocolError("link closed".to_string()))?;
        ControlMessage::decode(&text).map_err(|e| HarnessError::ProtocolError(e.to_string()))
    }

    /// Every control message received within `window`
    pub async fn collect_messages(&mut self, window: Duration) -> Vec<ControlMessage> {
        let mut messages = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(text)) = tokio::time::timeout_at(deadline, self.frames.recv()).await {
            if let Ok(msg) = ControlMessage::decode(&text) {
                messages.push(msg);
            }
        }
        messages
    }
}

/// Relay served over WebSocket on a random local port
pub async fn start_websocket_relay() -> HarnessResult<(RelayHub, RelayServerHandle)> {
    let hub = RelayHub::new();
    let handle = RelayServer::new(hub.clone())
        .start("127.0.0.1:0".parse().map_err(|e| {
            HarnessError::ServerError(format!("bad bind address: {}", e))
        })?)
        .await
        .map_err(|e| HarnessError::ServerError(e.to_string()))?;
    info!("Test relay listening on {}", handle.url());
    Ok((hub, handle))
}

/// Wait until the client's state satisfies `predicate`
pub async fn wait_for_state<F>(
    client: &SignalingClient,
    predicate: F,
    timeout: Duration,
) -> HarnessResult<CallState>
where
    F: Fn(&CallState) -> bool,
{
    let mut status = client.status();
    let result = tokio::time::timeout(timeout, async {
        loop {
            let current = status.borrow_and_update().clone();
            if predicate(&current) {
                return Ok(current);
            }
            if status.changed().await.is_err() {
                return Err(HarnessError::ClientError("client stopped".to_string()));
            }
        }
    })
    .await;

    match result {
        Ok(state) => state,
        Err(_) => Err(HarnessError::Timeout(format!(
            "state still {} after {:?}",
            client.state(),
            timeout
        ))),
    }
}
