//! Rendezvous signaling client for one-to-one WebRTC audio calls
//!
//! Two parties, each known by an opaque identifier, are introduced by a
//! rendezvous relay and then negotiate a direct audio session.
//!
//! # Features
//!
//! - **Resilient control channel**: WebSocket link to the relay with a fixed
//!   reconnection budget (5 attempts, 2s apart)
//! - **Offer/answer/ICE negotiation**: trickled candidates over the relay
//! - **Explicit call state machine**: `Idle → Initializing → Ready → Calling → Connected`
//! - **Ordered teardown**: tracks, then peer connection, then link
//! - **Relay server**: identifier-addressed routing for tests and deployments
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │  View layer                                           │
//! │  ↓ initialize / place_call / end_call                 │
//! │  SignalingClient (handle)                             │
//! │  └─ coordinator task (single event queue)             │
//! │     ├─ RendezvousLink ── Connector (WebSocket/memory) │
//! │     ├─ NegotiationEngine ── RTCPeerConnection         │
//! │     │   └─ MediaDevices / PlaybackSink                │
//! │     └─ Reaper                                         │
//! │  ↑ status (CallState) / notices                       │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use rendezvous_call::ClientConfig;
//!
//! let config = ClientConfig::with_signaling_url("ws://localhost:8080/ws");
//! assert!(config.validate().is_ok());
//! assert_eq!(
//!     config.signaling_endpoint("alice").unwrap().as_str(),
//!     "ws://localhost:8080/ws?id=alice"
//! );
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use rendezvous_call::{ClientConfig, SignalingClient};
//!
//! # async fn example() -> rendezvous_call::Result<()> {
//! let client = SignalingClient::builder(ClientConfig::default()).build()?;
//! client.initialize("alice").await?;
//! client.place_call("bob").await?;
//!
//! let mut status = client.status();
//! while status.changed().await.is_ok() {
//!     println!("call state: {}", *status.borrow());
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use client::{Notice, Severity, SignalingClient, SignalingClientBuilder};
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::{Disposition, Error, Result};
pub use media::{DeviceAudit, DrainPlayback, MediaDevices, PlaybackSink, SilentMicrophone};
pub use peer::{NegotiationEngine, NegotiationPhase, SessionId};
pub use session::{CallState, Reaper, TeardownReport};
pub use signaling::{
    CloseMode, ControlMessage, IceCandidateInfo, Identifier, LinkEvent, LinkState,
    MemoryConnector, MessageKind, MessagePayload, RelayHub, RelayServer, RendezvousLink,
    SessionDescription, WebSocketConnector,
};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
