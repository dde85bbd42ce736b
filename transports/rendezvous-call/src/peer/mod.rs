//! Peer connection and negotiation

pub mod connection;
pub mod engine;

pub use connection::{build_peer_connection, ice_servers};
pub use engine::{
    CallSession, CandidateOutcome, EngineEvent, EngineEventSink, NegotiationEngine,
    NegotiationPhase, SessionId,
};
