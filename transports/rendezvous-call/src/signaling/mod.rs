//! Signaling: wire protocol, control channel transports and the rendezvous link

pub mod connector;
pub mod link;
pub mod memory;
pub mod protocol;
pub mod relay;

pub use connector::{Connector, FramePair, FrameSink, FrameStream, WebSocketConnector};
pub use link::{CloseMode, LinkEvent, LinkHandler, LinkState, RendezvousLink};
pub use memory::MemoryConnector;
pub use protocol::{
    ControlMessage, IceCandidateInfo, Identifier, MessageKind, MessagePayload, SdpKind,
    SessionDescription,
};
pub use relay::{RelayHub, RelayServer, RelayServerHandle};
