//! Error types for the rendezvous call client

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while signaling or negotiating a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The control channel is not open (connecting, reconnecting or closed)
    #[error("Rendezvous link is not open")]
    LinkNotOpen,

    /// The reconnection budget was exhausted
    #[error("Rendezvous server unreachable after {attempts} reconnection attempts")]
    LinkUnreachable {
        /// Number of reconnection attempts made before giving up
        attempts: u32,
    },

    /// No local side has been prepared yet
    #[error("Local side is not initialized")]
    NotInitialized,

    /// No peer connection exists for the operation
    #[error("No active call session")]
    NoActiveSession,

    /// Call target is empty or addresses ourselves
    #[error("Invalid call target: {0}")]
    InvalidTarget(String),

    /// Audio capture could not be acquired
    #[error("Media acquisition failed: {0}")]
    MediaAcquisitionFailed(String),

    /// Remote audio could not start playing without user interaction
    #[error("Playback permission denied: {0}")]
    PlaybackPermissionDenied(String),

    /// Inbound frame could not be decoded or carries an unknown type
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// The client task has stopped and no longer accepts commands
    #[error("Signaling client is closed")]
    ClientClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How an error is delivered to the view layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Returned directly to the caller of the triggering operation
    Caller,
    /// Moves the call state to `Error` and is published on the notice stream
    Fatal,
    /// Published as a recoverable notice; the call state is unchanged
    Notice,
    /// Logged and swallowed
    Logged,
}

impl Error {
    /// Classify how this error reaches the user
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::InvalidTarget(_)
            | Error::NotInitialized
            | Error::LinkNotOpen
            | Error::InvalidState(_)
            | Error::InvalidConfig(_)
            | Error::ClientClosed => Disposition::Caller,
            Error::LinkUnreachable { .. } | Error::MediaAcquisitionFailed(_) => Disposition::Fatal,
            Error::PlaybackPermissionDenied(_) => Disposition::Notice,
            _ => Disposition::Logged,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LinkNotOpen | Error::WebSocketError(_) | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}
