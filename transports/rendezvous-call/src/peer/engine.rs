//! Negotiation engine
//!
//! Owns the live [`CallSession`] (peer connection, local tracks, remote
//! identifier and negotiation phase) and implements the offer, answer and
//! candidate verbs. Peer connection callbacks never touch the session
//! directly: they are forwarded to an [`EngineEventSink`] tagged with the
//! [`SessionId`] that registered them, and the owner feeds them back through
//! [`NegotiationEngine::handle_local_candidate`] and friends, where stale
//! session ids are ignored.

use super::connection::build_peer_connection;
use crate::config::ClientConfig;
use crate::media::{AudioTrackSet, MediaDevices, PlaybackSink};
use crate::signaling::{
    ControlMessage, IceCandidateInfo, Identifier, LinkState, MessagePayload, RendezvousLink,
    SessionDescription,
};
use crate::{Error, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Identity of one call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Progress of the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Local side prepared, nothing exchanged
    None,
    /// Local offer committed and sent
    OfferSent,
    /// Remote offer applied and local answer committed
    AnswerSent,
    /// Answer applied or the peer connection reported connected
    Established,
}

/// Peer connection callback, forwarded to the engine's owner
pub enum EngineEvent {
    /// Local ICE candidate discovered
    LocalCandidate(IceCandidateInfo),
    /// Remote media track arrived
    RemoteTrack(Arc<TrackRemote>),
    /// Peer connection state changed
    PeerState(RTCPeerConnectionState),
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            EngineEvent::RemoteTrack(t) => f.debug_tuple("RemoteTrack").field(&t.ssrc()).finish(),
            EngineEvent::PeerState(s) => f.debug_tuple("PeerState").field(s).finish(),
        }
    }
}

/// Receiver of tagged peer connection callbacks
pub type EngineEventSink = Arc<dyn Fn(SessionId, EngineEvent) + Send + Sync>;

/// What happened to a local ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Sent to the remote party
    Sent,
    /// No remote identifier known yet; dropped
    Dropped,
    /// Raised by a session that no longer exists
    Stale,
}

/// Live negotiation context
pub struct CallSession {
    id: SessionId,
    peer: Arc<RTCPeerConnection>,
    tracks: Option<AudioTrackSet>,
    remote: Option<Identifier>,
    phase: NegotiationPhase,
}

impl CallSession {
    /// Session identity
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote party, once known
    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    /// Negotiation phase
    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    /// Underlying peer connection
    pub fn peer(&self) -> &Arc<RTCPeerConnection> {
        &self.peer
    }

    /// Take the local tracks for release
    pub fn take_tracks(&mut self) -> Option<AudioTrackSet> {
        self.tracks.take()
    }
}

/// Owner of the peer connection and its negotiation
pub struct NegotiationEngine {
    config: ClientConfig,
    self_id: Identifier,
    media: Arc<dyn MediaDevices>,
    playback: Arc<dyn PlaybackSink>,
    events: EngineEventSink,
    session: Option<CallSession>,
}

impl NegotiationEngine {
    /// Create an engine with no session
    pub fn new(
        config: ClientConfig,
        media: Arc<dyn MediaDevices>,
        playback: Arc<dyn PlaybackSink>,
        events: EngineEventSink,
    ) -> Self {
        Self {
            config,
            self_id: Identifier::new(),
            media,
            playback,
            events,
            session: None,
        }
    }

    /// Set the identifier outbound messages are sent from
    pub fn set_self_id(&mut self, self_id: impl Into<Identifier>) {
        self.self_id = self_id.into();
    }

    /// Identifier outbound messages are sent from
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Live session, if any
    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    /// Whether `id` names the live session
    pub fn is_current(&self, id: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == id)
    }

    /// Remove the live session for teardown
    pub fn take_session(&mut self) -> Option<CallSession> {
        self.session.take()
    }

    /// Forget the remote party of the live session
    pub fn clear_remote(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.remote = None;
            session.phase = NegotiationPhase::None;
        }
    }

    /// Acquire the microphone, create the peer connection and attach tracks
    ///
    /// Returns the existing session id if the local side is already prepared.
    /// On failure everything acquired so far is released.
    #[instrument(skip(self), fields(self_id = %self.self_id))]
    pub async fn prepare_local_side(&mut self) -> Result<SessionId> {
        if let Some(session) = &self.session {
            return Ok(session.id);
        }

        let tracks = self.media.acquire_audio_input().await?;

        let peer = match build_peer_connection(&self.config).await {
            Ok(peer) => peer,
            Err(e) => {
                self.media.release_audio_input(tracks).await;
                return Err(e);
            }
        };

        let mut add_error = None;
        for track in tracks.tracks() {
            let added = peer
                .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await;
            if let Err(e) = added {
                add_error = Some(e);
                break;
            }
        }
        if let Some(e) = add_error {
            self.media.release_audio_input(tracks).await;
            if let Err(close_err) = peer.close().await {
                debug!("Failed to close peer after track error: {}", close_err);
            }
            return Err(Error::PeerConnectionError(format!(
                "Failed to add audio track: {}",
                e
            )));
        }

        let id = SessionId::new();
        self.register_callbacks(id, &peer);

        info!(session = %id, "Local side prepared with {} audio track(s)", tracks.len());
        self.session = Some(CallSession {
            id,
            peer,
            tracks: Some(tracks),
            remote: None,
            phase: NegotiationPhase::None,
        });
        Ok(id)
    }

    fn register_callbacks(&self, id: SessionId, peer: &RTCPeerConnection) {
        let events = Arc::clone(&self.events);
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = Arc::clone(&events);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(session = %id, "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events(id, EngineEvent::LocalCandidate(init.into())),
                    Err(e) => warn!(session = %id, "Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let events = Arc::clone(&self.events);
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            events(id, EngineEvent::RemoteTrack(track));
            Box::pin(async {})
        }));

        let events = Arc::clone(&self.events);
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            events(id, EngineEvent::PeerState(state));
            Box::pin(async {})
        }));
    }

    /// Commit and send an offer to `remote`
    ///
    /// Requires a prepared local side and an open link. The remote identifier
    /// is recorded before the offer is generated so early candidates can be
    /// routed, and cleared again if any step fails.
    #[instrument(skip(self, link), fields(self_id = %self.self_id))]
    pub async fn create_outbound_offer(&mut self, remote: &str, link: &RendezvousLink) -> Result<()> {
        let self_id = self.self_id.clone();
        let session = self.session.as_mut().ok_or(Error::NotInitialized)?;
        if link.state() != LinkState::Open {
            return Err(Error::LinkNotOpen);
        }

        session.remote = Some(remote.to_string());

        let result = async {
            let offer = session
                .peer
                .create_offer(None)
                .await
                .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
            session
                .peer
                .set_local_description(offer.clone())
                .await
                .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

            let msg = ControlMessage::offer(self_id, remote, SessionDescription::from_rtc(&offer)?);
            link.send(&msg)
        }
        .await;

        match result {
            Ok(()) => {
                session.phase = NegotiationPhase::OfferSent;
                info!(session = %session.id, "Offer sent to {}", remote);
                Ok(())
            }
            Err(e) => {
                session.remote = None;
                Err(e)
            }
        }
    }

    /// Apply a remote offer and produce the answer to send back
    ///
    /// Prepares the local side first if needed. An offer from a party other
    /// than the current remote is refused with [`Error::InvalidState`].
    #[instrument(skip(self, msg), fields(self_id = %self.self_id, remote = %msg.from()))]
    pub async fn accept_inbound_offer(&mut self, msg: &ControlMessage) -> Result<ControlMessage> {
        let MessagePayload::Offer(desc) = msg.payload() else {
            return Err(Error::InvalidState(format!("Expected offer, got {}", msg.kind())));
        };
        let from = msg.from();

        if let Some(current) = self.session.as_ref().and_then(|s| s.remote.as_deref()) {
            if current != from {
                return Err(Error::InvalidState(format!(
                    "Busy with {}, refusing offer from {}",
                    current, from
                )));
            }
        }

        self.prepare_local_side().await?;
        let self_id = self.self_id.clone();
        let session = self.session.as_mut().ok_or(Error::NoActiveSession)?;

        let previous = session.remote.replace(from.to_string());

        let result = async {
            session
                .peer
                .set_remote_description(desc.to_rtc()?)
                .await
                .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

            let answer = session
                .peer
                .create_answer(None)
                .await
                .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
            session
                .peer
                .set_local_description(answer.clone())
                .await
                .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

            Ok::<_, Error>(ControlMessage::answer(
                self_id,
                from,
                SessionDescription::from_rtc(&answer)?,
            ))
        }
        .await;

        match result {
            Ok(answer) => {
                session.phase = NegotiationPhase::AnswerSent;
                info!(session = %session.id, "Answer created for {}", from);
                Ok(answer)
            }
            Err(e) => {
                session.remote = previous;
                Err(e)
            }
        }
    }

    /// Apply the remote answer to our outstanding offer
    #[instrument(skip(self, msg), fields(self_id = %self.self_id, remote = %msg.from()))]
    pub async fn apply_inbound_answer(&mut self, msg: &ControlMessage) -> Result<()> {
        let MessagePayload::Answer(desc) = msg.payload() else {
            return Err(Error::InvalidState(format!("Expected answer, got {}", msg.kind())));
        };
        let session = self.session.as_mut().ok_or(Error::NoActiveSession)?;

        if session.phase != NegotiationPhase::OfferSent {
            return Err(Error::InvalidState(format!(
                "No offer outstanding (phase {:?})",
                session.phase
            )));
        }
        if session.remote.as_deref() != Some(msg.from()) {
            return Err(Error::InvalidState(format!(
                "Answer from {} does not match the called party",
                msg.from()
            )));
        }

        session
            .peer
            .set_remote_description(desc.to_rtc()?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        session.phase = NegotiationPhase::Established;
        info!(session = %session.id, "Answer from {} applied", msg.from());
        Ok(())
    }

    /// Add a remote ICE candidate to the live session
    #[instrument(skip(self, msg), fields(self_id = %self.self_id, remote = %msg.from()))]
    pub async fn apply_inbound_candidate(&mut self, msg: &ControlMessage) -> Result<()> {
        let MessagePayload::IceCandidate(candidate) = msg.payload() else {
            return Err(Error::InvalidState(format!(
                "Expected ice-candidate, got {}",
                msg.kind()
            )));
        };
        let session = self.session.as_ref().ok_or(Error::NoActiveSession)?;

        if session.remote.as_deref() != Some(msg.from()) {
            return Err(Error::InvalidState(format!(
                "Candidate from {} does not match the remote party",
                msg.from()
            )));
        }

        session
            .peer
            .add_ice_candidate(candidate.clone().into())
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))?;

        debug!(session = %session.id, "Remote candidate added");
        Ok(())
    }

    /// Forward a local candidate to the remote party
    ///
    /// Candidates found before the remote identifier is known are dropped.
    pub fn handle_local_candidate(
        &self,
        id: SessionId,
        candidate: IceCandidateInfo,
        link: &RendezvousLink,
    ) -> Result<CandidateOutcome> {
        let Some(session) = self.session.as_ref().filter(|s| s.id == id) else {
            return Ok(CandidateOutcome::Stale);
        };
        let Some(remote) = session.remote.as_deref() else {
            warn!(session = %id, "Dropping local ICE candidate: no remote party yet");
            return Ok(CandidateOutcome::Dropped);
        };

        let msg = ControlMessage::ice_candidate(self.self_id.as_str(), remote, candidate);
        link.send(&msg)?;
        Ok(CandidateOutcome::Sent)
    }

    /// Start playback of a remote track
    ///
    /// Returns `Ok(false)` for a stale session.
    pub async fn handle_remote_track(&self, id: SessionId, track: Arc<TrackRemote>) -> Result<bool> {
        if !self.is_current(id) {
            return Ok(false);
        }
        self.playback.play(track).await?;
        Ok(true)
    }

    /// Track peer connection state for the live session
    pub fn handle_peer_state(&mut self, id: SessionId, state: RTCPeerConnectionState) {
        let Some(session) = self.session.as_mut().filter(|s| s.id == id) else {
            debug!(session = %id, "Ignoring state {} of stale session", state);
            return;
        };
        info!(session = %id, "Peer connection state: {}", state);
        if state == RTCPeerConnectionState::Connected {
            session.phase = NegotiationPhase::Established;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{DrainPlayback, SilentMicrophone};
    use crate::signaling::{MemoryConnector, RelayHub};
    use tokio::sync::mpsc;

    struct Rig {
        engine: NegotiationEngine,
        mic: SilentMicrophone,
        events: mpsc::UnboundedReceiver<(SessionId, EngineEvent)>,
    }

    fn rig(self_id: &str) -> Rig {
        let mic = SilentMicrophone::new();
        let (tx, events) = mpsc::unbounded_channel();
        let sink: EngineEventSink = Arc::new(move |id, event| {
            let _ = tx.send((id, event));
        });
        let mut engine = NegotiationEngine::new(
            ClientConfig::default(),
            Arc::new(mic.clone()),
            Arc::new(DrainPlayback::new()),
            sink,
        );
        engine.set_self_id(self_id);
        Rig { engine, mic, events }
    }

    async fn open_link(hub: &RelayHub, id: &str) -> RendezvousLink {
        let config = ClientConfig::with_signaling_url("ws://relay.local/ws");
        let mut link = RendezvousLink::new(config, Arc::new(MemoryConnector::new(hub.clone())));
        link.connect(id).await.unwrap();
        link
    }

    #[tokio::test]
    async fn test_offer_requires_prepared_side() {
        let hub = RelayHub::new();
        let link = open_link(&hub, "alice").await;
        let mut alice = rig("alice");

        let err = alice.engine.create_outbound_offer("bob", &link).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
        assert!(alice.engine.session().is_none());
    }

    #[tokio::test]
    async fn test_offer_requires_open_link() {
        let hub = RelayHub::new();
        let config = ClientConfig::with_signaling_url("ws://relay.local/ws");
        let link = RendezvousLink::new(config, Arc::new(MemoryConnector::new(hub)));
        let mut alice = rig("alice");
        alice.engine.prepare_local_side().await.unwrap();

        let err = alice.engine.create_outbound_offer("bob", &link).await.unwrap_err();
        assert!(matches!(err, Error::LinkNotOpen));
        assert_eq!(alice.engine.session().unwrap().remote(), None);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let mut alice = rig("alice");
        let first = alice.engine.prepare_local_side().await.unwrap();
        let second = alice.engine.prepare_local_side().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(alice.mic.audit().acquired(), 1);
    }

    #[tokio::test]
    async fn test_failed_acquisition_leaves_no_session() {
        let mut alice = rig("alice");
        alice.mic.set_available(false);

        let err = alice.engine.prepare_local_side().await.unwrap_err();
        assert!(matches!(err, Error::MediaAcquisitionFailed(_)));
        assert!(alice.engine.session().is_none());
        assert_eq!(alice.mic.audit().active(), 0);
    }

    #[tokio::test]
    async fn test_stray_answer_and_candidate_without_session() {
        let mut alice = rig("alice");
        let answer = ControlMessage::answer("bob", "alice", SessionDescription::answer("v=0"));
        let candidate = ControlMessage::ice_candidate(
            "bob",
            "alice",
            IceCandidateInfo {
                candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        );

        assert!(matches!(
            alice.engine.apply_inbound_answer(&answer).await,
            Err(Error::NoActiveSession)
        ));
        assert!(matches!(
            alice.engine.apply_inbound_candidate(&candidate).await,
            Err(Error::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_offer_answer_round_trip() {
        let hub = RelayHub::new();
        let alice_link = open_link(&hub, "alice").await;
        let mut alice = rig("alice");
        let mut bob = rig("bob");

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        let _bob_link = {
            let config = ClientConfig::with_signaling_url("ws://relay.local/ws");
            let mut link =
                RendezvousLink::new(config, Arc::new(MemoryConnector::new(hub.clone())));
            link.on_message(move |event| {
                let _ = bob_tx.send(event);
            })
            .await;
            link.connect("bob").await.unwrap();
            link
        };

        alice.engine.prepare_local_side().await.unwrap();
        alice.engine.create_outbound_offer("bob", &alice_link).await.unwrap();
        assert_eq!(alice.engine.session().unwrap().phase(), NegotiationPhase::OfferSent);

        let offer = loop {
            if let crate::signaling::LinkEvent::Message(text) = bob_rx.recv().await.unwrap() {
                let msg = ControlMessage::decode(&text).unwrap();
                if msg.kind() == crate::signaling::MessageKind::Offer {
                    break msg;
                }
            }
        };
        assert_eq!(offer.from(), "alice");

        let answer = bob.engine.accept_inbound_offer(&offer).await.unwrap();
        assert_eq!(answer.to(), "alice");
        assert_eq!(answer.from(), "bob");
        assert_eq!(bob.engine.session().unwrap().remote(), Some("alice"));
        assert_eq!(bob.engine.session().unwrap().phase(), NegotiationPhase::AnswerSent);

        alice.engine.apply_inbound_answer(&answer).await.unwrap();
        assert_eq!(alice.engine.session().unwrap().phase(), NegotiationPhase::Established);

        // A second copy of the answer is refused.
        assert!(matches!(
            alice.engine.apply_inbound_answer(&answer).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_from_other_party_is_refused_while_busy() {
        let hub = RelayHub::new();
        let alice_link = open_link(&hub, "alice").await;
        let mut alice = rig("alice");
        alice.engine.prepare_local_side().await.unwrap();
        alice.engine.create_outbound_offer("bob", &alice_link).await.unwrap();

        let intruder = ControlMessage::offer("carol", "alice", SessionDescription::offer("v=0"));
        let err = alice.engine.accept_inbound_offer(&intruder).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(alice.engine.session().unwrap().remote(), Some("bob"));
    }

    #[tokio::test]
    async fn test_candidate_without_remote_is_dropped() {
        let hub = RelayHub::new();
        let link = open_link(&hub, "alice").await;
        let mut alice = rig("alice");
        let id = alice.engine.prepare_local_side().await.unwrap();

        let candidate = IceCandidateInfo {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".to_string(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let outcome = alice
            .engine
            .handle_local_candidate(id, candidate.clone(), &link)
            .unwrap();
        assert_eq!(outcome, CandidateOutcome::Dropped);

        let stale = SessionId::new();
        let outcome = alice.engine.handle_local_candidate(stale, candidate, &link).unwrap();
        assert_eq!(outcome, CandidateOutcome::Stale);
    }

    #[tokio::test]
    async fn test_take_session_hands_over_tracks() {
        let mut alice = rig("alice");
        alice.engine.prepare_local_side().await.unwrap();

        let mut session = alice.engine.take_session().unwrap();
        assert!(alice.engine.session().is_none());

        let tracks = session.take_tracks().unwrap();
        alice.mic.release_audio_input(tracks).await;
        session.peer().close().await.unwrap();
        assert_eq!(alice.mic.audit().active(), 0);
    }
}
