//! Signaling client
//!
//! [`SignalingClient`] is the handle the view layer holds. Behind it a single
//! coordinator task owns the rendezvous link, the negotiation engine, the
//! reaper and the call state. View commands, link events and peer connection
//! callbacks all arrive on one queue and are handled one at a time, each
//! negotiation step awaited to completion before the next event is looked at.
//!
//! Link events carry the epoch of the connection that produced them and
//! engine events carry their [`SessionId`]; events from a torn-down link or
//! session are dropped.

use crate::config::ClientConfig;
use crate::media::{DrainPlayback, MediaDevices, PlaybackSink, SilentMicrophone};
use crate::peer::{CandidateOutcome, EngineEvent, EngineEventSink, NegotiationEngine, SessionId};
use crate::session::{
    check_initialize, check_place_call, step, CallState, Effect, Input, Reaper, TeardownReport,
};
use crate::signaling::{
    Connector, ControlMessage, Identifier, LinkEvent, LinkState, MessageKind, RendezvousLink,
    WebSocketConnector,
};
use crate::{Disposition, Error, Result};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Severity of a [`Notice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The call state moved to [`CallState::Error`]
    Error,
    /// User-actionable; the call continues
    Recoverable,
    /// Informational warning
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Recoverable => write!(f, "recoverable"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// Message for display by the view layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// How serious the condition is
    pub severity: Severity,
    /// Human-readable description
    pub message: String,
}

impl Notice {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)
    }
}

enum Command {
    Initialize {
        self_id: Identifier,
        reply: oneshot::Sender<Result<()>>,
    },
    PlaceCall {
        remote: Identifier,
        reply: oneshot::Sender<Result<()>>,
    },
    EndCall {
        reply: oneshot::Sender<TeardownReport>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<TeardownReport>>,
    },
}

enum Event {
    Command(Command),
    Link { epoch: u64, event: LinkEvent },
    Engine { session: SessionId, event: EngineEvent },
}

/// Builder for [`SignalingClient`]
pub struct SignalingClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    media: Option<Arc<dyn MediaDevices>>,
    playback: Option<Arc<dyn PlaybackSink>>,
}

impl SignalingClientBuilder {
    /// Dial the rendezvous server through `connector` (default: WebSocket)
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Capture audio from `media` (default: [`SilentMicrophone`])
    pub fn media(mut self, media: Arc<dyn MediaDevices>) -> Self {
        self.media = Some(media);
        self
    }

    /// Play remote audio into `playback` (default: [`DrainPlayback`])
    pub fn playback(mut self, playback: Arc<dyn PlaybackSink>) -> Self {
        self.playback = Some(playback);
        self
    }

    /// Validate the configuration and start the coordinator task
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<SignalingClient> {
        self.config.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));
        let media = self
            .media
            .unwrap_or_else(|| Arc::new(SilentMicrophone::new()));
        let playback = self
            .playback
            .unwrap_or_else(|| Arc::new(DrainPlayback::new()));

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = tx.downgrade();

        let engine_queue = queue.clone();
        let sink: EngineEventSink = Arc::new(move |session, event| {
            if let Some(tx) = engine_queue.upgrade() {
                let _ = tx.send(Event::Engine { session, event });
            }
        });

        let engine = NegotiationEngine::new(
            self.config.clone(),
            Arc::clone(&media),
            playback,
            sink,
        );
        let link = RendezvousLink::new(self.config.clone(), connector);
        let link_state = link.watch_state();

        let (status_tx, status_rx) = watch::channel(CallState::Idle);
        let (notices, _) = broadcast::channel(self.config.notice_capacity.max(1));

        let coordinator = Coordinator {
            state: CallState::Idle,
            self_id: None,
            engine,
            link,
            reaper: Reaper::new(media),
            link_epoch: 0,
            queue,
            status_tx,
            notices: notices.clone(),
        };

        let task = tokio::spawn(coordinator.run(rx));

        Ok(SignalingClient {
            tx,
            status: status_rx,
            link_state,
            notices,
            task: Some(task),
        })
    }
}

/// Handle to a running signaling client
///
/// Dropping the handle tears down any live call and stops the coordinator.
pub struct SignalingClient {
    tx: UnboundedSender<Event>,
    status: watch::Receiver<CallState>,
    link_state: watch::Receiver<LinkState>,
    notices: broadcast::Sender<Notice>,
    task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Start configuring a client
    pub fn builder(config: ClientConfig) -> SignalingClientBuilder {
        SignalingClientBuilder {
            config,
            connector: None,
            media: None,
            playback: None,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Command(make(reply)))
            .map_err(|_| Error::ClientClosed)?;
        rx.await.map_err(|_| Error::ClientClosed)
    }

    /// Open the link addressed by `self_id` and prepare the local side
    ///
    /// Allowed from `Idle` and `Error`; any previous session is torn down
    /// first.
    pub async fn initialize(&self, self_id: &str) -> Result<()> {
        let self_id = self_id.to_string();
        self.request(|reply| Command::Initialize { self_id, reply })
            .await?
    }

    /// Call `remote`
    ///
    /// Rejected without a state change when `remote` is empty or ourselves,
    /// when not `Ready`, or when the link is not open.
    pub async fn place_call(&self, remote: &str) -> Result<()> {
        let remote = remote.to_string();
        self.request(|reply| Command::PlaceCall { remote, reply })
            .await?
    }

    /// End the call and release every resource
    pub async fn end_call(&self) -> Result<TeardownReport> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Current call state
    pub fn state(&self) -> CallState {
        self.status.borrow().clone()
    }

    /// Subscribe to call state changes
    pub fn status(&self) -> watch::Receiver<CallState> {
        self.status.clone()
    }

    /// Current rendezvous link state
    pub fn link_state(&self) -> LinkState {
        *self.link_state.borrow()
    }

    /// Subscribe to user-facing notices
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Tear down and wait for the coordinator to stop
    pub async fn shutdown(mut self) -> TeardownReport {
        let (reply, rx) = oneshot::channel();
        let report = if self
            .tx
            .send(Event::Command(Command::Shutdown { reply: Some(reply) }))
            .is_ok()
        {
            rx.await.unwrap_or_default()
        } else {
            TeardownReport::default()
        };

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Signaling client task ended abnormally: {}", e);
            }
        }
        report
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self
                .tx
                .send(Event::Command(Command::Shutdown { reply: None }));
        }
    }
}

struct Coordinator {
    state: CallState,
    self_id: Option<Identifier>,
    engine: NegotiationEngine,
    link: RendezvousLink,
    reaper: Reaper,
    link_epoch: u64,
    queue: WeakUnboundedSender<Event>,
    status_tx: watch::Sender<CallState>,
    notices: broadcast::Sender<Notice>,
}

impl Coordinator {
    async fn run(mut self, mut rx: UnboundedReceiver<Event>) {
        info!("Signaling client started");

        while let Some(event) = rx.recv().await {
            match event {
                Event::Command(Command::Shutdown { reply }) => {
                    let report = self.shutdown().await;
                    if let Some(reply) = reply {
                        let _ = reply.send(report);
                    }
                    info!("Signaling client stopped");
                    return;
                }
                Event::Command(command) => self.handle_command(command).await,
                Event::Link { epoch, event } => {
                    if epoch != self.link_epoch {
                        debug!(epoch, "Dropping event from previous link: {:?}", event);
                        continue;
                    }
                    self.handle_link_event(event).await;
                }
                Event::Engine { session, event } => {
                    if !self.engine.is_current(session) {
                        debug!(%session, "Dropping event from previous session: {:?}", event);
                        continue;
                    }
                    self.handle_engine_event(session, event).await;
                }
            }
        }

        self.shutdown().await;
        info!("Signaling client stopped");
    }

    async fn shutdown(&mut self) -> TeardownReport {
        let report = self
            .reaper
            .teardown(&mut self.engine, &mut self.link)
            .await;
        self.self_id = None;
        self.set_state(CallState::Idle);
        report
    }

    fn set_state(&mut self, next: CallState) {
        if self.state != next {
            info!("Call state: {} -> {}", self.state, next);
            self.state = next;
            self.status_tx.send_replace(self.state.clone());
        }
    }

    fn transition(&mut self, input: Input) -> Option<Vec<Effect>> {
        match step(&self.state, &input) {
            Some(step) => {
                self.set_state(step.next);
                Some(step.effects)
            }
            None => {
                debug!("No transition for {:?} in {}", input, self.state);
                None
            }
        }
    }

    fn notify(&self, severity: Severity, message: impl Into<String>) {
        let notice = Notice::new(severity, message);
        debug!("Notice: {}", notice);
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn enter_error(&mut self, err: &Error) {
        error!("Call failed: {}", err);
        self.transition(Input::Failure(err.to_string()));
        self.notify(Severity::Error, err.to_string());
    }

    /// Route an error that has no caller to return to
    fn report(&mut self, err: Error) {
        match err.disposition() {
            Disposition::Fatal => self.enter_error(&err),
            Disposition::Notice => {
                warn!("{}", err);
                self.notify(Severity::Recoverable, err.to_string());
            }
            Disposition::Caller | Disposition::Logged => match err {
                Error::NoActiveSession => debug!("Ignoring message without a session"),
                other => warn!("{}", other),
            },
        }
    }

    async fn run_effects(&mut self, effects: &[Effect], target: Option<&str>) -> Result<()> {
        for effect in effects {
            match effect {
                Effect::Teardown => {
                    self.reaper
                        .teardown(&mut self.engine, &mut self.link)
                        .await;
                }
                Effect::ConnectLink => self.connect_link().await?,
                Effect::PrepareLocalSide => {
                    self.engine.prepare_local_side().await?;
                }
                Effect::SendOffer => {
                    let target = target.ok_or(Error::InvalidTarget(String::new()))?;
                    self.engine
                        .create_outbound_offer(target, &self.link)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn connect_link(&mut self) -> Result<()> {
        let self_id = self.self_id.clone().ok_or(Error::NotInitialized)?;

        self.link_epoch += 1;
        let epoch = self.link_epoch;
        let queue = self.queue.clone();
        self.link
            .on_message(move |event| {
                if let Some(tx) = queue.upgrade() {
                    let _ = tx.send(Event::Link { epoch, event });
                }
            })
            .await;

        self.link.connect(&self_id).await
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize { self_id, reply } => {
                let result = self.initialize(self_id).await;
                let _ = reply.send(result);
            }
            Command::PlaceCall { remote, reply } => {
                let result = self.place_call(remote).await;
                let _ = reply.send(result);
            }
            Command::EndCall { reply } => {
                let report = self.end_call().await;
                let _ = reply.send(report);
            }
            Command::Shutdown { .. } => {}
        }
    }

    async fn initialize(&mut self, self_id: Identifier) -> Result<()> {
        check_initialize(&self.state, &self_id)?;
        let effects = self
            .transition(Input::Initialize)
            .ok_or_else(|| Error::InvalidState(format!("Cannot initialize while {}", self.state)))?;

        info!(self_id = %self_id, "Initializing");
        self.self_id = Some(self_id.clone());
        self.engine.set_self_id(self_id);

        match self.run_effects(&effects, None).await {
            Ok(()) => {
                self.transition(Input::LocalSideReady);
                Ok(())
            }
            Err(e) => {
                self.enter_error(&e);
                Err(e)
            }
        }
    }

    async fn place_call(&mut self, remote: Identifier) -> Result<()> {
        let self_id = self.self_id.clone().unwrap_or_default();
        check_place_call(&self.state, &self_id, &remote)?;
        if self.engine.session().is_none() {
            return Err(Error::NotInitialized);
        }
        if self.link.state() != LinkState::Open {
            return Err(Error::LinkNotOpen);
        }

        let effects = self
            .transition(Input::PlaceCall)
            .ok_or_else(|| Error::InvalidState(format!("Cannot place a call while {}", self.state)))?;

        info!(remote = %remote, "Placing call");
        match self.run_effects(&effects, Some(remote.as_str())).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(remote = %remote, "Call attempt failed: {}", e);
                self.engine.clear_remote();
                self.transition(Input::CallFailed);
                if e.disposition() == Disposition::Fatal {
                    self.enter_error(&e);
                }
                Err(e)
            }
        }
    }

    async fn end_call(&mut self) -> TeardownReport {
        info!("Ending call");
        self.transition(Input::EndCall);
        let report = self
            .reaper
            .teardown(&mut self.engine, &mut self.link)
            .await;
        self.self_id = None;
        report
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Message(text) => self.dispatch(&text).await,
            LinkEvent::Reconnecting { attempt } => {
                self.notify(
                    Severity::Warning,
                    format!("Connection to rendezvous server lost, reconnecting (attempt {})", attempt),
                );
            }
            LinkEvent::Restored => info!("Rendezvous link restored"),
            LinkEvent::Failed { attempts } => {
                self.enter_error(&Error::LinkUnreachable { attempts });
            }
            LinkEvent::Closed => debug!("Rendezvous link closed"),
        }
    }

    async fn dispatch(&mut self, text: &str) {
        let msg = match ControlMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return;
            }
        };

        if self.self_id.as_deref() != Some(msg.to()) {
            warn!("Dropping {} addressed to {}", msg.kind(), msg.to());
            return;
        }

        debug!(remote = %msg.from(), "Received {}", msg.kind());
        match msg.kind() {
            MessageKind::Offer => match self.engine.accept_inbound_offer(&msg).await {
                Ok(answer) => match self.link.send(&answer) {
                    Ok(()) => {
                        self.transition(Input::OfferAccepted);
                    }
                    Err(e) => self.report(e),
                },
                Err(e) => self.report(e),
            },
            MessageKind::Answer => match self.engine.apply_inbound_answer(&msg).await {
                Ok(()) => {
                    self.transition(Input::AnswerApplied);
                }
                Err(e) => self.report(e),
            },
            MessageKind::IceCandidate => {
                if let Err(e) = self.engine.apply_inbound_candidate(&msg).await {
                    self.report(e);
                }
            }
        }
    }

    async fn handle_engine_event(&mut self, session: SessionId, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                match self
                    .engine
                    .handle_local_candidate(session, candidate, &self.link)
                {
                    Ok(CandidateOutcome::Sent) => debug!(%session, "Local candidate sent"),
                    Ok(CandidateOutcome::Dropped) => self.notify(
                        Severity::Warning,
                        "ICE candidate dropped: no remote party to send it to",
                    ),
                    Ok(CandidateOutcome::Stale) => {}
                    Err(e) => self.report(e),
                }
            }
            EngineEvent::RemoteTrack(track) => {
                if let Err(e) = self.engine.handle_remote_track(session, track).await {
                    self.report(e);
                }
            }
            EngineEvent::PeerState(state) => {
                self.engine.handle_peer_state(session, state);
                if state == RTCPeerConnectionState::Failed {
                    self.notify(Severity::Warning, "Peer connection failed");
                }
            }
        }
    }
}
