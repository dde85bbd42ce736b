//! Call state machine
//!
//! Transitions are a pure function from `(state, input)` to the next state
//! and the effects the coordinator has to run. Effects are executed in order;
//! [`Effect::Teardown`] always comes first so a re-armed client never sees a
//! stale session.

use crate::{Error, Result};
use std::fmt;

/// User-visible call state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    /// Nothing set up
    Idle,
    /// Opening the link and preparing the local side
    Initializing,
    /// Link open and local side prepared; calls can be placed
    Ready,
    /// Offer sent, waiting for the answer
    Calling,
    /// Offer/answer exchange completed
    Connected,
    /// Unrecoverable failure; `initialize` must be called again
    Error(String),
}

impl CallState {
    /// Whether this is [`CallState::Error`]
    pub fn is_error(&self) -> bool {
        matches!(self, CallState::Error(_))
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Idle => write!(f, "idle"),
            CallState::Initializing => write!(f, "initializing"),
            CallState::Ready => write!(f, "ready"),
            CallState::Calling => write!(f, "calling"),
            CallState::Connected => write!(f, "connected"),
            CallState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Event driving the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `initialize` accepted
    Initialize,
    /// Link open and local side prepared
    LocalSideReady,
    /// `placeCall` accepted
    PlaceCall,
    /// Remote answer applied to our offer
    AnswerApplied,
    /// Remote offer accepted and answered
    OfferAccepted,
    /// Placing a call failed after the offer was attempted
    CallFailed,
    /// `endCall`
    EndCall,
    /// Unrecoverable link or negotiation failure
    Failure(String),
}

/// Work the coordinator performs for a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Run the resource reaper
    Teardown,
    /// Open the rendezvous link
    ConnectLink,
    /// Prepare the local side of a session
    PrepareLocalSide,
    /// Create and send an offer
    SendOffer,
}

/// Result of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// State after the transition
    pub next: CallState,
    /// Effects to run, in order
    pub effects: Vec<Effect>,
}

impl Step {
    fn to(next: CallState) -> Self {
        Self {
            next,
            effects: Vec::new(),
        }
    }

    fn with(mut self, effects: &[Effect]) -> Self {
        self.effects.extend_from_slice(effects);
        self
    }
}

/// Compute the transition for `input` in `state`
///
/// Returns `None` when the input does not apply to the state.
pub fn step(state: &CallState, input: &Input) -> Option<Step> {
    use CallState::*;

    match (state, input) {
        (_, Input::EndCall) => Some(Step::to(Idle).with(&[Effect::Teardown])),
        (_, Input::Failure(reason)) => Some(Step::to(Error(reason.clone()))),

        (Idle | Error(_), Input::Initialize) => Some(Step::to(Initializing).with(&[
            Effect::Teardown,
            Effect::ConnectLink,
            Effect::PrepareLocalSide,
        ])),
        (Initializing, Input::LocalSideReady) => Some(Step::to(Ready)),

        (Ready, Input::PlaceCall) => Some(Step::to(Calling).with(&[Effect::SendOffer])),
        (Calling, Input::CallFailed) => Some(Step::to(Ready)),
        (Calling, Input::AnswerApplied) => Some(Step::to(Connected)),

        (Error(_), Input::OfferAccepted) => None,
        (_, Input::OfferAccepted) => Some(Step::to(Connected)),

        _ => None,
    }
}

/// Check that `initialize(self_id)` may run in `state`
pub fn check_initialize(state: &CallState, self_id: &str) -> Result<()> {
    if self_id.is_empty() {
        return Err(Error::InvalidTarget("identifier must not be empty".to_string()));
    }
    match state {
        CallState::Idle | CallState::Error(_) => Ok(()),
        other => Err(Error::InvalidState(format!(
            "Cannot initialize while {}",
            other
        ))),
    }
}

/// Check that `placeCall(target)` may run in `state`
pub fn check_place_call(state: &CallState, self_id: &str, target: &str) -> Result<()> {
    if target.is_empty() {
        return Err(Error::InvalidTarget("call target must not be empty".to_string()));
    }
    if target == self_id {
        return Err(Error::InvalidTarget("cannot call yourself".to_string()));
    }
    match state {
        CallState::Ready => Ok(()),
        CallState::Idle | CallState::Initializing | CallState::Error(_) => {
            Err(Error::NotInitialized)
        }
        CallState::Calling | CallState::Connected => Err(Error::InvalidState(format!(
            "Cannot place a call while {}",
            state
        ))),
    }
}
