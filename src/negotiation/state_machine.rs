//! Negotiation lifecycle state machine.
//!
//! A closed transition table defines every legal `(state, event)` pair;
//! anything else is an `InvalidTransitionError` and leaves the machine
//! untouched. Mutation happens only through [`NegotiationStateMachine::trigger`],
//! which appends the `(from, event, to)` triple to the history before
//! returning. Restart recovery reconstructs a machine at a given state with
//! [`NegotiationStateMachine::from_snapshot`] without replaying events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    InitialOffer,
    AwaitingReply,
    CounterReceived,
    CounterSent,
    Agreed,
    Rejected,
    Escalated,
    Stale,
}

impl NegotiationState {
    pub const ALL: [NegotiationState; 8] = [
        NegotiationState::InitialOffer,
        NegotiationState::AwaitingReply,
        NegotiationState::CounterReceived,
        NegotiationState::CounterSent,
        NegotiationState::Agreed,
        NegotiationState::Rejected,
        NegotiationState::Escalated,
        NegotiationState::Stale,
    ];

    /// Terminal states accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Agreed | NegotiationState::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationState::InitialOffer => "initial_offer",
            NegotiationState::AwaitingReply => "awaiting_reply",
            NegotiationState::CounterReceived => "counter_received",
            NegotiationState::CounterSent => "counter_sent",
            NegotiationState::Agreed => "agreed",
            NegotiationState::Rejected => "rejected",
            NegotiationState::Escalated => "escalated",
            NegotiationState::Stale => "stale",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NegotiationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NegotiationState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown negotiation state: {s:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationEvent {
    SendOffer,
    ReceiveReply,
    Timeout,
    SendCounter,
    Accept,
    Reject,
    Escalate,
    ResumeCounter,
}

impl NegotiationEvent {
    pub const ALL: [NegotiationEvent; 8] = [
        NegotiationEvent::SendOffer,
        NegotiationEvent::ReceiveReply,
        NegotiationEvent::Timeout,
        NegotiationEvent::SendCounter,
        NegotiationEvent::Accept,
        NegotiationEvent::Reject,
        NegotiationEvent::Escalate,
        NegotiationEvent::ResumeCounter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiationEvent::SendOffer => "send_offer",
            NegotiationEvent::ReceiveReply => "receive_reply",
            NegotiationEvent::Timeout => "timeout",
            NegotiationEvent::SendCounter => "send_counter",
            NegotiationEvent::Accept => "accept",
            NegotiationEvent::Reject => "reject",
            NegotiationEvent::Escalate => "escalate",
            NegotiationEvent::ResumeCounter => "resume_counter",
        }
    }
}

impl fmt::Display for NegotiationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied transition, serialized as `[from, event, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition(pub NegotiationState, pub NegotiationEvent, pub NegotiationState);

impl Transition {
    pub fn from_state(&self) -> NegotiationState {
        self.0
    }

    pub fn event(&self) -> NegotiationEvent {
        self.1
    }

    pub fn to_state(&self) -> NegotiationState {
        self.2
    }
}

/// The complete set of legal transitions. Closed table: pairs absent here
/// are invalid, full stop.
const TRANSITIONS: &[(NegotiationState, NegotiationEvent, NegotiationState)] = &[
    (
        NegotiationState::InitialOffer,
        NegotiationEvent::SendOffer,
        NegotiationState::AwaitingReply,
    ),
    (
        NegotiationState::AwaitingReply,
        NegotiationEvent::ReceiveReply,
        NegotiationState::CounterReceived,
    ),
    (
        NegotiationState::AwaitingReply,
        NegotiationEvent::Timeout,
        NegotiationState::Stale,
    ),
    (
        NegotiationState::CounterReceived,
        NegotiationEvent::SendCounter,
        NegotiationState::CounterSent,
    ),
    (
        NegotiationState::CounterReceived,
        NegotiationEvent::Accept,
        NegotiationState::Agreed,
    ),
    (
        NegotiationState::CounterReceived,
        NegotiationEvent::Reject,
        NegotiationState::Rejected,
    ),
    (
        NegotiationState::CounterReceived,
        NegotiationEvent::Escalate,
        NegotiationState::Escalated,
    ),
    (
        NegotiationState::CounterSent,
        NegotiationEvent::ReceiveReply,
        NegotiationState::CounterReceived,
    ),
    (
        NegotiationState::CounterSent,
        NegotiationEvent::Timeout,
        NegotiationState::Stale,
    ),
    (
        NegotiationState::Escalated,
        NegotiationEvent::ResumeCounter,
        NegotiationState::CounterSent,
    ),
    (
        NegotiationState::Escalated,
        NegotiationEvent::Reject,
        NegotiationState::Rejected,
    ),
    (
        NegotiationState::Stale,
        NegotiationEvent::ReceiveReply,
        NegotiationState::CounterReceived,
    ),
    (
        NegotiationState::Stale,
        NegotiationEvent::Reject,
        NegotiationState::Rejected,
    ),
];

fn lookup(state: NegotiationState, event: NegotiationEvent) -> Option<NegotiationState> {
    TRANSITIONS
        .iter()
        .find(|(from, ev, _)| *from == state && *ev == event)
        .map(|(_, _, to)| *to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransitionError {
    pub state: NegotiationState,
    pub event: NegotiationEvent,
}

impl fmt::Display for InvalidTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event {} is not valid in state {}",
            self.event, self.state
        )
    }
}

impl std::error::Error for InvalidTransitionError {}

/// Current state plus the append-only history of applied transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationStateMachine {
    state: NegotiationState,
    history: Vec<Transition>,
}

impl NegotiationStateMachine {
    /// A fresh negotiation starts at the initial offer.
    pub fn new() -> Self {
        Self {
            state: NegotiationState::InitialOffer,
            history: Vec::new(),
        }
    }

    /// Reconstruct a machine at `state` with a pre-populated history.
    /// Used by restart recovery; no events are replayed.
    pub fn from_snapshot(state: NegotiationState, history: Vec<Transition>) -> Self {
        Self { state, history }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Apply an event. On success the `(from, event, to)` triple is appended
    /// to the history and the new state is returned; on failure the machine
    /// is unchanged.
    pub fn trigger(
        &mut self,
        event: NegotiationEvent,
    ) -> Result<NegotiationState, InvalidTransitionError> {
        let to = lookup(self.state, event).ok_or(InvalidTransitionError {
            state: self.state,
            event,
        })?;
        self.history.push(Transition(self.state, event, to));
        self.state = to;
        Ok(to)
    }

    /// Events valid from the current state, lexicographically sorted so
    /// downstream decisions see a deterministic order.
    pub fn valid_events(&self) -> Vec<NegotiationEvent> {
        let mut events: Vec<NegotiationEvent> = TRANSITIONS
            .iter()
            .filter(|(from, _, _)| *from == self.state)
            .map(|(_, ev, _)| *ev)
            .collect();
        events.sort_by_key(|ev| ev.as_str());
        events
    }
}

impl Default for NegotiationStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
