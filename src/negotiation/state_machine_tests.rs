//! State machine transition-table tests: every legal edge, every illegal
//! pair, terminal behavior, and snapshot reconstruction.

use super::state_machine::*;

fn machine_at(state: NegotiationState) -> NegotiationStateMachine {
    NegotiationStateMachine::from_snapshot(state, Vec::new())
}

const LEGAL: &[(NegotiationState, NegotiationEvent, NegotiationState)] = &[
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

#[test]
fn every_legal_transition_applies_and_is_recorded() {
    for &(from, event, to) in LEGAL {
        let mut machine = machine_at(from);
        assert_eq!(machine.trigger(event).unwrap(), to);
        assert_eq!(machine.state(), to);
        assert_eq!(machine.history(), &[Transition(from, event, to)]);
    }
}

#[test]
fn every_illegal_pair_is_rejected_and_state_unchanged() {
    for from in NegotiationState::ALL {
        for event in NegotiationEvent::ALL {
            if LEGAL.iter().any(|&(f, e, _)| f == from && e == event) {
                continue;
            }
            let mut machine = machine_at(from);
            let err = machine.trigger(event).unwrap_err();
            assert_eq!(err, InvalidTransitionError { state: from, event });
            assert_eq!(machine.state(), from);
            assert!(machine.history().is_empty());
        }
    }
}

#[test]
fn terminal_states_reject_all_events() {
    for state in [NegotiationState::Agreed, NegotiationState::Rejected] {
        assert!(state.is_terminal());
        for event in NegotiationEvent::ALL {
            let mut machine = machine_at(state);
            assert!(machine.trigger(event).is_err());
        }
        assert!(machine_at(state).valid_events().is_empty());
    }
}

#[test]
fn valid_events_are_lexicographically_sorted() {
    let machine = machine_at(NegotiationState::CounterReceived);
    let events: Vec<&str> = machine.valid_events().iter().map(|e| e.as_str()).collect();
    assert_eq!(events, vec!["accept", "escalate", "reject", "send_counter"]);

    let machine = machine_at(NegotiationState::AwaitingReply);
    let events: Vec<&str> = machine.valid_events().iter().map(|e| e.as_str()).collect();
    assert_eq!(events, vec!["receive_reply", "timeout"]);
}

#[test]
fn full_negotiation_walk_accumulates_history() {
    let mut machine = NegotiationStateMachine::new();
    assert_eq!(machine.state(), NegotiationState::InitialOffer);

    machine.trigger(NegotiationEvent::SendOffer).unwrap();
    machine.trigger(NegotiationEvent::ReceiveReply).unwrap();
    machine.trigger(NegotiationEvent::SendCounter).unwrap();
    machine.trigger(NegotiationEvent::ReceiveReply).unwrap();
    machine.trigger(NegotiationEvent::Accept).unwrap();

    assert_eq!(machine.state(), NegotiationState::Agreed);
    assert_eq!(machine.history().len(), 5);
    assert_eq!(
        machine.history().last().copied(),
        Some(Transition(
            NegotiationState::CounterReceived,
            NegotiationEvent::Accept,
            NegotiationState::Agreed,
        ))
    );
}

#[test]
fn from_snapshot_restores_without_replay() {
    let history = vec![
        Transition(
            NegotiationState::InitialOffer,
            NegotiationEvent::SendOffer,
            NegotiationState::AwaitingReply,
        ),
        Transition(
            NegotiationState::AwaitingReply,
            NegotiationEvent::ReceiveReply,
            NegotiationState::CounterReceived,
        ),
    ];
    let machine =
        NegotiationStateMachine::from_snapshot(NegotiationState::CounterReceived, history.clone());
    assert_eq!(machine.state(), NegotiationState::CounterReceived);
    assert_eq!(machine.history(), history.as_slice());
}

#[test]
fn history_serializes_as_string_triples() {
    let mut machine = NegotiationStateMachine::new();
    machine.trigger(NegotiationEvent::SendOffer).unwrap();
    let json = serde_json::to_value(machine.history()).unwrap();
    assert_eq!(
        json,
        serde_json::json!([["initial_offer", "send_offer", "awaiting_reply"]])
    );
}
