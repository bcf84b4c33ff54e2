//! Store and audit-log tests against real sqlite files.

use super::audit::{AuditEntry, AuditKind, AuditLog};
use super::context::{CampaignCpmTracker, NegotiationContext, NegotiationSnapshot};
use super::state_machine::{NegotiationEvent, NegotiationState, NegotiationStateMachine, Transition};
use super::store::{open_database, NegotiationStore, StoreError};
use crate::domain::{Campaign, Deliverable, DeliverableType, InfluencerRow, Platform};
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;

fn campaign() -> Campaign {
    Campaign {
        campaign_id: "cmp-1".into(),
        name: "Summer Reels".into(),
        client_name: "Acme".into(),
        target_min_cpm: dec!(20),
        target_max_cpm: dec!(30),
        total_influencers: 5,
        deliverable: Deliverable::new(Platform::Instagram, DeliverableType::InstagramReel).unwrap(),
        mention_users: vec![],
    }
}

fn influencer() -> InfluencerRow {
    InfluencerRow {
        name: "Jamie Rivers".into(),
        email: "jamie@example.com".into(),
        platform: Platform::Instagram,
        handle: "@jamierivers".into(),
        average_views: 50_000,
        min_rate: dec!(1000),
        max_rate: dec!(1500),
        engagement_rate: Some(0.045),
    }
}

fn snapshot(thread_id: &str, state: NegotiationState) -> NegotiationSnapshot {
    let campaign = campaign();
    let now = Utc::now();
    NegotiationSnapshot {
        thread_id: thread_id.into(),
        state,
        round_count: 0,
        context: NegotiationContext {
            influencer: influencer(),
            subject: "Partnership with Acme".into(),
            our_rate: dec!(1000.00),
            their_last_rate: Some(dec!(1200.50)),
            last_message_id: Some("msg-1".into()),
        },
        cpm_tracker: CampaignCpmTracker::new(&campaign),
        campaign,
        history: vec![Transition(
            NegotiationState::InitialOffer,
            NegotiationEvent::SendOffer,
            NegotiationState::AwaitingReply,
        )],
        created_at: now,
        updated_at: now,
    }
}

fn temp_store() -> (tempfile::TempDir, NegotiationStore, AuditLog) {
    let dir = tempfile::tempdir().unwrap();
    let conn = open_database(dir.path().join("negotiations.db")).unwrap();
    let store = NegotiationStore::new(conn.clone());
    let audit = AuditLog::new(conn).unwrap();
    (dir, store, audit)
}

#[test]
fn snapshot_round_trips_component_wise() {
    let (_dir, store, _) = temp_store();
    let original = snapshot("thread-1", NegotiationState::AwaitingReply);
    store.save(&original).unwrap();

    let loaded = store.load("thread-1").unwrap().unwrap();
    assert_eq!(loaded.thread_id, original.thread_id);
    assert_eq!(loaded.state, original.state);
    assert_eq!(loaded.round_count, original.round_count);
    assert_eq!(loaded.context, original.context);
    assert_eq!(loaded.campaign, original.campaign);
    assert_eq!(loaded.cpm_tracker, original.cpm_tracker);
    assert_eq!(loaded.history, original.history);
    // decimals survive exactly, including trailing zeros
    assert_eq!(loaded.context.our_rate, dec!(1000.00));
    assert_eq!(loaded.context.their_last_rate, Some(dec!(1200.50)));
}

#[test]
fn save_is_an_upsert_preserving_created_at() {
    let (_dir, store, _) = temp_store();
    let mut snap = snapshot("thread-1", NegotiationState::AwaitingReply);
    store.save(&snap).unwrap();
    let created = store.load("thread-1").unwrap().unwrap().created_at;

    snap.state = NegotiationState::CounterReceived;
    snap.round_count = 1;
    snap.created_at = snap.created_at + Duration::hours(6);
    snap.updated_at = Utc::now() + Duration::hours(6);
    store.save(&snap).unwrap();

    let loaded = store.load("thread-1").unwrap().unwrap();
    assert_eq!(loaded.state, NegotiationState::CounterReceived);
    assert_eq!(loaded.round_count, 1);
    assert_eq!(loaded.created_at, created);
    assert_ne!(loaded.updated_at, loaded.created_at);
}

#[test]
fn save_twice_is_observationally_idempotent() {
    let (_dir, store, _) = temp_store();
    let snap = snapshot("thread-1", NegotiationState::CounterSent);
    store.save(&snap).unwrap();
    let first = store.load("thread-1").unwrap().unwrap();
    store.save(&snap).unwrap();
    let second = store.load("thread-1").unwrap().unwrap();
    assert_eq!(first, second);
}

#[test]
fn load_active_filters_terminal_states() {
    let (_dir, store, _) = temp_store();
    store
        .save(&snapshot("t-awaiting", NegotiationState::AwaitingReply))
        .unwrap();
    store
        .save(&snapshot("t-countered", NegotiationState::CounterSent))
        .unwrap();
    store
        .save(&snapshot("t-escalated", NegotiationState::Escalated))
        .unwrap();
    store
        .save(&snapshot("t-stale", NegotiationState::Stale))
        .unwrap();
    store
        .save(&snapshot("t-agreed", NegotiationState::Agreed))
        .unwrap();
    store
        .save(&snapshot("t-rejected", NegotiationState::Rejected))
        .unwrap();

    let active = store.load_active().unwrap();
    let mut ids: Vec<&str> = active.iter().map(|s| s.thread_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["t-awaiting", "t-countered", "t-escalated", "t-stale"]);
    assert!(active.iter().all(|s| s.is_active()));
}

#[test]
fn recovery_reconstructs_machine_without_replay() {
    let (_dir, store, _) = temp_store();
    store
        .save(&snapshot("thread-9", NegotiationState::CounterSent))
        .unwrap();

    let loaded = store.load("thread-9").unwrap().unwrap();
    let machine = NegotiationStateMachine::from_snapshot(loaded.state, loaded.history.clone());
    assert_eq!(machine.state(), NegotiationState::CounterSent);
    assert_eq!(machine.history(), loaded.history.as_slice());
}

#[test]
fn corrupt_payload_fails_loudly() {
    let (_dir, store, _) = temp_store();
    let snap = snapshot("thread-bad", NegotiationState::AwaitingReply);
    store.save(&snap).unwrap();

    // sabotage the context payload behind the store's back
    {
        let conn = rusqlite::Connection::open(_dir.path().join("negotiations.db")).unwrap();
        conn.execute(
            "UPDATE negotiation_state SET context_json = '{\"not\": \"a context\"}'
             WHERE thread_id = 'thread-bad'",
            [],
        )
        .unwrap();
    }

    match store.load("thread-bad") {
        Err(StoreError::Corrupt { thread_id, .. }) => assert_eq!(thread_id, "thread-bad"),
        other => panic!("expected Corrupt error, got {other:?}"),
    }
}

#[test]
fn delete_removes_row() {
    let (_dir, store, _) = temp_store();
    store
        .save(&snapshot("thread-del", NegotiationState::Agreed))
        .unwrap();
    assert!(store.delete("thread-del").unwrap());
    assert!(store.load("thread-del").unwrap().is_none());
    assert!(!store.delete("thread-del").unwrap());
}

#[test]
fn metadata_round_trip() {
    let (_dir, store, _) = temp_store();
    assert_eq!(store.get_metadata("watch_expiration").unwrap(), None);
    store.set_metadata("watch_expiration", "1735689600").unwrap();
    assert_eq!(
        store.get_metadata("watch_expiration").unwrap().as_deref(),
        Some("1735689600")
    );
    store.set_metadata("watch_expiration", "1735776000").unwrap();
    assert_eq!(
        store.get_metadata("watch_expiration").unwrap().as_deref(),
        Some("1735776000")
    );
}

#[test]
fn audit_entries_query_by_influencer_campaign_and_date() {
    let (_dir, _store, audit) = temp_store();

    let received = AuditEntry::new(
        AuditKind::Received,
        Some("cmp-1".into()),
        "Jamie Rivers",
        "thread-1",
        NegotiationState::CounterReceived,
        "I can do $1,200 for the reel",
    );
    audit.record(&received).unwrap();
    audit
        .record(&AuditEntry::new(
            AuditKind::Sent,
            Some("cmp-1".into()),
            "Jamie Rivers",
            "thread-1",
            NegotiationState::CounterSent,
            "We can offer $1,000.00 for one Instagram reel",
        ))
        .unwrap();
    audit
        .record(&AuditEntry::new(
            AuditKind::Escalation,
            Some("cmp-2".into()),
            "Alex Stone",
            "thread-2",
            NegotiationState::Escalated,
            "implies $36.00 CPM, exceeds $30.00 ceiling",
        ))
        .unwrap();

    let jamie = audit.by_influencer("Jamie Rivers", 10).unwrap();
    assert_eq!(jamie.len(), 2);
    assert!(jamie.iter().all(|e| e.influencer_name == "Jamie Rivers"));

    let cmp2 = audit.by_campaign("cmp-2", 10).unwrap();
    assert_eq!(cmp2.len(), 1);
    assert_eq!(cmp2[0].kind, AuditKind::Escalation);

    let now = Utc::now();
    let today = audit
        .by_date_range(now - Duration::hours(1), now + Duration::hours(1), 10)
        .unwrap();
    assert_eq!(today.len(), 3);
    let none = audit
        .by_date_range(now - Duration::days(7), now - Duration::days(6), 10)
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn audit_snippet_is_bounded() {
    let long_body = "x".repeat(2000);
    let entry = AuditEntry::new(
        AuditKind::Received,
        None,
        "Jamie Rivers",
        "thread-1",
        NegotiationState::CounterReceived,
        &long_body,
    );
    assert_eq!(entry.payload_snippet.chars().count(), 500);
}
