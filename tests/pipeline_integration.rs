//! End-to-end negotiation scenarios against a real database file.
//!
//! Each test wires the orchestrator with scripted fakes for the external
//! collaborators (LLM, email, chat) and a sqlite database under a temp
//! directory, then exercises restarts by rebuilding the whole stack over
//! the same file.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dealbot_backend::chat::{AgreementPayload, ChatNotifier, EscalationPayload};
use dealbot_backend::domain::{Campaign, Deliverable, DeliverableType, InfluencerRow, Platform};
use dealbot_backend::email::{
    EmailTransport, InboundEmail, OutboundEmail, SendReceipt, ThreadMessage, ThreadMetadata,
    WatchStatus,
};
use dealbot_backend::llm::composer::{ComposeRequest, ComposedEmail, EmailComposer};
use dealbot_backend::llm::intent::{
    IntentClassification, IntentClassifier, IntentLabel, IntentRequest,
};
use dealbot_backend::negotiation::audit::{AuditKind, AuditLog};
use dealbot_backend::negotiation::ownership::OwnershipRegistry;
use dealbot_backend::negotiation::state_machine::NegotiationState;
use dealbot_backend::negotiation::store::{open_database, NegotiationStore};
use dealbot_backend::negotiation::triggers::{TriggerEngine, TriggerEngineConfig};
use dealbot_backend::{NegotiationOrchestrator, OrchestratorConfig, PipelineAction, Services};

// ---------------------------------------------------------------------------
// scripted collaborators
// ---------------------------------------------------------------------------

struct ScriptedIntent {
    queue: Mutex<Vec<IntentClassification>>,
}

impl ScriptedIntent {
    fn new(script: Vec<IntentClassification>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(script),
        })
    }
}

fn intent(label: IntentLabel, confidence: f64, rate: Option<Decimal>) -> IntentClassification {
    IntentClassification {
        intent: label,
        confidence,
        proposed_rate: rate,
        evidence_quote: None,
    }
}

#[async_trait]
impl IntentClassifier for ScriptedIntent {
    async fn classify(&self, _request: &IntentRequest) -> anyhow::Result<IntentClassification> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            anyhow::bail!("intent script exhausted");
        }
        Ok(queue.remove(0))
    }
}

struct TemplateComposer;

#[async_trait]
impl EmailComposer for TemplateComposer {
    async fn compose(&self, request: &ComposeRequest) -> anyhow::Result<ComposedEmail> {
        Ok(ComposedEmail {
            subject: format!("Re: {}", request.subject),
            body: format!(
                "Hi {}! We can do ${} for one {}. Hope that works.",
                request.influencer_name,
                dealbot_backend::domain::format_money(request.our_rate),
                request.deliverable_term,
            ),
        })
    }
}

#[derive(Default)]
struct RecordingEmail {
    sent: Mutex<Vec<OutboundEmail>>,
    fail_send: AtomicBool,
}

#[async_trait]
impl EmailTransport for RecordingEmail {
    async fn send(&self, outbound: &OutboundEmail) -> anyhow::Result<SendReceipt> {
        if self.fail_send.load(Ordering::SeqCst) {
            anyhow::bail!("smtp down");
        }
        let mut sent = self.sent.lock();
        sent.push(outbound.clone());
        Ok(SendReceipt {
            thread_id: outbound
                .thread_id
                .clone()
                .unwrap_or_else(|| format!("thread-{}", sent.len())),
            message_id: format!("<out-{}@mail>", sent.len()),
        })
    }

    async fn fetch_inbound(&self, _token: Option<&str>) -> anyhow::Result<Vec<InboundEmail>> {
        Ok(Vec::new())
    }

    async fn get_thread_metadata(&self, _thread_id: &str) -> anyhow::Result<ThreadMetadata> {
        Ok(ThreadMetadata {
            messages: vec![
                ThreadMessage {
                    from: "Deals Team <deals@agency.com>".into(),
                    message_id: "<m0@mail>".into(),
                },
                ThreadMessage {
                    from: "Jamie Rivers <jamie@example.com>".into(),
                    message_id: "<m1@mail>".into(),
                },
            ],
        })
    }

    async fn setup_watch(&self, _topic: &str) -> anyhow::Result<WatchStatus> {
        Ok(WatchStatus {
            expiration_timestamp: Utc::now().timestamp() + 604_800,
        })
    }
}

#[derive(Default)]
struct RecordingChat {
    escalations: Mutex<Vec<EscalationPayload>>,
    agreements: Mutex<Vec<AgreementPayload>>,
}

#[async_trait]
impl ChatNotifier for RecordingChat {
    async fn post_escalation(&self, payload: &EscalationPayload) -> anyhow::Result<Option<String>> {
        self.escalations.lock().push(payload.clone());
        Ok(Some("1.1".into()))
    }

    async fn post_agreement(&self, payload: &AgreementPayload) -> anyhow::Result<Option<String>> {
        self.agreements.lock().push(payload.clone());
        Ok(Some("1.2".into()))
    }

    async fn post_message(&self, _text: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// stack assembly
// ---------------------------------------------------------------------------

struct Stack {
    orchestrator: NegotiationOrchestrator,
    store: NegotiationStore,
    audit: AuditLog,
    email: Arc<RecordingEmail>,
    chat: Arc<RecordingChat>,
}

fn build_stack(db_path: &Path, intent_script: Vec<IntentClassification>) -> Stack {
    let conn = open_database(db_path).unwrap();
    let store = NegotiationStore::new(conn.clone());
    let audit = AuditLog::new(conn).unwrap();
    let email = Arc::new(RecordingEmail::default());
    let chat = Arc::new(RecordingChat::default());
    let orchestrator = NegotiationOrchestrator::new(Services {
        store: store.clone(),
        audit: audit.clone(),
        triggers: TriggerEngine::new(TriggerEngineConfig::default(), None),
        intent: ScriptedIntent::new(intent_script),
        composer: Arc::new(TemplateComposer),
        email: email.clone(),
        chat: chat.clone(),
        ownership: OwnershipRegistry::new(),
        config: OrchestratorConfig {
            agent_email: "deals@agency.com".into(),
            ..Default::default()
        },
    });
    orchestrator.recover().unwrap();
    Stack {
        orchestrator,
        store,
        audit,
        email,
        chat,
    }
}

fn campaign() -> Campaign {
    Campaign {
        campaign_id: "cmp-1".into(),
        name: "Summer Reels".into(),
        client_name: "Acme".into(),
        target_min_cpm: dec!(20),
        target_max_cpm: dec!(30),
        total_influencers: 3,
        deliverable: Deliverable::new(Platform::Instagram, DeliverableType::InstagramReel).unwrap(),
        mention_users: vec!["U123".into()],
    }
}

fn influencer() -> InfluencerRow {
    InfluencerRow {
        name: "Jamie Rivers".into(),
        email: "jamie@example.com".into(),
        platform: Platform::Instagram,
        handle: "@jamierivers".into(),
        average_views: 100_000,
        min_rate: dec!(1500),
        max_rate: dec!(3000),
        engagement_rate: Some(0.05),
    }
}

fn reply(thread_id: &str, message_id: &str, body: &str) -> InboundEmail {
    InboundEmail {
        thread_id: thread_id.into(),
        message_id: message_id.into(),
        from_email: "jamie@example.com".into(),
        subject: "Re: Partnership with Acme".into(),
        body_text: body.into(),
        received_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_negotiation_survives_a_restart_between_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("negotiations.db");

    // session one: outreach plus a counter round
    let thread_id = {
        let stack = build_stack(
            &db,
            vec![intent(IntentLabel::Counter, 0.9, Some(dec!(2600)))],
        );
        let thread_id = stack
            .orchestrator
            .start_negotiation(&campaign(), &influencer())
            .await
            .unwrap();

        let outcome = stack
            .orchestrator
            .handle_inbound(&reply(&thread_id, "<r1@mail>", "I'd need $2,600 for a reel"))
            .await;
        assert_eq!(outcome.action, PipelineAction::Send);
        assert_eq!(stack.email.sent.lock().len(), 2); // outreach + counter
        thread_id
    };

    // session two: a fresh process over the same file picks the thread up
    let stack = build_stack(&db, vec![intent(IntentLabel::Accept, 0.96, Some(dec!(2000)))]);
    assert_eq!(stack.orchestrator.active_count(), 1);

    let loaded = stack.store.load(&thread_id).unwrap().unwrap();
    assert_eq!(loaded.state, NegotiationState::CounterSent);
    assert_eq!(loaded.round_count, 1);
    assert_eq!(loaded.context.our_rate, dec!(2000.00));

    let outcome = stack
        .orchestrator
        .handle_inbound(&reply(&thread_id, "<r2@mail>", "Deal, $2,000 works"))
        .await;
    assert_eq!(outcome.action, PipelineAction::Accept);

    let finished = stack.store.load(&thread_id).unwrap().unwrap();
    assert_eq!(finished.state, NegotiationState::Agreed);
    assert_eq!(finished.cpm_tracker.agreements.len(), 1);
    assert_eq!(finished.cpm_tracker.agreements[0].cpm, dec!(20.00));

    let agreements = stack.chat.agreements.lock();
    assert_eq!(agreements.len(), 1);
    assert_eq!(agreements[0].agreed_rate, dec!(2000));
    assert_eq!(agreements[0].mention_users, vec!["U123".to_string()]);

    // the audit trail covers outreach, both replies, the counter, and the deal
    let trail = stack.audit.by_influencer("Jamie Rivers", 50).unwrap();
    assert!(trail.iter().any(|e| e.kind == AuditKind::Sent));
    assert!(trail.iter().any(|e| e.kind == AuditKind::Received));
    assert!(trail.iter().any(|e| e.kind == AuditKind::Agreement));

    // terminal threads are not recovered by yet another restart
    let stack = build_stack(&db, vec![]);
    assert_eq!(stack.orchestrator.active_count(), 0);
}

#[tokio::test]
async fn crash_between_saves_replays_without_double_send() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("negotiations.db");

    // session one: the send fails after the pre-send save commits, which is
    // observationally the same database state as a crash right before
    // dispatch
    let thread_id = {
        let stack = build_stack(
            &db,
            vec![intent(IntentLabel::Counter, 0.9, Some(dec!(2600)))],
        );
        let thread_id = stack
            .orchestrator
            .start_negotiation(&campaign(), &influencer())
            .await
            .unwrap();
        stack.email.fail_send.store(true, Ordering::SeqCst);
        let outcome = stack
            .orchestrator
            .handle_inbound(&reply(&thread_id, "<r1@mail>", "I'd need $2,600"))
            .await;
        assert_eq!(outcome.action, PipelineAction::Error);

        let on_disk = stack.store.load(&thread_id).unwrap().unwrap();
        assert_eq!(on_disk.state, NegotiationState::CounterReceived);
        assert_eq!(on_disk.round_count, 0);
        // the reply is not marked processed, so redelivery will re-run
        assert_ne!(on_disk.context.last_message_id.as_deref(), Some("<r1@mail>"));
        thread_id
    };

    // session two: restart, at-least-once redelivery of the same message
    let stack = build_stack(
        &db,
        vec![intent(IntentLabel::Counter, 0.9, Some(dec!(2600)))],
    );
    let outcome = stack
        .orchestrator
        .handle_inbound(&reply(&thread_id, "<r1@mail>", "I'd need $2,600"))
        .await;
    assert_eq!(outcome.action, PipelineAction::Send);

    let on_disk = stack.store.load(&thread_id).unwrap().unwrap();
    assert_eq!(on_disk.state, NegotiationState::CounterSent);
    assert_eq!(on_disk.round_count, 1);
    assert_eq!(on_disk.context.last_message_id.as_deref(), Some("<r1@mail>"));
    // exactly one counter went out across both sessions
    assert_eq!(stack.email.sent.lock().len(), 1);

    // and a second redelivery after success is recognized as already done
    let outcome = stack
        .orchestrator
        .handle_inbound(&reply(&thread_id, "<r1@mail>", "I'd need $2,600"))
        .await;
    assert_eq!(outcome.action, PipelineAction::Skip);
    assert_eq!(outcome.reason, "duplicate_inbound");
    assert_eq!(stack.email.sent.lock().len(), 1);
}

#[tokio::test]
async fn over_ceiling_counter_escalates_and_stays_escalated_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("negotiations.db");

    let thread_id = {
        let stack = build_stack(
            &db,
            // 50k views, $1,800 ask -> $36 CPM, over the $30 ceiling
            vec![intent(IntentLabel::Counter, 0.92, Some(dec!(1800)))],
        );
        let mut low_views = influencer();
        low_views.average_views = 50_000;
        let thread_id = stack
            .orchestrator
            .start_negotiation(&campaign(), &low_views)
            .await
            .unwrap();
        let outcome = stack
            .orchestrator
            .handle_inbound(&reply(&thread_id, "<r1@mail>", "I need $1,800"))
            .await;
        assert_eq!(outcome.action, PipelineAction::Escalate);
        let escalations = stack.chat.escalations.lock();
        assert!(escalations[0]
            .escalation_reason
            .contains("implies $36.00 CPM, exceeds $30.00 ceiling"));
        thread_id
    };

    // escalated threads stay live after a restart, waiting for a human
    let stack = build_stack(&db, vec![]);
    assert_eq!(stack.orchestrator.active_count(), 1);
    assert_eq!(
        stack.store.load(&thread_id).unwrap().unwrap().state,
        NegotiationState::Escalated
    );
}
