//! Negotiation pipeline orchestrator.
//!
//! One invocation per inbound email. The pipeline runs pre-check gates
//! (ownership, human-reply detection, escalation triggers), classifies
//! intent, makes the deterministic pricing decision, composes and validates
//! a counter, and finishes with exactly one of six outcomes. Two rules are
//! load-bearing everywhere:
//!
//! * per-thread serialization: each thread id has its own async mutex, so
//!   pipelines for the same thread never interleave while distinct threads
//!   run in parallel;
//! * save-before-external-effect: no email, chat post, or result audit
//!   entry is emitted before the corresponding store save returns. The
//!   outbound dispatch sits between two saves so a crash at any point
//!   either replays the receive with no side effects or resumes with the
//!   counter already sent.

use crate::chat::{AgreementPayload, ChatNotifier, EscalationPayload};
use crate::domain::{format_money, quantize_cents, Campaign, InfluencerRow};
use crate::email::{takeover, EmailTransport, InboundEmail, OutboundEmail};
use crate::llm::composer::{ComposeRequest, ComposedEmail, EmailComposer};
use crate::llm::intent::{IntentClassification, IntentClassifier, IntentLabel, IntentRequest};
use crate::negotiation::audit::{AuditEntry, AuditKind, AuditLog};
use crate::negotiation::context::{CampaignCpmTracker, NegotiationContext, NegotiationSnapshot};
use crate::negotiation::ownership::OwnershipRegistry;
use crate::negotiation::state_machine::{
    NegotiationEvent, NegotiationState, NegotiationStateMachine,
};
use crate::negotiation::store::NegotiationStore;
use crate::negotiation::triggers::{TriggerEngine, TriggerResult};
use crate::negotiation::validation;
use crate::pricing::{self, BoundaryResult, RateCard, RateCardBook, RatePreference};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address the agent sends from; anything else on a thread that is not
    /// the influencer means a human stepped in.
    pub agent_email: String,
    pub max_rounds: u32,
    pub intent_confidence_threshold: f64,
    /// Below this implied CPM a proposal reads as a possible
    /// misunderstanding rather than a hard lowball.
    pub low_rate_threshold: Decimal,
    /// Base URL for "open the thread" links in chat payloads.
    pub details_link_base: String,
    /// Playbook guidance passed through to the composer.
    pub compose_guidance: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_email: "deals@agency.invalid".into(),
            max_rounds: 5,
            intent_confidence_threshold: 0.70,
            low_rate_threshold: rust_decimal_macros::dec!(15),
            details_link_base: "https://mail.google.com/mail/u/0/#all".into(),
            compose_guidance: None,
        }
    }
}

/// Everything the pipeline touches, injected explicitly. Tests construct
/// this from fakes; nothing in the orchestrator reaches for globals.
pub struct Services {
    pub store: NegotiationStore,
    pub audit: AuditLog,
    pub triggers: TriggerEngine,
    pub intent: Arc<dyn IntentClassifier>,
    pub composer: Arc<dyn EmailComposer>,
    pub email: Arc<dyn EmailTransport>,
    pub chat: Arc<dyn ChatNotifier>,
    pub ownership: OwnershipRegistry,
    pub config: OrchestratorConfig,
}

/// One live negotiation, owned by its per-thread lock.
#[derive(Debug, Clone)]
pub struct LiveNegotiation {
    pub machine: NegotiationStateMachine,
    pub context: NegotiationContext,
    pub campaign: Campaign,
    pub cpm_tracker: CampaignCpmTracker,
    pub round_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LiveNegotiation {
    fn snapshot(&self, thread_id: &str) -> NegotiationSnapshot {
        NegotiationSnapshot {
            thread_id: thread_id.to_string(),
            state: self.machine.state(),
            round_count: self.round_count,
            context: self.context.clone(),
            campaign: self.campaign.clone(),
            cpm_tracker: self.cpm_tracker.clone(),
            history: self.machine.history().to_vec(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn from_snapshot(snapshot: NegotiationSnapshot) -> Self {
        Self {
            machine: NegotiationStateMachine::from_snapshot(snapshot.state, snapshot.history),
            context: snapshot.context,
            campaign: snapshot.campaign,
            cpm_tracker: snapshot.cpm_tracker,
            round_count: snapshot.round_count,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineAction {
    Send,
    Accept,
    Reject,
    Escalate,
    Skip,
    Error,
}

impl fmt::Display for PipelineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Send => "send",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Escalate => "escalate",
            Self::Skip => "skip",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub action: PipelineAction,
    pub reason: String,
    pub triggers: Vec<TriggerResult>,
    pub draft: Option<ComposedEmail>,
}

impl PipelineOutcome {
    fn skip(reason: impl Into<String>) -> Self {
        Self {
            action: PipelineAction::Skip,
            reason: reason.into(),
            triggers: Vec::new(),
            draft: None,
        }
    }

    fn error(reason: impl Into<String>) -> Self {
        Self {
            action: PipelineAction::Error,
            reason: reason.into(),
            triggers: Vec::new(),
            draft: None,
        }
    }

    fn terminal(action: PipelineAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
            triggers: Vec::new(),
            draft: None,
        }
    }
}

pub struct NegotiationOrchestrator {
    services: Services,
    live: RwLock<HashMap<String, Arc<Mutex<LiveNegotiation>>>>,
}

impl NegotiationOrchestrator {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            live: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Rebuild the in-memory map from the store. Part of startup; a failure
    /// here is fatal to the process.
    pub fn recover(&self) -> Result<usize, crate::negotiation::store::StoreError> {
        let snapshots = self.services.store.load_active()?;
        let mut live = self.live.write();
        live.clear();
        for snapshot in snapshots {
            let thread_id = snapshot.thread_id.clone();
            live.insert(
                thread_id,
                Arc::new(Mutex::new(LiveNegotiation::from_snapshot(snapshot))),
            );
        }
        info!(count = live.len(), "♻️  Recovered active negotiations");
        Ok(live.len())
    }

    pub fn active_count(&self) -> usize {
        self.live.read().len()
    }

    /// Map a slash-command identifier (thread id or influencer name) to a
    /// live thread id.
    pub fn resolve_thread(&self, identifier: &str) -> Option<String> {
        let live = self.live.read();
        if live.contains_key(identifier) {
            return Some(identifier.to_string());
        }
        let needle = identifier.trim().to_lowercase();
        for (thread_id, entry) in live.iter() {
            if let Ok(negotiation) = entry.try_lock() {
                if negotiation.context.influencer.name.trim().to_lowercase() == needle {
                    return Some(thread_id.clone());
                }
            }
        }
        None
    }

    /// Open a new negotiation: floor-anchored initial offer, opening email,
    /// `send_offer` transition, save. The thread id comes from the
    /// transport's send receipt.
    pub async fn start_negotiation(
        &self,
        campaign: &Campaign,
        influencer: &InfluencerRow,
    ) -> anyhow::Result<String> {
        let card = RateCard::new(
            campaign.target_min_cpm,
            campaign.target_max_cpm,
            self.services.config.low_rate_threshold,
        );
        let pay_range = pricing::calculate_pay_range(influencer.average_views, &card)?;
        let initial_offer = pay_range.min_rate;
        let subject = format!("Partnership with {}", campaign.client_name);
        let term = campaign.deliverable.deliverable_type.display_term();
        let body = format!(
            "Hi {name},\n\n\
             We're putting together a campaign for {client} and love what you're doing on \
             {platform}. We'd like to book one {term} with you at ${rate}.\n\n\
             Would that work for you? Happy to answer any questions.\n\n\
             Best,\n{client} partnerships team",
            name = influencer.name,
            client = campaign.client_name,
            platform = influencer.platform,
            term = term,
            rate = format_money(initial_offer),
        );

        let receipt = self
            .services
            .email
            .send(&OutboundEmail {
                to: influencer.email.clone(),
                subject: subject.clone(),
                body: body.clone(),
                thread_id: None,
                in_reply_to: None,
                references: None,
            })
            .await?;

        let now = Utc::now();
        let mut machine = NegotiationStateMachine::new();
        machine.trigger(NegotiationEvent::SendOffer)?;
        let negotiation = LiveNegotiation {
            machine,
            context: NegotiationContext {
                influencer: influencer.clone(),
                subject,
                our_rate: initial_offer,
                their_last_rate: None,
                last_message_id: Some(receipt.message_id.clone()),
            },
            campaign: campaign.clone(),
            cpm_tracker: CampaignCpmTracker::new(campaign),
            round_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.services
            .store
            .save(&negotiation.snapshot(&receipt.thread_id))?;
        self.audit_quietly(AuditEntry::new(
            AuditKind::Sent,
            Some(campaign.campaign_id.clone()),
            influencer.name.clone(),
            receipt.thread_id.clone(),
            negotiation.machine.state(),
            &body,
        ));

        self.live.write().insert(
            receipt.thread_id.clone(),
            Arc::new(Mutex::new(negotiation)),
        );
        info!(
            thread_id = %receipt.thread_id,
            influencer = %influencer.name,
            offer = %format_money(initial_offer),
            "negotiation opened"
        );
        Ok(receipt.thread_id)
    }

    /// The per-email pipeline. Holds the thread's lock for the whole run.
    pub async fn handle_inbound(&self, inbound: &InboundEmail) -> PipelineOutcome {
        let entry = match self.live.read().get(&inbound.thread_id) {
            Some(entry) => entry.clone(),
            None => return PipelineOutcome::skip("no_active_negotiation"),
        };
        let mut live = entry.lock().await;
        let outcome = self.run_pipeline(&mut live, inbound).await;
        let terminal = live.machine.state().is_terminal();
        drop(live);
        // the live map only tracks active negotiations; the store keeps the
        // terminal row as the outcome record
        if terminal {
            self.live.write().remove(&inbound.thread_id);
        }
        outcome
    }

    async fn run_pipeline(
        &self,
        live: &mut LiveNegotiation,
        inbound: &InboundEmail,
    ) -> PipelineOutcome {
        let thread_id = inbound.thread_id.as_str();
        let campaign_id = live.campaign.campaign_id.clone();
        let influencer_name = live.context.influencer.name.clone();

        // duplicate redelivery of a message already fully processed
        if live.context.last_message_id.as_deref() == Some(inbound.message_id.as_str()) {
            return PipelineOutcome::skip("duplicate_inbound");
        }

        // step 1: audit receipt, intent not yet classified
        if let Err(e) = self.services.audit.record(&AuditEntry::new(
            AuditKind::Received,
            Some(campaign_id.clone()),
            influencer_name.clone(),
            thread_id,
            live.machine.state(),
            &inbound.body_text,
        )) {
            error!(thread_id, error = %e, "audit write failed, aborting pipeline");
            return PipelineOutcome::error("persistence_failure");
        }

        // step 2: ownership gate
        if self.services.ownership.is_human_managed(thread_id) {
            return PipelineOutcome::skip("human_managed");
        }

        // step 3: human-reply detection (silent handoff on hit)
        match self.services.email.get_thread_metadata(thread_id).await {
            Ok(metadata) => {
                if let Some(sender) = takeover::find_foreign_sender(
                    &metadata,
                    &self.services.config.agent_email,
                    &live.context.influencer.email,
                ) {
                    self.services.ownership.claim(thread_id, &sender);
                    self.audit_quietly(AuditEntry::new(
                        AuditKind::HumanTakeover,
                        Some(campaign_id),
                        influencer_name,
                        thread_id,
                        live.machine.state(),
                        &format!("human reply detected from {sender}"),
                    ));
                    return PipelineOutcome::skip("human_takeover_detected");
                }
            }
            Err(e) => {
                warn!(thread_id, error = %e, "thread metadata fetch failed");
                return PipelineOutcome::error("thread_metadata_unavailable");
            }
        }

        // Failure paths below must not leave a half-advanced machine in
        // memory: a redelivery has to find a state it can re-run from, so
        // every error outcome rolls the in-memory negotiation back here.
        // Saves that already committed stay committed; redelivery re-derives
        // and re-saves the same decisions.
        let checkpoint = live.clone();
        let outcome = self.run_decision(live, inbound).await;
        if outcome.action == PipelineAction::Error {
            *live = checkpoint;
        }
        outcome
    }

    /// Steps 4–8, always entered with the thread lock held.
    async fn run_decision(
        &self,
        live: &mut LiveNegotiation,
        inbound: &InboundEmail,
    ) -> PipelineOutcome {
        let thread_id = inbound.thread_id.as_str();

        // step 4: receive_reply transition. A thread already sitting in
        // counter_received is the crash-replay case: the reply was received
        // and saved, the counter never went out, so the pipeline resumes
        // from classification instead of transitioning again.
        if live.machine.state() != NegotiationState::CounterReceived {
            if let Err(e) = live.machine.trigger(NegotiationEvent::ReceiveReply) {
                return PipelineOutcome::error(format!("invalid_transition: {e}"));
            }
        }

        // step 5: deterministic pricing decision. Floor-anchored, plus the
        // campaign tracker's flexibility premium when engagement warrants.
        let views = live.context.influencer.average_views;
        let engagement = live.context.influencer.engagement_rate;
        let flexibility = live.cpm_tracker.get_flexibility(engagement);
        let book = RateCardBook::with_fallback(RateCard::new(
            live.campaign.target_min_cpm + flexibility,
            live.campaign.target_max_cpm,
            self.services.config.low_rate_threshold,
        ));
        let expected_rate = match pricing::calculate_deliverable_rate(
            &book,
            live.campaign.deliverable.deliverable_type,
            views,
            RatePreference::Floor,
        ) {
            Ok(rate) => rate,
            Err(e) => {
                return self
                    .escalate(
                        live,
                        thread_id,
                        format!("pricing failed: {e}"),
                        None,
                        None,
                        Vec::new(),
                        None,
                    )
                    .await;
            }
        };

        // step 6: trigger pre-check. Intent is deferred, so this runs with
        // proposed CPM 0 and the 0.0 confidence sentinel; only triggers
        // that do not depend on classification can fire here.
        let trigger_results = match self
            .services
            .triggers
            .evaluate(&inbound.body_text, Decimal::ZERO, 0.0)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!(thread_id, error = %e, "trigger evaluation failed");
                return PipelineOutcome::error("trigger_evaluation_failed");
            }
        };
        let fired: Vec<TriggerResult> =
            trigger_results.iter().filter(|t| t.fired).cloned().collect();
        if !fired.is_empty() {
            let reason = fired
                .iter()
                .filter_map(|t| t.reason.clone())
                .collect::<Vec<_>>()
                .join("; ");
            let evidence = fired.iter().find_map(|t| t.evidence.clone());
            return self
                .escalate(live, thread_id, reason, evidence, None, fired, None)
                .await;
        }

        // step 7: intent classification, single call
        let request = IntentRequest {
            email_body: inbound.body_text.clone(),
            influencer_name: live.context.influencer.name.clone(),
            our_rate: live.context.our_rate,
            deliverable_term: live
                .campaign
                .deliverable
                .deliverable_type
                .display_term()
                .to_string(),
        };
        let mut classification = match self.services.intent.classify(&request).await {
            Ok(c) => c,
            Err(e) => {
                warn!(thread_id, error = %e, "intent classification failed");
                return PipelineOutcome::error("intent_classification_failed");
            }
        };
        if classification.confidence < self.services.config.intent_confidence_threshold {
            classification.intent = IntentLabel::Ambiguous;
        }

        // step 8: branch on intent
        match classification.intent {
            IntentLabel::Accept => self.settle_accept(live, thread_id, &classification).await,
            IntentLabel::Reject => self.settle_reject(live, thread_id, &classification).await,
            IntentLabel::Ambiguous
            | IntentLabel::HostileTone
            | IntentLabel::LegalLanguage
            | IntentLabel::UnusualDeliverables => {
                self.escalate(
                    live,
                    thread_id,
                    format!(
                        "intent {} (confidence {:.2})",
                        classification.intent, classification.confidence
                    ),
                    classification.evidence_quote.clone(),
                    classification.proposed_rate,
                    Vec::new(),
                    None,
                )
                .await
            }
            IntentLabel::Counter => {
                self.continue_counter(live, inbound, expected_rate, &classification)
                    .await
            }
        }
    }

    /// Steps 9–15: round cap, rate boundary, compose, validate, the
    /// persist/dispatch/persist bracket.
    async fn continue_counter(
        &self,
        live: &mut LiveNegotiation,
        inbound: &InboundEmail,
        expected_rate: Decimal,
        classification: &IntentClassification,
    ) -> PipelineOutcome {
        let thread_id = inbound.thread_id.as_str();

        // step 9: round cap before any further LLM spend
        if live.round_count >= self.services.config.max_rounds {
            return self
                .escalate(
                    live,
                    thread_id,
                    format!(
                        "round cap reached ({} rounds), still countering",
                        live.round_count
                    ),
                    classification.evidence_quote.clone(),
                    classification.proposed_rate,
                    Vec::new(),
                    None,
                )
                .await;
        }

        // step 10: rate boundary on their proposal
        let Some(proposed_rate) = classification.proposed_rate else {
            return self
                .escalate(
                    live,
                    thread_id,
                    "counter without a stated rate".to_string(),
                    classification.evidence_quote.clone(),
                    None,
                    Vec::new(),
                    None,
                )
                .await;
        };
        let card = RateCard::new(
            live.campaign.target_min_cpm,
            live.campaign.target_max_cpm,
            self.services.config.low_rate_threshold,
        );
        let views = live.context.influencer.average_views;
        let verdict = match pricing::evaluate_proposed_rate(proposed_rate, views, &card) {
            Ok(v) => v,
            Err(e) => {
                return self
                    .escalate(
                        live,
                        thread_id,
                        format!("pricing failed on proposal: {e}"),
                        None,
                        Some(proposed_rate),
                        Vec::new(),
                        None,
                    )
                    .await;
            }
        };
        if verdict.should_escalate {
            let reason = verdict
                .warning
                .clone()
                .unwrap_or_else(|| format!("boundary {}", verdict.boundary));
            return self
                .escalate(
                    live,
                    thread_id,
                    reason,
                    classification.evidence_quote.clone(),
                    Some(proposed_rate),
                    Vec::new(),
                    None,
                )
                .await;
        }
        if verdict.boundary == BoundaryResult::SuspiciouslyLow {
            if let Some(warning) = &verdict.warning {
                warn!(thread_id, warning = %warning, "suspiciously low proposal");
            }
        }

        // step 11: compose the counter at the authoritative rate
        let compose_request = ComposeRequest {
            influencer_name: live.context.influencer.name.clone(),
            client_name: live.campaign.client_name.clone(),
            deliverable_term: live
                .campaign
                .deliverable
                .deliverable_type
                .display_term()
                .to_string(),
            our_rate: expected_rate,
            their_rate: Some(proposed_rate),
            subject: live.context.subject.clone(),
            round_count: live.round_count,
            guidance: self.services.config.compose_guidance.clone(),
        };
        let draft = match self.services.composer.compose(&compose_request).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!(thread_id, error = %e, "composer failed");
                return PipelineOutcome::error("composer_failed");
            }
        };

        // step 12: deterministic validation, immediately after compose
        let required_terms = vec![live
            .campaign
            .deliverable
            .deliverable_type
            .display_term()
            .to_string()];
        let report = validation::validate(expected_rate, &draft.body, &required_terms);
        for warning in &report.warnings {
            warn!(thread_id, warning = %warning, "draft warning");
        }
        if !report.ok {
            return self
                .escalate(
                    live,
                    thread_id,
                    format!("draft failed validation: {}", report.errors.join("; ")),
                    Some(draft.body.clone()),
                    Some(proposed_rate),
                    Vec::new(),
                    Some(draft),
                )
                .await;
        }

        // step 13a: persist before send, state still counter_received.
        // last_message_id is deliberately NOT updated here: if we crash
        // after this save, redelivery must re-run the pipeline.
        live.context.their_last_rate = Some(proposed_rate);
        live.context.our_rate = expected_rate;
        live.updated_at = Utc::now();
        if let Err(e) = self.services.store.save(&live.snapshot(thread_id)) {
            error!(thread_id, error = %e, "pre-send save failed, aborting before dispatch");
            return PipelineOutcome::error("persistence_failure");
        }

        // step 14: dispatch between the two saves
        let outbound = OutboundEmail {
            to: live.context.influencer.email.clone(),
            subject: if draft.subject.trim().is_empty() {
                format!("Re: {}", live.context.subject)
            } else {
                draft.subject.clone()
            },
            body: draft.body.clone(),
            thread_id: Some(thread_id.to_string()),
            in_reply_to: Some(inbound.message_id.clone()),
            references: Some(inbound.message_id.clone()),
        };
        if let Err(e) = self.services.email.send(&outbound).await {
            warn!(thread_id, error = %e, "counter dispatch failed");
            return PipelineOutcome::error("email_send_failed");
        }

        // step 13b: persist after send
        if let Err(e) = live.machine.trigger(NegotiationEvent::SendCounter) {
            error!(thread_id, error = %e, "send_counter transition rejected");
            return PipelineOutcome::error(format!("invalid_transition: {e}"));
        }
        live.round_count += 1;
        live.context.last_message_id = Some(inbound.message_id.clone());
        live.updated_at = Utc::now();
        if let Err(e) = self.services.store.save(&live.snapshot(thread_id)) {
            // the email is out; surface loudly, recovery will replay
            error!(thread_id, error = %e, "post-send save failed");
            return PipelineOutcome::error("persistence_failure");
        }

        self.audit_quietly(AuditEntry::new(
            AuditKind::Sent,
            Some(live.campaign.campaign_id.clone()),
            live.context.influencer.name.clone(),
            thread_id,
            live.machine.state(),
            &draft.body,
        ));

        info!(
            thread_id,
            round = live.round_count,
            rate = %format_money(expected_rate),
            "counter sent"
        );
        PipelineOutcome {
            action: PipelineAction::Send,
            reason: format!("counter at ${}", format_money(expected_rate)),
            triggers: Vec::new(),
            draft: Some(draft),
        }
    }

    async fn settle_accept(
        &self,
        live: &mut LiveNegotiation,
        thread_id: &str,
        classification: &IntentClassification,
    ) -> PipelineOutcome {
        if let Err(e) = live.machine.trigger(NegotiationEvent::Accept) {
            return PipelineOutcome::error(format!("invalid_transition: {e}"));
        }
        let agreed_rate = classification
            .proposed_rate
            .unwrap_or(live.context.our_rate);
        let views = live.context.influencer.average_views;
        let cpm_achieved = pricing::calculate_cpm_from_rate(agreed_rate, views)
            .map(quantize_cents)
            .unwrap_or(Decimal::ZERO);
        live.cpm_tracker
            .record_agreement(cpm_achieved, live.context.influencer.engagement_rate);
        live.context.their_last_rate = Some(agreed_rate);
        live.updated_at = Utc::now();
        if let Err(e) = self.services.store.save(&live.snapshot(thread_id)) {
            error!(thread_id, error = %e, "save failed on accept");
            return PipelineOutcome::error("persistence_failure");
        }

        self.audit_quietly(AuditEntry::new(
            AuditKind::Agreement,
            Some(live.campaign.campaign_id.clone()),
            live.context.influencer.name.clone(),
            thread_id,
            live.machine.state(),
            &format!(
                "agreed at ${} (${} CPM)",
                format_money(agreed_rate),
                format_money(cpm_achieved)
            ),
        ));

        let payload = AgreementPayload {
            influencer_name: live.context.influencer.name.clone(),
            influencer_email: live.context.influencer.email.clone(),
            client_name: live.campaign.client_name.clone(),
            agreed_rate,
            platform: live.context.influencer.platform,
            deliverables: format!(
                "1x {}",
                live.campaign.deliverable.deliverable_type.display_term()
            ),
            cpm_achieved,
            thread_id: thread_id.to_string(),
            next_steps: vec![
                "Send the contract".to_string(),
                "Confirm posting window".to_string(),
            ],
            mention_users: live.campaign.mention_users.clone(),
        };
        if let Err(e) = self.services.chat.post_agreement(&payload).await {
            warn!(thread_id, error = %e, "agreement chat post failed");
        }

        info!(thread_id, rate = %format_money(agreed_rate), "deal agreed");
        PipelineOutcome::terminal(
            PipelineAction::Accept,
            format!("agreed at ${}", format_money(agreed_rate)),
        )
    }

    async fn settle_reject(
        &self,
        live: &mut LiveNegotiation,
        thread_id: &str,
        classification: &IntentClassification,
    ) -> PipelineOutcome {
        if let Err(e) = live.machine.trigger(NegotiationEvent::Reject) {
            return PipelineOutcome::error(format!("invalid_transition: {e}"));
        }
        live.updated_at = Utc::now();
        if let Err(e) = self.services.store.save(&live.snapshot(thread_id)) {
            error!(thread_id, error = %e, "save failed on reject");
            return PipelineOutcome::error("persistence_failure");
        }
        self.audit_quietly(AuditEntry::new(
            AuditKind::Decision,
            Some(live.campaign.campaign_id.clone()),
            live.context.influencer.name.clone(),
            thread_id,
            live.machine.state(),
            &format!(
                "influencer declined (confidence {:.2})",
                classification.confidence
            ),
        ));
        info!(thread_id, "negotiation rejected by influencer");
        PipelineOutcome::terminal(PipelineAction::Reject, "influencer declined")
    }

    /// Shared escalation path: transition, save, audit, chat. The chat post
    /// comes last and a failure there only logs; the escalated state is
    /// already durable.
    async fn escalate(
        &self,
        live: &mut LiveNegotiation,
        thread_id: &str,
        reason: String,
        evidence: Option<String>,
        proposed_rate: Option<Decimal>,
        triggers: Vec<TriggerResult>,
        draft: Option<ComposedEmail>,
    ) -> PipelineOutcome {
        if live.machine.state() != NegotiationState::Escalated {
            if let Err(e) = live.machine.trigger(NegotiationEvent::Escalate) {
                return PipelineOutcome::error(format!("invalid_transition: {e}"));
            }
        }
        live.updated_at = Utc::now();
        if let Err(e) = self.services.store.save(&live.snapshot(thread_id)) {
            error!(thread_id, error = %e, "save failed on escalate");
            return PipelineOutcome::error("persistence_failure");
        }

        self.audit_quietly(AuditEntry::new(
            AuditKind::Escalation,
            Some(live.campaign.campaign_id.clone()),
            live.context.influencer.name.clone(),
            thread_id,
            live.machine.state(),
            &reason,
        ));

        let payload = EscalationPayload {
            influencer_name: live.context.influencer.name.clone(),
            influencer_email: live.context.influencer.email.clone(),
            client_name: live.campaign.client_name.clone(),
            escalation_reason: reason.clone(),
            evidence_quote: evidence,
            proposed_rate,
            our_rate: Some(live.context.our_rate),
            suggested_actions: vec![
                format!("/claim {} to take over the thread", live.context.influencer.name),
                "Reply in the email thread directly".to_string(),
                format!("/resume {} to hand back to the agent", live.context.influencer.name),
            ],
            details_link: format!(
                "{}/{thread_id}",
                self.services.config.details_link_base.trim_end_matches('/')
            ),
        };
        if let Err(e) = self.services.chat.post_escalation(&payload).await {
            warn!(thread_id, error = %e, "escalation chat post failed");
        }

        info!(thread_id, reason = %reason, "negotiation escalated");
        PipelineOutcome {
            action: PipelineAction::Escalate,
            reason,
            triggers,
            draft,
        }
    }

    /// Audit writes after a successful save should not fail the pipeline;
    /// they log loudly instead.
    fn audit_quietly(&self, entry: AuditEntry) {
        if let Err(e) = self.services.audit.record(&entry) {
            error!(kind = %entry.kind, thread_id = %entry.thread_id, error = %e, "audit write failed");
        }
    }

    /// Background sweep: negotiations idle in awaiting_reply or
    /// counter_sent past the threshold go stale. Returns how many moved.
    pub async fn sweep_stale(&self, stale_after: Duration) -> usize {
        let entries: Vec<(String, Arc<Mutex<LiveNegotiation>>)> = self
            .live
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let cutoff = Utc::now() - stale_after;
        let mut moved = 0usize;
        for (thread_id, entry) in entries {
            let mut live = entry.lock().await;
            let idle_state = matches!(
                live.machine.state(),
                NegotiationState::AwaitingReply | NegotiationState::CounterSent
            );
            if !idle_state || live.updated_at > cutoff {
                continue;
            }
            if live.machine.trigger(NegotiationEvent::Timeout).is_err() {
                continue;
            }
            live.updated_at = Utc::now();
            if let Err(e) = self.services.store.save(&live.snapshot(&thread_id)) {
                error!(thread_id = %thread_id, error = %e, "save failed on stale sweep");
                continue;
            }
            self.audit_quietly(AuditEntry::new(
                AuditKind::Decision,
                Some(live.campaign.campaign_id.clone()),
                live.context.influencer.name.clone(),
                thread_id.as_str(),
                live.machine.state(),
                "no reply within the stale window",
            ));
            moved += 1;
        }
        if moved > 0 {
            info!(count = moved, "negotiations marked stale");
        }
        moved
    }
}
