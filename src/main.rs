//! DealBot - Influencer rate negotiation agent
//!
//! Startup sequence: open the database and apply schemas idempotently,
//! load active negotiation snapshots, rebuild the in-memory map, then
//! register the email/webhook/slash-command entry points and become ready.
//! Capabilities without credentials come up disabled instead of failing.

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dealbot_backend::campaigns::{self, CampaignSource, HttpCampaignSource};
use dealbot_backend::chat::commands::{
    handle_slash_command, parse_slash_command, SlashCommandForm,
};
use dealbot_backend::chat::{ChatNotifier, NoopChatNotifier, SlackNotifier};
use dealbot_backend::config::Config;
use dealbot_backend::email::gmail::GmailTransport;
use dealbot_backend::email::{DisabledEmailTransport, EmailTransport};
use dealbot_backend::llm::composer::{DisabledEmailComposer, LlmEmailComposer};
use dealbot_backend::llm::intent::{DisabledIntentClassifier, LlmIntentClassifier};
use dealbot_backend::llm::semantic::LlmSemanticClassifier;
use dealbot_backend::llm::OpenRouterClient;
use dealbot_backend::negotiation::audit::AuditLog;
use dealbot_backend::negotiation::orchestrator::{
    NegotiationOrchestrator, OrchestratorConfig, Services,
};
use dealbot_backend::negotiation::ownership::OwnershipRegistry;
use dealbot_backend::negotiation::store::{open_database, NegotiationStore};
use dealbot_backend::negotiation::triggers::{TriggerEngine, TriggerEngineConfig};
use dealbot_backend::sheets::{InfluencerDirectory, NullDirectory, SheetsDirectory};

const WATCH_EXPIRATION_KEY: &str = "gmail_watch_expiration";
const HISTORY_TOKEN_KEY: &str = "gmail_history_token";

#[derive(Parser, Debug)]
#[command(name = "dealbot", about = "Influencer rate negotiation agent")]
struct Args {
    /// Override DATABASE_PATH
    #[arg(long)]
    db_path: Option<String>,
    /// Override PORT
    #[arg(long)]
    port: Option<u16>,
    /// Override TRIGGER_CONFIG_PATH
    #[arg(long)]
    trigger_config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<NegotiationOrchestrator>,
    email: Arc<dyn EmailTransport>,
    directory: Arc<dyn InfluencerDirectory>,
    campaign_source: Option<Arc<dyn CampaignSource>>,
    store: NegotiationStore,
    audit: AuditLog,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dealbot_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(db_path) = args.db_path {
        config.database_path = db_path;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(trigger_config) = args.trigger_config {
        config.trigger_config_path = Some(trigger_config);
    }

    info!("🤝 DealBot starting");

    // database first; everything else hangs off it
    let conn = open_database(&config.database_path)?;
    let store = NegotiationStore::new(conn.clone());
    let audit = AuditLog::new(conn)?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .user_agent("DealBot/1.0 (Negotiation Agent)")
        .build()
        .context("http client")?;

    // LLM-backed services, or disabled stand-ins without credentials
    let llm_timeout = Duration::from_secs(config.llm_timeout_secs);
    let llm_client = match &config.openrouter_api_key {
        Some(key) => Some(OpenRouterClient::new(http.clone(), key.clone())?),
        None => {
            warn!("no OPENROUTER_API_KEY; intent classification and composition disabled");
            None
        }
    };
    let intent: Arc<dyn dealbot_backend::llm::intent::IntentClassifier> = match &llm_client {
        Some(client) => Arc::new(LlmIntentClassifier::new(
            client.clone(),
            config.llm_model.clone(),
            llm_timeout,
        )),
        None => Arc::new(DisabledIntentClassifier),
    };
    let composer: Arc<dyn dealbot_backend::llm::composer::EmailComposer> = match &llm_client {
        Some(client) => Arc::new(LlmEmailComposer::new(
            client.clone(),
            config.llm_model.clone(),
            llm_timeout,
        )),
        None => Arc::new(DisabledEmailComposer),
    };
    let semantic = llm_client.as_ref().map(|client| {
        Arc::new(LlmSemanticClassifier::new(
            client.clone(),
            config.llm_model.clone(),
            llm_timeout,
        )) as Arc<dyn dealbot_backend::negotiation::triggers::SemanticTriggerClassifier>
    });

    let trigger_config = TriggerEngineConfig::load_or_default(config.trigger_config_path.as_deref());
    let triggers = TriggerEngine::new(trigger_config, semantic);

    let email: Arc<dyn EmailTransport> =
        match (&config.gmail_access_token, &config.agent_email) {
            (Some(token), Some(account)) => Arc::new(GmailTransport::new(
                http.clone(),
                token.clone(),
                account.clone(),
            )),
            _ => {
                warn!("no Gmail credentials; email transport disabled");
                Arc::new(DisabledEmailTransport)
            }
        };

    let chat: Arc<dyn ChatNotifier> = match &config.slack_bot_token {
        Some(token) => Arc::new(SlackNotifier::new(
            http.clone(),
            token.clone(),
            config.slack_channel.clone(),
        )),
        None => {
            warn!("no SLACK_BOT_TOKEN; chat notifications disabled");
            Arc::new(NoopChatNotifier)
        }
    };

    let directory: Arc<dyn InfluencerDirectory> =
        match (&config.sheets_api_key, &config.sheets_spreadsheet_id) {
            (Some(key), Some(sheet)) => Arc::new(SheetsDirectory::new(
                http.clone(),
                key.clone(),
                sheet.clone(),
                config.sheets_range.clone(),
            )),
            _ => {
                warn!("no Sheets credentials; influencer lookups disabled");
                Arc::new(NullDirectory)
            }
        };

    let campaign_source: Option<Arc<dyn CampaignSource>> =
        config.campaign_source_url.as_ref().map(|url| {
            Arc::new(HttpCampaignSource::new(
                http.clone(),
                url.clone(),
                config.campaign_source_api_key.clone(),
            )) as Arc<dyn CampaignSource>
        });

    let orchestrator_config = OrchestratorConfig {
        agent_email: config
            .agent_email
            .clone()
            .unwrap_or_else(|| "dealbot@localhost".into()),
        max_rounds: config.max_rounds,
        intent_confidence_threshold: config.intent_confidence_threshold,
        low_rate_threshold: config.low_rate_threshold,
        details_link_base: config.details_link_base.clone(),
        compose_guidance: config.compose_guidance.clone(),
    };
    let orchestrator = Arc::new(NegotiationOrchestrator::new(Services {
        store: store.clone(),
        audit: audit.clone(),
        triggers,
        intent,
        composer,
        email: email.clone(),
        chat,
        ownership: OwnershipRegistry::new(),
        config: orchestrator_config,
    }));

    // recovery before any entry point is registered
    let recovered = orchestrator.recover()?;
    info!(active = recovered, "recovery complete");

    spawn_stale_sweeper(orchestrator.clone(), &config);
    spawn_watch_renewal(email.clone(), store.clone(), &config);

    let state = AppState {
        orchestrator,
        email,
        directory,
        campaign_source,
        store,
        audit,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/webhooks/campaign", post(campaign_webhook))
        .route("/webhooks/email", post(email_webhook))
        .route("/slack/commands", post(slack_command))
        .route("/audit/influencer/:name", get(audit_by_influencer))
        .route("/audit/campaign/:id", get(audit_by_campaign))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr, "ready");

    // graceful shutdown waits for in-flight pipelines running inside
    // request handlers before the process exits
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "shutdown signal listener failed");
    }
    info!("shutdown requested, draining in-flight work");
}

fn spawn_stale_sweeper(orchestrator: Arc<NegotiationOrchestrator>, config: &Config) {
    let period = Duration::from_secs(config.stale_check_interval_secs.max(60));
    let stale_after = chrono::Duration::hours(config.stale_after_hours.max(1));
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            orchestrator.sweep_stale(stale_after).await;
        }
    });
}

fn spawn_watch_renewal(
    email: Arc<dyn EmailTransport>,
    store: NegotiationStore,
    config: &Config,
) {
    let Some(topic) = config.watch_topic.clone() else {
        return;
    };
    let lead = config.watch_renewal_lead_secs;
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let stored = match store.get_metadata(WATCH_EXPIRATION_KEY) {
                Ok(value) => value.and_then(|v| v.parse::<i64>().ok()),
                Err(e) => {
                    error!(error = %e, "watch expiration read failed");
                    continue;
                }
            };
            let now = chrono::Utc::now().timestamp();
            let due = stored.map(|exp| now >= exp - lead).unwrap_or(true);
            if !due {
                continue;
            }
            match email.setup_watch(&topic).await {
                Ok(status) => {
                    if let Err(e) = store
                        .set_metadata(WATCH_EXPIRATION_KEY, &status.expiration_timestamp.to_string())
                    {
                        error!(error = %e, "watch expiration write failed");
                    } else {
                        info!(expires = status.expiration_timestamp, "email watch renewed");
                    }
                }
                Err(e) => warn!(error = %e, "email watch renewal failed"),
            }
        }
    });
}

async fn health() -> &'static str {
    "ok"
}

#[derive(serde::Deserialize)]
struct CampaignWebhook {
    task_id: String,
}

async fn campaign_webhook(
    State(state): State<AppState>,
    Json(payload): Json<CampaignWebhook>,
) -> impl IntoResponse {
    let Some(source) = &state.campaign_source else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no campaign source configured"})),
        );
    };
    match campaigns::ingest_campaign(
        &payload.task_id,
        source.as_ref(),
        state.directory.as_ref(),
        &state.orchestrator,
    )
    .await
    {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => {
            error!(task_id = %payload.task_id, error = %e, "campaign ingest failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

/// Gmail push notifications arrive as a Pub/Sub envelope whose `data` is
/// base64 JSON carrying the new history id.
fn notification_history_id(body: &serde_json::Value) -> Option<String> {
    let data = body.get("message")?.get("data")?.as_str()?;
    let decoded = URL_SAFE
        .decode(data)
        .or_else(|_| STANDARD.decode(data))
        .ok()?;
    let inner: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    match inner.get("historyId")? {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

async fn email_webhook(
    State(state): State<AppState>,
    body: Option<Json<serde_json::Value>>,
) -> impl IntoResponse {
    let token = match state.store.get_metadata(HISTORY_TOKEN_KEY) {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "history token read failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "store"})));
        }
    };

    let inbound = match state.email.fetch_inbound(token.as_deref()).await {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(error = %e, "inbound fetch failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string()})),
            );
        }
    };

    let mut outcomes = Vec::with_capacity(inbound.len());
    for email in &inbound {
        let outcome = state.orchestrator.handle_inbound(email).await;
        info!(
            thread_id = %email.thread_id,
            action = %outcome.action,
            reason = %outcome.reason,
            "inbound processed"
        );
        outcomes.push(json!({
            "thread_id": email.thread_id,
            "action": outcome.action,
            "reason": outcome.reason,
        }));
    }

    if let Some(Json(body)) = &body {
        if let Some(history_id) = notification_history_id(body) {
            if let Err(e) = state.store.set_metadata(HISTORY_TOKEN_KEY, &history_id) {
                error!(error = %e, "history token write failed");
            }
        }
    }

    (StatusCode::OK, Json(json!({"processed": outcomes})))
}

async fn slack_command(
    State(state): State<AppState>,
    Form(form): Form<SlashCommandForm>,
) -> impl IntoResponse {
    let text = match parse_slash_command(&form.command, &form.text) {
        Ok(command) => handle_slash_command(command, &form.user_name,
            &state.orchestrator.services().ownership, |identifier| {
                state.orchestrator.resolve_thread(identifier)
            }),
        Err(usage) => usage,
    };
    // always ephemeral; a claim or resume is silent in the channel
    Json(json!({"response_type": "ephemeral", "text": text}))
}

async fn audit_by_influencer(
    State(state): State<AppState>,
    AxumPath(name): AxumPath<String>,
) -> impl IntoResponse {
    match state.audit.by_influencer(&name, 100) {
        Ok(entries) => (StatusCode::OK, Json(json!(entries))),
        Err(e) => {
            error!(error = %e, "audit query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

async fn audit_by_campaign(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    match state.audit.by_campaign(&id, 100) {
        Ok(entries) => (StatusCode::OK, Json(json!(entries))),
        Err(e) => {
            error!(error = %e, "audit query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}
