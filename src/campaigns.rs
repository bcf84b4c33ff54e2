//! Campaign webhook ingestion.
//!
//! A webhook delivers a task id; ingestion fetches the task, resolves each
//! named influencer through the spreadsheet directory, opens a negotiation
//! for everyone found, and reports the missing names to chat when a
//! notifier is configured. Missing chat credentials degrade to a log line.

use crate::domain::{Campaign, Deliverable, DeliverableType, Platform};
use crate::negotiation::orchestrator::NegotiationOrchestrator;
use crate::sheets::InfluencerDirectory;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Task details as fetched from the campaign tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignTask {
    pub task_id: String,
    pub campaign_name: String,
    pub client_name: String,
    pub platform: String,
    pub deliverable_type: String,
    pub target_min_cpm: Decimal,
    pub target_max_cpm: Decimal,
    pub influencer_names: Vec<String>,
    #[serde(default)]
    pub mention_users: Vec<String>,
}

#[async_trait]
pub trait CampaignSource: Send + Sync {
    async fn fetch_task(&self, task_id: &str) -> Result<CampaignTask>;
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// JSON-over-HTTP task source: `GET {base_url}/tasks/{id}`.
pub struct HttpCampaignSource {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCampaignSource {
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl CampaignSource for HttpCampaignSource {
    async fn fetch_task(&self, task_id: &str) -> Result<CampaignTask> {
        let url = format!("{}/tasks/{task_id}", self.base_url.trim_end_matches('/'));
        let mut req = self.http.get(&url).timeout(REQUEST_TIMEOUT);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.context("campaign task request")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(anyhow!("campaign source {}: {snippet}", status.as_u16()));
        }
        serde_json::from_str(&body).context("campaign task json parse")
    }
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub campaign_id: String,
    /// thread ids of negotiations opened
    pub started: Vec<String>,
    /// influencer names not found in the sheet
    pub missing: Vec<String>,
    /// influencer names where opening the negotiation failed
    pub failed: Vec<String>,
}

pub fn campaign_from_task(task: &CampaignTask) -> Result<Campaign> {
    let platform = Platform::from_str(&task.platform)?;
    let deliverable_type: DeliverableType =
        serde_json::from_value(serde_json::Value::String(task.deliverable_type.clone()))
            .map_err(|_| anyhow!("unknown deliverable type: {:?}", task.deliverable_type))?;
    let deliverable = Deliverable::new(platform, deliverable_type)?;
    if task.target_min_cpm > task.target_max_cpm {
        return Err(anyhow!(
            "campaign CPM band inverted: {} > {}",
            task.target_min_cpm,
            task.target_max_cpm
        ));
    }
    Ok(Campaign {
        campaign_id: task.task_id.clone(),
        name: task.campaign_name.clone(),
        client_name: task.client_name.clone(),
        target_min_cpm: task.target_min_cpm,
        target_max_cpm: task.target_max_cpm,
        total_influencers: task.influencer_names.len() as u32,
        deliverable,
        mention_users: task.mention_users.clone(),
    })
}

/// Ingest one campaign task end to end.
pub async fn ingest_campaign(
    task_id: &str,
    source: &dyn CampaignSource,
    directory: &dyn InfluencerDirectory,
    orchestrator: &NegotiationOrchestrator,
) -> Result<IngestReport> {
    let task = source.fetch_task(task_id).await?;
    let campaign = campaign_from_task(&task)?;

    let mut report = IngestReport {
        campaign_id: campaign.campaign_id.clone(),
        ..Default::default()
    };

    for name in &task.influencer_names {
        match directory.find_influencer(name).await? {
            Some(influencer) => {
                match orchestrator.start_negotiation(&campaign, &influencer).await {
                    Ok(thread_id) => report.started.push(thread_id),
                    Err(e) => {
                        warn!(influencer = %name, error = %e, "failed to open negotiation");
                        report.failed.push(name.clone());
                    }
                }
            }
            None => report.missing.push(name.clone()),
        }
    }

    if !report.missing.is_empty() {
        let text = format!(
            "Campaign *{}* ({}): couldn't find {} in the influencer sheet: {}",
            campaign.name,
            campaign.client_name,
            if report.missing.len() == 1 {
                "this influencer"
            } else {
                "these influencers"
            },
            report.missing.join(", "),
        );
        if let Err(e) = orchestrator.services().chat.post_message(&text).await {
            warn!(error = %e, "could not report missing influencers to chat");
        }
    }

    info!(
        campaign = %campaign.campaign_id,
        started = report.started.len(),
        missing = report.missing.len(),
        failed = report.failed.len(),
        "campaign ingested"
    );
    Ok(report)
}
