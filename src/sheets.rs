//! Spreadsheet-backed influencer directory.
//!
//! The sheet is the source of truth for who we can negotiate with. One
//! batched read fetches every row; lookups are case-insensitive with
//! whitespace trimmed. Rates arrive as whatever the sheet displays and are
//! coerced through strings into `Decimal`, never through floats.

use crate::domain::{parse_money, InfluencerRow, Platform};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait InfluencerDirectory: Send + Sync {
    /// Case-insensitive, whitespace-trimmed lookup by name.
    async fn find_influencer(&self, name: &str) -> Result<Option<InfluencerRow>>;
    /// All rows in one batched read.
    async fn list_all(&self) -> Result<Vec<InfluencerRow>>;
}

/// Stand-in when no sheets credentials are configured: every lookup
/// misses, so campaign ingestion reports all influencers as missing.
pub struct NullDirectory;

#[async_trait]
impl InfluencerDirectory for NullDirectory {
    async fn find_influencer(&self, _name: &str) -> Result<Option<InfluencerRow>> {
        Ok(None)
    }

    async fn list_all(&self) -> Result<Vec<InfluencerRow>> {
        Ok(Vec::new())
    }
}

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Expected column order in the sheet:
/// name, email, platform, handle, average_views, min_rate, max_rate, engagement_rate
pub struct SheetsDirectory {
    http: reqwest::Client,
    api_key: String,
    spreadsheet_id: String,
    range: String,
}

impl SheetsDirectory {
    pub fn new(
        http: reqwest::Client,
        api_key: String,
        spreadsheet_id: String,
        range: String,
    ) -> Self {
        Self {
            http,
            api_key,
            spreadsheet_id,
            range,
        }
    }
}

#[async_trait]
impl InfluencerDirectory for SheetsDirectory {
    async fn find_influencer(&self, name: &str) -> Result<Option<InfluencerRow>> {
        let needle = name.trim().to_lowercase();
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .find(|row| row.name.trim().to_lowercase() == needle))
    }

    async fn list_all(&self) -> Result<Vec<InfluencerRow>> {
        let url = format!(
            "{SHEETS_API_BASE}/{}/values/{}",
            self.spreadsheet_id, self.range
        );
        let resp = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .context("sheets values request")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(anyhow!("sheets {}: {snippet}", status.as_u16()));
        }
        let values: ValuesResponse = serde_json::from_str(&body).context("sheets json parse")?;

        let mut rows = Vec::new();
        for (i, cells) in values.values.iter().enumerate() {
            if i == 0 && is_header_row(cells) {
                continue;
            }
            match parse_influencer_row(cells) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(row = i + 1, error = %e, "skipping unparseable sheet row"),
            }
        }
        Ok(rows)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

fn is_header_row(cells: &[String]) -> bool {
    cells
        .first()
        .map(|c| c.trim().eq_ignore_ascii_case("name"))
        .unwrap_or(false)
}

/// Parse one sheet row. Engagement accepts `4.5%` and `0.045` forms and is
/// normalized to a fraction.
pub fn parse_influencer_row(cells: &[String]) -> Result<InfluencerRow> {
    let cell = |i: usize| -> Result<&str> {
        cells
            .get(i)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("missing column {i}"))
    };

    let name = cell(0)?.to_string();
    let email = cell(1)?.to_string();
    let platform = Platform::from_str(cell(2)?)?;
    let handle = cell(3)?.to_string();
    let average_views: i64 = cell(4)?
        .replace(',', "")
        .parse()
        .with_context(|| format!("average_views for {name}"))?;
    if average_views <= 0 {
        return Err(anyhow!("non-positive average_views for {name}"));
    }
    let min_rate = parse_money(cell(5)?)?;
    let max_rate = parse_money(cell(6)?)?;

    let engagement_rate = match cells.get(7).map(|s| s.trim()).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => {
            let (digits, percent) = match raw.strip_suffix('%') {
                Some(d) => (d.trim(), true),
                None => (raw, false),
            };
            let value: f64 = digits
                .parse()
                .with_context(|| format!("engagement_rate for {name}"))?;
            Some(if percent || value > 1.0 {
                value / 100.0
            } else {
                value
            })
        }
    };

    Ok(InfluencerRow {
        name,
        email,
        platform,
        handle,
        average_views,
        min_rate,
        max_rate,
        engagement_rate,
    })
}
