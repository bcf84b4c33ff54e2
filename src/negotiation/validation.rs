//! Deterministic validation gate.
//!
//! The sole pathway between a composed draft and the outbound transport.
//! No LLM output is trusted on money: every dollar figure in the draft must
//! equal the pricing engine's approved rate exactly, or the send is blocked.
//! Missing deliverable terms only warn, so phrasing differences never block
//! a send on their own.

use crate::domain::{format_money, parse_money};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// Dollar figures as they appear in prose: `$2,000`, `$2000.00`,
    /// `$950`. Thousands separators must be well-formed and cents, when
    /// present, are exactly two digits.
    static ref DOLLAR_FIGURE: Regex =
        Regex::new(r"\$(\d{1,3}(?:,\d{3})+|\d+)(\.\d{2})?").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Extract every dollar figure in the body, in order of appearance.
pub fn extract_dollar_figures(body: &str) -> Vec<Decimal> {
    DOLLAR_FIGURE
        .find_iter(body)
        .filter_map(|m| parse_money(m.as_str()).ok())
        .collect()
}

/// Check a composed email against the authoritative rate and the terms the
/// deal requires. Every dollar figure must equal `expected_rate` exactly;
/// a draft that names no figure at all is equally unsendable. Required
/// terms that are absent produce warnings, not errors.
pub fn validate(expected_rate: Decimal, body: &str, required_terms: &[String]) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let figures = extract_dollar_figures(body);
    if figures.is_empty() {
        errors.push(format!(
            "draft names no dollar figure; approved rate is ${}",
            format_money(expected_rate)
        ));
    }
    for figure in &figures {
        if *figure != expected_rate {
            errors.push(format!(
                "draft names ${} but the approved rate is ${}",
                format_money(*figure),
                format_money(expected_rate)
            ));
        }
    }

    let lower_body = body.to_lowercase();
    for term in required_terms {
        if !lower_body.contains(&term.to_lowercase()) {
            warnings.push(format!("draft does not mention required term {term:?}"));
        }
    }

    ValidationReport::from_parts(errors, warnings)
}
