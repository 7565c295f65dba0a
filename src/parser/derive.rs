use std::sync::LazyLock;

use regex::Regex;

use crate::config::FieldNames;
use crate::error::ExtractionError;
use crate::record::JobRecord;

static BID_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+-\d+").unwrap());
static PERIOD_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" to | \(").unwrap());

const SERVE_MARKER: &str = "serve the ";

pub const BD: &str = "B/D";
pub const TITLE: &str = "Title";
pub const BID_REF: &str = "Bid Ref";
pub const CONTRACT_START: &str = "Contract Start Date";
pub const CONTRACT_END: &str = "Contract End Date";
pub const CONTRACT_DURATION: &str = "Contract Duration";

/// Add the fields derived from one raw row, right after it.
pub fn apply(
    fields: &FieldNames,
    name: &str,
    value: &str,
    record: &mut JobRecord,
) -> Result<(), ExtractionError> {
    if value.is_empty() {
        return Ok(());
    }

    match name {
        n if n == fields.duties => {
            if let Some(bd) = business_department(value) {
                record.insert(BD, bd);
            }
        }
        n if n == fields.title_category => {
            record.insert(TITLE, title_abbreviation(value).unwrap_or_default());
            record.insert(BID_REF, bid_ref(value).unwrap_or_default());
        }
        n if n == fields.contract_period => {
            let period = ContractPeriod::parse(value)?;
            record.insert(CONTRACT_START, period.start);
            record.insert(CONTRACT_END, period.end);
            record.insert(CONTRACT_DURATION, period.duration);
        }
        _ => {}
    }
    Ok(())
}

/// Text between "serve the " and the next newline, without semicolons.
pub fn business_department(duties: &str) -> Option<String> {
    let start = duties.find(SERVE_MARKER)? + SERVE_MARKER.len();
    let rest = &duties[start..];
    let end = rest.find('\n')?;
    Some(rest[..end].replace(';', "").trim().to_string())
}

/// Initials of the words before the first `(`: "Senior Engineer (…)" → "SE".
pub fn title_abbreviation(title: &str) -> Option<String> {
    let (before, _) = title.split_once('(')?;
    let before = before.trim();
    if before.is_empty() {
        return None;
    }
    Some(
        before
            .split_whitespace()
            .filter_map(|word| word.chars().next())
            .collect(),
    )
}

/// First `digits-digits` run anywhere in the value.
pub fn bid_ref(title: &str) -> Option<String> {
    BID_REF_RE.find(title).map(|m| m.as_str().to_string())
}

#[derive(Debug, PartialEq, Eq)]
pub struct ContractPeriod {
    pub start: String,
    pub end: String,
    pub duration: String,
}

impl ContractPeriod {
    /// "<start> to <end> (<duration>)". Extra segments past the third are ignored.
    pub fn parse(text: &str) -> Result<Self, ExtractionError> {
        let mut parts: Vec<&str> = PERIOD_SPLIT_RE.split(text).collect();
        while parts.last().is_some_and(|p| p.is_empty()) {
            parts.pop();
        }

        match parts.as_slice() {
            [start, end, duration, ..] => Ok(Self {
                start: start.trim().to_string(),
                end: end.trim().to_string(),
                duration: duration.replace(')', "").trim().to_string(),
            }),
            _ => Err(ExtractionError::MalformedContractPeriod(text.to_string())),
        }
    }
}

// ── Tests ──
