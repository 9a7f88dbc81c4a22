//! # Report
//!
//! The input event handed over by the ingestion pipeline, and the normalized records derived
//! from it. Normalization is a pure transform: it either accepts the whole batch or rejects it
//! with an error naming the offending field.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::timestamp::{canonical, parse_instant, sort_key_timestamp};

/// Enumeration of validation errors raised while normalizing an input event.
/// Every variant names the field path that failed, e.g. `reports[2].playerId`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event.reports must be an array")]
    ReportsNotArray,
    #[error("reports[{0}] must be an object")]
    ReportNotObject(usize),
    #[error("{0} is required")]
    MissingField(String),
    #[error("{0} must be an ISO-8601 string")]
    TimestampNotString(String),
    #[error("{0} must be a valid ISO-8601 timestamp")]
    InvalidTimestamp(String),
    #[error("{0} must contain at least one entry")]
    EmptyCategories(String),
}

/// The event consumed from the ingestion pipeline.
///
/// Fields are kept as raw JSON values so that shape errors can be reported per record and
/// per field, rather than as a single deserialization failure for the whole batch. Provenance
/// fields that are not strings are treated as absent.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistBatchEvent {
    #[serde(default)]
    pub ingestion_id: Option<Value>,
    #[serde(default)]
    pub source_bucket: Option<Value>,
    #[serde(default)]
    pub source_key: Option<Value>,
    #[serde(default)]
    pub correlation_id: Option<Value>,
    #[serde(default)]
    pub ingest_started_at: Option<Value>,
    #[serde(default)]
    pub trace_header: Option<Value>,
    #[serde(default)]
    pub reports: Value,
}

/// A single report as it appears in the event. Every field is optional at this stage.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReport {
    #[serde(default)]
    report_id: Option<Value>,
    #[serde(default)]
    player_id: Option<Value>,
    #[serde(default)]
    coach_id: Option<Value>,
    #[serde(default)]
    report_timestamp: Option<Value>,
    #[serde(default)]
    categories: Option<Value>,
    #[serde(default)]
    created_at: Option<Value>,
    #[serde(default)]
    team_id: Option<Value>,
    #[serde(default)]
    player_email: Option<Value>,
    #[serde(default)]
    player_name: Option<Value>,
}

/// Where a batch came from. Shared by every record of the batch and stamped on what we write.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub ingestion_id: Option<String>,
    pub source_bucket: Option<String>,
    pub source_key: Option<String>,
    pub correlation_id: Option<String>,
    pub ingest_started_at: Option<DateTime<Utc>>,
    pub trace_header: Option<String>,
}

impl Provenance {
    /// The canonical form of `ingest_started_at`, as persisted.
    pub fn ingest_started_at_canonical(&self) -> Option<String> {
        self.ingest_started_at.as_ref().map(canonical)
    }
}

/// A report in canonical form, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    pub report_id: String,
    pub player_id: String,
    pub coach_id: String,
    /// Canonical ISO-8601, millisecond precision.
    pub report_timestamp: String,
    /// `YYYYMMDDTHHMMSS` derived from `report_timestamp`.
    pub report_timestamp_key: String,
    /// Canonical ISO-8601. Falls back to `report_timestamp` when absent from the input.
    pub created_at: String,
    pub categories: BTreeMap<String, String>,
    pub team_id: Option<String>,
    pub player_email: Option<String>,
    pub player_name: Option<String>,
    /// `REPORT#{report_timestamp_key}#{report_id}`
    pub sort_key: String,
    /// `CREATED#{report_timestamp_key}#{report_id}`, only when a team is known.
    pub team_sort_key: Option<String>,
}

/// The outcome of normalizing an event: provenance plus records in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub provenance: Provenance,
    pub records: Vec<ReportRecord>,
}

/// Validate and canonicalize an input event.
///
/// Any invalid record fails the whole batch: we never accept part of a malformed input.
pub fn normalize(event: &PersistBatchEvent) -> Result<NormalizedBatch, ValidationError> {
    let reports = event
        .reports
        .as_array()
        .ok_or(ValidationError::ReportsNotArray)?;

    let ingest_started_at = match optional_string(event.ingest_started_at.as_ref()) {
        Some(value) => Some(
            parse_instant(&value)
                .ok_or_else(|| ValidationError::InvalidTimestamp("event.ingestStartedAt".to_owned()))?,
        ),
        None => None,
    };

    let provenance = Provenance {
        ingestion_id: optional_string(event.ingestion_id.as_ref()),
        source_bucket: optional_string(event.source_bucket.as_ref()),
        source_key: optional_string(event.source_key.as_ref()),
        correlation_id: optional_string(event.correlation_id.as_ref()),
        ingest_started_at,
        trace_header: optional_string(event.trace_header.as_ref()),
    };

    let records = reports
        .iter()
        .enumerate()
        .map(|(index, report)| normalize_report(index, report))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NormalizedBatch {
        provenance,
        records,
    })
}

fn normalize_report(index: usize, report: &Value) -> Result<ReportRecord, ValidationError> {
    if !report.is_object() {
        return Err(ValidationError::ReportNotObject(index));
    }
    // An object never fails to deserialize here: every field is optional and untyped.
    let raw: RawReport = serde_json::from_value(report.clone())
        .map_err(|_| ValidationError::ReportNotObject(index))?;

    let path = format!("reports[{index}]");

    let report_id = required_string(raw.report_id.as_ref(), &path, "reportId")?;
    let player_id = required_string(raw.player_id.as_ref(), &path, "playerId")?;
    let coach_id = required_string(raw.coach_id.as_ref(), &path, "coachId")?;

    let report_instant = required_instant(raw.report_timestamp.as_ref(), &path, "reportTimestamp")?;
    let report_timestamp = canonical(&report_instant);
    let created_at = match raw.created_at.as_ref().filter(|value| is_present(value)) {
        Some(value) => canonical(&required_instant(Some(value), &path, "createdAt")?),
        None => report_timestamp.clone(),
    };

    let categories = normalize_categories(raw.categories.as_ref(), &path)?;

    let report_timestamp_key = sort_key_timestamp(&report_instant);
    let team_id = optional_string(raw.team_id.as_ref());
    let sort_key = format!("REPORT#{report_timestamp_key}#{report_id}");
    let team_sort_key = team_id
        .as_ref()
        .map(|_| format!("CREATED#{report_timestamp_key}#{report_id}"));

    Ok(ReportRecord {
        report_id,
        player_id,
        coach_id,
        report_timestamp,
        report_timestamp_key,
        created_at,
        categories,
        team_id,
        player_email: optional_string(raw.player_email.as_ref()),
        player_name: optional_string(raw.player_name.as_ref()),
        sort_key,
        team_sort_key,
    })
}

/// Keep every category with a non-empty trimmed name. Blank feedback is valid and kept as an
/// empty string; only an empty set of categories is rejected.
fn normalize_categories(
    categories: Option<&Value>,
    path: &str,
) -> Result<BTreeMap<String, String>, ValidationError> {
    let entries = match categories {
        Some(Value::Object(entries)) => entries,
        _ => return Err(ValidationError::MissingField(format!("{path}.categories"))),
    };

    let categories: BTreeMap<String, String> = entries
        .iter()
        .filter_map(|(name, feedback)| {
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_owned(), category_text(feedback)))
        })
        .collect();

    if categories.is_empty() {
        return Err(ValidationError::EmptyCategories(format!("{path}.categories")));
    }

    Ok(categories)
}

fn category_text(feedback: &Value) -> String {
    match feedback {
        Value::Null => String::new(),
        Value::String(text) => text.trim().to_owned(),
        other => other.to_string().trim().to_owned(),
    }
}

fn required_string(value: Option<&Value>, path: &str, name: &str) -> Result<String, ValidationError> {
    optional_string(value).ok_or_else(|| ValidationError::MissingField(format!("{path}.{name}")))
}

fn required_instant(
    value: Option<&Value>,
    path: &str,
    name: &str,
) -> Result<DateTime<Utc>, ValidationError> {
    let field = format!("{path}.{name}");
    let text = match value {
        Some(Value::String(text)) if !text.trim().is_empty() => text,
        _ => return Err(ValidationError::TimestampNotString(field)),
    };

    parse_instant(text).ok_or(ValidationError::InvalidTimestamp(field))
}

fn optional_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) => trimmed_owned(Some(text.as_str())),
        _ => None,
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn trimmed_owned(value: Option<&str>) -> Option<String> {
    trimmed(value).map(str::to_owned)
}
