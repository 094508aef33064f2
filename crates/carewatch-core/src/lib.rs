//! Core domain model for the carewatch sync engine.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "carewatch-core";

/// The three upstream datasets the engine mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Facilities,
    Inspections,
    Violations,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Facilities => "facilities",
            DatasetKind::Inspections => "inspections",
            DatasetKind::Violations => "violations",
        }
    }

    /// The order a full sync must respect: parents before children,
    /// aggregation after everything.
    pub const SYNC_ORDER: [DatasetKind; 3] = [
        DatasetKind::Facilities,
        DatasetKind::Inspections,
        DatasetKind::Violations,
    ];
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity classification of a cited violation. "Medium Low" is its own
/// bucket and is never merged into "Low".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RiskTier {
    High,
    MediumHigh,
    Medium,
    MediumLow,
    Low,
}

impl RiskTier {
    pub const ALL: [RiskTier; 5] = [
        RiskTier::High,
        RiskTier::MediumHigh,
        RiskTier::Medium,
        RiskTier::MediumLow,
        RiskTier::Low,
    ];

    /// Parses the upstream `standard_risk_level` label. Unknown labels map
    /// to `None`; they still count toward the violation total.
    pub fn parse(label: &str) -> Option<RiskTier> {
        let normalized = label
            .trim()
            .chars()
            .map(|c| if c == '-' || c == '_' { ' ' } else { c.to_ascii_lowercase() })
            .collect::<String>();
        match normalized.split_whitespace().collect::<Vec<_>>().join(" ").as_str() {
            "high" => Some(RiskTier::High),
            "medium high" => Some(RiskTier::MediumHigh),
            "medium" => Some(RiskTier::Medium),
            "medium low" => Some(RiskTier::MediumLow),
            "low" => Some(RiskTier::Low),
            _ => None,
        }
    }

    /// The facility aggregate column this tier is counted in.
    pub fn bucket_column(&self) -> &'static str {
        match self {
            RiskTier::High => "high_risk_violations",
            RiskTier::MediumHigh => "medium_high_risk_violations",
            RiskTier::Medium => "medium_risk_violations",
            RiskTier::MediumLow => "medium_low_risk_violations",
            RiskTier::Low => "low_risk_violations",
        }
    }
}

/// A typed value destined for a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

/// An ordered map of the columns actually present in an incoming record.
///
/// Absence is the contract: a column missing from the map is left untouched
/// by the reconciler, so normalizers must omit unknown values instead of
/// defaulting them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialRecord {
    columns: BTreeMap<&'static str, SqlValue>,
}

impl PartialRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value when present; `None` leaves the column absent.
    pub fn set(&mut self, column: &'static str, value: Option<SqlValue>) {
        if let Some(value) = value {
            self.columns.insert(column, value);
        }
    }

    pub fn set_text(&mut self, column: &'static str, value: Option<String>) {
        self.set(column, value.map(SqlValue::Text));
    }

    pub fn set_integer(&mut self, column: &'static str, value: Option<i64>) {
        self.set(column, value.map(SqlValue::Integer));
    }

    pub fn set_bool(&mut self, column: &'static str, value: Option<bool>) {
        self.set(column, value.map(SqlValue::Bool));
    }

    pub fn set_date(&mut self, column: &'static str, value: Option<NaiveDate>) {
        self.set(column, value.map(SqlValue::Date));
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.get(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match self.columns.get(column) {
            Some(SqlValue::Text(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Column names in stable (lexicographic) order.
    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.keys().copied()
    }

    /// Values in the same stable order as [`PartialRecord::columns`].
    pub fn values(&self) -> impl Iterator<Item = &SqlValue> + '_ {
        self.columns.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &SqlValue)> + '_ {
        self.columns.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Trims a string and drops it entirely when nothing is left.
pub fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Tolerant date parsing for the formats the upstream API has been observed
/// to emit. Unparsable input is `None`, never an error.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%Y %H:%M"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.date());
        }
    }
    None
}

/// Yes/No style flags as the upstream encodes them.
pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => Some(true),
        "no" | "n" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Deterministic stand-in key for violation records the upstream ships
/// without a `non_compliance_id`. UUIDv5 over the identifying composite, so
/// re-syncing identical source data lands on the same row instead of
/// duplicating it.
pub fn synthesize_violation_key(
    operation_id: &str,
    activity_id: &str,
    section_id: &str,
    standard_number_description: &str,
) -> String {
    let seed = format!(
        "{operation_id}:{activity_id}:{section_id}:{standard_number_description}"
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).to_string()
}
