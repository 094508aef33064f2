//! Per-dataset adapters mapping raw open-data records onto canonical rows.
//!
//! One pipeline, one adapter per dataset: each adapter supplies the target
//! table, a stable pagination order, and a normalizer that maps the
//! upstream's drifting field names onto canonical columns through ordered
//! alias fallback chains.

use carewatch_core::{
    parse_date, parse_flag, synthesize_violation_key, text_or_none, DatasetKind, PartialRecord,
};
use carewatch_storage::TableSpec;
use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "carewatch-adapters";

pub static FACILITIES_TABLE: TableSpec = TableSpec {
    table: "facilities",
    natural_key: "operation_number",
    timestamp_column: Some("updated_at"),
};

pub static INSPECTIONS_TABLE: TableSpec = TableSpec {
    table: "inspection_events",
    natural_key: "activity_id",
    timestamp_column: Some("updated_at"),
};

pub static VIOLATIONS_TABLE: TableSpec = TableSpec {
    table: "violation_records",
    natural_key: "non_compliance_id",
    timestamp_column: Some("updated_at"),
};

#[derive(Debug, Error)]
pub enum MapError {
    #[error("{dataset} record is not a JSON object")]
    NotAnObject { dataset: &'static str },
    #[error("{dataset} record has no usable natural key")]
    MissingNaturalKey { dataset: &'static str },
}

/// Strategy contract: normalize + natural key + table schema per dataset.
pub trait DatasetAdapter: Send + Sync {
    fn kind(&self) -> DatasetKind;

    fn table(&self) -> &'static TableSpec;

    /// `$order` clause keeping offset pagination deterministic.
    fn order_clause(&self) -> &'static str;

    /// Maps one raw record onto canonical columns. Unparsable optional
    /// values are omitted, never defaulted; a missing natural key is the
    /// only hard failure.
    fn normalize(&self, raw: &JsonValue) -> Result<PartialRecord, MapError>;
}

pub fn adapter_for_dataset(kind: DatasetKind) -> &'static dyn DatasetAdapter {
    match kind {
        DatasetKind::Facilities => &FacilitiesAdapter,
        DatasetKind::Inspections => &InspectionsAdapter,
        DatasetKind::Violations => &ViolationsAdapter,
    }
}

/// First alias present with a non-empty string value wins.
fn str_field(raw: &JsonValue, aliases: &[&str]) -> Option<String> {
    for alias in aliases {
        match raw.get(alias) {
            Some(JsonValue::String(s)) => {
                if let Some(value) = text_or_none(s.clone()) {
                    return Some(value);
                }
            }
            Some(JsonValue::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn int_field(raw: &JsonValue, aliases: &[&str]) -> Option<i64> {
    for alias in aliases {
        match raw.get(alias) {
            Some(JsonValue::Number(n)) => {
                if let Some(value) = n.as_i64() {
                    return Some(value);
                }
            }
            Some(JsonValue::String(s)) => {
                if let Ok(value) = s.trim().parse::<i64>() {
                    return Some(value);
                }
            }
            _ => {}
        }
    }
    None
}

fn bool_field(raw: &JsonValue, aliases: &[&str]) -> Option<bool> {
    for alias in aliases {
        match raw.get(alias) {
            Some(JsonValue::Bool(b)) => return Some(*b),
            Some(JsonValue::String(s)) => {
                if let Some(value) = parse_flag(s) {
                    return Some(value);
                }
            }
            _ => {}
        }
    }
    None
}

/// Invalid or unparsable dates become `None`, never an error.
fn date_field(raw: &JsonValue, aliases: &[&str]) -> Option<NaiveDate> {
    for alias in aliases {
        if let Some(JsonValue::String(s)) = raw.get(alias) {
            if let Some(date) = parse_date(s) {
                return Some(date);
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub struct FacilitiesAdapter;

impl DatasetAdapter for FacilitiesAdapter {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Facilities
    }

    fn table(&self) -> &'static TableSpec {
        &FACILITIES_TABLE
    }

    fn order_clause(&self) -> &'static str {
        "operation_number"
    }

    fn normalize(&self, raw: &JsonValue) -> Result<PartialRecord, MapError> {
        if !raw.is_object() {
            return Err(MapError::NotAnObject {
                dataset: "facilities",
            });
        }
        let Some(operation_number) = str_field(raw, &["operation_number", "operation_id"]) else {
            return Err(MapError::MissingNaturalKey {
                dataset: "facilities",
            });
        };

        let mut record = PartialRecord::new();
        record.set_text("operation_number", Some(operation_number));
        record.set_text(
            "operation_name",
            str_field(raw, &["operation_name", "operation_caregiver_name", "name"]),
        );
        record.set_text(
            "operation_type",
            str_field(raw, &["operation_type", "type_of_operation", "type"]),
        );
        record.set_text(
            "street_address",
            str_field(raw, &["street_address", "location_address", "address"]),
        );
        record.set_text("city", str_field(raw, &["city", "operation_city"]));
        record.set_text("state", str_field(raw, &["state", "operation_state"]));
        record.set_text("zip_code", str_field(raw, &["zip", "zip_code", "operation_zip"]));
        record.set_text("county", str_field(raw, &["county", "operation_county"]));
        record.set_text("phone_number", str_field(raw, &["phone", "phone_number"]));
        record.set_integer("capacity", int_field(raw, &["total_capacity", "capacity"]));
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InspectionsAdapter;

impl DatasetAdapter for InspectionsAdapter {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Inspections
    }

    fn table(&self) -> &'static TableSpec {
        &INSPECTIONS_TABLE
    }

    fn order_clause(&self) -> &'static str {
        "activity_id"
    }

    fn normalize(&self, raw: &JsonValue) -> Result<PartialRecord, MapError> {
        if !raw.is_object() {
            return Err(MapError::NotAnObject {
                dataset: "inspections",
            });
        }
        let Some(activity_id) = str_field(raw, &["activity_id", "activity_nbr"]) else {
            return Err(MapError::MissingNaturalKey {
                dataset: "inspections",
            });
        };

        let mut record = PartialRecord::new();
        record.set_text("activity_id", Some(activity_id));
        record.set_text(
            "operation_id",
            str_field(raw, &["operation_id", "operation_number"]),
        );
        record.set_date(
            "activity_date",
            date_field(raw, &["activity_date", "inspection_date"]),
        );
        record.set_text(
            "activity_type",
            str_field(raw, &["activity_type", "inspection_type"]),
        );
        record.set_bool(
            "violation_found",
            bool_field(raw, &["violation_found", "violations_found"]),
        );
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ViolationsAdapter;

impl DatasetAdapter for ViolationsAdapter {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Violations
    }

    fn table(&self) -> &'static TableSpec {
        &VIOLATIONS_TABLE
    }

    // The upstream dataset has no reliably-present natural column, so order
    // on the provider's internal row id.
    fn order_clause(&self) -> &'static str {
        ":id"
    }

    fn normalize(&self, raw: &JsonValue) -> Result<PartialRecord, MapError> {
        if !raw.is_object() {
            return Err(MapError::NotAnObject {
                dataset: "violations",
            });
        }

        let operation_id = str_field(raw, &["operation_id", "operation_number"]);
        let activity_id = str_field(raw, &["activity_id"]);
        let section_id = str_field(raw, &["section_id", "standard_section_id"]);
        let standard_number_description = str_field(
            raw,
            &["standard_number_description", "standard_number", "standard_description"],
        );

        let non_compliance_id = match str_field(raw, &["non_compliance_id"]) {
            Some(id) => id,
            // No natural key upstream: synthesize a deterministic composite
            // key so re-syncing the same record lands on the same row.
            None => {
                let Some(operation) = operation_id.as_deref() else {
                    return Err(MapError::MissingNaturalKey {
                        dataset: "violations",
                    });
                };
                synthesize_violation_key(
                    operation,
                    activity_id.as_deref().unwrap_or(""),
                    section_id.as_deref().unwrap_or(""),
                    standard_number_description.as_deref().unwrap_or(""),
                )
            }
        };

        let mut record = PartialRecord::new();
        record.set_text("non_compliance_id", Some(non_compliance_id));
        record.set_text("operation_id", operation_id);
        record.set_text("activity_id", activity_id);
        record.set_text("section_id", section_id);
        record.set_text("standard_number_description", standard_number_description);
        record.set_text(
            "standard_risk_level",
            str_field(raw, &["standard_risk_level", "risk_level"]),
        );
        record.set_text("narrative", str_field(raw, &["narrative", "violation_narrative"]));
        record.set_bool(
            "technical_assistance_given",
            bool_field(raw, &["technical_assistance_given"]),
        );
        record.set_bool(
            "corrected_at_inspection",
            bool_field(raw, &["corrected_at_inspection"]),
        );
        record.set_date("corrected_date", date_field(raw, &["corrected_date"]));
        record.set_date(
            "date_correction_verified",
            date_field(raw, &["date_correction_verified"]),
        );
        record.set_date("activity_date", date_field(raw, &["activity_date"]));
        Ok(record)
    }
}
