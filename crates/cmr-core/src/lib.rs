//! Core data model shared by the download and load halves of the relay.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "cmr-core";

/// Field carrying the client identifier in every domain's records.
pub const CLIENT_TAG_FIELD: &str = "ClientTag";

/// Injected processing-state column marking a row as not yet aggregated downstream.
pub const PROCESSED_FIELD: &str = "Processed";

/// One flat extracted row. Field order follows the source query and is kept
/// through serialization.
pub type Record = serde_json::Map<String, JsonValue>;

/// One client as known by the source system, and the tag it carries downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpec {
    #[serde(alias = "tag", alias = "Tag")]
    pub source_tag: String,
    #[serde(alias = "replaceTag", alias = "ReplaceTag")]
    pub target_tag: String,
}

impl ClientSpec {
    pub fn new(source_tag: impl Into<String>, target_tag: impl Into<String>) -> Self {
        Self {
            source_tag: source_tag.into(),
            target_tag: target_tag.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Domain {
    Operations,
    Invoicing,
    Receivables,
}

impl Domain {
    pub const ALL: [Domain; 3] = [Domain::Operations, Domain::Invoicing, Domain::Receivables];

    /// Lower-case identifier used for artifact names and log fields.
    pub fn slug(self) -> &'static str {
        match self {
            Domain::Operations => "operations",
            Domain::Invoicing => "invoicing",
            Domain::Receivables => "receivables",
        }
    }

    /// Unqualified table name, identical in the source and target stores.
    pub fn table_name(self) -> &'static str {
        match self {
            Domain::Operations => "Operations",
            Domain::Invoicing => "Invoicing",
            Domain::Receivables => "Receivables",
        }
    }

    /// Timestamp column the age window is measured against.
    pub fn age_column(self) -> &'static str {
        match self {
            Domain::Operations | Domain::Invoicing => "ActionDate",
            Domain::Receivables => "ExtractionDate",
        }
    }

    pub fn expected_fields(self) -> &'static [&'static str] {
        match self {
            Domain::Operations => &[
                "ServerName",
                "DBName",
                "ClientTag",
                "ClientID",
                "ActionDate",
                "TotalLag",
                "CreatedClaims",
                "FiledClaims",
                "TotalDaysToFile",
                "HardCloseBatchDate",
                "ExtractionDate",
                "Processed",
                "OrgID",
                "LookupClientID",
            ],
            Domain::Invoicing => &[
                "ServerName",
                "DBName",
                "ClientID",
                "ClientTag",
                "ActionDate",
                "CleanRecords",
                "AllRecords",
                "Rejections",
                "FiledClaims",
                "HardCloseBatchDate",
                "Denials",
                "ProcessedLineItems",
                "ExtractionDate",
                "Processed",
                "OrgID",
                "ClientID2",
                "LookupClientID",
            ],
            Domain::Receivables => &[
                "ServerName",
                "DBName",
                "ClientID",
                "ClientTag",
                "HardCloseBatchDate",
                "YearNumber",
                "MonthNumber",
                "ARType",
                "ARAging_0to30",
                "ARAging_31to60",
                "ARAging_61to90",
                "ARAging_91to120",
                "ARAging_Over120",
                "TotalCharges",
                "DaysInRange",
                "ExtractionDate",
                "Processed",
                "OrgID",
                "LookupClientID",
            ],
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalKind {
    Timestamp,
    Date,
}

/// One column of a live target table, as reported by the target store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetColumn {
    pub name: String,
    pub declared_type: String,
}

impl TargetColumn {
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
        }
    }

    /// Classifies the declared type; `None` for every non date/time type.
    pub fn temporal_kind(&self) -> Option<TemporalKind> {
        match self.declared_type.trim().to_ascii_lowercase().as_str() {
            "date" => Some(TemporalKind::Date),
            "timestamptz"
            | "timestamp"
            | "timestamp with time zone"
            | "timestamp without time zone"
            | "datetimeoffset"
            | "datetime"
            | "datetime2"
            | "smalldatetime" => Some(TemporalKind::Timestamp),
            _ => None,
        }
    }

    pub fn is_processed_flag(&self) -> bool {
        self.name.eq_ignore_ascii_case(PROCESSED_FIELD)
    }
}

/// Ordered column list of a target table. Fetched live per load, never inferred
/// from the records being loaded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetColumnSchema {
    columns: Vec<TargetColumn>,
}

impl TargetColumnSchema {
    pub fn new(columns: Vec<TargetColumn>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[TargetColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// A load-ready scalar, typed for binding into the target store.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Nested arrays/objects, passed through as JSON text.
    Json(JsonValue),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

impl LoadValue {
    /// Pass-through conversion for non-temporal columns.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => LoadValue::Null,
            JsonValue::Bool(b) => LoadValue::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => LoadValue::Int(i),
                None => n.as_f64().map(LoadValue::Float).unwrap_or(LoadValue::Null),
            },
            JsonValue::String(s) => LoadValue::Text(s.clone()),
            other => LoadValue::Json(other.clone()),
        }
    }
}

/// A record reshaped to a target schema: one value per schema column, in
/// schema order, plus the injected processing-state flag.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRecord {
    pub values: Vec<(String, LoadValue)>,
    pub processed: bool,
}

impl LoadRecord {
    pub fn get(&self, column: &str) -> Option<&LoadValue> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Schema columns plus the processing-state flag.
    pub fn field_count(&self) -> usize {
        self.values.len() + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LoadResult {
    pub rows_affected: u64,
}
