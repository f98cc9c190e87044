//! Core domain model for the KEF assessment sheet importer.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kef-core";

/// Row 1 of every export is the header and is never imported.
pub const HEADER_ROW: u32 = 1;
pub const FIRST_DATA_ROW: u32 = HEADER_ROW + 1;

/// Domain tag reserved for metadata fields in the layout directory.
pub const METADATA_DOMAIN: &str = "MetaData";

/// Persisted singleton import configuration plus its progress cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCursor {
    pub source_url: String,
    pub last_row_processed: u32,
    pub poll_interval_secs: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportCursor {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// First row a cycle should attempt. The header row is skipped for any prior cursor value.
    pub fn next_row(&self) -> u32 {
        FIRST_DATA_ROW.max(self.last_row_processed.saturating_add(1))
    }

    /// One poll interval after `base`, saturating at the latest representable instant.
    pub fn next_cycle_from(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        let interval = i64::try_from(self.poll_interval_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX);
        base.checked_add_signed(interval)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Input for a new failure ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFailure {
    pub sheet_row_number: u32,
    pub raw_row_data: Vec<String>,
    pub row_fingerprint: String,
    pub error_message: String,
}

/// One per-row ingestion failure retained for manual recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedImport {
    pub id: i64,
    pub sheet_row_number: u32,
    pub raw_row_data: Vec<String>,
    pub row_fingerprint: String,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub resolved: bool,
    pub resolved_res_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataRole {
    School,
    Grade,
    Teacher,
    Assessment,
    Name,
    Date,
}

impl MetadataRole {
    /// Resolve a layout subdomain tag to a metadata role. Accepts the short tags and the
    /// longer labels the layout editor uses ("Student Name", "Teacher Name", "Assessment Type").
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "school" => Some(Self::School),
            "grade" => Some(Self::Grade),
            "teacher" | "teacher name" => Some(Self::Teacher),
            "assessment" | "assessment type" => Some(Self::Assessment),
            "name" | "student name" => Some(Self::Name),
            "date" => Some(Self::Date),
            _ => None,
        }
    }

}

/// A field definition from the date-scoped layout directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutField {
    pub field_id: u32,
    pub domain: String,
    pub subdomain: String,
    pub name: String,
    pub valid_from: NaiveDate,
    pub valid_to: NaiveDate,
}

impl LayoutField {
    /// Inclusive on both ends.
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.valid_from <= date && date <= self.valid_to
    }

    pub fn is_metadata(&self) -> bool {
        self.domain.trim().eq_ignore_ascii_case(METADATA_DOMAIN)
    }

    pub fn metadata_role(&self) -> Option<MetadataRole> {
        if !self.is_metadata() {
            return None;
        }
        MetadataRole::from_tag(&self.subdomain).or_else(|| MetadataRole::from_tag(&self.name))
    }
}

/// Normalized cell value: a numeric score or an opaque passthrough string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Score(f64),
    Text(String),
}

impl CellValue {
    pub fn as_score(&self) -> Option<f64> {
        match self {
            Self::Score(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Score(_) => None,
            Self::Text(v) => Some(v.as_str()),
        }
    }
}

/// Metadata snapshot copied onto every value of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMetadata {
    pub school: String,
    pub grade: String,
    pub teacher: String,
    pub assessment: String,
    pub name: String,
    /// Raw text of the sheet's own date column, when the layout defines one.
    pub date: String,
    /// Date taken from the row's column-1 timestamp; selects the applicable layout.
    pub effective_date: NaiveDate,
}

impl RowMetadata {
    pub fn empty(effective_date: NaiveDate) -> Self {
        Self {
            school: String::new(),
            grade: String::new(),
            teacher: String::new(),
            assessment: String::new(),
            name: String::new(),
            date: String::new(),
            effective_date,
        }
    }

    pub fn set(&mut self, role: MetadataRole, value: String) {
        match role {
            MetadataRole::School => self.school = value,
            MetadataRole::Grade => self.grade = value,
            MetadataRole::Teacher => self.teacher = value,
            MetadataRole::Assessment => self.assessment = value,
            MetadataRole::Name => self.name = value,
            MetadataRole::Date => self.date = value,
        }
    }
}

/// Mapper output for one sheet row, ready to be written as one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappedRow {
    pub sheet_row_number: u32,
    pub metadata: RowMetadata,
    pub res_fields: BTreeMap<u32, CellValue>,
}

/// A persisted record: one `res_id` with its metadata and normalized values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub res_id: i64,
    pub sheet_row_number: u32,
    pub metadata: RowMetadata,
    pub values: BTreeMap<u32, CellValue>,
    pub created_at: DateTime<Utc>,
}
