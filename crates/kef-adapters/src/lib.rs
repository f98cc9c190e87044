//! Row adapters: cell normalization and the positional row → record mapper.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use kef_core::{CellValue, MappedRow, MetadataRole, RowMetadata};
use kef_storage::{LayoutDirectory, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "kef-adapters";

/// Shortest needle allowed in a containment match. Keeps "no" from matching "unknown".
const MIN_SUBSTRING_LEN: usize = 3;
const RULES_VERSION: u32 = 1;

const BUILTIN_SCORES: &[(&str, f64)] = &[
    ("achieved", 1.0),
    ("fully achieved", 1.0),
    ("partially achieved", 0.5),
    ("in progress", 0.5),
    ("developing", 0.5),
    ("not achieved", 0.0),
    ("not yet", 0.0),
    ("learning", 0.0),
    ("yes", 1.0),
    ("no", 0.0),
    ("הושג", 1.0),
    ("הושג חלקית", 0.5),
    ("בתהליך", 0.5),
    ("לא הושג", 0.0),
    ("בלמידה", 0.0),
    ("כן", 1.0),
    ("לא", 0.0),
];

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing score rules: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unsupported score rules version {0}")]
    Version(u32),
    #[error("score rule #{index} ({label:?}): {reason}")]
    InvalidEntry {
        index: usize,
        label: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub label: String,
    pub score: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ScoreRulesFile {
    version: u32,
    #[serde(default)]
    entries: Vec<ScoreEntry>,
}

/// Textual achievement levels and the numeric score each one stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTable {
    exact: BTreeMap<String, f64>,
    /// Same keys, longest first, for containment matching.
    by_length: Vec<(String, f64)>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        let entries = BUILTIN_SCORES
            .iter()
            .map(|(label, score)| ScoreEntry {
                label: (*label).to_string(),
                score: *score,
            })
            .collect::<Vec<_>>();
        Self::build(entries)
    }
}

impl SymbolTable {
    pub fn from_entries(entries: Vec<ScoreEntry>) -> Result<Self, RulesError> {
        let mut seen: BTreeMap<String, f64> = BTreeMap::new();
        for (index, entry) in entries.iter().enumerate() {
            let key = fold(&entry.label);
            let invalid = |reason| RulesError::InvalidEntry {
                index,
                label: entry.label.clone(),
                reason,
            };
            if key.is_empty() {
                return Err(invalid("label is blank"));
            }
            if !is_score(entry.score) {
                return Err(invalid("score must be a finite number between 0 and 1"));
            }
            if let Some(prev) = seen.insert(key, entry.score) {
                if prev != entry.score {
                    return Err(invalid("label repeats with a different score"));
                }
            }
        }
        Ok(Self::build(entries))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, RulesError> {
        let file: ScoreRulesFile = serde_yaml::from_str(text)?;
        if file.version != RULES_VERSION {
            return Err(RulesError::Version(file.version));
        }
        Self::from_entries(file.entries)
    }

    pub fn from_path(path: &Path) -> Result<Self, RulesError> {
        let text = std::fs::read_to_string(path).map_err(|source| RulesError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    fn build(entries: Vec<ScoreEntry>) -> Self {
        let exact: BTreeMap<String, f64> = entries
            .into_iter()
            .map(|e| (fold(&e.label), e.score))
            .collect();
        let mut by_length: Vec<(String, f64)> =
            exact.iter().map(|(k, v)| (k.clone(), *v)).collect();
        by_length.sort_by(|a, b| {
            b.0.chars()
                .count()
                .cmp(&a.0.chars().count())
                .then_with(|| a.0.cmp(&b.0))
        });
        Self { exact, by_length }
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    /// Normalize one cell. Blank cells carry no value and yield `None`.
    ///
    /// First match wins: numeric parse within `[0, 1]`, exact label, containment either way
    /// (longest label first), otherwise the trimmed original text. Numbers outside the score
    /// range (counts, years) pass through as text.
    pub fn normalize(&self, raw: &str) -> Option<CellValue> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(number) = trimmed.parse::<f64>() {
            if is_score(number) {
                return Some(CellValue::Score(number));
            }
        }
        let folded = fold(trimmed);
        if let Some(score) = self.exact.get(&folded) {
            return Some(CellValue::Score(*score));
        }
        if let Some(score) = self.containment_match(&folded) {
            return Some(CellValue::Score(score));
        }
        Some(CellValue::Text(trimmed.to_string()))
    }

    fn containment_match(&self, folded: &str) -> Option<f64> {
        let cell_len = folded.chars().count();
        self.by_length.iter().find_map(|(label, score)| {
            let label_len = label.chars().count();
            let cell_has_label = label_len >= MIN_SUBSTRING_LEN && folded.contains(label.as_str());
            let label_has_cell = cell_len >= MIN_SUBSTRING_LEN && label.contains(folded);
            (cell_has_label || label_has_cell).then_some(*score)
        })
    }
}

fn is_score(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

fn fold(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Parse the column-1 timestamp into the date that selects the layout.
///
/// Form exports write day-first stamps (`12/8/2025 14:30:00`); ISO dates and RFC 3339
/// stamps are accepted for hand-maintained sheets.
pub fn parse_row_timestamp(raw: &str) -> Option<NaiveDate> {
    const DATETIME_FORMATS: &[&str] = &[
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d"];

    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(stamp) = DateTime::parse_from_rfc3339(value) {
        return Some(stamp.date_naive());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        })
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("invalid timestamp {value:?} in column 1")]
    InvalidTimestamp { value: String },
    #[error("no layout is valid on {date}; row does not match any configured layout window")]
    NoApplicableLayout { date: NaiveDate },
    #[error("layout field id {0} does not address a column (ids start at 1)")]
    InvalidFieldId(u32),
    #[error("layout lookup failed: {0}")]
    Layout(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    /// No non-empty cells; counts as processed, writes nothing.
    Blank,
    Mapped(MappedRow),
}

pub fn is_blank_row(raw_row: &[String]) -> bool {
    raw_row.iter().all(|cell| cell.trim().is_empty())
}

/// Maps raw sheet rows onto layout field ids by column position.
///
/// Column `i` (1-based) carries `field_id = i`. The row's own column-1 timestamp picks
/// which layout fields apply.
pub struct RowMapper {
    directory: Arc<dyn LayoutDirectory>,
    symbols: SymbolTable,
}

impl RowMapper {
    pub fn new(directory: Arc<dyn LayoutDirectory>, symbols: SymbolTable) -> Self {
        Self { directory, symbols }
    }

    pub async fn map_row(
        &self,
        sheet_row_number: u32,
        raw_row: &[String],
    ) -> Result<RowOutcome, MapError> {
        if is_blank_row(raw_row) {
            return Ok(RowOutcome::Blank);
        }

        let stamp = raw_row.first().map(String::as_str).unwrap_or_default();
        let effective_date =
            parse_row_timestamp(stamp).ok_or_else(|| MapError::InvalidTimestamp {
                value: stamp.to_string(),
            })?;

        let fields = self.directory.fields_valid_on(effective_date).await?;
        if let Some(bad) = fields.iter().find(|f| f.field_id == 0) {
            return Err(MapError::InvalidFieldId(bad.field_id));
        }

        let assessment_ids: BTreeSet<u32> = fields
            .iter()
            .filter(|f| !f.is_metadata())
            .map(|f| f.field_id)
            .collect();
        if assessment_ids.is_empty() {
            return Err(MapError::NoApplicableLayout {
                date: effective_date,
            });
        }

        let mut roles: BTreeMap<MetadataRole, u32> = BTreeMap::new();
        let mut metadata_fields: Vec<_> = fields.iter().filter(|f| f.is_metadata()).collect();
        metadata_fields.sort_by_key(|f| f.field_id);
        for field in metadata_fields {
            if let Some(role) = field.metadata_role() {
                roles.entry(role).or_insert(field.field_id);
            }
        }

        let mut metadata = RowMetadata::empty(effective_date);
        for (role, field_id) in &roles {
            if let Some(cell) = column(raw_row, *field_id) {
                metadata.set(*role, cell.trim().to_string());
            }
        }

        let mut res_fields = BTreeMap::new();
        for field_id in assessment_ids {
            let Some(cell) = column(raw_row, field_id) else {
                continue;
            };
            if let Some(value) = self.symbols.normalize(cell) {
                res_fields.insert(field_id, value);
            }
        }

        Ok(RowOutcome::Mapped(MappedRow {
            sheet_row_number,
            metadata,
            res_fields,
        }))
    }
}

fn column(raw_row: &[String], field_id: u32) -> Option<&str> {
    let index = usize::try_from(field_id).ok()?.checked_sub(1)?;
    raw_row.get(index).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kef_core::LayoutField;
    use kef_storage::MemoryStore;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn field(
        id: u32,
        domain: &str,
        subdomain: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> LayoutField {
        LayoutField {
            field_id: id,
            domain: domain.into(),
            subdomain: subdomain.into(),
            name: subdomain.into(),
            valid_from: from,
            valid_to: to,
        }
    }

    fn term_layout() -> Vec<LayoutField> {
        let (from, to) = (day(2025, 8, 1), day(2025, 12, 31));
        vec![
            field(2, "MetaData", "School", from, to),
            field(3, "MetaData", "Grade", from, to),
            field(4, "MetaData", "Teacher", from, to),
            field(5, "MetaData", "Name", from, to),
            field(6, "Literacy", "Phonics", from, to),
            field(7, "Literacy", "Reading", from, to),
            field(8, "Numeracy", "Counting", from, to),
        ]
    }

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn mapper(fields: Vec<LayoutField>) -> RowMapper {
        RowMapper::new(Arc::new(MemoryStore::with_layout(fields)), SymbolTable::default())
    }

    #[test]
    fn numbers_and_labels_normalize_to_the_same_score() {
        let table = SymbolTable::default();
        assert_eq!(table.normalize("1"), table.normalize(" achieved "));
        assert_eq!(table.normalize("1"), Some(CellValue::Score(1.0)));
        assert_eq!(table.normalize("0.5"), Some(CellValue::Score(0.5)));
        assert_eq!(table.normalize("In  Progress"), Some(CellValue::Score(0.5)));
        assert_eq!(table.normalize("בתהליך"), Some(CellValue::Score(0.5)));
    }

    #[test]
    fn unmatched_text_passes_through_trimmed() {
        let table = SymbolTable::default();
        assert_eq!(table.normalize("xyz123"), Some(CellValue::Text("xyz123".into())));
        assert_eq!(table.normalize("  Year 3 "), Some(CellValue::Text("Year 3".into())));
        assert_eq!(table.normalize("unknown"), Some(CellValue::Text("unknown".into())));
        assert_eq!(table.normalize("NaN"), Some(CellValue::Text("NaN".into())));
    }

    #[test]
    fn numbers_outside_the_score_range_stay_text() {
        let table = SymbolTable::default();
        assert_eq!(table.normalize("7"), Some(CellValue::Text("7".into())));
        assert_eq!(table.normalize("-3"), Some(CellValue::Text("-3".into())));
        assert_eq!(table.normalize(" 2025 "), Some(CellValue::Text("2025".into())));
        assert_eq!(table.normalize("1.0"), Some(CellValue::Score(1.0)));
        assert_eq!(table.normalize("0"), Some(CellValue::Score(0.0)));
    }

    #[test]
    fn blank_cells_carry_no_value() {
        let table = SymbolTable::default();
        assert_eq!(table.normalize(""), None);
        assert_eq!(table.normalize("   \t"), None);
    }

    #[test]
    fn containment_prefers_the_longest_label() {
        let table = SymbolTable::default();
        assert_eq!(table.normalize("Not achieved yet"), Some(CellValue::Score(0.0)));
        assert_eq!(table.normalize("achieved!"), Some(CellValue::Score(1.0)));
        assert_eq!(table.normalize("לא הושג עדיין"), Some(CellValue::Score(0.0)));
        assert_eq!(table.normalize("progress"), Some(CellValue::Score(0.5)));
    }

    #[test]
    fn rules_file_is_validated() {
        let table = SymbolTable::from_yaml_str(
            "version: 1\nentries:\n  - label: Secure\n    score: 1\n  - label: Emerging\n    score: 0.25\n",
        )
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.normalize("secure"), Some(CellValue::Score(1.0)));
        assert_eq!(table.normalize("achieved"), Some(CellValue::Text("achieved".into())));

        let err = SymbolTable::from_yaml_str("version: 1\nentries:\n  - label: x\n    score: 2\n")
            .unwrap_err();
        assert!(matches!(err, RulesError::InvalidEntry { index: 0, .. }));
        let err = SymbolTable::from_yaml_str("version: 2\nentries: []\n").unwrap_err();
        assert!(matches!(err, RulesError::Version(2)));
        let err = SymbolTable::from_yaml_str(
            "version: 1\nentries:\n  - label: Yes\n    score: 1\n  - label: yes\n    score: 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, RulesError::InvalidEntry { index: 1, .. }));
    }

    #[test]
    fn rules_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.yaml");
        std::fs::write(&path, "version: 1\nentries:\n  - label: done\n    score: 1\n").unwrap();
        let table = SymbolTable::from_path(&path).unwrap();
        assert_eq!(table.normalize("Done"), Some(CellValue::Score(1.0)));

        let missing = SymbolTable::from_path(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, RulesError::Io { .. }));
    }

    #[test]
    fn timestamps_parse_day_first_and_iso() {
        assert_eq!(parse_row_timestamp("12/08/2025 14:30:00"), Some(day(2025, 8, 12)));
        assert_eq!(parse_row_timestamp("3/9/2025 9:05:00"), Some(day(2025, 9, 3)));
        assert_eq!(parse_row_timestamp("3/9/2025 9:05"), Some(day(2025, 9, 3)));
        assert_eq!(parse_row_timestamp("3/9/2025"), Some(day(2025, 9, 3)));
        assert_eq!(parse_row_timestamp("2025-09-03 09:05:00"), Some(day(2025, 9, 3)));
        assert_eq!(parse_row_timestamp("2025-09-03T09:05:00+03:00"), Some(day(2025, 9, 3)));
        assert_eq!(parse_row_timestamp("2025-09-03"), Some(day(2025, 9, 3)));
        assert_eq!(parse_row_timestamp("31/02/2025 10:00:00"), None);
        assert_eq!(parse_row_timestamp("yesterday"), None);
        assert_eq!(parse_row_timestamp(""), None);
    }

    #[tokio::test]
    async fn maps_columns_to_field_ids_by_position() {
        let mapper = mapper(term_layout());
        let raw = row(&[
            "12/08/2025 14:30:00",
            "Hillside",
            "Year 2",
            "Ms. Cohen",
            "Dana Levi",
            "achieved",
            "",
            "0.5",
        ]);
        let RowOutcome::Mapped(mapped) = mapper.map_row(2, &raw).await.unwrap() else {
            panic!("expected a mapped row");
        };
        assert_eq!(mapped.sheet_row_number, 2);
        assert_eq!(mapped.metadata.school, "Hillside");
        assert_eq!(mapped.metadata.grade, "Year 2");
        assert_eq!(mapped.metadata.teacher, "Ms. Cohen");
        assert_eq!(mapped.metadata.name, "Dana Levi");
        assert_eq!(mapped.metadata.effective_date, day(2025, 8, 12));
        assert_eq!(
            mapped.res_fields.into_iter().collect::<Vec<_>>(),
            vec![(6, CellValue::Score(1.0)), (8, CellValue::Score(0.5))]
        );
    }

    #[tokio::test]
    async fn short_rows_skip_missing_columns() {
        let mapper = mapper(term_layout());
        let raw = row(&["12/08/2025 14:30:00", "Hillside", "", "", "", "learning"]);
        let RowOutcome::Mapped(mapped) = mapper.map_row(3, &raw).await.unwrap() else {
            panic!("expected a mapped row");
        };
        assert_eq!(mapped.res_fields.len(), 1);
        assert_eq!(mapped.res_fields.get(&6), Some(&CellValue::Score(0.0)));
    }

    #[tokio::test]
    async fn metadata_is_read_raw_not_normalized() {
        let mapper = mapper(term_layout());
        let raw = row(&["12/08/2025 14:30:00", "1", "achieved", "", "", "1"]);
        let RowOutcome::Mapped(mapped) = mapper.map_row(2, &raw).await.unwrap() else {
            panic!("expected a mapped row");
        };
        assert_eq!(mapped.metadata.school, "1");
        assert_eq!(mapped.metadata.grade, "achieved");
    }

    #[tokio::test]
    async fn blank_rows_are_a_no_op() {
        let mapper = mapper(term_layout());
        assert_eq!(mapper.map_row(9, &row(&["", "  ", ""])).await.unwrap(), RowOutcome::Blank);
        assert_eq!(mapper.map_row(9, &[]).await.unwrap(), RowOutcome::Blank);
    }

    #[tokio::test]
    async fn unparseable_timestamp_fails_the_row() {
        let mapper = mapper(term_layout());
        let err = mapper
            .map_row(3, &row(&["not a date", "Hillside", "", "", "", "1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::InvalidTimestamp { ref value } if value == "not a date"));
    }

    #[tokio::test]
    async fn rows_outside_every_window_have_no_layout() {
        let mapper = mapper(term_layout());
        let err = mapper
            .map_row(2, &row(&["12/01/2026 10:00:00", "Hillside", "", "", "", "1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::NoApplicableLayout { date } if date == day(2026, 1, 12)));
    }

    #[tokio::test]
    async fn metadata_only_layouts_do_not_apply() {
        let (from, to) = (day(2025, 1, 1), day(2025, 12, 31));
        let mapper = mapper(vec![field(2, "MetaData", "School", from, to)]);
        let err = mapper
            .map_row(2, &row(&["12/08/2025 14:30:00", "Hillside"]))
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::NoApplicableLayout { .. }));
    }

    #[tokio::test]
    async fn field_id_zero_is_rejected() {
        let (from, to) = (day(2025, 1, 1), day(2025, 12, 31));
        let mapper = mapper(vec![field(0, "Literacy", "Phonics", from, to)]);
        let err = mapper
            .map_row(2, &row(&["12/08/2025 14:30:00", "1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, MapError::InvalidFieldId(0)));
    }

    #[tokio::test]
    async fn layout_window_follows_the_row_timestamp() {
        let mut fields = term_layout();
        fields.push(field(6, "Literacy", "Phonics v2", day(2026, 1, 1), day(2026, 6, 30)));
        fields.push(field(9, "Literacy", "Fluency", day(2026, 1, 1), day(2026, 6, 30)));
        let mapper = mapper(fields);
        let raw = row(&[
            "15/02/2026 08:00:00",
            "Hillside",
            "Year 2",
            "",
            "",
            "1",
            "1",
            "1",
            "0",
        ]);
        let RowOutcome::Mapped(mapped) = mapper.map_row(4, &raw).await.unwrap() else {
            panic!("expected a mapped row");
        };
        assert_eq!(mapped.res_fields.keys().copied().collect::<Vec<_>>(), vec![6, 9]);
        assert_eq!(mapped.metadata.school, "", "term-1 metadata fields are out of window");
    }
}
