use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use kef_adapters::{MapError, RowMapper, RowOutcome, SymbolTable};
use kef_core::{CellValue, LayoutField};
use kef_storage::{parse_csv_rows, MemoryStore};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn term_one_layout() -> Vec<LayoutField> {
    let from = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
    let to = NaiveDate::from_ymd_opt(2025, 12, 31).unwrap();
    [
        (2, "MetaData", "School"),
        (3, "MetaData", "Grade"),
        (4, "MetaData", "Teacher"),
        (5, "MetaData", "Student Name"),
        (6, "Literacy", "Letter sounds"),
        (7, "Literacy", "Blending"),
        (8, "Numeracy", "Counting to 20"),
        (9, "Numeracy", "Number bonds"),
        (10, "Notes", "Comments"),
    ]
    .into_iter()
    .map(|(id, domain, name)| LayoutField {
        field_id: id,
        domain: domain.to_string(),
        subdomain: name.to_string(),
        name: name.to_string(),
        valid_from: from,
        valid_to: to,
    })
    .collect()
}

#[test]
fn bundled_score_rules_match_the_builtin_table() {
    let table = SymbolTable::from_path(&workspace_root().join("rules/scores.yaml")).unwrap();
    assert_eq!(table, SymbolTable::default());
}

#[tokio::test]
async fn sample_export_maps_row_by_row() {
    let body = std::fs::read(workspace_root().join("fixtures/sample-export.csv")).unwrap();
    let rows = parse_csv_rows(&body).unwrap();
    assert_eq!(rows.len(), 7, "header plus six data rows");

    let mapper = RowMapper::new(
        Arc::new(MemoryStore::with_layout(term_one_layout())),
        SymbolTable::default(),
    );

    let mut outcomes = Vec::new();
    for (index, raw) in rows.iter().enumerate().skip(1) {
        outcomes.push(mapper.map_row(index as u32 + 1, raw).await);
    }

    let Ok(RowOutcome::Mapped(dana)) = &outcomes[0] else {
        panic!("row 2 should map: {:?}", outcomes[0]);
    };
    assert_eq!(dana.metadata.name, "Dana Levi");
    assert_eq!(dana.metadata.teacher, "Ms. Cohen");
    assert_eq!(dana.res_fields.get(&6), Some(&CellValue::Score(1.0)));
    assert_eq!(dana.res_fields.get(&7), Some(&CellValue::Score(0.5)));
    assert_eq!(
        dana.res_fields.get(&10),
        Some(&CellValue::Text("Confident, reads aloud".into()))
    );

    let Ok(RowOutcome::Mapped(omer)) = &outcomes[1] else {
        panic!("row 3 should map: {:?}", outcomes[1]);
    };
    let scores: Vec<f64> = omer.res_fields.values().filter_map(CellValue::as_score).collect();
    assert_eq!(scores, vec![0.5, 0.0, 0.0, 0.0]);
    assert!(!omer.res_fields.contains_key(&10));

    assert!(matches!(outcomes[2], Err(MapError::InvalidTimestamp { .. })));
    assert!(matches!(outcomes[3], Ok(RowOutcome::Blank)));

    let Ok(RowOutcome::Mapped(yael)) = &outcomes[4] else {
        panic!("row 6 should map: {:?}", outcomes[4]);
    };
    assert_eq!(
        yael.metadata.effective_date,
        NaiveDate::from_ymd_opt(2025, 9, 3).unwrap()
    );
    assert_eq!(yael.metadata.school, "Riverside");
    assert!(!yael.res_fields.contains_key(&8));

    assert!(matches!(
        outcomes[5],
        Err(MapError::NoApplicableLayout { .. })
    ));
}
