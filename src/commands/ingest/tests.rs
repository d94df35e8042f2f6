use super::*;

use anyhow::Result;
use crate::model::{RECORD_TYPE_CONTEXT, RECORD_TYPE_POLICY_ENTRY};

/// In-memory page source: one optional text page followed by table pages.
struct FixtureSource {
    intro_text: Option<String>,
    tables: Vec<Option<Vec<RawRow>>>,
}

impl FixtureSource {
    fn new(intro_text: Option<&str>, tables: Vec<Option<Vec<RawRow>>>) -> Self {
        Self {
            intro_text: intro_text.map(str::to_string),
            tables,
        }
    }
}

impl PageSource for FixtureSource {
    fn page_count(&self) -> usize {
        1 + self.tables.len()
    }

    fn page_text(&self, page_index: usize) -> Result<Option<String>> {
        if page_index == 0 {
            Ok(self.intro_text.clone())
        } else {
            Ok(None)
        }
    }

    fn page_table(&self, page_index: usize) -> Result<Option<Vec<RawRow>>> {
        if page_index == 0 {
            return Ok(None);
        }
        Ok(self.tables.get(page_index - 1).cloned().flatten())
    }
}

fn row(cells: &[Option<&str>]) -> RawRow {
    cells
        .iter()
        .map(|cell| cell.map(str::to_string))
        .collect()
}

fn header_row() -> RawRow {
    row(&[
        Some("S.No"),
        Some("Chapter"),
        Some("ITC(HS) Code"),
        Some("Description"),
        Some("Export Policy"),
        Some("Condition"),
    ])
}

#[test]
fn normalize_cell_maps_null_and_blank_to_na() {
    assert_eq!(normalize_cell(None), "N/A");
    assert_eq!(normalize_cell(Some("")), "N/A");
    assert_eq!(normalize_cell(Some("   ")), "N/A");
}

#[test]
fn normalize_cell_collapses_newlines_and_trims() {
    assert_eq!(
        normalize_cell(Some("  Natural\nRubber latex \n")),
        "Natural Rubber latex"
    );
}

#[test]
fn normalize_cell_is_idempotent() {
    for input in [
        None,
        Some(""),
        Some("  "),
        Some("Restricted"),
        Some("Natural\nRubber"),
        Some(" MEP Applies \n"),
    ] {
        let once = normalize_cell(input);
        let twice = normalize_cell(Some(once.as_str()));
        assert_eq!(once, twice, "input {input:?}");
    }
}

#[test]
fn header_rows_match_marker_substrings_case_insensitively() {
    assert!(is_header_row(&row(&[Some("1"), Some("Item DESCRIPTION")])));
    assert!(is_header_row(&row(&[None, Some("Export Policy")])));
    assert!(is_header_row(&row(&[Some("ITC(HS)"), None])));
    assert!(!is_header_row(&row(&[
        Some("12"),
        Some("40011000"),
        Some("Natural Rubber"),
        Some("Free"),
    ])));
}

#[test]
fn all_null_row_is_not_classified_as_header() {
    // Concatenation of an all-null row is "", which contains no marker; the
    // row is dropped later by the ITC-code filter instead.
    assert!(!is_header_row(&row(&[None, None, None, None, None])));
}

#[test]
fn header_markers_spanning_cells_still_match() {
    // Concatenation is separator-free, so "itc(" + "hs)" across two cells
    // forms the marker.
    assert!(is_header_row(&row(&[Some("itc("), Some("hs)")])));
}

#[test]
fn chapter_carry_updates_on_digit_cells_only() {
    let mut carry = ChapterCarry::new();
    assert_eq!(carry.last_chapter(), "N/A");

    carry.observe(Some(" 11 "));
    assert_eq!(carry.last_chapter(), "11");

    carry.observe(None);
    carry.observe(Some(""));
    carry.observe(Some("Chapter 12"));
    carry.observe(Some("12a"));
    assert_eq!(carry.last_chapter(), "11");

    carry.observe(Some("12"));
    assert_eq!(carry.last_chapter(), "12");
}

#[test]
fn header_row_skip_leaves_carry_untouched() {
    let mut carry = ChapterCarry::new();
    carry.observe(Some("7"));

    // First cell is a digit string, but the marker match wins before any
    // extraction happens.
    let outcome = process_row(
        &row(&[Some("9"), Some("ITC(HS) Code"), Some("Description"), Some("Policy")]),
        2,
        &mut carry,
    );

    assert_eq!(outcome, RowOutcome::Skipped(SkipReason::HeaderRow));
    assert_eq!(carry.last_chapter(), "7");
}

#[test]
fn short_row_skip_leaves_carry_untouched() {
    let mut carry = ChapterCarry::new();
    carry.observe(Some("7"));

    for short in [
        row(&[Some("8")]),
        row(&[Some("8"), Some("40011000")]),
        row(&[Some("8"), Some("40011000"), Some("Natural Rubber")]),
    ] {
        let outcome = process_row(&short, 2, &mut carry);
        assert_eq!(outcome, RowOutcome::Skipped(SkipReason::TooFewColumns));
        assert_eq!(carry.last_chapter(), "7");
    }
}

#[test]
fn missing_itc_code_skips_but_chapter_still_carries_forward() {
    let mut carry = ChapterCarry::new();

    let outcome = process_row(
        &row(&[Some("40"), None, Some("continuation text"), Some("Free")]),
        3,
        &mut carry,
    );

    assert_eq!(outcome, RowOutcome::Skipped(SkipReason::MissingItcCode));
    assert_eq!(carry.last_chapter(), "40");

    // Single-character codes fail the normalized length filter too.
    let outcome = process_row(
        &row(&[None, Some("x"), Some("stray"), Some("Free")]),
        3,
        &mut carry,
    );
    assert_eq!(outcome, RowOutcome::Skipped(SkipReason::MissingItcCode));
}

#[test]
fn all_blank_row_is_dropped_by_the_itc_filter() {
    let mut carry = ChapterCarry::new();

    for blank in [
        row(&[None, None, None, None, None]),
        row(&[Some(""), Some(""), Some(""), Some(""), Some("")]),
    ] {
        let outcome = process_row(&blank, 4, &mut carry);
        assert_eq!(outcome, RowOutcome::Skipped(SkipReason::MissingItcCode));
    }
    assert_eq!(carry.last_chapter(), "N/A");
}

#[test]
fn whitespace_only_itc_code_currently_passes_the_filter() {
    // Boundary behavior inherited from the source tables: "  " normalizes to
    // "N/A" (length 3) and the raw cell is non-empty, so a record is emitted.
    let mut carry = ChapterCarry::new();

    let outcome = process_row(
        &row(&[Some("5"), Some("  "), Some("odd row"), Some("Free")]),
        4,
        &mut carry,
    );

    match outcome {
        RowOutcome::Record(record) => {
            assert_eq!(record.metadata.itc_code.as_deref(), Some("N/A"));
        }
        other => panic!("expected a record, got {other:?}"),
    }
}

#[test]
fn emitted_record_matches_the_fixed_template() {
    let mut carry = ChapterCarry::new();
    carry.observe(Some("11"));

    let outcome = process_row(
        &row(&[
            Some("12"),
            Some("2903"),
            Some("Natural Rubber"),
            Some("Restricted"),
            Some("MEP Applies"),
        ]),
        3,
        &mut carry,
    );

    let RowOutcome::Record(record) = outcome else {
        panic!("expected a record");
    };

    assert_eq!(
        record.content,
        "Export Policy Details:\n\
         Chapter: 12\n\
         ITC(HS) Code: 2903\n\
         Item Description: Natural Rubber\n\
         Export Policy: Restricted\n\
         Policy Conditions: MEP Applies"
    );

    let meta = &record.metadata;
    assert_eq!(meta.page, 3);
    assert_eq!(meta.record_type, RECORD_TYPE_POLICY_ENTRY);
    assert_eq!(meta.itc_code.as_deref(), Some("2903"));
    assert_eq!(meta.policy.as_deref(), Some("Restricted"));
    assert_eq!(meta.chapter.as_deref(), Some("12"));
}

#[test]
fn absent_condition_column_defaults_to_the_literal_none() {
    let mut carry = ChapterCarry::new();

    let outcome = process_row(
        &row(&[Some("40"), Some("40011000"), Some("Latex"), Some("Free")]),
        2,
        &mut carry,
    );

    let RowOutcome::Record(record) = outcome else {
        panic!("expected a record");
    };
    assert!(record.content.ends_with("Policy Conditions: None"));
}

#[test]
fn null_condition_cell_normalizes_to_na() {
    let mut carry = ChapterCarry::new();

    let outcome = process_row(
        &row(&[Some("40"), Some("40011000"), Some("Latex"), Some("Free"), None]),
        2,
        &mut carry,
    );

    let RowOutcome::Record(record) = outcome else {
        panic!("expected a record");
    };
    assert!(record.content.ends_with("Policy Conditions: N/A"));
}

#[test]
fn chapter_is_a_step_function_of_row_position() {
    let source = FixtureSource::new(
        None,
        vec![Some(vec![
            row(&[Some("11"), Some("10011100"), Some("Durum wheat"), Some("Free")]),
            row(&[None, Some("10011900"), Some("Other wheat"), Some("Free")]),
            row(&[Some(""), Some("10019100"), Some("Seed"), Some("Restricted")]),
            row(&[Some("12"), Some("12024210"), Some("Groundnut kernels"), Some("Free")]),
            row(&[None, Some("12024220"), Some("Groundnut split"), Some("Free")]),
        ])],
    );

    let outcome = parse_document(&source).unwrap();
    let chapters = outcome
        .records
        .iter()
        .map(|record| record.metadata.chapter.as_deref().unwrap().to_string())
        .collect::<Vec<String>>();

    assert_eq!(chapters, ["11", "11", "11", "12", "12"]);
}

#[test]
fn carry_state_spans_page_boundaries() {
    let source = FixtureSource::new(
        None,
        vec![
            Some(vec![row(&[
                Some("29"),
                Some("29031200"),
                Some("Chloroform"),
                Some("Restricted"),
            ])]),
            Some(vec![row(&[
                None,
                Some("29031300"),
                Some("Carbon tetrachloride"),
                Some("Restricted"),
            ])]),
        ],
    );

    let outcome = parse_document(&source).unwrap();
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(outcome.records[1].metadata.chapter.as_deref(), Some("29"));
    assert_eq!(outcome.records[1].metadata.page, 3);
}

#[test]
fn malformed_row_is_isolated_from_its_neighbors() {
    let source = FixtureSource::new(
        None,
        vec![Some(vec![
            row(&[Some("11"), Some("10011100"), Some("Durum wheat"), Some("Free")]),
            row(&[Some("99")]),
            row(&[None, Some("10011900"), Some("Other wheat"), Some("Free")]),
        ])],
    );

    let outcome = parse_document(&source).unwrap();
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(outcome.stats.short_rows_skipped, 1);
    // The one-cell row neither emitted a record nor disturbed the carry
    // state, digit first cell notwithstanding.
    assert_eq!(outcome.records[1].metadata.chapter.as_deref(), Some("11"));
}

#[test]
fn context_record_precedes_all_policy_entries() {
    let source = FixtureSource::new(
        Some("Notice No. 05/2026 regarding Schedule-II."),
        vec![Some(vec![
            header_row(),
            row(&[Some("40"), Some("40011000"), Some("Latex"), Some("Free")]),
        ])],
    );

    let outcome = parse_document(&source).unwrap();
    assert_eq!(outcome.records.len(), 2);

    let first = &outcome.records[0];
    assert_eq!(first.metadata.record_type, RECORD_TYPE_CONTEXT);
    assert_eq!(first.metadata.page, 1);
    assert_eq!(first.metadata.source.as_deref(), Some("page_1_intro"));
    assert_eq!(
        first.content,
        "Notification Context (Page 1):\nNotice No. 05/2026 regarding Schedule-II."
    );

    assert_eq!(outcome.records[1].metadata.record_type, RECORD_TYPE_POLICY_ENTRY);
    assert_eq!(outcome.stats.header_rows_skipped, 1);
}

#[test]
fn empty_page_one_text_emits_no_context_record() {
    let source = FixtureSource::new(
        None,
        vec![Some(vec![row(&[
            Some("40"),
            Some("40011000"),
            Some("Latex"),
            Some("Free"),
        ])])],
    );

    let outcome = parse_document(&source).unwrap();
    assert_eq!(outcome.stats.context_records, 0);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].metadata.record_type, RECORD_TYPE_POLICY_ENTRY);
}

#[test]
fn pages_without_tables_are_skipped_silently() {
    let source = FixtureSource::new(
        Some("intro"),
        vec![
            None,
            Some(Vec::new()),
            Some(vec![row(&[
                Some("40"),
                Some("40011000"),
                Some("Latex"),
                Some("Free"),
            ])]),
        ],
    );

    let outcome = parse_document(&source).unwrap();
    assert_eq!(outcome.stats.pages_without_tables, 2);
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(outcome.records[1].metadata.page, 4);
}

#[test]
fn records_keep_page_then_row_order() {
    let source = FixtureSource::new(
        Some("intro"),
        vec![
            Some(vec![
                row(&[Some("1"), Some("01012100"), Some("Horses"), Some("Free")]),
                row(&[None, Some("01012910"), Some("Ponies"), Some("Restricted")]),
            ]),
            Some(vec![row(&[
                Some("2"),
                Some("02011000"),
                Some("Carcasses"),
                Some("Prohibited"),
            ])]),
        ],
    );

    let outcome = parse_document(&source).unwrap();
    let pages = outcome
        .records
        .iter()
        .map(|record| record.metadata.page)
        .collect::<Vec<i64>>();
    assert_eq!(pages, [1, 2, 2, 3]);

    let codes = outcome
        .records
        .iter()
        .skip(1)
        .map(|record| record.metadata.itc_code.as_deref().unwrap().to_string())
        .collect::<Vec<String>>();
    assert_eq!(codes, ["01012100", "01012910", "02011000"]);
}

#[test]
fn skip_counters_track_each_reason() {
    let source = FixtureSource::new(
        None,
        vec![Some(vec![
            header_row(),
            row(&[Some("40"), Some("40011000"), Some("Latex"), Some("Free")]),
            row(&[Some("41")]),
            row(&[None, None, Some("continuation"), Some("")]),
        ])],
    );

    let outcome = parse_document(&source).unwrap();
    assert_eq!(outcome.stats.policy_entry_records, 1);
    assert_eq!(outcome.stats.header_rows_skipped, 1);
    assert_eq!(outcome.stats.short_rows_skipped, 1);
    assert_eq!(outcome.stats.missing_itc_rows_skipped, 1);
}
