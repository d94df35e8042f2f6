use anyhow::Result;

use crate::model::{RecordMetadata, SemanticRecord};

/// One raw table row as delivered by the extractor. Cells are positional:
/// `[chapter, itc_code, description, policy, condition, ...]`. The mapping is
/// fixed even though some notices carry a leading serial-number column; the
/// source tables are not reliable enough to detect the shift. Known fragility.
pub type RawRow = Vec<Option<String>>;

/// Page-level extraction seam. Page indices are 0-based; the pipeline reads
/// the text layer of page 0 only and asks for one table per later page.
pub trait PageSource {
    fn page_count(&self) -> usize;
    fn page_text(&self, page_index: usize) -> Result<Option<String>>;
    fn page_table(&self, page_index: usize) -> Result<Option<Vec<RawRow>>>;
}

pub const CONTEXT_SOURCE: &str = "page_1_intro";

const HEADER_MARKERS: [&str; 3] = ["description", "export policy", "itc(hs)"];

/// Null, empty, or whitespace-only cells normalize to "N/A"; anything else
/// has newlines collapsed to spaces and surrounding whitespace trimmed.
/// Idempotent: normalize(normalize(x)) == normalize(x).
pub fn normalize_cell(cell: Option<&str>) -> String {
    let Some(value) = cell else {
        return "N/A".to_string();
    };

    let collapsed = value.replace('\n', " ");
    let trimmed = collapsed.trim();
    if trimmed.is_empty() {
        "N/A".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Column-header and repeated-banner detection. Matches on the separator-free
/// concatenation of the non-null cells, case-insensitive. An all-null row
/// concatenates to "" and is never flagged here; it falls through to the
/// ITC-code filter instead.
pub fn is_header_row(row: &[Option<String>]) -> bool {
    let mut concatenated = String::new();
    for cell in row.iter().flatten() {
        concatenated.push_str(cell);
    }

    let lowered = concatenated.to_lowercase();
    HEADER_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Forward-fill state for the chapter column. Merged cells in the source
/// tables leave the chapter blank on continuation rows, so the last seen
/// all-digit value carries forward for the rest of the document. Strictly
/// forward-only; never cleared within a run.
#[derive(Debug, Clone)]
pub struct ChapterCarry {
    last_chapter: String,
}

impl ChapterCarry {
    pub fn new() -> Self {
        Self {
            last_chapter: "N/A".to_string(),
        }
    }

    pub fn last_chapter(&self) -> &str {
        &self.last_chapter
    }

    pub fn observe(&mut self, chapter_cell: Option<&str>) {
        let Some(raw) = chapter_cell else {
            return;
        };

        let trimmed = raw.trim();
        if !trimmed.is_empty() && trimmed.chars().all(|character| character.is_ascii_digit()) {
            self.last_chapter = trimmed.to_string();
        }
    }
}

impl Default for ChapterCarry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    HeaderRow,
    TooFewColumns,
    MissingItcCode,
}

/// Typed per-row result so the dispatcher counts skips instead of catching
/// control-flow errors. Malformed rows are expected in these tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Record(SemanticRecord),
    Skipped(SkipReason),
}

/// Full per-row path: header check, positional extraction, chapter
/// forward-fill, garbage filter, record assembly.
///
/// Ordering matters: header rows return before any extraction and never touch
/// the carry state; rows missing required columns return before the carry
/// update; rows failing the ITC filter return after it, so their chapter
/// value still carries forward.
pub fn process_row(row: &[Option<String>], page_number: i64, carry: &mut ChapterCarry) -> RowOutcome {
    if is_header_row(row) {
        return RowOutcome::Skipped(SkipReason::HeaderRow);
    }

    // Positions 0..=3 are required; a shorter row is a merged or stray
    // formatting row and is dropped whole, carry state untouched.
    if row.len() < 4 {
        return RowOutcome::Skipped(SkipReason::TooFewColumns);
    }

    let chapter_cell = row[0].as_deref();
    let itc_code = row[1].as_deref();
    let description = row[2].as_deref();
    let policy = row[3].as_deref();
    let condition = if row.len() > 4 {
        row[4].as_deref()
    } else {
        // Absent condition column maps to the literal string "None", not to
        // a null cell.
        Some("None")
    };

    carry.observe(chapter_cell);

    // Continuation-of-description rows have no ITC code of their own. A
    // whitespace-only code slips through as "N/A" (length 3); that mirrors
    // the source tables' behavior and stays until a product owner rules on it.
    let itc_missing = itc_code.map(str::is_empty).unwrap_or(true);
    if itc_missing || normalize_cell(itc_code).len() < 2 {
        return RowOutcome::Skipped(SkipReason::MissingItcCode);
    }

    let chapter = carry.last_chapter().to_string();
    let itc_code_norm = normalize_cell(itc_code);
    let policy_norm = normalize_cell(policy);

    let content = format!(
        "Export Policy Details:\n\
         Chapter: {chapter}\n\
         ITC(HS) Code: {itc_code_norm}\n\
         Item Description: {description}\n\
         Export Policy: {policy_norm}\n\
         Policy Conditions: {condition}",
        description = normalize_cell(description),
        condition = normalize_cell(condition),
    );

    RowOutcome::Record(SemanticRecord {
        content,
        metadata: RecordMetadata::policy_entry(page_number, itc_code_norm, policy_norm, chapter),
    })
}

#[derive(Debug, Default, Clone)]
pub struct ParseStats {
    pub context_records: usize,
    pub policy_entry_records: usize,
    pub header_rows_skipped: usize,
    pub short_rows_skipped: usize,
    pub missing_itc_rows_skipped: usize,
    pub pages_without_tables: usize,
}

#[derive(Debug)]
pub struct ParseOutcome {
    pub records: Vec<SemanticRecord>,
    pub stats: ParseStats,
}

/// Single sequential pass over the document. Page 1 contributes at most one
/// context record; every later page contributes its table rows in order.
/// Sequential processing is required, not incidental: the chapter carry is a
/// single ordered state value shared by every row.
pub fn parse_document(source: &dyn PageSource) -> Result<ParseOutcome> {
    let mut records = Vec::<SemanticRecord>::new();
    let mut stats = ParseStats::default();
    let mut carry = ChapterCarry::new();

    for page_index in 0..source.page_count() {
        let page_number = (page_index + 1) as i64;

        if page_index == 0 {
            if let Some(text) = source.page_text(page_index)? {
                if !text.is_empty() {
                    records.push(SemanticRecord {
                        content: format!("Notification Context (Page 1):\n{text}"),
                        metadata: RecordMetadata::context(1, CONTEXT_SOURCE),
                    });
                    stats.context_records += 1;
                }
            }
            continue;
        }

        let table = match source.page_table(page_index)? {
            Some(rows) if !rows.is_empty() => rows,
            _ => {
                stats.pages_without_tables += 1;
                continue;
            }
        };

        for row in &table {
            match process_row(row, page_number, &mut carry) {
                RowOutcome::Record(record) => {
                    stats.policy_entry_records += 1;
                    records.push(record);
                }
                RowOutcome::Skipped(SkipReason::HeaderRow) => stats.header_rows_skipped += 1,
                RowOutcome::Skipped(SkipReason::TooFewColumns) => stats.short_rows_skipped += 1,
                RowOutcome::Skipped(SkipReason::MissingItcCode) => {
                    stats.missing_itc_rows_skipped += 1
                }
            }
        }
    }

    Ok(ParseOutcome { records, stats })
}
