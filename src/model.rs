use serde::{Deserialize, Serialize};

pub const RECORD_TYPE_CONTEXT: &str = "context";
pub const RECORD_TYPE_POLICY_ENTRY: &str = "policy_entry";

/// One unit of indexable text plus the flat metadata the retriever filters on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticRecord {
    pub content: String,
    pub metadata: RecordMetadata,
}

/// Flat metadata mapping. Context records carry `source`; policy entries
/// carry `itc_code`/`policy`/`chapter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub page: i64,
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub itc_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
}

impl RecordMetadata {
    pub fn context(page: i64, source: &str) -> Self {
        Self {
            page,
            record_type: RECORD_TYPE_CONTEXT.to_string(),
            source: Some(source.to_string()),
            itc_code: None,
            policy: None,
            chapter: None,
        }
    }

    pub fn policy_entry(page: i64, itc_code: String, policy: String, chapter: String) -> Self {
        Self {
            page,
            record_type: RECORD_TYPE_POLICY_ENTRY.to_string(),
            source: None,
            itc_code: Some(itc_code),
            policy: Some(policy),
            chapter: Some(chapter),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocEntry {
    pub filename: String,
    pub sha256: String,
    pub page_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolVersions {
    pub rustc: String,
    pub cargo: String,
    pub pdftotext: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestPaths {
    pub cache_root: String,
    pub manifest_dir: String,
    pub pdf_path: String,
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestCounts {
    pub page_count: usize,
    pub records_total: usize,
    pub context_records: usize,
    pub policy_entry_records: usize,
    pub header_rows_skipped: usize,
    pub short_rows_skipped: usize,
    pub missing_itc_rows_skipped: usize,
    pub pages_without_tables: usize,
    pub records_inserted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub tool_versions: ToolVersions,
    pub paths: IngestPaths,
    pub counts: IngestCounts,
    pub source: SourceDocEntry,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}
