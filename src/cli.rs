use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "exportpolicy",
    version,
    about = "Local ITC(HS) export-policy trade-notice extraction and query tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Ingest(IngestArgs),
    Embed(EmbedArgs),
    Query(QueryArgs),
    Ask(AskArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, default_value = ".cache/exportpolicy")]
    pub cache_root: PathBuf,

    /// Source trade-notice PDF. Defaults to <cache-root>/raw/trade_notice.pdf.
    #[arg(long)]
    pub pdf_path: Option<PathBuf>,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub ingest_manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub max_pages: Option<usize>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EmbedRefreshMode {
    Full,
    MissingOrStale,
}

#[derive(Args, Debug, Clone)]
pub struct EmbedArgs {
    #[arg(long, default_value = ".cache/exportpolicy")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long, default_value = "policy-minilm-local-v1")]
    pub model_id: String,

    #[arg(long, value_enum, default_value_t = EmbedRefreshMode::MissingOrStale)]
    pub refresh_mode: EmbedRefreshMode,

    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Restrict the refresh to one record type (context, policy_entry).
    #[arg(long = "record-type")]
    pub record_types: Vec<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum RetrievalMode {
    Lexical,
    Semantic,
    Hybrid,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    #[arg(long, default_value = ".cache/exportpolicy")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub query: String,

    #[arg(long, value_enum, default_value_t = RetrievalMode::Lexical)]
    pub retrieval_mode: RetrievalMode,

    #[arg(long, default_value_t = 64)]
    pub lexical_k: usize,

    #[arg(long, default_value_t = 64)]
    pub semantic_k: usize,

    #[arg(long, default_value_t = 60)]
    pub rrf_k: u32,

    #[arg(long, default_value = "policy-minilm-local-v1")]
    pub semantic_model_id: String,

    #[arg(long, default_value_t = 5)]
    pub limit: usize,

    #[arg(long)]
    pub chapter: Option<String>,

    #[arg(long)]
    pub policy: Option<String>,

    #[arg(long)]
    pub itc_code: Option<String>,

    #[arg(long = "type")]
    pub record_type: Option<String>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct AskArgs {
    #[arg(long, default_value = ".cache/exportpolicy")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// The user question, e.g. "Can I export Natural Rubber?".
    #[arg(long)]
    pub question: String,

    #[arg(long, value_enum, default_value_t = RetrievalMode::Hybrid)]
    pub retrieval_mode: RetrievalMode,

    #[arg(long, default_value = "policy-minilm-local-v1")]
    pub semantic_model_id: String,

    #[arg(long, default_value_t = 5)]
    pub top_k: usize,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/exportpolicy")]
    pub cache_root: PathBuf,
}
