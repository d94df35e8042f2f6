use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use tracing::info;

use crate::cli::AskArgs;
use crate::commands::query::{RecordFilters, RecordHit, RetrievalSpec, retrieve, snippet_of};

/// System prompt handed to the external chat model together with the
/// retrieved context. The model itself is a collaborator outside this tool;
/// we produce exactly what it should be given.
const SYSTEM_PROMPT_TEMPLATE: &str = "You are an expert Trade Consultant specializing in India's Export Policy (ITC-HS Codes).\n\
\n\
Use the provided context to answer the user's question. \
The context consists of database rows containing ITC Codes, Descriptions, and Policies.\n\
\n\
Rules:\n\
1. If the user asks about a specific item, identify its Export Policy (Free, Restricted, Prohibited).\n\
2. Always mention the ITC(HS) Code if available in the context.\n\
3. If there are specific Policy Conditions (e.g., 'Minimum Export Price', 'Certificate Required'), mention them clearly.\n\
4. If the answer is not in the context, say you don't know. Do not hallucinate.\n\
\n\
Context: {context}";

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

#[derive(Debug, Serialize)]
struct PromptSource {
    rank: usize,
    record_id: String,
    page: i64,
    #[serde(rename = "type")]
    record_type: String,
    itc_code: Option<String>,
    policy: Option<String>,
    chapter: Option<String>,
    snippet: String,
}

#[derive(Debug, Serialize)]
struct AskResponse {
    question: String,
    retrieval_mode: String,
    system_prompt: String,
    user_prompt: String,
    sources: Vec<PromptSource>,
}

pub fn run(args: AskArgs) -> Result<()> {
    let question = args.question.trim();
    if question.is_empty() {
        bail!("question must not be empty");
    }

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("exportpolicy_index.sqlite"));

    let connection = Connection::open_with_flags(
        &db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open database read-only: {}", db_path.display()))?;

    let top_k = args.top_k.max(1);
    let spec = RetrievalSpec {
        query_text: question,
        mode: args.retrieval_mode,
        lexical_k: top_k,
        semantic_k: top_k,
        rrf_k: 60,
        model_id: &args.semantic_model_id,
        filters: RecordFilters::default(),
    };

    let retrieval = retrieve(&connection, &spec)?;
    let hits = retrieval
        .candidates
        .iter()
        .take(top_k)
        .map(|candidate| candidate.hit.clone())
        .collect::<Vec<RecordHit>>();

    if hits.is_empty() {
        bail!("no records matched the question; has the trade notice been ingested?");
    }

    info!(
        question = %question,
        sources = hits.len(),
        "composed grounded prompt"
    );

    let system_prompt = compose_system_prompt(&hits);
    let sources = hits
        .iter()
        .enumerate()
        .map(|(index, hit)| PromptSource {
            rank: index + 1,
            record_id: hit.record_id.clone(),
            page: hit.page,
            record_type: hit.record_type.clone(),
            itc_code: hit.itc_code.clone(),
            policy: hit.policy.clone(),
            chapter: hit.chapter.clone(),
            snippet: snippet_of(&hit.content),
        })
        .collect::<Vec<PromptSource>>();

    let response = AskResponse {
        question: question.to_string(),
        retrieval_mode: match retrieval.effective_mode {
            crate::cli::RetrievalMode::Lexical => "lexical",
            crate::cli::RetrievalMode::Semantic => "semantic",
            crate::cli::RetrievalMode::Hybrid => "hybrid",
        }
        .to_string(),
        system_prompt,
        user_prompt: question.to_string(),
        sources,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &response)
            .context("failed to serialize ask response")?;
        writeln!(out)?;
    } else {
        print_prompt(&mut out, &response)?;
    }

    Ok(())
}

/// Substitutes the retrieved record contents into the consultant prompt, in
/// retrieval order.
fn compose_system_prompt(hits: &[RecordHit]) -> String {
    let context = hits
        .iter()
        .map(|hit| hit.content.as_str())
        .collect::<Vec<&str>>()
        .join(CONTEXT_SEPARATOR);

    SYSTEM_PROMPT_TEMPLATE.replace("{context}", &context)
}

fn print_prompt(out: &mut impl Write, response: &AskResponse) -> Result<()> {
    writeln!(out, "=== system prompt ===")?;
    writeln!(out, "{}", response.system_prompt)?;
    writeln!(out)?;
    writeln!(out, "=== user prompt ===")?;
    writeln!(out, "{}", response.user_prompt)?;
    writeln!(out)?;
    writeln!(out, "=== sources ===")?;
    for source in &response.sources {
        writeln!(out, "Source {} (Page {})", source.rank, source.page)?;
        writeln!(out, "  {}", source.snippet)?;
    }

    Ok(())
}
