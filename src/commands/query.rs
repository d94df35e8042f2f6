use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::{self, Write};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use regex::Regex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use tracing::warn;

use crate::cli::{QueryArgs, RetrievalMode};
use crate::semantic::{
    cosine_similarity, decode_embedding_blob, embed_text, normalize_whitespace,
    resolve_model_config,
};

const MAX_QUERY_CANDIDATES: usize = 256;
const SNIPPET_CHARS: usize = 280;
const ITC_EXACT_SCORE: f64 = 1000.0;

/// One stored record as seen by the retriever. Carries the full content so
/// the ask command can ground its prompt without a second lookup.
#[derive(Debug, Clone, Serialize)]
pub struct RecordHit {
    pub record_id: String,
    pub page: i64,
    pub record_type: String,
    pub itc_code: Option<String>,
    pub policy: Option<String>,
    pub chapter: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct QueryCandidate {
    pub score: f64,
    pub match_kind: String,
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
    pub lexical_score: Option<f64>,
    pub semantic_score: Option<f64>,
    pub rrf_score: Option<f64>,
    pub hit: RecordHit,
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilters {
    pub record_type: Option<String>,
    pub chapter: Option<String>,
    pub policy: Option<String>,
    pub itc_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RetrievalSpec<'a> {
    pub query_text: &'a str,
    pub mode: RetrievalMode,
    pub lexical_k: usize,
    pub semantic_k: usize,
    pub rrf_k: u32,
    pub model_id: &'a str,
    pub filters: RecordFilters,
}

#[derive(Debug)]
pub struct Retrieval {
    pub candidates: Vec<QueryCandidate>,
    pub effective_mode: RetrievalMode,
    pub lexical_candidate_count: usize,
    pub semantic_candidate_count: usize,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueryRankTrace {
    lexical_rank: Option<usize>,
    semantic_rank: Option<usize>,
    lexical_score: Option<f64>,
    semantic_score: Option<f64>,
    rrf_score: Option<f64>,
}

#[derive(Debug, Serialize)]
struct QueryResult {
    rank: usize,
    score: f64,
    match_kind: String,
    rank_trace: QueryRankTrace,
    record_id: String,
    page: i64,
    #[serde(rename = "type")]
    record_type: String,
    itc_code: Option<String>,
    policy: Option<String>,
    chapter: Option<String>,
    snippet: String,
    citation: String,
}

#[derive(Debug, Serialize)]
struct RetrievalMetadata {
    requested_mode: String,
    effective_mode: String,
    lexical_k: usize,
    semantic_k: usize,
    lexical_candidate_count: usize,
    semantic_candidate_count: usize,
    fusion: String,
    rrf_k: u32,
    semantic_model_id: String,
    fallback_reason: Option<String>,
    query_duration_ms: f64,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    query: String,
    limit: usize,
    returned: usize,
    chapter_filter: Option<String>,
    policy_filter: Option<String>,
    itc_code_filter: Option<String>,
    record_type_filter: Option<String>,
    retrieval: RetrievalMetadata,
    results: Vec<QueryResult>,
}

pub fn run(args: QueryArgs) -> Result<()> {
    let query_started = Instant::now();
    let query_text = args.query.trim();
    if query_text.is_empty() {
        bail!("query must not be empty");
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

    let filters = RecordFilters {
        record_type: normalized_filter(args.record_type.as_deref()),
        chapter: normalized_filter(args.chapter.as_deref()),
        policy: normalized_filter(args.policy.as_deref()),
        itc_code: normalized_filter(args.itc_code.as_deref()),
    };

    let limit = args.limit.max(1);
    let spec = RetrievalSpec {
        query_text,
        mode: args.retrieval_mode,
        lexical_k: clamp_candidates(args.lexical_k.max(limit)),
        semantic_k: clamp_candidates(args.semantic_k.max(limit)),
        rrf_k: args.rrf_k.max(1),
        model_id: &args.semantic_model_id,
        filters,
    };

    let retrieval = retrieve(&connection, &spec)?;

    let results = retrieval
        .candidates
        .iter()
        .take(limit)
        .enumerate()
        .map(|(index, candidate)| QueryResult {
            rank: index + 1,
            score: candidate.score,
            match_kind: candidate.match_kind.clone(),
            rank_trace: QueryRankTrace {
                lexical_rank: candidate.lexical_rank,
                semantic_rank: candidate.semantic_rank,
                lexical_score: candidate.lexical_score,
                semantic_score: candidate.semantic_score,
                rrf_score: candidate.rrf_score,
            },
            record_id: candidate.hit.record_id.clone(),
            page: candidate.hit.page,
            record_type: candidate.hit.record_type.clone(),
            itc_code: candidate.hit.itc_code.clone(),
            policy: candidate.hit.policy.clone(),
            chapter: candidate.hit.chapter.clone(),
            snippet: snippet_of(&candidate.hit.content),
            citation: format!("Trade Notice Schedule-II, page {}", candidate.hit.page),
        })
        .collect::<Vec<QueryResult>>();

    let response = QueryResponse {
        query: query_text.to_string(),
        limit,
        returned: results.len(),
        chapter_filter: spec.filters.chapter.clone(),
        policy_filter: spec.filters.policy.clone(),
        itc_code_filter: spec.filters.itc_code.clone(),
        record_type_filter: spec.filters.record_type.clone(),
        retrieval: RetrievalMetadata {
            requested_mode: mode_name(args.retrieval_mode).to_string(),
            effective_mode: mode_name(retrieval.effective_mode).to_string(),
            lexical_k: spec.lexical_k,
            semantic_k: spec.semantic_k,
            lexical_candidate_count: retrieval.lexical_candidate_count,
            semantic_candidate_count: retrieval.semantic_candidate_count,
            fusion: "rrf".to_string(),
            rrf_k: spec.rrf_k,
            semantic_model_id: args.semantic_model_id.clone(),
            fallback_reason: retrieval.fallback_reason,
            query_duration_ms: query_started.elapsed().as_secs_f64() * 1000.0,
        },
        results,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &response)
            .context("failed to serialize query response")?;
        writeln!(out)?;
    } else {
        print_results(&mut out, &response)?;
    }

    Ok(())
}

pub fn retrieve(connection: &Connection, spec: &RetrievalSpec<'_>) -> Result<Retrieval> {
    let mut effective_mode = spec.mode;
    let mut fallback_reason = None::<String>;

    let mut semantic_candidates = Vec::<QueryCandidate>::new();
    if matches!(spec.mode, RetrievalMode::Semantic | RetrievalMode::Hybrid) {
        match semantic_index_status(connection, spec.model_id)? {
            SemanticIndexStatus::Ready { embedding_dim } => {
                semantic_candidates = collect_semantic_candidates(
                    connection,
                    spec.query_text,
                    spec.model_id,
                    embedding_dim,
                    &spec.filters,
                    spec.semantic_k,
                )?;
            }
            SemanticIndexStatus::Missing { reason } => {
                if spec.mode == RetrievalMode::Semantic {
                    bail!("{reason}; run `exportpolicy embed` first");
                }
                warn!(reason = %reason, "semantic index unavailable; falling back to lexical");
                fallback_reason = Some(reason);
                effective_mode = RetrievalMode::Lexical;
            }
        }
    }

    let mut lexical_candidates = Vec::<QueryCandidate>::new();
    if matches!(
        effective_mode,
        RetrievalMode::Lexical | RetrievalMode::Hybrid
    ) {
        lexical_candidates =
            collect_lexical_candidates(connection, spec.query_text, &spec.filters, spec.lexical_k)?;
    }

    let lexical_candidate_count = lexical_candidates.len();
    let semantic_candidate_count = semantic_candidates.len();

    let candidates = match effective_mode {
        RetrievalMode::Lexical => lexical_candidates,
        RetrievalMode::Semantic => semantic_candidates,
        RetrievalMode::Hybrid => fuse_rrf(lexical_candidates, semantic_candidates, spec.rrf_k),
    };

    Ok(Retrieval {
        candidates,
        effective_mode,
        lexical_candidate_count,
        semantic_candidate_count,
        fallback_reason,
    })
}

enum SemanticIndexStatus {
    Ready { embedding_dim: usize },
    Missing { reason: String },
}

fn semantic_index_status(connection: &Connection, model_id: &str) -> Result<SemanticIndexStatus> {
    let embedding_dim = connection
        .query_row(
            "SELECT embedding_dim FROM embedding_models WHERE model_id = ?1",
            [model_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .unwrap_or(None);

    let Some(embedding_dim) = embedding_dim else {
        return Ok(SemanticIndexStatus::Missing {
            reason: format!("no embedding model registered for {model_id}"),
        });
    };

    let embedded_rows: i64 = connection
        .query_row(
            "SELECT COUNT(*) FROM record_embeddings WHERE model_id = ?1",
            [model_id],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if embedded_rows == 0 {
        return Ok(SemanticIndexStatus::Missing {
            reason: format!("no embeddings stored for {model_id}"),
        });
    }

    let embedding_dim = if embedding_dim > 0 {
        embedding_dim as usize
    } else {
        resolve_model_config(model_id).dimensions
    };

    Ok(SemanticIndexStatus::Ready { embedding_dim })
}

fn collect_lexical_candidates(
    connection: &Connection,
    query_text: &str,
    filters: &RecordFilters,
    candidate_limit: usize,
) -> Result<Vec<QueryCandidate>> {
    let mut dedup = HashMap::<String, QueryCandidate>::new();

    for candidate in query_itc_exact_matches(connection, query_text, filters, candidate_limit)? {
        upsert_candidate(&mut dedup, candidate);
    }
    for candidate in query_fts_matches(connection, query_text, filters, candidate_limit)? {
        upsert_candidate(&mut dedup, candidate);
    }

    let mut candidates = dedup.into_values().collect::<Vec<QueryCandidate>>();
    sort_candidates(&mut candidates);
    candidates.truncate(candidate_limit);

    for (index, candidate) in candidates.iter_mut().enumerate() {
        candidate.lexical_rank = Some(index + 1);
        candidate.lexical_score = Some(candidate.score);
    }

    Ok(candidates)
}

/// ITC(HS) codes in the query (4+ digit runs) short-circuit to code-prefix
/// matches, which outrank any text match.
fn query_itc_exact_matches(
    connection: &Connection,
    query_text: &str,
    filters: &RecordFilters,
    candidate_limit: usize,
) -> Result<Vec<QueryCandidate>> {
    let code_pattern =
        Regex::new(r"\b\d{4,10}\b").context("failed to compile ITC code intent regex")?;

    let mut out = Vec::<QueryCandidate>::new();
    for code in code_pattern.find_iter(query_text) {
        let mut statement = connection.prepare(
            "SELECT record_id, page, type, itc_code, policy, chapter, content
             FROM records
             WHERE itc_code LIKE ?1 || '%'
               AND (?2 IS NULL OR type = ?2)
               AND (?3 IS NULL OR chapter = ?3)
               AND (?4 IS NULL OR lower(policy) = lower(?4))
               AND (?5 IS NULL OR itc_code LIKE ?5 || '%')
             ORDER BY seq
             LIMIT ?6",
        )?;

        let rows = statement
            .query_map(
                params![
                    code.as_str(),
                    filters.record_type.as_deref(),
                    filters.chapter.as_deref(),
                    filters.policy.as_deref(),
                    filters.itc_code.as_deref(),
                    candidate_limit as i64,
                ],
                record_hit_from_row,
            )?
            .collect::<rusqlite::Result<Vec<RecordHit>>>()?;

        for hit in rows {
            out.push(QueryCandidate {
                score: ITC_EXACT_SCORE,
                match_kind: "itc_exact".to_string(),
                lexical_rank: None,
                semantic_rank: None,
                lexical_score: None,
                semantic_score: None,
                rrf_score: None,
                hit,
            });
        }
    }

    Ok(out)
}

fn query_fts_matches(
    connection: &Connection,
    query_text: &str,
    filters: &RecordFilters,
    candidate_limit: usize,
) -> Result<Vec<QueryCandidate>> {
    let Some(match_expression) = fts_match_expression(query_text) else {
        return Ok(Vec::new());
    };

    let mut statement = connection.prepare(
        "SELECT r.record_id, r.page, r.type, r.itc_code, r.policy, r.chapter, r.content,
                bm25(records_fts) AS bm25_score
         FROM records_fts
         JOIN records r ON r.rowid = records_fts.rowid
         WHERE records_fts MATCH ?1
           AND (?2 IS NULL OR r.type = ?2)
           AND (?3 IS NULL OR r.chapter = ?3)
           AND (?4 IS NULL OR lower(r.policy) = lower(?4))
           AND (?5 IS NULL OR r.itc_code LIKE ?5 || '%')
         ORDER BY bm25_score
         LIMIT ?6",
    )?;

    let rows = statement
        .query_map(
            params![
                match_expression,
                filters.record_type.as_deref(),
                filters.chapter.as_deref(),
                filters.policy.as_deref(),
                filters.itc_code.as_deref(),
                candidate_limit as i64,
            ],
            |row| {
                let hit = record_hit_from_row(row)?;
                let bm25_score: f64 = row.get(7)?;
                Ok((hit, bm25_score))
            },
        )?
        .collect::<rusqlite::Result<Vec<(RecordHit, f64)>>>()?;

    let out = rows
        .into_iter()
        .map(|(hit, bm25_score)| QueryCandidate {
            // bm25 is smaller-is-better; negate so ranking stays descending.
            score: -bm25_score,
            match_kind: "fts".to_string(),
            lexical_rank: None,
            semantic_rank: None,
            lexical_score: None,
            semantic_score: None,
            rrf_score: None,
            hit,
        })
        .collect();

    Ok(out)
}

fn collect_semantic_candidates(
    connection: &Connection,
    query_text: &str,
    model_id: &str,
    embedding_dim: usize,
    filters: &RecordFilters,
    candidate_limit: usize,
) -> Result<Vec<QueryCandidate>> {
    let query_embedding = embed_text(query_text, embedding_dim);

    let mut statement = connection.prepare(
        "SELECT r.record_id, r.page, r.type, r.itc_code, r.policy, r.chapter, r.content,
                e.embedding
         FROM record_embeddings e
         JOIN records r ON r.record_id = e.record_id
         WHERE e.model_id = ?1
           AND (?2 IS NULL OR r.type = ?2)
           AND (?3 IS NULL OR r.chapter = ?3)
           AND (?4 IS NULL OR lower(r.policy) = lower(?4))
           AND (?5 IS NULL OR r.itc_code LIKE ?5 || '%')",
    )?;

    let rows = statement
        .query_map(
            params![
                model_id,
                filters.record_type.as_deref(),
                filters.chapter.as_deref(),
                filters.policy.as_deref(),
                filters.itc_code.as_deref(),
            ],
            |row| {
                let hit = record_hit_from_row(row)?;
                let blob: Vec<u8> = row.get(7)?;
                Ok((hit, blob))
            },
        )?
        .collect::<rusqlite::Result<Vec<(RecordHit, Vec<u8>)>>>()?;

    let mut candidates = Vec::<QueryCandidate>::new();
    for (hit, blob) in rows {
        let Some(embedding) = decode_embedding_blob(&blob, embedding_dim) else {
            warn!(record_id = %hit.record_id, "stored embedding has unexpected size; skipping");
            continue;
        };

        candidates.push(QueryCandidate {
            score: cosine_similarity(&query_embedding, &embedding),
            match_kind: "semantic".to_string(),
            lexical_rank: None,
            semantic_rank: None,
            lexical_score: None,
            semantic_score: None,
            rrf_score: None,
            hit,
        });
    }

    sort_candidates(&mut candidates);
    candidates.truncate(candidate_limit);

    for (index, candidate) in candidates.iter_mut().enumerate() {
        candidate.semantic_rank = Some(index + 1);
        candidate.semantic_score = Some(candidate.score);
    }

    Ok(candidates)
}

/// Reciprocal-rank fusion over the two candidate lists. A record present in
/// both lists accumulates both contributions and outranks single-list hits
/// of comparable rank.
fn fuse_rrf(
    lexical: Vec<QueryCandidate>,
    semantic: Vec<QueryCandidate>,
    rrf_k: u32,
) -> Vec<QueryCandidate> {
    let mut fused = HashMap::<String, QueryCandidate>::new();

    for candidate in lexical.into_iter().chain(semantic) {
        let contribution = [candidate.lexical_rank, candidate.semantic_rank]
            .iter()
            .flatten()
            .map(|rank| 1.0 / (f64::from(rrf_k) + *rank as f64))
            .sum::<f64>();

        match fused.entry(candidate.hit.record_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.lexical_rank = existing.lexical_rank.or(candidate.lexical_rank);
                existing.semantic_rank = existing.semantic_rank.or(candidate.semantic_rank);
                existing.lexical_score = existing.lexical_score.or(candidate.lexical_score);
                existing.semantic_score = existing.semantic_score.or(candidate.semantic_score);
                let total = existing.rrf_score.unwrap_or(0.0) + contribution;
                existing.rrf_score = Some(total);
                existing.score = total;
                existing.match_kind = "hybrid".to_string();
            }
            Entry::Vacant(vacant) => {
                let mut candidate = candidate;
                candidate.rrf_score = Some(contribution);
                candidate.score = contribution;
                vacant.insert(candidate);
            }
        }
    }

    let mut candidates = fused.into_values().collect::<Vec<QueryCandidate>>();
    sort_candidates(&mut candidates);
    candidates
}

fn sort_candidates(candidates: &mut [QueryCandidate]) {
    candidates.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| left.hit.record_id.cmp(&right.hit.record_id))
    });
}

fn upsert_candidate(dedup: &mut HashMap<String, QueryCandidate>, candidate: QueryCandidate) {
    dedup
        .entry(candidate.hit.record_id.clone())
        .and_modify(|existing| {
            if candidate.score > existing.score {
                existing.score = candidate.score;
                existing.match_kind = candidate.match_kind.clone();
            }
        })
        .or_insert(candidate);
}

/// FTS5 match expression: alphanumeric tokens, quoted, OR-joined. Returns
/// None when the query has no usable tokens.
fn fts_match_expression(query_text: &str) -> Option<String> {
    let tokens = query_text
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|character| character.is_ascii_alphanumeric())
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<String>>();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

fn record_hit_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordHit> {
    Ok(RecordHit {
        record_id: row.get(0)?,
        page: row.get(1)?,
        record_type: row.get(2)?,
        itc_code: row.get(3)?,
        policy: row.get(4)?,
        chapter: row.get(5)?,
        content: row.get(6)?,
    })
}

pub fn snippet_of(content: &str) -> String {
    let flattened = normalize_whitespace(content);
    if flattened.chars().count() <= SNIPPET_CHARS {
        return flattened;
    }

    let truncated = flattened.chars().take(SNIPPET_CHARS).collect::<String>();
    format!("{truncated}…")
}

fn normalized_filter(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn clamp_candidates(value: usize) -> usize {
    value.min(MAX_QUERY_CANDIDATES)
}

fn mode_name(mode: RetrievalMode) -> &'static str {
    match mode {
        RetrievalMode::Lexical => "lexical",
        RetrievalMode::Semantic => "semantic",
        RetrievalMode::Hybrid => "hybrid",
    }
}

fn print_results(out: &mut impl Write, response: &QueryResponse) -> Result<()> {
    writeln!(
        out,
        "query: {} (mode {}, {} result{})",
        response.query,
        response.retrieval.effective_mode,
        response.returned,
        if response.returned == 1 { "" } else { "s" }
    )?;

    for result in &response.results {
        writeln!(
            out,
            "#{rank}  score={score:.4}  [{kind}]  {citation}",
            rank = result.rank,
            score = result.score,
            kind = result.match_kind,
            citation = result.citation,
        )?;
        if result.record_type == "policy_entry" {
            writeln!(
                out,
                "    chapter {chapter}  ITC(HS) {itc}  policy {policy}",
                chapter = result.chapter.as_deref().unwrap_or("N/A"),
                itc = result.itc_code.as_deref().unwrap_or("N/A"),
                policy = result.policy.as_deref().unwrap_or("N/A"),
            )?;
        }
        writeln!(out, "    {}", result.snippet)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ingest::{ensure_embedding_schema, ensure_schema};
    use crate::semantic::{encode_embedding_blob, record_payload_for_embedding};

    const MODEL_ID: &str = "policy-minilm-local-v1";
    const DIMS: usize = 384;

    fn seeded_connection(with_embeddings: bool) -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        ensure_schema(&connection).unwrap();
        ensure_embedding_schema(&connection).unwrap();

        connection
            .execute(
                "INSERT INTO source_docs(doc_id, filename, sha256, page_count, ingested_at)
                 VALUES('doc', 'doc.pdf', 'hash', 1, 'now')",
                [],
            )
            .unwrap();

        let records: [(&str, i64, &str, Option<&str>, Option<&str>, Option<&str>, &str); 3] = [
            (
                "doc:context:0001",
                1,
                "context",
                None,
                None,
                None,
                "Notification Context (Page 1):\nDGFT trade notice amending Schedule-II.",
            ),
            (
                "doc:policy_entry:0002",
                2,
                "policy_entry",
                Some("40011000"),
                Some("Restricted"),
                Some("40"),
                "Export Policy Details:\nChapter: 40\nITC(HS) Code: 40011000\n\
                 Item Description: Natural Rubber latex\nExport Policy: Restricted\n\
                 Policy Conditions: MEP Applies",
            ),
            (
                "doc:policy_entry:0003",
                3,
                "policy_entry",
                Some("07031010"),
                Some("Free"),
                Some("7"),
                "Export Policy Details:\nChapter: 7\nITC(HS) Code: 07031010\n\
                 Item Description: Onions fresh or chilled\nExport Policy: Free\n\
                 Policy Conditions: Subject to Minimum Export Price",
            ),
        ];

        for (index, (record_id, page, record_type, itc, policy, chapter, content)) in
            records.iter().enumerate()
        {
            connection
                .execute(
                    "INSERT INTO records(record_id, doc_id, seq, page, type, itc_code, policy,
                                         chapter, content, source_hash)
                     VALUES(?1, 'doc', ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'hash')",
                    params![
                        record_id,
                        (index + 1) as i64,
                        page,
                        record_type,
                        itc,
                        policy,
                        chapter,
                        content
                    ],
                )
                .unwrap();
        }

        connection
            .execute("INSERT INTO records_fts(records_fts) VALUES('rebuild')", [])
            .unwrap();

        if with_embeddings {
            connection
                .execute(
                    "INSERT INTO embedding_models(model_id, model_name, embedding_dim,
                                                  normalization, backend, updated_at)
                     VALUES(?1, ?1, ?2, 'l2', 'local-hash-v1', 'now')",
                    params![MODEL_ID, DIMS as i64],
                )
                .unwrap();

            for (record_id, _, record_type, _, _, _, content) in &records {
                let payload = record_payload_for_embedding(record_type, content).unwrap();
                let blob = encode_embedding_blob(&embed_text(&payload, DIMS));
                connection
                    .execute(
                        "INSERT INTO record_embeddings(record_id, model_id, embedding,
                                                       embedding_dim, text_hash, updated_at)
                         VALUES(?1, ?2, ?3, ?4, 'hash', 'now')",
                        params![record_id, MODEL_ID, blob, DIMS as i64],
                    )
                    .unwrap();
            }
        }

        connection
    }

    fn spec<'a>(query_text: &'a str, mode: RetrievalMode) -> RetrievalSpec<'a> {
        RetrievalSpec {
            query_text,
            mode,
            lexical_k: 16,
            semantic_k: 16,
            rrf_k: 60,
            model_id: MODEL_ID,
            filters: RecordFilters::default(),
        }
    }

    #[test]
    fn match_expression_quotes_tokens_and_drops_punctuation() {
        let expression = fts_match_expression("Can I export Natural-Rubber?").unwrap();
        assert_eq!(expression, "\"Can\" OR \"I\" OR \"export\" OR \"NaturalRubber\"");

        assert!(fts_match_expression("??? !!!").is_none());
        assert!(fts_match_expression("   ").is_none());
    }

    #[test]
    fn lexical_retrieval_finds_the_rubber_entry() {
        let connection = seeded_connection(false);

        let retrieval = retrieve(&connection, &spec("natural rubber latex", RetrievalMode::Lexical))
            .unwrap();

        assert!(!retrieval.candidates.is_empty());
        let top = &retrieval.candidates[0];
        assert_eq!(top.hit.itc_code.as_deref(), Some("40011000"));
        assert_eq!(top.match_kind, "fts");
        assert_eq!(top.lexical_rank, Some(1));
    }

    #[test]
    fn itc_code_in_query_takes_the_exact_match_path() {
        let connection = seeded_connection(false);

        let retrieval =
            retrieve(&connection, &spec("what about 40011000", RetrievalMode::Lexical)).unwrap();

        let top = &retrieval.candidates[0];
        assert_eq!(top.match_kind, "itc_exact");
        assert_eq!(top.score, ITC_EXACT_SCORE);
        assert_eq!(top.hit.record_id, "doc:policy_entry:0002");
    }

    #[test]
    fn policy_filter_narrows_candidates() {
        let connection = seeded_connection(false);

        let mut filtered = spec("export policy", RetrievalMode::Lexical);
        filtered.filters.policy = Some("Free".to_string());

        let retrieval = retrieve(&connection, &filtered).unwrap();
        assert!(!retrieval.candidates.is_empty());
        for candidate in &retrieval.candidates {
            assert_eq!(candidate.hit.policy.as_deref(), Some("Free"));
        }
    }

    #[test]
    fn chapter_filter_narrows_candidates() {
        let connection = seeded_connection(false);

        let mut filtered = spec("export", RetrievalMode::Lexical);
        filtered.filters.chapter = Some("40".to_string());

        let retrieval = retrieve(&connection, &filtered).unwrap();
        assert!(!retrieval.candidates.is_empty());
        for candidate in &retrieval.candidates {
            assert_eq!(candidate.hit.chapter.as_deref(), Some("40"));
        }
    }

    #[test]
    fn semantic_retrieval_ranks_related_content_first() {
        let connection = seeded_connection(true);

        let retrieval = retrieve(
            &connection,
            &spec("natural rubber latex restricted", RetrievalMode::Semantic),
        )
        .unwrap();

        assert_eq!(retrieval.effective_mode, RetrievalMode::Semantic);
        assert_eq!(retrieval.candidates[0].hit.record_id, "doc:policy_entry:0002");
        assert_eq!(retrieval.candidates[0].semantic_rank, Some(1));
    }

    #[test]
    fn semantic_mode_without_embeddings_is_an_error() {
        let connection = seeded_connection(false);

        let result = retrieve(&connection, &spec("rubber", RetrievalMode::Semantic));
        assert!(result.is_err());
    }

    #[test]
    fn hybrid_mode_falls_back_to_lexical_without_embeddings() {
        let connection = seeded_connection(false);

        let retrieval = retrieve(&connection, &spec("rubber", RetrievalMode::Hybrid)).unwrap();
        assert_eq!(retrieval.effective_mode, RetrievalMode::Lexical);
        assert!(retrieval.fallback_reason.is_some());
    }

    #[test]
    fn hybrid_fusion_prefers_records_present_in_both_lists() {
        let connection = seeded_connection(true);

        let retrieval = retrieve(
            &connection,
            &spec("natural rubber latex", RetrievalMode::Hybrid),
        )
        .unwrap();

        let top = &retrieval.candidates[0];
        assert_eq!(top.hit.record_id, "doc:policy_entry:0002");
        assert_eq!(top.match_kind, "hybrid");
        assert!(top.lexical_rank.is_some());
        assert!(top.semantic_rank.is_some());
        assert!(top.rrf_score.unwrap() > 0.0);
    }

    #[test]
    fn rrf_accumulates_contributions_from_both_lists() {
        fn candidate(record_id: &str, lexical_rank: Option<usize>, semantic_rank: Option<usize>) -> QueryCandidate {
            QueryCandidate {
                score: 1.0,
                match_kind: "fts".to_string(),
                lexical_rank,
                semantic_rank,
                lexical_score: None,
                semantic_score: None,
                rrf_score: None,
                hit: RecordHit {
                    record_id: record_id.to_string(),
                    page: 1,
                    record_type: "policy_entry".to_string(),
                    itc_code: None,
                    policy: None,
                    chapter: None,
                    content: String::new(),
                },
            }
        }

        let lexical = vec![candidate("a", Some(1), None), candidate("b", Some(2), None)];
        let semantic = vec![candidate("b", None, Some(1)), candidate("c", None, Some(2))];

        let fused = fuse_rrf(lexical, semantic, 60);
        assert_eq!(fused[0].hit.record_id, "b");
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((fused[0].rrf_score.unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn snippets_flatten_and_truncate_long_content() {
        let short = snippet_of("Chapter: 40\nExport Policy: Free");
        assert_eq!(short, "Chapter: 40 Export Policy: Free");

        let long = snippet_of(&"word ".repeat(200));
        assert!(long.ends_with('…'));
        assert_eq!(long.chars().count(), SNIPPET_CHARS + 1);
    }
}
