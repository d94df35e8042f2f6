use std::collections::HashSet;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use tracing::info;

use crate::cli::{EmbedArgs, EmbedRefreshMode};
use crate::commands::ingest::ensure_embedding_schema;
use crate::semantic::{
    SemanticModelConfig, embed_text, embedding_text_hash, encode_embedding_blob,
    record_payload_for_embedding, resolve_model_config,
};
use crate::util::{ensure_directory, now_utc_string, utc_compact_string, write_json_pretty};

#[derive(Debug, Clone)]
struct EmbedRecordRow {
    record_id: String,
    record_type: String,
    content: String,
}

#[derive(Debug, Clone)]
struct ExistingEmbeddingRow {
    text_hash: String,
    embedding_dim: usize,
}

#[derive(Debug, Default)]
struct EmbedStats {
    eligible_records: usize,
    skipped_empty_records: usize,
    stale_rows_before: usize,
    updated_records: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRunManifest {
    manifest_version: u32,
    run_id: String,
    generated_at: String,
    model_id: String,
    model_name: String,
    embedding_dim: usize,
    normalization: String,
    backend: String,
    refresh_mode: String,
    record_type_filter: Vec<String>,
    eligible_records: usize,
    updated_records: usize,
    skipped_empty_records: usize,
    stale_rows_before: usize,
    batch_size: usize,
    duration_ms: u128,
    status: String,
    warnings: Vec<String>,
}

pub fn run(args: EmbedArgs) -> Result<()> {
    let batch_size = args.batch_size.max(1);
    let model = resolve_model_config(&args.model_id);
    let record_type_filter = args
        .record_types
        .iter()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .collect::<HashSet<String>>();

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("exportpolicy_index.sqlite"));
    let manifest_dir = args.cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let mut connection = Connection::open_with_flags(
        &db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open database: {}", db_path.display()))?;
    ensure_embedding_schema(&connection)?;
    ensure_model_entry(&connection, &model)?;

    let started_at = now_utc_string();
    let started = Instant::now();
    let run_id = format!("embed-{}", utc_compact_string(Utc::now()));

    let stats = refresh_embeddings(
        &mut connection,
        &model,
        args.refresh_mode,
        batch_size,
        &record_type_filter,
    )?;

    let mut warnings = Vec::<String>::new();
    if stats.eligible_records == 0 {
        warnings.push("no eligible records matched embed filters".to_string());
    }

    let duration_ms = started.elapsed().as_millis();
    let manifest = EmbeddingRunManifest {
        manifest_version: 1,
        run_id,
        generated_at: started_at,
        model_id: model.model_id.clone(),
        model_name: model.model_name.clone(),
        embedding_dim: model.dimensions,
        normalization: model.normalization.clone(),
        backend: model.backend.clone(),
        refresh_mode: match args.refresh_mode {
            EmbedRefreshMode::Full => "full",
            EmbedRefreshMode::MissingOrStale => "missing-or-stale",
        }
        .to_string(),
        record_type_filter: {
            let mut values = record_type_filter.iter().cloned().collect::<Vec<String>>();
            values.sort();
            values
        },
        eligible_records: stats.eligible_records,
        updated_records: stats.updated_records,
        skipped_empty_records: stats.skipped_empty_records,
        stale_rows_before: stats.stale_rows_before,
        batch_size,
        duration_ms,
        status: "completed".to_string(),
        warnings,
    };

    let manifest_path = manifest_dir.join(format!(
        "embedding_run_{}.json",
        utc_compact_string(Utc::now())
    ));
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        model_id = %model.model_id,
        eligible_records = stats.eligible_records,
        updated_records = stats.updated_records,
        "embedding refresh completed"
    );

    Ok(())
}

fn refresh_embeddings(
    connection: &mut Connection,
    model: &SemanticModelConfig,
    refresh_mode: EmbedRefreshMode,
    batch_size: usize,
    record_type_filter: &HashSet<String>,
) -> Result<EmbedStats> {
    let record_rows = load_record_rows(connection)?;
    let mut stats = EmbedStats::default();
    let mut pending_updates = Vec::<(String, String, Vec<u8>)>::new();

    for row in &record_rows {
        if !record_type_filter.is_empty() && !record_type_filter.contains(&row.record_type) {
            continue;
        }

        let Some(payload) = record_payload_for_embedding(&row.record_type, &row.content) else {
            stats.skipped_empty_records += 1;
            continue;
        };

        stats.eligible_records += 1;

        let text_hash = embedding_text_hash(&payload);
        let existing = load_existing_embedding(connection, &row.record_id, &model.model_id)?;
        let stale = existing
            .as_ref()
            .map(|value| value.text_hash != text_hash || value.embedding_dim != model.dimensions)
            .unwrap_or(true);
        if stale {
            stats.stale_rows_before += 1;
        }

        let should_update = match refresh_mode {
            EmbedRefreshMode::Full => true,
            EmbedRefreshMode::MissingOrStale => stale,
        };
        if !should_update {
            continue;
        }

        let embedding = embed_text(&payload, model.dimensions);
        pending_updates.push((row.record_id.clone(), text_hash, encode_embedding_blob(&embedding)));

        if pending_updates.len() >= batch_size {
            stats.updated_records += flush_embed_batch(connection, model, &mut pending_updates)?;
        }
    }

    if !pending_updates.is_empty() {
        stats.updated_records += flush_embed_batch(connection, model, &mut pending_updates)?;
    }

    Ok(stats)
}

fn load_record_rows(connection: &Connection) -> Result<Vec<EmbedRecordRow>> {
    let mut statement = connection
        .prepare("SELECT record_id, type, content FROM records ORDER BY seq")
        .context("failed to prepare record scan")?;

    let rows = statement
        .query_map([], |row| {
            Ok(EmbedRecordRow {
                record_id: row.get(0)?,
                record_type: row.get(1)?,
                content: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<EmbedRecordRow>>>()?;

    Ok(rows)
}

fn load_existing_embedding(
    connection: &Connection,
    record_id: &str,
    model_id: &str,
) -> Result<Option<ExistingEmbeddingRow>> {
    let row = connection
        .query_row(
            "SELECT text_hash, embedding_dim FROM record_embeddings
             WHERE record_id = ?1 AND model_id = ?2",
            params![record_id, model_id],
            |row| {
                Ok(ExistingEmbeddingRow {
                    text_hash: row.get(0)?,
                    embedding_dim: row.get::<_, i64>(1)? as usize,
                })
            },
        )
        .optional()?;

    Ok(row)
}

fn ensure_model_entry(connection: &Connection, model: &SemanticModelConfig) -> Result<()> {
    connection.execute(
        "INSERT INTO embedding_models(model_id, model_name, embedding_dim, normalization, backend, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(model_id) DO UPDATE SET
           model_name=excluded.model_name,
           embedding_dim=excluded.embedding_dim,
           normalization=excluded.normalization,
           backend=excluded.backend,
           updated_at=excluded.updated_at",
        params![
            &model.model_id,
            &model.model_name,
            model.dimensions as i64,
            &model.normalization,
            &model.backend,
            now_utc_string(),
        ],
    )?;

    Ok(())
}

fn flush_embed_batch(
    connection: &mut Connection,
    model: &SemanticModelConfig,
    pending_updates: &mut Vec<(String, String, Vec<u8>)>,
) -> Result<usize> {
    if pending_updates.is_empty() {
        return Ok(0);
    }

    let tx = connection.transaction()?;
    let mut updated = 0usize;
    {
        let mut statement = tx.prepare(
            "INSERT INTO record_embeddings(record_id, model_id, embedding, embedding_dim, text_hash, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(record_id, model_id) DO UPDATE SET
               embedding=excluded.embedding,
               embedding_dim=excluded.embedding_dim,
               text_hash=excluded.text_hash,
               updated_at=excluded.updated_at",
        )?;

        for (record_id, text_hash, embedding_blob) in pending_updates.drain(..) {
            statement.execute(params![
                record_id,
                &model.model_id,
                embedding_blob,
                model.dimensions as i64,
                text_hash,
                now_utc_string(),
            ])?;
            updated += 1;
        }
    }
    tx.commit()?;

    Ok(updated)
}
