use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Deserialize;
use tracing::{info, warn};

use crate::cli::StatusArgs;

#[derive(Debug, Deserialize)]
struct IngestRunSummary {
    run_id: String,
    status: String,
    updated_at: String,
}

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let db_path = args.cache_root.join("exportpolicy_index.sqlite");

    info!(cache_root = %args.cache_root.display(), "status requested");

    match latest_manifest(&manifest_dir, "ingest_run_")? {
        Some(path) => {
            let raw = fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let summary: IngestRunSummary = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;

            info!(
                path = %path.display(),
                run_id = %summary.run_id,
                status = %summary.status,
                updated_at = %summary.updated_at,
                "latest ingest run"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no ingest run manifest found"),
    }

    if db_path.exists() {
        let connection = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;

        let records = query_count(&connection, "SELECT COUNT(*) FROM records").unwrap_or(0);
        let context_records = query_count(
            &connection,
            "SELECT COUNT(*) FROM records WHERE type = 'context'",
        )
        .unwrap_or(0);
        let policy_entries = query_count(
            &connection,
            "SELECT COUNT(*) FROM records WHERE type = 'policy_entry'",
        )
        .unwrap_or(0);

        info!(
            path = %db_path.display(),
            records,
            context_records,
            policy_entries,
            "database status"
        );

        let mut statement = connection.prepare(
            "SELECT model_id, COUNT(*) FROM record_embeddings GROUP BY model_id",
        )?;
        let mut rows = statement.query([])?;
        let mut any_embeddings = false;
        while let Some(row) = rows.next()? {
            any_embeddings = true;
            let model_id: String = row.get(0)?;
            let embedded: i64 = row.get(1)?;
            info!(model_id = %model_id, embedded, "embedding status");
        }
        if !any_embeddings {
            warn!("no embeddings stored; semantic retrieval unavailable");
        }
    } else {
        warn!(path = %db_path.display(), "database file missing");
    }

    Ok(())
}

/// Newest manifest with the given filename prefix. Run ids embed a compact
/// UTC timestamp, so lexicographic order matches creation order.
fn latest_manifest(manifest_dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    if !manifest_dir.exists() {
        return Ok(None);
    }

    let mut matches = Vec::<PathBuf>::new();
    for entry in fs::read_dir(manifest_dir)
        .with_context(|| format!("failed to read {}", manifest_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(prefix) && name.ends_with(".json") {
            matches.push(entry.path());
        }
    }

    matches.sort();
    Ok(matches.pop())
}

fn query_count(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}
