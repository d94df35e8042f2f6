use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::info;

use crate::cli::IngestArgs;
use crate::model::{
    IngestCounts, IngestPaths, IngestRunManifest, SemanticRecord, SourceDocEntry, ToolVersions,
};
use crate::util::{
    ensure_directory, now_utc_string, sha256_file, utc_compact_string, write_json_pretty,
};

mod extract;
mod pipeline;
#[cfg(test)]
mod tests;

pub use pipeline::{
    ChapterCarry, PageSource, ParseOutcome, ParseStats, RawRow, RowOutcome, SkipReason,
    is_header_row, normalize_cell, parse_document, process_row,
};

use extract::PdfPages;

const DB_SCHEMA_VERSION: &str = "0.1.0";
const DOC_ID: &str = "trade-notice-schedule2";

pub fn run(args: IngestArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let pdf_path = args
        .pdf_path
        .clone()
        .unwrap_or_else(|| cache_root.join("raw").join("trade_notice.pdf"));
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join("exportpolicy_index.sqlite"));
    let ingest_manifest_path = args.ingest_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!(
            "ingest_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });

    info!(cache_root = %cache_root.display(), run_id = %run_id, "starting ingest");

    if !pdf_path.exists() {
        bail!("trade notice PDF not found at: {}", pdf_path.display());
    }

    let source_sha256 = sha256_file(&pdf_path)?;
    let tool_versions = collect_tool_versions()?;

    let pages = PdfPages::open(&pdf_path, args.max_pages)?;
    let page_count = pages.page_count();
    let outcome = parse_document(&pages)?;

    info!(
        pages = page_count,
        records = outcome.records.len(),
        header_rows_skipped = outcome.stats.header_rows_skipped,
        short_rows_skipped = outcome.stats.short_rows_skipped,
        missing_itc_rows_skipped = outcome.stats.missing_itc_rows_skipped,
        "parsed trade notice"
    );

    let mut connection = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    ensure_embedding_schema(&connection)?;

    let source = SourceDocEntry {
        filename: pdf_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| pdf_path.display().to_string()),
        sha256: source_sha256,
        page_count,
    };

    let records_inserted = replace_records(&mut connection, &source, &outcome.records)?;
    sync_fts_index(&connection)?;

    let records_total = count_rows(&connection, "SELECT COUNT(*) FROM records")?;
    let updated_at = now_utc_string();

    let manifest = IngestRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: "completed".to_string(),
        started_at,
        updated_at,
        command: render_ingest_command(&args),
        tool_versions,
        paths: IngestPaths {
            cache_root: cache_root.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
            pdf_path: pdf_path.display().to_string(),
            db_path: db_path.display().to_string(),
        },
        counts: IngestCounts {
            page_count,
            records_total: records_total as usize,
            context_records: outcome.stats.context_records,
            policy_entry_records: outcome.stats.policy_entry_records,
            header_rows_skipped: outcome.stats.header_rows_skipped,
            short_rows_skipped: outcome.stats.short_rows_skipped,
            missing_itc_rows_skipped: outcome.stats.missing_itc_rows_skipped,
            pages_without_tables: outcome.stats.pages_without_tables,
            records_inserted,
        },
        source,
        warnings: Vec::new(),
        notes: vec![
            "Page 1 ingested as raw notification context; later pages as policy tables.".to_string(),
            "Chapter values forward-filled across rows to compensate for merged cells.".to_string(),
        ],
    };

    write_json_pretty(&ingest_manifest_path, &manifest)?;

    info!(path = %ingest_manifest_path.display(), "wrote ingest run manifest");
    info!(records = records_total, "ingest completed");

    Ok(())
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS source_docs (
          doc_id TEXT PRIMARY KEY,
          filename TEXT NOT NULL,
          sha256 TEXT NOT NULL,
          page_count INTEGER NOT NULL,
          ingested_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS records (
          record_id TEXT PRIMARY KEY,
          doc_id TEXT NOT NULL,
          seq INTEGER NOT NULL,
          page INTEGER NOT NULL,
          type TEXT NOT NULL,
          source TEXT,
          itc_code TEXT,
          policy TEXT,
          chapter TEXT,
          content TEXT NOT NULL,
          source_hash TEXT NOT NULL,
          FOREIGN KEY(doc_id) REFERENCES source_docs(doc_id)
        );
        ",
    )?;

    connection
        .execute(
            "
            CREATE VIRTUAL TABLE IF NOT EXISTS records_fts
            USING fts5(record_id, itc_code, chapter, content, content='records', content_rowid='rowid')
            ",
            [],
        )
        .context("failed to initialize FTS5 table records_fts")?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

pub fn ensure_embedding_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS embedding_models (
          model_id TEXT PRIMARY KEY,
          model_name TEXT NOT NULL,
          embedding_dim INTEGER NOT NULL,
          normalization TEXT NOT NULL,
          backend TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS record_embeddings (
          record_id TEXT NOT NULL,
          model_id TEXT NOT NULL,
          embedding BLOB NOT NULL,
          embedding_dim INTEGER NOT NULL,
          text_hash TEXT NOT NULL,
          updated_at TEXT NOT NULL,
          PRIMARY KEY(record_id, model_id),
          FOREIGN KEY(record_id) REFERENCES records(record_id)
        );
        ",
    )?;

    Ok(())
}

/// Replaces the stored records for the trade notice, stale embeddings
/// included, and re-registers the source document.
fn replace_records(
    connection: &mut Connection,
    source: &SourceDocEntry,
    records: &[SemanticRecord],
) -> Result<usize> {
    let tx = connection.transaction()?;
    let now = now_utc_string();

    tx.execute(
        "DELETE FROM record_embeddings WHERE record_id IN
           (SELECT record_id FROM records WHERE doc_id = ?1)",
        [DOC_ID],
    )?;
    tx.execute("DELETE FROM records WHERE doc_id = ?1", [DOC_ID])?;

    tx.execute(
        "INSERT INTO source_docs(doc_id, filename, sha256, page_count, ingested_at)
         VALUES(?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(doc_id) DO UPDATE SET
           filename=excluded.filename,
           sha256=excluded.sha256,
           page_count=excluded.page_count,
           ingested_at=excluded.ingested_at",
        params![DOC_ID, &source.filename, &source.sha256, source.page_count as i64, now],
    )?;

    let mut inserted = 0usize;
    {
        let mut statement = tx.prepare(
            "INSERT INTO records(
               record_id, doc_id, seq, page, type, source,
               itc_code, policy, chapter, content, source_hash
             )
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;

        for (index, record) in records.iter().enumerate() {
            let seq = (index + 1) as i64;
            let meta = &record.metadata;
            let record_id = format!("{}:{}:{:04}", DOC_ID, meta.record_type, seq);

            statement.execute(params![
                record_id,
                DOC_ID,
                seq,
                meta.page,
                &meta.record_type,
                meta.source.as_deref(),
                meta.itc_code.as_deref(),
                meta.policy.as_deref(),
                meta.chapter.as_deref(),
                &record.content,
                &source.sha256,
            ])?;
            inserted += 1;
        }
    }

    tx.commit()?;
    Ok(inserted)
}

fn sync_fts_index(connection: &Connection) -> Result<()> {
    connection
        .execute("INSERT INTO records_fts(records_fts) VALUES('rebuild')", [])
        .context("failed to rebuild FTS index")?;
    Ok(())
}

fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}

fn collect_tool_versions() -> Result<ToolVersions> {
    Ok(ToolVersions {
        rustc: command_version("rustc", &["--version"])?,
        cargo: command_version("cargo", &["--version"])?,
        pdftotext: command_version("pdftotext", &["-v"])?,
    })
}

fn command_version(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run {} {}", program, args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} {} failed: {}", program, args.join(" "), stderr.trim());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let source = if stdout.trim().is_empty() {
        stderr.trim()
    } else {
        stdout.trim()
    };

    let version_line = source
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .unwrap_or("unknown");

    Ok(version_line.to_string())
}

fn render_ingest_command(args: &IngestArgs) -> String {
    let mut command = vec![
        "exportpolicy".to_string(),
        "ingest".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
    ];

    if let Some(path) = &args.pdf_path {
        command.push("--pdf-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.db_path {
        command.push("--db-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(path) = &args.ingest_manifest_path {
        command.push("--ingest-manifest-path".to_string());
        command.push(path.display().to_string());
    }
    if let Some(max_pages) = args.max_pages {
        command.push("--max-pages".to_string());
        command.push(max_pages.to_string());
    }

    command.join(" ")
}
