use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use regex::Regex;

use super::pipeline::{PageSource, RawRow};

/// pdftotext-backed page source. The plain text layer feeds the context
/// page; `-layout` output feeds the table pages, with each line split into
/// cells on runs of two or more spaces. This is a thin adapter over the
/// tool's column alignment, not a layout engine.
pub struct PdfPages {
    text_pages: Vec<String>,
    layout_pages: Vec<String>,
    cell_splitter: Regex,
}

impl PdfPages {
    pub fn open(pdf_path: &Path, max_pages: Option<usize>) -> Result<Self> {
        let text_pages = extract_pages_with_pdftotext(pdf_path, max_pages, false)?;
        let layout_pages = extract_pages_with_pdftotext(pdf_path, max_pages, true)?;
        let cell_splitter =
            Regex::new(r"\s{2,}").context("failed to compile layout cell splitter regex")?;

        Ok(Self {
            text_pages,
            layout_pages,
            cell_splitter,
        })
    }
}

impl PageSource for PdfPages {
    fn page_count(&self) -> usize {
        self.text_pages.len().max(self.layout_pages.len())
    }

    fn page_text(&self, page_index: usize) -> Result<Option<String>> {
        Ok(self
            .text_pages
            .get(page_index)
            .map(|page| page.trim().to_string())
            .filter(|page| !page.is_empty()))
    }

    fn page_table(&self, page_index: usize) -> Result<Option<Vec<RawRow>>> {
        let Some(page) = self.layout_pages.get(page_index) else {
            return Ok(None);
        };

        let rows = split_layout_rows(page, &self.cell_splitter);
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows))
        }
    }
}

/// Lines with at least two aligned cells count as table rows; single-cell
/// lines are prose or wrapped cell continuations and are left out.
fn split_layout_rows(page: &str, cell_splitter: &Regex) -> Vec<RawRow> {
    let mut rows = Vec::<RawRow>::new();

    for raw_line in page.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let cells = cell_splitter
            .split(line)
            .map(|cell| {
                let cell = cell.trim();
                if cell.is_empty() {
                    None
                } else {
                    Some(cell.to_string())
                }
            })
            .collect::<RawRow>();

        if cells.len() >= 2 {
            rows.push(cells);
        }
    }

    rows
}

fn extract_pages_with_pdftotext(
    pdf_path: &Path,
    max_pages: Option<usize>,
    layout: bool,
) -> Result<Vec<String>> {
    let mut command = Command::new("pdftotext");
    command.arg("-enc").arg("UTF-8").arg("-f").arg("1");
    if layout {
        command.arg("-layout");
    }
    if let Some(max_pages) = max_pages {
        command.arg("-l").arg(max_pages.to_string());
    }
    command.arg(pdf_path).arg("-");

    let output = command
        .output()
        .with_context(|| format!("failed to execute pdftotext for {}", pdf_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "pdftotext returned non-zero exit status for {}: {}",
            pdf_path.display(),
            stderr.trim()
        );
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let mut pages: Vec<String> = raw
        .split('\u{000C}')
        .map(|chunk| chunk.replace('\u{0000}', ""))
        .collect();

    while let Some(last_page) = pages.last() {
        if last_page.trim().is_empty() {
            pages.pop();
            continue;
        }
        break;
    }

    Ok(pages)
}
