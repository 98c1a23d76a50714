//! Markdown desired-state table.
//!
//! Data rows look like `| Name | Emails | Phones | Note | Comments |`. The emails
//! and phones cells are comma separated; the trailing column is decorative.

use std::path::Path;

use anyhow::{Context, Result};
use contact_sync_core::{normalize_emails, DesiredEntry};

const DONE_MARKER: char = '\u{2705}';

/// Split a comma-separated cell, dropping blanks.
#[must_use]
pub fn split_list(cell: &str) -> Vec<String> {
    cell.split(',').map(str::trim).filter(|value| !value.is_empty()).map(str::to_string).collect()
}

fn is_header(line: &str) -> bool {
    (line.contains("Name") && line.contains("Emails")) || is_separator(line)
}

/// `|---|:--:|`, with or without padding around the cells.
fn is_separator(line: &str) -> bool {
    let cells: Vec<&str> = line.trim().trim_matches('|').split('|').map(str::trim).collect();
    cells.iter().any(|cell| cell.contains('-'))
        && cells.iter().all(|cell| cell.chars().all(|ch| matches!(ch, '-' | ':')))
}

/// Parse every data row of a desired table. Rows with fewer than five cells or
/// a blank name are skipped.
#[must_use]
pub fn parse_desired(text: &str) -> Vec<DesiredEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim_end();
        if !line.starts_with('|') || is_header(line) {
            continue;
        }
        let cells: Vec<&str> = line.split('|').collect();
        // Leading and trailing pipes produce empty outer cells.
        if cells.len() < 6 {
            tracing::debug!("skipping short desired row: {line}");
            continue;
        }
        let name = cells[1].trim().trim_start_matches(DONE_MARKER).trim().to_string();
        if name.is_empty() {
            tracing::debug!("skipping desired row without a name: {line}");
            continue;
        }
        let emails = normalize_emails(&split_list(cells[2]));
        let note = cells[4].trim();
        entries.push(DesiredEntry {
            name,
            emails,
            phones: split_list(cells[3]),
            note: Some(note.to_string()).filter(|note| !note.is_empty()),
        });
    }
    entries
}

/// # Errors
/// Returns an error when the file cannot be read.
pub fn read_desired(path: &Path) -> Result<Vec<DesiredEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read desired table {}", path.display()))?;
    Ok(parse_desired(&text))
}
