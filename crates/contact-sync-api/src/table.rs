use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use contact_sync_core::{BucketEntry, RemoteRecord};

pub const SYNCED_TABLE_TITLE: &str = "# All contacts synced";

fn cell(value: &str) -> String {
    value.replace('|', "/").replace(['\r', '\n'], " ")
}

/// Render the verification table, one row per record sorted by lowercased name.
#[must_use]
pub fn render_markdown(records: &[RemoteRecord]) -> String {
    let mut sorted: Vec<&RemoteRecord> = records.iter().collect();
    sorted.sort_by_key(|record| record.display_name.to_lowercase());

    let mut out = format!("{SYNCED_TABLE_TITLE}\n\n");
    out.push_str("| Name | Emails | Phones | Note | Comments |\n|---|---|---|---|---|\n");
    for record in sorted {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |  |",
            cell(&record.display_name),
            cell(&record.emails.join(", ")),
            cell(&record.phones.join(", ")),
            cell(record.note.as_deref().unwrap_or_default()),
        );
    }
    out
}

/// # Errors
/// Returns an error when the file cannot be written.
pub fn write_markdown(path: &Path, records: &[RemoteRecord]) -> Result<()> {
    std::fs::write(path, render_markdown(records))
        .with_context(|| format!("write contacts table {}", path.display()))
}

/// Left-aligned columns separated by two spaces, with a dashed rule under the
/// header.
#[must_use]
pub fn render_columns(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|header| header.chars().count()).collect();
    for row in rows {
        for (width, value) in widths.iter_mut().zip(row) {
            *width = (*width).max(value.chars().count());
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "{}", render_row(headers.iter().copied(), &widths));
    let rule: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
    let _ = writeln!(out, "{}", rule.join("  "));
    for row in rows {
        let _ = writeln!(out, "{}", render_row(row.iter().map(String::as_str), &widths));
    }
    out
}

fn render_row<'a>(values: impl Iterator<Item = &'a str>, widths: &[usize]) -> String {
    let cells: Vec<String> =
        values.zip(widths).map(|(value, &width)| format!("{value:<width$}")).collect();
    cells.join("  ").trim_end().to_string()
}

#[must_use]
pub fn render_contacts(records: &[RemoteRecord]) -> String {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| {
            vec![
                record.display_name.trim().to_string(),
                record.emails.join(", "),
                record.phones.join(", "),
            ]
        })
        .collect();
    render_columns(&["Name", "Emails", "Phones"], &rows)
}

/// Buckets in name order, entries within a bucket by lowercased name.
#[must_use]
pub fn render_buckets(entries: &[BucketEntry]) -> String {
    let mut sorted: Vec<&BucketEntry> = entries.iter().collect();
    sorted.sort_by(|lhs, rhs| {
        lhs.bucket
            .cmp(&rhs.bucket)
            .then_with(|| lhs.name.to_lowercase().cmp(&rhs.name.to_lowercase()))
    });
    let rows: Vec<Vec<String>> = sorted
        .into_iter()
        .map(|entry| {
            vec![
                entry.bucket.clone(),
                entry.name.clone(),
                entry.emails.join(", "),
                entry.phones.join(", "),
            ]
        })
        .collect();
    render_columns(&["Bucket", "Name", "Emails", "Phones"], &rows)
}
