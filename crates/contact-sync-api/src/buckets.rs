//! Local archive of contacts removed from or moved out of the remote store.
//!
//! Layout: `<root>/<bucket>/<slug(name)>.vcf`. A bucket name is a single path
//! component.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use contact_sync_core::{
    ensure_uid, order_and_dedupe, slug, stamp_revision, BucketEntry, BucketStore, ExecutionMode,
    NameKey, RemoteRecord, SyncError,
};
use contact_sync_store_carddav::vcard;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BucketListing {
    pub mode: ExecutionMode,
    pub entries: Vec<BucketEntry>,
    /// Files whose card repeats a name already seen earlier in the walk.
    /// Removed from disk in apply mode.
    pub duplicates: Vec<PathBuf>,
    /// Files that could not be read or decoded.
    pub unreadable: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CleanReport {
    pub mode: ExecutionMode,
    pub missing_phones: Vec<BucketEntry>,
    /// Files rewritten (apply) or that would be rewritten (preview).
    pub normalized: Vec<PathBuf>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FsBucketStore {
    root: PathBuf,
}

impl FsBucketStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// # Errors
    /// Returns [`SyncError::Validation`] when `bucket` is not a plain directory name.
    pub fn path_for(&self, bucket: &str, record: &RemoteRecord) -> Result<PathBuf, SyncError> {
        let bucket = bucket.trim();
        if bucket.is_empty() || bucket == "." || bucket == ".." || bucket.contains(['/', '\\']) {
            return Err(SyncError::Validation(format!("invalid bucket name {bucket:?}")));
        }
        Ok(self.root.join(bucket).join(format!("{}.vcf", file_stem(record))))
    }

    /// Walk the archive in file-name order and collect one entry per card.
    /// A file whose card shares a name key with a card from an earlier file is
    /// a duplicate; apply mode deletes it.
    ///
    /// # Errors
    /// Never fails for a missing root; unreadable files are reported in the
    /// listing instead.
    pub fn list_entries(&self, mode: ExecutionMode) -> Result<BucketListing> {
        let mut listing = BucketListing { mode, ..BucketListing::default() };
        let mut seen: BTreeMap<NameKey, PathBuf> = BTreeMap::new();

        for path in self.card_files() {
            let cards = match read_cards(&path) {
                Ok(cards) => cards,
                Err(err) => {
                    tracing::debug!("skipping {}: {err:#}", path.display());
                    listing.unreadable.push(path);
                    continue;
                }
            };
            let bucket = path
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();

            for card in cards {
                let key = card.name_key();
                if let Some(kept) = seen.get(&key).filter(|kept| **kept != path) {
                    if mode.is_apply() {
                        match std::fs::remove_file(&path) {
                            Ok(()) => tracing::info!(
                                "removed duplicate {} (kept {})",
                                path.display(),
                                kept.display()
                            ),
                            Err(err) => tracing::warn!("remove {}: {err}", path.display()),
                        }
                    } else {
                        tracing::debug!("[dry-run] would remove duplicate {}", path.display());
                    }
                    listing.duplicates.push(path.clone());
                    break;
                }
                seen.insert(key, path.clone());
                listing.entries.push(BucketEntry {
                    bucket: bucket.clone(),
                    name: card.display_name,
                    emails: card.emails,
                    phones: card.phones,
                    path: path.clone(),
                });
            }
        }
        Ok(listing)
    }

    /// Warn about entries without phones and fold every file down to its first
    /// card carrying the canonical union of all phones in the file, with the
    /// structured name aligned to the display name.
    ///
    /// # Errors
    /// Propagates listing errors; per-file write failures are collected.
    pub fn clean(&self, mode: ExecutionMode) -> Result<CleanReport> {
        let listing = self.list_entries(mode)?;
        let mut report = CleanReport { mode, ..CleanReport::default() };

        let mut paths = BTreeSet::new();
        for entry in listing.entries {
            paths.insert(entry.path.clone());
            if entry.phones.is_empty() {
                tracing::warn!(
                    "{} missing phone: {} ({})",
                    entry.bucket,
                    entry.name,
                    entry.path.display()
                );
                report.missing_phones.push(entry);
            }
        }

        for path in paths {
            match normalize_file(&path, mode) {
                Ok(true) => report.normalized.push(path),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!("normalize {}: {err:#}", path.display());
                    report.failures.push(format!("{}: {err:#}", path.display()));
                }
            }
        }
        Ok(report)
    }

    fn card_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "vcf"))
            .map(walkdir::DirEntry::into_path)
            .collect()
    }
}

impl BucketStore for FsBucketStore {
    fn archive(&mut self, bucket: &str, record: &RemoteRecord) -> Result<PathBuf, SyncError> {
        let path = self.path_for(bucket, record)?;
        write_card(&path, record).map_err(|err| SyncError::Archive(format!("{err:#}")))?;
        tracing::info!("archived {} to {}", record.display_name, path.display());
        Ok(path)
    }
}

/// `<stem>.vcf` in the working directory.
#[must_use]
pub fn default_backup_path(record: &RemoteRecord) -> PathBuf {
    PathBuf::from(format!("{}.vcf", file_stem(record)))
}

fn file_stem(record: &RemoteRecord) -> String {
    let stem = slug(&record.display_name);
    if !stem.is_empty() {
        return stem;
    }
    let uid = slug(&record.uid);
    if uid.is_empty() {
        "contact".to_string()
    } else {
        uid
    }
}

/// Write one record as a standalone card file, creating parent directories.
///
/// # Errors
/// Returns an error when the directory or the file cannot be written.
pub fn write_card(path: &Path, record: &RemoteRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    std::fs::write(path, vcard::encode(record))
        .with_context(|| format!("write card {}", path.display()))
}

/// # Errors
/// Returns an error when the file cannot be read or holds no valid card.
pub fn read_cards(path: &Path) -> Result<Vec<RemoteRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read card file {}", path.display()))?;
    vcard::decode_all(&text).with_context(|| format!("decode card file {}", path.display()))
}

fn normalize_file(path: &Path, mode: ExecutionMode) -> Result<bool> {
    let cards = read_cards(path)?;
    let all_phones: Vec<&str> =
        cards.iter().flat_map(|card| card.phones.iter().map(String::as_str)).collect();
    let Some(mut primary) = cards.first().cloned() else {
        return Ok(false);
    };

    let phones = order_and_dedupe(&all_phones);
    let changed = cards.len() > 1
        || primary.phones != phones
        || primary.sort_name != primary.display_name;
    if !changed {
        return Ok(false);
    }
    if !mode.is_apply() {
        tracing::debug!("[dry-run] would normalize {}", path.display());
        return Ok(true);
    }

    primary.phones = phones;
    primary.sort_name.clone_from(&primary.display_name);
    ensure_uid(&mut primary);
    stamp_revision(&mut primary, OffsetDateTime::now_utc());
    write_card(path, &primary)?;
    Ok(true)
}
