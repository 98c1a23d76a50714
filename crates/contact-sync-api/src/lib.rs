use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use contact_sync_core::{
    ensure_uid, fetch_all, find_by_name, fresh_uid, normalize_emails, order_and_dedupe,
    put_tracked, stamp_revision, ActionKind, BucketStore, ContactStore, DesiredEntry,
    ExecutionMode, OperationFailure, PhotoMap, PhotoPolicy, PlannedAction, Reconciler, RecordRef,
    RemoteRecord, SyncError, SyncOptions, SyncReport,
};
use contact_sync_store_carddav::CardDavClient;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod buckets;
pub mod config;
pub mod desired;
pub mod photos;
pub mod table;

pub use buckets::{BucketListing, CleanReport, FsBucketStore};
pub use config::ContactSyncConfig;
pub use desired::{parse_desired, read_desired, split_list};
pub use photos::{load_photo_map, FsPhotoLoader, GravatarClient};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AddRequest {
    pub name: String,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub note: Option<String>,
}

/// By-name update. `None` leaves a field untouched; an empty note clears it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UpdateRequest {
    pub name: String,
    pub new_name: Option<String>,
    pub emails: Option<Vec<String>>,
    pub phones: Option<Vec<String>>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeleteRequest {
    pub name: String,
    /// Backup card path; defaults to `<slug>.vcf` in the working directory.
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MoveRequest {
    pub name: String,
    pub bucket: String,
    pub new_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PhotosRequest {
    pub force: bool,
    /// Overrides the configured photo map path.
    pub map: Option<PathBuf>,
    /// Overrides the configured Gravatar switch.
    pub gravatar: Option<bool>,
}

/// Result of a single-entity command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOutcome {
    pub mode: ExecutionMode,
    pub action: PlannedAction,
    pub record: RemoteRecord,
    /// Backup or archive file, when the command writes one.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BulkReport {
    pub mode: ExecutionMode,
    pub actions: Vec<PlannedAction>,
    pub failures: Vec<OperationFailure>,
}

impl BulkReport {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self { mode, ..Self::default() }
    }

    #[must_use]
    pub fn committed(&self) -> usize {
        self.actions.iter().filter(|action| action.committed).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchResult {
    pub contacts: Vec<RemoteRecord>,
    pub failures: Vec<OperationFailure>,
    pub touched: Option<BulkReport>,
    pub table: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncOutcome {
    pub report: SyncReport,
    /// Verification table written after the pass.
    pub table: PathBuf,
}

/// List the bucket archive. Runs without remote credentials.
///
/// # Errors
/// Returns an error when the archive cannot be walked.
pub fn list_buckets(config: &ContactSyncConfig, mode: ExecutionMode) -> Result<BucketListing> {
    FsBucketStore::new(config.buckets_root.clone()).list_entries(mode)
}

/// Normalize phones in every archived card. Runs without remote credentials.
///
/// # Errors
/// Returns an error when the archive cannot be walked.
pub fn clean_buckets(config: &ContactSyncConfig, mode: ExecutionMode) -> Result<CleanReport> {
    FsBucketStore::new(config.buckets_root.clone()).clean(mode)
}

pub struct ContactSyncApi<S: ContactStore> {
    config: ContactSyncConfig,
    store: S,
    buckets: FsBucketStore,
}

impl ContactSyncApi<CardDavClient> {
    /// Build an API bound to the configured CardDAV collection.
    ///
    /// # Errors
    /// Returns an error when the base URL or credentials are missing.
    pub fn connect(config: ContactSyncConfig) -> Result<Self> {
        let client = CardDavClient::new(&config.carddav_settings())
            .context("CARDDAV_BASE_URL, CARDDAV_USER and CARDDAV_PASS must be set")?;
        Ok(Self::new(config, client))
    }
}

impl<S: ContactStore> ContactSyncApi<S> {
    #[must_use]
    pub fn new(config: ContactSyncConfig, store: S) -> Self {
        let buckets = FsBucketStore::new(config.buckets_root.clone());
        Self { config, store, buckets }
    }

    #[must_use]
    pub fn config(&self) -> &ContactSyncConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    fn fetch_records(&self) -> Result<(Vec<RemoteRecord>, Vec<OperationFailure>)> {
        let (records, failed) = fetch_all(&self.store).context("list contacts")?;
        let failures = failed
            .into_iter()
            .map(|(reference, error)| {
                let mut action = PlannedAction::named(ActionKind::Fetch, "");
                action.reference = Some(reference.href);
                OperationFailure::new(&action, error)
            })
            .collect();
        Ok((records, failures))
    }

    fn find(&self, name: &str) -> Result<RemoteRecord> {
        let (records, _) = self.fetch_records()?;
        find_by_name(&records, name)
            .cloned()
            .ok_or_else(|| anyhow::Error::new(SyncError::NotFound(name.to_string())))
    }

    /// Stamp and write back an already persisted record, adopting the new token.
    fn persist(&mut self, record: &mut RemoteRecord) -> Result<(), SyncError> {
        let reference = stored_reference(record)?;
        stamp_revision(record, OffsetDateTime::now_utc());
        record.reference = Some(put_tracked(&mut self.store, &reference, record)?);
        Ok(())
    }

    /// Fetch every contact; optionally bump every revision first and write the
    /// markdown table.
    ///
    /// # Errors
    /// Returns an error when the store cannot be listed or the table cannot be
    /// written.
    pub fn fetch(&mut self, touch_all: bool, table_path: Option<&Path>) -> Result<FetchResult> {
        let touched = if touch_all { Some(self.touch_all()?) } else { None };
        let (contacts, failures) = self.fetch_records()?;
        if let Some(path) = table_path {
            table::write_markdown(path, &contacts)?;
            tracing::info!("wrote {}", path.display());
        }
        let table = table_path.map(Path::to_path_buf);
        Ok(FetchResult { contacts, failures, touched, table })
    }

    /// Bump the revision of every contact. Always applied.
    ///
    /// # Errors
    /// Returns an error when the store cannot be listed.
    pub fn touch_all(&mut self) -> Result<BulkReport> {
        let (records, failures) = self.fetch_records()?;
        let mut report = BulkReport { failures, ..BulkReport::new(ExecutionMode::Apply) };
        for mut record in records {
            let mut action = PlannedAction::new(ActionKind::Touch, &record);
            match self.persist(&mut record) {
                Ok(()) => action.committed = true,
                Err(err) => {
                    tracing::warn!("touch {}: {}", record.href(), err);
                    report.failures.push(OperationFailure::new(&action, err));
                }
            }
            report.actions.push(action);
        }
        tracing::info!("touched {} contact(s)", report.committed());
        Ok(report)
    }

    /// Create one contact.
    ///
    /// # Errors
    /// Returns an error for a blank name or a failed write.
    pub fn add(&mut self, request: AddRequest, mode: ExecutionMode) -> Result<CommandOutcome> {
        let entry = DesiredEntry {
            name: request.name.trim().to_string(),
            emails: request.emails,
            phones: request.phones,
            note: request.note,
        };
        entry.validate()?;

        let mut record = RemoteRecord::from_desired(&entry);
        let mut action = PlannedAction::new(ActionKind::Create, &record);
        if mode.is_apply() {
            let reference = self.store.allocate();
            stamp_revision(&mut record, OffsetDateTime::now_utc());
            action.reference = Some(reference.href.clone());
            let stored = put_tracked(&mut self.store, &reference, &record)
                .with_context(|| format!("create {}", entry.name))?;
            record.reference = Some(stored);
            action.committed = true;
            tracing::info!("added {}", entry.name);
        } else {
            tracing::info!("[dry-run] would add {}", entry.name);
        }
        Ok(CommandOutcome { mode, action, record, path: None })
    }

    /// Update one contact found by name.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] (downcastable) when no contact matches,
    /// or the write error, including [`SyncError::Conflict`].
    pub fn update(
        &mut self,
        request: UpdateRequest,
        mode: ExecutionMode,
    ) -> Result<CommandOutcome> {
        let mut record = self.find(&request.name)?;
        let mut action = PlannedAction::new(ActionKind::Update, &record);

        if let Some(new_name) = request.new_name.map(|name| name.trim().to_string()) {
            if !new_name.is_empty() {
                record.display_name.clone_from(&new_name);
                record.sort_name = new_name;
                action.details.push("name".to_string());
            }
        }
        if let Some(emails) = request.emails.filter(|emails| !emails.is_empty()) {
            record.emails = normalize_emails(&emails);
            action.details.push("emails".to_string());
        }
        if let Some(phones) = request.phones.filter(|phones| !phones.is_empty()) {
            record.phones = order_and_dedupe(&phones);
            action.details.push("phones".to_string());
        }
        if let Some(note) = request.note {
            record.note = Some(note).filter(|note| !note.is_empty());
            action.details.push("note".to_string());
        }
        ensure_uid(&mut record);

        if mode.is_apply() {
            self.persist(&mut record).with_context(|| format!("update {}", request.name))?;
            action.committed = true;
            tracing::info!("updated {}", request.name);
        } else {
            let fields = action.details.join(", ");
            tracing::info!("[dry-run] would update {} ({fields})", request.name);
        }
        Ok(CommandOutcome { mode, action, record, path: None })
    }

    /// Back up one contact to a card file, then delete it remotely.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] when no contact matches, a backup write
    /// error (the remote record is then left untouched), or the delete error.
    pub fn delete(
        &mut self,
        request: DeleteRequest,
        mode: ExecutionMode,
    ) -> Result<CommandOutcome> {
        let mut record = self.find(&request.name)?;
        let path = request.backup.unwrap_or_else(|| buckets::default_backup_path(&record));
        let mut action = PlannedAction::new(ActionKind::Delete, &record);
        action.details.push(path.display().to_string());

        if mode.is_apply() {
            stamp_revision(&mut record, OffsetDateTime::now_utc());
            buckets::write_card(&path, &record).context("backup before delete")?;
            let reference = stored_reference(&record)?;
            self.store.delete(&reference).with_context(|| format!("delete {}", request.name))?;
            action.committed = true;
            tracing::info!("deleted {} (backup at {})", request.name, path.display());
        } else {
            let backup = path.display();
            tracing::info!("[dry-run] would delete {} (backup to {backup})", request.name);
        }
        Ok(CommandOutcome { mode, action, record, path: Some(path) })
    }

    /// Optionally rename, archive into a bucket, then delete remotely.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] when no contact matches, an invalid
    /// bucket name, an archive error (the remote record is then left
    /// untouched), or the delete error.
    pub fn move_to_bucket(
        &mut self,
        request: MoveRequest,
        mode: ExecutionMode,
    ) -> Result<CommandOutcome> {
        let mut record = self.find(&request.name)?;
        if let Some(new_name) = request.new_name.map(|name| name.trim().to_string()) {
            if !new_name.is_empty() {
                record.display_name = new_name;
            }
        }
        let mut path = self.buckets.path_for(&request.bucket, &record)?;
        let mut action = PlannedAction::new(ActionKind::Move, &record);
        action.details.push(request.bucket.clone());

        if mode.is_apply() {
            stamp_revision(&mut record, OffsetDateTime::now_utc());
            path = self.buckets.archive(&request.bucket, &record).context("archive before move")?;
            let reference = stored_reference(&record)?;
            self.store.delete(&reference).with_context(|| format!("move {}", request.name))?;
            action.committed = true;
            tracing::info!("moved {} to {}", record.display_name, path.display());
        } else {
            tracing::info!("[dry-run] would move {} to {}", record.display_name, path.display());
        }
        Ok(CommandOutcome { mode, action, record, path: Some(path) })
    }

    /// Run one reconciliation pass against the desired table at `source` and
    /// write the verification table.
    ///
    /// # Errors
    /// Returns an error when the desired table cannot be read, the store cannot
    /// be listed, or the verification table cannot be written.
    pub fn sync(&mut self, source: &Path, mode: ExecutionMode, touch: bool) -> Result<SyncOutcome> {
        let desired = read_desired(source)?;
        let photo_map = load_photo_map(&self.config.photo_map);
        let gravatar = self.config.gravatar.then(|| GravatarClient::new(self.config.timeout));
        let options = SyncOptions { mode, touch, ..SyncOptions::default() };

        let report = {
            let policy = photo_policy(&photo_map, &FsPhotoLoader, gravatar.as_ref(), false);
            Reconciler::new(&mut self.store, &mut self.buckets, policy, options)
                .run(&desired)
                .context("reconciliation pass")?
        };

        let table_path = self.config.synced_table.clone();
        table::write_markdown(&table_path, &report.verified)?;
        tracing::info!(
            "sync {}: {} action(s), {} failure(s); wrote {} ({} rows)",
            mode.as_str(),
            report.actions.len(),
            report.failures.len(),
            table_path.display(),
            report.verified.len()
        );
        Ok(SyncOutcome { report, table: table_path })
    }

    /// Apply the photo policy to every contact.
    ///
    /// # Errors
    /// Returns an error when the store cannot be listed.
    pub fn photos(&mut self, request: PhotosRequest, mode: ExecutionMode) -> Result<BulkReport> {
        let map_path = request.map.unwrap_or_else(|| self.config.photo_map.clone());
        let photo_map = load_photo_map(&map_path);
        let gravatar = request
            .gravatar
            .unwrap_or(self.config.gravatar)
            .then(|| GravatarClient::new(self.config.timeout));

        let (records, failures) = self.fetch_records()?;
        let mut report = BulkReport { failures, ..BulkReport::new(mode) };
        for mut record in records {
            let name = record.display_name.clone();
            let emails = record.emails.clone();
            let assigned = {
                let policy =
                    photo_policy(&photo_map, &FsPhotoLoader, gravatar.as_ref(), request.force);
                policy.assign(&mut record, &name, &emails)
            };
            let mut action = PlannedAction::new(ActionKind::Photo, &record);
            match assigned {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!("avatar for {name}: {err}");
                    report.failures.push(OperationFailure::new(&action, err));
                    continue;
                }
            }
            if mode.is_apply() {
                match self.persist(&mut record) {
                    Ok(()) => action.committed = true,
                    Err(err) => {
                        tracing::warn!("put {}: {}", record.href(), err);
                        report.failures.push(OperationFailure::new(&action, err));
                    }
                }
            } else {
                tracing::info!("[dry-run] would add photo to {name}");
            }
            report.actions.push(action);
        }
        tracing::info!("photos updated: {} (apply={})", report.actions.len(), mode.is_apply());
        Ok(report)
    }

    /// Recreate every contact under a fresh uid and reference so clients
    /// refetch it. The new record is written before the old one is deleted.
    ///
    /// # Errors
    /// Returns an error when the store cannot be listed.
    pub fn refresh_uids(&mut self, mode: ExecutionMode) -> Result<BulkReport> {
        let (records, failures) = self.fetch_records()?;
        let mut report = BulkReport { failures, ..BulkReport::new(mode) };
        for old in records {
            let mut fresh = old.clone();
            fresh.uid = fresh_uid();
            fresh.sort_name.clone_from(&fresh.display_name);
            fresh.reference = None;
            let mut action = PlannedAction::new(ActionKind::Recreate, &old);

            if !mode.is_apply() {
                tracing::info!("[dry-run] would recreate {} with new uid", old.display_name);
                report.actions.push(action);
                continue;
            }
            let reference = self.store.allocate();
            action.details.push(reference.href.clone());
            stamp_revision(&mut fresh, OffsetDateTime::now_utc());
            if let Err(err) = self.store.put(&reference, &fresh) {
                tracing::warn!("refresh put {}: {}", old.display_name, err);
                report.failures.push(OperationFailure::new(&action, err));
                report.actions.push(action);
                continue;
            }
            match old.reference.as_ref().map(|reference| self.store.delete(reference)) {
                Some(Ok(())) | None => action.committed = true,
                Some(Err(err)) => {
                    tracing::warn!("refresh delete {}: {}", old.href(), err);
                    report.failures.push(OperationFailure::new(&action, err));
                }
            }
            report.actions.push(action);
        }
        tracing::info!("refresh-uids processed {} contact(s)", report.actions.len());
        Ok(report)
    }

    /// Align the structured name with the display name wherever they differ.
    ///
    /// # Errors
    /// Returns an error when the store cannot be listed.
    pub fn fix_names(&mut self, mode: ExecutionMode) -> Result<BulkReport> {
        let (records, failures) = self.fetch_records()?;
        let mut report = BulkReport { failures, ..BulkReport::new(mode) };
        for mut record in records {
            let display = record.display_name.trim().to_string();
            if display.is_empty() || record.sort_name.trim() == display {
                continue;
            }
            record.sort_name = display;
            let mut action = PlannedAction::new(ActionKind::FixName, &record);
            if mode.is_apply() {
                match self.persist(&mut record) {
                    Ok(()) => action.committed = true,
                    Err(err) => {
                        tracing::warn!("fix-names put {}: {}", record.href(), err);
                        report.failures.push(OperationFailure::new(&action, err));
                    }
                }
            } else {
                tracing::info!("[dry-run] would set N to FN for {}", record.display_name);
            }
            report.actions.push(action);
        }
        tracing::info!("fix-names updated {} contact(s)", report.actions.len());
        Ok(report)
    }
}

fn stored_reference(record: &RemoteRecord) -> Result<RecordRef, SyncError> {
    record.reference.clone().ok_or_else(|| {
        SyncError::Validation(format!("{} has no stored reference", record.display_name))
    })
}

fn photo_policy<'a>(
    photo_map: &'a PhotoMap,
    loader: &'a FsPhotoLoader,
    gravatar: Option<&'a GravatarClient>,
    force: bool,
) -> PhotoPolicy<'a> {
    let policy = PhotoPolicy::new(photo_map, loader).with_force(force);
    match gravatar {
        Some(gravatar) => policy.with_avatars(gravatar),
        None => policy,
    }
}
