//! One reconciliation pass: fetch, deduplicate, index, optionally touch, remove
//! extras, apply desired entries, verify.
//!
//! Every step computes its full plan in both modes; only the mutating store and
//! archive calls are gated on [`ExecutionMode::Apply`]. Each planned action
//! records whether it was committed so preview and apply runs can be compared.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::dedupe::resolve_duplicates;
use crate::photo::PhotoPolicy;
use crate::reconcile::reconcile;
use crate::{
    fetch_all, put_tracked, stamp_revision, BucketStore, ContactStore, DesiredEntry,
    ExecutionMode, NameKey, RemoteRecord, SyncError,
};

pub const NEUTRAL_BUCKET: &str = "neutral";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Fetch,
    RemoveDuplicate,
    Touch,
    ArchiveExtra,
    RemoveExtra,
    Update,
    Create,
    SkipDesired,
    Verify,
    Delete,
    Move,
    Photo,
    FixName,
    Recreate,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::RemoveDuplicate => "remove_duplicate",
            Self::Touch => "touch",
            Self::ArchiveExtra => "archive_extra",
            Self::RemoveExtra => "remove_extra",
            Self::Update => "update",
            Self::Create => "create",
            Self::SkipDesired => "skip_desired",
            Self::Verify => "verify",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Photo => "photo",
            Self::FixName => "fix_name",
            Self::Recreate => "recreate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PlannedAction {
    pub kind: ActionKind,
    pub name: String,
    pub reference: Option<String>,
    pub committed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl PlannedAction {
    #[must_use]
    pub fn new(kind: ActionKind, record: &RemoteRecord) -> Self {
        Self {
            kind,
            name: record.display_name.clone(),
            reference: record.reference.as_ref().map(|reference| reference.href.clone()),
            committed: false,
            details: Vec::new(),
        }
    }

    #[must_use]
    pub fn named(kind: ActionKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            reference: None,
            committed: false,
            details: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OperationFailure {
    pub kind: ActionKind,
    pub name: String,
    pub reference: Option<String>,
    pub error: SyncError,
}

impl OperationFailure {
    #[must_use]
    pub fn new(action: &PlannedAction, error: SyncError) -> Self {
        Self {
            kind: action.kind,
            name: action.name.clone(),
            reference: action.reference.clone(),
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncOptions {
    pub mode: ExecutionMode,
    /// Bump the revision of every surviving record, independent of content.
    pub touch: bool,
    pub extras_bucket: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Preview,
            touch: false,
            extras_bucket: NEUTRAL_BUCKET.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct SyncReport {
    pub mode: ExecutionMode,
    pub fetched: usize,
    pub survivors: usize,
    pub actions: Vec<PlannedAction>,
    pub failures: Vec<OperationFailure>,
    /// Records re-fetched after the pass.
    pub verified: Vec<RemoteRecord>,
}

impl SyncReport {
    pub fn actions_of(&self, kind: ActionKind) -> impl Iterator<Item = &PlannedAction> {
        self.actions.iter().filter(move |action| action.kind == kind)
    }

    #[must_use]
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions_of(kind).count()
    }

    #[must_use]
    pub fn committed(&self, kind: ActionKind) -> usize {
        self.actions_of(kind).filter(|action| action.committed).count()
    }
}

pub struct Reconciler<'a, S: ContactStore + ?Sized, B: BucketStore + ?Sized> {
    store: &'a mut S,
    buckets: &'a mut B,
    photos: PhotoPolicy<'a>,
    options: SyncOptions,
}

impl<'a, S: ContactStore + ?Sized, B: BucketStore + ?Sized> Reconciler<'a, S, B> {
    #[must_use]
    pub fn new(
        store: &'a mut S,
        buckets: &'a mut B,
        photos: PhotoPolicy<'a>,
        options: SyncOptions,
    ) -> Self {
        Self { store, buckets, photos, options }
    }

    /// Run one full pass against `desired`.
    ///
    /// # Errors
    /// Returns the listing error when the initial fetch cannot enumerate the
    /// store. Every later failure is scoped to one record and collected in the
    /// report.
    pub fn run(&mut self, desired: &[DesiredEntry]) -> Result<SyncReport, SyncError> {
        let mode = self.options.mode;
        let mut report = SyncReport { mode, ..SyncReport::default() };

        let (records, fetch_failures) = fetch_all(&*self.store)?;
        report.fetched = records.len();
        for (reference, error) in fetch_failures {
            let mut action = PlannedAction::named(ActionKind::Fetch, "");
            action.reference = Some(reference.href);
            report.failures.push(OperationFailure::new(&action, error));
        }

        let resolution = resolve_duplicates(&mut *self.store, records, mode);
        report.actions.extend(resolution.actions);
        report.failures.extend(resolution.failures);
        report.survivors = resolution.survivors.len();

        let mut index: BTreeMap<NameKey, RemoteRecord> = resolution
            .survivors
            .into_iter()
            .map(|record| (record.name_key(), record))
            .collect();

        if self.options.touch {
            self.touch_all(&mut index, &mut report);
        }

        let wanted = Self::desired_keys(desired, &mut report);
        self.remove_extras(&mut index, &wanted, &mut report);
        self.apply_desired(&mut index, desired, &mut report);
        self.verify(&mut report);

        Ok(report)
    }

    fn desired_keys(desired: &[DesiredEntry], report: &mut SyncReport) -> BTreeSet<NameKey> {
        let mut wanted = BTreeSet::new();
        for entry in desired {
            if let Err(err) = entry.validate() {
                let action = PlannedAction::named(ActionKind::SkipDesired, &entry.name);
                report.failures.push(OperationFailure::new(&action, err));
                continue;
            }
            wanted.insert(entry.key());
        }
        wanted
    }

    fn touch_all(&mut self, index: &mut BTreeMap<NameKey, RemoteRecord>, report: &mut SyncReport) {
        let now = OffsetDateTime::now_utc();
        for record in index.values_mut() {
            stamp_revision(record, now);
            let mut action = PlannedAction::new(ActionKind::Touch, record);
            if self.options.mode.is_apply() {
                match self.persist_existing(record) {
                    Ok(()) => action.committed = true,
                    Err(err) => {
                        tracing::warn!("touch {}: {}", record.href(), err);
                        report.failures.push(OperationFailure::new(&action, err));
                    }
                }
            }
            report.actions.push(action);
        }
    }

    fn remove_extras(
        &mut self,
        index: &mut BTreeMap<NameKey, RemoteRecord>,
        wanted: &BTreeSet<NameKey>,
        report: &mut SyncReport,
    ) {
        let extras: Vec<NameKey> =
            index.keys().filter(|key| !wanted.contains(*key)).cloned().collect();
        for key in extras {
            let Some(mut record) = index.remove(&key) else {
                continue;
            };
            let mut archive = PlannedAction::new(ActionKind::ArchiveExtra, &record);
            archive.details.push(self.options.extras_bucket.clone());
            let mut removal = PlannedAction::new(ActionKind::RemoveExtra, &record);

            if self.options.mode.is_apply() {
                stamp_revision(&mut record, OffsetDateTime::now_utc());
                match self.buckets.archive(&self.options.extras_bucket, &record) {
                    Ok(path) => {
                        archive.committed = true;
                        archive.details.push(path.display().to_string());
                        removal.committed = self.delete_extra(&record, &removal, report);
                    }
                    Err(err) => {
                        // Never delete what could not be archived.
                        tracing::warn!("archive extra {}: {}", record.display_name, err);
                        report.failures.push(OperationFailure::new(&archive, err));
                    }
                }
            } else {
                tracing::debug!("[dry-run] would remove extra {}", record.display_name);
            }
            report.actions.push(archive);
            report.actions.push(removal);
        }
    }

    fn delete_extra(
        &mut self,
        record: &RemoteRecord,
        removal: &PlannedAction,
        report: &mut SyncReport,
    ) -> bool {
        let Some(reference) = record.reference.as_ref() else {
            return false;
        };
        match self.store.delete(reference) {
            Ok(()) => {
                tracing::info!("removed extra {} ({})", record.display_name, reference.href);
                true
            }
            Err(err) => {
                tracing::warn!("delete extra {}: {}", reference.href, err);
                report.failures.push(OperationFailure::new(removal, err));
                false
            }
        }
    }

    fn apply_desired(
        &mut self,
        index: &mut BTreeMap<NameKey, RemoteRecord>,
        desired: &[DesiredEntry],
        report: &mut SyncReport,
    ) {
        let mut handled: BTreeSet<NameKey> = BTreeSet::new();
        for entry in desired {
            if entry.validate().is_err() {
                continue;
            }
            let key = entry.key();
            if !handled.insert(key.clone()) {
                let mut action = PlannedAction::named(ActionKind::SkipDesired, &entry.name);
                action.details.push("duplicate desired row".to_string());
                report.actions.push(action);
                continue;
            }

            if let Some(record) = index.get_mut(&key) {
                self.update_existing(record, entry, report);
            } else {
                let record = self.create_new(entry, report);
                index.insert(key, record);
            }
        }
    }

    fn update_existing(
        &mut self,
        record: &mut RemoteRecord,
        entry: &DesiredEntry,
        report: &mut SyncReport,
    ) {
        let change = reconcile(record, entry, &self.photos);
        if let Some(err) = change.photo_error {
            let action = PlannedAction::new(ActionKind::Update, record);
            report.failures.push(OperationFailure::new(&action, err));
        }
        if !change.changed {
            return;
        }

        let mut action = PlannedAction::new(ActionKind::Update, record);
        action.details = change.fields;
        if self.options.mode.is_apply() {
            stamp_revision(record, OffsetDateTime::now_utc());
            match self.persist_existing(record) {
                Ok(()) => {
                    tracing::info!("updated {}", record.display_name);
                    action.committed = true;
                }
                Err(err) => {
                    tracing::warn!("put {}: {}", record.href(), err);
                    report.failures.push(OperationFailure::new(&action, err));
                }
            }
        } else {
            tracing::debug!(
                "[dry-run] would update {} ({})",
                record.display_name,
                action.details.join(", ")
            );
        }
        report.actions.push(action);
    }

    fn create_new(&mut self, entry: &DesiredEntry, report: &mut SyncReport) -> RemoteRecord {
        let mut record = RemoteRecord::from_desired(entry);
        let emails = record.emails.clone();
        if let Err(err) = self.photos.assign(&mut record, &entry.name, &emails) {
            let action = PlannedAction::named(ActionKind::Create, &entry.name);
            report.failures.push(OperationFailure::new(&action, err));
        }

        let mut action = PlannedAction::new(ActionKind::Create, &record);
        if self.options.mode.is_apply() {
            let reference = self.store.allocate();
            stamp_revision(&mut record, OffsetDateTime::now_utc());
            action.reference = Some(reference.href.clone());
            match put_tracked(&mut *self.store, &reference, &record) {
                Ok(stored) => {
                    record.reference = Some(stored);
                    tracing::info!("created {}", record.display_name);
                    action.committed = true;
                }
                Err(err) => {
                    tracing::warn!("put new {}: {}", entry.name, err);
                    report.failures.push(OperationFailure::new(&action, err));
                }
            }
        } else {
            tracing::debug!("[dry-run] would create {}", record.display_name);
        }
        report.actions.push(action);
        record
    }

    /// Put a record back at its own reference and adopt the returned token.
    fn persist_existing(&mut self, record: &mut RemoteRecord) -> Result<(), SyncError> {
        let Some(reference) = record.reference.clone() else {
            return Err(SyncError::Validation(format!(
                "{} has no stored reference",
                record.display_name
            )));
        };
        record.reference = Some(put_tracked(&mut *self.store, &reference, record)?);
        Ok(())
    }

    fn verify(&mut self, report: &mut SyncReport) {
        match fetch_all(&*self.store) {
            Ok((mut records, failures)) => {
                for (reference, error) in failures {
                    let mut action = PlannedAction::named(ActionKind::Verify, "");
                    action.reference = Some(reference.href);
                    report.failures.push(OperationFailure::new(&action, error));
                }
                records.sort_by_key(|record| record.display_name.to_lowercase());
                report.verified = records;
            }
            Err(err) => {
                tracing::warn!("verify list: {}", err);
                let action = PlannedAction::named(ActionKind::Verify, "");
                report.failures.push(OperationFailure::new(&action, err));
            }
        }
    }
}
