use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod dedupe;
pub mod memory;
pub mod phone;
pub mod photo;
pub mod reconcile;
pub mod sync;

pub use dedupe::{plan_duplicates, resolve_duplicates, DuplicatePlan, DuplicateResolution};
pub use memory::MemoryContactStore;
pub use phone::{normalize_phone, order_and_dedupe};
pub use photo::{avatar_key, AvatarSource, PhotoLoader, PhotoMap, PhotoPolicy};
pub use reconcile::{reconcile, RecordChange};
pub use sync::{
    ActionKind, OperationFailure, PlannedAction, Reconciler, SyncOptions, SyncReport,
    NEUTRAL_BUCKET,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("conflict on {reference}: {message}")]
    Conflict { reference: String, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Single gate for every mutating step. Preview computes the full plan but never
/// calls a mutating collaborator method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Preview,
    Apply,
}

impl ExecutionMode {
    #[must_use]
    pub fn from_apply_flag(apply: bool) -> Self {
        if apply {
            Self::Apply
        } else {
            Self::Preview
        }
    }

    #[must_use]
    pub fn is_apply(self) -> bool {
        self == Self::Apply
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preview => "preview",
            Self::Apply => "apply",
        }
    }
}

/// Case and surrounding-whitespace insensitive matching identity of a contact.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NameKey(String);

impl NameKey {
    #[must_use]
    pub fn of(name: &str) -> Self {
        Self(name.trim().to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NameKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lowercase, whitespace to `-`, drop anything outside `[a-z0-9-]`, trim `-`.
#[must_use]
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.to_lowercase().chars() {
        if ch.is_whitespace() {
            out.push('-');
        } else if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' {
            out.push(ch);
        }
    }
    out.trim_matches('-').to_string()
}

/// Location of a persisted record plus its optimistic-concurrency token.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordRef {
    pub href: String,
    pub etag: Option<String>,
}

impl RecordRef {
    #[must_use]
    pub fn new(href: impl Into<String>) -> Self {
        Self { href: href.into(), etag: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Photo {
    /// Raw parameter text as it appears on the wire, e.g. `ENCODING=b;TYPE=JPEG`.
    pub params: String,
    /// Base64 payload or URI.
    pub value: String,
}

impl Photo {
    #[must_use]
    pub fn jpeg_base64(value: String) -> Self {
        Self { params: "ENCODING=b;TYPE=JPEG".to_string(), value }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RemoteRecord {
    /// Set only once the record has been persisted.
    pub reference: Option<RecordRef>,
    pub display_name: String,
    pub sort_name: String,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    pub note: Option<String>,
    pub photo: Option<Photo>,
    pub uid: String,
    pub revision: Option<String>,
    /// Properties the model does not interpret, kept verbatim for round-trips.
    #[serde(default)]
    pub preserved: Vec<String>,
}

impl RemoteRecord {
    #[must_use]
    pub fn has_photo(&self) -> bool {
        self.photo.is_some()
    }

    #[must_use]
    pub fn name_key(&self) -> NameKey {
        NameKey::of(&self.display_name)
    }

    #[must_use]
    pub fn href(&self) -> &str {
        self.reference.as_ref().map_or("", |reference| reference.href.as_str())
    }

    /// Build an unpersisted record from a desired entry. Photo policy is applied
    /// separately by the caller.
    #[must_use]
    pub fn from_desired(desired: &DesiredEntry) -> Self {
        let mut record = Self {
            display_name: desired.name.clone(),
            sort_name: desired.name.clone(),
            emails: desired.normalized_emails(),
            phones: order_and_dedupe(&desired.phones),
            note: desired.note.clone().filter(|note| !note.is_empty()),
            ..Self::default()
        };
        ensure_uid(&mut record);
        record
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DesiredEntry {
    pub name: String,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    pub note: Option<String>,
}

impl DesiredEntry {
    #[must_use]
    pub fn key(&self) -> NameKey {
        NameKey::of(&self.name)
    }

    #[must_use]
    pub fn normalized_emails(&self) -> Vec<String> {
        normalize_emails(&self.emails)
    }

    /// # Errors
    /// Returns [`SyncError::Validation`] when the name is blank.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Validation("desired entry name MUST be non-empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BucketEntry {
    pub bucket: String,
    pub name: String,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub path: PathBuf,
}

/// Lowercased, blank-free and de-duplicated in first-seen order.
#[must_use]
pub fn normalize_emails<S: AsRef<str>>(emails: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(emails.len());
    for email in emails {
        let email = email.as_ref().trim().to_lowercase();
        if email.is_empty() || out.contains(&email) {
            continue;
        }
        out.push(email);
    }
    out
}

/// Assign a fresh identity when the record has none. Never replaces an existing uid.
pub fn ensure_uid(record: &mut RemoteRecord) -> bool {
    if !record.uid.trim().is_empty() {
        return false;
    }
    record.uid = fresh_uid();
    true
}

#[must_use]
pub fn fresh_uid() -> String {
    format!("uid-{}", Ulid::new().to_string().to_lowercase())
}

#[must_use]
pub fn revision_stamp(now: OffsetDateTime) -> String {
    let now = now.to_offset(time::UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

pub fn stamp_revision(record: &mut RemoteRecord, now: OffsetDateTime) {
    record.revision = Some(revision_stamp(now));
}

/// Remote collection of contacts. Mutating calls take `&mut self`; the
/// reconciliation pass is the only writer.
pub trait ContactStore {
    /// # Errors
    /// Returns [`SyncError::Transport`] when the listing cannot be obtained.
    fn list(&self) -> Result<Vec<RecordRef>, SyncError>;

    /// # Errors
    /// Returns [`SyncError::Transport`] or [`SyncError::Decode`].
    fn get(&self, reference: &RecordRef) -> Result<RemoteRecord, SyncError>;

    /// Store `record` at `reference`, sending `reference.etag` as the expected
    /// token when present. Returns the new token if the store reports one.
    ///
    /// # Errors
    /// Returns [`SyncError::Conflict`] on a token mismatch, otherwise
    /// [`SyncError::Transport`].
    fn put(&mut self, reference: &RecordRef, record: &RemoteRecord)
        -> Result<Option<String>, SyncError>;

    /// # Errors
    /// Returns [`SyncError::Transport`].
    fn delete(&mut self, reference: &RecordRef) -> Result<(), SyncError>;

    /// Reserve a location for a record that has never been persisted.
    fn allocate(&self) -> RecordRef;
}

/// Local archive of removed or relocated contacts.
pub trait BucketStore {
    /// # Errors
    /// Returns [`SyncError::Archive`] when the archive file cannot be written.
    fn archive(&mut self, bucket: &str, record: &RemoteRecord) -> Result<PathBuf, SyncError>;
}

/// Store `record` at `reference` and return the reference to use for the next
/// write. A store that reports no new token is asked for the current one; when
/// that fails the previous token is kept, so a later write is rejected instead
/// of being sent without a precondition.
///
/// # Errors
/// Returns the `put` error.
pub fn put_tracked<S: ContactStore + ?Sized>(
    store: &mut S,
    reference: &RecordRef,
    record: &RemoteRecord,
) -> Result<RecordRef, SyncError> {
    let mut next = reference.clone();
    if let Some(etag) = store.put(reference, record)? {
        next.etag = Some(etag);
        return Ok(next);
    }
    match store.get(reference) {
        Ok(fresh) => match fresh.reference.and_then(|stored| stored.etag) {
            Some(etag) => next.etag = Some(etag),
            None => tracing::debug!("{} reports no token after put", reference.href),
        },
        Err(err) => tracing::warn!("re-read token for {}: {}", reference.href, err),
    }
    Ok(next)
}

/// Fetch every listed record; per-record failures are returned alongside the
/// successes instead of aborting.
///
/// # Errors
/// Returns the listing error; individual `get` failures are collected.
pub fn fetch_all<S: ContactStore + ?Sized>(
    store: &S,
) -> Result<(Vec<RemoteRecord>, Vec<(RecordRef, SyncError)>), SyncError> {
    let references = store.list()?;
    let mut records = Vec::with_capacity(references.len());
    let mut failures = Vec::new();
    for reference in references {
        match store.get(&reference) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::warn!("get {}: {}", reference.href, err);
                failures.push((reference, err));
            }
        }
    }
    Ok((records, failures))
}

/// Find a record by name key; falls back to ignoring stray BOM and zero-width
/// characters around the stored display name.
#[must_use]
pub fn find_by_name<'a>(records: &'a [RemoteRecord], name: &str) -> Option<&'a RemoteRecord> {
    let key = NameKey::of(name);
    records.iter().find(|record| record.name_key() == key).or_else(|| {
        records.iter().find(|record| {
            NameKey::of(record.display_name.trim().trim_matches(['\u{feff}', '\u{200b}'])) == key
        })
    })
}
