//! In-process contact store.
//!
//! Behaves like a strict remote collection: tokens change on every write, a
//! stale `If-Match` token is a conflict, and deleting an unknown reference is a
//! transport failure. Call counters make side effects observable.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};

use ulid::Ulid;

use crate::{ContactStore, RecordRef, RemoteRecord, SyncError};

#[derive(Debug, Default)]
pub struct MemoryContactStore {
    collection: String,
    records: BTreeMap<String, (String, RemoteRecord)>,
    revision: u64,
    put_calls: usize,
    delete_calls: usize,
    get_calls: Cell<usize>,
    failing_gets: BTreeSet<String>,
    conflicting_puts: BTreeSet<String>,
}

impl MemoryContactStore {
    #[must_use]
    pub fn new(collection: &str) -> Self {
        Self { collection: collection.to_string(), ..Self::default() }
    }

    /// Seed a record as if it had been persisted. A missing reference is
    /// allocated; the stored token is returned.
    pub fn insert(&mut self, mut record: RemoteRecord) -> RecordRef {
        let href = match record.reference.as_ref() {
            Some(reference) => reference.href.clone(),
            None => self.allocate().href,
        };
        let etag = self.next_etag();
        let reference = RecordRef { href: href.clone(), etag: Some(etag.clone()) };
        record.reference = Some(reference.clone());
        self.records.insert(href, (etag, record));
        reference
    }

    /// Make `get` fail with a decode error for `href`.
    pub fn fail_get(&mut self, href: &str) {
        self.failing_gets.insert(href.to_string());
    }

    /// Make the next writes to `href` fail as if another client changed it.
    pub fn conflict_on(&mut self, href: &str) {
        self.conflicting_puts.insert(href.to_string());
    }

    #[must_use]
    pub fn put_calls(&self) -> usize {
        self.put_calls
    }

    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls
    }

    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.get_calls.get()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> Vec<RemoteRecord> {
        self.records.values().map(|(_, record)| record.clone()).collect()
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<RemoteRecord> {
        crate::find_by_name(&self.records(), name).cloned()
    }

    fn next_etag(&mut self) -> String {
        self.revision += 1;
        format!("etag-{}", self.revision)
    }
}

impl ContactStore for MemoryContactStore {
    fn list(&self) -> Result<Vec<RecordRef>, SyncError> {
        Ok(self
            .records
            .iter()
            .map(|(href, (etag, _))| RecordRef { href: href.clone(), etag: Some(etag.clone()) })
            .collect())
    }

    fn get(&self, reference: &RecordRef) -> Result<RemoteRecord, SyncError> {
        self.get_calls.set(self.get_calls.get() + 1);
        if self.failing_gets.contains(&reference.href) {
            return Err(SyncError::Decode(format!("{} is not a valid card", reference.href)));
        }
        let Some((etag, record)) = self.records.get(&reference.href) else {
            return Err(SyncError::Transport(format!("get status 404: {}", reference.href)));
        };
        let mut record = record.clone();
        record.reference =
            Some(RecordRef { href: reference.href.clone(), etag: Some(etag.clone()) });
        Ok(record)
    }

    fn put(
        &mut self,
        reference: &RecordRef,
        record: &RemoteRecord,
    ) -> Result<Option<String>, SyncError> {
        self.put_calls += 1;
        if self.conflicting_puts.contains(&reference.href) {
            return Err(SyncError::Conflict {
                reference: reference.href.clone(),
                message: "precondition failed".to_string(),
            });
        }
        if let (Some(expected), Some((current, _))) =
            (reference.etag.as_ref(), self.records.get(&reference.href))
        {
            if expected != current {
                return Err(SyncError::Conflict {
                    reference: reference.href.clone(),
                    message: format!("expected {expected}, found {current}"),
                });
            }
        }

        let etag = self.next_etag();
        let mut stored = record.clone();
        stored.reference =
            Some(RecordRef { href: reference.href.clone(), etag: Some(etag.clone()) });
        self.records.insert(reference.href.clone(), (etag.clone(), stored));
        Ok(Some(etag))
    }

    fn delete(&mut self, reference: &RecordRef) -> Result<(), SyncError> {
        self.delete_calls += 1;
        if self.records.remove(&reference.href).is_none() {
            return Err(SyncError::Transport(format!("delete status 404: {}", reference.href)));
        }
        Ok(())
    }

    fn allocate(&self) -> RecordRef {
        RecordRef::new(format!("{}{}.vcf", self.collection, Ulid::new().to_string().to_lowercase()))
    }
}
