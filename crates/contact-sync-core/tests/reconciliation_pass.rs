use std::path::{Path, PathBuf};

use contact_sync_core::{
    slug, ActionKind, BucketStore, ContactStore, DesiredEntry, ExecutionMode, MemoryContactStore,
    PhotoLoader, PhotoMap, PhotoPolicy, RecordRef, Reconciler, RemoteRecord, SyncError,
    SyncOptions, SyncReport,
};

#[derive(Default)]
struct RecordingBuckets {
    archived: Vec<(String, String)>,
    fail: bool,
}

impl BucketStore for RecordingBuckets {
    fn archive(&mut self, bucket: &str, record: &RemoteRecord) -> Result<PathBuf, SyncError> {
        if self.fail {
            return Err(SyncError::Archive("disk full".to_string()));
        }
        self.archived.push((bucket.to_string(), record.display_name.clone()));
        Ok(PathBuf::from(bucket).join(format!("{}.vcf", slug(&record.display_name))))
    }
}

struct NoPhotos;

impl PhotoLoader for NoPhotos {
    fn load(&self, _path: &Path) -> Option<Vec<u8>> {
        None
    }
}

fn desired(name: &str, emails: &[&str], phones: &[&str], note: &str) -> DesiredEntry {
    DesiredEntry {
        name: name.to_string(),
        emails: emails.iter().map(ToString::to_string).collect(),
        phones: phones.iter().map(ToString::to_string).collect(),
        note: Some(note.to_string()),
    }
}

fn remote(name: &str, emails: &[&str], phones: &[&str]) -> RemoteRecord {
    RemoteRecord {
        display_name: name.to_string(),
        sort_name: name.to_string(),
        emails: emails.iter().map(ToString::to_string).collect(),
        phones: phones.iter().map(ToString::to_string).collect(),
        uid: format!("uid-{}", name.to_lowercase().replace(' ', "-")),
        ..RemoteRecord::default()
    }
}

fn run(
    store: &mut MemoryContactStore,
    buckets: &mut RecordingBuckets,
    mode: ExecutionMode,
    touch: bool,
    rows: &[DesiredEntry],
) -> SyncReport {
    let map = PhotoMap::default();
    let policy = PhotoPolicy::new(&map, &NoPhotos);
    let options = SyncOptions { mode, touch, ..SyncOptions::default() };
    match Reconciler::new(store, buckets, policy, options).run(rows) {
        Ok(report) => report,
        Err(err) => panic!("reconciliation pass should succeed: {err}"),
    }
}

#[test]
fn apply_creates_missing_contact_on_empty_store() {
    let mut store = MemoryContactStore::new("/contacts/");
    let mut buckets = RecordingBuckets::default();
    let rows = vec![desired("Alice", &["a@x.com"], &["+14155551212"], "")];

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &rows);

    assert_eq!(store.put_calls(), 1);
    assert_eq!(report.committed(ActionKind::Create), 1);
    assert_eq!(report.verified.len(), 1);
    let created = &report.verified[0];
    assert_eq!(created.display_name, "Alice");
    assert_eq!(created.emails, vec!["a@x.com".to_string()]);
    assert_eq!(created.phones, vec!["+1 415 555 1212".to_string()]);
    assert!(created.uid.starts_with("uid-"));
    assert!(created.revision.is_some());
    assert!(report.failures.is_empty());
}

#[test]
fn ten_digit_number_without_country_code_uses_default_country() {
    let mut store = MemoryContactStore::new("/contacts/");
    let mut buckets = RecordingBuckets::default();
    let rows = vec![desired("Alice", &["a@x.com"], &["4155551212"], "")];

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &rows);
    assert_eq!(report.verified[0].phones, vec!["+91 41555 51212".to_string()]);
}

#[test]
fn extra_contact_is_archived_and_deleted_in_apply_mode() {
    let mut store = MemoryContactStore::new("/contacts/");
    store.insert(remote("Bob", &["bob@x.com"], &[]));
    let mut buckets = RecordingBuckets::default();

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &[]);

    assert_eq!(buckets.archived, vec![("neutral".to_string(), "Bob".to_string())]);
    assert_eq!(store.delete_calls(), 1);
    assert_eq!(store.put_calls(), 0);
    assert!(store.is_empty());
    assert_eq!(report.committed(ActionKind::RemoveExtra), 1);
    assert!(report.verified.is_empty());
}

#[test]
fn extra_contact_in_preview_has_no_side_effects() {
    let mut store = MemoryContactStore::new("/contacts/");
    store.insert(remote("Bob", &["bob@x.com"], &[]));
    let mut buckets = RecordingBuckets::default();

    let report = run(&mut store, &mut buckets, ExecutionMode::Preview, false, &[]);

    assert!(buckets.archived.is_empty());
    assert_eq!(store.delete_calls(), 0);
    assert_eq!(store.put_calls(), 0);
    assert_eq!(report.count(ActionKind::RemoveExtra), 1);
    assert_eq!(report.committed(ActionKind::RemoveExtra), 0);
    assert_eq!(report.verified.len(), 1);
}

#[test]
fn failed_archive_keeps_remote_record() {
    let mut store = MemoryContactStore::new("/contacts/");
    store.insert(remote("Bob", &[], &[]));
    let mut buckets = RecordingBuckets { fail: true, ..RecordingBuckets::default() };

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &[]);

    assert_eq!(store.delete_calls(), 0);
    assert_eq!(store.len(), 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, ActionKind::ArchiveExtra);
}

#[test]
fn unchanged_contact_is_not_written() {
    let mut store = MemoryContactStore::new("/contacts/");
    let mut existing = remote("Jane Doe", &["jane@x.com"], &["+1 480 395 7551"]);
    existing.note = Some("friend".to_string());
    store.insert(existing);
    let mut buckets = RecordingBuckets::default();
    let rows = vec![desired("Jane Doe", &["Jane@X.com"], &["+14803957551"], "")];

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &rows);

    assert_eq!(report.count(ActionKind::Update), 0);
    assert_eq!(report.count(ActionKind::Create), 0);
    assert_eq!(store.put_calls(), 0);
    assert_eq!(report.verified[0].note.as_deref(), Some("friend"));
}

#[test]
fn name_differing_only_in_case_is_forced_to_desired_spelling() {
    let mut store = MemoryContactStore::new("/contacts/");
    store.insert(remote("jane doe", &[], &[]));
    let mut buckets = RecordingBuckets::default();
    let rows = vec![desired("Jane Doe", &[], &[], "")];

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &rows);

    assert_eq!(report.count(ActionKind::Create), 0);
    assert_eq!(report.committed(ActionKind::Update), 1);
    let stored = store.find("jane doe").map(|record| record.display_name);
    assert_eq!(stored, Some("Jane Doe".to_string()));
}

#[test]
fn duplicates_are_removed_only_in_apply_mode() {
    let mut store = MemoryContactStore::new("/contacts/");
    let mut first = remote("Jane Doe", &["jane@x.com"], &[]);
    first.reference = Some(RecordRef::new("/contacts/a.vcf"));
    let mut second = remote("jane doe ", &["jane@x.com"], &[]);
    second.reference = Some(RecordRef::new("/contacts/b.vcf"));
    store.insert(first);
    store.insert(second);
    let rows = vec![desired("Jane Doe", &["jane@x.com"], &[], "")];
    let mut buckets = RecordingBuckets::default();

    let preview = run(&mut store, &mut buckets, ExecutionMode::Preview, false, &rows);
    assert_eq!(store.delete_calls(), 0);
    assert_eq!(preview.count(ActionKind::RemoveDuplicate), 1);
    assert_eq!(preview.survivors, 1);

    let applied = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &rows);
    assert_eq!(store.delete_calls(), 1);
    assert_eq!(applied.committed(ActionKind::RemoveDuplicate), 1);
    let removed = applied.actions_of(ActionKind::RemoveDuplicate).next();
    assert_eq!(
        removed.and_then(|action| action.reference.as_deref()),
        Some("/contacts/b.vcf")
    );
    assert_eq!(store.len(), 1);
    assert!(buckets.archived.is_empty());
}

#[test]
fn preview_plans_exactly_what_apply_commits() {
    let seed = |store: &mut MemoryContactStore| {
        store.insert(remote("Bob", &[], &[]));
        store.insert(remote("Carol", &["old@x.com"], &[]));
    };
    let rows = vec![
        desired("Carol", &["carol@x.com"], &["9876543210"], "neighbour"),
        desired("Dan", &[], &["+442079460958"], ""),
    ];

    let mut preview_store = MemoryContactStore::new("/contacts/");
    seed(&mut preview_store);
    let mut apply_store = MemoryContactStore::new("/contacts/");
    seed(&mut apply_store);
    let mut buckets = RecordingBuckets::default();

    let preview = run(&mut preview_store, &mut buckets, ExecutionMode::Preview, false, &rows);
    let applied = run(&mut apply_store, &mut buckets, ExecutionMode::Apply, false, &rows);

    let plan = |report: &SyncReport| {
        report
            .actions
            .iter()
            .map(|action| (action.kind, action.name.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(plan(&preview), plan(&applied));
    assert!(preview.actions.iter().all(|action| !action.committed));
    assert!(applied.actions.iter().all(|action| action.committed));
    assert_eq!(preview_store.put_calls() + preview_store.delete_calls(), 0);
}

#[test]
fn extras_are_removed_before_desired_entries_are_applied() {
    let mut store = MemoryContactStore::new("/contacts/");
    store.insert(remote("Old Name", &[], &[]));
    let rows = vec![desired("New Name", &[], &[], "")];
    let mut buckets = RecordingBuckets::default();

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &rows);
    let order: Vec<ActionKind> = report.actions.iter().map(|action| action.kind).collect();
    assert_eq!(order, vec![ActionKind::ArchiveExtra, ActionKind::RemoveExtra, ActionKind::Create]);
}

#[test]
fn touch_bumps_every_survivor_and_later_update_does_not_conflict() {
    let mut store = MemoryContactStore::new("/contacts/");
    store.insert(remote("Carol", &["old@x.com"], &[]));
    store.insert(remote("Dan", &[], &[]));
    let rows = vec![desired("Carol", &["carol@x.com"], &[], ""), desired("Dan", &[], &[], "")];
    let mut buckets = RecordingBuckets::default();

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, true, &rows);

    assert_eq!(report.committed(ActionKind::Touch), 2);
    assert_eq!(report.committed(ActionKind::Update), 1);
    assert!(report.failures.is_empty(), "unexpected failures: {:?}", report.failures);
    assert_eq!(store.put_calls(), 3);
}

/// Accepts writes but never reports the new token, like servers that omit
/// `ETag` on PUT. Records the token each write was conditioned on.
struct TokenlessStore {
    inner: MemoryContactStore,
    sent: Vec<Option<String>>,
}

impl ContactStore for TokenlessStore {
    fn list(&self) -> Result<Vec<RecordRef>, SyncError> {
        self.inner.list()
    }

    fn get(&self, reference: &RecordRef) -> Result<RemoteRecord, SyncError> {
        self.inner.get(reference)
    }

    fn put(
        &mut self,
        reference: &RecordRef,
        record: &RemoteRecord,
    ) -> Result<Option<String>, SyncError> {
        self.sent.push(reference.etag.clone());
        self.inner.put(reference, record).map(|_| None)
    }

    fn delete(&mut self, reference: &RecordRef) -> Result<(), SyncError> {
        self.inner.delete(reference)
    }

    fn allocate(&self) -> RecordRef {
        self.inner.allocate()
    }
}

#[test]
fn update_after_touch_stays_conditional_when_put_reports_no_token() {
    let mut inner = MemoryContactStore::new("/contacts/");
    inner.insert(remote("Carol", &["old@x.com"], &[]));
    let mut store = TokenlessStore { inner, sent: Vec::new() };
    let mut buckets = RecordingBuckets::default();
    let rows = vec![desired("Carol", &["carol@x.com"], &[], "")];

    let map = PhotoMap::default();
    let policy = PhotoPolicy::new(&map, &NoPhotos);
    let options = SyncOptions { mode: ExecutionMode::Apply, touch: true, ..SyncOptions::default() };
    let report = match Reconciler::new(&mut store, &mut buckets, policy, options).run(&rows) {
        Ok(report) => report,
        Err(err) => panic!("reconciliation pass should succeed: {err}"),
    };

    assert!(report.failures.is_empty(), "unexpected failures: {:?}", report.failures);
    assert_eq!(report.committed(ActionKind::Update), 1);
    assert_eq!(store.sent, vec![Some("etag-1".to_string()), Some("etag-2".to_string())]);
}

#[test]
fn per_record_failures_do_not_abort_the_pass() {
    let mut store = MemoryContactStore::new("/contacts/");
    let broken = store.insert(remote("Broken", &[], &[]));
    let carol = store.insert(remote("Carol", &["old@x.com"], &[]));
    store.fail_get(&broken.href);
    store.conflict_on(&carol.href);
    let rows = vec![
        desired("Broken", &[], &[], ""),
        desired("Carol", &["carol@x.com"], &[], ""),
        desired("Erin", &[], &[], ""),
    ];
    let mut buckets = RecordingBuckets::default();

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &rows);

    assert_eq!(report.fetched, 1);
    let kinds: Vec<ActionKind> = report.failures.iter().map(|failure| failure.kind).collect();
    assert!(kinds.contains(&ActionKind::Fetch));
    assert!(kinds.contains(&ActionKind::Update));
    assert!(report
        .failures
        .iter()
        .any(|failure| matches!(failure.error, SyncError::Conflict { .. })));
    assert_eq!(report.committed(ActionKind::Create), 2);
}

#[test]
fn duplicate_desired_rows_are_skipped() {
    let mut store = MemoryContactStore::new("/contacts/");
    let rows = vec![desired("Alice", &[], &[], ""), desired("ALICE", &["a@x.com"], &[], "")];
    let mut buckets = RecordingBuckets::default();

    let report = run(&mut store, &mut buckets, ExecutionMode::Apply, false, &rows);
    assert_eq!(report.committed(ActionKind::Create), 1);
    assert_eq!(report.count(ActionKind::SkipDesired), 1);
    assert_eq!(store.len(), 1);
}
