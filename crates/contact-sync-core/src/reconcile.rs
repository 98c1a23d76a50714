use serde::{Deserialize, Serialize};

use crate::photo::PhotoPolicy;
use crate::{ensure_uid, order_and_dedupe, DesiredEntry, RemoteRecord, SyncError};

/// Outcome of matching one record against its desired entry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct RecordChange {
    pub changed: bool,
    /// Fields that differed, in rule order.
    pub fields: Vec<String>,
    /// Avatar lookup failure; the rest of the change still stands.
    pub photo_error: Option<SyncError>,
}

impl RecordChange {
    fn mark(&mut self, field: &str) {
        self.changed = true;
        self.fields.push(field.to_string());
    }
}

/// Mutate `record` in place so it matches `desired`. The desired table is
/// authoritative for names, emails and phones; a blank desired note never
/// clears an existing one.
pub fn reconcile(
    record: &mut RemoteRecord,
    desired: &DesiredEntry,
    photos: &PhotoPolicy<'_>,
) -> RecordChange {
    let mut change = RecordChange::default();
    ensure_uid(record);

    if record.display_name != desired.name || record.sort_name.trim() != desired.name {
        record.display_name.clone_from(&desired.name);
        record.sort_name.clone_from(&desired.name);
        change.mark("name");
    }

    let emails = desired.normalized_emails();
    if record.emails != emails {
        record.emails = emails;
        change.mark("emails");
    }

    let phones = order_and_dedupe(&desired.phones);
    if record.phones != phones {
        record.phones = phones;
        change.mark("phones");
    }

    if let Some(note) = desired.note.as_deref().filter(|note| !note.is_empty()) {
        if record.note.as_deref() != Some(note) {
            record.note = Some(note.to_string());
            change.mark("note");
        }
    }

    let emails = record.emails.clone();
    match photos.assign(record, &desired.name, &emails) {
        Ok(true) => change.mark("photo"),
        Ok(false) => {}
        Err(err) => change.photo_error = Some(err),
    }

    change
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::photo::{PhotoLoader, PhotoMap};
    use crate::Photo;

    struct NoFiles;

    impl PhotoLoader for NoFiles {
        fn load(&self, _path: &Path) -> Option<Vec<u8>> {
            None
        }
    }

    struct OneFile;

    impl PhotoLoader for OneFile {
        fn load(&self, _path: &Path) -> Option<Vec<u8>> {
            Some(b"img".to_vec())
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

    fn stored() -> RemoteRecord {
        RemoteRecord {
            display_name: "Jane Doe".to_string(),
            sort_name: "Jane Doe".to_string(),
            emails: vec!["jane@example.com".to_string()],
            phones: vec!["+1 480 395 7551".to_string(), "+91 98765 43210".to_string()],
            note: Some("met at conf".to_string()),
            uid: "uid-fixed".to_string(),
            ..RemoteRecord::default()
        }
    }

    #[test]
    fn unchanged_record_reports_no_change() {
        let map = PhotoMap::default();
        let policy = PhotoPolicy::new(&map, &NoFiles);
        let mut record = stored();
        let change = reconcile(
            &mut record,
            &desired(
                "Jane Doe",
                &["JANE@example.com"],
                &["9876543210", "+14803957551"],
                "met at conf",
            ),
            &policy,
        );
        assert!(!change.changed, "unexpected change: {:?}", change.fields);
        assert_eq!(record, stored());
    }

    #[test]
    fn blank_desired_note_keeps_existing_note() {
        let map = PhotoMap::default();
        let policy = PhotoPolicy::new(&map, &NoFiles);
        let mut record = stored();
        let change = reconcile(
            &mut record,
            &desired("Jane Doe", &["jane@example.com"], &["+14803957551", "9876543210"], ""),
            &policy,
        );
        assert!(!change.changed);
        assert_eq!(record.note.as_deref(), Some("met at conf"));
    }

    #[test]
    fn name_and_sort_name_are_forced_together() {
        let map = PhotoMap::default();
        let policy = PhotoPolicy::new(&map, &NoFiles);
        let mut record = stored();
        record.sort_name = "Doe;Jane;;;".to_string();
        let change = reconcile(
            &mut record,
            &desired("Jane Doe", &["jane@example.com"], &["+14803957551", "9876543210"], ""),
            &policy,
        );
        assert_eq!(change.fields, vec!["name".to_string()]);
        assert_eq!(record.sort_name, "Jane Doe");
    }

    #[test]
    fn emails_and_phones_are_replaced_not_merged() {
        let map = PhotoMap::default();
        let policy = PhotoPolicy::new(&map, &NoFiles);
        let mut record = stored();
        let change = reconcile(
            &mut record,
            &desired("Jane Doe", &["new@example.com"], &["9123456789"], "met at conf"),
            &policy,
        );
        assert_eq!(change.fields, vec!["emails".to_string(), "phones".to_string()]);
        assert_eq!(record.emails, vec!["new@example.com".to_string()]);
        assert_eq!(record.phones, vec!["+91 91234 56789".to_string()]);
    }

    #[test]
    fn note_and_photo_contribute_to_change() {
        let map = PhotoMap::from_pairs([("jane doe", "jane.jpg")]);
        let policy = PhotoPolicy::new(&map, &OneFile);
        let mut record = stored();
        let change = reconcile(
            &mut record,
            &desired(
                "Jane Doe",
                &["jane@example.com"],
                &["+14803957551", "9876543210"],
                "new note",
            ),
            &policy,
        );
        assert_eq!(change.fields, vec!["note".to_string(), "photo".to_string()]);
        assert_eq!(record.photo, Some(Photo::jpeg_base64("aW1n".to_string())));
    }

    #[test]
    fn identity_is_assigned_once_and_kept() {
        let map = PhotoMap::default();
        let policy = PhotoPolicy::new(&map, &NoFiles);
        let mut record = stored();
        record.uid = String::new();
        let entry = desired("Jane Doe", &[], &[], "");
        reconcile(&mut record, &entry, &policy);
        let assigned = record.uid.clone();
        assert!(!assigned.is_empty());
        reconcile(&mut record, &entry, &policy);
        assert_eq!(record.uid, assigned);
    }
}
