use std::collections::BTreeSet;

use crate::sync::{ActionKind, OperationFailure, PlannedAction};
use crate::{ContactStore, ExecutionMode, NameKey, RemoteRecord};

/// Survivors and the records scheduled for removal, before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DuplicatePlan {
    pub survivors: Vec<RemoteRecord>,
    pub duplicates: Vec<RemoteRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DuplicateResolution {
    pub survivors: Vec<RemoteRecord>,
    pub actions: Vec<PlannedAction>,
    pub failures: Vec<OperationFailure>,
}

/// Keep exactly one record per name key. Records are ordered by reference href
/// and then uid first, so the survivor does not depend on listing order.
#[must_use]
pub fn plan_duplicates(mut records: Vec<RemoteRecord>) -> DuplicatePlan {
    records.sort_by(|lhs, rhs| {
        lhs.href().cmp(rhs.href()).then_with(|| lhs.uid.cmp(&rhs.uid))
    });

    let mut seen: BTreeSet<NameKey> = BTreeSet::new();
    let mut plan = DuplicatePlan::default();
    for record in records {
        if seen.insert(record.name_key()) {
            plan.survivors.push(record);
        } else {
            plan.duplicates.push(record);
        }
    }
    plan
}

/// Plan duplicates and, in apply mode, delete every non-survivor from the store.
/// A failed delete is collected; the survivor set is unaffected.
pub fn resolve_duplicates<S: ContactStore + ?Sized>(
    store: &mut S,
    records: Vec<RemoteRecord>,
    mode: ExecutionMode,
) -> DuplicateResolution {
    let plan = plan_duplicates(records);
    let mut resolution =
        DuplicateResolution { survivors: plan.survivors, ..DuplicateResolution::default() };

    for duplicate in plan.duplicates {
        let mut action = PlannedAction::new(ActionKind::RemoveDuplicate, &duplicate);
        match (mode, duplicate.reference.as_ref()) {
            (ExecutionMode::Apply, Some(reference)) => match store.delete(reference) {
                Ok(()) => {
                    tracing::info!(
                        "deleted duplicate {} ({})",
                        duplicate.display_name,
                        reference.href
                    );
                    action.committed = true;
                }
                Err(err) => {
                    tracing::warn!("delete duplicate {}: {}", reference.href, err);
                    resolution.failures.push(OperationFailure::new(&action, err));
                }
            },
            _ => tracing::debug!("[dry-run] would delete duplicate {}", duplicate.display_name),
        }
        resolution.actions.push(action);
    }
    resolution
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::memory::MemoryContactStore;
    use crate::RecordRef;

    fn remote(href: &str, name: &str) -> RemoteRecord {
        RemoteRecord {
            reference: Some(RecordRef::new(href)),
            display_name: name.to_string(),
            sort_name: name.to_string(),
            uid: format!("uid-{href}"),
            ..RemoteRecord::default()
        }
    }

    #[test]
    fn collapses_case_and_whitespace_variants() {
        let plan =
            plan_duplicates(vec![remote("/b.vcf", "jane doe "), remote("/a.vcf", "Jane Doe")]);
        assert_eq!(plan.survivors.len(), 1);
        assert_eq!(plan.survivors[0].href(), "/a.vcf");
        assert_eq!(plan.duplicates.len(), 1);
        assert_eq!(plan.duplicates[0].href(), "/b.vcf");
    }

    #[test]
    fn preview_issues_no_deletes() {
        let mut store = MemoryContactStore::new("/contacts/");
        let records = vec![remote("/a.vcf", "Jane Doe"), remote("/b.vcf", "jane doe ")];
        for record in &records {
            store.insert(record.clone());
        }

        let resolution = resolve_duplicates(&mut store, records, ExecutionMode::Preview);
        assert_eq!(resolution.survivors.len(), 1);
        assert_eq!(resolution.actions.len(), 1);
        assert!(!resolution.actions[0].committed);
        assert_eq!(store.delete_calls(), 0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn apply_deletes_non_survivors() {
        let mut store = MemoryContactStore::new("/contacts/");
        let records = vec![
            remote("/c.vcf", "Bob"),
            remote("/a.vcf", "Jane Doe"),
            remote("/b.vcf", "jane doe "),
        ];
        for record in &records {
            store.insert(record.clone());
        }

        let resolution = resolve_duplicates(&mut store, records, ExecutionMode::Apply);
        assert_eq!(resolution.survivors.len(), 2);
        assert_eq!(store.delete_calls(), 1);
        assert!(resolution.actions[0].committed);
        assert_eq!(resolution.actions[0].reference.as_deref(), Some("/b.vcf"));
        assert!(resolution.failures.is_empty());
    }

    #[test]
    fn failed_delete_is_collected() {
        let mut store = MemoryContactStore::new("/contacts/");
        let records = vec![remote("/a.vcf", "Jane Doe"), remote("/b.vcf", "jane doe")];
        store.insert(records[0].clone());

        let resolution = resolve_duplicates(&mut store, records, ExecutionMode::Apply);
        assert_eq!(resolution.survivors.len(), 1);
        assert_eq!(resolution.failures.len(), 1);
        assert!(!resolution.actions[0].committed);
    }

    proptest! {
        #[test]
        fn property_survivors_do_not_depend_on_input_order(rotation in 0_usize..4) {
            let mut records = vec![
                remote("/d.vcf", "JANE DOE"),
                remote("/a.vcf", "Jane Doe"),
                remote("/c.vcf", "Bob"),
                remote("/b.vcf", " bob"),
            ];
            let baseline = plan_duplicates(records.clone());
            records.rotate_left(rotation);
            let rotated = plan_duplicates(records);
            prop_assert_eq!(baseline, rotated);
        }
    }
}
