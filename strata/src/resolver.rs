//! Ordering the available migrations and working out which are pending.

use crate::core::{AppliedMigrationRecord, MigrationDescriptor};
use crate::error::ValidationError;
use std::collections::HashMap;

/// Sort `available` into apply order, rejecting duplicates.
pub(crate) fn resolve(
    mut available: Vec<MigrationDescriptor>,
) -> Result<Vec<MigrationDescriptor>, ValidationError> {
    available.sort_by(|a, b| a.apply_order(b));

    for pair in available.windows(2) {
        let (first, second) = (&pair[0], &pair[1]);
        match (first.version(), second.version()) {
            (Some(a), Some(b)) if a == b => {
                return Err(ValidationError::DuplicateVersion {
                    version: a.clone(),
                    first: first.description().to_string(),
                    second: second.description().to_string(),
                });
            }
            (None, None) if first.description() == second.description() => {
                return Err(ValidationError::DuplicateRepeatable {
                    description: first.description().to_string(),
                });
            }
            _ => {}
        }
    }

    Ok(available)
}

/// The resolved migrations that still need to run, in apply order.
///
/// A versioned migration is pending until it has a successful record. A
/// repeatable is pending when it has never succeeded or when the checksum of
/// its latest successful run differs from the resolved one.
pub(crate) fn pending<'a>(
    resolved: &'a [MigrationDescriptor],
    applied: &[AppliedMigrationRecord],
) -> Vec<&'a MigrationDescriptor> {
    let mut latest_repeatable: HashMap<&str, &AppliedMigrationRecord> = HashMap::new();
    for record in applied.iter().filter(|r| r.success && r.is_repeatable()) {
        let entry = latest_repeatable
            .entry(record.description.as_str())
            .or_insert(record);
        if record.installed_rank > entry.installed_rank {
            *entry = record;
        }
    }

    resolved
        .iter()
        .filter(|migration| match migration.version() {
            Some(version) => !applied
                .iter()
                .any(|r| r.success && r.version.as_ref() == Some(version)),
            None => match latest_repeatable.get(migration.description()) {
                Some(record) => record.checksum.as_deref() != Some(migration.checksum()),
                None => true,
            },
        })
        .collect()
}
