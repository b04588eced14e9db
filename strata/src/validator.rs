//! Checking the resolved migrations against the metadata table.

use crate::core::{AppliedMigrationRecord, MigrationDescriptor};
use crate::error::ValidationError;
use crate::resolver;
use crate::version::MigrationVersion;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ValidationPolicy {
    pub(crate) allow_out_of_order: bool,
    pub(crate) ignore_missing_migrations: bool,
    /// Skip `success = false` rows. Without the lock held such a row may be
    /// the placeholder of a migration another process is still running.
    pub(crate) skip_failed: bool,
}

/// Every disagreement between `resolved` and `applied`, in rank order.
pub(crate) fn validate(
    resolved: &[MigrationDescriptor],
    applied: &[AppliedMigrationRecord],
    policy: ValidationPolicy,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut missing_repeatables = HashSet::new();

    for record in applied.iter().filter(|r| !r.is_schema_marker()) {
        if !record.success {
            if policy.skip_failed {
                continue;
            }
            errors.push(ValidationError::FailedMigration {
                version: record.version.clone(),
                description: record.description.clone(),
                installed_rank: record.installed_rank,
            });
            continue;
        }

        match &record.version {
            Some(version) => match resolved.iter().find(|m| m.version() == Some(version)) {
                Some(migration) => {
                    if let Some(recorded) = &record.checksum {
                        if recorded != migration.checksum() {
                            errors.push(ValidationError::ChecksumMismatch {
                                version: version.clone(),
                                description: migration.description().to_string(),
                                recorded: recorded.clone(),
                                resolved: migration.checksum().to_string(),
                            });
                        }
                    }
                }
                None if !policy.ignore_missing_migrations => {
                    errors.push(ValidationError::MissingMigration {
                        version: Some(version.clone()),
                        description: record.description.clone(),
                        installed_rank: record.installed_rank,
                    });
                }
                None => {}
            },
            None => {
                let resolvable = resolved
                    .iter()
                    .any(|m| m.is_repeatable() && m.description() == record.description);
                if !resolvable
                    && !policy.ignore_missing_migrations
                    && missing_repeatables.insert(record.description.as_str())
                {
                    errors.push(ValidationError::MissingMigration {
                        version: None,
                        description: record.description.clone(),
                        installed_rank: record.installed_rank,
                    });
                }
            }
        }
    }

    if !policy.allow_out_of_order {
        errors.extend(out_of_order(resolved, applied).into_iter().filter_map(
            |(migration, highest_applied)| {
                Some(ValidationError::OutOfOrder {
                    version: migration.version()?.clone(),
                    description: migration.description().to_string(),
                    highest_applied,
                })
            },
        ));
    }

    errors
}

/// Pending versioned migrations that sort below the highest successfully
/// applied version, paired with that version.
pub(crate) fn out_of_order<'a>(
    resolved: &'a [MigrationDescriptor],
    applied: &[AppliedMigrationRecord],
) -> Vec<(&'a MigrationDescriptor, MigrationVersion)> {
    let Some(highest) = highest_applied(applied) else {
        return vec![];
    };
    resolver::pending(resolved, applied)
        .into_iter()
        .filter(|m| m.version().is_some_and(|v| *v < highest))
        .map(|m| (m, highest.clone()))
        .collect()
}

pub(crate) fn highest_applied(applied: &[AppliedMigrationRecord]) -> Option<MigrationVersion> {
    applied
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.version.clone())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::tests::record;

    fn v(version: &str) -> MigrationDescriptor {
        MigrationDescriptor::sql(version, &format!("v{}", version), format!("-- {}", version))
            .unwrap()
    }

    #[test]
    fn clean_history_is_valid() {
        let resolved = vec![v("1"), v("2"), v("3")];
        let applied = vec![record(1, &resolved[0], true), record(2, &resolved[1], true)];
        assert!(validate(&resolved, &applied, ValidationPolicy::default()).is_empty());
    }

    #[test]
    fn detects_checksum_mismatch() {
        let applied = vec![record(1, &v("1"), true)];
        let edited = vec![MigrationDescriptor::sql("1", "v1", "-- edited").unwrap()];
        let errors = validate(&edited, &applied, ValidationPolicy::default());
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            ValidationError::ChecksumMismatch {
                version,
                recorded,
                resolved,
                ..
            } => {
                assert_eq!(version.to_string(), "1");
                assert_eq!(recorded, v("1").checksum());
                assert_eq!(resolved, edited[0].checksum());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn repeatable_checksum_changes_are_not_mismatches() {
        let old = MigrationDescriptor::repeatable("views", "SELECT 1");
        let new = MigrationDescriptor::repeatable("views", "SELECT 2");
        let applied = vec![record(1, &old, true)];
        assert!(validate(&[new], &applied, ValidationPolicy::default()).is_empty());
    }

    #[test]
    fn detects_missing_migrations_unless_ignored() {
        let views = MigrationDescriptor::repeatable("views", "SELECT 1");
        let applied = vec![
            record(1, &v("1"), true),
            record(2, &v("2"), true),
            record(3, &views, true),
            record(4, &views, true),
        ];
        let errors = validate(&[v("1")], &applied, ValidationPolicy::default());
        assert_eq!(
            errors,
            vec![
                ValidationError::MissingMigration {
                    version: Some("2".parse().unwrap()),
                    description: "v2".to_string(),
                    installed_rank: 2,
                },
                ValidationError::MissingMigration {
                    version: None,
                    description: "views".to_string(),
                    installed_rank: 3,
                },
            ]
        );

        let policy = ValidationPolicy {
            ignore_missing_migrations: true,
            ..Default::default()
        };
        assert!(validate(&[v("1")], &applied, policy).is_empty());
    }

    #[test]
    fn failed_rows_are_always_reported() {
        let resolved = vec![v("1"), v("2")];
        let applied = vec![record(1, &resolved[0], true), record(2, &resolved[1], false)];
        let policy = ValidationPolicy {
            allow_out_of_order: true,
            ignore_missing_migrations: true,
            ..Default::default()
        };
        assert_eq!(
            validate(&resolved, &applied, policy),
            vec![ValidationError::FailedMigration {
                version: Some("2".parse().unwrap()),
                description: "v2".to_string(),
                installed_rank: 2,
            }]
        );
    }

    #[test]
    fn failed_rows_can_be_skipped() {
        let resolved = vec![v("1"), v("2"), v("3")];
        let applied = vec![record(1, &resolved[0], true), record(2, &resolved[1], false)];
        let policy = ValidationPolicy {
            skip_failed: true,
            ..Default::default()
        };
        assert!(validate(&resolved, &applied, policy).is_empty());
    }

    #[test]
    fn out_of_order_unless_allowed() {
        let resolved = vec![v("1"), v("1.5"), v("2"), v("3"), v("4")];
        let applied = vec![
            record(1, &resolved[0], true),
            record(2, &resolved[2], true),
            record(3, &resolved[3], true),
        ];

        let errors = validate(&resolved, &applied, ValidationPolicy::default());
        assert_eq!(
            errors,
            vec![ValidationError::OutOfOrder {
                version: "1.5".parse().unwrap(),
                description: "v1.5".to_string(),
                highest_applied: "3".parse().unwrap(),
            }]
        );

        let policy = ValidationPolicy {
            allow_out_of_order: true,
            ..Default::default()
        };
        assert!(validate(&resolved, &applied, policy).is_empty());
        let flagged = out_of_order(&resolved, &applied);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].0.description(), "v1.5");
    }
}
