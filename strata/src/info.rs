//! Per-migration status reporting.

use crate::core::{AppliedMigrationRecord, MigrationDescriptor, MigrationKind};
use crate::resolver;
use crate::validator;
use crate::version::MigrationVersion;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Resolved and waiting to be applied.
    Pending,
    /// Resolved, unapplied, and below the highest applied version while
    /// out-of-order migrations are not allowed.
    Ignored,
    Success,
    /// Recorded with `success = false`.
    Failed,
    /// Applied, but no longer resolvable.
    Missing,
    /// An earlier run of a repeatable migration that has since changed.
    Outdated,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Ignored => "Ignored",
            Self::Success => "Success",
            Self::Failed => "Failed",
            Self::Missing => "Missing",
            Self::Outdated => "Outdated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationInfo {
    pub version: Option<MigrationVersion>,
    pub description: String,
    pub kind: MigrationKind,
    pub checksum: Option<String>,
    pub state: MigrationState,
    pub installed_rank: Option<i64>,
    pub installed_on: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
}

impl MigrationInfo {
    fn applied(record: &AppliedMigrationRecord, state: MigrationState) -> Self {
        Self {
            version: record.version.clone(),
            description: record.description.clone(),
            kind: record.kind,
            checksum: record.checksum.clone(),
            state,
            installed_rank: Some(record.installed_rank),
            installed_on: Some(record.installed_on),
            execution_time_ms: Some(record.execution_time_ms),
        }
    }

    fn unapplied(migration: &MigrationDescriptor, state: MigrationState) -> Self {
        Self {
            version: migration.version().cloned(),
            description: migration.description().to_string(),
            kind: migration.kind(),
            checksum: Some(migration.checksum().to_string()),
            state,
            installed_rank: None,
            installed_on: None,
            execution_time_ms: None,
        }
    }
}

/// Applied records in rank order, followed by the pending migrations in
/// apply order.
pub(crate) fn merge(
    resolved: &[MigrationDescriptor],
    applied: &[AppliedMigrationRecord],
    allow_out_of_order: bool,
) -> Vec<MigrationInfo> {
    let mut latest_repeatable: HashMap<&str, i64> = HashMap::new();
    for record in applied.iter().filter(|r| r.success && r.is_repeatable()) {
        let rank = latest_repeatable
            .entry(record.description.as_str())
            .or_insert(record.installed_rank);
        *rank = (*rank).max(record.installed_rank);
    }

    let mut infos: Vec<MigrationInfo> = applied
        .iter()
        .map(|record| {
            let state = if record.is_schema_marker() {
                MigrationState::Success
            } else if !record.success {
                MigrationState::Failed
            } else if let Some(version) = &record.version {
                if resolved.iter().any(|m| m.version() == Some(version)) {
                    MigrationState::Success
                } else {
                    MigrationState::Missing
                }
            } else {
                match resolved
                    .iter()
                    .find(|m| m.is_repeatable() && m.description() == record.description)
                {
                    None => MigrationState::Missing,
                    Some(migration)
                        if latest_repeatable.get(record.description.as_str())
                            == Some(&record.installed_rank)
                            && record.checksum.as_deref() == Some(migration.checksum()) =>
                    {
                        MigrationState::Success
                    }
                    Some(_) => MigrationState::Outdated,
                }
            };
            MigrationInfo::applied(record, state)
        })
        .collect();

    let highest = validator::highest_applied(applied);
    infos.extend(
        resolver::pending(resolved, applied)
            .into_iter()
            .map(|migration| {
                let below_highest = match (migration.version(), &highest) {
                    (Some(version), Some(highest)) => version < highest,
                    _ => false,
                };
                let state = if below_highest && !allow_out_of_order {
                    MigrationState::Ignored
                } else {
                    MigrationState::Pending
                };
                MigrationInfo::unapplied(migration, state)
            }),
    );
    infos
}
