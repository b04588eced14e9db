use crate::version::MigrationVersion;
use std::time::Duration;

/// Error type for the strata crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The resolved migrations disagree with the metadata table.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Another process held the migration lock for longer than the configured wait.
    #[error(
        "Timed out after {}ms waiting for the migration lock on {table}{}",
        .waited.as_millis(),
        holder_suffix(.holder.as_deref())
    )]
    LockTimeout {
        table: String,
        waited: Duration,
        holder: Option<String>,
    },
    /// The lock could not be taken or was lost while held.
    #[error("Failed to acquire the migration lock on {table}: {reason}")]
    LockAcquisition { table: String, reason: String },
    /// A migration script failed. Its `success = false` record stays in the metadata table.
    #[error("Migration {} failed: {source}", label(.version.as_ref(), .description))]
    MigrationExecution {
        version: Option<MigrationVersion>,
        description: String,
        #[source]
        source: Box<Error>,
    },
    /// Dropping or emptying one schema failed. Sibling schemas are still processed.
    #[error("Unable to clean schema {schema}: {source}")]
    CleanObject {
        schema: String,
        #[source]
        source: Box<Error>,
    },
    #[error("clean() is disabled for this migrator")]
    CleanDisabled,
    #[error("Invalid migration version '{input}': {reason}")]
    InvalidVersion { input: String, reason: String },
    #[error("Unable to load migrations from {location}: {reason}")]
    Source { location: String, reason: String },
    #[error("{feature} is not supported by the {dialect} dialect")]
    Unsupported {
        dialect: &'static str,
        feature: &'static str,
    },
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Generic(String),
}

/// A disagreement between the resolved migrations and the metadata table.
///
/// None of these are corrected automatically; each one needs an operator to
/// decide what the database should look like.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Found more than one migration with version {version} ('{first}' and '{second}')")]
    DuplicateVersion {
        version: MigrationVersion,
        first: String,
        second: String,
    },
    #[error("Found more than one repeatable migration with description '{description}'")]
    DuplicateRepeatable { description: String },
    #[error(
        "Migration {} was applied at rank {installed_rank} but is no longer present in the migration list",
        label(.version.as_ref(), .description)
    )]
    MissingMigration {
        version: Option<MigrationVersion>,
        description: String,
        installed_rank: i64,
    },
    #[error(
        "Migration {version} ('{description}') checksum mismatch. Recorded '{recorded}' but resolved '{resolved}'. \
        This indicates the migration was modified after being applied."
    )]
    ChecksumMismatch {
        version: MigrationVersion,
        description: String,
        recorded: String,
        resolved: String,
    },
    #[error(
        "Migration {version} ('{description}') is pending but sorts below the highest applied version {highest_applied}. \
        Allow out-of-order migrations to apply it anyway."
    )]
    OutOfOrder {
        version: MigrationVersion,
        description: String,
        highest_applied: MigrationVersion,
    },
    #[error(
        "Detected failed migration {} at rank {installed_rank}. \
        Fix the database manually, then run repair() before migrating again.",
        label(.version.as_ref(), .description)
    )]
    FailedMigration {
        version: Option<MigrationVersion>,
        description: String,
        installed_rank: i64,
    },
}

impl ValidationError {
    /// The version the error refers to, if it concerns a versioned migration.
    pub fn version(&self) -> Option<&MigrationVersion> {
        match self {
            Self::DuplicateVersion { version, .. }
            | Self::ChecksumMismatch { version, .. }
            | Self::OutOfOrder { version, .. } => Some(version),
            Self::MissingMigration { version, .. } | Self::FailedMigration { version, .. } => {
                version.as_ref()
            }
            Self::DuplicateRepeatable { .. } => None,
        }
    }
}

pub(crate) fn label(version: Option<&MigrationVersion>, description: &str) -> String {
    match version {
        Some(version) => format!("{} ('{}')", version, description),
        None => format!("'{}' (repeatable)", description),
    }
}

fn holder_suffix(holder: Option<&str>) -> String {
    holder
        .map(|holder| format!(" (held by {})", holder))
        .unwrap_or_default()
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}
