use crate::dialect::Dialect;
use crate::error::{Error, ValidationError};
use crate::version::MigrationVersion;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TABLE_NAME: &str = "strata_schema_history";

/// Description recorded on the schema creation marker row.
pub(crate) const SCHEMA_MARKER_DESCRIPTION: &str = "<< Schema Creation >>";

/// How a migration is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    /// A SQL script executed as a batch.
    Sql,
    /// Rust code run against the live connection.
    Programmatic,
    /// The marker row recording that the engine created the configured schemas.
    /// Never resolved from a source.
    SchemaMarker,
}

impl MigrationKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "SQL",
            Self::Programmatic => "PROGRAMMATIC",
            Self::SchemaMarker => "SCHEMA",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "SQL" => Ok(Self::Sql),
            "PROGRAMMATIC" => Ok(Self::Programmatic),
            "SCHEMA" => Ok(Self::SchemaMarker),
            other => Err(Error::Generic(format!(
                "Unknown migration type '{}' in metadata table",
                other
            ))),
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A migration implemented in Rust rather than SQL.
///
/// It receives the live connection, so it can read data, transform it and
/// write it back.
pub trait ProgrammaticMigration: Send + Sync {
    fn migrate(&self, db: &mut dyn Dialect) -> Result<(), Error>;

    /// Integrity fingerprint of this migration's logic. Bump it whenever the
    /// logic changes. Defaults to a hash of the version and description.
    fn checksum(&self) -> Option<String> {
        None
    }
}

impl<F> ProgrammaticMigration for F
where
    F: Fn(&mut dyn Dialect) -> Result<(), Error> + Send + Sync,
{
    fn migrate(&self, db: &mut dyn Dialect) -> Result<(), Error> {
        self(db)
    }
}

/// The executable content of a migration.
#[derive(Clone)]
pub enum Script {
    Sql {
        /// Where the script came from, e.g. its file name. Recorded as `script`.
        name: String,
        sql: String,
    },
    Programmatic(Arc<dyn ProgrammaticMigration>),
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql { name, sql } => f
                .debug_struct("Sql")
                .field("name", name)
                .field("len", &sql.len())
                .finish(),
            Self::Programmatic(_) => f.write_str("Programmatic"),
        }
    }
}

/// A resolved migration that may or may not have been applied yet.
///
/// A descriptor with a version is applied exactly once. A descriptor without
/// one is *repeatable*: it runs after all versioned migrations and again
/// whenever its checksum changes.
#[derive(Debug, Clone)]
pub struct MigrationDescriptor {
    version: Option<MigrationVersion>,
    description: String,
    checksum: String,
    script: Script,
    transactional: bool,
}

impl MigrationDescriptor {
    /// A versioned SQL migration. The checksum is computed from the script text.
    pub fn sql(version: &str, description: &str, sql: impl Into<String>) -> Result<Self, Error> {
        let version: MigrationVersion = version.parse()?;
        let sql = sql.into();
        Ok(Self {
            checksum: calculate_checksum(&sql),
            script: Script::Sql {
                name: format!("V{}__{}.sql", version, description.replace(' ', "_")),
                sql,
            },
            version: Some(version),
            description: description.to_string(),
            transactional: true,
        })
    }

    /// A repeatable SQL migration.
    pub fn repeatable(description: &str, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        Self {
            checksum: calculate_checksum(&sql),
            script: Script::Sql {
                name: format!("R__{}.sql", description.replace(' ', "_")),
                sql,
            },
            version: None,
            description: description.to_string(),
            transactional: true,
        }
    }

    /// A versioned migration implemented in Rust.
    pub fn programmatic(
        version: &str,
        description: &str,
        migration: impl ProgrammaticMigration + 'static,
    ) -> Result<Self, Error> {
        let version: MigrationVersion = version.parse()?;
        let checksum = migration
            .checksum()
            .unwrap_or_else(|| calculate_checksum(&format!("{}|{}", version, description)));
        Ok(Self {
            version: Some(version),
            description: description.to_string(),
            checksum,
            script: Script::Programmatic(Arc::new(migration)),
            transactional: true,
        })
    }

    /// Build a descriptor from parts already resolved by a source.
    pub fn from_parts(
        version: Option<MigrationVersion>,
        description: impl Into<String>,
        checksum: impl Into<String>,
        script: Script,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            checksum: checksum.into(),
            script,
            transactional: true,
        }
    }

    /// Override the checksum recorded for this migration.
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    /// Run this migration outside of a transaction even when the dialect
    /// supports transactional DDL (for statements such as
    /// `CREATE INDEX CONCURRENTLY`).
    ///
    /// A failure part way through leaves the statements that already ran in
    /// place; the migration is recorded as failed and needs manual cleanup.
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    pub fn version(&self) -> Option<&MigrationVersion> {
        self.version.as_ref()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn is_repeatable(&self) -> bool {
        self.version.is_none()
    }

    pub fn kind(&self) -> MigrationKind {
        match self.script {
            Script::Sql { .. } => MigrationKind::Sql,
            Script::Programmatic(_) => MigrationKind::Programmatic,
        }
    }

    /// What gets recorded in the `script` column.
    pub(crate) fn script_name(&self) -> String {
        match &self.script {
            Script::Sql { name, .. } => name.clone(),
            Script::Programmatic(_) => self.description.clone(),
        }
    }

    /// Versioned migrations first in ascending version order, then repeatables
    /// by description.
    pub(crate) fn apply_order(&self, other: &Self) -> Ordering {
        match (&self.version, &other.version) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.description.cmp(&other.description),
        }
    }
}

/// A row of the metadata table.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMigrationRecord {
    pub installed_rank: i64,
    pub version: Option<MigrationVersion>,
    pub description: String,
    pub kind: MigrationKind,
    pub script: String,
    pub checksum: Option<String>,
    pub installed_by: String,
    pub installed_on: DateTime<Utc>,
    pub execution_time_ms: i64,
    pub success: bool,
}

impl AppliedMigrationRecord {
    pub fn is_schema_marker(&self) -> bool {
        self.kind == MigrationKind::SchemaMarker
    }

    pub fn is_repeatable(&self) -> bool {
        self.version.is_none() && !self.is_schema_marker()
    }
}

/// The outcome of a successful `migrate()` call.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationResult {
    /// Number of migrations applied by this call, repeatables included.
    pub applied_count: usize,
    /// Versions applied by this call, in the order they ran.
    pub applied_versions: Vec<MigrationVersion>,
    /// Descriptions of repeatable migrations applied by this call.
    pub applied_repeatables: Vec<String>,
    /// Versions that were applied below the highest applied version.
    pub out_of_order: Vec<MigrationVersion>,
    /// Schemas this call created.
    pub schemas_created: Vec<String>,
    pub duration: Duration,
}

impl MigrationResult {
    pub(crate) fn empty() -> Self {
        Self {
            applied_count: 0,
            applied_versions: vec![],
            applied_repeatables: vec![],
            out_of_order: vec![],
            schemas_created: vec![],
            duration: Duration::ZERO,
        }
    }
}

/// The outcome of `validate()`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    /// Number of resolved migrations that were checked.
    pub validated_count: usize,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Turn the first error, if any, into an `Err`.
    pub fn into_result(self) -> Result<(), Error> {
        match self.errors.into_iter().next() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

/// The outcome of `clean()`.
#[derive(Debug)]
pub struct CleanResult {
    /// Every schema clean attempted, in order.
    pub schemas_processed: Vec<String>,
    pub schemas_dropped: Vec<String>,
    pub schemas_cleaned: Vec<String>,
    /// Schemas whose cleanup failed, each with an [Error::CleanObject].
    pub failures: Vec<Error>,
}

impl CleanResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The outcome of `repair()`.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairResult {
    /// Failed records that were removed.
    pub removed_failed: Vec<AppliedMigrationRecord>,
    /// Versions whose recorded checksum was replaced by the resolved one.
    pub realigned: Vec<MigrationVersion>,
}

/// Calculate the checksum of a migration's content.
/// Line endings and a leading byte order mark are normalized first so the
/// same script checked out on different platforms hashes identically.
pub fn calculate_checksum(content: &str) -> String {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let normalized = content.replace("\r\n", "\n");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}
