//! The entrypoint tying resolution, validation, locking and execution together.

use crate::callbacks::{Callback, Callbacks};
use crate::clean;
use crate::config::{Config, LockConfig, LockMode};
use crate::core::{
    CleanResult, MigrationDescriptor, MigrationResult, RepairResult, ValidationResult,
};
use crate::dialect::{Dialect, ObjectKind, SchemaObject, TableName};
use crate::error::Error;
use crate::executor::Executor;
use crate::info::{self, MigrationInfo};
use crate::lock::{with_lock, LockCoordinator, LockStrategy};
use crate::metadata::MetadataTable;
use crate::resolver;
use crate::source::MigrationSource;
use crate::transaction::in_transaction;
use crate::validator::{self, ValidationPolicy};
use std::sync::Arc;
use std::time::Instant;

/// Applies a set of migrations to a database exactly once, in order.
///
/// A `Migrator` holds no connection. Every operation takes the [Dialect] to
/// work against, so the same migrator can be reused across connections and
/// shared between threads. Processes racing on the same target coordinate
/// through a lock scoped to the metadata table and never apply a migration
/// twice.
///
/// ```ignore
/// use strata::{MigrationDescriptor, Migrator};
/// use strata::sqlite::SqliteDialect;
///
/// let migrator = Migrator::new(vec![
///     MigrationDescriptor::sql("1", "create users", "CREATE TABLE users (id INTEGER PRIMARY KEY)")?,
///     MigrationDescriptor::sql("2", "add email", "ALTER TABLE users ADD COLUMN email TEXT")?,
/// ]);
/// let mut db = SqliteDialect::open("app.db")?;
/// let result = migrator.migrate(&mut db)?;
/// assert_eq!(result.applied_count, 2);
/// ```
pub struct Migrator {
    source: Box<dyn MigrationSource + Send + Sync>,
    config: Config,
    callbacks: Callbacks,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Migrator {
    /// Create a migrator over an in-memory list of migrations.
    pub fn new(migrations: Vec<MigrationDescriptor>) -> Self {
        Self::from_source(migrations)
    }

    /// Create a migrator that resolves its migrations from `source` on every call.
    pub fn from_source(source: impl MigrationSource + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
            config: Config::default(),
            callbacks: Callbacks::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the name of the metadata table. Defaults to `strata_schema_history`.
    pub fn with_table_name(mut self, name: impl Into<String>) -> Self {
        self.config.table = name.into();
        self
    }

    /// Manage these schemas. The first one holds the metadata table.
    pub fn with_schemas<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.schemas = schemas.into_iter().map(Into::into).collect();
        self
    }

    /// Apply pending migrations that sort below the highest applied version
    /// instead of rejecting them.
    pub fn allow_out_of_order(mut self, allow: bool) -> Self {
        self.config.allow_out_of_order = allow;
        self
    }

    pub fn ignore_missing_migrations(mut self, ignore: bool) -> Self {
        self.config.ignore_missing_migrations = ignore;
        self
    }

    /// Make [Migrator::clean] fail with [Error::CleanDisabled].
    pub fn clean_disabled(mut self, disabled: bool) -> Self {
        self.config.clean_disabled = disabled;
        self
    }

    pub fn with_installed_by(mut self, user: impl Into<String>) -> Self {
        self.config.installed_by = Some(user.into());
        self
    }

    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.config.lock = lock;
        self
    }

    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.config.lock.mode = mode;
        self
    }

    /// Register a lifecycle callback. Callbacks fire in registration order.
    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Apply every pending migration.
    ///
    /// Validation runs twice: once up front so that obvious problems surface
    /// without waiting for the lock, and again once the lock is held, against
    /// a fresh read of the metadata table. Failed rows are only reported by the
    /// second pass, since before the lock is held they may belong to a
    /// migration another process is still applying. Configured schemas that do not
    /// exist are created; if all of them were, a schema creation marker is
    /// recorded so that [Migrator::clean] may later drop them.
    pub fn migrate(&self, db: &mut dyn Dialect) -> Result<MigrationResult, Error> {
        let started = Instant::now();
        let metadata = self.metadata_table(db)?;

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("migrate", table = %metadata.name()).entered();

        let resolved = resolver::resolve(self.source.resolve_available()?)?;
        self.callbacks.fire(|c| c.before_migrate());

        let applied = metadata.load(db)?;
        self.check(&resolved, &applied, false)?;

        let schemas_created = self.prepare_schemas(db)?;
        let installed_by = self.installed_by(db)?;
        let coordinator = self.coordinator(&metadata);

        let mut result = with_lock(&coordinator, db, |db, lock| {
            metadata.create(db)?;
            if !self.config.schemas.is_empty()
                && schemas_created.len() == self.config.schemas.len()
            {
                let now = db.now()?;
                metadata.insert_schema_marker(db, &self.config.schemas, &installed_by, now)?;
            }

            let applied = metadata.load(db)?;
            self.check(&resolved, &applied, true)?;

            let mut result = MigrationResult::empty();
            for (migration, _highest) in validator::out_of_order(&resolved, &applied) {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    version = %migration.version().map(|v| v.to_string()).unwrap_or_default(),
                    highest_applied = %_highest,
                    "Applying migration out of order"
                );
                if let Some(version) = migration.version() {
                    result.out_of_order.push(version.clone());
                }
            }

            let pending = resolver::pending(&resolved, &applied);

            #[cfg(feature = "tracing")]
            tracing::info!(
                pending = pending.len(),
                applied = applied.iter().filter(|r| r.success).count(),
                "Resolved pending migrations"
            );

            let executor = Executor {
                metadata: &metadata,
                callbacks: &self.callbacks,
                installed_by: &installed_by,
            };
            for migration in pending {
                executor.apply(db, lock, migration)?;
                result.applied_count += 1;
                match migration.version() {
                    Some(version) => result.applied_versions.push(version.clone()),
                    None => result
                        .applied_repeatables
                        .push(migration.description().to_string()),
                }
            }
            Ok(result)
        })?;

        result.schemas_created = schemas_created;
        result.duration = started.elapsed();

        #[cfg(feature = "tracing")]
        tracing::info!(
            applied = result.applied_count,
            duration_ms = result.duration.as_millis(),
            "Migration run complete"
        );

        self.callbacks.fire(|c| c.after_migrate(&result));
        Ok(result)
    }

    /// Compare the resolved migrations with the metadata table without
    /// changing anything.
    pub fn validate(&self, db: &mut dyn Dialect) -> Result<ValidationResult, Error> {
        self.callbacks.fire(|c| c.before_validate());

        let metadata = self.metadata_table(db)?;
        let result = match resolver::resolve(self.source.resolve_available()?) {
            Ok(resolved) => {
                let applied = metadata.load(db)?;
                ValidationResult {
                    errors: validator::validate(&resolved, &applied, self.policy()),
                    validated_count: resolved.len(),
                }
            }
            Err(error) => ValidationResult {
                errors: vec![error],
                validated_count: 0,
            },
        };

        #[cfg(feature = "tracing")]
        if result.is_valid() {
            tracing::info!(validated = result.validated_count, "Validation succeeded");
        } else {
            tracing::warn!(errors = result.errors.len(), "Validation failed");
        }

        self.callbacks.fire(|c| c.after_validate(&result));
        Ok(result)
    }

    /// Drop or empty every managed schema.
    ///
    /// Schemas the migrator created are dropped. Schemas that already
    /// existed are emptied in place. Failures are collected per schema in
    /// [CleanResult::failures] rather than stopping the run.
    pub fn clean(&self, db: &mut dyn Dialect) -> Result<CleanResult, Error> {
        if self.config.clean_disabled {
            return Err(Error::CleanDisabled);
        }
        let metadata = self.metadata_table(db)?;

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("clean", table = %metadata.name()).entered();

        self.callbacks.fire(|c| c.before_clean());

        let schemas = if self.config.schemas.is_empty() {
            vec![metadata.name().schema.clone()]
        } else {
            self.config.schemas.clone()
        };

        let result = if db.schema_exists(&metadata.name().schema)? {
            let coordinator = self.coordinator(&metadata);
            let result = with_lock(&coordinator, db, |db, _| {
                Ok(clean::clean(db, &metadata, &schemas))
            })?;
            if coordinator.strategy(&*db)? == LockStrategy::Row {
                drop_lock_table(db, &metadata.lock_table())?;
            }
            result
        } else {
            clean::clean(db, &metadata, &schemas)
        };

        self.callbacks.fire(|c| c.after_clean(&result));
        Ok(result)
    }

    /// Every known migration with its state, applied ones first.
    pub fn info(&self, db: &mut dyn Dialect) -> Result<Vec<MigrationInfo>, Error> {
        let resolved = resolver::resolve(self.source.resolve_available()?)?;
        let metadata = self.metadata_table(db)?;
        let applied = metadata.load(db)?;
        Ok(info::merge(
            &resolved,
            &applied,
            self.config.allow_out_of_order,
        ))
    }

    /// Remove failed migration records and realign recorded checksums with
    /// the resolved migrations, under the lock.
    ///
    /// Run this after manually undoing whatever a failed migration left
    /// behind. Schema objects are never touched.
    pub fn repair(&self, db: &mut dyn Dialect) -> Result<RepairResult, Error> {
        let resolved = resolver::resolve(self.source.resolve_available()?)?;
        let metadata = self.metadata_table(db)?;
        self.callbacks.fire(|c| c.before_repair());

        let mut result = RepairResult {
            removed_failed: vec![],
            realigned: vec![],
        };
        if metadata.exists(db)? {
            let coordinator = self.coordinator(&metadata);
            result = with_lock(&coordinator, db, |db, _| {
                let repair = |db: &mut dyn Dialect| -> Result<RepairResult, Error> {
                    let applied = metadata.load(db)?;
                    let removed_failed: Vec<_> = applied
                        .iter()
                        .filter(|r| !r.success && !r.is_schema_marker())
                        .cloned()
                        .collect();
                    if !removed_failed.is_empty() {
                        metadata.delete_failed(db)?;
                    }

                    let mut realigned = vec![];
                    for record in applied.iter().filter(|r| r.success) {
                        let Some(version) = &record.version else {
                            continue;
                        };
                        let Some(migration) = resolved.iter().find(|m| m.version() == Some(version))
                        else {
                            continue;
                        };
                        if record.checksum.as_deref() != Some(migration.checksum()) {
                            metadata.update_checksum(db, record.installed_rank, migration.checksum())?;
                            realigned.push(version.clone());
                        }
                    }
                    Ok(RepairResult {
                        removed_failed,
                        realigned,
                    })
                };
                if db.supports_transactional_ddl() {
                    in_transaction(db, repair)
                } else {
                    repair(db)
                }
            })?;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            removed_failed = result.removed_failed.len(),
            realigned = result.realigned.len(),
            "Repair complete"
        );

        self.callbacks.fire(|c| c.after_repair(&result));
        Ok(result)
    }

    fn policy(&self) -> ValidationPolicy {
        ValidationPolicy {
            allow_out_of_order: self.config.allow_out_of_order,
            ignore_missing_migrations: self.config.ignore_missing_migrations,
            skip_failed: false,
        }
    }

    /// First validation error, if any. `locked` says whether the migration
    /// lock is held; without it `success = false` rows are not reported.
    fn check(
        &self,
        resolved: &[MigrationDescriptor],
        applied: &[crate::core::AppliedMigrationRecord],
        locked: bool,
    ) -> Result<(), Error> {
        let policy = ValidationPolicy {
            skip_failed: !locked,
            ..self.policy()
        };
        match validator::validate(resolved, applied, policy)
            .into_iter()
            .next()
        {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn metadata_table(&self, db: &mut dyn Dialect) -> Result<MetadataTable, Error> {
        let schema = match self.config.schemas.first() {
            Some(schema) => schema.clone(),
            None => db.default_schema()?,
        };
        Ok(MetadataTable::new(TableName::new(schema, &self.config.table)))
    }

    fn coordinator(&self, metadata: &MetadataTable) -> LockCoordinator {
        LockCoordinator::new(
            metadata.name().clone(),
            metadata.lock_table(),
            self.config.lock.clone(),
        )
    }

    fn installed_by(&self, db: &mut dyn Dialect) -> Result<String, Error> {
        match &self.config.installed_by {
            Some(user) => Ok(user.clone()),
            None => db.current_user(),
        }
    }

    /// Create missing configured schemas, returning the ones this call created.
    fn prepare_schemas(&self, db: &mut dyn Dialect) -> Result<Vec<String>, Error> {
        let mut created = vec![];
        for schema in &self.config.schemas {
            if db.schema_exists(schema)? {
                continue;
            }

            #[cfg(feature = "tracing")]
            tracing::info!(schema = %schema, "Creating schema");

            match db.create_schema(schema) {
                Ok(()) => created.push(schema.clone()),
                // Another process created it first.
                Err(_) if db.schema_exists(schema)? => {}
                Err(error) => return Err(error),
            }
        }
        Ok(created)
    }
}

fn drop_lock_table(db: &mut dyn Dialect, table: &TableName) -> Result<(), Error> {
    if db.schema_exists(&table.schema)? && db.table_exists(table)? {
        db.drop_object(&SchemaObject::new(
            &table.schema,
            &table.name,
            ObjectKind::Table,
        ))?;
    }
    Ok(())
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::callbacks::tests::Recorder;
    use crate::core::AppliedMigrationRecord;
    use crate::error::ValidationError;
    use crate::info::MigrationState;
    use crate::sqlite::SqliteDialect;
    use crate::version::MigrationVersion;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn create_table(version: &str, table: &str) -> MigrationDescriptor {
        MigrationDescriptor::sql(
            version,
            &format!("create {}", table),
            format!("CREATE TABLE {} (id INTEGER PRIMARY KEY);", table),
        )
        .unwrap()
    }

    fn v(version: &str) -> MigrationVersion {
        version.parse().unwrap()
    }

    fn records(db: &mut SqliteDialect, migrator: &Migrator) -> Vec<AppliedMigrationRecord> {
        migrator.metadata_table(db).unwrap().load(db).unwrap()
    }

    fn tables(db: &mut SqliteDialect, schema: &str) -> Vec<String> {
        db.list_schema_objects(schema)
            .unwrap()
            .into_iter()
            .map(|o| o.name)
            .collect()
    }

    #[test]
    fn applies_in_version_order_regardless_of_input_order() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let migrator = Migrator::new(vec![
            create_table("3", "c"),
            create_table("1", "a"),
            create_table("1.10", "j"),
            create_table("1.9", "i"),
            create_table("2", "b"),
        ]);

        let result = migrator.migrate(&mut db).unwrap();
        assert_eq!(result.applied_count, 5);
        assert_eq!(
            result.applied_versions,
            vec![v("1"), v("1.9"), v("1.10"), v("2"), v("3")]
        );
        assert!(result.schemas_created.is_empty());

        let records = records(&mut db, &migrator);
        let ranks: Vec<(i64, String)> = records
            .iter()
            .map(|r| (r.installed_rank, r.version.as_ref().unwrap().to_string()))
            .collect();
        assert_eq!(
            ranks,
            vec![
                (1, "1".to_string()),
                (2, "1.9".to_string()),
                (3, "1.10".to_string()),
                (4, "2".to_string()),
                (5, "3".to_string()),
            ]
        );
        assert!(records.iter().all(|r| r.success && r.installed_by == "sqlite"));
    }

    #[test]
    fn second_run_applies_nothing() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let migrator = Migrator::new(vec![create_table("1", "a"), create_table("2", "b")]);
        assert_eq!(migrator.migrate(&mut db).unwrap().applied_count, 2);

        let second = migrator.migrate(&mut db).unwrap();
        assert_eq!(second.applied_count, 0);
        assert!(second.applied_versions.is_empty());
        assert_eq!(records(&mut db, &migrator).len(), 2);
    }

    #[test]
    fn concurrent_migrators_apply_each_migration_once() {
        const THREADS: usize = 4;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let migrations: Vec<MigrationDescriptor> = (1..=5)
            .map(|i| create_table(&i.to_string(), &format!("t{}", i)))
            .collect();
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = barrier.clone();
                let path = path.clone();
                let migrations = migrations.clone();
                thread::spawn(move || {
                    let mut db = SqliteDialect::open(&path).unwrap();
                    let migrator = Migrator::new(migrations).with_lock_config(LockConfig {
                        wait_timeout_secs: Some(60),
                        retry_interval_ms: 5,
                        max_retry_interval_ms: 50,
                        ..LockConfig::default()
                    });
                    barrier.wait();
                    migrator.migrate(&mut db).unwrap().applied_count
                })
            })
            .collect();
        let applied: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(applied, 5);

        let mut db = SqliteDialect::open(&path).unwrap();
        let records = records(&mut db, &Migrator::new(migrations));
        let ranks: Vec<i64> = records.iter().map(|r| r.installed_rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
        let versions: Vec<String> = records
            .iter()
            .map(|r| r.version.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(versions, vec!["1", "2", "3", "4", "5"]);
        assert!(records.iter().all(|r| r.success));
    }

    #[test]
    fn late_starter_waits_for_a_migration_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let started = Arc::new(Barrier::new(2));
        let lock = LockConfig {
            wait_timeout_secs: Some(30),
            retry_interval_ms: 10,
            max_retry_interval_ms: 100,
            ..LockConfig::default()
        };

        let first = {
            let path = path.clone();
            let started = started.clone();
            let lock = lock.clone();
            thread::spawn(move || {
                let mut db = SqliteDialect::open(&path).unwrap();
                let slow = MigrationDescriptor::programmatic(
                    "2",
                    "slow",
                    move |db: &mut dyn Dialect| -> Result<(), Error> {
                        started.wait();
                        thread::sleep(Duration::from_millis(1500));
                        db.execute_batch("CREATE TABLE slow (id INTEGER)")
                    },
                )
                .unwrap();
                Migrator::new(vec![create_table("1", "a"), slow])
                    .with_lock_config(lock)
                    .migrate(&mut db)
                    .map(|r| r.applied_count)
            })
        };

        started.wait();
        let mut db = SqliteDialect::open(&path).unwrap();
        let slow = MigrationDescriptor::programmatic("2", "slow", |db: &mut dyn Dialect| {
            db.execute_batch("CREATE TABLE slow (id INTEGER)")
        })
        .unwrap();
        let late = Migrator::new(vec![create_table("1", "a"), slow]).with_lock_config(lock);
        assert_eq!(late.migrate(&mut db).unwrap().applied_count, 0);
        assert_eq!(first.join().unwrap().unwrap(), 2);

        let records = records(&mut db, &late);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.success));
    }

    #[test]
    fn edited_migration_is_rejected_and_not_reapplied() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        Migrator::new(vec![create_table("1", "a"), create_table("2", "b")])
            .migrate(&mut db)
            .unwrap();

        let edited = Migrator::new(vec![
            create_table("1", "a"),
            MigrationDescriptor::sql("2", "create b", "CREATE TABLE b (id INTEGER, name TEXT);")
                .unwrap(),
            create_table("3", "c"),
        ]);
        match edited.migrate(&mut db).unwrap_err() {
            Error::Validation(ValidationError::ChecksumMismatch {
                version,
                recorded,
                resolved,
                ..
            }) => {
                assert_eq!(version, v("2"));
                assert_ne!(recorded, resolved);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(records(&mut db, &edited).len(), 2);
        assert!(!tables(&mut db, "main").contains(&"c".to_string()));
    }

    #[test]
    fn interrupted_migration_blocks_the_next_run_until_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.sqlite");
        let crashing = Migrator::new(vec![
            create_table("1", "a"),
            MigrationDescriptor::programmatic("2", "crash", |db: &mut dyn Dialect| -> Result<(), Error> {
                db.execute_batch("CREATE TABLE half (id INTEGER)")?;
                panic!("killed mid-migration");
            })
            .unwrap(),
        ]);
        {
            let mut db = SqliteDialect::open(&path).unwrap();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| crashing.migrate(&mut db)));
            assert!(outcome.is_err());
        }

        let mut db = SqliteDialect::open(&path).unwrap();
        let fixed = Migrator::new(vec![create_table("1", "a"), create_table("2", "b")]);
        match fixed.migrate(&mut db).unwrap_err() {
            Error::Validation(ValidationError::FailedMigration {
                version,
                installed_rank,
                ..
            }) => {
                assert_eq!(version, Some(v("2")));
                assert_eq!(installed_rank, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }
        // The lock was released while unwinding.
        let lock_rows = db
            .query("SELECT COUNT(*) FROM strata_schema_history_lock", &[])
            .unwrap()[0]
            .get_i64(0)
            .unwrap();
        assert_eq!(lock_rows, 0);

        let repaired = fixed.repair(&mut db).unwrap();
        assert_eq!(repaired.removed_failed.len(), 1);
        assert_eq!(repaired.removed_failed[0].description, "crash");
        assert!(repaired.realigned.is_empty());

        let result = fixed.migrate(&mut db).unwrap();
        assert_eq!(result.applied_versions, vec![v("2")]);
        let ranks: Vec<i64> = records(&mut db, &fixed)
            .iter()
            .map(|r| r.installed_rank)
            .collect();
        assert_eq!(ranks, vec![1, 2]);
    }

    #[test]
    fn recovers_the_lock_of_a_crashed_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = SqliteDialect::open(dir.path().join("db.sqlite")).unwrap();
        Migrator::new(vec![create_table("1", "a")])
            .migrate(&mut db)
            .unwrap();

        // A process killed while holding the lock leaves its lock row and an
        // unlocked session marker behind.
        let marker = dir
            .path()
            .join(format!(".strata-session-{}", uuid::Uuid::new_v4()));
        rusqlite::Connection::open(&marker)
            .unwrap()
            .execute_batch("CREATE TABLE session (alive INTEGER); INSERT INTO session VALUES (1);")
            .unwrap();
        db.execute(
            "INSERT INTO strata_schema_history_lock (lock_id, owner, session, acquired_at, expires_at) \
            VALUES (1, 'crashed', ?1, '2020-01-01T00:00:00+00:00', '9999-01-01T00:00:00+00:00')",
            &[marker.to_string_lossy().into_owned().into()],
        )
        .unwrap();

        let started = Instant::now();
        let result = Migrator::new(vec![create_table("1", "a"), create_table("2", "b")])
            .migrate(&mut db)
            .unwrap();
        assert_eq!(result.applied_versions, vec![v("2")]);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!marker.exists());
    }

    #[test]
    fn failed_migration_reports_execution_error() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let recorder = Arc::new(Recorder::default());
        let migrator = Migrator::new(vec![
            create_table("1", "a"),
            MigrationDescriptor::sql("2", "broken", "CREATE TABLE b (; ").unwrap(),
            create_table("3", "c"),
        ])
        .with_callback(recorder.clone());

        match migrator.migrate(&mut db).unwrap_err() {
            Error::MigrationExecution { version, .. } => assert_eq!(version, Some(v("2"))),
            other => panic!("unexpected error {:?}", other),
        }
        let records = records(&mut db, &migrator);
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert!(!records[1].success);
        assert_eq!(
            recorder.events(),
            vec![
                "before_migrate",
                "before_each:create a",
                "after_each:create a",
                "before_each:broken",
                "after_each_error:broken"
            ]
        );
    }

    #[test]
    fn out_of_order_is_rejected_unless_allowed() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        Migrator::new(vec![
            create_table("1", "a"),
            create_table("2", "b"),
            create_table("3", "c"),
        ])
        .migrate(&mut db)
        .unwrap();

        let available = vec![
            create_table("1", "a"),
            create_table("2", "b"),
            create_table("1.5", "late"),
            create_table("3", "c"),
            create_table("4", "d"),
        ];
        match Migrator::new(available.clone()).migrate(&mut db).unwrap_err() {
            Error::Validation(ValidationError::OutOfOrder {
                version,
                highest_applied,
                ..
            }) => {
                assert_eq!(version, v("1.5"));
                assert_eq!(highest_applied, v("3"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let migrator = Migrator::new(available).allow_out_of_order(true);
        let result = migrator.migrate(&mut db).unwrap();
        assert_eq!(result.applied_versions, vec![v("1.5"), v("4")]);
        assert_eq!(result.out_of_order, vec![v("1.5")]);

        let ranked: Vec<(i64, String)> = records(&mut db, &migrator)
            .into_iter()
            .map(|r| (r.installed_rank, r.version.unwrap().to_string()))
            .collect();
        assert_eq!(
            &ranked[3..],
            &[(4, "1.5".to_string()), (5, "4".to_string())]
        );
    }

    #[test]
    fn repeatables_run_last_and_again_when_changed() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let view = |select: &str| {
            MigrationDescriptor::repeatable(
                "user view",
                format!("DROP VIEW IF EXISTS user_view; CREATE VIEW user_view AS {};", select),
            )
        };

        let first = Migrator::new(vec![view("SELECT id FROM users"), create_table("1", "users")]);
        let result = first.migrate(&mut db).unwrap();
        assert_eq!(result.applied_versions, vec![v("1")]);
        assert_eq!(result.applied_repeatables, vec!["user view".to_string()]);
        assert_eq!(first.migrate(&mut db).unwrap().applied_count, 0);

        let changed = Migrator::new(vec![
            view("SELECT id, id AS user_id FROM users"),
            create_table("1", "users"),
        ]);
        let result = changed.migrate(&mut db).unwrap();
        assert_eq!(result.applied_repeatables, vec!["user view".to_string()]);

        let states: Vec<MigrationState> = changed
            .info(&mut db)
            .unwrap()
            .into_iter()
            .map(|i| i.state)
            .collect();
        assert_eq!(
            states,
            vec![
                MigrationState::Success,
                MigrationState::Outdated,
                MigrationState::Success
            ]
        );
    }

    #[test]
    fn non_transactional_migrations_are_recorded() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let migrator = Migrator::new(vec![
            create_table("1", "a"),
            MigrationDescriptor::sql("2", "index", "CREATE INDEX a_id ON a (id);")
                .unwrap()
                .non_transactional(),
        ]);
        assert_eq!(migrator.migrate(&mut db).unwrap().applied_count, 2);
        assert!(records(&mut db, &migrator).iter().all(|r| r.success));
    }

    #[test]
    fn clean_empties_a_preexisting_schema() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let migrator = Migrator::new(vec![
            create_table("1", "users"),
            MigrationDescriptor::sql("2", "view", "CREATE VIEW names AS SELECT id FROM users;")
                .unwrap(),
        ]);
        migrator.migrate(&mut db).unwrap();

        let result = migrator.clean(&mut db).unwrap();
        assert!(result.is_complete());
        assert_eq!(result.schemas_cleaned, vec!["main".to_string()]);
        assert!(result.schemas_dropped.is_empty());
        assert!(db.schema_exists("main").unwrap());
        assert!(tables(&mut db, "main").is_empty());

        // The target can be migrated again from scratch.
        assert_eq!(migrator.migrate(&mut db).unwrap().applied_count, 2);
    }

    #[test]
    fn clean_drops_schemas_the_migrator_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = SqliteDialect::open_in_memory()
            .unwrap()
            .with_schema_dir(dir.path());
        let migrator = Migrator::new(vec![MigrationDescriptor::sql(
            "1",
            "create users",
            "CREATE TABLE app.users (id INTEGER PRIMARY KEY);",
        )
        .unwrap()])
        .with_schemas(["app"]);

        let result = migrator.migrate(&mut db).unwrap();
        assert_eq!(result.schemas_created, vec!["app".to_string()]);
        let records = records(&mut db, &migrator);
        assert!(records[0].is_schema_marker());
        assert_eq!(records[1].installed_rank, 1);

        let result = migrator.clean(&mut db).unwrap();
        assert!(result.is_complete(), "{:?}", result.failures);
        assert_eq!(result.schemas_dropped, vec!["app".to_string()]);
        assert!(!db.schema_exists("app").unwrap());
        assert!(!dir.path().join("app.db").exists());
    }

    #[test]
    fn clean_keeps_going_after_a_schema_fails() {
        let dir = tempfile::tempdir().unwrap();
        let locked_path = dir.path().join("locked.db");
        {
            let mut other = SqliteDialect::open(&locked_path).unwrap();
            other.execute_batch("CREATE TABLE kept (id INTEGER)").unwrap();
        }

        let mut db = SqliteDialect::open_in_memory().unwrap();
        db.execute_batch(&format!(
            "ATTACH DATABASE 'file:{}?mode=ro' AS locked",
            locked_path.display()
        ))
        .unwrap();
        let migrator =
            Migrator::new(vec![create_table("1", "users")]).with_schemas(["main", "locked"]);
        migrator.migrate(&mut db).unwrap();

        let result = migrator.clean(&mut db).unwrap();
        assert_eq!(
            result.schemas_processed,
            vec!["main".to_string(), "locked".to_string()]
        );
        assert_eq!(result.schemas_cleaned, vec!["main".to_string()]);
        assert_eq!(result.failures.len(), 1);
        assert!(matches!(
            &result.failures[0],
            Error::CleanObject { schema, .. } if schema == "locked"
        ));
        assert!(tables(&mut db, "main").is_empty());
        assert_eq!(tables(&mut db, "locked"), vec!["kept".to_string()]);
    }

    #[test]
    fn clean_can_be_disabled() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let migrator = Migrator::new(vec![create_table("1", "users")]).clean_disabled(true);
        migrator.migrate(&mut db).unwrap();
        assert!(matches!(migrator.clean(&mut db), Err(Error::CleanDisabled)));
        assert_eq!(tables(&mut db, "main").len(), 3);
    }

    #[test]
    fn validate_reports_without_changing_anything() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        Migrator::new(vec![create_table("1", "a"), create_table("2", "b")])
            .migrate(&mut db)
            .unwrap();

        let missing = Migrator::new(vec![create_table("1", "a")]);
        let result = missing.validate(&mut db).unwrap();
        assert!(!result.is_valid());
        assert_eq!(result.validated_count, 1);
        assert!(matches!(
            result.errors[0],
            ValidationError::MissingMigration { installed_rank: 2, .. }
        ));
        assert!(result.clone().into_result().is_err());

        let ignoring = Migrator::new(vec![create_table("1", "a")]).ignore_missing_migrations(true);
        assert!(ignoring.validate(&mut db).unwrap().is_valid());
        assert_eq!(ignoring.migrate(&mut db).unwrap().applied_count, 0);

        let duplicated = Migrator::new(vec![create_table("1", "a"), create_table("1", "b")]);
        let result = duplicated.validate(&mut db).unwrap();
        assert!(matches!(
            result.errors[0],
            ValidationError::DuplicateVersion { .. }
        ));
    }

    #[test]
    fn repair_realigns_checksums() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        Migrator::new(vec![create_table("1", "a")])
            .migrate(&mut db)
            .unwrap();

        let edited = Migrator::new(vec![MigrationDescriptor::sql(
            "1",
            "create a",
            "CREATE TABLE a (id INTEGER PRIMARY KEY); -- reformatted",
        )
        .unwrap()]);
        assert!(edited.migrate(&mut db).is_err());

        let result = edited.repair(&mut db).unwrap();
        assert_eq!(result.realigned, vec![v("1")]);
        assert!(result.removed_failed.is_empty());
        assert!(edited.validate(&mut db).unwrap().is_valid());
    }

    #[test]
    fn callbacks_fire_around_each_phase() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let recorder = Arc::new(Recorder::default());
        let migrator = Migrator::new(vec![create_table("1", "a")])
            .with_callback(recorder.clone());
        migrator.migrate(&mut db).unwrap();
        migrator.clean(&mut db).unwrap();
        assert_eq!(
            recorder.events(),
            vec![
                "before_migrate",
                "before_each:create a",
                "after_each:create a",
                "after_migrate:1",
                "before_clean",
                "after_clean:1",
            ]
        );
    }

    #[test]
    fn loads_migrations_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("V1__create_users.sql"),
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("V2__add_email.sql"),
            "ALTER TABLE users ADD COLUMN email TEXT;",
        )
        .unwrap();

        let mut db = SqliteDialect::open_in_memory().unwrap();
        let migrator = Migrator::from_source(crate::DirectorySource::new(dir.path()))
            .with_table_name("schema_history")
            .with_installed_by("deployer");
        let result = migrator.migrate(&mut db).unwrap();
        assert_eq!(result.applied_versions, vec![v("1"), v("2")]);

        let records = records(&mut db, &migrator);
        assert_eq!(records[1].script, "V2__add_email.sql");
        assert_eq!(records[1].installed_by, "deployer");
        assert!(db
            .table_exists(&TableName::new("main", "schema_history"))
            .unwrap());
    }
}
