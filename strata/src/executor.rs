//! Applying one migration and recording its outcome.

use crate::callbacks::Callbacks;
use crate::core::{MigrationDescriptor, Script};
use crate::dialect::Dialect;
use crate::error::Error;
use crate::lock::HeldLock;
use crate::metadata::MetadataTable;
use crate::transaction::in_transaction;
use std::time::{Duration, Instant};

pub(crate) struct Executor<'a> {
    pub(crate) metadata: &'a MetadataTable,
    pub(crate) callbacks: &'a Callbacks,
    pub(crate) installed_by: &'a str,
}

impl Executor<'_> {
    /// Apply `migration` with `lock` held.
    ///
    /// A `success = false` row reserving the next rank is committed before the
    /// script runs, and flipped to `success = true` once it completes. When the
    /// dialect supports transactional DDL the script and the flip share one
    /// transaction. Otherwise they run back to back, and a crash in between
    /// leaves partially applied statements next to the failed row.
    pub(crate) fn apply(
        &self,
        db: &mut dyn Dialect,
        lock: &HeldLock,
        migration: &MigrationDescriptor,
    ) -> Result<Duration, Error> {
        lock.heartbeat(db)?;
        self.callbacks.fire(|c| c.before_each_migrate(migration));

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "migration_up",
            version = %migration
                .version()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "repeatable".to_string()),
            description = %migration.description()
        )
        .entered();

        #[cfg(feature = "tracing")]
        tracing::info!("Starting migration");

        let rank = self.metadata.next_rank(db)?;
        let installed_on = db.now()?;
        self.metadata
            .insert_pending(db, rank, migration, self.installed_by, installed_on)?;

        let started = Instant::now();
        let metadata = self.metadata;
        let run = |db: &mut dyn Dialect| -> Result<Duration, Error> {
            run_script(db, migration)?;
            let elapsed = started.elapsed();
            metadata.mark_success(db, rank, elapsed.as_millis() as i64)?;
            Ok(elapsed)
        };

        let result = if db.supports_transactional_ddl() && migration.is_transactional() {
            in_transaction(db, run)
        } else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                dialect = db.name(),
                "Running migration without a transaction; a failure part way through needs manual cleanup"
            );
            run(db)
        };

        match result {
            Ok(duration) => {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    installed_rank = rank,
                    duration_ms = duration.as_millis(),
                    "Migration completed successfully"
                );

                self.callbacks
                    .fire(|c| c.after_each_migrate(migration, duration));
                Ok(duration)
            }
            Err(source) => {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    installed_rank = rank,
                    error = %source,
                    "Migration failed"
                );

                let error = Error::MigrationExecution {
                    version: migration.version().cloned(),
                    description: migration.description().to_string(),
                    source: Box::new(source),
                };
                self.callbacks
                    .fire(|c| c.after_each_migrate_error(migration, &error));
                Err(error)
            }
        }
    }
}

fn run_script(db: &mut dyn Dialect, migration: &MigrationDescriptor) -> Result<(), Error> {
    match migration.script() {
        Script::Sql { sql, .. } => db.execute_batch(sql),
        Script::Programmatic(migration) => migration.migrate(db),
    }
}
