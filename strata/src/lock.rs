//! Cross-process mutual exclusion on one metadata table.
//!
//! Two strategies sit behind [LockCoordinator]:
//!
//! - **Advisory**: the engine's native session lock (PostgreSQL
//!   `pg_try_advisory_lock`), keyed by a hash of the qualified metadata table
//!   name. The database drops it when the session ends, so a crashed holder
//!   never blocks anyone.
//! - **Row**: a single `lock_id = 1` row in `<table>_lock`, taken with
//!   `INSERT ... ON CONFLICT (lock_id) DO NOTHING`. A row whose holder session
//!   is gone, or whose lease ran out when liveness cannot be checked, is
//!   reclaimed by deleting it conditionally on the owner token that was read.
//!   The holder renews the lease before every migration.
//!
//! Both are polled with exponential backoff up to the configured wait.

use crate::config::{LockConfig, LockMode};
use crate::dialect::{Dialect, TableName};
use crate::error::Error;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct LockCoordinator {
    metadata_table: TableName,
    lock_table: TableName,
    policy: LockConfig,
}

/// Which primitive a [LockCoordinator] uses against a given dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockStrategy {
    Advisory,
    Row,
}

/// A lock that is currently held.
#[derive(Debug)]
pub(crate) enum HeldLock {
    Advisory {
        key: i64,
    },
    Row {
        table: TableName,
        owner: String,
        lease: Duration,
    },
}

enum Attempt {
    Acquired(HeldLock),
    Busy { holder: Option<String> },
    /// The lock looked free or stale; try again without waiting.
    Retry,
}

impl LockCoordinator {
    pub(crate) fn new(metadata_table: TableName, lock_table: TableName, policy: LockConfig) -> Self {
        Self {
            metadata_table,
            lock_table,
            policy,
        }
    }

    pub(crate) fn strategy(&self, db: &dyn Dialect) -> Result<LockStrategy, Error> {
        match self.policy.mode {
            LockMode::Auto if db.supports_advisory_locks() => Ok(LockStrategy::Advisory),
            LockMode::Auto | LockMode::Table => Ok(LockStrategy::Row),
            LockMode::Advisory if db.supports_advisory_locks() => Ok(LockStrategy::Advisory),
            LockMode::Advisory => Err(Error::Unsupported {
                dialect: db.name(),
                feature: "advisory locks",
            }),
        }
    }

    /// Create the row-lock table if this strategy needs one. The metadata
    /// schema must already exist.
    pub(crate) fn prepare(&self, db: &mut dyn Dialect) -> Result<(), Error> {
        if self.strategy(&*db)? != LockStrategy::Row || db.table_exists(&self.lock_table)? {
            return Ok(());
        }
        if let Err(error) = db.create_lock_table(&self.lock_table) {
            // A concurrent creator may have won the race.
            if !db.table_exists(&self.lock_table)? {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Block until the lock is held or the wait timeout passes.
    pub(crate) fn acquire(&self, db: &mut dyn Dialect) -> Result<HeldLock, Error> {
        let strategy = self.strategy(&*db)?;
        if strategy == LockStrategy::Row {
            self.prepare(db)?;
        }

        let started = Instant::now();
        let mut interval = self.policy.retry_interval();
        loop {
            let attempt = match strategy {
                LockStrategy::Advisory => self.try_advisory(db)?,
                LockStrategy::Row => self.try_row(db)?,
            };
            match attempt {
                Attempt::Acquired(lock) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        table = %self.metadata_table,
                        strategy = ?strategy,
                        waited_ms = started.elapsed().as_millis(),
                        "Acquired migration lock"
                    );
                    return Ok(lock);
                }
                Attempt::Retry => continue,
                Attempt::Busy { holder } => {
                    let waited = started.elapsed();
                    let remaining = match self.policy.wait_timeout() {
                        Some(timeout) if waited < timeout => timeout - waited,
                        _ => {
                            return Err(Error::LockTimeout {
                                table: self.metadata_table.to_string(),
                                waited,
                                holder,
                            })
                        }
                    };

                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        table = %self.metadata_table,
                        holder = ?holder,
                        retry_in_ms = interval.min(remaining).as_millis(),
                        "Migration lock is busy"
                    );

                    thread::sleep(interval.min(remaining));
                    interval = (interval * 2).min(self.policy.max_retry_interval());
                }
            }
        }
    }

    fn try_advisory(&self, db: &mut dyn Dialect) -> Result<Attempt, Error> {
        let key = advisory_key(&self.metadata_table);
        if db.try_advisory_lock(key)? {
            Ok(Attempt::Acquired(HeldLock::Advisory { key }))
        } else {
            Ok(Attempt::Busy { holder: None })
        }
    }

    fn try_row(&self, db: &mut dyn Dialect) -> Result<Attempt, Error> {
        let owner = uuid::Uuid::new_v4().to_string();
        let session = db.session_id()?;
        let now = db.now()?;
        let lease = self.policy.lease();
        let expires_at = now + chrono_duration(lease);

        let sql = format!(
            "INSERT INTO {} (lock_id, owner, session, acquired_at, expires_at) \
            VALUES (1, {}, {}, {}, {}) ON CONFLICT (lock_id) DO NOTHING",
            self.lock_table.quoted(&*db),
            db.placeholder(1),
            db.placeholder(2),
            db.placeholder(3),
            db.placeholder(4),
        );
        let inserted = db.execute(
            &sql,
            &[
                owner.as_str().into(),
                session.into(),
                now.to_rfc3339().into(),
                expires_at.to_rfc3339().into(),
            ],
        )?;
        if inserted == 1 {
            return Ok(Attempt::Acquired(HeldLock::Row {
                table: self.lock_table.clone(),
                owner,
                lease,
            }));
        }

        let sql = format!(
            "SELECT owner, session, expires_at FROM {} WHERE lock_id = 1",
            self.lock_table.quoted(&*db)
        );
        let rows = db.query(&sql, &[])?;
        let Some(row) = rows.first() else {
            return Ok(Attempt::Retry);
        };
        let holder_owner = row.get_text(0)?;
        let holder_session = row.get_text(1)?;
        let holder_expires = parse_timestamp(&row.get_text(2)?)?;

        let stale = match db.is_session_alive(&holder_session)? {
            Some(alive) => !alive,
            None => holder_expires <= now,
        };
        if !stale {
            return Ok(Attempt::Busy {
                holder: Some(format!("{} on session {}", holder_owner, holder_session)),
            });
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(
            table = %self.lock_table,
            owner = %holder_owner,
            session = %holder_session,
            expires_at = %holder_expires,
            "Reclaiming stale migration lock"
        );

        let sql = format!(
            "DELETE FROM {} WHERE lock_id = 1 AND owner = {}",
            self.lock_table.quoted(&*db),
            db.placeholder(1)
        );
        db.execute(&sql, &[holder_owner.into()])?;
        Ok(Attempt::Retry)
    }
}

impl HeldLock {
    /// Extend the lease of a row lock, failing if another process took it over.
    pub(crate) fn heartbeat(&self, db: &mut dyn Dialect) -> Result<(), Error> {
        let HeldLock::Row {
            table,
            owner,
            lease,
        } = self
        else {
            return Ok(());
        };
        let expires_at = db.now()? + chrono_duration(*lease);
        let sql = format!(
            "UPDATE {} SET expires_at = {} WHERE lock_id = 1 AND owner = {}",
            table.quoted(&*db),
            db.placeholder(1),
            db.placeholder(2)
        );
        let renewed = db.execute(&sql, &[expires_at.to_rfc3339().into(), owner.as_str().into()])?;
        if renewed == 0 {
            return Err(Error::LockAcquisition {
                table: table.to_string(),
                reason: "lock lost: the lock row was reclaimed by another process".to_string(),
            });
        }
        Ok(())
    }

    /// Release the lock. Releasing a lock that is already gone is not an error,
    /// which covers a clean that dropped the lock table's schema.
    pub(crate) fn release(&self, db: &mut dyn Dialect) -> Result<(), Error> {
        match self {
            HeldLock::Advisory { key } => db.release_advisory_lock(*key),
            HeldLock::Row { table, owner, .. } => {
                if !db.schema_exists(&table.schema)? || !db.table_exists(table)? {
                    return Ok(());
                }
                let sql = format!(
                    "DELETE FROM {} WHERE lock_id = 1 AND owner = {}",
                    table.quoted(&*db),
                    db.placeholder(1)
                );
                db.execute(&sql, &[owner.as_str().into()])?;
                Ok(())
            }
        }
    }
}

/// Run `f` with the lock held, releasing it on every exit path.
/// A panic inside `f` releases the lock before it continues unwinding.
pub(crate) fn with_lock<T>(
    coordinator: &LockCoordinator,
    db: &mut dyn Dialect,
    f: impl FnOnce(&mut dyn Dialect, &HeldLock) -> Result<T, Error>,
) -> Result<T, Error> {
    let lock = coordinator.acquire(db)?;
    let result = panic::catch_unwind(AssertUnwindSafe(|| f(&mut *db, &lock)));
    let released = lock.release(db);
    match result {
        Ok(Ok(value)) => released.map(|()| value),
        Ok(Err(error)) => {
            if let Err(_release_error) = released {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_release_error, "Failed to release migration lock");
            }
            Err(error)
        }
        Err(panic) => panic::resume_unwind(panic),
    }
}

/// Stable advisory lock key for a metadata table: the first eight bytes of
/// the SHA-256 of its qualified name.
pub(crate) fn advisory_key(table: &TableName) -> i64 {
    let digest = Sha256::digest(table.to_string().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Generic(format!("Invalid lock timestamp '{}': {}", value, e)))
}
