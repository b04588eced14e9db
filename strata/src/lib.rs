#![cfg_attr(docsrs, feature(doc_cfg))]
//! `strata` applies versioned schema migrations to a database exactly once,
//! even when many processes start up and migrate the same database at the
//! same time.
//!
//! Core concepts:
//! - Migrations are either SQL scripts or Rust code handed a live connection
//!   through the [Dialect] trait. They are identified by a dotted
//!   [MigrationVersion], or by a description alone for repeatable migrations.
//! - Every applied migration is recorded in a history table together with a
//!   SHA-256 checksum of its content, so edits to applied migrations are
//!   caught before anything else runs.
//! - All mutations happen under one lock per history table: a native
//!   advisory lock where the database has one, otherwise a lease-based row in
//!   a companion `<table>_lock` table.
//!
//! # Motivation
//!
//! ## Exactly once, everywhere
//!
//! A central use case is running migrations from an application's startup
//! procedure. When several replicas of that application start together, they
//! race to migrate the same database. `strata` serializes them: the first
//! replica applies the pending migrations, the others wait for the lock, see
//! nothing left to do, and carry on.
//!
//! ## Fail loudly, never guess
//!
//! Anything surprising in the history table stops the run before it changes
//! anything: an applied migration whose checksum changed, one that can no
//! longer be found, a gap filled in below the highest applied version, or a
//! leftover record of a migration that failed halfway. Fixing those is an
//! operator decision, assisted by [Migrator::info] and [Migrator::repair].
//!
//! # Features
//! - Per-migration transactions on databases with transactional DDL.
//! - Repeatable migrations, re-applied whenever their content changes.
//! - Optional out-of-order application of late-arriving versions.
//! - Multi-schema management, including dropping engine-created schemas on [Migrator::clean].
//! - Lifecycle [Callback]s.
//! - Tracing integration - available with the `tracing` feature flag.
//!
//! # Database support
//!
//! - [`SQLite`](sqlite) - available with the `sqlite` feature flag.
//! - [`PostgreSQL`](postgres) - available with the `postgres` feature flag.
//!
//! Other databases plug in by implementing [Dialect].

mod core;
pub use core::{
    calculate_checksum, AppliedMigrationRecord, CleanResult, MigrationDescriptor, MigrationKind,
    MigrationResult, ProgrammaticMigration, RepairResult, Script, ValidationResult,
    DEFAULT_TABLE_NAME,
};

mod error;
pub use error::{Error, ValidationError};

mod version;
pub use version::MigrationVersion;

mod dialect;
pub use dialect::{Dialect, ObjectKind, Row, SchemaObject, SqlValue, TableName};

mod source;
pub use source::{DirectorySource, MigrationSource};

mod config;
pub use config::{Config, LockConfig, LockMode};

mod callbacks;
pub use callbacks::Callback;

mod info;
pub use info::{MigrationInfo, MigrationState};

mod migrator;
pub use migrator::Migrator;

mod clean;
mod executor;
mod lock;
mod metadata;
mod resolver;
mod transaction;
mod validator;

#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub mod sqlite;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;
