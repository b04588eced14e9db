//! Lifecycle hooks.
//!
//! Implement [Callback] and register it with
//! [Migrator::with_callback](crate::Migrator::with_callback). Every method has
//! an empty default, so an implementation only overrides the events it cares
//! about. Callbacks run in registration order on the migrating thread.

use crate::core::{CleanResult, MigrationDescriptor, MigrationResult, RepairResult, ValidationResult};
use crate::error::Error;
use std::time::Duration;

#[allow(unused_variables)]
pub trait Callback: Send + Sync {
    fn before_migrate(&self) {}
    fn after_migrate(&self, result: &MigrationResult) {}

    /// Fired with the lock held, right before a migration starts.
    fn before_each_migrate(&self, migration: &MigrationDescriptor) {}
    fn after_each_migrate(&self, migration: &MigrationDescriptor, duration: Duration) {}
    /// Fired after a migration failed and its failure row was left behind.
    fn after_each_migrate_error(&self, migration: &MigrationDescriptor, error: &Error) {}

    fn before_validate(&self) {}
    fn after_validate(&self, result: &ValidationResult) {}

    fn before_clean(&self) {}
    fn after_clean(&self, result: &CleanResult) {}

    fn before_repair(&self) {}
    fn after_repair(&self, result: &RepairResult) {}
}

impl<C: Callback + ?Sized> Callback for std::sync::Arc<C> {
    fn before_migrate(&self) {
        (**self).before_migrate()
    }
    fn after_migrate(&self, result: &MigrationResult) {
        (**self).after_migrate(result)
    }
    fn before_each_migrate(&self, migration: &MigrationDescriptor) {
        (**self).before_each_migrate(migration)
    }
    fn after_each_migrate(&self, migration: &MigrationDescriptor, duration: Duration) {
        (**self).after_each_migrate(migration, duration)
    }
    fn after_each_migrate_error(&self, migration: &MigrationDescriptor, error: &Error) {
        (**self).after_each_migrate_error(migration, error)
    }
    fn before_validate(&self) {
        (**self).before_validate()
    }
    fn after_validate(&self, result: &ValidationResult) {
        (**self).after_validate(result)
    }
    fn before_clean(&self) {
        (**self).before_clean()
    }
    fn after_clean(&self, result: &CleanResult) {
        (**self).after_clean(result)
    }
    fn before_repair(&self) {
        (**self).before_repair()
    }
    fn after_repair(&self, result: &RepairResult) {
        (**self).after_repair(result)
    }
}

/// The ordered set of registered callbacks.
#[derive(Default, Clone)]
pub(crate) struct Callbacks(Vec<std::sync::Arc<dyn Callback>>);

impl Callbacks {
    pub(crate) fn push(&mut self, callback: std::sync::Arc<dyn Callback>) {
        self.0.push(callback);
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn fire(&self, event: impl Fn(&dyn Callback)) {
        for callback in &self.0 {
            event(callback.as_ref());
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Callbacks({})", self.len())
    }
}
