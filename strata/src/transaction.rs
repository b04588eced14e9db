//! Scoped transactions over a [Dialect].

use crate::dialect::Dialect;
use crate::error::Error;
use std::panic::{self, AssertUnwindSafe};

/// Run `f` inside a transaction.
///
/// Commits when `f` returns `Ok`, rolls back when it returns `Err`. If `f`
/// panics the transaction is rolled back and the panic continues unwinding.
pub(crate) fn in_transaction<T>(
    db: &mut dyn Dialect,
    f: impl FnOnce(&mut dyn Dialect) -> Result<T, Error>,
) -> Result<T, Error> {
    db.begin()?;
    match panic::catch_unwind(AssertUnwindSafe(|| f(&mut *db))) {
        Ok(Ok(value)) => match db.commit() {
            Ok(()) => Ok(value),
            Err(error) => {
                rollback(db);
                Err(error)
            }
        },
        Ok(Err(error)) => {
            rollback(db);
            Err(error)
        }
        Err(panic) => {
            rollback(db);
            panic::resume_unwind(panic)
        }
    }
}

/// Roll back after a failure, logging rather than returning a rollback error.
fn rollback(db: &mut dyn Dialect) {
    if let Err(_error) = db.rollback() {
        #[cfg(feature = "tracing")]
        tracing::error!(error = %_error, "Rollback failed");
    }
}
