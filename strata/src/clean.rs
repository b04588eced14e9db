//! Tearing managed schemas back down.
//!
//! Schemas recorded by the schema creation marker were created by the
//! migrator, so clean drops them outright. Any other schema existed before the
//! migrator touched it and is only emptied, object by object, in dependency
//! order. Each schema is handled in its own transaction where the dialect
//! allows it, and a failure in one schema does not stop the others.

use crate::core::CleanResult;
use crate::dialect::Dialect;
use crate::error::Error;
use crate::metadata::MetadataTable;
use crate::transaction::in_transaction;
#[cfg(feature = "tracing")]
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanAction {
    Drop,
    Empty,
}

pub(crate) fn clean(db: &mut dyn Dialect, metadata: &MetadataTable, schemas: &[String]) -> CleanResult {
    let drop_schemas = match metadata.has_schema_marker(db) {
        Ok(found) => found,
        Err(_error) => {
            #[cfg(feature = "tracing")]
            tracing::error!(
                error = %_error,
                "Error while checking whether the schemas should be dropped"
            );
            false
        }
    };
    let action = if drop_schemas {
        CleanAction::Drop
    } else {
        CleanAction::Empty
    };

    let lock_table = metadata.lock_table();
    let lock_table_name = [lock_table.name.as_str()];
    let mut result = CleanResult {
        schemas_processed: vec![],
        schemas_dropped: vec![],
        schemas_cleaned: vec![],
        failures: vec![],
    };

    for schema in schemas {
        result.schemas_processed.push(schema.clone());
        let retain: &[&str] = if *schema == lock_table.schema {
            &lock_table_name
        } else {
            &[]
        };

        #[cfg(feature = "tracing")]
        let started = Instant::now();
        match clean_schema(db, schema, action, retain) {
            Ok(false) => {
                #[cfg(feature = "tracing")]
                tracing::info!(schema = %schema, "Schema does not exist, nothing to clean");
            }
            Ok(true) => {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    schema = %schema,
                    action = ?action,
                    duration_ms = started.elapsed().as_millis(),
                    "Cleaned schema"
                );
                match action {
                    CleanAction::Drop => result.schemas_dropped.push(schema.clone()),
                    CleanAction::Empty => result.schemas_cleaned.push(schema.clone()),
                }
            }
            Err(source) => {
                #[cfg(feature = "tracing")]
                tracing::error!(schema = %schema, error = %source, "Unable to clean schema");
                result.failures.push(Error::CleanObject {
                    schema: schema.clone(),
                    source: Box::new(source),
                });
            }
        }
    }

    result
}

/// Returns `false` when the schema is already gone.
fn clean_schema(
    db: &mut dyn Dialect,
    schema: &str,
    action: CleanAction,
    retain: &[&str],
) -> Result<bool, Error> {
    if !db.schema_exists(schema)? {
        return Ok(false);
    }
    let work = |db: &mut dyn Dialect| match action {
        CleanAction::Drop => db.drop_schema(schema),
        CleanAction::Empty => db.empty_schema(schema, retain),
    };
    let transactional = match action {
        CleanAction::Drop => db.supports_transactional_schema_drop(),
        CleanAction::Empty => db.supports_transactional_ddl(),
    };
    if transactional {
        in_transaction(db, work)?;
    } else {
        work(db)?;
    }
    Ok(true)
}
