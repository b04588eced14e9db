//! The database capability interface the engine drives.
//!
//! A [Dialect] wraps one live connection to one database engine. The engine
//! never builds engine-specific SQL itself: DDL, introspection, locking
//! primitives and transaction control all go through this trait, while the
//! bookkeeping queries against the metadata table are written once in portable
//! SQL using [Dialect::quote_identifier] and [Dialect::placeholder].

use crate::error::Error;
use chrono::{DateTime, Utc};
use std::fmt;

/// A value bound to, or read back from, a bookkeeping query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
    Bool(bool),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One result row of a bookkeeping query.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    fn value(&self, idx: usize) -> Result<&SqlValue, Error> {
        self.0
            .get(idx)
            .ok_or_else(|| Error::Generic(format!("column {} out of range", idx)))
    }

    pub fn get_i64(&self, idx: usize) -> Result<i64, Error> {
        match self.value(idx)? {
            SqlValue::Integer(v) => Ok(*v),
            SqlValue::Bool(b) => Ok(i64::from(*b)),
            SqlValue::Text(s) => s
                .parse()
                .map_err(|e| Error::Generic(format!("column {} is not an integer: {}", idx, e))),
            SqlValue::Null => Err(Error::Generic(format!("column {} is NULL", idx))),
        }
    }

    pub fn get_bool(&self, idx: usize) -> Result<bool, Error> {
        match self.value(idx)? {
            SqlValue::Bool(b) => Ok(*b),
            SqlValue::Integer(v) => Ok(*v != 0),
            other => Err(Error::Generic(format!(
                "column {} is not a boolean: {:?}",
                idx, other
            ))),
        }
    }

    pub fn get_opt_text(&self, idx: usize) -> Result<Option<String>, Error> {
        match self.value(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Integer(v) => Ok(Some(v.to_string())),
            SqlValue::Bool(b) => Ok(Some(b.to_string())),
        }
    }

    pub fn get_text(&self, idx: usize) -> Result<String, Error> {
        self.get_opt_text(idx)?
            .ok_or_else(|| Error::Generic(format!("column {} is NULL", idx)))
    }
}

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Render the name quoted for the given dialect.
    pub fn quoted(&self, db: &dyn Dialect) -> String {
        format!(
            "{}.{}",
            db.quote_identifier(&self.schema),
            db.quote_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// The kind of a droppable schema object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
    MaterializedView,
    Sequence,
    Index,
    Trigger,
    Function,
    Type,
    Domain,
}

/// A droppable object found inside a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaObject {
    pub schema: String,
    pub name: String,
    pub kind: ObjectKind,
    /// Argument signature for overloadable objects such as functions.
    pub arguments: Option<String>,
}

impl SchemaObject {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            kind,
            arguments: None,
        }
    }
}

/// Engine-specific capabilities consumed by the migration engine.
///
/// Implementations hold a single connection; the engine is single-threaded
/// per migrator, so nothing here needs to be `Sync`.
pub trait Dialect {
    /// Short engine name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether DDL statements participate in transactions and can be rolled back.
    fn supports_transactional_ddl(&self) -> bool;

    /// Whether [Dialect::drop_schema] may run inside a transaction.
    fn supports_transactional_schema_drop(&self) -> bool {
        self.supports_transactional_ddl()
    }

    /// Whether [Dialect::try_advisory_lock] is backed by a native session lock.
    fn supports_advisory_locks(&self) -> bool {
        false
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Positional bind placeholder for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// The database user recorded as `installed_by`.
    fn current_user(&mut self) -> Result<String, Error>;

    fn now(&mut self) -> Result<DateTime<Utc>, Error> {
        Ok(Utc::now())
    }

    /// An identifier for the current connection, stored with row locks.
    fn session_id(&mut self) -> Result<String, Error>;

    /// Whether the session that wrote a row lock is still connected.
    /// `None` when the engine cannot tell, in which case lock leases decide.
    fn is_session_alive(&mut self, _session: &str) -> Result<Option<bool>, Error> {
        Ok(None)
    }

    fn try_advisory_lock(&mut self, _key: i64) -> Result<bool, Error> {
        Err(Error::Unsupported {
            dialect: self.name(),
            feature: "advisory locks",
        })
    }

    fn release_advisory_lock(&mut self, _key: i64) -> Result<(), Error> {
        Err(Error::Unsupported {
            dialect: self.name(),
            feature: "advisory locks",
        })
    }

    /// Execute one or more statements without parameters.
    fn execute_batch(&mut self, sql: &str) -> Result<(), Error>;

    /// Execute a single statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Error>;

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, Error>;

    fn begin(&mut self) -> Result<(), Error>;
    fn commit(&mut self) -> Result<(), Error>;
    fn rollback(&mut self) -> Result<(), Error>;

    /// The schema unqualified names resolve to on this connection.
    fn default_schema(&mut self) -> Result<String, Error>;
    fn schema_exists(&mut self, schema: &str) -> Result<bool, Error>;
    fn create_schema(&mut self, schema: &str) -> Result<(), Error>;
    fn drop_schema(&mut self, schema: &str) -> Result<(), Error>;
    fn table_exists(&mut self, table: &TableName) -> Result<bool, Error>;

    /// Every droppable object in `schema`, ordered so that dropping them in
    /// sequence never trips over a dependency.
    fn list_schema_objects(&mut self, schema: &str) -> Result<Vec<SchemaObject>, Error>;
    fn drop_object(&mut self, object: &SchemaObject) -> Result<(), Error>;

    /// Drop every object in `schema` except the tables named in `retain`,
    /// leaving the schema itself in place.
    fn empty_schema(&mut self, schema: &str, retain: &[&str]) -> Result<(), Error> {
        for object in self.list_schema_objects(schema)? {
            if object.kind == ObjectKind::Table && retain.contains(&object.name.as_str()) {
                continue;
            }
            self.drop_object(&object)?;
        }
        Ok(())
    }

    /// Create the migration history table if it does not exist.
    fn create_metadata_table(&mut self, table: &TableName) -> Result<(), Error>;

    /// Create the companion row-lock table if it does not exist.
    fn create_lock_table(&mut self, table: &TableName) -> Result<(), Error>;
}
