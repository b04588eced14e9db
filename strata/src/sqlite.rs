//! # SQLite support
//!
//! [SqliteDialect] drives a [`rusqlite`](https://crates.io/crates/rusqlite)
//! connection.
//!
//! ## Transaction Safety
//!
//! SQLite fully supports transactional DDL. Each migration runs inside its own
//! `BEGIN IMMEDIATE` transaction together with the update of its metadata
//! row, so a failing migration leaves no trace besides its `success = false`
//! record. Starting transactions as `IMMEDIATE` takes the write lock up front,
//! which keeps concurrent migrators from deadlocking on a lock upgrade.
//!
//! ## Schemas
//!
//! SQLite has no `CREATE SCHEMA`. Any schema other than `main` and `temp` is
//! an attached database file named `<schema>.db` inside the directory given
//! to [SqliteDialect::with_schema_dir]. Creating a schema attaches (and so
//! creates) that file; dropping it detaches and deletes the file.
//!
//! ## Locking
//!
//! There are no advisory locks, so the migration lock is a row in the
//! `<table>_lock` table. A connection that writes a lock row first creates a
//! session marker, a `.strata-session-<uuid>` database next to the main
//! database file (or in the schema directory for in-memory databases), and
//! keeps it under an exclusive lock until the connection is dropped. The
//! operating system releases that lock when the process dies, so a lock row
//! whose marker can be read is reclaimed at once, whatever its lease says.
//! Only rows without a marker fall back to lease expiry.
//!
//! ## Example
//!
//! ```
//! use strata::{MigrationDescriptor, Migrator};
//! use strata::sqlite::SqliteDialect;
//!
//! let migrator = Migrator::new(vec![
//!     MigrationDescriptor::sql("1", "create users", "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)").unwrap(),
//!     MigrationDescriptor::sql("2", "add email", "ALTER TABLE users ADD COLUMN email TEXT").unwrap(),
//! ]);
//!
//! let mut db = SqliteDialect::open_in_memory().unwrap();
//! let result = migrator.migrate(&mut db).unwrap();
//! assert_eq!(result.applied_count, 2);
//!
//! let columns = db
//!     .connection()
//!     .prepare("PRAGMA table_info(users)")
//!     .unwrap()
//!     .query_map([], |row| row.get::<_, String>(1))
//!     .unwrap()
//!     .collect::<Result<Vec<_>, _>>()
//!     .unwrap();
//! assert_eq!(columns, vec!["id", "name", "email"]);
//! ```

use crate::dialect::{Dialect, ObjectKind, Row, SchemaObject, SqlValue, TableName};
use crate::error::Error;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags, ToSql};
use std::path::{Path, PathBuf};
use std::time::Duration;

// Re-export rusqlite so programmatic migrations can reach the raw connection types.
pub use rusqlite;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const MARKER_PREFIX: &str = ".strata-session-";

/// A [Dialect] over one SQLite connection.
pub struct SqliteDialect {
    conn: Connection,
    session: String,
    schema_dir: Option<PathBuf>,
    marker: Option<SessionMarker>,
}

/// A small database file held under an exclusive lock for as long as its
/// connection lives.
struct SessionMarker {
    path: PathBuf,
    _conn: Connection,
}

impl SessionMarker {
    fn create(dir: &Path, session: &str) -> Result<Self, Error> {
        let path = dir.join(format!("{}{}", MARKER_PREFIX, session));
        let conn = Connection::open(&path)?;
        // In exclusive locking mode the first write keeps the file lock until close.
        conn.execute_batch(
            "PRAGMA locking_mode = EXCLUSIVE;
             PRAGMA journal_mode = MEMORY;
             CREATE TABLE IF NOT EXISTS session (alive INTEGER);
             INSERT INTO session VALUES (1);",
        )?;
        Ok(Self { path, _conn: conn })
    }
}

impl Drop for SessionMarker {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Whether `session` names a marker file rather than a bare session id.
fn marker_path(session: &str) -> Option<&Path> {
    let path = Path::new(session);
    let id = path.file_name()?.to_str()?.strip_prefix(MARKER_PREFIX)?;
    uuid::Uuid::parse_str(id).ok()?;
    Some(path)
}

fn remove_marker(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error.into()),
        _ => Ok(()),
    }
}

impl std::fmt::Debug for SqliteDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDialect")
            .field("path", &self.conn.path())
            .field("session", &self.session)
            .field("schema_dir", &self.schema_dir)
            .finish()
    }
}

impl SqliteDialect {
    /// Wrap an existing connection. Sets a 30 second busy timeout so that
    /// short write contention between migrators waits instead of failing.
    pub fn new(conn: Connection) -> Result<Self, Error> {
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self {
            conn,
            session: uuid::Uuid::new_v4().to_string(),
            schema_dir: None,
            marker: None,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::new(Connection::open_in_memory()?)
    }

    /// How long to wait on a database locked by another connection.
    pub fn with_busy_timeout(self, timeout: Duration) -> Result<Self, Error> {
        self.conn.busy_timeout(timeout)?;
        Ok(self)
    }

    /// Directory holding the database files of attached schemas.
    pub fn with_schema_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.schema_dir = Some(dir.into());
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_inner(self) -> Connection {
        self.conn
    }

    /// Where this connection's session marker goes: beside the main database
    /// file, or in the schema directory when the main database is in memory.
    fn marker_dir(&self) -> Option<PathBuf> {
        match self.conn.path().filter(|path| !path.is_empty()) {
            Some(path) => Path::new(path).parent().map(Path::to_path_buf),
            None => self.schema_dir.clone(),
        }
    }

    fn schema_file(&self, schema: &str) -> Option<PathBuf> {
        self.schema_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.db", schema)))
    }

    /// Attached databases as `(name, file)` pairs.
    fn attached(&self) -> Result<Vec<(String, String)>, Error> {
        let mut stmt = self.conn.prepare("PRAGMA database_list")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn attach(&mut self, schema: &str, file: &Path) -> Result<(), Error> {
        let sql = format!("ATTACH DATABASE ?1 AS {}", self.quote_identifier(schema));
        self.conn.execute(&sql, [&*file.to_string_lossy()])?;
        Ok(())
    }
}

fn is_builtin_schema(schema: &str) -> bool {
    schema.eq_ignore_ascii_case("main") || schema.eq_ignore_ascii_case("temp")
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Integer(v),
        ValueRef::Real(v) => SqlValue::Text(v.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    // DETACH is refused inside a transaction.
    fn supports_transactional_schema_drop(&self) -> bool {
        false
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn current_user(&mut self) -> Result<String, Error> {
        Ok("sqlite".to_string())
    }

    /// The path of this connection's session marker, created on first use.
    /// Connections with nowhere to put a marker use a bare UUID.
    fn session_id(&mut self) -> Result<String, Error> {
        if self.marker.is_none() {
            if let Some(dir) = self.marker_dir() {
                self.marker = Some(SessionMarker::create(&dir, &self.session)?);
            }
        }
        Ok(match &self.marker {
            Some(marker) => marker.path.to_string_lossy().into_owned(),
            None => self.session.clone(),
        })
    }

    /// A session is alive while its marker stays locked. A marker that can be
    /// read belonged to a connection that is gone, and is removed.
    fn is_session_alive(&mut self, session: &str) -> Result<Option<bool>, Error> {
        let Some(path) = marker_path(session) else {
            return Ok(None);
        };
        if self.marker.as_ref().is_some_and(|m| m.path == path) {
            return Ok(Some(true));
        }
        if !path.exists() {
            return Ok(Some(false));
        }
        let probe = match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE) {
            Ok(conn) => conn,
            Err(_) if !path.exists() => return Ok(Some(false)),
            Err(error) => return Err(error.into()),
        };
        probe.busy_timeout(Duration::ZERO)?;
        match probe.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        }) {
            Ok(_) => {
                drop(probe);
                remove_marker(path)?;
                Ok(Some(false))
            }
            Err(rusqlite::Error::SqliteFailure(error, _))
                if matches!(error.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Ok(Some(true))
            }
            Err(error) => Err(error.into()),
        }
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, Error> {
        let changed = self.conn.execute(sql, params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, Error> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for idx in 0..columns {
                values.push(from_value_ref(row.get_ref(idx)?));
            }
            result.push(Row(values));
        }
        Ok(result)
    }

    fn begin(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn default_schema(&mut self) -> Result<String, Error> {
        Ok("main".to_string())
    }

    /// A schema exists when it is attached, or when its file is present in the
    /// schema directory, in which case it gets attached on the spot.
    fn schema_exists(&mut self, schema: &str) -> Result<bool, Error> {
        if is_builtin_schema(schema) {
            return Ok(true);
        }
        if self.attached()?.iter().any(|(name, _)| name == schema) {
            return Ok(true);
        }
        match self.schema_file(schema) {
            Some(file) if file.exists() => {
                self.attach(schema, &file)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn create_schema(&mut self, schema: &str) -> Result<(), Error> {
        if self.schema_exists(schema)? {
            return Ok(());
        }
        let file = self.schema_file(schema).ok_or(Error::Unsupported {
            dialect: "sqlite",
            feature: "creating schemas without a schema directory",
        })?;
        self.attach(schema, &file)
    }

    fn drop_schema(&mut self, schema: &str) -> Result<(), Error> {
        if is_builtin_schema(schema) {
            return Err(Error::Unsupported {
                dialect: "sqlite",
                feature: "dropping the main or temp schema",
            });
        }
        let file = self
            .attached()?
            .into_iter()
            .find(|(name, _)| name == schema)
            .map(|(_, file)| file);
        let Some(file) = file else {
            return Ok(());
        };
        let sql = format!("DETACH DATABASE {}", self.quote_identifier(schema));
        self.conn.execute_batch(&sql)?;
        if !file.is_empty() && Path::new(&file).exists() {
            std::fs::remove_file(&file)?;
        }
        Ok(())
    }

    fn table_exists(&mut self, table: &TableName) -> Result<bool, Error> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
            self.quote_identifier(&table.schema)
        );
        let count: i64 = self.conn.query_row(&sql, [&table.name], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Views, then triggers, then tables newest first. Internal `sqlite_`
    /// objects are skipped; indexes go away with their tables.
    fn list_schema_objects(&mut self, schema: &str) -> Result<Vec<SchemaObject>, Error> {
        let sql = format!(
            "SELECT type, name FROM {}.sqlite_master \
            WHERE type IN ('view', 'trigger', 'table') AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
            ORDER BY CASE type WHEN 'view' THEN 0 WHEN 'trigger' THEN 1 ELSE 2 END, rowid DESC",
            self.quote_identifier(schema)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let objects = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(objects
            .into_iter()
            .map(|(kind, name)| {
                let kind = match kind.as_str() {
                    "view" => ObjectKind::View,
                    "trigger" => ObjectKind::Trigger,
                    _ => ObjectKind::Table,
                };
                SchemaObject::new(schema, name, kind)
            })
            .collect())
    }

    fn drop_object(&mut self, object: &SchemaObject) -> Result<(), Error> {
        let keyword = match object.kind {
            ObjectKind::Table => "TABLE",
            ObjectKind::View => "VIEW",
            ObjectKind::Trigger => "TRIGGER",
            ObjectKind::Index => "INDEX",
            _ => {
                return Err(Error::Unsupported {
                    dialect: "sqlite",
                    feature: "dropping this kind of object",
                })
            }
        };
        let sql = format!(
            "DROP {} IF EXISTS {}.{}",
            keyword,
            self.quote_identifier(&object.schema),
            self.quote_identifier(&object.name)
        );
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    fn empty_schema(&mut self, schema: &str, retain: &[&str]) -> Result<(), Error> {
        for object in self.list_schema_objects(schema)? {
            if object.kind == ObjectKind::Table && retain.contains(&object.name.as_str()) {
                continue;
            }
            self.drop_object(&object)?;
        }
        // AUTOINCREMENT counters outlive their tables.
        if self.table_exists(&TableName::new(schema, "sqlite_sequence"))? {
            let sql = format!("DELETE FROM {}.sqlite_sequence", self.quote_identifier(schema));
            self.conn.execute_batch(&sql)?;
        }
        Ok(())
    }

    fn create_metadata_table(&mut self, table: &TableName) -> Result<(), Error> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                installed_rank INTEGER NOT NULL PRIMARY KEY,
                version TEXT,
                description TEXT NOT NULL,
                type TEXT NOT NULL,
                script TEXT NOT NULL,
                checksum TEXT,
                installed_by TEXT NOT NULL,
                installed_on TEXT NOT NULL,
                execution_time INTEGER NOT NULL,
                success BOOLEAN NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {name} (version) WHERE success;",
            table = table.quoted(self),
            index = format!(
                "{}.{}",
                self.quote_identifier(&table.schema),
                self.quote_identifier(&format!("{}_version_idx", table.name))
            ),
            name = self.quote_identifier(&table.name),
        );
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    fn create_lock_table(&mut self, table: &TableName) -> Result<(), Error> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                lock_id INTEGER NOT NULL PRIMARY KEY,
                owner TEXT NOT NULL,
                session TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
            table.quoted(self)
        );
        self.conn.execute_batch(&sql)?;
        Ok(())
    }
}
