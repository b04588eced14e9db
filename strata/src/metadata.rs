//! The metadata table: the durable record of what has been applied.
//!
//! Every statement here is portable SQL. Identifiers are quoted and parameters
//! are bound through the [Dialect], so the same code drives every engine. Only
//! the table DDL itself lives in the dialects.

use crate::core::{AppliedMigrationRecord, MigrationDescriptor, MigrationKind, SCHEMA_MARKER_DESCRIPTION};
use crate::dialect::{Dialect, Row, SqlValue, TableName};
use crate::error::Error;
use crate::version::MigrationVersion;
use chrono::{DateTime, Utc};

const COLUMNS: &str = "installed_rank, version, description, type, script, checksum, \
    installed_by, installed_on, execution_time, success";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MetadataTable {
    table: TableName,
}

impl MetadataTable {
    pub(crate) fn new(table: TableName) -> Self {
        Self { table }
    }

    pub(crate) fn name(&self) -> &TableName {
        &self.table
    }

    /// The companion table holding the row lock.
    pub(crate) fn lock_table(&self) -> TableName {
        TableName::new(&self.table.schema, format!("{}_lock", self.table.name))
    }

    pub(crate) fn exists(&self, db: &mut dyn Dialect) -> Result<bool, Error> {
        if !db.schema_exists(&self.table.schema)? {
            return Ok(false);
        }
        db.table_exists(&self.table)
    }

    pub(crate) fn create(&self, db: &mut dyn Dialect) -> Result<(), Error> {
        if self.exists(db)? {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::info!(table = %self.table, "Creating metadata table");

        db.create_metadata_table(&self.table)
    }

    /// All records ordered by `installed_rank`, the schema marker first.
    /// An absent table reads as empty.
    pub(crate) fn load(&self, db: &mut dyn Dialect) -> Result<Vec<AppliedMigrationRecord>, Error> {
        if !self.exists(db)? {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {} FROM {} ORDER BY installed_rank",
            COLUMNS,
            self.table.quoted(&*db)
        );
        db.query(&sql, &[])?.iter().map(parse_record).collect()
    }

    pub(crate) fn next_rank(&self, db: &mut dyn Dialect) -> Result<i64, Error> {
        let sql = format!(
            "SELECT COALESCE(MAX(installed_rank), 0) + 1 FROM {}",
            self.table.quoted(&*db)
        );
        let rows = db.query(&sql, &[])?;
        match rows.first() {
            Some(row) => row.get_i64(0),
            None => Ok(1),
        }
    }

    /// Reserve `rank` for `migration` with a `success = false` row.
    /// If the process dies before [MetadataTable::mark_success], this row is
    /// what the next run finds.
    pub(crate) fn insert_pending(
        &self,
        db: &mut dyn Dialect,
        rank: i64,
        migration: &MigrationDescriptor,
        installed_by: &str,
        installed_on: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.insert(
            db,
            vec![
                rank.into(),
                migration.version().map(|v| v.to_string()).into(),
                migration.description().into(),
                migration.kind().as_str().into(),
                migration.script_name().into(),
                migration.checksum().into(),
                installed_by.into(),
                installed_on.to_rfc3339().into(),
                0i64.into(),
                false.into(),
            ],
        )
    }

    pub(crate) fn mark_success(
        &self,
        db: &mut dyn Dialect,
        rank: i64,
        execution_time_ms: i64,
    ) -> Result<(), Error> {
        let sql = format!(
            "UPDATE {} SET success = {}, execution_time = {} WHERE installed_rank = {}",
            self.table.quoted(&*db),
            db.placeholder(1),
            db.placeholder(2),
            db.placeholder(3),
        );
        let updated = db.execute(
            &sql,
            &[true.into(), execution_time_ms.into(), rank.into()],
        )?;
        if updated != 1 {
            return Err(Error::Generic(format!(
                "Expected to mark rank {} in {} as successful but {} rows matched",
                rank, self.table, updated
            )));
        }
        Ok(())
    }

    pub(crate) fn has_schema_marker(&self, db: &mut dyn Dialect) -> Result<bool, Error> {
        if !self.exists(db)? {
            return Ok(false);
        }
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE type = {}",
            self.table.quoted(&*db),
            db.placeholder(1)
        );
        let rows = db.query(&sql, &[MigrationKind::SchemaMarker.as_str().into()])?;
        match rows.first() {
            Some(row) => Ok(row.get_i64(0)? > 0),
            None => Ok(false),
        }
    }

    /// Record that `schemas` were created by the migrator and may be dropped
    /// by clean. Written at most once.
    pub(crate) fn insert_schema_marker(
        &self,
        db: &mut dyn Dialect,
        schemas: &[String],
        installed_by: &str,
        installed_on: DateTime<Utc>,
    ) -> Result<(), Error> {
        if self.has_schema_marker(db)? {
            return Ok(());
        }
        self.insert(
            db,
            vec![
                0i64.into(),
                SqlValue::Null,
                SCHEMA_MARKER_DESCRIPTION.into(),
                MigrationKind::SchemaMarker.as_str().into(),
                schemas.join(",").into(),
                SqlValue::Null,
                installed_by.into(),
                installed_on.to_rfc3339().into(),
                0i64.into(),
                true.into(),
            ],
        )
    }

    /// Remove every `success = false` row, returning how many went.
    pub(crate) fn delete_failed(&self, db: &mut dyn Dialect) -> Result<u64, Error> {
        let sql = format!(
            "DELETE FROM {} WHERE success = {}",
            self.table.quoted(&*db),
            db.placeholder(1)
        );
        db.execute(&sql, &[false.into()])
    }

    pub(crate) fn update_checksum(
        &self,
        db: &mut dyn Dialect,
        rank: i64,
        checksum: &str,
    ) -> Result<(), Error> {
        let sql = format!(
            "UPDATE {} SET checksum = {} WHERE installed_rank = {}",
            self.table.quoted(&*db),
            db.placeholder(1),
            db.placeholder(2),
        );
        db.execute(&sql, &[checksum.into(), rank.into()])?;
        Ok(())
    }

    fn insert(&self, db: &mut dyn Dialect, values: Vec<SqlValue>) -> Result<(), Error> {
        let placeholders = (1..=values.len())
            .map(|i| db.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table.quoted(&*db),
            COLUMNS,
            placeholders
        );
        db.execute(&sql, &values)?;
        Ok(())
    }
}

fn parse_record(row: &Row) -> Result<AppliedMigrationRecord, Error> {
    let version = row.get_opt_text(1)?.map(|v| v.parse::<MigrationVersion>()).transpose()?;
    let installed_on = row.get_text(7)?;
    let installed_on = DateTime::parse_from_rfc3339(&installed_on)
        .map_err(|e| {
            Error::Generic(format!(
                "Invalid installed_on '{}' in metadata table: {}",
                installed_on, e
            ))
        })?
        .with_timezone(&Utc);
    Ok(AppliedMigrationRecord {
        installed_rank: row.get_i64(0)?,
        version,
        description: row.get_text(2)?,
        kind: MigrationKind::parse(&row.get_text(3)?)?,
        script: row.get_text(4)?,
        checksum: row.get_opt_text(5)?,
        installed_by: row.get_text(6)?,
        installed_on,
        execution_time_ms: row.get_i64(8)?,
        success: row.get_bool(9)?,
    })
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::sqlite::SqliteDialect;

    fn table(db: &mut SqliteDialect) -> MetadataTable {
        let metadata = MetadataTable::new(TableName::new("main", "strata_schema_history"));
        metadata.create(db).unwrap();
        metadata
    }

    #[test]
    fn absent_table_reads_as_empty() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let metadata = MetadataTable::new(TableName::new("main", "strata_schema_history"));
        assert!(!metadata.exists(&mut db).unwrap());
        assert!(metadata.load(&mut db).unwrap().is_empty());
        assert!(!metadata.has_schema_marker(&mut db).unwrap());
    }

    #[test]
    fn pending_row_then_success() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let metadata = table(&mut db);
        let migration =
            MigrationDescriptor::sql("1.5", "add email", "ALTER TABLE users ADD email TEXT")
                .unwrap();

        assert_eq!(metadata.next_rank(&mut db).unwrap(), 1);
        metadata
            .insert_pending(&mut db, 1, &migration, "tester", Utc::now())
            .unwrap();
        assert_eq!(metadata.next_rank(&mut db).unwrap(), 2);

        let records = metadata.load(&mut db).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert_eq!(records[0].version, Some("1.5".parse().unwrap()));
        assert_eq!(records[0].kind, MigrationKind::Sql);
        assert_eq!(records[0].script, "V1.5__add_email.sql");
        assert_eq!(records[0].checksum.as_deref(), Some(migration.checksum()));
        assert_eq!(records[0].installed_by, "tester");

        metadata.mark_success(&mut db, 1, 42).unwrap();
        let records = metadata.load(&mut db).unwrap();
        assert!(records[0].success);
        assert_eq!(records[0].execution_time_ms, 42);

        assert!(metadata.mark_success(&mut db, 7, 1).is_err());
    }

    #[test]
    fn successful_versions_are_unique() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let metadata = table(&mut db);
        let migration = MigrationDescriptor::sql("1", "init", "SELECT 1").unwrap();

        metadata
            .insert_pending(&mut db, 1, &migration, "a", Utc::now())
            .unwrap();
        metadata.mark_success(&mut db, 1, 0).unwrap();
        metadata
            .insert_pending(&mut db, 2, &migration, "b", Utc::now())
            .unwrap();
        assert!(metadata.mark_success(&mut db, 2, 0).is_err());
    }

    #[test]
    fn schema_marker_is_written_once() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let metadata = table(&mut db);
        let schemas = vec!["main".to_string()];
        metadata
            .insert_schema_marker(&mut db, &schemas, "tester", Utc::now())
            .unwrap();
        metadata
            .insert_schema_marker(&mut db, &schemas, "tester", Utc::now())
            .unwrap();

        assert!(metadata.has_schema_marker(&mut db).unwrap());
        let records = metadata.load(&mut db).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].installed_rank, 0);
        assert!(records[0].is_schema_marker());
        assert_eq!(records[0].description, "<< Schema Creation >>");
        assert_eq!(records[0].script, "main");
        assert_eq!(metadata.next_rank(&mut db).unwrap(), 1);
    }

    #[test]
    fn repair_helpers() {
        let mut db = SqliteDialect::open_in_memory().unwrap();
        let metadata = table(&mut db);
        let ok = MigrationDescriptor::sql("1", "ok", "SELECT 1").unwrap();
        let failed = MigrationDescriptor::sql("2", "failed", "SELECT 2").unwrap();
        metadata
            .insert_pending(&mut db, 1, &ok, "t", Utc::now())
            .unwrap();
        metadata.mark_success(&mut db, 1, 0).unwrap();
        metadata
            .insert_pending(&mut db, 2, &failed, "t", Utc::now())
            .unwrap();

        assert_eq!(metadata.delete_failed(&mut db).unwrap(), 1);
        metadata.update_checksum(&mut db, 1, "abc").unwrap();

        let records = metadata.load(&mut db).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].checksum.as_deref(), Some("abc"));
    }
}
