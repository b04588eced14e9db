//! Where migrations come from.
//!
//! The engine only ever sees a flat list of [MigrationDescriptor]s. A
//! [MigrationSource] produces that list: either from code (a plain `Vec`) or
//! from SQL files on disk ([DirectorySource]).

use crate::core::{calculate_checksum, MigrationDescriptor, Script};
use crate::error::Error;
use crate::version::MigrationVersion;
use std::fs;
use std::path::{Path, PathBuf};

/// Produces the migrations available to apply.
pub trait MigrationSource {
    fn resolve_available(&self) -> Result<Vec<MigrationDescriptor>, Error>;
}

impl MigrationSource for Vec<MigrationDescriptor> {
    fn resolve_available(&self) -> Result<Vec<MigrationDescriptor>, Error> {
        Ok(self.clone())
    }
}

impl MigrationSource for [MigrationDescriptor] {
    fn resolve_available(&self) -> Result<Vec<MigrationDescriptor>, Error> {
        Ok(self.to_vec())
    }
}

/// Loads SQL migrations from one or more directories, recursively.
///
/// File names follow the usual convention:
/// - `V<version>__<description>.sql` for versioned migrations, e.g. `V1_5__add_email.sql`
/// - `R__<description>.sql` for repeatable migrations, e.g. `R__refresh_views.sql`
///
/// Underscores in the description become spaces. Files that match neither
/// pattern are ignored.
#[derive(Debug, Clone, Default)]
pub struct DirectorySource {
    locations: Vec<PathBuf>,
}

impl DirectorySource {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            locations: vec![location.into()],
        }
    }

    /// Also load migrations from `location`.
    pub fn with_location(mut self, location: impl Into<PathBuf>) -> Self {
        self.locations.push(location.into());
        self
    }

    pub fn locations(&self) -> &[PathBuf] {
        &self.locations
    }

    fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), Error> {
        let entries = fs::read_dir(dir).map_err(|e| Error::Source {
            location: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_files(&path, files)?;
            } else if path.extension().is_some_and(|ext| ext == "sql") {
                files.push(path);
            }
        }
        Ok(())
    }

    fn load_file(path: &Path) -> Result<Option<MigrationDescriptor>, Error> {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some((version, description)) = parse_file_name(file_name).map_err(|reason| {
            Error::Source {
                location: path.display().to_string(),
                reason,
            }
        })?
        else {
            return Ok(None);
        };
        let sql = fs::read_to_string(path).map_err(|e| Error::Source {
            location: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let checksum = calculate_checksum(&sql);
        Ok(Some(MigrationDescriptor::from_parts(
            version,
            description,
            checksum,
            Script::Sql {
                name: file_name.to_string(),
                sql,
            },
        )))
    }
}

impl MigrationSource for DirectorySource {
    fn resolve_available(&self) -> Result<Vec<MigrationDescriptor>, Error> {
        let mut files = Vec::new();
        for location in &self.locations {
            Self::collect_files(location, &mut files)?;
        }
        files.sort();

        let mut migrations = Vec::with_capacity(files.len());
        for file in files {
            if let Some(migration) = Self::load_file(&file)? {
                migrations.push(migration);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            count = migrations.len(),
            locations = ?self.locations,
            "Loaded migrations from disk"
        );

        Ok(migrations)
    }
}

/// Split a migration file name into its version and description.
/// `Ok(None)` means the file is not a migration at all.
fn parse_file_name(file_name: &str) -> Result<Option<(Option<MigrationVersion>, String)>, String> {
    let Some(stem) = file_name.strip_suffix(".sql") else {
        return Ok(None);
    };
    let (version, description) = if let Some(rest) = stem.strip_prefix("R__") {
        (None, rest)
    } else if let Some(rest) = stem.strip_prefix('V') {
        let Some((version, description)) = rest.split_once("__") else {
            return Err("expected V<version>__<description>.sql".to_string());
        };
        let version = version.parse().map_err(|e: Error| e.to_string())?;
        (Some(version), description)
    } else {
        return Ok(None);
    };
    if description.is_empty() {
        return Err("migration description is empty".to_string());
    }
    Ok(Some((version, description.replace('_', " "))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_versioned_and_repeatable_names() {
        assert_eq!(
            parse_file_name("V1_5__add_email.sql").unwrap(),
            Some((Some("1.5".parse().unwrap()), "add email".to_string()))
        );
        assert_eq!(
            parse_file_name("V2024.01.15__init.sql").unwrap(),
            Some((Some("2024.1.15".parse().unwrap()), "init".to_string()))
        );
        assert_eq!(
            parse_file_name("R__refresh_views.sql").unwrap(),
            Some((None, "refresh views".to_string()))
        );
        assert_eq!(parse_file_name("README.md").unwrap(), None);
        assert_eq!(parse_file_name("seed.sql").unwrap(), None);
        assert!(parse_file_name("V1_add_email.sql").is_err());
        assert!(parse_file_name("Vx__bad.sql").is_err());
        assert!(parse_file_name("V3__.sql").is_err());
    }

    #[test]
    fn loads_directories_recursively() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(
            dir.path().join("V1__create_users.sql"),
            "CREATE TABLE users (id INTEGER PRIMARY KEY);",
        )
        .unwrap();
        fs::write(
            dir.path().join("nested").join("V2__add_email.sql"),
            "ALTER TABLE users ADD COLUMN email TEXT;",
        )
        .unwrap();
        fs::write(
            dir.path().join("R__user_view.sql"),
            "CREATE VIEW IF NOT EXISTS user_emails AS SELECT email FROM users;",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "not a migration").unwrap();

        let mut migrations = DirectorySource::new(dir.path()).resolve_available().unwrap();
        migrations.sort_by(|a, b| a.apply_order(b));

        let described: Vec<(Option<String>, &str)> = migrations
            .iter()
            .map(|m| (m.version().map(|v| v.to_string()), m.description()))
            .collect();
        assert_eq!(
            described,
            vec![
                (Some("1".to_string()), "create users"),
                (Some("2".to_string()), "add email"),
                (None, "user view"),
            ]
        );
        assert_eq!(
            migrations[0].checksum(),
            calculate_checksum("CREATE TABLE users (id INTEGER PRIMARY KEY);")
        );
        assert_eq!(migrations[1].script_name(), "V2__add_email.sql");
    }

    #[test]
    fn missing_directory_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirectorySource::new(dir.path().join("does-not-exist"));
        assert!(matches!(
            source.resolve_available(),
            Err(Error::Source { .. })
        ));
    }
}
