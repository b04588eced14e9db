//! Command line runner for strata migrations.
//!
//! Resolves `V<version>__<description>.sql` and `R__<description>.sql` scripts
//! from one or more directories and applies them to a SQLite file or a
//! PostgreSQL database.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use strata::{Config, Dialect, DirectorySource, MigrationInfo, Migrator};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata", version, about = "Exactly-once schema migrations")]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,

    /// Database to migrate: a SQLite file path or a postgres:// URL
    #[arg(long, env = "STRATA_URL", global = true)]
    url: Option<String>,

    /// Directories to load migration scripts from
    #[arg(long, env = "STRATA_LOCATIONS", value_delimiter = ',', global = true)]
    locations: Vec<PathBuf>,

    /// YAML file with migrator settings
    #[arg(long, env = "STRATA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Name of the schema history table
    #[arg(long, env = "STRATA_TABLE", global = true)]
    table: Option<String>,

    /// Schemas to manage; the first one holds the history table
    #[arg(long, env = "STRATA_SCHEMAS", value_delimiter = ',', global = true)]
    schemas: Vec<String>,

    /// Directory holding the database files of SQLite schemas other than main
    #[arg(long, env = "STRATA_SCHEMA_DIR", global = true)]
    schema_dir: Option<PathBuf>,

    /// Apply pending migrations below the highest applied version
    #[arg(long, env = "STRATA_OUT_OF_ORDER", global = true)]
    out_of_order: bool,

    /// Do not fail on applied migrations that can no longer be found
    #[arg(long, env = "STRATA_IGNORE_MISSING", global = true)]
    ignore_missing: bool,

    /// Seconds to wait for the migration lock; 0 fails immediately
    #[arg(long, env = "STRATA_LOCK_TIMEOUT", global = true)]
    lock_timeout: Option<u64>,
}

#[derive(clap::Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Apply all pending migrations
    Migrate,
    /// Compare resolved migrations with the schema history
    Validate,
    /// Drop or empty every managed schema
    Clean,
    /// Show every migration and its state
    Info,
    /// Remove failed records and realign checksums
    Repair,
}

/// The configuration file: migrator settings plus where to find things.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    url: Option<String>,
    locations: Vec<PathBuf>,
    schema_dir: Option<PathBuf>,
    #[serde(flatten)]
    migrator: Config,
}

/// Everything needed to run one command, after merging file and flags.
#[derive(Debug)]
struct Settings {
    url: String,
    locations: Vec<PathBuf>,
    schema_dir: Option<PathBuf>,
    config: Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(CliArgs::parse()) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> anyhow::Result<()> {
    let command = args.command;
    let settings = resolve_settings(args)?;
    let source = settings
        .locations
        .iter()
        .skip(1)
        .fold(DirectorySource::new(&settings.locations[0]), |source, location| {
            source.with_location(location)
        });
    let migrator = Migrator::from_source(source).with_config(settings.config);
    let mut db = connect(&settings.url, settings.schema_dir.as_deref())?;
    let db = db.as_mut();

    match command {
        Commands::Migrate => {
            let result = migrator.migrate(db)?;
            for schema in &result.schemas_created {
                println!("Created schema {}", schema);
            }
            if result.applied_count == 0 {
                println!("Schema is up to date. No migration necessary.");
            } else {
                for version in &result.applied_versions {
                    let note = if result.out_of_order.contains(version) {
                        " (out of order)"
                    } else {
                        ""
                    };
                    println!("  applied {}{}", version, note);
                }
                for description in &result.applied_repeatables {
                    println!("  applied repeatable {}", description);
                }
                println!(
                    "Successfully applied {} migration(s) in {} ms",
                    result.applied_count,
                    result.duration.as_millis()
                );
            }
        }
        Commands::Validate => {
            let result = migrator.validate(db)?;
            if !result.is_valid() {
                for error in &result.errors {
                    eprintln!("  {}", error);
                }
                bail!("validation failed with {} error(s)", result.errors.len());
            }
            println!("Successfully validated {} migration(s)", result.validated_count);
        }
        Commands::Clean => {
            let result = migrator.clean(db)?;
            for schema in &result.schemas_dropped {
                println!("Dropped schema {}", schema);
            }
            for schema in &result.schemas_cleaned {
                println!("Cleaned schema {}", schema);
            }
            if !result.is_complete() {
                for failure in &result.failures {
                    eprintln!("  {}", failure);
                }
                bail!("{} schema(s) could not be cleaned", result.failures.len());
            }
        }
        Commands::Info => {
            print!("{}", render_info(&migrator.info(db)?));
        }
        Commands::Repair => {
            let result = migrator.repair(db)?;
            for record in &result.removed_failed {
                let version = record
                    .version
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                println!("Removed failed migration {} {}", version, record.description);
            }
            for version in &result.realigned {
                println!("Realigned checksum of {}", version);
            }
            if result.removed_failed.is_empty() && result.realigned.is_empty() {
                println!("Nothing to repair.");
            }
        }
    }
    Ok(())
}

/// Merge the optional config file with command line and environment values,
/// which win.
fn resolve_settings(args: CliArgs) -> anyhow::Result<Settings> {
    let file = match &args.config {
        Some(path) => load_config(path)?,
        None => FileConfig::default(),
    };

    let mut config = file.migrator;
    if let Some(table) = args.table {
        config.table = table;
    }
    if !args.schemas.is_empty() {
        config.schemas = args.schemas;
    }
    config.allow_out_of_order |= args.out_of_order;
    config.ignore_missing_migrations |= args.ignore_missing;
    if let Some(secs) = args.lock_timeout {
        config.lock.wait_timeout_secs = (secs > 0).then_some(secs);
    }

    let Some(url) = args.url.or(file.url) else {
        bail!("no database given; pass --url or set STRATA_URL");
    };
    let locations = if !args.locations.is_empty() {
        args.locations
    } else if !file.locations.is_empty() {
        file.locations
    } else {
        vec![PathBuf::from("migrations")]
    };

    Ok(Settings {
        url,
        locations,
        schema_dir: args.schema_dir.or(file.schema_dir),
        config,
    })
}

fn load_config(path: &Path) -> anyhow::Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}

fn is_postgres_url(url: &str) -> bool {
    url.starts_with("postgres://") || url.starts_with("postgresql://")
}

/// The file path of a SQLite URL, which may also be a bare path.
fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

fn connect(url: &str, schema_dir: Option<&Path>) -> anyhow::Result<Box<dyn Dialect>> {
    if is_postgres_url(url) {
        #[cfg(feature = "postgres")]
        {
            let db = strata::postgres::PostgresDialect::connect(url)
                .context("connecting to PostgreSQL")?;
            return Ok(Box::new(db));
        }
        #[cfg(not(feature = "postgres"))]
        bail!("this build of strata has no PostgreSQL support; rebuild with the `postgres` feature");
    }

    #[cfg(feature = "sqlite")]
    {
        let path = sqlite_path(url);
        let mut db = strata::sqlite::SqliteDialect::open(path)
            .with_context(|| format!("opening SQLite database {}", path))?;
        if let Some(dir) = schema_dir {
            db = db.with_schema_dir(dir);
        }
        Ok(Box::new(db))
    }
    #[cfg(not(feature = "sqlite"))]
    {
        let _ = schema_dir;
        bail!("this build of strata has no SQLite support; rebuild with the `sqlite` feature")
    }
}

fn render_info(infos: &[MigrationInfo]) -> String {
    if infos.is_empty() {
        return "No migrations found.\n".to_string();
    }
    let header = ["Version", "Description", "Type", "State", "Rank", "Installed on"];
    let rows: Vec<[String; 6]> = infos
        .iter()
        .map(|info| {
            [
                info.version.as_ref().map(|v| v.to_string()).unwrap_or_default(),
                info.description.clone(),
                info.kind.to_string(),
                info.state.to_string(),
                info.installed_rank.map(|r| r.to_string()).unwrap_or_default(),
                info.installed_on
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default(),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: &[String]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        format!("| {} |\n", padded.join(" | "))
    };
    let separator = format!(
        "+{}+\n",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut out = separator.clone();
    out.push_str(&line(&header.map(String::from)));
    out.push_str(&separator);
    for row in &rows {
        out.push_str(&line(row));
    }
    out.push_str(&separator);
    out
}
