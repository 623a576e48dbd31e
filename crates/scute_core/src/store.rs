use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::runtime::ResolvedPaths;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/v001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "indexes",
        sql: include_str!("migrations/v002_indexes.sql"),
    },
];

/// Report returned after running migrations.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Open the store at `paths.db_path`, creating the database and applying any
/// pending migrations. This is the single entry point every command uses.
pub fn open_store(paths: &ResolvedPaths) -> Result<Connection> {
    ensure_db_parent(paths)?;
    let connection = open_connection(&paths.db_path)?;
    apply_pending_migrations(&connection)?;
    Ok(connection)
}

/// Run all pending migrations and report what was applied.
pub fn run_migrations(paths: &ResolvedPaths) -> Result<MigrateReport> {
    ensure_db_parent(paths)?;
    let connection = open_connection(&paths.db_path)?;
    let applied = apply_pending_migrations(&connection)?;
    let current_version = current_version(&connection)?;
    Ok(MigrateReport {
        applied,
        current_version,
    })
}

/// Returns the number of migrations that have not yet been applied.
pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    if !paths.db_path.exists() {
        return Ok(MIGRATIONS.len());
    }
    let connection = open_connection(&paths.db_path)?;
    ensure_schema_migrations_table(&connection)?;
    let current = current_version(&connection)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).count())
}

pub fn get_setting(connection: &Connection, key: &str) -> Result<Option<String>> {
    connection
        .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("failed to read setting {key}"))
}

pub fn set_setting(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection
        .execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .with_context(|| format!("failed to write setting {key}"))?;
    Ok(())
}

/// Append one row to the audit log. Failures here are reported, never fatal
/// to the operation being logged.
pub fn log_event(
    connection: &Connection,
    kind: &str,
    subject: Option<&str>,
    details: Option<Value>,
) -> Result<()> {
    let details_json = match details {
        Some(value) => Some(serde_json::to_string(&value).context("failed to encode event details")?),
        None => None,
    };
    connection
        .execute(
            "INSERT INTO events (ts_unix, kind, subject, details_json) VALUES (?1, ?2, ?3, ?4)",
            params![unix_timestamp()?, kind, subject, details_json],
        )
        .with_context(|| format!("failed to log {kind} event"))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct EventRow {
    pub ts_unix: i64,
    pub kind: String,
    pub subject: Option<String>,
    pub details_json: Option<String>,
}

pub fn recent_events(connection: &Connection, limit: usize) -> Result<Vec<EventRow>> {
    let limit_i64 = i64::try_from(limit).context("event limit does not fit into i64")?;
    let mut statement = connection
        .prepare(
            "SELECT ts_unix, kind, subject, details_json
             FROM events
             ORDER BY ts_unix DESC, id DESC
             LIMIT ?1",
        )
        .context("failed to prepare events query")?;
    let rows = statement
        .query_map([limit_i64], |row| {
            Ok(EventRow {
                ts_unix: row.get(0)?,
                kind: row.get(1)?,
                subject: row.get(2)?,
                details_json: row.get(3)?,
            })
        })
        .context("failed to run events query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode event row")?);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct StoreStats {
    pub catalog_rows: usize,
    pub catalog_active: usize,
    pub installed_rows: usize,
    pub installed_active: usize,
    pub event_rows: usize,
    pub schema_version: u32,
}

pub fn load_store_stats(connection: &Connection) -> Result<StoreStats> {
    Ok(StoreStats {
        catalog_rows: count_query(connection, "SELECT COUNT(*) FROM addons")?,
        catalog_active: count_query(
            connection,
            "SELECT COUNT(*) FROM addons WHERE deleted_at_unix IS NULL",
        )?,
        installed_rows: count_query(connection, "SELECT COUNT(*) FROM installed")?,
        installed_active: count_query(
            connection,
            "SELECT COUNT(*) FROM installed WHERE deleted_at_unix IS NULL",
        )?,
        event_rows: count_query(connection, "SELECT COUNT(*) FROM events")?,
        schema_version: current_version(connection)?,
    })
}

pub fn unix_timestamp() -> Result<i64> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(secs).context("timestamp does not fit into i64")
}

fn apply_pending_migrations(connection: &Connection) -> Result<Vec<AppliedMigration>> {
    ensure_schema_migrations_table(connection)?;
    let current = current_version(connection)?;

    let mut applied = Vec::new();
    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }
    Ok(applied)
}

fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    connection
        .execute_batch("SAVEPOINT migration_apply")
        .context("failed to create savepoint")?;

    let result = (|| -> Result<()> {
        connection
            .execute_batch(migration.sql)
            .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;
        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![i64::from(migration.version), migration.name, unix_timestamp()?],
            )
            .context("failed to record migration")?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            connection
                .execute_batch("RELEASE SAVEPOINT migration_apply")
                .context("failed to release savepoint")?;
            Ok(())
        }
        Err(err) => {
            let _ = connection.execute_batch("ROLLBACK TO SAVEPOINT migration_apply");
            let _ = connection.execute_batch("RELEASE SAVEPOINT migration_apply");
            Err(err)
        }
    }
}

fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current migration version")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn ensure_db_parent(paths: &ResolvedPaths) -> Result<()> {
    let parent = paths
        .db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", paths.db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

pub fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use crate::runtime::{ResolvedPaths, ValueSource};

    /// Builds a game layout under a tempdir and resolved paths over it.
    pub fn test_paths() -> (TempDir, ResolvedPaths) {
        let temp = tempfile::tempdir().expect("tempdir");
        let game_root = temp.path().join("game");
        let paths = paths_for(&game_root);
        fs::create_dir_all(&paths.addons_dir).expect("create addons dir");
        fs::create_dir_all(&paths.data_dir).expect("create data dir");
        (temp, paths)
    }

    pub fn paths_for(game_root: &Path) -> ResolvedPaths {
        let addons_dir = game_root.join("Interface").join("AddOns");
        let state_dir = game_root.join(".scute");
        let data_dir = state_dir.join("data");
        ResolvedPaths {
            staging_dir: addons_dir.join(".repos"),
            db_path: data_dir.join("scute.db"),
            config_path: state_dir.join("config.toml"),
            game_root: game_root.to_path_buf(),
            addons_dir,
            state_dir,
            data_dir,
            root_source: ValueSource::Flag,
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::test_paths;
    use super::*;

    #[test]
    fn migrations_apply_on_fresh_db() {
        let (_temp, paths) = test_paths();
        let report = run_migrations(&paths).expect("run_migrations");
        assert_eq!(report.applied.len(), MIGRATIONS.len());
        assert_eq!(report.current_version, 2);
    }

    #[test]
    fn migrations_are_idempotent() {
        let (_temp, paths) = test_paths();
        let first = run_migrations(&paths).expect("first run");
        assert_eq!(first.applied.len(), MIGRATIONS.len());

        let second = run_migrations(&paths).expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.current_version, 2);
    }

    #[test]
    fn pending_count_tracks_migrations() {
        let (_temp, paths) = test_paths();
        assert_eq!(
            pending_migration_count(&paths).expect("pending"),
            MIGRATIONS.len()
        );
        run_migrations(&paths).expect("run_migrations");
        assert_eq!(pending_migration_count(&paths).expect("pending"), 0);
    }

    #[test]
    fn settings_roundtrip() {
        let (_temp, paths) = test_paths();
        let connection = open_store(&paths).expect("open store");

        assert!(get_setting(&connection, "catalog_revision_id")
            .expect("get")
            .is_none());
        set_setting(&connection, "catalog_revision_id", "12345").expect("set");
        assert_eq!(
            get_setting(&connection, "catalog_revision_id").expect("get"),
            Some("12345".to_string())
        );
        set_setting(&connection, "catalog_revision_id", "12346").expect("overwrite");
        assert_eq!(
            get_setting(&connection, "catalog_revision_id").expect("get"),
            Some("12346".to_string())
        );
    }

    #[test]
    fn events_are_appended_and_listed_newest_first() {
        let (_temp, paths) = test_paths();
        let connection = open_store(&paths).expect("open store");

        log_event(&connection, "sync_complete", None, None).expect("log");
        log_event(
            &connection,
            "addon_installed",
            Some("Foo"),
            Some(serde_json::json!({"version": "1.2"})),
        )
        .expect("log");

        let events = recent_events(&connection, 10).expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "addon_installed");
        assert_eq!(events[0].subject.as_deref(), Some("Foo"));
        assert!(events[0]
            .details_json
            .as_deref()
            .expect("details")
            .contains("1.2"));
    }

    #[test]
    fn store_stats_count_rows() {
        let (_temp, paths) = test_paths();
        let connection = open_store(&paths).expect("open store");
        log_event(&connection, "sync_complete", None, None).expect("log");

        let stats = load_store_stats(&connection).expect("stats");
        assert_eq!(stats.catalog_rows, 0);
        assert_eq!(stats.installed_rows, 0);
        assert_eq!(stats.event_rows, 1);
        assert_eq!(stats.schema_version, 2);
    }
}
