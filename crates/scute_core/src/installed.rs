use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::runtime::normalize_for_display;
use crate::store::unix_timestamp;

/// What the store believes is on disk. The filesystem stays the source of
/// truth for existence; the reconciler keeps the two in agreement.
#[derive(Debug, Clone)]
pub struct InstalledRecord {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub installed_at_unix: i64,
    pub last_update_unix: Option<i64>,
    pub enabled: bool,
    pub source_url: Option<String>,
}

const RECORD_COLUMNS: &str =
    "name, version, path, installed_at_unix, last_update_unix, enabled, source_url";

/// Live records in stable name order. Batch operations iterate this snapshot.
pub fn list_installed(connection: &Connection) -> Result<Vec<InstalledRecord>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM installed
             WHERE deleted_at_unix IS NULL
             ORDER BY lower(name) ASC"
        ))
        .context("failed to prepare installed list query")?;
    let rows = statement
        .query_map([], record_from_row)
        .context("failed to run installed list query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to decode installed row")?);
    }
    Ok(out)
}

/// Live records keyed by lowercase name.
pub fn installed_by_key(connection: &Connection) -> Result<HashMap<String, InstalledRecord>> {
    let mut out = HashMap::new();
    for record in list_installed(connection)? {
        out.insert(record.name.to_lowercase(), record);
    }
    Ok(out)
}

/// Case-insensitive lookup of one live record.
pub fn find_installed(connection: &Connection, name: &str) -> Result<Option<InstalledRecord>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM installed
             WHERE lower(name) = lower(?1) AND deleted_at_unix IS NULL
             LIMIT 1"
        ))
        .context("failed to prepare installed lookup")?;
    statement
        .query_row([name.trim()], record_from_row)
        .optional()
        .with_context(|| format!("failed to look up installed record {name}"))
}

/// Upsert written by the install engine: refresh an existing live record or
/// create a new one (enabled by default).
pub fn mark_installed(
    connection: &Connection,
    name: &str,
    version: &str,
    source_url: Option<&str>,
    path: &Path,
) -> Result<()> {
    let now = unix_timestamp()?;
    let existing_id: Option<i64> = connection
        .query_row(
            "SELECT id FROM installed
             WHERE lower(name) = lower(?1) AND deleted_at_unix IS NULL
             LIMIT 1",
            [name],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to look up installed record {name}"))?;

    match existing_id {
        Some(id) => {
            connection
                .execute(
                    "UPDATE installed
                     SET version = ?1, path = ?2, source_url = ?3, last_update_unix = ?4
                     WHERE id = ?5",
                    params![version, normalize_for_display(path), source_url, now, id],
                )
                .with_context(|| format!("failed to refresh installed record {name}"))?;
        }
        None => {
            connection
                .execute(
                    "INSERT INTO installed (name, version, path, installed_at_unix, enabled, source_url)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    params![name, version, normalize_for_display(path), now, source_url],
                )
                .with_context(|| format!("failed to insert installed record {name}"))?;
        }
    }
    Ok(())
}

/// Record created by the reconciler for a folder it discovered on disk.
pub fn insert_discovered(
    connection: &Connection,
    name: &str,
    path: &Path,
    source_url: Option<&str>,
) -> Result<()> {
    connection
        .execute(
            "INSERT INTO installed (name, version, path, installed_at_unix, enabled, source_url)
             VALUES (?1, 'unknown', ?2, ?3, 1, ?4)",
            params![name, normalize_for_display(path), unix_timestamp()?, source_url],
        )
        .with_context(|| format!("failed to record discovered add-on {name}"))?;
    Ok(())
}

/// Soft-delete the live record. Returns false when nothing matched.
pub fn soft_delete(connection: &Connection, name: &str) -> Result<bool> {
    let changed = connection
        .execute(
            "UPDATE installed SET deleted_at_unix = ?1
             WHERE lower(name) = lower(?2) AND deleted_at_unix IS NULL",
            params![unix_timestamp()?, name.trim()],
        )
        .with_context(|| format!("failed to soft-delete installed record {name}"))?;
    Ok(changed > 0)
}

pub fn set_enabled(connection: &Connection, name: &str, enabled: bool) -> Result<bool> {
    let changed = connection
        .execute(
            "UPDATE installed SET enabled = ?1
             WHERE lower(name) = lower(?2) AND deleted_at_unix IS NULL",
            params![i64::from(enabled), name.trim()],
        )
        .with_context(|| format!("failed to set enabled flag for {name}"))?;
    Ok(changed > 0)
}

pub fn update_version(connection: &Connection, name: &str, version: &str) -> Result<bool> {
    let changed = connection
        .execute(
            "UPDATE installed SET version = ?1, last_update_unix = ?2
             WHERE lower(name) = lower(?3) AND deleted_at_unix IS NULL",
            params![version, unix_timestamp()?, name.trim()],
        )
        .with_context(|| format!("failed to update version for {name}"))?;
    Ok(changed > 0)
}

/// Repair the stored location after the reconciler observed the add-on
/// elsewhere on disk (manual move, re-clone under a different remote).
pub fn update_location(
    connection: &Connection,
    name: &str,
    path: &Path,
    source_url: Option<&str>,
) -> Result<bool> {
    let changed = connection
        .execute(
            "UPDATE installed SET path = ?1, source_url = ?2
             WHERE lower(name) = lower(?3) AND deleted_at_unix IS NULL",
            params![normalize_for_display(path), source_url, name.trim()],
        )
        .with_context(|| format!("failed to update location for {name}"))?;
    Ok(changed > 0)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<InstalledRecord> {
    let path: String = row.get(2)?;
    let enabled: i64 = row.get(5)?;
    Ok(InstalledRecord {
        name: row.get(0)?,
        version: row.get(1)?,
        path: PathBuf::from(path),
        installed_at_unix: row.get(3)?,
        last_update_unix: row.get(4)?,
        enabled: enabled != 0,
        source_url: row.get(6)?,
    })
}
