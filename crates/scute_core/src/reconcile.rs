use std::collections::HashSet;

use anyhow::Result;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::catalog;
use crate::installed;
use crate::runtime::ResolvedPaths;
use crate::scan::{self, normalize_source_url};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub found: usize,
    pub removed: usize,
}

/// Make the installed table agree with what is actually on disk.
///
/// Folders discovered under the add-on root become new records (identity
/// resolved through the catalog, folder name as the fallback); records whose
/// stored path vanished are soft-deleted; a catalog-matched folder whose
/// extracted remote URL disagrees with the stored one gets its location
/// repaired in place. Rows are committed as they are written; a failure
/// mid-pass leaves the earlier rows in place.
pub fn reconcile(connection: &Connection, paths: &ResolvedPaths) -> Result<ReconcileReport> {
    let url_index = catalog::url_index(connection)?;
    let alias_index = catalog::alias_index(connection)?;
    let scans = scan::scan_addons_dir(&paths.addons_dir)?;
    let existing = installed::installed_by_key(connection)?;

    let mut report = ReconcileReport::default();
    let mut seen: HashSet<String> = existing.keys().cloned().collect();

    for folder in &scans {
        let matched = scan::resolve_identity(folder, &url_index, &alias_index);
        let identity = matched
            .clone()
            .unwrap_or_else(|| folder.folder_name.clone());
        let key = identity.to_lowercase();

        if seen.insert(key.clone()) {
            installed::insert_discovered(
                connection,
                &identity,
                &folder.path,
                folder.source_url.as_deref(),
            )?;
            report.found += 1;
            info!(
                "discovered add-on {identity} (folder {})",
                folder.folder_name
            );
            continue;
        }

        // Location repair only applies to folders the catalog recognizes and
        // only when the observed remote disagrees with the stored one.
        let (Some(record), Some(observed_url), Some(_)) =
            (existing.get(&key), folder.source_url.as_deref(), matched)
        else {
            continue;
        };
        let stored = record
            .source_url
            .as_deref()
            .map(normalize_source_url)
            .unwrap_or_default();
        if stored != normalize_source_url(observed_url) {
            installed::update_location(connection, &record.name, &folder.path, Some(observed_url))?;
            info!("repaired location of {} from observed checkout", record.name);
        }
    }

    for record in installed::list_installed(connection)? {
        if record.path.exists() {
            continue;
        }
        if installed::soft_delete(connection, &record.name)? {
            report.removed += 1;
            debug!("{} vanished from disk; record soft-deleted", record.name);
        }
    }

    Ok(report)
}
