use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::catalog::{CatalogUpsert, UpsertOutcome, upsert_addon};
use crate::store;

/// Settings key holding the last-seen upstream catalog-source revision id.
pub const CATALOG_REVISION_KEY: &str = "catalog_revision_id";

const DEFAULT_API_TIMEOUT_MS: u64 = 10_000;

/// One record produced by the catalog-sync collaborator (the wiki scraper
/// lives outside the core and hands over this shape, typically as JSON).
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSyncRecord {
    pub name: String,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub folder_aliases: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
    pub tags_merged: usize,
    pub skipped: usize,
}

/// Load collaborator records from their JSON exchange file.
pub fn load_records(path: &Path) -> Result<Vec<CatalogSyncRecord>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse catalog records from {}", path.display()))
}

/// Upsert a batch of collaborator records into the catalog. Blank names are
/// skipped with a warning; rows are committed as they are written.
pub fn apply_records(connection: &Connection, records: &[CatalogSyncRecord]) -> Result<SyncReport> {
    let mut report = SyncReport {
        total: records.len(),
        ..SyncReport::default()
    };

    for record in records {
        if record.name.trim().is_empty() {
            warn!("skipping catalog record with a blank name");
            report.skipped += 1;
            continue;
        }
        let outcome = upsert_addon(
            connection,
            &CatalogUpsert {
                name: &record.name,
                source_url: record.source_url.as_deref(),
                description: record.description.as_deref(),
                tags: &record.tags,
                folder_aliases: &record.folder_aliases,
            },
        )?;
        match outcome {
            UpsertOutcome::Inserted => report.inserted += 1,
            UpsertOutcome::Updated => report.updated += 1,
            UpsertOutcome::TagsMerged => report.tags_merged += 1,
        }
    }

    if let Err(error) = store::log_event(
        connection,
        "sync_complete",
        None,
        Some(json!({
            "total": report.total,
            "inserted": report.inserted,
            "updated": report.updated,
            "tags_merged": report.tags_merged,
        })),
    ) {
        warn!("failed to log sync event: {error:#}");
    }
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionCheck {
    /// Upstream page unchanged since the last stored revision.
    Unchanged { revision: String },
    Changed {
        current: String,
        previous: Option<String>,
    },
}

/// Compare the upstream catalog page's latest revision with the stored one.
/// Returns `None` when no catalog API is configured.
pub fn check_catalog_revision(
    connection: &Connection,
    api_url: Option<&str>,
    page: &str,
    user_agent: &str,
) -> Result<Option<RevisionCheck>> {
    let Some(api_url) = api_url else {
        return Ok(None);
    };
    let Some(current) = fetch_latest_revision(api_url, page, user_agent)? else {
        return Ok(None);
    };
    let stored = store::get_setting(connection, CATALOG_REVISION_KEY)?;
    Ok(Some(classify_revision(stored, current)))
}

pub fn store_catalog_revision(connection: &Connection, revision: &str) -> Result<()> {
    store::set_setting(connection, CATALOG_REVISION_KEY, revision)
}

fn classify_revision(stored: Option<String>, current: String) -> RevisionCheck {
    match stored {
        Some(previous) if previous == current => RevisionCheck::Unchanged { revision: current },
        previous => RevisionCheck::Changed {
            current,
            previous,
        },
    }
}

/// Latest revision id of the catalog page, through the MediaWiki API.
fn fetch_latest_revision(api_url: &str, page: &str, user_agent: &str) -> Result<Option<String>> {
    let client = Client::builder()
        .timeout(Duration::from_millis(api_timeout_ms()))
        .build()
        .context("failed to build catalog API client")?;

    let response = client
        .get(api_url)
        .header("User-Agent", user_agent.to_string())
        .query(&[
            ("action", "query"),
            ("prop", "revisions"),
            ("titles", page),
            ("rvprop", "ids|timestamp"),
            ("format", "json"),
            ("formatversion", "2"),
        ])
        .send()
        .with_context(|| format!("failed to query {api_url}"))?;
    let status = response.status();
    if !status.is_success() {
        bail!("HTTP {} from catalog API {}", status.as_u16(), api_url);
    }

    let payload: Value = response
        .json()
        .context("failed to decode catalog API JSON response")?;
    let revision_id = payload
        .get("query")
        .and_then(|value| value.get("pages"))
        .and_then(Value::as_array)
        .and_then(|pages| pages.first())
        .and_then(|page| page.get("revisions"))
        .and_then(Value::as_array)
        .and_then(|revisions| revisions.first())
        .and_then(|revision| revision.get("revid"))
        .and_then(Value::as_u64);
    Ok(revision_id.map(|id| id.to_string()))
}

fn api_timeout_ms() -> u64 {
    env::var("SCUTE_HTTP_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_API_TIMEOUT_MS)
}
