use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::scan::normalize_source_url;
use crate::store::unix_timestamp;

/// Lifecycle status of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddonStatus {
    Active,
    Broken,
    Missing,
    Unstable,
}

impl AddonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Broken => "broken",
            Self::Missing => "missing",
            Self::Unstable => "unstable",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "broken" => Ok(Self::Broken),
            "missing" => Ok(Self::Missing),
            "unstable" => Ok(Self::Unstable),
            other => bail!("unknown status: {other} (expected active|broken|missing|unstable)"),
        }
    }
}

/// Hosting service classification, derived from the source URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceHost {
    Github,
    Gitlab,
    Bitbucket,
    Other,
}

impl SourceHost {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
            Self::Other => "other",
        }
    }

    pub fn detect(source_url: Option<&str>) -> Self {
        let Some(url) = source_url else {
            return Self::Other;
        };
        let url = url.to_lowercase();
        if url.contains("github.com") {
            Self::Github
        } else if url.contains("gitlab.com") {
            Self::Gitlab
        } else if url.contains("bitbucket.org") {
            Self::Bitbucket
        } else {
            Self::Other
        }
    }
}

/// One known add-on, independent of whether it is installed.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub source_url: Option<String>,
    pub override_url: Option<String>,
    pub status: Option<AddonStatus>,
    pub host: SourceHost,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub folder_aliases: BTreeSet<String>,
    pub created_at_unix: i64,
    pub updated_at_unix: i64,
    pub deleted_at_unix: Option<i64>,
}

impl CatalogEntry {
    /// The URL installs use. An operator override always wins over the
    /// primary source URL.
    pub fn install_url(&self) -> Option<&str> {
        non_empty(self.override_url.as_deref()).or_else(|| non_empty(self.source_url.as_deref()))
    }
}

/// Input to the catalog upsert, shaped by the Catalog Sync collaborator.
#[derive(Debug, Clone)]
pub struct CatalogUpsert<'a> {
    pub name: &'a str,
    pub source_url: Option<&'a str>,
    pub description: Option<&'a str>,
    pub tags: &'a BTreeSet<String>,
    pub folder_aliases: &'a BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The row carries an operator override URL; resync only merges tags.
    TagsMerged,
}

pub fn upsert_addon(connection: &Connection, upsert: &CatalogUpsert<'_>) -> Result<UpsertOutcome> {
    let name = upsert.name.trim();
    if name.is_empty() {
        bail!("catalog entry name cannot be empty");
    }
    let now = unix_timestamp()?;

    let existing: Option<(i64, Option<String>, Option<String>)> = connection
        .query_row(
            "SELECT id, override_url, tags FROM addons
             WHERE lower(name) = lower(?1) AND deleted_at_unix IS NULL
             LIMIT 1",
            [name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .with_context(|| format!("failed to look up catalog entry {name}"))?;

    let Some((id, override_url, stored_tags)) = existing else {
        connection
            .execute(
                "INSERT INTO addons (
                    name, source_url, status, host, description, tags,
                    folder_aliases, created_at_unix, updated_at_unix
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    name,
                    upsert.source_url,
                    AddonStatus::Active.as_str(),
                    SourceHost::detect(upsert.source_url).as_str(),
                    upsert.description,
                    encode_set(upsert.tags)?,
                    encode_set(upsert.folder_aliases)?,
                    now,
                ],
            )
            .with_context(|| format!("failed to insert catalog entry {name}"))?;
        return Ok(UpsertOutcome::Inserted);
    };

    if non_empty(override_url.as_deref()).is_some() {
        let mut merged = decode_set(stored_tags.as_deref());
        merged.extend(upsert.tags.iter().cloned());
        connection
            .execute(
                "UPDATE addons SET tags = ?1, updated_at_unix = ?2 WHERE id = ?3",
                params![encode_set(&merged)?, now, id],
            )
            .with_context(|| format!("failed to merge tags for {name}"))?;
        return Ok(UpsertOutcome::TagsMerged);
    }

    connection
        .execute(
            "UPDATE addons SET
                source_url = ?1,
                host = ?2,
                description = ?3,
                tags = ?4,
                folder_aliases = ?5,
                updated_at_unix = ?6
             WHERE id = ?7",
            params![
                upsert.source_url,
                SourceHost::detect(upsert.source_url).as_str(),
                upsert.description,
                encode_set(upsert.tags)?,
                encode_set(upsert.folder_aliases)?,
                now,
                id,
            ],
        )
        .with_context(|| format!("failed to update catalog entry {name}"))?;
    Ok(UpsertOutcome::Updated)
}

/// Case-insensitive lookup of one live catalog entry.
pub fn get_addon(connection: &Connection, name: &str) -> Result<Option<CatalogEntry>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM addons
             WHERE lower(name) = lower(?1) AND deleted_at_unix IS NULL
             LIMIT 1"
        ))
        .context("failed to prepare catalog lookup")?;
    let entry = statement
        .query_row([name.trim()], entry_from_row)
        .optional()
        .with_context(|| format!("failed to look up catalog entry {name}"))?;
    Ok(entry)
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub search: Option<String>,
    pub tag: Option<String>,
}

/// List live catalog entries, optionally filtered by a name/description
/// search term and a tag. Ordered by name.
pub fn list_addons(connection: &Connection, filter: &ListFilter) -> Result<Vec<CatalogEntry>> {
    let mut statement = connection
        .prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM addons
             WHERE deleted_at_unix IS NULL
               AND (?1 IS NULL OR lower(name) LIKE ?2 OR lower(COALESCE(description, '')) LIKE ?2)
             ORDER BY lower(name) ASC"
        ))
        .context("failed to prepare catalog list query")?;

    let search = filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|term| !term.is_empty());
    let wildcard = search.map(|term| format!("%{}%", term.to_lowercase()));
    let rows = statement
        .query_map(params![search, wildcard], entry_from_row)
        .context("failed to run catalog list query")?;

    let mut out = Vec::new();
    for row in rows {
        let entry = row.context("failed to decode catalog row")?;
        if let Some(tag) = filter.tag.as_deref()
            && !entry.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
        {
            continue;
        }
        out.push(entry);
    }
    Ok(out)
}

/// Set or clear the operator override URL. Returns false when no live entry
/// matched.
pub fn set_override_url(
    connection: &Connection,
    name: &str,
    override_url: Option<&str>,
) -> Result<bool> {
    let changed = connection
        .execute(
            "UPDATE addons SET override_url = ?1, updated_at_unix = ?2
             WHERE lower(name) = lower(?3) AND deleted_at_unix IS NULL",
            params![non_empty(override_url), unix_timestamp()?, name.trim()],
        )
        .with_context(|| format!("failed to set override URL for {name}"))?;
    Ok(changed > 0)
}

pub fn set_status(connection: &Connection, name: &str, status: AddonStatus) -> Result<bool> {
    let changed = connection
        .execute(
            "UPDATE addons SET status = ?1, updated_at_unix = ?2
             WHERE lower(name) = lower(?3) AND deleted_at_unix IS NULL",
            params![status.as_str(), unix_timestamp()?, name.trim()],
        )
        .with_context(|| format!("failed to set status for {name}"))?;
    Ok(changed > 0)
}

/// Session index from normalized source URL (primary and override) to
/// catalog name, built once per reconcile/install pass.
pub fn url_index(connection: &Connection) -> Result<HashMap<String, String>> {
    let mut statement = connection
        .prepare(
            "SELECT name, source_url, override_url FROM addons
             WHERE deleted_at_unix IS NULL
               AND (source_url IS NOT NULL OR override_url IS NOT NULL)",
        )
        .context("failed to prepare URL index query")?;
    let rows = statement
        .query_map([], |row| {
            let name: String = row.get(0)?;
            let source_url: Option<String> = row.get(1)?;
            let override_url: Option<String> = row.get(2)?;
            Ok((name, source_url, override_url))
        })
        .context("failed to run URL index query")?;

    let mut out = HashMap::new();
    for row in rows {
        let (name, source_url, override_url) = row.context("failed to decode URL index row")?;
        for url in [source_url, override_url].into_iter().flatten() {
            let normalized = normalize_source_url(&url);
            if !normalized.is_empty() {
                out.insert(normalized, name.clone());
            }
        }
    }
    Ok(out)
}

/// Session index from lowercase folder alias to catalog name. The alias sets
/// are owned by the Catalog Sync collaborator; the resolver only reads them.
pub fn alias_index(connection: &Connection) -> Result<HashMap<String, String>> {
    let mut statement = connection
        .prepare(
            "SELECT name, folder_aliases FROM addons
             WHERE deleted_at_unix IS NULL AND folder_aliases IS NOT NULL",
        )
        .context("failed to prepare alias index query")?;
    let rows = statement
        .query_map([], |row| {
            let name: String = row.get(0)?;
            let aliases: Option<String> = row.get(1)?;
            Ok((name, aliases))
        })
        .context("failed to run alias index query")?;

    let mut out = HashMap::new();
    for row in rows {
        let (name, aliases) = row.context("failed to decode alias index row")?;
        for alias in decode_set(aliases.as_deref()) {
            out.insert(alias.to_lowercase(), name.clone());
        }
    }
    Ok(out)
}

const ENTRY_COLUMNS: &str = "name, source_url, override_url, status, host, description, tags, \
                             folder_aliases, created_at_unix, updated_at_unix, deleted_at_unix";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let status: Option<String> = row.get(3)?;
    let host: Option<String> = row.get(4)?;
    let tags: Option<String> = row.get(6)?;
    let folder_aliases: Option<String> = row.get(7)?;
    Ok(CatalogEntry {
        name: row.get(0)?,
        source_url: row.get(1)?,
        override_url: row.get(2)?,
        status: status.as_deref().and_then(|value| AddonStatus::parse(value).ok()),
        host: match host.as_deref() {
            Some("github") => SourceHost::Github,
            Some("gitlab") => SourceHost::Gitlab,
            Some("bitbucket") => SourceHost::Bitbucket,
            _ => SourceHost::Other,
        },
        description: row.get(5)?,
        tags: decode_set(tags.as_deref()),
        folder_aliases: decode_set(folder_aliases.as_deref()),
        created_at_unix: row.get(8)?,
        updated_at_unix: row.get(9)?,
        deleted_at_unix: row.get(10)?,
    })
}

/// Tag and alias sets cross the storage boundary as compact JSON arrays; the
/// API surface only ever sees real sets.
fn encode_set(values: &BTreeSet<String>) -> Result<Option<String>> {
    if values.is_empty() {
        return Ok(None);
    }
    let list: Vec<&String> = values.iter().collect();
    Ok(Some(
        serde_json::to_string(&list).context("failed to encode string set")?,
    ))
}

fn decode_set(raw: Option<&str>) -> BTreeSet<String> {
    let Some(raw) = raw else {
        return BTreeSet::new();
    };
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(values) => values.into_iter().collect(),
        Err(_) => BTreeSet::new(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::store::open_store;
    use crate::store::testutil::test_paths;

    fn tags(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn upsert(connection: &Connection, name: &str, url: Option<&str>, tag_values: &[&str]) -> UpsertOutcome {
        let tag_set = tags(tag_values);
        let aliases = BTreeSet::new();
        upsert_addon(
            connection,
            &CatalogUpsert {
                name,
                source_url: url,
                description: Some("a test add-on"),
                tags: &tag_set,
                folder_aliases: &aliases,
            },
        )
        .expect("upsert")
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let (_temp, paths) = test_paths();
        let connection = open_store(&paths).expect("open store");

        assert_eq!(
            upsert(&connection, "Foo", Some("https://github.com/a/foo"), &["pvp"]),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            upsert(&connection, "Foo", Some("https://github.com/a/foo2"), &["pve"]),
            UpsertOutcome::Updated
        );

        let entry = get_addon(&connection, "foo").expect("get").expect("entry");
        assert_eq!(entry.name, "Foo");
        assert_eq!(entry.source_url.as_deref(), Some("https://github.com/a/foo2"));
        assert_eq!(entry.host, SourceHost::Github);
        assert_eq!(entry.tags, tags(&["pve"]));
        assert_eq!(entry.status, Some(AddonStatus::Active));
    }

    #[test]
    fn resync_preserves_operator_override_and_merges_tags() {
        let (_temp, paths) = test_paths();
        let connection = open_store(&paths).expect("open store");

        upsert(&connection, "Foo", Some("https://github.com/a/foo"), &["pvp"]);
        assert!(set_override_url(&connection, "Foo", Some("https://example.org/fork/foo")).expect("override"));

        assert_eq!(
            upsert(&connection, "Foo", Some("https://github.com/new/foo"), &["pve"]),
            UpsertOutcome::TagsMerged
        );

        let entry = get_addon(&connection, "Foo").expect("get").expect("entry");
        assert_eq!(entry.source_url.as_deref(), Some("https://github.com/a/foo"));
        assert_eq!(
            entry.override_url.as_deref(),
            Some("https://example.org/fork/foo")
        );
        assert_eq!(entry.tags, tags(&["pve", "pvp"]));
        assert_eq!(entry.install_url(), Some("https://example.org/fork/foo"));
    }

    #[test]
    fn install_url_prefers_override() {
        let entry = CatalogEntry {
            name: "Foo".to_string(),
            source_url: Some("https://github.com/a/foo".to_string()),
            override_url: Some("  ".to_string()),
            status: None,
            host: SourceHost::Github,
            description: None,
            tags: BTreeSet::new(),
            folder_aliases: BTreeSet::new(),
            created_at_unix: 0,
            updated_at_unix: 0,
            deleted_at_unix: None,
        };
        // blank override does not shadow the primary URL
        assert_eq!(entry.install_url(), Some("https://github.com/a/foo"));
    }

    #[test]
    fn host_detection_classifies_known_services() {
        assert_eq!(
            SourceHost::detect(Some("https://GitHub.com/a/b")),
            SourceHost::Github
        );
        assert_eq!(
            SourceHost::detect(Some("https://gitlab.com/a/b")),
            SourceHost::Gitlab
        );
        assert_eq!(
            SourceHost::detect(Some("https://bitbucket.org/a/b")),
            SourceHost::Bitbucket
        );
        assert_eq!(SourceHost::detect(Some("https://example.org/a/b")), SourceHost::Other);
        assert_eq!(SourceHost::detect(None), SourceHost::Other);
    }

    #[test]
    fn url_index_covers_primary_and_override() {
        let (_temp, paths) = test_paths();
        let connection = open_store(&paths).expect("open store");

        upsert(&connection, "Foo", Some("https://github.com/a/foo"), &[]);
        set_override_url(&connection, "Foo", Some("https://example.org/Fork/Foo.git")).expect("override");

        let index = url_index(&connection).expect("index");
        assert_eq!(index.get("github.com/a/foo").map(String::as_str), Some("Foo"));
        assert_eq!(
            index.get("example.org/fork/foo").map(String::as_str),
            Some("Foo")
        );
    }

    #[test]
    fn alias_index_is_case_insensitive() {
        let (_temp, paths) = test_paths();
        let connection = open_store(&paths).expect("open store");

        let tag_set = BTreeSet::new();
        let aliases = tags(&["FooFolder", "FooAlt"]);
        upsert_addon(
            &connection,
            &CatalogUpsert {
                name: "Foo",
                source_url: None,
                description: None,
                tags: &tag_set,
                folder_aliases: &aliases,
            },
        )
        .expect("upsert");

        let index = alias_index(&connection).expect("index");
        assert_eq!(index.get("foofolder").map(String::as_str), Some("Foo"));
        assert_eq!(index.get("fooalt").map(String::as_str), Some("Foo"));
    }

    #[test]
    fn list_filters_by_search_and_tag() {
        let (_temp, paths) = test_paths();
        let connection = open_store(&paths).expect("open store");

        upsert(&connection, "BagSort", Some("https://github.com/a/bagsort"), &["inventory"]);
        upsert(&connection, "QuestLog", Some("https://github.com/a/questlog"), &["quests"]);

        let all = list_addons(&connection, &ListFilter::default()).expect("list");
        assert_eq!(all.len(), 2);

        let by_search = list_addons(
            &connection,
            &ListFilter {
                search: Some("bag".to_string()),
                tag: None,
            },
        )
        .expect("list");
        assert_eq!(by_search.len(), 1);
        assert_eq!(by_search[0].name, "BagSort");

        let by_tag = list_addons(
            &connection,
            &ListFilter {
                search: None,
                tag: Some("Quests".to_string()),
            },
        )
        .expect("list");
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].name, "QuestLog");
    }

    #[test]
    fn status_parse_and_set() {
        let (_temp, paths) = test_paths();
        let connection = open_store(&paths).expect("open store");

        upsert(&connection, "Foo", None, &[]);
        assert!(set_status(&connection, "foo", AddonStatus::Broken).expect("set"));
        let entry = get_addon(&connection, "Foo").expect("get").expect("entry");
        assert_eq!(entry.status, Some(AddonStatus::Broken));

        assert!(!set_status(&connection, "Absent", AddonStatus::Active).expect("set"));
        assert!(AddonStatus::parse("bogus").is_err());
    }
}
