use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

/// A folder qualifies as an add-on only if it carries at least one manifest.
pub const MANIFEST_EXTENSION: &str = "toc";

/// Shared-library directories nested inside add-ons; never sub-add-ons.
const LIBRARY_DIR_NAMES: [&str; 3] = ["Libs", "libs", "Libraries"];

/// Suffix used for the backup-aside safety copies made before linking.
const BACKUP_SUFFIX: &str = ".backup";

/// One immediate subdirectory of the add-on root that carries a manifest.
/// Ephemeral scan output; nothing here is persisted.
#[derive(Debug, Clone)]
pub struct FolderScan {
    pub folder_name: String,
    pub path: PathBuf,
    pub source_url: Option<String>,
}

/// Scan the add-on root for manifest-bearing folders. A missing root yields
/// an empty result, not an error. Dot-directories (the staging area among
/// them) and `*.backup` safety copies are skipped.
pub fn scan_addons_dir(addons_dir: &Path) -> Result<Vec<FolderScan>> {
    let mut out = Vec::new();
    if !addons_dir.exists() {
        return Ok(out);
    }

    let entries = fs::read_dir(addons_dir)
        .with_context(|| format!("failed to read {}", addons_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", addons_dir.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(folder_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if folder_name.starts_with('.') || folder_name.ends_with(BACKUP_SUFFIX) {
            continue;
        }
        if !has_manifest(&path) {
            continue;
        }
        out.push(FolderScan {
            folder_name: folder_name.to_string(),
            source_url: git_remote_url(&path),
            path,
        });
    }

    out.sort_by(|left, right| left.folder_name.cmp(&right.folder_name));
    Ok(out)
}

/// True when the directory directly contains at least one manifest file.
pub fn has_manifest(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(MANIFEST_EXTENSION))
        {
            return true;
        }
    }
    false
}

/// Extract the origin remote URL from a folder's `.git/config`, if any.
/// Absence of the file or an unparsable config is an expected outcome and
/// yields `None`.
pub fn git_remote_url(folder: &Path) -> Option<String> {
    let config_path = folder.join(".git").join("config");
    let content = match fs::read_to_string(&config_path) {
        Ok(content) => content,
        Err(error) => {
            if config_path.exists() {
                debug!("unreadable git config {}: {error}", config_path.display());
            }
            return None;
        }
    };

    let mut current_section = String::new();
    let mut origin_url = None;
    let mut any_remote_url = None;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            current_section = trimmed[1..trimmed.len() - 1].trim().to_string();
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        if key.trim() != "url" {
            continue;
        }
        let value = value.trim();
        if value.is_empty() || !current_section.starts_with("remote") {
            continue;
        }
        if current_section == "remote \"origin\"" {
            origin_url = Some(value.to_string());
        } else if any_remote_url.is_none() {
            any_remote_url = Some(value.to_string());
        }
    }

    origin_url.or(any_remote_url)
}

/// Normalize a source URL for identity comparison: lowercase, protocol
/// stripped, trailing slash stripped, trailing `.git` stripped. Idempotent.
pub fn normalize_source_url(url: &str) -> String {
    let mut url = url.trim().to_lowercase();
    for prefix in ["https://", "http://", "git://"] {
        if let Some(rest) = url.strip_prefix(prefix) {
            url = rest.to_string();
            break;
        }
    }
    let mut rest = url.trim_end_matches('/');
    if let Some(stripped) = rest.strip_suffix(".git") {
        rest = stripped;
    }
    rest.trim_end_matches('/').to_string()
}

/// Resolve a scanned folder to a catalog identity: exact normalized-URL
/// match first, then folder-name alias lookup. `None` means the folder is an
/// unknown add-on and its own name becomes its identity.
pub fn resolve_identity(
    scan: &FolderScan,
    url_index: &HashMap<String, String>,
    alias_index: &HashMap<String, String>,
) -> Option<String> {
    if let Some(url) = scan.source_url.as_deref() {
        let normalized = normalize_source_url(url);
        if let Some(name) = url_index.get(&normalized) {
            return Some(name.clone());
        }
    }
    alias_index
        .get(&scan.folder_name.to_lowercase())
        .cloned()
}

/// Read the version field out of the folder's first manifest file.
/// Falls back to "unknown" on any miss.
pub fn manifest_version(dir: &Path) -> String {
    let Ok(entries) = fs::read_dir(dir) else {
        return "unknown".to_string();
    };
    let mut manifests: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(MANIFEST_EXTENSION))
        })
        .collect();
    manifests.sort();

    for manifest in manifests {
        let Ok(content) = fs::read_to_string(&manifest) else {
            debug!("unreadable manifest {}", manifest.display());
            continue;
        };
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("## Version:") {
                let version = rest.trim();
                if !version.is_empty() {
                    return version.to_string();
                }
            }
        }
    }
    "unknown".to_string()
}

/// Discover the sub-add-ons of a checked-out or extracted tree.
///
/// A manifest at the tree root means the whole tree is the single sub-add-on,
/// named `root_name`. Otherwise every distinct manifest-bearing directory at
/// any depth is a sub-add-on, excluding `.git` internals and conventional
/// shared-library directory names.
pub fn find_manifest_dirs(root: &Path, root_name: &str) -> Vec<(String, PathBuf)> {
    if has_manifest(root) {
        return vec![(root_name.to_string(), root.to_path_buf())];
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                debug!("walk error under {}: {error}", root.display());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(MANIFEST_EXTENSION))
        {
            continue;
        }
        if path
            .components()
            .any(|component| component == Component::Normal(".git".as_ref()))
        {
            continue;
        }
        let Some(parent) = path.parent() else {
            continue;
        };
        let Some(dir_name) = parent.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if LIBRARY_DIR_NAMES.contains(&dir_name) {
            continue;
        }
        if seen.insert(parent.to_path_buf()) {
            out.push((dir_name.to_string(), parent.to_path_buf()));
        }
    }

    out.sort_by(|left, right| left.0.cmp(&right.0));
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        FolderScan, find_manifest_dirs, git_remote_url, manifest_version, normalize_source_url,
        resolve_identity, scan_addons_dir,
    };

    fn write_file(path: &Path, content: &str) {
        let parent = path.parent().expect("parent");
        fs::create_dir_all(parent).expect("create parent");
        fs::write(path, content).expect("write file");
    }

    fn write_git_config(folder: &Path, url: &str) {
        write_file(
            &folder.join(".git").join("config"),
            &format!("[core]\n\tbare = false\n[remote \"origin\"]\n\turl = {url}\n\tfetch = +refs/heads/*:refs/remotes/origin/*\n"),
        );
    }

    #[test]
    fn scan_returns_empty_for_missing_root() {
        let temp = tempdir().expect("tempdir");
        let scans = scan_addons_dir(&temp.path().join("nope")).expect("scan");
        assert!(scans.is_empty());
    }

    #[test]
    fn scan_detects_manifest_folders_only() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("Foo").join("Foo.toc"), "## Version: 1.2\n");
        write_file(&root.join("NotAnAddon").join("readme.txt"), "hi");
        write_file(&root.join(".repos").join("foo").join("Foo.toc"), "## Version: 1.2\n");
        write_file(&root.join("Foo.backup").join("Foo.toc"), "## Version: 1.1\n");
        write_file(&root.join("loose.toc"), "## Version: 9\n");

        let scans = scan_addons_dir(root).expect("scan");
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].folder_name, "Foo");
        assert!(scans[0].source_url.is_none());
    }

    #[test]
    fn scan_extracts_origin_remote_url() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        let folder = root.join("Bar");
        write_file(&folder.join("Bar.toc"), "## Version: 2.0\n");
        write_git_config(&folder, "https://github.com/a/bar.git");

        let scans = scan_addons_dir(root).expect("scan");
        assert_eq!(scans.len(), 1);
        assert_eq!(
            scans[0].source_url.as_deref(),
            Some("https://github.com/a/bar.git")
        );
    }

    #[test]
    fn git_remote_url_prefers_origin_and_tolerates_garbage() {
        let temp = tempdir().expect("tempdir");
        let folder = temp.path().join("addon");
        write_file(
            &folder.join(".git").join("config"),
            "[remote \"upstream\"]\n\turl = https://github.com/up/stream\n[remote \"origin\"]\n\turl = https://github.com/o/rigin\n",
        );
        assert_eq!(
            git_remote_url(&folder).as_deref(),
            Some("https://github.com/o/rigin")
        );

        let broken = temp.path().join("broken");
        write_file(&broken.join(".git").join("config"), "not an ini at all");
        assert!(git_remote_url(&broken).is_none());

        assert!(git_remote_url(&temp.path().join("absent")).is_none());
    }

    #[test]
    fn url_normalization_is_case_protocol_and_suffix_insensitive() {
        assert_eq!(
            normalize_source_url("https://GitHub.com/Foo/Bar.git"),
            "github.com/foo/bar"
        );
        assert_eq!(
            normalize_source_url("github.com/foo/bar"),
            "github.com/foo/bar"
        );
        assert_eq!(
            normalize_source_url("https://Host.com/Owner/Repo.git/"),
            normalize_source_url("host.com/owner/repo")
        );
        // idempotent
        let once = normalize_source_url("git://example.org/a/b.git");
        assert_eq!(normalize_source_url(&once), once);
        // ".git" is a suffix strip, not a character-set strip
        assert_eq!(normalize_source_url("host.com/a/legit"), "host.com/a/legit");
    }

    #[test]
    fn identity_resolution_prefers_url_then_alias() {
        let urls = HashMap::from([("github.com/a/foo".to_string(), "Foo".to_string())]);
        let aliases = HashMap::from([("foo-folder".to_string(), "Foo".to_string())]);

        let by_url = FolderScan {
            folder_name: "whatever".to_string(),
            path: "/tmp/whatever".into(),
            source_url: Some("https://github.com/A/Foo.git".to_string()),
        };
        assert_eq!(
            resolve_identity(&by_url, &urls, &aliases).as_deref(),
            Some("Foo")
        );

        let by_alias = FolderScan {
            folder_name: "Foo-Folder".to_string(),
            path: "/tmp/foo-folder".into(),
            source_url: None,
        };
        assert_eq!(
            resolve_identity(&by_alias, &urls, &aliases).as_deref(),
            Some("Foo")
        );

        let unknown = FolderScan {
            folder_name: "Mystery".to_string(),
            path: "/tmp/mystery".into(),
            source_url: Some("https://github.com/x/unknown".to_string()),
        };
        assert!(resolve_identity(&unknown, &urls, &aliases).is_none());
    }

    #[test]
    fn manifest_version_reads_version_field() {
        let temp = tempdir().expect("tempdir");
        let folder = temp.path().join("Foo");
        write_file(
            &folder.join("Foo.toc"),
            "## Interface: 11200\n## Title: Foo\n## Version: 1.2\n",
        );
        assert_eq!(manifest_version(&folder), "1.2");

        let bare = temp.path().join("Bare");
        write_file(&bare.join("Bare.toc"), "## Title: Bare\n");
        assert_eq!(manifest_version(&bare), "unknown");

        assert_eq!(manifest_version(&temp.path().join("absent")), "unknown");
    }

    #[test]
    fn root_manifest_wins_over_nested_ones() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("checkout");
        write_file(&root.join("Foo.toc"), "## Version: 1.2\n");
        write_file(&root.join("SubModule").join("SubModule.toc"), "## Version: 0.1\n");

        let dirs = find_manifest_dirs(&root, "Foo");
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].0, "Foo");
        assert_eq!(dirs[0].1, root);
    }

    #[test]
    fn nested_manifest_dirs_skip_libraries_and_git() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("checkout");
        write_file(&root.join("AddonA").join("AddonA.toc"), "## Version: 1\n");
        write_file(&root.join("AddonB").join("AddonB.toc"), "## Version: 2\n");
        write_file(&root.join("AddonA").join("Libs").join("Lib.toc"), "lib");
        write_file(&root.join(".git").join("stash.toc"), "not a manifest");

        let dirs = find_manifest_dirs(&root, "ignored");
        let names: Vec<&str> = dirs.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["AddonA", "AddonB"]);
    }
}
