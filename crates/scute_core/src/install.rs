use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use rusqlite::Connection;
use serde_json::json;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog;
use crate::config::ScuteConfig;
use crate::git::{self, GitOptions};
use crate::installed::{self, InstalledRecord};
use crate::linkdir::{DirectoryLink, platform_linker};
use crate::release::{self, HostedReleaseResolver, ReleaseResolver};
use crate::runtime::{ResolvedPaths, ensure_addons_dir_ready};
use crate::scan;
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStrategy {
    /// Staged version-control checkout, exposed through directory links.
    Checkout,
    /// Downloaded archive, copied into the add-on root.
    Archive,
}

impl InstallStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Archive => "archive",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub name: String,
    pub strategy: InstallStrategy,
    pub linked: Vec<String>,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    pub name: String,
    pub current_version: String,
    pub behind_count: u64,
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    FastForwarded { version: String },
    Reinstalled { strategy: InstallStrategy },
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: Vec<String>,
}

/// The install/link engine. Owns nothing global: a store handle, the
/// resolved paths, and its collaborators are injected at construction.
pub struct Installer<'a> {
    connection: &'a Connection,
    paths: &'a ResolvedPaths,
    git: GitOptions,
    resolver: Box<dyn ReleaseResolver>,
    linker: Box<dyn DirectoryLink>,
    user_agent: String,
}

impl<'a> Installer<'a> {
    pub fn new(
        connection: &'a Connection,
        paths: &'a ResolvedPaths,
        config: &ScuteConfig,
    ) -> Result<Self> {
        let user_agent = config.user_agent();
        Ok(Self {
            connection,
            paths,
            git: GitOptions {
                program: config.git_program(),
                timeout: config.git_timeout(),
            },
            resolver: Box::new(HostedReleaseResolver::new(&user_agent)?),
            linker: platform_linker(),
            user_agent,
        })
    }

    /// Collaborator-injection constructor. The CLI uses `new`; tests inject
    /// a failing git program and a canned release resolver here.
    pub fn with_collaborators(
        connection: &'a Connection,
        paths: &'a ResolvedPaths,
        git: GitOptions,
        resolver: Box<dyn ReleaseResolver>,
        linker: Box<dyn DirectoryLink>,
        user_agent: String,
    ) -> Self {
        Self {
            connection,
            paths,
            git,
            resolver,
            linker,
            user_agent,
        }
    }

    /// Install an add-on: linked checkout first, archive download as the
    /// fallback. No source URL is a precondition failure and nothing is
    /// mutated; both strategies failing writes no record either.
    pub fn install(&self, name: &str, source_override: Option<&str>) -> Result<InstallReport> {
        ensure_addons_dir_ready(self.paths)?;
        let url = self.resolve_source_url(name, source_override)?;

        let report = match self.install_checkout(name, &url) {
            Ok(report) => report,
            Err(checkout_error) => {
                warn!("checkout install of {name} failed ({checkout_error:#}); trying archive download");
                self.install_archive(name, &url).with_context(|| {
                    format!("both the checkout and archive strategies failed for {name}")
                })?
            }
        };

        if let Err(error) = store::log_event(
            self.connection,
            "addon_installed",
            Some(name),
            Some(json!({
                "version": report.version,
                "strategy": report.strategy.as_str(),
                "linked": report.linked,
            })),
        ) {
            warn!("failed to log install event for {name}: {error:#}");
        }
        Ok(report)
    }

    /// Remove an add-on. Checkout installs drop every link into the staging
    /// copy and then the staging copy itself; archive installs drop the
    /// copied folder. A path that already vanished still soft-deletes the
    /// record; any filesystem error leaves the record untouched.
    pub fn remove(&self, name: &str) -> Result<()> {
        let record = self.require_installed(name)?;

        if let Some(checkout) = self.staging_checkout_for(&record) {
            self.remove_links_into(&checkout, &record.name)?;
            remove_tree_robust(&checkout)?;
            info!("removed staging checkout {}", checkout.display());
        } else if path_occupied(&record.path) {
            if self.linker.is_link(&record.path) {
                self.linker.remove(&record.path)?;
            } else {
                remove_tree_robust(&record.path)?;
            }
            info!("removed {}", record.path.display());
        } else {
            debug!("{} is already gone from disk; cleaning up the record only", record.name);
        }

        installed::soft_delete(self.connection, &record.name)?;
        if let Err(error) =
            store::log_event(self.connection, "addon_removed", Some(&record.name), None)
        {
            warn!("failed to log removal event for {}: {error:#}", record.name);
        }
        Ok(())
    }

    /// Recreate the directory link for a checkout-backed add-on and mark it
    /// enabled. The flag is only flipped after the filesystem agrees.
    pub fn enable(&self, name: &str) -> Result<()> {
        let record = self.require_installed(name)?;
        let source = self.staging_source_for(&record).ok_or_else(|| {
            anyhow!(
                "{} has no staging checkout; enable/disable only manages linked installs",
                record.name
            )
        })?;

        let link_path = self.paths.addons_dir.join(&record.name);
        if !self.linker.is_link(&link_path) {
            self.clear_destination(&link_path)?;
            self.linker.create(&source, &link_path)?;
        }
        installed::set_enabled(self.connection, &record.name, true)?;
        if let Err(error) =
            store::log_event(self.connection, "addon_enabled", Some(&record.name), None)
        {
            warn!("failed to log enable event for {}: {error:#}", record.name);
        }
        Ok(())
    }

    /// Remove the directory link without touching the staged checkout.
    /// Archive installs have no checkout to unlink and are rejected.
    pub fn disable(&self, name: &str) -> Result<()> {
        let record = self.require_installed(name)?;
        if self.staging_source_for(&record).is_none() {
            bail!(
                "{} was installed from an archive; disabling requires a staging checkout",
                record.name
            );
        }

        let link_path = self.paths.addons_dir.join(&record.name);
        if self.linker.is_link(&link_path) {
            self.linker.remove(&link_path)?;
        } else if link_path.exists() {
            bail!(
                "{} is occupied by a plain directory, not a managed link",
                link_path.display()
            );
        }
        installed::set_enabled(self.connection, &record.name, false)?;
        if let Err(error) =
            store::log_event(self.connection, "addon_disabled", Some(&record.name), None)
        {
            warn!("failed to log disable event for {}: {error:#}", record.name);
        }
        Ok(())
    }

    /// Query every checkout-backed record for upstream commits it is behind.
    /// Per-record failures are logged and skipped, never fatal to the batch.
    pub fn check_for_updates(&self) -> Result<Vec<UpdateCandidate>> {
        let mut out = Vec::new();
        for record in installed::list_installed(self.connection)? {
            if !record.path.join(".git").exists() {
                continue;
            }
            match self.behind_count_for(&record.path) {
                Ok(0) => {}
                Ok(behind_count) => out.push(UpdateCandidate {
                    name: record.name.clone(),
                    current_version: record.version.clone(),
                    behind_count,
                }),
                Err(error) => {
                    debug!("skipping update check for {}: {error:#}", record.name);
                }
            }
        }
        Ok(out)
    }

    /// Fast-forward a checkout-backed add-on, or fall back to a full
    /// reinstall from the record's stored source URL.
    pub fn update(&self, name: &str) -> Result<UpdateOutcome> {
        let record = self.require_installed(name)?;

        if record.path.join(".git").exists() {
            match git::pull_ff(&self.git, &record.path) {
                Ok(()) => {
                    let version = scan::manifest_version(&record.path);
                    installed::update_version(self.connection, &record.name, &version)?;
                    if let Err(error) = store::log_event(
                        self.connection,
                        "addon_updated",
                        Some(&record.name),
                        Some(json!({"version": version})),
                    ) {
                        warn!("failed to log update event for {}: {error:#}", record.name);
                    }
                    return Ok(UpdateOutcome::FastForwarded { version });
                }
                Err(error) => {
                    warn!(
                        "fast-forward pull failed for {} ({error:#}); reinstalling",
                        record.name
                    );
                }
            }
        }

        let source_url = record
            .source_url
            .clone()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("{} has no stored source URL to reinstall from", record.name)
            })?;
        let report = self.install(&record.name, Some(&source_url))?;
        Ok(UpdateOutcome::Reinstalled {
            strategy: report.strategy,
        })
    }

    /// Update every installed add-on, one at a time over a stable snapshot.
    /// Failures are collected, never fatal to the batch.
    pub fn update_all(&self) -> Result<BatchReport> {
        let snapshot = installed::list_installed(self.connection)?;
        let mut report = BatchReport::default();
        for record in snapshot {
            match self.update(&record.name) {
                Ok(_) => report.succeeded += 1,
                Err(error) => {
                    warn!("update of {} failed: {error:#}", record.name);
                    report.failed.push(record.name);
                }
            }
        }
        Ok(report)
    }

    fn install_checkout(&self, name: &str, url: &str) -> Result<InstallReport> {
        fs::create_dir_all(&self.paths.staging_dir).with_context(|| {
            format!("failed to create staging dir {}", self.paths.staging_dir.display())
        })?;
        let checkout = self.paths.staging_dir.join(name);
        if path_occupied(&checkout) {
            remove_tree_robust(&checkout)?;
        }

        git::clone(&self.git, url, &checkout)?;
        let report = self.link_checkout(name, url, &checkout);
        if report.is_err() {
            let _ = remove_tree_robust(&checkout);
        }
        report
    }

    /// Link every sub-add-on of a staged checkout into the add-on root and
    /// register the records. Split out of `install_checkout` so the linking
    /// and registration rules are testable without a clone.
    fn link_checkout(&self, name: &str, url: &str, checkout: &Path) -> Result<InstallReport> {
        let sub_addons = scan::find_manifest_dirs(checkout, name);
        if sub_addons.is_empty() {
            bail!("checkout of {url} contains no manifest-bearing folders");
        }

        let mut linked = Vec::new();
        let mut version = String::from("unknown");
        for (folder_name, source_path) in &sub_addons {
            let link_path = self.paths.addons_dir.join(folder_name);
            self.clear_destination(&link_path)?;
            self.linker
                .create(source_path, &link_path)
                .with_context(|| format!("failed to link {folder_name}"))?;

            let folder_version = scan::manifest_version(source_path);
            let record_name = if folder_name.eq_ignore_ascii_case(name) {
                name
            } else {
                folder_name.as_str()
            };
            installed::mark_installed(
                self.connection,
                record_name,
                &folder_version,
                Some(url),
                checkout,
            )?;
            info!("linked {folder_name} (version {folder_version})");
            if linked.is_empty() {
                version = folder_version;
            }
            linked.push(folder_name.clone());
        }

        Ok(InstallReport {
            name: name.to_string(),
            strategy: InstallStrategy::Checkout,
            linked,
            version,
        })
    }

    fn install_archive(&self, name: &str, url: &str) -> Result<InstallReport> {
        let archive_url = self
            .resolver
            .resolve_archive_url(url)
            .ok_or_else(|| anyhow!("no downloadable archive available for {url}"))?;

        let scratch =
            tempfile::tempdir().context("failed to create download scratch directory")?;
        let archive_path = release::download_archive(&archive_url, scratch.path(), &self.user_agent)?;
        let extract_dir = scratch.path().join("extract");
        release::extract_archive(&archive_path, &extract_dir)?;
        self.copy_extracted(name, url, &extract_dir)
    }

    /// Copy every manifest-bearing folder of an extracted archive into the
    /// add-on root and register the records. Test seam for the archive
    /// strategy below the download.
    fn copy_extracted(&self, name: &str, url: &str, extract_dir: &Path) -> Result<InstallReport> {
        let folders = scan::find_manifest_dirs(extract_dir, name);
        if folders.is_empty() {
            bail!("archive for {name} contains no manifest-bearing folders");
        }

        let mut linked = Vec::new();
        let mut version = String::from("unknown");
        for (folder_name, source_path) in &folders {
            let dest = self.paths.addons_dir.join(folder_name);
            self.clear_destination(&dest)?;
            copy_dir_recursive(source_path, &dest)?;

            let folder_version = scan::manifest_version(&dest);
            let record_name = if folder_name.eq_ignore_ascii_case(name) {
                name
            } else {
                folder_name.as_str()
            };
            installed::mark_installed(
                self.connection,
                record_name,
                &folder_version,
                Some(url),
                &dest,
            )?;
            info!("copied {folder_name} (version {folder_version})");
            if linked.is_empty() {
                version = folder_version;
            }
            linked.push(folder_name.clone());
        }

        Ok(InstallReport {
            name: name.to_string(),
            strategy: InstallStrategy::Archive,
            linked,
            version,
        })
    }

    fn resolve_source_url(&self, name: &str, explicit: Option<&str>) -> Result<String> {
        if let Some(url) = explicit.map(str::trim).filter(|url| !url.is_empty()) {
            return Ok(url.to_string());
        }
        if let Some(entry) = catalog::get_addon(self.connection, name)?
            && let Some(url) = entry.install_url()
        {
            return Ok(url.to_string());
        }
        bail!("no source URL known for {name}; pass one explicitly or sync the catalog")
    }

    fn require_installed(&self, name: &str) -> Result<InstalledRecord> {
        installed::find_installed(self.connection, name)?
            .ok_or_else(|| anyhow!("{name} is not installed"))
    }

    /// The staging checkout backing a record, if any: the checkout named
    /// after the record, or the parent checkout the record's path points at.
    fn staging_checkout_for(&self, record: &InstalledRecord) -> Option<PathBuf> {
        let direct = self.paths.staging_dir.join(&record.name);
        if direct.exists() {
            return Some(direct);
        }
        if record.path.starts_with(&self.paths.staging_dir) && record.path.exists() {
            return Some(record.path.clone());
        }
        None
    }

    /// The directory inside the staging checkout that the record's link
    /// should resolve to (the checkout root or its sub-add-on folder).
    fn staging_source_for(&self, record: &InstalledRecord) -> Option<PathBuf> {
        let checkout = self.staging_checkout_for(record)?;
        for (folder_name, path) in scan::find_manifest_dirs(&checkout, &record.name) {
            if folder_name.eq_ignore_ascii_case(&record.name) {
                return Some(path);
            }
        }
        None
    }

    fn remove_links_into(&self, checkout: &Path, name: &str) -> Result<()> {
        if !self.paths.addons_dir.exists() {
            return Ok(());
        }
        let entries = fs::read_dir(&self.paths.addons_dir)
            .with_context(|| format!("failed to read {}", self.paths.addons_dir.display()))?;
        for entry in entries {
            let entry = entry
                .with_context(|| format!("failed to read {}", self.paths.addons_dir.display()))?;
            let path = entry.path();
            if !self.linker.is_link(&path) {
                continue;
            }
            let matches_name = path
                .file_name()
                .and_then(|file_name| file_name.to_str())
                .is_some_and(|file_name| file_name.eq_ignore_ascii_case(name));
            let targets_checkout = self
                .linker
                .read_target(&path)
                .is_some_and(|target| target.starts_with(checkout));
            if matches_name || targets_checkout {
                self.linker.remove(&path)?;
                debug!("removed link {}", path.display());
            }
        }
        Ok(())
    }

    /// Clear whatever occupies a link/copy destination, re-checking the
    /// actual filesystem state immediately before acting. A managed link is
    /// simply removed; a plain directory is moved aside as `<name>.backup`
    /// (replacing any prior backup) rather than deleted.
    fn clear_destination(&self, path: &Path) -> Result<()> {
        if self.linker.is_link(path) {
            self.linker.remove(path)?;
            return Ok(());
        }
        if path.exists() {
            let backup = backup_path_for(path)?;
            if path_occupied(&backup) {
                remove_tree_robust(&backup)?;
            }
            fs::rename(path, &backup).with_context(|| {
                format!("failed to move {} aside to {}", path.display(), backup.display())
            })?;
            info!("moved existing {} aside to {}", path.display(), backup.display());
        }
        Ok(())
    }

    fn behind_count_for(&self, workdir: &Path) -> Result<u64> {
        git::fetch(&self.git, workdir)?;
        git::behind_count(&self.git, workdir)
    }
}

fn backup_path_for(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|file_name| file_name.to_str())
        .ok_or_else(|| anyhow!("destination has no usable name: {}", path.display()))?;
    Ok(path.with_file_name(format!("{name}.backup")))
}

/// True when something occupies the path, including a dangling link.
fn path_occupied(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Delete a tree, clearing read-only bits and retrying when the first pass
/// fails (version-control object files are routinely read-only).
fn remove_tree_robust(path: &Path) -> Result<()> {
    if !path_occupied(path) {
        return Ok(());
    }
    if fs::remove_dir_all(path).is_ok() {
        return Ok(());
    }

    for entry in WalkDir::new(path).follow_links(false) {
        let Ok(entry) = entry else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mut permissions = metadata.permissions();
        if permissions.readonly() {
            set_writable(&mut permissions);
            let _ = fs::set_permissions(entry.path(), permissions);
        }
    }
    fs::remove_dir_all(path).with_context(|| format!("failed to remove {}", path.display()))
}

#[cfg(unix)]
fn set_writable(permissions: &mut fs::Permissions) {
    use std::os::unix::fs::PermissionsExt;
    permissions.set_mode(permissions.mode() | 0o200);
}

#[cfg(windows)]
fn set_writable(permissions: &mut fs::Permissions) {
    permissions.set_readonly(false);
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", source.display()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("walk escaped the source tree")?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}
