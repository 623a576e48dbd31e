use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Reserved directory under the add-on root that holds staging checkouts.
/// Hidden from the scanner together with every other dot-directory.
pub const STAGING_DIR_NAME: &str = ".repos";

pub const STATE_DIR_NAME: &str = ".scute";

const ADDONS_SUBDIRS: [&str; 2] = ["Interface", "AddOns"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub game_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

/// Every path the engine touches, resolved once and passed by reference.
/// There is no ambient path state anywhere else in the crate.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub game_root: PathBuf,
    pub addons_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "game_root={} ({})\naddons_dir={}\nstaging_dir={}\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.game_root),
            self.root_source.as_str(),
            normalize_for_display(&self.addons_dir),
            normalize_for_display(&self.staging_dir),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub game_root_exists: bool,
    pub addons_dir_exists: bool,
    pub staging_dir_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let game_root_exists = paths.game_root.exists();
    let addons_dir_exists = paths.addons_dir.exists();
    let staging_dir_exists = paths.staging_dir.exists();
    let state_dir_exists = paths.state_dir.exists();
    let data_dir_exists = paths.data_dir.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !game_root_exists {
        warnings.push("game root does not exist; pass --game-root or set SCUTE_GAME_ROOT".to_string());
    }
    if !addons_dir_exists {
        warnings.push("Interface/AddOns is missing; run `scute init` before installing".to_string());
    }
    if !db_exists {
        warnings.push("database is missing; it is created on first sync or install".to_string());
    }

    Ok(RuntimeStatus {
        game_root_exists,
        addons_dir_exists,
        staging_dir_exists,
        state_dir_exists,
        data_dir_exists,
        db_exists,
        db_size_bytes,
        config_exists,
        warnings,
    })
}

pub fn ensure_addons_dir_ready(paths: &ResolvedPaths) -> Result<()> {
    if !paths.addons_dir.exists() {
        bail!(
            "Add-on directory is missing: {}\nRun: scute init --game-root {}",
            normalize_for_display(&paths.addons_dir),
            normalize_for_display(&paths.game_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (game_root, root_source) = resolve_game_root(context, overrides, &lookup_env);

    let addons_dir = game_root.join(ADDONS_SUBDIRS[0]).join(ADDONS_SUBDIRS[1]);
    let staging_dir = addons_dir.join(STAGING_DIR_NAME);
    let state_dir = game_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (absolutize(path, &game_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("SCUTE_DATA_DIR") {
        (
            absolutize(Path::new(value.trim()), &game_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &game_root), ValueSource::Flag)
    } else if let Some(value) = lookup_env("SCUTE_CONFIG") {
        (
            absolutize(Path::new(value.trim()), &game_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        db_path: data_dir.join("scute.db"),
        game_root,
        addons_dir,
        staging_dir,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let required_dirs = [
        paths.addons_dir.clone(),
        paths.state_dir.clone(),
        paths.data_dir.clone(),
    ];

    let mut created_dirs = Vec::new();
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &render_materialized_config(paths),
            options.force,
        )?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let game_root = normalize_for_display(&paths.game_root);
    let addons_dir = normalize_for_display(&paths.addons_dir);
    let db_path = normalize_for_display(&paths.db_path);

    format!(
        "# scute runtime configuration (materialized by `scute init`)\n\n[catalog]\n# api_url = \"https://wiki.example.org/api.php\"\n# page = \"Addons\"\n# user_agent = \"scute/0.2\"\n\n[install]\n# git_program = \"git\"\n# git_timeout_secs = 60\n\n[paths]\ngame_root = \"{game_root}\"\naddons_dir = \"{addons_dir}\"\ndb_path = \"{db_path}\"\n",
    )
}

fn resolve_game_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.game_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = lookup_env("SCUTE_GAME_ROOT") {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }

    let root = detect_game_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    (root, ValueSource::Heuristic)
}

fn detect_game_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join(ADDONS_SUBDIRS[0]).join(ADDONS_SUBDIRS[1]).exists() {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out = ancestors(cwd);
    if let Some(exe_dir) = executable_dir {
        out.extend(ancestors(exe_dir));
    }
    out
}

fn ancestors(path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut cursor = Some(path);
    while let Some(current) = cursor {
        out.push(current.to_path_buf());
        cursor = current.parent();
    }
    out
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource, ensure_addons_dir_ready,
        init_layout, inspect_runtime, resolve_paths_with_lookup,
    };

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            game_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: cwd.clone(),
            executable_dir: None,
        };
        let env = HashMap::from([(
            "SCUTE_GAME_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.game_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(
            resolved.addons_dir,
            from_flag.join("Interface").join("AddOns")
        );
        assert_eq!(resolved.staging_dir, resolved.addons_dir.join(".repos"));
    }

    #[test]
    fn heuristic_finds_game_root_above_cwd() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("game");
        let deep = root.join("Interface").join("AddOns").join("SomeAddon");
        fs::create_dir_all(&deep).expect("create dirs");

        let context = ResolutionContext {
            cwd: deep.clone(),
            executable_dir: None,
        };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve paths");
        assert_eq!(resolved.game_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn heuristic_falls_back_to_cwd() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("nowhere");
        fs::create_dir_all(&cwd).expect("create cwd");

        let context = ResolutionContext {
            cwd: cwd.clone(),
            executable_dir: None,
        };
        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None)
            .expect("resolve paths");
        assert_eq!(resolved.game_root, cwd);
    }

    #[test]
    fn init_layout_creates_expected_dirs_and_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("game");
        fs::create_dir_all(&root).expect("create root");

        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            game_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert!(!report.created_dirs.is_empty());
        assert!(report.wrote_config);
        assert!(paths.addons_dir.exists());
        assert!(paths.state_dir.exists());
        assert!(paths.data_dir.exists());
        assert!(paths.config_path.exists());

        // second init must not clobber the existing config
        let second = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(!second.wrote_config);
    }

    #[test]
    fn addons_dir_readiness_fails_without_init() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("game");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            game_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let status = inspect_runtime(&paths).expect("inspect");
        assert!(!status.addons_dir_exists);
        assert!(!status.warnings.is_empty());

        let err = ensure_addons_dir_ready(&paths).expect_err("must fail");
        assert!(err.to_string().contains("scute init"));
    }
}
