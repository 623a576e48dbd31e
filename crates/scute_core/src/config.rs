use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "scute/0.2";
pub const DEFAULT_CATALOG_PAGE: &str = "Addons";
pub const DEFAULT_GIT_PROGRAM: &str = "git";
pub const DEFAULT_GIT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ScuteConfig {
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub install: InstallSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CatalogSection {
    pub api_url: Option<String>,
    pub page: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct InstallSection {
    pub git_program: Option<String>,
    pub git_timeout_secs: Option<u64>,
}

impl ScuteConfig {
    /// Resolve the catalog API URL: env SCUTE_CATALOG_API_URL > config > None.
    pub fn api_url_owned(&self) -> Option<String> {
        if let Ok(value) = env::var("SCUTE_CATALOG_API_URL") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return Some(trimmed);
            }
        }
        self.catalog.api_url.clone()
    }

    /// Resolve the catalog page title: env > config > DEFAULT_CATALOG_PAGE.
    pub fn catalog_page(&self) -> String {
        if let Ok(value) = env::var("SCUTE_CATALOG_PAGE") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.catalog
            .page
            .clone()
            .unwrap_or_else(|| DEFAULT_CATALOG_PAGE.to_string())
    }

    /// Resolve user agent: env SCUTE_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Ok(value) = env::var("SCUTE_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.catalog
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve the git program name: env SCUTE_GIT_PROGRAM > config > "git".
    pub fn git_program(&self) -> String {
        if let Ok(value) = env::var("SCUTE_GIT_PROGRAM") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.install
            .git_program
            .clone()
            .unwrap_or_else(|| DEFAULT_GIT_PROGRAM.to_string())
    }

    /// Resolve the bound on git network operations:
    /// env SCUTE_GIT_TIMEOUT_SECS > config > 60s.
    pub fn git_timeout(&self) -> Duration {
        if let Ok(value) = env::var("SCUTE_GIT_TIMEOUT_SECS")
            && let Ok(secs) = value.trim().parse::<u64>()
        {
            return Duration::from_secs(secs);
        }
        Duration::from_secs(
            self.install
                .git_timeout_secs
                .unwrap_or(DEFAULT_GIT_TIMEOUT_SECS),
        )
    }
}

/// Load and parse a ScuteConfig from a TOML file. Returns default if the file
/// does not exist.
pub fn load_config(config_path: &Path) -> Result<ScuteConfig> {
    if !config_path.exists() {
        return Ok(ScuteConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ScuteConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_api_url() {
        let config = ScuteConfig::default();
        assert!(config.catalog.api_url.is_none());
        assert_eq!(config.catalog_page(), "Addons");
        assert_eq!(config.user_agent(), DEFAULT_USER_AGENT);
        assert_eq!(config.git_program(), "git");
        assert_eq!(config.git_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert!(config.catalog.api_url.is_none());
    }

    #[test]
    fn load_config_parses_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[catalog]
api_url = "https://wiki.example.org/api.php"
page = "Addons"
user_agent = "test-agent/1.0"

[install]
git_program = "/usr/local/bin/git"
git_timeout_secs = 15
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.catalog.api_url.as_deref(),
            Some("https://wiki.example.org/api.php")
        );
        assert_eq!(config.catalog.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(config.git_program(), "/usr/local/bin/git");
        assert_eq!(config.git_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[paths]\ngame_root = \"/games/client\"\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.catalog.api_url.is_none());
        assert!(config.install.git_program.is_none());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[catalog\napi_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }
}
