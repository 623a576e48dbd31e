use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde_json::Value;
use tracing::debug;

const DEFAULT_API_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_DOWNLOAD_TIMEOUT_MS: u64 = 30_000;

/// Hosting-service collaborator: given a source URL, produce a best-effort
/// downloadable archive URL, or none when the host is not recognized.
pub trait ReleaseResolver {
    fn resolve_archive_url(&self, source_url: &str) -> Option<String>;
}

/// Resolver for the hosting services the catalog actually contains.
/// GitHub: latest-release `.zip` asset, else the release zipball, else the
/// default-branch archive. GitLab: the generated default-branch archive.
pub struct HostedReleaseResolver {
    client: Client,
    user_agent: String,
}

impl HostedReleaseResolver {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(http_timeout_ms(DEFAULT_API_TIMEOUT_MS)))
            .build()
            .context("failed to build release API client")?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }

    fn github_release_asset(&self, owner: &str, repo: &str) -> Option<String> {
        let api_url = format!("https://api.github.com/repos/{owner}/{repo}/releases/latest");
        let response = self
            .client
            .get(&api_url)
            .header("User-Agent", self.user_agent.clone())
            .header("Accept", "application/vnd.github.v3+json")
            .send();
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("release lookup for {owner}/{repo} returned {}", response.status());
                return None;
            }
            Err(error) => {
                debug!("release lookup for {owner}/{repo} failed: {error}");
                return None;
            }
        };
        let payload: Value = response.json().ok()?;

        if let Some(assets) = payload.get("assets").and_then(Value::as_array) {
            for asset in assets {
                let name = asset.get("name").and_then(Value::as_str).unwrap_or("");
                if name.to_lowercase().ends_with(".zip")
                    && let Some(url) = asset.get("browser_download_url").and_then(Value::as_str)
                {
                    return Some(url.to_string());
                }
            }
        }
        payload
            .get("zipball_url")
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }
}

impl ReleaseResolver for HostedReleaseResolver {
    fn resolve_archive_url(&self, source_url: &str) -> Option<String> {
        if let Some((owner, repo)) = parse_owner_repo(source_url, "github.com") {
            return Some(
                self.github_release_asset(&owner, &repo)
                    .unwrap_or_else(|| github_branch_archive_url(&owner, &repo)),
            );
        }
        if let Some((owner, repo)) = parse_owner_repo(source_url, "gitlab.com") {
            return Some(gitlab_branch_archive_url(&owner, &repo));
        }
        None
    }
}

/// Pull `owner/repo` out of a source URL for the given host. The `.git`
/// suffix is stripped as a suffix, never as a character set.
pub fn parse_owner_repo(source_url: &str, host: &str) -> Option<(String, String)> {
    let lowered = source_url.to_lowercase();
    let marker = format!("{host}/");
    let start = lowered.find(&marker)? + marker.len();
    let mut segments = source_url[start..]
        .split('/')
        .filter(|segment| !segment.is_empty());
    let owner = segments.next()?.to_string();
    let mut repo = segments.next()?.to_string();
    if let Some(stripped) = repo.strip_suffix(".git") {
        repo = stripped.to_string();
    }
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner, repo))
}

pub fn github_branch_archive_url(owner: &str, repo: &str) -> String {
    format!("https://github.com/{owner}/{repo}/archive/refs/heads/master.zip")
}

pub fn gitlab_branch_archive_url(owner: &str, repo: &str) -> String {
    format!("https://gitlab.com/{owner}/{repo}/-/archive/master/{repo}-master.zip")
}

/// Download an archive into `dest_dir` and return the file path.
pub fn download_archive(url: &str, dest_dir: &Path, user_agent: &str) -> Result<PathBuf> {
    let client = Client::builder()
        .timeout(Duration::from_millis(http_timeout_ms(
            DEFAULT_DOWNLOAD_TIMEOUT_MS,
        )))
        .build()
        .context("failed to build download client")?;

    let mut response = client
        .get(url)
        .header("User-Agent", user_agent.to_string())
        .send()
        .with_context(|| format!("failed to download {url}"))?;
    let status = response.status();
    if !status.is_success() {
        bail!("HTTP {} while downloading {}", status.as_u16(), url);
    }

    let archive_path = dest_dir.join("addon.zip");
    let mut file = File::create(&archive_path)
        .with_context(|| format!("failed to create {}", archive_path.display()))?;
    response
        .copy_to(&mut file)
        .with_context(|| format!("failed to write {}", archive_path.display()))?;
    Ok(archive_path)
}

/// Extract a zip archive into `dest`.
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("failed to read archive {}", archive_path.display()))?;
    archive
        .extract(dest)
        .with_context(|| format!("failed to extract {}", archive_path.display()))?;
    Ok(())
}

fn http_timeout_ms(default: u64) -> u64 {
    env::var("SCUTE_HTTP_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::io::Write;

    use tempfile::tempdir;

    use super::{
        extract_archive, github_branch_archive_url, gitlab_branch_archive_url, parse_owner_repo,
    };

    #[test]
    fn owner_repo_parsing_handles_suffixes_and_depth() {
        assert_eq!(
            parse_owner_repo("https://github.com/Alice/Foo.git", "github.com"),
            Some(("Alice".to_string(), "Foo".to_string()))
        );
        assert_eq!(
            parse_owner_repo("github.com/alice/foo/tree/master", "github.com"),
            Some(("alice".to_string(), "foo".to_string()))
        );
        // suffix strip only, not a character-set strip
        assert_eq!(
            parse_owner_repo("https://github.com/a/digit", "github.com"),
            Some(("a".to_string(), "digit".to_string()))
        );
        assert_eq!(parse_owner_repo("https://example.org/a/b", "github.com"), None);
        assert_eq!(parse_owner_repo("https://github.com/only-owner", "github.com"), None);
    }

    #[test]
    fn branch_archive_urls_have_expected_shape() {
        assert_eq!(
            github_branch_archive_url("a", "foo"),
            "https://github.com/a/foo/archive/refs/heads/master.zip"
        );
        assert_eq!(
            gitlab_branch_archive_url("a", "foo"),
            "https://gitlab.com/a/foo/-/archive/master/foo-master.zip"
        );
    }

    #[test]
    fn zip_roundtrip_extracts_nested_folders() {
        let temp = tempdir().expect("tempdir");
        let archive_path = temp.path().join("addon.zip");

        let file = File::create(&archive_path).expect("create zip");
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        writer
            .start_file("Foo-master/Foo.toc", options)
            .expect("start file");
        writer
            .write_all(b"## Version: 1.2\n")
            .expect("write manifest");
        writer
            .start_file("Foo-master/core.lua", options)
            .expect("start file");
        writer.write_all(b"-- code\n").expect("write code");
        writer.finish().expect("finish zip");

        let extract_dir = temp.path().join("extract");
        extract_archive(&archive_path, &extract_dir).expect("extract");

        let manifest = extract_dir.join("Foo-master").join("Foo.toc");
        assert_eq!(
            fs::read_to_string(manifest).expect("read manifest"),
            "## Version: 1.2\n"
        );
    }

    #[test]
    fn extracting_a_non_archive_fails() {
        let temp = tempdir().expect("tempdir");
        let bogus = temp.path().join("bogus.zip");
        fs::write(&bogus, "not a zip").expect("write");
        let err = extract_archive(&bogus, &temp.path().join("out")).expect_err("must fail");
        assert!(err.to_string().contains("failed to read archive"));
    }
}
