use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Directory-link capability. One path transparently resolves to another
/// directory's contents: a junction on Windows, a symlink elsewhere. Nothing
/// outside this module branches on platform.
pub trait DirectoryLink {
    /// Create a link at `link` resolving to `source`. The caller is
    /// responsible for clearing whatever occupied `link` beforehand.
    fn create(&self, source: &Path, link: &Path) -> Result<()>;

    /// Remove a link without touching its target.
    fn remove(&self, link: &Path) -> Result<()>;

    /// True when the path is a directory link (checked via symlink metadata,
    /// so a link with a vanished target still counts).
    fn is_link(&self, path: &Path) -> bool {
        fs::symlink_metadata(path)
            .map(|metadata| metadata.file_type().is_symlink())
            .unwrap_or(false)
    }

    /// The link's target, if the path is a readable link.
    fn read_target(&self, link: &Path) -> Option<PathBuf> {
        fs::read_link(link).ok()
    }
}

pub fn platform_linker() -> Box<dyn DirectoryLink> {
    #[cfg(windows)]
    {
        Box::new(JunctionLink)
    }
    #[cfg(not(windows))]
    {
        Box::new(SymlinkLink)
    }
}

/// Windows directory junction, created through `mklink /J` so no elevated
/// privileges are required.
#[cfg(windows)]
pub struct JunctionLink;

#[cfg(windows)]
impl DirectoryLink for JunctionLink {
    fn create(&self, source: &Path, link: &Path) -> Result<()> {
        if !source.is_dir() {
            bail!("link source is not a directory: {}", source.display());
        }
        let output = std::process::Command::new("cmd")
            .args(["/c", "mklink", "/J"])
            .arg(link)
            .arg(source)
            .output()
            .context("failed to run mklink")?;
        if !output.status.success() {
            bail!(
                "mklink /J failed for {}: {}",
                link.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn remove(&self, link: &Path) -> Result<()> {
        fs::remove_dir(link)
            .with_context(|| format!("failed to remove junction {}", link.display()))
    }
}

/// Symbolic directory link for non-Windows platforms.
#[cfg(not(windows))]
pub struct SymlinkLink;

#[cfg(not(windows))]
impl DirectoryLink for SymlinkLink {
    fn create(&self, source: &Path, link: &Path) -> Result<()> {
        if !source.is_dir() {
            bail!("link source is not a directory: {}", source.display());
        }
        std::os::unix::fs::symlink(source, link).with_context(|| {
            format!(
                "failed to link {} -> {}",
                link.display(),
                source.display()
            )
        })
    }

    fn remove(&self, link: &Path) -> Result<()> {
        fs::remove_file(link)
            .with_context(|| format!("failed to remove link {}", link.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::{DirectoryLink, platform_linker};

    #[test]
    fn create_read_and_remove_roundtrip() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("source");
        fs::create_dir_all(&source).expect("create source");
        fs::write(source.join("file.txt"), "payload").expect("write file");
        let link = temp.path().join("link");

        let linker = platform_linker();
        linker.create(&source, &link).expect("create link");

        assert!(linker.is_link(&link));
        assert!(!linker.is_link(&source));
        assert_eq!(linker.read_target(&link), Some(source.clone()));
        assert_eq!(
            fs::read_to_string(link.join("file.txt")).expect("read through link"),
            "payload"
        );

        linker.remove(&link).expect("remove link");
        assert!(!link.exists());
        // target untouched
        assert!(source.join("file.txt").exists());
    }

    #[test]
    fn dangling_link_is_still_recognized() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("source");
        fs::create_dir_all(&source).expect("create source");
        let link = temp.path().join("link");

        let linker = platform_linker();
        linker.create(&source, &link).expect("create link");
        fs::remove_dir_all(&source).expect("remove target");

        assert!(linker.is_link(&link));
        linker.remove(&link).expect("remove dangling link");
        assert!(!linker.is_link(&link));
    }

    #[test]
    fn create_rejects_missing_source() {
        let temp = tempdir().expect("tempdir");
        let linker = platform_linker();
        let err = linker
            .create(&temp.path().join("absent"), &temp.path().join("link"))
            .expect_err("must fail");
        assert!(err.to_string().contains("not a directory"));
    }
}
