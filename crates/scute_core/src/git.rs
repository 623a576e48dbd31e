use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::config::{DEFAULT_GIT_PROGRAM, DEFAULT_GIT_TIMEOUT_SECS};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How the engine reaches the version-control tool. The program name doubles
/// as the test seam: point it at a command that always fails to exercise the
/// fallback paths without a network.
#[derive(Debug, Clone)]
pub struct GitOptions {
    pub program: String,
    pub timeout: Duration,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            program: DEFAULT_GIT_PROGRAM.to_string(),
            timeout: Duration::from_secs(DEFAULT_GIT_TIMEOUT_SECS),
        }
    }
}

/// Clean clone of `url` into `dest`. The caller removes any prior checkout.
pub fn clone(options: &GitOptions, url: &str, dest: &Path) -> Result<()> {
    let dest_str = dest.to_string_lossy().to_string();
    run_git(options, &["clone", "--quiet", url, &dest_str], None)?;
    Ok(())
}

pub fn fetch(options: &GitOptions, workdir: &Path) -> Result<()> {
    run_git(options, &["fetch", "--quiet"], Some(workdir))?;
    Ok(())
}

/// Fast-forward only; a diverged checkout is a failure, not a merge.
pub fn pull_ff(options: &GitOptions, workdir: &Path) -> Result<()> {
    run_git(options, &["pull", "--ff-only", "--quiet"], Some(workdir))?;
    Ok(())
}

/// Number of upstream commits the checkout is behind. Run `fetch` first.
pub fn behind_count(options: &GitOptions, workdir: &Path) -> Result<u64> {
    let stdout = run_git(
        options,
        &["rev-list", "HEAD..origin/HEAD", "--count"],
        Some(workdir),
    )?;
    let trimmed = stdout.trim();
    trimmed
        .parse::<u64>()
        .with_context(|| format!("unexpected rev-list output: {trimmed:?}"))
}

/// Run one git subcommand with a hard deadline. A timeout kills the child and
/// reports the same way as a non-zero exit, so callers see a single failure
/// mode for version-control operations.
fn run_git(options: &GitOptions, args: &[&str], workdir: Option<&Path>) -> Result<String> {
    let mut command = Command::new(&options.program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = workdir {
        command.current_dir(dir);
    }

    debug!("running {} {}", options.program, args.join(" "));
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", options.program))?;

    // Drain the pipes on threads so a chatty child cannot deadlock the wait.
    let stdout_handle = child.stdout.take().map(spawn_reader);
    let stderr_handle = child.stderr.take().map(spawn_reader);

    let started = Instant::now();
    let status = loop {
        match child
            .try_wait()
            .with_context(|| format!("failed to wait for {}", options.program))?
        {
            Some(status) => break status,
            None => {
                if started.elapsed() >= options.timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    bail!(
                        "{} {} timed out after {:?}",
                        options.program,
                        args.first().unwrap_or(&""),
                        options.timeout
                    );
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };

    let stdout = join_reader(stdout_handle);
    let stderr = join_reader(stderr_handle);
    if !status.success() {
        bail!(
            "{} {} failed ({}): {}",
            options.program,
            args.first().unwrap_or(&""),
            status,
            stderr.trim()
        );
    }
    Ok(stdout)
}

fn spawn_reader<R>(mut reader: R) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = String::new();
        let _ = reader.read_to_string(&mut buffer);
        buffer
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
