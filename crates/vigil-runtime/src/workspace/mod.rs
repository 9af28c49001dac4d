//! Workspace acquisition — turning a project reference into a local tree.
//!
//! Archive projects stream-extract with cancellation checks. Repository
//! projects walk a fallback chain: branch-archive download over HTTP for
//! each candidate branch, then shallow clone of the same candidates, then
//! shallow clone of the remote's own default branch. Every attempt is
//! timeout-bounded and cancellable, the target directory is wiped between
//! attempts so partial state never leaks forward, and an empty resulting
//! directory is itself a failure.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use vigil_core::task::ProjectSource;
use vigil_core::text::truncate_with_suffix;

/// Byte budget for stderr folded into acquisition errors.
const STDERR_BUDGET: usize = 400;

/// Classified acquisition failure. The classes map directly onto the
/// actionable message shown to the operator.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// Project, branch, or archive does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The remote rejected our credentials.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),
    /// An attempt exceeded its time budget.
    #[error("timed out: {0}")]
    Timeout(String),
    /// The archive or clone produced unusable content.
    #[error("corrupt source: {0}")]
    Corrupt(String),
    /// Acquisition finished but the workspace contains no files.
    #[error("empty workspace: {0}")]
    EmptyWorkspace(String),
    /// Cancellation observed at a safe point. Not a failure.
    #[error("cancelled during acquisition")]
    Cancelled,
}

/// An acquired workspace. Dropping it releases the backing directory.
pub struct Workspace {
    root: PathBuf,
    _temp: Option<tempfile::TempDir>,
}

impl Workspace {
    /// Root directory of the acquired project tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wrap an existing local directory. Nothing is deleted on drop;
    /// useful for embedders and tests that manage the tree themselves.
    pub fn local(root: PathBuf) -> Self {
        Self { root, _temp: None }
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace").field("root", &self.root).finish()
    }
}

/// Provider turning a project reference into a local directory.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Acquire a workspace, observing the task's cancellation token.
    async fn acquire(
        &self,
        project: &ProjectSource,
        cancel: &CancellationToken,
    ) -> Result<Workspace, AcquireError>;
}

/// Default provider: tar extraction, HTTP branch archives, git clones.
pub struct Acquirer {
    http: reqwest::Client,
    attempt_timeout: Duration,
}

impl Acquirer {
    /// Create a provider with the given per-attempt time budget.
    pub fn new(attempt_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            attempt_timeout,
        }
    }
}

#[async_trait]
impl WorkspaceProvider for Acquirer {
    #[instrument(skip(self, project, cancel))]
    async fn acquire(
        &self,
        project: &ProjectSource,
        cancel: &CancellationToken,
    ) -> Result<Workspace, AcquireError> {
        match project {
            ProjectSource::Archive { path } => self.acquire_archive(path, cancel).await,
            ProjectSource::Repository {
                url,
                branch,
                default_branch,
            } => {
                self.acquire_repository(url, branch.as_deref(), default_branch.as_deref(), cancel)
                    .await
            }
        }
    }
}

impl Acquirer {
    async fn acquire_archive(
        &self,
        archive_path: &str,
        cancel: &CancellationToken,
    ) -> Result<Workspace, AcquireError> {
        if !Path::new(archive_path).is_file() {
            return Err(AcquireError::NotFound(format!(
                "archive does not exist: {archive_path}"
            )));
        }
        let temp = make_temp_dir()?;
        let target = temp.path().join("src");
        wipe(&target)?;

        extract_tar(archive_path, &target, self.attempt_timeout, cancel).await?;
        ensure_non_empty(&target)?;

        info!(archive_path, "archive extracted");
        Ok(Workspace {
            root: target,
            _temp: Some(temp),
        })
    }

    async fn acquire_repository(
        &self,
        url: &str,
        branch: Option<&str>,
        default_branch: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Workspace, AcquireError> {
        let candidates = branch_candidates(branch, default_branch);
        let temp = make_temp_dir()?;
        let target = temp.path().join("src");
        let mut attempts: Vec<(String, AcquireError)> = Vec::new();

        // Stage (a): branch archive over HTTP per candidate.
        for candidate in &candidates {
            if cancel.is_cancelled() {
                return Err(AcquireError::Cancelled);
            }
            wipe(&target)?;
            match self
                .download_branch_archive(url, candidate, temp.path(), &target, cancel)
                .await
            {
                Ok(()) => match ensure_non_empty(&target) {
                    Ok(()) => {
                        info!(url, branch = candidate, "acquired via branch archive");
                        return Ok(Workspace {
                            root: target,
                            _temp: Some(temp),
                        });
                    }
                    Err(e) => attempts.push((format!("archive {candidate}"), e)),
                },
                Err(AcquireError::Cancelled) => return Err(AcquireError::Cancelled),
                Err(e) => {
                    debug!(url, branch = candidate, error = %e, "archive attempt failed");
                    attempts.push((format!("archive {candidate}"), e));
                }
            }
        }

        // Stage (b): shallow clone per candidate.
        for candidate in &candidates {
            if cancel.is_cancelled() {
                return Err(AcquireError::Cancelled);
            }
            wipe(&target)?;
            match self.clone_shallow(url, Some(candidate), &target, cancel).await {
                Ok(()) => match ensure_non_empty(&target) {
                    Ok(()) => {
                        info!(url, branch = candidate, "acquired via shallow clone");
                        return Ok(Workspace {
                            root: target,
                            _temp: Some(temp),
                        });
                    }
                    Err(e) => attempts.push((format!("clone {candidate}"), e)),
                },
                Err(AcquireError::Cancelled) => return Err(AcquireError::Cancelled),
                Err(e) => {
                    debug!(url, branch = candidate, error = %e, "clone attempt failed");
                    attempts.push((format!("clone {candidate}"), e));
                }
            }
        }

        // Stage (c): shallow clone of the remote's own default branch.
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        wipe(&target)?;
        match self.clone_shallow(url, None, &target, cancel).await {
            Ok(()) => {
                ensure_non_empty(&target)?;
                info!(url, "acquired via default-branch clone");
                Ok(Workspace {
                    root: target,
                    _temp: Some(temp),
                })
            }
            Err(AcquireError::Cancelled) => Err(AcquireError::Cancelled),
            Err(e) => {
                attempts.push(("clone <remote default>".into(), e));
                Err(summarize_attempts(url, &attempts))
            }
        }
    }

    /// Download `<url>/archive/<branch>.tar.gz`, streaming to disk with a
    /// cancellation check per chunk, then extract into `target`.
    async fn download_branch_archive(
        &self,
        url: &str,
        branch: &str,
        scratch: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(AcquireError::Network(
                "branch archive download requires an http(s) project URL".into(),
            ));
        }
        let base = url.trim_end_matches('/').trim_end_matches(".git");
        let archive_url = format!("{base}/archive/{branch}.tar.gz");

        let response = tokio::select! {
            result = tokio::time::timeout(self.attempt_timeout, self.http.get(&archive_url).send()) => {
                match result {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => return Err(AcquireError::Network(e.to_string())),
                    Err(_) => {
                        return Err(AcquireError::Timeout(format!(
                            "archive request exceeded {}s", self.attempt_timeout.as_secs()
                        )));
                    }
                }
            }
            () = cancel.cancelled() => return Err(AcquireError::Cancelled),
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AcquireError::Auth(format!("{archive_url} returned {status}")));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AcquireError::NotFound(format!("{archive_url} returned 404")));
        }
        if !status.is_success() {
            return Err(AcquireError::Network(format!(
                "{archive_url} returned {status}"
            )));
        }

        let archive_file = scratch.join("download.tar.gz");
        let download = async {
            let mut file = tokio::fs::File::create(&archive_file)
                .await
                .map_err(|e| AcquireError::Corrupt(format!("cannot create download file: {e}")))?;
            let mut response = response;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| AcquireError::Network(e.to_string()))?
            {
                if cancel.is_cancelled() {
                    return Err(AcquireError::Cancelled);
                }
                file.write_all(&chunk)
                    .await
                    .map_err(|e| AcquireError::Corrupt(format!("cannot write download: {e}")))?;
            }
            file.flush()
                .await
                .map_err(|e| AcquireError::Corrupt(format!("cannot flush download: {e}")))?;
            Ok(())
        };
        match tokio::time::timeout(self.attempt_timeout, download).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AcquireError::Timeout(format!(
                    "archive download exceeded {}s",
                    self.attempt_timeout.as_secs()
                )));
            }
        }

        let archive_str = archive_file.to_string_lossy().into_owned();
        extract_tar(&archive_str, target, self.attempt_timeout, cancel).await?;
        let _ = tokio::fs::remove_file(&archive_file).await;
        Ok(())
    }

    /// `git clone --depth 1 [--branch <b>] <url> <target>`.
    async fn clone_shallow(
        &self,
        url: &str,
        branch: Option<&str>,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        let mut cmd = tokio::process::Command::new("git");
        let _ = cmd.arg("clone").arg("--depth").arg("1");
        if let Some(branch) = branch {
            let _ = cmd.arg("--branch").arg(branch);
        }
        let _ = cmd
            .arg(url)
            .arg(target)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());

        let output = run_process(cmd, self.attempt_timeout, cancel).await?;
        if output.success {
            Ok(())
        } else {
            Err(classify_git_failure(&output.stderr))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Candidate branches in attempt order, deduplicated:
/// explicit task branch, project default, "main", "master".
fn branch_candidates(branch: Option<&str>, default_branch: Option<&str>) -> Vec<String> {
    let mut candidates = Vec::new();
    for candidate in [branch, default_branch, Some("main"), Some("master")]
        .into_iter()
        .flatten()
    {
        if !candidates.iter().any(|c| c == candidate) {
            candidates.push(candidate.to_string());
        }
    }
    candidates
}

/// Classify a failed `git clone` by its stderr.
fn classify_git_failure(stderr: &str) -> AcquireError {
    let lower = stderr.to_lowercase();
    let message = truncate_with_suffix(stderr.trim(), STDERR_BUDGET, "...");
    if lower.contains("authentication")
        || lower.contains("could not read username")
        || lower.contains("permission denied")
        || lower.contains("403")
    {
        AcquireError::Auth(message)
    } else if lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("couldn't find remote ref")
    {
        AcquireError::NotFound(message)
    } else {
        AcquireError::Network(message)
    }
}

/// Fold exhausted attempts into one actionable error.
///
/// Class priority: auth (fix credentials) over timeout (raise the budget or
/// check connectivity) over network over not-found.
fn summarize_attempts(url: &str, attempts: &[(String, AcquireError)]) -> AcquireError {
    let tried: Vec<&str> = attempts.iter().map(|(label, _)| label.as_str()).collect();
    let tried = tried.join(", ");
    let pick = |class: fn(&AcquireError) -> bool| {
        attempts
            .iter()
            .find(|(_, e)| class(e))
            .map(|(label, e)| format!("{label}: {e}"))
    };

    if let Some(detail) = pick(|e| matches!(e, AcquireError::Auth(_))) {
        AcquireError::Auth(format!(
            "cannot access {url}; check repository credentials ({detail}; tried {tried})"
        ))
    } else if let Some(detail) = pick(|e| matches!(e, AcquireError::Timeout(_))) {
        AcquireError::Timeout(format!(
            "acquisition of {url} timed out ({detail}; tried {tried})"
        ))
    } else if let Some(detail) = pick(|e| matches!(e, AcquireError::Network(_))) {
        AcquireError::Network(format!(
            "cannot reach {url} ({detail}; tried {tried})"
        ))
    } else {
        AcquireError::NotFound(format!(
            "no acquirable branch at {url}; verify the URL and branch names (tried {tried})"
        ))
    }
}

struct ProcessResult {
    success: bool,
    stderr: String,
}

/// Run a subprocess raced against the timeout and cancellation token.
/// The child is killed on either losing path.
async fn run_process(
    mut cmd: tokio::process::Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ProcessResult, AcquireError> {
    let mut child = cmd
        .spawn()
        .map_err(|e| AcquireError::Network(format!("failed to spawn process: {e}")))?;

    let stderr_pipe = child.stderr.take();
    let stderr_handle = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr_pipe {
            use tokio::io::AsyncReadExt;
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    tokio::select! {
        status = child.wait() => {
            let status = status
                .map_err(|e| AcquireError::Network(format!("process wait failed: {e}")))?;
            let stderr_bytes = stderr_handle.await.unwrap_or_default();
            Ok(ProcessResult {
                success: status.success(),
                stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            })
        }
        () = tokio::time::sleep(timeout) => {
            let _ = child.kill().await;
            stderr_handle.abort();
            warn!(timeout_secs = timeout.as_secs(), "acquisition process timed out");
            Err(AcquireError::Timeout(format!(
                "process exceeded {}s", timeout.as_secs()
            )))
        }
        () = cancel.cancelled() => {
            let _ = child.kill().await;
            stderr_handle.abort();
            debug!("acquisition process cancelled");
            Err(AcquireError::Cancelled)
        }
    }
}

/// Extract a `.tar`/`.tar.gz` archive into `target` via the system tar.
async fn extract_tar(
    archive_path: &str,
    target: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), AcquireError> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| AcquireError::Corrupt(format!("cannot create target dir: {e}")))?;

    let mut cmd = tokio::process::Command::new("tar");
    let _ = cmd
        .arg("-xf")
        .arg(archive_path)
        .arg("-C")
        .arg(target)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped());

    let output = run_process(cmd, timeout, cancel).await?;
    if output.success {
        Ok(())
    } else {
        Err(AcquireError::Corrupt(format!(
            "tar extraction failed: {}",
            truncate_with_suffix(output.stderr.trim(), STDERR_BUDGET, "...")
        )))
    }
}

/// Remove and recreate a directory so no partial state leaks forward.
fn wipe(dir: &Path) -> Result<(), AcquireError> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .map_err(|e| AcquireError::Corrupt(format!("cannot wipe target dir: {e}")))?;
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| AcquireError::Corrupt(format!("cannot create target dir: {e}")))?;
    Ok(())
}

/// An acquired workspace must contain at least one regular file.
fn ensure_non_empty(dir: &Path) -> Result<(), AcquireError> {
    let has_file = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .any(|entry| entry.file_type().is_file());
    if has_file {
        Ok(())
    } else {
        Err(AcquireError::EmptyWorkspace(format!(
            "{} contains no files",
            dir.display()
        )))
    }
}

fn make_temp_dir() -> Result<tempfile::TempDir, AcquireError> {
    tempfile::tempdir().map_err(|e| AcquireError::Corrupt(format!("cannot create temp dir: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
