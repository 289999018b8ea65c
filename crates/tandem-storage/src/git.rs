//! Git-backed versioned store.
//!
//! A local clone of the shared repository holds the layout under `subdir`.
//! Pull is `fetch` + `reset --hard <remote>/<branch>` + `clean`; commit
//! writes the layout, commits, and pushes without ever forcing. A rejected
//! push means the remote advanced and is reported as `Rejected`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tandem_catalog::PipelineSnapshot;

use crate::error::StorageError;
use crate::layout::{read_layout, write_layout};
use crate::store::{Checkout, CommitOutcome, Revision, VersionedStore};

#[derive(Debug, Clone)]
pub struct GitStoreOptions {
    pub clone_dir: PathBuf,
    /// Cloned from when `clone_dir` holds no repository yet.
    pub remote_url: Option<String>,
    pub remote: String,
    pub branch: String,
    pub subdir: String,
    /// Sent as a bearer authorization header, never written to disk.
    pub token: Option<String>,
    pub author_name: String,
    pub author_email: String,
}

pub struct GitStore {
    options: GitStoreOptions,
    // Serializes operations on the shared working tree.
    worktree: Mutex<()>,
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitStore {
    pub fn new(options: GitStoreOptions) -> Self {
        Self {
            options,
            worktree: Mutex::new(()),
        }
    }

    fn layout_root(&self) -> PathBuf {
        self.options.clone_dir.join(&self.options.subdir)
    }

    fn remote_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.options.remote, self.options.branch)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(token) = &self.options.token {
            cmd.arg("-c")
                .arg(format!("http.extraHeader=Authorization: Bearer {}", token));
        }
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<GitOutput, StorageError> {
        debug!(args = ?args, "Running git");
        let output = self
            .command()
            .arg("-C")
            .arg(&self.options.clone_dir)
            .args(args)
            .output()
            .await?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn git(&self, args: &[&str]) -> Result<String, StorageError> {
        let output = self.run(args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(StorageError::Git {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: output.stderr,
            })
        }
    }

    async fn ensure_clone(&self) -> Result<(), StorageError> {
        if self.options.clone_dir.join(".git").exists() {
            return Ok(());
        }
        let Some(url) = &self.options.remote_url else {
            return Err(StorageError::Corrupt(format!(
                "no git repository at {} and no remote_url to clone from",
                self.options.clone_dir.display()
            )));
        };
        if let Some(parent) = self.options.clone_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!(dir = %self.options.clone_dir.display(), "Cloning shared store");
        let output = self
            .command()
            .arg("clone")
            .arg("--origin")
            .arg(&self.options.remote)
            .arg(url)
            .arg(&self.options.clone_dir)
            .output()
            .await?;
        if !output.status.success() {
            return Err(StorageError::Git {
                command: "clone".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn head(&self) -> Result<Revision, StorageError> {
        let output = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"]).await?;
        if output.success && !output.stdout.is_empty() {
            Ok(Revision::new(output.stdout))
        } else {
            Ok(Revision::initial())
        }
    }

    /// Discard local state and move to the remote branch tip.
    async fn sync_to_remote(&self) -> Result<Revision, StorageError> {
        self.git(&["fetch", "--prune", "--quiet", &self.options.remote])
            .await?;
        let remote_ref = self.remote_ref();
        let exists = self
            .run(&["rev-parse", "--verify", "--quiet", &remote_ref])
            .await?
            .success;
        if exists {
            self.git(&["checkout", "--quiet", "-B", &self.options.branch, &remote_ref])
                .await?;
            self.git(&["reset", "--quiet", "--hard", &remote_ref]).await?;
            self.git(&["clean", "--quiet", "-fdx"]).await?;
        } else {
            // The branch does not exist remotely yet: start from an empty tree.
            let _ = self.run(&["update-ref", "-d", "HEAD"]).await?;
            self.git(&["read-tree", "--empty"]).await?;
            self.git(&["clean", "--quiet", "-fdx"]).await?;
        }
        self.head().await
    }
}

fn is_push_rejection(stderr: &str) -> bool {
    ["rejected", "non-fast-forward", "fetch first", "stale info"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

#[async_trait]
impl VersionedStore for GitStore {
    fn name(&self) -> &str {
        "git"
    }

    async fn pull(&self) -> Result<Checkout, StorageError> {
        let _guard = self.worktree.lock().await;
        self.ensure_clone().await?;
        let revision = self.sync_to_remote().await?;
        let root = self.layout_root();
        let snapshot = tokio::task::spawn_blocking(move || read_layout(&root)).await??;
        debug!(%revision, videos = snapshot.videos.len(), "Pulled git store");
        Ok(Checkout { revision, snapshot })
    }

    async fn commit(
        &self,
        base: &Revision,
        snapshot: &PipelineSnapshot,
        message: &str,
    ) -> Result<CommitOutcome, StorageError> {
        let _guard = self.worktree.lock().await;
        self.ensure_clone().await?;

        let head = self.head().await?;
        if &head != base {
            debug!(%base, %head, "Local clone moved since pull");
            return Ok(CommitOutcome::Rejected);
        }

        let root = self.layout_root();
        let owned = snapshot.clone();
        tokio::task::spawn_blocking(move || write_layout(&root, &owned)).await??;

        let subdir = self.options.subdir.as_str();
        self.git(&["add", "-A", "--", subdir]).await?;
        let unchanged = self
            .run(&["diff", "--cached", "--quiet", "--", subdir])
            .await?
            .success;
        if unchanged && !base.is_initial() {
            debug!(%base, "Nothing to commit");
            return Ok(CommitOutcome::Committed(base.clone()));
        }

        let name = format!("user.name={}", self.options.author_name);
        let email = format!("user.email={}", self.options.author_email);
        self.git(&[
            "-c",
            &name,
            "-c",
            &email,
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--quiet",
            "--allow-empty",
            "-m",
            message,
        ])
        .await?;

        let refspec = format!("HEAD:refs/heads/{}", self.options.branch);
        let push = self
            .run(&["push", "--quiet", &self.options.remote, &refspec])
            .await?;
        if !push.success {
            if is_push_rejection(&push.stderr) {
                warn!(%base, "Push rejected, remote advanced");
                if let Err(e) = self.sync_to_remote().await {
                    warn!("Failed to reset clone after rejected push: {}", e);
                }
                return Ok(CommitOutcome::Rejected);
            }
            return Err(StorageError::Git {
                command: "push".to_string(),
                stderr: push.stderr,
            });
        }

        let revision = self.head().await?;
        info!(%revision, "Pushed snapshot to git store");
        Ok(CommitOutcome::Committed(revision))
    }
}
