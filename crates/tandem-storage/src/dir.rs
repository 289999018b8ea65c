//! Revisioned directory store for single-host deployments.
//!
//! Every revision is a complete layout directory under `revs/`. `HEAD` names
//! the current one and is switched by atomic rename while holding an
//! exclusive `.lock` file. Revisions older than the previous one are pruned.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use tandem_catalog::PipelineSnapshot;

use crate::error::StorageError;
use crate::layout::{read_layout, write_atomic, write_layout};
use crate::store::{Checkout, CommitOutcome, Revision, VersionedStore};

const HEAD_FILE: &str = "HEAD";
const LOCK_FILE: &str = ".lock";
const REVS_DIR: &str = "revs";

/// Locks older than this are assumed to belong to a killed process.
const STALE_LOCK_AGE: Duration = Duration::from_secs(600);

const PULL_ATTEMPTS: u32 = 5;

pub struct DirStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn rev_name(number: u64) -> String {
    format!("rev-{:06}", number)
}

fn parse_rev(name: &str) -> Option<u64> {
    name.strip_prefix("rev-")?.parse().ok()
}

fn revision_of(head: Option<u64>) -> Revision {
    match head {
        Some(n) => Revision::new(rev_name(n)),
        None => Revision::initial(),
    }
}

fn read_head(root: &Path) -> Result<Option<u64>, StorageError> {
    let path = root.join(HEAD_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)?;
    parse_rev(raw.trim())
        .map(Some)
        .ok_or_else(|| StorageError::Corrupt(format!("bad HEAD contents: {:?}", raw.trim())))
}

/// Exclusive lock held for the duration of a commit.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(root: &Path, timeout: Duration) -> Result<Self, StorageError> {
        let path = root.join(LOCK_FILE);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!(path = %path.display(), "Removing stale store lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(StorageError::Lock(format!(
                            "{} held for more than {:?}",
                            path.display(),
                            timeout
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to release store lock: {}", e);
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

/// Pulls are lock-free. A pull that raced with the prune of the revision it
/// was reading is started over.
fn pull_blocking(root: &Path) -> Result<Checkout, StorageError> {
    for attempt in 1..=PULL_ATTEMPTS {
        let Some(n) = read_head(root)? else {
            return Ok(Checkout {
                revision: Revision::initial(),
                snapshot: PipelineSnapshot::new(),
            });
        };
        let read = read_layout(&root.join(REVS_DIR).join(rev_name(n)));
        // Revision n is only pruned after HEAD has moved to n + 2.
        let pruned = read_head(root)?.is_some_and(|head| n + 1 < head);
        if !pruned {
            return read.map(|snapshot| Checkout {
                revision: revision_of(Some(n)),
                snapshot,
            });
        }
        debug!(revision = %rev_name(n), attempt, "Revision pruned during pull, reading again");
    }
    Err(StorageError::Lock(format!(
        "HEAD moved during {} consecutive pulls",
        PULL_ATTEMPTS
    )))
}

fn commit_blocking(
    root: &Path,
    lock_timeout: Duration,
    base: &Revision,
    snapshot: &PipelineSnapshot,
    message: &str,
) -> Result<CommitOutcome, StorageError> {
    fs::create_dir_all(root.join(REVS_DIR))?;
    let _lock = LockGuard::acquire(root, lock_timeout)?;

    let head = read_head(root)?;
    if &revision_of(head) != base {
        debug!(%base, current = %revision_of(head), "Directory store advanced");
        return Ok(CommitOutcome::Rejected);
    }

    let next = head.unwrap_or(0) + 1;
    let name = rev_name(next);
    let revs = root.join(REVS_DIR);
    let staging = revs.join(format!(".{}.staging", name));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    write_layout(&staging, snapshot)?;
    fs::write(staging.join("MESSAGE"), message)?;
    fs::rename(&staging, revs.join(&name))?;
    write_atomic(&root.join(HEAD_FILE), format!("{}\n", name).as_bytes())?;

    prune(&revs, next)?;
    info!(revision = %name, "Committed snapshot to directory store");
    Ok(CommitOutcome::Committed(Revision::new(name)))
}

/// Remove revisions older than the previous one, and leftover staging dirs.
fn prune(revs: &Path, head: u64) -> Result<(), StorageError> {
    for entry in fs::read_dir(revs)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let remove = match parse_rev(&name) {
            Some(n) => n + 1 < head,
            None => name.ends_with(".staging"),
        };
        if remove {
            debug!(revision = %name, "Pruning old revision");
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

#[async_trait]
impl VersionedStore for DirStore {
    fn name(&self) -> &str {
        "dir"
    }

    async fn pull(&self) -> Result<Checkout, StorageError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || pull_blocking(&root)).await?
    }

    async fn commit(
        &self,
        base: &Revision,
        snapshot: &PipelineSnapshot,
        message: &str,
    ) -> Result<CommitOutcome, StorageError> {
        let root = self.root.clone();
        let lock_timeout = self.lock_timeout;
        let base = base.clone();
        let snapshot = snapshot.clone();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            commit_blocking(&root, lock_timeout, &base, &snapshot, &message)
        })
        .await?
    }
}
