use std::path::Path;
use std::process::Command;

use chrono::Utc;
use tandem_catalog::{CatalogStore, PipelineSnapshot};
use tandem_core::types::{SourceMeta, VideoId};
use tandem_storage::{CommitOutcome, GitStore, GitStoreOptions, Revision, VersionedStore};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn bare_remote(dir: &Path) -> String {
    let remote = dir.join("remote.git");
    let status = Command::new("git")
        .args(["init", "--bare", "--quiet"])
        .arg(&remote)
        .status()
        .unwrap();
    assert!(status.success());
    remote.to_string_lossy().into_owned()
}

fn store(dir: &Path, name: &str, remote_url: &str) -> GitStore {
    GitStore::new(GitStoreOptions {
        clone_dir: dir.join(name),
        remote_url: Some(remote_url.to_string()),
        remote: "origin".to_string(),
        branch: "main".to_string(),
        subdir: "pipeline".to_string(),
        token: None,
        author_name: "tandem-test".to_string(),
        author_email: "tandem-test@localhost".to_string(),
    })
}

fn snapshot_with(ids: &[&str]) -> PipelineSnapshot {
    let mut catalog = CatalogStore::new(PipelineSnapshot::new());
    for id in ids {
        catalog
            .upsert(
                VideoId::parse(id).unwrap(),
                SourceMeta {
                    channel_id: "c".to_string(),
                    channel_name: "C".to_string(),
                    title: format!("Video {}", id),
                    published_at: None,
                    url: None,
                },
                Utc::now(),
            )
            .unwrap();
    }
    catalog.into_parts().0
}

#[tokio::test]
async fn test_git_store_commit_pull_and_rejection() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let remote = bare_remote(dir.path());
    let a = store(dir.path(), "clone-a", &remote);
    let b = store(dir.path(), "clone-b", &remote);

    // Both clones start from the empty remote.
    let checkout_a = a.pull().await.unwrap();
    let checkout_b = b.pull().await.unwrap();
    assert!(checkout_a.revision.is_initial());
    assert!(checkout_b.snapshot.is_empty());

    let first = snapshot_with(&["v1"]);
    let outcome = a
        .commit(&checkout_a.revision, &first, "add v1")
        .await
        .unwrap();
    let CommitOutcome::Committed(revision) = outcome else {
        panic!("first commit should land");
    };
    assert!(!revision.is_initial());
    assert!(dir.path().join("clone-a/pipeline/catalog.json").is_file());

    // B still believes the store is empty; its push must be rejected.
    let stale = b
        .commit(&checkout_b.revision, &snapshot_with(&["v2"]), "add v2")
        .await
        .unwrap();
    assert_eq!(stale, CommitOutcome::Rejected);

    let refreshed = b.pull().await.unwrap();
    assert_eq!(refreshed.revision, revision);
    assert_eq!(refreshed.snapshot, first);
}

#[tokio::test]
async fn test_git_store_without_clone_or_url_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = GitStore::new(GitStoreOptions {
        clone_dir: dir.path().join("missing"),
        remote_url: None,
        remote: "origin".to_string(),
        branch: "main".to_string(),
        subdir: "pipeline".to_string(),
        token: None,
        author_name: "t".to_string(),
        author_email: "t@localhost".to_string(),
    });
    assert!(store.pull().await.is_err());
    assert!(store
        .commit(&Revision::initial(), &PipelineSnapshot::new(), "x")
        .await
        .is_err());
}
