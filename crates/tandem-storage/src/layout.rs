//! On-disk layout shared by the directory and git stores.
//!
//! ```text
//! <root>/catalog.json          {"format": 1, "videos": {...}, "analyses": {...}}
//! <root>/transcripts/<id>.txt  one file per transcript
//! <root>/work/<id>.json        raw analysis responses
//! <root>/digests/<period>.json digest history of one period, oldest first
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tandem_catalog::PipelineSnapshot;
use tandem_core::types::{
    validate_period, AnalysisResult, Digest, TranscriptBlob, VideoId, VideoRecord,
};

use crate::error::StorageError;

pub const LAYOUT_FORMAT: u32 = 1;
pub const CATALOG_FILE: &str = "catalog.json";
pub const TRANSCRIPTS_DIR: &str = "transcripts";
pub const WORK_DIR: &str = "work";
pub const DIGESTS_DIR: &str = "digests";

#[derive(Serialize, Deserialize)]
struct CatalogFile<'a> {
    format: u32,
    #[serde(default)]
    videos: Cow<'a, BTreeMap<VideoId, VideoRecord>>,
    #[serde(default)]
    analyses: Cow<'a, BTreeMap<VideoId, Vec<AnalysisResult>>>,
}

/// Read a snapshot from `root`. A missing catalog file is an empty snapshot.
pub fn read_layout(root: &Path) -> Result<PipelineSnapshot, StorageError> {
    let catalog_path = root.join(CATALOG_FILE);
    if !catalog_path.exists() {
        return Ok(PipelineSnapshot::new());
    }

    let content = fs::read_to_string(&catalog_path)?;
    let file: CatalogFile<'static> = serde_json::from_str(&content)?;
    if file.format != LAYOUT_FORMAT {
        return Err(StorageError::Corrupt(format!(
            "unsupported catalog format {} in {}",
            file.format,
            catalog_path.display()
        )));
    }

    let mut snapshot = PipelineSnapshot {
        videos: file.videos.into_owned(),
        analyses: file.analyses.into_owned(),
        ..PipelineSnapshot::default()
    };

    for (id, path) in list_entries(&root.join(TRANSCRIPTS_DIR), "txt", VideoId::parse)? {
        let text = fs::read_to_string(&path)?;
        let fetched_at = snapshot
            .videos
            .get(&id)
            .and_then(|r| r.transcript_fetched_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        snapshot
            .transcripts
            .insert(id, TranscriptBlob::new(text, fetched_at));
    }

    for (id, path) in list_entries(&root.join(WORK_DIR), "json", VideoId::parse)? {
        snapshot.scratch.insert(id, fs::read_to_string(&path)?);
    }

    for (period, path) in list_entries(&root.join(DIGESTS_DIR), "json", parse_period)? {
        let history: Vec<Digest> = serde_json::from_str(&fs::read_to_string(&path)?)?;
        snapshot.digests.insert(period, history);
    }

    Ok(snapshot)
}

/// Write `snapshot` under `root`, replacing whatever layout was there.
///
/// Files for blobs or scratch entries that no longer exist are removed, and
/// unchanged files are rewritten byte-identically so a git diff stays empty.
pub fn write_layout(root: &Path, snapshot: &PipelineSnapshot) -> Result<(), StorageError> {
    fs::create_dir_all(root)?;

    let file = CatalogFile {
        format: LAYOUT_FORMAT,
        videos: Cow::Borrowed(&snapshot.videos),
        analyses: Cow::Borrowed(&snapshot.analyses),
    };
    let mut json = serde_json::to_string_pretty(&file)?;
    json.push('\n');
    write_atomic(&root.join(CATALOG_FILE), json.as_bytes())?;

    let transcripts: BTreeMap<String, &[u8]> = snapshot
        .transcripts
        .iter()
        .map(|(id, blob)| (id.to_string(), blob.text.as_bytes()))
        .collect();
    sync_dir(&root.join(TRANSCRIPTS_DIR), "txt", &transcripts)?;

    let scratch: BTreeMap<String, &[u8]> = snapshot
        .scratch
        .iter()
        .map(|(id, raw)| (id.to_string(), raw.as_bytes()))
        .collect();
    sync_dir(&root.join(WORK_DIR), "json", &scratch)?;

    let mut digests: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (period, history) in &snapshot.digests {
        let mut json = serde_json::to_string_pretty(history)?;
        json.push('\n');
        digests.insert(period.clone(), json.into_bytes());
    }
    sync_dir(&root.join(DIGESTS_DIR), "json", &digests)?;

    Ok(())
}

/// Write to a sibling temp file, then rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| StorageError::Corrupt(format!("no file name in {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn sync_dir<B: AsRef<[u8]>>(
    dir: &Path,
    extension: &str,
    entries: &BTreeMap<String, B>,
) -> Result<(), StorageError> {
    fs::create_dir_all(dir)?;
    for (stem, path) in list_files(dir, extension)? {
        if !entries.contains_key(&stem) {
            fs::remove_file(&path)?;
        }
    }
    for (stem, bytes) in entries {
        let bytes = bytes.as_ref();
        let path = dir.join(format!("{}.{}", stem, extension));
        let unchanged = fs::read(&path).map(|old| old == bytes).unwrap_or(false);
        if !unchanged {
            write_atomic(&path, bytes)?;
        }
    }
    Ok(())
}

fn parse_period(stem: &str) -> Result<String, String> {
    validate_period(stem).map(|_| stem.to_string())
}

/// `<key>.<extension>` files in `dir`. Stems `parse` refuses are skipped
/// with a warning.
fn list_entries<K: Ord>(
    dir: &Path,
    extension: &str,
    parse: impl Fn(&str) -> Result<K, String>,
) -> Result<Vec<(K, PathBuf)>, StorageError> {
    let mut entries = Vec::new();
    for (stem, path) in list_files(dir, extension)? {
        match parse(&stem) {
            Ok(key) => entries.push((key, path)),
            Err(e) => warn!(path = %path.display(), "Skipping unrecognized file: {}", e),
        }
    }
    entries.sort();
    Ok(entries)
}

/// Non-hidden `*.<extension>` files in `dir`, by stem.
fn list_files(dir: &Path, extension: &str) -> Result<Vec<(String, PathBuf)>, StorageError> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with('.') {
            continue;
        }
        files.push((stem.to_string(), path));
    }
    Ok(files)
}
