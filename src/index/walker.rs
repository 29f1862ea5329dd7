use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use walkdir::WalkDir;

use super::checkpoint::Cursor;
use crate::error::{CallIndexError, Result};

/// Metadata for a discovered recording file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Path relative to the agent directory, `/`-separated.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub file_name: String,
    pub extension: String,
    pub file_size: u64,
    pub mtime_ns: i64,
}

impl FileMetadata {
    pub fn key(&self) -> Cursor {
        Cursor::new(self.mtime_ns, self.relative_path.clone())
    }
}

/// Result of walking one agent directory
#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Files strictly after the cursor, sorted by `(mtime, path)`.
    pub candidates: Vec<FileMetadata>,
    /// Every matching file found, keyed by relative path.
    pub listing: HashMap<String, FileMetadata>,
    /// Relative paths whose state is unknown (permission denied, symlink
    /// loops). Store rows at or under these paths must not be reconciled.
    pub unreadable: Vec<String>,
    /// Entries that vanished between listing and stat.
    pub transient_skips: usize,
}

impl WalkOutcome {
    /// Whether `path` lies at or under one of the unreadable entries.
    pub fn is_unreadable(&self, path: &str) -> bool {
        self.unreadable.iter().any(|prefix| {
            path == prefix
                || (path.starts_with(prefix.as_str())
                    && path.as_bytes().get(prefix.len()) == Some(&b'/'))
        })
    }
}

pub(crate) fn mtime_ns(modified: SystemTime) -> i64 {
    match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

/// `/`-joined relative path, or None for names that are not valid UTF-8.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Walk an agent directory and split its files into candidates and listing.
///
/// A file is a candidate when its `(mtime, path)` sorts strictly after
/// `after`; with no cursor every file is a candidate. Symlinks are not
/// followed. Vanished entries are counted as transient; permission and loop
/// errors are logged and recorded in [`WalkOutcome::unreadable`]. Only a
/// failure to read the agent directory itself is returned as an error.
pub fn walk_agent(
    agent_dir: &Path,
    after: Option<&Cursor>,
    extensions: &[String],
) -> Result<WalkOutcome> {
    let mut outcome = WalkOutcome::default();

    for entry in WalkDir::new(agent_dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.depth() == 0 {
                    let message = err.to_string();
                    return Err(match err.into_io_error() {
                        Some(io) => CallIndexError::Io(io),
                        None => CallIndexError::InvalidInput(message),
                    });
                }
                let kind = err.io_error().map(|e| e.kind());
                let rel = err.path().and_then(|p| relative_path(agent_dir, p));
                if kind == Some(ErrorKind::NotFound) {
                    log::debug!("Entry vanished during walk: {:?}", rel);
                    outcome.transient_skips += 1;
                } else {
                    log::warn!("Skipping unreadable entry under {}: {}", agent_dir.display(), err);
                    if let Some(rel) = rel {
                        outcome.unreadable.push(rel);
                    }
                }
                continue;
            }
        };

        if !entry.file_type().is_file() {
            if entry.path_is_symlink() {
                log::debug!("Not following symlink: {}", entry.path().display());
            }
            continue;
        }

        let path = entry.path();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_lowercase();
        if !extensions.iter().any(|e| e == &extension) {
            continue;
        }

        let Some(rel) = relative_path(agent_dir, path) else {
            log::warn!("Skipping file with non UTF-8 name: {}", path.display());
            continue;
        };

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                if err.io_error().map(|e| e.kind()) == Some(ErrorKind::NotFound) {
                    outcome.transient_skips += 1;
                } else {
                    log::warn!("Cannot stat {}: {}", path.display(), err);
                    outcome.unreadable.push(rel);
                }
                continue;
            }
        };

        let modified = match metadata.modified() {
            Ok(t) => t,
            Err(err) => {
                log::warn!("No modification time for {}: {}", path.display(), err);
                outcome.unreadable.push(rel);
                continue;
            }
        };

        let file = FileMetadata {
            file_name: entry.file_name().to_string_lossy().to_string(),
            relative_path: rel.clone(),
            absolute_path: path.to_path_buf(),
            extension,
            file_size: metadata.len(),
            mtime_ns: mtime_ns(modified),
        };

        if after.map_or(true, |cursor| file.key() > *cursor) {
            outcome.candidates.push(file.clone());
        }
        outcome.listing.insert(rel, file);
    }

    outcome.candidates.sort_by_key(|f| f.key());

    log::debug!(
        "Walked {}: {} files, {} candidates, {} unreadable, {} transient",
        agent_dir.display(),
        outcome.listing.len(),
        outcome.candidates.len(),
        outcome.unreadable.len(),
        outcome.transient_skips
    );
    Ok(outcome)
}
