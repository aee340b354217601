//! Change sets: the file-level difference between a session's sandbox and
//! the begin-time content of its base path, computed at commit time and
//! discarded after apply.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Component, Path};

use walkdir::WalkDir;

use crate::fingerprint::digest_bytes;
use crate::{SessionError, SessionResult, io_error};

#[derive(Debug, Clone, PartialEq)]
pub enum FileChange {
    Added(Vec<u8>),
    Modified(Vec<u8>),
    Deleted,
}

impl FileChange {
    pub fn kind(&self) -> &'static str {
        match self {
            FileChange::Added(_) => "add",
            FileChange::Modified(_) => "modify",
            FileChange::Deleted => "delete",
        }
    }
}

/// Ordered map of relative path -> change. The ordering makes apply and
/// rollback deterministic.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChangeSet {
    pub entries: BTreeMap<String, FileChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Walk the sandbox at commit time and compare every file against the
    /// begin-time digests. Only what the session itself touched shows up;
    /// files that moved in the base out-of-band are the conflict check's
    /// business, not the diff's.
    pub fn compute(temp: &Path, baseline: &HashMap<String, String>) -> SessionResult<Self> {
        let mut entries = BTreeMap::new();
        let mut seen = HashSet::new();

        for entry in WalkDir::new(temp).follow_links(false) {
            let entry =
                entry.map_err(|e| SessionError::DiffApplyFailure(format!("walk failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = relative_key(entry.path(), temp)?;
            let content = fs::read(entry.path()).map_err(|e| io_error(entry.path(), e))?;
            match baseline.get(&rel) {
                None => {
                    entries.insert(rel, FileChange::Added(content));
                }
                Some(begin_digest) => {
                    seen.insert(rel.clone());
                    if digest_bytes(&content) != *begin_digest {
                        entries.insert(rel, FileChange::Modified(content));
                    }
                }
            }
        }

        for rel in baseline.keys() {
            if !seen.contains(rel) {
                entries.insert(rel.clone(), FileChange::Deleted);
            }
        }

        Ok(ChangeSet { entries })
    }
}

/// Relative key for a walked path, rejecting anything that could escape the
/// tree it belongs to.
fn relative_key(path: &Path, root: &Path) -> SessionResult<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| SessionError::DiffApplyFailure(format!("path escapes tree: {path:?}")))?;
    if !is_clean_relative(rel) {
        return Err(SessionError::DiffApplyFailure(format!(
            "unsafe relative path: {rel:?}"
        )));
    }
    Ok(rel.to_string_lossy().into_owned())
}

pub(crate) fn is_clean_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}
