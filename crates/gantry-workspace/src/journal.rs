//! On-disk commit journal: a JSON-lines log of per-file commit progress plus
//! a backup directory, durable across a crash mid-commit. Recovery reads the
//! log and rolls an incomplete commit back to a fully pre-commit base.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{SessionResult, io_error};

const LOG_FILE: &str = "commit.log";
const BACKUPS_DIR: &str = "backups";
const SHADOW_SUFFIX: &str = ".gantry-tmp";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEntry {
    pub path: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    /// Written first: the full intent of the commit.
    Plan {
        base_path: String,
        entries: Vec<PlanEntry>,
    },
    /// A directory created in the base to host an added file.
    MkDir { path: String },
    /// Pre-image of a file about to be overwritten or deleted, copied into
    /// the journal's backup directory.
    Backup { path: String, backup: String },
    /// The rename/remove for this path landed in the base.
    Applied { path: String },
    /// Terminal marker: every entry landed; residue may be reclaimed.
    Done,
}

/// Append-only journal for one commit attempt, scoped by session id under
/// the scratch journal root.
pub struct CommitJournal {
    dir: PathBuf,
    backups: PathBuf,
    log: File,
    next_backup: usize,
}

impl CommitJournal {
    pub fn create(journal_root: &Path, session_id: &str) -> SessionResult<Self> {
        let dir = journal_root.join(session_id);
        let backups = dir.join(BACKUPS_DIR);
        fs::create_dir_all(&backups).map_err(|e| io_error(&backups, e))?;
        let log_path = dir.join(LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| io_error(&log_path, e))?;
        Ok(Self {
            dir,
            backups,
            log,
            next_backup: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&mut self, record: &JournalRecord) -> SessionResult<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| io_error(&self.dir, io::Error::other(e)))?;
        self.log
            .write_all(line.as_bytes())
            .and_then(|_| self.log.write_all(b"\n"))
            .and_then(|_| self.log.sync_data())
            .map_err(|e| io_error(self.dir.join(LOG_FILE), e))?;
        Ok(())
    }

    /// Copy the current base file into the backups directory and log it.
    pub fn backup(&mut self, rel: &str, source: &Path) -> SessionResult<()> {
        let name = format!("{}.bak", self.next_backup);
        self.next_backup += 1;
        let dest = self.backups.join(&name);
        fs::copy(source, &dest).map_err(|e| io_error(source, e))?;
        self.append(&JournalRecord::Backup {
            path: rel.to_string(),
            backup: name,
        })
    }

    /// Remove the journal directory once the commit outcome is settled.
    pub fn discard(self) {
        remove_journal_dir(&self.dir);
    }
}

pub fn remove_journal_dir(dir: &Path) {
    if let Err(err) = fs::remove_dir_all(dir) {
        if err.kind() != io::ErrorKind::NotFound {
            log::warn!("failed to reclaim journal dir {dir:?}: {err}");
        }
    }
}

/// Shadow name a staged write uses before its final rename.
pub(crate) fn shadow_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SHADOW_SUFFIX);
    target.with_file_name(name)
}

/// Read a journal log, tolerating a truncated final line from a crash
/// mid-append.
pub fn read_records(dir: &Path) -> io::Result<Vec<JournalRecord>> {
    let log_path = dir.join(LOG_FILE);
    let file = File::open(&log_path)?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(_) => break,
        }
    }
    Ok(records)
}

pub fn is_complete(records: &[JournalRecord]) -> bool {
    matches!(records.last(), Some(JournalRecord::Done))
}

/// Undo every logged effect of an incomplete commit, restoring the base to
/// its pre-commit content. Safe to run repeatedly.
pub fn rollback(dir: &Path, records: &[JournalRecord]) -> io::Result<()> {
    let mut base: Option<PathBuf> = None;
    let mut plan: Vec<PlanEntry> = Vec::new();
    let mut backups: Vec<(String, String)> = Vec::new();
    let mut applied: Vec<String> = Vec::new();
    let mut mkdirs: Vec<String> = Vec::new();

    for record in records {
        match record {
            JournalRecord::Plan { base_path, entries } => {
                base = Some(PathBuf::from(base_path));
                plan = entries.clone();
            }
            JournalRecord::Backup { path, backup } => backups.push((path.clone(), backup.clone())),
            JournalRecord::Applied { path } => applied.push(path.clone()),
            JournalRecord::MkDir { path } => mkdirs.push(path.clone()),
            JournalRecord::Done => {}
        }
    }

    let Some(base) = base else {
        // No plan was written, so nothing can have touched the base.
        return Ok(());
    };

    for rel in applied.iter().rev() {
        let target = base.join(rel);
        match backups.iter().find(|(path, _)| path == rel) {
            Some((_, backup)) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(dir.join(BACKUPS_DIR).join(backup), &target)?;
            }
            None => match fs::remove_file(&target) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            },
        }
    }

    // Clear any staged shadow the crash left behind.
    for entry in &plan {
        match fs::remove_file(shadow_path(&base.join(&entry.path))) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }

    // Directories created for this commit, innermost first; only empty ones
    // go, anything the base already owned stays.
    for rel in mkdirs.iter().rev() {
        let _ = fs::remove_dir(base.join(rel));
    }

    Ok(())
}
