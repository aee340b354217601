//! Session manager: begin/commit/abort lifecycle over disposable workspace
//! copies, with per-base-path commit serialization and crash recovery.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::changeset::{ChangeSet, FileChange, is_clean_relative};
use crate::fingerprint::{digest_bytes, file_digest_opt};
use crate::journal::{self, CommitJournal, JournalRecord, PlanEntry, shadow_path};
use crate::{SessionError, SessionId, SessionResult, SessionState, io_error};

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Root for session copies and commit journals. Session temp paths are
    /// `<scratch>/sessions/<id>`, journals `<scratch>/journal/<id>`.
    pub scratch_root: PathBuf,
    /// Bound on waiting for the per-base-path commit lock.
    pub commit_deadline: Duration,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir().join("gantry-scratch"),
            commit_deadline: Duration::from_secs(30),
        }
    }
}

struct Session {
    base_path: PathBuf,
    temp_path: PathBuf,
    owner: Option<String>,
    state: SessionState,
    /// Content digest of every base file at begin time, for the commit-time
    /// conflict check.
    fingerprints: HashMap<String, String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub rolled_back: usize,
    pub completed: usize,
    pub orphans_removed: usize,
}

/// Creates, tracks, and finalizes isolated workspace sessions.
///
/// Terminal sessions keep their table entry (state stays queryable) but lose
/// their temp copy. The per-base-path lock serializes commits against one
/// base; sessions on unrelated bases never contend.
pub struct SessionManager {
    config: WorkspaceConfig,
    sessions: Mutex<HashMap<SessionId, Session>>,
    commit_locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl SessionManager {
    pub fn new(config: WorkspaceConfig) -> SessionResult<Self> {
        let manager = Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            commit_locks: Mutex::new(HashMap::new()),
        };
        let sessions_dir = manager.sessions_dir();
        fs::create_dir_all(&sessions_dir).map_err(|e| io_error(&sessions_dir, e))?;
        let journal_root = manager.journal_root();
        fs::create_dir_all(&journal_root).map_err(|e| io_error(&journal_root, e))?;
        Ok(manager)
    }

    fn sessions_dir(&self) -> PathBuf {
        self.config.scratch_root.join("sessions")
    }

    fn journal_root(&self) -> PathBuf {
        self.config.scratch_root.join("journal")
    }

    /// Snapshot `base_path` into a fresh private copy and open a session.
    ///
    /// The returned id is the only handle; the component owning the session
    /// is handed the temp path, never the base.
    pub fn begin_session(
        &self,
        base_path: &Path,
        owner: Option<&str>,
    ) -> SessionResult<SessionId> {
        let meta = fs::metadata(base_path)
            .map_err(|_| SessionError::BasePathNotFound(base_path.to_path_buf()))?;
        if !meta.is_dir() {
            return Err(SessionError::BasePathNotFound(base_path.to_path_buf()));
        }
        let base = fs::canonicalize(base_path).map_err(|e| io_error(base_path, e))?;

        let id = Uuid::new_v4().to_string();
        let temp = self.sessions_dir().join(&id);

        // Recorded before the copy so a concurrent recovery pass treats the
        // half-built temp tree as live, not as an orphan.
        {
            let mut sessions = self.sessions.lock().expect("Mutex poisoned");
            sessions.insert(
                id.clone(),
                Session {
                    base_path: base.clone(),
                    temp_path: temp.clone(),
                    owner: owner.map(str::to_string),
                    state: SessionState::Created,
                    fingerprints: HashMap::new(),
                },
            );
        }

        let fingerprints = match copy_tree(&base, &temp) {
            Ok(fingerprints) => fingerprints,
            Err(err) => {
                // Never leave a partial copy behind.
                let mut sessions = self.sessions.lock().expect("Mutex poisoned");
                sessions.remove(&id);
                drop(sessions);
                let _ = fs::remove_dir_all(&temp);
                return Err(SessionError::CopyFailed(err.to_string()));
            }
        };

        log::debug!("session {id}: snapshot of {base:?} ({} files)", fingerprints.len());
        let mut sessions = self.sessions.lock().expect("Mutex poisoned");
        if let Some(session) = sessions.get_mut(&id) {
            session.state = SessionState::Active;
            session.fingerprints = fingerprints;
        }
        Ok(id)
    }

    /// The session's effective workspace root: its private temp copy.
    pub fn workspace_root(&self, id: &str) -> SessionResult<PathBuf> {
        let sessions = self.sessions.lock().expect("Mutex poisoned");
        let session = sessions
            .get(id)
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;
        if session.state.is_terminal() {
            return Err(SessionError::InvalidState {
                id: id.to_string(),
                state: session.state.as_str(),
                expected: "active",
            });
        }
        Ok(session.temp_path.clone())
    }

    pub fn session_state(&self, id: &str) -> Option<SessionState> {
        let sessions = self.sessions.lock().expect("Mutex poisoned");
        sessions.get(id).map(|s| s.state)
    }

    pub fn session_owner(&self, id: &str) -> Option<String> {
        let sessions = self.sessions.lock().expect("Mutex poisoned");
        sessions.get(id).and_then(|s| s.owner.clone())
    }

    /// Diff the sandbox against the base and apply the changes atomically.
    pub async fn commit_session(&self, id: &str) -> SessionResult<()> {
        let (base, temp, fingerprints) = {
            let mut sessions = self.sessions.lock().expect("Mutex poisoned");
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;
            if session.state != SessionState::Active {
                return Err(SessionError::InvalidState {
                    id: id.to_string(),
                    state: session.state.as_str(),
                    expected: "active",
                });
            }
            session.state = SessionState::Diffing;
            (
                session.base_path.clone(),
                session.temp_path.clone(),
                session.fingerprints.clone(),
            )
        };

        // The diff runs at commit time, against the begin-time fingerprints:
        // only what this session touched enters the change set.
        let changes = match ChangeSet::compute(&temp, &fingerprints) {
            Ok(changes) => changes,
            Err(err) => {
                self.finish(id, SessionState::Failed);
                return Err(err);
            }
        };
        if changes.is_empty() {
            log::debug!("session {id}: nothing to commit");
            self.finish(id, SessionState::Committed);
            return Ok(());
        }

        let lock = self.commit_lock(&base);
        let result = self
            .commit_locked(id, &base, &fingerprints, &changes, &lock)
            .await;
        drop(lock);
        self.prune_commit_lock(&base);

        match result {
            Ok(()) => {
                log::info!("session {id}: committed {} changes to {base:?}", changes.len());
                self.finish(id, SessionState::Committed);
                Ok(())
            }
            // The session was settled by someone else while we waited for
            // the lock; its terminal state stands.
            Err(err @ (SessionError::InvalidState { .. } | SessionError::SessionNotFound(_))) => {
                Err(err)
            }
            Err(err) => {
                self.finish(id, SessionState::Failed);
                Err(err)
            }
        }
    }

    /// The serialized half of a commit: take the per-base-path lock, confirm
    /// the session survived the wait, revalidate fingerprints, and apply.
    async fn commit_locked(
        &self,
        id: &str,
        base: &Path,
        fingerprints: &HashMap<String, String>,
        changes: &ChangeSet,
        lock: &AsyncMutex<()>,
    ) -> SessionResult<()> {
        // Commits to one base path are serialized; the wait blocks rather
        // than fails, bounded by the configured deadline.
        let _guard = match timeout(self.config.commit_deadline, lock.lock()).await {
            Ok(guard) => guard,
            Err(_) => return Err(SessionError::CommitTimeout(self.config.commit_deadline)),
        };

        // A concurrent abort may have landed while we waited for the lock;
        // it wins, and nothing may touch the base.
        {
            let mut sessions = self.sessions.lock().expect("Mutex poisoned");
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;
            if session.state != SessionState::Diffing {
                return Err(SessionError::InvalidState {
                    id: id.to_string(),
                    state: session.state.as_str(),
                    expected: "diffing",
                });
            }
            session.state = SessionState::Committing;
        }

        // Conflict check under the lock: a file changed out-of-band and also
        // touched by this session aborts the whole commit before any apply.
        for rel in changes.entries.keys() {
            let current =
                file_digest_opt(&base.join(rel)).map_err(|e| io_error(base.join(rel), e))?;
            if fingerprints.get(rel) != current.as_ref() {
                return Err(SessionError::SessionConflict(rel.clone()));
            }
        }

        self.apply(id, base, changes)
    }

    /// Discard the session's temp copy. Never touches the base path, valid
    /// from any non-terminal state, and a no-op when already terminal.
    pub fn abort_session(&self, id: &str) -> SessionResult<()> {
        {
            let sessions = self.sessions.lock().expect("Mutex poisoned");
            let session = sessions
                .get(id)
                .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;
            if session.state.is_terminal() {
                return Ok(());
            }
        }
        log::debug!("session {id}: aborted");
        self.finish(id, SessionState::Aborted);
        Ok(())
    }

    /// Startup pass over leftovers from a previous process: incomplete
    /// commit journals are rolled back, completed ones reclaimed, orphaned
    /// session copies removed. Must run before any session of this process
    /// exists for the scanned scratch root.
    pub fn recover(&self) -> SessionResult<RecoveryReport> {
        let live: HashSet<String> = {
            let sessions = self.sessions.lock().expect("Mutex poisoned");
            sessions.keys().cloned().collect()
        };
        let mut report = RecoveryReport::default();

        let journal_root = self.journal_root();
        for entry in fs::read_dir(&journal_root).map_err(|e| io_error(&journal_root, e))? {
            let entry = entry.map_err(|e| io_error(&journal_root, e))?;
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let sid = entry.file_name().to_string_lossy().into_owned();
            if live.contains(&sid) {
                continue;
            }
            let records = journal::read_records(&dir).unwrap_or_default();
            if journal::is_complete(&records) {
                report.completed += 1;
            } else {
                log::warn!("rolling back interrupted commit for session {sid}");
                journal::rollback(&dir, &records).map_err(|e| io_error(&dir, e))?;
                report.rolled_back += 1;
            }
            journal::remove_journal_dir(&dir);
        }

        let sessions_dir = self.sessions_dir();
        for entry in fs::read_dir(&sessions_dir).map_err(|e| io_error(&sessions_dir, e))? {
            let entry = entry.map_err(|e| io_error(&sessions_dir, e))?;
            let dir = entry.path();
            let sid = entry.file_name().to_string_lossy().into_owned();
            if dir.is_dir() && !live.contains(&sid) {
                fs::remove_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
                report.orphans_removed += 1;
            }
        }

        Ok(report)
    }

    fn commit_lock(&self, base: &Path) -> Arc<AsyncMutex<()>> {
        let mut locks = self.commit_locks.lock().expect("Mutex poisoned");
        Arc::clone(
            locks
                .entry(base.to_path_buf())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Drop a lock entry nobody holds or waits on anymore. Called after a
    /// commit settles so the map tracks live bases, not every base ever
    /// committed to.
    fn prune_commit_lock(&self, base: &Path) {
        let mut locks = self.commit_locks.lock().expect("Mutex poisoned");
        if locks
            .get(base)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(base);
        }
    }

    /// Terminal transition: record the state and reclaim the temp copy.
    /// A session that is already terminal never changes again.
    fn finish(&self, id: &str, state: SessionState) {
        let temp = {
            let mut sessions = self.sessions.lock().expect("Mutex poisoned");
            match sessions.get_mut(id) {
                Some(session) if !session.state.is_terminal() => {
                    session.state = state;
                    session.fingerprints = HashMap::new();
                    Some(session.temp_path.clone())
                }
                _ => None,
            }
        };
        if let Some(temp) = temp {
            if let Err(err) = fs::remove_dir_all(&temp) {
                if err.kind() != io::ErrorKind::NotFound {
                    log::warn!("failed to reclaim session copy {temp:?}: {err}");
                }
            }
        }
    }

    /// Journaled apply: every entry is staged to a shadow name and renamed
    /// into place, with pre-images backed up first, so a failure rolls this
    /// attempt back entirely and a crash leaves enough on disk to do the
    /// same on restart.
    fn apply(&self, id: &str, base: &Path, changes: &ChangeSet) -> SessionResult<()> {
        let mut journal = CommitJournal::create(&self.journal_root(), id)?;
        journal.append(&JournalRecord::Plan {
            base_path: base.to_string_lossy().into_owned(),
            entries: changes
                .entries
                .iter()
                .map(|(path, change)| PlanEntry {
                    path: path.clone(),
                    kind: change.kind().to_string(),
                })
                .collect(),
        })?;

        let mut outcome = Ok(());
        for (rel, change) in &changes.entries {
            if let Err(err) = apply_one(&mut journal, base, rel, change) {
                outcome = Err(err);
                break;
            }
        }

        match outcome {
            Ok(()) => {
                journal.append(&JournalRecord::Done)?;
                journal.discard();
                Ok(())
            }
            Err(err) => {
                log::warn!("session {id}: apply failed, rolling back: {err}");
                let records = journal::read_records(journal.dir()).unwrap_or_default();
                if let Err(rollback_err) = journal::rollback(journal.dir(), &records) {
                    // The journal stays on disk for the recovery pass.
                    log::error!("session {id}: rollback incomplete: {rollback_err}");
                    return Err(SessionError::DiffApplyFailure(format!(
                        "{err}; rollback incomplete: {rollback_err}"
                    )));
                }
                journal.discard();
                Err(SessionError::DiffApplyFailure(err.to_string()))
            }
        }
    }
}

fn apply_one(
    journal: &mut CommitJournal,
    base: &Path,
    rel: &str,
    change: &FileChange,
) -> SessionResult<()> {
    let rel_path = Path::new(rel);
    if !is_clean_relative(rel_path) {
        return Err(SessionError::DiffApplyFailure(format!(
            "unsafe relative path: {rel}"
        )));
    }
    let target = base.join(rel_path);

    if target.is_file() {
        journal.backup(rel, &target)?;
    }

    match change {
        FileChange::Added(content) | FileChange::Modified(content) => {
            ensure_parents(journal, base, rel_path)?;
            let shadow = shadow_path(&target);
            stage(&shadow, content)?;
            fs::rename(&shadow, &target).map_err(|e| io_error(&target, e))?;
        }
        FileChange::Deleted => {
            fs::remove_file(&target).map_err(|e| io_error(&target, e))?;
        }
    }
    journal.append(&JournalRecord::Applied {
        path: rel.to_string(),
    })
}

/// Create missing parent directories for an added file, journaling each one
/// so rollback can remove them again.
fn ensure_parents(journal: &mut CommitJournal, base: &Path, rel: &Path) -> SessionResult<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut acc = PathBuf::new();
    for component in parent.components() {
        acc.push(component);
        let dir = base.join(&acc);
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => continue,
            Ok(_) => {
                return Err(SessionError::DiffApplyFailure(format!(
                    "'{}' exists in the base path but is not a directory",
                    acc.display()
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&dir).map_err(|e| io_error(&dir, e))?;
                journal.append(&JournalRecord::MkDir {
                    path: acc.to_string_lossy().into_owned(),
                })?;
            }
            Err(err) => return Err(io_error(&dir, err)),
        }
    }
    Ok(())
}

/// Write the staged content and flush it before the rename makes it live.
fn stage(shadow: &Path, content: &[u8]) -> SessionResult<()> {
    let mut file = fs::File::create(shadow).map_err(|e| io_error(shadow, e))?;
    use std::io::Write;
    file.write_all(content).map_err(|e| io_error(shadow, e))?;
    file.sync_all().map_err(|e| io_error(shadow, e))?;
    Ok(())
}

/// Recursive snapshot copy, returning the fingerprint of every copied file.
fn copy_tree(base: &Path, temp: &Path) -> io::Result<HashMap<String, String>> {
    let mut fingerprints = HashMap::new();
    fs::create_dir_all(temp)?;
    for entry in WalkDir::new(base).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(base)
            .map_err(io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = temp.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            let content = fs::read(entry.path())?;
            fs::write(&dest, &content)?;
            fingerprints.insert(rel.to_string_lossy().into_owned(), digest_bytes(&content));
        }
        // Symlinks and specials are not part of the workspace contract.
    }
    Ok(fingerprints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::tree_digest;
    use tempfile::TempDir;

    fn manager(scratch: &TempDir) -> SessionManager {
        SessionManager::new(WorkspaceConfig {
            scratch_root: scratch.path().to_path_buf(),
            commit_deadline: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn tree(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn sessions_are_isolated_until_commit() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("readme.md", "hello")]);

        let s1 = mgr.begin_session(base.path(), None).unwrap();
        let s2 = mgr.begin_session(base.path(), None).unwrap();
        assert_ne!(s1, s2);
        assert_eq!(mgr.session_state(&s1), Some(SessionState::Active));

        let r1 = mgr.workspace_root(&s1).unwrap();
        let r2 = mgr.workspace_root(&s2).unwrap();
        assert_ne!(r1, r2);

        let before = tree_digest(base.path()).unwrap();
        fs::write(r1.join("new.txt"), "invisible").unwrap();
        assert_eq!(tree_digest(base.path()).unwrap(), before);
        assert!(!r2.join("new.txt").exists());

        mgr.commit_session(&s1).await.unwrap();
        assert_eq!(fs::read(base.path().join("new.txt")).unwrap(), b"invisible");
        assert!(!r2.join("new.txt").exists());
        mgr.abort_session(&s2).unwrap();
    }

    #[tokio::test]
    async fn commit_applies_adds_modifies_and_deletes() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("edit.txt", "old"), ("gone.txt", "bye")]);

        let id = mgr.begin_session(base.path(), Some("agent-1")).unwrap();
        let root = mgr.workspace_root(&id).unwrap();
        fs::write(root.join("edit.txt"), "new").unwrap();
        fs::remove_file(root.join("gone.txt")).unwrap();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/fresh.txt"), "hi").unwrap();

        mgr.commit_session(&id).await.unwrap();
        assert_eq!(mgr.session_state(&id), Some(SessionState::Committed));
        assert_eq!(fs::read(base.path().join("edit.txt")).unwrap(), b"new");
        assert!(!base.path().join("gone.txt").exists());
        assert_eq!(fs::read(base.path().join("sub/fresh.txt")).unwrap(), b"hi");

        // The temp copy is reclaimed on the terminal transition.
        assert!(!root.exists());
        assert!(matches!(
            mgr.workspace_root(&id),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn empty_changeset_commits_trivially() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("a.txt", "x")]);
        let id = mgr.begin_session(base.path(), None).unwrap();
        mgr.commit_session(&id).await.unwrap();
        assert_eq!(mgr.session_state(&id), Some(SessionState::Committed));
    }

    #[tokio::test]
    async fn abort_never_touches_base() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("a.txt", "x"), ("d/b.txt", "y")]);
        let before = tree_digest(base.path()).unwrap();

        let id = mgr.begin_session(base.path(), None).unwrap();
        let root = mgr.workspace_root(&id).unwrap();
        fs::write(root.join("a.txt"), "scribbled").unwrap();
        fs::write(root.join("extra.txt"), "more").unwrap();
        fs::remove_file(root.join("d/b.txt")).unwrap();

        mgr.abort_session(&id).unwrap();
        assert_eq!(tree_digest(base.path()).unwrap(), before);
        assert_eq!(mgr.session_state(&id), Some(SessionState::Aborted));

        // Idempotent from a terminal state.
        mgr.abort_session(&id).unwrap();
        assert!(matches!(
            mgr.abort_session("no-such-session"),
            Err(SessionError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn commit_requires_an_active_session() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("a.txt", "x")]);
        let id = mgr.begin_session(base.path(), None).unwrap();
        mgr.commit_session(&id).await.unwrap();

        assert!(matches!(
            mgr.commit_session(&id).await,
            Err(SessionError::InvalidState { .. })
        ));
        assert!(matches!(
            mgr.commit_session("no-such-session").await,
            Err(SessionError::SessionNotFound(_))
        ));
    }

    #[test]
    fn begin_rejects_missing_or_nonstorage_base() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        assert!(matches!(
            mgr.begin_session(Path::new("/no/such/dir"), None),
            Err(SessionError::BasePathNotFound(_))
        ));

        let base = tree(&[("plain.txt", "f")]);
        assert!(matches!(
            mgr.begin_session(&base.path().join("plain.txt"), None),
            Err(SessionError::BasePathNotFound(_))
        ));
    }

    #[tokio::test]
    async fn out_of_band_change_to_touched_file_conflicts() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("edit.txt", "old")]);

        let id = mgr.begin_session(base.path(), None).unwrap();
        let root = mgr.workspace_root(&id).unwrap();
        fs::write(root.join("edit.txt"), "session").unwrap();
        fs::write(base.path().join("edit.txt"), "external").unwrap();

        let err = mgr.commit_session(&id).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionConflict(ref p) if p == "edit.txt"));
        // Nothing applied: the external edit survives.
        assert_eq!(fs::read(base.path().join("edit.txt")).unwrap(), b"external");
        assert_eq!(mgr.session_state(&id), Some(SessionState::Failed));
    }

    #[tokio::test]
    async fn untouched_out_of_band_edits_do_not_conflict() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("mine.txt", "1"), ("theirs.txt", "2")]);

        let id = mgr.begin_session(base.path(), None).unwrap();
        let root = mgr.workspace_root(&id).unwrap();
        fs::write(root.join("mine.txt"), "session").unwrap();
        fs::write(base.path().join("theirs.txt"), "external").unwrap();

        mgr.commit_session(&id).await.unwrap();
        assert_eq!(fs::read(base.path().join("mine.txt")).unwrap(), b"session");
        assert_eq!(fs::read(base.path().join("theirs.txt")).unwrap(), b"external");
    }

    #[tokio::test]
    async fn disjoint_concurrent_commits_both_land() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("a.txt", "a0"), ("b.txt", "b0")]);

        let s1 = mgr.begin_session(base.path(), None).unwrap();
        let s2 = mgr.begin_session(base.path(), None).unwrap();
        fs::write(mgr.workspace_root(&s1).unwrap().join("a.txt"), "a1").unwrap();
        fs::write(mgr.workspace_root(&s2).unwrap().join("b.txt"), "b1").unwrap();

        let (r1, r2) = tokio::join!(mgr.commit_session(&s1), mgr.commit_session(&s2));
        r1.unwrap();
        r2.unwrap();
        assert_eq!(fs::read(base.path().join("a.txt")).unwrap(), b"a1");
        assert_eq!(fs::read(base.path().join("b.txt")).unwrap(), b"b1");
    }

    #[tokio::test]
    async fn second_committer_of_same_file_conflicts() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("shared.txt", "v0")]);

        let s1 = mgr.begin_session(base.path(), None).unwrap();
        let s2 = mgr.begin_session(base.path(), None).unwrap();
        fs::write(mgr.workspace_root(&s1).unwrap().join("shared.txt"), "v1").unwrap();
        fs::write(mgr.workspace_root(&s2).unwrap().join("shared.txt"), "v2").unwrap();

        mgr.commit_session(&s1).await.unwrap();
        let err = mgr.commit_session(&s2).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionConflict(_)));
        assert_eq!(fs::read(base.path().join("shared.txt")).unwrap(), b"v1");
    }

    #[tokio::test]
    async fn failed_apply_rolls_back_the_whole_attempt() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("a.txt", "old")]);

        let id = mgr.begin_session(base.path(), None).unwrap();
        let root = mgr.workspace_root(&id).unwrap();
        // "a.txt" applies first (map order), then "m/b.txt" fails because an
        // out-of-band *file* named "m" blocks the directory.
        fs::write(root.join("a.txt"), "new").unwrap();
        fs::create_dir_all(root.join("m")).unwrap();
        fs::write(root.join("m/b.txt"), "blocked").unwrap();
        fs::write(base.path().join("m"), "obstacle").unwrap();
        let before = tree_digest(base.path()).unwrap();

        let err = mgr.commit_session(&id).await.unwrap_err();
        assert!(matches!(err, SessionError::DiffApplyFailure(_)));
        // a.txt was applied and must have been rolled back.
        assert_eq!(tree_digest(base.path()).unwrap(), before);
        assert_eq!(mgr.session_state(&id), Some(SessionState::Failed));
    }

    #[tokio::test]
    async fn commit_lock_wait_is_bounded() {
        let scratch = TempDir::new().unwrap();
        let mgr = SessionManager::new(WorkspaceConfig {
            scratch_root: scratch.path().to_path_buf(),
            commit_deadline: Duration::from_millis(100),
        })
        .unwrap();
        let base = tree(&[("a.txt", "x")]);

        let id = mgr.begin_session(base.path(), None).unwrap();
        fs::write(mgr.workspace_root(&id).unwrap().join("a.txt"), "y").unwrap();

        let canonical = fs::canonicalize(base.path()).unwrap();
        let lock = mgr.commit_lock(&canonical);
        let _held = lock.lock().await;

        let err = mgr.commit_session(&id).await.unwrap_err();
        assert!(matches!(err, SessionError::CommitTimeout(_)));
        assert_eq!(mgr.session_state(&id), Some(SessionState::Failed));
        assert_eq!(fs::read(base.path().join("a.txt")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn abort_wins_over_a_commit_parked_on_the_lock() {
        let scratch = TempDir::new().unwrap();
        let mgr = Arc::new(manager(&scratch));
        let base = tree(&[("a.txt", "x")]);

        let id = mgr.begin_session(base.path(), None).unwrap();
        fs::write(mgr.workspace_root(&id).unwrap().join("a.txt"), "y").unwrap();

        let canonical = fs::canonicalize(base.path()).unwrap();
        let lock = mgr.commit_lock(&canonical);
        let held = lock.lock().await;

        let committer = {
            let mgr = Arc::clone(&mgr);
            let id = id.clone();
            tokio::spawn(async move { mgr.commit_session(&id).await })
        };
        // Let the commit diff and park on the held lock, then settle the
        // session out from under it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        mgr.abort_session(&id).unwrap();
        assert_eq!(mgr.session_state(&id), Some(SessionState::Aborted));
        drop(held);

        let result = committer.await.unwrap();
        assert!(matches!(result, Err(SessionError::InvalidState { .. })));
        assert_eq!(fs::read(base.path().join("a.txt")).unwrap(), b"x");
        assert_eq!(mgr.session_state(&id), Some(SessionState::Aborted));
    }

    #[tokio::test]
    async fn commit_locks_are_pruned_once_settled() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("a.txt", "x")]);

        let id = mgr.begin_session(base.path(), None).unwrap();
        fs::write(mgr.workspace_root(&id).unwrap().join("a.txt"), "y").unwrap();
        mgr.commit_session(&id).await.unwrap();

        assert!(mgr.commit_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_rolls_back_interrupted_commits() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("mod.txt", "original")]);

        // Fabricate the on-disk state of a commit that crashed after two
        // of three writes: journal present, no Done marker, temp copy left.
        let journal_root = scratch.path().join("journal");
        let mut journal = CommitJournal::create(&journal_root, "dead-session").unwrap();
        journal
            .append(&JournalRecord::Plan {
                base_path: base.path().to_string_lossy().into_owned(),
                entries: vec![
                    PlanEntry { path: "mod.txt".into(), kind: "modify".into() },
                    PlanEntry { path: "new.txt".into(), kind: "add".into() },
                    PlanEntry { path: "other.txt".into(), kind: "add".into() },
                ],
            })
            .unwrap();
        journal.backup("mod.txt", &base.path().join("mod.txt")).unwrap();
        fs::write(base.path().join("mod.txt"), "overwritten").unwrap();
        journal.append(&JournalRecord::Applied { path: "mod.txt".into() }).unwrap();
        fs::write(base.path().join("new.txt"), "added").unwrap();
        journal.append(&JournalRecord::Applied { path: "new.txt".into() }).unwrap();
        fs::create_dir_all(scratch.path().join("sessions/dead-session")).unwrap();

        let report = mgr.recover().unwrap();
        assert_eq!(report.rolled_back, 1);
        assert_eq!(report.orphans_removed, 1);

        assert_eq!(fs::read(base.path().join("mod.txt")).unwrap(), b"original");
        assert!(!base.path().join("new.txt").exists());
        assert!(!journal_root.join("dead-session").exists());
        assert!(!scratch.path().join("sessions/dead-session").exists());
    }

    #[tokio::test]
    async fn recovery_reclaims_completed_journal_residue() {
        let scratch = TempDir::new().unwrap();
        let mgr = manager(&scratch);
        let base = tree(&[("a.txt", "final")]);
        let before = tree_digest(base.path()).unwrap();

        let journal_root = scratch.path().join("journal");
        let mut journal = CommitJournal::create(&journal_root, "done-session").unwrap();
        journal
            .append(&JournalRecord::Plan {
                base_path: base.path().to_string_lossy().into_owned(),
                entries: vec![PlanEntry { path: "a.txt".into(), kind: "modify".into() }],
            })
            .unwrap();
        journal.append(&JournalRecord::Applied { path: "a.txt".into() }).unwrap();
        journal.append(&JournalRecord::Done).unwrap();

        let report = mgr.recover().unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.rolled_back, 0);
        assert_eq!(tree_digest(base.path()).unwrap(), before);
        assert!(!journal_root.join("done-session").exists());
    }
}
