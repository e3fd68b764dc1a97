//! Git-backed content repository.
//!
//! The local side of the sync is an ordinary git working tree. Beyond file
//! writes, staging and commits, the repository carries two pieces of sync
//! bookkeeping:
//!
//! * a force-moved tag (`synced-to-remote`) marking the last commit fully
//!   reconciled with the server, used as the diff baseline;
//! * git notes under a dedicated ref (`refs/notes/automation-sync`) attaching
//!   a [`SyncNote`] — remote id, timestamp, last error — to the exact blob it
//!   was computed from. Keeping notes out of the default notes ref keeps them
//!   out of ordinary history.
//!
//! Everything shells out to the `git` binary; there is no embedded git
//! implementation here.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use tracing::{debug, warn};

use crate::mode::Mode;

/// Notes ref holding sync state, separate from regular history.
pub const NOTES_REF: &str = "refs/notes/automation-sync";

/// Tag marking the last commit known to be reconciled with the server.
pub const SYNC_TAG: &str = "synced-to-remote";

/// A file's content revision: git blob id plus the path it had at that point.
///
/// Equality is content equality — two paths with identical bytes share a blob
/// id, which is exactly what makes rename suppression (and the aliasing rule)
/// work.
#[derive(Debug, Clone, Eq)]
pub struct Blob {
    pub id: String,
    pub path: String,
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Sync state attached to one blob, serialized as JSON into a git note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncNote {
    pub id: Option<i64>,
    pub path: String,
    pub updated_at: Option<String>,
    pub blob: String,
    pub kind: String,
    pub error: Option<String>,
}

/// Result of diffing the branch tip against the sync tag.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub added: Vec<Blob>,
    pub deleted: Vec<Blob>,
    pub changed: Vec<Blob>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.changed.is_empty()
    }

    /// Whether a blob with this id was part of this change set.
    pub fn contains_blob(&self, blob_id: &str) -> bool {
        self.added
            .iter()
            .chain(self.deleted.iter())
            .chain(self.changed.iter())
            .any(|b| b.id == blob_id)
    }
}

/// Uncommitted local state surfaced by the consistency check. These files are
/// invisible to change detection, which is why they are worth flagging.
#[derive(Debug)]
pub enum LocalChange {
    Untracked(String),
    Modified(String),
    Staged(String),
}

/// All sync notes currently attached, grouped by object kind.
#[derive(Debug, Default)]
pub struct ObjectIndex {
    by_kind: BTreeMap<String, Vec<SyncNote>>,
}

impl ObjectIndex {
    fn insert(&mut self, note: SyncNote) {
        let bucket = self.by_kind.entry(note.kind.clone()).or_default();
        if let Some(id) = note.id {
            if let Some(dup) = bucket.iter().find(|n| n.id == Some(id)) {
                warn!("Found duplicates for {} id {}: {}", note.kind, id, dup.path);
            }
        }
        bucket.push(note);
    }

    pub fn for_kind(&self, kind: &str) -> &[SyncNote] {
        self.by_kind.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find(&self, kind: &str, id: i64) -> Option<&SyncNote> {
        self.for_kind(kind).iter().find(|n| n.id == Some(id))
    }

    /// Notes carrying a stored sync error.
    pub fn failed(&self) -> Vec<&SyncNote> {
        self.by_kind
            .values()
            .flatten()
            .filter(|n| n.error.is_some())
            .collect()
    }
}

pub struct Repo {
    root: PathBuf,
    branch: String,
    mode: Mode,
    // Rebuilt lazily; any note mutation discards it.
    index: RefCell<Option<Rc<ObjectIndex>>>,
}

impl Repo {
    /// Open an existing repository.
    pub fn open(root: &Path, branch: &str, mode: Mode) -> Result<Self> {
        let repo = Self {
            root: root.to_path_buf(),
            branch: branch.to_string(),
            mode,
            index: RefCell::new(None),
        };
        repo.git(&["rev-parse", "--git-dir"])
            .with_context(|| format!("Not a git repository: {}", root.display()))?;
        Ok(repo)
    }

    /// Create a new repository with an empty root commit on the watched
    /// branch. `receive.denyCurrentBranch=updateInstead` lets users push into
    /// the checked-out branch.
    pub fn init_empty(root: &Path, branch: &str, mode: Mode) -> Result<Self> {
        warn!("Creating empty repo in {}", root.display());
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create repo directory: {}", root.display()))?;
        let repo = Self {
            root: root.to_path_buf(),
            branch: branch.to_string(),
            mode,
            index: RefCell::new(None),
        };
        repo.git(&["init"])?;
        repo.git(&["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")])?;
        repo.git(&["config", "user.name", "automation-sync"])?;
        repo.git(&["config", "user.email", "automation-sync@localhost"])?;
        repo.git(&["config", "receive.denyCurrentBranch", "updateInstead"])?;
        repo.git(&["commit", "--allow-empty", "-m", "Init repo"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run git in the repo root, failing on non-zero exit.
    fn git(&self, args: &[&str]) -> Result<String> {
        let (success, stdout, stderr) = self.git_raw(args)?;
        if !success {
            bail!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            );
        }
        Ok(stdout)
    }

    /// Run git and report the exit status instead of failing, for commands
    /// where a non-zero exit is an expected answer.
    fn git_raw(&self, args: &[&str]) -> Result<(bool, String, String)> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| "Failed to execute 'git'. Is git installed?")?;
        let stdout = String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Ok((output.status.success(), stdout, stderr))
    }

    // ── files and commits ──────────────────────────────────────────────

    /// Materialize a file in the working tree.
    pub fn write_file(&self, path: &str, content: &str) -> Result<()> {
        if self.mode.is_preview() {
            debug!("preview: not writing {path}");
            return Ok(());
        }
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&full, content)
            .with_context(|| format!("Failed to write {}", full.display()))?;
        Ok(())
    }

    /// Stage a file and return its blob. The blob id comes straight out of
    /// the index entry `git add` produced; the file is not re-read.
    pub fn stage_file(&self, path: &str) -> Result<Blob> {
        if self.mode.is_preview() {
            debug!("preview: not staging {path}");
            return Ok(Blob {
                id: String::new(),
                path: path.to_string(),
            });
        }
        debug!("Staging {path}");
        self.git(&["add", "--", path])?;
        let line = self.git(&["ls-files", "--stage", "--", path])?;
        // "<mode> <sha> <stage>\t<path>"
        let sha = line
            .split_whitespace()
            .nth(1)
            .with_context(|| format!("Unexpected ls-files output for {path}: {line}"))?;
        Ok(Blob {
            id: sha.to_string(),
            path: path.to_string(),
        })
    }

    /// Remove a file from the working tree and stage the deletion.
    pub fn remove_file(&self, path: &str) -> Result<()> {
        if self.mode.is_preview() {
            debug!("preview: not removing {path}");
            return Ok(());
        }
        self.git(&["rm", "-f", "--", path])?;
        Ok(())
    }

    /// Seal staged changes into one commit. Returns the resulting commit id,
    /// which is the current tip when there was nothing to commit.
    pub fn commit(&self, message: &str) -> Result<Option<String>> {
        if self.mode.is_preview() {
            debug!("preview: not committing");
            return Ok(None);
        }
        debug!("Committing staged changes");
        let (success, stdout, stderr) = self.git_raw(&["commit", "-m", message])?;
        if !success {
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Ok(Some(self.head_commit()?));
            }
            bail!("git commit failed: {}", stderr.trim());
        }
        Ok(Some(self.head_commit()?))
    }

    pub fn head_commit(&self) -> Result<String> {
        self.git(&["rev-parse", &format!("refs/heads/{}", self.branch)])
    }

    // ── sync marker ────────────────────────────────────────────────────

    /// Move the sync tag to the given commit (default: branch tip).
    /// Re-marking the same commit is a no-op.
    pub fn mark_synced(&self, commit: Option<&str>) -> Result<()> {
        if self.mode.is_preview() {
            debug!("preview: not moving {SYNC_TAG}");
            return Ok(());
        }
        let target = match commit {
            Some(c) => c.to_string(),
            None => self.head_commit()?,
        };
        debug!("Marking commit {target} as synced");
        self.git(&["tag", "-f", SYNC_TAG, &target])?;
        Ok(())
    }

    /// Commit the sync tag points at; `None` before the first sync.
    pub fn last_synced_commit(&self) -> Result<Option<String>> {
        let spec = format!("refs/tags/{SYNC_TAG}^{{commit}}");
        let (success, stdout, _) = self.git_raw(&["rev-parse", "-q", "--verify", &spec])?;
        Ok(success.then_some(stdout))
    }

    // ── tree access ────────────────────────────────────────────────────

    /// All blobs in the tree of `commit` (default: branch tip).
    pub fn blobs(&self, commit: Option<&str>) -> Result<Vec<Blob>> {
        let committish = match commit {
            Some(c) => c.to_string(),
            None => format!("refs/heads/{}", self.branch),
        };
        let listing = self.git(&["ls-tree", "-r", &committish])?;
        let mut blobs = Vec::new();
        for line in listing.lines() {
            // "<mode> <type> <sha>\t<path>"
            let Some((meta, path)) = line.split_once('\t') else {
                continue;
            };
            let mut fields = meta.split_whitespace();
            let _mode = fields.next();
            let objtype = fields.next().unwrap_or("");
            let sha = fields.next().unwrap_or("");
            if objtype != "blob" {
                continue;
            }
            blobs.push(Blob {
                id: sha.to_string(),
                path: path.to_string(),
            });
        }
        Ok(blobs)
    }

    pub fn path_exists(&self, path: &str) -> Result<bool> {
        let spec = format!("refs/heads/{}:{}", self.branch, path);
        let (success, _, _) = self.git_raw(&["cat-file", "-e", &spec])?;
        Ok(success)
    }

    /// Blob for a path at a commit (default: branch tip).
    pub fn blob_at(&self, path: &str, commit: Option<&str>) -> Result<Blob> {
        let committish = match commit {
            Some(c) => c.to_string(),
            None => format!("refs/heads/{}", self.branch),
        };
        let sha = self
            .git(&["rev-parse", &format!("{committish}:{path}")])
            .with_context(|| format!("No such file in the repository: {path}"))?;
        Ok(Blob {
            id: sha,
            path: path.to_string(),
        })
    }

    pub fn blob_content(&self, blob: &Blob) -> Result<String> {
        debug!("Loading content for {} from blob {}", blob.path, blob.id);
        self.git(&["cat-file", "blob", &blob.id])
    }

    // ── change detection ───────────────────────────────────────────────

    /// Diff the branch tip against the sync tag.
    ///
    /// A pure rename leaves the blob id unchanged, so its path shows up in
    /// both `added` and `deleted` pointing at the same blob; since a rename
    /// changes nothing on the server both entries are dropped. Untracked and
    /// uncommitted files are never seen here — the diff walks commits only.
    pub fn detect_changes(&self) -> Result<ChangeSet> {
        let Some(baseline) = self.last_synced_commit()? else {
            warn!("No sync marker found; nothing to diff against");
            return Ok(ChangeSet::default());
        };
        debug!("Finding changes since commit {baseline}");

        let old_blobs: BTreeMap<String, Blob> = self
            .blobs(Some(&baseline))?
            .into_iter()
            .map(|b| (b.path.clone(), b))
            .collect();
        let new_blobs: BTreeMap<String, Blob> = self
            .blobs(None)?
            .into_iter()
            .map(|b| (b.path.clone(), b))
            .collect();

        let mut added: Vec<Blob> = new_blobs
            .values()
            .filter(|b| !old_blobs.contains_key(&b.path))
            .cloned()
            .collect();
        let mut deleted: Vec<Blob> = old_blobs
            .values()
            .filter(|b| !new_blobs.contains_key(&b.path))
            .cloned()
            .collect();

        let renamed: Vec<String> = added
            .iter()
            .filter(|b| deleted.contains(b))
            .map(|b| b.id.clone())
            .collect();
        for id in renamed {
            debug!("Detected rename for blob {id}; ignoring");
            added.retain(|b| b.id != id);
            deleted.retain(|b| b.id != id);
        }

        let changed: Vec<Blob> = new_blobs
            .values()
            .filter(|b| {
                old_blobs
                    .get(&b.path)
                    .is_some_and(|old| old.id != b.id)
            })
            .cloned()
            .collect();

        debug!("Added: {added:?}");
        debug!("Deleted: {deleted:?}");
        debug!("Changed: {changed:?}");
        Ok(ChangeSet {
            added,
            deleted,
            changed,
        })
    }

    /// Untracked, modified, and staged files in the working tree.
    pub fn local_changes(&self) -> Result<Vec<LocalChange>> {
        let listing = self.git(&["status", "--porcelain"])?;
        let mut changes = Vec::new();
        for line in listing.lines() {
            if line.len() < 4 {
                continue;
            }
            let (status, path) = (&line[..2], line[3..].to_string());
            if status == "??" {
                changes.push(LocalChange::Untracked(path));
                continue;
            }
            let mut chars = status.chars();
            let staged = chars.next().unwrap_or(' ');
            let worktree = chars.next().unwrap_or(' ');
            if staged != ' ' {
                changes.push(LocalChange::Staged(path.clone()));
            }
            if worktree != ' ' {
                changes.push(LocalChange::Modified(path));
            }
        }
        Ok(changes)
    }

    /// Normalize a user-supplied path to repo-relative form. Accepts absolute
    /// paths and CWD-relative paths inside the repo, plus paths already
    /// relative to the repo root when they start with a known kind prefix.
    pub fn repo_relative(&self, path: &str, kind_prefixes: &[&str]) -> Result<String> {
        let candidate = Path::new(path);
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            std::env::current_dir()?.join(candidate)
        };
        let absolute = normalize_path(&absolute);
        let repo_root = normalize_path(&std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone()));

        if let Ok(relative) = absolute.strip_prefix(&repo_root) {
            let relative = relative.to_string_lossy().replace('\\', "/");
            debug!("Translated {path} to {relative}");
            return Ok(relative);
        }
        if candidate.is_absolute() {
            bail!("{} is outside of repository {}", path, self.root.display());
        }
        let normalized = normalize_path(candidate).to_string_lossy().replace('\\', "/");
        for prefix in kind_prefixes {
            if normalized.starts_with(&format!("{prefix}/")) {
                debug!("Assuming {path} is inside the repo");
                return Ok(normalized);
            }
        }
        bail!("Relative path {} is invalid", path)
    }

    // ── notes ──────────────────────────────────────────────────────────

    /// Read the note attached to a blob, if any.
    pub fn read_note(&self, blob_id: &str) -> Result<Option<SyncNote>> {
        debug!("Loading git note for {blob_id}");
        let (success, stdout, stderr) =
            self.git_raw(&["notes", "--ref", NOTES_REF, "show", blob_id])?;
        if !success {
            // Having no note attached is expected; anything else is not.
            if stderr.contains("no note found") {
                return Ok(None);
            }
            bail!("git notes show failed for {blob_id}: {}", stderr.trim());
        }
        let note: SyncNote = serde_json::from_str(&stdout)
            .with_context(|| format!("Malformed sync note on {blob_id}"))?;
        Ok(Some(note))
    }

    /// Attach a note to a blob, retiring the note on the nearest ancestor
    /// revision of the same path first so at most one live note per logical
    /// file remains.
    pub fn write_note(&self, blob: &Blob, note: &SyncNote) -> Result<()> {
        if self.mode.is_preview() {
            debug!("preview: not saving note for {}", blob.path);
            return Ok(());
        }
        debug!("Saving git note for {}: {:?}", blob.id, note);
        if let Some((ancestor, _)) = self.find_ancestor_note(blob, true)? {
            self.clear_note(&ancestor.id)?;
        }
        let payload = serde_json::to_string(note)?;
        self.git(&["notes", "--ref", NOTES_REF, "add", "-f", "-m", &payload, &blob.id])?;
        self.invalidate_index();
        Ok(())
    }

    /// Detach the note from a blob. Missing notes are tolerated.
    pub fn clear_note(&self, blob_id: &str) -> Result<()> {
        if self.mode.is_preview() {
            debug!("preview: not clearing note for {blob_id}");
            return Ok(());
        }
        debug!("Deleting git note for {blob_id}");
        let (success, _, stderr) =
            self.git_raw(&["notes", "--ref", NOTES_REF, "remove", blob_id])?;
        if !success && !stderr.contains("has no note") {
            bail!("git notes remove failed for {blob_id}: {}", stderr.trim());
        }
        self.invalidate_index();
        Ok(())
    }

    /// Find the note that applies to `blob.path`, walking revisions of that
    /// path backward through history.
    ///
    /// Content-identical files share a blob id, so a note found on a
    /// historical blob is only trusted when its recorded path matches the
    /// path being resolved; a mismatch means two copies of the same file
    /// have diverged, and the walk continues past it.
    pub fn find_ancestor_note(
        &self,
        blob: &Blob,
        skip_self: bool,
    ) -> Result<Option<(Blob, SyncNote)>> {
        debug!("Trying to find git note on ancestors of {}", blob.id);
        if !skip_self {
            if let Some(note) = self.read_note(&blob.id)? {
                if note.path == blob.path {
                    return Ok(Some((blob.clone(), note)));
                }
                warn!(
                    "Note on {} records path {}, but we need note for {}: \
                     two copies of same file have diverged?",
                    blob.id, note.path, blob.path
                );
            }
        }

        let (success, listing, _) = self.git_raw(&[
            "rev-list",
            &format!("refs/heads/{}", self.branch),
            "--",
            &blob.path,
        ])?;
        if !success {
            return Ok(None);
        }
        let mut last_seen = blob.id.clone();
        for commit in listing.lines() {
            let (success, sha, _) =
                self.git_raw(&["rev-parse", &format!("{}:{}", commit, blob.path)])?;
            if !success || sha == last_seen {
                continue;
            }
            last_seen = sha.clone();
            debug!("Examining note on {sha}");
            if let Some(note) = self.read_note(&sha)? {
                if note.path == blob.path {
                    debug!("Found note on {sha}");
                    return Ok(Some((
                        Blob {
                            id: sha,
                            path: blob.path.clone(),
                        },
                        note,
                    )));
                }
                warn!(
                    "Ancestor {} has path {}, but we need note for {}: \
                     two copies of same file have diverged?",
                    sha, note.path, blob.path
                );
            }
        }
        Ok(None)
    }

    // ── object index ───────────────────────────────────────────────────

    /// Notes index, rebuilt on demand after any note mutation.
    pub fn object_index(&self) -> Result<Rc<ObjectIndex>> {
        if let Some(index) = self.index.borrow().as_ref() {
            return Ok(Rc::clone(index));
        }
        debug!("building index from git notes");
        let mut index = ObjectIndex::default();
        let (success, listing, _) = self.git_raw(&["notes", "--ref", NOTES_REF, "list"])?;
        if success {
            for line in listing.lines() {
                let Some((note_sha, _target)) = line.split_once(' ') else {
                    continue;
                };
                // Reading the note blob directly is much faster than running
                // `git notes show` per object.
                let content = self.git(&["cat-file", "blob", note_sha])?;
                match serde_json::from_str::<SyncNote>(&content) {
                    Ok(note) => index.insert(note),
                    Err(err) => warn!("Skipping malformed sync note {note_sha}: {err}"),
                }
            }
        }
        let index = Rc::new(index);
        *self.index.borrow_mut() = Some(Rc::clone(&index));
        Ok(index)
    }

    fn invalidate_index(&self) {
        *self.index.borrow_mut() = None;
    }
}

/// Lexically normalize `.` and `..` components.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_repo() -> (TempDir, Repo) {
        let tmp = TempDir::new().unwrap();
        let repo = Repo::init_empty(tmp.path(), "main", Mode::Live).unwrap();
        (tmp, repo)
    }

    fn sample_note(blob: &Blob, id: Option<i64>) -> SyncNote {
        SyncNote {
            id,
            path: blob.path.clone(),
            updated_at: Some("2024-01-01 00:00:00".to_string()),
            blob: blob.id.clone(),
            kind: "Script".to_string(),
            error: None,
        }
    }

    #[test]
    fn test_init_creates_branch_and_push_config() {
        let (tmp, repo) = test_repo();
        let branch = repo.git(&["branch", "--show-current"]).unwrap();
        assert_eq!(branch, "main");
        let deny = repo.git(&["config", "receive.denyCurrentBranch"]).unwrap();
        assert_eq!(deny, "updateInstead");
        drop(tmp);
    }

    #[test]
    fn test_stage_commit_and_mark_synced() {
        let (_tmp, repo) = test_repo();
        repo.write_file("scripts/a.py", "print('a')\n").unwrap();
        let blob = repo.stage_file("scripts/a.py").unwrap();
        assert!(!blob.id.is_empty());

        assert!(repo.last_synced_commit().unwrap().is_none());
        let commit = repo.commit("Add a.py").unwrap().unwrap();
        repo.mark_synced(Some(&commit)).unwrap();
        assert_eq!(repo.last_synced_commit().unwrap().unwrap(), commit);

        // Re-marking the same commit is a no-op
        repo.mark_synced(Some(&commit)).unwrap();
        assert_eq!(repo.last_synced_commit().unwrap().unwrap(), commit);
    }

    #[test]
    fn test_detect_changes() {
        let (_tmp, repo) = test_repo();
        repo.mark_synced(None).unwrap();

        for name in ["file1", "file2", "file3"] {
            repo.write_file(name, &format!("file {name}\n")).unwrap();
            repo.stage_file(name).unwrap();
        }
        repo.commit("Create some files").unwrap();
        let changes = repo.detect_changes().unwrap();
        assert_eq!(changes.added.len(), 3);
        assert!(changes.deleted.is_empty());
        assert!(changes.changed.is_empty());

        repo.mark_synced(None).unwrap();
        repo.git(&["rm", "-q", "file3"]).unwrap();
        repo.write_file("file2", "file file2, updated\n").unwrap();
        repo.stage_file("file2").unwrap();
        repo.commit("Edit file2 and delete file3").unwrap();

        let changes = repo.detect_changes().unwrap();
        assert!(changes.added.is_empty());
        assert_eq!(changes.deleted.len(), 1);
        assert_eq!(changes.deleted[0].path, "file3");
        assert_eq!(changes.changed.len(), 1);
        assert_eq!(changes.changed[0].path, "file2");
    }

    #[test]
    fn test_rename_is_suppressed() {
        let (_tmp, repo) = test_repo();
        repo.write_file("file1", "same content\n").unwrap();
        repo.stage_file("file1").unwrap();
        repo.commit("Create file1").unwrap();
        repo.mark_synced(None).unwrap();

        repo.git(&["mv", "file1", "file4"]).unwrap();
        repo.commit("mv file1 -> file4").unwrap();
        assert!(!repo.path_exists("file1").unwrap());
        assert!(repo.path_exists("file4").unwrap());

        let changes = repo.detect_changes().unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_note_roundtrip_and_clear() {
        let (_tmp, repo) = test_repo();
        repo.write_file("file.txt", "sample file\n").unwrap();
        let blob = repo.stage_file("file.txt").unwrap();
        repo.commit("Create file.txt").unwrap();

        assert!(repo.read_note(&blob.id).unwrap().is_none());
        let note = sample_note(&blob, Some(7));
        repo.write_note(&blob, &note).unwrap();
        assert_eq!(repo.read_note(&blob.id).unwrap().unwrap(), note);

        // The note lives in its own ref, not the default one
        let (success, stdout, _) = repo.git_raw(&["notes", "list"]).unwrap();
        assert!(!success || stdout.is_empty());

        repo.clear_note(&blob.id).unwrap();
        assert!(repo.read_note(&blob.id).unwrap().is_none());
        // Clearing again is tolerated
        repo.clear_note(&blob.id).unwrap();
    }

    #[test]
    fn test_note_supersession_on_new_revision() {
        let (_tmp, repo) = test_repo();
        repo.write_file("file.txt", "sample file\n").unwrap();
        let old_blob = repo.stage_file("file.txt").unwrap();
        repo.commit("Created file.txt").unwrap();
        repo.write_note(&old_blob, &sample_note(&old_blob, Some(1)))
            .unwrap();

        repo.write_file("file.txt", "sample file, updated\n").unwrap();
        let new_blob = repo.stage_file("file.txt").unwrap();
        repo.commit("New version of file.txt").unwrap();
        assert!(repo.read_note(&new_blob.id).unwrap().is_none());

        // The ancestor note is still reachable from the new revision
        let (ancestor, found) = repo
            .find_ancestor_note(&new_blob, false)
            .unwrap()
            .unwrap();
        assert_eq!(ancestor.id, old_blob.id);
        assert_eq!(found.id, Some(1));

        // Writing a note for the new revision retires the old one
        repo.write_note(&new_blob, &sample_note(&new_blob, Some(1)))
            .unwrap();
        assert!(repo.read_note(&old_blob.id).unwrap().is_none());
        let listing = repo
            .git(&["notes", "--ref", NOTES_REF, "list"])
            .unwrap();
        assert_eq!(listing.lines().count(), 1);
    }

    #[test]
    fn test_aliased_copies_keep_independent_state() {
        let (_tmp, repo) = test_repo();
        repo.write_file("a.ccs", "identical content\n").unwrap();
        let blob_a = repo.stage_file("a.ccs").unwrap();
        repo.commit("Create a.ccs").unwrap();
        repo.write_note(&blob_a, &sample_note(&blob_a, Some(10)))
            .unwrap();

        // cp a.ccs b.ccs: same blob id, different path
        repo.write_file("b.ccs", "identical content\n").unwrap();
        let blob_b = repo.stage_file("b.ccs").unwrap();
        repo.commit("Copy a.ccs to b.ccs").unwrap();
        assert_eq!(blob_a.id, blob_b.id);

        // b diverges afterwards; its history must not inherit a's state
        repo.write_file("b.ccs", "diverged content\n").unwrap();
        let blob_b2 = repo.stage_file("b.ccs").unwrap();
        repo.commit("Edit b.ccs").unwrap();
        assert!(repo.find_ancestor_note(&blob_b2, false).unwrap().is_none());

        // a's own resolution still works
        let blob_a_now = repo.blob_at("a.ccs", None).unwrap();
        let (_, note) = repo
            .find_ancestor_note(&blob_a_now, false)
            .unwrap()
            .unwrap();
        assert_eq!(note.id, Some(10));
    }

    #[test]
    fn test_object_index_rebuild_and_failed() {
        let (_tmp, repo) = test_repo();
        repo.write_file("scripts/ok.py", "print('ok')\n").unwrap();
        let ok = repo.stage_file("scripts/ok.py").unwrap();
        repo.write_file("scripts/bad.py", "print('bad')\n").unwrap();
        let bad = repo.stage_file("scripts/bad.py").unwrap();
        repo.commit("Two scripts").unwrap();

        repo.write_note(&ok, &sample_note(&ok, Some(1))).unwrap();
        let mut failed = sample_note(&bad, None);
        failed.error = Some("boom".to_string());
        repo.write_note(&bad, &failed).unwrap();

        let index = repo.object_index().unwrap();
        assert_eq!(index.for_kind("Script").len(), 2);
        assert!(index.find("Script", 1).is_some());
        let failures = index.failed();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "scripts/bad.py");

        // Note mutation invalidates the cached index
        repo.clear_note(&bad.id).unwrap();
        let index = repo.object_index().unwrap();
        assert_eq!(index.for_kind("Script").len(), 1);
        assert!(index.failed().is_empty());
    }

    #[test]
    fn test_preview_mode_suppresses_mutations() {
        let tmp = TempDir::new().unwrap();
        let live = Repo::init_empty(tmp.path(), "main", Mode::Live).unwrap();
        live.write_file("file.txt", "content\n").unwrap();
        let blob = live.stage_file("file.txt").unwrap();
        live.commit("Create file.txt").unwrap();

        let preview = Repo::open(tmp.path(), "main", Mode::Preview).unwrap();
        preview.write_file("other.txt", "content\n").unwrap();
        assert!(!tmp.path().join("other.txt").exists());
        preview
            .write_note(&blob, &sample_note(&blob, Some(1)))
            .unwrap();
        assert!(live.read_note(&blob.id).unwrap().is_none());
        preview.mark_synced(None).unwrap();
        assert!(live.last_synced_commit().unwrap().is_none());
    }
}
