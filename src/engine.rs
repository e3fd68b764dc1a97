//! The sync engine: ties the repo, the transport and the object model into
//! the operations the CLI exposes.
//!
//! Everything here is synchronous and single-threaded on purpose. A sync run
//! is a sequence of dependent git and HTTP calls against one repository and
//! one server; there is nothing to parallelize that would survive the
//! ordering requirements (rules before policies, deletions before renames of
//! the same name).

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::mode::Mode;
use crate::objects::{value_as_id, ObjectKind, SyncedObject};
use crate::repo::{Blob, LocalChange, Repo, SyncNote};
use crate::transport::{Record, Transport};

pub struct Engine {
    config: Config,
    repo: Repo,
    transport: Box<dyn Transport>,
    mode: Mode,
}

impl Engine {
    pub fn new(config: Config, repo: Repo, transport: Box<dyn Transport>, mode: Mode) -> Self {
        Self {
            config,
            repo,
            transport,
            mode,
        }
    }

    fn kind_prefixes(&self) -> Vec<&str> {
        ObjectKind::ALL
            .iter()
            .map(|&kind| self.config.path_prefix(kind))
            .collect()
    }

    fn object_at(&self, path: &str) -> Result<SyncedObject> {
        let rel = self.repo.repo_relative(path, &self.kind_prefixes())?;
        let blob = self.repo.blob_at(&rel, None)?;
        SyncedObject::from_blob(&self.config, &self.repo, &blob)
    }

    /// Populate an empty repository from the server: every writable object
    /// of every kind is downloaded, written, committed in one commit, marked
    /// synced and annotated.
    pub fn export(&self) -> Result<()> {
        let mut exported = Vec::new();
        for kind in ObjectKind::dependency_order() {
            info!("Processing {kind} objects");
            for record in self.transport.index(kind)? {
                if self.config.sync.skip_readonly && is_readonly(&record) {
                    debug!("Skipping read-only {kind} {}", record_name(&record));
                    continue;
                }
                let mut obj = SyncedObject::from_api(kind, &record);
                let path = obj.generate_path(&self.config)?;
                if let Err(err) = obj.pull(self.transport.as_ref()) {
                    error!("Cannot sync {obj}: {err}");
                    continue;
                }
                let content = obj.export_content()?;
                self.repo.write_file(&path, &content)?;
                obj.blob = Some(self.repo.stage_file(&path)?);
                exported.push(obj);
            }
        }
        let commit = self.repo.commit("Repository initialised by automation-sync")?;
        self.repo.mark_synced(commit.as_deref())?;
        // Notes go in only after the commit exists, otherwise a failure
        // mid-export would leave annotations pointing at unreachable blobs
        for obj in &exported {
            obj.save_note(&self.repo)?;
        }
        info!("Initialised repository with {} objects", exported.len());
        Ok(())
    }

    /// Send everything committed since the last sync to the server:
    /// deletions first, then new files, then changed files. A transport
    /// failure on one object is recorded and the run continues; with
    /// `retry_errors` the objects that failed in previous runs are attempted
    /// again as well.
    pub fn push(&self, retry_errors: bool) -> Result<()> {
        let changes = self.repo.detect_changes()?;
        if changes.is_empty() && !retry_errors {
            info!("No changes to sync");
        }

        for blob in &changes.deleted {
            let obj = SyncedObject::from_blob(&self.config, &self.repo, blob)?;
            obj.delete_on_remote(&self.repo, self.transport.as_ref(), self.mode)?;
        }

        let mut failures = 0u32;
        for blob in changes.added.iter().chain(changes.changed.iter()) {
            let mut obj = SyncedObject::from_blob(&self.config, &self.repo, blob)?;
            if !obj.push(&self.repo, self.transport.as_ref(), self.mode)? {
                failures += 1;
            }
        }

        if retry_errors {
            let index = self.repo.object_index()?;
            let retry_blobs: Vec<Blob> = index
                .failed()
                .into_iter()
                .filter(|note| !changes.contains_blob(&note.blob))
                .map(|note| Blob {
                    id: note.blob.clone(),
                    path: note.path.clone(),
                })
                .collect();
            for blob in retry_blobs {
                info!("Retrying previously failed {}", blob.path);
                let mut obj = SyncedObject::from_blob(&self.config, &self.repo, &blob)?;
                if !obj.push(&self.repo, self.transport.as_ref(), self.mode)? {
                    failures += 1;
                }
            }
        }

        self.repo.mark_synced(None)?;
        if failures > 0 {
            warn!("{failures} object(s) failed to sync; run check for details");
        }
        Ok(())
    }

    /// Push the given files regardless of change detection. The sync marker
    /// stays where it is.
    pub fn force_push(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            let mut obj = self.object_at(path)?;
            obj.push(&self.repo, self.transport.as_ref(), self.mode)?;
        }
        Ok(())
    }

    /// Compare the repository against the server and report discrepancies.
    /// Returns whether everything is in sync and how many problems were
    /// found.
    pub fn check(&self, local_only: bool) -> Result<(bool, u32)> {
        let mut problems = 0u32;
        for change in self.repo.local_changes()? {
            problems += 1;
            match change {
                LocalChange::Untracked(path) => {
                    warn!("{path} is untracked and will not be synced; commit it first")
                }
                LocalChange::Modified(path) => warn!("{path} has uncommitted modifications"),
                LocalChange::Staged(path) => warn!("{path} is staged but not committed"),
            }
        }
        if local_only {
            if problems == 0 {
                info!("Repository is clean");
            }
            return Ok((problems == 0, problems));
        }

        let index = self.repo.object_index()?;
        for kind in ObjectKind::ALL {
            let mut remote: BTreeMap<i64, Record> = BTreeMap::new();
            for record in self.transport.index(kind)? {
                if self.config.sync.skip_readonly && is_readonly(&record) {
                    continue;
                }
                if let Some(id) = record.get("id").and_then(value_as_id) {
                    remote.insert(id, record);
                }
            }
            let annotated: BTreeMap<i64, &SyncNote> = index
                .for_kind(kind.name())
                .iter()
                .filter_map(|note| note.id.map(|id| (id, note)))
                .collect();

            for (id, record) in &remote {
                let Some(note) = annotated.get(id) else {
                    problems += 1;
                    warn!(
                        "{kind} \"{}\" (id {id}) exists on the server but not in the repository",
                        record_name(record)
                    );
                    continue;
                };
                let remote_ts = record
                    .get("updated_at")
                    .and_then(Value::as_str)
                    .and_then(parse_timestamp);
                let local_ts = note.updated_at.as_deref().and_then(parse_timestamp);
                match (remote_ts, local_ts) {
                    (Some(remote_ts), Some(local_ts)) if remote_ts > local_ts => {
                        problems += 1;
                        warn!("{} has pending changes on the server", note.path);
                    }
                    (Some(remote_ts), Some(local_ts)) if remote_ts < local_ts => {
                        problems += 1;
                        warn!("{} is ahead of the server", note.path);
                    }
                    _ => {}
                }
            }
            for (id, note) in &annotated {
                if !remote.contains_key(id) {
                    problems += 1;
                    warn!("{} (id {id}) was deleted on the server", note.path);
                }
            }
        }
        for note in index.failed() {
            problems += 1;
            warn!(
                "{} failed to sync: {}",
                note.path,
                note.error.as_deref().unwrap_or("unknown error")
            );
        }

        if problems == 0 {
            info!("Repository and the server are in sync");
        }
        Ok((problems == 0, problems))
    }

    /// Re-derive a file's server id by looking the object up by its
    /// secondary keys. Heals annotations after the id changed server-side
    /// (delete and re-create) or was lost.
    pub fn relink(&self, path: &str) -> Result<()> {
        let mut obj = self.object_at(path)?;
        let rel = obj.path.clone().unwrap_or_default();
        let matches = obj.find_by_secondary_keys(self.transport.as_ref())?;
        match matches.as_slice() {
            [] => {
                if obj.id.take().is_some() {
                    info!("{rel} is not on the server; clearing its stored id");
                    obj.updated_at = None;
                    obj.save_note(&self.repo)?;
                } else {
                    info!("{rel} has no server counterpart");
                }
            }
            [record] => {
                let id = record.get("id").and_then(value_as_id).ok_or_else(|| {
                    SyncError::Transport(format!("find result for {rel} carried no id"))
                })?;
                if obj.id == Some(id) {
                    info!("{rel} is already linked to id {id}");
                } else {
                    info!("Relinking {rel} to server id {id}");
                    obj.id = Some(id);
                    obj.updated_at = record
                        .get("updated_at")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    obj.save_note(&self.repo)?;
                }
            }
            many => {
                let ids: Vec<String> = many
                    .iter()
                    .filter_map(|r| r.get("id").and_then(value_as_id))
                    .map(|id| id.to_string())
                    .collect();
                return Err(SyncError::DuplicateKey {
                    path: rel,
                    ids: ids.join(", "),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Download one object into the repo, committing the result. An existing
    /// file keeps its linked id unless `--id` plus `overwrite` retarget it.
    pub fn fetch(&self, path: &str, id: Option<i64>, overwrite: bool) -> Result<()> {
        let rel = self.repo.repo_relative(path, &self.kind_prefixes())?;
        let mut obj = if self.repo.path_exists(&rel)? {
            let existing = self.object_at(&rel)?;
            let target = id.or(existing.id).ok_or_else(|| {
                SyncError::Validation(format!("{rel} has no server id; pass --id"))
            })?;
            if existing.id.is_some() && existing.id != Some(target) && !overwrite {
                return Err(SyncError::Validation(format!(
                    "{rel} is linked to id {}; pass --overwrite to replace it with id {target}",
                    existing.id.unwrap_or_default()
                ))
                .into());
            }
            let record = self.transport.show(existing.kind, target)?;
            SyncedObject::from_api(existing.kind, &record)
        } else {
            let kind = self.config.kind_for_path(&rel).ok_or_else(|| {
                SyncError::Validation(format!("Cannot determine object kind for {rel}"))
            })?;
            let target = id.ok_or_else(|| {
                SyncError::Validation(format!("{rel} does not exist; pass --id to fetch it"))
            })?;
            let record = self.transport.show(kind, target)?;
            SyncedObject::from_api(kind, &record)
        };
        obj.path = Some(rel.clone());
        obj.pull(self.transport.as_ref())?;
        let content = obj.export_content()?;
        self.repo.write_file(&rel, &content)?;
        obj.blob = Some(self.repo.stage_file(&rel)?);
        self.repo.commit(&format!("Fetch of {rel} by automation-sync"))?;
        obj.save_note(&self.repo)?;
        info!("Fetched {obj} into {rel}");
        Ok(())
    }

    /// Content of a repo file, either as committed or rebuilt from the
    /// server's current state.
    pub fn cat(&self, path: &str, from_api: bool) -> Result<String> {
        let mut obj = self.object_at(path)?;
        if from_api {
            obj.pull(self.transport.as_ref())?;
            Ok(obj.export_content()?)
        } else {
            Ok(obj.content()?.to_string())
        }
    }

    /// The sync annotation a repo file resolves to, pretty-printed.
    pub fn show_metadata(&self, path: &str) -> Result<String> {
        let obj = self.object_at(path)?;
        let blob = obj
            .blob
            .as_ref()
            .ok_or_else(|| SyncError::InvalidState(format!("{obj} has no blob")))?;
        Ok(serde_json::to_string_pretty(&obj.note_record(blob))?)
    }
}

fn is_readonly(record: &Record) -> bool {
    record
        .get("read_only")
        .and_then(crate::objects::parse_bool_lenient)
        .unwrap_or(false)
}

fn record_name(record: &Record) -> String {
    record
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("(unnamed)")
        .to_string()
}

// Server timestamps carry no timezone; they are compared as-is.
fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    match NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        Ok(ts) => Some(ts),
        Err(err) => {
            debug!("Cannot parse timestamp '{text}': {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp() {
        let ts = parse_timestamp("2024-03-01 10:15:00").unwrap();
        let later = parse_timestamp("2024-03-01 10:15:01").unwrap();
        assert!(later > ts);
        assert_eq!(parse_timestamp("yesterday"), None);
        // ISO timestamps with a T separator are rejected rather than guessed
        assert_eq!(parse_timestamp("2024-03-01T10:15:00Z"), None);
    }

    #[test]
    fn test_is_readonly() {
        assert!(is_readonly(&json!({"read_only": true})));
        assert!(is_readonly(&json!({"read_only": "true"})));
        assert!(!is_readonly(&json!({"read_only": "false"})));
        assert!(!is_readonly(&json!({"name": "x"})));
    }
}
