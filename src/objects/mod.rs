//! The object model shared by every synced kind.
//!
//! [`SyncedObject`] is a single envelope rather than a type per kind: the
//! envelope carries identity (remote id, updated_at, last error), location
//! (path and blob in the repo) and the kind-specific attribute map, while the
//! per-kind encode/decode/push behavior lives in [`script_like`] and [`xml`]
//! and is dispatched on [`ObjectKind`]. Attributes stay as loose JSON values
//! because the server is loose about them too: the same field can arrive as a
//! bool, a number or a string depending on the endpoint.

pub mod script_like;
pub mod xml;

use anyhow::Result;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::SyncError;
use crate::mode::Mode;
use crate::repo::{Blob, Repo, SyncNote};
use crate::transport::{Record, Transport};

/// The kinds of automation objects the engine knows how to sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    Script,
    ScriptModule,
    ConfigList,
    ConfigTemplate,
    PolicyRule,
    Policy,
    CustomIssue,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 7] = [
        ObjectKind::Script,
        ObjectKind::ScriptModule,
        ObjectKind::ConfigList,
        ObjectKind::ConfigTemplate,
        ObjectKind::PolicyRule,
        ObjectKind::Policy,
        ObjectKind::CustomIssue,
    ];

    /// Stable name used in notes and log lines.
    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Script => "Script",
            ObjectKind::ScriptModule => "ScriptModule",
            ObjectKind::ConfigList => "ConfigList",
            ObjectKind::ConfigTemplate => "ConfigTemplate",
            ObjectKind::PolicyRule => "PolicyRule",
            ObjectKind::Policy => "Policy",
            ObjectKind::CustomIssue => "CustomIssue",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// REST controller path segment.
    pub fn controller(self) -> &'static str {
        match self {
            ObjectKind::Script => "scripts",
            ObjectKind::ScriptModule => "script_modules",
            ObjectKind::ConfigList => "config_lists",
            ObjectKind::ConfigTemplate => "config_templates",
            ObjectKind::PolicyRule => "policy_rules",
            ObjectKind::Policy => "policies",
            ObjectKind::CustomIssue => "issues_adhoc",
        }
    }

    /// Singular key some responses wrap their record in.
    pub fn record_key(self) -> &'static str {
        match self {
            ObjectKind::Script => "script",
            ObjectKind::ScriptModule => "script_module",
            ObjectKind::ConfigList => "config_list",
            ObjectKind::ConfigTemplate => "config_template",
            ObjectKind::PolicyRule => "policy_rule",
            ObjectKind::Policy => "policy",
            ObjectKind::CustomIssue => "ad_hoc_issue",
        }
    }

    /// The attributes tracked for this kind, in server naming.
    pub fn api_attributes(self) -> &'static [&'static str] {
        match self {
            ObjectKind::Script => &["name", "description", "risk_level", "language", "category"],
            ObjectKind::ScriptModule => &["name", "category", "description", "language"],
            ObjectKind::ConfigList => &["name", "description"],
            ObjectKind::ConfigTemplate => &[
                "name",
                "description",
                "device_type",
                "model",
                "risk_level",
                "template_type",
                "vendor",
                "version",
                "template_variables_text",
            ],
            ObjectKind::PolicyRule => &[
                "name",
                "description",
                "author",
                "set_filter",
                "rule_logic",
                "severity",
                "action_after_exec",
                "remediation",
                "short_name",
                "read_only",
            ],
            ObjectKind::Policy => &[
                "name",
                "description",
                "author",
                "set_filter",
                "schedule_mode",
                "short_name",
                "read_only",
            ],
            ObjectKind::CustomIssue => &[
                "issue_id",
                "name",
                "description",
                "component",
                "correctness",
                "stability",
                "details",
            ],
        }
    }

    /// Attributes that are unique on the server, used for id recovery.
    pub fn secondary_keys(self) -> &'static [&'static str] {
        match self {
            ObjectKind::PolicyRule | ObjectKind::Policy => &["short_name", "name"],
            ObjectKind::CustomIssue => &["issue_id", "name"],
            _ => &["name"],
        }
    }

    /// Custom issues travel under web-UI field names.
    pub fn api_field(self, attr: &str) -> Option<&'static str> {
        if self != ObjectKind::CustomIssue {
            return None;
        }
        match attr {
            "issue_id" => Some("IssueTypeID"),
            "name" => Some("Title"),
            "description" => Some("Description"),
            "component" => Some("Component"),
            "correctness" => Some("Correctness"),
            "stability" => Some("Stability"),
            "details" => Some("Details"),
            _ => None,
        }
    }

    /// Kinds that must be synced before this one.
    pub fn depends_on(self) -> &'static [ObjectKind] {
        match self {
            // Policies reference rules by short name, so rules go first
            ObjectKind::Policy => &[ObjectKind::PolicyRule],
            _ => &[],
        }
    }

    /// All kinds, ordered so dependencies come before their dependents.
    pub fn dependency_order() -> Vec<ObjectKind> {
        fn visit(kind: ObjectKind, order: &mut Vec<ObjectKind>) {
            if order.contains(&kind) {
                return;
            }
            for dep in kind.depends_on() {
                visit(*dep, order);
            }
            order.push(kind);
        }
        let mut order = Vec::with_capacity(Self::ALL.len());
        for kind in Self::ALL {
            visit(kind, &mut order);
        }
        order
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One automation object, seen from either side of the sync.
#[derive(Debug, Clone)]
pub struct SyncedObject {
    pub kind: ObjectKind,
    pub id: Option<i64>,
    pub updated_at: Option<String>,
    pub error: Option<String>,
    pub path: Option<String>,
    pub blob: Option<Blob>,
    pub content: Option<String>,
    pub attrs: Map<String, Value>,
}

impl SyncedObject {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            id: None,
            updated_at: None,
            error: None,
            path: None,
            blob: None,
            content: None,
            attrs: Map::new(),
        }
    }

    /// Build an object from a server record, content not yet loaded.
    pub fn from_api(kind: ObjectKind, record: &Record) -> Self {
        debug!("creating {kind} object from {record}");
        let mut obj = Self::new(kind);
        obj.id = record.get("id").and_then(value_as_id);
        obj.updated_at = record
            .get("updated_at")
            .and_then(Value::as_str)
            .map(str::to_string);
        for attr in kind.api_attributes() {
            let value = record.get(*attr).cloned().unwrap_or(Value::Null);
            obj.attrs.insert(attr.to_string(), value);
        }
        obj
    }

    /// Build an object from a repo blob: kind from the path, sync state from
    /// the nearest applicable note, attributes from the content itself.
    /// Where the content and the note disagree, the content wins.
    pub fn from_blob(config: &Config, repo: &Repo, blob: &Blob) -> Result<Self> {
        let kind = config.kind_for_path(&blob.path).ok_or_else(|| {
            SyncError::Validation(format!("Cannot determine object kind for {}", blob.path))
        })?;
        debug!("creating {kind} object from {}", blob.path);
        let mut obj = Self::new(kind);
        if let Some((_, note)) = repo.find_ancestor_note(blob, false)? {
            if note.kind != kind.name() {
                warn!(
                    "Note on {} says {} but path {} maps to {kind}",
                    blob.id, note.kind, blob.path
                );
            }
            obj.id = note.id;
            obj.updated_at = note.updated_at;
            obj.error = note.error;
        }
        obj.path = Some(blob.path.clone());
        obj.blob = Some(blob.clone());
        obj.content = Some(repo.blob_content(blob)?);
        let metadata = match kind {
            ObjectKind::Script
            | ObjectKind::ScriptModule
            | ObjectKind::ConfigList
            | ObjectKind::ConfigTemplate => script_like::decode_metadata(&obj),
            _ => xml::decode_metadata(&obj)?,
        };
        obj.set_metadata(&metadata);
        // Rule membership is not a server attribute but the policy push
        // needs it to diff against the remote side
        if let Some(rules) = metadata.get("rules") {
            obj.attrs.insert("rules".to_string(), rules.clone());
        }
        Ok(obj)
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(Value::as_str)
    }

    /// String rendering of an attribute, whatever JSON type it arrived as.
    pub fn attr_text(&self, name: &str) -> Option<String> {
        value_text(self.attrs.get(name)?)
    }

    /// Merge partial metadata into this object. Attributes absent from
    /// `metadata` keep their current value; set them to null explicitly to
    /// unset.
    pub fn set_metadata(&mut self, metadata: &Map<String, Value>) {
        debug!("setting {} metadata from {:?}", self.kind, metadata);
        if let Some(id) = metadata.get("id") {
            self.id = value_as_id(id);
        }
        if let Some(updated) = metadata.get("updated_at").and_then(Value::as_str) {
            self.updated_at = Some(updated.to_string());
        }
        for attr in self.kind.api_attributes() {
            if let Some(value) = metadata.get(*attr) {
                self.attrs.insert(attr.to_string(), value.clone());
            }
        }
    }

    /// Overwrite identity and every attribute from a server record. Unlike
    /// [`SyncedObject::set_metadata`], fields the record omits are unset.
    pub fn merge_api_result(&mut self, record: &Record) {
        debug!("updating object attributes with API result {record}");
        if let Some(id) = record.get("id").and_then(value_as_id) {
            self.id = Some(id);
        }
        self.updated_at = record
            .get("updated_at")
            .and_then(Value::as_str)
            .map(str::to_string);
        for attr in self.kind.api_attributes() {
            let value = record.get(*attr).cloned().unwrap_or(Value::Null);
            self.attrs.insert(attr.to_string(), value);
        }
    }

    /// Identity plus attributes, as sent to create/update endpoints.
    pub fn metadata_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(id) = self.id {
            fields.insert("id".to_string(), Value::from(id));
        }
        if let Some(updated) = &self.updated_at {
            fields.insert("updated_at".to_string(), Value::from(updated.clone()));
        }
        for attr in self.kind.api_attributes() {
            let value = self.attrs.get(*attr).cloned().unwrap_or(Value::Null);
            fields.insert(attr.to_string(), value);
        }
        fields
    }

    /// Derive the repo path for an object that doesn't have one yet.
    pub fn generate_path(&mut self, config: &Config) -> Result<String> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let key = self.kind.secondary_keys()[0];
        let base = match self.attr_text(key) {
            Some(text) => text,
            None => {
                let id = self.id.ok_or_else(|| {
                    SyncError::Validation(format!("{} has neither {key} nor id", self.kind))
                })?;
                warn!("{} object doesn't have {key} attribute, using id {id} instead", self.kind);
                id.to_string()
            }
        };
        let sanitized: String = base
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let filename = format!("{}.{}", sanitized, self.extension());
        let mut parts = vec![config.path_prefix(self.kind).to_string()];
        let subpath = self.subpath();
        if !subpath.is_empty() {
            parts.push(subpath);
        }
        parts.push(filename);
        let path = parts.join("/");
        self.path = Some(path.clone());
        Ok(path)
    }

    fn extension(&self) -> String {
        match self.kind {
            ObjectKind::Script => script_like::script_extension(self),
            ObjectKind::ScriptModule => script_like::module_extension(self),
            ObjectKind::ConfigList => "csv".to_string(),
            ObjectKind::ConfigTemplate => "txt".to_string(),
            _ => "xml".to_string(),
        }
    }

    // Scripts are filed under their category subdir; everything else is flat.
    fn subpath(&self) -> String {
        if self.kind != ObjectKind::Script {
            return String::new();
        }
        match self.attr_str("category") {
            None | Some("Uncategorized") => String::new(),
            Some(category) => category.to_string(),
        }
    }

    /// Download this object's content from the server.
    pub fn pull(&mut self, transport: &dyn Transport) -> Result<(), SyncError> {
        let id = self
            .id
            .ok_or_else(|| SyncError::InvalidState(format!("{self} has no id to pull")))?;
        debug!("downloading content for {} id {id}", self.kind);
        match self.kind {
            ObjectKind::Script => {
                let raw = transport.export_file(self.kind, id)?;
                self.content = Some(script_like::strip_server_script_tags(self, &raw));
            }
            ObjectKind::ScriptModule | ObjectKind::ConfigList | ObjectKind::ConfigTemplate => {
                self.content = Some(transport.export_file(self.kind, id)?);
            }
            _ => xml::build_content(self, transport)?,
        }
        Ok(())
    }

    /// Content in the form stored in the repo, metadata header included where
    /// the kind carries one.
    pub fn export_content(&self) -> Result<String, SyncError> {
        let content = self.content()?;
        info!("{self} -> {}", self.path.as_deref().unwrap_or("?"));
        match self.kind {
            ObjectKind::Script
            | ObjectKind::ScriptModule
            | ObjectKind::ConfigList
            | ObjectKind::ConfigTemplate => {
                Ok(format!("{}{}", script_like::metadata_block(self), content))
            }
            _ => Ok(content.to_string()),
        }
    }

    pub fn content(&self) -> Result<&str, SyncError> {
        match (&self.content, &self.path) {
            (Some(content), _) => Ok(content),
            (None, Some(path)) => Err(SyncError::InvalidState(format!(
                "Content for {path} is not loaded"
            ))),
            (None, None) => Err(SyncError::InvalidState(
                "There is no such file in the repository".to_string(),
            )),
        }
    }

    /// Send this object to the server and record the outcome in its note.
    ///
    /// Transport failures are captured into the note and reported as
    /// `Ok(false)` so the caller can move on to the next object; validation
    /// and state errors propagate.
    pub fn push(&mut self, repo: &Repo, transport: &dyn Transport, mode: Mode) -> Result<bool> {
        self.content().map_err(anyhow::Error::from)?;
        let path = self.path.clone().unwrap_or_default();
        if self.id.is_none() {
            info!("{path} -> {self} NEW");
        } else {
            info!("{path} -> {self}");
        }
        if mode.is_preview() {
            debug!("preview: not pushing {path}");
            return Ok(true);
        }
        match self.do_push(transport) {
            Ok(record) => {
                self.merge_api_result(&record);
                self.error = None;
            }
            Err(err) if err.is_recordable() => {
                self.error = Some(err.to_string());
                error!("An error has occurred while syncing {path}: {err}");
                self.save_note(repo)?;
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
        self.save_note(repo)?;
        Ok(true)
    }

    fn do_push(&mut self, transport: &dyn Transport) -> Result<Record, SyncError> {
        match self.kind {
            ObjectKind::Script => script_like::push_script(self, transport),
            ObjectKind::ScriptModule => script_like::push_script_module(self, transport),
            ObjectKind::ConfigList => script_like::push_config_list(self, transport),
            ObjectKind::ConfigTemplate => script_like::push_config_template(self, transport),
            ObjectKind::PolicyRule => xml::push_policy_rule(self, transport),
            ObjectKind::Policy => xml::push_policy(self, transport),
            ObjectKind::CustomIssue => xml::push_custom_issue(self, transport),
        }
    }

    /// Delete the remote counterpart and retire the note. An object that was
    /// never pushed has no remote counterpart and only loses its note.
    pub fn delete_on_remote(
        &self,
        repo: &Repo,
        transport: &dyn Transport,
        mode: Mode,
    ) -> Result<()> {
        let path = self.path.as_deref().unwrap_or("?");
        info!("DEL {self} [{path}]");
        match self.id {
            None => info!("{path} wasn't found on server, ignoring"),
            Some(_) if mode.is_preview() => debug!("preview: not deleting {path}"),
            Some(id) => {
                debug!("calling {}.destroy with id {id}", self.kind);
                let extra = (self.kind == ObjectKind::CustomIssue).then(|| {
                    let mut extra = Map::new();
                    let issue_id = self.attrs.get("issue_id").cloned().unwrap_or(Value::Null);
                    extra.insert("IssueTypeID".to_string(), issue_id);
                    extra
                });
                transport.destroy(self.kind, id, extra.as_ref())?;
            }
        }
        if let Some(blob) = &self.blob {
            repo.clear_note(&blob.id)?;
        }
        Ok(())
    }

    /// Equality lookup by this kind's secondary keys.
    pub fn find_by_secondary_keys(
        &self,
        transport: &dyn Transport,
    ) -> Result<Vec<Record>, SyncError> {
        let criteria: Vec<(String, Value)> = self
            .kind
            .secondary_keys()
            .iter()
            .map(|key| {
                let value = self.attrs.get(*key).cloned().unwrap_or(Value::Null);
                (key.to_string(), value)
            })
            .collect();
        debug!("executing {}.find with {:?}", self.kind, criteria);
        transport.find_by(self.kind, &criteria)
    }

    pub fn save_note(&self, repo: &Repo) -> Result<()> {
        let blob = self.blob.as_ref().ok_or_else(|| {
            SyncError::InvalidState(format!("{self} has no blob to attach a note to"))
        })?;
        repo.write_note(blob, &self.note_record(blob))
    }

    pub fn note_record(&self, blob: &Blob) -> SyncNote {
        SyncNote {
            id: self.id,
            path: self.path.clone().unwrap_or_default(),
            updated_at: self.updated_at.clone(),
            blob: blob.id.clone(),
            kind: self.kind.name().to_string(),
            error: self.error.clone(),
        }
    }
}

impl std::fmt::Display for SyncedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.attr_text("name").unwrap_or_default();
        match self.id {
            Some(id) => write!(f, "{} \"{}\" (id {})", self.kind, name, id),
            None => write!(f, "{} \"{}\"", self.kind, name),
        }
    }
}

/// Ids arrive as numbers from the API and as strings from grid endpoints.
pub(crate) fn value_as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Stringify a scalar attribute; null stays absent.
pub(crate) fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Lenient boolean parse covering the spellings the server emits.
pub(crate) fn parse_bool_lenient(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_i64()? != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "y" | "yes" | "true" | "on" | "1" => Some(true),
            "n" | "no" | "false" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> Config {
        toml::from_str(
            r#"
            [remote]
            host = "server.example.com"
            username = "admin"
            password = "secret"
            [repo]
            root = "/tmp/repo"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_dependency_order_puts_rules_before_policies() {
        let order = ObjectKind::dependency_order();
        let rule_pos = order.iter().position(|k| *k == ObjectKind::PolicyRule).unwrap();
        let policy_pos = order.iter().position(|k| *k == ObjectKind::Policy).unwrap();
        assert!(rule_pos < policy_pos);
        assert_eq!(order.len(), ObjectKind::ALL.len());
    }

    #[test]
    fn test_from_api_copies_declared_attributes() {
        let record = json!({
            "id": 17,
            "updated_at": "2024-03-01 10:00:00",
            "name": "collect_inventory",
            "risk_level": "3",
            "language": "Python",
            "category": "Inventory",
            "irrelevant": "dropped"
        });
        let obj = SyncedObject::from_api(ObjectKind::Script, &record);
        assert_eq!(obj.id, Some(17));
        assert_eq!(obj.updated_at.as_deref(), Some("2024-03-01 10:00:00"));
        assert_eq!(obj.attr_str("name"), Some("collect_inventory"));
        assert_eq!(obj.attr_str("language"), Some("Python"));
        assert!(!obj.attrs.contains_key("irrelevant"));
        // Declared but absent attributes are present as null
        assert_eq!(obj.attrs.get("description"), Some(&Value::Null));
    }

    #[test]
    fn test_set_metadata_keeps_attrs_absent_from_partial_update() {
        let mut obj = SyncedObject::from_api(
            ObjectKind::Script,
            &json!({"id": 1, "name": "a", "language": "CCS"}),
        );
        let mut partial = Map::new();
        partial.insert("name".to_string(), Value::from("b"));
        obj.set_metadata(&partial);
        assert_eq!(obj.attr_str("name"), Some("b"));
        assert_eq!(obj.attr_str("language"), Some("CCS"));
    }

    #[test]
    fn test_generate_path_sanitizes_and_uses_category() {
        let config = test_config();
        let mut obj = SyncedObject::from_api(
            ObjectKind::Script,
            &json!({"id": 5, "name": "Reload BGP (all)", "language": "Perl", "category": "Routing"}),
        );
        let path = obj.generate_path(&config).unwrap();
        assert_eq!(path, "scripts/Routing/Reload_BGP__all_.pl");
        // Second call returns the memoized path
        assert_eq!(obj.generate_path(&config).unwrap(), path);
    }

    #[test]
    fn test_generate_path_falls_back_to_id() {
        let config = test_config();
        let mut obj = SyncedObject::from_api(ObjectKind::ConfigList, &json!({"id": 44}));
        let path = obj.generate_path(&config).unwrap();
        assert_eq!(path, "config_lists/44.csv");
    }

    #[test]
    fn test_generate_path_uncategorized_script_stays_flat() {
        let config = test_config();
        let mut obj = SyncedObject::from_api(
            ObjectKind::Script,
            &json!({"id": 6, "name": "probe", "language": "Python", "category": "Uncategorized"}),
        );
        assert_eq!(obj.generate_path(&config).unwrap(), "scripts/probe.py");
    }

    #[test]
    fn test_merge_api_result_unsets_omitted_attrs() {
        let mut obj = SyncedObject::from_api(
            ObjectKind::ConfigList,
            &json!({"id": 2, "name": "routers", "description": "all routers"}),
        );
        obj.merge_api_result(&json!({"id": 2, "updated_at": "2024-04-01 00:00:00", "name": "routers"}));
        assert_eq!(obj.attrs.get("description"), Some(&Value::Null));
        assert_eq!(obj.updated_at.as_deref(), Some("2024-04-01 00:00:00"));
    }

    #[test]
    fn test_parse_bool_lenient() {
        assert_eq!(parse_bool_lenient(&json!("Yes")), Some(true));
        assert_eq!(parse_bool_lenient(&json!("off")), Some(false));
        assert_eq!(parse_bool_lenient(&json!(true)), Some(true));
        assert_eq!(parse_bool_lenient(&json!(0)), Some(false));
        assert_eq!(parse_bool_lenient(&json!("maybe")), None);
    }

    #[test]
    fn test_value_as_id() {
        assert_eq!(value_as_id(&json!(12)), Some(12));
        assert_eq!(value_as_id(&json!("12")), Some(12));
        assert_eq!(value_as_id(&json!("x")), None);
        assert_eq!(value_as_id(&Value::Null), None);
    }
}
