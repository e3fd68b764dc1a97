//! Remote server transport.
//!
//! [`Transport`] is the narrow surface the object model talks to; the
//! blocking [`HttpTransport`] implements it against the management server's
//! REST API. Responses are handed around as raw [`serde_json::Value`] records
//! with controller-specific wrappers already unwrapped, so callers never see
//! whether a record arrived as `{"script": {...}}` or bare.
//!
//! Custom issues are the exception to everything: they are only reachable
//! through undocumented web-UI endpoints, which may stop working without
//! warning. If an official API ever appears, use it instead.

use reqwest::blocking::Client;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::SyncError;
use crate::objects::ObjectKind;

pub type Record = Value;

/// Remote operations needed by the sync engine, one implementation per
/// server flavor (plus in-memory fakes in tests).
pub trait Transport {
    /// List all records of a kind.
    fn index(&self, kind: ObjectKind) -> Result<Vec<Record>, SyncError>;

    /// Fetch one record by id.
    fn show(&self, kind: ObjectKind, id: i64) -> Result<Record, SyncError>;

    /// Create a record; returns the created record with server-assigned
    /// fields.
    fn create(&self, kind: ObjectKind, fields: &Map<String, Value>) -> Result<Record, SyncError>;

    /// Update a record; `fields` must carry the id where the kind needs one.
    fn update(&self, kind: ObjectKind, fields: &Map<String, Value>) -> Result<Record, SyncError>;

    /// Delete a record. `extra` carries kind-specific fields (custom issues
    /// need the issue type id as well).
    fn destroy(
        &self,
        kind: ObjectKind,
        id: i64,
        extra: Option<&Map<String, Value>>,
    ) -> Result<(), SyncError>;

    /// Equality lookup on the given fields, used for id recovery.
    fn find_by(
        &self,
        kind: ObjectKind,
        criteria: &[(String, Value)],
    ) -> Result<Vec<Record>, SyncError>;

    /// Download a script-like object's file content.
    fn export_file(&self, kind: ObjectKind, id: i64) -> Result<String, SyncError>;

    /// Upload a config list body. The response is not a full record — only
    /// the id comes back, and the caller must re-fetch via [`Transport::show`].
    fn import_config_list(&self, content: &str) -> Result<i64, SyncError>;

    /// Short names and ids of the rules currently attached to a policy.
    fn policy_rules(&self, policy_id: i64) -> Result<Vec<Record>, SyncError>;

    fn add_policy_rule(&self, policy_id: i64, rule_id: i64) -> Result<(), SyncError>;

    fn remove_policy_rule(&self, policy_id: i64, rule_id: i64) -> Result<(), SyncError>;
}

/// Blocking HTTP implementation against the management server.
pub struct HttpTransport {
    client: Client,
    base: String,
    webui_base: String,
    username: String,
    password: String,
}

impl HttpTransport {
    pub fn new(remote: &RemoteConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!remote.ssl_verify)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base: format!(
                "{}://{}/api/{}",
                remote.proto, remote.host, remote.api_version
            ),
            webui_base: format!("{}://{}/webui", remote.proto, remote.host),
            username: remote.username.clone(),
            password: remote.password.clone(),
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, SyncError> {
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        check_status(response)
    }

    fn post(&self, url: &str, body: &Value) -> Result<Value, SyncError> {
        debug!("POST {url}");
        let response = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let response = check_status(response)?;
        response
            .json()
            .map_err(|e| SyncError::Transport(e.to_string()))
    }

    fn api_url(&self, kind: ObjectKind, method: &str) -> String {
        format!("{}/{}/{}", self.base, kind.controller(), method)
    }
}

/// Turn a non-success response into a parsed transport error.
fn check_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, SyncError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().unwrap_or_default();
    Err(SyncError::Transport(parse_error(&body, &status.to_string())))
}

/// Extract a readable message from an error body.
///
/// The server reports errors as JSON `{"message": ..., "fields": {field:
/// [messages]}}` when it can; anything else is passed through as-is.
pub fn parse_error(body: &str, fallback: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return if body.trim().is_empty() {
            fallback.to_string()
        } else {
            body.trim().to_string()
        };
    };
    let Some(message) = parsed.get("message").and_then(Value::as_str) else {
        return if body.trim().is_empty() {
            fallback.to_string()
        } else {
            body.trim().to_string()
        };
    };
    let mut field_msgs = Vec::new();
    if let Some(fields) = parsed.get("fields").and_then(Value::as_object) {
        for (field, val) in fields {
            let joined = match val {
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" "),
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            field_msgs.push(format!("{field}: {joined}"));
        }
    }
    if field_msgs.is_empty() {
        message.to_string()
    } else {
        format!("{}: {}", message, field_msgs.join(", "))
    }
}

/// Unwrap `{"script": {...}}`-style singular wrappers some controllers use.
fn unwrap_record(kind: ObjectKind, value: Value) -> Record {
    let mut value = value;
    if let Some(inner) = value.get_mut(kind.record_key()) {
        return inner.take();
    }
    value
}

/// Unwrap an index response: either a bare array or an object whose
/// plural-keyed member holds the records.
fn unwrap_records(value: Value) -> Vec<Record> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            for (_, v) in map.iter_mut() {
                if let Value::Array(items) = v {
                    return std::mem::take(items);
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// The web-UI grid uses its own field names; rewrite them into the ones the
/// rest of the code expects.
fn normalize_issue_record(mut record: Value) -> Record {
    const RENAMES: [(&str, &str); 8] = [
        ("IssueAdHocID", "id"),
        ("Title", "name"),
        ("IssueTypeID", "issue_id"),
        ("Description", "description"),
        ("Component", "component"),
        ("Correctness", "correctness"),
        ("Stability", "stability"),
        ("Details", "details"),
    ];
    if let Some(map) = record.as_object_mut() {
        for (from, to) in RENAMES {
            if let Some(val) = map.remove(from) {
                map.insert(to.to_string(), val);
            }
        }
        map.entry("updated_at")
            .or_insert_with(|| Value::String("1970-01-01 00:00:00".to_string()));
    }
    record
}

impl Transport for HttpTransport {
    fn index(&self, kind: ObjectKind) -> Result<Vec<Record>, SyncError> {
        if kind == ObjectKind::CustomIssue {
            let url = format!(
                "{}/grid_data/custom_issues_config_manage_job_manage_grid.json?IssueSource=C",
                self.webui_base
            );
            let value: Value = self
                .get(&url)?
                .json()
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            let rows = value
                .get("rows")
                .cloned()
                .unwrap_or(Value::Array(Vec::new()));
            return Ok(unwrap_records(rows)
                .into_iter()
                .map(normalize_issue_record)
                .collect());
        }
        let value: Value = self
            .get(&self.api_url(kind, "index"))?
            .json()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(unwrap_records(value))
    }

    fn show(&self, kind: ObjectKind, id: i64) -> Result<Record, SyncError> {
        if kind == ObjectKind::CustomIssue {
            let url = format!("{}/issues_adhoc/{}.json", self.webui_base, id);
            let value: Value = self
                .get(&url)?
                .json()
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            let mut record = value.get("ad_hoc_issue").cloned().unwrap_or(Value::Null);
            if let (Some(map), Some(details)) = (record.as_object_mut(), value.get("details")) {
                map.insert("Details".to_string(), details.clone());
            }
            return Ok(normalize_issue_record(record));
        }
        let url = format!("{}?id={}", self.api_url(kind, "show"), id);
        let value: Value = self
            .get(&url)?
            .json()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(unwrap_record(kind, value))
    }

    fn create(&self, kind: ObjectKind, fields: &Map<String, Value>) -> Result<Record, SyncError> {
        let url = if kind == ObjectKind::CustomIssue {
            format!("{}/issues_adhoc/create", self.webui_base)
        } else {
            self.api_url(kind, "create")
        };
        let value = self.post(&url, &Value::Object(fields.clone()))?;
        Ok(unwrap_record(kind, value))
    }

    fn update(&self, kind: ObjectKind, fields: &Map<String, Value>) -> Result<Record, SyncError> {
        let url = if kind == ObjectKind::CustomIssue {
            format!("{}/issues_adhoc/update", self.webui_base)
        } else {
            self.api_url(kind, "update")
        };
        let value = self.post(&url, &Value::Object(fields.clone()))?;
        Ok(unwrap_record(kind, value))
    }

    fn destroy(
        &self,
        kind: ObjectKind,
        id: i64,
        extra: Option<&Map<String, Value>>,
    ) -> Result<(), SyncError> {
        if kind == ObjectKind::CustomIssue {
            let url = format!("{}/issues_adhoc/delete", self.webui_base);
            let mut body = Map::new();
            body.insert("IssueAdHocID".to_string(), Value::from(id));
            if let Some(extra) = extra {
                for (k, v) in extra {
                    body.insert(k.clone(), v.clone());
                }
            }
            self.post(&url, &Value::Object(body))?;
            return Ok(());
        }
        let mut body = Map::new();
        body.insert("id".to_string(), Value::from(id));
        self.post(&self.api_url(kind, "destroy"), &Value::Object(body))?;
        Ok(())
    }

    fn find_by(
        &self,
        kind: ObjectKind,
        criteria: &[(String, Value)],
    ) -> Result<Vec<Record>, SyncError> {
        if kind == ObjectKind::CustomIssue {
            // The grid endpoint only supports a single-field query
            let Some((field, value)) = criteria.first() else {
                return Ok(Vec::new());
            };
            let api_field = ObjectKind::CustomIssue
                .api_field(field)
                .unwrap_or(field.as_str());
            let query = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let url = format!(
                "{}/grid_data/custom_issues_config_manage_job_manage_grid.json\
                 ?IssueSource=C&start=0&limit=31&fields=[\"{}\"]&query={}",
                self.webui_base, api_field, query
            );
            let parsed: Value = self
                .get(&url)?
                .json()
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            let rows = parsed
                .get("rows")
                .cloned()
                .unwrap_or(Value::Array(Vec::new()));
            return Ok(unwrap_records(rows)
                .into_iter()
                .map(normalize_issue_record)
                .collect());
        }
        let mut body = Map::new();
        for (field, value) in criteria {
            body.insert(format!("op_{field}"), Value::from("="));
            body.insert(format!("val_c_{field}"), value.clone());
        }
        let value = self.post(&self.api_url(kind, "find"), &Value::Object(body))?;
        Ok(unwrap_records(value))
    }

    fn export_file(&self, kind: ObjectKind, id: i64) -> Result<String, SyncError> {
        // Scripts and script modules export via export_file; lists and
        // templates via export.
        let method = match kind {
            ObjectKind::Script | ObjectKind::ScriptModule => "export_file",
            _ => "export",
        };
        let url = format!("{}?id={}", self.api_url(kind, method), id);
        let response = self.get(&url)?;
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));
        let body = response
            .text()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if is_json {
            let parsed: Value =
                serde_json::from_str(&body).map_err(|e| SyncError::Transport(e.to_string()))?;
            if let Some(content) = parsed.get("content").and_then(Value::as_str) {
                return Ok(content.to_string());
            }
        }
        // Older API versions return the raw body instead of JSON
        Ok(body)
    }

    fn import_config_list(&self, content: &str) -> Result<i64, SyncError> {
        let url = self.api_url(ObjectKind::ConfigList, "import");
        debug!("POST {url}");
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(&[("overwrite_ind", "1"), ("file", content)])
            .send()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let response = check_status(response)?;
        let result: Value = response
            .json()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        if !result
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let message = result
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("import rejected");
            return Err(SyncError::Transport(message.to_string()));
        }
        result
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| SyncError::Transport("import response carried no id".to_string()))
    }

    fn policy_rules(&self, policy_id: i64) -> Result<Vec<Record>, SyncError> {
        let url = format!(
            "{}?id={}",
            self.api_url(ObjectKind::Policy, "policy_rules"),
            policy_id
        );
        let value: Value = self
            .get(&url)?
            .json()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(unwrap_records(value))
    }

    fn add_policy_rule(&self, policy_id: i64, rule_id: i64) -> Result<(), SyncError> {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::from(policy_id));
        body.insert("policy_rule_id".to_string(), Value::from(rule_id));
        self.post(
            &self.api_url(ObjectKind::Policy, "add_policy_rules"),
            &Value::Object(body),
        )?;
        Ok(())
    }

    fn remove_policy_rule(&self, policy_id: i64, rule_id: i64) -> Result<(), SyncError> {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::from(policy_id));
        body.insert("policy_rule_id".to_string(), Value::from(rule_id));
        self.post(
            &self.api_url(ObjectKind::Policy, "remove_policy_rules"),
            &Value::Object(body),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_structured() {
        let body = r#"{"message": "Validation failed", "fields": {"name": ["is required", "too short"]}}"#;
        assert_eq!(
            parse_error(body, "500"),
            "Validation failed: name: is required too short"
        );
    }

    #[test]
    fn test_parse_error_message_only() {
        let body = r#"{"message": "Not found"}"#;
        assert_eq!(parse_error(body, "404"), "Not found");
    }

    #[test]
    fn test_parse_error_raw_text() {
        assert_eq!(parse_error("Internal Server Error", "500"), "Internal Server Error");
        assert_eq!(parse_error("", "502 Bad Gateway"), "502 Bad Gateway");
        // JSON without a message field falls back to the raw body
        assert_eq!(parse_error(r#"{"oops": 1}"#, "500"), r#"{"oops": 1}"#);
    }

    #[test]
    fn test_unwrap_record() {
        let wrapped = serde_json::json!({"script_module": {"id": 3, "name": "m"}});
        let record = unwrap_record(ObjectKind::ScriptModule, wrapped);
        assert_eq!(record["id"], 3);

        let bare = serde_json::json!({"id": 4, "name": "s"});
        let record = unwrap_record(ObjectKind::Script, bare.clone());
        assert_eq!(record, bare);
    }

    #[test]
    fn test_unwrap_records() {
        let wrapped = serde_json::json!({"scripts": [{"id": 1}, {"id": 2}], "total": 2});
        assert_eq!(unwrap_records(wrapped).len(), 2);
        let bare = serde_json::json!([{"id": 1}]);
        assert_eq!(unwrap_records(bare).len(), 1);
    }

    #[test]
    fn test_normalize_issue_record() {
        let row = serde_json::json!({
            "IssueAdHocID": 12,
            "Title": "Stale config",
            "IssueTypeID": "StaleConf",
            "Correctness": "on"
        });
        let record = normalize_issue_record(row);
        assert_eq!(record["id"], 12);
        assert_eq!(record["name"], "Stale config");
        assert_eq!(record["issue_id"], "StaleConf");
        assert_eq!(record["updated_at"], "1970-01-01 00:00:00");
    }
}
