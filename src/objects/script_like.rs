//! Codecs for the kinds that store metadata as a commented header block:
//! scripts, script modules, config lists and config templates.
//!
//! The header formats are dictated by what the server itself emits on export
//! and accepts on import, so they are reproduced here byte for byte. Scripts
//! are the worst offender: CCS scripts use one block layout and every other
//! language another.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{ObjectKind, SyncedObject};
use crate::error::SyncError;
use crate::transport::{Record, Transport};

// ── header parsing ─────────────────────────────────────────────────────

/// Tag-to-attribute tables for the kinds with a generic `# Tag: value`
/// header. Order matters: it is the order tags are written back out in.
const MODULE_TAGS: [(&str, &str); 4] = [
    ("Export of Script Module", "name"),
    ("Language", "language"),
    ("Category", "category"),
    ("Description", "description"),
];

const LIST_TAGS: [(&str, &str); 2] = [("Name", "name"), ("Description", "description")];

/// Parse `#*<ws>Tag:<ws>value` against a tag table.
fn parse_tagged_line<'a>(
    line: &'a str,
    tags: &[(&'static str, &'static str)],
) -> Option<(&'static str, &'a str)> {
    let rest = line.trim_start_matches('#').trim_start();
    for (tag, prop) in tags {
        let Some(after_tag) = rest.strip_prefix(tag) else {
            continue;
        };
        let Some(after_colon) = after_tag.strip_prefix(':') else {
            continue;
        };
        if after_colon.starts_with(char::is_whitespace) {
            return Some((prop, after_colon.trim()));
        }
    }
    None
}

/// Parse a script header line: `Script: name` or `Script-Tag: value`, with
/// any number of leading `#`.
fn parse_script_line(line: &str) -> Option<(&'static str, &str)> {
    let rest = line.trim_start_matches('#').trim_start();
    let rest = rest.strip_prefix("Script")?;
    let (prop, after_colon) = if let Some(tagged) = rest.strip_prefix('-') {
        let (tag, after) = tagged.split_once(':')?;
        let prop = match tag {
            "Description" => "description",
            "Level" => "risk_level",
            "Category" => "category",
            "Language" => "language",
            _ => return None,
        };
        (prop, after)
    } else {
        ("name", rest.strip_prefix(':')?)
    };
    if !after_colon.starts_with(char::is_whitespace) {
        return None;
    }
    Some((prop, after_colon.trim()))
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Extract the metadata embedded in a file's header block. The first
/// occurrence of each tag wins; the name falls back to the file's basename.
pub fn decode_metadata(obj: &SyncedObject) -> Map<String, Value> {
    let content = obj.content.as_deref().unwrap_or_default();
    let mut metadata = match obj.kind {
        ObjectKind::ConfigTemplate => decode_template_metadata(obj, content),
        kind => {
            let mut metadata = Map::new();
            for line in content.lines() {
                let parsed = match kind {
                    ObjectKind::Script => parse_script_line(line),
                    ObjectKind::ScriptModule => parse_tagged_line(line, &MODULE_TAGS),
                    _ => parse_tagged_line(line, &LIST_TAGS),
                };
                if let Some((prop, value)) = parsed {
                    metadata
                        .entry(prop.to_string())
                        .or_insert_with(|| Value::from(value));
                }
            }
            metadata
        }
    };

    // The name is mandatory; fall back to the filename when the header
    // doesn't carry one
    let name_key = obj.kind.secondary_keys()[0];
    if obj.attr_text(name_key).is_none() && !metadata.contains_key(name_key) {
        if let Some(path) = &obj.path {
            metadata.insert(name_key.to_string(), Value::from(basename(path)));
        }
    }

    if obj.kind == ObjectKind::Script {
        let language = metadata
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| obj.attr_text("language"));
        if language.as_deref().unwrap_or("").is_empty() {
            if let Some(path) = &obj.path {
                if let Some(detected) = detect_script_language(path) {
                    metadata.insert("language".to_string(), Value::from(detected));
                }
            }
        }
    }
    debug!("decoded {} metadata: {:?}", obj.kind, metadata);
    metadata
}

/// Template headers differ from the other script-likes: the description can
/// span several `Template-Description` lines and variables repeat one per
/// `Template-Variable` line.
fn decode_template_metadata(obj: &SyncedObject, content: &str) -> Map<String, Value> {
    const TAG_TO_ATTR: [(&str, &str); 5] = [
        ("Level", "risk_level"),
        ("Vendor", "vendor"),
        ("Device Type", "device_type"),
        ("Model", "model"),
        ("Version", "version"),
    ];
    let mut metadata = Map::new();
    let mut variables = Vec::new();
    let mut description = Vec::new();
    for line in content.lines() {
        let rest = line.trim_start_matches('#');
        if rest.starts_with(char::is_whitespace) {
            if let Some(name) = rest.trim_start().strip_prefix("Export of Template:") {
                if name.starts_with(char::is_whitespace) {
                    metadata
                        .entry("name".to_string())
                        .or_insert_with(|| Value::from(name.trim()));
                    continue;
                }
            }
        }
        let rest = rest.trim_start();
        let Some(tagged) = rest.strip_prefix("Template-") else {
            continue;
        };
        let Some((tag, value)) = tagged.split_once(':') else {
            continue;
        };
        if !value.starts_with(char::is_whitespace) {
            continue;
        }
        let value = value.trim();
        match tag {
            "Variable" => variables.push(Value::from(value)),
            "Description" => description.push(value.to_string()),
            _ => match TAG_TO_ATTR.iter().find(|(t, _)| *t == tag) {
                Some((_, attr)) => {
                    metadata
                        .entry(attr.to_string())
                        .or_insert_with(|| Value::from(value));
                }
                None => warn!("Unknown ConfigTemplate metadata tag {tag}. Ignoring"),
            },
        }
    }
    metadata.insert("template_variables_text".to_string(), Value::Array(variables));
    metadata.insert("description".to_string(), Value::from(description.join("\n")));
    // The server rejects templates without a type
    if obj.attr_text("template_type").is_none() {
        metadata.insert("template_type".to_string(), Value::from("Device"));
    }
    metadata
}

// ── header generation ──────────────────────────────────────────────────

const BOUNDARY: &str = "###############################################################################";

/// Build the header block prepended to a file on export.
pub fn metadata_block(obj: &SyncedObject) -> String {
    match obj.kind {
        ObjectKind::Script => script_metadata_block(obj),
        // The exported body already starts with a server-generated header
        ObjectKind::ConfigList => String::new(),
        ObjectKind::ConfigTemplate => format!("{BOUNDARY}\n{BOUNDARY}\n"),
        _ => {
            let mut lines = vec![BOUNDARY.to_string()];
            for (tag, prop) in MODULE_TAGS {
                lines.push(format!("# {}: {}", tag, obj.attr_text(prop).unwrap_or_default()));
            }
            lines.push(BOUNDARY.to_string());
            lines.push(String::new());
            lines.join("\n")
        }
    }
}

fn script_metadata_block(obj: &SyncedObject) -> String {
    let get = |attr: &str| obj.attr_text(attr).unwrap_or_default();
    let language = get("language");
    let mut lines = Vec::new();
    // The server demands a different block layout for CCS scripts. It works
    // this way; don't ask why.
    if language == "CCS" {
        lines.push(format!("## Script-Level: {}", get("risk_level")));
        lines.push(format!("## Script-Category: {}", get("category")));
        lines.push(format!("## Script-Language: {language}"));
        lines.push(format!("Script: {}", get("name")));
        lines.push(format!(
            "Script-Description: {}",
            format_description(&get("description"), true)
        ));
    } else {
        lines.push("# BEGIN-INTERNAL-SCRIPT-BLOCK".to_string());
        lines.push(format!("### Script-Level: {}", get("risk_level")));
        lines.push(format!("### Script-Category: {}", get("category")));
        lines.push(format!("### Script-Language: {language}"));
        lines.push(format!("# Script: {}", get("name")));
        lines.push(format!(
            "# Script-Description: {}",
            format_description(&get("description"), false)
        ));
        lines.push("# END-INTERNAL-SCRIPT-BLOCK".to_string());
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Continuation lines of a multi-line description are indented so the server
/// parses them as part of the same tag.
fn format_description(value: &str, ccs: bool) -> String {
    let mut result = Vec::new();
    for (idx, line) in value.lines().enumerate() {
        if idx == 0 {
            result.push(line.to_string());
        } else if ccs {
            result.push(format!("    {line}"));
        } else {
            result.push(format!("#   {line}"));
        }
    }
    result.join("\n")
}

/// Drop the first `####...`-delimited block from the content; returns the
/// content unchanged if there is no block.
pub fn strip_metadata_block(content: &str) -> String {
    let is_boundary = |line: &str| line.len() >= 10 && line.bytes().all(|b| b == b'#');
    let mut kept = Vec::new();
    let mut in_block = false;
    let mut block_done = false;
    for line in content.lines() {
        if block_done {
            kept.push(line);
        } else if !in_block {
            if is_boundary(line) {
                in_block = true;
            } else {
                kept.push(line);
            }
        } else if is_boundary(line) {
            block_done = true;
        }
    }
    kept.join("\n")
}

/// The script export endpoint leaves some of the metadata inline; remove it
/// so [`metadata_block`] can re-add it in a controlled fashion.
pub fn strip_server_script_tags(obj: &SyncedObject, raw: &str) -> String {
    let skip = [
        format!("## Script-Level: {}", obj.attr_text("risk_level").unwrap_or_default()),
        format!("## Script-Category: {}", obj.attr_text("category").unwrap_or_default()),
        format!("## Script-Language: {}", obj.attr_text("language").unwrap_or_default()),
    ];
    raw.lines()
        .filter(|line| !skip.iter().any(|s| s == line))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── language and extension mapping ─────────────────────────────────────

pub fn script_extension(obj: &SyncedObject) -> String {
    let language = obj.attr_text("language").unwrap_or_default();
    match language.to_lowercase().as_str() {
        "ccs" => "ccs".to_string(),
        "perl" => "pl".to_string(),
        "python" => "py".to_string(),
        other => {
            warn!(
                "{} is written in unknown language {language}",
                obj.path.as_deref().unwrap_or("script")
            );
            other.to_string()
        }
    }
}

pub fn module_extension(obj: &SyncedObject) -> String {
    let language = obj.attr_text("language").unwrap_or_default();
    match language.to_lowercase().as_str() {
        "perl" => "pm".to_string(),
        "python" => "py".to_string(),
        other => {
            warn!(
                "{} is written in unknown language {language}",
                obj.path.as_deref().unwrap_or("module")
            );
            other.to_string()
        }
    }
}

fn detect_script_language(path: &str) -> Option<&'static str> {
    let extension = path.rsplit('.').next().unwrap_or_default().to_lowercase();
    match extension.as_str() {
        "ccs" => Some("CCS"),
        "pl" => Some("Perl"),
        "py" => Some("Python"),
        _ => {
            warn!("Cannot determine language for {path}");
            None
        }
    }
}

// ── push ───────────────────────────────────────────────────────────────

pub fn push_script(
    obj: &mut SyncedObject,
    transport: &dyn Transport,
) -> Result<Record, SyncError> {
    let content = obj.content()?.to_string();
    let language = obj.attrs.get("language").cloned().unwrap_or(Value::Null);
    let mut fields = Map::new();
    match obj.id {
        None => {
            // The name travels inside the script header on create
            fields.insert("script_file".to_string(), Value::from(content));
            fields.insert("language".to_string(), language);
            transport.create(ObjectKind::Script, &fields)
        }
        Some(id) => {
            fields.insert("id".to_string(), Value::from(id));
            fields.insert(
                "script_name".to_string(),
                obj.attrs.get("name").cloned().unwrap_or(Value::Null),
            );
            fields.insert("script_file".to_string(), Value::from(content));
            fields.insert("language".to_string(), language);
            transport.update(ObjectKind::Script, &fields)
        }
    }
}

pub fn push_script_module(
    obj: &mut SyncedObject,
    transport: &dyn Transport,
) -> Result<Record, SyncError> {
    let content = strip_metadata_block(obj.content()?);
    let mut fields = Map::new();
    for attr in ["name", "language", "category", "description"] {
        fields.insert(
            attr.to_string(),
            obj.attrs.get(attr).cloned().unwrap_or(Value::Null),
        );
    }
    fields.insert("script_source".to_string(), Value::from(content));
    match obj.id {
        None => transport.create(ObjectKind::ScriptModule, &fields),
        Some(id) => {
            fields.insert("id".to_string(), Value::from(id));
            fields.insert("overwrite_ind".to_string(), Value::from(1));
            transport.update(ObjectKind::ScriptModule, &fields)
        }
    }
}

/// Config lists cannot be created or updated through the regular endpoints;
/// the body goes through a file import, and the resulting record has to be
/// fetched again because the import response only carries an id.
pub fn push_config_list(
    obj: &mut SyncedObject,
    transport: &dyn Transport,
) -> Result<Record, SyncError> {
    if let Some(id) = obj.id {
        let mut fields = Map::new();
        fields.insert("id".to_string(), Value::from(id));
        fields.insert(
            "name".to_string(),
            obj.attrs.get("name").cloned().unwrap_or(Value::Null),
        );
        fields.insert(
            "description".to_string(),
            obj.attrs.get("description").cloned().unwrap_or(Value::Null),
        );
        transport.update(ObjectKind::ConfigList, &fields)?;
    }
    let id = transport.import_config_list(obj.content()?)?;
    transport.show(ObjectKind::ConfigList, id)
}

pub fn push_config_template(
    obj: &mut SyncedObject,
    transport: &dyn Transport,
) -> Result<Record, SyncError> {
    let mut fields = obj.metadata_fields();
    fields.insert(
        "template_text".to_string(),
        Value::from(strip_metadata_block(obj.content()?)),
    );
    // The template endpoints reject nulls outright
    for (_, value) in fields.iter_mut() {
        if value.is_null() {
            *value = Value::from("");
        }
    }
    match obj.id {
        None => transport.create(ObjectKind::ConfigTemplate, &fields),
        Some(_) => transport.update(ObjectKind::ConfigTemplate, &fields),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn script_with_content(kind: ObjectKind, path: &str, content: &str) -> SyncedObject {
        let mut obj = SyncedObject::new(kind);
        obj.path = Some(path.to_string());
        obj.content = Some(content.to_string());
        obj
    }

    #[test]
    fn test_decode_script_header() {
        let content = "\
# BEGIN-INTERNAL-SCRIPT-BLOCK
### Script-Level: 3
### Script-Category: Routing
### Script-Language: Python
# Script: Reload BGP
# Script-Description: reload all the things
# END-INTERNAL-SCRIPT-BLOCK

import sys
";
        let obj = script_with_content(ObjectKind::Script, "scripts/reload.py", content);
        let metadata = decode_metadata(&obj);
        assert_eq!(metadata["name"], "Reload BGP");
        assert_eq!(metadata["risk_level"], "3");
        assert_eq!(metadata["category"], "Routing");
        assert_eq!(metadata["language"], "Python");
        assert_eq!(metadata["description"], "reload all the things");
    }

    #[test]
    fn test_decode_script_first_occurrence_wins() {
        let content = "# Script: first\n# Script: second\n";
        let obj = script_with_content(ObjectKind::Script, "scripts/a.py", content);
        assert_eq!(decode_metadata(&obj)["name"], "first");
    }

    #[test]
    fn test_decode_script_name_falls_back_to_basename() {
        let obj = script_with_content(ObjectKind::Script, "scripts/net/probe.py", "print(1)\n");
        let metadata = decode_metadata(&obj);
        assert_eq!(metadata["name"], "probe.py");
        // No language in the header either, so it is detected from the path
        assert_eq!(metadata["language"], "Python");
    }

    #[test]
    fn test_decode_ccs_script_header() {
        let content = "Script: Interface Audit\nScript-Description: audits stuff\n";
        let obj = script_with_content(ObjectKind::Script, "scripts/audit.ccs", content);
        let metadata = decode_metadata(&obj);
        assert_eq!(metadata["name"], "Interface Audit");
        assert_eq!(metadata["language"], "CCS");
    }

    #[test]
    fn test_decode_module_header() {
        let content = "\
###############################################################################
# Export of Script Module: helpers
# Language: Python
# Category: Uncategorized
# Description: shared helpers
###############################################################################
def helper():
    pass
";
        let obj = script_with_content(ObjectKind::ScriptModule, "script_modules/helpers.py", content);
        let metadata = decode_metadata(&obj);
        assert_eq!(metadata["name"], "helpers");
        assert_eq!(metadata["language"], "Python");
        assert_eq!(metadata["description"], "shared helpers");
    }

    #[test]
    fn test_decode_template_header() {
        let content = "\
## Export of Template: Base ACL
## Template-Level: 2
## Template-Vendor: Cisco
## Template-Description: first line
## Template-Description: second line
## Template-Variable: $iface
## Template-Variable: $acl_number
access-list $acl_number permit ip any any
";
        let obj = script_with_content(
            ObjectKind::ConfigTemplate,
            "config_templates/Base_ACL.txt",
            content,
        );
        let metadata = decode_metadata(&obj);
        assert_eq!(metadata["name"], "Base ACL");
        assert_eq!(metadata["risk_level"], "2");
        assert_eq!(metadata["vendor"], "Cisco");
        assert_eq!(metadata["description"], "first line\nsecond line");
        assert_eq!(
            metadata["template_variables_text"],
            json!(["$iface", "$acl_number"])
        );
        assert_eq!(metadata["template_type"], "Device");
    }

    #[test]
    fn test_script_metadata_block_generic() {
        let mut obj = SyncedObject::new(ObjectKind::Script);
        obj.attrs = json!({
            "name": "Reload BGP",
            "description": "line one\nline two",
            "risk_level": "3",
            "category": "Routing",
            "language": "Python"
        })
        .as_object()
        .unwrap()
        .clone();
        let block = metadata_block(&obj);
        assert!(block.starts_with("# BEGIN-INTERNAL-SCRIPT-BLOCK\n"));
        assert!(block.contains("### Script-Level: 3\n"));
        assert!(block.contains("# Script-Description: line one\n#   line two\n"));
        assert!(block.contains("# END-INTERNAL-SCRIPT-BLOCK\n"));
    }

    #[test]
    fn test_script_metadata_block_ccs() {
        let mut obj = SyncedObject::new(ObjectKind::Script);
        obj.attrs = json!({
            "name": "Audit",
            "description": "a\nb",
            "risk_level": "1",
            "category": "Uncategorized",
            "language": "CCS"
        })
        .as_object()
        .unwrap()
        .clone();
        let block = metadata_block(&obj);
        assert!(block.starts_with("## Script-Level: 1\n"));
        assert!(block.contains("\nScript: Audit\n"));
        assert!(block.contains("Script-Description: a\n    b\n"));
        assert!(!block.contains("BEGIN-INTERNAL-SCRIPT-BLOCK"));
    }

    #[test]
    fn test_strip_metadata_block() {
        let content = "\
keep me
###############################################################################
# Name: routers
###############################################################################
a,b,c
";
        assert_eq!(strip_metadata_block(content), "keep me\na,b,c");
        // Short # runs are not boundaries
        assert_eq!(strip_metadata_block("#####\nbody"), "#####\nbody");
        assert_eq!(strip_metadata_block("no block"), "no block");
    }

    #[test]
    fn test_strip_server_script_tags() {
        let mut obj = SyncedObject::new(ObjectKind::Script);
        obj.attrs = json!({"risk_level": "3", "category": "Routing", "language": "Python"})
            .as_object()
            .unwrap()
            .clone();
        let raw = "## Script-Level: 3\n## Script-Category: Routing\n## Script-Language: Python\nbody\n";
        assert_eq!(strip_server_script_tags(&obj, raw), "body");
    }

    #[test]
    fn test_extensions() {
        let mut obj = SyncedObject::new(ObjectKind::Script);
        obj.attrs.insert("language".to_string(), json!("Perl"));
        assert_eq!(script_extension(&obj), "pl");
        obj.kind = ObjectKind::ScriptModule;
        assert_eq!(module_extension(&obj), "pm");
        obj.attrs.insert("language".to_string(), json!("CCS"));
        obj.kind = ObjectKind::Script;
        assert_eq!(script_extension(&obj), "ccs");
    }
}
