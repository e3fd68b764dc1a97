use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::objects::ObjectKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub remote: RemoteConfig,
    pub repo: RepoConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_proto")]
    pub proto: String,
    /// Management appliances commonly run on self-signed certificates, so
    /// verification is off unless asked for.
    #[serde(default)]
    pub ssl_verify: bool,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

fn default_proto() -> String {
    "https".to_string()
}

// Different versions of the remote API differ in more than just the version
// string. Bumping this must be tested against a real server first.
fn default_api_version() -> String {
    "3.1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepoConfig {
    /// Root of the local git repository holding the exported objects.
    pub root: PathBuf,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Servers ship many pre-installed read-only policies and rules; users
    /// cannot edit them, so there is little point in keeping them in the repo.
    #[serde(default = "default_skip_readonly")]
    pub skip_readonly: bool,
    #[serde(default)]
    pub paths: KindPaths,
}

fn default_skip_readonly() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            skip_readonly: true,
            paths: KindPaths::default(),
        }
    }
}

/// Repo subdirectory for each object kind. The subdirectory doubles as the
/// kind discriminator when a file is read back from the tree.
#[derive(Debug, Deserialize, Clone)]
pub struct KindPaths {
    #[serde(default = "default_scripts_dir")]
    pub script: String,
    #[serde(default = "default_script_modules_dir")]
    pub script_module: String,
    #[serde(default = "default_config_lists_dir")]
    pub config_list: String,
    #[serde(default = "default_config_templates_dir")]
    pub config_template: String,
    #[serde(default = "default_policy_rules_dir")]
    pub policy_rule: String,
    #[serde(default = "default_policies_dir")]
    pub policy: String,
    #[serde(default = "default_custom_issues_dir")]
    pub custom_issue: String,
}

fn default_scripts_dir() -> String {
    "scripts".to_string()
}
fn default_script_modules_dir() -> String {
    "script_modules".to_string()
}
fn default_config_lists_dir() -> String {
    "config_lists".to_string()
}
fn default_config_templates_dir() -> String {
    "config_templates".to_string()
}
fn default_policy_rules_dir() -> String {
    "policy_rules".to_string()
}
fn default_policies_dir() -> String {
    "policies".to_string()
}
fn default_custom_issues_dir() -> String {
    "custom_issues".to_string()
}

impl Default for KindPaths {
    fn default() -> Self {
        Self {
            script: default_scripts_dir(),
            script_module: default_script_modules_dir(),
            config_list: default_config_lists_dir(),
            config_template: default_config_templates_dir(),
            policy_rule: default_policy_rules_dir(),
            policy: default_policies_dir(),
            custom_issue: default_custom_issues_dir(),
        }
    }
}

impl Config {
    /// Repo subdirectory for a kind.
    pub fn path_prefix(&self, kind: ObjectKind) -> &str {
        let p = &self.sync.paths;
        match kind {
            ObjectKind::Script => &p.script,
            ObjectKind::ScriptModule => &p.script_module,
            ObjectKind::ConfigList => &p.config_list,
            ObjectKind::ConfigTemplate => &p.config_template,
            ObjectKind::PolicyRule => &p.policy_rule,
            ObjectKind::Policy => &p.policy,
            ObjectKind::CustomIssue => &p.custom_issue,
        }
    }

    /// Resolve the kind a repo-relative path belongs to by its subdirectory.
    pub fn kind_for_path(&self, path: &str) -> Option<ObjectKind> {
        ObjectKind::ALL.iter().copied().find(|&kind| {
            let prefix = self.path_prefix(kind);
            path.strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    match config.remote.proto.as_str() {
        "http" | "https" => {}
        other => anyhow::bail!("Invalid protocol '{}'. Must be http or https.", other),
    }

    if config.repo.branch.is_empty() {
        anyhow::bail!("repo.branch must not be empty");
    }

    // Two kinds sharing a subdirectory would make files unattributable
    let mut prefixes: Vec<&str> = ObjectKind::ALL
        .iter()
        .map(|&k| config.path_prefix(k))
        .collect();
    prefixes.sort_unstable();
    prefixes.dedup();
    if prefixes.len() != ObjectKind::ALL.len() {
        anyhow::bail!("sync.paths entries must be distinct per object kind");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[remote]
host = "nms.example.com"
username = "admin"
password = "secret"

[repo]
root = "/tmp/sync-repo"
"#;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = parse(MINIMAL);
        assert_eq!(cfg.remote.proto, "https");
        assert!(!cfg.remote.ssl_verify);
        assert_eq!(cfg.repo.branch, "main");
        assert!(cfg.sync.skip_readonly);
        assert_eq!(cfg.path_prefix(ObjectKind::Script), "scripts");
        assert_eq!(cfg.path_prefix(ObjectKind::Policy), "policies");
    }

    #[test]
    fn test_kind_for_path() {
        let cfg = parse(MINIMAL);
        assert_eq!(
            cfg.kind_for_path("scripts/foo.py"),
            Some(ObjectKind::Script)
        );
        assert_eq!(
            cfg.kind_for_path("policy_rules/bar.xml"),
            Some(ObjectKind::PolicyRule)
        );
        // Prefix must match a whole path component
        assert_eq!(cfg.kind_for_path("scripts_old/foo.py"), None);
        assert_eq!(cfg.kind_for_path("README.md"), None);
    }
}
