//! Keeps a network management server's automation objects (scripts, script
//! modules, config lists, config templates, policy rules, policies and
//! custom issues) in sync with a local git repository.
//!
//! The repository is the working copy: objects are exported into per-kind
//! subdirectories, edited and committed like any other code, and pushed back
//! to the server. Sync state lives in git notes keyed by content revision,
//! and a `synced-to-remote` tag marks the last commit whose changes reached
//! the server; everything between the tag and the branch tip is what the
//! next push sends.

pub mod config;
pub mod engine;
pub mod error;
pub mod mode;
pub mod objects;
pub mod repo;
pub mod transport;
