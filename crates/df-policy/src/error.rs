use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while reading policy inputs or building a snapshot.
///
/// Any of these rejects the new snapshot; the previously published one
/// stays active.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize policy: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Group '{group}' members must be a string or a list of strings")]
    InvalidMembers { group: String },
    #[error("Group '{group}' has invalid member '{member}' (expected IP address or CIDR)")]
    InvalidMember { group: String, member: String },
    #[error("{section} references unknown group '{group}'")]
    UnknownGroup { section: &'static str, group: String },
    #[error("Category list '{name}' unavailable at {}: {source}", path.display())]
    CategoryList {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Unknown suffix match mode '{0}' (expected 'raw' or 'label')")]
    MatchMode(String),
}
