use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PolicyError;

/// On-disk policy file, as written by the administrative interface.
///
/// `groups` keeps declaration order: classification scans groups in the
/// order they appear in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFile {
    /// group -> IP literal / CIDR, or a list of them
    #[serde(default, alias = "grupos")]
    pub groups: Map<String, Value>,
    /// group -> groups whose rules it follows (kept for the admin surface)
    #[serde(default)]
    pub acl: BTreeMap<String, Vec<String>>,
    /// group -> blocked suffixes and `<category>.list` tokens
    #[serde(default)]
    pub acl_sites: BTreeMap<String, Vec<String>>,
    /// group -> hand-typed subset of `acl_sites` (kept for the admin surface)
    #[serde(default)]
    pub acl_sites_manual: BTreeMap<String, Vec<String>>,
    /// group -> allowed suffixes, overriding `acl_sites`
    #[serde(default)]
    pub acl_sites_allow: BTreeMap<String, Vec<String>>,
    /// Listeners run only when enabled
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

impl Default for PolicyFile {
    fn default() -> Self {
        let names = ["default", "full", "controlado"];
        let mut groups = Map::new();
        for name in names {
            groups.insert(name.to_string(), Value::Array(vec![]));
        }
        let per_group = |with_self: bool| -> BTreeMap<String, Vec<String>> {
            names
                .iter()
                .map(|n| {
                    let v = if with_self { vec![n.to_string()] } else { vec![] };
                    (n.to_string(), v)
                })
                .collect()
        };

        Self {
            groups,
            acl: per_group(true),
            acl_sites: per_group(false),
            acl_sites_manual: per_group(false),
            acl_sites_allow: per_group(false),
            start: false,
            interfaces: vec![],
        }
    }
}

impl PolicyFile {
    /// Load the policy file, falling back to the default policy when it does not exist.
    pub fn load_from_file(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            tracing::info!("No policy file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| PolicyError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), PolicyError> {
        let content = serde_json::to_string_pretty(self).map_err(PolicyError::Serialize)?;
        write_atomic(path, &content)
    }
}

/// Static name -> address overrides, kept in their own file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualEntriesFile {
    #[serde(default, alias = "entradas")]
    pub entries: BTreeMap<String, String>,
}

impl ManualEntriesFile {
    /// Load the manual entries, creating an empty file when none exists.
    pub fn load_or_create(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            let empty = Self::default();
            empty.save_to_file(path)?;
            tracing::info!("Created empty manual entries file at {}", path.display());
            return Ok(empty);
        }
        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| PolicyError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), PolicyError> {
        let content = serde_json::to_string_pretty(self).map_err(PolicyError::Serialize)?;
        write_atomic(path, &content)
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<(), PolicyError> {
    let write_err = |source| PolicyError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content).map_err(write_err)?;
    std::fs::rename(&tmp_path, path).map_err(write_err)?;
    Ok(())
}
