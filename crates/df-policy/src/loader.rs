use std::path::PathBuf;

use tracing::info;

use crate::config::{ManualEntriesFile, PolicyFile};
use crate::error::PolicyError;
use crate::filter::MatchMode;
use crate::snapshot::PolicySnapshot;
use crate::sources::CategoryLists;

/// Reads the policy inputs from disk and builds fresh snapshots.
#[derive(Debug, Clone)]
pub struct PolicyLoader {
    pub policy_file: PathBuf,
    pub manual_entries_file: PathBuf,
    pub lists_dir: PathBuf,
    pub local_hostname: String,
    pub match_mode: MatchMode,
}

impl PolicyLoader {
    /// Build a brand-new snapshot. Nothing is published here; on error the
    /// caller keeps whatever snapshot it already has.
    pub fn load(&self) -> Result<PolicySnapshot, PolicyError> {
        let policy = PolicyFile::load_from_file(&self.policy_file)?;
        let manual = ManualEntriesFile::load_or_create(&self.manual_entries_file)?;
        let mut lists = CategoryLists::new(&self.lists_dir);

        let snapshot = PolicySnapshot::build(
            &policy,
            &manual,
            &mut lists,
            &self.local_hostname,
            self.match_mode,
        )?;

        info!(
            "Policy loaded: {} groups, {} manual entries, {} interfaces, {} ({} matching)",
            snapshot.groups().len(),
            snapshot.manual_entry_count(),
            snapshot.interfaces().len(),
            if snapshot.enabled() { "enabled" } else { "disabled" },
            snapshot.match_mode(),
        );
        Ok(snapshot)
    }
}
