//! Policy model: the on-disk policy files, category list expansion, suffix
//! matching and the immutable [`PolicySnapshot`] built from them.

pub mod config;
pub mod error;
pub mod filter;
pub mod loader;
pub mod snapshot;
pub mod sources;

pub use config::{ManualEntriesFile, PolicyFile};
pub use error::PolicyError;
pub use filter::{MatchMode, SuffixSet};
pub use loader::PolicyLoader;
pub use snapshot::{DEFAULT_GROUP, Member, PolicyGroup, PolicySnapshot, normalize_hostname};
