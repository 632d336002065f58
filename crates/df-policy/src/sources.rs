use std::path::PathBuf;

use rustc_hash::FxHashMap;
use tracing::info;

use crate::error::PolicyError;

/// Categories shipped with the appliance; each one is `<lists_dir>/<name>.txt`.
pub const CATEGORIES: &[&str] = &[
    "porn",
    "social_nets",
    "gov",
    "doh",
    "gamble",
    "sports",
    "videogames",
    "music_streaming",
    "video_streaming",
    "webcommerce",
];

const LIST_TOKEN_SUFFIX: &str = ".list";

/// Map a `<name>.list` ACL token to its category name.
pub fn category_of(token: &str) -> Option<&str> {
    let name = token.trim().strip_suffix(LIST_TOKEN_SUFFIX)?;
    if name.is_empty() {
        return None;
    }
    // The admin UI has always emitted "sport.list" for the sports file
    Some(if name == "sport" { "sports" } else { name })
}

/// Category list files read from disk, memoized for one snapshot build.
pub struct CategoryLists {
    dir: PathBuf,
    loaded: FxHashMap<String, Vec<String>>,
}

impl CategoryLists {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            loaded: FxHashMap::default(),
        }
    }

    /// Expand one ACL entry into suffixes.
    ///
    /// `<category>.list` tokens pull in the category file; anything else is
    /// taken as one or more literal suffixes, one per line.
    pub fn expand(&mut self, entry: &str) -> Result<Vec<String>, PolicyError> {
        match category_of(entry) {
            Some(category) => self.category(category).map(|s| s.to_vec()),
            None => Ok(entry
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
        }
    }

    fn category(&mut self, name: &str) -> Result<&[String], PolicyError> {
        if !self.loaded.contains_key(name) {
            let path = self.dir.join(format!("{name}.txt"));
            let content =
                std::fs::read_to_string(&path).map_err(|source| PolicyError::CategoryList {
                    name: name.to_string(),
                    path: path.clone(),
                    source,
                })?;
            let suffixes = parse_suffix_list(&content);
            info!("Category list '{}': {} suffixes", name, suffixes.len());
            self.loaded.insert(name.to_string(), suffixes);
        }
        Ok(self.loaded.get(name).map(Vec::as_slice).unwrap_or_default())
    }
}

/// Parse a category file: whitespace-separated suffixes, `#` starts a comment.
pub fn parse_suffix_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(str::split_whitespace)
        .map(str::to_lowercase)
        .collect()
}
