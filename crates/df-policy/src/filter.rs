use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashSet;

use crate::error::PolicyError;

/// How a suffix entry is compared against a hostname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Plain trailing-character comparison: `google.com` also matches
    /// `evilnotgoogle.com`. Compatible with existing deployments.
    #[default]
    Raw,
    /// Label-boundary comparison: `google.com` matches `google.com` and
    /// `mail.google.com` only.
    Label,
}

impl FromStr for MatchMode {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "raw" | "" => Ok(Self::Raw),
            "label" => Ok(Self::Label),
            other => Err(PolicyError::MatchMode(other.to_string())),
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::Label => write!(f, "label"),
        }
    }
}

/// A derived set of domain suffixes.
///
/// Built once per snapshot and never edited afterwards.
#[derive(Debug, Clone, Default)]
pub struct SuffixSet {
    ordered: Vec<String>,
    lookup: FxHashSet<String>,
}

impl SuffixSet {
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for suffix in suffixes {
            let suffix = suffix.as_ref().trim().trim_end_matches('.').to_lowercase();
            // An empty suffix would match every hostname
            if suffix.is_empty() {
                continue;
            }
            if set.lookup.insert(suffix.clone()) {
                set.ordered.push(suffix);
            }
        }
        set
    }

    /// `hostname` must already be lowercase and without the root dot.
    pub fn matches(&self, hostname: &str, mode: MatchMode) -> bool {
        match mode {
            MatchMode::Raw => self.ordered.iter().any(|s| hostname.ends_with(s.as_str())),
            MatchMode::Label => {
                // Walk the hierarchy: ads.tracker.com -> tracker.com -> com
                let mut check = hostname;
                loop {
                    if self.lookup.contains(check) {
                        return true;
                    }
                    match check.find('.') {
                        Some(pos) => check = &check[pos + 1..],
                        None => return false,
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(String::as_str)
    }
}
