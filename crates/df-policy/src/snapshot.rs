use std::net::IpAddr;

use ipnet::IpNet;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::warn;

use crate::config::{ManualEntriesFile, PolicyFile};
use crate::error::PolicyError;
use crate::filter::{MatchMode, SuffixSet};
use crate::sources::CategoryLists;

/// Group every unmatched client falls into.
pub const DEFAULT_GROUP: &str = "default";

/// One entry of a group's membership list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    Address(IpAddr),
    Network(IpNet),
}

impl Member {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(ip) = raw.parse::<IpAddr>() {
            return Some(Self::Address(ip));
        }
        // Host bits are allowed ("10.0.0.5/24" is the 10.0.0.0/24 network)
        raw.parse::<IpNet>().ok().map(Self::Network)
    }
}

#[derive(Debug, Clone)]
pub struct PolicyGroup {
    pub name: String,
    pub members: Vec<Member>,
    pub blocked: SuffixSet,
    pub allowed: SuffixSet,
}

impl PolicyGroup {
    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: vec![],
            blocked: SuffixSet::default(),
            allowed: SuffixSet::default(),
        }
    }

    fn has_address(&self, ip: IpAddr) -> bool {
        self.members
            .iter()
            .any(|m| matches!(m, Member::Address(addr) if *addr == ip))
    }

    fn contains(&self, ip: IpAddr) -> bool {
        self.members
            .iter()
            .any(|m| matches!(m, Member::Network(net) if net.contains(&ip)))
    }
}

/// One immutable, complete version of the active policy.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    groups: Vec<PolicyGroup>,
    manual_entries: FxHashMap<String, IpAddr>,
    interfaces: Vec<String>,
    enabled: bool,
    local_hostname: String,
    match_mode: MatchMode,
}

impl PolicySnapshot {
    /// Disabled snapshot with only the default group.
    pub fn empty(local_hostname: &str) -> Self {
        Self {
            groups: vec![PolicyGroup::empty(DEFAULT_GROUP)],
            manual_entries: FxHashMap::default(),
            interfaces: vec![],
            enabled: false,
            local_hostname: local_hostname.to_string(),
            match_mode: MatchMode::default(),
        }
    }

    pub fn build(
        policy: &PolicyFile,
        manual: &ManualEntriesFile,
        lists: &mut CategoryLists,
        local_hostname: &str,
        match_mode: MatchMode,
    ) -> Result<Self, PolicyError> {
        let mut groups = Vec::with_capacity(policy.groups.len() + 1);
        for (name, value) in &policy.groups {
            let members = parse_members(name, value)?;
            groups.push(PolicyGroup {
                members,
                ..PolicyGroup::empty(name)
            });
        }
        if !groups.iter().any(|g| g.name == DEFAULT_GROUP) {
            groups.push(PolicyGroup::empty(DEFAULT_GROUP));
        }

        let known = |name: &str| groups.iter().any(|g| g.name == name);
        for (section, table) in [
            ("acl_sites", &policy.acl_sites),
            ("acl_sites_allow", &policy.acl_sites_allow),
            ("acl", &policy.acl),
        ] {
            for (group, entries) in table {
                if !known(group) {
                    return Err(PolicyError::UnknownGroup {
                        section,
                        group: group.clone(),
                    });
                }
                if section == "acl" {
                    if let Some(other) = entries.iter().find(|g| !known(g)) {
                        return Err(PolicyError::UnknownGroup {
                            section,
                            group: other.clone(),
                        });
                    }
                }
            }
        }

        for group in &mut groups {
            group.blocked = expand_suffixes(policy.acl_sites.get(&group.name), lists)?;
            group.allowed = expand_suffixes(policy.acl_sites_allow.get(&group.name), lists)?;
        }

        let mut manual_entries = FxHashMap::default();
        for (domain, value) in &manual.entries {
            match value.trim().parse::<IpAddr>() {
                Ok(ip) => {
                    manual_entries.insert(normalize_hostname(domain), ip);
                }
                Err(_) => warn!("Ignoring manual entry {} -> {:?}: not an IP address", domain, value),
            }
        }

        Ok(Self {
            groups,
            manual_entries,
            interfaces: policy.interfaces.clone(),
            enabled: policy.start,
            local_hostname: local_hostname.to_string(),
            match_mode,
        })
    }

    /// Pure group lookup: exact address members first, then CIDR containment,
    /// both in declaration order; `default` when nothing matches.
    pub fn match_group(&self, ip: IpAddr) -> &str {
        self.groups
            .iter()
            .find(|g| g.has_address(ip))
            .or_else(|| self.groups.iter().find(|g| g.contains(ip)))
            .map(|g| g.name.as_str())
            .unwrap_or(DEFAULT_GROUP)
    }

    /// Policy decision for `qname` (trailing root dot optional).
    ///
    /// Blocked iff a block suffix matches and no allow suffix does. An unknown
    /// group is evaluated with the default group's rules.
    pub fn is_blocked(&self, group: &str, qname: &str) -> bool {
        let Some(group) = self.group(group).or_else(|| self.group(DEFAULT_GROUP)) else {
            return false;
        };
        let hostname = normalize_hostname(qname);
        group.blocked.matches(&hostname, self.match_mode)
            && !group.allowed.matches(&hostname, self.match_mode)
    }

    /// Exact manual override for `qname` (trailing root dot optional).
    pub fn manual_entry(&self, qname: &str) -> Option<IpAddr> {
        self.manual_entries.get(&normalize_hostname(qname)).copied()
    }

    pub fn group(&self, name: &str) -> Option<&PolicyGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn groups(&self) -> &[PolicyGroup] {
        &self.groups
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn local_hostname(&self) -> &str {
        &self.local_hostname
    }

    pub fn match_mode(&self) -> MatchMode {
        self.match_mode
    }

    pub fn manual_entry_count(&self) -> usize {
        self.manual_entries.len()
    }
}

/// Lowercase and strip the trailing root dot.
pub fn normalize_hostname(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

fn parse_members(group: &str, value: &Value) -> Result<Vec<Member>, PolicyError> {
    let raw: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().ok_or_else(|| PolicyError::InvalidMembers {
                    group: group.to_string(),
                })
            })
            .collect::<Result<_, _>>()?,
        Value::Null => vec![],
        _ => {
            return Err(PolicyError::InvalidMembers {
                group: group.to_string(),
            });
        }
    };

    raw.into_iter()
        .filter(|m| !m.trim().is_empty())
        .map(|m| {
            Member::parse(m).ok_or_else(|| PolicyError::InvalidMember {
                group: group.to_string(),
                member: m.to_string(),
            })
        })
        .collect()
}

fn expand_suffixes(
    entries: Option<&Vec<String>>,
    lists: &mut CategoryLists,
) -> Result<SuffixSet, PolicyError> {
    let mut suffixes = Vec::new();
    for entry in entries.into_iter().flatten() {
        suffixes.extend(lists.expand(entry)?);
    }
    Ok(SuffixSet::new(suffixes))
}
