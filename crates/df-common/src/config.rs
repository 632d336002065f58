use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Process configuration loaded from environment variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// JSON policy file (groups, ACLs, interfaces, enabled flag)
    pub policy_file: PathBuf,
    /// JSON manual entries file (domain -> address)
    pub manual_entries_file: PathBuf,
    /// Directory holding the category list files (`<category>.txt`)
    pub lists_dir: PathBuf,
    /// Append-only access log
    pub access_log_path: PathBuf,
    /// Port bound on every monitored interface
    pub listen_port: u16,
    /// Upstream resolvers, `ip` or `ip:port`
    pub upstream_servers: Vec<String>,
    pub upstream_attempt_timeout_ms: u64,
    pub upstream_deadline_ms: u64,
    pub cache_ttl_secs: u64,
    pub group_cache_ttl_secs: u64,
    pub cache_size: usize,
    /// Upper bound on concurrently running resolution tasks
    pub max_inflight: usize,
    /// Time given to in-flight queries when listeners are restarted
    pub grace_ms: u64,
    /// `raw` or `label`
    pub suffix_match: String,
    /// Name served for reverse lookups; system hostname when unset
    pub hostname: Option<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            policy_file: PathBuf::from("/usr/local/dns_filter/dns_config.json"),
            manual_entries_file: PathBuf::from("/usr/local/dns_filter/manual_entry.json"),
            lists_dir: PathBuf::from("/usr/local/dns_filter/lists"),
            access_log_path: PathBuf::from("/usr/local/dns_filter/log/log.txt"),
            listen_port: 53,
            upstream_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            upstream_attempt_timeout_ms: 1000,
            upstream_deadline_ms: 2000,
            cache_ttl_secs: 300,
            group_cache_ttl_secs: 300,
            cache_size: 300,
            max_inflight: 256,
            grace_ms: 1000,
            suffix_match: "raw".to_string(),
            hostname: None,
        }
    }
}

impl EnvConfig {
    /// Build the configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from `var`, which maps a variable name to its value
    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(servers) = read_resolv_conf(Path::new("/etc/resolv.conf")) {
            config.upstream_servers = servers;
        }

        if let Some(v) = var("DNSFILTER_POLICY_FILE") {
            config.policy_file = PathBuf::from(v);
        }
        if let Some(v) = var("DNSFILTER_MANUAL_ENTRIES") {
            config.manual_entries_file = PathBuf::from(v);
        }
        if let Some(v) = var("DNSFILTER_LISTS_DIR") {
            config.lists_dir = PathBuf::from(v);
        }
        if let Some(v) = var("DNSFILTER_ACCESS_LOG") {
            config.access_log_path = PathBuf::from(v);
        }
        if let Some(v) = var("DNSFILTER_LISTEN_PORT") {
            if let Ok(port) = v.parse() {
                config.listen_port = port;
            }
        }
        if let Some(v) = var("DNSFILTER_UPSTREAM") {
            let servers: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !servers.is_empty() {
                config.upstream_servers = servers;
            }
        }
        if let Some(v) = var("DNSFILTER_UPSTREAM_ATTEMPT_MS") {
            if let Ok(ms) = v.parse() {
                config.upstream_attempt_timeout_ms = ms;
            }
        }
        if let Some(v) = var("DNSFILTER_UPSTREAM_DEADLINE_MS") {
            if let Ok(ms) = v.parse() {
                config.upstream_deadline_ms = ms;
            }
        }
        if let Some(v) = var("DNSFILTER_CACHE_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                config.cache_ttl_secs = secs;
            }
        }
        if let Some(v) = var("DNSFILTER_GROUP_CACHE_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                config.group_cache_ttl_secs = secs;
            }
        }
        if let Some(v) = var("DNSFILTER_CACHE_SIZE") {
            if let Ok(size) = v.parse() {
                config.cache_size = size;
            }
        }
        if let Some(v) = var("DNSFILTER_MAX_INFLIGHT") {
            if let Ok(n) = v.parse::<usize>() {
                config.max_inflight = n.max(1);
            }
        }
        if let Some(v) = var("DNSFILTER_GRACE_MS") {
            if let Ok(ms) = v.parse() {
                config.grace_ms = ms;
            }
        }
        if let Some(v) = var("DNSFILTER_SUFFIX_MATCH") {
            config.suffix_match = v.trim().to_lowercase();
        }
        if let Some(v) = var("DNSFILTER_HOSTNAME") {
            if !v.trim().is_empty() {
                config.hostname = Some(v.trim().to_string());
            }
        }

        config
    }

    /// Environment first, then the `.env` file for variables it does not set
    pub fn load(env_file: Option<&Path>) -> Self {
        let path = match env_file {
            Some(path) => Some(path.to_path_buf()),
            None => [
                PathBuf::from("/usr/local/dns_filter/.env"),
                PathBuf::from(".env"),
            ]
            .into_iter()
            .find(|candidate| candidate.exists()),
        };
        let dotenv = path.map(|p| read_dotenv(&p)).unwrap_or_default();

        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| dotenv.get(key).cloned()))
    }
}

/// Nameservers listed in a resolv.conf file, `None` when there are none
fn read_resolv_conf(path: &Path) -> Option<Vec<String>> {
    let content = std::fs::read_to_string(path).ok()?;
    let servers = parse_resolv_conf(&content);
    if servers.is_empty() { None } else { Some(servers) }
}

fn parse_resolv_conf(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(addr)) => Some(addr.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Minimal `.env` reader (KEY=VALUE per line)
fn read_dotenv(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_dotenv(&content),
        Err(_) => HashMap::new(),
    }
}

fn parse_dotenv(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let value = value.trim().trim_matches('"').trim_matches('\'');
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}
