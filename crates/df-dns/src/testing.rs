//! Fixtures shared by the unit tests.

use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use df_common::EnvConfig;
use df_policy::{MatchMode, PolicyLoader};

use crate::packet::{self, DnsQuery};
use crate::records::RecordType;
use crate::upstream::{Upstream, UpstreamError};
use crate::{AccessLogger, FilterState};

/// Upstream that answers with a fixed address and counts its invocations.
#[derive(Default)]
pub struct StubUpstream {
    answer: Option<IpAddr>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubUpstream {
    pub fn answering(ip: IpAddr) -> Self {
        Self {
            answer: Some(ip),
            ..Self::default()
        }
    }

    /// Sleep before every answer
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Upstream for StubUpstream {
    async fn lookup(&self, _name: &str, qtype: RecordType) -> Result<IpAddr, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.answer {
            Some(ip @ IpAddr::V4(_)) if qtype == RecordType::A => Ok(ip),
            Some(ip @ IpAddr::V6(_)) if qtype == RecordType::AAAA => Ok(ip),
            Some(_) => Err(UpstreamError::NoAnswer(qtype, 0)),
            None => Err(UpstreamError::Timeout),
        }
    }
}

pub fn query(name: &str, qtype: RecordType) -> DnsQuery {
    packet::parse_query(&packet::build_query(0x1234, name, qtype)).unwrap()
}

pub fn write_policy(dir: &Path, policy: &serde_json::Value, manual: &serde_json::Value) {
    std::fs::write(dir.join("dns_config.json"), policy.to_string()).unwrap();
    std::fs::write(dir.join("manual_entry.json"), manual.to_string()).unwrap();
}

pub fn loader(dir: &Path) -> PolicyLoader {
    PolicyLoader {
        policy_file: dir.join("dns_config.json"),
        manual_entries_file: dir.join("manual_entry.json"),
        lists_dir: dir.join("lists"),
        local_hostname: "fw.local".to_string(),
        match_mode: MatchMode::Raw,
    }
}

pub fn state_with<U: Upstream>(loader: &PolicyLoader, upstream: U) -> FilterState<U> {
    let (logger, _) = AccessLogger::channel();
    FilterState::new(loader.load().unwrap(), upstream, logger, &EnvConfig::default())
}
