use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

use df_policy::{PolicySnapshot, normalize_hostname};

use crate::FilterState;
use crate::logging::LogStatus;
use crate::packet::{self, ANSWER_TTL, DnsQuery, RCODE_NOERROR, RCODE_NOTIMP, RCODE_NXDOMAIN};
use crate::records::{DnsRecord, RecordType};
use crate::upstream::Upstream;

const REVERSE_ZONES: [&str; 2] = [".in-addr.arpa.", ".ip6.arpa."];

/// What goes back on the wire for one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// NOERROR with a single answer record
    Answer(DnsRecord),
    /// NOERROR with an empty answer section
    Empty,
    /// Empty reply carrying this rcode
    Error(u8),
    /// Policy denial: no reply at all
    Blocked,
    /// Resolution failed: no reply at all
    Dropped,
}

/// Outcome of one resolution pass plus the access-log record it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: Outcome,
    pub status: Option<LogStatus>,
}

impl Resolution {
    fn logged(outcome: Outcome, status: LogStatus) -> Self {
        Self {
            outcome,
            status: Some(status),
        }
    }

    fn miss(outcome: Outcome) -> Self {
        Self::logged(outcome, LogStatus::Miss)
    }

    /// Reply datagram, `None` when the query must go unanswered
    pub fn reply(&self, query: &DnsQuery) -> Option<Vec<u8>> {
        match &self.outcome {
            Outcome::Answer(record) => Some(packet::build_reply(query, Some(record), RCODE_NOERROR)),
            Outcome::Empty => Some(packet::build_reply(query, None, RCODE_NOERROR)),
            Outcome::Error(rcode) => Some(packet::build_reply(query, None, *rcode)),
            Outcome::Blocked | Outcome::Dropped => None,
        }
    }
}

/// Decide and resolve one query against a single snapshot.
///
/// Only forward lookups (A/AAAA) go through classification and the policy
/// decision; a blocked one is dropped without a reply. Every other type gets
/// its fixed reply whatever the policy says.
pub async fn resolve<U: Upstream>(
    state: &FilterState<U>,
    snapshot: &PolicySnapshot,
    query: &DnsQuery,
    client: IpAddr,
) -> Resolution {
    let qname = &query.question.name;

    match query.question.qtype {
        qtype @ (RecordType::A | RecordType::AAAA) => {
            let group = state.classifier.classify(snapshot, client).await;
            if snapshot.is_blocked(&group, qname) {
                debug!("Blocked {} {} for {} (group {})", qtype, qname, client, group);
                return Resolution::logged(Outcome::Blocked, LogStatus::Denied);
            }
            if qtype == RecordType::A {
                resolve_a(state, snapshot, qname).await
            } else {
                resolve_aaaa(state, snapshot, qname).await
            }
        }
        RecordType::PTR => resolve_ptr(snapshot, qname),
        RecordType::MX
        | RecordType::TXT
        | RecordType::SRV
        | RecordType::SOA
        | RecordType::NS
        | RecordType::CNAME => Resolution::miss(Outcome::Error(RCODE_NXDOMAIN)),
        RecordType::ANY => Resolution::miss(Outcome::Error(RCODE_NOTIMP)),
        _ => Resolution::miss(Outcome::Empty),
    }
}

async fn resolve_a<U: Upstream>(
    state: &FilterState<U>,
    snapshot: &PolicySnapshot,
    qname: &str,
) -> Resolution {
    let key = normalize_hostname(qname);

    // 1. Manual entries
    match snapshot.manual_entry(&key) {
        Some(IpAddr::V4(ip)) => {
            debug!("Resolved {} via manual entry -> {}", qname, ip);
            return answer_a(qname, ip);
        }
        // Name exists only with an IPv6 address: NODATA
        Some(IpAddr::V6(_)) => return Resolution::miss(Outcome::Empty),
        None => {}
    }

    // 2. Cache
    if let Some(ip) = state.cache.a.get(&key).await {
        debug!("Cache hit for A {}", qname);
        return answer_a(qname, ip);
    }

    // 3. Upstream; failures are dropped without a reply or a log line
    let generation = state.cache.a.generation();
    match state.upstream.lookup(qname, RecordType::A).await {
        Ok(IpAddr::V4(ip)) => {
            state.cache.a.insert_at(generation, key, ip).await;
            answer_a(qname, ip)
        }
        Ok(other) => {
            warn!("Upstream answered A {} with {}", qname, other);
            Resolution { outcome: Outcome::Dropped, status: None }
        }
        Err(e) => {
            debug!("Dropping A {}: {}", qname, e);
            Resolution { outcome: Outcome::Dropped, status: None }
        }
    }
}

async fn resolve_aaaa<U: Upstream>(
    state: &FilterState<U>,
    snapshot: &PolicySnapshot,
    qname: &str,
) -> Resolution {
    let key = normalize_hostname(qname);

    // 1. Manual entries
    match snapshot.manual_entry(&key) {
        Some(IpAddr::V6(ip)) => {
            debug!("Resolved {} via manual entry -> {}", qname, ip);
            return answer_aaaa(qname, ip);
        }
        Some(IpAddr::V4(_)) => return Resolution::miss(Outcome::Empty),
        None => {}
    }

    // 2. Cache
    if let Some(ip) = state.cache.aaaa.get(&key).await {
        debug!("Cache hit for AAAA {}", qname);
        return answer_aaaa(qname, ip);
    }

    // 3. Upstream; failures become an explicit NXDOMAIN
    let generation = state.cache.aaaa.generation();
    match state.upstream.lookup(qname, RecordType::AAAA).await {
        Ok(IpAddr::V6(ip)) => {
            state.cache.aaaa.insert_at(generation, key, ip).await;
            answer_aaaa(qname, ip)
        }
        Ok(other) => {
            warn!("Upstream answered AAAA {} with {}", qname, other);
            Resolution::miss(Outcome::Error(RCODE_NXDOMAIN))
        }
        Err(e) => {
            debug!("NXDOMAIN for AAAA {}: {}", qname, e);
            Resolution::miss(Outcome::Error(RCODE_NXDOMAIN))
        }
    }
}

/// Reverse lookups in the reverse zones all name this host.
fn resolve_ptr(snapshot: &PolicySnapshot, qname: &str) -> Resolution {
    if REVERSE_ZONES.iter().any(|zone| qname.ends_with(zone)) {
        let record = DnsRecord::ptr(qname, snapshot.local_hostname(), ANSWER_TTL);
        return Resolution::miss(Outcome::Answer(record));
    }
    Resolution::logged(Outcome::Error(RCODE_NXDOMAIN), LogStatus::Denied)
}

fn answer_a(qname: &str, ip: Ipv4Addr) -> Resolution {
    Resolution::miss(Outcome::Answer(DnsRecord::a(qname, ip, ANSWER_TTL)))
}

fn answer_aaaa(qname: &str, ip: Ipv6Addr) -> Resolution {
    Resolution::miss(Outcome::Answer(DnsRecord::aaaa(qname, ip, ANSWER_TTL)))
}
