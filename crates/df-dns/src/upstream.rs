use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::debug;

use crate::packet::{self, RCODE_NOERROR, RCODE_NXDOMAIN};
use crate::records::RecordType;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Upstream resolution timed out")]
    Timeout,
    #[error("Upstream returned no {0} record (rcode {1})")]
    NoAnswer(RecordType, u8),
    #[error("Upstream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed upstream response: {0}")]
    Malformed(String),
    #[error("No upstream servers configured")]
    NoServers,
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Single-question forward resolution (A/AAAA).
pub trait Upstream: Send + Sync + 'static {
    fn lookup(
        &self,
        name: &str,
        qtype: RecordType,
    ) -> impl Future<Output = Result<IpAddr, UpstreamError>> + Send;
}

/// Forwards to external recursive resolvers over UDP, trying each server in
/// turn under a per-attempt timeout and an overall deadline.
pub struct UpstreamForwarder {
    servers: Vec<SocketAddr>,
    attempt_timeout: Duration,
    deadline: Duration,
}

impl UpstreamForwarder {
    pub fn new(servers: &[String], attempt_timeout: Duration, deadline: Duration) -> Self {
        let servers: Vec<SocketAddr> = servers.iter().filter_map(|s| parse_server(s)).collect();

        Self {
            servers,
            attempt_timeout,
            deadline,
        }
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    async fn query_server(
        &self,
        server: SocketAddr,
        name: &str,
        qtype: RecordType,
    ) -> Result<IpAddr, UpstreamError> {
        // Random TXID for the upstream query (RFC 5452)
        let txid: u16 = rand::rng().random();
        let query = packet::build_query(txid, name, qtype);

        let bind_addr: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.send_to(&query, server).await?;

        let mut buf = vec![0u8; 4096];
        loop {
            let (len, src) = socket.recv_from(&mut buf).await?;

            // Validate source address matches the upstream server we queried
            if src.ip() != server.ip() {
                debug!("Ignoring response from unexpected source {} (expected {})", src, server);
                continue;
            }

            let response = packet::parse_response(&buf[..len])
                .map_err(|e| UpstreamError::Malformed(e.to_string()))?;

            // Validate TXID matches (RFC 5452 - cache poisoning prevention)
            if response.header.id != txid {
                debug!(
                    "TXID mismatch from {}: expected {:04x}, got {:04x}",
                    server, txid, response.header.id
                );
                continue;
            }
            if !response.header.is_response() {
                return Err(UpstreamError::Malformed("response missing QR flag".to_string()));
            }

            let rcode = response.header.rcode();
            // CNAME chains are followed by skipping to the first record of the asked type
            return response
                .answers
                .iter()
                .filter(|r| r.rtype == qtype)
                .find_map(|r| r.rdata.address())
                .ok_or(UpstreamError::NoAnswer(qtype, rcode));
        }
    }
}

impl Upstream for UpstreamForwarder {
    async fn lookup(&self, name: &str, qtype: RecordType) -> Result<IpAddr, UpstreamError> {
        if self.servers.is_empty() {
            return Err(UpstreamError::NoServers);
        }

        let deadline = Instant::now() + self.deadline;
        let mut last_err = UpstreamError::Timeout;

        for server in &self.servers {
            let attempt = timeout(self.attempt_timeout, self.query_server(*server, name, qtype));
            match timeout_at(deadline, attempt).await {
                Err(_) => {
                    debug!("Upstream deadline reached resolving {} {}", qtype, name);
                    return Err(UpstreamError::Timeout);
                }
                Ok(Err(_)) => {
                    debug!("Upstream {} timed out resolving {} {}", server, qtype, name);
                    last_err = UpstreamError::Timeout;
                }
                Ok(Ok(Ok(ip))) => return Ok(ip),
                // An authoritative "no such record" needs no second opinion
                Ok(Ok(Err(e @ UpstreamError::NoAnswer(_, RCODE_NOERROR | RCODE_NXDOMAIN)))) => {
                    return Err(e);
                }
                Ok(Ok(Err(e))) => {
                    debug!("Upstream {} failed resolving {} {}: {}", server, qtype, name, e);
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }
}

/// `ip`, `ip:port`, `[v6]:port` or bare `v6`; port 53 by default.
fn parse_server(s: &str) -> Option<SocketAddr> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    s.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse_query;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_server() {
        assert_eq!(parse_server("1.1.1.1"), Some("1.1.1.1:53".parse().unwrap()));
        assert_eq!(parse_server("127.0.0.1:5353"), Some("127.0.0.1:5353".parse().unwrap()));
        assert_eq!(parse_server("2606:4700::1111"), Some("[2606:4700::1111]:53".parse().unwrap()));
        assert_eq!(parse_server("[::1]:5353"), Some("[::1]:5353".parse().unwrap()));
        assert_eq!(parse_server("not-an-ip"), None);
    }

    /// Answers every query with a CNAME followed by an A record.
    async fn spawn_fake_resolver(answer: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else { return };
                let query = parse_query(&buf[..len]).unwrap();

                let mut reply = Vec::new();
                reply.extend_from_slice(&query.header.id.to_be_bytes());
                reply.extend_from_slice(&[0x81, 0x80, 0, 1, 0, 2, 0, 0, 0, 0]);
                reply.extend_from_slice(&query.raw_question_bytes);
                reply.extend_from_slice(&[0xC0, 0x0C, 0, 5, 0, 1, 0, 0, 0, 60]);
                let mut target = Vec::new();
                packet::encode_name("cdn.example.net", &mut target);
                reply.extend_from_slice(&(target.len() as u16).to_be_bytes());
                reply.extend_from_slice(&target);
                reply.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
                reply.extend_from_slice(&answer.octets());
                socket.send_to(&reply, src).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_lookup_skips_cname() {
        let server = spawn_fake_resolver(Ipv4Addr::new(5, 6, 7, 8)).await;
        let forwarder = UpstreamForwarder::new(
            &[server.to_string()],
            Duration::from_millis(500),
            Duration::from_secs(1),
        );

        let ip = forwarder.lookup("www.example.com.", RecordType::A).await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8)));
    }

    #[tokio::test]
    async fn test_lookup_wrong_type_is_no_answer() {
        let server = spawn_fake_resolver(Ipv4Addr::new(5, 6, 7, 8)).await;
        let forwarder = UpstreamForwarder::new(
            &[server.to_string()],
            Duration::from_millis(500),
            Duration::from_secs(1),
        );

        let err = forwarder.lookup("www.example.com.", RecordType::AAAA).await.unwrap_err();
        assert!(matches!(err, UpstreamError::NoAnswer(RecordType::AAAA, 0)));
    }

    #[tokio::test]
    async fn test_lookup_timeout() {
        // Bound but never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let forwarder = UpstreamForwarder::new(
            &[silent.local_addr().unwrap().to_string()],
            Duration::from_millis(50),
            Duration::from_millis(200),
        );

        let err = forwarder.lookup("example.com.", RecordType::A).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_no_servers() {
        let forwarder = UpstreamForwarder::new(&[], Duration::from_millis(50), Duration::from_millis(100));
        let err = forwarder.lookup("example.com.", RecordType::A).await.unwrap_err();
        assert!(matches!(err, UpstreamError::NoServers));
    }
}
