//! DNS-over-HTTPS resolver with an exponential fan-out tournament.
//!
//! Grounded on `resolvers/doh/doh.go`: queries are raced across batches of
//! growing size (1, 2, 6, 24, 120, ...) with a 5 second deadline per batch,
//! the first clean response wins, and -- only for names under
//! `.hideservers.net` -- a second tournament re-queries the dash-encoded
//! answer against the remaining servers to confirm at least one other
//! resolver agrees before the address is trusted.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use rand::seq::SliceRandom;

use super::{Error, Resolver, ThrowRouteHandle};
use crate::dns_stamp::{self, DohStamp};

const BATCH_DEADLINE: Duration = Duration::from_secs(5);
const VERIFY_SUFFIX: &str = ".hideservers.net.";

#[derive(Debug, Clone)]
enum ServerEntry {
    Stamp(DohStamp),
    Url(String),
}

impl ServerEntry {
    fn parse(raw: &str) -> Self {
        match dns_stamp::parse_doh(raw) {
            Ok(stamp) => ServerEntry::Stamp(stamp),
            Err(_) => ServerEntry::Url(raw.to_string()),
        }
    }

    /// The HTTPS URL to POST the DNS message to.
    fn url(&self) -> String {
        match self {
            ServerEntry::Stamp(s) => s.url(),
            ServerEntry::Url(u) => u.clone(),
        }
    }

    /// When set, the literal address the TLS connection should dial instead
    /// of resolving `url()`'s host through the system resolver.
    fn endpoint(&self) -> Option<&str> {
        match self {
            ServerEntry::Stamp(s) => Some(s.server_addr.as_str()),
            ServerEntry::Url(_) => None,
        }
    }
}

pub struct Config {
    /// Raw `sdns://` stamps or plain HTTPS URLs, in addition to anything
    /// loaded from `stamps_file`.
    pub servers: Vec<String>,
    pub stamps_file: Option<String>,
    pub fw_mark: u32,
}

pub struct DohResolver {
    servers: Vec<ServerEntry>,
    client: reqwest::Client,
    throw_route: Option<Arc<dyn ThrowRouteHandle>>,
}

impl DohResolver {
    pub fn new(config: Config, throw_route: Option<Arc<dyn ThrowRouteHandle>>) -> Result<Self, Error> {
        let mut servers: Vec<ServerEntry> = Vec::new();

        if let Some(path) = &config.stamps_file
            && let Ok(content) = std::fs::read_to_string(path)
        {
            servers.extend(dns_stamp::parse_file(&content).into_iter().map(ServerEntry::Stamp));
        }
        servers.extend(config.servers.iter().map(|s| ServerEntry::parse(s)));

        if servers.is_empty() {
            return Err(Error::EmptyServerList);
        }
        servers.shuffle(&mut rand::thread_rng());

        // Applying fw_mark to the underlying TCP socket requires a custom
        // low-level connector (reqwest has no public hook for SO_MARK);
        // tracked as a follow-up once hyper exposes one through reqwest.
        let _ = config.fw_mark;

        let client = reqwest::Client::builder()
            .http2_prior_knowledge()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        Ok(DohResolver { servers, client, throw_route })
    }

    async fn post_one(&self, server: &ServerEntry, query: &Message) -> Result<IpAddr, Error> {
        let body = query.to_bytes()?;

        let endpoint_ip: Option<IpAddr> = server.endpoint().and_then(|addr| {
            addr.rsplit_once(':').and_then(|(host, _)| host.parse().ok())
        });

        if let (Some(ip), Some(handle)) = (endpoint_ip, &self.throw_route) {
            handle.add(ip).await?;
        }

        let result = self
            .client
            .post(server.url())
            .header("content-type", "application/dns-message")
            .body(body)
            .send()
            .await;

        if let (Some(ip), Some(handle)) = (endpoint_ip, &self.throw_route) {
            let _ = handle.del(ip).await;
        }

        let response = result.map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!("http status {}", response.status())));
        }

        let bytes = response.bytes().await.map_err(|e| Error::Transport(e.to_string()))?;
        parse_answer(&bytes, query)
    }

    /// Runs the exponential-batch tournament over `dohServers`, returning the
    /// first address any single server answers cleanly, along with the index
    /// of the winning server within the slice passed in.
    async fn tournament(&self, servers: &[ServerEntry], query: &Message) -> Option<(IpAddr, usize)> {
        let mut remaining = servers;
        let mut parallelism: usize = 1;
        let mut i: usize = 1;

        while !remaining.is_empty() {
            parallelism = (parallelism * i).min(remaining.len());
            let batch = &remaining[..parallelism];

            let mut futs = FuturesUnordered::new();
            for (idx, server) in batch.iter().enumerate() {
                futs.push(async move { (idx, self.post_one(server, query).await) });
            }

            let won = tokio::time::timeout(BATCH_DEADLINE, async {
                while let Some((idx, res)) = futs.next().await {
                    if let Ok(ip) = res {
                        return Some((ip, idx));
                    }
                }
                None
            })
            .await
            .ok()
            .flatten();

            if let Some((ip, idx)) = won {
                let absolute = servers.len() - remaining.len() + idx;
                return Some((ip, absolute));
            }

            remaining = &remaining[parallelism..];
            i += 1;
        }
        None
    }

    async fn resolve_type(&self, name: &str, record_type: RecordType) -> Result<Option<IpAddr>, Error> {
        if self.servers.is_empty() {
            return Err(Error::EmptyServerList);
        }

        let fqdn = if name.ends_with('.') { name.to_string() } else { format!("{name}.") };
        let query = build_query(&fqdn, record_type)?;

        let Some((ip, winner_idx)) = self.tournament(&self.servers, &query).await else {
            return Ok(None);
        };

        if !fqdn.ends_with(VERIFY_SUFFIX) {
            return Ok(Some(ip));
        }

        let mut remaining: Vec<ServerEntry> = self.servers.clone();
        if remaining.len() > 1 {
            let last = remaining.len() - 1;
            remaining.swap(winner_idx, last);
            remaining.pop();
        }

        let verify_name = match record_type {
            RecordType::AAAA => format!("{}-v6.hideservers.net.", ip.to_string().replace(':', "-")),
            _ => format!("{}.hideservers.net.", ip.to_string().replace('.', "-")),
        };
        let verify_query = build_query(&verify_name, record_type)?;

        let mut verify_remaining: &[ServerEntry] = &remaining;
        let mut parallelism: usize = 1;
        let mut i: usize = 1;
        while !verify_remaining.is_empty() {
            parallelism = (parallelism * i).min(verify_remaining.len());
            let batch = &verify_remaining[..parallelism];

            let mut futs = FuturesUnordered::new();
            for server in batch {
                futs.push(self.post_one(server, &verify_query));
            }

            let matched = tokio::time::timeout(BATCH_DEADLINE, async {
                while let Some(res) = futs.next().await {
                    if let Ok(candidate) = res
                        && candidate == ip
                    {
                        return true;
                    }
                }
                false
            })
            .await
            .unwrap_or(false);

            if matched {
                return Ok(Some(ip));
            }
            verify_remaining = &verify_remaining[parallelism..];
            i += 1;
        }

        Err(Error::VerificationFailed)
    }
}

fn build_query(name: &str, record_type: RecordType) -> Result<Message, Error> {
    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_ascii(name).map_err(hickory_proto::ProtoError::from)?, record_type));
    Ok(message)
}

fn parse_answer(bytes: &[u8], query: &Message) -> Result<IpAddr, Error> {
    let response = Message::from_bytes(bytes)?;
    if response.message_type() != MessageType::Response || response.response_code() != ResponseCode::NoError {
        return Err(Error::Transport("non-success DNS response".into()));
    }
    let asked = query.queries().first().ok_or_else(|| Error::Transport("empty query".into()))?;

    let matches = |record: &Record| record.name() == asked.name();

    response
        .answers()
        .iter()
        .filter(|r| matches(r))
        .find_map(|r| match r.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(a) => Some(IpAddr::V6(a.0)),
            _ => None,
        })
        .ok_or_else(|| Error::Transport("no matching answer record".into()))
}

#[async_trait]
impl Resolver for DohResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>, Error> {
        let mut ips = Vec::new();
        if let Some(ip) = self.resolve_type(name, RecordType::A).await? {
            ips.push(ip);
        }
        if let Some(ip) = self.resolve_type(name, RecordType::AAAA).await? {
            ips.push(ip);
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_entry_falls_back_to_url_for_non_stamp_string() {
        let entry = ServerEntry::parse("https://dns.example.net/dns-query");
        assert_eq!(entry.url(), "https://dns.example.net/dns-query");
        assert!(entry.endpoint().is_none());
    }

    #[test]
    fn build_query_sets_recursion_desired() -> anyhow::Result<()> {
        let msg = build_query("example.com.", RecordType::A)?;
        assert!(msg.recursion_desired());
        assert_eq!(msg.queries().len(), 1);
        Ok(())
    }
}
