//! Plain UDP/53 resolver.
//!
//! Grounded on `resolvers/plain/plain.go`: a random server from the
//! configured list is queried directly over UDP, optionally through a
//! `SO_MARK`-tagged socket and a throw route installed for the query's
//! duration, with a 5 second deadline.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;

use super::{Error, Resolver, ThrowRouteHandle};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Config {
    pub servers: Vec<SocketAddr>,
    pub fw_mark: u32,
}

pub struct PlainResolver {
    servers: Vec<SocketAddr>,
    fw_mark: u32,
    throw_route: Option<Arc<dyn ThrowRouteHandle>>,
}

impl PlainResolver {
    pub fn new(config: Config, throw_route: Option<Arc<dyn ThrowRouteHandle>>) -> Result<Self, Error> {
        if config.servers.is_empty() {
            return Err(Error::EmptyServerList);
        }
        Ok(PlainResolver { servers: config.servers, fw_mark: config.fw_mark, throw_route })
    }

    async fn query_server(&self, server: SocketAddr, name: &str, record_type: RecordType) -> Result<Option<IpAddr>, Error> {
        let fqdn = if name.ends_with('.') { name.to_string() } else { format!("{name}.") };

        let mut message = Message::new();
        message.set_id(rand::random());
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_ascii(&fqdn).map_err(hickory_proto::ProtoError::from)?, record_type));
        let wire = message.to_bytes()?;

        let bind_addr: SocketAddr = if server.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };
        let socket = UdpSocket::bind(bind_addr).await?;

        if self.fw_mark != 0 {
            set_socket_mark(&socket, self.fw_mark)?;
        }

        // Matches current (not historical) source behavior: the throw route
        // is only needed when the query isn't already mark-tagged off the
        // tunnel's policy-routing table.
        let throw_route = if self.fw_mark == 0 { self.throw_route.as_ref() } else { None };

        if let Some(handle) = throw_route {
            handle.add(server.ip()).await?;
        }

        let result = tokio::time::timeout(QUERY_TIMEOUT, async {
            socket.send_to(&wire, server).await?;
            let mut buf = [0u8; 4096];
            let (n, _) = socket.recv_from(&mut buf).await?;
            Ok::<_, std::io::Error>(buf[..n].to_vec())
        })
        .await;

        if let Some(handle) = throw_route {
            let _ = handle.del(server.ip()).await;
        }

        let bytes = result.map_err(|_| Error::Timeout)?.map_err(Error::IO)?;
        let response = Message::from_bytes(&bytes)?;
        if response.message_type() != MessageType::Response || response.response_code() != ResponseCode::NoError {
            return Ok(None);
        }

        let matches = |record: &Record| record.name() == &Name::from_ascii(&fqdn).unwrap();
        Ok(response.answers().iter().filter(|r| matches(r)).find_map(|r| match r.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(a) => Some(IpAddr::V6(a.0)),
            _ => None,
        }))
    }
}

#[cfg(target_os = "linux")]
fn set_socket_mark(socket: &UdpSocket, mark: u32) -> Result<(), Error> {
    use std::os::fd::AsRawFd;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::IO(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_socket_mark(_socket: &UdpSocket, _mark: u32) -> Result<(), Error> {
    Ok(())
}

#[async_trait]
impl Resolver for PlainResolver {
    async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>, Error> {
        let server = *self.servers.choose(&mut rand::thread_rng()).expect("non-empty server list");

        let mut ips = Vec::new();
        if let Some(ip) = self.query_server(server, name, RecordType::A).await? {
            ips.push(ip);
        }
        if let Some(ip) = self.query_server(server, name, RecordType::AAAA).await? {
            ips.push(ip);
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_server_list() {
        let result = PlainResolver::new(Config { servers: vec![], fw_mark: 0 }, None);
        assert!(matches!(result, Err(Error::EmptyServerList)));
    }
}
