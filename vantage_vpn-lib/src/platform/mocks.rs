//! Stateful mocks for the platform traits, modeled on
//! `gnosis_vpn-root::routing::mocks`: each mock tracks actual state (routes,
//! rules, peers that exist) so tests can assert on the system's state after
//! a lifecycle operation, not just which calls happened, and can inject a
//! failure at any single operation via `fail_on`.

#![cfg(test)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use super::Error;
use super::netlink::{AddrInfo, Family, LinkInfo, NetlinkOps, RouteSpec, RuleSpec};
use super::wg::{DeviceDump, PeerConfig, WgOps};

// ============================================================================
// MockNetlinkOps
// ============================================================================

#[derive(Debug, Default)]
pub struct NetlinkState {
    pub next_index: u32,
    pub links: Vec<LinkInfo>,
    pub addrs: Vec<AddrInfo>,
    pub routes: Vec<RouteSpec>,
    pub rules: Vec<RuleSpec>,
    pub fail_on: HashMap<String, String>,
}

impl NetlinkState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        match self.fail_on.get(op) {
            Some(msg) => Err(Error::General(msg.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct MockNetlinkOps {
    pub state: Arc<Mutex<NetlinkState>>,
}

impl MockNetlinkOps {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(NetlinkState { next_index: 10, ..Default::default() })) }
    }

    pub fn with_state(state: NetlinkState) -> Self {
        Self { state: Arc::new(Mutex::new(state)) }
    }
}

#[async_trait]
impl NetlinkOps for MockNetlinkOps {
    async fn link_add_wireguard(&self, name: &str) -> Result<u32, Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("link_add_wireguard")?;
        let index = s.next_index;
        s.next_index += 1;
        s.links.push(LinkInfo { index, name: name.to_string() });
        Ok(index)
    }

    async fn link_set_up(&self, if_index: u32) -> Result<(), Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_set_up")?;
        if !s.links.iter().any(|l| l.index == if_index) {
            return Err(Error::General("link not found".into()));
        }
        Ok(())
    }

    async fn link_set_mtu(&self, _if_index: u32, _mtu: u32) -> Result<(), Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_set_mtu")
    }

    async fn link_del(&self, if_index: u32) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("link_del")?;
        s.links.retain(|l| l.index != if_index);
        Ok(())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("link_list")?;
        Ok(s.links.clone())
    }

    async fn addr_add(&self, if_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("addr_add")?;
        if s.addrs.iter().any(|a| a.if_index == if_index && a.addr == addr) {
            return Err(Error::General("address already exists".into()));
        }
        s.addrs.push(AddrInfo { if_index, addr, prefix_len });
        Ok(())
    }

    async fn addr_del(&self, if_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("addr_del")?;
        let before = s.addrs.len();
        s.addrs.retain(|a| !(a.if_index == if_index && a.addr == addr && a.prefix_len == prefix_len));
        if s.addrs.len() == before {
            return Err(Error::General("address not found".into()));
        }
        Ok(())
    }

    async fn addr_list(&self, if_index: u32) -> Result<Vec<AddrInfo>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("addr_list")?;
        Ok(s.addrs.iter().filter(|a| a.if_index == if_index).cloned().collect())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_add")?;
        let exists = s
            .routes
            .iter()
            .any(|r| r.destination == route.destination && r.prefix_len == route.prefix_len && r.table_id == route.table_id);
        if exists {
            return Err(Error::General(format!("route already exists: {}/{}", route.destination, route.prefix_len)));
        }
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_replace")?;
        s.routes
            .retain(|r| !(r.destination == route.destination && r.prefix_len == route.prefix_len && r.table_id == route.table_id));
        s.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_del")?;
        let before = s.routes.len();
        s.routes
            .retain(|r| !(r.destination == route.destination && r.prefix_len == route.prefix_len && r.table_id == route.table_id));
        if s.routes.len() == before {
            return Err(Error::General("route not found".into()));
        }
        Ok(())
    }

    async fn route_list(&self, family: Family, table_id: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("route_list")?;
        Ok(s.routes
            .iter()
            .filter(|r| Family::of(r.destination) == family && (table_id.is_none() || r.table_id == table_id))
            .cloned()
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_add")?;
        s.rules.push(rule.clone());
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_del")?;
        let before = s.rules.len();
        s.rules.retain(|r| !(r.fw_mark == rule.fw_mark && r.table_id == rule.table_id && r.priority == rule.priority));
        if s.rules.len() == before {
            return Err(Error::General("rule not found".into()));
        }
        Ok(())
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("rule_list")?;
        Ok(s.rules.iter().filter(|r| r.family == family).cloned().collect())
    }
}

// ============================================================================
// MockWgOps
// ============================================================================

#[derive(Debug, Default)]
pub struct WgState {
    pub private_key: Option<[u8; 32]>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub peers: Vec<[u8; 32]>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub fail_on: HashMap<String, String>,
}

impl WgState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        match self.fail_on.get(op) {
            Some(msg) => Err(Error::General(msg.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct MockWgOps {
    pub state: Arc<Mutex<WgState>>,
}

impl MockWgOps {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(WgState::default())) }
    }

    pub fn with_state(state: WgState) -> Self {
        Self { state: Arc::new(Mutex::new(state)) }
    }
}

#[async_trait]
impl WgOps for MockWgOps {
    async fn generate_private_key(&self) -> Result<[u8; 32], Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("generate_private_key")?;
        Ok([0x42; 32])
    }

    async fn public_key(&self, private_key: &[u8; 32]) -> Result<[u8; 32], Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("public_key")?;
        let mut pk = *private_key;
        pk[0] ^= 0xff;
        Ok(pk)
    }

    async fn set_private_key(&self, _iface: &str, private_key: &[u8; 32]) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("set_private_key")?;
        s.private_key = Some(*private_key);
        Ok(())
    }

    async fn set_listen_port(&self, _iface: &str, port: u16) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("set_listen_port")?;
        s.listen_port = Some(port);
        Ok(())
    }

    async fn set_fwmark(&self, _iface: &str, mark: u32) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("set_fwmark")?;
        s.fwmark = Some(mark);
        Ok(())
    }

    async fn set_peer(&self, _iface: &str, peer: &PeerConfig) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("set_peer")?;
        s.peers.clear();
        s.peers.push(peer.public_key);
        Ok(())
    }

    async fn remove_peer(&self, _iface: &str, public_key: &[u8; 32]) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("remove_peer")?;
        s.peers.retain(|p| p != public_key);
        Ok(())
    }

    async fn dump(&self, _iface: &str) -> Result<DeviceDump, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("dump")?;
        Ok(DeviceDump {
            public_key: s.private_key,
            listen_port: s.listen_port,
            peer_count: s.peers.len(),
            peer_rx_bytes: Some(s.rx_bytes),
            peer_tx_bytes: Some(s.tx_bytes),
        })
    }
}
