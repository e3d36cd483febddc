//! The controller's persisted state record plus the transient notifications
//! broadcast to subscribers alongside it.

use serde::{Deserialize, Serialize};

use std::net::IpAddr;
use std::time::SystemTime;

/// Persisted connection state. Only the controller mutates this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Code {
    Clean,
    Routed,
    Connecting,
    Connected,
    Disconnecting,
}

/// Transient notifications broadcast to watchers without altering the
/// persisted [`Code`], except where the notification names a transition
/// (`Disconnecting` is both a transient notification and a `Code`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Notification {
    TokenUpdate,
    ConfigurationGet,
    ConfigurationSet,
    LogDump,
    DpdTimeout,
    DnsLookup,
}

/// Tunnel parameters installed on a successful connect, cleared on disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelParams {
    pub peer_public_key: [u8; 32],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: std::net::SocketAddr,
    pub persistent_keepalive_secs: u16,
    pub allowed_ips: Vec<ipnet::IpNet>,
    pub dns: Vec<IpAddr>,
    pub gateway: Vec<IpAddr>,
    pub stale_access_token: bool,
    pub session_token: String,
}

/// Byte counters refreshed from the kernel on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub rx: u64,
    pub tx: u64,
}

/// The full state record exposed by `Controller::state()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub code: Code,
    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelParams>,
    pub counters: Counters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_host: Option<String>,
}

impl State {
    pub fn clean() -> Self {
        State {
            code: Code::Clean,
            timestamp: SystemTime::now(),
            tunnel: None,
            counters: Counters::default(),
            requested_host: None,
        }
    }

    pub fn transition(&mut self, code: Code) {
        self.code = code;
        self.timestamp = SystemTime::now();
    }
}

/// Wire record emitted to state-notification subscribers (spec §6).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEvent {
    pub code: Code,
    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<std::net::SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_ips: Option<Vec<ipnet::IpNet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<Vec<IpAddr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Vec<IpAddr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl StateEvent {
    pub fn from_state(state: &State, notification: Option<Notification>) -> Self {
        let tunnel = state.tunnel.as_ref();
        StateEvent {
            code: state.code,
            timestamp: state.timestamp,
            notification,
            endpoint: tunnel.map(|t| t.endpoint),
            allowed_ips: tunnel.map(|t| t.allowed_ips.clone()),
            dns: tunnel.map(|t| t.dns.clone()),
            gateway: tunnel.map(|t| t.gateway.clone()),
            persistent_keepalive: tunnel.map(|t| t.persistent_keepalive_secs),
            session_token: tunnel.map(|t| t.session_token.clone()),
            rx: Some(state.counters.rx),
            tx: Some(state.counters.tx),
            host: state.requested_host.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_state_has_no_tunnel() {
        let state = State::clean();
        assert_eq!(state.code, Code::Clean);
        assert!(state.tunnel.is_none());
    }

    #[test]
    fn transition_updates_timestamp() {
        let mut state = State::clean();
        let before = state.timestamp;
        std::thread::sleep(std::time::Duration::from_millis(2));
        state.transition(Code::Routed);
        assert_eq!(state.code, Code::Routed);
        assert!(state.timestamp >= before);
    }
}
