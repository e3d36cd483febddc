//! The Connection Controller: the state machine that binds the platform
//! adapter, resolver, REST client, and link manager together.
//!
//! Grounded on `connection.go`'s `Connection` struct (mutex-guarded
//! `initStack`/`connectStack`, `ScheduleConnect`/`Connect`/`Disconnect`/
//! `Shutdown`/`DPD`/`AccessTokenRefresh`/`Filter`), expressed with the
//! teacher's `tokio`/`CancellationToken` idioms in place of goroutines and
//! `time.AfterFunc`, and as a directly-callable async API on `Arc<Controller>`
//! rather than a message-passing actor, per the single-mutex design.

pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::link::{LinkConfig, LinkManager, RouteTag};
use crate::notify::Notifier;
use crate::platform::netlink::NetlinkOps;
use crate::platform::wg::WgOps;
use crate::resolver::Resolver;
use crate::rest;
use crate::state::{Code, Notification, State, StateEvent};
use crate::undo::{Stack, UndoAction};
use crate::{dns_stamp, link, platform};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Link(#[from] link::Error),
    #[error(transparent)]
    Platform(#[from] platform::Error),
    #[error(transparent)]
    Rest(#[from] rest::Error),
    #[error(transparent)]
    Resolver(#[from] crate::resolver::Error),
    #[error("no access token available")]
    NoAccessToken,
    #[error("multiple peers on a single wireguard device")]
    TooManyPeers,
    #[error("dpd timeout")]
    DpdTimeout,
    #[error("cancelled")]
    Cancelled,
}

/// Whether an error justifies scheduling a reconnect, per spec §7/§8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    Yes,
    No,
}

impl Error {
    pub fn classify(&self) -> Reconnect {
        match self {
            Error::Rest(rest::Error::ErrHttpStatusBad(_))
            | Error::Rest(rest::Error::ErrAppUpdateRequired)
            | Error::Rest(rest::Error::ErrBadPin)
            | Error::Rest(rest::Error::ErrMissingHost)
            | Error::Resolver(_)
            | Error::TooManyPeers
            | Error::Cancelled => Reconnect::No,
            _ => Reconnect::Yes,
        }
    }
}

struct Inner {
    state: State,
    init_stack: Stack,
    connect_stack: Stack,
    dpd_last_rx: u64,
}

pub struct Controller<N: NetlinkOps, W: WgOps> {
    inner: Mutex<Inner>,
    link: Arc<Mutex<LinkManager<N, W>>>,
    rest: rest::Client,
    resolver: Box<dyn Resolver>,
    config: Config,
    notify: Notifier,
    cancel: Mutex<Option<CancellationToken>>,
    reconnect_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    dpd_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    root_cancel: CancellationToken,
}

/// Builds the `LinkConfig` shared between a `Controller` and the
/// `ThrowRouteHandle` adapter its resolver is constructed with, so the two
/// halves agree on table id and interface before either exists.
pub fn link_config(config: &Config) -> LinkConfig {
    LinkConfig {
        iface_name: config.iface_name.clone(),
        table_id: config.table_id,
        rule_priority: config.rule_priority,
        fw_mark: config.fw_mark,
        listen_port: config.listen_port,
        ipv4_enabled: config.ipv4_enabled,
        ipv6_enabled: config.ipv6_enabled,
        resolv_conf_backup_path: Some(config.resolv_conf_backup_path.clone()),
        ..LinkConfig::default()
    }
}

/// Adapts a shared `LinkManager` to `resolver::ThrowRouteHandle`, so a
/// resolver built before the `Controller` exists can still route its own
/// queries around the policy-routing table once the tunnel is up.
pub struct LinkThrowRoute<N: NetlinkOps, W: WgOps> {
    link: Arc<Mutex<LinkManager<N, W>>>,
}

impl<N: NetlinkOps, W: WgOps> LinkThrowRoute<N, W> {
    pub fn new(link: Arc<Mutex<LinkManager<N, W>>>) -> Self {
        LinkThrowRoute { link }
    }
}

#[async_trait::async_trait]
impl<N: NetlinkOps + Send + Sync, W: WgOps + Send + Sync> crate::resolver::ThrowRouteHandle for LinkThrowRoute<N, W> {
    async fn add(&self, ip: std::net::IpAddr) -> Result<(), crate::resolver::Error> {
        let mut link = self.link.lock().await;
        link.throw_route_add(RouteTag::ThrowServer, link::ip2net(ip)).await.map_err(crate::resolver::Error::Link)
    }

    async fn del(&self, ip: std::net::IpAddr) -> Result<(), crate::resolver::Error> {
        let mut link = self.link.lock().await;
        link.throw_route_del(link::ip2net(ip)).await.map_err(crate::resolver::Error::Link)
    }
}

impl<N: NetlinkOps + Send + 'static, W: WgOps + Send + 'static> Controller<N, W> {
    /// Constructs a Controller around a `LinkManager` the caller already
    /// built and shared with the resolver's `ThrowRouteHandle` (see
    /// `link_config` and `LinkThrowRoute`).
    pub fn new(link: Arc<Mutex<LinkManager<N, W>>>, rest: rest::Client, resolver: Box<dyn Resolver>, config: Config) -> Arc<Self> {
        Arc::new(Controller {
            inner: Mutex::new(Inner {
                state: State::clean(),
                init_stack: Stack::new(),
                connect_stack: Stack::new(),
                dpd_last_rx: 0,
            }),
            link,
            rest,
            resolver,
            config,
            notify: Notifier::new(),
            cancel: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            dpd_task: Mutex::new(None),
            root_cancel: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self, subscriber: crate::notify::Subscriber) {
        self.notify.subscribe(subscriber);
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state.clone()
    }

    async fn transition_and_notify(&self, inner: &mut Inner, code: Code, notification: Option<Notification>) {
        inner.state.transition(code);
        let event = StateEvent::from_state(&inner.state, notification);
        self.notify.notify(&event);
    }

    // ------------------------------------------------------------------
    // Init / Shutdown
    // ------------------------------------------------------------------

    /// Opens the interface, installs the DHCP-bypass throw route, optionally
    /// the loopback kill-switch, and the RPDB rules. Split-tunnel and
    /// VPN-server throw routes are installed per-Connect, not here.
    /// Anything that fails triggers `Shutdown` of everything already done.
    pub async fn init(self: &Arc<Self>) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        if !self.rest.have_access_token() {
            return Err(Error::NoAccessToken);
        }

        if let Err(e) = self.do_init(&mut inner).await {
            drop(inner);
            self.shutdown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn do_init(&self, inner: &mut Inner) -> Result<(), Error> {
        let mut link = self.link.lock().await;

        link.open().await?;
        inner.init_stack.push(UndoAction::CloseInterface);

        let dhcp_bypass: ipnet::IpNet = "255.255.255.255/32".parse().expect("static cidr");
        link.throw_route_add(RouteTag::ThrowDhcpBypass, dhcp_bypass).await?;
        inner
            .init_stack
            .push(UndoAction::RemoveRoute { table: self.config.table_id, cidr: dhcp_bypass, tag: RouteTag::ThrowDhcpBypass });

        if self.config.leak_protection {
            link.loopback_routes_add().await?;
            inner.init_stack.push(UndoAction::RemoveRoute {
                table: self.config.table_id,
                cidr: "0.0.0.0/0".parse().unwrap(),
                tag: RouteTag::LoopbackDefault,
            });
        }

        link.rules_add().await?;
        inner
            .init_stack
            .push(UndoAction::DeleteRule { table: self.config.table_id, priority: self.config.rule_priority, family_v6: false });

        self.transition_and_notify(inner, Code::Routed, None).await;
        Ok(())
    }

    /// Unwinds `init_stack` in reverse. If called while Connected, the
    /// caller must `disconnect` first.
    pub async fn shutdown(self: &Arc<Self>) {
        self.disconnect().await;

        let mut inner = self.inner.lock().await;
        let mut link = self.link.lock().await;
        for action in inner.init_stack.drain() {
            self.run_undo(&mut link, action).await;
        }
        self.transition_and_notify(&mut inner, Code::Clean, None).await;
    }

    async fn run_undo(&self, link: &mut LinkManager<N, W>, action: UndoAction) {
        let result = match action {
            UndoAction::CloseInterface => link.close().await.map_err(Error::from),
            UndoAction::RemoveRoute { tag: RouteTag::LoopbackDefault, .. } => link.loopback_routes_del().await.map_err(Error::from),
            UndoAction::RemoveRoute { cidr, .. } => link.throw_route_del(cidr).await.map_err(Error::from),
            UndoAction::DeleteRule { .. } => link.rules_del().await.map_err(Error::from),
            UndoAction::LinkDown => {
                link.down().await;
                Ok(())
            }
            UndoAction::RemovePeer | UndoAction::RemoveAddress { .. } | UndoAction::RestoreResolvConf { .. } => Ok(()),
            UndoAction::StopDpdTimer => {
                if let Some(handle) = self.dpd_task.lock().await.take() {
                    handle.abort();
                }
                Ok(())
            }
            UndoAction::CancelReconnect => {
                if let Some(handle) = self.reconnect_task.lock().await.take() {
                    handle.abort();
                }
                Ok(())
            }
            UndoAction::PostDisconnect { session_token, .. } => self.rest.disconnect(session_token.as_bytes()).await.map_err(Error::from),
        };
        if let Err(e) = result {
            tracing::warn!(%e, "undo action failed, continuing unwind");
        }
    }

    // ------------------------------------------------------------------
    // Connect / Disconnect
    // ------------------------------------------------------------------

    pub async fn schedule_connect(self: &Arc<Self>, delay: Duration) {
        tracing::debug!(host = %self.config.host, ?delay, "scheduling connect");

        {
            let mut inner = self.inner.lock().await;
            inner.state.requested_host = Some(self.config.host.clone());
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = this.connect().await;
        });

        if let Some(old) = self.reconnect_task.lock().await.replace(handle) {
            old.abort();
        }
    }

    pub async fn connect(self: &Arc<Self>) -> Result<(), Error> {
        let token = self.root_cancel.child_token();
        *self.cancel.lock().await = Some(token.clone());

        {
            let mut inner = self.inner.lock().await;
            self.transition_and_notify(&mut inner, Code::Connecting, None).await;
        }

        let result = tokio::select! {
            result = self.do_connect() => result,
            _ = token.cancelled() => Err(Error::Cancelled),
        };

        match &result {
            Ok(()) => {}
            Err(Error::Cancelled) => {}
            Err(e) => {
                self.disconnect().await;
                if e.classify() == Reconnect::Yes {
                    self.schedule_connect(self.config.reconnect_wait).await;
                }
            }
        }
        result
    }

    async fn do_connect(self: &Arc<Self>) -> Result<(), Error> {
        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel::<runner::Event>(8);
        tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                tracing::debug!(%event, "connect progress");
            }
        });

        let mut inner = self.inner.lock().await;
        let mut link = self.link.lock().await;

        for cidr in &self.config.split_tunnel_cidrs {
            link.throw_route_add(RouteTag::ThrowSplitTunnel, *cidr).await?;
            inner
                .connect_stack
                .push(UndoAction::RemoveRoute { table: self.config.table_id, cidr: *cidr, tag: RouteTag::ThrowSplitTunnel });
        }

        drop(link);
        drop(inner);

        let _ = progress_tx.send(runner::Event::Progress(runner::Progress::Resolve)).await;
        let host_ips = match self.resolver.resolve(&self.config.host).await {
            Ok(ips) => ips,
            Err(e) => {
                let _ = progress_tx.send(runner::Event::Setback(runner::Setback::Resolve(e.to_string()))).await;
                return Err(e.into());
            }
        };
        let server_ip = match host_ips.first().copied() {
            Some(ip) => ip,
            None => {
                let e: Error = crate::resolver::Error::AllFailed.into();
                let _ = progress_tx.send(runner::Event::Setback(runner::Setback::Resolve(e.to_string()))).await;
                return Err(e);
            }
        };

        let mut inner = self.inner.lock().await;
        let mut link = self.link.lock().await;

        // Marked traffic already bypasses the policy-routing table, so no
        // throw route to the VPN server is needed.
        if self.config.fw_mark == 0 {
            let _ = progress_tx.send(runner::Event::Progress(runner::Progress::ThrowServerRoute)).await;
            let server_cidr = link::ip2net(server_ip);
            link.throw_route_add(RouteTag::ThrowServer, server_cidr).await?;
            inner
                .connect_stack
                .push(UndoAction::RemoveRoute { table: self.config.table_id, cidr: server_cidr, tag: RouteTag::ThrowServer });
        }

        let _ = progress_tx.send(runner::Event::Progress(runner::Progress::RestConnect)).await;
        let public_key = link.public_key().await?.unwrap_or([0u8; 32]);
        let response = match self.rest.connect(&public_key).await {
            Ok(r) => r,
            Err(e) => {
                let _ = progress_tx.send(runner::Event::Setback(runner::Setback::RestConnect(e.to_string()))).await;
                return Err(e.into());
            }
        };

        inner.connect_stack.push(UndoAction::PostDisconnect {
            host: self.config.host.clone(),
            session_token: String::from_utf8_lossy(&response.session_token).to_string(),
        });

        let tunnel = crate::state::TunnelParams {
            peer_public_key: response.public_key.clone().try_into().unwrap_or([0u8; 32]),
            preshared_key: response.preshared_key.clone().and_then(|k| k.try_into().ok()),
            endpoint: response.endpoint,
            persistent_keepalive_secs: response.persistent_keepalive.map(|d| d.as_secs() as u16).unwrap_or(0),
            allowed_ips: response.allowed_ips.iter().map(|ip| link::ip2net(*ip)).collect(),
            dns: response.dns.clone(),
            gateway: response.gateway.clone(),
            stale_access_token: response.stale_access_token,
            session_token: String::from_utf8_lossy(&response.session_token).to_string(),
        };

        let _ = progress_tx.send(runner::Event::Progress(runner::Progress::LinkUp)).await;
        if let Err(e) = link.up(&tunnel).await {
            let _ = progress_tx.send(runner::Event::Setback(runner::Setback::LinkUp(e.to_string()))).await;
            return Err(e.into());
        }
        inner.connect_stack.push(UndoAction::LinkDown);

        inner.state.tunnel = Some(tunnel.clone());
        self.transition_and_notify(&mut inner, Code::Connected, None).await;

        if self.config.dpd_timeout > Duration::ZERO {
            let _ = progress_tx.send(runner::Event::Progress(runner::Progress::ArmDpd)).await;
            inner.connect_stack.push(UndoAction::StopDpdTimer);
            inner.dpd_last_rx = 0;
            self.spawn_dpd();
        }

        drop(link);
        drop(inner);

        self.spawn_access_token_refresh(tunnel.stale_access_token);
        self.spawn_filter_apply();

        Ok(())
    }

    pub async fn disconnect(self: &Arc<Self>) {
        if let Some(handle) = self.reconnect_task.lock().await.take() {
            handle.abort();
        }
        if let Some(token) = self.cancel.lock().await.take() {
            token.cancel();
        }

        let mut inner = self.inner.lock().await;
        self.transition_and_notify(&mut inner, Code::Disconnecting, None).await;

        let mut link = self.link.lock().await;
        for action in inner.connect_stack.drain() {
            self.run_undo(&mut link, action).await;
        }
        inner.state.tunnel = None;
        inner.state.counters = Default::default();
        self.transition_and_notify(&mut inner, Code::Routed, None).await;
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    fn spawn_dpd(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.dpd_timeout);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = this.dpd_tick().await {
                    if matches!(e, Error::TooManyPeers) {
                        tracing::error!(%e, "unexpected peer count, tearing down");
                        this.shutdown().await;
                    } else {
                        tracing::warn!(%e, "dpd check failed, disconnecting");
                        this.disconnect().await;
                        if e.classify() == Reconnect::Yes {
                            this.schedule_connect(this.config.reconnect_wait).await;
                        }
                    }
                    return;
                }
            }
        });
        let this = self.clone();
        tokio::spawn(async move {
            *this.dpd_task.lock().await = Some(handle);
        });
    }

    async fn dpd_tick(self: &Arc<Self>) -> Result<(), Error> {
        let link = self.link.lock().await;
        let peer_count = link.peer_count().await?;
        if peer_count != 1 {
            return Err(Error::TooManyPeers);
        }
        let current_rx = link.get_rx().await?;
        drop(link);

        let mut inner = self.inner.lock().await;
        if current_rx == inner.dpd_last_rx {
            self.notify.notify(&StateEvent::from_state(&inner.state, Some(Notification::DpdTimeout)));
            return Err(Error::DpdTimeout);
        }
        inner.dpd_last_rx = current_rx;
        inner.state.counters.rx = current_rx;
        Ok(())
    }

    fn spawn_access_token_refresh(self: &Arc<Self>, stale: bool) {
        if !stale || self.config.access_token_path.is_none() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.config.access_token_update_delay).await;
            let (username, password) = (this.config.username.clone().unwrap_or_default(), this.config.password.clone().unwrap_or_default());
            match this.rest.get_access_token(&username, &password).await {
                Ok(_) => tracing::info!("access token updated"),
                Err(e) => tracing::warn!(%e, "access token update failed"),
            }
        });
    }

    fn spawn_filter_apply(self: &Arc<Self>) {
        let filter = &self.config.filter;
        if !filter.ads && !filter.trackers && !filter.malicious && !filter.safe_search && filter.pg == 0 && filter.categories.is_empty() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let request = rest::FilterRequest {
                ads: this.config.filter.ads,
                trackers: this.config.filter.trackers,
                malicious: this.config.filter.malicious,
                pg: this.config.filter.pg,
                safe_search: this.config.filter.safe_search,
                categories: this.config.filter.categories.clone(),
            };
            if let Err(e) = this.rest.apply_filter(&request).await {
                tracing::warn!(%e, "filter apply failed");
            }
        });
    }
}

/// Fetches and stores DoH stamps from the configured update URL, implementing
/// the `updateDoh` CLI verb (grounded on `resolvers/doh/updater.go`).
pub async fn update_doh_stamps(update_url: &str, stamps_file: &std::path::Path) -> Result<usize, Error> {
    let body = reqwest::get(update_url).await.map_err(|e| Error::Rest(rest::Error::Transport(e)))?;
    let text = body.text().await.map_err(|e| Error::Rest(rest::Error::Transport(e)))?;
    let stamps = dns_stamp::parse_file(&text);
    tokio::fs::write(stamps_file, &text).await.map_err(Error::from_io)?;
    Ok(stamps.len())
}

impl Error {
    fn from_io(e: std::io::Error) -> Self {
        Error::Platform(platform::Error::IO(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_rest_errors_do_not_reconnect() {
        let e = Error::Rest(rest::Error::ErrAppUpdateRequired);
        assert_eq!(e.classify(), Reconnect::No);
    }

    #[test]
    fn transport_like_errors_reconnect() {
        let e = Error::DpdTimeout;
        assert_eq!(e.classify(), Reconnect::Yes);
    }

    #[test]
    fn cancellation_never_reconnects() {
        assert_eq!(Error::Cancelled.classify(), Reconnect::No);
    }
}
