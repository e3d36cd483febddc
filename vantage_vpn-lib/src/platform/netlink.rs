//! Dual-stack abstraction over rtnetlink operations for testability.
//!
//! Generalizes the IPv4-only `NetlinkOps` shape (route/rule/link/address,
//! one real implementation backed by `rtnetlink::Handle`, one stateful mock
//! for tests) to `IpAddr` so v4 and v6 routes/rules share one trait.

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteProtocol};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Route specification decoupled from the rtnetlink wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub destination: IpAddr,
    pub prefix_len: u8,
    pub gateway: Option<IpAddr>,
    pub if_index: u32,
    pub table_id: Option<u32>,
    pub throw: bool,
}

/// Policy routing rule specification.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
    pub family: Family,
    pub fw_mark: Option<u32>,
    pub invert: bool,
    pub table_id: u32,
    pub priority: u32,
}

/// Network link (interface) information.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
}

/// Address assigned to an interface.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub if_index: u32,
    pub addr: IpAddr,
    pub prefix_len: u8,
}

/// Abstraction over netlink route/rule/link/address operations.
///
/// Implementors must be cheaply cloneable (e.g. via `Arc` or because the
/// underlying handle is already reference-counted).
#[async_trait]
pub trait NetlinkOps: Send + Sync + Clone {
    async fn link_add_wireguard(&self, name: &str) -> Result<u32, Error>;
    async fn link_set_up(&self, if_index: u32) -> Result<(), Error>;
    async fn link_set_mtu(&self, if_index: u32, mtu: u32) -> Result<(), Error>;
    async fn link_del(&self, if_index: u32) -> Result<(), Error>;
    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error>;

    async fn addr_add(&self, if_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), Error>;
    async fn addr_del(&self, if_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), Error>;
    async fn addr_list(&self, if_index: u32) -> Result<Vec<AddrInfo>, Error>;

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_replace(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_list(&self, family: Family, table_id: Option<u32>) -> Result<Vec<RouteSpec>, Error>;

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error>;
    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error>;
}

/// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
}

impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &rtnetlink::Handle {
        &self.handle
    }

    fn build_route_message_v4(spec: &RouteSpec) -> rtnetlink::packet_route::route::RouteMessage {
        let destination = match spec.destination {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let mut builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(destination, spec.prefix_len)
            .output_interface(spec.if_index)
            .protocol(RouteProtocol::Boot);
        if let Some(IpAddr::V4(gw)) = spec.gateway {
            builder = builder.gateway(gw);
        }
        if let Some(id) = spec.table_id {
            builder = builder.table_id(id);
        }
        if spec.throw {
            builder = builder.kind(rtnetlink::packet_route::route::RouteType::Throw);
        }
        builder.build()
    }

    fn build_route_message_v6(spec: &RouteSpec) -> rtnetlink::packet_route::route::RouteMessage {
        let destination = match spec.destination {
            IpAddr::V6(ip) => ip,
            IpAddr::V4(_) => Ipv6Addr::UNSPECIFIED,
        };
        let mut builder = rtnetlink::RouteMessageBuilder::<Ipv6Addr>::default()
            .destination_prefix(destination, spec.prefix_len)
            .output_interface(spec.if_index)
            .protocol(RouteProtocol::Boot);
        if let Some(IpAddr::V6(gw)) = spec.gateway {
            builder = builder.gateway(gw);
        }
        if let Some(id) = spec.table_id {
            builder = builder.table_id(id);
        }
        if spec.throw {
            builder = builder.kind(rtnetlink::packet_route::route::RouteType::Throw);
        }
        builder.build()
    }

    fn route_message_to_spec(msg: &rtnetlink::packet_route::route::RouteMessage) -> Option<RouteSpec> {
        let if_index = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        });

        let destination = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Destination(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        })?;

        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(IpAddr::V4(*ip)),
            RouteAttribute::Gateway(RouteAddress::Inet6(ip)) => Some(IpAddr::V6(*ip)),
            _ => None,
        });

        let table_id = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Table(id) => Some(*id),
            _ => None,
        });

        Some(RouteSpec {
            destination,
            prefix_len: msg.header.destination_prefix_length,
            gateway,
            if_index: if_index.unwrap_or_default(),
            table_id,
            throw: msg.header.kind == rtnetlink::packet_route::route::RouteType::Throw,
        })
    }
}

#[async_trait]
impl NetlinkOps for RealNetlinkOps {
    async fn link_add_wireguard(&self, name: &str) -> Result<u32, Error> {
        self.handle
            .link()
            .add(rtnetlink::LinkWireguard::new(name).build())
            .execute()
            .await?;
        let mut links = self.handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await?
            .ok_or_else(|| Error::General(format!("link {name} not found after creation")))?;
        Ok(link.header.index)
    }

    async fn link_set_up(&self, if_index: u32) -> Result<(), Error> {
        self.handle.link().set(if_index).up().execute().await?;
        Ok(())
    }

    async fn link_set_mtu(&self, if_index: u32, mtu: u32) -> Result<(), Error> {
        self.handle.link().set(if_index).mtu(mtu).execute().await?;
        Ok(())
    }

    async fn link_del(&self, if_index: u32) -> Result<(), Error> {
        self.handle.link().del(if_index).execute().await?;
        Ok(())
    }

    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;
        Ok(links
            .iter()
            .filter_map(|link| {
                let name = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                })?;
                Some(LinkInfo { index: link.header.index, name })
            })
            .collect())
    }

    async fn addr_add(&self, if_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        self.handle
            .address()
            .add(if_index, addr, prefix_len)
            .execute()
            .await?;
        Ok(())
    }

    async fn addr_del(&self, if_index: u32, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        let addrs: Vec<_> = self.handle.address().get().set_link_index_filter(if_index).execute().try_collect().await?;
        for msg in addrs {
            let matches = msg.attributes.iter().any(|a| matches!(a, AddressAttribute::Address(a) if *a == addr))
                && msg.header.prefix_len == prefix_len;
            if matches {
                self.handle.address().del(msg).execute().await?;
                return Ok(());
            }
        }
        Err(Error::General(format!("address not found: {addr}/{prefix_len}")))
    }

    async fn addr_list(&self, if_index: u32) -> Result<Vec<AddrInfo>, Error> {
        let addrs: Vec<_> = self
            .handle
            .address()
            .get()
            .set_link_index_filter(if_index)
            .execute()
            .try_collect()
            .await?;

        Ok(addrs
            .iter()
            .filter_map(|addr| {
                let ip = addr.attributes.iter().find_map(|a| match a {
                    AddressAttribute::Address(ip) => Some(*ip),
                    _ => None,
                })?;
                Some(AddrInfo {
                    if_index: addr.header.index,
                    addr: ip,
                    prefix_len: addr.header.prefix_len,
                })
            })
            .collect())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        match Family::of(route.destination) {
            Family::V4 => self.handle.route().add(Self::build_route_message_v4(route)).execute().await?,
            Family::V6 => self.handle.route().add(Self::build_route_message_v6(route)).execute().await?,
        };
        Ok(())
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<(), Error> {
        match Family::of(route.destination) {
            Family::V4 => {
                self.handle
                    .route()
                    .add(Self::build_route_message_v4(route))
                    .replace()
                    .execute()
                    .await?
            }
            Family::V6 => {
                self.handle
                    .route()
                    .add(Self::build_route_message_v6(route))
                    .replace()
                    .execute()
                    .await?
            }
        };
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        match Family::of(route.destination) {
            Family::V4 => self.handle.route().del(Self::build_route_message_v4(route)).execute().await?,
            Family::V6 => self.handle.route().del(Self::build_route_message_v6(route)).execute().await?,
        };
        Ok(())
    }

    async fn route_list(&self, family: Family, table_id: Option<u32>) -> Result<Vec<RouteSpec>, Error> {
        let routes: Vec<rtnetlink::packet_route::route::RouteMessage> = match family {
            Family::V4 => {
                let mut builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default();
                if let Some(id) = table_id {
                    builder = builder.table_id(id);
                }
                self.handle.route().get(builder.build()).execute().try_collect().await?
            }
            Family::V6 => {
                let mut builder = rtnetlink::RouteMessageBuilder::<Ipv6Addr>::default();
                if let Some(id) = table_id {
                    builder = builder.table_id(id);
                }
                self.handle.route().get(builder.build()).execute().try_collect().await?
            }
        };

        Ok(routes.iter().filter_map(Self::route_message_to_spec).collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let add = self.handle.rule().add();
        match rule.family {
            Family::V4 => {
                let mut add = add.v4().priority(rule.priority).table_id(rule.table_id).action(RuleAction::ToTable);
                if let Some(mark) = rule.fw_mark {
                    add = add.fw_mark(mark);
                }
                add.execute().await?
            }
            Family::V6 => {
                let mut add = add.v6().priority(rule.priority).table_id(rule.table_id).action(RuleAction::ToTable);
                if let Some(mark) = rule.fw_mark {
                    add = add.fw_mark(mark);
                }
                add.execute().await?
            }
        };
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let version = match rule.family {
            Family::V4 => rtnetlink::IpVersion::V4,
            Family::V6 => rtnetlink::IpVersion::V6,
        };
        let rules: Vec<_> = self.handle.rule().get(version).execute().try_collect().await?;

        for msg in rules {
            let has_mark = match rule.fw_mark {
                Some(mark) => msg.attributes.iter().any(|a| matches!(a, RuleAttribute::FwMark(m) if *m == mark)),
                None => !msg.attributes.iter().any(|a| matches!(a, RuleAttribute::FwMark(_))),
            };
            let has_table = msg.attributes.iter().any(|a| matches!(a, RuleAttribute::Table(t) if *t == rule.table_id));
            let has_priority = msg.attributes.iter().any(|a| matches!(a, RuleAttribute::Priority(p) if *p == rule.priority));

            if has_mark && has_table && has_priority {
                self.handle.rule().del(msg).execute().await?;
                return Ok(());
            }
        }

        Err(Error::General(format!(
            "rule not found: fw_mark={:?} table={} priority={}",
            rule.fw_mark, rule.table_id, rule.priority
        )))
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>, Error> {
        let version = match family {
            Family::V4 => rtnetlink::IpVersion::V4,
            Family::V6 => rtnetlink::IpVersion::V6,
        };
        let rules: Vec<_> = self.handle.rule().get(version).execute().try_collect().await?;

        Ok(rules
            .iter()
            .filter_map(|msg| {
                let table_id = msg.attributes.iter().find_map(|a| match a {
                    RuleAttribute::Table(t) => Some(*t),
                    _ => None,
                })?;
                let fw_mark = msg.attributes.iter().find_map(|a| match a {
                    RuleAttribute::FwMark(m) => Some(*m),
                    _ => None,
                });
                let priority = msg
                    .attributes
                    .iter()
                    .find_map(|a| match a {
                        RuleAttribute::Priority(p) => Some(*p),
                        _ => None,
                    })
                    .unwrap_or(0);

                Some(RuleSpec { family, fw_mark, invert: false, table_id, priority })
            })
            .collect())
    }
}
