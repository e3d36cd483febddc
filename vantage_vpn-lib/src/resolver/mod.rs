//! Pluggable resolver strategy: `DohResolver` and `PlainResolver`, selected
//! by a boolean in configuration (spec §9 "Polymorphic resolver").

pub mod doh;
pub mod plain;

use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty resolver server list")]
    EmptyServerList,
    #[error("all resolver endpoints failed")]
    AllFailed,
    #[error("verification of the resolved address failed")]
    VerificationFailed,
    #[error("resolution timed out")]
    Timeout,
    #[error("DNS stamp error: {0}")]
    Stamp(#[from] crate::dns_stamp::Error),
    #[error("DNS wire format error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("link error: {0}")]
    Link(#[from] crate::link::Error),
}

/// Adds/removes a throw route around a single resolution request so the
/// query isn't itself tunneled. Implemented by the Controller's Link.
#[async_trait]
pub trait ThrowRouteHandle: Send + Sync {
    async fn add(&self, ip: IpAddr) -> Result<(), Error>;
    async fn del(&self, ip: IpAddr) -> Result<(), Error>;
}

#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves `name` to both A and AAAA records where available.
    async fn resolve(&self, name: &str) -> Result<Vec<IpAddr>, Error>;
}
