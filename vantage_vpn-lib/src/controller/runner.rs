//! Progress events for the Connect sequence.
//!
//! Grounded on `gnosis_vpn-lib::connection::up::runner::Runner`'s shape: a
//! sequential series of fallible steps, each announced over a channel before
//! it runs so a caller can render progress without polling controller state.

use std::fmt::{self, Display};

#[derive(Debug, Clone)]
pub enum Event {
    Progress(Progress),
    Setback(Setback),
}

#[derive(Debug, Clone)]
pub enum Progress {
    Resolve,
    ThrowServerRoute,
    RestConnect,
    LinkUp,
    ArmDpd,
}

#[derive(Debug, Clone)]
pub enum Setback {
    Resolve(String),
    RestConnect(String),
    LinkUp(String),
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Progress(p) => write!(f, "{p}"),
            Event::Setback(s) => write!(f, "{s}"),
        }
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Progress::Resolve => write!(f, "resolving server address"),
            Progress::ThrowServerRoute => write!(f, "adding throw route to server"),
            Progress::RestConnect => write!(f, "requesting tunnel parameters"),
            Progress::LinkUp => write!(f, "configuring wireguard interface"),
            Progress::ArmDpd => write!(f, "arming dead-peer detection"),
        }
    }
}

impl Display for Setback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setback::Resolve(reason) => write!(f, "resolve failed: {reason}"),
            Setback::RestConnect(reason) => write!(f, "rest connect failed: {reason}"),
            Setback::LinkUp(reason) => write!(f, "link up failed: {reason}"),
        }
    }
}
