//! Thin capability surface over the kernel: link/address/route/rule
//! manipulation, WireGuard device configuration, and `/etc/resolv.conf`
//! lifecycle management. The Link manager is the only consumer of this
//! module; the Controller never touches the kernel directly.

pub mod netlink;
pub mod resolv_conf;
pub mod wg;

#[cfg(test)]
pub mod mocks;

use thiserror::Error;

use crate::shell_command_ext;

#[derive(Debug, Error)]
pub enum Error {
    #[error("rtnetlink error: {0}")]
    Rtnetlink(#[from] rtnetlink::Error),
    #[error("shell command error: {0}")]
    ShellCommand(#[from] shell_command_ext::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("general error: {0}")]
    General(String),
}

/// Opens a shared rtnetlink connection, spawning the driving future on the
/// current runtime, and returns a handle new callers can clone cheaply.
pub fn connect() -> Result<rtnetlink::Handle, Error> {
    let (conn, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(conn);
    Ok(handle)
}
