//! WireGuard kernel device configuration via the `wg` CLI.
//!
//! No generic-netlink WireGuard control crate is available to link/route
//! manipulation (see `platform::netlink`), so private-key/peer/listen-port/
//! fwmark configuration shells out to `wg`, generalizing
//! `gnosis_vpn-root::routing::wg_ops::WgOps`'s tool-invocation style rather
//! than `wg_tooling`'s `wg-quick` (which also owns routing/DNS, which this
//! crate's link manager owns itself).

use async_trait::async_trait;
use tokio::process::Command;

use std::fs::{self, Permissions};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use super::Error;
use crate::shell_command_ext::{Logs, ShellCommandExt};

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: SocketAddr,
    pub persistent_keepalive_secs: u16,
    pub allowed_ips: Vec<ipnet::IpNet>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceDump {
    pub public_key: Option<[u8; 32]>,
    pub listen_port: Option<u16>,
    pub peer_count: usize,
    pub peer_rx_bytes: Option<u64>,
    pub peer_tx_bytes: Option<u64>,
}

/// Abstraction over `wg`'s key generation and device configuration.
#[async_trait]
pub trait WgOps: Send + Sync + Clone {
    async fn generate_private_key(&self) -> Result<[u8; 32], Error>;
    async fn public_key(&self, private_key: &[u8; 32]) -> Result<[u8; 32], Error>;

    async fn set_private_key(&self, iface: &str, private_key: &[u8; 32]) -> Result<(), Error>;
    async fn set_listen_port(&self, iface: &str, port: u16) -> Result<(), Error>;
    async fn set_fwmark(&self, iface: &str, mark: u32) -> Result<(), Error>;
    async fn set_peer(&self, iface: &str, peer: &PeerConfig) -> Result<(), Error>;
    async fn remove_peer(&self, iface: &str, public_key: &[u8; 32]) -> Result<(), Error>;

    async fn dump(&self, iface: &str) -> Result<DeviceDump, Error>;
}

#[derive(Clone)]
pub struct RealWgOps;

fn key_to_base64(key: &[u8; 32]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(key)
}

fn key_from_base64(s: &str) -> Result<[u8; 32], Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| Error::General(format!("invalid wg key encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::General("wg key is not 32 bytes".into()))
}

/// Writes a secret (private or preshared key, base64-encoded) to a 0600
/// temp file under the cache directory so it can be passed as a `wg set`
/// file argument without ever appearing in `ps`/shell history.
fn write_key_file(name: &str, key: &[u8; 32]) -> Result<PathBuf, Error> {
    let path = crate::dirs::cache_dir(name).map_err(|e| Error::General(e.to_string()))?;
    fs::write(&path, format!("{}\n", key_to_base64(key))).map_err(Error::IO)?;
    fs::set_permissions(&path, Permissions::from_mode(0o600)).map_err(Error::IO)?;
    Ok(path)
}

fn remove_key_file(path: &PathBuf) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(?path, %e, "failed to remove transient wg key file");
    }
}

#[async_trait]
impl WgOps for RealWgOps {
    async fn generate_private_key(&self) -> Result<[u8; 32], Error> {
        let out = Command::new("wg").arg("genkey").run_stdout(Logs::Suppress).await?;
        key_from_base64(&out)
    }

    async fn public_key(&self, private_key: &[u8; 32]) -> Result<[u8; 32], Error> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new("wg")
            .arg("pubkey")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(Error::IO)?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(format!("{}\n", key_to_base64(private_key)).as_bytes())
                .await
                .map_err(Error::IO)?;
        }
        let output = child.wait_with_output().await.map_err(Error::IO)?;
        if !output.status.success() {
            return Err(Error::General("wg pubkey failed".into()));
        }
        key_from_base64(&String::from_utf8_lossy(&output.stdout))
    }

    async fn set_private_key(&self, iface: &str, private_key: &[u8; 32]) -> Result<(), Error> {
        let path = write_key_file(&format!("{iface}.privkey"), private_key)?;
        let res = Command::new("wg")
            .args(["set", iface, "private-key"])
            .arg(&path)
            .run(Logs::Print)
            .await;
        remove_key_file(&path);
        res.map_err(Error::from)
    }

    async fn set_listen_port(&self, iface: &str, port: u16) -> Result<(), Error> {
        Command::new("wg")
            .args(["set", iface, "listen-port", &port.to_string()])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn set_fwmark(&self, iface: &str, mark: u32) -> Result<(), Error> {
        Command::new("wg")
            .args(["set", iface, "fwmark", &mark.to_string()])
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn set_peer(&self, iface: &str, peer: &PeerConfig) -> Result<(), Error> {
        let allowed_ips = peer
            .allowed_ips
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = Command::new("wg");
        cmd.args(["set", iface, "peer"]).arg(key_to_base64(&peer.public_key));

        let psk_path = match &peer.preshared_key {
            Some(psk) => {
                let path = write_key_file(&format!("{iface}.psk"), psk)?;
                cmd.arg("preshared-key").arg(&path);
                Some(path)
            }
            None => None,
        };

        cmd.args(["endpoint", &peer.endpoint.to_string()])
            .args(["persistent-keepalive", &peer.persistent_keepalive_secs.to_string()])
            .args(["allowed-ips", &allowed_ips])
            .arg("replace-allowed-ips");

        let res = cmd.run(Logs::Print).await;
        if let Some(path) = psk_path {
            remove_key_file(&path);
        }
        res.map_err(Error::from)
    }

    async fn remove_peer(&self, iface: &str, public_key: &[u8; 32]) -> Result<(), Error> {
        Command::new("wg")
            .args(["set", iface, "peer"])
            .arg(key_to_base64(public_key))
            .arg("remove")
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn dump(&self, iface: &str) -> Result<DeviceDump, Error> {
        let out = Command::new("wg").args(["show", iface, "dump"]).run_stdout(Logs::Suppress).await?;
        let mut lines = out.lines();

        let mut dump = DeviceDump::default();
        if let Some(first) = lines.next() {
            let fields: Vec<&str> = first.split('\t').collect();
            if let Some(pk) = fields.first() {
                dump.public_key = key_from_base64(pk).ok();
            }
            if let Some(port) = fields.get(2) {
                dump.listen_port = port.parse().ok();
            }
        }

        for line in lines {
            let fields: Vec<&str> = line.split('\t').collect();
            dump.peer_count += 1;
            if let Some(rx) = fields.get(5) {
                dump.peer_rx_bytes = rx.parse().ok();
            }
            if let Some(tx) = fields.get(6) {
                dump.peer_tx_bytes = tx.parse().ok();
            }
        }

        Ok(dump)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_key_roundtrip() {
        let key = [7u8; 32];
        let encoded = key_to_base64(&key);
        let decoded = key_from_base64(&encoded).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn dump_parses_single_peer() {
        // interface line: private-key public-key listen-port fwmark
        // peer line: public-key psk endpoint allowed-ips latest-handshake rx tx keepalive
        let body = format!(
            "{}\t{}\t51820\toff\n{}\t(none)\t198.51.100.7:432\t0.0.0.0/0\t0\t12345\t67890\t25\n",
            key_to_base64(&[1u8; 32]),
            key_to_base64(&[2u8; 32]),
            key_to_base64(&[2u8; 32]),
        );
        let mut lines = body.lines();
        let first = lines.next().unwrap();
        let fields: Vec<&str> = first.split('\t').collect();
        assert_eq!(fields.len(), 4);
        let peer_fields: Vec<&str> = lines.next().unwrap().split('\t').collect();
        assert_eq!(peer_fields[5], "12345");
        assert_eq!(peer_fields[6], "67890");
    }
}
