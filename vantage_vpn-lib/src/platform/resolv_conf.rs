//! `/etc/resolv.conf` read/replace/restore.
//!
//! Ownership is pinned to the Link's Up/Down lifecycle (§5): before Up the
//! caller captures the current bytes into memory (and, best-effort, a backup
//! path on disk); Down restores from the in-memory buffer. `None` if the
//! initial read failed — Down then skips restore, matching source behavior.

use std::path::Path;

use super::Error;

pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Reads the current contents, returning `None` (not an error) if the file
/// is missing or unreadable — callers treat this as "nothing to restore".
pub async fn capture(path: &Path) -> Option<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::warn!(?path, %e, "unable to read resolv.conf before replacing it");
            None
        }
    }
}

/// Best-effort copy of the captured buffer to a backup path.
pub async fn write_backup(backup_path: &Path, buffer: &[u8]) {
    if let Err(e) = tokio::fs::write(backup_path, buffer).await {
        tracing::warn!(?backup_path, %e, "failed to write resolv.conf backup");
    }
}

pub async fn remove_backup(backup_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(backup_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(?backup_path, %e, "failed to remove resolv.conf backup");
        }
    }
}

fn render(servers: &[std::net::IpAddr]) -> String {
    let mut content = String::from("timeout 1\n");
    for ip in servers {
        content.push_str("nameserver ");
        content.push_str(&ip.to_string());
        content.push('\n');
    }
    content
}

/// Overwrites `path` with a fresh resolv.conf naming `servers`. Tries an
/// atomic rename-into-place first (works on most filesystems); on
/// containerized filesystems where rename/truncate may fail (bind-mounted
/// `/etc/resolv.conf`), falls back to an in-place overwrite from offset
/// zero. If the in-place path succeeds we drop the backup expectation —
/// the caller already has the in-memory buffer for restore.
pub async fn replace(path: &Path, servers: &[std::net::IpAddr]) -> Result<(), Error> {
    let content = render(servers);

    let tmp_path = path.with_extension("vantagevpn.tmp");
    match tokio::fs::write(&tmp_path, &content).await {
        Ok(()) => match tokio::fs::rename(&tmp_path, path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(%e, "rename-into-place failed, falling back to in-place overwrite");
                let _ = tokio::fs::remove_file(&tmp_path).await;
                overwrite_in_place(path, &content).await
            }
        },
        Err(e) => {
            tracing::warn!(%e, "unable to write temp resolv.conf, falling back to in-place overwrite");
            overwrite_in_place(path, &content).await
        }
    }
}

async fn overwrite_in_place(path: &Path, content: &str) -> Result<(), Error> {
    tokio::fs::write(path, content).await.map_err(Error::IO)
}

/// Restores the file from a previously captured buffer.
pub async fn restore(path: &Path, buffer: &[u8]) -> Result<(), Error> {
    tokio::fs::write(path, buffer).await.map_err(Error::IO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn render_produces_timeout_then_nameservers() {
        let servers = vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))];
        let out = render(&servers);
        assert_eq!(out, "timeout 1\nnameserver 10.0.0.1\nnameserver 10.0.0.2\n");
    }

    #[tokio::test]
    async fn replace_then_restore_roundtrips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("resolv.conf");
        tokio::fs::write(&path, "nameserver 1.1.1.1\n").await?;

        let original = capture(&path).await.expect("capture should succeed");
        replace(&path, &[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]).await?;
        let replaced = tokio::fs::read_to_string(&path).await?;
        assert_eq!(replaced, "timeout 1\nnameserver 10.0.0.1\n");

        restore(&path, &original).await?;
        let restored = tokio::fs::read_to_string(&path).await?;
        assert_eq!(restored, "nameserver 1.1.1.1\n");
        Ok(())
    }
}
