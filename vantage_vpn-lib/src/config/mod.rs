//! Configuration loader.
//!
//! YAML primary with a JSON fallback when the document starts with `{`, and
//! `toml::Table`-style unknown-key detection ported from
//! `gnosis_vpn-lib::config::v4`'s `wrong_keys` (adapted to a `serde_yaml::Value`
//! document instead of a `toml::Table`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PATH: &str = "/etc/vantagevpn/config.yaml";
pub const ENV_VAR: &str = "VANTAGEVPN_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("YAML deserialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON deserialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPolicy {
    #[serde(default)]
    pub ads: bool,
    #[serde(default)]
    pub trackers: bool,
    #[serde(default)]
    pub malicious: bool,
    #[serde(default, rename = "PG")]
    pub pg: i32,
    #[serde(default)]
    pub safe_search: bool,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_api_version")]
    pub api_version: u8,
    pub domain: String,
    pub ca_bundle_path: PathBuf,
    #[serde(default)]
    pub access_token_path: Option<PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Only meaningful for the `token` command: prompt on a TTY when no
    /// credentials are configured (supplemental, from `original_source`).
    #[serde(default)]
    pub interactive_credentials: bool,
    #[serde(with = "humantime_serde", default = "default_rest_timeout")]
    pub rest_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_reconnect_wait")]
    pub reconnect_wait: Duration,
    #[serde(with = "humantime_serde", default = "default_access_token_update_delay")]
    pub access_token_update_delay: Duration,
    #[serde(default)]
    pub fw_mark: u32,
    #[serde(default = "default_iface_name")]
    pub iface_name: String,
    #[serde(default)]
    pub listen_port: Option<u16>,
    #[serde(default = "default_table_id")]
    pub table_id: u32,
    #[serde(default = "default_rule_priority")]
    pub rule_priority: u32,
    #[serde(default = "default_true")]
    pub ipv4_enabled: bool,
    #[serde(default = "default_true")]
    pub ipv6_enabled: bool,
    #[serde(with = "humantime_serde", default)]
    pub dpd_timeout: Duration,
    #[serde(default)]
    pub split_tunnel_cidrs: Vec<ipnet::IpNet>,
    #[serde(default = "default_resolv_conf_backup_path")]
    pub resolv_conf_backup_path: PathBuf,
    #[serde(default = "default_true")]
    pub leak_protection: bool,
    #[serde(default)]
    pub doh_stamps: Vec<String>,
    #[serde(default)]
    pub doh_update_url: Option<String>,
    /// Storage filename for fetched stamps, distinct from `doh_update_url`.
    #[serde(default = "default_doh_stamps_file")]
    pub doh_stamps_file: PathBuf,
    #[serde(default)]
    pub plain_dns_servers: Vec<std::net::SocketAddr>,
    #[serde(default)]
    pub use_doh: bool,
    #[serde(default)]
    pub port_forward: bool,
    #[serde(default)]
    pub filter: FilterPolicy,
}

fn default_port() -> u16 {
    443
}
fn default_api_version() -> u8 {
    1
}
fn default_rest_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_reconnect_wait() -> Duration {
    Duration::from_secs(10)
}
fn default_access_token_update_delay() -> Duration {
    Duration::from_secs(3600)
}
fn default_iface_name() -> String {
    "vantage0".to_string()
}
fn default_table_id() -> u32 {
    51820
}
fn default_rule_priority() -> u32 {
    51820
}
fn default_true() -> bool {
    true
}
fn default_resolv_conf_backup_path() -> PathBuf {
    PathBuf::from("/etc/resolv.conf.vantagevpn-backup")
}
fn default_doh_stamps_file() -> PathBuf {
    PathBuf::from("/var/lib/vantagevpn/doh-stamps")
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound { Error::NoFile } else { Error::IO(e) }
    })?;
    parse(&content)
}

fn parse(content: &str) -> Result<Config, Error> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(content)?;
        for key in wrong_keys_json(&value) {
            tracing::warn!(%key, "ignoring unsupported key in configuration file");
        }
        Ok(serde_json::from_value(value)?)
    } else {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;
        for key in wrong_keys_yaml(&value) {
            tracing::warn!(%key, "ignoring unsupported key in configuration file");
        }
        Ok(serde_yaml::from_value(value)?)
    }
}

fn known_top_level_keys() -> &'static [&'static str] {
    &[
        "host",
        "port",
        "api_version",
        "domain",
        "ca_bundle_path",
        "access_token_path",
        "username",
        "password",
        "interactive_credentials",
        "rest_timeout",
        "reconnect_wait",
        "access_token_update_delay",
        "fw_mark",
        "iface_name",
        "listen_port",
        "table_id",
        "rule_priority",
        "ipv4_enabled",
        "ipv6_enabled",
        "dpd_timeout",
        "split_tunnel_cidrs",
        "resolv_conf_backup_path",
        "leak_protection",
        "doh_stamps",
        "doh_update_url",
        "doh_stamps_file",
        "plain_dns_servers",
        "use_doh",
        "port_forward",
        "filter",
    ]
}

fn known_filter_keys() -> &'static [&'static str] {
    &["ads", "trackers", "malicious", "PG", "safe_search", "categories"]
}

fn wrong_keys_yaml(value: &serde_yaml::Value) -> Vec<String> {
    let mut wrong = Vec::new();
    let Some(table) = value.as_mapping() else { return wrong };
    for (k, v) in table.iter() {
        let Some(key) = k.as_str() else { continue };
        if !known_top_level_keys().contains(&key) {
            wrong.push(key.to_string());
            continue;
        }
        if key == "filter"
            && let Some(filter) = v.as_mapping()
        {
            for (fk, _fv) in filter.iter() {
                if let Some(fk) = fk.as_str()
                    && !known_filter_keys().contains(&fk)
                {
                    wrong.push(format!("filter.{fk}"));
                }
            }
        }
    }
    wrong
}

fn wrong_keys_json(value: &serde_json::Value) -> Vec<String> {
    let mut wrong = Vec::new();
    let Some(table) = value.as_object() else { return wrong };
    for (key, v) in table.iter() {
        if !known_top_level_keys().contains(&key.as_str()) {
            wrong.push(key.clone());
            continue;
        }
        if key == "filter"
            && let Some(filter) = v.as_object()
        {
            for fk in filter.keys() {
                if !known_filter_keys().contains(&fk.as_str()) {
                    wrong.push(format!("filter.{fk}"));
                }
            }
        }
    }
    wrong
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "host: vpn.example.net\ndomain: example.net\nca_bundle_path: /etc/vantagevpn/ca.pem\n"
    }

    #[test]
    fn parses_minimal_yaml_with_defaults() -> anyhow::Result<()> {
        let config = parse(minimal_yaml())?;
        assert_eq!(config.host, "vpn.example.net");
        assert_eq!(config.port, 443);
        assert!(config.ipv4_enabled);
        assert!(config.leak_protection);
        Ok(())
    }

    #[test]
    fn parses_minimal_json_via_brace_sniff() -> anyhow::Result<()> {
        let json = r#"{"host":"vpn.example.net","domain":"example.net","ca_bundle_path":"/etc/vantagevpn/ca.pem"}"#;
        let config = parse(json)?;
        assert_eq!(config.host, "vpn.example.net");
        Ok(())
    }

    #[test]
    fn flags_unknown_top_level_key() {
        let yaml = serde_yaml::from_str(minimal_yaml()).unwrap();
        let mut map = match yaml {
            serde_yaml::Value::Mapping(m) => m,
            _ => unreachable!(),
        };
        map.insert("bogus_key".into(), true.into());
        let wrong = wrong_keys_yaml(&serde_yaml::Value::Mapping(map));
        assert_eq!(wrong, vec!["bogus_key".to_string()]);
    }
}
