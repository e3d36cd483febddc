//! Verb surface for the binary, grounded on `gnosis_vpn-ctl::cli`'s
//! `#[derive(Subcommand)]` shape. Each verb is a thin dispatch target over
//! `vantage_vpn_lib::controller::Controller`; `service`, `list`, and
//! `categories` are stubbed per spec §6 (the control-API surface and its
//! payload catalogs are out of scope).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use vantage_vpn_lib::config;

/// VantageVPN connection controller
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// General configuration file
    #[arg(short, long, env = config::ENV_VAR, default_value = config::DEFAULT_PATH)]
    pub config_path: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch an access token once and persist it, then exit.
    Token {},

    /// Init the routing/leak-protection layer and connect, holding until signaled.
    Connect {},

    /// Start the control-API server around a constructed controller.
    Service {},

    /// Fetch the provider's DoH stamp list and store it.
    UpdateDoh {},

    /// Resolve a hostname through the configured resolver and print the addresses.
    Resolve {
        /// Hostname to resolve.
        host: String,
    },

    /// Parse a single `sdns://` DoH stamp and print its decoded fields.
    Lookup {
        /// The stamp string.
        stamp: String,
    },

    /// List provider server locations.
    List {},

    /// List available content-filter categories.
    Categories {},

    /// Parse the configuration file and print it back out.
    Conf {},
}

pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resolve_with_host() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["vantage_vpn", "resolve", "vpn.example.net"])?;
        match cli.command {
            Command::Resolve { host } => assert_eq!(host, "vpn.example.net"),
            other => panic!("unexpected command: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn parses_connect_with_config_override() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["vantage_vpn", "--config-path", "/tmp/vantagevpn.yaml", "connect"])?;
        assert_eq!(cli.config_path, PathBuf::from("/tmp/vantagevpn.yaml"));
        assert!(matches!(cli.command, Command::Connect {}));
        Ok(())
    }
}
