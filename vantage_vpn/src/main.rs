use std::io::IsTerminal;
use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;

use vantage_vpn_lib::controller::{self, Controller, LinkThrowRoute};
use vantage_vpn_lib::link::LinkManager;
use vantage_vpn_lib::platform::netlink::RealNetlinkOps;
use vantage_vpn_lib::platform::wg::RealWgOps;
use vantage_vpn_lib::resolver::{Resolver, doh, plain};
use vantage_vpn_lib::{config, dns_stamp, logging, platform, rest};

mod cli;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type VpnController = Controller<RealNetlinkOps, RealWgOps>;

#[tokio::main]
async fn main() {
    let (_reload_handle, _log_path) = logging::init();
    let cli = cli::parse();

    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: cli::Cli) -> exitcode::ExitCode {
    let cfg = match config::read(&cli.config_path).await {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(%e, path = %cli.config_path.display(), "failed to read configuration");
            return exitcode::CONFIG;
        }
    };

    match cli.command {
        cli::Command::Token {} => cmd_token(cfg).await,
        cli::Command::Connect {} => cmd_connect(cfg).await,
        cli::Command::Service {} => {
            tracing::error!("not implemented: control API surface is out of scope");
            exitcode::UNAVAILABLE
        }
        cli::Command::UpdateDoh {} => cmd_update_doh(cfg).await,
        cli::Command::Resolve { host } => cmd_resolve(cfg, &host).await,
        cli::Command::Lookup { stamp } => cmd_lookup(&stamp),
        cli::Command::List {} => {
            tracing::error!("not implemented: control API surface is out of scope");
            exitcode::UNAVAILABLE
        }
        cli::Command::Categories {} => {
            tracing::error!("not implemented: control API surface is out of scope");
            exitcode::UNAVAILABLE
        }
        cli::Command::Conf {} => cmd_conf(cfg),
    }
}

fn rest_config(cfg: &config::Config) -> Result<rest::Config, exitcode::ExitCode> {
    let ca_pem = std::fs::read(&cfg.ca_bundle_path).map_err(|e| {
        tracing::error!(%e, path = %cfg.ca_bundle_path.display(), "failed to read CA bundle");
        exitcode::NOINPUT
    })?;
    Ok(rest::Config {
        host: format!("{}:{}", cfg.host, cfg.port),
        domain: cfg.domain.clone(),
        ca_pem,
        access_token_path: cfg.access_token_path.clone(),
        timeout: cfg.rest_timeout,
        api_version: cfg.api_version,
    })
}

/// Prompts on a TTY for any credential missing from configuration, mirroring
/// `original_source/rest/interactive.go`'s `InteractiveCredentials`.
fn interactive_credentials(cfg: &config::Config) -> (String, String) {
    let mut username = cfg.username.clone().unwrap_or_default();
    let mut password = cfg.password.clone().unwrap_or_default();

    if !cfg.interactive_credentials || !std::io::stdin().is_terminal() {
        return (username, password);
    }

    if username.is_empty() {
        eprint!("Username: ");
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_ok() {
            username = line.trim().to_string();
        }
    }
    if password.is_empty()
        && let Ok(entered) = rpassword::prompt_password("Password: ")
    {
        password = entered;
    }
    (username, password)
}

async fn cmd_token(cfg: config::Config) -> exitcode::ExitCode {
    let rest_cfg = match rest_config(&cfg) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let client = match rest::Client::init(rest_cfg) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(%e, "failed to build REST client");
            return exitcode::CONFIG;
        }
    };

    let (username, password) = interactive_credentials(&cfg);
    match client.get_access_token(&username, &password).await {
        Ok(_) => {
            tracing::info!("access token stored");
            exitcode::OK
        }
        Err(e) => {
            tracing::error!(%e, "failed to fetch access token");
            exitcode::NOPERM
        }
    }
}

fn build_resolver(cfg: &config::Config, throw_route: Option<Arc<dyn vantage_vpn_lib::resolver::ThrowRouteHandle>>) -> Result<Box<dyn Resolver>, exitcode::ExitCode> {
    if cfg.use_doh {
        let doh_cfg = doh::Config {
            servers: cfg.doh_stamps.clone(),
            stamps_file: cfg.doh_stamps_file.to_str().map(str::to_string),
            fw_mark: cfg.fw_mark,
        };
        doh::DohResolver::new(doh_cfg, throw_route).map(|r| Box::new(r) as Box<dyn Resolver>).map_err(|e| {
            tracing::error!(%e, "failed to build doh resolver");
            exitcode::CONFIG
        })
    } else {
        let plain_cfg = plain::Config { servers: cfg.plain_dns_servers.clone(), fw_mark: cfg.fw_mark };
        plain::PlainResolver::new(plain_cfg, throw_route).map(|r| Box::new(r) as Box<dyn Resolver>).map_err(|e| {
            tracing::error!(%e, "failed to build plain resolver");
            exitcode::CONFIG
        })
    }
}

async fn build_controller(cfg: config::Config) -> Result<Arc<VpnController>, exitcode::ExitCode> {
    let rest_cfg = rest_config(&cfg)?;
    let rest_client = rest::Client::init(rest_cfg).map_err(|e| {
        tracing::error!(%e, "failed to build REST client");
        exitcode::CONFIG
    })?;

    let netlink_handle = platform::connect().map_err(|e| {
        tracing::error!(%e, "failed to open rtnetlink connection");
        exitcode::OSERR
    })?;
    let link_manager = LinkManager::new(RealNetlinkOps::new(netlink_handle), RealWgOps, controller::link_config(&cfg));
    let link = Arc::new(Mutex::new(link_manager));

    let throw_route: Arc<dyn vantage_vpn_lib::resolver::ThrowRouteHandle> = Arc::new(LinkThrowRoute::new(link.clone()));
    let resolver = build_resolver(&cfg, Some(throw_route))?;

    Ok(Controller::new(link, rest_client, resolver, cfg))
}

async fn cmd_connect(cfg: config::Config) -> exitcode::ExitCode {
    let controller = match build_controller(cfg).await {
        Ok(c) => c,
        Err(code) => return code,
    };

    if let Err(e) = controller.init().await {
        tracing::error!(%e, "init failed");
        return exitcode::OSERR;
    }
    controller.schedule_connect(std::time::Duration::ZERO).await;

    if let Err(code) = wait_for_signal().await {
        return code;
    }

    controller.disconnect().await;
    controller.shutdown().await;
    exitcode::OK
}

async fn wait_for_signal() -> Result<(), exitcode::ExitCode> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
        tracing::error!(%e, "failed to install SIGINT handler");
        exitcode::OSERR
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
        tracing::error!(%e, "failed to install SIGTERM handler");
        exitcode::OSERR
    })?;
    tokio::select! {
        _ = sigint.recv() => tracing::debug!("received SIGINT"),
        _ = sigterm.recv() => tracing::debug!("received SIGTERM"),
    }
    Ok(())
}

async fn cmd_update_doh(cfg: config::Config) -> exitcode::ExitCode {
    let Some(update_url) = &cfg.doh_update_url else {
        tracing::error!("no doh_update_url configured");
        return exitcode::CONFIG;
    };
    match controller::update_doh_stamps(update_url, &cfg.doh_stamps_file).await {
        Ok(count) => {
            tracing::info!(count, "stored doh stamps");
            exitcode::OK
        }
        Err(e) => {
            tracing::error!(%e, "failed to update doh stamps");
            exitcode::UNAVAILABLE
        }
    }
}

async fn cmd_resolve(cfg: config::Config, host: &str) -> exitcode::ExitCode {
    match build_resolver(&cfg, None) {
        Ok(resolver) => match resolver.resolve(host).await {
            Ok(ips) => {
                for ip in ips {
                    println!("{ip}");
                }
                exitcode::OK
            }
            Err(e) => {
                tracing::error!(%e, host, "resolution failed");
                exitcode::NOHOST
            }
        },
        Err(code) => code,
    }
}

fn cmd_lookup(stamp: &str) -> exitcode::ExitCode {
    match dns_stamp::parse_doh(stamp) {
        Ok(s) => {
            println!("{}", s.url());
            println!("server_addr: {}", s.server_addr);
            println!("provider_name: {}", s.provider_name);
            exitcode::OK
        }
        Err(e) => {
            tracing::error!(%e, "failed to parse stamp");
            exitcode::DATAERR
        }
    }
}

fn cmd_conf(cfg: config::Config) -> exitcode::ExitCode {
    match serde_yaml::to_string(&cfg) {
        Ok(rendered) => {
            print!("{rendered}");
            exitcode::OK
        }
        Err(e) => {
            tracing::error!(%e, "failed to render configuration");
            exitcode::SOFTWARE
        }
    }
}
