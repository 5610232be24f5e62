use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use net_repeater::config::{RemoteIpLookupSpec, RepeaterConfig};
use net_repeater::dns::{IpAddrLookup, SystemResolver, UdpServer};
use net_repeater::manager::ServerManager;
use net_repeater::static_repeat::StaticRepeat;

/// net-repeater: DNS-driven per-host network repeater.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Increase log verbosity (repeatable: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all logs below `error`.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        "error".to_string()
    } else {
        match verbose {
            0 => std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn install_shutdown_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl-C handler")?;
    Ok(cancel)
}

fn build_ip_lookup(spec: &RemoteIpLookupSpec) -> Arc<dyn IpAddrLookup> {
    match spec {
        RemoteIpLookupSpec::System => Arc::new(SystemResolver),
        RemoteIpLookupSpec::Fixed { ip } => Arc::new(FixedIpLookup(*ip)),
    }
}

/// Always resolves to the same address -- used when `remote_ip_lookup` is
/// configured as `{"kind": "fixed", "ip": ...}`, e.g. for tests or a
/// single-upstream deployment with no real DNS dependency.
struct FixedIpLookup(std::net::IpAddr);
impl IpAddrLookup for FixedIpLookup {
    fn lookup_ip_addr(
        &self,
        _domain: &str,
        _prefer_ipv6: bool,
    ) -> Result<std::net::IpAddr, net_repeater::dns::Error> {
        Ok(self.0)
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config = RepeaterConfig::from_path(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    let cancel = install_shutdown_flag()?;

    // §12: a config naming both `server_manager` and `servers`/`downstream`
    // runs both concurrently.
    let manager = match &config.server_manager {
        Some(spec) => {
            let ip_lookup = build_ip_lookup(&spec.remote_ip_lookup);
            let iface_mode = match spec.local_iface_mode {
                Some(mode) => mode,
                None => net_repeater::iface::detect_mode()?,
            };
            let manager = ServerManager::new(
                spec.local_net,
                spec.local_iface.clone(),
                iface_mode,
                spec.proto_and_ports.clone(),
                ip_lookup,
                spec.server_ttl.as_duration(),
                spec.remote_prefer_ipv6,
            );

            let dns_addr = spec.dns_listen_addr;
            let udp_server = UdpServer::bind(dns_addr, manager.clone(), cancel.clone())
                .with_context(|| format!("failed to bind DNS front-end on {dns_addr}"))?;
            tracing::info!(addr = %udp_server.local_addr()?, "DNS front-end listening");
            std::thread::spawn(move || udp_server.serve());

            Some(manager)
        }
        None => None,
    };

    let mut static_repeat = if !config.servers.is_empty() || !config.downstream.is_empty() {
        Some(
            StaticRepeat::start(&config.downstream, &config.servers, cancel.clone())
                .context("failed to start static-repeat servers")?,
        )
    } else {
        None
    };

    if manager.is_none() && static_repeat.is_none() {
        anyhow::bail!("config defines neither `server_manager` nor `servers`/`downstream`");
    }

    tracing::info!("net-repeater running");
    while !cancel.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutting down");
    if let Some(manager) = manager {
        manager.terminate();
    }
    if let Some(static_repeat) = static_repeat.as_mut() {
        static_repeat.terminate();
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}
