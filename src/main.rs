//! Linkweave daemon: bonds UDP links into one channel behind a TUN device.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use linkweave::bond::{LinkSender, Mux, PacketSink};
use linkweave::config::{init_logging, Config};
use linkweave::link::LinkMap;
use linkweave::metrics::{BondObserver, NoopObserver};
use linkweave::tun::TunDevice;

#[derive(Debug, Parser)]
#[command(name = "linkweave", version, about = "Bonds unreliable UDP links into one logical channel")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter level (overrides the config file).
    #[arg(long)]
    log_level: Option<String>,

    /// Listen for incoming links on this UDP port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Direct peer to dial (host:port, repeatable).
    #[arg(long = "target")]
    targets: Vec<String>,

    /// SOCKS5 proxy to dial through (host:port, repeatable).
    #[arg(long = "proxy")]
    proxies: Vec<String>,

    /// Peer the proxies should relay to (host:port).
    #[arg(long)]
    proxy_target: Option<String>,

    /// TUN device MTU.
    #[arg(long)]
    mtu: Option<u16>,

    /// TUN device name hint.
    #[arg(long)]
    tun_name: Option<String>,
}

impl Cli {
    /// Fold command-line flags over the file configuration.
    fn apply(self, config: &mut Config) {
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(port) = self.listen_port {
            config.listen_port = Some(port);
        }
        if !self.targets.is_empty() {
            config.targets = self.targets;
        }
        if !self.proxies.is_empty() {
            config.proxies = self.proxies;
        }
        if let Some(target) = self.proxy_target {
            config.proxy_target = Some(target);
        }
        if let Some(mtu) = self.mtu {
            config.tun.mtu = mtu;
        }
        if let Some(name) = self.tun_name {
            config.tun.name = name;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    cli.apply(&mut config);

    init_logging(&config.logging).context("initializing logging")?;
    config.validate().context("validating configuration")?;

    // The listening endpoint is the master side of the tunnel addressing.
    let is_listener = config.listen_port.is_some();
    let local_addr = config
        .tun
        .ipv4_addr
        .unwrap_or_else(|| role_addr(is_listener));
    let peer_addr = config
        .tun
        .peer_addr
        .unwrap_or_else(|| role_addr(!is_listener));

    let device = Arc::new(TunDevice::create(&config.tun).context("creating TUN device")?);
    device
        .configure(local_addr, peer_addr)
        .context("configuring TUN device")?;
    info!(
        device = %device.name(),
        local = %local_addr,
        peer = %peer_addr,
        mtu = device.mtu(),
        "TUN device ready"
    );

    let observer = build_observer(&config);
    let mux = Arc::new(Mux::new(config.bond.clone(), observer));
    let links = LinkMap::new(
        Arc::clone(&mux),
        config.link.clone(),
        config.proxy.clone(),
    );

    if let Some(port) = config.listen_port {
        links.start_listener(port).context("starting listener")?;
    }
    for target in &config.targets {
        links
            .initiate_link(target)
            .await
            .with_context(|| format!("connecting to peer {target}"))?;
    }
    if let Some(proxy_target) = &config.proxy_target {
        for proxy in &config.proxies {
            links
                .initiate_link_via_proxy(proxy, proxy_target)
                .await
                .with_context(|| format!("connecting via proxy {proxy}"))?;
        }
    }

    let sink: Arc<dyn PacketSink> = device.clone();
    let sender: Arc<dyn LinkSender> = links.clone();
    mux.bind(sink, sender);

    tokio::spawn(Arc::clone(&device).run(Arc::clone(&mux)));
    tokio::spawn(Arc::clone(&links).run());

    signal::ctrl_c().await.context("waiting for shutdown")?;

    for link in mux.snapshot() {
        info!(
            link = %link.id,
            sent_bytes = link.sent_bytes,
            received_bytes = link.received_bytes,
            rate = link.rate,
            "final link state"
        );
    }
    info!("shutting down");
    Ok(())
}

fn role_addr(master: bool) -> std::net::Ipv4Addr {
    if master {
        [10, 10, 10, 1].into()
    } else {
        [10, 10, 10, 2].into()
    }
}

#[cfg(feature = "metrics")]
fn build_observer(config: &Config) -> Arc<dyn BondObserver> {
    if config.metrics.enabled {
        match linkweave::metrics::PrometheusObserver::new() {
            Ok(observer) => return Arc::new(observer),
            Err(e) => warn!(error = %e, "metrics unavailable, continuing without"),
        }
    }
    Arc::new(NoopObserver)
}

#[cfg(not(feature = "metrics"))]
fn build_observer(config: &Config) -> Arc<dyn BondObserver> {
    if config.metrics.enabled {
        warn!("metrics requested but this build lacks the `metrics` feature");
    }
    Arc::new(NoopObserver)
}
