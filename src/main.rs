//! CDN box director entry point
//!
//! ## Usage
//!
//! ```bash
//! # Run with a configuration file (TOML, YAML or JSON)
//! cdnbox-director --config /etc/cdnbox/config.json
//!
//! # Non-standard port and a forced local box (testing without root)
//! cdnbox-director --config config.toml --port 5353 --local-box paris
//!
//! # Geo-aware answers from a MaxMind country database (geoip feature)
//! cdnbox-director --config config.toml --geoip GeoLite2-Country.mmdb
//! ```
//!
//! `SIGHUP` reloads the configuration file.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cdnbox_director::box_state::unix_millis;
use cdnbox_director::config::DirectorConfig;
use cdnbox_director::director::{local_meter, Director};
use cdnbox_director::dns::DnsServer;
use cdnbox_director::geo::{GeoIpDatabase, GeoLookup, NoGeo};
use cdnbox_director::identity::{detect_local, local_interfaces, resolve_boxes};
use cdnbox_director::lock_utils::lock_or_recover;

/// CDN box director
#[derive(Parser, Debug, Clone)]
#[command(name = "cdnbox-director")]
#[command(version)]
#[command(about = "DNS traffic director for a fleet of CDN boxes", long_about = None)]
struct Args {
    /// Path to configuration file (.toml, .yaml/.yml, otherwise JSON)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// DNS listen port (overrides dnsserver.port)
    #[arg(long)]
    port: Option<u16>,

    /// Bind address (overrides dnsserver.bind)
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Name of the box this director runs on (skips interface detection)
    #[arg(long)]
    local_box: Option<String>,

    /// MaxMind country database
    #[arg(long)]
    geoip: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> anyhow::Result<DirectorConfig> {
    let mut config = DirectorConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.dnsserver.port = port;
    }
    if let Some(bind) = args.bind {
        config.dnsserver.bind = bind;
    }
    if args.local_box.is_some() {
        config.local_box = args.local_box.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting CDN box director v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;

    let geo: Arc<dyn GeoLookup> = match &args.geoip {
        Some(path) => Arc::new(GeoIpDatabase::open(path)?),
        None => {
            info!("No GeoIP database, every client resolves to unknown geo");
            Arc::new(NoGeo)
        }
    };

    let interfaces = local_interfaces()?;
    let resolved = resolve_boxes(&config).await;
    let identity = detect_local(&config, &resolved, &interfaces)
        .context("cannot determine the local box")?;

    let director = Arc::new(Director::new(
        config.clone(),
        &identity,
        &resolved,
        &interfaces,
        geo,
        unix_millis(),
    )?);
    let server = DnsServer::bind(&config.dnsserver, director.dispatcher()).await?;

    let meter = local_meter(&lock_or_recover(director.model(), "box state model"));
    if meter.is_none() {
        info!("Local box is not bandwidth-managed, no bandwidth sampling");
    }
    let tasks = director.start(server.udp_socket(), meter);

    info!("DNS configuration:");
    info!("  Domain: {}", config.dnsserver.domain);
    info!("  Listen: {}", server.local_addr()?);
    info!("  Local box: {}", identity.name);
    info!("  Boxes: {}, applications: {}", config.cdnboxes.len(), config.applis.len());

    #[cfg(unix)]
    {
        let director = Arc::clone(&director);
        let args = args.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(hangup) => hangup,
                Err(e) => {
                    warn!("SIGHUP handler unavailable: {}", e);
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading {}", args.config.display());
                let reloaded = load_config(&args)
                    .and_then(|config| Ok(director.reload(config, unix_millis())?));
                if let Err(e) = reloaded {
                    error!("Reload failed, keeping the running configuration: {:#}", e);
                }
            }
        });
    }

    let result = tokio::select! {
        result = server.run() => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    for task in tasks {
        task.abort();
    }
    if let Err(e) = &result {
        error!("DNS server error: {}", e);
    }
    result
}
