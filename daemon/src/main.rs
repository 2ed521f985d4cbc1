use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use nabunetd::config::{Config, ConnectionKindConfig};
use nabunetd::image::Catalogue;
use nabunetd::{conn_io, Server};

/// NABU network Adaptor daemon: serves boot segments to NABU PCs and
/// emulators over serial or TCP.
#[derive(Parser, Debug)]
#[command(name = "nabunetd", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "nabunet.toml")]
    config: PathBuf,

    /// Default log filter (RUST_LOG overrides).
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let cfg = Config::load(&cli.config)?;
    if cfg.connection.is_empty() {
        bail!("no connections configured in {}", cli.config.display());
    }

    let catalogue = Catalogue::from_config(&cfg.channel)?;
    if catalogue.is_empty() {
        log::warn!("no channels configured; clients can fetch nothing but the clock");
    }
    let server = Arc::new(Server::new(catalogue));

    for conn_cfg in &cfg.connection {
        let res = match conn_cfg.kind {
            ConnectionKindConfig::Serial => conn_io::add_serial(&server, conn_cfg),
            ConnectionKindConfig::Tcp => conn_io::add_tcp(&server, conn_cfg).await,
        };
        if let Err(err) = res {
            log::error!("unable to create connection on {}: {:#}", conn_cfg.port, err);
        }
    }

    if server.registry.is_empty() {
        bail!("no connections could be created");
    }
    log::info!("{} connection(s) up.", server.registry.len());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    log::info!("Shutting down.");

    server.registry.cancel_all();
    let drain = server.clone();
    tokio::task::spawn_blocking(move || drain.registry.wait_empty())
        .await
        .context("waiting for connections to drain")?;

    Ok(())
}
