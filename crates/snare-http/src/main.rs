use anyhow::Context;
use clap::Parser;
use snare_http::config::DEFAULT_CONTROL_ADDR;
use snare_http::{HostConfig, StandaloneHost};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Standalone Snare host: serves mock servers to remote clients.
#[derive(Parser, Debug)]
#[command(name = "snare", author, version, about)]
struct Args {
    /// Control address, overriding the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Control port on the listen host
    #[arg(short, long, env = "SNARE_PORT")]
    port: Option<u16>,

    /// YAML host configuration
    #[arg(short, long, env = "SNARE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(args: &Args) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<HostConfig> {
    let mut config = match args.config {
        Some(ref path) => HostConfig::from_file(path)?,
        None => HostConfig::default(),
    };

    if let Some(ref listen) = args.listen {
        config.listen = listen.clone();
    }
    if let Some(port) = args.port {
        let base: SocketAddr = config
            .listen
            .parse()
            .or_else(|_| DEFAULT_CONTROL_ADDR.parse())
            .context("invalid listen address")?;
        config.listen = SocketAddr::new(base.ip(), port).to_string();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    let host = StandaloneHost::bind(config)
        .await
        .context("failed to start the control listener")?;
    info!("Control protocol on {}", host.local_addr()?);

    let shutdown = host.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    host.run().await?;
    Ok(())
}
