//! mcp-mediator
//!
//! Loads a gateway configuration, mounts the configured MCP servers and keeps
//! them running until interrupted.
//!
//! ```bash
//! mcp-mediator --config mediator.yaml
//! mcp-mediator --config mediator.yaml --check   # attach, print the index, exit
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use mediator_mcp::{Gateway, GatewayConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcp-mediator")]
#[command(about = "Policy-gated MCP gateway for agents")]
struct Cli {
    /// Gateway configuration (YAML). Defaults apply when omitted.
    #[arg(short, long, env = "MEDIATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Default log filter; `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Attach every server, print the aggregate index and exit.
    #[arg(long)]
    check: bool,
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = match &cli.config {
        Some(path) => GatewayConfig::from_file(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    }
    .with_env_overrides();

    let gateway = Gateway::builder()
        .build(config)
        .await
        .context("starting gateway")?;

    if cli.check {
        let index = gateway.compositor().index();
        println!("{}", serde_json::to_string_pretty(&*index)?);
        gateway.shutdown().await;
        return Ok(());
    }

    for mount in gateway.mounts() {
        info!(
            mount = %mount.name,
            prefix = %mount.prefix,
            tools = mount.tools,
            resources = mount.resources,
            "Mounted"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("Interrupt received");
    gateway.shutdown().await;
    Ok(())
}
