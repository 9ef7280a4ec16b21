//! flowctl controller service
//!
//! Listens for switch agents, provisions each switch on connect (firewall
//! drop rules, table-miss), runs every packet-in through the decision
//! pipeline and polls all switches for telemetry on a timer.

use anyhow::{Context, Result};
use clap::Parser;
use flowctl_core::config::{load_environment, ControllerConfig};
use flowctl_engine::{Controller, CsvDirSink};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

mod server;

#[derive(Parser, Debug)]
#[command(name = "flowctl")]
#[command(about = "SDN controller: MAC learning, firewall, VIP load balancing and telemetry")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address switch agents connect to (host:port)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Seconds between telemetry polls
    #[arg(long)]
    poll_interval: Option<f64>,

    /// JSON firewall rules file
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Directory for telemetry CSV files
    #[arg(long)]
    sink_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// CLI flags win over the file and the environment
    fn apply(&self, config: &mut ControllerConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(rules) = &self.rules {
            config.rules_source = Some(rules.clone());
        }
        if let Some(dir) = &self.sink_dir {
            config.sink_location = dir.clone();
        }
    }
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("flowctl=info".parse()?)
        .add_directive("flowctl_engine=info".parse()?)
        .add_directive("flowctl_network=info".parse()?)
        .add_directive("flowctl_core=info".parse()?);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from /etc/flowctl/environment (if exists)
    let env_file = load_environment();

    let args = Args::parse();
    init_tracing(args.log_json)?;
    if let Some(path) = env_file {
        info!("Loaded environment from {}", path);
    }

    let mut config = ControllerConfig::load(args.config.as_deref())
        .context("Failed to load controller configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid controller configuration")?;

    let sink = CsvDirSink::new(&config.sink_location)
        .await
        .context("Failed to prepare telemetry sink")?;
    info!("Telemetry records go to {}", sink.dir().display());

    let controller = Arc::new(Controller::from_config(&config, Arc::new(sink)));

    let telemetry = tokio::spawn(
        controller
            .telemetry()
            .clone()
            .run(controller.registry().clone(), config.poll_interval()),
    );

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!("flowctl listening for switches on {}", config.listen);

    tokio::select! {
        result = server::serve(listener, controller.clone()) => {
            result.context("Switch listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    telemetry.abort();
    Ok(())
}
