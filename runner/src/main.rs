use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use konnload::engine::install_interrupt_handler;
use konnload::{ClusterClient, Config, KubeClient, ScenarioRegistry};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "konnload")]
#[command(about = "Concurrent load scenarios for the cluster tunnel path")]
#[command(version)]
struct Cli {
    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Serve run metrics for Prometheus on this address
    #[arg(long, global = true)]
    prometheus_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work with load scenarios
    #[command(subcommand)]
    Scenarios(ScenariosCommand),
}

#[derive(Subcommand)]
enum ScenariosCommand {
    /// List available scenarios
    List,

    /// Run scenarios in the given order
    Run {
        /// Scenario names
        #[arg(required = true)]
        names: Vec<String>,

        /// YAML configuration file
        #[arg(long, short, default_value = "config.yaml")]
        config_file: PathBuf,
    },

    /// Remove resources left behind by interrupted runs
    Cleanup {
        /// Scenario names
        #[arg(required = true)]
        names: Vec<String>,

        /// YAML configuration file
        #[arg(long, short, default_value = "config.yaml")]
        config_file: PathBuf,
    },
}

fn build_registry(config_file: &Path) -> anyhow::Result<ScenarioRegistry> {
    let config = Config::load(config_file)?;

    let cluster: Arc<dyn ClusterClient> = Arc::new(
        KubeClient::new(&config.cluster).context("Failed to create cluster client")?,
    );
    let interrupt = install_interrupt_handler();

    Ok(ScenarioRegistry::new(&config, cluster, interrupt))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "konnload=debug"
    } else {
        "konnload=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(addr) = cli.prometheus_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Serving Prometheus metrics on {}", addr);
    }

    match cli.command {
        Command::Scenarios(ScenariosCommand::List) => {
            for name in ScenarioRegistry::known_names() {
                println!("{}", name);
            }
        }
        Command::Scenarios(ScenariosCommand::Run { names, config_file }) => {
            let registry = build_registry(&config_file)?;
            registry.validate(&names)?;

            let outcomes = registry.run_all(&names).await?;
            for outcome in outcomes {
                println!("{}", outcome.report());
            }
        }
        Command::Scenarios(ScenariosCommand::Cleanup { names, config_file }) => {
            let registry = build_registry(&config_file)?;
            registry.cleanup_all(&names).await?;
            info!("Cleanup finished");
        }
    }

    Ok(())
}
