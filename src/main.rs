//! Binary entry point: parse the command line, load configuration, run
//! the gateway.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

use switchboard::config::Config;
use switchboard::gateway::run_gateway;

/// Inbound call orchestrator: webhooks and media streams in, realtime
/// voice out, with tiered degradation when backends misbehave.
#[derive(Parser, Debug)]
#[command(name = "switchboard", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook gateway and media relay (the default)
    Serve {
        /// Bind address override
        #[arg(long, value_name = "HOST")]
        host: Option<String>,
        /// Port override
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%H:%M:%S%.3f".into()))
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("switchboard=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::CheckConfig) => {
            config.validate()?;
            println!("✅ Configuration OK");
            println!("  business: {}", config.business.name);
            println!("  primary locale: {}", config.locales.primary);
            println!(
                "  realtime tier: {}",
                if config.realtime.enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            Ok(())
        }
        Some(Commands::Serve { host, port }) => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            run_gateway(&host, port, config).await
        }
        None => {
            let host = config.gateway.host.clone();
            let port = config.gateway.port;
            run_gateway(&host, port, config).await
        }
    }
}
