//! taskvisor: runs workloads as processes or containers and serves their
//! host calls.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info};

use taskvisor::config::HostConfig;
use taskvisor::host::{Host, DEFAULT_CUSTOM_METHOD};
use taskvisor::server::{create_router, ServerState};
use taskvisor::tracing::{init_tracing, shutdown_tracing};

#[derive(Parser, Debug)]
#[command(name = "taskvisor", version, about)]
struct Cli {
    /// TOML config file; defaults apply when absent
    #[arg(short, long, env = "TASKVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP front door
    Serve {
        /// Overrides `listen_addr`
        #[arg(short, long)]
        listen: Option<String>,
    },
    /// Run one workload and print its answer
    Exec {
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = DEFAULT_CUSTOM_METHOD)]
        method: String,
        #[arg(short, long, default_value = "")]
        data: String,
    },
    /// List catalog workloads
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let mut cfg = HostConfig::load(cli.config.as_deref())?;
    init_tracing("taskvisor", cfg.otlp_endpoint.as_deref(), cli.json_logs)?;

    let result = match cli.command {
        Command::List => {
            let host = Host::new(cfg)?;
            for w in host.catalog().list() {
                let target = if w.image.is_empty() { &w.exec_name } else { &w.image };
                println!("{:>4}  {:<28} {:<10} {}", w.id, w.name, w.kind.as_str(), target);
            }
            Ok(())
        }
        Command::Exec { name, method, data } => {
            let host = Host::new(cfg)?;
            let outcome = host.execute_by_name(&name, true, &method, &data).await;
            host.shutdown().await;
            match outcome {
                Ok(out) => {
                    println!("{}", out);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    Err(e.into())
                }
            }
        }
        Command::Serve { listen } => {
            if let Some(addr) = listen {
                cfg.listen_addr = addr;
            }
            serve(cfg).await
        }
    };

    shutdown_tracing();
    result
}

async fn serve(cfg: HostConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    let host = Host::new(cfg)?;
    let app = create_router(ServerState { host: host.clone() });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutting down");
        })
        .await;

    host.shutdown().await;
    served?;
    Ok(())
}
