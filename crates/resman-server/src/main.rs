use clap::Parser;
use resman_core::{install_signal_handler, ManagerConfig, ResourceManager};
use resman_server::App;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "resman-server", about = "Lifecycle manager for containerized resources")]
struct Cli {
    /// Manager configuration file (TOML). Built-in defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, default_value_t = 8295)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Compute backend: `docker` or `mock`.
    #[arg(long, default_value = "docker")]
    backend: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RESMAN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    install_signal_handler();

    let config = match &cli.config {
        Some(path) => match ManagerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => ManagerConfig::default(),
    };

    let backend = match resman_runtime::select_backend(&cli.backend) {
        Ok(backend) => Arc::from(backend),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let manager = match ResourceManager::open(config, backend) {
        Ok(manager) => manager,
        Err(e) => {
            error!("failed to start resource manager: {e}");
            return ExitCode::FAILURE;
        }
    };

    let addr = format!("{}:{}", cli.bind, cli.port);
    let server = match resman_server::bind(&addr) {
        Ok(server) => server,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        "resman-server listening on {addr} (backend {}, data directory {})",
        manager.backend().name(),
        manager.config().data_dir.display()
    );

    let app = App::new(manager);
    resman_server::serve(&app, &server);
    ExitCode::SUCCESS
}
