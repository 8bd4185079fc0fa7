use clap::{Parser, Subcommand};
use docharvest::{build_app, config::Config, jobs, scheduler::RecrawlScheduler, store::StateStore, AppState};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "docharvest", about = "Manufacturer documentation harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API service, supervisor and scheduler (default).
    Serve,
    /// Run one job's pipeline. Spawned by the supervisor, not by hand.
    Worker { job_id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Worker { job_id } => worker(&job_id).await,
    }
}

async fn serve() {
    // Initialize tracing with RUST_LOG env filter (defaults to "info")
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config =
        Arc::new(Config::from_env().expect("Failed to load configuration from environment"));
    let port = config.port;

    let store = StateStore::connect(&config.state_store_url)
        .await
        .expect("Failed to open state store");

    let supervisor = jobs::JobSupervisor::start(store.clone(), config.clone())
        .await
        .expect("Failed to start job supervisor");

    tokio::spawn(RecrawlScheduler::new(store.clone(), supervisor.clone()).run());

    let state = AppState {
        config,
        store,
        supervisor,
    };
    let app = build_app(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("Harvester service starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app).await.expect("Server error");
}

async fn worker(job_id: &str) {
    // Worker logs go to stderr so the supervisor's ring buffer captures
    // them for the failure report.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config =
        Arc::new(Config::from_env().expect("Failed to load configuration from environment"));

    match jobs::worker::run(job_id, config).await {
        Ok(()) => {}
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Worker failed");
            std::process::exit(1);
        }
    }
}
