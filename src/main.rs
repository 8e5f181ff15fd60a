use std::io;
use std::process::ExitCode;

use natprobe::cli::Cli;
use natprobe::orchestrator::Orchestrator;
use natprobe::{logging, url_utils};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse_args();

    let seeds = match url_utils::read_seed_urls(io::stdin().lock()) {
        Ok(seeds) => seeds,
        Err(e) => {
            tracing::error!(error = %e, "failed to read seed urls from stdin");
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = Orchestrator::new(seeds, cli.measure_config());

    // First Ctrl+C stops dispatching and drains workers gracefully.
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, draining workers");
            cancel.cancel();
        }
    });

    let report = orchestrator.run().await;

    println!("Max connections are {}", report.connections);
    ExitCode::SUCCESS
}
