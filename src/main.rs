use clap::Parser;

use hubproxy::cli::Cli;
use hubproxy::telemetry;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_level, cli.log_format, cli.log_caller);

    if let Err(err) = hubproxy::server::run(cli).await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
