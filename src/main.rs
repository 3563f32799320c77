use anyhow::Result;
use clap::Parser;
use tessera::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tessera::telemetry::init_tracing(cli.verbose);
    cli.run().await
}
