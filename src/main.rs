use anyhow::Result;
use clap::Parser;

use claudio::cli::{run, Cli};
use claudio::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("info", cli.verbose);
    run(cli).await?;
    Ok(())
}
