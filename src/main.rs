mod cli;
#[cfg_attr(not(feature = "tui"), allow(dead_code))]
mod log_sink;
mod model;
mod orchestrator;
mod runner;
mod session;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let code = cli::run(args).await?;
    // Headless runs hand the pipeline's exit code back to the caller.
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
