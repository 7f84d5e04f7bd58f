use clap::Parser;
use remexec::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Configuration decides whether debug logging is forced
    let config = cli.load_config()?;
    cli.init_logging(&config)?;

    // Execute command
    cli.execute(config).await?;

    Ok(())
}
