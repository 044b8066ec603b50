mod cli;

use clap::Parser;
use cli::Cli;
use devwatch::Registry;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(dev_error) = e.downcast_ref::<devwatch::Error>() {
            eprintln!("Error: {dev_error}");
        } else {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let registry = Registry::discover(&cli.dir, &cli.services)?;
    if registry.is_empty() {
        anyhow::bail!("no services found under '{}'", cli.dir.display());
    }

    if cli.list {
        for name in registry.names() {
            println!("{name}");
        }
        return Ok(());
    }

    tracing::info!("Supervising {} services", registry.len());
    registry.start_all().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    registry.shutdown().await;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
