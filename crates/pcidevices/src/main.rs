use anyhow::Result;
use clap::Parser;
use pcidevices::config::Cli;
use pcidevices::config::Commands;
use pcidevices::config::DaemonArgs;
use pcidevices::ApplicationBuilder;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = utils::logging::init();

    tracing::info!("Starting pcidevices daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}
