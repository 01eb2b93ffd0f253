//! imgcrypt CLI entry point.

use clap::Parser;
use imgcrypt_core::config::{CryptConfig, LogLevel};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use imgcrypt_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = CryptConfig::load(cli.config.as_deref());
    let configured = config.as_ref().map(|c| c.log_level).unwrap_or(LogLevel::Warn);

    // RUST_LOG wins over the config file and -v
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::default()
                    .add_directive(LevelFilter::from_level(cli.log_level(configured)).into())
            }),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match config {
        Ok(config) => dispatch(cli, &config).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
