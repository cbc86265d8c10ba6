//! testbed - Main entry point.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use testbed::{
    cli::{Cli, Command, run_down_command, run_test_command, run_up_command},
    config::Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    let _ = dotenvy::dotenv();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("testbed=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(cli.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with(
            (!cli.log_json).then(|| tracing_subscriber::fmt::layer().with_target(false)),
        )
        .init();

    let mut config = Config::from_env()?;
    if cli.keep {
        config.environment.keep_containers = true;
    }
    if let Some(output) = cli.output {
        config.environment.output = output;
    }

    match cli.command {
        Command::Up => run_up_command(&config.environment).await,
        Command::Run { command } => {
            let code = run_test_command(&config.environment, command).await?;
            std::process::exit(code);
        }
        Command::Down => run_down_command(&config.environment).await,
    }
}
