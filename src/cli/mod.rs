//! CLI command handling.
//!
//! Provides subcommands for:
//! - Bringing an environment up and leaving it running (`up`)
//! - Running a test command inside a fresh environment (`run -- <cmd>`)
//! - Stopping an environment left running (`down`)

mod environment;

pub use environment::{run_down_command, run_test_command, run_up_command};

use clap::{ColorChoice, Parser, Subcommand};

use crate::config::OutputMode;

#[derive(Parser, Debug)]
#[command(name = "testbed")]
#[command(about = "Ephemeral container environments for integration tests")]
#[command(
    long_about = "testbed brings up a dependency container and the application under test on a shared network, waits for both, and tears them down afterwards.\nExamples:\n  testbed run -- cargo test --test integration  # Run tests in a fresh environment\n  testbed up  # Leave an environment running\n  testbed down  # Stop it again"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Keep stopped containers instead of removing them (for debugging)
    #[arg(long, global = true)]
    pub keep: bool,

    /// Where pull/build progress and container logs go: stdio, log or quiet
    #[arg(long, global = true)]
    pub output: Option<OutputMode>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring the environment up and leave it running
    Up,

    /// Bring the environment up, run a test command, then tear down
    #[command(
        long_about = "Brings the environment up, runs the given command with inherited stdio, tears the environment down (draining application logs), and exits with the command's exit code."
    )]
    Run {
        /// Test command and its arguments, after `--`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Stop the environment's containers by name
    Down,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_trailing_args() {
        let cli = Cli::parse_from(["testbed", "--keep", "run", "--", "cargo", "test", "--release"]);

        assert!(cli.keep);
        match cli.command {
            Command::Run { command } => {
                assert_eq!(command, vec!["cargo", "test", "--release"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_output_mode() {
        let cli = Cli::parse_from(["testbed", "down", "--output", "quiet"]);
        assert_eq!(cli.output, Some(OutputMode::Quiet));
        assert!(matches!(cli.command, Command::Down));
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Cli::try_parse_from(["testbed", "run"]).is_err());
    }
}
