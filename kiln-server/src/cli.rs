use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "kiln-server")]
#[command(about = "Durable job queue: HTTP enqueue/admin API and workers.")]
pub struct Cli {
    /// Path to configuration file (TOML, YAML or JSON).
    #[arg(long, short = 'c', global = true, env = "KILN_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Serve the HTTP API, with embedded workers unless `--workers 0`.
    Serve {
        /// Worker loops to run in-process (defaults to `worker.embedded_workers`).
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run a standalone worker loop until interrupted.
    Worker {
        /// Drain the queue once and exit.
        #[arg(long)]
        once: bool,
    },
    /// Apply database migrations and exit.
    Migrate,
}

impl Cli {
    /// The subcommand to run; `serve` when none was given.
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Serve { workers: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve() {
        let cli = Cli::try_parse_from(["kiln-server"]).unwrap();
        assert!(matches!(cli.command(), Command::Serve { workers: None }));
    }

    #[test]
    fn parses_worker_once_with_global_config() {
        let cli =
            Cli::try_parse_from(["kiln-server", "worker", "--once", "--config", "kiln.toml"])
                .unwrap();
        assert!(matches!(cli.command(), Command::Worker { once: true }));
        assert_eq!(cli.config, Some(PathBuf::from("kiln.toml")));
    }

    #[test]
    fn parses_serve_worker_count() {
        let cli = Cli::try_parse_from(["kiln-server", "serve", "--workers", "3"]).unwrap();
        assert!(matches!(cli.command(), Command::Serve { workers: Some(3) }));
    }
}
