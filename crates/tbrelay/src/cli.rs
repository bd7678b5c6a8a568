//! Clap derive structures for the `tbrelay` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// tbrelay -- relay one ThingsBoard device's live telemetry to local subscribers
#[derive(Debug, Parser)]
#[command(
    name = "tbrelay",
    version,
    about = "Relay ThingsBoard telemetry to local WebSocket subscribers",
    long_about = "Authenticates to a ThingsBoard telemetry WebSocket, subscribes to one\n\
        device's time series, and serves each reading to every connected\n\
        subscriber, replaying recent history to late joiners.\n\n\
        Settings come from a TOML file, TBRELAY_* variables, and the\n\
        THINGSBOARD_WEBSOCKET_URL / PUBLIC_* variables (a .env file is read).",
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    /// Defaults to `serve`
    #[command(subcommand)]
    pub command: Option<Command>,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "TBRELAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Downstream listen address, e.g. 0.0.0.0:4000
    #[arg(long, global = true)]
    pub bind: Option<String>,

    /// Entity (device) id to subscribe to
    #[arg(long, global = true)]
    pub entity: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format
    #[arg(long, default_value = "text", env = "TBRELAY_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum Command {
    /// Connect upstream and serve subscribers until interrupted
    Serve,

    /// Load and validate configuration, then print the resolved settings
    Check,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["tbrelay", "--bind", "127.0.0.1:4001"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.global.bind.as_deref(), Some("127.0.0.1:4001"));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["tbrelay", "check", "--entity", "dev-1", "-vv"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Check)));
        assert_eq!(cli.global.entity.as_deref(), Some("dev-1"));
        assert_eq!(cli.global.verbose, 2);
    }
}
