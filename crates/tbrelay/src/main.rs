mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, LogFormat};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    // A missing .env is normal; real env vars always win.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Both reqwest and tokio-tungstenite pull rustls; pin the provider once.
    let _ = rustls::crypto::ring::default_provider().install_default();

    init_tracing(cli.global.verbose, cli.global.log_format);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => commands::serve::handle(&cli.global).await,
        Command::Check => commands::check::handle(&cli.global),
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let filter = match verbosity {
        0 => "tbrelay=info,tbrelay_core=info,tbrelay_api=warn",
        1 => "tbrelay=debug,tbrelay_core=debug,tbrelay_api=info",
        2 => "tbrelay=trace,tbrelay_core=trace,tbrelay_api=debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
