//! `tbrelay check`: print the resolved settings and validate them.

use std::io::Write;

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let settings = super::load(global)?;

    let summary = settings.summary();
    let width = summary.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let mut out = std::io::stdout().lock();
    for (key, value) in &summary {
        let _ = writeln!(out, "{key:<width$}  {value}");
    }

    settings.to_relay_config()?;
    let _ = writeln!(out, "\nconfiguration ok");
    Ok(())
}
