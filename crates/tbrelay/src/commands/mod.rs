//! Command handlers, one module per subcommand.

pub mod check;
pub mod serve;

use tbrelay_config::{Overrides, Settings};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Resolve settings from every layer, with command-line flags on top.
pub fn load(global: &GlobalOpts) -> Result<Settings, CliError> {
    let overrides = Overrides {
        bind: global.bind.clone(),
        entity_id: global.entity.clone(),
    };
    Ok(tbrelay_config::load_settings(
        global.config.as_deref(),
        &overrides,
    )?)
}
