use std::str::FromStr;

use verbosio::set_verbosity;

use crate::cli::{Cli, TpmCommand};
use crate::config::Config;
use crate::error::{Result, TpmError};
use crate::manifest::ToolId;
use crate::ops::{self, Context};

/// Executes the given CLI command against a freshly constructed context.
///
/// # Errors
/// Returns the operation's typed error; the caller maps it to an exit
/// code.
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose || cli.debug {
        set_verbosity!();
    }
    let config = Config::from_env()?;
    let mut ctx = Context::new(config)?;

    let result = dispatch(&mut ctx, &cli);
    // Auto-save on exit: a mutation whose save failed mid-run is retried
    // here so the on-disk manifest catches up.
    let saved = ctx.finish();
    result.and(saved)
}

fn dispatch(ctx: &mut Context, cli: &Cli) -> Result<()> {
    match &cli.command {
        TpmCommand::Install { tool } => {
            let id = ToolId::from_str(tool)?;
            ops::install(ctx, &id, cli.force)
        }
        TpmCommand::Update { tool, all } => match (tool, all) {
            (Some(_), true) => Err(TpmError::Usage(
                "pass either a tool or --all, not both".to_string(),
            )),
            (Some(tool), false) => {
                let id = ToolId::from_str(tool)?;
                ops::update(ctx, &id)
            }
            (None, true) => ops::update_all(ctx),
            (None, false) => Err(TpmError::Usage(
                "update needs a tool or --all".to_string(),
            )),
        },
        TpmCommand::Remove { tool } => {
            let id = ToolId::from_str(tool)?;
            ops::remove(ctx, &id)
        }
        TpmCommand::Info { tool } => {
            let id = ToolId::from_str(tool)?;
            ops::info(ctx, &id)
        }
        TpmCommand::List => {
            ops::list(ctx, cli.verbose);
            Ok(())
        }
        TpmCommand::Repair => ops::repair(ctx),
        TpmCommand::Cleanup => ops::cleanup(ctx),
    }
}
