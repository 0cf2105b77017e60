use std::process::ExitCode;

use clap::Parser;
use tpm::cli::Cli;
use tpm::error::TpmError;

fn main() -> ExitCode {
    let cli = Cli::parse();
    match tpm::execute::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Root cause first, rollback status is part of the message for
            // aborted transactions.
            if let TpmError::TransactionAborted { source, .. } = &e {
                eprintln!("error: {source}");
            }
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
