//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("control API rejected the request ({status}): {}", .errors.join("; "))]
    Api { status: u16, errors: Vec<String> },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid option `{0}`, expected KEY=VALUE")]
    InvalidOption(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::Api { status: 400, .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: Run `mayhemctl behaviors` to see the available behaviors.".yellow()
                );
            }
            CliError::Network(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: Is the proxy running with the control API enabled (--http)?".yellow()
                );
            }
            _ => {}
        }
    }
}
