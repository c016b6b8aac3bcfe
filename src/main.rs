use colored::Colorize;
use commitctl::core::status::EXIT_FAILURE;
use std::process::ExitCode;

fn main() -> ExitCode {
    match commitctl::run() {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(err) => {
            let err = anyhow::Error::new(err).context("commitctl failed");
            eprintln!("{} {:#}", "error:".bright_red().bold(), err);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
