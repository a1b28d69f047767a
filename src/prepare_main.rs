use std::process::ExitCode;

use clap::Parser;

use praetor::app::prepare::{self, PrepareCli};

fn main() -> ExitCode {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match prepare::effective_args(raw) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::from(2);
        }
    };

    let cli = match PrepareCli::try_parse_from(
        std::iter::once("praetor-prepare".to_string()).chain(args),
    ) {
        Ok(cli) => cli,
        Err(err) => err.exit(),
    };

    match prepare::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
