//! Deployment entry point: argument intake, stage listing, lock scopes,
//! pipeline execution and reporting.

use log::LevelFilter;
use time::OffsetDateTime;

use crate::core::options::{self, Discovery};
use crate::core::state::State;
use crate::core::{lock, pipeline};
use crate::error::{Error, Result};
use crate::{logging, methods, report};

/// Exit code for setup problems (bad flags, bad config file, missing
/// destinations).
const SETUP_EXIT_CODE: u8 = 2;

/// Run a deployment from raw command-line arguments, returning the process
/// exit code: 0 when at least one host survived, 1 otherwise, 2 for setup
/// errors.
pub fn execute(raw_args: Vec<String>) -> u8 {
    match run(raw_args) {
        Ok(code) => code,
        Err(Error::Setup { message }) => {
            eprintln!("{message}");
            SETUP_EXIT_CODE
        }
        Err(err) => {
            eprintln!("Error: {err}");
            1
        }
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn run(raw_args: Vec<String>) -> Result<u8> {
    let args = options::effective_args(raw_args)?;
    let mut methods = methods::all();

    let (index, selection) = match options::discover(&args, &methods)? {
        Discovery::ListStages { method } => {
            let method = &methods[method];
            eprintln!("Stages of \"{}\" method:", method.name);
            for (index, stage) in method.stages.iter().enumerate() {
                eprintln!("{index:3}: {}", stage.brief());
            }
            return Ok(0);
        }
        Discovery::Run { method, selection } => (method, selection),
    };

    let mut method = methods.swap_remove(index);
    if let Some(indices) = &selection {
        method = method.select(indices)?;
    }

    let parsed = options::parse_for(&args, &method)?;
    method.bind_all(&parsed)?;
    let mut state = State::new(parsed.hosts.clone(), parsed.groups.clone())?;

    let capture = if parsed.report.is_empty() {
        None
    } else {
        let path = tempfile::Builder::new()
            .prefix(&format!("praetor_{}_", method.name))
            .tempfile()
            .map_err(|err| Error::io("Failed to create log file", "praetor_log", err))?
            .into_temp_path();
        Some(path)
    };
    logging::init(logging::Options {
        colored: parsed.colored,
        level: LevelFilter::Info,
        capture: capture.as_ref().map(|path| path.to_path_buf()),
    })?;

    let start = now();
    let success = {
        let _locks = lock::acquire_all(&parsed.locks)?;
        pipeline::run(&method, &mut state)
    };
    let finish = now();
    log::logger().flush();

    if let Some(path) = capture {
        report::send(&parsed.report, method.name, &state, start, finish, &path)?;
        // TempPath removes the file when dropped.
    }

    Ok(if success { 0 } else { 1 })
}
