//! Stage traits and per-host execution drivers.
//!
//! A stage is serial (runs once against the state), simple (fans out over
//! active hosts one at a time) or parallel (fans out over a worker pool).
//! Per-host outcomes are sum-typed: `run_host` returns `Err` to fail the
//! host, and the driver moves it into the failed set; workers never touch
//! shared mutable state.

use std::panic::{self, AssertUnwindSafe};
use std::process::Child;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{error, warn};

use crate::core::host::Host;
use crate::core::options::{OptDef, Parsed};
use crate::core::state::State;
use crate::error::{Error, Result};

/// Upper bound on waiting for a single worker result. Not a user-visible
/// deadline; it only bounds the collection loop so an interrupted driver
/// cannot hang on a dead pool.
pub const HUGE_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24);

/// Behaviour shared by every stage kind.
pub trait StageCore: Send + Sync {
    /// One-line description, shown by stage listing and used in failure
    /// bookkeeping.
    fn brief(&self) -> &'static str;

    /// Flags this stage requires from the command line.
    fn options(&self) -> Vec<OptDef> {
        Vec::new()
    }

    /// Bind parsed argument values into the stage.
    fn bind(&mut self, _args: &Parsed) -> Result<()> {
        Ok(())
    }
}

/// Runs once against the whole state; an error aborts the pipeline.
pub trait SerialStage: StageCore {
    fn run(&self, state: &mut State) -> Result<()>;

    fn rollback(&self, _state: &mut State) -> Result<()> {
        Ok(())
    }
}

/// Fans out over active hosts on the driver thread; per-host errors fail
/// the host and the stage moves on.
pub trait SimpleStage: StageCore {
    fn run_host(&self, host: &mut Host) -> Result<()>;

    fn rollback_host(&self, _host: &Host) -> Result<()> {
        Ok(())
    }
}

/// Fans out over active hosts on a worker pool.
pub trait ParallelStage: StageCore {
    /// Pool size; defaults to the number of active hosts.
    fn poolsize(&self) -> Option<usize> {
        None
    }

    /// Scoped hook wrapping the fan-out; used to start auxiliary daemons.
    /// The returned guard is dropped once every worker result is in.
    fn prepared(&self) -> Result<Prepared> {
        Ok(Prepared::none())
    }

    fn run_host(&self, host: &Host) -> Result<()>;

    fn rollback(&self, _state: &mut State) -> Result<()> {
        Ok(())
    }
}

/// Guard returned by [`ParallelStage::prepared`]; terminates an auxiliary
/// daemon when the fan-out completes on any path.
pub struct Prepared {
    child: Option<Child>,
}

impl Prepared {
    pub fn none() -> Self {
        Prepared { child: None }
    }

    pub fn daemon(child: Child) -> Self {
        Prepared { child: Some(child) }
    }
}

impl Drop for Prepared {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                warn!("failed to terminate auxiliary daemon: {err}");
            }
            let _ = child.wait();
        }
    }
}

/// A stage instance together with its execution discipline.
pub enum StageExec {
    Serial(Box<dyn SerialStage>),
    Simple(Box<dyn SimpleStage>),
    Parallel(Box<dyn ParallelStage>),
}

impl StageExec {
    pub fn brief(&self) -> &'static str {
        match self {
            StageExec::Serial(stage) => stage.brief(),
            StageExec::Simple(stage) => stage.brief(),
            StageExec::Parallel(stage) => stage.brief(),
        }
    }

    pub fn options(&self) -> Vec<OptDef> {
        match self {
            StageExec::Serial(stage) => stage.options(),
            StageExec::Simple(stage) => stage.options(),
            StageExec::Parallel(stage) => stage.options(),
        }
    }

    pub fn bind(&mut self, args: &Parsed) -> Result<()> {
        match self {
            StageExec::Serial(stage) => stage.bind(args),
            StageExec::Simple(stage) => stage.bind(args),
            StageExec::Parallel(stage) => stage.bind(args),
        }
    }

    /// Run the stage. Per-host failures are absorbed into the state; the
    /// returned error means the stage itself is broken.
    pub fn execute(&self, state: &mut State) -> Result<()> {
        match self {
            StageExec::Serial(stage) => stage.run(state),
            StageExec::Simple(stage) => {
                let brief = stage.brief();
                for name in state.active_names() {
                    let Some(host) = state.active.get_mut(&name) else {
                        continue;
                    };
                    if let Err(err) = stage.run_host(host) {
                        state.fail_host(&name, brief, err.to_string());
                    }
                }
                Ok(())
            }
            StageExec::Parallel(stage) => run_parallel(stage.as_ref(), state),
        }
    }

    /// Undo the stage after a pipeline failure. Errors are logged, never
    /// propagated; rollback is best-effort.
    pub fn roll_back(&self, state: &mut State) {
        match self {
            StageExec::Serial(stage) => {
                if let Err(err) = stage.rollback(state) {
                    error!("rollback of {} failed: {err}", stage.brief());
                }
            }
            StageExec::Simple(stage) => {
                for host in state.failed.values() {
                    if let Err(err) = stage.rollback_host(host) {
                        error!(
                            "rollback of {} for {} failed: {err}",
                            stage.brief(),
                            host.name
                        );
                    }
                }
            }
            StageExec::Parallel(stage) => {
                if let Err(err) = stage.rollback(state) {
                    error!("rollback of {} failed: {err}", stage.brief());
                }
            }
        }
    }
}

fn run_parallel(stage: &dyn ParallelStage, state: &mut State) -> Result<()> {
    let brief = stage.brief();
    let names = state.active_names();
    if names.is_empty() {
        return Ok(());
    }

    let _prepared = stage.prepared()?;

    let results = {
        // keys() and values() iterate in the same order, so results line up
        // with `names`.
        let hosts: Vec<&Host> = state.active.values().collect();
        fan_out(stage, &hosts)?
    };

    for (name, result) in names.iter().zip(results) {
        if let Err(err) = result {
            state.fail_host(name, brief, err.to_string());
        }
    }
    Ok(())
}

/// Run `stage.run_host` for every host on a bounded pool of OS threads,
/// returning outcomes in input order.
fn fan_out(stage: &dyn ParallelStage, hosts: &[&Host]) -> Result<Vec<Result<()>>> {
    let pool = stage
        .poolsize()
        .unwrap_or(hosts.len())
        .clamp(1, hosts.len());

    let (task_tx, task_rx) = mpsc::channel::<usize>();
    let task_rx = Mutex::new(task_rx);
    let (result_tx, result_rx) = mpsc::channel::<(usize, Result<()>)>();

    thread::scope(|scope| {
        for _ in 0..pool {
            let result_tx = result_tx.clone();
            let task_rx = &task_rx;
            scope.spawn(move || {
                loop {
                    let index = match task_rx.lock() {
                        Ok(rx) => rx.recv(),
                        Err(_) => break,
                    };
                    let Ok(index) = index else { break };
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| stage.run_host(hosts[index])));
                    let result = match outcome {
                        Ok(result) => result,
                        Err(_) => Err(Error::host("worker panicked")),
                    };
                    if result_tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }

        for index in 0..hosts.len() {
            let _ = task_tx.send(index);
        }
        drop(task_tx);
        drop(result_tx);

        let mut results: Vec<Option<Result<()>>> = (0..hosts.len()).map(|_| None).collect();
        for _ in 0..hosts.len() {
            match result_rx.recv_timeout(HUGE_TIMEOUT) {
                Ok((index, result)) => results[index] = Some(result),
                Err(_) => return Err(Error::stage(stage.brief(), "worker pool crashed")),
            }
        }
        Ok(results
            .into_iter()
            .map(|result| result.unwrap_or_else(|| Err(Error::host("worker returned no result"))))
            .collect())
    })
}
