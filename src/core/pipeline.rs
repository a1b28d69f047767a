//! Pipeline execution over a method's stages.

use log::{error, info};

use crate::core::method::Method;
use crate::core::state::State;

/// Run the method's stages in order against the state.
///
/// A stage error rolls back the completed prefix in reverse and aborts the
/// run. When every host has ended up failed without a stage error, the same
/// rollback happens, the failed set is archived and the pipeline continues
/// (the remaining stages see an empty active set). Rollback problems are
/// logged inside [`crate::core::stage::StageExec::roll_back`], never
/// propagated.
///
/// Returns true when at least one host survived.
pub fn run(method: &Method, state: &mut State) -> bool {
    let mut executed: Vec<usize> = Vec::new();
    for (index, stage) in method.stages.iter().enumerate() {
        info!("running stage: {}", stage.brief());
        let result = stage.execute(state);
        if let Err(err) = &result {
            error!("stage `{}` failed: {err}", stage.brief());
        }

        if result.is_err() || state.active.is_empty() {
            for done in executed.drain(..).rev() {
                info!("rolling back stage: {}", method.stages[done].brief());
                method.stages[done].roll_back(state);
            }
            state.archive_failed();
            if result.is_err() {
                return false;
            }
            continue;
        }
        executed.push(index);
    }
    state.archive_failed();
    !state.active.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::Host;
    use crate::core::stage::{ParallelStage, SerialStage, SimpleStage, StageCore, StageExec};
    use crate::error::{Error, Result};
    use serde_json::Map;
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<String>>>;

    fn state_with(names: &[&str]) -> State {
        let mut state = State::new(vec!["x".to_string()], vec![]).unwrap();
        for name in names {
            state.add_active(Host::new(*name, *name, Map::new()));
        }
        state
    }

    struct Recorded {
        label: &'static str,
        journal: Journal,
        fail: bool,
    }

    impl Recorded {
        fn stage(label: &'static str, journal: &Journal, fail: bool) -> Self {
            Recorded {
                label,
                journal: journal.clone(),
                fail,
            }
        }

        fn note(&self, event: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{event}", self.label));
        }
    }

    impl StageCore for Recorded {
        fn brief(&self) -> &'static str {
            self.label
        }
    }

    impl SerialStage for Recorded {
        fn run(&self, _state: &mut State) -> Result<()> {
            self.note("run");
            if self.fail {
                Err(Error::stage(self.label, "deliberate"))
            } else {
                Ok(())
            }
        }

        fn rollback(&self, _state: &mut State) -> Result<()> {
            self.note("rollback");
            Ok(())
        }
    }

    struct RecordedParallel {
        label: &'static str,
        journal: Journal,
    }

    impl StageCore for RecordedParallel {
        fn brief(&self) -> &'static str {
            self.label
        }
    }

    impl ParallelStage for RecordedParallel {
        fn run_host(&self, host: &Host) -> Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:run:{}", self.label, host.name));
            Ok(())
        }

        fn rollback(&self, _state: &mut State) -> Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:rollback", self.label));
            Ok(())
        }
    }

    /// Scenario S3: [A ok, B ok, C raises] rolls back B then A, not C, and
    /// the run fails.
    #[test]
    fn failing_stage_rolls_back_completed_prefix_in_reverse() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let method = Method::new(
            "test",
            "test method",
            vec![
                StageExec::Serial(Box::new(Recorded::stage("A", &journal, false))),
                StageExec::Parallel(Box::new(RecordedParallel {
                    label: "B",
                    journal: journal.clone(),
                })),
                StageExec::Serial(Box::new(Recorded::stage("C", &journal, true))),
            ],
        );
        let mut state = state_with(&["h1"]);
        assert!(!run(&method, &mut state));

        let events = journal.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["A:run", "B:run:h1", "C:run", "B:rollback", "A:rollback"]
        );
    }

    struct FailHosts {
        victims: Vec<&'static str>,
        journal: Journal,
    }

    impl StageCore for FailHosts {
        fn brief(&self) -> &'static str {
            "fail selected hosts"
        }
    }

    impl SimpleStage for FailHosts {
        fn run_host(&self, host: &mut Host) -> Result<()> {
            if self.victims.contains(&host.name.as_str()) {
                Err(Error::host("victim"))
            } else {
                Ok(())
            }
        }

        fn rollback_host(&self, host: &Host) -> Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("rollback_host:{}", host.name));
            Ok(())
        }
    }

    struct SeenHosts {
        journal: Journal,
    }

    impl StageCore for SeenHosts {
        fn brief(&self) -> &'static str {
            "record active hosts"
        }
    }

    impl SimpleStage for SeenHosts {
        fn run_host(&self, host: &mut Host) -> Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("seen:{}", host.name));
            Ok(())
        }
    }

    /// Scenario S2: h1 fails in one stage; the next stage only sees h2 and
    /// the run still succeeds.
    #[test]
    fn host_failure_is_isolated_and_run_succeeds() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let method = Method::new(
            "test",
            "test method",
            vec![
                StageExec::Simple(Box::new(FailHosts {
                    victims: vec!["h1"],
                    journal: journal.clone(),
                })),
                StageExec::Simple(Box::new(SeenHosts {
                    journal: journal.clone(),
                })),
            ],
        );
        let mut state = state_with(&["h1", "h2"]);
        assert!(run(&method, &mut state));
        assert!(state.all_failed.contains_key("h1"));
        assert_eq!(state.active_names(), vec!["h2"]);

        let events = journal.lock().unwrap().clone();
        assert_eq!(events, vec!["seen:h2"]);
    }

    /// When every host fails, the completed prefix rolls back, failures are
    /// archived, and the run reports failure.
    #[test]
    fn total_failure_triggers_rollback_and_failed_exit() {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let method = Method::new(
            "test",
            "test method",
            vec![
                StageExec::Serial(Box::new(Recorded::stage("A", &journal, false))),
                StageExec::Simple(Box::new(FailHosts {
                    victims: vec!["h1", "h2"],
                    journal: journal.clone(),
                })),
                StageExec::Serial(Box::new(Recorded::stage("Z", &journal, false))),
            ],
        );
        let mut state = state_with(&["h1", "h2"]);
        assert!(!run(&method, &mut state));
        assert_eq!(state.all_failed.len(), 2);
        assert!(state.failed.is_empty());

        let events = journal.lock().unwrap().clone();
        // A completes, the fan-out fails everyone, A rolls back, and the
        // pipeline continues into Z over an empty active set.
        assert_eq!(events, vec!["A:run", "A:rollback", "Z:run"]);
    }
}
