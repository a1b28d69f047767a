//! Mutable per-run state.

use std::collections::BTreeMap;

use log::error;

use crate::core::host::Host;
use crate::error::{Error, Result};

/// The run context: host sets and the raw destination arguments.
///
/// Hosts live in ordered maps keyed by canonical name, so every iteration
/// over them is deterministic. A host is in exactly one of `active` and
/// `failed`; `all_failed` accumulates across rollbacks so the final report
/// lists every host that ever failed.
pub struct State {
    /// Raw `-H` arguments.
    pub hosts: Vec<String>,
    /// Raw `-g` arguments.
    pub groups: Vec<String>,
    pub active: BTreeMap<String, Host>,
    pub failed: BTreeMap<String, Host>,
    pub all_failed: BTreeMap<String, Host>,
}

impl State {
    pub fn new(hosts: Vec<String>, groups: Vec<String>) -> Result<Self> {
        if hosts.is_empty() && groups.is_empty() {
            return Err(Error::setup(
                "at least one host or group should be specified",
            ));
        }
        Ok(State {
            hosts,
            groups,
            active: BTreeMap::new(),
            failed: BTreeMap::new(),
            all_failed: BTreeMap::new(),
        })
    }

    pub fn add_active(&mut self, host: Host) {
        self.active.insert(host.name.clone(), host);
    }

    /// Names of the active hosts, in order.
    pub fn active_names(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Move a host from the active to the failed set, recording the failing
    /// stage and reason. A host never returns to the active set within a
    /// run.
    pub fn fail_host(&mut self, name: &str, stage: &str, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(mut host) = self.active.remove(name) {
            error!("host {name} failed, stage: {stage}, reason: {reason}");
            host.failure = Some((stage.to_string(), reason));
            self.failed.insert(host.name.clone(), host);
        }
    }

    /// Fold the failed set into `all_failed`, leaving `failed` empty.
    ///
    /// Called after a rollback pass and once at run end, so the report sees
    /// every failure while rollback only ever compensates the hosts failed
    /// since the previous pass.
    pub fn archive_failed(&mut self) {
        let failed = std::mem::take(&mut self.failed);
        self.all_failed.extend(failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn host(name: &str) -> Host {
        Host::new(name, name, Map::new())
    }

    #[test]
    fn requires_some_destination() {
        assert!(State::new(vec![], vec![]).is_err());
        assert!(State::new(vec!["h1".to_string()], vec![]).is_ok());
        assert!(State::new(vec![], vec!["g1".to_string()]).is_ok());
    }

    #[test]
    fn failing_moves_between_sets() {
        let mut state = State::new(vec!["x".to_string()], vec![]).unwrap();
        state.add_active(host("h1"));
        state.add_active(host("h2"));

        state.fail_host("h1", "probe", "unreachable");
        assert!(!state.active.contains_key("h1"));
        assert!(state.failed.contains_key("h1"));
        assert!(state.active.contains_key("h2"));
        assert_eq!(
            state.failed["h1"].failure,
            Some(("probe".to_string(), "unreachable".to_string()))
        );

        // Failing an already-failed host is a no-op.
        state.fail_host("h1", "other", "again");
        assert_eq!(
            state.failed["h1"].failure.as_ref().unwrap().0,
            "probe".to_string()
        );
    }

    #[test]
    fn active_and_failed_are_disjoint() {
        let mut state = State::new(vec!["x".to_string()], vec![]).unwrap();
        for name in ["c", "a", "b"] {
            state.add_active(host(name));
        }
        state.fail_host("b", "stage", "reason");
        for name in state.active.keys() {
            assert!(!state.failed.contains_key(name));
        }
        // Ordered iteration by name.
        assert_eq!(state.active_names(), vec!["a", "c"]);
    }

    #[test]
    fn archive_accumulates_and_clears() {
        let mut state = State::new(vec!["x".to_string()], vec![]).unwrap();
        state.add_active(host("h1"));
        state.add_active(host("h2"));
        state.fail_host("h1", "s", "r");
        state.archive_failed();
        assert!(state.failed.is_empty());
        assert!(state.all_failed.contains_key("h1"));

        state.fail_host("h2", "s", "r");
        state.archive_failed();
        assert_eq!(state.all_failed.len(), 2);
    }
}
