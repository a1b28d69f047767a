//! A machine under deployment.

use serde_json::{Map, Value};

use crate::logging::HostTag;

/// One target machine, created by the host-initialisation stage from the
/// config service record and carried through the run.
#[derive(Clone, Debug)]
pub struct Host {
    /// Canonical name, also the ordering key for deterministic iteration.
    pub name: String,
    /// Short inventory name.
    pub sname: String,
    /// Opaque property map from the config service.
    pub props: Map<String, Value>,
    /// AMT controller name, resolved by `DetermineAMTHosts`.
    pub amt_host: Option<String>,
    /// Failing stage and reason, set when the host leaves the active set.
    pub failure: Option<(String, String)>,
}

impl Host {
    pub fn new(name: impl Into<String>, sname: impl Into<String>, props: Map<String, Value>) -> Self {
        Host {
            name: name.into(),
            sname: sname.into(),
            props,
            amt_host: None,
            failure: None,
        }
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    /// Logging handle tagged with this host's name.
    pub fn log(&self) -> HostTag {
        HostTag::new(&self.name)
    }
}
