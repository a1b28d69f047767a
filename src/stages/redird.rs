//! IDE-R redirection stages backed by the amtredird daemon.

use std::collections::BTreeMap;

use log::warn;

use crate::clients::amtredird;
use crate::core::options::{OptDef, Parsed};
use crate::core::stage::{SerialStage, StageCore, StageExec};
use crate::core::state::State;
use crate::error::Result;

fn url_option() -> OptDef {
    OptDef::single("a", "AMTREDIRD", "amtredird url").with_default("https://urgu.org/amtredird")
}

/// Map of controller name to host name over the active set. Hosts without a
/// resolved controller are failed on the spot.
fn amt_to_host(state: &mut State, brief: &'static str) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    for name in state.active_names() {
        let amt = state
            .active
            .get(&name)
            .and_then(|host| host.amt_host.clone());
        match amt {
            Some(amt) => {
                mapping.insert(amt, name);
            }
            None => state.fail_host(&name, brief, "AMT host is not determined"),
        }
    }
    mapping
}

/// Check every active host's controller is configured in amtredird.
#[derive(Default)]
pub struct EnsureRedirectionPossible {
    url: String,
}

impl EnsureRedirectionPossible {
    pub fn stage() -> StageExec {
        StageExec::Serial(Box::new(EnsureRedirectionPossible::default()))
    }
}

impl StageCore for EnsureRedirectionPossible {
    fn brief(&self) -> &'static str {
        "ensure amtredird has the hosts required"
    }

    fn options(&self) -> Vec<OptDef> {
        vec![url_option()]
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.url = args.one("a")?.to_string();
        Ok(())
    }
}

impl SerialStage for EnsureRedirectionPossible {
    fn run(&self, state: &mut State) -> Result<()> {
        let brief = self.brief();
        let possible = amtredird::list(&self.url)?;
        for (amt, host) in amt_to_host(state, brief) {
            if !possible.contains(&amt) {
                state.fail_host(&host, brief, "AMT host not configured in amtredird");
            }
        }
        Ok(())
    }
}

/// Enable redirection: stop first so a stale session cannot linger, then
/// start. Only start failures fail a host; the preliminary stop is
/// best-effort.
#[derive(Default)]
pub struct EnableRedirection {
    url: String,
}

impl EnableRedirection {
    pub fn stage() -> StageExec {
        StageExec::Serial(Box::new(EnableRedirection::default()))
    }
}

impl StageCore for EnableRedirection {
    fn brief(&self) -> &'static str {
        "enable IDE-R redirection via amtredird"
    }

    fn options(&self) -> Vec<OptDef> {
        vec![url_option()]
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.url = args.one("a")?.to_string();
        Ok(())
    }
}

impl SerialStage for EnableRedirection {
    fn run(&self, state: &mut State) -> Result<()> {
        let brief = self.brief();
        let mapping = amt_to_host(state, brief);
        let clients: Vec<String> = mapping.keys().cloned().collect();
        if clients.is_empty() {
            return Ok(());
        }

        for (amt, rv) in amtredird::stop(&self.url, &clients)? {
            if rv != 0 {
                warn!("failed to stop redirection for {amt} before starting");
            }
        }
        for (amt, rv) in amtredird::start(&self.url, &clients)? {
            if rv != 0 {
                if let Some(host) = mapping.get(&amt) {
                    state.fail_host(host, brief, "failed to change redirection");
                }
            }
        }
        Ok(())
    }

    fn rollback(&self, state: &mut State) -> Result<()> {
        let mut mapping = BTreeMap::new();
        for host in state.failed.values() {
            if let Some(amt) = &host.amt_host {
                mapping.insert(amt.clone(), host.name.clone());
            }
        }
        let clients: Vec<String> = mapping.keys().cloned().collect();
        if clients.is_empty() {
            return Ok(());
        }
        for (amt, rv) in amtredird::stop(&self.url, &clients)? {
            if rv != 0 {
                if let Some(host) = mapping.get(&amt) {
                    warn!("failed to stop redirection for {host}");
                }
            }
        }
        Ok(())
    }
}

/// Disable redirection for every active host.
#[derive(Default)]
pub struct DisableRedirection {
    url: String,
}

impl DisableRedirection {
    pub fn stage() -> StageExec {
        StageExec::Serial(Box::new(DisableRedirection::default()))
    }
}

impl StageCore for DisableRedirection {
    fn brief(&self) -> &'static str {
        "disable IDE-R redirection via amtredird"
    }

    fn options(&self) -> Vec<OptDef> {
        vec![url_option()]
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.url = args.one("a")?.to_string();
        Ok(())
    }
}

impl SerialStage for DisableRedirection {
    fn run(&self, state: &mut State) -> Result<()> {
        let brief = self.brief();
        let mapping = amt_to_host(state, brief);
        let clients: Vec<String> = mapping.keys().cloned().collect();
        if clients.is_empty() {
            return Ok(());
        }
        for (amt, rv) in amtredird::stop(&self.url, &clients)? {
            if rv != 0 {
                if let Some(host) = mapping.get(&amt) {
                    state.fail_host(host, brief, "failed to change redirection");
                }
            }
        }
        Ok(())
    }
}
