//! Host list initialisation.

use std::collections::BTreeSet;

use crate::clients::config;
use crate::core::host::Host;
use crate::core::options::{OptDef, Parsed};
use crate::core::stage::{SerialStage, StageCore, StageExec};
use crate::core::state::State;
use crate::error::Result;

pub fn config_url_option() -> OptDef {
    OptDef::single("c", "CONFIG", "config API url").with_default("https://urgu.org/config")
}

/// Resolve `-H`/`-g` into host records via the config service. A service
/// error here fails the whole run.
#[derive(Default)]
pub struct InitHosts {
    config_url: String,
}

impl InitHosts {
    pub fn stage() -> StageExec {
        StageExec::Serial(Box::new(InitHosts::default()))
    }
}

impl StageCore for InitHosts {
    fn brief(&self) -> &'static str {
        "get initial host list"
    }

    fn options(&self) -> Vec<OptDef> {
        vec![config_url_option()]
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.config_url = args.one("c")?.to_string();
        Ok(())
    }
}

impl SerialStage for InitHosts {
    fn run(&self, state: &mut State) -> Result<()> {
        let mut names = BTreeSet::new();
        for sname in &state.hosts {
            names.insert(config::get_host(&self.config_url, sname)?.name);
        }
        for group in &state.groups {
            names.extend(config::get_group(&self.config_url, group)?.hosts);
        }

        for name in names {
            let record = config::get_host(&self.config_url, &name)?;
            let sname = record.sname.unwrap_or_else(|| record.name.clone());
            state.add_active(Host::new(record.name, sname, record.props));
        }
        Ok(())
    }
}

/// Mark hosts named by `-b` as failed before any work starts.
#[derive(Default)]
pub struct ExcludeBannedHosts {
    banned: Vec<String>,
}

impl ExcludeBannedHosts {
    pub fn stage() -> StageExec {
        StageExec::Serial(Box::new(ExcludeBannedHosts::default()))
    }
}

impl StageCore for ExcludeBannedHosts {
    fn brief(&self) -> &'static str {
        "exclude banned hosts from deployment"
    }

    fn options(&self) -> Vec<OptDef> {
        vec![OptDef::append(
            "b",
            "HOST",
            "Ban HOST, excluding it from deployment",
        )]
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.banned = args.many("b");
        Ok(())
    }
}

impl SerialStage for ExcludeBannedHosts {
    fn run(&self, state: &mut State) -> Result<()> {
        let brief = self.brief();
        for name in state.active_names() {
            let Some(host) = state.active.get(&name) else {
                continue;
            };
            if self.banned.contains(&host.name) || self.banned.contains(&host.sname) {
                state.fail_host(&name, brief, "explicitly excluded from deployment");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn banned_hosts_are_failed_by_name_or_sname() {
        let mut state = State::new(vec!["x".to_string()], vec![]).unwrap();
        state.add_active(Host::new("h1.example.org", "h1", Map::new()));
        state.add_active(Host::new("h2.example.org", "h2", Map::new()));
        state.add_active(Host::new("h3.example.org", "h3", Map::new()));

        let stage = ExcludeBannedHosts {
            banned: vec!["h1".to_string(), "h3.example.org".to_string()],
        };
        stage.run(&mut state).unwrap();
        assert_eq!(state.active_names(), vec!["h2.example.org"]);
        assert_eq!(state.failed.len(), 2);
    }
}
