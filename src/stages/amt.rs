//! AMT out-of-band power management stages.

use std::path::Path;
use std::process::{Command, Stdio};

use log::info;

use crate::clients::amtcreds::CredentialsProvider;
use crate::clients::config;
use crate::core::host::Host;
use crate::core::options::{OptDef, Parsed};
use crate::core::stage::{SimpleStage, StageCore, StageExec};
use crate::error::{Error, Result};

fn creds_option() -> OptDef {
    OptDef::single("p", "FILE", "AMT credentials").with_default("amtpasswd")
}

/// Resolve each host's `amt` property into the controller's canonical name.
#[derive(Default)]
pub struct DetermineAMTHosts {
    config_url: String,
}

impl DetermineAMTHosts {
    pub fn stage() -> StageExec {
        StageExec::Simple(Box::new(DetermineAMTHosts::default()))
    }
}

impl StageCore for DetermineAMTHosts {
    fn brief(&self) -> &'static str {
        "determine AMT hosts"
    }

    fn options(&self) -> Vec<OptDef> {
        vec![super::basic::config_url_option()]
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.config_url = args.one("c")?.to_string();
        Ok(())
    }
}

impl SimpleStage for DetermineAMTHosts {
    fn run_host(&self, host: &mut Host) -> Result<()> {
        let amt = host
            .prop_str("amt")
            .ok_or_else(|| Error::host("host props do not have \"amt\" attribute"))?
            .to_string();
        host.amt_host = Some(config::get_host(&self.config_url, &amt)?.name);
        Ok(())
    }
}

/// Run `amttool` against a host's controller. Credentials travel through
/// the child environment, never the command line.
fn call_amttool(
    creds: &CredentialsProvider,
    amt_host: &str,
    command: &str,
    special: Option<&str>,
) -> Result<i32> {
    let credentials = creds.get(amt_host)?;
    let mut argv = vec!["amttool".to_string(), amt_host.to_string(), command.to_string()];
    if let Some(special) = special {
        argv.push(special.to_string());
    }
    info!("running {argv:?}");
    let status = Command::new(&argv[0])
        .args(&argv[1..])
        .env("AMT_USER", &credentials.user)
        .env("AMT_PASSWORD", &credentials.password)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|err| Error::Spawn {
            command: argv.join(" "),
            source: err,
        })?;
    Ok(status.code().unwrap_or(-1))
}

fn amt_target(host: &Host) -> Result<&str> {
    host.amt_host
        .as_deref()
        .ok_or_else(|| Error::host("AMT host is not determined"))
}

/// Power hosts up through their AMT controllers.
#[derive(Default)]
pub struct WakeupAMTHosts {
    creds: Option<CredentialsProvider>,
}

impl WakeupAMTHosts {
    pub fn stage() -> StageExec {
        StageExec::Simple(Box::new(WakeupAMTHosts::default()))
    }
}

impl StageCore for WakeupAMTHosts {
    fn brief(&self) -> &'static str {
        "wake up hosts via AMT interface"
    }

    fn options(&self) -> Vec<OptDef> {
        vec![creds_option()]
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.creds = Some(CredentialsProvider::load(Path::new(args.one("p")?))?);
        Ok(())
    }
}

impl SimpleStage for WakeupAMTHosts {
    fn run_host(&self, host: &mut Host) -> Result<()> {
        let creds = self
            .creds
            .as_ref()
            .ok_or_else(|| Error::host("AMT credentials are not bound"))?;
        let rv = call_amttool(creds, amt_target(host)?, "powerup", None)
            .map_err(|_| Error::host("call to amttool failed"))?;
        if rv != 0 {
            return Err(Error::host("call to amttool failed"));
        }
        Ok(())
    }
}

/// Reset hosts through AMT and direct them to PXE boot.
#[derive(Default)]
pub struct ResetAMTHosts {
    creds: Option<CredentialsProvider>,
}

impl ResetAMTHosts {
    pub fn stage() -> StageExec {
        StageExec::Simple(Box::new(ResetAMTHosts::default()))
    }
}

impl StageCore for ResetAMTHosts {
    fn brief(&self) -> &'static str {
        "reset hosts via AMT interface and boot to PXE"
    }

    fn options(&self) -> Vec<OptDef> {
        vec![creds_option()]
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.creds = Some(CredentialsProvider::load(Path::new(args.one("p")?))?);
        Ok(())
    }
}

impl SimpleStage for ResetAMTHosts {
    fn run_host(&self, host: &mut Host) -> Result<()> {
        let creds = self
            .creds
            .as_ref()
            .ok_or_else(|| Error::host("AMT credentials are not bound"))?;
        let rv = call_amttool(creds, amt_target(host)?, "reset", Some("pxe"))
            .map_err(|_| Error::host("call to amttool failed"))?;
        if rv != 0 {
            return Err(Error::host("call to amttool failed"));
        }
        Ok(())
    }
}
