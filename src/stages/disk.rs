//! Remote disk preparation stages.

use crate::core::host::Host;
use crate::core::options::{OptDef, Parsed};
use crate::core::stage::{ParallelStage, StageCore, StageExec};
use crate::error::{Error, Result};
use crate::stages::SshConfig;

/// Call the remote disk tool to configure the local disk layout.
#[derive(Default)]
pub struct ConfigureDisk {
    ssh: SshConfig,
    config_url: String,
}

impl ConfigureDisk {
    pub fn stage() -> StageExec {
        StageExec::Parallel(Box::new(ConfigureDisk::default()))
    }
}

impl StageCore for ConfigureDisk {
    fn brief(&self) -> &'static str {
        "call disk.py to configure state of local disk"
    }

    fn options(&self) -> Vec<OptDef> {
        let mut defs = vec![super::basic::config_url_option()];
        defs.extend(SshConfig::options());
        defs
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.ssh = SshConfig::bind(args)?;
        self.config_url = args.one("c")?.to_string();
        Ok(())
    }
}

impl ParallelStage for ConfigureDisk {
    fn run_host(&self, host: &Host) -> Result<()> {
        self.ssh.run_ssh_checked(
            &host.name,
            &self.ssh.login_linux,
            &format!("disk.py -c {}", self.config_url),
            self.brief(),
        )?;
        Ok(())
    }
}

/// Names of the volume groups reported by `vgs --reportformat json`.
fn parse_vg_names(output: &str) -> Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(output).map_err(|err| Error::Json {
        context: "vgs report".to_string(),
        source: err,
    })?;
    let vgs = value
        .get("report")
        .and_then(|report| report.get(0))
        .and_then(|entry| entry.get("vg"))
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| Error::host("unexpected vgs report shape"))?;
    Ok(vgs
        .iter()
        .filter_map(|vg| vg.get("vg_name"))
        .filter_map(serde_json::Value::as_str)
        .map(str::to_string)
        .collect())
}

/// Stop everything holding the local disk so it can be repartitioned:
/// Docker, well-known mount points, then every LVM volume group.
#[derive(Default)]
pub struct FreeDisk {
    ssh: SshConfig,
}

impl FreeDisk {
    const POSSIBLE_MOUNTPOINTS: [&'static str; 1] = ["/place"];

    pub fn stage() -> StageExec {
        StageExec::Parallel(Box::new(FreeDisk::default()))
    }
}

impl StageCore for FreeDisk {
    fn brief(&self) -> &'static str {
        "stop processes using local disk to prepare the disk for partitioning"
    }

    fn options(&self) -> Vec<OptDef> {
        SshConfig::options()
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.ssh = SshConfig::bind(args)?;
        Ok(())
    }
}

impl ParallelStage for FreeDisk {
    fn run_host(&self, host: &Host) -> Result<()> {
        let log = host.log();
        let login = &self.ssh.login_linux;

        log.info("stopping Docker which might hold files in /place");
        self.ssh.run_ssh_checked(
            &host.name,
            login,
            "systemctl stop docker.socket docker",
            "stop docker",
        )?;

        for mountpoint in Self::POSSIBLE_MOUNTPOINTS {
            log.info(format!("unmounting {mountpoint} if it is mounted"));
            self.ssh.run_ssh_checked(
                &host.name,
                login,
                &format!("if mountpoint {mountpoint}; then umount {mountpoint}; fi"),
                &format!("unmount {mountpoint} if it is mounted"),
            )?;
        }

        log.info("deactivating all the LVM volume groups");
        let report = self.ssh.run_ssh_checked(
            &host.name,
            login,
            "vgs -o name --reportformat json",
            "list LVM volume groups",
        )?;
        let vgs = parse_vg_names(&report)?;
        if vgs.is_empty() {
            return Ok(());
        }
        self.ssh.run_ssh_checked(
            &host.name,
            login,
            &format!("vgchange -a n {}", vgs.join(" ")),
            "deactivate LVM volume groups",
        )?;
        Ok(())
    }
}
