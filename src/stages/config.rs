//! Per-host setup sequences: COW config partition provisioning and Windows
//! image customisation. Both are deterministic SCP+SSH sequences fanned out
//! per host.

use crate::core::host::Host;
use crate::core::options::{OptDef, Parsed};
use crate::core::stage::{ParallelStage, StageCore, StageExec};
use crate::error::{Error, Result};
use crate::stages::{SshConfig, win};

/// Directory holding the Windows customisation helpers shipped with the
/// orchestrator.
const WIN_TOOLS_DIR: &str = "/usr/share/praetor/win7";

/// Run an SCP/SSH sequence against one host, failing it on the first
/// non-zero step.
fn run_sequence(
    ssh: &SshConfig,
    host: &Host,
    files: &[(String, String)],
    commands: &[String],
    brief: &str,
) -> Result<()> {
    let mut failed = false;
    for (src, dst) in files {
        failed |= ssh.run_scp(&host.name, &ssh.login_linux, src, dst)? != 0;
    }
    for command in commands {
        failed |= ssh.run_ssh(&host.name, &ssh.login_linux, command, &[])?.0 != 0;
    }
    if failed {
        return Err(Error::host(format!("failed to {brief}")));
    }
    Ok(())
}

/// Store the Puppet SSL material into the host's COW config partition.
///
/// The `{}` tokens are substituted by the remote `conf.sh` with the mounted
/// config partition root; they are part of that script's interface.
#[derive(Default)]
pub struct StoreCOWConfig {
    ssh: SshConfig,
}

impl StoreCOWConfig {
    pub fn stage() -> StageExec {
        StageExec::Parallel(Box::new(StoreCOWConfig::default()))
    }

    fn commands(host: &Host) -> Vec<String> {
        [
            "mkdir -p {}/puppet/certs {}/puppet/private_keys".to_string(),
            "cp -a /var/lib/puppet/ssl/certs/ca.pem {}/puppet/certs".to_string(),
            format!("cp -a /var/lib/puppet/ssl/certs/{}.pem {{}}/puppet/certs", host.name),
            format!(
                "cp -a /var/lib/puppet/ssl/private_keys/{}.pem {{}}/puppet/private_keys",
                host.name
            ),
        ]
        .into_iter()
        .map(|cmd| format!("/root/cow/conf.sh {cmd}"))
        .collect()
    }
}

impl StageCore for StoreCOWConfig {
    fn brief(&self) -> &'static str {
        "store Puppet SSL stuff into COW config partition"
    }

    fn options(&self) -> Vec<OptDef> {
        SshConfig::options()
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.ssh = SshConfig::bind(args)?;
        Ok(())
    }
}

impl ParallelStage for StoreCOWConfig {
    fn run_host(&self, host: &Host) -> Result<()> {
        run_sequence(
            &self.ssh,
            host,
            &[],
            &Self::commands(host),
            self.brief(),
        )
    }
}

/// Customise SSH credentials and the sysprep answer file inside the Windows
/// root partition, driven from the Linux side of the host.
#[derive(Default)]
pub struct CustomizeWindowsSetup {
    ssh: SshConfig,
    root_partition: String,
    data_partition: Option<(String, String)>,
    driver_path: Option<String>,
}

impl CustomizeWindowsSetup {
    pub fn stage() -> StageExec {
        StageExec::Parallel(Box::new(CustomizeWindowsSetup::default()))
    }

    fn files(&self) -> Vec<(String, String)> {
        let mut files = vec![(
            format!("{WIN_TOOLS_DIR}/customize.py"),
            "/tmp/customize.py".to_string(),
        )];
        if self.data_partition.is_some() {
            files.push((
                format!("{WIN_TOOLS_DIR}/filter_reg.py"),
                "/tmp/filter_reg.py".to_string(),
            ));
        }
        files
    }

    /// Root partition for `host`: the `windows.boot_partition` property
    /// overrides the label given with `-wp`.
    fn root_partition(&self, host: &Host) -> String {
        host.prop("windows")
            .and_then(|windows| windows.get("boot_partition"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.root_partition.clone())
    }

    fn commands(&self, host: &Host) -> Vec<String> {
        let mountpoint = "/mnt";
        let prefix = if win::is_cygwin(host) {
            "/cygwin64/etc"
        } else {
            "/ProgramData/ssh"
        };

        let mut customize_args = vec![format!("-H {}", win::hostname(host))];
        let has_userqwer = host
            .prop("services")
            .and_then(serde_json::Value::as_array)
            .is_some_and(|services| services.iter().any(|s| s.as_str() == Some("userqwer")));
        if has_userqwer {
            customize_args.push("-a user:qwer -A user:qwer".to_string());
        }
        if let Some(driver_path) = &self.driver_path {
            customize_args.push(format!("-d {driver_path}"));
        }
        let sysprep_xml = format!("{mountpoint}/Windows/Panther/unattend.xml");
        if let Some((label, letter)) = &self.data_partition {
            customize_args.push(format!(
                "-c \"C:\\\\Windows\\\\Setup\\\\Scripts\\\\set-mountpoint.exe {label} {letter}:\\\\\""
            ));
            let home = format!("{letter}:\\\\Users");
            customize_args.push(format!("-c \"cmd /c mkdir {home}\""));
            customize_args.push(format!("-P {home}"));
        }

        let mut commands = vec![
            format!("mount {} {mountpoint}", self.root_partition(host)),
            format!("cp /etc/ssh/ssh_host_*_key{{,.pub}} {mountpoint}{prefix}"),
            format!(
                "python3 /tmp/customize.py {} {sysprep_xml} {sysprep_xml}",
                customize_args.join(" ")
            ),
        ];

        if let Some(hardware) = host.prop_str("hardware") {
            let setup = "/mnt/drivers/setup.cmd";
            commands.push(format!(
                "bash -c \"echo 'call %~dp0setup-impl.cmd {hardware}' > {setup}\""
            ));
        }
        if let Some((_, letter)) = &self.data_partition {
            commands.push(format!(
                "sed -i \"s/rem set profiles=/set profiles={letter}:\\\\\\\\Users\\\\\\\\profiles.reg/\" \
                 {mountpoint}/Windows/Setup/Scripts/SetupComplete.cmd"
            ));
        }
        commands.push(format!("umount {mountpoint}"));

        if let Some((label, _)) = &self.data_partition {
            commands.push(format!(
                "mount /dev/disk/by-partlabel/{label} {mountpoint}"
            ));
            commands.push(format!("rm -rf {mountpoint}/Users/Administrator*"));
            commands.push(format!("rm -rf {mountpoint}/Users/UpdatusUser*"));
            commands.push(format!(
                "python3 /tmp/filter_reg.py -q -f \".+-500$\" \
                 {mountpoint}/Users/profiles.reg {mountpoint}/Users/profiles.reg"
            ));
            commands.push(format!("umount {mountpoint}"));
        }
        commands
    }
}

impl StageCore for CustomizeWindowsSetup {
    fn brief(&self) -> &'static str {
        "customize SSH credentials and sysprep config in Windows root partition"
    }

    fn options(&self) -> Vec<OptDef> {
        let mut defs = vec![
            OptDef::single("wp", "LABEL", "Windows root partition label").with_default("windows10"),
            OptDef::single("wd", "LABEL:LETTER", "Set Windows partition volume path by FS label")
                .optional(),
            OptDef::single("d", "PATH", "Set windows driver search path").optional(),
        ];
        defs.extend(SshConfig::options());
        defs
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.ssh = SshConfig::bind(args)?;
        self.root_partition = format!("/dev/disk/by-partlabel/{}", args.one("wp")?);
        self.data_partition = match args.opt_one("wd") {
            Some(value) => {
                let (label, letter) = value.split_once(':').ok_or_else(|| {
                    Error::setup(format!("-wd expects LABEL:LETTER, got {value}"))
                })?;
                Some((label.to_string(), letter.to_string()))
            }
            None => None,
        };
        self.driver_path = args.opt_one("d").map(str::to_string);
        Ok(())
    }
}

impl ParallelStage for CustomizeWindowsSetup {
    fn run_host(&self, host: &Host) -> Result<()> {
        run_sequence(
            &self.ssh,
            host,
            &self.files(),
            &self.commands(host),
            self.brief(),
        )
    }
}
