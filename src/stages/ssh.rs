//! Remote-command wait stages.
//!
//! Each stage polls a host with a list of candidate commands (tried in
//! order, different logins for the possible operating systems) until one
//! exits zero or the total timeout runs out. This expresses "wait until the
//! host is in Linux COW", "wait until Windows answers", "reboot whichever
//! OS answers first" and friends.

use std::thread;
use std::time::{Duration, Instant};

use crate::core::host::Host;
use crate::core::options::{OptDef, Parsed};
use crate::core::stage::{ParallelStage, StageCore, StageExec};
use crate::error::{Error, Result};
use crate::stages::{SshConfig, boot, win};

/// Step and total timeouts for a wait stage.
#[derive(Clone, Copy, Debug)]
pub struct StepTotal {
    pub step: Duration,
    pub total: Duration,
}

impl StepTotal {
    pub const TINY: StepTotal = StepTotal {
        step: Duration::from_secs(4),
        total: Duration::from_secs(20),
    };
    pub const SMALL: StepTotal = StepTotal {
        step: Duration::from_secs(10),
        total: Duration::from_secs(120),
    };
    pub const NORMAL: StepTotal = StepTotal {
        step: Duration::from_secs(10),
        total: Duration::from_secs(600),
    };
    pub const BIG: StepTotal = StepTotal {
        step: Duration::from_secs(30),
        total: Duration::from_secs(1800),
    };
}

pub const PUPPET_LAST_RUN_REPORT: &str = "/var/cache/puppet/state/last_run_report.yaml";
pub const REBOOT_MARKER: &str = "/tmp/rebooting";

pub const CHECK_WIN: &str = "ver | findstr /I Windows";
pub const CHECK_WIN_CYGWIN: &str = "uname | grep -q NT";
pub const REBOOT_WIN: &str = "shutdown /r /t 0";

/// The host counts as "in Linux" once puppet has converged and no reboot is
/// pending.
pub fn check_linux() -> String {
    format!(
        "test -f {report} && \
         grep \"^status:\" {report} | egrep -q \"(un)?changed\" && \
         ! test -f {marker}",
        report = PUPPET_LAST_RUN_REPORT,
        marker = REBOOT_MARKER
    )
}

pub fn check_linux_mem() -> String {
    format!("grep -q cowtype=mem /proc/cmdline && {}", check_linux())
}

pub fn reboot_linux() -> String {
    format!("touch {REBOOT_MARKER} && shutdown -r now")
}

/// One candidate probe: a login and a remote shell command.
#[derive(Clone, Debug)]
pub struct RemoteCommand {
    pub login: String,
    pub command: String,
}

fn windows_commands(host: &Host, login: &str, command: &str) -> Vec<RemoteCommand> {
    win::possible_logins(host, login)
        .into_iter()
        .map(|login| RemoteCommand {
            login,
            command: command.to_string(),
        })
        .collect()
}

fn linux_command(login: &str, command: String) -> RemoteCommand {
    RemoteCommand {
        login: login.to_string(),
        command,
    }
}

#[derive(Clone, Copy, Debug)]
enum Kind {
    CheckIsAccessible,
    RebootHost,
    RebootLinux,
    RebootWindows,
    MaybeRebootLocalLinux,
    WaitCowMemory,
    WaitLocalWindows,
    WaitLocalLinux,
}

/// A wait-loop stage over candidate remote commands.
pub struct RemoteCommands {
    kind: Kind,
    timeouts: StepTotal,
    ssh: SshConfig,
}

fn stage(kind: Kind, timeouts: StepTotal) -> StageExec {
    StageExec::Parallel(Box::new(RemoteCommands {
        kind,
        timeouts,
        ssh: SshConfig::default(),
    }))
}

/// Check whether the host is accessible via SSH in some way.
pub fn check_is_accessible(timeouts: StepTotal) -> StageExec {
    stage(Kind::CheckIsAccessible, timeouts)
}

/// Reboot the host with SSH, whether it is in Linux or Windows.
pub fn reboot_host(timeouts: StepTotal) -> StageExec {
    stage(Kind::RebootHost, timeouts)
}

/// Reboot the Linux side.
pub fn reboot_linux_host(timeouts: StepTotal) -> StageExec {
    stage(Kind::RebootLinux, timeouts)
}

/// Reboot the Windows side.
pub fn reboot_windows_host(timeouts: StepTotal) -> StageExec {
    stage(Kind::RebootWindows, timeouts)
}

/// Reboot a host running local Linux, unless local Linux is what it boots
/// by default anyway.
pub fn maybe_reboot_local_linux(timeouts: StepTotal) -> StageExec {
    stage(Kind::MaybeRebootLocalLinux, timeouts)
}

/// Wait until the host boots into the COW memory image.
pub fn wait_until_cow_memory(timeouts: StepTotal) -> StageExec {
    stage(Kind::WaitCowMemory, timeouts)
}

/// Wait until the host boots into local Windows.
pub fn wait_until_local_windows(timeouts: StepTotal) -> StageExec {
    stage(Kind::WaitLocalWindows, timeouts)
}

/// Wait until the host boots into local Linux.
pub fn wait_until_local_linux(timeouts: StepTotal) -> StageExec {
    stage(Kind::WaitLocalLinux, timeouts)
}

impl RemoteCommands {
    /// Candidates for "either OS" stages, probing the host's default boot
    /// first so the common case answers on the first attempt.
    fn either_os(&self, host: &Host, win_command: &str, linux_cmd: String) -> Vec<RemoteCommand> {
        let windows = windows_commands(host, &self.ssh.login_windows, win_command);
        let linux = linux_command(&self.ssh.login_linux, linux_cmd);
        if boot::boots_to_windows_by_default(host) {
            let mut commands = windows;
            commands.push(linux);
            commands
        } else {
            let mut commands = vec![linux];
            commands.extend(windows);
            commands
        }
    }

    fn commands(&self, host: &Host) -> Vec<RemoteCommand> {
        let linux = &self.ssh.login_linux;
        let windows = &self.ssh.login_windows;
        match self.kind {
            Kind::CheckIsAccessible => {
                let win_check = if win::is_cygwin(host) {
                    CHECK_WIN_CYGWIN
                } else {
                    CHECK_WIN
                };
                self.either_os(host, win_check, check_linux())
            }
            Kind::RebootHost => self.either_os(host, REBOOT_WIN, reboot_linux()),
            Kind::RebootLinux => vec![linux_command(linux, reboot_linux())],
            Kind::RebootWindows => windows_commands(host, windows, REBOOT_WIN),
            Kind::MaybeRebootLocalLinux => {
                if boot::boots_to_local_linux_by_default(host) {
                    Vec::new()
                } else {
                    vec![linux_command(linux, reboot_linux())]
                }
            }
            Kind::WaitCowMemory => vec![linux_command(linux, check_linux_mem())],
            Kind::WaitLocalWindows => windows_commands(host, windows, CHECK_WIN),
            Kind::WaitLocalLinux => vec![linux_command(linux, check_linux())],
        }
    }
}

impl StageCore for RemoteCommands {
    fn brief(&self) -> &'static str {
        match self.kind {
            Kind::CheckIsAccessible => "check whether the host is accessible via SSH in some way",
            Kind::RebootHost => "reboot host with SSH, whether Linux or Windows",
            Kind::RebootLinux => "reboot host booted into Linux",
            Kind::RebootWindows => "reboot host booted into Windows",
            Kind::MaybeRebootLocalLinux => {
                "reboot host booted into local Linux if it is not default boot"
            }
            Kind::WaitCowMemory => "wait with SSH until host boots into COW memory image",
            Kind::WaitLocalWindows => "wait until host has booted into local Windows",
            Kind::WaitLocalLinux => "wait until host has booted into local Linux",
        }
    }

    fn options(&self) -> Vec<OptDef> {
        SshConfig::options()
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.ssh = SshConfig::bind(args)?;
        Ok(())
    }
}

impl ParallelStage for RemoteCommands {
    fn run_host(&self, host: &Host) -> Result<()> {
        let commands = self.commands(host);
        run_until_success(&self.ssh, host, &commands, self.timeouts)
    }
}

/// Try every candidate in order; first zero exit wins. Repeat with `step`
/// pauses until `total` elapses.
fn run_until_success(
    ssh: &SshConfig,
    host: &Host,
    commands: &[RemoteCommand],
    timeouts: StepTotal,
) -> Result<()> {
    if commands.is_empty() {
        return Ok(());
    }
    let opts = vec!["ConnectTimeout=5".to_string()];
    let log = host.log();
    let start = Instant::now();
    loop {
        for command in commands {
            let (rv, _) = ssh.run_ssh(&host.name, &command.login, &command.command, &opts)?;
            if rv == 0 {
                return Ok(());
            }
        }
        if start.elapsed() >= timeouts.total {
            return Err(Error::host("failed to execute remote commands"));
        }
        log.info(format!(
            "condition not met yet, sleeping for {} seconds",
            timeouts.step.as_secs()
        ));
        thread::sleep(timeouts.step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn bound(kind: Kind) -> RemoteCommands {
        RemoteCommands {
            kind,
            timeouts: StepTotal::TINY,
            ssh: SshConfig {
                login_linux: "root".to_string(),
                login_windows: "Administrator".to_string(),
            },
        }
    }

    fn host_booting(value: Option<&str>) -> Host {
        let mut props = Map::new();
        if let Some(value) = value {
            props.insert("boot".to_string(), Value::String(value.to_string()));
        }
        Host::new("h1.example.org", "h1", props)
    }

    #[test]
    fn accessibility_probe_tries_linux_first_by_default() {
        let host = host_booting(None);
        let commands = bound(Kind::CheckIsAccessible).commands(&host);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].login, "root");
        assert!(commands[0].command.contains(PUPPET_LAST_RUN_REPORT));
        assert_eq!(commands[1].login, "H1-WIN+Administrator");
        assert_eq!(commands[1].command, CHECK_WIN);
        assert_eq!(commands[2].login, "Administrator");
    }

    #[test]
    fn windows_default_hosts_are_probed_windows_first() {
        let host = host_booting(Some("grub.windows10"));
        let commands = bound(Kind::CheckIsAccessible).commands(&host);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].login, "H1-WIN+Administrator");
        assert_eq!(commands[2].login, "root");

        let commands = bound(Kind::RebootHost).commands(&host);
        assert_eq!(commands[0].command, REBOOT_WIN);
        assert!(commands[2].command.contains(REBOOT_MARKER));
    }

    #[test]
    fn maybe_reboot_is_a_noop_on_local_linux_defaults() {
        let default_linux = host_booting(Some(boot::LOCAL_COW));
        assert!(
            bound(Kind::MaybeRebootLocalLinux)
                .commands(&default_linux)
                .is_empty()
        );

        let other = host_booting(Some("grub.windows10"));
        let commands = bound(Kind::MaybeRebootLocalLinux).commands(&other);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].login, "root");
        assert!(commands[0].command.contains(REBOOT_MARKER));
    }

    #[test]
    fn cow_memory_probe_checks_kernel_cmdline() {
        let host = host_booting(None);
        let commands = bound(Kind::WaitCowMemory).commands(&host);
        assert_eq!(commands.len(), 1);
        assert!(commands[0].command.starts_with("grep -q cowtype=mem"));
    }

    #[test]
    fn linux_reboot_leaves_marker() {
        assert!(reboot_linux().starts_with(&format!("touch {REBOOT_MARKER}")));
    }
}
