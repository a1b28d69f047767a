//! Concrete deployment stages.

pub mod amt;
pub mod basic;
pub mod boot;
pub mod config;
pub mod disk;
pub mod ndd;
pub mod network;
pub mod redird;
pub mod ssh;
pub mod win;

use crate::core::options::{OptDef, Parsed};
use crate::core::process;
use crate::error::{Error, Result};

/// SSH credentials shared by every stage that talks to hosts.
#[derive(Clone, Debug, Default)]
pub struct SshConfig {
    pub login_linux: String,
    pub login_windows: String,
}

impl SshConfig {
    pub fn options() -> Vec<OptDef> {
        vec![
            OptDef::single("ll", "LOGIN", "ssh login for Linux").with_default("root"),
            OptDef::single("lw", "LOGIN", "ssh login for Windows").with_default("Administrator"),
        ]
    }

    pub fn bind(args: &Parsed) -> Result<Self> {
        Ok(SshConfig {
            login_linux: args.one("ll")?.to_string(),
            login_windows: args.one("lw")?.to_string(),
        })
    }

    pub fn run_ssh(
        &self,
        host: &str,
        login: &str,
        command: &str,
        opts: &[String],
    ) -> Result<(i32, String)> {
        process::run_ssh(host, login, command, opts)
    }

    /// Run a remote command, turning a non-zero exit into a host failure
    /// described by `description`.
    pub fn run_ssh_checked(
        &self,
        host: &str,
        login: &str,
        command: &str,
        description: &str,
    ) -> Result<String> {
        let (rv, output) = self.run_ssh(host, login, command, &[])?;
        if rv != 0 {
            return Err(Error::host(format!("failed to {description}")));
        }
        Ok(output)
    }

    pub fn run_scp(&self, host: &str, login: &str, src: &str, dst: &str) -> Result<i32> {
        let (rv, _) = process::run_scp(host, login, src, dst)?;
        Ok(rv)
    }
}
