//! SSH helpers for the reference and client Linux machines.

use std::time::Duration;

use log::{info, warn};

use crate::core::process;
use crate::core::wait;
use crate::error::Result;

fn connect_fast() -> Vec<String> {
    vec!["ConnectTimeout=1".to_string()]
}

pub fn no_dpkg_locks(host: &str) -> Result<bool> {
    let (rv, _) = process::plain_ssh(host, "! fuser /var/lib/dpkg/lock", &[])?;
    Ok(rv == 0)
}

/// Shut the host down, first waiting out any running package operation.
pub fn shutdown(host: &str) -> Result<()> {
    info!("Waiting for no dpkg locks on {host}");
    wait::wait_for(
        &format!("no dpkg locks on {host}"),
        Duration::from_secs(900),
        Duration::from_secs(10),
        || no_dpkg_locks(host),
    )?;
    info!("Shutting down {host}");
    let _ = process::plain_ssh(host, "shutdown now", &[])?;
    Ok(())
}

pub fn reboot(host: &str) -> Result<()> {
    info!("Rebooting {host}");
    let _ = process::plain_ssh(host, "reboot", &[])?;
    Ok(())
}

pub fn is_accessible(host: &str) -> Result<bool> {
    info!("Checking if {host} is accessible");
    let (rv, _) = process::plain_ssh(host, "id", &connect_fast())?;
    Ok(rv == 0)
}

/// Reboot `host` if nobody is logged in. Every problem here is logged and
/// swallowed; pushing updates to clients is best-effort.
pub fn try_reboot_if_idle(host: &str) {
    info!("Checking if host {host} is idle");
    let who = match process::plain_ssh_output(host, "who", &connect_fast()) {
        Ok(output) => output,
        Err(err) => {
            warn!("Failed to check if host {host} is idle: {err}");
            return;
        }
    };

    if !who.trim().is_empty() {
        info!("Host {host} is busy, skipping reboot");
        return;
    }
    if let Err(err) = reboot(host) {
        warn!("Failed to reboot host {host}: {err}");
    }
}
