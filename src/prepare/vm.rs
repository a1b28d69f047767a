//! Virtual machine control for the snapshot pipeline.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use log::{info, warn};

use crate::core::process;
use crate::core::transact::{Scope, Transaction, with_scope};
use crate::core::wait;
use crate::error::{Error, Result};
use crate::prepare::{cache, linux, lvm};

/// A managed VM: libvirt domain name plus the hostname it answers SSH on.
#[derive(Clone, Debug)]
pub struct RefVm {
    pub domain: String,
    pub host: String,
}

impl RefVm {
    pub fn new(domain: impl Into<String>, host: impl Into<String>) -> Self {
        RefVm {
            domain: domain.into(),
            host: host.into(),
        }
    }
}

/// Virtual machine manager operations the pipeline needs.
pub trait Vmm {
    fn is_vm_running(&self, domain: &str) -> Result<bool>;
    fn start(&self, domain: &str) -> Result<()>;
    fn reset(&self, domain: &str) -> Result<()>;
    fn disks(&self, domain: &str) -> Result<Vec<String>>;
}

/// libvirt backend driven through the `virsh` CLI.
pub struct Virsh;

impl Vmm for Virsh {
    fn is_vm_running(&self, domain: &str) -> Result<bool> {
        info!("Checking if {domain} is running");
        let output = process::output_checked(&[
            "virsh".to_string(),
            "list".to_string(),
            "--state-running".to_string(),
            "--name".to_string(),
        ])?;
        let domains: BTreeSet<&str> = output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        info!("Running domains: {domains:?}");
        Ok(domains.contains(domain))
    }

    fn start(&self, domain: &str) -> Result<()> {
        process::run_checked(&[
            "virsh".to_string(),
            "start".to_string(),
            domain.to_string(),
        ])
    }

    fn reset(&self, domain: &str) -> Result<()> {
        warn!("Resetting {domain}");
        process::run_checked(&[
            "virsh".to_string(),
            "reset".to_string(),
            domain.to_string(),
        ])
    }

    fn disks(&self, domain: &str) -> Result<Vec<String>> {
        let output = process::output_checked(&[
            "virsh".to_string(),
            "domblklist".to_string(),
            domain.to_string(),
            "--details".to_string(),
        ])?;
        Ok(parse_domblklist(&output))
    }
}

fn parse_domblklist(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [_, "disk", _, source] if source.starts_with('/') => Some(source.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// The single disk backing `domain`.
pub fn get_disk(vmm: &dyn Vmm, domain: &str) -> Result<String> {
    let disks = vmm.disks(domain)?;
    if disks.len() != 1 {
        return Err(Error::stage(
            "prepare",
            format!("Need exactly one disk for vm, got {disks:?}"),
        ));
    }
    Ok(disks.into_iter().next().unwrap_or_default())
}

/// Shut the VM down for the duration of `body`, restarting it afterwards
/// on every exit path and waiting for SSH to come back.
pub fn with_vm_shut_down<R>(
    vmm: &dyn Vmm,
    vm: &RefVm,
    body: impl FnOnce() -> Result<R>,
) -> Result<R> {
    linux::shutdown(&vm.host)?;
    wait::wait_for(
        &format!("{} to stop", vm.domain),
        Duration::from_secs(180),
        Duration::from_secs(3),
        || Ok(!vmm.is_vm_running(&vm.domain)?),
    )?;

    Transaction::new()
        .finally(None, |_, _| {
            vmm.start(&vm.domain)?;
            wait::wait_for(
                &format!("{} to become accessible with ssh", vm.host),
                Duration::from_secs(300),
                Duration::from_secs(5),
                || linux::is_accessible(&vm.host),
            )
        })
        .run(|_| body())
}

fn create_vm_disk_snapshot(
    vmm: &dyn Vmm,
    vm: &RefVm,
    timestamp: &str,
    size: &str,
    non_volatile_pv: Option<&str>,
) -> Result<String> {
    with_vm_shut_down(vmm, vm, || {
        let lv = get_disk(vmm, &vm.domain)?;
        wait::wait_for(
            &format!("LV {lv} to close"),
            Duration::from_secs(30),
            Duration::from_secs(1),
            || Ok(!lvm::is_lv_open(&lv)?),
        )?;
        let name = lvm::lvm_snapshot_name(&lv, timestamp);
        lvm::create_lvm_snapshot(&lv, &name, non_volatile_pv, size)?;
        let dir = Path::new(&lv)
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(format!("{dir}/{name}"))
    })
}

/// Take a point-in-time copy of the reference VM's disk.
///
/// The copy-on-write snapshot is taken under a shut-down VM, block-copied
/// to a plain volume, and removed again before `body` runs; `body` receives
/// the writeable copy, which is itself removed if anything later fails.
pub fn with_vm_disk_snapshot<R>(
    vmm: &dyn Vmm,
    ref_vm: &RefVm,
    timestamp: &str,
    size: &str,
    cache_config: Option<&cache::CacheConfig>,
    body: impl FnOnce(&str) -> Result<R>,
) -> Result<R> {
    let nvpv = cache::non_volatile_pv(cache_config);
    with_scope(|scope| {
        let vm_snapshot = Transaction::prepare(
            Some(&format!("Creating disk snapshot of {}", ref_vm.domain)),
            || create_vm_disk_snapshot(vmm, ref_vm, timestamp, size, nvpv),
        )
        .finally(Some("cleaning up disk snapshot"), |snapshot, _| {
            lvm::remove_lv(&snapshot)
        })
        .run(|lvm_snapshot| {
            let name = lvm::vm_snapshot_name(
                &Path::new(lvm_snapshot.as_str())
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| lvm_snapshot.clone()),
            );
            let copy = lvm::volume_copy(scope, lvm_snapshot, &name, nvpv)?;
            lvm::copy_data(lvm_snapshot, &copy)?;
            Ok(copy)
        })?;
        body(&vm_snapshot)
    })
}

/// Reset the test VM back if anything in the scope fails; a failed test
/// boot must not leave the VM wedged on the broken snapshot.
pub fn reset_back_on_failure<'s>(scope: &mut Scope<'s>, vmm: &'s dyn Vmm, vm: &RefVm) {
    let domain = vm.domain.clone();
    scope.on_failure("resetting test vm", move || vmm.reset(&domain));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domblklist_extracts_disk_sources() {
        let output = "\
 Type   Device   Target   Source
---------------------------------------------------------
 file   disk     vda      /var/lib/libvirt/images/ref.qcow2
 file   cdrom    sda      -
";
        assert_eq!(
            parse_domblklist(output),
            vec!["/var/lib/libvirt/images/ref.qcow2"]
        );
    }

    #[test]
    fn single_disk_is_required() {
        struct TwoDisks;
        impl Vmm for TwoDisks {
            fn is_vm_running(&self, _domain: &str) -> Result<bool> {
                Ok(true)
            }
            fn start(&self, _domain: &str) -> Result<()> {
                Ok(())
            }
            fn reset(&self, _domain: &str) -> Result<()> {
                Ok(())
            }
            fn disks(&self, _domain: &str) -> Result<Vec<String>> {
                Ok(vec!["/dev/vg0/a".to_string(), "/dev/vg0/b".to_string()])
            }
        }
        assert!(get_disk(&TwoDisks, "ref").is_err());
    }
}
