//! LVM volume management for the snapshot pipeline.

use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::core::process;
use crate::core::transact::Scope;
use crate::error::{Error, Result};

const SNAPSHOT_SUFFIX: &str = "-snapshot";

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

fn dirname(path: &str) -> &str {
    Path::new(path)
        .parent()
        .and_then(|parent| parent.to_str())
        .unwrap_or("")
}

/// Name of the transient copy-on-write snapshot of `origin`.
pub fn lvm_snapshot_name(origin: &str, timestamp: &str) -> String {
    format!("{}-at-{timestamp}", basename(origin))
}

/// Name of the published writeable copy derived from a snapshot name.
pub fn vm_snapshot_name(lvm_snapshot: &str) -> String {
    format!("{lvm_snapshot}{SNAPSHOT_SUFFIX}")
}

/// Name of the deployable copy of a published snapshot.
pub fn snapshot_copy_name(vm_snapshot: &str) -> String {
    format!("{vm_snapshot}-copy")
}

pub fn lv_path(vg: &str, lv: &str) -> String {
    format!("/dev/{vg}/{lv}")
}

/// Published snapshots of `origin`, as full paths sorted by name (the
/// timestamp component makes that chronological).
pub fn list_snapshots(origin: &str) -> Result<Vec<String>> {
    let dir = dirname(origin);
    let prefix = format!("{}-at-", basename(origin));
    let entries = fs::read_dir(dir).map_err(|err| Error::io("Failed to list", dir, err))?;
    let mut snapshots = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| Error::io("Failed to list", dir, err))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(SNAPSHOT_SUFFIX) {
            snapshots.push(format!("{dir}/{name}"));
        }
    }
    snapshots.sort();
    Ok(snapshots)
}

/// Whether the logical volume is open, from the `lvs` attribute string.
pub fn is_lv_open(name: &str) -> Result<bool> {
    info!("Checking if LV {name} is open");
    let output = process::output_checked(&[
        "lvs".to_string(),
        "-o".to_string(),
        "lv_attr".to_string(),
        "--noheadings".to_string(),
        name.to_string(),
    ])?;
    let attrs = output.trim();
    match attrs.chars().nth(5) {
        Some('-') => Ok(false),
        Some('o') => Ok(true),
        _ => Err(Error::stage(
            "lvm",
            format!("Cannot parse LV attributes \"{attrs}\""),
        )),
    }
}

pub fn create_lvm_snapshot(
    origin: &str,
    name: &str,
    non_volatile_pv: Option<&str>,
    size: &str,
) -> Result<()> {
    let mut cmdline = vec![
        "lvcreate".to_string(),
        "-y".to_string(),
        "-s".to_string(),
        "-n".to_string(),
        name.to_string(),
        "-L".to_string(),
        size.to_string(),
        origin.to_string(),
    ];
    if let Some(pv) = non_volatile_pv {
        cmdline.push(pv.to_string());
    }
    process::run_checked(&cmdline)
}

/// Create a plain volume of `size_bytes` bytes, returning its name.
pub fn create_lvm_volume(
    name: &str,
    size_bytes: &str,
    vg: &str,
    pv: Option<&str>,
) -> Result<String> {
    let mut cmdline = vec![
        "lvcreate".to_string(),
        "-y".to_string(),
        "-L".to_string(),
        format!("{size_bytes}B"),
        "-n".to_string(),
        name.to_string(),
        vg.to_string(),
    ];
    if let Some(pv) = pv {
        cmdline.push(pv.to_string());
    }
    process::run_checked(&cmdline)?;
    Ok(name.to_string())
}

pub fn remove_lv(name: &str) -> Result<()> {
    process::run_checked(&[
        "lvremove".to_string(),
        "-f".to_string(),
        name.to_string(),
    ])
}

/// Create `dst` in the same volume group, sized like `src`. Returns the
/// full path of the new volume.
pub fn create_volume_copy(src: &str, dst: &str, non_volatile_pv: Option<&str>) -> Result<String> {
    let size = process::output_checked(&[
        "blockdev".to_string(),
        "--getsize64".to_string(),
        src.to_string(),
    ])?;
    let vg = basename(dirname(src));
    let name = create_lvm_volume(dst, size.trim(), vg, non_volatile_pv)?;
    Ok(format!("{}/{name}", dirname(src)))
}

/// Create a copy volume and arrange for it to be removed if the rest of the
/// scope fails.
pub fn volume_copy(
    scope: &mut Scope<'_>,
    src: &str,
    dst: &str,
    non_volatile_pv: Option<&str>,
) -> Result<String> {
    info!("copying LVM {src} to {dst}");
    let copy = create_volume_copy(src, dst, non_volatile_pv)?;
    let doomed = copy.clone();
    scope.on_failure("cleaning up LVM copy", move || remove_lv(&doomed));
    Ok(copy)
}

/// Block-copy `src` onto `dst`.
pub fn copy_data(src: &str, dst: &str) -> Result<()> {
    info!("Copying data from {src} to {dst}");
    process::run_checked(&[
        "dd".to_string(),
        format!("if={src}"),
        format!("of={dst}"),
        "bs=128M".to_string(),
    ])
}

/// Atomically point the symlink at `dst` to `src`.
pub fn move_link(src: &str, dst: &str) -> Result<()> {
    let staging = format!("{dst}.new");
    let staging_path = Path::new(&staging);
    if staging_path.exists() {
        warn!("{staging} already exists, removing");
        fs::remove_file(staging_path)
            .map_err(|err| Error::io("Failed to remove", staging_path, err))?;
    }
    std::os::unix::fs::symlink(src, staging_path)
        .map_err(|err| Error::io("Failed to symlink", staging_path, err))?;
    fs::rename(staging_path, dst).map_err(|err| Error::io("Failed to rename", dst, err))?;
    Ok(())
}

/// Make a deployable copy of `origin` and, once the whole scope succeeds,
/// flip the `copy_to` symlink to it. The copy is removed if the scope
/// fails.
pub fn link_snapshot_copy(
    scope: &mut Scope<'_>,
    origin: &str,
    copy_to: &Path,
    non_volatile_pv: Option<&str>,
) -> Result<()> {
    let copy_name = snapshot_copy_name(origin);
    let copy = volume_copy(scope, origin, basename(&copy_name), non_volatile_pv)?;
    copy_data(origin, &copy)?;
    let link_target = copy.clone();
    let link = copy_to.to_path_buf();
    scope.on_success(
        format!("linking snapshot copy {copy} to {}", link.display()),
        move || move_link(&link_target, &link.to_string_lossy()),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names_compose() {
        let origin = "/dev/vg0/cow-root";
        let snapshot = lvm_snapshot_name(origin, "2026-08-01-12-00-00");
        assert_eq!(snapshot, "cow-root-at-2026-08-01-12-00-00");
        assert_eq!(
            vm_snapshot_name(&snapshot),
            "cow-root-at-2026-08-01-12-00-00-snapshot"
        );
        assert_eq!(
            snapshot_copy_name(&vm_snapshot_name(&snapshot)),
            "cow-root-at-2026-08-01-12-00-00-snapshot-copy"
        );
        assert_eq!(lv_path("vg0", "lv1"), "/dev/vg0/lv1");
    }

    #[test]
    fn snapshot_listing_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cow-root");
        for name in [
            "cow-root-at-2026-01-02-00-00-00-snapshot",
            "cow-root-at-2026-01-01-00-00-00-snapshot",
            "cow-root-at-2026-01-01-00-00-00",
            "other-at-2026-01-01-00-00-00-snapshot",
        ] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let snapshots = list_snapshots(&base.to_string_lossy()).unwrap();
        let names: Vec<&str> = snapshots
            .iter()
            .map(|path| basename(path))
            .collect();
        assert_eq!(
            names,
            vec![
                "cow-root-at-2026-01-01-00-00-00-snapshot",
                "cow-root-at-2026-01-02-00-00-00-snapshot",
            ]
        );
    }

    #[test]
    fn move_link_replaces_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("current");
        move_link("target-one", &dst.to_string_lossy()).unwrap();
        move_link("target-two", &dst.to_string_lossy()).unwrap();
        assert_eq!(
            fs::read_link(&dst).unwrap().to_string_lossy(),
            "target-two"
        );
    }
}
