//! COW snapshot content preparation: preconditions, timestamping, chroot
//! configuration and kernel image publication.

use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::core::process;
use crate::core::transact::Scope;
use crate::error::{Error, Result};
use crate::prepare::linux;
use crate::prepare::vm::{RefVm, Vmm};

/// Partition naming scheme for a COW installation, loaded from a JSON
/// config file.
#[derive(Clone, Debug, Deserialize)]
pub struct CowPartitionsConfig {
    pub base: String,
    pub network: String,
    pub local: String,
    pub cow: String,
    pub conf: String,
    pub sign: String,
    pub keyimage: String,
    pub place: String,
}

impl CowPartitionsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|err| Error::io("Failed to read", path, err))?;
        serde_json::from_str(&contents).map_err(|err| Error::Json {
            context: format!("partitions config {}", path.display()),
            source: err,
        })
    }

    /// Key/value pairs in declaration order, mirrored into `cow.conf`.
    pub fn pairs(&self) -> [(&'static str, &str); 8] {
        [
            ("base", &self.base),
            ("network", &self.network),
            ("local", &self.local),
            ("cow", &self.cow),
            ("conf", &self.conf),
            ("sign", &self.sign),
            ("keyimage", &self.keyimage),
            ("place", &self.place),
        ]
    }
}

/// The reference VM must be running and its host reachable before a
/// snapshot makes sense.
pub fn check_preconditions(vmm: &dyn Vmm, ref_vm: &RefVm) -> Result<()> {
    if !vmm.is_vm_running(&ref_vm.domain)? {
        return Err(Error::stage(
            "prepare",
            format!("Reference vm {} is not running", ref_vm.domain),
        ));
    }
    if !linux::is_accessible(&ref_vm.host)? {
        return Err(Error::stage(
            "prepare",
            format!("Reference host {} is not accessible with ssh", ref_vm.host),
        ));
    }
    Ok(())
}

/// Timestamp in the `YYYY-MM-DD-HH-MM-SS` form used in snapshot names and
/// `/etc/timestamp`.
pub fn generate_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format!(
        "{:04}-{:02}-{:02}-{:02}-{:02}-{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

pub fn write_timestamp(root: &Path, timestamp: &str) -> Result<()> {
    let path = root.join("etc").join("timestamp");
    fs::write(&path, format!("{timestamp}\n"))
        .map_err(|err| Error::io("Failed to write", &path, err))
}

/// Write `/etc/cow.conf`: a bash associative array mirroring the partitions
/// config.
pub fn write_cow_config(partitions: &CowPartitionsConfig, root: &Path) -> Result<()> {
    let path = root.join("etc").join("cow.conf");
    info!("Writing cow config to {}", path.display());
    let mut contents = String::from("declare -A PARTITION_NAMES\n");
    for (key, value) in partitions.pairs() {
        contents.push_str(&format!("PARTITION_NAMES[{key}]={value}\n"));
    }
    fs::write(&path, contents).map_err(|err| Error::io("Failed to write", &path, err))
}

pub fn run_chroot_script(root: &Path, script: Option<&Path>) -> Result<()> {
    if let Some(script) = script {
        info!(
            "Running chroot script {} in {}",
            script.display(),
            root.display()
        );
        process::run_checked(&[
            "chroot".to_string(),
            root.to_string_lossy().into_owned(),
            script.to_string_lossy().into_owned(),
        ])?;
    }
    Ok(())
}

/// Artifacts directory for one snapshot under the output tree.
pub fn snapshot_artifacts_path(output: &Path, snapshot_disk: &str) -> PathBuf {
    let basename = Path::new(snapshot_disk)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| snapshot_disk.to_string());
    output.join(basename)
}

/// Create the artifacts directory; removed again if the scope fails.
pub fn snapshot_artifacts(
    scope: &mut Scope<'_>,
    output: &Path,
    snapshot_disk: &str,
) -> Result<PathBuf> {
    let path = snapshot_artifacts_path(output, snapshot_disk);
    if path.exists() {
        return Err(Error::stage(
            "prepare",
            format!("artifacts directory {} already exists", path.display()),
        ));
    }
    info!("Creating snapshot artifacts directory {}", path.display());
    fs::create_dir_all(&path).map_err(|err| Error::io("Failed to create", &path, err))?;

    let doomed = path.clone();
    scope.on_failure(
        format!("cleaning up artifacts directory {}", doomed.display()),
        move || {
            error!(
                "Exception while using artifacts directory {}, cleaning up",
                doomed.display()
            );
            fs::remove_dir_all(&doomed).map_err(|err| Error::io("Failed to remove", &doomed, err))
        },
    );
    Ok(path)
}

/// Copy `vmlinuz` and `initrd.img` out of the chroot into the artifacts
/// directory, returning their new paths.
pub fn publish_kernel_images(root: &Path, artifacts: &Path) -> Result<(PathBuf, PathBuf)> {
    info!("Publishing kernel images to {}", artifacts.display());
    let mut published = Vec::new();
    for file in ["vmlinuz", "initrd.img"] {
        let src = root.join(file);
        let dst = artifacts.join(file);
        fs::copy(&src, &dst).map_err(|err| Error::io("Failed to copy", &src, err))?;
        published.push(dst);
    }
    let initrd = published.pop().unwrap_or_default();
    let kernel = published.pop().unwrap_or_default();
    Ok((kernel, initrd))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions() -> CowPartitionsConfig {
        CowPartitionsConfig {
            base: "base".to_string(),
            network: "network".to_string(),
            local: "local".to_string(),
            cow: "cow".to_string(),
            conf: "conf".to_string(),
            sign: "sign".to_string(),
            keyimage: "keyimage".to_string(),
            place: "place".to_string(),
        }
    }

    #[test]
    fn cow_config_declares_associative_array() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("etc")).unwrap();
        write_cow_config(&partitions(), root.path()).unwrap();

        let contents = fs::read_to_string(root.path().join("etc/cow.conf")).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("declare -A PARTITION_NAMES"));
        assert!(contents.contains("PARTITION_NAMES[base]=base"));
        assert!(contents.contains("PARTITION_NAMES[network]=network"));
        assert_eq!(contents.lines().count(), 9);
    }

    #[test]
    fn timestamp_file_is_single_line() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("etc")).unwrap();
        write_timestamp(root.path(), "2026-08-01-12-34-56").unwrap();
        assert_eq!(
            fs::read_to_string(root.path().join("etc/timestamp")).unwrap(),
            "2026-08-01-12-34-56\n"
        );
    }

    #[test]
    fn generated_timestamp_matches_format() {
        let stamp = generate_timestamp();
        assert_eq!(stamp.len(), 19);
        let dashes: Vec<usize> = stamp
            .char_indices()
            .filter(|(_, c)| *c == '-')
            .map(|(i, _)| i)
            .collect();
        assert_eq!(dashes, vec![4, 7, 10, 13, 16]);
    }

    #[test]
    fn artifacts_directory_must_be_fresh() {
        let output = tempfile::tempdir().unwrap();
        let result = crate::core::transact::with_scope(|scope| {
            snapshot_artifacts(scope, output.path(), "/dev/vg0/snap")?;
            Ok(())
        });
        assert!(result.is_ok());
        // Success keeps the directory in place, and a second take refuses.
        assert!(output.path().join("snap").exists());
        let again = crate::core::transact::with_scope(|scope| {
            snapshot_artifacts(scope, output.path(), "/dev/vg0/snap")?;
            Ok(())
        });
        assert!(again.is_err());
    }
}
