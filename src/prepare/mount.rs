//! Mount scopes and chroot assembly.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::core::process;
use crate::core::transact::{Scope, with_scope};
use crate::error::{Error, Result};

/// Mount `device` on `mountpoint` for the duration of the scope.
///
/// `device` of `None` mounts a pseudo filesystem (`-t` given by `type_`).
pub fn mount_into(
    scope: &mut Scope<'_>,
    device: Option<&str>,
    mountpoint: &Path,
    type_: Option<&str>,
    options: &[&str],
) -> Result<()> {
    if !mountpoint.exists() {
        return Err(Error::stage(
            "mount",
            format!("{} does not exist", mountpoint.display()),
        ));
    }

    let mut cmdline = vec!["mount".to_string()];
    if let Some(type_) = type_ {
        cmdline.push("-t".to_string());
        cmdline.push(type_.to_string());
    }
    for option in options {
        cmdline.push(option.to_string());
    }
    cmdline.push(device.unwrap_or("none").to_string());
    cmdline.push(mountpoint.to_string_lossy().into_owned());

    info!(
        "Mounting {} to {}",
        device.unwrap_or("none"),
        mountpoint.display()
    );
    process::run_checked(&cmdline)?;

    let umount_target = mountpoint.to_path_buf();
    scope.always(
        format!("unmounting {}", umount_target.display()),
        move || {
            process::run_checked(&[
                "umount".to_string(),
                umount_target.to_string_lossy().into_owned(),
            ])
        },
    );
    Ok(())
}

/// Mount `partition` as a chroot root with proc, sys and dev plumbed in,
/// and run `body` against the root path. Everything is unmounted and the
/// temporary root removed on every exit path.
pub fn with_chroot<R>(partition: &str, body: impl FnOnce(&Path) -> Result<R>) -> Result<R> {
    with_scope(|scope| {
        let tempdir = tempfile::Builder::new()
            .prefix("snapshot_root_")
            .tempdir()
            .map_err(|err| Error::io("Failed to create", "snapshot_root_", err))?;
        let root: PathBuf = tempdir.path().to_path_buf();
        // Pushed first so the directory is deleted only after the mounts
        // below are gone.
        scope.always("removing temporary chroot root", move || {
            tempdir.close().map_err(|err| {
                Error::io("Failed to remove", "snapshot_root_", err)
            })
        });

        mount_into(scope, Some(partition), &root, None, &[])?;
        mount_into(scope, None, &root.join("proc"), Some("proc"), &[])?;
        mount_into(scope, None, &root.join("sys"), Some("sysfs"), &[])?;
        mount_into(scope, Some("/dev"), &root.join("dev"), None, &["--bind"])?;
        mount_into(
            scope,
            Some("/dev/pts"),
            &root.join("dev").join("pts"),
            None,
            &["--bind"],
        )?;
        body(&root)
    })
}

/// Copy the contents of each directory in `to_copy` into `root`,
/// overwriting existing files.
pub fn copy_files(root: &Path, to_copy: &[PathBuf]) -> Result<()> {
    for dir in to_copy {
        info!("Copying contents of {} to {}", dir.display(), root.display());
        if !dir.is_dir() {
            return Err(Error::stage(
                "mount",
                format!("{} is not a directory", dir.display()),
            ));
        }
        copy_tree(dir, root)?;
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let entries = fs::read_dir(from).map_err(|err| Error::io("Failed to list", from, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| Error::io("Failed to list", from, err))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let kind = entry
            .file_type()
            .map_err(|err| Error::io("Failed to stat", &src, err))?;
        if kind.is_dir() {
            fs::create_dir_all(&dst).map_err(|err| Error::io("Failed to create", &dst, err))?;
            copy_tree(&src, &dst)?;
        } else {
            if dst.exists() {
                debug!("Overwriting {} with {}", dst.display(), src.display());
            } else {
                debug!("Copying {} to {}", src.display(), dst.display());
            }
            fs::copy(&src, &dst).map_err(|err| Error::io("Failed to copy", &src, err))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_files_merges_trees_and_overwrites() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        fs::create_dir_all(src.path().join("etc/deeper")).unwrap();
        fs::write(src.path().join("etc/motd"), "fresh").unwrap();
        fs::write(src.path().join("etc/deeper/file"), "nested").unwrap();

        fs::create_dir_all(dst.path().join("etc")).unwrap();
        fs::write(dst.path().join("etc/motd"), "stale").unwrap();

        copy_files(dst.path(), &[src.path().to_path_buf()]).unwrap();
        assert_eq!(
            fs::read_to_string(dst.path().join("etc/motd")).unwrap(),
            "fresh"
        );
        assert_eq!(
            fs::read_to_string(dst.path().join("etc/deeper/file")).unwrap(),
            "nested"
        );
    }

    #[test]
    fn copy_files_rejects_missing_source() {
        let dst = tempfile::tempdir().unwrap();
        let missing = dst.path().join("nope");
        assert!(copy_files(dst.path(), &[missing]).is_err());
    }
}
