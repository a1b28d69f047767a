//! iPXE boot configuration generation and publication.
//!
//! A per-snapshot config file is generated next to the published kernel
//! images; publication flips the stable `boot.ipxe` symlink at it, going
//! through `boot-test.ipxe` first so a designated test VM can validate the
//! snapshot before clients see it.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::core::transact::Scope;
use crate::error::{Error, Result};
use crate::report::local_fqdn;

/// Path of the per-target iPXE config under `output`.
pub fn config_filename(output: &Path, target: &str) -> PathBuf {
    output.join(format!("{target}.ipxe"))
}

/// Render the boot script: target location, COW parameters, kernel and
/// initrd by path relative to the config file.
pub fn render_config(server: &str, target: &str, kernel: &str, initrd: &str) -> String {
    [
        "#!ipxe".to_string(),
        String::new(),
        format!("set iti {server}"),
        format!("set itn {target}"),
        "set iscsi_params iscsi_target_ip=${iti} iscsi_target_name=${itn}".to_string(),
        "set cow_params cowsrc=network cowtype=${cowtype} root=/dev/mapper/root ${console}"
            .to_string(),
        "set params ${iscsi_params} ${cow_params}".to_string(),
        format!("kernel {kernel} BOOTIF=01-${{netX/mac}} ${{params}} quiet"),
        format!("initrd {initrd}"),
        "boot".to_string(),
        String::new(),
    ]
    .join("\n")
}

fn relative_to<'a>(path: &'a Path, base: &Path) -> &'a Path {
    path.strip_prefix(base).unwrap_or(path)
}

/// Write the per-target config file; removed again if the scope fails.
pub fn generate_config(
    scope: &mut Scope<'_>,
    output: &Path,
    target: &str,
    kernel: &Path,
    initrd: &Path,
) -> Result<PathBuf> {
    let path = config_filename(output, target);
    let contents = render_config(
        &local_fqdn(),
        target,
        &relative_to(kernel, output).to_string_lossy(),
        &relative_to(initrd, output).to_string_lossy(),
    );
    fs::write(&path, contents).map_err(|err| Error::io("Failed to write", &path, err))?;

    let doomed = path.clone();
    scope.on_failure(
        format!("cleaning up iPXE config {}", doomed.display()),
        move || fs::remove_file(&doomed).map_err(|err| Error::io("Failed to remove", &doomed, err)),
    );
    Ok(path)
}

/// Save the current file at `path` as `.old` for the duration of the scope:
/// restored if the scope fails, deleted once it succeeds.
fn save_existing(scope: &mut Scope<'_>, path: &Path) -> Result<()> {
    let old = PathBuf::from(format!("{}.old", path.display()));
    if old.exists() {
        warn!("Old config {} exists, removing", old.display());
        fs::remove_file(&old).map_err(|err| Error::io("Failed to remove", &old, err))?;
    }

    if !path.exists() {
        warn!("{} does not exist", path.display());
        return Ok(());
    }

    fs::rename(path, &old).map_err(|err| Error::io("Failed to rename", path, err))?;

    let restore_to = path.to_path_buf();
    let restore_from = old.clone();
    scope.on_failure(
        format!("Restoring config {} from {}", restore_to.display(), restore_from.display()),
        move || {
            if restore_from.exists() {
                fs::rename(&restore_from, &restore_to)
                    .map_err(|err| Error::io("Failed to rename", &restore_from, err))?;
            }
            Ok(())
        },
    );
    scope.on_success(format!("removing saved config {}", old.display()), move || {
        fs::remove_file(&old).map_err(|err| Error::io("Failed to remove", &old, err))
    });
    Ok(())
}

/// Install `config` as the published boot entry point: `boot-test.ipxe`
/// while testing, `boot.ipxe` for the promotion. The previous file is kept
/// as `.old` until the scope succeeds; on failure the new symlink is
/// removed and the old file restored.
pub fn publish_config(
    scope: &mut Scope<'_>,
    output: &Path,
    config: &Path,
    testing: bool,
) -> Result<PathBuf> {
    let path = output.join(if testing { "boot-test.ipxe" } else { "boot.ipxe" });
    info!(
        "Publishing{} iPXE config to {}",
        if testing { " testing" } else { "" },
        path.display()
    );

    save_existing(scope, &path)?;

    let doomed = path.clone();
    scope.on_failure(format!("removing {}", doomed.display()), move || {
        fs::remove_file(&doomed).map_err(|err| Error::io("Failed to remove", &doomed, err))
    });
    std::os::unix::fs::symlink(config, &path)
        .map_err(|err| Error::io("Failed to symlink", &path, err))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transact::with_scope;

    #[test]
    fn rendered_config_carries_target_and_relative_paths() {
        let rendered = render_config(
            "deploy.example.org",
            "iqn.2013-07.cow.root-at-x-snapshot",
            "root-at-x-snapshot/vmlinuz",
            "root-at-x-snapshot/initrd.img",
        );
        assert!(rendered.starts_with("#!ipxe\n"));
        assert!(rendered.contains("set iti deploy.example.org"));
        assert!(rendered.contains("set itn iqn.2013-07.cow.root-at-x-snapshot"));
        assert!(rendered.contains(
            "kernel root-at-x-snapshot/vmlinuz BOOTIF=01-${netX/mac} ${params} quiet"
        ));
        assert!(rendered.contains("cowsrc=network cowtype=${cowtype} root=/dev/mapper/root"));
        assert!(rendered.contains("initrd root-at-x-snapshot/initrd.img"));
        assert!(rendered.ends_with("boot\n"));
    }

    /// Scenario: promotion fails, the old boot entry point is restored and
    /// the candidate link removed.
    #[test]
    fn failed_publication_restores_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path();
        let config = output.join("iqn.test.ipxe");
        fs::write(&config, "#!ipxe\n").unwrap();
        let current = output.join("boot.ipxe");
        fs::write(&current, "previous contents").unwrap();

        let result: crate::error::Result<()> = with_scope(|scope| {
            publish_config(scope, output, &config, false)?;
            assert!(fs::read_link(output.join("boot.ipxe")).is_ok());
            Err(Error::stage("test", "promotion failed"))
        });
        assert!(result.is_err());

        // The old file is back in place, no symlink and no leftovers.
        assert_eq!(
            fs::read_to_string(output.join("boot.ipxe")).unwrap(),
            "previous contents"
        );
        assert!(!output.join("boot.ipxe.old").exists());
    }

    #[test]
    fn successful_publication_drops_saved_copy() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path();
        let config = output.join("iqn.test.ipxe");
        fs::write(&config, "#!ipxe\n").unwrap();
        fs::write(output.join("boot.ipxe"), "previous contents").unwrap();

        with_scope(|scope| publish_config(scope, output, &config, false)).unwrap();
        assert!(fs::read_link(output.join("boot.ipxe")).is_ok());
        assert!(!output.join("boot.ipxe.old").exists());
    }

    #[test]
    fn first_publication_works_without_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path();
        let config = output.join("iqn.test.ipxe");
        fs::write(&config, "#!ipxe\n").unwrap();

        with_scope(|scope| publish_config(scope, output, &config, true)).unwrap();
        assert!(fs::read_link(output.join("boot-test.ipxe")).is_ok());
    }
}
