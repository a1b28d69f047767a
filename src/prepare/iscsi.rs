//! iSCSI publication via targetcli.

use std::fs;
use std::path::Path;

use log::info;

use crate::core::process;
use crate::core::transact::Scope;
use crate::error::Result;

/// Backstore name for a published device: the LV basename.
pub fn backstore_name(device: &str) -> String {
    Path::new(device)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.to_string())
}

/// Target IQN derived from a backstore name.
pub fn target_name(backstore: &str) -> String {
    format!("iqn.2013-07.cow.{backstore}")
}

fn targetcli(args: &[&str]) -> Result<()> {
    let mut cmdline = vec!["targetcli".to_string()];
    cmdline.extend(args.iter().map(|arg| arg.to_string()));
    process::run_checked(&cmdline)
}

pub fn remove_backstore(name: &str) -> Result<()> {
    info!("Removing iSCSI backstore {name}");
    targetcli(&["/backstores/block", "delete", name])
}

pub fn remove_target(name: &str) -> Result<()> {
    info!("Removing iSCSI target {name}");
    targetcli(&["/iscsi", "delete", name])
}

fn create_backstore(scope: &mut Scope<'_>, device: &str) -> Result<String> {
    let name = backstore_name(device);
    info!("Adding iSCSI backstore {name}");
    targetcli(&[
        "/backstores/block",
        "create",
        &format!("dev={device}"),
        &format!("name={name}"),
        "readonly=True",
    ])?;
    let doomed = name.clone();
    scope.on_failure(format!("cleaning up iSCSI backstore {name}"), move || {
        remove_backstore(&doomed)
    });
    Ok(name)
}

fn attach_lun(target: &str, backstore: &str) -> Result<()> {
    info!("Adding iSCSI LUN to {target} from {backstore}");
    targetcli(&[
        &format!("/iscsi/{target}/tpg1/luns"),
        "create",
        &format!("/backstores/block/{backstore}"),
    ])
}

fn create_target(scope: &mut Scope<'_>, backstore: &str) -> Result<String> {
    let target = target_name(backstore);
    info!("Adding iSCSI target {target}");
    targetcli(&["/iscsi", "create", &target])?;
    let doomed = target.clone();
    scope.on_failure(format!("cleaning up iSCSI target {target}"), move || {
        remove_target(&doomed)
    });
    attach_lun(&target, backstore)?;
    Ok(target)
}

fn configure_authentication(target: &str) -> Result<()> {
    info!("Configuring iSCSI authentication");
    targetcli(&[
        &format!("/iscsi/{target}/tpg1"),
        "set",
        "attribute",
        "generate_node_acls=1",
    ])
}

pub fn save_config() -> Result<()> {
    info!("Saving iSCSI configuration");
    targetcli(&["saveconfig"])
}

/// Publish `device` read-only over iSCSI: backstore, target with one LUN,
/// open node ACLs, persisted configuration. The whole set is unwound (and
/// the configuration re-saved) if the scope later fails.
pub fn publish(scope: &mut Scope<'_>, device: &str) -> Result<String> {
    scope.on_failure("saving iSCSI config", save_config);
    let backstore = create_backstore(scope, device)?;
    let target = create_target(scope, &backstore)?;
    configure_authentication(&target)?;
    save_config()?;
    Ok(target)
}

/// Initiators currently attached to `target` through dynamic sessions.
pub fn dynamic_sessions(target: &str) -> Result<Vec<String>> {
    let path = format!("/sys/kernel/config/target/iscsi/{target}/tpgt_1/dynamic_sessions");
    dynamic_sessions_from(Path::new(&path))
}

fn dynamic_sessions_from(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read(path)
        .map_err(|err| crate::error::Error::io("Failed to read", path, err))?;
    let contents = String::from_utf8_lossy(&contents);
    Ok(contents
        .split('\0')
        .map(str::trim)
        .filter(|session| !session.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_name_embeds_backstore() {
        let backstore = backstore_name("/dev/vg0/cow-root-at-2026-08-01-12-00-00-snapshot");
        assert_eq!(backstore, "cow-root-at-2026-08-01-12-00-00-snapshot");
        assert_eq!(
            target_name(&backstore),
            "iqn.2013-07.cow.cow-root-at-2026-08-01-12-00-00-snapshot"
        );
    }

    #[test]
    fn sessions_file_is_nul_separated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dynamic_sessions");
        fs::write(&path, b"iqn.x:h1_2026-01-01_00-00-00\0iqn.x:h2_2026-01-01_00-00-00\0\0").unwrap();
        let sessions = dynamic_sessions_from(&path).unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions[1].ends_with("h2_2026-01-01_00-00-00"));
    }

    #[test]
    fn missing_sessions_file_means_no_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = dynamic_sessions_from(&dir.path().join("nope")).unwrap();
        assert!(sessions.is_empty());
    }
}
