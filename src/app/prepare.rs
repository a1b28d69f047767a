//! Snapshot preparation CLI and flows.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};

use crate::core::lock::{self, LockSpec};
use crate::core::transact::with_scope;
use crate::core::wait;
use crate::error::{Error, Result};
use crate::logging;
use crate::prepare::cache::{self, CacheConfig};
use crate::prepare::cow::{self, CowPartitionsConfig};
use crate::prepare::vm::{RefVm, Virsh, Vmm, get_disk, reset_back_on_failure};
use crate::prepare::{disk, ipxe, iscsi, linux, lvm, mount, vm};

#[derive(Debug, Parser)]
#[command(
    name = "praetor-prepare",
    about = "Prepare and publish COW snapshots of a reference VM"
)]
pub struct PrepareCli {
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Lock specified file exclusively while running an update.
    #[arg(short, long, value_name = "FILE")]
    pub lock: Option<PathBuf>,

    #[command(subcommand)]
    pub command: PrepareCommand,
}

#[derive(Debug, Subcommand)]
pub enum PrepareCommand {
    /// Add new snapshot.
    Add(AddArgs),
    /// Cleanup old snapshots.
    Clean(CleanArgs),
    /// Add cache PV to VG and enable cache for all the volumes configured
    /// to use it.
    EnableCache(EnableCacheArgs),
    /// Disable cache for all the cached volumes configured and remove the
    /// cache PV out of the VG.
    DisableCache(DisableCacheArgs),
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(short, long, default_value = "5G")]
    pub snapshot_size: String,

    #[arg(long, value_name = "FILE")]
    pub cache_config: Option<PathBuf>,

    /// Copy the contents of these directories into the snapshot root.
    #[arg(long, value_name = "DIR")]
    pub to_copy: Vec<PathBuf>,

    #[arg(long, value_name = "SCRIPT")]
    pub chroot_script: Option<PathBuf>,

    /// Add symlink to a snapshot copy suitable for deploying to this
    /// location.
    #[arg(long, value_name = "PATH")]
    pub link_snapshot_copy: Option<PathBuf>,

    /// Try to push update to inactive clients.
    #[arg(long)]
    pub push: bool,

    pub ref_vm: String,
    pub ref_host: String,
    pub partitions_config: PathBuf,
    pub output: PathBuf,
    pub test_vm: String,
    pub test_host: String,
}

#[derive(Debug, Args)]
pub struct CleanArgs {
    #[arg(long)]
    pub force_old: bool,

    #[arg(long)]
    pub force_latest: bool,

    #[arg(long, value_name = "FILE")]
    pub cache_config: Option<PathBuf>,

    pub ref_vm: String,
    pub output: PathBuf,
}

#[derive(Debug, Args)]
pub struct EnableCacheArgs {
    pub cache_config: PathBuf,

    /// Shrink cached VG and uncache previously cached volumes if
    /// necessary, useful for system startup scripts.
    #[arg(long)]
    pub cleanup: bool,
}

#[derive(Debug, Args)]
pub struct DisableCacheArgs {
    pub cache_config: PathBuf,
}

/// Replace the command line with the token array from a `--config` JSON
/// file, if one was given.
pub fn effective_args(raw: Vec<String>) -> Result<Vec<String>> {
    let path = match raw.as_slice() {
        [flag, path] if flag == "--config" => path.clone(),
        [token] if token.starts_with("--config=") => {
            token.trim_start_matches("--config=").to_string()
        }
        _ => {
            if raw
                .iter()
                .any(|token| token == "--config" || token.starts_with("--config="))
            {
                return Err(Error::setup("--config is not compatible with other options"));
            }
            return Ok(raw);
        }
    };

    let contents = fs::read_to_string(&path)
        .map_err(|err| Error::setup(format!("failed to read {path}: {err}")))?;
    let tokens: Vec<String> = serde_json::from_str(&contents).map_err(|err| Error::Json {
        context: format!("config file {path}"),
        source: err,
    })?;
    Ok(tokens)
}

/// Run a parsed invocation end to end: logging, optional lock, subcommand.
pub fn execute(cli: PrepareCli) -> Result<()> {
    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    logging::init(logging::Options {
        colored: false,
        level,
        capture: None,
    })?;

    let _lock = match &cli.lock {
        Some(path) => Some(lock::acquire(&LockSpec {
            path: path.clone(),
            shared: false,
        })?),
        None => None,
    };

    match cli.command {
        PrepareCommand::Add(args) => add_snapshot(&args),
        PrepareCommand::Clean(args) => clean_snapshots(&args),
        PrepareCommand::EnableCache(args) => {
            cache::enable_cache(&CacheConfig::load(&args.cache_config)?, args.cleanup)
        }
        PrepareCommand::DisableCache(args) => {
            cache::disable_cache(&CacheConfig::load(&args.cache_config)?)
        }
    }
}

/// Host component of a dynamic session name
/// (`IQN:host_YYYY-MM-DD_HH-MM-SS`).
fn session_hostname(session: &str) -> Result<String> {
    const STAMP_LEN: usize = "_YYYY-MM-DD_HH-MM-SS".len();
    let tail = session
        .rsplit(':')
        .next()
        .filter(|tail| tail.len() > STAMP_LEN)
        .ok_or_else(|| {
            Error::stage(
                "prepare",
                format!("Session name {session} did not match any hostname"),
            )
        })?;
    let (host, stamp) = tail.split_at(tail.len() - STAMP_LEN);
    let separators_ok = stamp.starts_with('_')
        && [5, 8].iter().all(|&i| stamp.as_bytes()[i] == b'-')
        && stamp.as_bytes()[11] == b'_'
        && [14, 17].iter().all(|&i| stamp.as_bytes()[i] == b'-');
    let digits_ok = stamp
        .bytes()
        .enumerate()
        .filter(|(i, _)| ![0usize, 5, 8, 11, 14, 17].contains(i))
        .all(|(_, byte)| byte.is_ascii_digit());
    if !separators_ok || !digits_ok || host.is_empty() {
        return Err(Error::stage(
            "prepare",
            format!("Session name {session} did not match any hostname"),
        ));
    }
    Ok(host.to_string())
}

/// Whether the test VM came back running the new snapshot.
fn booted_properly(test_vm: &RefVm, timestamp: &str) -> Result<bool> {
    if !linux::is_accessible(&test_vm.host)? {
        return Ok(false);
    }
    let output = match crate::core::process::plain_ssh_output(
        &test_vm.host,
        "cat /etc/timestamp",
        &[],
    ) {
        Ok(output) => output,
        Err(err) => {
            warn!("Failed to get timestamp from {}: {err}", test_vm.host);
            return Ok(false);
        }
    };
    if output.trim() != timestamp {
        warn!(
            "Actual timestamp {} is not expected {timestamp}",
            output.trim()
        );
        return Ok(false);
    }
    Ok(true)
}

fn reboot_and_check_test_vm(vmm: &dyn Vmm, test_vm: &RefVm, timestamp: &str) -> Result<()> {
    if linux::is_accessible(&test_vm.host)? {
        linux::reboot(&test_vm.host)?;
    } else {
        warn!("{} is not accessible", test_vm.host);
        vmm.reset(&test_vm.domain)?;
    }

    wait::wait_for(
        &format!("{} to boot the new snapshot", test_vm.host),
        std::time::Duration::from_secs(180),
        std::time::Duration::from_secs(10),
        || booted_properly(test_vm, timestamp),
    )
}

fn get_snapshots(vmm: &dyn Vmm, ref_vm: &RefVm) -> Result<Vec<String>> {
    lvm::list_snapshots(&get_disk(vmm, &ref_vm.domain)?)
}

/// Reboot clients still attached to older snapshots, if nobody is logged
/// in on them.
fn reboot_inactive_clients(vmm: &dyn Vmm, ref_vm: &RefVm, test_vm: &RefVm) -> Result<()> {
    for snapshot in get_snapshots(vmm, ref_vm)? {
        let backstore = iscsi::backstore_name(&snapshot);
        let target = iscsi::target_name(&backstore);
        for session in iscsi::dynamic_sessions(&target)? {
            let host = match session_hostname(&session) {
                Ok(host) => host,
                Err(err) => {
                    warn!("Failed to get hostname from {session}: {err}");
                    continue;
                }
            };
            debug!("Snapshot {snapshot} is used on {host} in session {session}");
            if host != test_vm.host {
                linux::try_reboot_if_idle(&host);
            }
        }
    }
    Ok(())
}

fn add_snapshot(args: &AddArgs) -> Result<()> {
    let vmm = Virsh;
    let ref_vm = RefVm::new(&args.ref_vm, &args.ref_host);
    let test_vm = RefVm::new(&args.test_vm, &args.test_host);
    let partitions = CowPartitionsConfig::load(&args.partitions_config)?;
    let cache_config = match &args.cache_config {
        Some(path) => Some(CacheConfig::load(path)?),
        None => None,
    };

    cow::check_preconditions(&vmm, &ref_vm)?;
    let timestamp = cow::generate_timestamp();

    vm::with_vm_disk_snapshot(
        &vmm,
        &ref_vm,
        &timestamp,
        &args.snapshot_size,
        cache_config.as_ref(),
        |snapshot_disk| {
            with_scope(|scope| {
                info!("Snapshot disk is {snapshot_disk}");
                let artifacts = cow::snapshot_artifacts(scope, &args.output, snapshot_disk)?;

                let disk_info = disk::get_disk_information(snapshot_disk)?;
                if disk_info.configuration.partition_table_type != "gpt" {
                    return Err(Error::stage(
                        "prepare",
                        "VMs must have disk with GPT partition table",
                    ));
                }
                let base = disk::get_partition(snapshot_disk, &disk_info, &partitions.base)?;
                disk::set_partition_name(snapshot_disk, base.number, &partitions.network)?;
                let disk_info = disk::get_disk_information(snapshot_disk)?;
                let network =
                    disk::get_partition(snapshot_disk, &disk_info, &partitions.network)?.clone();

                let (kernel, initrd) = with_scope(|fs_scope| {
                    disk::expose_partitions(fs_scope, snapshot_disk)?;
                    mount::with_chroot(&network.kpartx_name, |root| {
                        mount::copy_files(root, &args.to_copy)?;
                        cow::write_timestamp(root, &timestamp)?;
                        cow::write_cow_config(&partitions, root)?;
                        cow::run_chroot_script(root, args.chroot_script.as_deref())?;
                        cow::publish_kernel_images(root, &artifacts)
                    })
                })?;

                if let Some(link) = &args.link_snapshot_copy {
                    lvm::link_snapshot_copy(
                        scope,
                        snapshot_disk,
                        link,
                        cache::non_volatile_pv(cache_config.as_ref()),
                    )?;
                }
                cache::configure_caching(snapshot_disk, cache_config.as_ref());

                let target = iscsi::publish(scope, snapshot_disk)?;
                let config =
                    ipxe::generate_config(scope, &args.output, &target, &kernel, &initrd)?;

                reset_back_on_failure(scope, &vmm, &test_vm);
                ipxe::publish_config(scope, &args.output, &config, true)?;
                reboot_and_check_test_vm(&vmm, &test_vm, &timestamp)?;
                let published = ipxe::publish_config(scope, &args.output, &config, false)?;
                info!("Published iPXE config to {}", published.display());
                Ok(())
            })
        },
    )?;

    if args.push {
        info!("Pushing update to inactive clients with reboot");
        reboot_inactive_clients(&vmm, &ref_vm, &test_vm)?;
    }
    Ok(())
}

/// Tear one published snapshot down, in reverse publication order.
fn clean_snapshot(
    output: &Path,
    cache_config: Option<&CacheConfig>,
    name: &str,
    force: bool,
) -> Result<()> {
    let backstore = iscsi::backstore_name(name);
    let target = iscsi::target_name(&backstore);
    let sessions = iscsi::dynamic_sessions(&target)?;
    if !sessions.is_empty() {
        warn!("Snapshot {name} has the following dynamic sessions:");
        for session in &sessions {
            warn!("  {session}");
        }
        if !force {
            warn!("Skipping cleanup");
            return Ok(());
        }
        warn!("Continuing as requested");
    }

    let config = ipxe::config_filename(output, &target);
    if config.exists() {
        info!("Cleaning iPXE config at {}", config.display());
        fs::remove_file(&config).map_err(|err| Error::io("Failed to remove", &config, err))?;
    }

    let artifacts = cow::snapshot_artifacts_path(output, name);
    if artifacts.exists() {
        info!("Cleaning snapshot artifacts at {}", artifacts.display());
        fs::remove_dir_all(&artifacts)
            .map_err(|err| Error::io("Failed to remove", &artifacts, err))?;
    }

    if let Err(err) = iscsi::remove_target(&target) {
        warn!("Failed to remove iSCSI target {target}: {err}");
    }
    if let Err(err) = iscsi::remove_backstore(&backstore) {
        warn!("Failed to remove iSCSI backstore {backstore}: {err}");
    }
    iscsi::save_config()?;

    disk::cleanup_kpartx(name)?;

    if let Some(cache_config) = cache_config {
        cache::delete_cache_record(cache_config, name);
    }

    let copy = lvm::snapshot_copy_name(name);
    if Path::new(&copy).exists() {
        info!("Removing snapshot copy {copy}");
        if let Err(err) = lvm::remove_lv(&copy) {
            warn!("Failed to remove snapshot copy {copy}: {err}");
        }
    }

    if lvm::is_lv_open(name)? {
        return Err(Error::stage("prepare", format!("LV {name} is still open")));
    }
    info!("LV {name} is not open, proceeding with remove");
    lvm::remove_lv(name)?;

    let cache_volume = lvm::lv_path(
        Path::new(name)
            .parent()
            .and_then(|dir| dir.file_name())
            .map(|vg| vg.to_string_lossy().into_owned())
            .unwrap_or_default()
            .as_str(),
        &cache::cache_lv_name(
            Path::new(name)
                .file_name()
                .map(|lv| lv.to_string_lossy().into_owned())
                .unwrap_or_default()
                .as_str(),
        ),
    );
    if Path::new(&cache_volume).exists() {
        warn!("Cache volume {cache_volume} still exists, removing");
        lvm::remove_lv(&cache_volume)?;
    }
    Ok(())
}

fn clean_snapshots(args: &CleanArgs) -> Result<()> {
    let vmm = Virsh;
    let ref_vm = RefVm::new(&args.ref_vm, "");
    let cache_config = match &args.cache_config {
        Some(path) => Some(CacheConfig::load(path)?),
        None => None,
    };

    let snapshots = get_snapshots(&vmm, &ref_vm)?;
    let Some((latest, old)) = snapshots.split_last() else {
        return Ok(());
    };

    for snapshot in old {
        clean_snapshot(&args.output, cache_config.as_ref(), snapshot, args.force_old)?;
    }

    if args.force_latest {
        warn!("Removing latest snapshot {latest}");
        clean_snapshot(&args.output, cache_config.as_ref(), latest, true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_hostnames_are_extracted() {
        let session = "iqn.2005-03.org.open-iscsi:client7_2026-08-01_12-34-56";
        assert_eq!(session_hostname(session).unwrap(), "client7");

        assert!(session_hostname("garbage").is_err());
        assert!(session_hostname("iqn:_2026-08-01_12-34-56").is_err());
        assert!(session_hostname("iqn:h_2026-08-01_12-34-5x").is_err());
    }

    #[test]
    fn config_file_replaces_argv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prepare.json");
        fs::write(&path, r#"["add", "ref", "ref.example.org"]"#).unwrap();

        let args = effective_args(vec![
            "--config".to_string(),
            path.to_string_lossy().into_owned(),
        ])
        .unwrap();
        assert_eq!(args, vec!["add", "ref", "ref.example.org"]);

        let conflict = effective_args(vec![
            "--config".to_string(),
            path.to_string_lossy().into_owned(),
            "-v".to_string(),
        ]);
        assert!(conflict.is_err());
    }

    #[test]
    fn cli_parses_add_subcommand() {
        let cli = PrepareCli::try_parse_from([
            "praetor-prepare",
            "-v",
            "add",
            "--snapshot-size",
            "8G",
            "--to-copy",
            "/srv/overlay",
            "--push",
            "ref-vm",
            "ref.example.org",
            "/etc/cow/partitions.json",
            "/srv/tftp",
            "test-vm",
            "test.example.org",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            PrepareCommand::Add(add) => {
                assert_eq!(add.snapshot_size, "8G");
                assert_eq!(add.to_copy, vec![PathBuf::from("/srv/overlay")]);
                assert!(add.push);
                assert_eq!(add.ref_vm, "ref-vm");
                assert_eq!(add.test_host, "test.example.org");
            }
            _ => panic!("expected add"),
        }
    }
}
