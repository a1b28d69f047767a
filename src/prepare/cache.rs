//! LVM cache management for published snapshot volumes.
//!
//! Snapshot copies live on a slow non-volatile PV; a fast cache PV can be
//! attached to speed up client reads. Cache state is recorded as empty
//! marker files so startup scripts can re-attach caches after the cache
//! device comes back.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Deserialize;

use crate::core::process;
use crate::core::transact::{Scope, with_scope};
use crate::error::{Error, Result};
use crate::prepare::lvm;

/// Cache layout, loaded from a JSON config file.
#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    pub volume_group: String,
    pub non_volatile_pv: String,
    pub cache_pv: String,
    pub cache_volume_size: String,
    pub cached_volumes_path: String,
}

impl CacheConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|err| Error::io("Failed to read", path, err))?;
        serde_json::from_str(&contents).map_err(|err| Error::Json {
            context: format!("cache config {}", path.display()),
            source: err,
        })
    }
}

pub fn cache_lv_name(volume: &str) -> String {
    format!("{volume}-cache")
}

/// PV to place snapshot data on, when caching is configured.
pub fn non_volatile_pv(config: Option<&CacheConfig>) -> Option<&str> {
    config.map(|config| config.non_volatile_pv.as_str())
}

fn create_cache_volume(volume: &str, config: &CacheConfig) -> Result<String> {
    let name = cache_lv_name(volume);
    info!("Adding cache volume {name} for {volume}");
    lvm::create_lvm_volume(
        &name,
        &config.cache_volume_size,
        &config.volume_group,
        Some(&config.cache_pv),
    )
}

fn record_file(config: &CacheConfig, volume: &str) -> PathBuf {
    let basename = Path::new(volume)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| volume.to_string());
    Path::new(&config.cached_volumes_path).join(basename)
}

fn create_cache_record(config: &CacheConfig, volume: &str) -> Result<()> {
    let path = record_file(config, volume);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| Error::io("Failed to create", parent, err))?;
    }
    fs::write(&path, "").map_err(|err| Error::io("Failed to write", &path, err))
}

/// Forget that `volume` was cached. Missing records are only warned about.
pub fn delete_cache_record(config: &CacheConfig, volume: &str) {
    let path = record_file(config, volume);
    if let Err(err) = fs::remove_file(&path) {
        warn!("Cache record file {} does not exist: {err}", path.display());
    }
}

fn list_cache_records(config: &CacheConfig) -> Result<Vec<String>> {
    let dir = Path::new(&config.cached_volumes_path);
    let entries = fs::read_dir(dir).map_err(|err| Error::io("Failed to list", dir, err))?;
    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| Error::io("Failed to list", dir, err))?;
        records.push(entry.file_name().to_string_lossy().into_owned());
    }
    records.sort();
    Ok(records)
}

/// Attach a cache volume to `volume` and record it. Failures are logged
/// and leave the volume uncached; the deployment can live without the
/// cache.
pub fn configure_caching(volume: &str, config: Option<&CacheConfig>) {
    let Some(config) = config else {
        info!("Caching is not configured, skipping cache for {volume}");
        return;
    };

    let outcome: Result<()> = with_scope(|scope| {
        let cache_volume = cache_volume(scope, volume, config)?;
        cache_record(scope, volume, config)?;
        info!("Enabling cache for {volume} on {cache_volume}");
        process::run_checked(&[
            "lvconvert".to_string(),
            "-y".to_string(),
            "--type".to_string(),
            "cache".to_string(),
            "--cachevol".to_string(),
            cache_volume,
            "--cachemode".to_string(),
            "writethrough".to_string(),
            volume.to_string(),
        ])
    });
    if let Err(err) = outcome {
        warn!("Failed to enable caching for {volume}: {err}");
    }
}

fn cache_volume(scope: &mut Scope<'_>, volume: &str, config: &CacheConfig) -> Result<String> {
    let name = create_cache_volume(volume, config)?;
    let doomed = name.clone();
    scope.on_failure(format!("removing cache volume for {volume}"), move || {
        lvm::remove_lv(&doomed)
    });
    Ok(name)
}

fn cache_record(scope: &mut Scope<'_>, volume: &str, config: &CacheConfig) -> Result<()> {
    info!("Adding cache record for {volume}");
    create_cache_record(config, volume)?;
    let config = config.clone();
    let volume = volume.to_string();
    scope.on_failure(format!("Deleting cache record for {volume}"), move || {
        delete_cache_record(&config, &volume);
        Ok(())
    });
    Ok(())
}

fn disable_cache_on(volume: &str) {
    info!("Disabling cache on {volume}");
    if let Err(err) = process::run_checked(&[
        "lvconvert".to_string(),
        "--uncache".to_string(),
        volume.to_string(),
    ]) {
        warn!("Failed to disable cache for {volume}: {err}");
    }
}

fn cleanup_cache(config: &CacheConfig) -> Result<()> {
    let vg = &config.volume_group;
    for record in list_cache_records(config)? {
        disable_cache_on(&lvm::lv_path(vg, &record));
    }

    info!("Reducing VG {vg}, removing missing PVs");
    process::run_checked(&[
        "vgreduce".to_string(),
        "--removemissing".to_string(),
        vg.clone(),
    ])?;

    info!("Activating all LVs in VG {vg}");
    process::run_checked(&["vgchange".to_string(), "-ay".to_string(), vg.clone()])
}

/// Create the cache PV, add it to the VG and re-cache every recorded
/// volume. With `cleanup` set, first uncache and repair the VG (used by
/// system startup scripts after the cache device went away).
pub fn enable_cache(config: &CacheConfig, cleanup: bool) -> Result<()> {
    if cleanup {
        cleanup_cache(config)?;
    }

    info!("Creating cache PV {}", config.cache_pv);
    process::run_checked(&[
        "pvcreate".to_string(),
        "-y".to_string(),
        config.cache_pv.clone(),
    ])?;

    info!(
        "Adding cache PV {} to VG {}",
        config.cache_pv, config.volume_group
    );
    process::run_checked(&[
        "vgextend".to_string(),
        config.volume_group.clone(),
        config.cache_pv.clone(),
    ])?;

    for record in list_cache_records(config)? {
        configure_caching(&lvm::lv_path(&config.volume_group, &record), Some(config));
    }
    Ok(())
}

/// Uncache every recorded volume and pull the cache PV out of the VG.
pub fn disable_cache(config: &CacheConfig) -> Result<()> {
    for record in list_cache_records(config)? {
        disable_cache_on(&lvm::lv_path(&config.volume_group, &record));
    }

    info!(
        "Removing cache PV {} from VG {}",
        config.cache_pv, config.volume_group
    );
    if let Err(err) = process::run_checked(&[
        "vgreduce".to_string(),
        config.volume_group.clone(),
        config.cache_pv.clone(),
    ]) {
        warn!("Failed to remove cache PV from VG: {err}");
    }

    info!("Destroying cache PV {}", config.cache_pv);
    if let Err(err) = process::run_checked(&[
        "pvremove".to_string(),
        "-f".to_string(),
        config.cache_pv.clone(),
    ]) {
        warn!("Failed to destroy cache PV: {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> CacheConfig {
        CacheConfig {
            volume_group: "vg0".to_string(),
            non_volatile_pv: "/dev/sdb1".to_string(),
            cache_pv: "/dev/nvme0n1p1".to_string(),
            cache_volume_size: "10G".to_string(),
            cached_volumes_path: dir.to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn cache_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        create_cache_record(&config, "/dev/vg0/snap-a").unwrap();
        create_cache_record(&config, "/dev/vg0/snap-b").unwrap();
        assert_eq!(list_cache_records(&config).unwrap(), vec!["snap-a", "snap-b"]);

        delete_cache_record(&config, "/dev/vg0/snap-a");
        assert_eq!(list_cache_records(&config).unwrap(), vec!["snap-b"]);
        // Deleting a missing record only warns.
        delete_cache_record(&config, "/dev/vg0/snap-a");
    }

    #[test]
    fn cache_config_parses_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(
            &path,
            r#"{"volume_group": "vg0", "non_volatile_pv": "/dev/sdb1",
                "cache_pv": "/dev/nvme0n1p1", "cache_volume_size": "10G",
                "cached_volumes_path": "/var/lib/cow/cached"}"#,
        )
        .unwrap();
        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.volume_group, "vg0");
        assert_eq!(non_volatile_pv(Some(&config)), Some("/dev/sdb1"));
        assert_eq!(non_volatile_pv(None), None);
        assert_eq!(cache_lv_name("snap"), "snap-cache");
    }
}
