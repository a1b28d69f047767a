//! Disk inspection and partition exposure with parted and kpartx.

use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::core::process;
use crate::core::transact::Scope;
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskConfiguration {
    pub path: String,
    pub size: String,
    pub transport: String,
    pub logical_sector_size: u64,
    pub physical_sector_size: u64,
    pub partition_table_type: String,
    pub model: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionConfiguration {
    pub number: u32,
    pub begin: String,
    pub end: String,
    pub size: String,
    pub filesystem_type: String,
    pub name: String,
    pub kpartx_name: String,
    pub flags_set: String,
}

#[derive(Clone, Debug)]
pub struct DiskInformation {
    pub configuration: DiskConfiguration,
    pub partitions: Vec<PartitionConfiguration>,
}

fn config_error(message: &str, device: &str, real_device: &str, output: &str) -> Error {
    Error::stage(
        "disk",
        format!(
            "{message} for device {device} (real device {real_device}). \
             Parted output was: {output}"
        ),
    )
}

/// Remove the kpartx mappings for `device`, retrying with increasing delays
/// while partitions are still in use.
pub fn cleanup_kpartx(device: &str) -> Result<()> {
    let cmdline = vec![
        "kpartx".to_string(),
        "-d".to_string(),
        "-v".to_string(),
        device.to_string(),
    ];
    let delays = [
        Some(Duration::from_millis(100)),
        Some(Duration::from_millis(300)),
        Some(Duration::from_millis(500)),
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(2)),
        Some(Duration::from_secs(3)),
        None,
    ];
    for delay in delays {
        let (rv, output) = process::run_local(&cmdline)?;
        if rv == 0 {
            return Ok(());
        }
        if !output.contains("is in use") {
            return Err(Error::stage(
                "disk",
                format!("Unexpected error from kpartx: {output}"),
            ));
        }
        warn!("Some partitions of {device} are still in use:");
        warn!("{output}");
        if let Some(delay) = delay {
            info!("waiting for {:.01} seconds", delay.as_secs_f64());
            thread::sleep(delay);
        }
    }
    Err(Error::stage(
        "disk",
        format!("Failed to cleanup partitions for {device} with kpartx"),
    ))
}

/// `/dev/mapper` names kpartx would create for each partition number.
fn kpartx_names(device: &str) -> Result<Vec<String>> {
    let cmdline = vec![
        "kpartx".to_string(),
        "-l".to_string(),
        "-s".to_string(),
        device.to_string(),
    ];
    let listing = process::output_checked(&cmdline);
    // `kpartx -l` creates the mappings as a side effect; always undo them.
    let cleanup = cleanup_kpartx(device);
    let listing = listing?;
    if let Err(err) = cleanup {
        warn!("Exception while cleaning up partitions for device {device}: {err}");
    }
    Ok(listing
        .lines()
        .filter_map(|line| line.split(' ').next())
        .map(|name| format!("/dev/mapper/{name}"))
        .collect())
}

/// Expose kpartx mappings for `device` for the duration of the scope.
pub fn expose_partitions(scope: &mut Scope<'_>, device: &str) -> Result<()> {
    info!("Exposing kpartx partitions for {device}");
    process::run_checked(&[
        "kpartx".to_string(),
        "-a".to_string(),
        "-s".to_string(),
        device.to_string(),
    ])?;
    let device = device.to_string();
    scope.always(
        format!("cleaning up partitions for device {device}"),
        move || cleanup_kpartx(&device),
    );
    Ok(())
}

fn parse_partitions(
    device: &str,
    lines: &[&str],
    kpartx: &[String],
) -> Result<Vec<PartitionConfiguration>> {
    let mut partitions = Vec::new();
    for line in lines {
        let line = line.strip_suffix(';').ok_or_else(|| {
            Error::stage("disk", format!("unterminated parted line: {line}"))
        })?;
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 7 {
            return Err(Error::stage(
                "disk",
                format!("unexpected parted partition line: {line}"),
            ));
        }
        let number: u32 = fields[0].parse().map_err(|_| {
            Error::stage("disk", format!("bad partition number in line: {line}"))
        })?;
        let kpartx_name = kpartx
            .get((number as usize).saturating_sub(1))
            .cloned()
            .ok_or_else(|| {
                Error::stage(
                    "disk",
                    format!("no kpartx mapping for partition {number} of {device}"),
                )
            })?;
        partitions.push(PartitionConfiguration {
            number,
            begin: fields[1].to_string(),
            end: fields[2].to_string(),
            size: fields[3].to_string(),
            filesystem_type: fields[4].to_string(),
            name: fields[5].to_string(),
            kpartx_name,
            flags_set: fields[6].to_string(),
        });
    }
    Ok(partitions)
}

/// Parse `parted -s -m DEVICE print` into structured disk information.
pub fn get_disk_information(device: &str) -> Result<DiskInformation> {
    let real_device = std::fs::canonicalize(device)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| device.to_string());
    let output = process::output_checked(&[
        "parted".to_string(),
        "-s".to_string(),
        "-m".to_string(),
        real_device.clone(),
        "print".to_string(),
    ])?;

    let lines: Vec<&str> = output.lines().map(str::trim).collect();
    if lines.len() < 2 {
        return Err(config_error(
            "Expected at least two lines in parted output",
            device,
            &real_device,
            &output,
        ));
    }
    if lines[0] != "BYT;" {
        return Err(config_error(
            "Only \"Bytes\" units are supported",
            device,
            &real_device,
            &output,
        ));
    }

    let spec = lines[1].strip_suffix(';').unwrap_or(lines[1]);
    let fields: Vec<&str> = spec.split(':').collect();
    if fields.len() != 7 || fields[0] != real_device {
        return Err(config_error(
            "Expected device spec as second line of parted output",
            device,
            &real_device,
            &output,
        ));
    }

    let configuration = DiskConfiguration {
        path: fields[0].to_string(),
        size: fields[1].to_string(),
        transport: fields[2].to_string(),
        logical_sector_size: fields[3].parse().map_err(|_| {
            config_error("Bad logical sector size", device, &real_device, &output)
        })?,
        physical_sector_size: fields[4].parse().map_err(|_| {
            config_error("Bad physical sector size", device, &real_device, &output)
        })?,
        partition_table_type: fields[5].to_string(),
        model: fields[6].to_string(),
    };

    let kpartx = kpartx_names(device)?;
    Ok(DiskInformation {
        configuration,
        partitions: parse_partitions(device, &lines[2..], &kpartx)?,
    })
}

/// The unique partition named `name` on `device`.
pub fn get_partition<'a>(
    device: &str,
    disk_info: &'a DiskInformation,
    name: &str,
) -> Result<&'a PartitionConfiguration> {
    let matching: Vec<&PartitionConfiguration> = disk_info
        .partitions
        .iter()
        .filter(|part| part.name == name)
        .collect();
    if matching.len() != 1 {
        return Err(Error::stage(
            "disk",
            format!(
                "Expected exactly one partition with name {name} on device {device}, \
                 got {} candidates",
                matching.len()
            ),
        ));
    }
    Ok(matching[0])
}

/// Rename a GPT partition.
pub fn set_partition_name(device: &str, number: u32, name: &str) -> Result<()> {
    info!("Setting partition name to {name} for partition number {number} on {device}");
    process::run_checked(&[
        "parted".to_string(),
        "-s".to_string(),
        device.to_string(),
        "name".to_string(),
        number.to_string(),
        name.to_string(),
    ])
}

/// Resolve a possibly-symlinked device path the way the rest of the module
/// does.
pub fn realpath(device: &str) -> String {
    std::fs::canonicalize(Path::new(device))
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| device.to_string())
}
