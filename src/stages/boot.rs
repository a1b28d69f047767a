//! Boot-property stages.
//!
//! The `boot` property on the config service selects what a host boots
//! into: empty for the default, `grub.cow` for local Linux, `grub.<label>`
//! for local Windows, `cow-m` for the network COW memory image. Rollback
//! always restores the default.

use crate::clients::config;
use crate::core::host::Host;
use crate::core::options::{OptDef, Parsed};
use crate::core::stage::{SimpleStage, StageCore, StageExec};
use crate::error::Result;

pub const BOOT_PROP: &str = "boot";
pub const LOCAL_COW: &str = "grub.cow";
pub const COW_MEMORY: &str = "cow-m";
pub const DEFAULT: &str = "";

pub fn boots_to_local_linux_by_default(host: &Host) -> bool {
    host.prop_str(BOOT_PROP) == Some(LOCAL_COW)
}

pub fn boots_to_windows_by_default(host: &Host) -> bool {
    match host.prop_str(BOOT_PROP) {
        Some(value) => value.starts_with("grub.") && value != LOCAL_COW,
        None => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    CowMemory,
    LocalLinux,
    LocalWindows,
    Default,
}

pub struct ConfigureBoot {
    config_url: String,
    target: Target,
    value: String,
}

impl ConfigureBoot {
    fn new(target: Target) -> Self {
        ConfigureBoot {
            config_url: String::new(),
            target,
            value: String::new(),
        }
    }

    /// `SetBootIntoCOWMemory`: enable boot to the COW memory image.
    pub fn into_cow_memory() -> StageExec {
        StageExec::Simple(Box::new(ConfigureBoot::new(Target::CowMemory)))
    }

    /// `SetBootIntoLocalLinux`.
    pub fn into_local_linux() -> StageExec {
        StageExec::Simple(Box::new(ConfigureBoot::new(Target::LocalLinux)))
    }

    /// `SetBootIntoLocalWindows`: boots `grub.<label>` with the label from
    /// `-wp`.
    pub fn into_local_windows() -> StageExec {
        StageExec::Simple(Box::new(ConfigureBoot::new(Target::LocalWindows)))
    }

    /// `ResetBoot`: restore the default boot state.
    pub fn reset() -> StageExec {
        StageExec::Simple(Box::new(ConfigureBoot::new(Target::Default)))
    }

    fn set(&self, host: &Host, value: &str) -> Result<()> {
        config::set_props(&self.config_url, &host.name, &[(BOOT_PROP, value)])
    }
}

impl StageCore for ConfigureBoot {
    fn brief(&self) -> &'static str {
        match self.target {
            Target::CowMemory => "enable boot to COW memory image",
            Target::LocalLinux => "enable boot to local Linux",
            Target::LocalWindows => "enable boot to local Windows",
            Target::Default => "reset boot into its default state",
        }
    }

    fn options(&self) -> Vec<OptDef> {
        let mut defs = vec![super::basic::config_url_option()];
        if self.target == Target::LocalWindows {
            defs.push(
                OptDef::single("wp", "LABEL", "Windows root partition label")
                    .with_default("windows10"),
            );
        }
        defs
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.config_url = args.one("c")?.to_string();
        self.value = match self.target {
            Target::CowMemory => COW_MEMORY.to_string(),
            Target::LocalLinux => LOCAL_COW.to_string(),
            Target::LocalWindows => format!("grub.{}", args.one("wp")?),
            Target::Default => DEFAULT.to_string(),
        };
        Ok(())
    }
}

impl SimpleStage for ConfigureBoot {
    fn run_host(&self, host: &mut Host) -> Result<()> {
        self.set(host, &self.value)
    }

    fn rollback_host(&self, host: &Host) -> Result<()> {
        self.set(host, DEFAULT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn host_booting(value: Option<&str>) -> Host {
        let mut props = Map::new();
        if let Some(value) = value {
            props.insert(BOOT_PROP.to_string(), Value::String(value.to_string()));
        }
        Host::new("h1", "h1", props)
    }

    #[test]
    fn default_boot_classification() {
        assert!(boots_to_local_linux_by_default(&host_booting(Some(
            "grub.cow"
        ))));
        assert!(boots_to_windows_by_default(&host_booting(Some(
            "grub.windows10"
        ))));
        assert!(!boots_to_windows_by_default(&host_booting(Some(
            "grub.cow"
        ))));
        assert!(!boots_to_windows_by_default(&host_booting(None)));
        assert!(!boots_to_local_linux_by_default(&host_booting(Some("cow-m"))));
    }
}
