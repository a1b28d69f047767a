//! Shipped deployment methods.

use crate::core::method::Method;
use crate::stages::ssh::StepTotal;
use crate::stages::{amt, basic, boot::ConfigureBoot, config, disk, ndd, network, redird, ssh};

/// Deploy machines that already carry a provisioned system: boot them into
/// the COW memory image, stream the new image over, customise it, then
/// bring them up in the freshly written OS.
fn simple() -> Method {
    Method::new(
        "simple",
        "method for deploying pre-configured machines",
        vec![
            basic::InitHosts::stage(),
            basic::ExcludeBannedHosts::stage(),
            ssh::check_is_accessible(StepTotal::TINY),
            ConfigureBoot::into_cow_memory(),
            ssh::reboot_host(StepTotal::TINY),
            ssh::wait_until_cow_memory(StepTotal::NORMAL),
            ConfigureBoot::reset(),
            config::StoreCOWConfig::stage(),
            network::EnsureNetworkSpeed::stage(),
            ndd::RunNDD::stage(),
            config::CustomizeWindowsSetup::stage(),
            ConfigureBoot::into_local_windows(),
            ssh::reboot_linux_host(StepTotal::TINY),
            ssh::wait_until_local_windows(StepTotal::BIG),
            ConfigureBoot::reset(),
            ssh::reboot_windows_host(StepTotal::TINY),
            ssh::check_is_accessible(StepTotal::NORMAL),
        ],
    )
}

/// Deploy a local Linux image: stream it over from the COW memory image,
/// boot it once to verify, then hand the host back to whatever it boots by
/// default.
fn linux() -> Method {
    Method::new(
        "linux",
        "method for deploying machines into local Linux",
        vec![
            basic::InitHosts::stage(),
            basic::ExcludeBannedHosts::stage(),
            ssh::check_is_accessible(StepTotal::TINY),
            ConfigureBoot::into_cow_memory(),
            ssh::reboot_host(StepTotal::TINY),
            ssh::wait_until_cow_memory(StepTotal::NORMAL),
            ConfigureBoot::reset(),
            config::StoreCOWConfig::stage(),
            network::EnsureNetworkSpeed::stage(),
            ndd::RunNDD::stage(),
            ConfigureBoot::into_local_linux(),
            ssh::reboot_linux_host(StepTotal::TINY),
            ssh::wait_until_local_linux(StepTotal::NORMAL),
            ConfigureBoot::reset(),
            ssh::maybe_reboot_local_linux(StepTotal::TINY),
            ssh::check_is_accessible(StepTotal::NORMAL),
        ],
    )
}

/// Deploy dark machines through their AMT controllers: power them up, boot
/// the deployment image over IDE-R, wipe and re-image the disk.
fn amt() -> Method {
    Method::new(
        "amt",
        "method for deploying machines via AMT",
        vec![
            basic::InitHosts::stage(),
            basic::ExcludeBannedHosts::stage(),
            amt::DetermineAMTHosts::stage(),
            redird::EnsureRedirectionPossible::stage(),
            amt::WakeupAMTHosts::stage(),
            redird::EnableRedirection::stage(),
            amt::ResetAMTHosts::stage(),
            ssh::wait_until_cow_memory(StepTotal::BIG),
            redird::DisableRedirection::stage(),
            disk::FreeDisk::stage(),
            disk::ConfigureDisk::stage(),
            ndd::RunNDD::stage(),
            ConfigureBoot::reset(),
        ],
    )
}

/// Every method this build knows about, in presentation order.
pub fn all() -> Vec<Method> {
    vec![simple(), linux(), amt()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_are_unique() {
        let methods = all();
        let mut names: Vec<&str> = methods.iter().map(|m| m.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), methods.len());
    }

    #[test]
    fn simple_method_starts_with_host_initialisation() {
        let methods = all();
        let simple = methods.iter().find(|m| m.name == "simple").unwrap();
        assert_eq!(simple.stages[0].brief(), "get initial host list");
        assert!(simple.stages.len() > 10);
    }

    #[test]
    fn linux_method_deploys_and_restores_default_boot() {
        let methods = all();
        let linux = methods.iter().find(|m| m.name == "linux").unwrap();
        let briefs: Vec<&str> = linux.stages.iter().map(|stage| stage.brief()).collect();
        assert!(briefs.contains(&"enable boot to local Linux"));
        assert!(briefs.contains(&"wait until host has booted into local Linux"));
        // The host goes back to its default OS at the end.
        assert_eq!(
            briefs[briefs.len() - 2],
            "reboot host booted into local Linux if it is not default boot"
        );
    }

    #[test]
    fn selected_subset_narrows_required_flags() {
        let methods = all();
        let simple = methods.into_iter().find(|m| m.name == "simple").unwrap();
        let full_flags: Vec<&str> = simple.required_options().iter().map(|d| d.flag).collect();
        assert!(full_flags.contains(&"l"));

        let subset = simple.select(&[0, 1]).unwrap();
        let flags: Vec<&str> = subset.required_options().iter().map(|d| d.flag).collect();
        assert!(flags.contains(&"c"));
        assert!(flags.contains(&"b"));
        assert!(!flags.contains(&"l"));
    }
}
