//! Bulk image transfer with the ndd driver.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::clients::config;
use crate::core::host::Host;
use crate::core::options::{OptDef, Parsed};
use crate::core::process;
use crate::core::stage::{SerialStage, StageCore, StageExec};
use crate::core::state::State;
use crate::core::transact::Transaction;
use crate::error::{Error, Result};
use crate::stages::SshConfig;

const NDD_BIN: &str = "/usr/local/bin/ndd";

/// One `-n` transfer spec: `[HOST:]INPUT[,iarg…]:OUTPUT[,oarg…][+args]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NddSpec {
    pub source: Option<String>,
    pub input: String,
    pub iargs: Vec<String>,
    pub output: String,
    pub oargs: Vec<String>,
    pub args: Option<String>,
}

impl NddSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (io, args) = match spec.split_once('+') {
            Some((io, args)) => (io, Some(args.to_string())),
            None => (spec, None),
        };

        let colons = io.matches(':').count();
        let (source, ispec, ospec) = if colons == 2 {
            let mut parts = io.splitn(3, ':');
            let source = parts.next().unwrap_or_default().to_string();
            (
                Some(source),
                parts.next().unwrap_or_default(),
                parts.next().unwrap_or_default(),
            )
        } else {
            let (ispec, ospec) = io
                .split_once(':')
                .ok_or_else(|| Error::setup(format!("bad ndd spec: {spec}")))?;
            (None, ispec, ospec)
        };

        let mut iparts = ispec.split(',').map(str::to_string);
        let input = iparts
            .next()
            .filter(|input| !input.is_empty())
            .ok_or_else(|| Error::setup(format!("bad ndd spec: {spec}")))?;
        let iargs: Vec<String> = iparts.collect();

        let mut oparts = ospec.split(',').map(str::to_string);
        let output = oparts
            .next()
            .filter(|output| !output.is_empty())
            .ok_or_else(|| Error::setup(format!("bad ndd spec: {spec}")))?;
        let oargs: Vec<String> = oparts.collect();

        Ok(NddSpec {
            source,
            input,
            iargs,
            output,
            oargs,
            args,
        })
    }

    /// The partition number requested by a `pN` input argument.
    fn input_partition(&self) -> Result<Option<usize>> {
        let mut partition = None;
        for arg in &self.iargs {
            if let Some(number) = arg.strip_prefix('p') {
                partition = Some(number.parse().map_err(|_| {
                    Error::setup(format!("bad partition input argument: {arg}"))
                })?);
            }
        }
        Ok(partition)
    }
}

/// Destination arguments ordered by the hosts' `switch` property, skipping
/// the transfer source itself.
fn destination_args(hosts: &[&Host], login: &str, exclude: Option<&str>) -> Vec<String> {
    let mut ordered: Vec<&&Host> = hosts.iter().collect();
    ordered.sort_by_key(|host| host.prop_str("switch").map(str::to_string));

    let mut args = Vec::new();
    for host in ordered {
        if exclude == Some(host.name.as_str()) {
            continue;
        }
        args.push("-d".to_string());
        args.push(format!("{login}@{}", host.name));
    }
    args
}

fn kpartx_names(path: &str) -> Result<Vec<String>> {
    let output = process::output_checked(&[
        "kpartx".to_string(),
        "-l".to_string(),
        path.to_string(),
    ])?;
    Ok(output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| format!("/dev/mapper/{name}"))
        .collect())
}

/// Expose the partitions of `path` with kpartx for the duration of `body`,
/// tearing the mappings down on every exit path.
fn with_exposed_partitions<R>(
    path: &str,
    body: impl FnOnce(&[String]) -> Result<R>,
) -> Result<R> {
    let device = resolve_link(Path::new(path));
    let device = device.to_string_lossy().into_owned();
    let partitions = kpartx_names(&device)?;

    info!("Exposing partitions of {device} with kpartx");
    let teardown_device = device.clone();
    Transaction::prepare(None, move || {
        process::run_checked(&[
            "kpartx".to_string(),
            "-a".to_string(),
            "-r".to_string(),
            device.clone(),
        ])
    })
    .finally(
        Some(&format!("Un-exposing partitions of {teardown_device}")),
        move |_, _| {
            let (_, _) = process::run_local(&[
                "kpartx".to_string(),
                "-d".to_string(),
                teardown_device.clone(),
            ])?;
            Ok(())
        },
    )
    .run(|_| body(&partitions))
}

fn resolve_link(path: &Path) -> PathBuf {
    match fs::read_link(path) {
        Ok(target) => match path.parent() {
            Some(parent) => parent.join(target),
            None => target,
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Deploy images to all active hosts with ndd.
#[derive(Default)]
pub struct RunNDD {
    ssh: SshConfig,
    local_addr: String,
    config_url: String,
    port: String,
    specs: Vec<NddSpec>,
}

impl RunNDD {
    pub fn stage() -> StageExec {
        StageExec::Serial(Box::new(RunNDD::default()))
    }

    fn run_spec(&self, spec: &NddSpec, state: &mut State) -> Result<()> {
        let run_transfer = |input: &str, state: &mut State| -> Result<()> {
            let mut cmdline = vec![
                NDD_BIN.to_string(),
                "-p".to_string(),
                self.port.clone(),
                "-i".to_string(),
                input.to_string(),
                "-o".to_string(),
                spec.output.clone(),
            ];

            let remote_source = match &spec.source {
                Some(source) => Some(config::get_host(&self.config_url, source)?.name),
                None => None,
            };
            match &remote_source {
                Some(name) => {
                    cmdline.push("-s".to_string());
                    cmdline.push(format!("{}@{name}", self.ssh.login_linux));
                }
                None => {
                    cmdline.push("--local".to_string());
                    cmdline.push("-s".to_string());
                    cmdline.push(self.local_addr.clone());
                }
            }

            if let Some(args) = &spec.args {
                cmdline.push(format!("-{args}"));
            }

            let hosts: Vec<&Host> = state.active.values().collect();
            cmdline.extend(destination_args(
                &hosts,
                &self.ssh.login_linux,
                remote_source.as_deref(),
            ));

            let (rv, _) = process::run_local(&cmdline)?;
            if rv != 0 {
                for name in state.active_names() {
                    state.fail_host(&name, "deploy the images with ndd", "failed to run ndd");
                }
            }
            Ok(())
        };

        match spec.input_partition()? {
            Some(number) => with_exposed_partitions(&spec.input, |partitions| {
                let partition = partitions.get(number.saturating_sub(1)).ok_or_else(|| {
                    Error::stage(
                        "deploy the images with ndd",
                        format!("{} has no partition {number}", spec.input),
                    )
                })?;
                run_transfer(partition, state)
            }),
            None => run_transfer(&spec.input, state),
        }
    }
}

impl StageCore for RunNDD {
    fn brief(&self) -> &'static str {
        "deploy the images with ndd"
    }

    fn options(&self) -> Vec<OptDef> {
        let mut defs = vec![
            OptDef::single("l", "ADDR", "Local address"),
            OptDef::append(
                "n",
                "{HOST:}?INPUT{,iargs}?:OUTPUT{,oargs}?{+args}?",
                "Deploy local INPUT into OUTPUT on all the hosts with ndd",
            ),
            OptDef::single("np", "PORT", "ndd port to use for transfers").with_default("3634"),
            super::basic::config_url_option(),
        ];
        defs.extend(SshConfig::options());
        defs
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.ssh = SshConfig::bind(args)?;
        self.local_addr = args.one("l")?.to_string();
        self.config_url = args.one("c")?.to_string();
        self.port = args.one("np")?.to_string();
        self.specs = args
            .many("n")
            .iter()
            .map(|spec| NddSpec::parse(spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }
}

impl SerialStage for RunNDD {
    fn run(&self, state: &mut State) -> Result<()> {
        for spec in &self.specs {
            self.run_spec(spec, state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    #[test]
    fn parses_full_spec() {
        let spec = NddSpec::parse("builder:/dev/vg/image,p2:/dev/sda,sync+z").unwrap();
        assert_eq!(spec.source.as_deref(), Some("builder"));
        assert_eq!(spec.input, "/dev/vg/image");
        assert_eq!(spec.iargs, vec!["p2"]);
        assert_eq!(spec.output, "/dev/sda");
        assert_eq!(spec.oargs, vec!["sync"]);
        assert_eq!(spec.args.as_deref(), Some("z"));
        assert_eq!(spec.input_partition().unwrap(), Some(2));
    }

    #[test]
    fn parses_minimal_spec() {
        let spec = NddSpec::parse("/srv/image:/dev/sda").unwrap();
        assert_eq!(spec.source, None);
        assert_eq!(spec.input, "/srv/image");
        assert!(spec.iargs.is_empty());
        assert_eq!(spec.output, "/dev/sda");
        assert_eq!(spec.input_partition().unwrap(), None);
    }

    #[test]
    fn rejects_specs_without_output() {
        assert!(NddSpec::parse("/srv/image").is_err());
        assert!(NddSpec::parse(":/dev/sda").is_err());
    }

    fn host_with_switch(name: &str, switch: &str) -> Host {
        let mut props = Map::new();
        props.insert("switch".to_string(), Value::String(switch.to_string()));
        Host::new(name, name, props)
    }

    #[test]
    fn destinations_are_ordered_by_switch_and_source_is_skipped() {
        let h1 = host_with_switch("h1", "a");
        let h2 = host_with_switch("h2", "c");
        let h3 = host_with_switch("h3", "b");
        let source = host_with_switch("src", "a");
        let hosts = vec![&h1, &h2, &h3, &source];

        let args = destination_args(&hosts, "root", Some("src"));
        assert_eq!(
            args,
            vec!["-d", "root@h1", "-d", "root@h3", "-d", "root@h2"]
        );
    }
}
