//! Network throughput verification.

use std::process::{Command, Stdio};

use crate::core::host::Host;
use crate::core::options::{OptDef, Parsed};
use crate::core::stage::{ParallelStage, Prepared, StageCore, StageExec};
use crate::error::{Error, Result};
use crate::stages::SshConfig;

const MEASURE_SECONDS: u64 = 5;

/// Ensure every host can reach the deployment server at the required
/// throughput. An `iperf -s` daemon runs locally for the duration of the
/// fan-out; each host connects back and the reported rate must reach `-ns`
/// Mbit/s.
pub struct EnsureNetworkSpeed {
    ssh: SshConfig,
    local_addr: String,
    connections: usize,
    minimum: f64,
}

impl EnsureNetworkSpeed {
    pub fn stage() -> StageExec {
        StageExec::Parallel(Box::new(EnsureNetworkSpeed {
            ssh: SshConfig::default(),
            local_addr: String::new(),
            connections: 2,
            minimum: 300.0,
        }))
    }

    /// Parse the 9-field CSV line `iperf -y c` prints and convert the final
    /// bits/s field to Mbit/s.
    fn parse_speed(output: &str) -> Result<f64> {
        let tokens: Vec<&str> = output.trim().split(',').collect();
        if tokens.len() != 9 {
            return Err(Error::host(format!(
                "failed to parse iperf output, it was: {output}"
            )));
        }
        let bits: f64 = tokens[8].parse().map_err(|_| {
            Error::host(format!("failed to parse iperf output, it was: {output}"))
        })?;
        Ok(bits / 1_000_000.0)
    }
}

impl StageCore for EnsureNetworkSpeed {
    fn brief(&self) -> &'static str {
        "ensure sufficient throughput of network interface"
    }

    fn options(&self) -> Vec<OptDef> {
        let mut defs = vec![
            OptDef::single("l", "ADDR", "Local address"),
            OptDef::single("nc", "CONNECTIONS", "Parallel network connections allowed")
                .with_default("2"),
            OptDef::single("ns", "SPEED", "Network speed required on each host, in Mbit/s")
                .with_default("300"),
        ];
        defs.extend(SshConfig::options());
        defs
    }

    fn bind(&mut self, args: &Parsed) -> Result<()> {
        self.ssh = SshConfig::bind(args)?;
        self.local_addr = args.one("l")?.to_string();
        self.connections = args.int("nc")?.max(1) as usize;
        self.minimum = args.int("ns")? as f64;
        Ok(())
    }
}

impl ParallelStage for EnsureNetworkSpeed {
    fn poolsize(&self) -> Option<usize> {
        Some(self.connections)
    }

    fn prepared(&self) -> Result<Prepared> {
        let child = Command::new("iperf")
            .arg("-s")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| Error::stage(self.brief(), format!("failed to start iperf -s: {err}")))?;
        Ok(Prepared::daemon(child))
    }

    fn run_host(&self, host: &Host) -> Result<()> {
        let command = format!(
            "iperf -c {} -t {MEASURE_SECONDS} -y c",
            self.local_addr
        );
        let (rv, output) =
            self.ssh
                .run_ssh(&host.name, &self.ssh.login_linux, &command, &[])?;
        if rv != 0 {
            return Err(Error::host(format!(
                "failed to execute iperf -c, rv is {rv}"
            )));
        }

        let speed = Self::parse_speed(&output)?;
        if speed < self.minimum {
            return Err(Error::host(format!(
                "insufficient network speed: need {} Mbits/s, got {speed} Mbits/s",
                self.minimum
            )));
        }
        if speed < self.minimum * 1.2 {
            host.log().warn(format!(
                "measured network speed for {} is {speed} Mbits/s, which is close to \
                 minimum of {} Mbits/s",
                host.name, self.minimum
            ));
        } else {
            host.log().info(format!(
                "measured network speed for {} is {speed} Mbits/s",
                host.name
            ));
        }
        Ok(())
    }
}
