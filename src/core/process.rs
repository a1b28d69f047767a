//! Local and remote command execution.
//!
//! Everything the engine does to the outside world besides file-system and
//! HTTP access goes through these helpers. `run_local` never treats a
//! non-zero exit as an error; callers decide what the code means. The
//! checked variants are for flows where non-zero exit is always fatal.

use std::process::{Command, Stdio};

use log::info;

use crate::error::{Error, Result};

/// SSH client options applied to every remote invocation.
const SSH_BASE_OPTIONS: [&str; 4] = [
    "-o",
    "PasswordAuthentication=no",
    "-o",
    "BatchMode=yes",
];

fn render(argv: &[String]) -> String {
    argv.join(" ")
}

/// Run a local command, logging stderr lines, returning exit code and stdout.
pub fn run_local(argv: &[String]) -> Result<(i32, String)> {
    info!("running {argv:?}");
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|err| Error::Spawn {
            command: render(argv),
            source: err,
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines() {
        info!("stderr: {line}");
    }

    let code = output.status.code().unwrap_or(-1);
    Ok((code, String::from_utf8_lossy(&output.stdout).into_owned()))
}

/// Run a local command, failing on non-zero exit.
pub fn run_checked(argv: &[String]) -> Result<()> {
    let (code, _) = run_local(argv)?;
    if code != 0 {
        return Err(Error::CommandFailed {
            command: render(argv),
            status: code,
        });
    }
    Ok(())
}

/// Run a local command, failing on non-zero exit, returning stdout.
pub fn output_checked(argv: &[String]) -> Result<String> {
    let (code, stdout) = run_local(argv)?;
    if code != 0 {
        return Err(Error::CommandFailed {
            command: render(argv),
            status: code,
        });
    }
    Ok(stdout)
}

/// Build the ssh command line for `host`/`login`.
///
/// The remote command is carried as a single shell string; no client-side
/// quoting is applied.
pub fn ssh_command(host: &str, login: &str, command: &str, opts: &[String]) -> Vec<String> {
    let mut argv = vec!["ssh".to_string(), "-l".to_string(), login.to_string()];
    argv.extend(SSH_BASE_OPTIONS.iter().map(|s| s.to_string()));
    for opt in opts {
        argv.push("-o".to_string());
        argv.push(opt.clone());
    }
    argv.push(host.to_string());
    argv.push(command.to_string());
    argv
}

/// Run a command on `host` as `login` over ssh.
pub fn run_ssh(host: &str, login: &str, command: &str, opts: &[String]) -> Result<(i32, String)> {
    run_local(&ssh_command(host, login, command, opts))
}

/// Copy `src` to `dst` on `host` as `login` over scp.
pub fn run_scp(host: &str, login: &str, src: &str, dst: &str) -> Result<(i32, String)> {
    run_local(&[
        "scp".to_string(),
        "-o".to_string(),
        "PasswordAuthentication=no".to_string(),
        src.to_string(),
        format!("{login}@{host}:{dst}"),
    ])
}

/// Bare ssh without a login override, used by the snapshot pipeline where
/// the local root key is authoritative.
pub fn plain_ssh(host: &str, command: &str, opts: &[String]) -> Result<(i32, String)> {
    let mut argv = vec!["ssh".to_string()];
    for opt in opts {
        argv.push("-o".to_string());
        argv.push(opt.clone());
    }
    argv.push(host.to_string());
    argv.push(command.to_string());
    run_local(&argv)
}

/// `plain_ssh` that fails on non-zero exit and returns remote stdout.
pub fn plain_ssh_output(host: &str, command: &str, opts: &[String]) -> Result<String> {
    let (code, output) = plain_ssh(host, command, opts)?;
    if code != 0 {
        return Err(Error::CommandFailed {
            command: format!("ssh {host} {command}"),
            status: code,
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_command_shape() {
        let argv = ssh_command("h1", "root", "id", &["ConnectTimeout=5".to_string()]);
        assert_eq!(
            argv,
            vec![
                "ssh",
                "-l",
                "root",
                "-o",
                "PasswordAuthentication=no",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=5",
                "h1",
                "id",
            ]
        );
    }

    #[test]
    fn run_local_reports_exit_code_without_error() {
        let (code, _) = run_local(&["false".to_string()]).unwrap();
        assert_ne!(code, 0);
        let (code, stdout) = run_local(&["echo".to_string(), "hello".to_string()]).unwrap();
        assert_eq!(code, 0);
        assert_eq!(stdout.trim(), "hello");
    }

    #[test]
    fn run_local_errors_when_binary_is_missing() {
        assert!(run_local(&["/nonexistent/definitely-not-a-binary".to_string()]).is_err());
    }

    #[test]
    fn checked_variants_fail_on_nonzero() {
        assert!(run_checked(&["false".to_string()]).is_err());
        assert!(output_checked(&["true".to_string()]).is_ok());
    }
}
