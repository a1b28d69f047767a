//! End-of-run email report.
//!
//! When `-r` is given the run log is captured to a temp file; afterwards a
//! multipart message summarising the run is assembled, the log attached as
//! `log.txt`, and the whole thing handed to the local SMTP daemon.

use std::env;
use std::ffi::CStr;
use std::fs;
use std::path::Path;

use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::{Message, SmtpTransport, Transport};
use time::OffsetDateTime;

use crate::core::state::State;
use crate::error::{Error, Result};

/// Best-effort fully qualified name of the local machine.
///
/// Falls back to the bare hostname when the resolver has no canonical name
/// for it.
pub fn local_fqdn() -> String {
    let hostname = match hostname() {
        Some(name) => name,
        None => return "localhost".to_string(),
    };
    canonical_name(&hostname).unwrap_or(hostname)
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rv = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rv != 0 {
        return None;
    }
    buf[buf.len() - 1] = 0;
    let name = unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) };
    let name = name.to_string_lossy().into_owned();
    if name.is_empty() { None } else { Some(name) }
}

fn canonical_name(host: &str) -> Option<String> {
    let node = std::ffi::CString::new(host).ok()?;
    let hints = libc::addrinfo {
        ai_flags: libc::AI_CANONNAME,
        ai_family: libc::AF_UNSPEC,
        ai_socktype: 0,
        ai_protocol: 0,
        ai_addrlen: 0,
        ai_addr: std::ptr::null_mut(),
        ai_canonname: std::ptr::null_mut(),
        ai_next: std::ptr::null_mut(),
    };
    let mut info: *mut libc::addrinfo = std::ptr::null_mut();
    let rv = unsafe { libc::getaddrinfo(node.as_ptr(), std::ptr::null(), &hints, &mut info) };
    if rv != 0 || info.is_null() {
        return None;
    }
    let canonical = unsafe {
        let name = (*info).ai_canonname;
        let result = if name.is_null() {
            None
        } else {
            Some(CStr::from_ptr(name).to_string_lossy().into_owned())
        };
        libc::freeaddrinfo(info);
        result
    };
    canonical.filter(|name| !name.is_empty())
}

fn display_time(at: OffsetDateTime) -> String {
    format!(
        "{} {} {:2} {:02}:{:02}:{:02} {}",
        &at.weekday().to_string()[..3],
        &at.month().to_string()[..3],
        at.day(),
        at.hour(),
        at.minute(),
        at.second(),
        at.year()
    )
}

/// Compose the subject and body for a finished run.
///
/// The subject names the destinations and method; hosts that failed at any
/// point are listed by short name, with per-host stage/reason lines in the
/// body.
pub fn compose(
    method: &str,
    state: &State,
    start: OffsetDateTime,
    finish: OffsetDateTime,
) -> (String, String) {
    let mut destinations: Vec<&str> = state.groups.iter().map(String::as_str).collect();
    destinations.sort_unstable();
    let mut hosts: Vec<&str> = state.hosts.iter().map(String::as_str).collect();
    hosts.sort_unstable();
    destinations.extend(hosts);

    let mut subject = format!(
        "Deployment of \"{}\" with \"{method}\" method finished",
        destinations.join(", ")
    );

    let command_line: Vec<String> = env::args().collect();
    let mut text = format!("Command line: {}.\n", command_line.join(" "));
    text += &format!(
        "\nStart: {}.\nFinish: {}.\n",
        display_time(start),
        display_time(finish)
    );

    if state.active.is_empty() {
        subject += " (ALL failed)";
    } else if !state.all_failed.is_empty() {
        let snames: Vec<&str> = state
            .all_failed
            .values()
            .map(|host| host.sname.as_str())
            .collect();
        subject += &format!(" ({} failed)", snames.join(", "));
    }

    if !state.all_failed.is_empty() {
        text += "\n";
        for host in state.all_failed.values() {
            if let Some((stage, reason)) = &host.failure {
                text += &format!("{} failed, stage: {stage}, reason: {reason}\n", host.name);
            }
        }
    }

    text += "\nSee the attached log for details.";
    (subject, text)
}

/// Send the report to `addresses` via the local SMTP daemon, attaching the
/// captured log.
pub fn send(
    addresses: &[String],
    method: &str,
    state: &State,
    start: OffsetDateTime,
    finish: OffsetDateTime,
    log_path: &Path,
) -> Result<()> {
    let (subject, text) = compose(method, state, start, finish);

    let user = env::var("USER").unwrap_or_else(|_| "root".to_string());
    let from = format!("{user}@{}", local_fqdn());

    let log_contents = fs::read_to_string(log_path)
        .map_err(|err| Error::io("Failed to read captured log", log_path, err))?;

    let mut builder = Message::builder()
        .from(from.parse().map_err(|err| Error::Report {
            message: format!("invalid sender address {from}: {err}"),
        })?)
        .subject(subject);
    for address in addresses {
        builder = builder.to(address.parse().map_err(|err| Error::Report {
            message: format!("invalid recipient address {address}: {err}"),
        })?);
    }

    let message = builder
        .multipart(
            MultiPart::mixed()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(text),
                )
                .singlepart(
                    Attachment::new("log.txt".to_string())
                        .body(log_contents, ContentType::TEXT_PLAIN),
                ),
        )
        .map_err(|err| Error::Report {
            message: format!("failed to assemble message: {err}"),
        })?;

    let sender = SmtpTransport::builder_dangerous("localhost").build();
    sender.send(&message).map_err(|err| Error::Report {
        message: err.to_string(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::host::Host;

    fn state_with_failure() -> State {
        let mut state = State::new(vec!["h2".to_string()], vec!["g1".to_string()]).unwrap();
        state.add_active(Host::new("h1.example.org", "h1", serde_json::Map::new()));
        state.add_active(Host::new("h2.example.org", "h2", serde_json::Map::new()));
        state.fail_host("h1.example.org", "some stage", "broke");
        state.archive_failed();
        state
    }

    #[test]
    fn subject_lists_failed_short_names() {
        let state = state_with_failure();
        let now = OffsetDateTime::UNIX_EPOCH;
        let (subject, text) = compose("simple", &state, now, now);
        assert!(subject.contains("Deployment of \"g1, h2\""));
        assert!(subject.contains("(h1 failed)"));
        assert!(text.contains("h1.example.org failed, stage: some stage, reason: broke"));
    }

    #[test]
    fn subject_marks_total_failure() {
        let mut state = State::new(vec![], vec!["g1".to_string()]).unwrap();
        state.add_active(Host::new("h1.example.org", "h1", serde_json::Map::new()));
        state.fail_host("h1.example.org", "some stage", "broke");
        state.archive_failed();
        let now = OffsetDateTime::UNIX_EPOCH;
        let (subject, _) = compose("simple", &state, now, now);
        assert!(subject.ends_with("(ALL failed)"));
    }
}
