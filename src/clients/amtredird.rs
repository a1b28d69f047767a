//! Client for the amtredird IDE-R redirection daemon.
//!
//! `GET {base}/list` answers `[0, [amt_host…]]`; `POST {base}/{start|stop}`
//! with urlencoded `client=client` pairs answers an object mapping every
//! requested client to `[rv, args]`. A response that does not cover every
//! requested client is a server bug and is reported as a client error, not
//! a per-host failure.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

/// Per-client outcome of a start/stop request.
pub type Results = BTreeMap<String, i64>;

fn check_error(value: &Value) -> Result<()> {
    if let Some(error) = value.get("error") {
        return Err(Error::Redirection {
            message: error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string()),
        });
    }
    Ok(())
}

fn do_get(base_url: &str, cmd: &str) -> Result<Value> {
    let url = format!("{base_url}/{cmd}");
    let response = ureq::get(&url).call().map_err(|err| Error::Redirection {
        message: format!("request to {url} failed: {err}"),
    })?;
    let value: Value = response.into_json().map_err(|err| Error::Redirection {
        message: format!("invalid JSON from {url}: {err}"),
    })?;
    check_error(&value)?;
    Ok(value)
}

fn do_post(base_url: &str, cmd: &str, clients: &[String]) -> Result<Value> {
    let url = format!("{base_url}/{cmd}");
    let form: Vec<(&str, &str)> = clients
        .iter()
        .map(|client| (client.as_str(), client.as_str()))
        .collect();
    let response = ureq::post(&url)
        .send_form(&form)
        .map_err(|err| Error::Redirection {
            message: format!("request to {url} failed: {err}"),
        })?;
    let value: Value = response.into_json().map_err(|err| Error::Redirection {
        message: format!("invalid JSON from {url}: {err}"),
    })?;
    check_error(&value)?;
    Ok(value)
}

/// Clients amtredird is configured to redirect.
pub fn list(base_url: &str) -> Result<Vec<String>> {
    let value = do_get(base_url, "list")?;
    let items = value.as_array().filter(|items| items.len() == 2);
    let valid = items
        .and_then(|items| {
            if items[0].as_i64() == Some(0) {
                items[1].as_array()
            } else {
                None
            }
        })
        .ok_or_else(|| Error::Redirection {
            message: format!("unexpected list reply: {value}"),
        })?;
    Ok(valid
        .iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect())
}

fn post_command(base_url: &str, cmd: &str, clients: &[String]) -> Result<Results> {
    let value = do_post(base_url, cmd, clients)?;
    let object = value.as_object().ok_or_else(|| Error::Redirection {
        message: format!("unexpected {cmd} reply: {value}"),
    })?;
    if object.len() != clients.len() {
        return Err(Error::Redirection {
            message: format!(
                "{cmd} reply covers {} clients, expected {}",
                object.len(),
                clients.len()
            ),
        });
    }
    let mut results = Results::new();
    for (client, entry) in object {
        let rv = entry
            .as_array()
            .and_then(|pair| pair.first())
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Redirection {
                message: format!("unexpected {cmd} reply for {client}: {entry}"),
            })?;
        results.insert(client.clone(), rv);
    }
    Ok(results)
}

/// Start redirection for `clients`.
pub fn start(base_url: &str, clients: &[String]) -> Result<Results> {
    post_command(base_url, "start", clients)
}

/// Stop redirection for `clients`.
pub fn stop(base_url: &str, clients: &[String]) -> Result<Results> {
    post_command(base_url, "stop", clients)
}
