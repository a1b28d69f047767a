//! Client for the config HTTP service.
//!
//! `GET {base}/{name}` returns a JSON record (host or group), `POST` with
//! urlencoded pairs sets properties. Server-side failures surface the
//! server-supplied message.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

#[derive(Clone, Debug, Deserialize)]
pub struct HostRecord {
    pub name: String,
    #[serde(default)]
    pub sname: Option<String>,
    #[serde(default)]
    pub props: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

fn http_error(url: &str, err: ureq::Error) -> Error {
    let message = match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            let body = body.trim();
            if body.is_empty() {
                format!("server returned HTTP status {code}")
            } else {
                format!("server returned HTTP status {code}: {body}")
            }
        }
        ureq::Error::Transport(transport) => transport.to_string(),
    };
    Error::Http {
        url: url.to_string(),
        message,
    }
}

fn get<T: serde::de::DeserializeOwned>(base_url: &str, entity: &str) -> Result<T> {
    let url = format!("{base_url}/{entity}");
    let response = ureq::get(&url).call().map_err(|err| http_error(&url, err))?;
    response.into_json().map_err(|err| Error::Http {
        url,
        message: format!("invalid JSON in response: {err}"),
    })
}

/// Fetch a host record by canonical or short name.
pub fn get_host(base_url: &str, name: &str) -> Result<HostRecord> {
    get(base_url, name)
}

/// Fetch a group record.
pub fn get_group(base_url: &str, name: &str) -> Result<GroupRecord> {
    get(base_url, name)
}

/// Set properties on an entity.
pub fn set_props(base_url: &str, entity: &str, props: &[(&str, &str)]) -> Result<()> {
    let url = format!("{base_url}/{entity}");
    ureq::post(&url)
        .send_form(props)
        .map_err(|err| http_error(&url, err))?;
    Ok(())
}
