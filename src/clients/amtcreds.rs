//! AMT credentials file.
//!
//! Whitespace-separated `host user password` lines; `*` matches any host
//! and `#` starts a comment.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct CredentialsProvider {
    path: PathBuf,
    entries: Vec<(String, Credentials)>,
}

impl CredentialsProvider {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|err| Error::io("Failed to read AMT credentials", path, err))?;
        let mut entries = Vec::new();
        for line in contents.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next()) {
                (Some(host), Some(user), Some(password)) => entries.push((
                    host.to_string(),
                    Credentials {
                        user: user.to_string(),
                        password: password.to_string(),
                    },
                )),
                _ => {
                    return Err(Error::setup(format!(
                        "malformed AMT credentials line in {}: {line}",
                        path.display()
                    )));
                }
            }
        }
        Ok(CredentialsProvider {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Credentials for `host`, falling back to a `*` entry.
    pub fn get(&self, host: &str) -> Result<&Credentials> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == host)
            .or_else(|| self.entries.iter().find(|(entry, _)| entry == "*"))
            .map(|(_, creds)| creds)
            .ok_or_else(|| {
                Error::setup(format!(
                    "no AMT credentials for {host} in {}",
                    self.path.display()
                ))
            })
    }
}
