//! HTTP and file-backed clients for the external services the engine
//! consults: the config service, the amtredird redirection daemon, and the
//! AMT credentials file.

pub mod amtcreds;
pub mod amtredird;
pub mod config;
