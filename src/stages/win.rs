//! Windows naming helpers.

use crate::core::host::Host;

/// NetBIOS-style machine name derived from the inventory short name.
pub fn hostname(host: &Host) -> String {
    format!("{}-win", host.sname).to_uppercase()
}

/// Login candidates for a Windows host: domain-qualified first, bare login
/// as fallback.
pub fn possible_logins(host: &Host, login: &str) -> Vec<String> {
    vec![format!("{}+{login}", hostname(host)), login.to_string()]
}

/// Whether the host runs the cygwin SSH stack.
pub fn is_cygwin(host: &Host) -> bool {
    host.prop("windows")
        .and_then(|windows| windows.get("is_cygwin"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    #[test]
    fn hostname_is_uppercased_short_name() {
        let host = Host::new("host1.example.org", "h1", Map::new());
        assert_eq!(hostname(&host), "H1-WIN");
        assert_eq!(possible_logins(&host, "Administrator"), vec![
            "H1-WIN+Administrator",
            "Administrator"
        ]);
    }

    #[test]
    fn cygwin_flag_comes_from_nested_props() {
        let mut props = Map::new();
        props.insert("windows".to_string(), json!({"is_cygwin": true}));
        let host = Host::new("h", "h", props);
        assert!(is_cygwin(&host));
        assert!(!is_cygwin(&Host::new("h", "h", Map::new())));
    }
}
