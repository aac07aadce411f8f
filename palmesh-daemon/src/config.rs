//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: `--config <path>`, ~/.config/palmesh/config.toml or
/// /etc/palmesh/config.toml. Env overrides: PALMESH_NAME, PALMESH_DISCOVERY_PORT,
/// PALMESH_TRANSPORT_PORT.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name shown to other users (default: $USER).
    #[serde(default = "default_name")]
    pub name: String,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Addresses dialed at startup in addition to discovered rooms.
    #[serde(default)]
    pub peers: Vec<SocketAddr>,
    /// Broadcast ids remembered for deduplication.
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
}

fn default_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string())
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_seen_capacity() -> usize {
    palmesh_core::DEFAULT_SEEN_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            peers: Vec::new(),
            seen_capacity: default_seen_capacity(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("invalid config")
    }

    /// Apply environment overrides. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("PALMESH_NAME") {
            if !name.trim().is_empty() {
                self.name = name.trim().to_string();
            }
        }
        if let Some(port) = port_var(&lookup, "PALMESH_DISCOVERY_PORT") {
            self.discovery_port = port;
        }
        if let Some(port) = port_var(&lookup, "PALMESH_TRANSPORT_PORT") {
            self.transport_port = port;
        }
    }
}

fn port_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u16> {
    let value = lookup(key)?;
    match value.parse::<u16>() {
        Ok(p) => Some(p),
        Err(_) => {
            warn!(key, value = %value, "ignoring invalid port");
            None
        }
    }
}

/// Load config: default, then the explicit or first existing config file, then env vars.
/// An explicit path must exist; a config file that exists must parse.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match path {
        Some(p) => {
            let s = std::fs::read_to_string(&p)
                .with_context(|| format!("reading {}", p.display()))?;
            Config::from_toml(&s).with_context(|| format!("parsing {}", p.display()))?
        }
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/palmesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/palmesh/config.toml"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_uses_defaults() {
        let c = Config::from_toml("").unwrap();
        assert_eq!(c.discovery_port, 45680);
        assert_eq!(c.transport_port, 45681);
        assert!(c.peers.is_empty());
        assert_eq!(c.seen_capacity, 4096);
    }

    #[test]
    fn parses_fields() {
        let c = Config::from_toml(
            r#"
            name = "alice"
            transport_port = 5000
            peers = ["192.168.1.7:45681"]
            seen_capacity = 16
            "#,
        )
        .unwrap();
        assert_eq!(c.name, "alice");
        assert_eq!(c.transport_port, 5000);
        assert_eq!(c.peers, vec!["192.168.1.7:45681".parse().unwrap()]);
        assert_eq!(c.seen_capacity, 16);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(Config::from_toml("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PALMESH_NAME", "bob"),
            ("PALMESH_DISCOVERY_PORT", "7000"),
            ("PALMESH_TRANSPORT_PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::from_toml("transport_port = 5000").unwrap();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.name, "bob");
        assert_eq!(c.discovery_port, 7000);
        assert_eq!(c.transport_port, 5000);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/palmesh.toml"))).is_err());
    }
}
