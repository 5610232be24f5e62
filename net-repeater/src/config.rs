//! C7: config loader (§11).
//!
//! Parses the top-level JSON configuration into typed structures, with TTL
//! and proto/port normalization happening here (via `net-repeater-common`'s
//! custom `Deserialize` impls) rather than being deferred to first use.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use ipnet::IpNet;
use net_repeater_common::{IfaceMode, ProtoAndPort, TtlSeconds};
use serde::Deserialize;

/// Where the reference DNS front-end (C10) listens. Not part of the
/// distilled `ServerManagerMod` config (the original plugs into an
/// external DNS server framework that owns its own listen address); this
/// crate needs one because it ships that front-end itself.
fn default_dns_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5300))
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Opaque passthrough (§10.3): this crate's own logger only consults
/// `verbose`/`quiet` from the CLI, but the full object is kept so an
/// embedder layering its own logger config still gets it round-tripped.
pub type LoggerConfig = serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamHandlerSpec {
    pub name: String,
    pub module: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub module: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerManagerSpec {
    pub local_net: IpNet,
    pub local_iface: String,
    #[serde(default)]
    pub local_iface_mode: Option<IfaceMode>,
    pub proto_and_ports: Vec<ProtoAndPort>,
    pub remote_ip_lookup: RemoteIpLookupSpec,
    pub server_ttl: TtlSeconds,
    #[serde(default)]
    pub remote_prefer_ipv6: bool,
    #[serde(default = "default_dns_listen_addr")]
    pub dns_listen_addr: SocketAddr,
}

/// The distilled spec names `remoteIPLookup` as an external collaborator
/// reference; this crate resolves it to either the system resolver or a
/// fixed address, rather than a DNS-framework object name, since it has no
/// embedding DNS framework of its own (§14's "this crate is not a general
/// DNS server").
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteIpLookupSpec {
    System,
    Fixed { ip: std::net::IpAddr },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepeaterConfig {
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub downstream: Vec<DownstreamHandlerSpec>,
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
    pub server_manager: Option<ServerManagerSpec>,
}

impl RepeaterConfig {
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let content = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: RepeaterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.server_manager.is_none() && self.servers.is_empty() {
            return Err(Error::Invalid(
                "config must define at least one of `server_manager` or `servers`".to_string(),
            ));
        }
        let declared: std::collections::HashSet<&str> =
            self.downstream.iter().map(|d| d.name.as_str()).collect();
        for server in &self.servers {
            if let Some(name) = server.config.get("downstream").and_then(|v| v.as_str()) {
                if !declared.contains(name) {
                    return Err(Error::Invalid(format!(
                        "server references undefined downstream handler {name:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_server_manager_section() {
        let f = write_config(
            r#"{
                "server_manager": {
                    "local_net": "10.9.0.0/24",
                    "local_iface": "dummy0",
                    "local_iface_mode": "linux-dry-run",
                    "proto_and_ports": [["tcp", 443]],
                    "remote_ip_lookup": {"kind": "system"},
                    "server_ttl": [1, "h"]
                }
            }"#,
        );
        let cfg = RepeaterConfig::from_path(f.path()).unwrap();
        let sm = cfg.server_manager.unwrap();
        assert_eq!(sm.server_ttl.as_secs(), 3600);
        assert_eq!(sm.proto_and_ports[0].local_port, 443);
        assert_eq!(sm.proto_and_ports[0].remote_port, 443);
    }

    #[test]
    fn rejects_config_with_neither_section() {
        let f = write_config(r#"{}"#);
        assert!(RepeaterConfig::from_path(f.path()).is_err());
    }

    #[test]
    fn rejects_server_referencing_unknown_downstream() {
        let f = write_config(
            r#"{
                "downstream": [],
                "servers": [
                    {"module": "TCP", "config": {"ip": "0.0.0.0", "port": 80, "downstream": "missing"}}
                ]
            }"#,
        );
        assert!(RepeaterConfig::from_path(f.path()).is_err());
    }
}
