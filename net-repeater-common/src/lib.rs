//! Configuration DTOs shared between the `net-repeater` config loader, the
//! core Server Manager, and anything downstream that wants to read the same
//! JSON shape (e.g. an external DNS engine embedding this crate).

use std::fmt;
use std::time::Duration;

/// The wire protocol an inbound listener/outbound dial speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Tls,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Tls => f.write_str("tls"),
        }
    }
}

/// One `(proto, localPort, remotePort)` entry from `protoAndPorts`.
///
/// Accepts either the 2-tuple or 3-tuple JSON form (`remotePort` defaults to
/// `localPort` when omitted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ProtoAndPort {
    pub proto: Protocol,
    pub local_port: u16,
    pub remote_port: u16,
}

impl<'de> serde::Deserialize<'de> for ProtoAndPort {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Two(Protocol, u16),
            Three(Protocol, u16, u16),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Two(proto, local_port) => Ok(ProtoAndPort {
                proto,
                local_port,
                remote_port: local_port,
            }),
            Raw::Three(proto, local_port, remote_port) => Ok(ProtoAndPort {
                proto,
                local_port,
                remote_port,
            }),
        }
    }
}

/// `localIfaceMode` from the `ServerManagerMod` config: which `InterfaceIp
/// Manager` backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IfaceMode {
    Linux,
    LinuxDryRun,
}

/// A `(value, unit)` TTL as written in JSON config, normalized to seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TtlSeconds(u64);

impl TtlSeconds {
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }

    pub fn as_secs(self) -> u64 {
        self.0
    }

    /// Normalize a `(value, unit)` pair. Units: `s`, `m`, `h`, `d`.
    /// Rejects zero and negative values per the Boundary Behaviors in the
    /// specification (B1).
    pub fn from_value_unit(value: i64, unit: &str) -> Result<Self, TtlError> {
        if value <= 0 {
            return Err(TtlError::NonPositiveValue(value));
        }
        let multiplier: u64 = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            other => return Err(TtlError::UnknownUnit(other.to_string())),
        };
        let seconds = (value as u64)
            .checked_mul(multiplier)
            .ok_or(TtlError::Overflow)?;
        Ok(TtlSeconds(seconds))
    }
}

impl<'de> serde::Deserialize<'de> for TtlSeconds {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (value, unit): (i64, String) = serde::Deserialize::deserialize(deserializer)?;
        TtlSeconds::from_value_unit(value, &unit).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TtlError {
    #[error("TTL value must be strictly positive, got {0}")]
    NonPositiveValue(i64),
    #[error("unknown TTL unit {0:?}, expected one of s, m, h, d")]
    UnknownUnit(String),
    #[error("TTL value overflowed while converting to seconds")]
    Overflow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_normalizes_days_to_seconds() {
        assert_eq!(
            TtlSeconds::from_value_unit(1, "d").unwrap().as_secs(),
            86_400
        );
    }

    #[test]
    fn ttl_rejects_zero_and_negative() {
        assert!(TtlSeconds::from_value_unit(0, "s").is_err());
        assert!(TtlSeconds::from_value_unit(-1, "h").is_err());
    }

    #[test]
    fn ttl_rejects_unknown_unit() {
        assert!(TtlSeconds::from_value_unit(1, "y").is_err());
    }

    #[test]
    fn proto_and_port_two_tuple_defaults_remote() {
        let parsed: ProtoAndPort = serde_json::from_str(r#"["tcp", 8080]"#).unwrap();
        assert_eq!(parsed.proto, Protocol::Tcp);
        assert_eq!(parsed.local_port, 8080);
        assert_eq!(parsed.remote_port, 8080);
    }

    #[test]
    fn proto_and_port_three_tuple_keeps_remote() {
        let parsed: ProtoAndPort = serde_json::from_str(r#"["tls", 8443, 443]"#).unwrap();
        assert_eq!(parsed.proto, Protocol::Tls);
        assert_eq!(parsed.local_port, 8443);
        assert_eq!(parsed.remote_port, 443);
    }
}
