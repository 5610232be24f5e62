//! C2: interface IP lifecycle management (§4.2).
//!
//! Two backends: [`LinuxLive`], which shells out to `ip addr add/del`
//! (grounded directly in the source's documented preference for subprocess
//! invocation over a native netlink binding), and [`LinuxDryRun`], an
//! in-memory simulation used by tests and by the dry-run boot mode.

use std::collections::HashMap;
use std::net::{IpAddr, TcpListener, UdpSocket};
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ipnet::IpNet;
use net_repeater_common::IfaceMode;
use tracing::{debug, info, warn};

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported platform: interface IP management requires Linux")]
    UnsupportedPlatform,
    #[error("`{cmd}` failed with status {status}: {stderr}")]
    CommandFailed {
        cmd: String,
        status: String,
        stderr: String,
    },
    #[error("failed to run `ip`: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("`ip` binary not found on PATH: {0}")]
    MissingIpBinary(which::Error),
    #[error("timed out waiting for {ip} to be {state} on interface {iface}")]
    ConfirmTimeout {
        ip: IpAddr,
        iface: String,
        state: &'static str,
    },
}

/// `(ip, prefix)` bound to a named interface, plus the backend that actually
/// mutates (or simulates mutating) the OS state.
pub trait InterfaceIpManager: Send + Sync {
    fn add_ip(&self, wait_confirm: bool) -> Result<(), Error>;
    fn remove_ip(&self, wait_confirm: bool) -> Result<(), Error>;
    fn has_ip(&self) -> bool;
    fn ip(&self) -> IpAddr;
    fn iface(&self) -> &str;
}

pub fn create(
    mode: IfaceMode,
    ip_and_net: IpNet,
    iface: String,
) -> Result<Box<dyn InterfaceIpManager>, Error> {
    match mode {
        IfaceMode::Linux => {
            if !cfg!(target_os = "linux") {
                return Err(Error::UnsupportedPlatform);
            }
            which::which("ip").map_err(Error::MissingIpBinary)?;
            Ok(Box::new(LinuxLive::new(ip_and_net, iface)))
        }
        IfaceMode::LinuxDryRun => Ok(Box::new(LinuxDryRun::new(ip_and_net, iface))),
    }
}

/// Detect the appropriate live mode for the running process, per the
/// `DetectType` contract in §6 (`UnsupportedPlatform` is fatal at startup).
pub fn detect_mode() -> Result<IfaceMode, Error> {
    if cfg!(target_os = "linux") {
        Ok(IfaceMode::Linux)
    } else {
        Err(Error::UnsupportedPlatform)
    }
}

/// A fresh socket can bind `(ip, 0)` -- the kernel considers the address
/// locally usable. Used by both backends' `wait_confirm` gate.
fn bindable(ip: IpAddr) -> bool {
    TcpListener::bind((ip, 0)).is_ok() && UdpSocket::bind((ip, 0)).is_ok()
}

fn poll_until<F: FnMut() -> bool>(mut condition: F, timeout: Duration, interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(interval);
    }
}

pub struct LinuxLive {
    ip_and_net: IpNet,
    iface: String,
}

impl LinuxLive {
    pub fn new(ip_and_net: IpNet, iface: String) -> Self {
        Self { ip_and_net, iface }
    }

    fn run_ip_cmd(&self, op: &str) -> Result<(), Error> {
        let with_prefix = format!("{}/{}", self.ip_and_net.addr(), self.ip_and_net.prefix_len());
        let output = Command::new("ip")
            .args(["addr", op, &with_prefix, "dev", &self.iface])
            .output()?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                cmd: format!("ip addr {op} {with_prefix} dev {}", self.iface),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

impl InterfaceIpManager for LinuxLive {
    fn add_ip(&self, wait_confirm: bool) -> Result<(), Error> {
        info!(ip = %self.ip_and_net, iface = %self.iface, "adding interface IP");
        if self.has_ip() {
            warn!(ip = %self.ip_and_net, iface = %self.iface, "IP already present on interface");
            return Ok(());
        }
        self.run_ip_cmd("add")?;
        if wait_confirm {
            let ip = self.ip();
            let ok = poll_until(
                || has_interface_ip(ip, &self.iface) && bindable(ip),
                CONFIRM_TIMEOUT,
                CONFIRM_POLL_INTERVAL,
            );
            if !ok {
                return Err(Error::ConfirmTimeout {
                    ip,
                    iface: self.iface.clone(),
                    state: "added and bindable",
                });
            }
        }
        Ok(())
    }

    fn remove_ip(&self, wait_confirm: bool) -> Result<(), Error> {
        info!(ip = %self.ip_and_net, iface = %self.iface, "removing interface IP");
        if !self.has_ip() {
            warn!(ip = %self.ip_and_net, iface = %self.iface, "IP not present on interface");
            return Ok(());
        }
        self.run_ip_cmd("del")?;
        if wait_confirm {
            let ip = self.ip();
            let iface = self.iface.clone();
            let ok = poll_until(
                || !has_interface_ip(ip, &iface),
                CONFIRM_TIMEOUT,
                CONFIRM_POLL_INTERVAL,
            );
            if !ok {
                return Err(Error::ConfirmTimeout {
                    ip,
                    iface,
                    state: "removed",
                });
            }
        }
        Ok(())
    }

    fn has_ip(&self) -> bool {
        has_interface_ip(self.ip(), &self.iface)
    }

    fn ip(&self) -> IpAddr {
        self.ip_and_net.addr()
    }

    fn iface(&self) -> &str {
        &self.iface
    }
}

/// Parses `ip -o addr show dev <iface>` output rather than linking a netlink
/// crate, matching the subprocess-only footprint the rest of this module
/// uses for mutation.
fn has_interface_ip(ip: IpAddr, iface: &str) -> bool {
    let output = match Command::new("ip")
        .args(["-o", "addr", "show", "dev", iface])
        .output()
    {
        Ok(o) if o.status.success() => o,
        _ => return false,
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let needle = ip.to_string();
    text.lines().any(|line| {
        line.split_whitespace()
            .any(|tok| tok == needle || tok.starts_with(&format!("{needle}/")))
    })
}

/// Process-local simulation of interface state, keyed by interface name.
/// Used for tests (S3/S6) and the `linux-dry-run` config mode.
pub struct LinuxDryRun {
    ip_and_net: IpNet,
    iface: String,
    table: &'static Mutex<HashMap<String, Vec<IpAddr>>>,
}

fn dry_run_table() -> &'static Mutex<HashMap<String, Vec<IpAddr>>> {
    static TABLE: std::sync::OnceLock<Mutex<HashMap<String, Vec<IpAddr>>>> =
        std::sync::OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl LinuxDryRun {
    pub fn new(ip_and_net: IpNet, iface: String) -> Self {
        Self {
            ip_and_net,
            iface,
            table: dry_run_table(),
        }
    }

    /// Test helper: the full simulated address set of an interface.
    pub fn addresses_on(iface: &str) -> Vec<IpAddr> {
        dry_run_table()
            .lock()
            .unwrap()
            .get(iface)
            .cloned()
            .unwrap_or_default()
    }
}

impl InterfaceIpManager for LinuxDryRun {
    fn add_ip(&self, _wait_confirm: bool) -> Result<(), Error> {
        debug!(ip = %self.ip_and_net, iface = %self.iface, "dry-run: adding interface IP");
        let mut table = self.table.lock().unwrap();
        let addrs = table.entry(self.iface.clone()).or_default();
        if addrs.contains(&self.ip()) {
            warn!(ip = %self.ip_and_net, iface = %self.iface, "IP already present on interface");
            return Ok(());
        }
        addrs.push(self.ip());
        Ok(())
    }

    fn remove_ip(&self, _wait_confirm: bool) -> Result<(), Error> {
        debug!(ip = %self.ip_and_net, iface = %self.iface, "dry-run: removing interface IP");
        let mut table = self.table.lock().unwrap();
        let addrs = table.entry(self.iface.clone()).or_default();
        let before = addrs.len();
        addrs.retain(|a| *a != self.ip());
        if addrs.len() == before {
            warn!(ip = %self.ip_and_net, iface = %self.iface, "IP not present on interface");
        }
        Ok(())
    }

    fn has_ip(&self) -> bool {
        self.table
            .lock()
            .unwrap()
            .get(&self.iface)
            .map(|addrs| addrs.contains(&self.ip()))
            .unwrap_or(false)
    }

    fn ip(&self) -> IpAddr {
        self.ip_and_net.addr()
    }

    fn iface(&self) -> &str {
        &self.iface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_add_then_remove_restores_initial_state() {
        let iface = format!("dry-test-{:?}", std::thread::current().id());
        let net: IpNet = "10.9.0.5/24".parse().unwrap();
        let mgr = LinuxDryRun::new(net, iface.clone());

        assert!(!mgr.has_ip());
        mgr.add_ip(false).unwrap();
        assert!(mgr.has_ip());
        mgr.remove_ip(false).unwrap();
        assert!(!mgr.has_ip());
        assert!(LinuxDryRun::addresses_on(&iface).is_empty());
    }

    #[test]
    fn dry_run_add_is_idempotent() {
        let iface = format!("dry-idem-{:?}", std::thread::current().id());
        let net: IpNet = "10.9.0.6/24".parse().unwrap();
        let mgr = LinuxDryRun::new(net, iface.clone());

        mgr.add_ip(false).unwrap();
        mgr.add_ip(false).unwrap();
        assert_eq!(LinuxDryRun::addresses_on(&iface).len(), 1);
    }

    #[test]
    fn dry_run_remove_absent_is_idempotent() {
        let iface = format!("dry-absent-{:?}", std::thread::current().id());
        let net: IpNet = "10.9.0.7/24".parse().unwrap();
        let mgr = LinuxDryRun::new(net, iface);
        mgr.remove_ip(false).unwrap();
    }
}
