//! `tcp_repeat`: repeats an accepted connection to a fixed `(ip, port)`.
//!
//! Grounded on `Downstream/Handler/TCPRepeatHandler.py`'s `FromConfig` and
//! `_DownstreamConnect`: dial once per connection, no DNS re-resolution
//! (the fixed upstream is an address, not a hostname).

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{Duplex, DownstreamHandler};
use crate::forward;

const DEFAULT_POLL_INTERVAL_SECS: f64 = 0.1;
const DEFAULT_READ_SIZE: u64 = 4096;

pub struct TcpRepeatHandler {
    addr: SocketAddr,
    read_timeout: Duration,
    read_size: usize,
}

impl TcpRepeatHandler {
    pub fn from_config(config: &serde_json::Value) -> Result<Self, String> {
        let ip: IpAddr = config
            .get("ip")
            .and_then(|v| v.as_str())
            .ok_or("missing `ip`")?
            .parse()
            .map_err(|e| format!("invalid `ip`: {e}"))?;
        let port: u16 = config
            .get("port")
            .and_then(|v| v.as_u64())
            .ok_or("missing `port`")?
            .try_into()
            .map_err(|_| "`port` out of range".to_string())?;
        let poll_interval = config
            .get("poll_interval")
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let read_size = config
            .get("read_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_READ_SIZE) as usize;

        Ok(TcpRepeatHandler {
            addr: SocketAddr::new(ip, port),
            read_timeout: Duration::from_secs_f64(poll_interval.max(0.001)),
            read_size,
        })
    }
}

impl DownstreamHandler for TcpRepeatHandler {
    /// `conn` must already carry a read timeout close to a poll interval on
    /// its underlying socket -- `Duplex` erases the concrete type, so it
    /// cannot be set here. The caller that accepts the connection and boxes
    /// it (`static_repeat.rs`) is responsible for setting it before this
    /// handler ever sees `conn`.
    fn handle(&self, mut conn: Box<dyn Duplex>, _peer: SocketAddr, cancel: &Arc<AtomicBool>) {
        let mut upstream = match TcpStream::connect(self.addr) {
            Ok(s) => s,
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "tcp_repeat: dial failed");
                return;
            }
        };
        upstream.set_nodelay(true).ok();
        upstream.set_read_timeout(Some(self.read_timeout)).ok();

        forward::pump_blocking(&mut conn, &mut upstream, cancel, self.read_size);
    }
}
