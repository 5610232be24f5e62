//! `tls_repeat`: repeats an accepted (plaintext) connection to a fixed
//! `(ip, port)`, wrapping the outbound leg in client TLS.
//!
//! Grounded on `Downstream/Handler/TLSRepeatHandler.py`'s `FromConfig`,
//! which takes the same `ip`/`port` as `tcp_repeat` plus `serverHostName`
//! (SNI), an optional CA bundle, and an optional client certificate pair.
//! Config building itself is delegated to [`crate::tls_config::TlsClientConfig`]
//! (C11), shared with the DNS-driven core's TLS-upstream-dial path.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tracing::debug;

use super::{Duplex, DownstreamHandler};
use crate::forward;
use crate::tls_config::TlsClientConfig;

const DEFAULT_POLL_INTERVAL_SECS: f64 = 0.1;
const DEFAULT_READ_SIZE: u64 = 4096;

pub struct TlsRepeatHandler {
    addr: SocketAddr,
    server_name: ServerName<'static>,
    tls_config: Arc<rustls::ClientConfig>,
    read_timeout: Duration,
    read_size: usize,
}

impl TlsRepeatHandler {
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
        let server_host_name = config
            .get("server_host_name")
            .and_then(|v| v.as_str())
            .ok_or("missing `server_host_name`")?
            .to_string();
        let poll_interval = config
            .get("poll_interval")
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let read_size = config
            .get("read_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_READ_SIZE) as usize;
        let ca_path = config
            .get("ca_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);
        let priv_key_path = config
            .get("priv_key_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);
        let cert_path = config
            .get("cert_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);

        let server_name = ServerName::try_from(server_host_name)
            .map_err(|e| format!("invalid `server_host_name`: {e}"))?;

        let tls_config = TlsClientConfig::load(
            ca_path.as_deref(),
            cert_path.as_deref(),
            priv_key_path.as_deref(),
        )
        .map_err(|e| e.to_string())?;

        Ok(TlsRepeatHandler {
            addr: SocketAddr::new(ip, port),
            server_name,
            tls_config,
            read_timeout: Duration::from_secs_f64(poll_interval.max(0.001)),
            read_size,
        })
    }
}

impl DownstreamHandler for TlsRepeatHandler {
    /// `conn` must already carry a read timeout close to a poll interval on
    /// its underlying socket -- `Duplex` erases the concrete type, so it
    /// cannot be set here. The caller that accepts the connection and boxes
    /// it (`static_repeat.rs`) is responsible for setting it before this
    /// handler ever sees `conn`.
    fn handle(&self, mut conn: Box<dyn Duplex>, _peer: SocketAddr, cancel: &Arc<AtomicBool>) {
        let upstream_sock = match TcpStream::connect(self.addr) {
            Ok(s) => s,
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "tls_repeat: dial failed");
                return;
            }
        };
        upstream_sock.set_nodelay(true).ok();
        upstream_sock
            .set_read_timeout(Some(self.read_timeout))
            .ok();

        let tls_conn =
            match rustls::ClientConnection::new(self.tls_config.clone(), self.server_name.clone())
            {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "tls_repeat: failed to build client connection");
                    return;
                }
            };
        let mut upstream = rustls::StreamOwned::new(tls_conn, upstream_sock);
        if let Err(e) = upstream.conn.complete_io(&mut upstream.sock) {
            debug!(addr = %self.addr, error = %e, "tls_repeat: handshake failed");
            return;
        }

        forward::pump_blocking(&mut conn, &mut upstream, cancel, self.read_size);
    }
}
