//! Static-repeat boot sequence (§12 edge case, §13).
//!
//! Grounded on `Func/StaticRepeat/__main__.py`'s `Start`: build the
//! downstream handler registry, build every configured inbound server from
//! it, start them all threaded, and tear them all down together on
//! shutdown. Unlike the DNS-driven core, addresses are fixed at config time
//! -- there is no allocation, no TTL, and no reaper.
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::ServerSpec;
use crate::downstream::{self, HandlerDict};
use crate::listener::{self, ConnectionHandler, Listener};
use crate::tls_config::TlsServerConfig;

/// `pump_blocking` (C3) requires both sides of the pair it pumps to already
/// carry a read timeout close to its poll interval, so a `WouldBlock`/
/// `TimedOut` read lets it re-check `cancel` instead of blocking forever on
/// an idle peer -- see `listener.rs`'s `TlsAcceptForwardHandler` for the
/// same requirement on the upstream leg.
const PUMP_READ_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Downstream(#[from] downstream::Error),
    #[error(transparent)]
    Tls(#[from] crate::tls_config::Error),
    #[error(transparent)]
    Bind(#[from] listener::Error),
    #[error("server spec missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown server module {0:?}")]
    UnknownModule(String),
}

/// An accepted connection handed straight to its named downstream handler
/// -- the listener-side counterpart of `downstream::DownstreamHandler`.
struct DownstreamConnectionHandler {
    handler: Arc<dyn downstream::DownstreamHandler>,
}

impl ConnectionHandler for DownstreamConnectionHandler {
    fn handle(&self, client: std::net::TcpStream, cancel: &Arc<AtomicBool>) {
        let peer = client.peer_addr().unwrap_or_else(|_| {
            SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0)
        });
        client.set_read_timeout(Some(PUMP_READ_TIMEOUT)).ok();
        self.handler.handle(Box::new(client), peer, cancel);
    }
}

/// Every running inbound listener bound by [`start`], kept alive for the
/// process lifetime and torn down together by [`StaticRepeat::terminate`].
pub struct StaticRepeat {
    listeners: Vec<Listener>,
}

fn string_field<'a>(config: &'a serde_json::Value, field: &'static str) -> Result<&'a str, Error> {
    config
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or(Error::MissingField(field))
}

fn start_tcp_server(
    config: &serde_json::Value,
    downstream: &HandlerDict,
    cancel: Arc<AtomicBool>,
) -> Result<Listener, Error> {
    let ip: IpAddr = string_field(config, "ip")?
        .parse()
        .map_err(|e| Error::InvalidField {
            field: "ip",
            reason: format!("{e}"),
        })?;
    let port = config
        .get("port")
        .and_then(|v| v.as_u64())
        .ok_or(Error::MissingField("port"))? as u16;
    let handler = downstream.get(string_field(config, "downstream")?)?;

    let conn_handler: Arc<dyn ConnectionHandler> = Arc::new(DownstreamConnectionHandler { handler });
    Ok(Listener::bind(
        SocketAddr::new(ip, port),
        conn_handler,
        cancel,
        listener::DEFAULT_POLL_INTERVAL,
    )?)
}

fn start_tls_server(
    config: &serde_json::Value,
    downstream: &HandlerDict,
    cancel: Arc<AtomicBool>,
) -> Result<Listener, Error> {
    let ip: IpAddr = string_field(config, "ip")?
        .parse()
        .map_err(|e| Error::InvalidField {
            field: "ip",
            reason: format!("{e}"),
        })?;
    let port = config
        .get("port")
        .and_then(|v| v.as_u64())
        .ok_or(Error::MissingField("port"))? as u16;
    let downstream_name = string_field(config, "downstream")?;
    let priv_key_path = PathBuf::from(string_field(config, "priv_key_path")?);
    let cert_path = PathBuf::from(string_field(config, "cert_path")?);
    let verify_client = config
        .get("verify_client")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let client_ca_path = config
        .get("ca_path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let client_ca_path = if verify_client { client_ca_path.as_deref() } else { None };

    let tls_config = TlsServerConfig::load(&cert_path, &priv_key_path, client_ca_path)?;

    // The TLS-accept listener forwards to the downstream handler's own
    // dial logic, but `ConnectionHandler`'s TLS-accept variant (C4) dials
    // a fixed upstream directly; here the real upstream is "whatever the
    // named downstream handler does", so the handshake is driven inline
    // and plaintext is handed to the handler rather than to a second dial.
    let handler = downstream.get(downstream_name)?;
    let conn_handler: Arc<dyn ConnectionHandler> = Arc::new(TlsAcceptToDownstream {
        tls_config,
        handler,
    });
    Ok(Listener::bind(
        SocketAddr::new(ip, port),
        conn_handler,
        cancel,
        listener::DEFAULT_POLL_INTERVAL,
    )?)
}

/// Terminates inbound TLS at the listener, then hands the plaintext
/// stream to the named downstream handler exactly as the plain-TCP path
/// does. Grounded on `TLSServer.FromConfig` wrapping the same
/// `downstreamTCPHdlr` contract as `TCPServer`.
struct TlsAcceptToDownstream {
    tls_config: Arc<rustls::ServerConfig>,
    handler: Arc<dyn downstream::DownstreamHandler>,
}

impl ConnectionHandler for TlsAcceptToDownstream {
    fn handle(&self, client: std::net::TcpStream, cancel: &Arc<AtomicBool>) {
        let peer = client.peer_addr().unwrap_or_else(|_| {
            SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0)
        });
        let conn = match rustls::ServerConnection::new(self.tls_config.clone()) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, "static-repeat tls: failed to build server connection");
                return;
            }
        };
        client.set_read_timeout(Some(PUMP_READ_TIMEOUT)).ok();
        let mut stream = rustls::StreamOwned::new(conn, client);
        if let Err(e) = stream.conn.complete_io(&mut stream.sock) {
            tracing::debug!(error = %e, "static-repeat tls: handshake failed");
            return;
        }
        self.handler.handle(Box::new(stream), peer, cancel);
    }
}

impl StaticRepeat {
    /// Build the downstream registry and every configured inbound server,
    /// starting each one's acceptor thread immediately. All-or-nothing:
    /// any failure stops and drops every listener started so far.
    pub fn start(
        downstream_specs: &[crate::config::DownstreamHandlerSpec],
        server_specs: &[ServerSpec],
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        info!("static-repeat: initializing downstream handlers");
        let handler_dict = downstream::build_handler_dict(downstream_specs)?;

        info!("static-repeat: initializing servers");
        let mut listeners = Vec::with_capacity(server_specs.len());
        for spec in server_specs {
            let result = match spec.module.as_str() {
                "TCP" => start_tcp_server(&spec.config, &handler_dict, cancel.clone()),
                "TLS" => start_tls_server(&spec.config, &handler_dict, cancel.clone()),
                other => Err(Error::UnknownModule(other.to_string())),
            };
            match result {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    listeners.clear();
                    return Err(e);
                }
            }
        }

        Ok(StaticRepeat { listeners })
    }

    pub fn terminate(&mut self) {
        for listener in &mut self.listeners {
            listener.stop();
        }
    }

    /// Bound ports, in the same order as the `servers` config list (B2's
    /// `GetServerPort` for static-repeat mode).
    pub fn ports(&self) -> Vec<u16> {
        self.listeners.iter().map(Listener::port).collect()
    }
}

impl Drop for StaticRepeat {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdListener, TcpStream};
    use std::thread;

    fn echo_upstream() -> SocketAddr {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut sock, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    #[test]
    fn tcp_server_repeats_to_named_downstream_handler() {
        let upstream = echo_upstream();

        let downstream_specs = vec![crate::config::DownstreamHandlerSpec {
            name: "up".to_string(),
            module: "tcp_repeat".to_string(),
            config: serde_json::json!({"ip": upstream.ip().to_string(), "port": upstream.port()}),
        }];
        let server_specs = vec![ServerSpec {
            module: "TCP".to_string(),
            config: serde_json::json!({"ip": "127.0.0.1", "port": 0, "downstream": "up"}),
        }];

        let cancel = Arc::new(AtomicBool::new(false));
        let mut repeat =
            StaticRepeat::start(&downstream_specs, &server_specs, cancel).unwrap();
        let port = repeat.listeners[0].port();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        repeat.terminate();
    }

    #[test]
    fn unknown_module_is_rejected() {
        let server_specs = vec![ServerSpec {
            module: "UDP".to_string(),
            config: serde_json::json!({}),
        }];
        let cancel = Arc::new(AtomicBool::new(false));
        let result = StaticRepeat::start(&[], &server_specs, cancel);
        assert!(matches!(result, Err(Error::UnknownModule(_))));
    }
}
