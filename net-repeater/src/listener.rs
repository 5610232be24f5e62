//! C4: inbound listener (§4.4).
//!
//! One acceptor thread per `(localIP, localPort, protocol)`, handing each
//! accepted socket to a freshly spawned C3 forwarder thread.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tracing::{debug, info, warn};

use crate::forward::{self, DialUpstream};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// What an accepted socket is handed off to. Built once per listener and
/// cloned (as an `Arc`) into every forwarder thread.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, client: TcpStream, cancel: &Arc<AtomicBool>);
}

/// Plain-TCP handler: pumps bytes with no TLS wrapping (§4.3's base case).
pub struct TcpForwardHandler<D> {
    pub dial: D,
    pub poll_interval: Duration,
    pub read_size: usize,
}

impl<D: DialUpstream + 'static> ConnectionHandler for TcpForwardHandler<D> {
    fn handle(&self, client: TcpStream, cancel: &Arc<AtomicBool>) {
        if let Err(e) = forward::pump_tcp(client, &self.dial, cancel, self.poll_interval, self.read_size)
        {
            debug!(error = %e, "forwarder exited with error");
        }
    }
}

/// Client-side-TLS handler: the inbound socket is plain TCP, the upstream
/// dial is wrapped in a TLS client session (§4.3's TLS variant).
pub struct TlsUpstreamForwardHandler<D> {
    pub dial: D,
    pub tls_config: Arc<rustls::ClientConfig>,
    pub server_name: ServerName<'static>,
    pub poll_interval: Duration,
    pub read_size: usize,
}

impl<D: DialUpstream + 'static> ConnectionHandler for TlsUpstreamForwardHandler<D> {
    fn handle(&self, client: TcpStream, cancel: &Arc<AtomicBool>) {
        if let Err(e) = forward::pump_tls(
            client,
            &self.dial,
            self.tls_config.clone(),
            self.server_name.clone(),
            cancel,
            self.poll_interval,
            self.read_size,
        ) {
            debug!(error = %e, "tls forwarder exited with error");
        }
    }
}

/// Server-side TLS: accepted sockets are wrapped in a server TLS session
/// before being pumped to a plain-TCP upstream (§4.4's TLS listener
/// variant). Used by the static-repeat `tls_repeat` downstream handler and
/// by any DNS-driven server whose `protoAndPorts` entry names `tls`.
pub struct TlsAcceptForwardHandler<D> {
    pub dial: D,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub read_size: usize,
}

impl<D: DialUpstream + 'static> ConnectionHandler for TlsAcceptForwardHandler<D> {
    fn handle(&self, client: TcpStream, cancel: &Arc<AtomicBool>) {
        let conn = match rustls::ServerConnection::new(self.tls_config.clone()) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "tls listener: failed to build server connection");
                return;
            }
        };
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .ok();
        let mut stream = rustls::StreamOwned::new(conn, client);

        let upstream = match self.dial.dial() {
            Ok(u) => u,
            Err(e) => {
                debug!(error = %e, "tls listener: upstream dial failed");
                return;
            }
        };
        // Drive the handshake inline; once established, forward in a
        // blocking read/write loop against the upstream dial.
        if let Err(e) = stream.conn.complete_io(&mut stream.sock) {
            debug!(error = %e, "tls listener: handshake failed");
            return;
        }
        let mut upstream = upstream;
        upstream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .ok();
        forward::pump_blocking(&mut stream, &mut upstream, cancel, self.read_size);
    }
}

/// A running acceptor loop plus the means to stop it.
pub struct Listener {
    local_addr: SocketAddr,
    cancel: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `(ip, port)` and spawn the acceptor thread. `port == 0` yields
    /// an ephemeral port, observable via [`Listener::port`] (B2).
    pub fn bind(
        addr: SocketAddr,
        handler: Arc<dyn ConnectionHandler>,
        cancel: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Result<Self, Error> {
        let std_listener =
            StdTcpListener::bind(addr).map_err(|source| Error::BindFailed { addr, source })?;
        std_listener.set_nonblocking(true).ok();
        let local_addr = std_listener.local_addr().unwrap_or(addr);

        let accept_cancel = cancel.clone();
        let join = thread::spawn(move || {
            accept_loop(std_listener, handler, accept_cancel, poll_interval);
        });

        info!(addr = %local_addr, "listener bound");
        Ok(Listener {
            local_addr,
            cancel,
            join: Some(join),
        })
    }

    /// The bound port; meaningful for ephemeral binds (B2's `GetServerPort`).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the acceptor thread to exit. Does not
    /// forcibly close connections already handed off to forwarder threads;
    /// those observe the same `cancel` flag independently.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: StdTcpListener,
    handler: Arc<dyn ConnectionHandler>,
    cancel: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            return;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nodelay(true).ok();
                debug!(%peer, "accepted connection");
                let handler = handler.clone();
                let cancel = cancel.clone();
                thread::spawn(move || handler.handle(stream, &cancel));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(poll_interval);
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(poll_interval);
            }
        }
    }
}
