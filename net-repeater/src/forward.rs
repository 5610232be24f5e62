//! C3: stream forwarder (§4.3).
//!
//! Pumps bytes between an accepted connection and a freshly dialed upstream
//! until either side closes or the shared cancellation flag is observed.
//! Readiness is multiplexed with `mio` rather than a thread per direction,
//! matching the "select on either endpoint" wording of the component design.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token};
use rustls::pki_types::ServerName;
use tracing::debug;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_READ_SIZE: usize = 4096;

const CLIENT: Token = Token(0);
const UPSTREAM: Token = Token(1);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to dial upstream {addr}: {source}")]
    DialFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

/// Resolves the current upstream address for a dial; called once per
/// connection so a changing DNS answer is picked up without restarting the
/// listener (§4.5 step 2a).
pub trait DialUpstream: Send + Sync {
    fn dial(&self) -> Result<StdTcpStream, Error>;
}

/// Dials a fixed, pre-resolved `SocketAddr` on every call. Used by the
/// static-repeat downstream handlers (C9), where there is no per-connection
/// DNS re-resolution.
pub struct FixedUpstream(pub SocketAddr);

impl DialUpstream for FixedUpstream {
    fn dial(&self) -> Result<StdTcpStream, Error> {
        StdTcpStream::connect(self.0).map_err(|source| Error::DialFailed {
            addr: self.0,
            source,
        })
    }
}

/// Wraps an inner [`DialUpstream`], re-resolving the upstream host through a
/// lookup closure on every dial (§4.5 step 2a: "DNS may change between
/// connections -- this is intentional").
pub struct ResolvingUpstream<F> {
    pub host: String,
    pub port: u16,
    pub resolve: F,
}

impl<F> DialUpstream for ResolvingUpstream<F>
where
    F: Fn(&str) -> io::Result<std::net::IpAddr> + Send + Sync,
{
    fn dial(&self) -> Result<StdTcpStream, Error> {
        let ip = (self.resolve)(&self.host).map_err(|source| Error::DialFailed {
            addr: SocketAddr::new(std::net::IpAddr::from([0, 0, 0, 0]), self.port),
            source,
        })?;
        let addr = SocketAddr::new(ip, self.port);
        StdTcpStream::connect(addr).map_err(|source| Error::DialFailed { addr, source })
    }
}

/// Pump a plain-TCP connection until either side closes or `cancel` is set.
///
/// Both sockets are registered for `READABLE | WRITABLE`: a destination
/// whose send buffer is full does not drop the chunk just read from its
/// peer, it queues the unwritten remainder and retries on the next
/// writable-readiness event (`try_flush`/`try_read_once` below). Per
/// §4.3's invariant, at most one read chunk per direction is ever
/// outstanding -- further reads from a side are skipped while its peer's
/// write queue is still non-empty, rather than racing ahead of
/// backpressure.
pub fn pump_tcp(
    client: StdTcpStream,
    dial: &dyn DialUpstream,
    cancel: &Arc<AtomicBool>,
    poll_interval: Duration,
    read_size: usize,
) -> Result<(), Error> {
    let upstream = dial.dial()?;

    client.set_nodelay(true).ok();
    upstream.set_nodelay(true).ok();
    client.set_nonblocking(true)?;
    upstream.set_nonblocking(true)?;

    let mut client = MioTcpStream::from_std(client);
    let mut upstream = MioTcpStream::from_std(upstream);

    let mut poll = Poll::new()?;
    poll.registry().register(
        &mut client,
        CLIENT,
        Interest::READABLE.add(Interest::WRITABLE),
    )?;
    poll.registry().register(
        &mut upstream,
        UPSTREAM,
        Interest::READABLE.add(Interest::WRITABLE),
    )?;

    let mut events = Events::with_capacity(8);
    let mut buf = vec![0u8; read_size];

    // Bytes read from one side waiting to be written to the other. Kept
    // non-empty exactly while that destination's send buffer is full.
    let mut to_upstream: Vec<u8> = Vec::new();
    let mut to_client: Vec<u8> = Vec::new();

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }

        match poll.poll(&mut events, Some(poll_interval)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        for event in events.iter() {
            match event.token() {
                CLIENT => {
                    if event.is_readable()
                        && to_upstream.is_empty()
                        && !try_read_once(&mut client, &mut buf, &mut to_upstream)?
                    {
                        return Ok(());
                    }
                    if event.is_writable() && !try_flush(&mut client, &mut to_client)? {
                        return Ok(());
                    }
                }
                UPSTREAM => {
                    if event.is_readable()
                        && to_client.is_empty()
                        && !try_read_once(&mut upstream, &mut buf, &mut to_client)?
                    {
                        return Ok(());
                    }
                    if event.is_writable() && !try_flush(&mut upstream, &mut to_upstream)? {
                        return Ok(());
                    }
                }
                _ => continue,
            }
        }

        // A chunk read above may now have somewhere to go even without a
        // fresh writable event (the peer's send buffer had room all along).
        if !to_upstream.is_empty() && !try_flush(&mut upstream, &mut to_upstream)? {
            return Ok(());
        }
        if !to_client.is_empty() && !try_flush(&mut client, &mut to_client)? {
            return Ok(());
        }
    }
}

/// Reads at most one chunk from `src` into `buf`, appending it to `pending`.
/// Only called while `pending` is empty, so a stalled destination bounds
/// buffering to one `read_size` chunk rather than growing without limit.
/// Returns `false` on clean close.
fn try_read_once(
    src: &mut MioTcpStream,
    buf: &mut [u8],
    pending: &mut Vec<u8>,
) -> Result<bool, Error> {
    loop {
        match src.read(buf) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                return Ok(true);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "forwarder: transport error");
                return Ok(false);
            }
        }
    }
}

/// Writes as much of `pending` as `dst` currently accepts, leaving any
/// unwritten remainder in place. `WouldBlock` is not a close -- it means
/// the socket's send buffer is full right now, and the remaining bytes
/// stay queued for the next writable-readiness event. Returns `false`
/// only on a real transport error or the peer closing its read side.
fn try_flush(dst: &mut MioTcpStream, pending: &mut Vec<u8>) -> Result<bool, Error> {
    while !pending.is_empty() {
        match dst.write(pending) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                pending.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "forwarder: write to peer failed");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// TLS variant: dials the upstream then wraps it in a client-side TLS
/// session. Driven manually against the raw socket (rustls's sync API)
/// rather than through `rustls::Stream`, so the same `mio::Poll` loop as
/// [`pump_tcp`] can multiplex both the TLS record layer and the client leg.
pub fn pump_tls(
    client: StdTcpStream,
    dial: &dyn DialUpstream,
    tls_config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
    cancel: &Arc<AtomicBool>,
    poll_interval: Duration,
    read_size: usize,
) -> Result<(), Error> {
    let upstream_sock = dial.dial()?;
    upstream_sock.set_nodelay(true).ok();
    upstream_sock.set_nonblocking(true)?;

    let mut tls_conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| Error::TlsHandshakeFailed(e.to_string()))?;

    client.set_nodelay(true).ok();
    client.set_nonblocking(true)?;

    let mut client = MioTcpStream::from_std(client);
    let mut upstream = MioTcpStream::from_std(upstream_sock);

    let mut poll = Poll::new()?;
    poll.registry().register(
        &mut client,
        CLIENT,
        Interest::READABLE.add(Interest::WRITABLE),
    )?;
    poll.registry().register(
        &mut upstream,
        UPSTREAM,
        Interest::READABLE.add(Interest::WRITABLE),
    )?;

    let mut events = Events::with_capacity(8);
    let mut buf = vec![0u8; read_size];

    // Decrypted bytes waiting to be written to the plaintext client socket
    // -- same backpressure handling as `pump_tcp`'s pending buffers. The
    // client -> upstream direction has no equivalent: `pump_plaintext_into_tls`
    // hands off into rustls's own outgoing-record buffer, which
    // `flush_tls_writes` below already drains with its own WouldBlock retry.
    let mut to_client: Vec<u8> = Vec::new();

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Ok(());
        }

        match poll.poll(&mut events, Some(poll_interval)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }

        for event in events.iter() {
            match event.token() {
                CLIENT => {
                    if event.is_readable()
                        && !pump_plaintext_into_tls(&mut client, &mut tls_conn, &mut buf)?
                    {
                        return Ok(());
                    }
                    if event.is_writable() && !try_flush(&mut client, &mut to_client)? {
                        return Ok(());
                    }
                }
                UPSTREAM => {
                    if event.is_readable() && !drive_tls_read(&mut upstream, &mut tls_conn)? {
                        return Ok(());
                    }
                }
                _ => continue,
            }
        }

        flush_tls_writes(&mut upstream, &mut tls_conn)?;

        if !tls_conn.is_handshaking() && to_client.is_empty() {
            loop {
                match tls_conn.reader().read(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(n) => to_client.extend_from_slice(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(error = %e, "forwarder(tls): plaintext read failed");
                        return Ok(());
                    }
                }
            }
        }

        if !to_client.is_empty() && !try_flush(&mut client, &mut to_client)? {
            return Ok(());
        }
    }
}

/// Client -> TLS: read plaintext off the client socket and queue it for
/// encryption. Returns `false` on clean client close.
fn pump_plaintext_into_tls(
    client: &mut MioTcpStream,
    tls_conn: &mut rustls::ClientConnection,
    buf: &mut [u8],
) -> Result<bool, Error> {
    loop {
        match client.read(buf) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                tls_conn.writer().write_all(&buf[..n])?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "forwarder(tls): client read failed");
                return Ok(false);
            }
        }
    }
}

/// Pull ciphertext off the upstream socket into the TLS session. Returns
/// `false` on clean TLS or TCP close.
fn drive_tls_read(
    upstream: &mut MioTcpStream,
    tls_conn: &mut rustls::ClientConnection,
) -> Result<bool, Error> {
    loop {
        match tls_conn.read_tls(upstream) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                if let Err(e) = tls_conn.process_new_packets() {
                    debug!(error = %e, "forwarder(tls): handshake/record error");
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "forwarder(tls): upstream read failed");
                return Ok(false);
            }
        }
    }
}

fn flush_tls_writes(
    upstream: &mut MioTcpStream,
    tls_conn: &mut rustls::ClientConnection,
) -> Result<(), Error> {
    while tls_conn.wants_write() {
        match tls_conn.write_tls(upstream) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Blocking-timeout bidirectional pump for endpoint pairs that can't be
/// registered with `mio` (e.g. one side is a `rustls::StreamOwned`, which
/// owns rather than borrows its socket). Both `a` and `b` must already have
/// a read timeout close to `poll_interval` set on their underlying socket,
/// so a `WouldBlock`/`TimedOut` read lets the loop re-check `cancel`. Used
/// by the static-repeat downstream handlers (C9) rather than C3's core
/// path, which always has a bare `mio`-registrable socket available.
pub fn pump_blocking<A, B>(
    a: &mut A,
    b: &mut B,
    cancel: &Arc<AtomicBool>,
    read_size: usize,
) where
    A: Read + Write,
    B: Read + Write,
{
    let mut a_buf = vec![0u8; read_size];
    let mut b_buf = vec![0u8; read_size];

    loop {
        if cancel.load(Ordering::Relaxed) {
            return;
        }

        match a.read(&mut a_buf) {
            Ok(0) => return,
            Ok(n) => {
                if b.write_all(&a_buf[..n]).is_err() {
                    return;
                }
            }
            Err(e) if is_retryable(&e) => {}
            Err(e) => {
                debug!(error = %e, "forwarder: transport error");
                return;
            }
        }

        match b.read(&mut b_buf) {
            Ok(0) => return,
            Ok(n) => {
                if a.write_all(&b_buf[..n]).is_err() {
                    return;
                }
            }
            Err(e) if is_retryable(&e) => {}
            Err(e) => {
                debug!(error = %e, "forwarder: transport error");
                return;
            }
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
