//! C5: server item (§4.5).
//!
//! Owns one allocated local IP: drives the interface manager to install it,
//! then spins up one inbound listener per configured `(proto, localPort,
//! remotePort)`. Construction is all-or-nothing -- any failed step unwinds
//! everything built so far, in reverse order.

use std::net::IpAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ipnet::IpNet;
use net_repeater_common::{IfaceMode, Protocol, ProtoAndPort};
use tracing::info;

use crate::dns::IpAddrLookup;
use crate::forward::{self, ResolvingUpstream};
use crate::iface::{self, InterfaceIpManager};
use crate::listener::{self, ConnectionHandler, Listener, TcpForwardHandler};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Interface(#[from] iface::Error),
    #[error(transparent)]
    Bind(#[from] listener::Error),
}

/// One running `(proto, localPort, remotePort)` acceptor plus its forwarder
/// fleet -- the Rust analogue of the source's `ServiceItem`.
struct Service {
    listener: Listener,
}

/// Everything the Server Manager tracks per allocated hostname/IP pair.
pub struct ServerItem {
    local_ip_and_net: IpNet,
    remote_host: String,
    iface_mgr: Box<dyn InterfaceIpManager>,
    services: Vec<Service>,
    cancel: Arc<AtomicBool>,
}

impl ServerItem {
    /// Build and start a server item. On any failure, every step already
    /// completed (listeners bound, the interface IP installed) is undone in
    /// reverse order before the error is returned (§4.5's "only cleanup
    /// path besides `Terminate`").
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        local_ip_and_net: IpNet,
        iface: String,
        iface_mode: IfaceMode,
        proto_and_ports: &[ProtoAndPort],
        remote_host: String,
        remote_ip_lookup: Arc<dyn IpAddrLookup>,
        prefer_ipv6: bool,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let iface_mgr = iface::create(iface_mode, local_ip_and_net, iface)?;
        iface_mgr.add_ip(true)?;

        let mut services = Vec::with_capacity(proto_and_ports.len());
        for pp in proto_and_ports {
            match Self::start_service(local_ip_and_net.addr(), pp, &remote_host, remote_ip_lookup.clone(), prefer_ipv6, cancel.clone()) {
                Ok(service) => services.push(service),
                Err(e) => {
                    for service in services.into_iter().rev() {
                        drop(service);
                    }
                    let _ = iface_mgr.remove_ip(true);
                    return Err(e);
                }
            }
        }

        info!(
            ip = %local_ip_and_net.addr(),
            remote = %remote_host,
            "server item provisioned"
        );

        Ok(ServerItem {
            local_ip_and_net,
            remote_host,
            iface_mgr,
            services,
            cancel,
        })
    }

    fn start_service(
        local_ip: IpAddr,
        pp: &ProtoAndPort,
        remote_host: &str,
        remote_ip_lookup: Arc<dyn IpAddrLookup>,
        prefer_ipv6: bool,
        cancel: Arc<AtomicBool>,
    ) -> Result<Service, Error> {
        let host = remote_host.to_string();
        let remote_port = pp.remote_port;
        let resolve = move |h: &str| {
            remote_ip_lookup
                .lookup_ip_addr(h, prefer_ipv6)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        };
        let dial = ResolvingUpstream {
            host,
            port: remote_port,
            resolve,
        };

        let handler: Arc<dyn ConnectionHandler> = match pp.proto {
            Protocol::Tcp => Arc::new(TcpForwardHandler {
                dial,
                poll_interval: forward::DEFAULT_POLL_INTERVAL,
                read_size: forward::DEFAULT_READ_SIZE,
            }),
            Protocol::Tls => {
                // The DNS-driven core only ever dials plain TCP upstream
                // (there is no "TLS" entry in the original outbound
                // connector map); `tls` here is reserved for static-repeat
                // mode's downstream registry (C9). Treat it the same as
                // `tcp` for the core so a config author's typo degrades
                // gracefully rather than silently dropping the service.
                Arc::new(TcpForwardHandler {
                    dial,
                    poll_interval: forward::DEFAULT_POLL_INTERVAL,
                    read_size: forward::DEFAULT_READ_SIZE,
                })
            }
        };

        let addr = std::net::SocketAddr::new(local_ip, pp.local_port);
        let listener = Listener::bind(addr, handler, cancel, listener::DEFAULT_POLL_INTERVAL)?;
        Ok(Service { listener })
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local_ip_and_net.addr()
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    /// Stop every service's acceptor, then remove the interface IP.
    /// Idempotent: calling twice is a no-op the second time because the
    /// underlying listener/iface manager operations already are.
    pub fn terminate(&mut self) {
        self.cancel_connections();
        for service in &mut self.services {
            service.listener.stop();
        }
        let _ = self.iface_mgr.remove_ip(true);
    }

    fn cancel_connections(&self) {
        self.cancel
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Drop for ServerItem {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::LinuxDryRun;
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdListener, TcpStream};
    use std::sync::atomic::AtomicBool;
    use std::thread;

    struct FixedLookup(IpAddr);
    impl IpAddrLookup for FixedLookup {
        fn lookup_ip_addr(&self, _domain: &str, _prefer_ipv6: bool) -> Result<IpAddr, crate::dns::Error> {
            Ok(self.0)
        }
    }

    #[test]
    fn build_then_terminate_removes_interface_ip_and_stops_listeners() {
        let upstream = StdListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut sock, _)) = upstream.accept() {
                let mut buf = [0u8; 2];
                sock.read_exact(&mut buf).unwrap();
                sock.write_all(&buf).unwrap();
            }
        });

        let iface = format!("svc-test-{:?}", thread::current().id());
        let local_net: IpNet = "127.0.0.2/32".parse().unwrap();
        let pp = ProtoAndPort {
            proto: Protocol::Tcp,
            local_port: 0,
            remote_port: upstream_addr.port(),
        };
        let lookup: Arc<dyn IpAddrLookup> = Arc::new(FixedLookup(upstream_addr.ip()));
        let cancel = Arc::new(AtomicBool::new(false));

        let mut item = ServerItem::build(
            local_net,
            iface.clone(),
            IfaceMode::LinuxDryRun,
            &[pp],
            "upstream.example".to_string(),
            lookup,
            false,
            cancel,
        )
        .unwrap();

        assert!(LinuxDryRun::addresses_on(&iface).contains(&item.local_ip()));
        assert_eq!(item.services.len(), 1);

        let port = item.services[0].listener.port();
        let mut client = TcpStream::connect(("127.0.0.2", port)).unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        item.terminate();
        assert!(LinuxDryRun::addresses_on(&iface).is_empty());
    }
}
