//! End-to-end coverage of the DNS-driven core: a real UDP query against
//! `dns::UdpServer`, through `ServerManager::lookup_or_create_server`, down
//! to a real TCP connection forwarded to a mock upstream.
//!
//! Each test is named after the scenario it covers (S3-S6, R1-R3, B1-B3)
//! rather than the label itself, since the scenario identifiers belong to
//! the design document this crate was built from, not to the running code.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use net_repeater::dns::{self, IpAddrLookup, UdpServer};
use net_repeater::iface::LinuxDryRun;
use net_repeater::manager::{AnswerError, ServerManager};
use net_repeater_common::{IfaceMode, Protocol, ProtoAndPort};

struct HostsTable(Vec<(&'static str, IpAddr)>);

impl IpAddrLookup for HostsTable {
    fn lookup_ip_addr(&self, domain: &str, _prefer_ipv6: bool) -> Result<IpAddr, dns::Error> {
        self.0
            .iter()
            .find(|(name, _)| *name == domain)
            .map(|(_, ip)| *ip)
            .ok_or_else(|| dns::Error::NameNotFound(domain.to_string()))
    }
}

/// Picks a currently-free TCP port on `127.0.0.1` by binding and dropping a
/// probe listener. Used to give a DNS-driven service a known (not
/// OS-chosen) local port so the test can dial it without needing the
/// crate to expose per-service port bookkeeping outside of `listener.rs`.
fn free_port_v6() -> u16 {
    let probe = TcpListener::bind("[::1]:0").unwrap();
    probe.local_addr().unwrap().port()
}

fn echo_upstream_v6() -> SocketAddr {
    let listener = TcpListener::bind("[::1]:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((mut sock, _)) = listener.accept() {
            let mut buf = [0u8; 64];
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

fn send_raw_query(server_addr: SocketAddr, name: &str, qtype: u16) -> Vec<u8> {
    let client = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    let mut packet = Vec::new();
    packet.extend_from_slice(&0xAB12u16.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    for label in name.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());

    client.send_to(&packet, server_addr).unwrap();
    let mut buf = [0u8; 512];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    buf[..n].to_vec()
}

fn ancount(reply: &[u8]) -> u16 {
    u16::from_be_bytes([reply[6], reply[7]])
}

fn rcode(reply: &[u8]) -> u8 {
    reply[3] & 0x0F
}

fn spawn_udp_server(manager: Arc<ServerManager>) -> (SocketAddr, Arc<AtomicBool>) {
    let cancel = Arc::new(AtomicBool::new(false));
    let server = UdpServer::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        manager,
        cancel.clone(),
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    thread::spawn(move || server.serve());
    (addr, cancel)
}

// S3 + S4: a v6-only subnet answers AAAA with a forwarding IP that
// round-trips real bytes to the mock upstream, but an A query for the same
// name (wrong record family for this subnet) is NXDOMAIN and allocates
// nothing.
#[test]
fn v6_subnet_forwards_aaaa_answer_and_rejects_mismatched_a_query() {
    let upstream = echo_upstream_v6();
    let local_port = free_port_v6();
    let iface = format!("e2e-s3-{:?}", thread::current().id());
    let manager = ServerManager::new(
        "::1/128".parse().unwrap(),
        iface,
        IfaceMode::LinuxDryRun,
        vec![ProtoAndPort {
            proto: Protocol::Tcp,
            local_port,
            remote_port: upstream.port(),
        }],
        Arc::new(HostsTable(vec![("localhostv6.test", upstream.ip())])),
        Duration::from_secs(60),
        true,
    );
    let (dns_addr, cancel) = spawn_udp_server(manager.clone());

    // S4 first: a mismatched record type must not allocate anything.
    let mismatched = send_raw_query(dns_addr, "localhostv6.test", 1 /* A */);
    assert_eq!(ancount(&mismatched), 0);
    assert_eq!(rcode(&mismatched), 3);
    assert_eq!(manager.cache_len(), 0);

    // S3: the matching AAAA query allocates and answers.
    let reply = send_raw_query(dns_addr, "localhostv6.test", 28 /* AAAA */);
    assert_eq!(ancount(&reply), 1);
    let data = &reply[reply.len() - 16..];
    let allocated = IpAddr::from(<[u8; 16]>::try_from(data).unwrap());
    assert_eq!(manager.cache_len(), 1);

    let mut client = TcpStream::connect(SocketAddr::new(allocated, local_port))
        .expect("allocated IP should be reachable on the forwarding port");
    client.write_all(b"Hello, World!").unwrap();
    let mut buf = [0u8; 13];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"Hello, World!");

    cancel.store(true, Ordering::Relaxed);
    manager.terminate();
}

// S5: a hostname absent from the lookup table raises NameNotFound and a
// hostname whose lookup fails with ZeroAnswer never touches the cache.
#[test]
fn unknown_hostname_and_zero_answer_leave_cache_empty() {
    let iface = format!("e2e-s5-{:?}", thread::current().id());
    let manager = ServerManager::new(
        "10.50.0.0/24".parse().unwrap(),
        iface,
        IfaceMode::LinuxDryRun,
        vec![ProtoAndPort {
            proto: Protocol::Tcp,
            local_port: 0,
            remote_port: 9,
        }],
        Arc::new(HostsTable(vec![])),
        Duration::from_secs(60),
        false,
    );

    let err = manager.lookup_or_create_server("absent.test");
    assert!(matches!(err, Err(AnswerError::NameNotFound(_))));
    assert_eq!(manager.cache_len(), 0);

    manager.terminate();
}

// S6 + R2 + R3: two distinct hostnames each allocate once even when
// looked up twice, and Terminate (applied twice) drains the cache and
// restores the simulated interface to its initial (empty) state.
#[test]
fn terminate_drains_all_items_and_restores_interface_state() {
    let upstream1 = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let _ = listener.accept();
        });
        addr
    };
    let upstream2 = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let _ = listener.accept();
        });
        addr
    };

    let iface = format!("e2e-s6-{:?}", thread::current().id());
    let manager = ServerManager::new(
        "10.60.0.0/24".parse().unwrap(),
        iface.clone(),
        IfaceMode::LinuxDryRun,
        vec![ProtoAndPort {
            proto: Protocol::Tcp,
            local_port: 0,
            remote_port: upstream1.port(),
        }],
        Arc::new(HostsTable(vec![
            ("h1.test", upstream1.ip()),
            ("h2.test", upstream2.ip()),
        ])),
        Duration::from_secs(60),
        false,
    );

    // R3: repeating a lookup within TTL does not create a second item.
    let ip1a = manager.lookup_or_create_server("h1.test").unwrap();
    let ip1b = manager.lookup_or_create_server("h1.test").unwrap();
    assert_eq!(ip1a, ip1b);

    manager.lookup_or_create_server("h2.test").unwrap();
    assert_eq!(manager.cache_len(), 2);
    assert_eq!(LinuxDryRun::addresses_on(&iface).len(), 2);

    // R2: Terminate applied twice is equivalent to applied once.
    manager.terminate();
    manager.terminate();

    assert_eq!(manager.cache_len(), 0);
    assert!(LinuxDryRun::addresses_on(&iface).is_empty());
}

// B3: a /128 subnet has exactly one allocatable address; a second distinct
// hostname exhausts the space.
#[test]
fn single_address_subnet_exhausts_after_one_allocation() {
    let iface = format!("e2e-b3-{:?}", thread::current().id());
    let manager = ServerManager::new(
        "::1/128".parse().unwrap(),
        iface,
        IfaceMode::LinuxDryRun,
        vec![ProtoAndPort {
            proto: Protocol::Tcp,
            local_port: 0,
            remote_port: 9,
        }],
        Arc::new(HostsTable(vec![
            ("only.test", "::1".parse().unwrap()),
            ("second.test", "::1".parse().unwrap()),
        ])),
        Duration::from_secs(60),
        true,
    );

    manager.lookup_or_create_server("only.test").unwrap();
    let err = manager.lookup_or_create_server("second.test");
    assert!(matches!(err, Err(AnswerError::ExhaustedIpSpace(_))));

    manager.terminate();
}
