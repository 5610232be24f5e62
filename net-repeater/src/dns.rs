//! DNS collaborator contracts and the reference front-end (§6, §14/C10).
//!
//! `IpAddrLookup` is the single contract both the Server Manager (to
//! validate a hostname before allocating) and every `ServerItem` (to
//! resolve the upstream on each dial) consult -- mirroring the original
//! design's single `remoteIPLookup` object serving both call sites.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::manager::{AnswerError, ServerManager};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("name not found: {0}")]
    NameNotFound(String),
    #[error("upstream returned zero answers for {0}")]
    ZeroAnswer(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Resolves a hostname to an upstream IP address. Implemented by the
/// standard-resolver-backed default and by test doubles.
pub trait IpAddrLookup: Send + Sync {
    fn lookup_ip_addr(&self, domain: &str, prefer_ipv6: bool) -> Result<IpAddr, Error>;
}

/// Resolves via the system resolver (`dns-lookup`), the same crate the
/// teacher uses for outbound name resolution.
pub struct SystemResolver;

impl IpAddrLookup for SystemResolver {
    fn lookup_ip_addr(&self, domain: &str, prefer_ipv6: bool) -> Result<IpAddr, Error> {
        let ips = dns_lookup::lookup_host(domain)
            .map_err(|_| Error::NameNotFound(domain.to_string()))?;
        if ips.is_empty() {
            return Err(Error::ZeroAnswer(domain.to_string()));
        }
        let preferred = if prefer_ipv6 {
            ips.iter().find(|ip| ip.is_ipv6())
        } else {
            ips.iter().find(|ip| ip.is_ipv4())
        };
        Ok(*preferred.unwrap_or(&ips[0]))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DnsClass {
    In,
    Other(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
    Other(u16),
}

impl RecordType {
    fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
            RecordType::Other(c) => c,
        }
    }

    fn from_code(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            28 => RecordType::Aaaa,
            other => RecordType::Other(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuestionEntry {
    pub name: String,
    pub class: DnsClass,
    pub rec_type: RecordType,
}

#[derive(Debug, Clone)]
pub struct AnsEntry {
    pub name: String,
    pub class: DnsClass,
    pub rec_type: RecordType,
    pub data: IpAddr,
    pub ttl: u32,
}

pub const ANSWER_TTL: u32 = 60;

/// §4.6.3: class must be IN; record type must match the subnet's address
/// family exactly (a stricter check than the original's "A or AAAA
/// regardless of subnet family" -- see the design note on this choice).
pub fn handle_question(
    manager: &ServerManager,
    question: &QuestionEntry,
) -> Result<AnsEntry, Error> {
    if question.class != DnsClass::In {
        debug!(name = %question.name, "unsupported class");
        return Err(Error::NameNotFound(question.name.clone()));
    }

    let expected = manager.answer_record_type();
    if question.rec_type != expected {
        debug!(name = %question.name, "record type does not match subnet family");
        return Err(Error::NameNotFound(question.name.clone()));
    }

    let ip = manager
        .lookup_or_create_server(&question.name)
        .map_err(|e| match e {
            AnswerError::NameNotFound(d) => Error::NameNotFound(d),
            AnswerError::ZeroAnswer(d) => Error::ZeroAnswer(d),
            other => Error::NameNotFound(other.to_string()),
        })?;

    Ok(AnsEntry {
        name: question.name.clone(),
        class: DnsClass::In,
        rec_type: expected,
        data: ip,
        ttl: ANSWER_TTL,
    })
}

impl PartialEq for DnsClass {
    fn eq(&self, other: &Self) -> bool {
        matches!((self, other), (DnsClass::In, DnsClass::In))
            || matches!((self, other), (DnsClass::Other(a), DnsClass::Other(b)) if a == b)
    }
}
impl Eq for DnsClass {}

/// C10: a minimal UDP DNS front-end. Decodes one question per datagram
/// (header + one question, A/AAAA only, no compression pointers, no
/// EDNS0), dispatches the provisioning path (cache miss) to a worker
/// thread so one slow allocation cannot stall other in-flight queries, and
/// encodes a single answer record back.
pub struct UdpServer {
    socket: UdpSocket,
    manager: Arc<ServerManager>,
    cancel: Arc<AtomicBool>,
}

impl UdpServer {
    pub fn bind(
        addr: SocketAddr,
        manager: Arc<ServerManager>,
        cancel: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;
        Ok(UdpServer {
            socket,
            manager,
            cancel,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the accept loop on the calling thread until cancellation.
    pub fn serve(&self) {
        let mut buf = [0u8; 512];
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return;
            }
            match self.socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    let packet = buf[..n].to_vec();
                    let manager = self.manager.clone();
                    let reply_sock = self.socket.try_clone();
                    thread::spawn(move || {
                        let Ok(reply_sock) = reply_sock else {
                            return;
                        };
                        match handle_packet(&packet, &manager) {
                            Ok(reply) => {
                                let _ = reply_sock.send_to(&reply, peer);
                            }
                            Err(e) => {
                                debug!(error = %e, %peer, "dropping malformed/unanswerable query");
                            }
                        }
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    warn!(error = %e, "udp recv failed");
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum WireError {
    #[error("packet too short")]
    Truncated,
    #[error("unsupported opcode or qdcount != 1")]
    Unsupported,
    #[error(transparent)]
    Lookup(#[from] Error),
}

/// Wire codec entry point: decode, answer, encode.
fn handle_packet(packet: &[u8], manager: &ServerManager) -> Result<Vec<u8>, WireError> {
    let (id, question, _qname_end) = decode_question(packet)?;
    let result = handle_question(manager, &question);
    Ok(encode_reply(id, &question, result.ok().as_ref()))
}

fn decode_question(packet: &[u8]) -> Result<(u16, QuestionEntry, usize), WireError> {
    if packet.len() < 12 {
        return Err(WireError::Truncated);
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount != 1 {
        return Err(WireError::Unsupported);
    }

    let mut pos = 12;
    let mut labels = Vec::new();
    loop {
        if pos >= packet.len() {
            return Err(WireError::Truncated);
        }
        let len = packet[pos] as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 != 0 {
            // compression pointer: not supported by this minimal codec.
            return Err(WireError::Unsupported);
        }
        pos += 1;
        if pos + len > packet.len() {
            return Err(WireError::Truncated);
        }
        labels.push(String::from_utf8_lossy(&packet[pos..pos + len]).into_owned());
        pos += len;
    }
    if pos + 4 > packet.len() {
        return Err(WireError::Truncated);
    }
    let qtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
    let qclass = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]);
    pos += 4;

    let name = labels.join(".");
    let class = if qclass == 1 {
        DnsClass::In
    } else {
        DnsClass::Other(qclass)
    };

    Ok((
        id,
        QuestionEntry {
            name,
            class,
            rec_type: RecordType::from_code(qtype),
        },
        pos,
    ))
}

fn encode_reply(id: u16, question: &QuestionEntry, answer: Option<&AnsEntry>) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&id.to_be_bytes());
    let flags: u16 = if answer.is_some() { 0x8180 } else { 0x8183 }; // QR|RA, RCODE=3 (NXDOMAIN) on miss
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&(answer.is_some() as u16).to_be_bytes()); // ancount
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount

    encode_name(&mut out, &question.name);
    out.extend_from_slice(&question.rec_type.code().to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // class IN

    if let Some(ans) = answer {
        encode_name(&mut out, &ans.name);
        out.extend_from_slice(&ans.rec_type.code().to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&ans.ttl.to_be_bytes());
        match ans.data {
            IpAddr::V4(v4) => {
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                out.extend_from_slice(&16u16.to_be_bytes());
                out.extend_from_slice(&v6.octets());
            }
        }
    }

    out
}

fn encode_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query(name: &str, qtype: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0x1234u16.to_be_bytes());
        out.extend_from_slice(&0x0100u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        encode_name(&mut out, name);
        out.extend_from_slice(&qtype.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out
    }

    #[test]
    fn decode_question_round_trips_name_and_type() {
        let packet = build_query("example.com", 1);
        let (id, q, _) = decode_question(&packet).unwrap();
        assert_eq!(id, 0x1234);
        assert_eq!(q.name, "example.com");
        assert_eq!(q.rec_type, RecordType::A);
        assert_eq!(q.class, DnsClass::In);
    }

    #[test]
    fn decode_rejects_compression_pointers() {
        let mut packet = build_query("example.com", 1);
        packet[12] = 0xC0;
        assert!(decode_question(&packet).is_err());
    }

    #[test]
    fn encode_reply_nxdomain_has_zero_answers() {
        let q = QuestionEntry {
            name: "nope.example".to_string(),
            class: DnsClass::In,
            rec_type: RecordType::A,
        };
        let reply = encode_reply(7, &q, None);
        let ancount = u16::from_be_bytes([reply[6], reply[7]]);
        assert_eq!(ancount, 0);
        let rcode = reply[3] & 0x0F;
        assert_eq!(rcode, 3);
    }

    #[test]
    fn encode_reply_with_answer_has_one_record() {
        let q = QuestionEntry {
            name: "example.com".to_string(),
            class: DnsClass::In,
            rec_type: RecordType::A,
        };
        let ans = AnsEntry {
            name: "example.com".to_string(),
            class: DnsClass::In,
            rec_type: RecordType::A,
            data: "10.0.0.5".parse().unwrap(),
            ttl: 60,
        };
        let reply = encode_reply(7, &q, Some(&ans));
        let ancount = u16::from_be_bytes([reply[6], reply[7]]);
        assert_eq!(ancount, 1);
        assert!(reply.ends_with(&[10, 0, 0, 5]));
    }
}
