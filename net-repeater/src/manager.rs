//! C6: server manager (§4.6).
//!
//! The heart of the DNS-driven core: a multi-key TTL cache (keyed by both
//! hostname and allocated IP) guarded by one mutex, a background reaper,
//! and `lookup_or_create_server`, which is the only path that mutates the
//! cache. Holding the lock across the (slow) `ServerItem` construction is
//! intentional -- see the concurrency model's rationale for I2/I4.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ipnet::IpNet;
use net_repeater_common::{IfaceMode, ProtoAndPort};
use tracing::{info, warn};

use crate::dns::{IpAddrLookup, RecordType};
use crate::ipgen::{self, RandomLocalIpGenerator};
use crate::service::{self, ServerItem};

const REAP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("name not found: {0}")]
    NameNotFound(String),
    #[error("upstream returned zero answers for {0}")]
    ZeroAnswer(String),
    #[error(transparent)]
    ExhaustedIpSpace(#[from] ipgen::Error),
    #[error(transparent)]
    Provisioning(#[from] service::Error),
}

struct Slot {
    item: ServerItem,
    expires_at: Instant,
}

/// Multi-key TTL cache (§4.6.1): one hostname key and one IP key per entry,
/// sharing a single expiry clock. `by_hostname`/`by_ip` both index into
/// `slots` by a synthetic id so either key resolves the same entry.
#[derive(Default)]
struct Cache {
    slots: HashMap<u64, Slot>,
    by_hostname: HashMap<String, u64>,
    by_ip: HashMap<IpAddr, u64>,
    next_id: u64,
}

impl Cache {
    fn contains_ip(&self, ip: IpAddr) -> bool {
        self.by_ip.contains_key(&ip)
    }

    /// Sliding-TTL lookup: on hit, refreshes the entry's expiry to `now + ttl`.
    fn get_refresh(&mut self, hostname: &str, ttl: Duration) -> Option<IpAddr> {
        let id = *self.by_hostname.get(hostname)?;
        let slot = self.slots.get_mut(&id)?;
        slot.expires_at = Instant::now() + ttl;
        Some(slot.item.local_ip())
    }

    /// Inserts under both the hostname and IP keys. Fails (returning the
    /// item back to the caller) if either key is already present.
    fn put(&mut self, hostname: String, item: ServerItem, ttl: Duration) -> Result<(), ServerItem> {
        let ip = item.local_ip();
        if self.by_hostname.contains_key(&hostname) || self.by_ip.contains_key(&ip) {
            return Err(item);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_hostname.insert(hostname, id);
        self.by_ip.insert(ip, id);
        self.slots.insert(
            id,
            Slot {
                item,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Removes every entry whose expiry has passed and returns the owned
    /// items so the caller can terminate them outside this method (kept
    /// separate so the mutation and the termination share one lock
    /// acquisition at the call site, not two).
    fn take_expired(&mut self) -> Vec<ServerItem> {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, s)| s.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(slot) = self.slots.remove(&id) {
                self.by_hostname.retain(|_, v| *v != id);
                self.by_ip.retain(|_, v| *v != id);
                removed.push(slot.item);
            }
        }
        removed
    }

    fn take_all(&mut self) -> Vec<ServerItem> {
        self.by_hostname.clear();
        self.by_ip.clear();
        self.slots.drain().map(|(_, s)| s.item).collect()
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

pub struct ServerManager {
    local_subnet: IpNet,
    iface: String,
    iface_mode: IfaceMode,
    proto_and_ports: Vec<ProtoAndPort>,
    remote_ip_lookup: Arc<dyn IpAddrLookup>,
    prefer_ipv6: bool,
    ttl: Duration,
    ip_gen: RandomLocalIpGenerator,
    cache: Mutex<Cache>,
    /// Stops the reaper thread. Unrelated to any per-`ServerItem`
    /// connection-cancellation flag -- those are created fresh per item so
    /// evicting one hostname never disturbs another's live connections.
    reaper_stop: Arc<AtomicBool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    items_created: AtomicU64,
}

impl ServerManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_subnet: IpNet,
        iface: String,
        iface_mode: IfaceMode,
        proto_and_ports: Vec<ProtoAndPort>,
        remote_ip_lookup: Arc<dyn IpAddrLookup>,
        ttl: Duration,
        prefer_ipv6: bool,
    ) -> Arc<Self> {
        let manager = Arc::new(ServerManager {
            local_subnet,
            iface,
            iface_mode,
            proto_and_ports,
            remote_ip_lookup,
            prefer_ipv6,
            ttl,
            ip_gen: RandomLocalIpGenerator::new(local_subnet),
            cache: Mutex::new(Cache::default()),
            reaper_stop: Arc::new(AtomicBool::new(false)),
            reaper: Mutex::new(None),
            items_created: AtomicU64::new(0),
        });

        let reaper_manager = manager.clone();
        let reaper_stop = manager.reaper_stop.clone();
        let handle = thread::spawn(move || loop {
            if reaper_stop.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(REAP_INTERVAL);
            if reaper_stop.load(Ordering::Relaxed) {
                return;
            }
            reaper_manager.reap();
        });
        *manager.reaper.lock().unwrap() = Some(handle);

        manager
    }

    /// The DNS record type this manager's subnet family answers with (A for
    /// IPv4, AAAA for IPv6) -- §4.6.3's exact-family match.
    pub fn answer_record_type(&self) -> RecordType {
        match self.local_subnet {
            IpNet::V4(_) => RecordType::A,
            IpNet::V6(_) => RecordType::Aaaa,
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// §4.6.2: the single create-or-lookup path, run entirely under the
    /// cache's mutex so a concurrent caller can neither duplicate an
    /// allocation nor observe a half-built `ServerItem`.
    pub fn lookup_or_create_server(&self, hostname: &str) -> Result<IpAddr, AnswerError> {
        let mut cache = self.cache.lock().unwrap();

        if let Some(ip) = cache.get_refresh(hostname, self.ttl) {
            return Ok(ip);
        }

        self.remote_ip_lookup
            .lookup_ip_addr(hostname, self.prefer_ipv6)
            .map_err(|e| match e {
                crate::dns::Error::NameNotFound(d) => AnswerError::NameNotFound(d),
                crate::dns::Error::ZeroAnswer(d) => AnswerError::ZeroAnswer(d),
                crate::dns::Error::Io(_) => AnswerError::NameNotFound(hostname.to_string()),
            })?;

        let allocated = self.ip_gen.generate_by_name(
            hostname,
            |candidate| cache.contains_ip(candidate),
            ipgen::DEFAULT_MAX_RETRIES,
        )?;

        let ip_and_net = IpNet::new(allocated, self.local_subnet.prefix_len())
            .expect("generated address shares the subnet's address family");

        let item_cancel = Arc::new(AtomicBool::new(false));
        let item = ServerItem::build(
            ip_and_net,
            self.iface.clone(),
            self.iface_mode,
            &self.proto_and_ports,
            hostname.to_string(),
            self.remote_ip_lookup.clone(),
            self.prefer_ipv6,
            item_cancel,
        )?;

        match cache.put(hostname.to_string(), item, self.ttl) {
            Ok(()) => {
                self.items_created.fetch_add(1, Ordering::Relaxed);
                info!(%hostname, ip = %allocated, "allocated server item");
                Ok(allocated)
            }
            Err(mut item) => {
                warn!(%hostname, "lost race inserting into cache, tearing down duplicate");
                item.terminate();
                Err(AnswerError::NameNotFound(hostname.to_string()))
            }
        }
    }

    fn reap(&self) {
        let expired = {
            let mut cache = self.cache.lock().unwrap();
            cache.take_expired()
        };
        for mut item in expired {
            info!(ip = %item.local_ip(), host = %item.remote_host(), "reaping expired server item");
            item.terminate();
        }
    }

    /// §4.6.4: idempotent. Stops the reaper, then terminates every live
    /// item under the same lock a lookup would take.
    pub fn terminate(&self) {
        self.reaper_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            let _ = handle.join();
        }

        let items = {
            let mut cache = self.cache.lock().unwrap();
            cache.take_all()
        };
        for mut item in items {
            item.terminate();
        }
    }
}
