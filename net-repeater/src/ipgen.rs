//! C1: deterministic, hash-chained local-IP allocation (§4.1).
//!
//! Given a hostname and a local subnet, derives a candidate IP by hashing
//! the hostname with SHA-256 and masking the digest into the subnet's host
//! suffix. Collisions (as reported by a caller-supplied predicate) are
//! resolved by re-hashing the digest and retrying, up to a bound.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use sha2::{Digest, Sha256};

pub const DEFAULT_MAX_RETRIES: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("exhausted IP space after {0} attempts generating an address for {1:?}")]
    ExhaustedIpSpace(u32, String),
    #[error("SHA-256 digest does not carry enough entropy for a {0}-bit host suffix")]
    InsufficientEntropy(u32),
    #[error("generated address {0} does not belong to subnet {1}; this is a logic bug")]
    OutOfSubnet(IpAddr, IpNet),
}

/// Bound to one [`IpNet`]; stateless beyond that, per §4.1's rationale
/// ("the generator holds no shared state beyond the chain digest").
#[derive(Debug, Clone, Copy)]
pub struct RandomLocalIpGenerator {
    subnet: IpNet,
}

impl RandomLocalIpGenerator {
    pub fn new(subnet: IpNet) -> Self {
        Self { subnet }
    }

    pub fn subnet(&self) -> IpNet {
        self.subnet
    }

    /// Derive a unique-per-`is_taken` IP for `name`.
    ///
    /// `is_taken` is consulted on each candidate; when it returns `true` the
    /// digest is re-hashed and a new candidate is derived, up to
    /// `max_retries` consecutive collisions.
    pub fn generate_by_name(
        &self,
        name: &str,
        mut is_taken: impl FnMut(IpAddr) -> bool,
        max_retries: u32,
    ) -> Result<IpAddr, Error> {
        let mut digest: [u8; 32] = Sha256::digest(name.as_bytes()).into();

        for _ in 0..max_retries {
            let candidate = self.generate_from_digest(&digest)?;
            if !is_taken(candidate) {
                return Ok(candidate);
            }
            digest = Sha256::digest(digest).into();
        }

        Err(Error::ExhaustedIpSpace(max_retries, name.to_string()))
    }

    /// Exposed for the boundary tests in §8 (S1/S2), which exercise the raw
    /// hash-to-address mapping directly rather than through a hostname.
    pub fn generate_from_digest(&self, digest: &[u8; 32]) -> Result<IpAddr, Error> {
        let max_prefix_len: u32 = match self.subnet {
            IpNet::V4(_) => 32,
            IpNet::V6(_) => 128,
        };
        let suffix_bits = max_prefix_len - self.subnet.prefix_len() as u32;

        let bit_length = digest_bit_length(digest);
        if (bit_length as u32) < suffix_bits {
            return Err(Error::InsufficientEntropy(suffix_bits));
        }

        let candidate = match self.subnet {
            IpNet::V4(net) => {
                let low = u32::from_be_bytes(digest[28..32].try_into().unwrap());
                let suffix = low & u32::from(net.hostmask());
                let host = u32::from(net.network()) | suffix;
                IpAddr::V4(Ipv4Addr::from(host))
            }
            IpNet::V6(net) => {
                let low = u128::from_be_bytes(digest[16..32].try_into().unwrap());
                let suffix = low & u128::from(net.hostmask());
                let host = u128::from(net.network()) | suffix;
                IpAddr::V6(Ipv6Addr::from(host))
            }
        };

        if !self.subnet.contains(&candidate) {
            return Err(Error::OutOfSubnet(candidate, self.subnet));
        }

        Ok(candidate)
    }
}

/// Number of bits needed to represent the big-endian unsigned integer
/// `bytes`, mirroring Python's `int.bit_length()`.
fn digest_bit_length(bytes: &[u8; 32]) -> usize {
    for (i, &b) in bytes.iter().enumerate() {
        if b != 0 {
            let byte_bits = 8 - b.leading_zeros() as usize;
            return (bytes.len() - 1 - i) * 8 + byte_bits;
        }
    }
    0
}
