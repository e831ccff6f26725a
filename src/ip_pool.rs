//! Weighted pool of egress source addresses
//!
//! A pool is an ordered list of subnets, each weighted by its number of usable
//! addresses. An index in `[0, total)` maps to a concrete address by walking
//! the subnets in order. Subnets covering at least 4 addresses exclude the
//! network and broadcast addresses; smaller prefixes use every address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{anyhow, bail, Result};
use ipnet::IpNet;
use rand::Rng;
use sha2::{Digest, Sha256};

#[derive(Debug)]
pub struct IpPool {
    subnets: Vec<IpNet>,
    weights: Vec<u128>,
    total: u128,
}

/// Number of usable addresses in the subnet.
fn usable_ip_count(net: &IpNet) -> u128 {
    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    let total = if host_bits >= 128 {
        u128::MAX
    } else {
        1u128 << host_bits
    };
    if total >= 4 {
        // Exclude network and broadcast addresses
        total - 2
    } else {
        total
    }
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// `(a + b) mod m`, overflow-safe for `a, b < m`.
fn add_mod(a: u128, b: u128, m: u128) -> u128 {
    if a >= m - b {
        a - (m - b)
    } else {
        a + b
    }
}

impl IpPool {
    /// Parse each input as a bare IP (/32 or /128) or a CIDR.
    ///
    /// Fails when any input does not parse or no input yields usable
    /// addresses.
    pub fn new<S: AsRef<str>>(subnets: &[S]) -> Result<Self> {
        let mut pool = IpPool {
            subnets: Vec::new(),
            weights: Vec::new(),
            total: 0,
        };

        for subnet in subnets {
            let subnet = subnet.as_ref().trim();
            let net = if let Ok(ip) = subnet.parse::<IpAddr>() {
                match ip {
                    IpAddr::V4(_) => IpNet::new(ip, 32),
                    IpAddr::V6(_) => IpNet::new(ip, 128),
                }
                .expect("host prefix length is always valid")
            } else if let Ok(net) = subnet.parse::<IpNet>() {
                net.trunc()
            } else {
                bail!("invalid IP or CIDR: {subnet}");
            };

            let count = usable_ip_count(&net);
            if count == 0 {
                continue;
            }
            pool.subnets.push(net);
            pool.weights.push(count);
            pool.total = pool.total.saturating_add(count);
        }

        if pool.subnets.is_empty() {
            return Err(anyhow!("no valid subnets with usable IPs provided"));
        }
        Ok(pool)
    }

    pub fn total(&self) -> u128 {
        self.total
    }

    /// Deterministic pick: SHA-256 of the key, reduced modulo the pool total.
    pub fn get_by_key(&self, key: &str) -> IpAddr {
        let digest = Sha256::digest(key.as_bytes());

        // Fold the 256-bit digest modulo total, big-endian, so the whole
        // digest participates in the reduction.
        let mut index: u128 = 0;
        for &byte in digest.iter() {
            // index = (index * 256 + byte) % total, without overflowing u128
            for _ in 0..8 {
                index = add_mod(index, index, self.total);
            }
            index = add_mod(index, u128::from(byte) % self.total, self.total);
        }

        self.ip_from_index(index)
    }

    /// Uniform random pick over the usable addresses.
    pub fn get_randomly(&self) -> IpAddr {
        let index = rand::thread_rng().gen_range(0..self.total);
        self.ip_from_index(index)
    }

    /// True iff `ip` lies in any configured subnet.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.subnets.iter().any(|net| net.contains(&ip))
    }

    fn ip_from_index(&self, index: u128) -> IpAddr {
        let mut current = 0u128;
        for (net, &weight) in self.subnets.iter().zip(self.weights.iter()) {
            let next = current.saturating_add(weight);
            if index >= current && index < next {
                return Self::ip_from_subnet(net, index - current);
            }
            current = next;
        }

        // fallback
        Self::ip_from_subnet(&self.subnets[0], 0)
    }

    fn ip_from_subnet(net: &IpNet, offset: u128) -> IpAddr {
        let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
        // Skip the network address for subnets whose count excludes it
        let start_offset = if host_bits >= 2 { 1u128 } else { 0 };

        let addr = ip_to_u128(net.network()) + start_offset + offset;
        match net {
            IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(addr as u32)),
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(addr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(subnets: &[&str]) -> IpPool {
        IpPool::new(subnets).unwrap()
    }

    fn enumerate(p: &IpPool) -> Vec<String> {
        (0..p.total()).map(|i| p.ip_from_index(i).to_string()).collect()
    }

    #[test]
    fn test_usable_ip_count() {
        let cases = [
            ("192.168.0.1/32", 1u128),
            ("192.168.0.0/31", 2),
            ("192.168.0.0/30", 2),
            ("192.168.0.0/29", 6),
            ("192.168.0.0/24", 254),
            ("10.0.0.0/16", 65534),
            ("2001:db8::1/128", 1),
            ("2001:db8::/127", 2),
            ("2001:db8::/126", 2),
            ("2001:db8::/125", 6),
            ("2001:db8::/120", 254),
            ("2001:db8:cafe::/64", (1u128 << 64) - 2),
        ];
        for (cidr, expected) in cases {
            let net: IpNet = cidr.parse().unwrap();
            assert_eq!(usable_ip_count(&net.trunc()), expected, "cidr {cidr}");
        }
    }

    #[test]
    fn test_new_pool_totals() {
        assert_eq!(pool(&["192.168.1.1"]).total(), 1);
        assert_eq!(pool(&["192.168.1.0/24"]).total(), 254);
        assert_eq!(pool(&["192.168.1.0/30"]).total(), 2);
        assert_eq!(pool(&["2001:db8::1"]).total(), 1);
        assert_eq!(
            pool(&["192.168.1.1", "10.0.0.0/30", "2001:db8:1::/127"]).total(),
            1 + 2 + 2
        );
    }

    #[test]
    fn test_new_pool_errors() {
        let err = IpPool::new(&["invalid"]).unwrap_err();
        assert!(err.to_string().contains("invalid IP or CIDR: invalid"));

        let err = IpPool::new::<&str>(&[]).unwrap_err();
        assert!(err.to_string().contains("no valid subnets"));

        let err = IpPool::new(&["192.168.2.10/32", "invalid-cidr", "10.10.0.0/24"]).unwrap_err();
        assert!(err.to_string().contains("invalid-cidr"));
    }

    #[test]
    fn test_ip_from_index_enumeration_v4() {
        let p = pool(&["192.168.1.0/29", "192.168.2.0/30", "172.16.0.0/31", "10.0.0.5/32"]);
        assert_eq!(
            enumerate(&p),
            vec![
                // /29 and /30 skip network and broadcast
                "192.168.1.1", "192.168.1.2", "192.168.1.3", "192.168.1.4", "192.168.1.5",
                "192.168.1.6",
                "192.168.2.1", "192.168.2.2",
                // /31 and /32 use every address
                "172.16.0.0", "172.16.0.1",
                "10.0.0.5",
            ]
        );
    }

    #[test]
    fn test_ip_from_index_enumeration_v6() {
        let p = pool(&["2001::/125", "2001:db8::/127", "2001:db8:cafe::a/128"]);
        assert_eq!(
            enumerate(&p),
            vec![
                "2001::1", "2001::2", "2001::3", "2001::4", "2001::5", "2001::6",
                "2001:db8::", "2001:db8::1",
                "2001:db8:cafe::a",
            ]
        );
    }

    #[test]
    fn test_get_by_key_deterministic() {
        let p = pool(&["192.168.1.0/24"]);
        let a = p.get_by_key("203.0.113.9");
        let b = p.get_by_key("203.0.113.9");
        assert_eq!(a, b);
        assert!(p.contains(a));
    }

    #[test]
    fn test_get_randomly_within_pool() {
        let p = pool(&["192.168.1.0/29", "10.0.0.0/30"]);
        let members = enumerate(&p);
        for _ in 0..100 {
            let ip = p.get_randomly().to_string();
            assert!(members.contains(&ip), "{ip} not in pool");
        }
    }

    #[test]
    fn test_contains() {
        let p = pool(&["10.0.0.0/8", "192.168.1.1"]);
        assert!(p.contains("10.1.2.3".parse().unwrap()));
        assert!(p.contains("192.168.1.1".parse().unwrap()));
        assert!(!p.contains("192.168.1.2".parse().unwrap()));
        assert!(!p.contains("8.8.8.8".parse().unwrap()));
    }
}
