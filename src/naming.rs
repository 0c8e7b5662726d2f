//! Virtual address to hostname translation.
//!
//! Every overlay peer is addressed by a virtual IPv6 address whose low 80
//! bits are a base32 rendition of its hidden-service label. Translation
//! first consults the hosts cache (when enabled), so operators can map
//! addresses to full-length service names; otherwise the name is derived
//! deterministically from the address itself.

use crate::config::NamingConfig;
use crate::hosts::HostsHandle;
use std::net::Ipv6Addr;

/// RFC 4648 base32 alphabet, lowercase, as used in hidden-service labels.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// A hostname produced by [`resolve_name`], tagged with how it was found.
///
/// Callers use the variant to tell a looked-up name from a synthesized one:
/// a derived name may be a short label the proxy cannot resolve, which is
/// what makes the reverse-DNS path worth trying first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedName {
    /// Found in the hosts cache.
    Hosts(String),
    /// Synthesized from the address bits and the configured domain.
    Derived(String),
}

impl ResolvedName {
    /// The hostname, however it was obtained.
    pub fn name(&self) -> &str {
        match self {
            ResolvedName::Hosts(n) | ResolvedName::Derived(n) => n,
        }
    }

    /// Whether the name came from the hosts cache.
    pub fn from_hosts(&self) -> bool {
        matches!(self, ResolvedName::Hosts(_))
    }

    /// Consume into the hostname string.
    pub fn into_name(self) -> String {
        match self {
            ResolvedName::Hosts(n) | ResolvedName::Derived(n) => n,
        }
    }
}

/// Derive the hidden-service hostname encoded in a virtual address.
///
/// Encodes the low 80 bits (bytes 6..16, past the /48 overlay prefix) as
/// a 16-character base32 label and appends the domain suffix. Total: the
/// encoding never fails.
pub fn derive_hostname(addr: &Ipv6Addr, domain: &str) -> String {
    let octets = addr.octets();
    let mut name = base32_encode(&octets[6..16]);
    name.push_str(domain);
    name
}

/// Translate a virtual address to a hostname.
///
/// Refreshes and consults the hosts cache when `hosts_lookup` is enabled,
/// falling back to the deterministic encoding on a miss.
pub fn resolve_name(addr: &Ipv6Addr, cfg: &NamingConfig, hosts: &HostsHandle) -> ResolvedName {
    if cfg.hosts_lookup {
        let mut db = hosts.lock();
        db.check();
        if let Some(name) = db.get_name(addr) {
            return ResolvedName::Hosts(name);
        }
    }

    ResolvedName::Derived(derive_hostname(addr, cfg.domain()))
}

/// Base32-encode a byte string (RFC 4648 alphabet, lowercase, no padding).
fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut acc: u32 = 0;
    let mut bits = 0u32;

    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::{hosts_handle, HostsDb};

    #[test]
    fn test_base32_encode() {
        assert_eq!(base32_encode(&[]), "");
        assert_eq!(base32_encode(&[0x00]), "aa");
        assert_eq!(base32_encode(&[0xff; 10]), "7777777777777777");
        // "foobar" test vector from RFC 4648, lowercased, unpadded
        assert_eq!(base32_encode(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn test_derive_hostname() {
        let addr: Ipv6Addr = "fd87:d87e:eb43::1".parse().unwrap();
        // Low 80 bits are zero except the last; 16-char label
        assert_eq!(derive_hostname(&addr, ".onion"), "aaaaaaaaaaaaaaab.onion");

        let addr: Ipv6Addr = "fd87:d87e:eb43:ffff:ffff:ffff:ffff:ffff".parse().unwrap();
        assert_eq!(derive_hostname(&addr, ".onion"), "7777777777777777.onion");
    }

    #[test]
    fn test_derive_hostname_label_length() {
        let addr: Ipv6Addr = "fd87:d87e:eb43:1234:5678:9abc:def0:1357".parse().unwrap();
        let name = derive_hostname(&addr, "");
        assert_eq!(name.len(), 16);
        assert!(name.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_resolve_name_derived_when_lookup_disabled() {
        let addr: Ipv6Addr = "fd87:d87e:eb43::1".parse().unwrap();
        let hosts = hosts_handle(HostsDb::new(None, ".onion"));
        let cfg = NamingConfig::default();

        let resolved = resolve_name(&addr, &cfg, &hosts);
        assert!(!resolved.from_hosts());
        assert_eq!(resolved.name(), "aaaaaaaaaaaaaaab.onion");
    }

    #[test]
    fn test_resolve_name_prefers_hosts_entry() {
        let addr: Ipv6Addr = "fd87:d87e:eb43::1".parse().unwrap();
        let hosts = hosts_handle(HostsDb::new(None, ".onion"));
        hosts
            .lock()
            .add_dns(addr, "facebookcorewwwi.onion".to_string());

        let cfg = NamingConfig {
            hosts_lookup: true,
            ..Default::default()
        };

        let resolved = resolve_name(&addr, &cfg, &hosts);
        assert!(resolved.from_hosts());
        assert_eq!(resolved.name(), "facebookcorewwwi.onion");

        // Miss still falls back to the derived name
        let other: Ipv6Addr = "fd87:d87e:eb43::2".parse().unwrap();
        let resolved = resolve_name(&other, &cfg, &hosts);
        assert!(!resolved.from_hosts());
        assert_eq!(resolved.name(), "aaaaaaaaaaaaaaac.onion");
    }
}
