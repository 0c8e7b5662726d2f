//! Hosts-file cache.
//!
//! Maps virtual IPv6 addresses to hidden-service hostnames read from a
//! hosts-format file, refreshed when the file changes on disk. Entries
//! learned from reverse-DNS responses are cached alongside file entries.
//! The cache also serves as the pool of candidate nameservers for the
//! reverse-DNS lookup path: every known peer runs a resolver.

use parking_lot::Mutex;
use std::fmt;
use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Provenance of a cached entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NsSource {
    /// Read from the hosts file.
    HostsFile,
    /// Learned from a reverse-DNS response.
    Dns,
}

impl fmt::Display for NsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NsSource::HostsFile => "hosts-file",
            NsSource::Dns => "dns",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone, Debug)]
struct HostsEntry {
    addr: Ipv6Addr,
    name: String,
    source: NsSource,
}

/// Cache of address-to-hostname mappings.
///
/// Single struct owned behind a [`HostsHandle`]; all methods take short
/// lock scopes and never block on I/O other than re-reading the file.
#[derive(Debug)]
pub struct HostsDb {
    /// Hosts file path; `None` disables file loading.
    path: Option<PathBuf>,
    /// Only names carrying this suffix are cached.
    suffix: String,
    entries: Vec<HostsEntry>,
    /// Modification time of the file at last load.
    mtime: Option<SystemTime>,
    /// Round-robin cursor for nameserver selection.
    ns_cursor: usize,
}

/// Shared handle to the hosts cache.
pub type HostsHandle = Arc<Mutex<HostsDb>>;

/// Wrap a [`HostsDb`] into a shared handle.
pub fn hosts_handle(db: HostsDb) -> HostsHandle {
    Arc::new(Mutex::new(db))
}

impl HostsDb {
    /// Create a new cache backed by the given file.
    ///
    /// The file is not read until [`check`](Self::check) is called.
    pub fn new(path: Option<PathBuf>, suffix: &str) -> Self {
        Self {
            path,
            suffix: suffix.to_string(),
            entries: Vec::new(),
            mtime: None,
            ns_cursor: 0,
        }
    }

    /// Re-read the hosts file if it changed since the last load.
    ///
    /// Errors are logged, never propagated: a missing or unreadable file
    /// leaves the current entries in place.
    pub fn check(&mut self) {
        let Some(path) = self.path.clone() else {
            return;
        };

        let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "hosts file not readable");
                return;
            }
        };

        if self.mtime == Some(mtime) {
            return;
        }

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read hosts file");
                return;
            }
        };

        // Keep DNS-learned entries, rebuild the file-sourced ones.
        self.entries.retain(|e| e.source == NsSource::Dns);
        let mut added = 0usize;
        for line in contents.lines() {
            if let Some((addr, name)) = parse_hosts_line(line, &self.suffix) {
                if self.get_name(&addr).is_none() {
                    self.entries.push(HostsEntry {
                        addr,
                        name,
                        source: NsSource::HostsFile,
                    });
                    added += 1;
                }
            }
        }

        self.mtime = Some(mtime);
        info!(path = %path.display(), entries = added, "hosts file loaded");
    }

    /// Reverse lookup: hostname for a virtual address.
    pub fn get_name(&self, addr: &Ipv6Addr) -> Option<String> {
        self.entries
            .iter()
            .find(|e| e.addr == *addr)
            .map(|e| e.name.clone())
    }

    /// Pick a nameserver for the next reverse-DNS query.
    ///
    /// Round-robins over all cached entries, so repeated failures rotate
    /// through the known peers. Returns the address and its provenance.
    pub fn get_ns(&mut self) -> Option<(Ipv6Addr, NsSource)> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = &self.entries[self.ns_cursor % self.entries.len()];
        self.ns_cursor = self.ns_cursor.wrapping_add(1);
        Some((entry.addr, entry.source))
    }

    /// Insert or update an entry learned from a reverse-DNS response.
    pub fn add_dns(&mut self, addr: Ipv6Addr, name: String) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.addr == addr) {
            entry.name = name;
            entry.source = NsSource::Dns;
        } else {
            self.entries.push(HostsEntry {
                addr,
                name,
                source: NsSource::Dns,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse one hosts-file line into an address/name pair.
///
/// Lines are `<ipv6> <name> [aliases...]`; `#` starts a comment. The first
/// name carrying the configured suffix wins; lines without one are skipped.
fn parse_hosts_line(line: &str, suffix: &str) -> Option<(Ipv6Addr, String)> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return None;
    }

    let mut tokens = line.split_whitespace();
    let addr: Ipv6Addr = tokens.next()?.parse().ok()?;
    let name = tokens.find(|t| has_suffix_ignore_case(t, suffix))?;

    Some((addr, name.to_string()))
}

fn has_suffix_ignore_case(name: &str, suffix: &str) -> bool {
    name.len() > suffix.len()
        && name
            .get(name.len() - suffix.len()..)
            .is_some_and(|tail| tail.eq_ignore_ascii_case(suffix))
}
