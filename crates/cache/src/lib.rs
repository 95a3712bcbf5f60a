use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use proxyscan_types::{FoundProxy, ScanType, GLINE_LIFETIME_SECS};
use proxyscan_util::set_permissions_0600;

/// A cached host record. A record with an empty `proxies` list is "clean"
/// (recently probed, nothing found); a non-empty one is "dirty" (at least
/// one open proxy confirmed on it, under an active gline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHost {
    pub ip: Ipv4Addr,
    pub last_seen: u64,
    pub proxies: Vec<FoundProxy>,
    pub gline_id: Option<u64>,
    pub gline_expiry: Option<u64>,
}

impl CacheHost {
    fn new_clean(ip: Ipv4Addr, now: u64) -> Self {
        Self {
            ip,
            last_seen: now,
            proxies: Vec::new(),
            gline_id: None,
            gline_expiry: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        !self.proxies.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDump {
    version: u32,
    hosts: Vec<CacheHost>,
}

/// The host cache: one map keyed by IPv4 address, spanning both the clean
/// and dirty logical indices. `clean_count`/`dirty_count` split them back
/// out for reporting. Persisted as a single JSON document at `path`.
pub struct HostCache {
    hosts: HashMap<Ipv4Addr, CacheHost>,
    rescan_interval: u64,
    next_gline_id: u64,
    broken_db: bool,
    path: PathBuf,
}

impl HostCache {
    pub fn new(path: PathBuf, rescan_interval: u64) -> Self {
        Self {
            hosts: HashMap::new(),
            rescan_interval,
            next_gline_id: 1,
            broken_db: false,
            path,
        }
    }

    pub fn broken_db(&self) -> bool {
        self.broken_db
    }

    /// Looks up a host, lazily evicting it first if it is a clean record
    /// whose `last_seen` has aged past `rescan_interval`.
    pub fn find(&mut self, ip: Ipv4Addr, now: u64) -> Option<&CacheHost> {
        let stale = self
            .hosts
            .get(&ip)
            .map(|h| h.is_clean() && now.saturating_sub(h.last_seen) > self.rescan_interval)
            .unwrap_or(false);
        if stale {
            self.hosts.remove(&ip);
            return None;
        }
        self.hosts.get(&ip)
    }

    /// Marks a host as freshly probed and clean. Idempotent: refreshes
    /// `last_seen` if the host is already clean, leaves a dirty host alone.
    pub fn add_clean(&mut self, ip: Ipv4Addr, now: u64) -> &CacheHost {
        let entry = self
            .hosts
            .entry(ip)
            .or_insert_with(|| CacheHost::new_clean(ip, now));
        if entry.is_clean() {
            entry.last_seen = now;
        }
        entry
    }

    /// Records a confirmed open proxy against a host, promoting it to dirty
    /// if it wasn't already and assigning a gline id/expiry on first hit.
    pub fn record_proxy(
        &mut self,
        ip: Ipv4Addr,
        scan_type: ScanType,
        port: u16,
        now: u64,
    ) -> &CacheHost {
        let entry = self
            .hosts
            .entry(ip)
            .or_insert_with(|| CacheHost::new_clean(ip, now));
        entry.last_seen = now;
        if !entry
            .proxies
            .iter()
            .any(|p| p.scan_type == scan_type && p.port == port)
        {
            entry.proxies.push(FoundProxy { scan_type, port });
        }
        if entry.gline_id.is_none() {
            entry.gline_id = Some(self.next_gline_id);
            entry.gline_expiry = Some(now + GLINE_LIFETIME_SECS);
            self.next_gline_id += 1;
        }
        entry
    }

    /// Looks up a host without evicting it, regardless of staleness. Used
    /// by shutdown bookkeeping, which needs to see pending clean records
    /// rather than have them silently disappear from under it.
    pub fn peek(&self, ip: Ipv4Addr) -> Option<&CacheHost> {
        self.hosts.get(&ip)
    }

    pub fn delete(&mut self, ip: Ipv4Addr) -> Option<CacheHost> {
        self.hosts.remove(&ip)
    }

    /// Removes clean hosts aged out by `rescan_interval` and dirty hosts
    /// whose gline has expired. Returns the number of records dropped.
    pub fn sweep_expired(&mut self, now: u64) -> usize {
        let before = self.hosts.len();
        self.hosts.retain(|_, h| {
            if h.is_clean() {
                now.saturating_sub(h.last_seen) <= self.rescan_interval
            } else {
                h.gline_expiry.map(|expiry| now < expiry).unwrap_or(true)
            }
        });
        before - self.hosts.len()
    }

    /// IPs of every currently clean host, for `scan_all`-style expansion
    /// when an operator adds a scan type at runtime.
    pub fn clean_ips(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.hosts.values().filter(|h| h.is_clean()).map(|h| h.ip)
    }

    pub fn clean_count(&self) -> usize {
        self.hosts.values().filter(|h| h.is_clean()).count()
    }

    pub fn dirty_count(&self) -> usize {
        self.hosts.values().filter(|h| h.is_dirty()).count()
    }

    pub fn dump(&self) -> Result<()> {
        let dump = CacheDump {
            version: 1,
            hosts: self.hosts.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&dump)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, data)
            .with_context(|| format!("failed to write cache to {}", self.path.display()))?;
        set_permissions_0600(&self.path)?;
        Ok(())
    }

    /// Loads the cache from disk. A missing file is not an error (fresh
    /// start, cache stays empty). A corrupt file sets `broken_db` and the
    /// cache continues empty rather than aborting startup.
    pub fn load(&mut self) {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(_) => return,
        };
        match serde_json::from_slice::<CacheDump>(&data) {
            Ok(dump) => {
                self.next_gline_id = dump
                    .hosts
                    .iter()
                    .filter_map(|h| h.gline_id)
                    .max()
                    .map(|m| m + 1)
                    .unwrap_or(1);
                self.hosts = dump.hosts.into_iter().map(|h| (h.ip, h)).collect();
                self.broken_db = false;
            }
            Err(_) => {
                self.broken_db = true;
                self.hosts.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}-{now}.json"))
    }

    #[test]
    fn add_clean_is_idempotent_and_refreshes_last_seen() {
        let mut cache = HostCache::new(temp_path("proxyscan-cache-clean"), 3600);
        let ip = Ipv4Addr::new(192, 0, 2, 10);
        cache.add_clean(ip, 1_000);
        cache.add_clean(ip, 1_500);
        let host = cache.find(ip, 1_500).unwrap();
        assert_eq!(host.last_seen, 1_500);
        assert!(host.is_clean());
        assert_eq!(cache.clean_count(), 1);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn record_proxy_promotes_host_to_dirty_and_assigns_gline() {
        let mut cache = HostCache::new(temp_path("proxyscan-cache-dirty"), 3600);
        let ip = Ipv4Addr::new(192, 0, 2, 20);
        cache.add_clean(ip, 1_000);
        let host = cache.record_proxy(ip, ScanType::Socks4, 1080, 1_010);
        assert!(host.is_dirty());
        assert_eq!(host.gline_id, Some(1));
        assert_eq!(host.gline_expiry, Some(1_010 + GLINE_LIFETIME_SECS));
        assert_eq!(cache.clean_count(), 0);
        assert_eq!(cache.dirty_count(), 1);

        // a second hit on the same host does not reassign the gline id
        let host = cache.record_proxy(ip, ScanType::Http, 8080, 1_020);
        assert_eq!(host.gline_id, Some(1));
        assert_eq!(host.proxies.len(), 2);
    }

    #[test]
    fn find_lazily_evicts_stale_clean_hosts_but_leaves_dirty_ones() {
        let mut cache = HostCache::new(temp_path("proxyscan-cache-evict"), 100);
        let clean_ip = Ipv4Addr::new(192, 0, 2, 30);
        let dirty_ip = Ipv4Addr::new(192, 0, 2, 31);
        cache.add_clean(clean_ip, 1_000);
        cache.record_proxy(dirty_ip, ScanType::Wingate, 23, 1_000);

        assert!(cache.find(clean_ip, 1_050).is_some());
        assert!(cache.find(clean_ip, 1_200).is_none());
        assert!(cache.find(dirty_ip, 1_200).is_some());
    }

    #[test]
    fn sweep_expired_drops_stale_clean_and_expired_dirty_hosts() {
        let mut cache = HostCache::new(temp_path("proxyscan-cache-sweep"), 100);
        let clean_ip = Ipv4Addr::new(192, 0, 2, 40);
        let dirty_ip = Ipv4Addr::new(192, 0, 2, 41);
        cache.add_clean(clean_ip, 1_000);
        cache.record_proxy(dirty_ip, ScanType::Cisco, 23, 1_000);

        let now = 1_000 + GLINE_LIFETIME_SECS + 200;
        let dropped = cache.sweep_expired(now);
        assert_eq!(dropped, 2);
        assert_eq!(cache.clean_count(), 0);
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn dump_and_load_round_trip_preserves_records() {
        let path = temp_path("proxyscan-cache-roundtrip");
        let mut cache = HostCache::new(path.clone(), 3600);
        let clean_ip = Ipv4Addr::new(192, 0, 2, 50);
        let dirty_ip = Ipv4Addr::new(192, 0, 2, 51);
        cache.add_clean(clean_ip, 1_000);
        cache.record_proxy(dirty_ip, ScanType::Socks5, 1080, 1_010);
        cache.dump().unwrap();

        let mut reloaded = HostCache::new(path.clone(), 3600);
        reloaded.load();
        assert!(!reloaded.broken_db());
        assert_eq!(reloaded.clean_count(), 1);
        assert_eq!(reloaded.dirty_count(), 1);
        let host = reloaded.find(dirty_ip, 1_010).unwrap();
        assert_eq!(host.proxies[0].port, 1080);
        assert_eq!(host.gline_id, Some(1));

        // a fresh record_proxy call must not collide with the reloaded id
        let other_ip = Ipv4Addr::new(192, 0, 2, 52);
        let host = reloaded.record_proxy(other_ip, ScanType::Http, 8080, 1_020);
        assert_eq!(host.gline_id, Some(2));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn load_of_corrupt_file_sets_broken_db_and_stays_empty() {
        let path = temp_path("proxyscan-cache-corrupt");
        fs::write(&path, b"not json").unwrap();
        let mut cache = HostCache::new(path.clone(), 3600);
        cache.load();
        assert!(cache.broken_db());
        assert_eq!(cache.clean_count(), 0);
        assert_eq!(cache.dirty_count(), 0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn load_of_missing_file_is_not_broken() {
        let path = temp_path("proxyscan-cache-missing");
        let mut cache = HostCache::new(path, 3600);
        cache.load();
        assert!(!cache.broken_db());
    }
}
