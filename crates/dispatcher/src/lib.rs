use std::net::Ipv4Addr;

use anyhow::Result;

use proxyscan_cache::HostCache;
use proxyscan_queue::ScanQueue;
use proxyscan_types::{ScanClass, ScanConfigEntry, ScanStats, ScanType, GLINE_LIFETIME_SECS};

/// The engine's one seam onto the wider IRC-style network: issuing a
/// network-wide ban and notifying operators. Production wiring to a real
/// link is out of scope here; callers get a real implementation elsewhere
/// and a [`NullLink`] for benches and smoke runs.
#[allow(async_fn_in_trait)]
pub trait NetworkLink {
    async fn send_gline(&self, ip: Ipv4Addr, duration_secs: u32, gline_id: u64) -> Result<()>;
    async fn send_notice(&self, target: &str, message: &str) -> Result<()>;
}

/// Discards everything. Useful for benches, smoke runs, and anywhere a
/// link is required but nothing should actually be sent.
pub struct NullLink;

impl NetworkLink for NullLink {
    async fn send_gline(&self, _ip: Ipv4Addr, _duration_secs: u32, _gline_id: u64) -> Result<()> {
        Ok(())
    }

    async fn send_notice(&self, _target: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Point-in-time counters for an operator `status` request. Hit rates are
/// `None` rather than `NaN` when a class has not completed any scans yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub scans_done: u64,
    pub active: usize,
    pub queued: usize,
    pub clean_count: usize,
    pub dirty_count: usize,
    pub hit_rate_by_class: [Option<f64>; 5],
    pub uptime: String,
}

/// Expands new-user events and operator commands into Cache/Queue
/// operations. Holds the scan config entries; everything else it touches
/// (Cache, Queue, stats) is passed in by the caller, which owns it.
pub struct Dispatcher {
    scan_config: Vec<ScanConfigEntry>,
}

impl Dispatcher {
    pub fn new(scan_config: Vec<ScanConfigEntry>) -> Self {
        Self { scan_config }
    }

    pub fn scan_config(&self) -> &[ScanConfigEntry] {
        &self.scan_config
    }

    /// Handles a new-user appearance: gline immediately if the address is
    /// already known dirty, do nothing if known clean within the rescan
    /// interval, otherwise expand into one NORMAL probe per configured
    /// `(type, port)` pair.
    pub async fn on_new_user<L: NetworkLink>(
        &self,
        ip: Ipv4Addr,
        cache: &mut HostCache,
        queue: &mut ScanQueue,
        link: &L,
        now: u64,
    ) -> Result<()> {
        if let Some(host) = cache.find(ip, now) {
            if let Some(gline_id) = host.gline_id {
                link.send_gline(ip, GLINE_LIFETIME_SECS as u32, gline_id).await?;
            }
            return Ok(());
        }
        self.expand(ip, queue, now);
        Ok(())
    }

    fn expand(&self, ip: Ipv4Addr, queue: &mut ScanQueue, now: u64) {
        for entry in &self.scan_config {
            queue.enqueue(ip, entry.scan_type, entry.port, ScanClass::Normal, now, now);
        }
    }

    /// Operator `scan <ip>` command: bypasses the cache entirely and
    /// enqueues a NORMAL probe per configured entry immediately.
    pub fn force_scan(&self, ip: Ipv4Addr, queue: &mut ScanQueue, now: u64) {
        self.expand(ip, queue, now);
    }

    /// Adds a `(type, port)` entry if not already present, then enqueues a
    /// NORMAL probe for it against every clean cache host and every IP in
    /// `extra_ips` (typically the Runner's in-flight set) — enqueued
    /// alongside any scan already running on that IP, not waiting for it.
    pub fn add_scan_type(
        &mut self,
        scan_type: ScanType,
        port: u16,
        cache: &HostCache,
        queue: &mut ScanQueue,
        extra_ips: impl IntoIterator<Item = Ipv4Addr>,
        now: u64,
    ) -> bool {
        if self
            .scan_config
            .iter()
            .any(|e| e.scan_type == scan_type && e.port == port)
        {
            return false;
        }
        self.scan_config.push(ScanConfigEntry::new(scan_type, port));
        for ip in cache.clean_ips().collect::<Vec<_>>().into_iter().chain(extra_ips) {
            queue.enqueue(ip, scan_type, port, ScanClass::Normal, now, now);
        }
        true
    }

    /// Removes a `(type, port)` entry, preserving order of the remainder.
    /// Does not cancel any in-flight probe of that type; it simply stops
    /// being emitted by future expansions.
    pub fn del_scan_type(&mut self, scan_type: ScanType, port: u16) -> bool {
        let before = self.scan_config.len();
        self.scan_config
            .retain(|e| !(e.scan_type == scan_type && e.port == port));
        self.scan_config.len() != before
    }

    pub fn save(&self, cache: &HostCache) -> Result<()> {
        cache.dump()
    }

    pub fn on_stats_request(
        &self,
        cache: &HostCache,
        queue: &ScanQueue,
        active: usize,
        scan_stats: &ScanStats,
        uptime_secs: u64,
    ) -> Stats {
        let mut hit_rate_by_class = [None; 5];
        for class in ScanClass::ALL {
            let done = scan_stats.scans_by_class[class.index()];
            if done > 0 {
                let hits = scan_stats.hits_by_class[class.index()];
                hit_rate_by_class[class.index()] = Some(hits as f64 / done as f64);
            }
        }
        Stats {
            scans_done: scan_stats.scans_done,
            active,
            queued: queue.normal_len() + queue.priority_len(),
            clean_count: cache.clean_count(),
            dirty_count: cache.dirty_count(),
            hit_rate_by_class,
            uptime: proxyscan_util::format_duration(uptime_secs),
        }
    }
}
