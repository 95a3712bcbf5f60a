use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::net::Ipv4Addr;

use proxyscan_types::{ScanClass, ScanType};

/// The delay, in seconds, inserted between each retry pass.
pub const RETRY_DELAY_SECS: u64 = 300;

/// Normal-queue depth past which the engine should broadcast a lag warning.
pub const LAG_WARNING_THRESHOLD: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest {
    pub ip: Ipv4Addr,
    pub scan_type: ScanType,
    pub port: u16,
    pub class: ScanClass,
    pub not_before: u64,
}

/// Priority-queue entry: ordered so the heap pops the earliest `not_before`
/// first, breaking ties by insertion order (FIFO within the same instant).
struct Delayed {
    not_before: u64,
    seq: u64,
    request: ScanRequest,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before && self.seq == other.seq
    }
}
impl Eq for Delayed {}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.not_before, self.seq).cmp(&(other.not_before, other.seq))
    }
}

/// The normal FIFO queue plus the not-before-ordered priority queue,
/// together with the lag-warning latch.
pub struct ScanQueue {
    normal: VecDeque<ScanRequest>,
    priority: BinaryHeap<Reverse<Delayed>>,
    next_seq: u64,
    lag_warned: bool,
}

impl Default for ScanQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanQueue {
    pub fn new() -> Self {
        Self {
            normal: VecDeque::new(),
            priority: BinaryHeap::new(),
            next_seq: 0,
            lag_warned: false,
        }
    }

    pub fn enqueue(
        &mut self,
        ip: Ipv4Addr,
        scan_type: ScanType,
        port: u16,
        class: ScanClass,
        not_before: u64,
        now: u64,
    ) {
        let request = ScanRequest {
            ip,
            scan_type,
            port,
            class,
            not_before,
        };
        if not_before <= now && class == ScanClass::Normal {
            self.normal.push_back(request);
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.priority.push(Reverse(Delayed {
                not_before,
                seq,
                request,
            }));
        }
    }

    /// Pops the next eligible entry: priority-queue entries whose
    /// `not_before` has elapsed take precedence over the normal queue.
    pub fn pop_eligible(&mut self, now: u64) -> Option<ScanRequest> {
        if let Some(Reverse(top)) = self.priority.peek() {
            if top.not_before <= now {
                let Reverse(delayed) = self.priority.pop().unwrap();
                return Some(delayed.request);
            }
        }
        let popped = self.normal.pop_front();
        if popped.is_some() {
            self.update_lag_latch();
        }
        popped
    }

    /// Enqueues a NORMAL probe for `(scan_type, port)` against every IP in
    /// `ips` (clean cache hosts plus currently in-flight IPs), bypassing
    /// the cache. Used when an operator adds a scan type at runtime.
    pub fn scan_all(
        &mut self,
        scan_type: ScanType,
        port: u16,
        ips: impl IntoIterator<Item = Ipv4Addr>,
        now: u64,
    ) {
        for ip in ips {
            self.enqueue(ip, scan_type, port, ScanClass::Normal, now, now);
        }
    }

    pub fn normal_len(&self) -> usize {
        self.normal.len()
    }

    pub fn priority_len(&self) -> usize {
        self.priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.priority.is_empty()
    }

    /// Returns `Some(())` exactly once per threshold-crossing: the first
    /// time the normal queue exceeds [`LAG_WARNING_THRESHOLD`] after having
    /// drained below it (or since startup).
    fn update_lag_latch(&mut self) {
        if self.normal.len() <= LAG_WARNING_THRESHOLD {
            self.lag_warned = false;
        }
    }

    pub fn take_lag_warning(&mut self) -> Option<()> {
        if self.normal.len() > LAG_WARNING_THRESHOLD && !self.lag_warned {
            self.lag_warned = true;
            return Some(());
        }
        None
    }
}
