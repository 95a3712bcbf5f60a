use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};

use proxyscan_cache::HostCache;
use proxyscan_probe::drive_probe;
use proxyscan_queue::{ScanQueue, ScanRequest, RETRY_DELAY_SECS};
use proxyscan_types::{Outcome, Phase, ScanClass, ScanStats, ScanType};

/// A completed probe reported back from its spawned task.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub ip: Ipv4Addr,
    pub scan_type: ScanType,
    pub port: u16,
    pub class: ScanClass,
    pub outcome: Outcome,
    pub phase: Phase,
}

/// A freshly confirmed open proxy, returned by [`Runner::finish`] so the
/// caller can emit a gline and log the detection.
#[derive(Debug, Clone, Copy)]
pub struct ProxyHit {
    pub ip: Ipv4Addr,
    pub scan_type: ScanType,
    pub port: u16,
    pub class: ScanClass,
    pub gline_id: u64,
}

/// Owns the concurrency ceiling and the set of in-flight `(ip, type, port)`
/// keys. Each probe runs as its own spawned task (mirroring a connection
/// task that owns its connect/write/read loop end to end); completions are
/// reported back over an mpsc channel and processed one at a time by
/// whichever task calls [`Runner::next_completion`] — so all cache/queue
/// mutation in [`Runner::finish`] happens without any internal locking.
pub struct Runner {
    semaphore: Arc<Semaphore>,
    in_flight: HashSet<(Ipv4Addr, ScanType, u16)>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    my_ip: Ipv4Addr,
    my_port: u16,
    magic: Vec<u8>,
    timeout: Duration,
}

impl Runner {
    pub fn new(maxscans: usize, my_ip: Ipv4Addr, my_port: u16, magic: Vec<u8>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            semaphore: Arc::new(Semaphore::new(maxscans)),
            in_flight: HashSet::new(),
            tx,
            rx,
            my_ip,
            my_port,
            magic,
            timeout,
        }
    }

    pub fn active_count(&self) -> usize {
        self.in_flight.len()
    }

    fn is_in_flight(&self, ip: Ipv4Addr, scan_type: ScanType, port: u16) -> bool {
        self.in_flight.contains(&(ip, scan_type, port))
    }

    /// Spawns a probe task for `req`, honoring the per-`(ip, type, port)`
    /// exclusivity invariant and the concurrency ceiling. Returns `false`
    /// without consuming a slot if either is violated; the caller should
    /// leave `req` in the queue (exclusivity) or re-enqueue it (ceiling).
    pub fn start_probe(&mut self, req: ScanRequest) -> bool {
        if self.is_in_flight(req.ip, req.scan_type, req.port) {
            return false;
        }
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return false,
        };
        self.in_flight.insert((req.ip, req.scan_type, req.port));

        let tx = self.tx.clone();
        let my_ip = self.my_ip;
        let my_port = self.my_port;
        let magic = self.magic.clone();
        let timeout = self.timeout;
        let ScanRequest {
            ip,
            scan_type,
            port,
            class,
            ..
        } = req;

        tokio::spawn(async move {
            let _permit = permit;
            let (outcome, phase) = match tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await {
                Ok(Ok(mut stream)) => {
                    match drive_probe(&mut stream, scan_type, my_ip, my_port, &magic, timeout).await {
                        Ok(result) => (result.outcome, result.final_phase),
                        Err(_) => (Outcome::Closed, Phase::SentRequest),
                    }
                }
                Ok(Err(_)) | Err(_) => (Outcome::Closed, Phase::Connecting),
            };
            let _ = tx.send(Completion {
                ip,
                scan_type,
                port,
                class,
                outcome,
                phase,
            });
        });
        true
    }

    pub async fn next_completion(&mut self) -> Option<Completion> {
        self.rx.recv().await
    }

    /// Non-blocking drain of any completion already waiting in the channel.
    pub fn try_next_completion(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }

    /// IPs of every probe currently in flight, regardless of type/port.
    pub fn in_flight_ips(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.in_flight.iter().map(|(ip, _, _)| *ip)
    }

    /// The class a CLOSED completion advances to on its next retry pass,
    /// or `None` if the chain ends here.
    fn follow_up_class(class: ScanClass, phase: Phase) -> Option<ScanClass> {
        match class {
            ScanClass::Normal => match phase {
                Phase::SentRequest | Phase::GotResponse => Some(ScanClass::Pass2),
                Phase::Connecting => None,
            },
            ScanClass::Check => Some(ScanClass::Pass2),
            ScanClass::Pass2 => Some(ScanClass::Pass3),
            ScanClass::Pass3 => Some(ScanClass::Pass4),
            ScanClass::Pass4 => None,
        }
    }

    /// Applies `kill_sock`'s bookkeeping for one completion: releases the
    /// in-flight slot, updates stats, and either records a confirmed open
    /// proxy in the cache or enqueues the next retry pass. Returns
    /// `Some(ProxyHit)` exactly when this completion confirmed a new open
    /// proxy, so the caller can emit a gline and log the finding.
    pub fn finish(
        &mut self,
        completion: Completion,
        cache: &mut HostCache,
        queue: &mut ScanQueue,
        stats: &mut ScanStats,
        now: u64,
    ) -> Option<ProxyHit> {
        self.in_flight
            .remove(&(completion.ip, completion.scan_type, completion.port));
        stats.record_completion(completion.class);

        match completion.outcome {
            Outcome::Open => {
                stats.record_hit(completion.class);
                let host = cache.record_proxy(completion.ip, completion.scan_type, completion.port, now);
                Some(ProxyHit {
                    ip: completion.ip,
                    scan_type: completion.scan_type,
                    port: completion.port,
                    class: completion.class,
                    gline_id: host.gline_id.unwrap_or(0),
                })
            }
            Outcome::Closed => {
                if let Some(next_class) = Self::follow_up_class(completion.class, completion.phase) {
                    queue.enqueue(
                        completion.ip,
                        completion.scan_type,
                        completion.port,
                        next_class,
                        now + RETRY_DELAY_SECS,
                        now,
                    );
                }
                None
            }
            Outcome::InProgress => None,
        }
    }

    /// Shutdown sweep: for every IP still in flight, drop its cache entry
    /// if it is a pending clean record (never confirmed), so a scan that
    /// never finished isn't persisted as falsely clean. Does not wait for
    /// spawned tasks to land; they are abandoned along with the runtime.
    pub fn kill_all(&mut self, cache: &mut HostCache) {
        for (ip, _, _) in self.in_flight.drain() {
            if cache.peek(ip).map(|h| h.is_clean()).unwrap_or(false) {
                cache.delete(ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn req(ip: Ipv4Addr, scan_type: ScanType, port: u16, class: ScanClass) -> ScanRequest {
        ScanRequest {
            ip,
            scan_type,
            port,
            class,
            not_before: 0,
        }
    }

    #[tokio::test]
    async fn start_probe_rejects_duplicate_in_flight_key() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 256];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(b"MARK unrelated banner").await;
                });
            }
        });

        let mut runner = Runner::new(
            10,
            Ipv4Addr::new(127, 0, 0, 1),
            9999,
            b"MARK".to_vec(),
            Duration::from_secs(5),
        );
        let ip = Ipv4Addr::LOCALHOST;
        let first = req(ip, ScanType::Http, addr.port(), ScanClass::Normal);
        let second = req(ip, ScanType::Http, addr.port(), ScanClass::Normal);
        assert!(runner.start_probe(first));
        assert!(!runner.start_probe(second));
    }

    #[tokio::test]
    async fn start_probe_respects_concurrency_ceiling() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((_socket, _)) = listener.accept().await else {
                    break;
                };
            }
        });

        let mut runner = Runner::new(
            1,
            Ipv4Addr::new(127, 0, 0, 1),
            9999,
            b"MARK".to_vec(),
            Duration::from_secs(5),
        );
        let first = req(Ipv4Addr::new(10, 0, 0, 1), ScanType::Http, addr.port(), ScanClass::Normal);
        let second = req(Ipv4Addr::new(10, 0, 0, 2), ScanType::Http, addr.port(), ScanClass::Normal);
        assert!(runner.start_probe(first));
        assert!(!runner.start_probe(second));
    }

    #[tokio::test]
    async fn finish_records_open_hit_and_returns_proxy_hit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(b"hi MARK").await.unwrap();
        });

        let mut runner = Runner::new(
            10,
            Ipv4Addr::new(127, 0, 0, 1),
            9999,
            b"MARK".to_vec(),
            Duration::from_secs(5),
        );
        let ip = Ipv4Addr::LOCALHOST;
        let request = req(ip, ScanType::Http, addr.port(), ScanClass::Normal);
        assert!(runner.start_probe(request));
        let completion = runner.next_completion().await.unwrap();
        assert_eq!(completion.outcome, Outcome::Open);

        let mut cache = HostCache::new(std::env::temp_dir().join("unused-runner-test.json"), 3600);
        let mut queue = ScanQueue::new();
        let mut stats = ScanStats::default();
        let hit = runner
            .finish(completion, &mut cache, &mut queue, &mut stats, 1_000)
            .unwrap();
        assert_eq!(hit.ip, ip);
        assert_eq!(stats.hits_by_class[ScanClass::Normal.index()], 1);
        assert_eq!(runner.active_count(), 0);
    }

    #[tokio::test]
    async fn finish_on_closed_normal_enqueues_pass2() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 256];
            let _ = socket.read(&mut buf).await.unwrap();
            // close without sending the magic string at all
        });

        let mut runner = Runner::new(
            10,
            Ipv4Addr::new(127, 0, 0, 1),
            9999,
            b"MARK".to_vec(),
            Duration::from_secs(5),
        );
        let ip = Ipv4Addr::LOCALHOST;
        let request = req(ip, ScanType::Http, addr.port(), ScanClass::Normal);
        assert!(runner.start_probe(request));
        let completion = runner.next_completion().await.unwrap();
        assert_eq!(completion.outcome, Outcome::Closed);

        let mut cache = HostCache::new(std::env::temp_dir().join("unused-runner-test2.json"), 3600);
        let mut queue = ScanQueue::new();
        let mut stats = ScanStats::default();
        let hit = runner.finish(completion, &mut cache, &mut queue, &mut stats, 1_000);
        assert!(hit.is_none());
        let popped = queue.pop_eligible(1_000 + RETRY_DELAY_SECS).unwrap();
        assert_eq!(popped.class, ScanClass::Pass2);
        assert_eq!(popped.ip, ip);
    }

    #[test]
    fn kill_all_drops_pending_clean_entries_but_leaves_confirmed_dirty_ones() {
        let mut runner = Runner::new(
            10,
            Ipv4Addr::new(127, 0, 0, 1),
            9999,
            b"MARK".to_vec(),
            Duration::from_secs(5),
        );
        let mut cache = HostCache::new(std::env::temp_dir().join("unused-runner-test3.json"), 3600);
        let pending_ip = Ipv4Addr::new(192, 0, 2, 1);
        let dirty_ip = Ipv4Addr::new(192, 0, 2, 2);
        cache.add_clean(pending_ip, 1_000);
        cache.record_proxy(dirty_ip, ScanType::Socks4, 1080, 1_000);

        runner.in_flight.insert((pending_ip, ScanType::Http, 8080));
        runner.in_flight.insert((dirty_ip, ScanType::Socks4, 1080));
        runner.kill_all(&mut cache);

        assert!(cache.peek(pending_ip).is_none());
        assert!(cache.peek(dirty_ip).is_some());
    }
}
