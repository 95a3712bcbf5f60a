use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use proxyscan_cache::HostCache;
use proxyscan_dispatcher::{Dispatcher, NetworkLink, Stats};
use proxyscan_queue::ScanQueue;
use proxyscan_runner::Runner;
use proxyscan_types::{ScanConfigEntry, ScanStats, ScanType, GLINE_LIFETIME_SECS};
use proxyscan_util::log::DetectionLog;

use crate::config::Config;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Owns every piece of engine state behind `&mut self`: the Cache, the
/// Queue, the Runner's in-flight set and concurrency ceiling, the
/// Dispatcher's scan config, and the statistics counters. All mutation
/// happens on whichever task calls these methods — there is exactly one
/// such task in normal operation (the dispatch loop in [`Engine::run`]).
pub struct Engine {
    config: Config,
    cache: HostCache,
    queue: ScanQueue,
    runner: Runner,
    dispatcher: Dispatcher,
    stats: ScanStats,
    log: DetectionLog,
    started_at: u64,
}

impl Engine {
    pub fn new(config: Config, scan_config: Vec<ScanConfigEntry>) -> Self {
        let mut cache = HostCache::new(config.cache_path(), config.rescan_interval);
        cache.load();
        let log = DetectionLog::new(config.log_path());
        let runner = Runner::new(
            config.max_scans,
            config.listen_ip,
            config.listen_port,
            config.magic_string.clone(),
            config.probe_timeout,
        );
        Self {
            dispatcher: Dispatcher::new(scan_config),
            queue: ScanQueue::new(),
            stats: ScanStats::default(),
            runner,
            cache,
            log,
            started_at: unix_now(),
            config,
        }
    }

    pub fn broken_db(&self) -> bool {
        self.cache.broken_db()
    }

    pub async fn on_new_user<L: NetworkLink>(&mut self, ip: Ipv4Addr, link: &L) -> Result<()> {
        let now = unix_now();
        self.dispatcher
            .on_new_user(ip, &mut self.cache, &mut self.queue, link, now)
            .await?;
        self.kick();
        self.check_lag_warning(link).await
    }

    pub async fn force_scan<L: NetworkLink>(&mut self, ip: Ipv4Addr, link: &L) -> Result<()> {
        let now = unix_now();
        self.dispatcher.force_scan(ip, &mut self.queue, now);
        self.kick();
        self.check_lag_warning(link).await
    }

    pub async fn add_scan_type<L: NetworkLink>(
        &mut self,
        scan_type: ScanType,
        port: u16,
        link: &L,
    ) -> Result<bool> {
        let now = unix_now();
        let in_flight: Vec<Ipv4Addr> = self.runner.in_flight_ips().collect();
        let added = self.dispatcher.add_scan_type(
            scan_type,
            port,
            &self.cache,
            &mut self.queue,
            in_flight,
            now,
        );
        self.kick();
        self.check_lag_warning(link).await?;
        Ok(added)
    }

    pub fn del_scan_type(&mut self, scan_type: ScanType, port: u16) -> bool {
        self.dispatcher.del_scan_type(scan_type, port)
    }

    pub fn save(&self) -> Result<()> {
        self.dispatcher.save(&self.cache)
    }

    pub fn stats(&self) -> Stats {
        let uptime_secs = unix_now().saturating_sub(self.started_at);
        self.dispatcher.on_stats_request(
            &self.cache,
            &self.queue,
            self.runner.active_count(),
            &self.stats,
            uptime_secs,
        )
    }

    /// Fires the scan queue's one-time lag-warning notice the moment it
    /// latches, regardless of which enqueue path tripped the threshold —
    /// a new user, an operator `scan`/`scanall` command, or a probe
    /// completion's follow-up enqueue.
    async fn check_lag_warning<L: NetworkLink>(&mut self, link: &L) -> Result<()> {
        if self.queue.take_lag_warning().is_some() {
            link.send_notice(
                "operators",
                "scan queue backlog exceeds the warning threshold",
            )
            .await?;
        }
        Ok(())
    }

    /// Pulls as many eligible requests off the queue as the concurrency
    /// ceiling allows. Stops at the first request a probe can't be started
    /// for (ceiling reached, or a same-key probe already in flight), putting
    /// that request back on the queue first — `pop_eligible` removes it
    /// irrevocably, so a `start_probe` refusal would otherwise drop it on
    /// the floor instead of leaving it pending for the next `kick()` or
    /// completion to retry.
    fn kick(&mut self) {
        let now = unix_now();
        while let Some(req) = self.queue.pop_eligible(now) {
            if !self.runner.start_probe(req) {
                self.queue.enqueue(
                    req.ip,
                    req.scan_type,
                    req.port,
                    req.class,
                    req.not_before.max(now),
                    now,
                );
                break;
            }
        }
    }

    /// Drains every completion already waiting without blocking, applying
    /// each one's bookkeeping and emitting a gline for confirmed hits.
    pub async fn drain_completions<L: NetworkLink>(&mut self, link: &L) -> Result<()> {
        while let Some(completion) = self.runner.try_next_completion() {
            self.apply_completion(completion, link).await?;
        }
        Ok(())
    }

    /// Blocks until the next completion arrives (or the runner's channel
    /// closes), applies it, then drains anything else already waiting.
    pub async fn wait_for_completion<L: NetworkLink>(&mut self, link: &L) -> Result<bool> {
        let Some(completion) = self.runner.next_completion().await else {
            return Ok(false);
        };
        self.apply_completion(completion, link).await?;
        self.drain_completions(link).await?;
        Ok(true)
    }

    async fn apply_completion<L: NetworkLink>(
        &mut self,
        completion: proxyscan_runner::Completion,
        link: &L,
    ) -> Result<()> {
        let now = unix_now();
        if let Some(hit) = self
            .runner
            .finish(completion, &mut self.cache, &mut self.queue, &mut self.stats, now)
        {
            link.send_gline(hit.ip, GLINE_LIFETIME_SECS as u32, hit.gline_id).await?;
            self.log.record(
                hit.ip,
                &hit.scan_type.to_string(),
                hit.port,
                &hit.class.to_string(),
                hit.gline_id,
                now,
            )?;
        }
        self.kick();
        self.check_lag_warning(link).await
    }

    /// Periodic housekeeping: evicts expired cache entries and persists to
    /// disk. Intended to be called on `config.persist_interval`.
    pub fn tick(&mut self) -> Result<()> {
        let now = unix_now();
        self.cache.sweep_expired(now);
        self.save()
    }

    /// Shutdown: abandons in-flight probes, prunes cache hosts that were
    /// still pending (never confirmed clean or dirty), then persists.
    pub fn teardown(&mut self) -> Result<()> {
        self.runner.kill_all(&mut self.cache);
        self.save()
    }
}
