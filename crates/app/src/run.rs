use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use proxyscan_cli::parse_cli;
use proxyscan_dispatcher::NetworkLink;
use proxyscan_types::default_scan_config;

use crate::config::Config;
use crate::engine::Engine;

/// Reports gline/notice events to stdout instead of delivering them over a
/// real IRC link, which this crate does not own (see `NetworkLink` in
/// `proxyscan-dispatcher`).
pub struct StdoutLink;

impl NetworkLink for StdoutLink {
    async fn send_gline(&self, ip: Ipv4Addr, duration_secs: u32, gline_id: u64) -> Result<()> {
        println!("GLINE +*@{ip} {duration_secs}s id={gline_id} reason=\"Open Proxy\"");
        Ok(())
    }

    async fn send_notice(&self, target: &str, message: &str) -> Result<()> {
        eprintln!("NOTICE {target}: {message}");
        Ok(())
    }
}

pub async fn run() -> Result<()> {
    let cli = parse_cli();
    let args = cli.args;
    if args.verbose {
        eprintln!("proxyscan: state dir {}", args.state_dir.display());
    }

    let config = Config::from_args(&args);
    let mut engine = Engine::new(config.clone(), default_scan_config());
    if engine.broken_db() {
        eprintln!("proxyscan: cache on disk was corrupt, starting from an empty cache");
    }

    run_with_engine(&mut engine, &StdoutLink, config.persist_interval).await
}

/// Drives `engine` until stdin closes or Ctrl-C arrives. Each stdin line is
/// treated as a new-user IPv4 address (the stand-in for the IRC
/// collaborator's `on_new_user` callback), completions are applied to the
/// cache/queue as they land, and a periodic tick sweeps expired cache
/// entries and persists to disk. Split out from [`run`] so the loop itself
/// can be exercised without real stdin.
pub async fn run_with_engine<L: NetworkLink>(
    engine: &mut Engine,
    link: &L,
    persist_interval: Duration,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tick = tokio::time::interval(persist_interval);
    tick.tick().await; // first tick fires immediately; skip so we don't tick at t=0

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("proxyscan: shutting down");
                break;
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match line.parse::<Ipv4Addr>() {
                            Ok(ip) => engine.on_new_user(ip, link).await?,
                            Err(_) => eprintln!("proxyscan: ignoring unparseable address {line:?}"),
                        }
                    }
                    None => break,
                }
            }
            got = engine.wait_for_completion(link) => {
                got?;
            }
            _ = tick.tick() => {
                engine.tick()?;
            }
        }
    }

    engine.teardown()
}
