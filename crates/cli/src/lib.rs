use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "proxyscan",
    version,
    about = "Concurrent open-proxy detection engine"
)]
pub struct Cli {
    #[command(flatten)]
    pub args: RunArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Directory holding the persisted cache and detection log
    #[arg(long, default_value = "/var/lib/proxyscan")]
    pub state_dir: PathBuf,

    /// Address probes tell proxied targets to connect back to
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_ip: Ipv4Addr,

    /// Port probes tell proxied targets to connect back to
    #[arg(long, default_value_t = 9999)]
    pub listen_port: u16,

    /// Maximum number of simultaneous probes
    #[arg(long, default_value_t = 200)]
    pub max_scans: usize,

    /// Seconds a clean host is trusted before it is eligible for rescan
    #[arg(long, default_value_t = 3600)]
    pub rescan_interval: u64,

    /// Seconds a probe may run before it is abandoned as CLOSED
    #[arg(long, default_value_t = 60)]
    pub probe_timeout_secs: u64,

    /// Verbose logging
    #[arg(long)]
    pub verbose: bool,
}

impl RunArgs {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}
