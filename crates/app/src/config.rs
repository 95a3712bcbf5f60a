use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// The core-relevant subset of engine configuration: everything needed to
/// drive probes and persist the cache. IRC identity, mailer settings, and
/// config-file loading belong to the external collaborator and are not
/// represented here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the listener probes address their requests at.
    pub listen_ip: Ipv4Addr,
    pub listen_port: u16,
    pub max_scans: usize,
    pub rescan_interval: u64,
    /// The banner string the listener emits; a probe seeing it at offset 0
    /// is CLOSED (the link itself), past offset 0 is OPEN.
    pub magic_string: Vec<u8>,
    pub probe_timeout: Duration,
    pub state_dir: PathBuf,
    pub persist_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_ip: Ipv4Addr::new(127, 0, 0, 1),
            listen_port: 9999,
            max_scans: 200,
            rescan_interval: 3600,
            magic_string: b"PROXYSCAN-DETECT".to_vec(),
            probe_timeout: Duration::from_secs(60),
            state_dir: PathBuf::from("/var/lib/proxyscan"),
            persist_interval: Duration::from_secs(3600),
        }
    }
}

impl Config {
    pub fn cache_path(&self) -> PathBuf {
        self.state_dir.join("cache.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.state_dir.join("detections.log")
    }

    /// Builds a `Config` from parsed process arguments, keeping the fields
    /// `RunArgs` has no flag for (`magic_string`, `persist_interval`) at
    /// their defaults.
    pub fn from_args(args: &proxyscan_cli::RunArgs) -> Self {
        Self {
            listen_ip: args.listen_ip,
            listen_port: args.listen_port,
            max_scans: args.max_scans,
            rescan_interval: args.rescan_interval,
            probe_timeout: args.probe_timeout(),
            state_dir: args.state_dir.clone(),
            ..Self::default()
        }
    }
}
