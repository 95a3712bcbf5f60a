pub mod config;
pub mod engine;
pub mod run;

pub use config::Config;
pub use engine::Engine;
pub use run::{run, run_with_engine, StdoutLink};

pub use proxyscan_dispatcher::{NetworkLink, NullLink, Stats};
pub use proxyscan_types::{default_scan_config, ScanConfigEntry, ScanType};
