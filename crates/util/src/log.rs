use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Append-only log of confirmed open proxies, mirroring the original's
/// `ps_logfile` (`fopen(path, "a")`, one line per detection).
pub struct DetectionLog {
    path: PathBuf,
}

impl DetectionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open detection log {}", self.path.display()))
    }

    pub fn record(
        &self,
        ip: Ipv4Addr,
        scan_type: &str,
        port: u16,
        class: &str,
        gline_id: u64,
        unix_time: u64,
    ) -> Result<()> {
        let mut file = self.open()?;
        writeln!(file, "{unix_time},{ip},{scan_type},{port},{class},{gline_id}")
            .context("failed to append to detection log")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_one_line_per_call() {
        let path = std::env::temp_dir().join(format!("proxyscan-log-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let log = DetectionLog::new(&path);
        log.record(Ipv4Addr::new(192, 0, 2, 1), "http", 8080, "normal", 1, 1_000)
            .unwrap();
        log.record(Ipv4Addr::new(192, 0, 2, 2), "socks5", 1080, "pass2", 2, 1_001)
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().next().unwrap().contains("192.0.2.1"));
        let _ = std::fs::remove_file(&path);
    }
}
