use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use proxyscan_types::{Outcome, Phase, ScanType};

/// Capacity of a probe's sliding read buffer.
pub const PSCAN_READBUFSIZE: usize = 4096;

/// Total bytes a single probe may read before it is given up on even if
/// the magic string never appears.
pub const READ_SANITY_LIMIT: u64 = 102_400;

/// Builds the dialect-specific bytes a probe writes once connected, all
/// addressed at the listener identified by `(my_ip, my_port)`.
pub fn encode_request(scan_type: ScanType, my_ip: Ipv4Addr, my_port: u16) -> Vec<u8> {
    match scan_type {
        ScanType::Http => format!("CONNECT {my_ip}:{my_port} HTTP/1.0\r\n\r\n").into_bytes(),
        ScanType::Socks4 => {
            let mut buf = vec![0u8; 9];
            buf[0] = 4;
            buf[1] = 1;
            buf[2..4].copy_from_slice(&my_port.to_be_bytes());
            buf[4..8].copy_from_slice(&my_ip.octets());
            buf[8] = 0;
            buf
        }
        ScanType::Socks5 => {
            let mut buf = vec![5, 1, 0, 5, 1, 0, 1];
            buf.extend_from_slice(&my_ip.octets());
            buf.extend_from_slice(&my_port.to_be_bytes());
            buf
        }
        ScanType::Wingate => format!("{my_ip}:{my_port}\r\n").into_bytes(),
        ScanType::Cisco => format!("cisco\r\ntelnet {my_ip} {my_port}\r\n").into_bytes(),
    }
}

/// Returns the byte offset of the first occurrence of `magic` in `buf`, or
/// `None` if absent. Offset 0 and offset > 0 are interpreted differently
/// by the caller — see [`ReadBuffer::push`].
pub fn scan_for_magic(buf: &[u8], magic: &[u8]) -> Option<usize> {
    if magic.is_empty() || buf.len() < magic.len() {
        return None;
    }
    buf.windows(magic.len()).position(|w| w == magic)
}

/// The fixed-capacity sliding read buffer a probe accumulates incoming
/// bytes into while watching for the magic string.
pub struct ReadBuffer {
    buf: Vec<u8>,
    filled: usize,
    total_read: u64,
    magic: Vec<u8>,
}

impl ReadBuffer {
    /// `magic` must be strictly shorter than half the buffer capacity, or
    /// a detection spanning a slide could be missed entirely.
    pub fn new(magic: Vec<u8>) -> Result<Self> {
        if magic.len() >= PSCAN_READBUFSIZE / 2 {
            return Err(anyhow!(
                "magic string ({} bytes) too long for a {}-byte read buffer",
                magic.len(),
                PSCAN_READBUFSIZE
            ));
        }
        Ok(Self {
            buf: vec![0u8; PSCAN_READBUFSIZE],
            filled: 0,
            total_read: 0,
            magic,
        })
    }

    /// Bytes of headroom remaining before the buffer must slide. Callers
    /// should size their next `read()` to at most this many bytes.
    pub fn remaining_capacity(&self) -> usize {
        PSCAN_READBUFSIZE - self.filled
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_read
    }

    /// Appends up to `remaining_capacity()` bytes of `data`, scans for the
    /// magic string, and returns the resulting outcome. A magic string at
    /// offset 0 means the first bytes back through this socket are the
    /// probing listener's own banner, i.e. this is the network's link
    /// talking to itself — not a genuine open proxy — so the probe is
    /// CLOSED. A magic string at any later offset means the remote relayed
    /// our request to that listener, confirming an open proxy.
    pub fn push(&mut self, data: &[u8]) -> Outcome {
        let space = self.remaining_capacity();
        let n = data.len().min(space);
        self.buf[self.filled..self.filled + n].copy_from_slice(&data[..n]);
        self.filled += n;
        self.total_read += n as u64;

        if let Some(offset) = scan_for_magic(&self.buf[..self.filled], &self.magic) {
            return if offset == 0 {
                Outcome::Closed
            } else {
                Outcome::Open
            };
        }

        if self.total_read > READ_SANITY_LIMIT {
            return Outcome::Closed;
        }

        if self.filled == PSCAN_READBUFSIZE {
            let half = PSCAN_READBUFSIZE / 2;
            self.buf.copy_within(half.., 0);
            self.filled = half;
        }

        Outcome::InProgress
    }
}

/// The result of driving a single probe to completion.
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub outcome: Outcome,
    pub final_phase: Phase,
    pub bytes_read: u64,
}

/// Drives one probe end to end over an already-connected stream: sends the
/// dialect request, then reads until the magic string resolves the
/// outcome, the sanity limit is exceeded, or the remote closes the
/// connection. `timeout` is an *idle* deadline, re-armed before the write
/// and before every read — matching the original's `scheduleoneshot`,
/// which is re-armed on every read that doesn't resolve the probe rather
/// than bounding the probe's total lifetime. A legitimate open proxy that
/// trickles its response back in several reads, each under `timeout` apart
/// but summing to more than `timeout` overall, still resolves OPEN here.
pub async fn drive_probe(
    stream: &mut TcpStream,
    scan_type: ScanType,
    my_ip: Ipv4Addr,
    my_port: u16,
    magic: &[u8],
    timeout: Duration,
) -> Result<ProbeResult> {
    let request = encode_request(scan_type, my_ip, my_port);
    match tokio::time::timeout(timeout, stream.write_all(&request)).await {
        Ok(Ok(())) => {}
        _ => {
            return Ok(ProbeResult {
                outcome: Outcome::Closed,
                final_phase: Phase::Connecting,
                bytes_read: 0,
            });
        }
    }

    let mut read_buf = ReadBuffer::new(magic.to_vec())?;
    let mut tmp = vec![0u8; PSCAN_READBUFSIZE];

    loop {
        let space = read_buf.remaining_capacity();
        let n = match tokio::time::timeout(timeout, stream.read(&mut tmp[..space])).await {
            Ok(Ok(0)) => {
                return Ok(ProbeResult {
                    outcome: Outcome::Closed,
                    final_phase: Phase::SentRequest,
                    bytes_read: read_buf.total_bytes_read(),
                });
            }
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => {
                return Ok(ProbeResult {
                    outcome: Outcome::Closed,
                    final_phase: Phase::SentRequest,
                    bytes_read: read_buf.total_bytes_read(),
                });
            }
        };

        let outcome = read_buf.push(&tmp[..n]);
        if outcome != Outcome::InProgress {
            return Ok(ProbeResult {
                outcome,
                final_phase: Phase::GotResponse,
                bytes_read: read_buf.total_bytes_read(),
            });
        }
    }
}
