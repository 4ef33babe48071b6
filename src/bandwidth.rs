//! Local bandwidth meter
//!
//! Samples the byte counters of the local box's network interface from
//! `/proc/net/dev` and turns two consecutive samples into Mbps figures.

use std::path::PathBuf;

/// Default counter source
pub const NET_DEV_PATH: &str = "/proc/net/dev";

/// Bandwidth meter errors
#[derive(Debug, thiserror::Error)]
pub enum BandwidthError {
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),

    #[error("interface {0} not found in counters")]
    UnknownInterface(String),
}

/// Raw byte counters of one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Bandwidth over one sampling window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthSample {
    /// Transmit rate (Mbps)
    pub bw: f64,
    /// Receive rate (Mbps)
    pub bwrecv: f64,
    /// Bytes transmitted during the window
    pub delta_bytes: u64,
}

/// Find `iface` in `/proc/net/dev` content.
pub fn parse_net_dev(content: &str, iface: &str) -> Option<InterfaceCounters> {
    content.lines().find_map(|line| {
        let (name, counters) = line.split_once(':')?;
        if name.trim() != iface {
            return None;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .map(|f| f.parse().ok())
            .collect::<Option<Vec<_>>>()?;
        Some(InterfaceCounters {
            rx_bytes: *fields.first()?,
            tx_bytes: *fields.get(8)?,
        })
    })
}

fn mbps(bytes: u64, elapsed_ms: u64) -> f64 {
    if elapsed_ms == 0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / elapsed_ms as f64 * 1000.0 / 1024.0 / 1024.0
}

/// Rates between two samples; counter resets count as zero traffic.
pub fn compute(previous: InterfaceCounters, current: InterfaceCounters, elapsed_ms: u64) -> BandwidthSample {
    let delta_tx = current.tx_bytes.saturating_sub(previous.tx_bytes);
    let delta_rx = current.rx_bytes.saturating_sub(previous.rx_bytes);
    BandwidthSample {
        bw: mbps(delta_tx, elapsed_ms),
        bwrecv: mbps(delta_rx, elapsed_ms),
        delta_bytes: delta_tx,
    }
}

/// Stateful sampler for one interface
#[derive(Debug)]
pub struct BandwidthMeter {
    iface: String,
    source: PathBuf,
    last: Option<(InterfaceCounters, u64)>,
}

impl BandwidthMeter {
    pub fn new(iface: impl Into<String>) -> Self {
        Self::with_source(iface, NET_DEV_PATH)
    }

    pub fn with_source(iface: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            iface: iface.into(),
            source: source.into(),
            last: None,
        }
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    fn read(&self) -> Result<InterfaceCounters, BandwidthError> {
        let content = std::fs::read_to_string(&self.source)
            .map_err(|e| BandwidthError::Io(self.source.display().to_string(), e))?;
        parse_net_dev(&content, &self.iface)
            .ok_or_else(|| BandwidthError::UnknownInterface(self.iface.clone()))
    }

    /// Read the counters; the first call only primes the meter.
    pub fn sample(&mut self, now_ms: u64) -> Result<Option<BandwidthSample>, BandwidthError> {
        let current = self.read()?;
        let sample = self
            .last
            .map(|(previous, at)| compute(previous, current, now_ms.saturating_sub(at)));
        self.last = Some((current, now_ms));
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const NET_DEV: &str = "Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1000 10 0 0 0 0 0 0 1000 10 0 0 0 0 0 0
  eth0: 2000000 1500 0 0 0 0 0 0 9000000 8000 0 0 0 0 0 0
";

    #[test]
    fn test_parse_net_dev() {
        let eth0 = parse_net_dev(NET_DEV, "eth0").unwrap();
        assert_eq!(eth0.rx_bytes, 2_000_000);
        assert_eq!(eth0.tx_bytes, 9_000_000);
        assert!(parse_net_dev(NET_DEV, "eth1").is_none());
    }

    #[test]
    fn test_compute_mbps() {
        let previous = InterfaceCounters { rx_bytes: 0, tx_bytes: 0 };
        // 2^20 bytes in one second is 8 Mbps
        let current = InterfaceCounters {
            rx_bytes: 1 << 19,
            tx_bytes: 1 << 20,
        };
        let sample = compute(previous, current, 1000);
        assert!((sample.bw - 8.0).abs() < 1e-9);
        assert!((sample.bwrecv - 4.0).abs() < 1e-9);
        assert_eq!(sample.delta_bytes, 1 << 20);
    }

    #[test]
    fn test_counter_reset_is_zero() {
        let previous = InterfaceCounters { rx_bytes: 500, tx_bytes: 500 };
        let current = InterfaceCounters { rx_bytes: 10, tx_bytes: 10 };
        let sample = compute(previous, current, 2000);
        assert_eq!(sample.bw, 0.0);
        assert_eq!(sample.bwrecv, 0.0);
    }

    #[test]
    fn test_meter_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(NET_DEV.as_bytes()).unwrap();
        let mut meter = BandwidthMeter::with_source("eth0", file.path());
        assert!(meter.sample(1_000).unwrap().is_none());
        let sample = meter.sample(3_000).unwrap().unwrap();
        assert_eq!(sample.bw, 0.0);

        let mut missing = BandwidthMeter::with_source("wlan9", file.path());
        assert!(matches!(
            missing.sample(0),
            Err(BandwidthError::UnknownInterface(_))
        ));
    }
}
