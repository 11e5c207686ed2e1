use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Media pipeline configuration. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Largest RTP payload produced by the packetizer
    pub mtu: usize,

    /// Jitter window in sequence numbers behind the newest packet
    pub window_packets: u32,

    /// How far the newest packet may run ahead of a gap before the gap is
    /// given up as lost
    pub max_delay_packets: u32,

    /// Interval between RTCP reports
    pub report_interval_ms: u64,

    pub min_bitrate_bps: u64,
    pub max_bitrate_bps: u64,
    pub start_bitrate_bps: u64,

    /// Capacity of the inbound datagram queue
    pub inbound_queue: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            mtu: 1200,
            window_packets: 100,
            max_delay_packets: 20,
            report_interval_ms: 1000,
            min_bitrate_bps: 30_000,
            max_bitrate_bps: 2_500_000,
            start_bitrate_bps: 300_000,
            inbound_queue: 512,
        }
    }
}

impl MediaConfig {
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_jitter_window(mut self, window_packets: u32, max_delay_packets: u32) -> Self {
        self.window_packets = window_packets;
        self.max_delay_packets = max_delay_packets;
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_bitrate_bounds(mut self, min_bps: u64, start_bps: u64, max_bps: u64) -> Self {
        self.min_bitrate_bps = min_bps;
        self.start_bitrate_bps = start_bps;
        self.max_bitrate_bps = max_bps;
        self
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// Check the values before a pipeline is built from them
    pub fn validate(&self) -> Result<()> {
        if self.mtu == 0 {
            return Err(Error::InvalidConfig("mtu must be positive".into()));
        }
        if self.window_packets == 0 || self.window_packets >= 1 << 15 {
            return Err(Error::InvalidConfig(format!(
                "window_packets must be in 1..32768, got {}",
                self.window_packets
            )));
        }
        if self.report_interval_ms == 0 {
            return Err(Error::InvalidConfig("report_interval_ms must be positive".into()));
        }
        if self.min_bitrate_bps == 0 || self.min_bitrate_bps > self.max_bitrate_bps {
            return Err(Error::InvalidConfig(format!(
                "invalid bitrate bounds [{}, {}]",
                self.min_bitrate_bps, self.max_bitrate_bps
            )));
        }
        if !(self.min_bitrate_bps..=self.max_bitrate_bps).contains(&self.start_bitrate_bps) {
            return Err(Error::InvalidConfig(format!(
                "start bitrate {} outside [{}, {}]",
                self.start_bitrate_bps, self.min_bitrate_bps, self.max_bitrate_bps
            )));
        }
        if self.inbound_queue == 0 {
            return Err(Error::InvalidConfig("inbound_queue must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        tokio_test::assert_ok!(MediaConfig::default().validate());
        tokio_test::assert_err!(MediaConfig::default().with_report_interval(Duration::ZERO).validate());
    }

    #[test]
    fn test_invalid_values() {
        assert!(MediaConfig::default().with_mtu(0).validate().is_err());
        assert!(MediaConfig::default().with_jitter_window(0, 0).validate().is_err());
        assert!(MediaConfig::default()
            .with_bitrate_bounds(100_000, 50_000, 200_000)
            .validate()
            .is_err());
        assert!(MediaConfig::default()
            .with_bitrate_bounds(300_000, 300_000, 200_000)
            .validate()
            .is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MediaConfig = serde_json::from_str(r#"{"mtu": 500, "report_interval_ms": 250}"#).unwrap();
        assert_eq!(config.mtu, 500);
        assert_eq!(config.report_interval(), Duration::from_millis(250));
        assert_eq!(config.window_packets, MediaConfig::default().window_packets);
    }
}
