use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the UNIX epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// NTP timestamp representation (64 bits)
/// As defined in RFC 3550
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NtpTimestamp {
    /// Seconds since January 1, 1900
    pub seconds: u32,

    /// Fraction of a second
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self::from_duration_since_unix_epoch(now)
    }

    /// Convert to a 64-bit representation
    pub fn to_u64(&self) -> u64 {
        (self.seconds as u64) << 32 | (self.fraction as u64)
    }

    /// Convert from a 64-bit representation
    pub fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            fraction: value as u32,
        }
    }

    /// Middle 32 bits, the form carried in the LSR field of report blocks
    /// (RFC 3550 section 6.4.1)
    pub fn to_compact(&self) -> u32 {
        ((self.seconds & 0x0000_FFFF) << 16) | (self.fraction >> 16)
    }

    /// Convert to a Duration since UNIX epoch
    pub fn to_duration_since_unix_epoch(&self) -> Duration {
        let seconds = (self.seconds as u64).saturating_sub(NTP_UNIX_OFFSET);
        let nanos = ((self.fraction as u64) * 1_000_000_000) >> 32;
        Duration::new(seconds, nanos as u32)
    }

    /// Create an NTP timestamp from a Duration since UNIX epoch
    pub fn from_duration_since_unix_epoch(duration: Duration) -> Self {
        let seconds = duration.as_secs() + NTP_UNIX_OFFSET;
        let fraction = ((duration.subsec_nanos() as u64) << 32) / 1_000_000_000;
        Self {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }
}

/// Convert a compact (16.16 fixed point) NTP interval to a Duration
pub fn compact_to_duration(compact: u32) -> Duration {
    let seconds = (compact >> 16) as u64;
    let nanos = ((compact & 0xFFFF) as u64 * 1_000_000_000) >> 16;
    Duration::new(seconds, nanos as u32)
}

/// Convert a Duration to compact (16.16 fixed point) NTP units, saturating
pub fn duration_to_compact(duration: Duration) -> u32 {
    let units = duration.as_secs_f64() * 65536.0;
    if units >= u32::MAX as f64 {
        u32::MAX
    } else {
        units as u32
    }
}
