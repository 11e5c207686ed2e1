//! DTLS-SRTP handshake
//!
//! A DTLS 1.2 shaped handshake (RFC 6347 record and handshake framing,
//! RFC 5764 SRTP keying) run over an already established datagram path.
//! Both ends authenticate with self-signed P-256 certificates whose SHA-256
//! fingerprints were exchanged out of band in the session descriptions.

pub mod alert;
mod crypto;
pub mod handshake;
mod identity;
pub mod message;
pub mod record;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use handshake::{handshake, DtlsSession};
pub use identity::{DtlsIdentity, Fingerprint};

use crate::srtp::SrtpProfile;
use crate::Result;

/// DTLS connection role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtlsRole {
    /// DTLS client role, sends the first flight
    Client,

    /// DTLS server role
    Server,
}

impl DtlsRole {
    pub fn is_client(&self) -> bool {
        matches!(self, DtlsRole::Client)
    }
}

/// DTLS handshake configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtlsConfig {
    /// Initial flight retransmission timeout in milliseconds, doubled on
    /// every retransmission
    pub retransmit_timeout_ms: u64,

    /// Maximum number of retransmissions per flight
    pub max_retransmissions: usize,

    /// SRTP profiles to offer/accept, in preference order
    pub srtp_profiles: Vec<SrtpProfile>,
}

impl Default for DtlsConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout_ms: 1000,
            max_retransmissions: 5,
            srtp_profiles: vec![SrtpProfile::Aes128CmHmacSha1_80],
        }
    }
}

impl DtlsConfig {
    /// Set the initial retransmission timeout
    pub fn with_retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.retransmit_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retransmission budget per flight
    pub fn with_max_retransmissions(mut self, max: usize) -> Self {
        self.max_retransmissions = max;
        self
    }

    /// Initial retransmission timeout
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms.max(1))
    }
}

/// A connected datagram path the handshake runs over.
///
/// Implementations deliver whole datagrams and must not be read by anyone
/// else while a handshake is in progress.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram to the peer
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive the next datagram from the peer
    async fn recv(&self) -> Result<Bytes>;
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::Error;
    use tokio::sync::{mpsc, Mutex};

    /// In-memory datagram pipe
    pub struct MemoryTransport {
        tx: mpsc::UnboundedSender<Bytes>,
        rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
        /// Drop this many outgoing datagrams before delivering any
        drop_first: std::sync::atomic::AtomicUsize,
    }

    impl MemoryTransport {
        pub fn pair() -> (Self, Self) {
            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            (
                Self { tx: a_tx, rx: Mutex::new(b_rx), drop_first: 0.into() },
                Self { tx: b_tx, rx: Mutex::new(a_rx), drop_first: 0.into() },
            )
        }

        pub fn dropping_first(self, count: usize) -> Self {
            self.drop_first.store(count, std::sync::atomic::Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl DatagramTransport for MemoryTransport {
        async fn send(&self, data: &[u8]) -> Result<()> {
            use std::sync::atomic::Ordering;
            let pending = self.drop_first.load(Ordering::SeqCst);
            if pending > 0 {
                self.drop_first.store(pending - 1, Ordering::SeqCst);
                return Ok(());
            }
            // Receiver may already be gone after a failed handshake
            let _ = self.tx.send(Bytes::copy_from_slice(data));
            Ok(())
        }

        async fn recv(&self) -> Result<Bytes> {
            self.rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| Error::Transport("memory transport closed".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_builders() {
        let config = DtlsConfig::default();
        assert_eq!(config.retransmit_timeout(), Duration::from_secs(1));
        assert_eq!(config.srtp_profiles, vec![SrtpProfile::Aes128CmHmacSha1_80]);

        let config = config
            .with_retransmit_timeout(Duration::from_millis(50))
            .with_max_retransmissions(2);
        assert_eq!(config.retransmit_timeout_ms, 50);
        assert_eq!(config.max_retransmissions, 2);
    }

    #[test]
    fn test_role() {
        assert!(DtlsRole::Client.is_client());
        assert!(!DtlsRole::Server.is_client());
    }
}
