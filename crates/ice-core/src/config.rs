use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// ICE role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceRole {
    /// Nominates the selected pair (the offerer)
    Controlling,
    /// Follows the controlling agent's nomination
    Controlled,
}

impl IceRole {
    pub fn opposite(self) -> Self {
        match self {
            Self::Controlling => Self::Controlled,
            Self::Controlled => Self::Controlling,
        }
    }
}

/// ICE component. RTCP is multiplexed on the RTP component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum IceComponent {
    Rtp = 1,
    Rtcp = 2,
}

impl IceComponent {
    pub fn id(self) -> u16 {
        self as u16
    }
}

/// Which candidate types to gather
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatheringPolicy {
    /// Host, server-reflexive and relay candidates
    All,
    /// Host candidates only, servers are not contacted
    HostOnly,
}

/// A TURN server with long-term credentials
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    /// `host:port` of the server
    pub address: String,
    pub username: String,
    pub credential: String,
}

impl IceServerConfig {
    pub fn turn(address: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// ICE agent configuration. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// Local address to bind. The unspecified address advertises every
    /// usable interface address as a host candidate.
    pub bind_address: IpAddr,

    /// Local port to bind, 0 for an ephemeral port
    pub bind_port: u16,

    /// Advertise loopback addresses when binding the unspecified address
    pub include_loopback: bool,

    pub gathering_policy: GatheringPolicy,

    /// STUN servers (`host:port`) used for server-reflexive candidates
    pub stun_servers: Vec<String>,

    /// TURN servers used for relay candidates
    pub turn_servers: Vec<IceServerConfig>,

    /// Timeout of one STUN/TURN gathering attempt
    pub gather_timeout_ms: u64,

    /// Retries per server after the first attempt
    pub gather_retries: u32,

    /// Pacing between two new connectivity checks
    pub check_interval_ms: u64,

    /// Initial retransmission timeout of a check, doubled on every retry
    pub check_rto_ms: u64,

    /// Retransmissions of a check before the pair fails
    pub max_check_retransmits: u32,

    /// Deadline for nominating a pair once checks start
    pub connectivity_timeout_ms: u64,

    /// Upper bound on the checklist size
    pub max_checklist_pairs: usize,

    /// Consent freshness request interval on the selected pair
    pub keepalive_interval_ms: u64,

    /// Silence on the selected pair after which the agent is disconnected
    pub consent_timeout_ms: u64,

    /// Grace period for tasks to stop on close
    pub close_grace_ms: u64,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 0,
            include_loopback: false,
            gathering_policy: GatheringPolicy::All,
            stun_servers: Vec::new(),
            turn_servers: Vec::new(),
            gather_timeout_ms: 500,
            gather_retries: 2,
            check_interval_ms: 20,
            check_rto_ms: 100,
            max_check_retransmits: 6,
            connectivity_timeout_ms: 10_000,
            max_checklist_pairs: 100,
            keepalive_interval_ms: 2_000,
            consent_timeout_ms: 10_000,
            close_grace_ms: 500,
        }
    }
}

impl IceConfig {
    /// Configuration for agents talking over the loopback interface
    pub fn loopback() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            gathering_policy: GatheringPolicy::HostOnly,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    pub fn with_stun_server(mut self, server: impl Into<String>) -> Self {
        self.stun_servers.push(server.into());
        self
    }

    pub fn with_turn_server(mut self, server: IceServerConfig) -> Self {
        self.turn_servers.push(server);
        self
    }

    pub fn with_gathering_policy(mut self, policy: GatheringPolicy) -> Self {
        self.gathering_policy = policy;
        self
    }

    pub fn with_gather_timeout(mut self, timeout: Duration, retries: u32) -> Self {
        self.gather_timeout_ms = timeout.as_millis() as u64;
        self.gather_retries = retries;
        self
    }

    pub fn with_connectivity_timeout(mut self, timeout: Duration) -> Self {
        self.connectivity_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_consent(mut self, keepalive: Duration, timeout: Duration) -> Self {
        self.keepalive_interval_ms = keepalive.as_millis() as u64;
        self.consent_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn check_rto(&self) -> Duration {
        Duration::from_millis(self.check_rto_ms)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn consent_timeout(&self) -> Duration {
        Duration::from_millis(self.consent_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Reject values that would stall the agent
    pub fn validate(&self) -> Result<()> {
        let timers = [
            ("gather_timeout_ms", self.gather_timeout_ms),
            ("check_interval_ms", self.check_interval_ms),
            ("check_rto_ms", self.check_rto_ms),
            ("connectivity_timeout_ms", self.connectivity_timeout_ms),
            ("keepalive_interval_ms", self.keepalive_interval_ms),
            ("consent_timeout_ms", self.consent_timeout_ms),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| *value == 0) {
            return Err(Error::ConfigError(format!("{} must be greater than zero", name)));
        }
        if self.max_checklist_pairs == 0 {
            return Err(Error::ConfigError("max_checklist_pairs must be greater than zero".into()));
        }
        if self.consent_timeout_ms <= self.keepalive_interval_ms {
            return Err(Error::ConfigError(
                "consent_timeout_ms must exceed keepalive_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(IceConfig::default().validate().is_ok());
        assert!(IceConfig::loopback().validate().is_ok());
    }

    #[test]
    fn zero_timers_are_rejected() {
        let mut config = IceConfig::default();
        config.check_rto_ms = 0;
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));

        let config = IceConfig::default().with_consent(Duration::from_secs(5), Duration::from_secs(5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: IceConfig = serde_json::from_str(
            r#"{ "stun_servers": ["stun.example.org:3478"], "gathering_policy": "host_only" }"#,
        )
        .unwrap();
        assert_eq!(config.stun_servers.len(), 1);
        assert_eq!(config.gathering_policy, GatheringPolicy::HostOnly);
        assert_eq!(config.check_rto(), Duration::from_millis(100));
    }
}
