use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Candidate type (RFC 8445 section 5.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// Address of a local interface
    Host,
    /// Address seen by a STUN server
    #[serde(rename = "srflx")]
    ServerReflexive,
    /// Address learnt from a connectivity check
    #[serde(rename = "prflx")]
    PeerReflexive,
    /// Address allocated on a TURN server
    Relay,
}

impl CandidateType {
    /// Type preference used in the priority formula
    pub fn type_preference(self) -> u32 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::ServerReflexive => "srflx",
            Self::PeerReflexive => "prflx",
            Self::Relay => "relay",
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CandidateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(Error::InvalidCandidate(format!("Unknown candidate type: {}", other))),
        }
    }
}

/// Transport protocol of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Udp,
    Tcp,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            other => Err(Error::InvalidCandidate(format!("Unknown transport: {}", other))),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Foundation: equal for candidates of the same type, base and server
    pub foundation: String,
    /// Component ID (1 = RTP, RTCP is multiplexed)
    pub component: u16,
    /// Transport protocol
    pub transport: TransportType,
    /// Candidate priority
    pub priority: u32,
    /// Transport address
    pub address: IpAddr,
    /// Transport port
    pub port: u16,
    /// Candidate type
    pub candidate_type: CandidateType,
    /// Base (srflx/prflx) or mapped (relay) address
    pub related_address: Option<SocketAddr>,
}

impl IceCandidate {
    /// Priority formula of RFC 8445 section 5.1.2.1
    pub fn compute_priority(candidate_type: CandidateType, local_preference: u16, component: u16) -> u32 {
        (candidate_type.type_preference() << 24)
            + ((local_preference as u32) << 8)
            + (256 - component.min(256) as u32)
    }

    /// Foundation derived from type, base address and the server used
    pub fn compute_foundation(candidate_type: CandidateType, base: IpAddr, server: Option<&str>) -> String {
        let key = format!("{}|{}|{}", candidate_type, base, server.unwrap_or(""));
        crc32fast::hash(key.as_bytes()).to_string()
    }

    /// Create a host candidate
    pub fn host(addr: SocketAddr, component: u16, local_preference: u16) -> Self {
        Self {
            foundation: Self::compute_foundation(CandidateType::Host, addr.ip(), None),
            component,
            transport: TransportType::Udp,
            priority: Self::compute_priority(CandidateType::Host, local_preference, component),
            address: addr.ip(),
            port: addr.port(),
            candidate_type: CandidateType::Host,
            related_address: None,
        }
    }

    /// Create a server-reflexive candidate discovered through `server`
    pub fn server_reflexive(mapped: SocketAddr, base: SocketAddr, component: u16, server: &str) -> Self {
        Self {
            foundation: Self::compute_foundation(CandidateType::ServerReflexive, base.ip(), Some(server)),
            component,
            transport: TransportType::Udp,
            priority: Self::compute_priority(CandidateType::ServerReflexive, u16::MAX, component),
            address: mapped.ip(),
            port: mapped.port(),
            candidate_type: CandidateType::ServerReflexive,
            related_address: Some(base),
        }
    }

    /// Create a relay candidate allocated on `server`
    pub fn relay(relayed: SocketAddr, mapped: SocketAddr, component: u16, server: &str) -> Self {
        Self {
            foundation: Self::compute_foundation(CandidateType::Relay, relayed.ip(), Some(server)),
            component,
            transport: TransportType::Udp,
            priority: Self::compute_priority(CandidateType::Relay, u16::MAX, component),
            address: relayed.ip(),
            port: relayed.port(),
            candidate_type: CandidateType::Relay,
            related_address: Some(mapped),
        }
    }

    /// Create a remote peer-reflexive candidate learnt from a check with `priority`
    pub fn peer_reflexive(addr: SocketAddr, component: u16, priority: u32) -> Self {
        Self {
            foundation: Self::compute_foundation(CandidateType::PeerReflexive, addr.ip(), None),
            component,
            transport: TransportType::Udp,
            priority,
            address: addr.ip(),
            port: addr.port(),
            candidate_type: CandidateType::PeerReflexive,
            related_address: None,
        }
    }

    /// Transport address of the candidate
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Parse an SDP `candidate:` attribute value (an `a=` prefix is accepted)
    pub fn from_sdp_string(sdp: &str) -> Result<Self> {
        let line = sdp.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let line = line
            .strip_prefix("candidate:")
            .ok_or_else(|| Error::InvalidCandidate(format!("Missing candidate prefix: {}", sdp)))?;

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 8 || parts[6] != "typ" {
            return Err(Error::InvalidCandidate(format!("Malformed candidate: {}", sdp)));
        }

        let component = parts[1]
            .parse::<u16>()
            .map_err(|_| Error::InvalidCandidate(format!("Invalid component: {}", parts[1])))?;
        let transport = parts[2].parse::<TransportType>()?;
        let priority = parts[3]
            .parse::<u32>()
            .map_err(|_| Error::InvalidCandidate(format!("Invalid priority: {}", parts[3])))?;
        let address = parts[4]
            .parse::<IpAddr>()
            .map_err(|_| Error::InvalidCandidate(format!("Invalid address: {}", parts[4])))?;
        let port = parts[5]
            .parse::<u16>()
            .map_err(|_| Error::InvalidCandidate(format!("Invalid port: {}", parts[5])))?;
        let candidate_type = parts[7].parse::<CandidateType>()?;

        // Optional "raddr <ip> rport <port>" extension; unknown extensions are ignored
        let mut raddr = None;
        let mut rport = None;
        for pair in parts[8..].chunks(2) {
            match pair {
                ["raddr", value] => raddr = value.parse::<IpAddr>().ok(),
                ["rport", value] => rport = value.parse::<u16>().ok(),
                _ => {}
            }
        }
        let related_address = match (raddr, rport) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        };

        Ok(Self {
            foundation: parts[0].to_string(),
            component,
            transport,
            priority,
            address,
            port,
            candidate_type,
            related_address,
        })
    }

    /// Render as an SDP `candidate:` attribute value
    pub fn to_sdp_string(&self) -> String {
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.candidate_type
        );
        if let Some(related) = self.related_address {
            line.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
        }
        line
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sdp_string())
    }
}

impl FromStr for IceCandidate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_sdp_string(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_formula() {
        // host, max local preference, component 1
        assert_eq!(
            IceCandidate::compute_priority(CandidateType::Host, 65535, 1),
            2_130_706_431
        );
        assert_eq!(
            IceCandidate::compute_priority(CandidateType::ServerReflexive, 65535, 1),
            1_694_498_815
        );
        assert_eq!(IceCandidate::compute_priority(CandidateType::Relay, 0, 1), 255);

        let host = IceCandidate::compute_priority(CandidateType::Host, 0, 1);
        let prflx = IceCandidate::compute_priority(CandidateType::PeerReflexive, 65535, 1);
        assert!(host > prflx);
    }

    #[test]
    fn parse_host_candidate() {
        let candidate =
            IceCandidate::from_sdp_string("candidate:0 1 UDP 2130706431 192.168.1.1 8000 typ host").unwrap();
        assert_eq!(candidate.candidate_type, CandidateType::Host);
        assert_eq!(candidate.component, 1);
        assert_eq!(candidate.transport, TransportType::Udp);
        assert_eq!(candidate.port, 8000);
        assert_eq!(candidate.related_address, None);
    }

    #[test]
    fn srflx_candidate_survives_sdp_rendering() {
        let base: SocketAddr = "10.0.0.2:5000".parse().unwrap();
        let mapped: SocketAddr = "203.0.113.9:61000".parse().unwrap();
        let candidate = IceCandidate::server_reflexive(mapped, base, 1, "stun.example.org:3478");

        let line = format!("a={}", candidate);
        assert!(line.contains("typ srflx raddr 10.0.0.2 rport 5000"));
        let parsed: IceCandidate = line.parse().unwrap();
        assert_eq!(parsed, candidate);
    }

    #[test]
    fn foundation_depends_on_type_base_and_server() {
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let a = IceCandidate::compute_foundation(CandidateType::Host, ip, None);
        let b = IceCandidate::compute_foundation(CandidateType::Host, ip, None);
        let c = IceCandidate::compute_foundation(CandidateType::ServerReflexive, ip, Some("s1"));
        let d = IceCandidate::compute_foundation(CandidateType::ServerReflexive, ip, Some("s2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(c, d);
    }

    #[test]
    fn malformed_candidates_are_rejected() {
        for line in [
            "candidate:0 1 UDP 1 192.168.1.1 8000 host",
            "candidate:0 1 SCTP 1 192.168.1.1 8000 typ host",
            "candidate:0 1 UDP 1 not-an-ip 8000 typ host",
            "candidate:0 1 UDP 1 192.168.1.1 8000 typ bogus",
            "0 1 UDP 1 192.168.1.1 8000 typ host",
        ] {
            assert!(IceCandidate::from_sdp_string(line).is_err(), "{}", line);
        }
    }
}
