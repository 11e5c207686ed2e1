//! Candidate gathering: socket setup, host address discovery, STUN
//! server-reflexive queries and TURN allocations (RFC 5766 long-term
//! credentials).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, trace};

use crate::config::{IceConfig, IceServerConfig};
use crate::error::{Error, Result};
use crate::stun::{
    self, StunAttribute, StunClass, StunMessage, StunMessageType, TRANSPORT_UDP,
};
use crate::transaction::{transact, RetransmitPolicy, TransactionTable};

/// Socket buffer size requested for media traffic
const SOCKET_BUFFER_SIZE: usize = 1 << 20;

/// Stale-nonce (438) answers tolerated before an allocation gives up
const MAX_AUTH_CHALLENGES: usize = 2;

/// Bind the agent's UDP socket
pub(crate) fn bind_socket(config: &IceConfig) -> Result<UdpSocket> {
    let addr = SocketAddr::new(config.bind_address, config.bind_port);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    // Larger buffers absorb bursts of media; failures here are not fatal
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        trace!("Could not grow receive buffer: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        trace!("Could not grow send buffer: {}", e);
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    let socket = UdpSocket::from_std(socket.into())?;
    debug!("Bound ICE socket on {}", socket.local_addr()?);
    Ok(socket)
}

/// Addresses advertised as host candidates
pub(crate) async fn host_addresses(config: &IceConfig) -> Vec<IpAddr> {
    if !config.bind_address.is_unspecified() {
        return vec![config.bind_address];
    }

    let (unspecified, loopback, probe): (IpAddr, IpAddr, SocketAddr) = if config.bind_address.is_ipv4() {
        (
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            // TEST-NET-2; connecting a UDP socket sends nothing but picks the
            // outbound interface
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 9),
        )
    } else {
        (
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), 9),
        )
    };

    let mut addresses = Vec::new();
    if let Ok(socket) = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await {
        if socket.connect(probe).await.is_ok() {
            if let Ok(local) = socket.local_addr() {
                let ip = local.ip();
                if !ip.is_unspecified() && !ip.is_loopback() {
                    addresses.push(ip);
                }
            }
        }
    }

    if config.include_loopback || addresses.is_empty() {
        addresses.push(loopback);
    }
    addresses
}

/// Resolve a `host:port` server address, preferring the socket's family
pub(crate) async fn resolve_server(server: &str, local: SocketAddr) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host(server)
        .await
        .map_err(|e| Error::GatheringError(format!("Cannot resolve {}: {}", server, e)))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4() == local.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::GatheringError(format!("No address for {}", server)))
}

fn gather_policy(config: &IceConfig) -> RetransmitPolicy {
    RetransmitPolicy {
        initial_timeout: config.gather_timeout(),
        retransmits: config.gather_retries,
        backoff: false,
    }
}

/// Ask a STUN server for our mapped address
pub(crate) async fn query_server_reflexive(
    socket: &UdpSocket,
    table: &TransactionTable,
    server: SocketAddr,
    config: &IceConfig,
) -> Result<SocketAddr> {
    let request = StunMessage::binding_request();
    let reply = transact(
        socket,
        table,
        request.transaction_id,
        &request.encode_with_fingerprint(),
        server,
        gather_policy(config),
    )
    .await?;

    stun::check_fingerprint(&reply.raw)?;
    if reply.message.msg_type != StunMessageType::BINDING_RESPONSE {
        return Err(Error::GatheringError(format!(
            "Unexpected binding answer from {}: {:?}",
            server,
            reply.message.error_code()
        )));
    }

    reply
        .message
        .xor_mapped_address()
        .ok_or_else(|| Error::GatheringError(format!("{} sent no XOR-MAPPED-ADDRESS", server)))
}

/// Result of a successful TURN Allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelayAllocation {
    pub relayed: SocketAddr,
    pub mapped: SocketAddr,
}

/// Allocate a relayed address on a TURN server.
///
/// The first Allocate is sent without credentials; the server's 401 carries
/// the realm and nonce for the authenticated retry.
pub(crate) async fn allocate_relay(
    socket: &UdpSocket,
    table: &TransactionTable,
    server: SocketAddr,
    credentials: &IceServerConfig,
    config: &IceConfig,
) -> Result<RelayAllocation> {
    let request = StunMessage::new(StunMessageType::ALLOCATE_REQUEST)
        .with_attribute(StunAttribute::requested_transport(TRANSPORT_UDP));
    let mut reply = transact(
        socket,
        table,
        request.transaction_id,
        &request.encode_with_fingerprint(),
        server,
        gather_policy(config),
    )
    .await?;

    let mut key: Option<Vec<u8>> = None;
    for _ in 0..MAX_AUTH_CHALLENGES {
        if reply.message.msg_type.class != StunClass::ErrorResponse {
            break;
        }
        match reply.message.error_code() {
            Some((401, _)) | Some((438, _)) => {}
            other => {
                return Err(Error::GatheringError(format!(
                    "TURN server {} refused allocation: {:?}",
                    server, other
                )))
            }
        }

        let realm = reply
            .message
            .realm()
            .ok_or_else(|| Error::GatheringError("TURN challenge without REALM".into()))?;
        let nonce = reply
            .message
            .nonce()
            .ok_or_else(|| Error::GatheringError("TURN challenge without NONCE".into()))?;
        trace!("TURN challenge from {} realm={}", server, realm);

        let long_term = stun::long_term_key(&credentials.username, &realm, &credentials.credential);
        let request = StunMessage::new(StunMessageType::ALLOCATE_REQUEST)
            .with_attribute(StunAttribute::requested_transport(TRANSPORT_UDP))
            .with_attribute(StunAttribute::username(&credentials.username))
            .with_attribute(StunAttribute::realm(&realm))
            .with_attribute(StunAttribute::nonce(&nonce));
        let payload = request.encode_signed(&long_term)?;
        key = Some(long_term);

        reply = transact(
            socket,
            table,
            request.transaction_id,
            &payload,
            server,
            gather_policy(config),
        )
        .await?;
    }

    if reply.message.msg_type.class != StunClass::SuccessResponse {
        return Err(Error::GatheringError(format!(
            "TURN allocation on {} failed: {:?}",
            server,
            reply.message.error_code()
        )));
    }

    if let Some(key) = &key {
        if reply.message.has_attribute(stun::StunAttributeType::MessageIntegrity) {
            stun::check_integrity(&reply.raw, key)?;
        }
    }

    let relayed = reply
        .message
        .xor_relayed_address()
        .ok_or_else(|| Error::GatheringError(format!("{} sent no XOR-RELAYED-ADDRESS", server)))?;
    let mapped = reply
        .message
        .xor_mapped_address()
        .unwrap_or_else(|| socket.local_addr().unwrap_or(relayed));

    Ok(RelayAllocation { relayed, mapped })
}
