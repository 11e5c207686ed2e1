use std::net::SocketAddr;

use bytes::Bytes;

use crate::agent::IceAgent;
use crate::error::Result;

/// Datagram byte stream over the selected candidate pair.
///
/// Writes go through the agent, which owns the socket; reads yield every
/// inbound DTLS, RTP and RTCP datagram in arrival order. Clones share the
/// same stream.
#[derive(Clone, Debug)]
pub struct IceTransport {
    agent: IceAgent,
}

impl IceTransport {
    pub(crate) fn new(agent: IceAgent) -> Self {
        Self { agent }
    }

    /// Send one datagram to the selected remote candidate
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        self.agent.send(data).await
    }

    /// Receive the next datagram; fails with `Error::Closed` after the agent closes
    pub async fn recv(&self) -> Result<Bytes> {
        self.agent.recv().await
    }

    /// Remote address of the selected pair
    pub async fn remote_address(&self) -> Option<SocketAddr> {
        self.agent
            .selected_pair()
            .await
            .map(|(_, remote)| remote.socket_addr())
    }
}
