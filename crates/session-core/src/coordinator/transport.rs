use async_trait::async_trait;
use bytes::Bytes;
use ice_core::IceTransport;
use rtp_core::DatagramTransport;

/// The ICE byte stream seen as a datagram path by the handshake and the
/// media pipeline
#[derive(Clone, Debug)]
pub(crate) struct IceDatagram {
    inner: IceTransport,
}

impl IceDatagram {
    pub(crate) fn new(inner: IceTransport) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DatagramTransport for IceDatagram {
    async fn send(&self, data: &[u8]) -> rtp_core::Result<()> {
        self.inner
            .send(data)
            .await
            .map(|_| ())
            .map_err(|e| rtp_core::Error::Transport(e.to_string()))
    }

    async fn recv(&self) -> rtp_core::Result<Bytes> {
        self.inner
            .recv()
            .await
            .map_err(|e| rtp_core::Error::Transport(e.to_string()))
    }
}
