//! STUN client transactions over the agent's socket.
//!
//! Responses are read by the agent's receive loop and routed back to the
//! waiting transaction by transaction id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{Error, Result};
use crate::stun::{StunMessage, TransactionId};

/// Longest wait between two retransmissions, as a multiple of the initial timeout
const MAX_BACKOFF_FACTOR: u32 = 8;

/// A response routed back to its transaction
#[derive(Debug, Clone)]
pub(crate) struct StunReply {
    pub message: StunMessage,
    /// The datagram as received, for integrity and fingerprint checks
    pub raw: Bytes,
    pub from: SocketAddr,
}

/// Retransmission policy of a transaction
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetransmitPolicy {
    pub initial_timeout: Duration,
    pub retransmits: u32,
    /// Double the timeout after every attempt
    pub backoff: bool,
}

impl RetransmitPolicy {
    fn timeout_for(&self, attempt: u32) -> Duration {
        if self.backoff {
            self.initial_timeout * (1u32 << attempt.min(3)).min(MAX_BACKOFF_FACTOR)
        } else {
            self.initial_timeout
        }
    }
}

/// Outstanding client transactions keyed by transaction id
#[derive(Debug, Clone, Default)]
pub(crate) struct TransactionTable {
    pending: Arc<Mutex<HashMap<TransactionId, oneshot::Sender<StunReply>>>>,
}

impl TransactionTable {
    fn register(&self, transaction_id: TransactionId) -> oneshot::Receiver<StunReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(transaction_id, tx);
        rx
    }

    fn remove(&self, transaction_id: &TransactionId) {
        self.pending.lock().remove(transaction_id);
    }

    /// Hand a response to its transaction. Returns false for unknown ids.
    pub fn resolve(&self, reply: StunReply) -> bool {
        let waiter = self.pending.lock().remove(&reply.message.transaction_id);
        match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drop every outstanding transaction; waiters observe `Error::Closed`
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Send `payload` to `dest` and wait for the response carrying `transaction_id`,
/// retransmitting the identical payload on timeout.
pub(crate) async fn transact(
    socket: &UdpSocket,
    table: &TransactionTable,
    transaction_id: TransactionId,
    payload: &[u8],
    dest: SocketAddr,
    policy: RetransmitPolicy,
) -> Result<StunReply> {
    let mut rx = table.register(transaction_id);
    let attempts = policy.retransmits + 1;

    for attempt in 0..attempts {
        if let Err(e) = socket.send_to(payload, dest).await {
            table.remove(&transaction_id);
            return Err(e.into());
        }
        trace!("STUN transaction to {} attempt {}/{}", dest, attempt + 1, attempts);

        match tokio::time::timeout(policy.timeout_for(attempt), &mut rx).await {
            Ok(Ok(reply)) => return Ok(reply),
            Ok(Err(_)) => return Err(Error::Closed),
            Err(_) => continue,
        }
    }

    table.remove(&transaction_id);
    Err(Error::TransactionTimeout(attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stun::StunAttribute;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetransmitPolicy {
            initial_timeout: Duration::from_millis(100),
            retransmits: 6,
            backoff: true,
        };
        let waits: Vec<u128> = (0..6).map(|a| policy.timeout_for(a).as_millis()).collect();
        assert_eq!(waits, vec![100, 200, 400, 800, 800, 800]);

        let flat = RetransmitPolicy { backoff: false, ..policy };
        assert_eq!(flat.timeout_for(5), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn response_is_routed_by_transaction_id() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let table = TransactionTable::default();

        let request = StunMessage::binding_request();
        let payload = request.encode();

        let responder_table = table.clone();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = StunMessage::decode(&buf[..len]).unwrap();
            let mut response = StunMessage::success_response(&request);
            response.add_attribute(StunAttribute::xor_mapped_address(from, &request.transaction_id));
            let raw = response.encode();
            assert!(responder_table.resolve(StunReply {
                message: StunMessage::decode(&raw).unwrap(),
                raw,
                from: server_addr,
            }));
        });

        let reply = transact(
            &client,
            &table,
            request.transaction_id,
            &payload,
            server_addr,
            RetransmitPolicy {
                initial_timeout: Duration::from_millis(200),
                retransmits: 2,
                backoff: false,
            },
        )
        .await
        .unwrap();

        responder.await.unwrap();
        assert_eq!(reply.from, server_addr);
        assert_eq!(reply.message.xor_mapped_address(), Some(client.local_addr().unwrap()));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn silent_peer_times_out_after_retransmits() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let table = TransactionTable::default();
        let request = StunMessage::binding_request();

        let result = transact(
            &client,
            &table,
            request.transaction_id,
            &request.encode(),
            silent.local_addr().unwrap(),
            RetransmitPolicy {
                initial_timeout: Duration::from_millis(10),
                retransmits: 2,
                backoff: false,
            },
        )
        .await;

        assert!(matches!(result, Err(Error::TransactionTimeout(3))));
        assert_eq!(table.len(), 0);
    }
}
