//! DTLS handshake state machine
//!
//! Four flights, retransmitted with exponential backoff (RFC 6347 4.2.4):
//!
//! ```text
//! Client                                   Server
//! ClientHello (random, ECDHE, cert)  -->
//!                                    <--   ServerHello (random, ECDHE, cert,
//!                                          profile, signature)
//! CertificateVerify, Finished        -->
//!                                    <--   Finished
//! ```
//!
//! The server keeps its final flight so that a retransmitted client flight
//! arriving after completion can be answered; see
//! [`DtlsSession::handle_late_datagram`].

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::RngCore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use super::alert::{Alert, AlertDescription};
use super::crypto::{self, EcdhKeyPair};
use super::message::{
    CertificateVerify, ClientHello, Finished, HandshakeMessage, HandshakeType, ServerHello, RANDOM_LEN,
};
use super::record::{is_dtls_record, ContentType, Record};
use super::{DatagramTransport, DtlsConfig, DtlsIdentity, DtlsRole, Fingerprint};
use crate::error::Error;
use crate::srtp::{SrtpKeyingMaterial, SrtpProfile, SrtpSession};
use crate::Result;

/// Upper bound for the doubled retransmission timer
const MAX_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(8);

/// An established DTLS-SRTP association
pub struct DtlsSession {
    role: DtlsRole,
    profile: SrtpProfile,
    keying_material: SrtpKeyingMaterial,
    remote_certificate: Bytes,
    last_flight: Option<Bytes>,
    next_record_seq: u64,
}

impl DtlsSession {
    /// Our role in the handshake
    pub fn role(&self) -> DtlsRole {
        self.role
    }

    /// Negotiated SRTP protection profile
    pub fn srtp_profile(&self) -> SrtpProfile {
        self.profile
    }

    /// Exported SRTP keys, already split into local and remote halves
    pub fn keying_material(&self) -> &SrtpKeyingMaterial {
        &self.keying_material
    }

    /// Create the SRTP session keyed by this handshake
    pub fn srtp_session(&self) -> SrtpSession {
        SrtpSession::new(self.profile, &self.keying_material)
    }

    /// DER certificate the peer authenticated with
    pub fn remote_certificate(&self) -> &[u8] {
        &self.remote_certificate
    }

    pub fn remote_fingerprint(&self) -> Fingerprint {
        Fingerprint::of_certificate(&self.remote_certificate)
    }

    /// Handle a DTLS datagram that arrives after the handshake completed.
    ///
    /// A repeated handshake flight means the peer never saw our final
    /// flight; the returned bytes must be sent back. An alert from the peer
    /// ends the association and is returned as an error.
    pub fn handle_late_datagram(&self, datagram: &[u8]) -> Result<Option<Bytes>> {
        let records = match Record::parse_all(datagram) {
            Ok(records) => records,
            Err(e) => {
                debug!("Ignoring malformed DTLS datagram after handshake: {}", e);
                return Ok(None);
            }
        };

        let mut resend = None;
        for record in records {
            match record.content_type {
                ContentType::Alert => {
                    if let Ok(alert) = Alert::parse(&record.fragment) {
                        if alert.is_fatal() || alert.description == AlertDescription::CloseNotify {
                            return Err(Error::AlertReceived(alert.description.code()));
                        }
                    }
                }
                ContentType::Handshake => {
                    if self.last_flight.is_some() {
                        debug!("Peer repeated its final flight, resending ours");
                        resend = self.last_flight.clone();
                    }
                }
                _ => {}
            }
        }
        Ok(resend)
    }

    /// A close_notify alert record to send when tearing the session down
    pub fn close_notify(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let record = Record::new(
            ContentType::Alert,
            self.next_record_seq,
            Alert::close_notify().serialize(),
        );
        // A two byte fragment always fits
        let _ = record.serialize(&mut buf);
        buf.freeze()
    }
}

impl std::fmt::Debug for DtlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsSession")
            .field("role", &self.role)
            .field("profile", &self.profile)
            .field("remote_fingerprint", &self.remote_fingerprint())
            .finish_non_exhaustive()
    }
}

/// Run the handshake over `transport` in the given role.
///
/// The peer certificate must hash to `remote_fingerprint`; otherwise the
/// handshake aborts with a fatal `bad_certificate` alert and
/// [`Error::FingerprintMismatch`].
pub async fn handshake<T>(
    transport: &T,
    identity: &DtlsIdentity,
    role: DtlsRole,
    remote_fingerprint: &Fingerprint,
    config: &DtlsConfig,
) -> Result<DtlsSession>
where
    T: DatagramTransport + ?Sized,
{
    if config.srtp_profiles.is_empty() {
        return Err(Error::InvalidParameter("No SRTP profiles configured".into()));
    }

    let handshaker = Handshaker {
        transport,
        identity,
        remote_fingerprint,
        config,
        record_seq: 0,
        message_seq: 0,
        transcript: Vec::new(),
    };

    debug!("Starting DTLS handshake as {:?}", role);
    let session = match role {
        DtlsRole::Client => handshaker.run_client().await?,
        DtlsRole::Server => handshaker.run_server().await?,
    };
    info!(
        "DTLS handshake complete as {:?}, profile {}",
        session.role, session.profile
    );
    Ok(session)
}

struct Handshaker<'a, T: ?Sized> {
    transport: &'a T,
    identity: &'a DtlsIdentity,
    remote_fingerprint: &'a Fingerprint,
    config: &'a DtlsConfig,
    record_seq: u64,
    message_seq: u16,
    transcript: Vec<u8>,
}

impl<'a, T> Handshaker<'a, T>
where
    T: DatagramTransport + ?Sized,
{
    async fn run_client(mut self) -> Result<DtlsSession> {
        let ecdh = EcdhKeyPair::generate();
        let client_random = random();

        let hello = ClientHello {
            random: client_random,
            ecdhe_public: Bytes::copy_from_slice(ecdh.public_bytes()),
            certificate: Bytes::copy_from_slice(self.identity.certificate()),
            srtp_profiles: self.config.srtp_profiles.iter().map(|p| p.id()).collect(),
        };
        let mut flight = BytesMut::new();
        self.add_message(&mut flight, HandshakeType::ClientHello, hello.serialize()?)?;
        let client_hello_flight = flight.freeze();

        let reply = self
            .exchange(Some(&client_hello_flight), &[HandshakeType::ServerHello])
            .await?;
        let server_hello = match ServerHello::parse(&reply[0].body) {
            Ok(hello) => hello,
            Err(e) => return Err(self.abort(AlertDescription::DecodeError, e).await),
        };

        self.check_certificate(&server_hello.certificate).await?;

        let signed = ServerHello::signed_params(&client_random, &server_hello.random, &server_hello.ecdhe_public);
        if let Err(e) = crypto::verify_with_certificate(&server_hello.certificate, &signed, &server_hello.signature) {
            return Err(self.abort(AlertDescription::DecryptError, e).await);
        }

        let offered = &self.config.srtp_profiles;
        let profile = match SrtpProfile::from_id(server_hello.srtp_profile).filter(|p| offered.contains(p)) {
            Some(profile) => profile,
            None => {
                let e = Error::DtlsHandshakeError(format!(
                    "Server selected unoffered SRTP profile {:#06x}",
                    server_hello.srtp_profile
                ));
                return Err(self.abort(AlertDescription::IllegalParameter, e).await);
            }
        };
        self.transcript.extend_from_slice(&reply[0].serialize());

        let pre_master = match ecdh.shared_secret(&server_hello.ecdhe_public) {
            Ok(secret) => secret,
            Err(e) => return Err(self.abort(AlertDescription::IllegalParameter, e).await),
        };
        let master = crypto::master_secret(&pre_master, &client_random, &server_hello.random)?;

        // CertificateVerify signs the hellos, Finished also covers CertificateVerify
        let mut flight = BytesMut::new();
        let verify = CertificateVerify {
            signature: crypto::sign(self.identity.signing_key(), &self.transcript).into(),
        };
        self.add_message(&mut flight, HandshakeType::CertificateVerify, verify.serialize()?)?;
        let finished = Finished {
            verify_data: crypto::verify_data(&master, crypto::LABEL_CLIENT_FINISHED, &self.transcript)?,
        };
        self.add_message(&mut flight, HandshakeType::Finished, finished.serialize())?;
        let finished_flight = flight.freeze();

        let reply = self
            .exchange(Some(&finished_flight), &[HandshakeType::Finished])
            .await?;
        let server_finished = match Finished::parse(&reply[0].body) {
            Ok(finished) => finished,
            Err(e) => return Err(self.abort(AlertDescription::DecodeError, e).await),
        };
        let expected = crypto::verify_data(&master, crypto::LABEL_SERVER_FINISHED, &self.transcript)?;
        if server_finished.verify_data != expected {
            let e = Error::DtlsHandshakeError("Server Finished verify data mismatch".into());
            return Err(self.abort(AlertDescription::DecryptError, e).await);
        }

        let exported = crypto::export_srtp_keying_material(
            &master,
            &client_random,
            &server_hello.random,
            profile.keying_material_len(),
        )?;

        Ok(DtlsSession {
            role: DtlsRole::Client,
            profile,
            keying_material: SrtpKeyingMaterial::from_exported(&exported, true)?,
            remote_certificate: server_hello.certificate,
            last_flight: None,
            next_record_seq: self.record_seq,
        })
    }

    async fn run_server(mut self) -> Result<DtlsSession> {
        let reply = self.exchange(None, &[HandshakeType::ClientHello]).await?;
        let client_hello = match ClientHello::parse(&reply[0].body) {
            Ok(hello) => hello,
            Err(e) => return Err(self.abort(AlertDescription::DecodeError, e).await),
        };

        self.check_certificate(&client_hello.certificate).await?;

        // Our preference order wins among the profiles the client offered
        let profile = self
            .config
            .srtp_profiles
            .iter()
            .copied()
            .find(|p| client_hello.srtp_profiles.contains(&p.id()));
        let Some(profile) = profile else {
            let e = Error::DtlsHandshakeError("No common SRTP profile".into());
            return Err(self.abort(AlertDescription::HandshakeFailure, e).await);
        };
        self.transcript.extend_from_slice(&reply[0].serialize());

        let ecdh = EcdhKeyPair::generate();
        let server_random = random();
        let signed = ServerHello::signed_params(&client_hello.random, &server_random, ecdh.public_bytes());
        let hello = ServerHello {
            random: server_random,
            ecdhe_public: Bytes::copy_from_slice(ecdh.public_bytes()),
            certificate: Bytes::copy_from_slice(self.identity.certificate()),
            srtp_profile: profile.id(),
            signature: crypto::sign(self.identity.signing_key(), &signed).into(),
        };
        let mut flight = BytesMut::new();
        self.add_message(&mut flight, HandshakeType::ServerHello, hello.serialize()?)?;
        let server_hello_flight = flight.freeze();

        let reply = self
            .exchange(
                Some(&server_hello_flight),
                &[HandshakeType::CertificateVerify, HandshakeType::Finished],
            )
            .await?;

        let verify = match CertificateVerify::parse(&reply[0].body) {
            Ok(verify) => verify,
            Err(e) => return Err(self.abort(AlertDescription::DecodeError, e).await),
        };
        if let Err(e) = crypto::verify_with_certificate(&client_hello.certificate, &self.transcript, &verify.signature) {
            return Err(self.abort(AlertDescription::DecryptError, e).await);
        }
        self.transcript.extend_from_slice(&reply[0].serialize());

        let pre_master = match ecdh.shared_secret(&client_hello.ecdhe_public) {
            Ok(secret) => secret,
            Err(e) => return Err(self.abort(AlertDescription::IllegalParameter, e).await),
        };
        let master = crypto::master_secret(&pre_master, &client_hello.random, &server_random)?;

        let client_finished = match Finished::parse(&reply[1].body) {
            Ok(finished) => finished,
            Err(e) => return Err(self.abort(AlertDescription::DecodeError, e).await),
        };
        let expected = crypto::verify_data(&master, crypto::LABEL_CLIENT_FINISHED, &self.transcript)?;
        if client_finished.verify_data != expected {
            let e = Error::DtlsHandshakeError("Client Finished verify data mismatch".into());
            return Err(self.abort(AlertDescription::DecryptError, e).await);
        }
        self.transcript.extend_from_slice(&reply[1].serialize());

        let finished = Finished {
            verify_data: crypto::verify_data(&master, crypto::LABEL_SERVER_FINISHED, &self.transcript)?,
        };
        let mut flight = BytesMut::new();
        self.add_message(&mut flight, HandshakeType::Finished, finished.serialize())?;
        let finished_flight = flight.freeze();
        self.transport.send(&finished_flight).await?;

        let exported = crypto::export_srtp_keying_material(
            &master,
            &client_hello.random,
            &server_random,
            profile.keying_material_len(),
        )?;

        Ok(DtlsSession {
            role: DtlsRole::Server,
            profile,
            keying_material: SrtpKeyingMaterial::from_exported(&exported, false)?,
            remote_certificate: client_hello.certificate,
            last_flight: Some(finished_flight),
            next_record_seq: self.record_seq,
        })
    }

    /// Frame a handshake message into a record of `flight` and add it to the transcript
    fn add_message(&mut self, flight: &mut BytesMut, msg_type: HandshakeType, body: Bytes) -> Result<()> {
        let message = HandshakeMessage::new(msg_type, self.message_seq, body);
        self.message_seq = self.message_seq.wrapping_add(1);

        let serialized = message.serialize();
        self.transcript.extend_from_slice(&serialized);

        Record::new(ContentType::Handshake, self.next_record_seq(), serialized).serialize(flight)
    }

    fn next_record_seq(&mut self) -> u64 {
        let seq = self.record_seq;
        self.record_seq += 1;
        seq
    }

    async fn check_certificate(&mut self, certificate: &[u8]) -> Result<()> {
        if self.remote_fingerprint.matches(certificate) {
            return Ok(());
        }
        let e = Error::FingerprintMismatch {
            expected: self.remote_fingerprint.to_string(),
            actual: Fingerprint::of_certificate(certificate).to_string(),
        };
        Err(self.abort(AlertDescription::BadCertificate, e).await)
    }

    /// Send a fatal alert and hand back the error that caused it
    async fn abort(&mut self, description: AlertDescription, error: Error) -> Error {
        warn!("Aborting DTLS handshake with {:?}: {}", description, error);
        let mut buf = BytesMut::new();
        let record = Record::new(
            ContentType::Alert,
            self.next_record_seq(),
            Alert::fatal(description).serialize(),
        );
        if record.serialize(&mut buf).is_ok() {
            if let Err(e) = self.transport.send(&buf).await {
                debug!("Failed to send alert: {}", e);
            }
        }
        error
    }

    /// Send `flight` (if any) and wait for the `expected` messages,
    /// retransmitting on timeout and whenever the peer repeats an older flight.
    async fn exchange(&mut self, flight: Option<&Bytes>, expected: &[HandshakeType]) -> Result<Vec<HandshakeMessage>> {
        let mut wait = self.config.retransmit_timeout();
        let mut retransmissions = 0;
        let mut received: Vec<HandshakeMessage> = Vec::with_capacity(expected.len());

        if let Some(flight) = flight {
            self.transport.send(flight).await?;
        }
        let mut deadline = Instant::now() + wait;

        loop {
            let datagram = match timeout_at(deadline, self.transport.recv()).await {
                Ok(result) => result?,
                Err(_) => {
                    if retransmissions >= self.config.max_retransmissions {
                        warn!("No response to DTLS flight after {} retransmissions", retransmissions);
                        return Err(Error::HandshakeTimeout(retransmissions + 1));
                    }
                    retransmissions += 1;
                    wait = (wait * 2).min(MAX_RETRANSMIT_TIMEOUT);
                    deadline = Instant::now() + wait;
                    if let Some(flight) = flight {
                        debug!("Retransmitting DTLS flight (attempt {})", retransmissions);
                        self.transport.send(flight).await?;
                    }
                    continue;
                }
            };

            if !is_dtls_record(&datagram) {
                trace!("Ignoring non-DTLS datagram during handshake");
                continue;
            }
            let records = match Record::parse_all(&datagram) {
                Ok(records) => records,
                Err(e) => {
                    debug!("Dropping malformed DTLS datagram: {}", e);
                    continue;
                }
            };

            let mut stale = false;
            for record in records {
                match record.content_type {
                    ContentType::Alert => {
                        let Ok(alert) = Alert::parse(&record.fragment) else {
                            continue;
                        };
                        if alert.is_fatal() || alert.description == AlertDescription::CloseNotify {
                            warn!("Peer aborted DTLS handshake with {:?}", alert.description);
                            return Err(Error::AlertReceived(alert.description.code()));
                        }
                    }
                    ContentType::Handshake => {
                        let message = match HandshakeMessage::parse(&record.fragment) {
                            Ok(message) => message,
                            Err(e) => {
                                debug!("Dropping malformed handshake message: {}", e);
                                continue;
                            }
                        };
                        match expected.get(received.len()) {
                            Some(next) if *next == message.msg_type => received.push(message),
                            // Duplicate of something we already hold
                            _ if expected.contains(&message.msg_type) => {}
                            _ => stale = true,
                        }
                    }
                    other => trace!("Ignoring {:?} record during handshake", other),
                }
            }

            if received.len() == expected.len() {
                return Ok(received);
            }
            if stale {
                if let Some(flight) = flight {
                    debug!("Peer repeated an earlier flight, resending ours");
                    self.transport.send(flight).await?;
                }
            }
        }
    }
}

fn random() -> [u8; RANDOM_LEN] {
    let mut random = [0u8; RANDOM_LEN];
    rand::thread_rng().fill_bytes(&mut random);
    random
}
