//! An established, encrypted link to one peer.
//!
//! [`SecureLink`] sits on top of a [`SecureSession`] and adds what the
//! session deliberately leaves out: reliable delivery (ack, dedupe and
//! retransmission) and the propose/ack exchange that lets both peers rotate
//! keys at the same point in the stream.
//!
//! Every datagram a link emits is a complete envelope ready for `send_to`.
//! Datagrams produced as a side effect of receiving (acks, rekey responses)
//! and of [`SecureLink::poll`] (retransmissions, proposals) are collected in
//! an outbox drained with [`SecureLink::take_outgoing`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::{CryptoError, DecryptError, LinkError};
use crate::framing::{self, Envelope, PacketFlags, PacketType};
use crate::header::{Channel, PacketHeader};
use crate::messages::{
    decode_message, encode_message, Ack, RekeyControl, RekeyRequest, RekeyResponse,
};
use crate::replay::ReplayWindow;
use crate::session::{RekeyPolicy, Role, SecureSession, TAG_SIZE};

pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Size of the reliable sequence repeated inside the ciphertext.
const SEALED_SEQ_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    pub resend_interval: Duration,
    pub max_attempts: u32,
    pub rekey: RekeyPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            resend_interval: DEFAULT_RESEND_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            rekey: RekeyPolicy::default(),
        }
    }
}

/// Application data that came out of [`SecureLink::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub channel: Channel,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct PendingReliable {
    flags: PacketFlags,
    body: Vec<u8>,
    last_sent: Instant,
    attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RekeyState {
    Idle,
    Proposed { point: u64, reliable_seq: u32 },
}

#[derive(Debug)]
pub struct SecureLink {
    session: SecureSession,
    /// Keys from before the last rotation, kept until the peer is seen using the new ones.
    retired: Option<SecureSession>,
    outbound_sequence: u32,
    pending: BTreeMap<u32, PendingReliable>,
    inbound: ReplayWindow,
    rekey: RekeyState,
    config: LinkConfig,
    outbox: Vec<Vec<u8>>,
    received_any: bool,
    rekeys_completed: u64,
}

impl SecureLink {
    pub fn new(session: SecureSession, config: LinkConfig) -> Self {
        Self {
            session: session.with_policy(config.rekey),
            retired: None,
            outbound_sequence: 0,
            pending: BTreeMap::new(),
            inbound: ReplayWindow::new(),
            rekey: RekeyState::Idle,
            config,
            outbox: Vec::new(),
            received_any: false,
            rekeys_completed: 0,
        }
    }

    pub fn session(&self) -> &SecureSession {
        &self.session
    }

    pub fn connection_id(&self) -> u32 {
        self.session.connection_id()
    }

    pub fn outbound_sequence(&self) -> u32 {
        self.outbound_sequence
    }

    pub fn pending_reliable(&self) -> usize {
        self.pending.len()
    }

    /// Whether any datagram from the peer has authenticated yet.
    pub fn has_received(&self) -> bool {
        self.received_any
    }

    pub fn is_rekeying(&self) -> bool {
        self.rekey != RekeyState::Idle || self.retired.is_some()
    }

    pub fn rekeys_completed(&self) -> u64 {
        self.rekeys_completed
    }

    pub fn take_outgoing(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    pub fn send_unreliable(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        seal_envelope(
            &mut self.session,
            PacketFlags::NONE,
            PacketType::Unreliable,
            None,
            payload,
        )
    }

    /// Seals `payload` for reliable delivery and tracks it until acknowledged.
    pub fn send_reliable(&mut self, payload: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        let (_, datagram) = self.queue_reliable(PacketFlags::NONE, payload, now)?;
        Ok(datagram)
    }

    /// Authenticates and handles one decoded envelope from the peer.
    ///
    /// Returns the application payload if there is one to deliver. Acks,
    /// duplicates and rekey control messages are consumed here.
    pub fn open(&mut self, envelope: &Envelope<'_>) -> Result<Option<Received>, LinkError> {
        if !envelope.flags.contains(PacketFlags::ENCRYPTED) {
            return Err(LinkError::NotEncrypted);
        }
        let header = SecureSession::peek_header(envelope.payload)?;
        let phase = header.flags.key_phase();
        let via_retired = phase != self.session.key_phase()
            && self
                .retired
                .as_ref()
                .map_or(false, |retired| retired.key_phase() == phase);

        let (_, mut plaintext) = match self.retired.as_mut() {
            Some(retired) if via_retired => retired.open_packet(envelope.payload)?,
            _ => self.session.open_packet(envelope.payload)?,
        };
        self.received_any = true;
        if !via_retired && self.retired.take().is_some() {
            debug!(
                "Connection {} peer switched keys, retired keys dropped",
                self.connection_id()
            );
        }

        match envelope.packet_type {
            PacketType::Unreliable => Ok(Some(Received {
                channel: Channel::Unreliable,
                payload: plaintext,
            })),
            PacketType::Reliable => {
                let seq = envelope.reliable_seq.ok_or(LinkError::ReliableMismatch)?;
                if plaintext.len() < SEALED_SEQ_SIZE {
                    return Err(DecryptError::Malformed.into());
                }
                let payload = plaintext.split_off(SEALED_SEQ_SIZE);
                let sealed_seq =
                    u32::from_le_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
                if sealed_seq != seq {
                    return Err(LinkError::ReliableMismatch);
                }

                self.queue_ack(seq, via_retired)?;
                let fresh = self.inbound.accept(u64::from(seq));

                if envelope.flags.contains(PacketFlags::REKEY) {
                    if fresh || via_retired {
                        self.handle_rekey(&payload, via_retired)?;
                    }
                    return Ok(None);
                }
                if !fresh {
                    trace!(
                        "Connection {} duplicate reliable {}",
                        self.connection_id(),
                        seq
                    );
                    return Ok(None);
                }
                Ok(Some(Received {
                    channel: Channel::Reliable,
                    payload,
                }))
            }
            PacketType::Ack => {
                let ack: Ack = decode_message(&plaintext)?;
                self.handle_ack(ack.reliable_seq);
                Ok(None)
            }
            other => Err(LinkError::UnexpectedType(other)),
        }
    }

    /// Retransmits overdue reliable datagrams and proposes a rekey when the
    /// session's thresholds are crossed.
    pub fn poll(&mut self, now: Instant) -> Result<(), LinkError> {
        let due: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, entry)| {
                now.saturating_duration_since(entry.last_sent) >= self.config.resend_interval
            })
            .map(|(seq, _)| *seq)
            .collect();

        for seq in due {
            let exhausted = match self.pending.get(&seq) {
                Some(entry) => entry.attempts >= self.config.max_attempts,
                None => continue,
            };
            if exhausted {
                self.pending.remove(&seq);
                match self.rekey {
                    RekeyState::Proposed { reliable_seq, .. } if reliable_seq == seq => {
                        warn!(
                            "Connection {} rekey proposal unanswered after {} attempts",
                            self.connection_id(),
                            self.config.max_attempts
                        );
                        self.rekey = RekeyState::Idle;
                    }
                    _ => warn!(
                        "Connection {} dropping reliable {} after {} attempts",
                        self.connection_id(),
                        seq,
                        self.config.max_attempts
                    ),
                }
                continue;
            }

            if let Some(entry) = self.pending.get_mut(&seq) {
                entry.attempts += 1;
                entry.last_sent = now;
                // Re-sealed so the retransmission carries a fresh AEAD sequence.
                let datagram = seal_envelope(
                    &mut self.session,
                    entry.flags,
                    PacketType::Reliable,
                    Some(seq),
                    &entry.body,
                )?;
                self.outbox.push(datagram);
            }
        }

        if self.rekey == RekeyState::Idle
            && self.retired.is_none()
            && self.session.should_rekey_at(now)
        {
            self.request_rekey(now)?;
        }
        Ok(())
    }

    /// Proposes a key rotation at the current stream position.
    ///
    /// Does nothing while a rotation is already in progress.
    pub fn request_rekey(&mut self, now: Instant) -> Result<(), LinkError> {
        if self.is_rekeying() {
            return Ok(());
        }
        let point = self.session.rekey_point();
        let body = encode_message(&RekeyControl::Request(RekeyRequest {
            current_sequence: point,
        }))?;
        let (reliable_seq, datagram) = self.queue_reliable(PacketFlags::REKEY, &body, now)?;
        self.outbox.push(datagram);
        self.rekey = RekeyState::Proposed {
            point,
            reliable_seq,
        };
        debug!(
            "Connection {} proposed rekey at point {}",
            self.connection_id(),
            point
        );
        Ok(())
    }

    fn next_reliable_seq(&mut self) -> u32 {
        let seq = self.outbound_sequence;
        self.outbound_sequence = self.outbound_sequence.wrapping_add(1);
        seq
    }

    fn queue_reliable(
        &mut self,
        flags: PacketFlags,
        payload: &[u8],
        now: Instant,
    ) -> Result<(u32, Vec<u8>), CryptoError> {
        let seq = self.next_reliable_seq();
        let body = reliable_body(seq, payload);
        let datagram = seal_envelope(
            &mut self.session,
            flags,
            PacketType::Reliable,
            Some(seq),
            &body,
        )?;
        self.pending.insert(
            seq,
            PendingReliable {
                flags,
                body,
                last_sent: now,
                attempts: 1,
            },
        );
        Ok((seq, datagram))
    }

    fn session_for(&mut self, via_retired: bool) -> &mut SecureSession {
        match self.retired.as_mut() {
            Some(retired) if via_retired => retired,
            _ => &mut self.session,
        }
    }

    fn queue_ack(&mut self, reliable_seq: u32, via_retired: bool) -> Result<(), LinkError> {
        let body = encode_message(&Ack { reliable_seq })?;
        let datagram = seal_envelope(
            self.session_for(via_retired),
            PacketFlags::NONE,
            PacketType::Ack,
            None,
            &body,
        )?;
        self.outbox.push(datagram);
        Ok(())
    }

    fn handle_ack(&mut self, reliable_seq: u32) {
        // A proposal stays queued until the response arrives, not just the ack.
        if let RekeyState::Proposed {
            reliable_seq: proposal,
            ..
        } = self.rekey
        {
            if proposal == reliable_seq {
                return;
            }
        }
        if self.pending.remove(&reliable_seq).is_some() {
            trace!(
                "Connection {} reliable {} acknowledged",
                self.connection_id(),
                reliable_seq
            );
        }
    }

    fn handle_rekey(&mut self, payload: &[u8], via_retired: bool) -> Result<(), LinkError> {
        match decode_message::<RekeyControl>(payload)? {
            RekeyControl::Request(request) => self.on_rekey_request(request, via_retired),
            RekeyControl::Response(response) => self.on_rekey_response(response),
        }
    }

    fn on_rekey_request(&mut self, request: RekeyRequest, via_retired: bool) -> Result<(), LinkError> {
        let point = request.current_sequence;
        if via_retired {
            // The first response was lost; answer under the keys the proposer still holds.
            return self.send_rekey_response(point, true);
        }

        if let RekeyState::Proposed { reliable_seq, .. } = self.rekey {
            if self.session.role() == Role::Server {
                debug!(
                    "Connection {} ignoring peer rekey proposal, own proposal in flight",
                    self.connection_id()
                );
                return Ok(());
            }
            self.pending.remove(&reliable_seq);
            self.rekey = RekeyState::Idle;
        }

        self.send_rekey_response(point, false)?;
        self.switch_keys(point)
    }

    fn on_rekey_response(&mut self, response: RekeyResponse) -> Result<(), LinkError> {
        match self.rekey {
            RekeyState::Proposed {
                point,
                reliable_seq,
            } if response.acknowledged_sequence == point => {
                self.pending.remove(&reliable_seq);
                self.rekey = RekeyState::Idle;
                if response.accepted {
                    self.switch_keys(point)
                } else {
                    warn!("Connection {} peer refused rekey", self.connection_id());
                    Ok(())
                }
            }
            _ => {
                debug!(
                    "Connection {} ignoring unsolicited rekey response",
                    self.connection_id()
                );
                Ok(())
            }
        }
    }

    /// Rekey responses are not tracked for retransmission; the proposer's
    /// retries of its request are what make the exchange reliable.
    fn send_rekey_response(&mut self, point: u64, via_retired: bool) -> Result<(), LinkError> {
        let body = encode_message(&RekeyControl::Response(RekeyResponse {
            accepted: true,
            acknowledged_sequence: point,
        }))?;
        let seq = self.next_reliable_seq();
        let sealed_body = reliable_body(seq, &body);
        let datagram = seal_envelope(
            self.session_for(via_retired),
            PacketFlags::REKEY,
            PacketType::Reliable,
            Some(seq),
            &sealed_body,
        )?;
        self.outbox.push(datagram);
        Ok(())
    }

    fn switch_keys(&mut self, point: u64) -> Result<(), LinkError> {
        let mut next = self.session.clone();
        next.perform_rekey_at(point)?;
        self.retired = Some(std::mem::replace(&mut self.session, next));
        self.rekeys_completed += 1;
        info!(
            "Connection {} rotated keys at point {}",
            self.connection_id(),
            point
        );
        Ok(())
    }
}

/// Largest application payload that fits a `packet_size` datagram on either channel.
pub fn max_payload(packet_size: usize) -> usize {
    let overhead = framing::encoded_len(
        PacketType::Reliable,
        PacketHeader::SIZE + SEALED_SEQ_SIZE + TAG_SIZE,
    );
    packet_size.saturating_sub(overhead)
}

/// Reliable plaintext repeats the envelope's sequence so that it is authenticated.
fn reliable_body(seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(SEALED_SEQ_SIZE + payload.len());
    body.extend_from_slice(&seq.to_le_bytes());
    body.extend_from_slice(payload);
    body
}

fn seal_envelope(
    session: &mut SecureSession,
    flags: PacketFlags,
    packet_type: PacketType,
    reliable_seq: Option<u32>,
    body: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let channel = if packet_type.is_reliable() {
        Channel::Reliable
    } else {
        Channel::Unreliable
    };
    let sealed = session.seal_packet(channel, body)?;
    Ok(framing::encode(
        flags.with(PacketFlags::ENCRYPTED),
        packet_type,
        reliable_seq,
        &sealed,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::decode;
    use crate::session::SALT_SIZE;

    fn pair_with(config: LinkConfig) -> (SecureLink, SecureLink) {
        let okm = [0x5Au8; 64];
        let salt = [1u8; SALT_SIZE];
        let server = SecureSession::from_key_material(Role::Server, 77, &okm, salt);
        let client = SecureSession::from_key_material(Role::Client, 77, &okm, salt);
        (
            SecureLink::new(server, config),
            SecureLink::new(client, config),
        )
    }

    fn pair() -> (SecureLink, SecureLink) {
        pair_with(LinkConfig::default())
    }

    fn deliver(to: &mut SecureLink, datagram: &[u8]) -> Option<Received> {
        let envelope = decode(datagram).unwrap();
        to.open(&envelope).unwrap()
    }

    fn deliver_all(to: &mut SecureLink, datagrams: Vec<Vec<u8>>) -> Vec<Received> {
        datagrams
            .iter()
            .filter_map(|datagram| deliver(to, datagram))
            .collect()
    }

    #[test]
    fn test_unreliable_round_trip() {
        let (mut server, mut client) = pair();
        let datagram = client.send_unreliable(b"move").unwrap();
        let received = deliver(&mut server, &datagram).unwrap();
        assert_eq!(received.channel, Channel::Unreliable);
        assert_eq!(received.payload, b"move");
        assert!(server.has_received());
        assert!(server.take_outgoing().is_empty());
    }

    #[test]
    fn test_reliable_is_acked_and_deduplicated() {
        let (mut server, mut client) = pair();
        let now = Instant::now();
        let datagram = client.send_reliable(b"chat", now).unwrap();
        assert_eq!(client.pending_reliable(), 1);

        let received = deliver(&mut server, &datagram).unwrap();
        assert_eq!(received.channel, Channel::Reliable);
        assert_eq!(received.payload, b"chat");

        // A resent copy is acked again but not delivered twice.
        client.poll(now + DEFAULT_RESEND_INTERVAL).unwrap();
        let resent = client.take_outgoing();
        assert_eq!(resent.len(), 1);
        assert_ne!(resent[0], datagram);
        assert!(deliver_all(&mut server, resent).is_empty());

        let acks = server.take_outgoing();
        assert_eq!(acks.len(), 2);
        assert!(deliver_all(&mut client, acks).is_empty());
        assert_eq!(client.pending_reliable(), 0);
    }

    #[test]
    fn test_lost_reliable_is_retransmitted() {
        let (mut server, mut client) = pair();
        let now = Instant::now();
        let _lost = client.send_reliable(b"state", now).unwrap();

        client.poll(now + Duration::from_millis(100)).unwrap();
        assert!(client.take_outgoing().is_empty());

        client.poll(now + DEFAULT_RESEND_INTERVAL).unwrap();
        let resent = client.take_outgoing();
        let received = deliver_all(&mut server, resent);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, b"state");
    }

    #[test]
    fn test_reliable_dropped_after_max_attempts() {
        let config = LinkConfig {
            resend_interval: Duration::from_millis(10),
            max_attempts: 3,
            ..LinkConfig::default()
        };
        let (_, mut client) = pair_with(config);
        let now = Instant::now();
        client.send_reliable(b"doomed", now).unwrap();

        for step in 1..=3 {
            client.poll(now + Duration::from_millis(10 * step)).unwrap();
        }
        assert_eq!(client.take_outgoing().len(), 2);
        assert_eq!(client.pending_reliable(), 0);
    }

    #[test]
    fn test_plaintext_envelope_rejected() {
        let (mut server, _) = pair();
        let datagram = framing::encode(PacketFlags::NONE, PacketType::Unreliable, None, &[0u8; 40]);
        let envelope = decode(&datagram).unwrap();
        assert!(matches!(
            server.open(&envelope),
            Err(LinkError::NotEncrypted)
        ));
    }

    #[test]
    fn test_rewritten_reliable_sequence_rejected() {
        let (mut server, mut client) = pair();
        let datagram = client.send_reliable(b"x", Instant::now()).unwrap();
        let envelope = decode(&datagram).unwrap();
        let forged = framing::encode(envelope.flags, PacketType::Reliable, Some(99), envelope.payload);
        let forged = decode(&forged).unwrap();
        assert!(matches!(
            server.open(&forged),
            Err(LinkError::ReliableMismatch)
        ));
    }

    #[test]
    fn test_replayed_datagram_rejected() {
        let (mut server, mut client) = pair();
        let datagram = client.send_unreliable(b"once").unwrap();
        deliver(&mut server, &datagram);
        let envelope = decode(&datagram).unwrap();
        assert!(matches!(
            server.open(&envelope),
            Err(LinkError::Decrypt(DecryptError::Replay))
        ));
    }

    #[test]
    fn test_rekey_negotiation() {
        let (mut server, mut client) = pair();
        let now = Instant::now();

        client.request_rekey(now).unwrap();
        assert!(client.is_rekeying());
        let proposal = client.take_outgoing();
        assert_eq!(proposal.len(), 1);
        assert!(deliver_all(&mut server, proposal).is_empty());
        assert_eq!(server.rekeys_completed(), 1);
        assert!(server.session().key_phase());

        // Sent before the client learned about the switch.
        let late = client.send_unreliable(b"late").unwrap();
        assert_eq!(deliver(&mut server, &late).unwrap().payload, b"late");

        let replies = server.take_outgoing();
        assert_eq!(replies.len(), 2);
        assert!(deliver_all(&mut client, replies).is_empty());
        assert_eq!(client.rekeys_completed(), 1);
        assert!(client.session().key_phase());
        assert_eq!(client.pending_reliable(), 0);
        assert_eq!(server.session().tx_key(), client.session().rx_key());

        let datagram = client.send_unreliable(b"new keys").unwrap();
        assert_eq!(deliver(&mut server, &datagram).unwrap().payload, b"new keys");
        assert!(!server.is_rekeying());

        let datagram = server.send_reliable(b"reply", now).unwrap();
        assert_eq!(deliver(&mut client, &datagram).unwrap().payload, b"reply");
    }

    #[test]
    fn test_rekey_survives_lost_response() {
        let (mut server, mut client) = pair();
        let now = Instant::now();

        client.request_rekey(now).unwrap();
        deliver_all(&mut server, client.take_outgoing());
        let _lost = server.take_outgoing();

        client.poll(now + DEFAULT_RESEND_INTERVAL).unwrap();
        let retry = client.take_outgoing();
        assert_eq!(retry.len(), 1);
        deliver_all(&mut server, retry);
        assert_eq!(server.rekeys_completed(), 1);

        deliver_all(&mut client, server.take_outgoing());
        assert_eq!(client.rekeys_completed(), 1);
        assert_eq!(client.session().tx_key(), server.session().rx_key());
    }

    #[test]
    fn test_simultaneous_rekey_server_wins() {
        let (mut server, mut client) = pair();
        let now = Instant::now();
        for _ in 0..3 {
            let datagram = client.send_unreliable(b"tick").unwrap();
            deliver(&mut server, &datagram);
        }

        server.request_rekey(now).unwrap();
        client.request_rekey(now).unwrap();
        let from_server = server.take_outgoing();
        let from_client = client.take_outgoing();

        deliver_all(&mut server, from_client);
        assert_eq!(server.rekeys_completed(), 0);
        deliver_all(&mut client, from_server);
        assert_eq!(client.rekeys_completed(), 1);
        assert_eq!(client.pending_reliable(), 0);

        deliver_all(&mut client, server.take_outgoing());
        deliver_all(&mut server, client.take_outgoing());
        assert_eq!(server.rekeys_completed(), 1);
        assert_eq!(server.session().tx_key(), client.session().rx_key());
        assert_eq!(server.session().rx_key(), client.session().tx_key());

        client.poll(now + DEFAULT_RESEND_INTERVAL).unwrap();
        assert!(client.take_outgoing().is_empty());
    }

    #[test]
    fn test_poll_proposes_when_threshold_crossed() {
        let config = LinkConfig {
            rekey: RekeyPolicy {
                max_bytes: 32,
                max_age: Duration::from_secs(3600),
            },
            ..LinkConfig::default()
        };
        let (mut server, mut client) = pair_with(config);
        let now = Instant::now();
        client.send_unreliable(&[0u8; 64]).unwrap();
        client.poll(now).unwrap();
        assert!(client.is_rekeying());

        deliver_all(&mut server, client.take_outgoing());
        deliver_all(&mut client, server.take_outgoing());
        assert_eq!(client.rekeys_completed(), 1);
        assert_eq!(client.session().bytes_transmitted(), 0);
    }

    #[test]
    fn test_max_payload_fills_packet() {
        let (_, mut client) = pair();
        let limit = max_payload(1200);
        let payload = vec![7u8; limit];
        let datagram = client.send_reliable(&payload, Instant::now()).unwrap();
        assert_eq!(datagram.len(), 1200);
        assert_eq!(client.send_unreliable(&payload).unwrap().len(), 1192);
        assert_eq!(max_payload(10), 0);
    }
}
