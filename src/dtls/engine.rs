use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use super::crypto::{CryptoContext, AEAD_OVERHEAD};
use super::message::{
    Alert, ContentType, DtlsRecord, HandshakeHeader, HandshakeType, ProtocolVersion, Sequence,
    VERIFY_DATA_LEN,
};
use crate::buffer::{Buf, BufferPool};
use crate::config::Config;
use crate::error::{EncodeError, Error, ParseError};
use crate::rng::SeededRng;
use crate::timer::{FlightTimer, TimerState};
use crate::window::ReplayWindow;

/// A complete handshake message waiting to be consumed by the state machine.
#[derive(Debug)]
pub struct Incoming {
    pub header: HandshakeHeader,
    /// Record sequence the message arrived in.
    pub record_sequence: Sequence,
    /// Handshake header and body, as hashed into the transcript.
    pub raw: Buf,
}

impl Incoming {
    pub fn body(&self) -> &[u8] {
        &self.raw[HandshakeHeader::LEN..]
    }
}

/// Plaintext of a record we sent in the current flight, kept for resends.
#[derive(Debug)]
struct SavedRecord {
    content_type: ContentType,
    epoch: u16,
    fragment: Buf,
}

/// Record layer shared by the client and server state machines.
///
/// Incoming datagrams are split into records, decrypted, and handshake messages are
/// queued in `message_seq` order. Outgoing records are packed into datagrams up to
/// the MTU. The current flight is saved so it can be resent on timeout, or when the
/// peer resends its previous flight.
pub struct Engine {
    config: Arc<Config>,
    pub(crate) rng: SeededRng,
    buffers_free: BufferPool,

    /// Next record sequence for epoch 0.
    sequence_epoch_0: Sequence,
    /// Next record sequence for epoch 1.
    sequence_epoch_1: Sequence,
    /// Epoch of our outgoing records.
    local_epoch: u16,

    /// Handshake messages ordered by message_seq.
    queue_rx: VecDeque<Incoming>,
    /// Datagrams ready to be sent.
    queue_tx: VecDeque<Buf>,
    /// Whether the next record may be appended to the last queued datagram.
    pack_tx: bool,
    /// Decrypted application data.
    app_data: VecDeque<Buf>,

    crypto: Option<CryptoContext>,
    peer_encryption_enabled: bool,
    replay: ReplayWindow,

    /// Expected message_seq of the next peer handshake message.
    peer_handshake_seq_no: u16,
    /// message_seq of our next handshake message.
    next_handshake_seq_no: u16,

    transcript: Buf,

    flight_saved: Vec<SavedRecord>,
    flight_timer: FlightTimer,
    /// Our last flight ends the handshake. Resent only when the peer resends.
    flight_final: bool,
    /// The peer resent a handshake message we already consumed.
    peer_retransmit: bool,
}

impl Engine {
    pub fn new(config: Arc<Config>, mut rng: SeededRng) -> Self {
        let flight_timer = FlightTimer::new(
            config.handshake_start_rto(),
            config.handshake_timeout(),
            &mut rng,
        );

        Engine {
            config,
            rng,
            buffers_free: BufferPool::default(),
            sequence_epoch_0: Sequence::new(0),
            sequence_epoch_1: Sequence::new(1),
            local_epoch: 0,
            queue_rx: VecDeque::new(),
            queue_tx: VecDeque::new(),
            pack_tx: false,
            app_data: VecDeque::new(),
            crypto: None,
            peer_encryption_enabled: false,
            replay: ReplayWindow::new(),
            peer_handshake_seq_no: 0,
            next_handshake_seq_no: 0,
            transcript: Buf::new(),
            flight_saved: Vec::new(),
            flight_timer,
            flight_final: false,
            peer_retransmit: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Split a datagram into records and handle each of them.
    ///
    /// Records that fail authentication or arrive out of place are dropped. An
    /// undecodable record header ends the datagram with [`Error::Parse`], after the
    /// records before it have been handled.
    pub fn handle_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        let mut input = packet;
        while !input.is_empty() {
            let (rest, record) = DtlsRecord::parse(input).map_err(ParseError::from)?;
            input = rest;
            trace!("Received {:?}", record);
            self.handle_record(record)?;
        }
        Ok(())
    }

    fn handle_record(&mut self, record: DtlsRecord<'_>) -> Result<(), Error> {
        match record.version {
            ProtocolVersion::DTLS1_0 | ProtocolVersion::DTLS1_2 => {}
            version => {
                debug!("Drop record with version {}", version);
                return Ok(());
            }
        }

        let sequence = record.sequence;
        let plaintext = match sequence.epoch {
            0 => {
                let mut buf = self.buffers_free.pop();
                buf.extend_from_slice(record.fragment);
                buf
            }
            1 => {
                let crypto = match &self.crypto {
                    Some(c) if self.peer_encryption_enabled => c,
                    _ => {
                        debug!("Drop epoch 1 record before ChangeCipherSpec: {}", sequence);
                        return Ok(());
                    }
                };
                if !self.replay.check(sequence) {
                    debug!("Drop replayed record {}", sequence);
                    return Ok(());
                }
                match crypto.decrypt(record.content_type, sequence, record.fragment) {
                    Ok(plaintext) => {
                        self.replay.update(sequence);
                        plaintext
                    }
                    Err(e) => {
                        debug!("Drop record {}: {}", sequence, e);
                        return Ok(());
                    }
                }
            }
            epoch => {
                debug!("Drop record with unknown epoch {}", epoch);
                return Ok(());
            }
        };

        let result = match record.content_type {
            ContentType::Handshake => {
                self.handle_handshake_fragment(sequence, &plaintext);
                Ok(())
            }
            ContentType::ChangeCipherSpec => {
                self.handle_change_cipher_spec(sequence, &plaintext);
                Ok(())
            }
            ContentType::Alert if sequence.epoch == 0 && self.peer_encryption_enabled => {
                debug!("Drop unprotected alert");
                Ok(())
            }
            ContentType::Alert => self.handle_alert(&plaintext),
            ContentType::ApplicationData => {
                if sequence.epoch == 0 {
                    debug!("Drop unprotected application data");
                } else {
                    let mut buf = self.buffers_free.pop();
                    buf.extend_from_slice(&plaintext);
                    self.app_data.push_back(buf);
                }
                Ok(())
            }
            ContentType::Unknown(t) => {
                debug!("Drop record with unknown content type {}", t);
                Ok(())
            }
        };

        self.buffers_free.push(plaintext);
        result
    }

    fn handle_handshake_fragment(&mut self, sequence: Sequence, mut data: &[u8]) {
        while !data.is_empty() {
            let Ok((rest, (header, _body))) = HandshakeHeader::parse_with_body(data) else {
                debug!("Drop undecodable handshake fragment in {}", sequence);
                return;
            };
            let raw = &data[..data.len() - rest.len()];
            data = rest;

            if header.is_fragment() {
                debug!(
                    "Drop fragmented {:?} (offset {}, length {})",
                    header.msg_type, header.fragment_offset, header.fragment_length
                );
                continue;
            }

            self.insert_incoming(header, sequence, raw);
        }
    }

    fn insert_incoming(&mut self, header: HandshakeHeader, record_sequence: Sequence, raw: &[u8]) {
        if header.message_seq < self.peer_handshake_seq_no {
            trace!(
                "Peer resent {:?} seq {}",
                header.msg_type,
                header.message_seq
            );
            self.peer_retransmit = true;
            return;
        }

        if self.queue_rx.len() >= self.config.max_queue_rx() {
            warn!(
                "Receive queue full (max {}), drop {:?}",
                self.config.max_queue_rx(),
                header.msg_type
            );
            return;
        }

        let search = self
            .queue_rx
            .binary_search_by_key(&header.message_seq, |i| i.header.message_seq);

        match search {
            Err(index) => {
                let mut buf = self.buffers_free.pop();
                buf.extend_from_slice(raw);
                self.queue_rx.insert(
                    index,
                    Incoming {
                        header,
                        record_sequence,
                        raw: buf,
                    },
                );
            }
            Ok(_) => {
                // Exact duplicate of a queued message
            }
        }
    }

    fn handle_change_cipher_spec(&mut self, sequence: Sequence, plaintext: &[u8]) {
        if plaintext != [1] || sequence.epoch != 0 {
            debug!("Drop malformed ChangeCipherSpec in {}", sequence);
            return;
        }
        if self.crypto.is_none() {
            debug!("Drop ChangeCipherSpec before key exchange");
            return;
        }
        if !self.peer_encryption_enabled {
            debug!("Peer encryption enabled");
            self.peer_encryption_enabled = true;
            self.replay = ReplayWindow::new();
        }
    }

    fn handle_alert(&mut self, plaintext: &[u8]) -> Result<(), Error> {
        let Ok((_, alert)) = Alert::parse(plaintext) else {
            debug!("Drop undecodable alert");
            return Ok(());
        };
        if alert.is_terminal() {
            info!("Peer sent alert {:?}", alert);
            return Err(Error::Crypto(format!(
                "peer alert {:?} {:?}",
                alert.level, alert.description
            )));
        }
        debug!("Ignore alert {:?}", alert);
        Ok(())
    }

    /// Drop queued messages the state machine has moved past.
    fn purge_stale(&mut self) {
        while let Some(front) = self.queue_rx.front() {
            if front.header.message_seq >= self.peer_handshake_seq_no {
                break;
            }
            if let Some(stale) = self.queue_rx.pop_front() {
                self.buffers_free.push(stale.raw);
            }
        }
    }

    /// Type of the next in-sequence handshake message, if it has arrived.
    pub fn peek_handshake(&mut self) -> Option<HandshakeType> {
        self.purge_stale();
        self.queue_rx
            .front()
            .filter(|i| i.header.message_seq == self.peer_handshake_seq_no)
            .map(|i| i.header.msg_type)
    }

    /// Take the next in-sequence handshake message.
    ///
    /// `Ok(None)` when it has not arrived yet. A different message type than `wanted`
    /// in that position fails the handshake.
    pub fn next_handshake(&mut self, wanted: HandshakeType) -> Result<Option<Incoming>, Error> {
        let Some(msg_type) = self.peek_handshake() else {
            return Ok(None);
        };
        if msg_type != wanted {
            return Err(Error::Crypto(format!(
                "unexpected {:?}, wanted {:?}",
                msg_type, wanted
            )));
        }

        let incoming = self.queue_rx.pop_front();
        if let Some(i) = &incoming {
            self.peer_handshake_seq_no = i.header.message_seq.wrapping_add(1);
        }
        Ok(incoming)
    }

    /// Take the first queued message of type `wanted` regardless of its message_seq.
    ///
    /// Used by a server that has not yet committed to a handshake. Anything else
    /// queued ahead of it is discarded.
    pub fn take_handshake_any_seq(&mut self, wanted: HandshakeType) -> Option<Incoming> {
        while let Some(incoming) = self.queue_rx.pop_front() {
            if incoming.header.msg_type == wanted {
                return Some(incoming);
            }
            debug!("Drop {:?} while waiting for {:?}", incoming.header.msg_type, wanted);
            self.buffers_free.push(incoming.raw);
        }
        None
    }

    pub fn set_peer_handshake_seq_no(&mut self, seq: u16) {
        self.peer_handshake_seq_no = seq;
    }

    pub fn set_next_handshake_seq_no(&mut self, seq: u16) {
        self.next_handshake_seq_no = seq;
    }

    pub fn recycle(&mut self, buf: Buf) {
        self.buffers_free.push(buf);
    }

    pub fn transcript_reset(&mut self) {
        self.transcript.clear();
    }

    pub fn transcript_push(&mut self, raw: &[u8]) {
        self.transcript.extend_from_slice(raw);
    }

    pub fn set_crypto(&mut self, crypto: CryptoContext) {
        self.crypto = Some(crypto);
    }

    /// verify_data over the transcript so far.
    pub fn verify_data(&self, label: &str) -> Result<[u8; VERIFY_DATA_LEN], Error> {
        let Some(crypto) = &self.crypto else {
            return Err(Error::Crypto("verify_data before key exchange".into()));
        };
        crypto.verify_data(label, &self.transcript)
    }

    /// Start a new flight, forgetting the records saved for the previous one.
    ///
    /// A final flight is not retransmitted on timeout, only when the peer resends.
    pub fn flight_begin(&mut self, now: Instant, final_flight: bool) {
        debug!("Begin flight{}", if final_flight { " (final)" } else { "" });
        for saved in self.flight_saved.drain(..) {
            self.buffers_free.push(saved.fragment);
        }
        self.flight_final = final_flight;
        if final_flight {
            self.flight_timer.stop();
        } else {
            self.flight_timer.arm(now, &mut self.rng);
        }
        self.pack_tx = true;
    }

    /// The handshake completed. Timers stop, the saved flight stays for peer resends.
    pub fn flight_stop(&mut self) {
        debug!("Stop flight timers");
        self.flight_timer.stop();
    }

    fn flight_resend(&mut self, reason: &str) -> Result<(), Error> {
        debug!(
            "Resend flight due to {} ({} records)",
            reason,
            self.flight_saved.len()
        );
        self.pack_tx = true;

        let saved = mem::take(&mut self.flight_saved);
        let result = saved
            .iter()
            .try_for_each(|r| self.write_record(r.content_type, r.epoch, &r.fragment));
        self.flight_saved = saved;

        result
    }

    /// Resend our flight if the peer resent one we already handled.
    pub fn handle_peer_retransmit(&mut self) -> Result<(), Error> {
        if !mem::take(&mut self.peer_retransmit) || self.flight_saved.is_empty() {
            return Ok(());
        }
        let waiting = self.flight_timer.next_deadline().is_some();
        if waiting || self.flight_final {
            self.flight_resend("peer resend")?;
        }
        Ok(())
    }

    /// Drive the flight timer. [`Error::Timeout`] once the final deadline passed.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        match self.flight_timer.state(now) {
            TimerState::Final => Err(Error::Timeout("handshake")),
            TimerState::Intermediate => {
                self.flight_resend("timeout")?;
                self.flight_timer.retransmitted(now, &mut self.rng);
                if let Some(at) = self.flight_timer.intermediate() {
                    debug!(
                        "Next resend in {:.03}s",
                        at.saturating_duration_since(now).as_secs_f32()
                    );
                }
                Ok(())
            }
            TimerState::Idle | TimerState::Pending => Ok(()),
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.flight_timer.next_deadline()
    }

    /// Queue a handshake message with the next message_seq.
    ///
    /// Added to the transcript and saved for resends.
    pub fn create_handshake<F>(&mut self, msg_type: HandshakeType, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Buf),
    {
        let mut body = self.buffers_free.pop();
        f(&mut body);

        let header = HandshakeHeader::new(msg_type, body.len() as u32, self.next_handshake_seq_no);
        self.next_handshake_seq_no = self.next_handshake_seq_no.wrapping_add(1);

        let mut raw = self.buffers_free.pop();
        header.serialize(&mut raw);
        raw.extend_from_slice(&body);
        self.buffers_free.push(body);

        self.transcript.extend_from_slice(&raw);
        trace!("Send {:?} seq {}", msg_type, header.message_seq);

        let result = self.create_record(ContentType::Handshake, &raw, true);
        self.buffers_free.push(raw);
        result
    }

    /// Queue a stateless message that is neither saved nor hashed.
    ///
    /// The record reuses `record_sequence` and the message reuses `message_seq`, so a
    /// server answers without keeping per-client state.
    pub fn create_stateless_handshake<F>(
        &mut self,
        msg_type: HandshakeType,
        message_seq: u16,
        record_sequence: Sequence,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Buf),
    {
        let mut body = self.buffers_free.pop();
        f(&mut body);

        let header = HandshakeHeader::new(msg_type, body.len() as u32, message_seq);
        let mut raw = self.buffers_free.pop();
        header.serialize(&mut raw);
        raw.extend_from_slice(&body);
        self.buffers_free.push(body);

        let mut datagram = self.buffers_free.pop();
        DtlsRecord::serialize_header(
            ContentType::Handshake,
            ProtocolVersion::DTLS1_2,
            record_sequence,
            raw.len() as u16,
            &mut datagram,
        );
        datagram.extend_from_slice(&raw);
        self.buffers_free.push(raw);

        self.queue_tx.push_back(datagram);
        self.pack_tx = false;
        Ok(())
    }

    pub fn create_change_cipher_spec(&mut self) -> Result<(), Error> {
        self.create_record(ContentType::ChangeCipherSpec, &[1], true)
    }

    /// Protect all further records we send.
    pub fn enable_local_encryption(&mut self) {
        self.local_epoch = 1;
    }

    fn create_record(
        &mut self,
        content_type: ContentType,
        fragment: &[u8],
        save: bool,
    ) -> Result<(), Error> {
        let epoch = self.local_epoch;
        if save {
            let mut copy = self.buffers_free.pop();
            copy.extend_from_slice(fragment);
            self.flight_saved.push(SavedRecord {
                content_type,
                epoch,
                fragment: copy,
            });
        }
        self.write_record(content_type, epoch, fragment)
    }

    fn write_record(&mut self, content_type: ContentType, epoch: u16, fragment: &[u8]) -> Result<(), Error> {
        let overhead = if epoch >= 1 { AEAD_OVERHEAD } else { 0 };
        let record_len = DtlsRecord::HEADER_LEN + fragment.len() + overhead;

        let sequence = if epoch == 0 {
            &mut self.sequence_epoch_0
        } else {
            &mut self.sequence_epoch_1
        };
        if sequence.sequence_number > Sequence::MAX_SEQUENCE_NUMBER {
            return Err(Error::Crypto("record sequence exhausted".into()));
        }
        let current = *sequence;
        sequence.sequence_number += 1;

        let mut record = self.buffers_free.pop();
        DtlsRecord::serialize_header(
            content_type,
            ProtocolVersion::DTLS1_2,
            current,
            (fragment.len() + overhead) as u16,
            &mut record,
        );
        if epoch == 0 {
            record.extend_from_slice(fragment);
        } else {
            let Some(crypto) = &self.crypto else {
                self.buffers_free.push(record);
                return Err(Error::Crypto("encryption before key exchange".into()));
            };
            crypto.encrypt(content_type, current, fragment, &mut record)?;
        }
        debug_assert_eq!(record.len(), record_len);

        let append = self.pack_tx
            && self
                .queue_tx
                .back()
                .map(|d| d.len() + record.len() <= self.config.mtu())
                .unwrap_or(false);

        if append {
            if let Some(last) = self.queue_tx.back_mut() {
                last.extend_from_slice(&record);
            }
            self.buffers_free.push(record);
        } else {
            self.queue_tx.push_back(record);
        }
        Ok(())
    }

    /// Queue one protected application data record.
    pub fn send_application_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.queue_tx.len() >= self.config.max_queue_tx() {
            debug!("Transmit queue full (max {})", self.config.max_queue_tx());
            return Err(Error::WouldBlock);
        }
        let needed = DtlsRecord::HEADER_LEN + AEAD_OVERHEAD + data.len();
        if needed > self.config.mtu() {
            return Err(EncodeError::BufferFull {
                needed,
                capacity: self.config.mtu(),
            }
            .into());
        }
        self.pack_tx = false;
        self.create_record(ContentType::ApplicationData, data, false)
    }

    pub fn send_alert(&mut self, alert: Alert) -> Result<(), Error> {
        let mut fragment = self.buffers_free.pop();
        alert.serialize(&mut fragment);
        self.pack_tx = false;
        let result = self.create_record(ContentType::Alert, &fragment, false);
        self.buffers_free.push(fragment);
        result
    }

    pub fn poll_datagram(&mut self) -> Option<Buf> {
        let datagram = self.queue_tx.pop_front();
        if self.queue_tx.is_empty() {
            self.pack_tx = false;
        }
        datagram
    }

    /// Put back a datagram the transport did not accept.
    pub fn requeue_datagram(&mut self, datagram: Buf) {
        self.queue_tx.push_front(datagram);
        self.pack_tx = false;
    }

    pub fn poll_app_data(&mut self) -> Option<Buf> {
        self.app_data.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dtls::message::Finished;

    fn engine() -> Engine {
        let config = Config::builder().rng_seed(5).build().unwrap();
        Engine::new(Arc::new(config), SeededRng::new(Some(5)))
    }

    fn handshake_record(msg_type: HandshakeType, seq: u16, record_seq: u64, body: &[u8]) -> Vec<u8> {
        let mut raw = Buf::new();
        HandshakeHeader::new(msg_type, body.len() as u32, seq).serialize(&mut raw);
        raw.extend_from_slice(body);

        let mut out = Buf::new();
        let sequence = Sequence {
            epoch: 0,
            sequence_number: record_seq,
        };
        DtlsRecord::serialize_header(
            ContentType::Handshake,
            ProtocolVersion::DTLS1_2,
            sequence,
            raw.len() as u16,
            &mut out,
        );
        out.extend_from_slice(&raw);
        out.into_vec()
    }

    #[test]
    fn handshakes_are_ordered_by_message_seq() {
        let mut engine = engine();
        engine
            .handle_packet(&handshake_record(HandshakeType::ServerHelloDone, 1, 1, &[]))
            .unwrap();
        assert_eq!(engine.peek_handshake(), None);

        engine
            .handle_packet(&handshake_record(HandshakeType::ServerHello, 0, 0, &[1, 2]))
            .unwrap();
        assert_eq!(engine.peek_handshake(), Some(HandshakeType::ServerHello));

        let hello = engine.next_handshake(HandshakeType::ServerHello).unwrap().unwrap();
        assert_eq!(hello.body(), &[1, 2]);
        let done = engine.next_handshake(HandshakeType::ServerHelloDone).unwrap();
        assert!(done.is_some());
    }

    #[test]
    fn wrong_message_in_sequence_fails() {
        let mut engine = engine();
        engine
            .handle_packet(&handshake_record(HandshakeType::Finished, 0, 0, &[0; 12]))
            .unwrap();
        assert!(engine.next_handshake(HandshakeType::ServerHello).is_err());
    }

    #[test]
    fn truncated_record_is_a_parse_error() {
        let mut engine = engine();
        let mut packet = handshake_record(HandshakeType::ServerHello, 0, 0, &[1, 2, 3]);
        packet.truncate(packet.len() - 1);
        let err = engine.handle_packet(&packet).unwrap_err();
        assert!(err.is_drop());
        assert_eq!(engine.peek_handshake(), None);
    }

    #[test]
    fn fragmented_handshake_is_dropped() {
        let mut engine = engine();
        let mut raw = Buf::new();
        let mut header = HandshakeHeader::new(HandshakeType::ServerHello, 10, 0);
        header.fragment_length = 4;
        header.serialize(&mut raw);
        raw.extend_from_slice(&[0; 4]);

        let mut packet = Buf::new();
        DtlsRecord::serialize_header(
            ContentType::Handshake,
            ProtocolVersion::DTLS1_2,
            Sequence::new(0),
            raw.len() as u16,
            &mut packet,
        );
        packet.extend_from_slice(&raw);

        engine.handle_packet(&packet).unwrap();
        assert_eq!(engine.peek_handshake(), None);
    }

    #[test]
    fn flight_is_packed_and_resent_on_timeout() {
        let mut engine = engine();
        let now = Instant::now();
        engine.flight_begin(now, false);
        engine
            .create_handshake(HandshakeType::ServerHello, |b| b.extend_from_slice(&[7; 40]))
            .unwrap();
        engine.create_handshake(HandshakeType::ServerHelloDone, |_| {}).unwrap();

        let first = engine.poll_datagram().unwrap();
        assert!(engine.poll_datagram().is_none());
        // two records in one datagram
        assert_eq!(first.len(), 13 + 12 + 40 + 13 + 12);

        engine.handle_timeout(now).unwrap();
        assert!(engine.poll_datagram().is_none());

        let deadline = engine.poll_timeout().unwrap();
        engine.handle_timeout(deadline + Duration::from_millis(1)).unwrap();
        let resent = engine.poll_datagram().unwrap();
        assert_eq!(resent.len(), first.len());
        // same messages, new record sequence numbers
        assert_ne!(&resent[..], &first[..]);
        assert_eq!(&resent[13..13 + 52], &first[13..13 + 52]);
    }

    #[test]
    fn final_deadline_times_out() {
        let mut engine = engine();
        let now = Instant::now();
        engine.flight_begin(now, false);
        engine.create_handshake(HandshakeType::ClientHello, |_| {}).unwrap();

        let limit = engine.config().handshake_timeout();
        let err = engine.handle_timeout(now + limit).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn transcript_tracks_created_messages() {
        let mut engine = engine();
        engine.flight_begin(Instant::now(), false);
        engine
            .create_handshake(HandshakeType::Finished, |b| {
                Finished::new(&[1; 12]).serialize(b)
            })
            .unwrap();
        assert_eq!(engine.transcript.len(), 12 + 12);

        engine
            .create_stateless_handshake(
                HandshakeType::HelloVerifyRequest,
                0,
                Sequence::new(0),
                |b| b.push(0),
            )
            .unwrap();
        assert_eq!(engine.transcript.len(), 12 + 12);
    }

    #[test]
    fn application_data_needs_keys_and_room() {
        let mut engine = engine();
        engine.enable_local_encryption();
        assert!(matches!(
            engine.send_application_data(b"hello"),
            Err(Error::Crypto(_))
        ));

        let mtu = engine.config().mtu();
        let big = vec![0u8; mtu];
        assert!(matches!(
            engine.send_application_data(&big),
            Err(Error::Encode(_))
        ));
    }

    #[test]
    fn unprotected_application_data_is_dropped() {
        let mut engine = engine();
        let mut packet = Buf::new();
        DtlsRecord::serialize_header(
            ContentType::ApplicationData,
            ProtocolVersion::DTLS1_2,
            Sequence::new(0),
            3,
            &mut packet,
        );
        packet.extend_from_slice(b"abc");
        engine.handle_packet(&packet).unwrap();
        assert!(engine.poll_app_data().is_none());
    }

    #[test]
    fn fatal_alert_fails() {
        let mut engine = engine();
        let mut packet = Buf::new();
        DtlsRecord::serialize_header(
            ContentType::Alert,
            ProtocolVersion::DTLS1_2,
            Sequence::new(0),
            2,
            &mut packet,
        );
        packet.extend_from_slice(&[2, 40]);
        assert!(matches!(engine.handle_packet(&packet), Err(Error::Crypto(_))));
    }
}
