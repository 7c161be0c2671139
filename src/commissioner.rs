//! External commissioner: the DTLS client side of a border router.
//!
//! Sends petitions, keep-alives and dataset requests as confirmable CoAP POSTs inside
//! the DTLS session, and turns the leader's replies into [`CommissionerEvent`]s.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::coap::{CoapMessage, Code, MessageType, Token, CONTENT_FORMAT_OCTET_STREAM};
use crate::config::Config;
use crate::dtls::{DtlsSession, Role, SessionState};
use crate::error::{Error, TransportError};
use crate::psk::Pskc;
use crate::rng::SeededRng;
use crate::tlv::{encode_tlvs, find, parse_tlvs, State, Tlv, TlvType};
use crate::transport::DatagramTransport;
use crate::util::hex;

pub const URI_PETITION: &str = "c/cp";
pub const URI_KEEP_ALIVE: &str = "c/ca";
pub const URI_ACTIVE_GET: &str = "c/ag";
pub const URI_ACTIVE_SET: &str = "c/as";
pub const URI_PENDING_GET: &str = "c/pg";
pub const URI_PENDING_SET: &str = "c/ps";

/// Requests awaiting a reply. Past this the oldest is given up on.
pub const MAX_PENDING_REQUESTS: usize = 16;

/// Outcome of a request, correlated by token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommissionerEvent {
    /// Petition, keep-alive or dataset set accepted.
    Accepted { session_id: u16 },
    /// The leader said no, or the reply did not make sense.
    Rejected,
    /// Reply to a dataset get.
    Dataset(Vec<Tlv>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Petition,
    KeepAlive,
    Get,
    Set,
}

/// Commissioner client over a [`DatagramTransport`].
pub struct Commissioner<T> {
    session: DtlsSession,
    transport: T,
    border_agent: SocketAddr,
    rng: SeededRng,
    message_id: u16,
    pending: Vec<(Token, RequestKind)>,
    session_id: Option<u16>,
    events: VecDeque<CommissionerEvent>,
}

impl<T: DatagramTransport> Commissioner<T> {
    pub fn new(
        config: Arc<Config>,
        pskc: &Pskc,
        transport: T,
        border_agent: SocketAddr,
    ) -> Result<Self, Error> {
        let mut rng = SeededRng::new(config.rng_seed());
        let message_id = rng.random();

        let mut session = DtlsSession::new(config);
        session.set_psk(pskc.as_bytes())?;

        Ok(Commissioner {
            session,
            transport,
            border_agent,
            rng,
            message_id,
            pending: Vec::new(),
            session_id: None,
            events: VecDeque::new(),
        })
    }

    /// Start the DTLS handshake with the border agent.
    pub fn connect(&mut self, now: Instant) -> Result<(), Error> {
        info!("Connect to border agent at {}", self.border_agent);
        let (transport, to) = (&self.transport, self.border_agent);
        let mut io = (
            |_: &[u8]| {},
            |data: &[u8]| transport.send_to(data, to),
        );
        self.session.start(Role::Client, now, &mut io)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Commissioner session id from the last accepted petition.
    pub fn session_id(&self) -> Option<u16> {
        self.session_id
    }

    /// Requests sent that have not been answered yet.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn poll_event(&mut self) -> Option<CommissionerEvent> {
        self.events.pop_front()
    }

    /// Feed a datagram received from the border agent.
    pub fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr, now: Instant) -> Result<(), Error> {
        if from != self.border_agent {
            debug!("Drop datagram from {}", from);
            return Ok(());
        }

        let mut plaintext = Vec::new();
        let result = {
            let (transport, to) = (&self.transport, self.border_agent);
            let mut io = (
                |data: &[u8]| plaintext.push(data.to_vec()),
                |data: &[u8]| transport.send_to(data, to),
            );
            self.session.on_ciphertext_received(bytes, now, &mut io)
        };

        for data in plaintext {
            self.handle_reply(&data);
        }
        result
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        let (transport, to) = (&self.transport, self.border_agent);
        let mut io = (
            |_: &[u8]| {},
            |data: &[u8]| transport.send_to(data, to),
        );
        self.session.handle_timeout(now, &mut io)
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.session.poll_timeout()
    }

    /// Wait up to `max_wait` for a datagram, handle it and drive timers.
    pub fn poll(&mut self, buf: &mut [u8], max_wait: Duration) -> Result<(), Error> {
        let now = Instant::now();
        let wait = self
            .poll_timeout()
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or(max_wait)
            .min(max_wait);

        if let Some((n, from)) = self.transport.recv_from(buf, wait)? {
            self.handle_datagram(&buf[..n], from, Instant::now())?;
        }
        self.handle_timeout(Instant::now())
    }

    /// Ask the leader to become the active commissioner.
    pub fn petition(&mut self, commissioner_id: &str) -> Result<Token, Error> {
        let id = Tlv::new(TlvType::COMMISSIONER_ID, commissioner_id.as_bytes())?;
        self.request(URI_PETITION, RequestKind::Petition, &[id])
    }

    pub fn keep_alive(&mut self) -> Result<Token, Error> {
        let mut tlvs = vec![Tlv::state(State::Accept)];
        tlvs.extend(self.session_tlv());
        self.request(URI_KEEP_ALIVE, RequestKind::KeepAlive, &tlvs)
    }

    /// Read the active dataset. An empty `types` asks for all of it.
    pub fn get_active(&mut self, types: &[TlvType]) -> Result<Token, Error> {
        self.get(URI_ACTIVE_GET, types)
    }

    pub fn get_pending(&mut self, types: &[TlvType]) -> Result<Token, Error> {
        self.get(URI_PENDING_GET, types)
    }

    pub fn set_active(&mut self, tlvs: &[Tlv]) -> Result<Token, Error> {
        self.set(URI_ACTIVE_SET, tlvs)
    }

    pub fn set_pending(&mut self, tlvs: &[Tlv]) -> Result<Token, Error> {
        self.set(URI_PENDING_SET, tlvs)
    }

    fn get(&mut self, uri: &str, types: &[TlvType]) -> Result<Token, Error> {
        let mut tlvs: Vec<Tlv> = self.session_tlv().into_iter().collect();
        if !types.is_empty() {
            let list: Vec<u8> = types.iter().map(|t| t.0).collect();
            tlvs.push(Tlv::new(TlvType::GET, &list)?);
        }
        self.request(uri, RequestKind::Get, &tlvs)
    }

    fn set(&mut self, uri: &str, content: &[Tlv]) -> Result<Token, Error> {
        let mut tlvs: Vec<Tlv> = self.session_tlv().into_iter().collect();
        tlvs.extend_from_slice(content);
        self.request(uri, RequestKind::Set, &tlvs)
    }

    fn session_tlv(&self) -> Option<Tlv> {
        self.session_id
            .map(|id| Tlv::u16(TlvType::COMMISSIONER_SESSION_ID, id))
    }

    fn request(&mut self, uri: &str, kind: RequestKind, tlvs: &[Tlv]) -> Result<Token, Error> {
        if !self.session.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut token = [0u8; 2];
        self.rng.fill(&mut token);
        self.message_id = self.message_id.wrapping_add(1);

        let mut message = CoapMessage::new(MessageType::Confirmable, Code::POST, self.message_id);
        message.set_token(&token)?;
        message.set_uri_path(uri);
        message.set_content_format(CONTENT_FORMAT_OCTET_STREAM);
        message.payload = encode_tlvs(tlvs);
        let bytes = message.encode()?;

        {
            let (transport, to) = (&self.transport, self.border_agent);
            let mut io = (
                |_: &[u8]| {},
                |data: &[u8]| -> Result<(), TransportError> { transport.send_to(data, to) },
            );
            self.session.send(&bytes, &mut io)?;
        }

        debug!("Sent {} mid={} token={}", uri, message.message_id, hex(&token));
        if self.pending.len() >= MAX_PENDING_REQUESTS {
            let (oldest, kind) = self.pending.remove(0);
            debug!("No reply to {:?} token={}, giving up", kind, hex(&oldest));
        }
        self.pending.push((message.token.clone(), kind));
        Ok(message.token)
    }

    fn handle_reply(&mut self, data: &[u8]) {
        let reply = match CoapMessage::decode(data) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Drop undecodable reply: {}", e);
                return;
            }
        };

        let Some(index) = self.pending.iter().position(|(t, _)| *t == reply.token) else {
            debug!("Drop reply mid={} with unknown token", reply.message_id);
            return;
        };
        let (_, kind) = self.pending.remove(index);

        let tlvs = match parse_tlvs(&reply.payload) {
            Ok(tlvs) if reply.code.class() == 2 => tlvs,
            Ok(_) => {
                debug!("{:?} failed with {}", kind, reply.code);
                self.events.push_back(CommissionerEvent::Rejected);
                return;
            }
            Err(e) => {
                debug!("Drop reply with bad TLVs: {}", e);
                self.events.push_back(CommissionerEvent::Rejected);
                return;
            }
        };

        let accepted = find(&tlvs, TlvType::STATE).and_then(Tlv::as_state) == Some(State::Accept);
        let event = match kind {
            RequestKind::Get => CommissionerEvent::Dataset(tlvs),
            RequestKind::Petition => {
                match find(&tlvs, TlvType::COMMISSIONER_SESSION_ID).and_then(Tlv::as_u16) {
                    Some(session_id) if accepted => {
                        info!("Petition accepted, session id {}", session_id);
                        self.session_id = Some(session_id);
                        CommissionerEvent::Accepted { session_id }
                    }
                    _ => CommissionerEvent::Rejected,
                }
            }
            RequestKind::KeepAlive | RequestKind::Set => match self.session_id {
                Some(session_id) if accepted => CommissionerEvent::Accepted { session_id },
                _ => CommissionerEvent::Rejected,
            },
        };
        self.events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn requests_need_a_session() {
        let network = MemoryNetwork::new();
        let config = Arc::new(Config::builder().rng_seed(3).build().unwrap());
        let mut commissioner = Commissioner::new(
            config,
            &Pskc::from_bytes([1; 16]),
            network.bind(addr(1)).unwrap(),
            addr(19779),
        )
        .unwrap();

        assert!(matches!(commissioner.petition("me"), Err(Error::NotConnected)));
        assert_eq!(commissioner.session_state(), SessionState::Initial);

        let agent = network.bind(addr(19779)).unwrap();
        commissioner.connect(Instant::now()).unwrap();
        assert_eq!(commissioner.session_state(), SessionState::Handshaking);

        let mut buf = [0u8; 1500];
        let (n, from) = agent
            .recv_from(&mut buf, Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(from, addr(1));
        // ClientHello in a handshake record
        assert_eq!(buf[0], 22);
        assert_eq!(buf[13], 1);
        assert!(n > 13 + 12);
    }

    #[test]
    fn datagrams_from_strangers_are_ignored() {
        let network = MemoryNetwork::new();
        let config = Arc::new(Config::default());
        let mut commissioner = Commissioner::new(
            config,
            &Pskc::from_bytes([1; 16]),
            network.bind(addr(1)).unwrap(),
            addr(19779),
        )
        .unwrap();
        commissioner
            .handle_datagram(&[22, 0xfe, 0xfd], addr(4), Instant::now())
            .unwrap();
        assert!(commissioner.poll_event().is_none());
    }
}
