//! DTLS 1.2 PSK session, `TLS_PSK_WITH_AES_128_GCM_SHA256` only.
//!
//! The session is sans-IO: ciphertext is fed in with
//! [`DtlsSession::on_ciphertext_received`], and everything the session produces is
//! handed to a [`SessionIo`] sink before the call returns. Time is driven from outside
//! through [`DtlsSession::handle_timeout`] and [`DtlsSession::poll_timeout`].
//!
//! Errors never tear the session down. Undecodable or unauthenticated datagrams are
//! dropped. Handshake failures, fatal alerts and the final handshake timeout reset the
//! session to [`SessionState::Handshaking`] with the same PSK, ready for a new peer.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use zeroize::Zeroizing;

mod client;
mod crypto;
mod engine;
pub mod message;
mod server;

use client::Client;
use crypto::CookieSecret;
use engine::Engine;
use message::{Alert, ContentType};
use server::Server;

use crate::config::Config;
use crate::error::{ConfigError, Error, TransportError};
use crate::rng::SeededRng;

/// Largest accepted PSK.
pub const MAX_PSK_LEN: usize = 16;

/// Largest accepted peer transport id.
pub const MAX_PEER_TRANSPORT_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Externally visible state of a [`DtlsSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started.
    Initial,
    /// Handshake in progress, or waiting for a peer to start one.
    Handshaking,
    /// Application data can flow.
    Connected,
}

/// Sink for what a session produces.
pub trait SessionIo {
    /// Decrypted application data.
    fn on_plaintext(&mut self, data: &[u8]);

    /// A datagram to put on the wire.
    fn on_ciphertext(&mut self, data: &[u8]) -> Result<(), TransportError>;
}

impl<P, C> SessionIo for (P, C)
where
    P: FnMut(&[u8]),
    C: FnMut(&[u8]) -> Result<(), TransportError>,
{
    fn on_plaintext(&mut self, data: &[u8]) {
        (self.0)(data)
    }

    fn on_ciphertext(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (self.1)(data)
    }
}

enum Endpoint {
    Client(Client),
    Server(Server),
}

impl Endpoint {
    fn engine(&self) -> &Engine {
        match self {
            Endpoint::Client(c) => &c.engine,
            Endpoint::Server(s) => &s.engine,
        }
    }

    fn engine_mut(&mut self) -> &mut Engine {
        match self {
            Endpoint::Client(c) => &mut c.engine,
            Endpoint::Server(s) => &mut s.engine,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Endpoint::Client(c) => c.is_connected(),
            Endpoint::Server(s) => s.is_connected(),
        }
    }

    fn process(&mut self, now: Instant) -> Result<(), Error> {
        match self {
            Endpoint::Client(c) => c.process(now),
            Endpoint::Server(s) => s.process(now),
        }
    }
}

/// One DTLS association, client or server.
pub struct DtlsSession {
    config: Arc<Config>,
    role: Option<Role>,
    psk: Option<Zeroizing<Vec<u8>>>,
    peer_transport_id: Option<Vec<u8>>,
    cookie_secret: CookieSecret,
    endpoint: Option<Endpoint>,
    /// Seeds the per-handshake randomness.
    rng: SeededRng,
    resets: u64,
    was_connected: bool,
}

impl DtlsSession {
    pub fn new(config: Arc<Config>) -> Self {
        let mut rng = SeededRng::new(config.rng_seed());
        let cookie_secret = CookieSecret::new(&mut rng);
        DtlsSession {
            config,
            role: None,
            psk: None,
            peer_transport_id: None,
            cookie_secret,
            endpoint: None,
            rng,
            resets: 0,
            was_connected: false,
        }
    }

    /// Set the PSK used by this and every following handshake.
    pub fn set_psk(&mut self, psk: &[u8]) -> Result<(), Error> {
        if psk.len() > MAX_PSK_LEN {
            return Err(ConfigError::PskTooLong(psk.len()).into());
        }
        self.psk = Some(Zeroizing::new(psk.to_vec()));
        Ok(())
    }

    /// Identify the peer for cookie binding. Required for a server.
    pub fn set_peer_transport_id(&mut self, id: &[u8]) -> Result<(), Error> {
        if id.len() > MAX_PEER_TRANSPORT_ID_LEN {
            return Err(ConfigError::PeerTransportIdTooLong(id.len()).into());
        }
        if let Some(Endpoint::Server(server)) = &mut self.endpoint {
            server.set_peer_transport_id(id);
        }
        self.peer_transport_id = Some(id.to_vec());
        Ok(())
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn start(&mut self, role: Role, now: Instant, io: &mut dyn SessionIo) -> Result<(), Error> {
        if self.role.is_some() {
            return Err(ConfigError::AlreadyStarted.into());
        }
        if self.psk.is_none() {
            return Err(ConfigError::MissingPsk.into());
        }
        info!("Start DTLS session as {:?}", role);
        self.role = Some(role);
        self.arm(now)?;
        self.flush(io)
    }

    /// A new endpoint for `role`, keyed with the current PSK.
    fn arm(&mut self, now: Instant) -> Result<(), Error> {
        let Some(role) = self.role else {
            return Err(ConfigError::NotStarted.into());
        };
        let rng = self.endpoint_rng();
        let Some(psk) = &self.psk else {
            return Err(ConfigError::MissingPsk.into());
        };

        let endpoint = match role {
            Role::Client => {
                let mut client = Client::new(self.config.clone(), psk, rng);
                client.start(now)?;
                Endpoint::Client(client)
            }
            Role::Server => {
                let peer = self.peer_transport_id.as_deref().unwrap_or_default();
                Endpoint::Server(Server::new(
                    self.config.clone(),
                    psk,
                    self.cookie_secret.clone(),
                    peer,
                    rng,
                ))
            }
        };
        self.endpoint = Some(endpoint);
        self.was_connected = false;
        Ok(())
    }

    /// Randomness for a new endpoint, reproducible under a seeded config.
    fn endpoint_rng(&mut self) -> SeededRng {
        let seed = self.config.rng_seed().map(|_| self.rng.random::<u64>());
        SeededRng::new(seed)
    }

    fn reset(&mut self, now: Instant) -> Result<(), Error> {
        self.resets += 1;
        info!("Reset DTLS session (reset {})", self.resets);
        self.endpoint = None;
        self.arm(now)
    }

    /// Feed one received datagram.
    ///
    /// Returns the error that reset the session, if any. Dropped datagrams are not
    /// errors.
    pub fn on_ciphertext_received(
        &mut self,
        packet: &[u8],
        now: Instant,
        io: &mut dyn SessionIo,
    ) -> Result<(), Error> {
        let Some(role) = self.role else {
            return Err(ConfigError::NotStarted.into());
        };
        if role == Role::Server && self.peer_transport_id.is_none() {
            return Err(ConfigError::MissingPeerTransportId.into());
        }

        if role == Role::Server && self.is_connected() && is_client_hello(packet) {
            debug!("ClientHello while connected");
            let peer = self.peer_transport_id.clone().unwrap_or_default();
            self.accept_new_peer(packet, &peer, now, io)?;
            return Ok(());
        }

        let result = self.feed(packet, now);
        self.settle(result, now, io)
    }

    /// Offer a new handshake to a peer without disturbing the current association.
    ///
    /// Only a plaintext ClientHello is looked at, anything else is dropped. A hello
    /// without a valid cookie for `peer_transport_id` is answered with a
    /// HelloVerifyRequest from a throwaway server and the session stays as it is. A
    /// hello carrying a valid cookie replaces the association: the session binds to
    /// `peer_transport_id` and continues the new handshake. Returns whether that
    /// happened.
    pub fn accept_new_peer(
        &mut self,
        packet: &[u8],
        peer_transport_id: &[u8],
        now: Instant,
        io: &mut dyn SessionIo,
    ) -> Result<bool, Error> {
        if self.role != Some(Role::Server) {
            return Err(ConfigError::NotStarted.into());
        }
        if peer_transport_id.len() > MAX_PEER_TRANSPORT_ID_LEN {
            return Err(ConfigError::PeerTransportIdTooLong(peer_transport_id.len()).into());
        }
        if !is_client_hello(packet) {
            trace!("Drop datagram from another peer");
            return Ok(false);
        }

        let rng = self.endpoint_rng();
        let Some(psk) = &self.psk else {
            return Err(ConfigError::MissingPsk.into());
        };
        let mut side = Server::new(
            self.config.clone(),
            psk,
            self.cookie_secret.clone(),
            peer_transport_id,
            rng,
        );

        let fed = match side.engine.handle_packet(packet) {
            Err(e) if !e.is_drop() => Err(e),
            _ => side.process(now),
        };
        if let Err(e) = fed {
            debug!("Drop ClientHello from another peer: {}", e);
            return Ok(false);
        }

        if !side.has_verified_hello() {
            flush_engine(&mut side.engine, io)?;
            return Ok(false);
        }

        self.resets += 1;
        info!("New peer completed the cookie exchange (reset {})", self.resets);
        self.endpoint = Some(Endpoint::Server(side));
        self.peer_transport_id = Some(peer_transport_id.to_vec());
        self.was_connected = false;
        self.flush(io)?;
        Ok(true)
    }

    fn feed(&mut self, packet: &[u8], now: Instant) -> Result<(), Error> {
        let Some(endpoint) = &mut self.endpoint else {
            return Err(ConfigError::NotStarted.into());
        };

        if let Err(e) = endpoint.engine_mut().handle_packet(packet) {
            if !e.is_drop() {
                return Err(e);
            }
            debug!("Drop rest of datagram: {}", e);
        }

        endpoint.process(now)?;
        endpoint.engine_mut().handle_peer_retransmit()
    }

    /// Reset on a failed handshake, then flush whatever is queued.
    fn settle(&mut self, result: Result<(), Error>, now: Instant, io: &mut dyn SessionIo) -> Result<(), Error> {
        let failure = match result {
            Ok(()) => None,
            Err(e @ Error::Config(_)) => return Err(e),
            Err(e) => {
                warn!("DTLS session failed: {}", e);
                self.reset(now)?;
                Some(e)
            }
        };

        if !self.was_connected && self.is_connected() {
            self.was_connected = true;
            info!("DTLS session connected");
        }

        self.flush(io)?;
        failure.map_or(Ok(()), Err)
    }

    /// Send application data. Requires a completed handshake.
    pub fn send(&mut self, data: &[u8], io: &mut dyn SessionIo) -> Result<(), Error> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if let Some(endpoint) = &mut self.endpoint {
            endpoint.engine_mut().send_application_data(data)?;
        }
        self.flush(io)
    }

    /// Drive retransmission. Past the final handshake deadline the session resets and
    /// [`Error::Timeout`] is returned.
    pub fn handle_timeout(&mut self, now: Instant, io: &mut dyn SessionIo) -> Result<(), Error> {
        let Some(endpoint) = &mut self.endpoint else {
            return Ok(());
        };
        let result = endpoint.engine_mut().handle_timeout(now);
        self.settle(result, now, io)
    }

    /// Next instant [`handle_timeout`](Self::handle_timeout) has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.endpoint.as_ref().and_then(|e| e.engine().poll_timeout())
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.as_ref().map(|e| e.is_connected()).unwrap_or(false)
    }

    pub fn state(&self) -> SessionState {
        match &self.endpoint {
            None => SessionState::Initial,
            Some(e) if e.is_connected() => SessionState::Connected,
            Some(_) => SessionState::Handshaking,
        }
    }

    /// How many times the session fell back to a fresh handshake.
    pub fn reset_count(&self) -> u64 {
        self.resets
    }

    /// Send close_notify if connected and return to [`SessionState::Initial`].
    pub fn close(&mut self, io: &mut dyn SessionIo) -> Result<(), Error> {
        let result = match &mut self.endpoint {
            Some(endpoint) if endpoint.is_connected() => {
                endpoint.engine_mut().send_alert(Alert::close_notify())?;
                self.flush(io)
            }
            _ => Ok(()),
        };
        debug!("Close DTLS session");
        self.endpoint = None;
        self.role = None;
        self.was_connected = false;
        result
    }

    /// Hand queued datagrams and plaintext to `io`.
    ///
    /// A datagram the transport refuses stays queued for the next flush.
    fn flush(&mut self, io: &mut dyn SessionIo) -> Result<(), Error> {
        match &mut self.endpoint {
            Some(endpoint) => flush_engine(endpoint.engine_mut(), io),
            None => Ok(()),
        }
    }
}

fn flush_engine(engine: &mut Engine, io: &mut dyn SessionIo) -> Result<(), Error> {
    while let Some(datagram) = engine.poll_datagram() {
        if let Err(e) = io.on_ciphertext(&datagram) {
            debug!("Transport refused datagram: {}", e);
            engine.requeue_datagram(datagram);
            return Err(e.into());
        }
        engine.recycle(datagram);
    }

    while let Some(data) = engine.poll_app_data() {
        io.on_plaintext(&data);
        engine.recycle(data);
    }

    Ok(())
}

impl fmt::Debug for DtlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsSession")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("resets", &self.resets)
            .finish_non_exhaustive()
    }
}

/// Whether the datagram starts with a plaintext ClientHello.
pub(crate) fn is_client_hello(packet: &[u8]) -> bool {
    packet.len() > 25
        && packet[0] == ContentType::Handshake.as_u8()
        && packet[3..5] == [0, 0]
        && packet[13] == 1
}
