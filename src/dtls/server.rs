// DTLS PSK Server Handshake Flow:
//
// 1. Client sends ClientHello (maybe without cookie)
// 2. If cookie missing/invalid, Server sends HelloVerifyRequest (stateless cookie)
//    - Client resends ClientHello with cookie
// 3. Server sends ServerHello, ServerHelloDone
// 4. Client sends ClientKeyExchange (psk identity), ChangeCipherSpec, Finished
// 5. Server verifies Finished, then sends ChangeCipherSpec, Finished
// 6. Handshake complete, application data can flow
//
// The cookie is bound to the peer transport id so a relay can tell commissioners apart
// before it keeps any state for them.

use std::sync::Arc;
use std::time::Instant;

use zeroize::Zeroizing;

use super::crypto::{CookieSecret, CryptoContext};
use super::engine::Engine;
use super::message::{
    CipherSuite, ClientHello, ClientKeyExchange, Finished, HandshakeType, HelloVerifyRequest,
    ProtocolVersion, Random, ServerHello, SessionId, COMPRESSION_NULL,
};
use crate::config::Config;
use crate::error::Error;
use crate::rng::SeededRng;

/// DTLS server
pub struct Server {
    /// Engine in common between server and client.
    pub(crate) engine: Engine,

    state: ServerState,

    psk: Zeroizing<Vec<u8>>,

    /// Random unique data (with gmt timestamp).
    random: Random,

    /// Cookie secret for HMAC, outlives resets of the session.
    cookie_secret: CookieSecret,

    /// Transport id of the client, bound into the cookie.
    peer_transport_id: Vec<u8>,
}

/// Current state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Await a ClientHello (with or without cookie)
    AwaitClientHello,

    /// ServerHello flight sent, await ClientKeyExchange.
    AwaitClientKeyExchange,

    /// Await the client Finished.
    AwaitFinished,

    /// Send and receive encrypted data.
    Connected,
}

impl Server {
    pub fn new(
        config: Arc<Config>,
        psk: &[u8],
        cookie_secret: CookieSecret,
        peer_transport_id: &[u8],
        mut rng: SeededRng,
    ) -> Server {
        let random = Random::new(&mut rng);
        Server {
            engine: Engine::new(config, rng),
            state: ServerState::AwaitClientHello,
            psk: Zeroizing::new(psk.to_vec()),
            random,
            cookie_secret,
            peer_transport_id: peer_transport_id.to_vec(),
        }
    }

    pub fn set_peer_transport_id(&mut self, id: &[u8]) {
        if self.peer_transport_id != id {
            self.peer_transport_id = id.to_vec();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ServerState::Connected
    }

    /// A ClientHello with a valid cookie has been taken.
    pub fn has_verified_hello(&self) -> bool {
        self.state != ServerState::AwaitClientHello
    }

    /// Consume queued handshake messages for as long as the state machine advances.
    pub fn process(&mut self, now: Instant) -> Result<(), Error> {
        loop {
            let progressed = match self.state {
                ServerState::AwaitClientHello => self.await_client_hello(now)?,
                ServerState::AwaitClientKeyExchange => self.await_client_key_exchange()?,
                ServerState::AwaitFinished => self.await_finished(now)?,
                ServerState::Connected => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn await_client_hello(&mut self, now: Instant) -> Result<bool, Error> {
        let Some(incoming) = self.engine.take_handshake_any_seq(HandshakeType::ClientHello) else {
            return Ok(false);
        };

        let Ok((_, hello)) = ClientHello::parse(incoming.body()) else {
            debug!("Drop malformed ClientHello");
            self.engine.recycle(incoming.raw);
            return Ok(true);
        };

        if hello.client_version != ProtocolVersion::DTLS1_2 {
            return Err(Error::Crypto(format!(
                "unsupported client version {}",
                hello.client_version
            )));
        }
        if !hello.cipher_suites.contains(&CipherSuite::PskAes128GcmSha256) {
            return Err(Error::Crypto("no shared cipher suite".into()));
        }
        if !hello.compression_methods.contains(&COMPRESSION_NULL) {
            return Err(Error::Crypto("client does not offer null compression".into()));
        }

        let message_seq = incoming.header.message_seq;

        if !self
            .cookie_secret
            .verify(&self.peer_transport_id, &hello.random, &hello.cookie)
        {
            let cookie = self
                .cookie_secret
                .compute(&self.peer_transport_id, &hello.random)?;
            let hvr = HelloVerifyRequest {
                server_version: ProtocolVersion::DTLS1_0,
                cookie,
            };
            debug!("Send HelloVerifyRequest");
            self.engine.create_stateless_handshake(
                HandshakeType::HelloVerifyRequest,
                message_seq,
                incoming.record_sequence,
                |body| hvr.serialize(body),
            )?;
            self.engine.recycle(incoming.raw);
            return Ok(true);
        }

        debug!("ClientHello cookie verified");
        self.engine.transcript_reset();
        self.engine.transcript_push(&incoming.raw);
        self.engine.recycle(incoming.raw);
        self.engine
            .set_peer_handshake_seq_no(message_seq.wrapping_add(1));
        self.engine.set_next_handshake_seq_no(message_seq);

        self.send_server_hello_flight(now, hello.secure_renegotiation)?;

        let crypto = CryptoContext::new(&self.psk, &hello.random, &self.random, false)?;
        self.engine.set_crypto(crypto);

        self.state = ServerState::AwaitClientKeyExchange;
        Ok(true)
    }

    fn send_server_hello_flight(&mut self, now: Instant, secure_renegotiation: bool) -> Result<(), Error> {
        self.engine.flight_begin(now, false);

        let hello = ServerHello {
            server_version: ProtocolVersion::DTLS1_2,
            random: self.random,
            session_id: SessionId::empty(),
            cipher_suite: CipherSuite::PskAes128GcmSha256,
            compression_method: COMPRESSION_NULL,
            secure_renegotiation,
        };
        self.engine
            .create_handshake(HandshakeType::ServerHello, |body| hello.serialize(body))?;
        self.engine
            .create_handshake(HandshakeType::ServerHelloDone, |_| {})
    }

    fn await_client_key_exchange(&mut self) -> Result<bool, Error> {
        let Some(incoming) = self.engine.next_handshake(HandshakeType::ClientKeyExchange)? else {
            return Ok(false);
        };
        let (_, cke) = ClientKeyExchange::parse(incoming.body())
            .map_err(|_| Error::Crypto("malformed ClientKeyExchange".into()))?;
        debug!(
            "Client PSK identity {:?}",
            String::from_utf8_lossy(cke.psk_identity)
        );

        self.engine.transcript_push(&incoming.raw);
        self.engine.recycle(incoming.raw);
        self.state = ServerState::AwaitFinished;
        Ok(true)
    }

    fn await_finished(&mut self, now: Instant) -> Result<bool, Error> {
        let Some(incoming) = self.engine.next_handshake(HandshakeType::Finished)? else {
            return Ok(false);
        };
        if incoming.record_sequence.epoch == 0 {
            return Err(Error::Crypto("unprotected Finished".into()));
        }

        let expected = self.engine.verify_data("client finished")?;
        let (_, finished) = Finished::parse(incoming.body())
            .map_err(|_| Error::Crypto("malformed Finished".into()))?;
        if finished.verify_data != expected {
            return Err(Error::Crypto("client Finished verification failed".into()));
        }

        self.engine.transcript_push(&incoming.raw);
        self.engine.recycle(incoming.raw);

        self.send_server_finished_flight(now)?;
        self.state = ServerState::Connected;
        info!("DTLS server handshake complete");
        Ok(true)
    }

    fn send_server_finished_flight(&mut self, now: Instant) -> Result<(), Error> {
        self.engine.flight_begin(now, true);
        self.engine.create_change_cipher_spec()?;
        self.engine.enable_local_encryption();

        let verify_data = self.engine.verify_data("server finished")?;
        self.engine.create_handshake(HandshakeType::Finished, |body| {
            Finished::new(&verify_data).serialize(body)
        })
    }
}
