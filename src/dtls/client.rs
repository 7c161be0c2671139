// DTLS PSK Client Handshake Flow:
//
// 1. Client sends ClientHello without cookie
// 2. Server answers HelloVerifyRequest with a cookie
//    - Client resends ClientHello with cookie, transcript starts here
// 3. Server sends ServerHello, ServerHelloDone
// 4. Client sends ClientKeyExchange (psk identity), ChangeCipherSpec, Finished
// 5. Server verifies Finished, then sends ChangeCipherSpec, Finished
// 6. Handshake complete, application data can flow

use std::sync::Arc;
use std::time::Instant;

use zeroize::Zeroizing;

use super::crypto::CryptoContext;
use super::engine::Engine;
use super::message::{
    CipherSuite, ClientHello, ClientKeyExchange, Cookie, Finished, HandshakeType,
    HelloVerifyRequest, ProtocolVersion, Random, ServerHello, COMPRESSION_NULL,
};
use crate::config::Config;
use crate::error::Error;
use crate::rng::SeededRng;

/// DTLS client
pub struct Client {
    /// Engine in common between server and client.
    pub(crate) engine: Engine,

    state: ClientState,

    psk: Zeroizing<Vec<u8>>,

    /// Our random, the same in both ClientHellos.
    random: Random,

    /// Cookie from the HelloVerifyRequest.
    cookie: Cookie,
}

/// Current state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// ClientHello sent, await HelloVerifyRequest or ServerHello.
    AwaitServerHello,

    /// Keys derived, await ServerHelloDone.
    AwaitServerHelloDone,

    /// Our Finished sent, await the server Finished.
    AwaitFinished,

    /// Send and receive encrypted data.
    Connected,
}

impl Client {
    pub fn new(config: Arc<Config>, psk: &[u8], mut rng: SeededRng) -> Client {
        let random = Random::new(&mut rng);
        Client {
            engine: Engine::new(config, rng),
            state: ClientState::AwaitServerHello,
            psk: Zeroizing::new(psk.to_vec()),
            random,
            cookie: Cookie::empty(),
        }
    }

    pub fn start(&mut self, now: Instant) -> Result<(), Error> {
        debug!("Start client handshake");
        self.send_client_hello(now)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Consume queued handshake messages for as long as the state machine advances.
    pub fn process(&mut self, now: Instant) -> Result<(), Error> {
        loop {
            let progressed = match self.state {
                ClientState::AwaitServerHello => self.await_server_hello(now)?,
                ClientState::AwaitServerHelloDone => self.await_server_hello_done(now)?,
                ClientState::AwaitFinished => self.await_finished()?,
                ClientState::Connected => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn send_client_hello(&mut self, now: Instant) -> Result<(), Error> {
        self.engine.flight_begin(now, false);
        let hello = ClientHello::new(self.random, self.cookie);
        self.engine
            .create_handshake(HandshakeType::ClientHello, |body| hello.serialize(body))
    }

    fn await_server_hello(&mut self, now: Instant) -> Result<bool, Error> {
        match self.engine.peek_handshake() {
            None => Ok(false),
            Some(HandshakeType::HelloVerifyRequest) => {
                let Some(incoming) = self.engine.next_handshake(HandshakeType::HelloVerifyRequest)?
                else {
                    return Ok(false);
                };
                let (_, hvr) = HelloVerifyRequest::parse(incoming.body())
                    .map_err(|_| Error::Crypto("malformed HelloVerifyRequest".into()))?;
                self.engine.recycle(incoming.raw);

                debug!("Received HelloVerifyRequest, cookie {} bytes", hvr.cookie.len());
                self.cookie = hvr.cookie;

                // The cookie exchange is not part of the handshake hash
                self.engine.transcript_reset();
                self.send_client_hello(now)?;
                Ok(true)
            }
            Some(_) => {
                let Some(incoming) = self.engine.next_handshake(HandshakeType::ServerHello)? else {
                    return Ok(false);
                };
                let (_, hello) = ServerHello::parse(incoming.body())
                    .map_err(|_| Error::Crypto("malformed ServerHello".into()))?;

                if hello.server_version != ProtocolVersion::DTLS1_2 {
                    return Err(Error::Crypto(format!(
                        "unsupported server version {}",
                        hello.server_version
                    )));
                }
                if hello.cipher_suite != CipherSuite::PskAes128GcmSha256 {
                    return Err(Error::Crypto(format!(
                        "server selected {:?}",
                        hello.cipher_suite
                    )));
                }
                if hello.compression_method != COMPRESSION_NULL {
                    return Err(Error::Crypto("server selected compression".into()));
                }

                self.engine.transcript_push(&incoming.raw);
                self.engine.recycle(incoming.raw);

                let crypto = CryptoContext::new(&self.psk, &self.random, &hello.random, true)?;
                self.engine.set_crypto(crypto);

                debug!("Received ServerHello");
                self.state = ClientState::AwaitServerHelloDone;
                Ok(true)
            }
        }
    }

    fn await_server_hello_done(&mut self, now: Instant) -> Result<bool, Error> {
        if self.engine.peek_handshake() == Some(HandshakeType::ServerKeyExchange) {
            // Identity hint, which we have no use for.
            if let Some(incoming) = self.engine.next_handshake(HandshakeType::ServerKeyExchange)? {
                trace!("Ignore PSK identity hint");
                self.engine.transcript_push(&incoming.raw);
                self.engine.recycle(incoming.raw);
            }
            return Ok(true);
        }

        let Some(incoming) = self.engine.next_handshake(HandshakeType::ServerHelloDone)? else {
            return Ok(false);
        };
        if !incoming.body().is_empty() {
            return Err(Error::Crypto("ServerHelloDone with body".into()));
        }
        self.engine.transcript_push(&incoming.raw);
        self.engine.recycle(incoming.raw);

        self.send_finished_flight(now)?;
        self.state = ClientState::AwaitFinished;
        Ok(true)
    }

    fn send_finished_flight(&mut self, now: Instant) -> Result<(), Error> {
        self.engine.flight_begin(now, false);

        let identity = self.engine.config().psk_identity().to_vec();
        self.engine
            .create_handshake(HandshakeType::ClientKeyExchange, |body| {
                ClientKeyExchange {
                    psk_identity: &identity,
                }
                .serialize(body)
            })?;

        self.engine.create_change_cipher_spec()?;
        self.engine.enable_local_encryption();

        let verify_data = self.engine.verify_data("client finished")?;
        self.engine.create_handshake(HandshakeType::Finished, |body| {
            Finished::new(&verify_data).serialize(body)
        })
    }

    fn await_finished(&mut self) -> Result<bool, Error> {
        let Some(incoming) = self.engine.next_handshake(HandshakeType::Finished)? else {
            return Ok(false);
        };
        if incoming.record_sequence.epoch == 0 {
            return Err(Error::Crypto("unprotected Finished".into()));
        }

        let expected = self.engine.verify_data("server finished")?;
        let (_, finished) = Finished::parse(incoming.body())
            .map_err(|_| Error::Crypto("malformed Finished".into()))?;
        if finished.verify_data != expected {
            return Err(Error::Crypto("server Finished verification failed".into()));
        }
        self.engine.recycle(incoming.raw);

        self.engine.flight_stop();
        self.state = ClientState::Connected;
        info!("DTLS client handshake complete");
        Ok(true)
    }
}
