//! Border router: terminates the commissioner's DTLS session and relays its CoAP
//! requests to the leader.
//!
//! ```text
//! commissioner --DTLS/CoAP c/cp--> BorderRouter --CoAP c/lp--> leader
//! commissioner <--DTLS(reply)----- BorderRouter <--reply------ leader
//! ```
//!
//! Requests are decoded, their URI path rewritten to the leader-facing one and
//! re-encoded. Everything else about the request (type, code, message id, token, other
//! options, payload) is preserved. Leader replies are encrypted back unchanged.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::coap::{CoapMessage, Dispatch, Dispatcher, Request, Resource, Token};
use crate::config::RelayConfig;
use crate::dtls::{DtlsSession, Role, SessionState};
use crate::error::{Error, TransportError};
use crate::transport::{DatagramTransport, MAX_DATAGRAM_LEN};

/// Commissioner-facing URI paths and their leader-facing equivalents.
pub const URI_TABLE: &[(&str, &str)] = &[
    ("c/cp", "c/lp"),
    ("c/ca", "c/la"),
    ("c/ag", "c/ag"),
    ("c/as", "c/as"),
    ("c/pg", "c/pg"),
    ("c/ps", "c/ps"),
];

/// Longest the event loops block on a transport.
const MAX_POLL_WAIT: Duration = Duration::from_millis(20);

/// Leader-facing URI path for a commissioner request, if the relay forwards it.
pub fn translate_uri(uri: &str) -> Option<&'static str> {
    URI_TABLE
        .iter()
        .find(|(from, _)| *from == uri)
        .map(|(_, to)| *to)
}

/// Counters of what the relay did with traffic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Requests sent on to the leader.
    pub forwarded: u64,
    /// Leader replies sent back to the commissioner.
    pub replies: u64,
    /// Requests for a URI outside the translation table.
    pub dropped_unknown_uri: u64,
    /// Plaintext that did not decode as CoAP, or could not be re-encoded.
    pub dropped_malformed: u64,
    /// Sends or receives the transports refused.
    pub transport_errors: u64,
}

/// What the translation handler produced for one plaintext.
#[derive(Debug, Default)]
struct Translated {
    forwards: Vec<Vec<u8>>,
    unknown_uri: u64,
    encode_failures: u64,
    last_request: Option<(u16, Token)>,
}

fn translate(request: &Request<'_>, out: &mut Translated) {
    let Some(leader_uri) = translate_uri(request.uri_path) else {
        warn!("Drop request for unknown URI {:?}", request.uri_path);
        out.unknown_uri += 1;
        return;
    };

    let mut message = request.message.clone();
    message.set_uri_path(leader_uri);

    match message.encode() {
        Ok(bytes) => {
            debug!(
                "Relay {} -> {} mid={} ({} bytes)",
                request.uri_path,
                leader_uri,
                message.message_id,
                bytes.len()
            );
            out.last_request = Some((message.message_id, message.token.clone()));
            out.forwards.push(bytes);
        }
        Err(e) => {
            warn!("Drop request for {}: {}", request.uri_path, e);
            out.encode_failures += 1;
        }
    }
}

/// Opaque id binding the DTLS cookie to a commissioner address.
fn peer_transport_id(addr: SocketAddr) -> Vec<u8> {
    let mut id = match addr {
        SocketAddr::V4(a) => a.ip().octets().to_vec(),
        SocketAddr::V6(a) => a.ip().octets().to_vec(),
    };
    id.extend_from_slice(&addr.port().to_be_bytes());
    id
}

/// The border router relay engine.
///
/// `C` faces the commissioner, `L` the leader. All methods are driven by the caller,
/// see [`spawn`] for a loop that does so.
pub struct BorderRouter<C, L> {
    config: RelayConfig,
    session: DtlsSession,
    dispatcher: Dispatcher<Translated>,
    commissioner: C,
    leader: L,
    commissioner_addr: Option<SocketAddr>,
    last_request: Option<(u16, Token)>,
    stats: RelayStats,
}

impl<C: DatagramTransport, L: DatagramTransport> BorderRouter<C, L> {
    pub fn new(config: RelayConfig, commissioner: C, leader: L) -> Result<Self, Error> {
        let mut session = DtlsSession::new(config.dtls().clone());
        session.set_psk(config.pskc().as_bytes())?;

        let mut io = (
            |_: &[u8]| {},
            |_: &[u8]| -> Result<(), TransportError> { Ok(()) },
        );
        session.start(Role::Server, Instant::now(), &mut io)?;

        let mut dispatcher = Dispatcher::new();
        dispatcher.add_resource(Resource::new("relay", translate))?;

        info!(
            "Border router for {:?} relaying to leader at {}",
            config.network_name(),
            config.leader_addr()
        );

        Ok(BorderRouter {
            config,
            session,
            dispatcher,
            commissioner,
            leader,
            commissioner_addr: None,
            last_request: None,
            stats: RelayStats::default(),
        })
    }

    /// Feed a datagram received from a commissioner.
    ///
    /// The first sender becomes the peer the session is bound to. Another sender only
    /// takes over after completing the cookie exchange, until then the bound session
    /// is left untouched.
    pub fn handle_commissioner_datagram(
        &mut self,
        bytes: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> Result<(), Error> {
        match self.commissioner_addr {
            Some(bound) if bound == from => {}
            None => {
                debug!("Commissioner at {}", from);
                self.session.set_peer_transport_id(&peer_transport_id(from))?;
                self.commissioner_addr = Some(from);
            }
            Some(bound) => return self.handle_stranger(bytes, from, bound, now),
        }

        let mut plaintext = Vec::new();
        let result = {
            let commissioner = &self.commissioner;
            let mut io = (
                |data: &[u8]| plaintext.push(data.to_vec()),
                |data: &[u8]| commissioner.send_to(data, from),
            );
            self.session.on_ciphertext_received(bytes, now, &mut io)
        };
        self.count_error(&result);

        let mut relayed = Ok(());
        for data in plaintext {
            if let Err(e) = self.relay_to_leader(&data) {
                if relayed.is_ok() {
                    relayed = Err(e);
                }
            }
        }

        result.and(relayed)
    }

    /// A datagram from someone other than the bound commissioner.
    fn handle_stranger(
        &mut self,
        bytes: &[u8],
        from: SocketAddr,
        bound: SocketAddr,
        now: Instant,
    ) -> Result<(), Error> {
        let result = {
            let commissioner = &self.commissioner;
            let mut io = (
                |_: &[u8]| {},
                |data: &[u8]| commissioner.send_to(data, from),
            );
            self.session
                .accept_new_peer(bytes, &peer_transport_id(from), now, &mut io)
        };
        self.count_error(&result);

        if result? {
            info!("Commissioner moved from {} to {}", bound, from);
            self.commissioner_addr = Some(from);
            self.last_request = None;
        } else {
            debug!("Datagram from {} while serving {}", from, bound);
        }
        Ok(())
    }

    /// Translate one decrypted request and send it to the leader.
    ///
    /// A refused send is counted and the remaining forwards still go out. The first
    /// failure is returned.
    fn relay_to_leader(&mut self, plaintext: &[u8]) -> Result<(), Error> {
        let mut translated = Translated::default();
        if let Dispatch::Malformed(e) = self.dispatcher.receive(plaintext, &mut translated) {
            debug!("Drop undecodable request: {}", e);
            self.stats.dropped_malformed += 1;
            return Ok(());
        }

        self.stats.dropped_unknown_uri += translated.unknown_uri;
        self.stats.dropped_malformed += translated.encode_failures;
        if translated.last_request.is_some() {
            self.last_request = translated.last_request;
        }

        let mut first_error = None;
        for bytes in translated.forwards {
            match self.leader.send_to(&bytes, self.config.leader_addr()) {
                Ok(()) => self.stats.forwarded += 1,
                Err(e) => {
                    warn!("Send to leader failed: {}", e);
                    self.stats.transport_errors += 1;
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Encrypt a leader reply back to the commissioner, unchanged.
    pub fn handle_leader_datagram(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let Some(to) = self.commissioner_addr.filter(|_| self.session.is_connected()) else {
            debug!("Drop leader reply without a connected commissioner");
            return Ok(());
        };

        match CoapMessage::decode(bytes) {
            Ok(reply) => match &self.last_request {
                Some((mid, token)) if reply.message_id == *mid && reply.token == *token => {
                    trace!("Leader reply mid={} matches last request", mid)
                }
                _ => debug!("Leader reply mid={} does not match last request", reply.message_id),
            },
            Err(e) => debug!("Leader reply does not decode: {}", e),
        }

        let result = {
            let commissioner = &self.commissioner;
            let mut io = (
                |_: &[u8]| {},
                |data: &[u8]| commissioner.send_to(data, to),
            );
            self.session.send(bytes, &mut io)
        };
        self.count_error(&result);
        if result.is_ok() {
            self.stats.replies += 1;
        }
        result
    }

    /// Drive handshake retransmission.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        let Some(to) = self.commissioner_addr else {
            return Ok(());
        };
        let result = {
            let commissioner = &self.commissioner;
            let mut io = (
                |_: &[u8]| {},
                |data: &[u8]| commissioner.send_to(data, to),
            );
            self.session.handle_timeout(now, &mut io)
        };
        self.count_error(&result);
        result
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.session.poll_timeout()
    }

    fn count_error<T>(&mut self, result: &Result<T, Error>) {
        if let Err(Error::Transport(_)) = result {
            self.stats.transport_errors += 1;
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn commissioner_addr(&self) -> Option<SocketAddr> {
        self.commissioner_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// One pass of the event loop: wait for traffic up to `max_wait`, handle it and
    /// drive timers.
    pub fn poll(&mut self, buf: &mut [u8], max_wait: Duration) -> Result<(), Error> {
        let now = Instant::now();
        let wait = self
            .poll_timeout()
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or(max_wait)
            .min(max_wait);

        match self.commissioner.recv_from(buf, wait) {
            Ok(Some((n, from))) => {
                log_loop_error(self.handle_commissioner_datagram(&buf[..n], from, Instant::now()))?
            }
            Ok(None) => {}
            Err(e) => self.recv_failed(e)?,
        }

        match self.leader.recv_from(buf, Duration::ZERO) {
            Ok(Some((n, from))) => {
                if from == self.config.leader_addr() {
                    log_loop_error(self.handle_leader_datagram(&buf[..n]))?;
                } else {
                    debug!("Drop leader-side datagram from {}", from);
                }
            }
            Ok(None) => {}
            Err(e) => self.recv_failed(e)?,
        }

        log_loop_error(self.handle_timeout(Instant::now()))
    }

    fn recv_failed(&mut self, e: TransportError) -> Result<(), Error> {
        self.stats.transport_errors += 1;
        match e {
            TransportError::Closed => Err(e.into()),
            e => {
                warn!("Receive failed: {}", e);
                Ok(())
            }
        }
    }
}

/// Errors a loop reports and carries on from. Only a closed transport ends it.
fn log_loop_error(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(Error::Transport(TransportError::Closed)) => Err(TransportError::Closed.into()),
        Err(e) => {
            debug!("Relay: {}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

/// Handle to a loop running on its own thread.
pub struct RelayHandle<T = RelayStats> {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<T, Error>>>,
}

impl<T> RelayHandle<T> {
    /// Stop the loop and wait for it to finish.
    pub fn shutdown(mut self) -> Result<T, Error> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| {
                warn!("Loop thread panicked");
                Error::Transport(TransportError::Closed)
            })?,
            None => Err(TransportError::Closed.into()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }
}

impl<T> Drop for RelayHandle<T> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Run `body` on a named thread until the handle asks it to stop.
pub(crate) fn spawn_loop<T, F>(name: &str, body: F) -> Result<RelayHandle<T>, Error>
where
    T: Send + 'static,
    F: FnOnce(&AtomicBool) -> Result<T, Error> + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&flag))
        .map_err(TransportError::from)?;
    Ok(RelayHandle {
        shutdown,
        thread: Some(thread),
    })
}

/// Run the border router on its own thread.
///
/// The loop waits on the commissioner transport no longer than the next DTLS deadline,
/// checks the leader transport, and drives timers on every pass. Shutting down returns
/// the final [`RelayStats`].
pub fn spawn<C, L>(mut router: BorderRouter<C, L>) -> Result<RelayHandle, Error>
where
    C: DatagramTransport + Send + 'static,
    L: DatagramTransport + Send + 'static,
{
    spawn_loop("meshcop-relay", move |shutdown| run(&mut router, shutdown))
}

/// Drive the border router on the current thread until `shutdown` is set.
pub fn run<C, L>(router: &mut BorderRouter<C, L>, shutdown: &AtomicBool) -> Result<RelayStats, Error>
where
    C: DatagramTransport,
    L: DatagramTransport,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    while !shutdown.load(Ordering::SeqCst) {
        router.poll(&mut buf, MAX_POLL_WAIT)?;
    }
    info!("Relay stopped: {:?}", router.stats());
    Ok(router.stats())
}
