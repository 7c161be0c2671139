#![no_main]

//! Fuzz target for DTLS datagram handling.
//!
//! Feeds arbitrary bytes to a server session and to a client that has sent its
//! ClientHello, looking for panics in record and handshake parsing.

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use std::time::Instant;

use meshcop_relay::{Config, DtlsSession, Role, TransportError};

fuzz_target!(|data: &[u8]| {
    let config = Arc::new(Config::builder().rng_seed(1).build().expect("config"));
    let now = Instant::now();
    let mut io = (|_: &[u8]| {}, |_: &[u8]| -> Result<(), TransportError> { Ok(()) });

    // Server
    {
        let mut session = DtlsSession::new(Arc::clone(&config));
        let _ = session.set_psk(&[7; 16]);
        let _ = session.set_peer_transport_id(&[127, 0, 0, 1, 0, 1]);
        let _ = session.start(Role::Server, now, &mut io);
        // Ignore errors - we're looking for panics, not handling errors
        let _ = session.on_ciphertext_received(data, now, &mut io);
    }

    // Client
    {
        let mut session = DtlsSession::new(config);
        let _ = session.set_psk(&[7; 16]);
        let _ = session.start(Role::Client, now, &mut io);
        let _ = session.on_ciphertext_received(data, now, &mut io);
        let _ = session.handle_timeout(now, &mut io);
    }
});
