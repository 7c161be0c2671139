#![allow(unused)]

//! OpenSSL DTLS 1.2 peer over in-memory datagrams, PSK only.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use openssl::error::ErrorStack;
use openssl::ssl::{
    Error, ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslStream,
};

/// Targeted MTU
const DATAGRAM_MTU: u32 = 1150;

const PSK_CIPHERS: &str = "PSK-AES128-GCM-SHA256";

/// Datagram queues standing in for a socket. Each read and write is one datagram.
#[derive(Debug, Default)]
pub struct Datagrams {
    incoming: VecDeque<Vec<u8>>,
    outgoing: VecDeque<Vec<u8>>,
}

impl Read for Datagrams {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(datagram) = self.incoming.pop_front() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }
}

impl Write for Datagrams {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outgoing.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct OsslPeer {
    /// Keeps the context alive for the stream created from it.
    _context: SslContext,
    stream: SslStream<Datagrams>,
    connected: bool,
    plaintext: Vec<Vec<u8>>,
    /// PSK identity the client presented, on a server.
    identity: Arc<Mutex<Option<Vec<u8>>>>,
}

impl OsslPeer {
    pub fn client(psk: &[u8], identity: &str) -> Result<OsslPeer, Error> {
        let mut ctx = context()?;
        let psk = psk.to_vec();
        let identity = identity.as_bytes().to_vec();
        ctx.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
            identity_out[..identity.len()].copy_from_slice(&identity);
            identity_out[identity.len()] = 0;
            psk_out[..psk.len()].copy_from_slice(&psk);
            Ok(psk.len())
        });
        OsslPeer::new(ctx.build(), true, Arc::default())
    }

    pub fn server(psk: &[u8]) -> Result<OsslPeer, Error> {
        let mut ctx = context()?;
        let psk = psk.to_vec();
        let seen: Arc<Mutex<Option<Vec<u8>>>> = Arc::default();
        let record = seen.clone();
        ctx.set_psk_server_callback(move |_ssl, identity, psk_out| {
            if let Ok(mut record) = record.lock() {
                *record = identity.map(|i| i.to_vec());
            }
            psk_out[..psk.len()].copy_from_slice(&psk);
            Ok(psk.len())
        });
        OsslPeer::new(ctx.build(), false, seen)
    }

    fn new(
        context: SslContext,
        active: bool,
        identity: Arc<Mutex<Option<Vec<u8>>>>,
    ) -> Result<OsslPeer, Error> {
        let mut ssl = Ssl::new(&context)?;
        ssl.set_mtu(DATAGRAM_MTU)?;
        if active {
            ssl.set_connect_state();
        } else {
            ssl.set_accept_state();
        }
        let stream = SslStream::new(ssl, Datagrams::default())?;
        let mut peer = OsslPeer {
            _context: context,
            stream,
            connected: false,
            plaintext: Vec::new(),
            identity,
        };
        // A client sends its ClientHello right away.
        peer.drive()?;
        Ok(peer)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn psk_identity(&self) -> Option<Vec<u8>> {
        self.identity.lock().ok().and_then(|i| i.clone())
    }

    pub fn receive(&mut self, datagram: &[u8]) -> Result<(), Error> {
        self.stream.get_mut().incoming.push_back(datagram.to_vec());
        self.drive()
    }

    fn drive(&mut self) -> Result<(), Error> {
        if !self.connected {
            match self.stream.do_handshake() {
                Ok(()) => self.connected = true,
                Err(e) if e.code() == ErrorCode::WANT_READ => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        let mut buf = vec![0u8; 2048];
        loop {
            match self.stream.ssl_read(&mut buf) {
                Ok(n) => self.plaintext.push(buf[..n].to_vec()),
                Err(e) if e.code() == ErrorCode::WANT_READ => return Ok(()),
                Err(e) if e.code() == ErrorCode::ZERO_RETURN => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        self.stream.ssl_write(data).map(|_| ())
    }

    pub fn take_datagrams(&mut self) -> Vec<Vec<u8>> {
        self.stream.get_mut().outgoing.drain(..).collect()
    }

    pub fn take_plaintext(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.plaintext)
    }
}

fn context() -> Result<SslContextBuilder, ErrorStack> {
    let mut ctx = SslContextBuilder::new(SslMethod::dtls())?;
    ctx.set_cipher_list(PSK_CIPHERS)?;

    let mut options = SslOptions::empty();
    options.insert(SslOptions::NO_DTLSV1);
    options.insert(SslOptions::NO_TICKET);
    ctx.set_options(options);

    Ok(ctx)
}
