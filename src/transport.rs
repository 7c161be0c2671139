//! Datagram transports the relay and the leader run on.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TransportError;

/// Largest datagram any transport hands out.
pub const MAX_DATAGRAM_LEN: usize = 1500;

/// Unreliable, message oriented transport.
pub trait DatagramTransport {
    fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<(), TransportError>;

    /// Wait up to `timeout` for one datagram. `Ok(None)` on timeout.
    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, TransportError>;

    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

impl<T: DatagramTransport + ?Sized> DatagramTransport for Arc<T> {
    fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<(), TransportError> {
        (**self).send_to(data, to)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        (**self).recv_from(buf, timeout)
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        (**self).local_addr()
    }
}

/// A [`DatagramTransport`] over [`UdpSocket`].
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        let local = socket.local_addr()?;
        debug!("Bound UDP transport to {}", local);
        Ok(UdpTransport { socket })
    }
}

impl DatagramTransport for UdpTransport {
    fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<(), TransportError> {
        self.socket.send_to(data, to)?;
        Ok(())
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        // A zero read timeout means block forever.
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket.set_read_timeout(Some(timeout))?;

        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

type Mailbox = Sender<(Vec<u8>, SocketAddr)>;

/// Process-local datagram network. Endpoints bound on it exchange datagrams through
/// channels, and sends to unbound addresses vanish like they would on UDP.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<SocketAddr, Mailbox>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<MemoryTransport, TransportError> {
        let mut endpoints = self.endpoints.lock().map_err(|_| TransportError::Closed)?;
        if endpoints.contains_key(&addr) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, addr.to_string()).into());
        }
        let (tx, rx) = mpsc::channel();
        endpoints.insert(addr, tx);
        Ok(MemoryTransport {
            addr,
            network: self.clone(),
            rx: Mutex::new(rx),
        })
    }

    fn deliver(&self, data: &[u8], from: SocketAddr, to: SocketAddr) -> Result<(), TransportError> {
        let endpoints = self.endpoints.lock().map_err(|_| TransportError::Closed)?;
        match endpoints.get(&to) {
            Some(mailbox) => {
                if mailbox.send((data.to_vec(), from)).is_err() {
                    trace!("Endpoint {} is gone", to);
                }
            }
            None => trace!("No endpoint bound at {}", to),
        }
        Ok(())
    }

    fn unbind(&self, addr: SocketAddr) {
        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.remove(&addr);
        }
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    addr: SocketAddr,
    network: MemoryNetwork,
    rx: Mutex<Receiver<(Vec<u8>, SocketAddr)>>,
}

impl DatagramTransport for MemoryTransport {
    fn send_to(&self, data: &[u8], to: SocketAddr) -> Result<(), TransportError> {
        self.network.deliver(data, self.addr, to)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        let rx = self.rx.lock().map_err(|_| TransportError::Closed)?;
        match rx.recv_timeout(timeout) {
            Ok((data, from)) => {
                if data.len() > buf.len() {
                    debug!("Truncate {} byte datagram from {}", data.len(), from);
                }
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Some((n, from)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.addr)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unbind(self.addr);
    }
}
