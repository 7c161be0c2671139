//! Thread MeshCoP commissioning relay.
//!
//! A border router terminates an external commissioner's DTLS session (PSK derived from
//! the network passphrase), decodes the CoAP requests inside it and relays them to the
//! Thread leader under the leader-facing URI paths. Leader replies travel back through
//! the same session.
//!
//! The protocol parts are sans-IO: [`DtlsSession`] and [`BorderRouter`] are fed
//! datagrams and timeouts by the caller and write output through [`SessionIo`] or a
//! [`DatagramTransport`]. [`relay::spawn`] and [`leader::spawn`] wrap them in threads.
//!
//! ```no_run
//! use meshcop_relay::{relay, BorderRouter, RelayConfig, UdpTransport};
//!
//! # fn main() -> Result<(), meshcop_relay::Error> {
//! let config = RelayConfig::builder()
//!     .passphrase("12SECRETPASSWORD34")
//!     .network_name("Test Network")
//!     .ext_pan_id("0001020304050607")
//!     .build()?;
//!
//! let commissioner = UdpTransport::bind(config.listen_addr())?;
//! let leader = UdpTransport::bind("127.0.0.1:0")?;
//! let router = BorderRouter::new(config, commissioner, leader)?;
//!
//! let handle = relay::spawn(router)?;
//! // ...
//! let stats = handle.shutdown()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]
// #![deny(missing_docs)]

#[macro_use]
extern crate log;

mod buffer;
mod rng;
mod timer;
mod util;
mod window;

pub mod coap;
pub mod commissioner;
pub mod config;
pub mod dtls;
mod error;
pub mod leader;
pub mod psk;
pub mod relay;
pub mod tlv;
pub mod transport;

pub use commissioner::{Commissioner, CommissionerEvent};
pub use config::{Config, ConfigBuilder, RelayConfig, RelayConfigBuilder};
pub use dtls::{DtlsSession, Role, SessionIo, SessionState};
pub use error::{ConfigError, EncodeError, Error, ParseError, TransportError};
pub use leader::Leader;
pub use psk::{derive_pskc, Pskc};
pub use relay::{BorderRouter, RelayHandle, RelayStats};
pub use tlv::{Dataset, State, Tlv, TlvType};
pub use transport::{DatagramTransport, MemoryNetwork, MemoryTransport, UdpTransport};
