use std::io;

use thiserror::Error;

/// Errors surfaced by the relay, the DTLS session and the CoAP layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input on a network boundary.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Encoding would not fit the destination buffer.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// DTLS handshake or record protection failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The underlying datagram transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid session or relay configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The record layer can not take more data right now.
    #[error("would block")]
    WouldBlock,

    /// Application data was offered before the handshake completed.
    #[error("session is not connected")]
    NotConnected,

    /// A handshake deadline passed.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// A CoAP resource with the same name is already registered.
    #[error("resource already registered: {0}")]
    AlreadyRegistered(String),
}

/// Malformed bytes. Always recoverable, the datagram is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The input ended before the structure was complete.
    #[error("truncated input")]
    Truncated,

    /// The input violates the wire format.
    #[error("malformed: {0}")]
    Malformed(&'static str),

    /// The reconstructed URI path exceeds its bound.
    #[error("uri path too long")]
    UriTooLong,
}

/// Encoding into a bounded buffer failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// The destination buffer is too small.
    #[error("buffer full: need {needed}, capacity {capacity}")]
    BufferFull { needed: usize, capacity: usize },

    /// A field value can not be represented on the wire.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
}

/// Failure sending to or receiving from a datagram socket.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}

/// Problems with how a session or relay was set up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("psk too long: {0} > 16")]
    PskTooLong(usize),

    #[error("no psk set")]
    MissingPsk,

    #[error("peer transport id too long: {0} > 32")]
    PeerTransportIdTooLong(usize),

    #[error("peer transport id required before the handshake")]
    MissingPeerTransportId,

    #[error("session already started")]
    AlreadyStarted,

    #[error("session not started")]
    NotStarted,

    #[error("invalid value: {0}")]
    Invalid(&'static str),
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        Error::Parse(value.into())
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for ParseError {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => ParseError::Truncated,
            nom::Err::Error(e) | nom::Err::Failure(e) => match e.code {
                nom::error::ErrorKind::Eof => ParseError::Truncated,
                _ => ParseError::Malformed("nom"),
            },
        }
    }
}

impl Error {
    /// Whether this error is absorbed by dropping the offending datagram.
    pub fn is_drop(&self) -> bool {
        matches!(self, Error::Parse(_))
    }
}
