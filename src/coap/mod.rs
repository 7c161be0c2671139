//! CoAP message codec and resource dispatch.

mod codec;
mod dispatcher;
mod message;

pub use dispatcher::{Dispatch, Dispatcher, Request, Resource};
pub use message::{
    CoapMessage, CoapOption, Code, MessageType, OptionNumber, Token, COAP_VERSION,
    CONTENT_FORMAT_OCTET_STREAM, MAX_HEADER_LEN, MAX_TOKEN_LEN, MAX_URI_PATH_LEN, PAYLOAD_MARKER,
};
