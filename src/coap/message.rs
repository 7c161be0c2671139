use std::fmt;

use tinyvec::ArrayVec;

use crate::error::{EncodeError, ParseError};

/// The only CoAP version on the wire.
pub const COAP_VERSION: u8 = 1;

pub const MAX_TOKEN_LEN: usize = 8;

/// Upper bound for the fixed header, token and options of an encoded message.
pub const MAX_HEADER_LEN: usize = 128;

/// Upper bound for a reconstructed URI path, separators included.
pub const MAX_URI_PATH_LEN: usize = 32;

pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Content-Format value for `application/octet-stream`.
pub const CONTENT_FORMAT_OCTET_STREAM: u16 = 42;

pub type Token = ArrayVec<[u8; MAX_TOKEN_LEN]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn as_bits(&self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

/// Request method or response status, `class.detail` packed in one byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);
    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);
    pub const CREATED: Code = Code(0x41);
    pub const CHANGED: Code = Code(0x44);
    pub const CONTENT: Code = Code(0x45);
    pub const BAD_REQUEST: Code = Code(0x80);
    pub const NOT_FOUND: Code = Code(0x84);
    pub const INTERNAL_SERVER_ERROR: Code = Code(0xA0);

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_request(&self) -> bool {
        self.class() == 0 && self.0 != 0
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    pub const IF_MATCH: OptionNumber = OptionNumber(1);
    pub const URI_HOST: OptionNumber = OptionNumber(3);
    pub const URI_PORT: OptionNumber = OptionNumber(7);
    pub const URI_PATH: OptionNumber = OptionNumber(11);
    pub const CONTENT_FORMAT: OptionNumber = OptionNumber(12);
    pub const URI_QUERY: OptionNumber = OptionNumber(15);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: OptionNumber,
    pub value: Vec<u8>,
}

/// One CoAP message. Options are kept in ascending number order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub message_type: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Token,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl CoapMessage {
    pub fn new(message_type: MessageType, code: Code, message_id: u16) -> Self {
        CoapMessage {
            message_type,
            code,
            message_id,
            token: Token::default(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Piggy-backed response echoing the message id and token of `request`.
    pub fn response_to(request: &CoapMessage, code: Code) -> Self {
        let message_type = match request.message_type {
            MessageType::Confirmable => MessageType::Acknowledgement,
            _ => MessageType::NonConfirmable,
        };
        let mut response = CoapMessage::new(message_type, code, request.message_id);
        response.token = request.token.clone();
        response
    }

    pub fn set_token(&mut self, token: &[u8]) -> Result<(), EncodeError> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(EncodeError::InvalidField("token longer than 8 bytes"));
        }
        self.token = Token::default();
        self.token.extend_from_slice(token);
        Ok(())
    }

    /// Insert an option after any existing options with the same or lower number.
    pub fn add_option(&mut self, number: OptionNumber, value: &[u8]) {
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(
            at,
            CoapOption {
                number,
                value: value.to_vec(),
            },
        );
    }

    pub fn remove_options(&mut self, number: OptionNumber) {
        self.options.retain(|o| o.number != number);
    }

    /// First value of an option.
    pub fn option(&self, number: OptionNumber) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    /// Replace the URI path with the `/` separated segments of `path`.
    pub fn set_uri_path(&mut self, path: &str) {
        self.remove_options(OptionNumber::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(OptionNumber::URI_PATH, segment.as_bytes());
        }
    }

    /// The URI path segments joined with `/`, in the order received.
    pub fn uri_path(&self) -> Result<String, ParseError> {
        let mut path = String::new();
        for option in self
            .options
            .iter()
            .filter(|o| o.number == OptionNumber::URI_PATH)
        {
            let segment =
                std::str::from_utf8(&option.value).map_err(|_| ParseError::Malformed("uri utf-8"))?;
            let sep = usize::from(!path.is_empty());
            if path.len() + sep + segment.len() > MAX_URI_PATH_LEN {
                return Err(ParseError::UriTooLong);
            }
            if sep == 1 {
                path.push('/');
            }
            path.push_str(segment);
        }
        Ok(path)
    }

    pub fn content_format(&self) -> Option<u16> {
        let value = self.option(OptionNumber::CONTENT_FORMAT)?;
        if value.len() > 2 {
            return None;
        }
        Some(value.iter().fold(0u16, |acc, b| (acc << 8) | *b as u16))
    }

    /// Set Content-Format using the minimal uint encoding.
    pub fn set_content_format(&mut self, format: u16) {
        self.remove_options(OptionNumber::CONTENT_FORMAT);
        let bytes = format.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.add_option(OptionNumber::CONTENT_FORMAT, &bytes[skip..]);
    }
}
