//! CoAP wire format (RFC 7252 §3).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! |   Options (if any) ...
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! ```
//!
//! Decoding is total: every input yields a message or a [`ParseError`]. Encoding goes
//! through a [`BoundedWriter`] and never writes past the destination slice.

use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::sequence::tuple;
use nom::IResult;
use tinyvec::ArrayVec;

use super::message::*;
use crate::buffer::BoundedWriter;
use crate::error::{EncodeError, ParseError};

const EXT_BYTE: u8 = 13;
const EXT_WORD: u8 = 14;
const RESERVED: u8 = 15;
const EXT_BYTE_BASE: usize = 13;
const EXT_WORD_BASE: usize = 269;
const MAX_EXTENDED: usize = EXT_WORD_BASE + u16::MAX as usize;

fn fixed_header(input: &[u8]) -> IResult<&[u8], (u8, u8, u16)> {
    tuple((be_u8, be_u8, be_u16))(input)
}

fn byte(input: &[u8]) -> IResult<&[u8], u8> {
    be_u8(input)
}

fn word(input: &[u8]) -> IResult<&[u8], u16> {
    be_u16(input)
}

fn bytes(n: usize) -> impl Fn(&[u8]) -> IResult<&[u8], &[u8]> {
    move |input| take(n)(input)
}

/// Resolve an option delta or length nibble with its extended bytes.
fn extended(nibble: u8, input: &[u8]) -> Result<(&[u8], usize), ParseError> {
    match nibble {
        0..=12 => Ok((input, nibble as usize)),
        EXT_BYTE => {
            let (input, v) = byte(input)?;
            Ok((input, v as usize + EXT_BYTE_BASE))
        }
        EXT_WORD => {
            let (input, v) = word(input)?;
            Ok((input, v as usize + EXT_WORD_BASE))
        }
        _ => Err(ParseError::Malformed("reserved option nibble")),
    }
}

impl CoapMessage {
    /// Decode one datagram.
    pub fn decode(input: &[u8]) -> Result<CoapMessage, ParseError> {
        let (rest, (first, code, message_id)) = fixed_header(input)?;

        if first >> 6 != COAP_VERSION {
            return Err(ParseError::Malformed("version"));
        }
        let message_type = MessageType::from_bits(first >> 4);
        let token_len = (first & 0x0F) as usize;
        if token_len > MAX_TOKEN_LEN {
            return Err(ParseError::Malformed("token length"));
        }
        let code = Code(code);

        let (mut rest, token_bytes) = bytes(token_len)(rest)?;
        let mut token = Token::default();
        token.extend_from_slice(token_bytes);

        if code == Code::EMPTY && (token_len != 0 || !rest.is_empty()) {
            return Err(ParseError::Malformed("empty message with content"));
        }

        let mut options = Vec::new();
        let mut payload = Vec::new();
        let mut number = 0usize;

        while let Some((&b, tail)) = rest.split_first() {
            if b == PAYLOAD_MARKER {
                if tail.is_empty() {
                    return Err(ParseError::Malformed("payload marker without payload"));
                }
                payload = tail.to_vec();
                break;
            }
            if b >> 4 == RESERVED || b & 0x0F == RESERVED {
                return Err(ParseError::Malformed("reserved option nibble"));
            }

            let (tail, delta) = extended(b >> 4, tail)?;
            let (tail, len) = extended(b & 0x0F, tail)?;
            let (tail, value) = bytes(len)(tail)?;

            number += delta;
            if number > u16::MAX as usize {
                return Err(ParseError::Malformed("option number overflow"));
            }
            options.push(CoapOption {
                number: OptionNumber(number as u16),
                value: value.to_vec(),
            });
            rest = tail;
        }

        Ok(CoapMessage {
            message_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }

    /// Encode into `buf`, returning the number of bytes written.
    ///
    /// Fails with [`EncodeError::BufferFull`] when the header and options exceed
    /// [`MAX_HEADER_LEN`] or the whole message does not fit `buf`. Bytes past the
    /// returned length are left untouched.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let mut header = [0u8; MAX_HEADER_LEN];
        let header_len = self.encode_header(&mut header)?;

        let mut w = BoundedWriter::new(buf);
        w.put_slice(&header[..header_len])?;
        if !self.payload.is_empty() {
            w.put_u8(PAYLOAD_MARKER)?;
            w.put_slice(&self.payload)?;
        }
        Ok(w.position())
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = vec![0u8; MAX_HEADER_LEN + 1 + self.payload.len()];
        let n = self.encode_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn encode_header(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(EncodeError::InvalidField("token length"));
        }

        let mut w = BoundedWriter::new(buf);
        w.put_u8(
            COAP_VERSION << 6 | self.message_type.as_bits() << 4 | self.token.len() as u8,
        )?;
        w.put_u8(self.code.0)?;
        w.put_u16(self.message_id)?;
        w.put_slice(&self.token)?;

        let mut sorted: Vec<&CoapOption> = self.options.iter().collect();
        sorted.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for option in sorted {
            let (delta_nibble, delta_ext) = split_extended((option.number.0 - previous) as usize)?;
            let (len_nibble, len_ext) = split_extended(option.value.len())?;
            w.put_u8(delta_nibble << 4 | len_nibble)?;
            w.put_slice(&delta_ext)?;
            w.put_slice(&len_ext)?;
            w.put_slice(&option.value)?;
            previous = option.number.0;
        }

        Ok(w.position())
    }
}

fn split_extended(v: usize) -> Result<(u8, ArrayVec<[u8; 2]>), EncodeError> {
    let mut ext = ArrayVec::default();
    let nibble = if v < EXT_BYTE_BASE {
        v as u8
    } else if v < EXT_WORD_BASE {
        ext.push((v - EXT_BYTE_BASE) as u8);
        EXT_BYTE
    } else if v <= MAX_EXTENDED {
        ext.extend_from_slice(&((v - EXT_WORD_BASE) as u16).to_be_bytes());
        EXT_WORD
    } else {
        return Err(EncodeError::InvalidField("option too long"));
    };
    Ok((nibble, ext))
}
