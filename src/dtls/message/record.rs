use std::fmt;

use nom::bytes::complete::take;
use nom::number::complete::be_u16;
use nom::IResult;

use super::{ContentType, ProtocolVersion, Sequence};
use crate::buffer::Buf;
use crate::util::be_u48;

/// One record of a datagram, borrowing its fragment from the input.
#[derive(PartialEq, Eq)]
pub struct DtlsRecord<'a> {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub sequence: Sequence,
    pub fragment: &'a [u8],
}

impl<'a> DtlsRecord<'a> {
    /// content_type(1) + version(2) + epoch(2) + seq(6) + length(2)
    pub const HEADER_LEN: usize = 13;

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], DtlsRecord<'a>> {
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;
        let (input, epoch) = be_u16(input)?;
        let (input, sequence_number) = be_u48(input)?;
        let (input, length) = be_u16(input)?;
        let (rest, fragment) = take(length as usize)(input)?;

        Ok((
            rest,
            DtlsRecord {
                content_type,
                version,
                sequence: Sequence {
                    epoch,
                    sequence_number,
                },
                fragment,
            },
        ))
    }

    /// Write a record header announcing `length` fragment bytes.
    pub fn serialize_header(
        content_type: ContentType,
        version: ProtocolVersion,
        sequence: Sequence,
        length: u16,
        output: &mut Buf,
    ) {
        output.push(content_type.as_u8());
        version.serialize(output);
        output.extend_from_slice(&sequence.to_bytes());
        output.extend_from_slice(&length.to_be_bytes());
    }
}

impl<'a> fmt::Debug for DtlsRecord<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsRecord")
            .field("content_type", &self.content_type)
            .field("version", &self.version)
            .field("sequence", &self.sequence)
            .field("length", &self.fragment.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &[u8] = &[
        0x16, // ContentType::Handshake
        0xFE, 0xFD, // ProtocolVersion::DTLS1_2
        0x00, 0x01, // epoch
        0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // sequence_number
        0x00, 0x04, // length
        0x01, 0x02, 0x03, 0x04, // fragment
        0x17, // start of the next record
    ];

    #[test]
    fn parse_and_serialize_header() {
        let (rest, parsed) = DtlsRecord::parse(RECORD).unwrap();
        assert_eq!(rest, &[0x17]);
        assert_eq!(parsed.content_type, ContentType::Handshake);
        assert_eq!(parsed.sequence.epoch, 1);
        assert_eq!(parsed.sequence.sequence_number, 1);
        assert_eq!(parsed.fragment, &[1, 2, 3, 4]);

        let mut out = Buf::new();
        DtlsRecord::serialize_header(
            parsed.content_type,
            parsed.version,
            parsed.sequence,
            parsed.fragment.len() as u16,
            &mut out,
        );
        assert_eq!(&*out, &RECORD[..DtlsRecord::HEADER_LEN]);
    }

    #[test]
    fn length_past_end_is_incomplete() {
        assert!(DtlsRecord::parse(&RECORD[..15]).is_err());
        assert!(DtlsRecord::parse(&RECORD[..5]).is_err());
    }
}
