use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::multi::many0;
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use super::{CipherSuite, Cookie, ProtocolVersion, Random, SessionId, COMPRESSION_NULL};
use crate::buffer::Buf;

/// TLS_EMPTY_RENEGOTIATION_INFO_SCSV (RFC 5746)
const RENEGOTIATION_INFO_SCSV: u16 = 0x00FF;

/// renegotiation_info extension type.
const EXT_RENEGOTIATION_INFO: u16 = 0xFF01;

/// An empty renegotiation_info, all a server that never renegotiates has to say.
const EMPTY_RENEGOTIATION_INFO: [u8; 5] = [0xFF, 0x01, 0x00, 0x01, 0x00];

/// Whether an extensions block carries renegotiation_info.
fn has_renegotiation_info(mut extensions: &[u8]) -> bool {
    while extensions.len() >= 4 {
        let ext_type = u16::from_be_bytes([extensions[0], extensions[1]]);
        let len = u16::from_be_bytes([extensions[2], extensions[3]]) as usize;
        if ext_type == EXT_RENEGOTIATION_INFO {
            return true;
        }
        let Some(rest) = extensions.get(4 + len..) else {
            return false;
        };
        extensions = rest;
    }
    false
}

#[derive(Debug, PartialEq, Eq)]
pub struct ClientHello {
    pub client_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cookie: Cookie,
    pub cipher_suites: Vec<CipherSuite>,
    pub compression_methods: Vec<u8>,
    /// The client signalled RFC 5746 support, by SCSV or extension.
    pub secure_renegotiation: bool,
}

impl ClientHello {
    pub fn new(random: Random, cookie: Cookie) -> Self {
        ClientHello {
            client_version: ProtocolVersion::DTLS1_2,
            random,
            session_id: SessionId::empty(),
            cookie,
            cipher_suites: vec![CipherSuite::PskAes128GcmSha256],
            compression_methods: vec![COMPRESSION_NULL],
            secure_renegotiation: false,
        }
    }

    /// Of the extensions only renegotiation_info is looked for, the rest are skipped.
    pub fn parse(input: &[u8]) -> IResult<&[u8], ClientHello> {
        let (input, client_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;

        let (input, suites_len) = be_u16(input)?;
        if suites_len % 2 != 0 {
            return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }
        let (input, suites) = take(suites_len as usize)(input)?;
        let (_, cipher_suites) = many0(CipherSuite::parse)(suites)?;

        let (input, comp_len) = be_u8(input)?;
        let (input, comp) = take(comp_len as usize)(input)?;

        let (input, extensions) = if input.len() >= 2 {
            let (input, ext_len) = be_u16(input)?;
            take(ext_len as usize)(input)?
        } else {
            (input, &[][..])
        };

        let secure_renegotiation = has_renegotiation_info(extensions)
            || cipher_suites
                .iter()
                .any(|s| s.as_u16() == RENEGOTIATION_INFO_SCSV);

        Ok((
            input,
            ClientHello {
                client_version,
                random,
                session_id,
                cookie,
                cipher_suites,
                compression_methods: comp.to_vec(),
                secure_renegotiation,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.client_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        self.cookie.serialize(output);
        output.extend_from_slice(&((self.cipher_suites.len() * 2) as u16).to_be_bytes());
        for suite in &self.cipher_suites {
            output.extend_from_slice(&suite.as_u16().to_be_bytes());
        }
        output.push(self.compression_methods.len() as u8);
        output.extend_from_slice(&self.compression_methods);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub server_version: ProtocolVersion,
    pub cookie: Cookie,
}

impl HelloVerifyRequest {
    pub fn parse(input: &[u8]) -> IResult<&[u8], HelloVerifyRequest> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;
        Ok((
            input,
            HelloVerifyRequest {
                server_version,
                cookie,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.cookie.serialize(output);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ServerHello {
    pub server_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cipher_suite: CipherSuite,
    pub compression_method: u8,
    /// Answer the client's RFC 5746 signal with an empty renegotiation_info.
    pub secure_renegotiation: bool,
}

impl ServerHello {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ServerHello> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cipher_suite) = CipherSuite::parse(input)?;
        let (input, compression_method) = be_u8(input)?;

        let (input, extensions) = if input.len() >= 2 {
            let (input, ext_len) = be_u16(input)?;
            take(ext_len as usize)(input)?
        } else {
            (input, &[][..])
        };

        Ok((
            input,
            ServerHello {
                server_version,
                random,
                session_id,
                cipher_suite,
                compression_method,
                secure_renegotiation: has_renegotiation_info(extensions),
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        output.extend_from_slice(&self.cipher_suite.as_u16().to_be_bytes());
        output.push(self.compression_method);
        if self.secure_renegotiation {
            output.extend_from_slice(&(EMPTY_RENEGOTIATION_INFO.len() as u16).to_be_bytes());
            output.extend_from_slice(&EMPTY_RENEGOTIATION_INFO);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::SeededRng;

    #[test]
    fn client_hello_roundtrip() {
        let mut rng = SeededRng::new(Some(1));
        let hello = ClientHello::new(Random::new(&mut rng), Cookie::try_new(&[9; 32]).unwrap());
        let mut out = Buf::new();
        hello.serialize(&mut out);

        let (rest, parsed) = ClientHello::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, hello);
    }

    #[test]
    fn client_hello_skips_extensions() {
        let mut rng = SeededRng::new(Some(1));
        let hello = ClientHello::new(Random::new(&mut rng), Cookie::empty());
        let mut out = Buf::new();
        hello.serialize(&mut out);
        // renegotiation_info
        out.extend_from_slice(&[0x00, 0x05, 0xFF, 0x01, 0x00, 0x01, 0x00]);

        let (rest, parsed) = ClientHello::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.cipher_suites, vec![CipherSuite::PskAes128GcmSha256]);
        assert!(parsed.secure_renegotiation);
    }

    #[test]
    fn renegotiation_scsv_is_noticed() {
        let mut rng = SeededRng::new(Some(1));
        let mut hello = ClientHello::new(Random::new(&mut rng), Cookie::empty());
        let mut out = Buf::new();
        hello.serialize(&mut out);
        assert!(!ClientHello::parse(&out).unwrap().1.secure_renegotiation);

        hello.cipher_suites.push(CipherSuite::from_u16(0x00FF));
        let mut out = Buf::new();
        hello.serialize(&mut out);
        // extended_master_secret, then nothing else of interest
        out.extend_from_slice(&[0x00, 0x04, 0x00, 0x17, 0x00, 0x00]);
        let (rest, parsed) = ClientHello::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert!(parsed.secure_renegotiation);
    }

    #[test]
    fn odd_suite_length_rejected() {
        let mut rng = SeededRng::new(Some(1));
        let hello = ClientHello::new(Random::new(&mut rng), Cookie::empty());
        let mut out = Buf::new();
        hello.serialize(&mut out);
        // version(2) + random(32) + session id(1) + cookie(1) puts suites length at 36
        out[37] = 3;
        assert!(ClientHello::parse(&out).is_err());
    }

    #[test]
    fn server_hello_and_verify_request_roundtrip() {
        let mut rng = SeededRng::new(Some(2));
        let hello = ServerHello {
            server_version: ProtocolVersion::DTLS1_2,
            random: Random::new(&mut rng),
            session_id: SessionId::empty(),
            cipher_suite: CipherSuite::PskAes128GcmSha256,
            compression_method: COMPRESSION_NULL,
            secure_renegotiation: false,
        };
        let mut out = Buf::new();
        hello.serialize(&mut out);
        assert_eq!(ServerHello::parse(&out).unwrap().1, hello);

        let answering = ServerHello {
            secure_renegotiation: true,
            ..hello
        };
        let mut out = Buf::new();
        answering.serialize(&mut out);
        assert_eq!(&out[out.len() - 7..], &[0x00, 0x05, 0xFF, 0x01, 0x00, 0x01, 0x00]);
        assert_eq!(ServerHello::parse(&out).unwrap().1, answering);

        let hvr = HelloVerifyRequest {
            server_version: ProtocolVersion::DTLS1_0,
            cookie: Cookie::try_new(b"cookie").unwrap(),
        };
        let mut out = Buf::new();
        hvr.serialize(&mut out);
        assert_eq!(HelloVerifyRequest::parse(&out).unwrap().1, hvr);
    }
}
