use std::fmt;
use std::ops::Deref;

use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u8;
use nom::{Err, IResult};

use crate::buffer::Buf;

macro_rules! var_array {
    ($name:ident, $max:expr) => {
        /// Length prefixed opaque value.
        #[derive(Clone, Copy)]
        pub struct $name([u8; $max], usize);

        impl $name {
            pub fn empty() -> Self {
                $name([0; $max], 0)
            }

            pub fn try_new(data: &[u8]) -> Option<Self> {
                if data.len() > $max {
                    return None;
                }
                let mut array = [0; $max];
                array[..data.len()].copy_from_slice(data);
                Some($name(array, data.len()))
            }

            pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
                let (input, len) = be_u8(input)?;
                if len as usize > $max {
                    return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
                }
                let (input, data) = take(len as usize)(input)?;
                let mut array = [0; $max];
                array[..data.len()].copy_from_slice(data);
                Ok((input, $name(array, data.len())))
            }

            pub fn serialize(&self, output: &mut Buf) {
                output.push(self.1 as u8);
                output.extend_from_slice(self);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:02x?})", stringify!($name), &self.0[..self.1])
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.deref() == other.deref()
            }
        }

        impl Eq for $name {}

        impl Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                &self.0[..self.1]
            }
        }
    };
}

var_array!(SessionId, 32);
var_array!(Cookie, 255);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_roundtrip() {
        let cookie = Cookie::try_new(&[1, 2, 3]).unwrap();
        let mut out = Buf::new();
        cookie.serialize(&mut out);
        assert_eq!(&*out, &[3, 1, 2, 3]);
        let (rest, parsed) = Cookie::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, cookie);
    }

    #[test]
    fn session_id_bounded() {
        assert!(SessionId::try_new(&[0; 33]).is_none());
        let mut wire = vec![33u8];
        wire.extend_from_slice(&[0; 33]);
        assert!(SessionId::parse(&wire).is_err());
        assert!(SessionId::empty().is_empty());
    }
}
