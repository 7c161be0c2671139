use nom::bytes::complete::take;
use nom::IResult;

use crate::buffer::Buf;

/// verify_data length for every TLS 1.2 suite without an explicit override.
pub const VERIFY_DATA_LEN: usize = 12;

#[derive(Debug, PartialEq, Eq)]
pub struct Finished<'a> {
    pub verify_data: &'a [u8],
}

impl<'a> Finished<'a> {
    pub fn new(verify_data: &'a [u8]) -> Self {
        Finished { verify_data }
    }

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Finished<'a>> {
        let (input, verify_data) = take(VERIFY_DATA_LEN)(input)?;
        Ok((input, Finished { verify_data }))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(self.verify_data);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let verify_data = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let finished = Finished::new(&verify_data);

        let mut serialized = Buf::new();
        finished.serialize(&mut serialized);

        let (rest, parsed) = Finished::parse(&serialized).unwrap();
        assert_eq!(parsed, finished);
        assert!(rest.is_empty());
        assert!(Finished::parse(&verify_data[..11]).is_err());
    }
}
