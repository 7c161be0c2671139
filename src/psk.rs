//! PSKc derivation.
//!
//! The commissioning credential is stretched from a human passphrase and the network
//! identity:
//!
//! ```text
//! salt         = "Thread" || xpanid || network name
//! intermediate = CMAC-AES128(key = 0^128, passphrase)
//! pskc         = PBKDF2(PRF = CMAC-AES128, intermediate, salt, 16384, 16)
//! ```

use std::fmt;

use aes::Aes128;
use cmac::{Cmac, Mac};
use zeroize::Zeroize;

use crate::util::hex;
use crate::Error;

/// Length of a derived PSKc.
pub const PSKC_LEN: usize = 16;

const PBKDF2_ITERATIONS: u32 = 16384;
const SALT_PREFIX: &[u8] = b"Thread";

/// A derived commissioning key. Wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct Pskc([u8; PSKC_LEN]);

impl Pskc {
    pub fn from_bytes(bytes: [u8; PSKC_LEN]) -> Self {
        Pskc(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PSKC_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, for provisioning tools.
    pub fn to_hex(&self) -> String {
        hex(&self.0)
    }
}

impl AsRef<[u8]> for Pskc {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for Pskc {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Pskc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pskc(..)")
    }
}

/// Derive the PSKc for a passphrase, network name and extended PAN ID given as hex.
pub fn derive_pskc(passphrase: &str, network_name: &str, ext_pan_id_hex: &str) -> Result<Pskc, Error> {
    let mut salt = Vec::with_capacity(SALT_PREFIX.len() + 8 + network_name.len());
    salt.extend_from_slice(SALT_PREFIX);
    salt.extend_from_slice(&decode_hex_lenient(ext_pan_id_hex));
    salt.extend_from_slice(network_name.as_bytes());

    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(&[0u8; 16])
        .map_err(|e| Error::Crypto(format!("cmac key: {}", e)))?;
    mac.update(passphrase.as_bytes());
    let mut intermediate = [0u8; 16];
    intermediate.copy_from_slice(&mac.finalize().into_bytes());

    let mut out = [0u8; PSKC_LEN];
    let res = pbkdf2::pbkdf2::<Cmac<Aes128>>(&intermediate, &salt, PBKDF2_ITERATIONS, &mut out)
        .map_err(|e| Error::Crypto(format!("pbkdf2: {}", e)));
    intermediate.zeroize();
    res?;

    trace!("Derived PSKc for network {:?}", network_name);
    Ok(Pskc(out))
}

/// Decode pairs of hex characters, high nibble first. Characters outside `[0-9a-fA-F]`
/// count as 0 and a trailing odd character is ignored.
pub fn decode_hex_lenient(hex: &str) -> Vec<u8> {
    fn nibble(c: u8) -> u8 {
        match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => 0,
        }
    }

    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| nibble(pair[0]) * 16 + nibble(pair[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_answer() {
        let pskc = derive_pskc("12SECRETPASSWORD34", "Test Network", "0001020304050607").unwrap();
        assert_eq!(pskc.to_hex(), "c3f59368445a1b6106be420a706d4cc9");
    }

    #[test]
    fn fixed_vector_test_network_1() {
        let a = derive_pskc("12SECRETPASSWORD34", "TestNetwork1", "0001020304050607").unwrap();
        assert_eq!(a.to_hex(), "c8e5cc27cd2ec9759d4c049e69e796e1");
        assert_eq!(a.as_bytes().len(), PSKC_LEN);

        let other = derive_pskc("12SECRETPASSWORD34", "TestNetwork2", "0001020304050607").unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn hex_decoding_is_lenient() {
        assert_eq!(decode_hex_lenient("0001fF"), vec![0x00, 0x01, 0xff]);
        assert_eq!(decode_hex_lenient("zz1g"), vec![0x00, 0x10]);
        assert_eq!(decode_hex_lenient("abc"), vec![0xab]);
        assert!(decode_hex_lenient("").is_empty());
    }

    #[test]
    fn invalid_hex_matches_zero_bytes() {
        let a = derive_pskc("pass", "net", "xx01").unwrap();
        let b = derive_pskc("pass", "net", "0001").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn debug_does_not_leak() {
        let pskc = Pskc::from_bytes([7; 16]);
        assert_eq!(format!("{:?}", pskc), "Pskc(..)");
    }
}
