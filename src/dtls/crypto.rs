//! Key schedule and record protection for TLS_PSK_WITH_AES_128_GCM_SHA256.

use std::fmt;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce as GcmNonce};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::message::{ContentType, Cookie, ProtocolVersion, Random, Sequence, VERIFY_DATA_LEN};
use crate::buffer::Buf;
use crate::rng::SeededRng;
use crate::Error;

type HmacSha256 = Hmac<Sha256>;

/// Explicit nonce transmitted in front of every protected record.
pub const EXPLICIT_NONCE_LEN: usize = 8;
pub const GCM_TAG_LEN: usize = 16;
/// Bytes a protected record adds to its plaintext.
pub const AEAD_OVERHEAD: usize = EXPLICIT_NONCE_LEN + GCM_TAG_LEN;

const MASTER_SECRET_LEN: usize = 48;
const KEY_LEN: usize = 16;
const FIXED_IV_LEN: usize = 4;
const KEY_BLOCK_LEN: usize = 2 * KEY_LEN + 2 * FIXED_IV_LEN;

pub const COOKIE_LEN: usize = 32;

/// PRF for TLS 1.2 (RFC 5246 §5) with HMAC-SHA256.
///
/// `seed` is the seed without the label.
pub fn prf_tls12(secret: &[u8], label: &str, seed: &[u8], out: &mut [u8]) -> Result<(), Error> {
    let mut full_seed = Vec::with_capacity(label.len() + seed.len());
    full_seed.extend_from_slice(label.as_bytes());
    full_seed.extend_from_slice(seed);

    let key = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| Error::Crypto(format!("prf key: {}", e)))?;

    // A(1) = HMAC(secret, A(0)) where A(0) = seed
    let mut a = {
        let mut mac = key.clone();
        mac.update(&full_seed);
        mac.finalize().into_bytes()
    };

    let mut offset = 0;
    while offset < out.len() {
        let mut mac = key.clone();
        mac.update(&a);
        mac.update(&full_seed);
        let block = mac.finalize().into_bytes();

        let n = (out.len() - offset).min(block.len());
        out[offset..offset + n].copy_from_slice(&block[..n]);
        offset += n;

        let mut mac = key.clone();
        mac.update(&a);
        a = mac.finalize().into_bytes();
    }

    Ok(())
}

/// RFC 4279 premaster secret: `uint16 N || N zero bytes || uint16 N || psk`.
pub fn psk_premaster_secret(psk: &[u8]) -> Zeroizing<Vec<u8>> {
    let n = (psk.len() as u16).to_be_bytes();
    let mut out = Zeroizing::new(Vec::with_capacity(4 + 2 * psk.len()));
    out.extend_from_slice(&n);
    out.extend(std::iter::repeat(0u8).take(psk.len()));
    out.extend_from_slice(&n);
    out.extend_from_slice(psk);
    out
}

/// Fixed IV portion for DTLS AEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Iv([u8; FIXED_IV_LEN]);

/// Full AEAD nonce: fixed IV followed by the explicit nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Nonce([u8; 12]);

impl Nonce {
    fn new(iv: Iv, explicit_nonce: &[u8; EXPLICIT_NONCE_LEN]) -> Self {
        let mut nonce = [0u8; 12];
        nonce[..FIXED_IV_LEN].copy_from_slice(&iv.0);
        nonce[FIXED_IV_LEN..].copy_from_slice(explicit_nonce);
        Nonce(nonce)
    }
}

/// `epoch || seq48 || type || version || plaintext length`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Aad([u8; 13]);

impl Aad {
    fn new(content_type: ContentType, sequence: Sequence, length: u16) -> Self {
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&sequence.to_bytes());
        aad[8] = content_type.as_u8();
        aad[9..11].copy_from_slice(&ProtocolVersion::DTLS1_2.as_u16().to_be_bytes());
        aad[11..].copy_from_slice(&length.to_be_bytes());
        Aad(aad)
    }
}

struct DirectionKeys {
    cipher: Aes128Gcm,
    iv: Iv,
}

impl DirectionKeys {
    fn new(key: &[u8], iv: &[u8]) -> Result<Self, Error> {
        let cipher = Aes128Gcm::new_from_slice(key)
            .map_err(|_| Error::Crypto("invalid AES-128 key length".into()))?;
        let mut fixed = [0u8; FIXED_IV_LEN];
        fixed.copy_from_slice(iv);
        Ok(DirectionKeys {
            cipher,
            iv: Iv(fixed),
        })
    }
}

/// Session secrets derived once both randoms are known.
pub struct CryptoContext {
    master_secret: Zeroizing<[u8; MASTER_SECRET_LEN]>,
    local: DirectionKeys,
    peer: DirectionKeys,
}

impl CryptoContext {
    pub fn new(
        psk: &[u8],
        client_random: &Random,
        server_random: &Random,
        is_client: bool,
    ) -> Result<Self, Error> {
        let client_random = client_random.to_bytes();
        let server_random = server_random.to_bytes();

        let premaster = psk_premaster_secret(psk);
        let mut master_secret = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
        let mut seed = [0u8; 64];
        seed[..32].copy_from_slice(&client_random);
        seed[32..].copy_from_slice(&server_random);
        prf_tls12(&premaster, "master secret", &seed, &mut master_secret[..])?;

        let mut key_block = Zeroizing::new([0u8; KEY_BLOCK_LEN]);
        seed[..32].copy_from_slice(&server_random);
        seed[32..].copy_from_slice(&client_random);
        prf_tls12(&master_secret[..], "key expansion", &seed, &mut key_block[..])?;

        let (client_key, rest) = key_block.split_at(KEY_LEN);
        let (server_key, rest) = rest.split_at(KEY_LEN);
        let (client_iv, server_iv) = rest.split_at(FIXED_IV_LEN);

        let client = DirectionKeys::new(client_key, client_iv)?;
        let server = DirectionKeys::new(server_key, server_iv)?;
        let (local, peer) = if is_client {
            (client, server)
        } else {
            (server, client)
        };

        Ok(CryptoContext {
            master_secret,
            local,
            peer,
        })
    }

    /// Append `explicit_nonce || ciphertext || tag` for one record to `out`.
    pub fn encrypt(
        &self,
        content_type: ContentType,
        sequence: Sequence,
        plaintext: &[u8],
        out: &mut Buf,
    ) -> Result<(), Error> {
        let explicit = sequence.to_bytes();
        let nonce = Nonce::new(self.local.iv, &explicit);
        let aad = Aad::new(content_type, sequence, plaintext.len() as u16);

        let mut buf = Buf::from_slice(plaintext);
        self.local
            .cipher
            .encrypt_in_place(GcmNonce::from_slice(&nonce.0), &aad.0, &mut buf)
            .map_err(|_| Error::Crypto("record encryption failed".into()))?;

        out.extend_from_slice(&explicit);
        out.extend_from_slice(&buf);
        Ok(())
    }

    /// Authenticate and decrypt one record fragment.
    pub fn decrypt(
        &self,
        content_type: ContentType,
        sequence: Sequence,
        fragment: &[u8],
    ) -> Result<Buf, Error> {
        if fragment.len() < AEAD_OVERHEAD {
            return Err(Error::Crypto("record shorter than AEAD overhead".into()));
        }
        let (explicit, ciphertext) = fragment.split_at(EXPLICIT_NONCE_LEN);
        let mut explicit_nonce = [0u8; EXPLICIT_NONCE_LEN];
        explicit_nonce.copy_from_slice(explicit);

        let nonce = Nonce::new(self.peer.iv, &explicit_nonce);
        let plaintext_len = ciphertext.len() - GCM_TAG_LEN;
        let aad = Aad::new(content_type, sequence, plaintext_len as u16);

        let mut buf = Buf::from_slice(ciphertext);
        self.peer
            .cipher
            .decrypt_in_place(GcmNonce::from_slice(&nonce.0), &aad.0, &mut buf)
            .map_err(|_| Error::Crypto("record authentication failed".into()))?;
        Ok(buf)
    }

    /// `PRF(master_secret, label, SHA256(transcript))[..12]`
    pub fn verify_data(&self, label: &str, transcript: &[u8]) -> Result<[u8; VERIFY_DATA_LEN], Error> {
        let hash = Sha256::digest(transcript);
        let mut out = [0u8; VERIFY_DATA_LEN];
        prf_tls12(&self.master_secret[..], label, &hash, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext").finish_non_exhaustive()
    }
}

/// Stateless HelloVerifyRequest cookies bound to the peer transport id and client random.
#[derive(Clone)]
pub struct CookieSecret(Zeroizing<[u8; 32]>);

impl CookieSecret {
    pub fn new(rng: &mut SeededRng) -> Self {
        let mut secret = Zeroizing::new([0u8; 32]);
        rng.fill(&mut secret[..]);
        CookieSecret(secret)
    }

    fn mac(&self, peer: &[u8], client_random: &Random) -> Result<HmacSha256, Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0[..])
            .map_err(|e| Error::Crypto(format!("cookie key: {}", e)))?;
        mac.update(&[peer.len() as u8]);
        mac.update(peer);
        mac.update(&client_random.to_bytes());
        Ok(mac)
    }

    pub fn compute(&self, peer: &[u8], client_random: &Random) -> Result<Cookie, Error> {
        let tag = self.mac(peer, client_random)?.finalize().into_bytes();
        Cookie::try_new(&tag[..COOKIE_LEN]).ok_or_else(|| Error::Crypto("cookie length".into()))
    }

    pub fn verify(&self, peer: &[u8], client_random: &Random, cookie: &[u8]) -> bool {
        if cookie.len() != COOKIE_LEN {
            return false;
        }
        match self.mac(peer, client_random) {
            Ok(mac) => mac.verify_slice(cookie).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn prf_sha256_vector() {
        let secret = unhex("9bbe436ba940f017b17652849a71db35");
        let seed = unhex("a0ba9f936cda311827a6f796ffd5198c");
        let mut out = [0u8; 32];
        prf_tls12(&secret, "test label", &seed, &mut out).unwrap();
        assert_eq!(
            out.to_vec(),
            unhex("e3f229ba727be17b8d122620557cd453c2aab21d07c3d495329b52d4e61edb5a")
        );
    }

    #[test]
    fn premaster_layout() {
        let pms = psk_premaster_secret(&[0xAA, 0xBB]);
        assert_eq!(&pms[..], &[0, 2, 0, 0, 0, 2, 0xAA, 0xBB]);
    }

    fn contexts() -> (CryptoContext, CryptoContext) {
        let mut rng = SeededRng::new(Some(9));
        let cr = Random::new(&mut rng);
        let sr = Random::new(&mut rng);
        let psk = [7u8; 16];
        (
            CryptoContext::new(&psk, &cr, &sr, true).unwrap(),
            CryptoContext::new(&psk, &cr, &sr, false).unwrap(),
        )
    }

    #[test]
    fn client_to_server_record() {
        let (client, server) = contexts();
        let seq = Sequence {
            epoch: 1,
            sequence_number: 5,
        };
        let mut out = Buf::new();
        client
            .encrypt(ContentType::ApplicationData, seq, b"hello", &mut out)
            .unwrap();
        assert_eq!(out.len(), 5 + AEAD_OVERHEAD);

        let plain = server
            .decrypt(ContentType::ApplicationData, seq, &out)
            .unwrap();
        assert_eq!(&*plain, b"hello");

        // Wrong direction, wrong sequence and tampering all fail.
        assert!(client.decrypt(ContentType::ApplicationData, seq, &out).is_err());
        let other = Sequence {
            epoch: 1,
            sequence_number: 6,
        };
        assert!(server.decrypt(ContentType::ApplicationData, other, &out).is_err());
        let mut tampered = out.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(server
            .decrypt(ContentType::ApplicationData, seq, &tampered)
            .is_err());
        assert!(server.decrypt(ContentType::ApplicationData, seq, &out[..10]).is_err());
    }

    #[test]
    fn verify_data_matches_on_both_sides() {
        let (client, server) = contexts();
        let a = client.verify_data("client finished", b"transcript").unwrap();
        let b = server.verify_data("client finished", b"transcript").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, server.verify_data("server finished", b"transcript").unwrap());
    }

    #[test]
    fn cookie_bound_to_peer() {
        let mut rng = SeededRng::new(Some(4));
        let secret = CookieSecret::new(&mut rng);
        let random = Random::new(&mut rng);
        let cookie = secret.compute(b"10.0.0.1:5684", &random).unwrap();
        assert!(secret.verify(b"10.0.0.1:5684", &random, &cookie));
        assert!(!secret.verify(b"10.0.0.2:5684", &random, &cookie));
        assert!(!secret.verify(b"10.0.0.1:5684", &random, &cookie[..31]));
    }
}
