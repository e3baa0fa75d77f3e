//! cjdns node keys.
//!
//! A node is identified by a Curve25519 key pair. The public key is written
//! in cjdns base32 with a `.k` suffix, and the node's IPv6 address is the
//! first 16 bytes of `SHA-512(SHA-512(public_key))`. Only addresses inside
//! `fc00::/8` are usable, so a key whose address falls outside is invalid.

use std::fmt;
use std::net::Ipv6Addr;

use sha2::{Digest, Sha512};
use thiserror::Error;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};

/// Length of raw private and public keys.
pub const KEY_LEN: usize = 32;

const BASE32_ALPHABET: &[u8; 32] = b"0123456789bcdfghjklmnpqrstuvwxyz";

#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    #[error("private key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
    #[error("private key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Node private key.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::Length(bytes.len()))?;
        Ok(Self(raw))
    }

    /// Parse the 64-character hex form used on the command line and in
    /// process environments.
    pub fn from_hex(text: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(text.trim())?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(*DalekPublic::from(&secret).as_bytes())
    }

    /// Whether the derived address is a usable cjdns address.
    pub fn is_valid(&self) -> bool {
        self.public_key().address().octets()[0] == 0xfc
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Node public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn address(&self) -> Ipv6Addr {
        let first = Sha512::digest(self.0);
        let second = Sha512::digest(first);
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&second[..16]);
        Ipv6Addr::from(octets)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.k", base32_encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

/// cjdns base32: least significant bits first, no padding.
fn base32_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len() * 8 / 5 + 1);
    let mut work: u32 = 0;
    let mut bits = 0;
    for &byte in input {
        work |= u32::from(byte) << bits;
        bits += 8;
        while bits >= 5 {
            out.push(BASE32_ALPHABET[(work & 31) as usize] as char);
            work >>= 5;
            bits -= 5;
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[(work & 31) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let text = "a".repeat(64);
        let key = PrivateKey::from_hex(&text).unwrap();
        assert_eq!(key.to_hex(), text);
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert_eq!(PrivateKey::from_bytes(&[0u8; 31]), Err(KeyError::Length(31)));
        assert!(matches!(
            PrivateKey::from_hex("abcd"),
            Err(KeyError::Length(2))
        ));
        assert!(matches!(PrivateKey::from_hex("zz"), Err(KeyError::Hex(_))));
    }

    #[test]
    fn test_hex_errors_compare() {
        assert_eq!(
            PrivateKey::from_hex("zz").unwrap_err(),
            KeyError::Hex(hex::FromHexError::InvalidHexCharacter { c: 'z', index: 0 })
        );
        assert_ne!(KeyError::Length(1), KeyError::Length(2));
    }

    #[test]
    fn test_public_key_format() {
        let key = PrivateKey::from_bytes(&[1u8; 32]).unwrap();
        let public = key.public_key().to_string();
        // 256 bits in 5-bit groups -> 52 characters, plus ".k".
        assert_eq!(public.len(), 54);
        assert!(public.ends_with(".k"));
        assert!(
            public[..52]
                .bytes()
                .all(|b| BASE32_ALPHABET.contains(&b))
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = PrivateKey::from_bytes(&[9u8; 32]).unwrap();
        let b = PrivateKey::from_bytes(&[9u8; 32]).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.public_key().address(), b.public_key().address());
        let c = PrivateKey::from_bytes(&[10u8; 32]).unwrap();
        assert_ne!(a.public_key().address(), c.public_key().address());
    }

    #[test]
    fn test_base32_bit_order() {
        // 0x21 = 0b00100001: low 5 bits 00001 -> '1', remaining 001 -> '1'
        assert_eq!(base32_encode(&[0x21]), "11");
        assert_eq!(base32_encode(&[0xff]), "z7");
    }

    #[test]
    fn test_debug_hides_secret() {
        let key = PrivateKey::from_bytes(&[3u8; 32]).unwrap();
        assert_eq!(format!("{key:?}"), "PrivateKey(..)");
    }
}
