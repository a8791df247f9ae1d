//! # Identity Primitives
//!
//! This module defines the core identity types of the Zif network:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Address`]: 20-byte node address derived from the public key
//!
//! ## Identity Model
//!
//! A node's identity is its Ed25519 public key; its network address is a
//! deterministic 20-byte digest of that key:
//!
//! ```text
//! address = BLAKE2b-512(public_key)[..20]
//! ```
//!
//! Addresses are displayed as base58check strings (version byte `0x00`)
//! wrapping the 20 raw bytes. Because the address is derivable from the
//! public key, a peer presenting an entry must present a key that hashes to
//! the address it claims — anything else is someone else's record.
//!
//! ## XOR Metric
//!
//! Distance between two addresses is their bytewise XOR, ordered
//! lexicographically. The number of leading zero bits of a distance selects
//! the routing bucket (one bucket per possible value).

use blake2::{Blake2b512, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// Size of a raw address in bytes.
pub const ADDRESS_BINARY_SIZE: usize = 20;

/// Number of routing buckets (one per bit of an address).
pub const ADDRESS_BIT_SIZE: usize = ADDRESS_BINARY_SIZE * 8;

/// Version byte used by the base58check display encoding.
const ADDRESS_VERSION: u8 = 0x00;

/// Errors produced when decoding an address from its string or byte form.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("address must be {ADDRESS_BINARY_SIZE} bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid base58check encoding: {0}")]
    InvalidEncoding(#[from] bs58::decode::Error),
}

/// A 20-byte node address in the Zif DHT keyspace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_BINARY_SIZE]);

impl Address {
    #[inline]
    pub fn from_bytes(bytes: [u8; ADDRESS_BINARY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse an address from a raw byte slice, rejecting wrong lengths.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        if bytes.len() != ADDRESS_BINARY_SIZE {
            return Err(AddressError::InvalidLength(bytes.len()));
        }
        let mut raw = [0u8; ADDRESS_BINARY_SIZE];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Derive the address that belongs to an Ed25519 public key.
    ///
    /// The chain is `BLAKE2b-512(public_key)` truncated to 20 bytes. All
    /// implementations must agree on this exact derivation; it is validated
    /// during handshake and on every received entry.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Blake2b512::digest(public_key);
        let mut raw = [0u8; ADDRESS_BINARY_SIZE];
        raw.copy_from_slice(&digest[..ADDRESS_BINARY_SIZE]);
        Self(raw)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_BINARY_SIZE] {
        &self.0
    }

    /// Base58check display form (version byte 0x00).
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0)
            .with_check_version(ADDRESS_VERSION)
            .into_string()
    }

    /// Decode the base58check display form back into an address.
    pub fn from_base58(s: &str) -> Result<Self, AddressError> {
        let decoded = bs58::decode(s)
            .with_check(Some(ADDRESS_VERSION))
            .into_vec()?;
        // with_check keeps the version byte at the front of the payload
        Self::from_slice(&decoded[1..])
    }

    /// XOR distance to another address.
    #[inline]
    pub fn xor(&self, other: &Address) -> Address {
        let mut out = [0u8; ADDRESS_BINARY_SIZE];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Address(out)
    }

    /// Number of leading zero bits, i.e. the routing bucket index of a
    /// distance. The all-zero distance (self XOR self) reports the full
    /// bit width; callers clamp before indexing.
    pub fn leading_zeros(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ADDRESS_BIT_SIZE
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", &self.to_base58())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; ADDRESS_BINARY_SIZE]> for Address {
    fn from(bytes: [u8; ADDRESS_BINARY_SIZE]) -> Self {
        Self(bytes)
    }
}

// On the wire an address is its 20 raw bytes; in JSON (table.dat) it decodes
// from a plain byte sequence as well.
impl serde::Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddressVisitor;

        impl<'de> serde::de::Visitor<'de> for AddressVisitor {
            type Value = Address;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{} raw address bytes", ADDRESS_BINARY_SIZE)
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Address, E> {
                Address::from_slice(v).map_err(E::custom)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Address, A::Error> {
                let mut raw = Vec::with_capacity(ADDRESS_BINARY_SIZE);
                while let Some(byte) = seq.next_element::<u8>()? {
                    raw.push(byte);
                }
                Address::from_slice(&raw).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_bytes(AddressVisitor)
    }
}

/// Compare two distances for k-nearest selection.
#[inline]
pub fn distance_cmp(a: &Address, b: &Address) -> std::cmp::Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The address this keypair answers to on the network.
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address().to_base58())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature against a raw 32-byte public key.
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <&[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <&[u8; 64]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(sig_bytes)).is_ok()
}
