//! # Directory Entries
//!
//! An [`Entry`] is the signed record a node publishes about itself: its
//! address, display name and description, where to reach it, its public key,
//! the root hash of its post collection, and the seed relationships it takes
//! part in.
//!
//! ## What is signed
//!
//! The signature covers a canonical byte string concatenating, in fixed
//! order: address ‖ name ‖ desc ‖ public_address ‖ public_key ‖ port ‖
//! post_count ‖ updated ‖ collection_hash ‖ seeding. The `seeds` list is
//! deliberately *not* signed — other nodes extend it to grow the seed swarm
//! while the owner is offline.
//!
//! ## Verification as a gate
//!
//! [`Entry::verify`] is called on every received entry before it is used or
//! persisted. It checks the field length limits, the seed cap, the Ed25519
//! signature, and that the claimed address is derivable from the presented
//! public key. Nothing in an entry can be trusted before this passes.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::{verify_signature, Address, Keypair};

pub const MAX_ENTRY_NAME_LENGTH: usize = 32;
pub const MAX_ENTRY_DESC_LENGTH: usize = 160;
pub const MAX_ENTRY_PUBLIC_ADDRESS_LENGTH: usize = 253;
pub const MAX_ENTRY_SEEDS: usize = 100_000;

const PUBLIC_KEY_SIZE: usize = 32;
const SIGNATURE_SIZE: usize = 64;

/// Reasons an entry fails verification. These map onto the validation
/// branch of the protocol error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("entry name is too long ({0} > {MAX_ENTRY_NAME_LENGTH})")]
    NameTooLong(usize),
    #[error("entry description is too long ({0} > {MAX_ENTRY_DESC_LENGTH})")]
    DescTooLong(usize),
    #[error("entry has too many seeds ({0} > {MAX_ENTRY_SEEDS})")]
    TooManySeeds(usize),
    #[error("public key too small: {0}")]
    PublicKeyTooSmall(usize),
    #[error("signature too small: {0}")]
    SignatureTooSmall(usize),
    #[error("failed to verify signature")]
    BadSignature,
    #[error("public address must be set")]
    MissingPublicAddress,
    #[error("public address is too large ({MAX_ENTRY_PUBLIC_ADDRESS_LENGTH} char max)")]
    PublicAddressTooLong,
    #[error("address does not match public key")]
    AddressMismatch,
}

/// A node's signed directory record.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub address: Address,
    pub name: String,
    pub desc: String,
    /// DNS name or IP this node can be reached at.
    pub public_address: String,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub port: u16,
    pub post_count: i64,
    /// Last re-sign time, nanoseconds since the Unix epoch.
    pub updated: u64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    /// Root hash over the node's post collection hash list.
    #[serde(with = "serde_bytes")]
    pub collection_hash: Vec<u8>,
    /// Peers seeding this node. Unsigned; may be extended by third parties.
    pub seeds: Vec<Address>,
    /// Nodes this peer seeds. Signed.
    pub seeding: Vec<Address>,
    /// Last time this node was observed online.
    pub seen: i64,
}

/// Nanoseconds since the Unix epoch, used for `updated` stamps.
pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

impl Entry {
    /// The canonical bytes covered by the entry signature.
    ///
    /// Fixed field order; numeric fields as decimal strings, byte fields
    /// raw. `seeds` is excluded on purpose (see module docs).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(256);

        data.extend_from_slice(self.address.to_base58().as_bytes());
        data.extend_from_slice(self.name.as_bytes());
        data.extend_from_slice(self.desc.as_bytes());
        data.extend_from_slice(self.public_address.as_bytes());
        data.extend_from_slice(&self.public_key);
        data.extend_from_slice(self.port.to_string().as_bytes());
        data.extend_from_slice(self.post_count.to_string().as_bytes());
        data.extend_from_slice(self.updated.to_string().as_bytes());
        data.extend_from_slice(&self.collection_hash);

        for seeding in &self.seeding {
            data.extend_from_slice(seeding.as_bytes());
        }

        data
    }

    /// Ensures an entry fits the network's requirements. If an entry passes
    /// this, most operations can be performed on it.
    pub fn verify(&self) -> Result<(), EntryError> {
        if self.name.len() > MAX_ENTRY_NAME_LENGTH {
            return Err(EntryError::NameTooLong(self.name.len()));
        }

        if self.desc.len() > MAX_ENTRY_DESC_LENGTH {
            return Err(EntryError::DescTooLong(self.desc.len()));
        }

        if self.seeds.len() > MAX_ENTRY_SEEDS {
            return Err(EntryError::TooManySeeds(self.seeds.len()));
        }

        if self.public_key.len() < PUBLIC_KEY_SIZE {
            return Err(EntryError::PublicKeyTooSmall(self.public_key.len()));
        }

        if self.signature.len() < SIGNATURE_SIZE {
            return Err(EntryError::SignatureTooSmall(self.signature.len()));
        }

        if !verify_signature(&self.public_key, &self.canonical_bytes(), &self.signature) {
            return Err(EntryError::BadSignature);
        }

        if self.public_address.is_empty() {
            return Err(EntryError::MissingPublicAddress);
        }

        // 253 is the maximum length of a domain name
        if self.public_address.len() > MAX_ENTRY_PUBLIC_ADDRESS_LENGTH {
            return Err(EntryError::PublicAddressTooLong);
        }

        // The address must be derivable from the presented key, otherwise
        // this is someone else's record under a different name.
        if Address::from_public_key(&self.public_key) != self.address {
            return Err(EntryError::AddressMismatch);
        }

        Ok(())
    }

    /// msgpack form, used on the wire and in storage.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(data)
    }

    /// JSON form, for humans.
    pub fn encode_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The "host:port" this entry dials to.
    pub fn dial_address(&self) -> String {
        format!("{}:{}", self.public_address, self.port)
    }
}

impl Keypair {
    /// Build and sign a fresh entry for this keypair.
    pub fn new_entry(&self, name: &str, desc: &str) -> Entry {
        let mut entry = Entry {
            address: self.address(),
            name: name.to_owned(),
            desc: desc.to_owned(),
            public_key: self.public_key_bytes().to_vec(),
            ..Entry::default()
        };
        self.sign_entry(&mut entry);
        entry
    }

    /// Re-sign an entry, refreshing its `updated` stamp. The entry's
    /// address and public key are forced to this keypair's.
    pub fn sign_entry(&self, entry: &mut Entry) {
        entry.address = self.address();
        entry.public_key = self.public_key_bytes().to_vec();
        entry.updated = now_ns();
        entry.signature = self.sign(&entry.canonical_bytes()).to_bytes().to_vec();
    }
}

/// Sort entries in place by XOR distance to a target, closest first.
/// Stable, so equal-distance entries keep their existing order.
pub fn sort_by_distance(entries: &mut [Entry], target: &Address) {
    entries.sort_by(|a, b| {
        crate::identity::distance_cmp(&a.address.xor(target), &b.address.xor(target))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ADDRESS_BIT_SIZE;

    fn signed_entry(kp: &Keypair) -> Entry {
        let mut entry = kp.new_entry("alice", "a test node");
        entry.public_address = "203.0.113.7".into();
        entry.port = 5050;
        kp.sign_entry(&mut entry);
        entry
    }

    #[test]
    fn signed_entry_verifies() {
        let kp = Keypair::generate();
        let entry = signed_entry(&kp);
        assert_eq!(entry.verify(), Ok(()));
    }

    #[test]
    fn name_boundary() {
        let kp = Keypair::generate();

        let mut entry = signed_entry(&kp);
        entry.name = "n".repeat(MAX_ENTRY_NAME_LENGTH);
        kp.sign_entry(&mut entry);
        assert_eq!(entry.verify(), Ok(()));

        entry.name = "n".repeat(MAX_ENTRY_NAME_LENGTH + 1);
        kp.sign_entry(&mut entry);
        assert!(matches!(entry.verify(), Err(EntryError::NameTooLong(_))));
    }

    #[test]
    fn desc_boundary() {
        let kp = Keypair::generate();

        let mut entry = signed_entry(&kp);
        entry.desc = "d".repeat(MAX_ENTRY_DESC_LENGTH);
        kp.sign_entry(&mut entry);
        assert_eq!(entry.verify(), Ok(()));

        entry.desc = "d".repeat(MAX_ENTRY_DESC_LENGTH + 1);
        kp.sign_entry(&mut entry);
        assert!(matches!(entry.verify(), Err(EntryError::DescTooLong(_))));
    }

    #[test]
    fn seed_cap_boundary() {
        let kp = Keypair::generate();
        let mut entry = signed_entry(&kp);

        let filler = Address::from_bytes([7u8; 20]);
        entry.seeds = vec![filler; MAX_ENTRY_SEEDS];
        // seeds are unsigned, so no re-sign is needed for them to count
        assert_eq!(entry.verify(), Ok(()));

        entry.seeds.push(filler);
        assert!(matches!(entry.verify(), Err(EntryError::TooManySeeds(_))));
    }

    #[test]
    fn seeds_are_not_signed_but_seeding_is() {
        let kp = Keypair::generate();
        let mut entry = signed_entry(&kp);

        // extending the seed list keeps the signature valid
        entry.seeds.push(Address::from_bytes([9u8; 20]));
        assert_eq!(entry.verify(), Ok(()));

        // extending the seeding list invalidates it
        entry.seeding.push(Address::from_bytes([9u8; 20]));
        assert_eq!(entry.verify(), Err(EntryError::BadSignature));
    }

    #[test]
    fn tampered_fields_fail_verification() {
        let kp = Keypair::generate();
        let entry = signed_entry(&kp);

        let mut tampered = entry.clone();
        tampered.name = "mallory".into();
        assert_eq!(tampered.verify(), Err(EntryError::BadSignature));

        let mut tampered = entry.clone();
        tampered.public_address = "198.51.100.99".into();
        assert_eq!(tampered.verify(), Err(EntryError::BadSignature));

        let mut tampered = entry.clone();
        tampered.updated += 1;
        assert_eq!(tampered.verify(), Err(EntryError::BadSignature));

        let mut tampered = entry;
        tampered.signature[0] ^= 1;
        assert_eq!(tampered.verify(), Err(EntryError::BadSignature));
    }

    #[test]
    fn wrong_key_for_address_rejected() {
        // Mallory signs her own entry but claims Alice's address
        let alice = Keypair::generate();
        let mallory = Keypair::generate();

        let mut entry = signed_entry(&mallory);
        entry.address = alice.address();
        entry.signature = mallory.sign(&entry.canonical_bytes()).to_bytes().to_vec();

        assert_eq!(entry.verify(), Err(EntryError::AddressMismatch));
    }

    #[test]
    fn missing_public_address_rejected() {
        let kp = Keypair::generate();
        let mut entry = signed_entry(&kp);
        entry.public_address = String::new();
        kp.sign_entry(&mut entry);
        assert_eq!(entry.verify(), Err(EntryError::MissingPublicAddress));
    }

    #[test]
    fn msgpack_roundtrip() {
        let kp = Keypair::generate();
        let mut entry = signed_entry(&kp);
        entry.seeding.push(Keypair::generate().address());
        kp.sign_entry(&mut entry);
        entry.seeds.push(Keypair::generate().address());

        let encoded = entry.encode().unwrap();
        let decoded = Entry::decode(&encoded).unwrap();

        assert_eq!(entry, decoded);
        assert_eq!(decoded.verify(), Ok(()));
    }

    #[test]
    fn sign_then_verify_only_for_owner_address() {
        let kp = Keypair::generate();
        let entry = signed_entry(&kp);
        assert_eq!(Address::from_public_key(&entry.public_key), entry.address);
        assert_eq!(entry.verify(), Ok(()));
    }

    #[test]
    fn sort_by_distance_orders_closest_first() {
        let target = Address::from_bytes([0u8; 20]);

        let mut near_raw = [0u8; 20];
        near_raw[19] = 1;
        let mut far_raw = [0u8; 20];
        far_raw[0] = 0x80;

        let make = |addr: Address| Entry {
            address: addr,
            ..Entry::default()
        };

        let mut entries = vec![make(Address::from_bytes(far_raw)), make(Address::from_bytes(near_raw))];
        sort_by_distance(&mut entries, &target);

        assert_eq!(entries[0].address, Address::from_bytes(near_raw));
        assert_eq!(entries[0].address.xor(&target).leading_zeros(), ADDRESS_BIT_SIZE - 1);
    }
}
