//! Content hashing: BLAKE3 digests identifying leaves and composites.
//!
//! Leaf and composite digests are domain-separated, and every child reference in a composite
//! digest carries its kind tag, so `Leaf #7` and `Composite #7` never hash alike.

use serde::{Deserialize, Serialize};

use crate::node::{Relation, Seed};

const LEAF_DOMAIN: &[u8] = b"strata.leaf.v1";
const COMPOSITE_DOMAIN: &[u8] = b"strata.composite.v1";

/// A 32-byte BLAKE3 hash identifying a node's content. Used as the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    /// First eight hex digits, for log lines
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash of a leaf: a pure function of seed kind and seed value.
pub fn leaf_hash(seed: &Seed) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(LEAF_DOMAIN);
    hasher.update(&[seed.kind.tag()]);
    hasher.update(&seed.value.to_le_bytes());
    ContentHash(*hasher.finalize().as_bytes())
}

/// Hash of a composite: a pure function of the ordered `(child id, child kind, multiplicity)` list.
pub fn composite_hash(relations: &[Relation]) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(COMPOSITE_DOMAIN);
    hasher.update(&(relations.len() as u64).to_le_bytes());
    for relation in relations {
        hasher.update(&[relation.child.kind.tag()]);
        hasher.update(&relation.child.id.0.to_le_bytes());
        hasher.update(&relation.multiplicity.to_le_bytes());
    }
    ContentHash(*hasher.finalize().as_bytes())
}
