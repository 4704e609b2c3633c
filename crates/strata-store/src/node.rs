//! Node model: leaves, composites, relations and tagged references.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::hash::ContentHash;
use crate::projector::{LocalityKey, Point4D};

/// Interpretation of a leaf's seed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeedKind {
    /// A Unicode scalar value
    #[default]
    Unicode,
    /// An arbitrary unsigned integer symbol
    Integer,
    /// The IEEE-754 bit pattern of an `f32`
    FloatBits,
}

impl SeedKind {
    /// Stable tag used in hashing and encoding.
    pub fn tag(&self) -> u8 {
        match self {
            SeedKind::Unicode => 1,
            SeedKind::Integer => 2,
            SeedKind::FloatBits => 3,
        }
    }
}

/// An irreducible leaf value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Seed {
    /// How `value` is interpreted
    pub kind: SeedKind,
    /// The raw value
    pub value: u32,
}

impl Seed {
    /// Build a seed from its parts.
    pub fn new(kind: SeedKind, value: u32) -> Self {
        Self { kind, value }
    }
    /// Seed for one Unicode scalar value.
    pub fn unicode(c: char) -> Self {
        Self::new(SeedKind::Unicode, c as u32)
    }
    /// Seed for an integer symbol.
    pub fn integer(value: u32) -> Self {
        Self::new(SeedKind::Integer, value)
    }
    /// Seed for the bit pattern of a float.
    pub fn float(value: f32) -> Self {
        Self::new(SeedKind::FloatBits, value.to_bits())
    }
}

/// Kind tag carried by every node reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    /// Irreducible value
    Leaf,
    /// Ordered, run-length-compressed list of relations
    Composite,
}

impl NodeKind {
    /// Stable tag used in hashing and encoding.
    pub fn tag(&self) -> u8 {
        match self {
            NodeKind::Leaf => 1,
            NodeKind::Composite => 2,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Leaf => write!(f, "leaf"),
            NodeKind::Composite => write!(f, "composite"),
        }
    }
}

/// Backend-assigned row id. Leaf and composite ids are separate sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// A tagged reference to a stored node. Never ambiguous between kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    /// Which table the id belongs to
    pub kind: NodeKind,
    /// Row id within that table
    pub id: NodeId,
}

impl NodeRef {
    /// Smallest possible reference, for range bounds.
    pub const MIN: NodeRef = NodeRef {
        kind: NodeKind::Leaf,
        id: NodeId(0),
    };
    /// Largest possible reference, for range bounds.
    pub const MAX: NodeRef = NodeRef {
        kind: NodeKind::Composite,
        id: NodeId(u64::MAX),
    };

    /// Build a reference.
    pub fn new(kind: NodeKind, id: NodeId) -> Self {
        Self { kind, id }
    }
    /// Reference to a leaf row.
    pub fn leaf(id: u64) -> Self {
        Self::new(NodeKind::Leaf, NodeId(id))
    }
    /// Reference to a composite row.
    pub fn composite(id: u64) -> Self {
        Self::new(NodeKind::Composite, NodeId(id))
    }
    /// True if this refers to a leaf.
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id.0)
    }
}

impl FromStr for NodeRef {
    type Err = StoreError;

    /// Parses `leaf:<id>` or `composite:<id>`.
    fn from_str(s: &str) -> Result<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| StoreError::Validation(format!("malformed node reference '{}'", s)))?;
        let kind = match kind {
            "leaf" => NodeKind::Leaf,
            "composite" => NodeKind::Composite,
            other => {
                return Err(StoreError::Validation(format!(
                    "unknown node kind '{}'",
                    other
                )))
            }
        };
        let id = id
            .parse::<u64>()
            .map_err(|e| StoreError::Validation(format!("bad node id '{}': {}", id, e)))?;
        Ok(NodeRef::new(kind, NodeId(id)))
    }
}

/// A node reference together with its projected point, as returned by every creation path.
/// The point feeds the centroid of any composite built on top of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle {
    /// The stored node
    pub node: NodeRef,
    /// Its projected point
    pub point: Point4D,
}

/// One entry in a composite's child list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    /// 0-based, order-significant position
    pub position: u32,
    /// The child node
    pub child: NodeRef,
    /// Number of consecutive repetitions of `child` at this position (always > 0)
    pub multiplicity: u32,
}

/// Canonicalise a child list: reject empty lists and zero multiplicities, merge adjacent
/// repeats of the same child, and assign positions `0..n`.
pub fn canonicalize_relations(children: &[(NodeRef, u32)]) -> Result<Vec<Relation>> {
    if children.is_empty() {
        return Err(StoreError::Validation(
            "composite must have at least one relation".into(),
        ));
    }
    let mut relations: Vec<Relation> = Vec::with_capacity(children.len());
    for (index, &(child, multiplicity)) in children.iter().enumerate() {
        if multiplicity == 0 {
            return Err(StoreError::Validation(format!(
                "relation {} ({}) has zero multiplicity",
                index, child
            )));
        }
        if let Some(last) = relations.last_mut() {
            if last.child == child {
                last.multiplicity = last.multiplicity.checked_add(multiplicity).ok_or_else(|| {
                    StoreError::Validation(format!("multiplicity overflow at relation {}", index))
                })?;
                continue;
            }
        }
        let position = relations.len() as u32;
        relations.push(Relation {
            position,
            child,
            multiplicity,
        });
    }
    Ok(relations)
}

/// Collapse consecutive equal items into `(item, count)` runs.
pub fn run_length_encode<T: PartialEq + Copy>(items: &[T]) -> Vec<(T, u32)> {
    let mut runs: Vec<(T, u32)> = Vec::new();
    for &item in items {
        if let Some((last, count)) = runs.last_mut() {
            if *last == item && *count < u32::MAX {
                *count += 1;
                continue;
            }
        }
        runs.push((item, 1));
    }
    runs
}

/// Payload of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeBody {
    /// Leaf value
    Leaf(Seed),
    /// Composite relations in position order
    Composite(Vec<Relation>),
}

impl NodeBody {
    /// Kind of node this body belongs to.
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeBody::Leaf(_) => NodeKind::Leaf,
            NodeBody::Composite(_) => NodeKind::Composite,
        }
    }
}

/// A node ready to be inserted; the backend assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    /// Content hash (identity)
    pub hash: ContentHash,
    /// Projected point (not identity)
    pub point: Point4D,
    /// Space-filling-curve key of `point` (not identity)
    pub locality: LocalityKey,
    /// Payload
    pub body: NodeBody,
}

impl NewNode {
    /// Kind of the node to be created.
    pub fn kind(&self) -> NodeKind {
        self.body.kind()
    }

    /// Attach a backend-assigned id.
    pub fn into_row(self, id: NodeId) -> NodeRow {
        NodeRow {
            node: NodeRef::new(self.body.kind(), id),
            hash: self.hash,
            point: self.point,
            locality: self.locality,
            body: self.body,
        }
    }
}

/// A stored node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    /// Tagged reference
    pub node: NodeRef,
    /// Content hash
    pub hash: ContentHash,
    /// Projected point
    pub point: Point4D,
    /// Locality key
    pub locality: LocalityKey,
    /// Payload
    pub body: NodeBody,
}

impl NodeRow {
    /// Encode the row with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a row produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Reference plus point.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            node: self.node,
            point: self.point,
        }
    }
}
