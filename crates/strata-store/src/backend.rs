//! Storage backend abstraction and the in-memory implementation.
//!
//! A backend is a dumb keyed table: it enforces uniqueness of content hashes and assigns ids,
//! nothing else. Deduplication, caching and race handling live in [`NodeStore`](crate::NodeStore).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::hash::ContentHash;
use crate::node::{NewNode, NodeHandle, NodeId, NodeKind, NodeRef, NodeRow};
use crate::projector::LocalityKey;

/// Persistent table of nodes keyed by content hash.
#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// Look up one node by content hash.
    async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<NodeHandle>>;

    /// Look up many nodes by content hash in one round trip. Absent hashes are omitted.
    async fn find_many_by_hash(
        &self,
        hashes: &[ContentHash],
    ) -> Result<HashMap<ContentHash, NodeHandle>>;

    /// Insert one node. Fails with [`StoreError::UniqueViolation`] if the hash already exists.
    async fn insert(&self, node: NewNode) -> Result<NodeHandle>;

    /// Insert many nodes atomically: either every row lands or none does. A duplicate hash,
    /// whether already stored or repeated within the batch, fails the whole batch with
    /// [`StoreError::UniqueViolation`].
    async fn batch_insert(&self, nodes: Vec<NewNode>) -> Result<Vec<NodeHandle>>;

    /// Fetch rows by reference. Missing references are omitted from the result.
    async fn fetch(&self, refs: &[NodeRef]) -> Result<Vec<NodeRow>>;

    /// Stream rows whose locality key falls within `range`, in key order.
    async fn range_scan(
        &self,
        range: RangeInclusive<LocalityKey>,
    ) -> Result<BoxStream<'static, Result<NodeRow>>>;

    /// Number of stored nodes of one kind.
    async fn count(&self, kind: NodeKind) -> Result<usize>;
}

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    next_leaf: u64,
    next_composite: u64,
    rows: Vec<NodeRow>,
}

#[derive(Default)]
struct Tables {
    by_hash: HashMap<ContentHash, NodeHandle>,
    leaves: BTreeMap<u64, Vec<u8>>,
    composites: BTreeMap<u64, Vec<u8>>,
    locality: BTreeSet<(LocalityKey, NodeRef)>,
    next_leaf: u64,
    next_composite: u64,
}

impl Tables {
    fn new() -> Self {
        Self {
            next_leaf: 1,
            next_composite: 1,
            ..Default::default()
        }
    }

    fn table(&self, kind: NodeKind) -> &BTreeMap<u64, Vec<u8>> {
        match kind {
            NodeKind::Leaf => &self.leaves,
            NodeKind::Composite => &self.composites,
        }
    }

    fn allocate(&mut self, kind: NodeKind) -> NodeId {
        let next = match kind {
            NodeKind::Leaf => &mut self.next_leaf,
            NodeKind::Composite => &mut self.next_composite,
        };
        let id = *next;
        *next += 1;
        NodeId(id)
    }

    /// Store an already-identified row. Caller has checked the hash is free.
    fn put(&mut self, row: &NodeRow, encoded: Vec<u8>) {
        let handle = row.handle();
        self.by_hash.insert(row.hash, handle);
        self.locality.insert((row.locality, row.node));
        match row.node.kind {
            NodeKind::Leaf => self.leaves.insert(row.node.id.0, encoded),
            NodeKind::Composite => self.composites.insert(row.node.id.0, encoded),
        };
    }

    fn get(&self, node: &NodeRef) -> Result<Option<NodeRow>> {
        match self.table(node.kind).get(&node.id.0) {
            Some(bytes) => Ok(Some(NodeRow::decode(bytes)?)),
            None => Ok(None),
        }
    }
}

/// In-memory backend. Rows are stored bincode-encoded, so every read pays a decode the way a
/// networked backend would. Can be snapshotted to and restored from a file.
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    /// Creates a new empty backend. Ids start at 1 in both tables.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::new()),
        }
    }

    /// Write every row to `path` (via a sibling temp file and rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let tables = self.tables.read();
            let mut rows = Vec::with_capacity(tables.leaves.len() + tables.composites.len());
            for bytes in tables.leaves.values().chain(tables.composites.values()) {
                rows.push(NodeRow::decode(bytes)?);
            }
            Snapshot {
                version: SNAPSHOT_VERSION,
                next_leaf: tables.next_leaf,
                next_composite: tables.next_composite,
                rows,
            }
        };
        let bytes = bincode::serialize(&snapshot)?;
        let tmp = temp_path(path);
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), rows = snapshot.rows.len(), "saved node snapshot");
        Ok(())
    }

    /// Restore a backend from a file written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: Snapshot = bincode::deserialize(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Backend(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        let mut tables = Tables::new();
        for row in &snapshot.rows {
            if tables.by_hash.contains_key(&row.hash) {
                return Err(StoreError::Backend(format!(
                    "snapshot holds duplicate hash {}",
                    row.hash
                )));
            }
            tables.put(row, row.encode()?);
        }
        tables.next_leaf = snapshot.next_leaf.max(tables.leaves.keys().last().map_or(1, |id| id + 1));
        tables.next_composite = snapshot
            .next_composite
            .max(tables.composites.keys().last().map_or(1, |id| id + 1));
        info!(path = %path.display(), rows = snapshot.rows.len(), "loaded node snapshot");
        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    /// Open the snapshot at `path` if it exists, otherwise start empty.
    pub fn open_or_new(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "no snapshot, starting empty");
            Ok(Self::new())
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeBackend for MemoryBackend {
    async fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<NodeHandle>> {
        Ok(self.tables.read().by_hash.get(hash).copied())
    }

    async fn find_many_by_hash(
        &self,
        hashes: &[ContentHash],
    ) -> Result<HashMap<ContentHash, NodeHandle>> {
        let tables = self.tables.read();
        Ok(hashes
            .iter()
            .filter_map(|hash| tables.by_hash.get(hash).map(|handle| (*hash, *handle)))
            .collect())
    }

    async fn insert(&self, node: NewNode) -> Result<NodeHandle> {
        let mut tables = self.tables.write();
        if tables.by_hash.contains_key(&node.hash) {
            return Err(StoreError::UniqueViolation { hash: node.hash });
        }
        let id = tables.allocate(node.kind());
        let row = node.into_row(id);
        let encoded = row.encode()?;
        tables.put(&row, encoded);
        Ok(row.handle())
    }

    async fn batch_insert(&self, nodes: Vec<NewNode>) -> Result<Vec<NodeHandle>> {
        let mut tables = self.tables.write();
        let mut seen = BTreeSet::new();
        for node in &nodes {
            if tables.by_hash.contains_key(&node.hash) || !seen.insert(node.hash) {
                return Err(StoreError::UniqueViolation { hash: node.hash });
            }
        }
        // Encode everything before touching the tables so a codec failure leaves no trace.
        let mut staged = Vec::with_capacity(nodes.len());
        let (mut next_leaf, mut next_composite) = (tables.next_leaf, tables.next_composite);
        for node in nodes {
            let id = match node.kind() {
                NodeKind::Leaf => {
                    next_leaf += 1;
                    NodeId(next_leaf - 1)
                }
                NodeKind::Composite => {
                    next_composite += 1;
                    NodeId(next_composite - 1)
                }
            };
            let row = node.into_row(id);
            let encoded = row.encode()?;
            staged.push((row, encoded));
        }
        tables.next_leaf = next_leaf;
        tables.next_composite = next_composite;
        let mut handles = Vec::with_capacity(staged.len());
        for (row, encoded) in staged {
            tables.put(&row, encoded);
            handles.push(row.handle());
        }
        Ok(handles)
    }

    async fn fetch(&self, refs: &[NodeRef]) -> Result<Vec<NodeRow>> {
        let tables = self.tables.read();
        let mut rows = Vec::with_capacity(refs.len());
        for node in refs {
            if let Some(row) = tables.get(node)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn range_scan(
        &self,
        range: RangeInclusive<LocalityKey>,
    ) -> Result<BoxStream<'static, Result<NodeRow>>> {
        let (start, end) = range.into_inner();
        if start > end {
            return Ok(Box::pin(stream::empty()));
        }
        let tables = self.tables.read();
        let mut rows = Vec::new();
        for (_, node) in tables.locality.range((start, NodeRef::MIN)..=(end, NodeRef::MAX)) {
            if let Some(row) = tables.get(node)? {
                rows.push(Ok(row));
            }
        }
        Ok(Box::pin(stream::iter(rows)))
    }

    async fn count(&self, kind: NodeKind) -> Result<usize> {
        Ok(self.tables.read().table(kind).len())
    }
}

/// `path` with `.tmp` appended to the whole file name.
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
