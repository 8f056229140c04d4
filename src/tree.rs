//! Trees: ordered node lists with dirty tracking.
//!
//! The filesystem owns a single arena of trees, the root at index 0. Each
//! tree records its parent index so dirtiness can bubble to the root without
//! cyclic ownership. Trees are materialized lazily on first directory access
//! and never reclaimed; object databases keep directory counts small enough
//! that the unbounded cache is fine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::id::BlobId;
use crate::node::{Node, NodeMeta};

/// Index of a tree in the filesystem's arena.
pub(crate) type TreeIx = usize;

/// The root tree's index.
pub(crate) const ROOT: TreeIx = 0;

/// Wire form of a tree: the ordered node list. Serialized as
/// `{"nodes":[…]}` followed by a newline; the newline is part of the hashed
/// bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeBlob {
    /// The tree's entries, in stored order.
    pub nodes: Vec<NodeMeta>,
}

impl TreeBlob {
    /// Serialize to the exact bytes that get hashed and stored.
    pub fn to_wire(&self) -> serde_json::Result<Vec<u8>> {
        let mut data = serde_json::to_vec(self)?;
        data.push(b'\n');
        Ok(data)
    }
}

/// One materialized tree.
pub(crate) struct TreeSlot {
    /// Containing tree, `None` for the root.
    pub parent: Option<TreeIx>,
    /// Committed id. `None` means dirty: the in-memory content has not been
    /// written to the repository.
    pub id: Option<BlobId>,
    /// Entries in stored order. Names are unique; the façade guarantees it.
    pub nodes: Vec<Arc<Node>>,
}

/// Arena of materialized trees.
pub(crate) struct TreeArena {
    slots: Vec<TreeSlot>,
}

impl TreeArena {
    /// Arena with a fresh, empty (and therefore dirty) root.
    pub fn empty_root() -> Self {
        Self {
            slots: vec![TreeSlot {
                parent: None,
                id: None,
                nodes: Vec::new(),
            }],
        }
    }

    /// Arena rooted at a committed tree loaded from the repository.
    pub fn with_root(id: BlobId, blob: TreeBlob) -> Self {
        let nodes = blob
            .nodes
            .into_iter()
            .map(|meta| Node::from_meta(meta, ROOT))
            .collect();
        Self {
            slots: vec![TreeSlot {
                parent: None,
                id: Some(id),
                nodes,
            }],
        }
    }

    pub fn slot(&self, ix: TreeIx) -> &TreeSlot {
        &self.slots[ix]
    }

    pub fn slot_mut(&mut self, ix: TreeIx) -> &mut TreeSlot {
        &mut self.slots[ix]
    }

    /// Linear-scan lookup by name.
    pub fn find(&self, ix: TreeIx, name: &str) -> Option<Arc<Node>> {
        self.slots[ix]
            .nodes
            .iter()
            .find(|n| n.meta.read().name == name)
            .cloned()
    }

    /// Append a node. Inserting a duplicate name is a bug in the façade.
    pub fn add_node(&mut self, ix: TreeIx, node: Arc<Node>) {
        let name = node.meta.read().name.clone();
        if self.find(ix, &name).is_some() {
            panic!("attempt to add node with conflicting name {name:?}");
        }
        node.set_parent_tree(ix);
        self.slots[ix].nodes.push(node);
        self.mark_dirty(ix);
    }

    /// Remove a node by name (swap-remove; stored order is not preserved
    /// past the removed slot). Returns the detached node.
    pub fn remove(&mut self, ix: TreeIx, name: &str) -> Option<Arc<Node>> {
        let pos = self.slots[ix]
            .nodes
            .iter()
            .position(|n| n.meta.read().name == name)?;
        let node = self.slots[ix].nodes.swap_remove(pos);
        self.mark_dirty(ix);
        Some(node)
    }

    /// Clear committed ids from `ix` up to the root.
    pub fn mark_dirty(&mut self, ix: TreeIx) {
        let mut current = Some(ix);
        while let Some(i) = current {
            self.slots[i].id = None;
            current = self.slots[i].parent;
        }
    }

    pub fn is_dirty(&self, ix: TreeIx) -> bool {
        self.slots[ix].id.is_none()
    }

    /// Materialize a committed subtree loaded from the repository.
    pub fn materialize(&mut self, parent: TreeIx, id: BlobId, blob: TreeBlob) -> TreeIx {
        let ix = self.slots.len();
        let nodes = blob
            .nodes
            .into_iter()
            .map(|meta| Node::from_meta(meta, ix))
            .collect();
        self.slots.push(TreeSlot {
            parent: Some(parent),
            id: Some(id),
            nodes,
        });
        ix
    }

    /// Allocate an empty subtree for a freshly created directory.
    pub fn new_subtree(&mut self, parent: TreeIx) -> TreeIx {
        let ix = self.slots.len();
        self.slots.push(TreeSlot {
            parent: Some(parent),
            id: None,
            nodes: Vec::new(),
        });
        ix
    }
}
