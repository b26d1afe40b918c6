//  Copyright 2024, The Warthog Project
//
//  Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
//  following conditions are met:
//
//  1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
//  disclaimer.
//
//  2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
//  following disclaimer in the documentation and/or other materials provided with the distribution.
//
//  3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
//  products derived from this software without specific prior written permission.
//
//  THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
//  INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//  DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
//  SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//  SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
//  WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
//  USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use warthog_common_types::{BatchSlot, Height, NonzeroHeight};

use crate::{
    blocks::{BlockHash, BlockHeader},
    chain::{batch::Batch, batch::Grid, signed_snapshot::SignedSnapshot},
    proof_of_work::Worksum,
};

/// The longest registered grid prefix contradicts the active signed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMismatch;

/// Process-wide content-addressed store of complete header batches, keyed by the 80 raw bytes of
/// each batch's last header. Nodes are refcounted and link to their parent batch; releasing the
/// last handle evicts the node and cascades the parent release iteratively (parent chains can be
/// tens of thousands deep, so no recursion).
pub struct BatchRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<BlockHeader, usize>,
}

struct Node {
    key: BlockHeader,
    batch: Arc<Batch>,
    total_work: Worksum,
    slot: BatchSlot,
    parent: Option<usize>,
    refcount: u64,
}

/// Move-only owning handle to a registry node. Cloning bumps the refcount; dropping releases it.
/// Batch bytes, slot and cumulative worksum are cached in the handle, so the registry mutex is
/// touched only for share/clone/release/lookup.
pub struct SharedBatch {
    registry: Arc<BatchRegistry>,
    node: usize,
    batch: Arc<Batch>,
    total_work: Worksum,
    slot: BatchSlot,
}

impl BatchRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Number of live nodes, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry poisoned").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idempotent insertion of a complete, internally linked batch on top of `parent`. On a key
    /// hit the existing node is returned with its refcount bumped.
    pub fn share(self: &Arc<Self>, batch: Batch, parent: Option<&SharedBatch>) -> SharedBatch {
        let total_work = parent.map(|p| p.total_work()).unwrap_or_else(Worksum::zero) +
            batch.total_worksum();
        self.share_with_work(batch, parent, total_work)
    }

    pub fn share_with_work(
        self: &Arc<Self>,
        batch: Batch,
        parent: Option<&SharedBatch>,
        total_work: Worksum,
    ) -> SharedBatch {
        assert!(batch.is_complete());
        debug_assert!(batch.valid_inner_links());
        let key = *batch.last().expect("complete batch has a last header");
        let slot = parent.map(|p| p.slot() + 1).unwrap_or(BatchSlot::new(0));

        let mut inner = self.inner.lock().expect("registry poisoned");
        if let Some(&idx) = inner.index.get(&key) {
            let node = inner.nodes[idx].as_mut().expect("indexed node is live");
            debug_assert_eq!(node.total_work, total_work);
            node.refcount += 1;
            let (batch, total_work, slot) = (node.batch.clone(), node.total_work, node.slot);
            return SharedBatch {
                registry: Arc::clone(self),
                node: idx,
                batch,
                total_work,
                slot,
            };
        }

        // new node: take over one refcount of the parent handle
        let parent_idx = parent.map(|p| {
            let pnode = inner.nodes[p.node].as_mut().expect("parent node is live");
            pnode.refcount += 1;
            p.node
        });
        let batch = Arc::new(batch);
        let node = Node {
            key,
            batch: batch.clone(),
            total_work,
            slot,
            parent: parent_idx,
            refcount: 1,
        };
        let idx = match inner.free.pop() {
            Some(idx) => {
                inner.nodes[idx] = Some(node);
                idx
            },
            None => {
                inner.nodes.push(Some(node));
                inner.nodes.len() - 1
            },
        };
        inner.index.insert(key, idx);
        SharedBatch {
            registry: Arc::clone(self),
            node: idx,
            batch,
            total_work,
            slot,
        }
    }

    /// Binary search for the longest prefix of `grid` whose final entry is already registered.
    /// `Ok(None)` means no entry is registered yet; `Err` means the found chain contradicts the
    /// provided snapshot at the snapshot height.
    pub fn find_last(
        self: &Arc<Self>,
        grid: &Grid,
        snapshot: Option<&SignedSnapshot>,
    ) -> Result<Option<SharedBatch>, SnapshotMismatch> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let mut a = 0usize; // index of the last entry known present
        let mut b = grid.slots(); // lowest index known absent
        let mut found: Option<usize> = None;
        let mut c = 0usize;
        loop {
            if b == 0 {
                return Ok(None);
            }
            match inner.index.get(&grid.entries()[c]) {
                Some(&idx) => {
                    a = c;
                    found = Some(idx);
                },
                None => b = c,
            }
            if b - a == 1 {
                break;
            }
            c = a + (b - a) / 2;
        }
        let idx = match found {
            Some(idx) => idx,
            None => return Ok(None),
        };
        if let Some(ss) = snapshot {
            if let Some(hash) = inner.hash_at(idx, ss.height()) {
                if hash != ss.hash {
                    return Err(SnapshotMismatch);
                }
            }
        }
        let node = inner.nodes[idx].as_mut().expect("indexed node is live");
        node.refcount += 1;
        let (batch, total_work, slot) = (node.batch.clone(), node.total_work, node.slot);
        Ok(Some(SharedBatch {
            registry: Arc::clone(self),
            node: idx,
            batch,
            total_work,
            slot,
        }))
    }

    fn clone_handle(self: &Arc<Self>, node_idx: usize) -> SharedBatch {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let node = inner.nodes[node_idx].as_mut().expect("cloned node is live");
        node.refcount += 1;
        SharedBatch {
            registry: Arc::clone(self),
            node: node_idx,
            batch: node.batch.clone(),
            total_work: node.total_work,
            slot: node.slot,
        }
    }

    fn release(&self, node_idx: usize) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let mut idx = node_idx;
        loop {
            let node = inner.nodes[idx].as_mut().expect("released node is live");
            node.refcount -= 1;
            if node.refcount > 0 {
                break;
            }
            let key = node.key;
            let parent = node.parent;
            inner.index.remove(&key);
            inner.nodes[idx] = None;
            inner.free.push(idx);
            match parent {
                Some(p) => idx = p,
                None => break,
            }
        }
    }
}

impl Inner {
    /// Hash of the chain at `height`, walking parent links from the node's batch downward.
    fn hash_at(&self, node_idx: usize, height: NonzeroHeight) -> Option<BlockHash> {
        let mut node = self.nodes[node_idx].as_ref().expect("indexed node is live");
        if node.slot.upper() < height {
            return None;
        }
        loop {
            let lower = node.slot.lower();
            if node.slot.upper() == height {
                return node.batch.last().map(|h| h.hash());
            }
            if lower <= height {
                // prev-hash of the successor inside this batch
                let successor = (height.value() - lower.value() + 1) as usize;
                return node.batch.get(successor).map(|h| h.prev_hash());
            }
            node = self.nodes[node.parent?].as_ref().expect("parent node is live");
        }
    }
}

impl SharedBatch {
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn batch_arc(&self) -> Arc<Batch> {
        self.batch.clone()
    }

    pub fn total_work(&self) -> Worksum {
        self.total_work
    }

    pub fn slot(&self) -> BatchSlot {
        self.slot
    }

    pub fn next_slot(&self) -> BatchSlot {
        self.slot + 1
    }

    pub fn lower_height(&self) -> NonzeroHeight {
        self.slot.lower()
    }

    pub fn upper_height(&self) -> Height {
        self.slot.upper().height()
    }

    pub fn last_header(&self) -> BlockHeader {
        *self.batch.last().expect("complete batch has a last header")
    }

    pub fn prev(&self) -> Option<SharedBatch> {
        let parent = {
            let inner = self.registry.inner.lock().expect("registry poisoned");
            inner.nodes[self.node].as_ref().expect("own node is live").parent
        };
        parent.map(|idx| self.registry.clone_handle(idx))
    }

    /// Header at an absolute chain height within this batch.
    pub fn header_at(&self, height: NonzeroHeight) -> Option<BlockHeader> {
        if height < self.lower_height() || height > self.upper_height() {
            return None;
        }
        self.batch.get((height - self.lower_height()) as usize).copied()
    }

    /// Header lookup walking parent batches below this one.
    pub fn header_at_recursive(&self, height: NonzeroHeight) -> Option<BlockHeader> {
        let mut current = self.clone();
        loop {
            if height >= current.lower_height() {
                return current.header_at(height);
            }
            current = current.prev()?;
        }
    }
}

impl Clone for SharedBatch {
    fn clone(&self) -> Self {
        self.registry.clone_handle(self.node)
    }
}

impl Drop for SharedBatch {
    fn drop(&mut self) {
        self.registry.release(self.node);
    }
}

impl PartialEq for SharedBatch {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry) && self.node == other.node
    }
}

impl Eq for SharedBatch {}

impl std::fmt::Debug for SharedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBatch")
            .field("slot", &self.slot)
            .field("total_work", &self.total_work)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{complete_batch, complete_batch_after};

    #[test]
    fn share_is_idempotent() {
        let registry = BatchRegistry::new();
        let batch = complete_batch(1_000_000_000);
        let a = registry.share(batch.clone(), None);
        let b = registry.share(batch, None);
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn release_cascades_through_parents() {
        let registry = BatchRegistry::new();
        let b0 = complete_batch(1_000_000_000);
        let b1 = complete_batch_after(&b0, 1);
        let b2 = complete_batch_after(&b1, 2);
        let s0 = registry.share(b0, None);
        let s1 = registry.share(b1, Some(&s0));
        let s2 = registry.share(b2, Some(&s1));
        drop(s0);
        drop(s1);
        assert_eq!(registry.len(), 3); // parents kept alive through s2
        drop(s2);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn cumulative_work_accumulates() {
        let registry = BatchRegistry::new();
        let b0 = complete_batch(1_000_000_000);
        let w0 = b0.total_worksum();
        let s0 = registry.share(b0, None);
        assert_eq!(s0.total_work(), w0);

        let b1 = complete_batch_after(s0.batch(), 1);
        let w1 = b1.total_worksum();
        let s1 = registry.share(b1, Some(&s0));
        assert_eq!(s1.total_work(), w0 + w1);
        assert_eq!(s1.slot(), BatchSlot::new(1));
        assert_eq!(s1.prev().unwrap(), s0);
    }

    #[test]
    fn find_last_returns_longest_registered_prefix() {
        let registry = BatchRegistry::new();
        let b0 = complete_batch(1_000_000_000);
        let b1 = complete_batch_after(&b0, 1);
        let b2 = complete_batch_after(&b1, 2);
        let s0 = registry.share(b0.clone(), None);
        let s1 = registry.share(b1.clone(), Some(&s0));

        let grid = Grid::from_entries(vec![
            *b0.last().unwrap(),
            *b1.last().unwrap(),
            *b2.last().unwrap(),
        ]);
        let found = registry.find_last(&grid, None).unwrap().unwrap();
        assert_eq!(found, s1);

        let empty_grid = Grid::new();
        assert!(registry.find_last(&empty_grid, None).unwrap().is_none());

        let unknown = Grid::from_entries(vec![*b2.last().unwrap()]);
        assert!(registry.find_last(&unknown, None).unwrap().is_none());
    }

    #[test]
    fn header_lookup_walks_parents() {
        let registry = BatchRegistry::new();
        let b0 = complete_batch(1_000_000_000);
        let b1 = complete_batch_after(&b0, 1);
        let first = *b0.first().unwrap();
        let s0 = registry.share(b0, None);
        let s1 = registry.share(b1, Some(&s0));
        assert_eq!(
            s1.header_at_recursive(NonzeroHeight::assert(1)).unwrap(),
            first
        );
        assert_eq!(s1.header_at_recursive(s1.lower_height()).unwrap(), *s1.batch().first().unwrap());
    }
}
