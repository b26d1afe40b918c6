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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    RwLock,
};

use warthog_common_types::{BatchSlot, Descriptor, Height};

use crate::{
    blocks::BlockHeader,
    chain::batch::Grid,
    message::{AppendMsg, ProtocolError},
    proof_of_work::Worksum,
};

struct DescriptedInner {
    chain_length: Height,
    worksum: Worksum,
    grid: Grid,
}

/// One published chain tip of a peer, identified by its descriptor. Shared between the peer
/// state and in-flight requests; a structural update at the peer marks the old object expired so
/// late replies referencing it are discarded. Appends extend the grid in place under the same
/// descriptor.
pub struct Descripted {
    descriptor: Descriptor,
    expired: AtomicBool,
    inner: RwLock<DescriptedInner>,
}

impl Descripted {
    pub fn new(descriptor: Descriptor, chain_length: Height, worksum: Worksum, grid: Grid) -> Self {
        Self {
            descriptor,
            expired: AtomicBool::new(false),
            inner: RwLock::new(DescriptedInner {
                chain_length,
                worksum,
                grid,
            }),
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn expire(&self) {
        self.expired.store(true, Ordering::Relaxed);
    }

    pub fn chain_length(&self) -> Height {
        self.inner.read().expect("descripted poisoned").chain_length
    }

    pub fn worksum(&self) -> Worksum {
        self.inner.read().expect("descripted poisoned").worksum
    }

    pub fn grid_entry(&self, slot: BatchSlot) -> Option<BlockHeader> {
        self.inner.read().expect("descripted poisoned").grid.at(slot).copied()
    }

    pub fn grid_slots(&self) -> usize {
        self.inner.read().expect("descripted poisoned").grid.slots()
    }

    pub fn with_grid<R>(&self, f: impl FnOnce(&Grid) -> R) -> R {
        f(&self.inner.read().expect("descripted poisoned").grid)
    }

    pub fn clone_grid(&self) -> Grid {
        self.inner.read().expect("descripted poisoned").grid.clone()
    }

    /// Applies an append announcement: the length must grow, the worksum must grow, and the grid
    /// suffix must cover exactly the new complete batches.
    pub fn apply_append(&self, msg: &AppendMsg) -> Result<(), ProtocolError> {
        let mut inner = self.inner.write().expect("descripted poisoned");
        if msg.new_length.height() <= inner.chain_length || msg.worksum <= inner.worksum {
            return Err(ProtocolError::Malformed);
        }
        let new_complete = msg.new_length.complete_batches();
        if inner.grid.slots() + msg.grid.slots() != new_complete {
            return Err(ProtocolError::GridMismatch);
        }
        inner.grid.extend(&msg.grid);
        inner.chain_length = msg.new_length.height();
        inner.worksum = msg.worksum;
        Ok(())
    }
}

impl std::fmt::Debug for Descripted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descripted")
            .field("descriptor", &self.descriptor)
            .field("chain_length", &self.chain_length())
            .field("expired", &self.expired())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use warthog_common_types::{NonzeroHeight, HEADER_BATCH_SIZE};

    use super::*;
    use crate::test_utils::chain_of;

    #[test]
    fn append_extends_grid_by_new_complete_batches() {
        let headers = chain_of(3, 1_600_000_000);
        let d = Descripted::new(
            Descriptor::new(1),
            Height::new(HEADER_BATCH_SIZE),
            Worksum::from_u256(1000u64.into()),
            Grid::from_entries(vec![headers[0]]),
        );
        let msg = AppendMsg {
            new_length: NonzeroHeight::assert(2 * HEADER_BATCH_SIZE + 5),
            worksum: Worksum::from_u256(2000u64.into()),
            grid: Grid::from_entries(vec![headers[1]]),
        };
        d.apply_append(&msg).unwrap();
        assert_eq!(d.chain_length().value(), 2 * HEADER_BATCH_SIZE + 5);
        assert_eq!(d.grid_slots(), 2);
    }

    #[test]
    fn append_must_grow() {
        let d = Descripted::new(
            Descriptor::new(1),
            Height::new(100),
            Worksum::from_u256(1000u64.into()),
            Grid::new(),
        );
        let msg = AppendMsg {
            new_length: NonzeroHeight::assert(100),
            worksum: Worksum::from_u256(2000u64.into()),
            grid: Grid::new(),
        };
        assert_eq!(d.apply_append(&msg).unwrap_err(), ProtocolError::Malformed);
    }

    #[test]
    fn append_with_wrong_grid_suffix_rejected() {
        let headers = chain_of(2, 1_600_000_000);
        let d = Descripted::new(
            Descriptor::new(1),
            Height::new(100),
            Worksum::from_u256(1000u64.into()),
            Grid::new(),
        );
        let msg = AppendMsg {
            new_length: NonzeroHeight::assert(HEADER_BATCH_SIZE + 1),
            worksum: Worksum::from_u256(2000u64.into()),
            grid: Grid::from_entries(vec![headers[0], headers[1]]),
        };
        assert_eq!(d.apply_append(&msg).unwrap_err(), ProtocolError::GridMismatch);
    }

    #[test]
    fn expiry_flag() {
        let d = Descripted::new(Descriptor::new(4), Height::new(1), Worksum::zero(), Grid::new());
        assert!(!d.expired());
        d.expire();
        assert!(d.expired());
    }
}
