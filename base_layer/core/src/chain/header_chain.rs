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

use warthog_common_types::{BatchSlot, Descriptor, Height, NonzeroHeight, HEADER_BATCH_SIZE};

use crate::{
    blocks::{genesis_hash, BlockHash, BlockHeader},
    chain::{
        batch::{Batch, Grid},
        batch_registry::SharedBatch,
        fork_range::binary_forksearch,
    },
    consensus::retarget_floor,
    message::{AppendMsg, ForkMsg},
    proof_of_work::Worksum,
};

/// First height at which two chains differ. `forked == false` means one chain is a strict prefix
/// of the other and `height` is one past the shorter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkHeight {
    pub height: NonzeroHeight,
    pub forked: bool,
}

impl ForkHeight {
    pub fn unforked_start() -> Self {
        Self {
            height: NonzeroHeight::assert(1),
            forked: false,
        }
    }
}

/// The minimal owning representation of a chain: a handle to its last complete batch (the whole
/// prefix hangs off its parent links) plus the trailing incomplete batch.
#[derive(Debug, Clone, Default)]
pub struct ChainSkeleton {
    pub final_pin: Option<SharedBatch>,
    pub incomplete: Batch,
}

impl ChainSkeleton {
    pub fn new(final_pin: Option<SharedBatch>, incomplete: Batch) -> Self {
        Self { final_pin, incomplete }
    }

    pub fn length(&self) -> Height {
        let pinned = self
            .final_pin
            .as_ref()
            .map(|p| p.upper_height())
            .unwrap_or(Height::zero());
        pinned + self.incomplete.len() as u32
    }

    /// Header lookup walking shared parents; linear in the number of batches below.
    pub fn header_at(&self, height: NonzeroHeight) -> Option<BlockHeader> {
        match &self.final_pin {
            Some(pin) if height <= pin.upper_height() => pin.header_at_recursive(height),
            Some(pin) => self
                .incomplete
                .get((height.height() - pin.upper_height() - 1) as usize)
                .copied(),
            None => self.incomplete.get((height.value() - 1) as usize).copied(),
        }
    }

    pub fn total_work(&self) -> Worksum {
        let pinned = self
            .final_pin
            .as_ref()
            .map(|p| p.total_work())
            .unwrap_or_else(Worksum::zero);
        pinned + self.incomplete.total_worksum()
    }
}

/// Chain suffix handed over on an append: the new complete batches and the new tail.
#[derive(Debug, Clone)]
pub struct HeaderChainAppend {
    pub complete: Vec<SharedBatch>,
    pub incomplete: Batch,
}

/// Chain suffix replacing everything above `shrink_length`.
#[derive(Debug, Clone)]
pub struct HeaderChainFork {
    pub complete: Vec<SharedBatch>,
    pub incomplete: Batch,
    pub shrink_length: Height,
    pub descriptor: Descriptor,
}

/// An ordered sequence of verified headers: shared handles to complete batches plus one unshared
/// incomplete tail. The cached cumulative worksum is revalidated against an independent
/// sum-of-blocks computation on every mutation.
#[derive(Debug, Clone, Default)]
pub struct HeaderChain {
    complete: Vec<SharedBatch>,
    incomplete: Batch,
    worksum: Worksum,
}

impl HeaderChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_skeleton(skeleton: ChainSkeleton) -> Self {
        let mut complete = Vec::new();
        let mut current = skeleton.final_pin.clone();
        while let Some(pin) = current {
            current = pin.prev();
            complete.push(pin);
        }
        complete.reverse();
        let mut chain = Self {
            complete,
            incomplete: skeleton.incomplete,
            worksum: Worksum::zero(),
        };
        chain.initialize_worksum();
        chain
    }

    /// Prefix of `from` with the given length.
    pub fn subchain(from: &HeaderChain, length: Height) -> Self {
        assert!(length <= from.length(), "subchain longer than source chain");
        let n_complete = length.complete_batches();
        let complete: Vec<SharedBatch> = from.complete[..n_complete].to_vec();
        let mut incomplete = if n_complete == from.complete.len() {
            from.incomplete.clone()
        } else {
            from.complete[n_complete].batch().clone()
        };
        incomplete.shrink(length.incomplete_batch_size());
        let mut chain = Self {
            complete,
            incomplete,
            worksum: Worksum::zero(),
        };
        chain.initialize_worksum();
        chain
    }

    pub fn length(&self) -> Height {
        Height::new(self.complete.len() as u32 * HEADER_BATCH_SIZE + self.incomplete.len() as u32)
    }

    pub fn total_work(&self) -> Worksum {
        self.worksum
    }

    pub fn complete_batches(&self) -> &[SharedBatch] {
        &self.complete
    }

    pub fn incomplete_batch(&self) -> &Batch {
        &self.incomplete
    }

    pub fn final_pin(&self) -> Option<&SharedBatch> {
        self.complete.last()
    }

    pub fn skeleton(&self) -> ChainSkeleton {
        ChainSkeleton {
            final_pin: self.complete.last().cloned(),
            incomplete: self.incomplete.clone(),
        }
    }

    pub fn get_header(&self, height: Height) -> Option<BlockHeader> {
        let height = height.nonzero()?;
        if height > self.length() {
            return None;
        }
        let slot = BatchSlot::of_height(height);
        let rem = (height - slot.lower()) as usize;
        if slot.index() < self.complete.len() {
            self.complete[slot.index()].batch().get(rem).copied()
        } else {
            self.incomplete.get(rem).copied()
        }
    }

    pub fn header_at(&self, height: NonzeroHeight) -> BlockHeader {
        self.get_header(height.height())
            .expect("height is within chain length")
    }

    /// Hash of the chain at `height`; height zero is the genesis predecessor hash.
    pub fn get_hash(&self, height: Height) -> Option<BlockHash> {
        if height > self.length() {
            return None;
        }
        if height.is_zero() {
            return Some(genesis_hash());
        }
        if height == self.length() {
            return Some(self.header_at(height.nonzero_assert()).hash());
        }
        Some(self.header_at((height + 1).nonzero_assert()).prev_hash())
    }

    pub fn hash_at(&self, height: Height) -> BlockHash {
        self.get_hash(height).expect("height is within chain length")
    }

    /// Grid entry (last header) of a complete batch slot.
    pub fn grid_entry(&self, slot: BatchSlot) -> Option<BlockHeader> {
        self.complete.get(slot.index()).map(|b| b.last_header())
    }

    pub fn grid_slots(&self) -> usize {
        self.complete.len()
    }

    pub fn grid(&self, from: BatchSlot) -> Grid {
        let mut grid = Grid::new();
        for pin in self.complete.iter().skip(from.index()) {
            grid.push(pin.last_header());
        }
        grid
    }

    /// The batch occupying `slot`: a complete one or the tail.
    pub fn batch_at(&self, slot: BatchSlot) -> Option<&Batch> {
        if slot.index() < self.complete.len() {
            Some(self.complete[slot.index()].batch())
        } else if slot.index() == self.complete.len() {
            Some(&self.incomplete)
        } else {
            None
        }
    }

    /// Raw headers in `[begin, end)`, clipped to the chain length, at most one batch worth.
    pub fn get_headers(&self, begin: NonzeroHeight, end: NonzeroHeight) -> Batch {
        if end <= begin {
            return Batch::new();
        }
        assert!(end - begin <= HEADER_BATCH_SIZE);
        let end = if end > self.length() {
            (self.length() + 1).nonzero_assert()
        } else {
            end
        };
        let mut headers = Vec::new();
        let mut h = begin;
        while h < end {
            let slot = BatchSlot::of_height(h);
            let batch = match self.batch_at(slot) {
                Some(b) => b,
                None => break,
            };
            let offset = (h - slot.lower()) as usize;
            let take = ((end - h) as usize).min((slot.upper() + 1 - h) as usize);
            let available = batch.len().saturating_sub(offset).min(take);
            headers.extend_from_slice(&batch.headers()[offset..offset + available]);
            if available < take {
                break;
            }
            h = h + take as u32;
        }
        Batch::from_headers(headers).expect("bounded by one batch")
    }

    pub fn get_append(&self, prev_length: Height) -> HeaderChainAppend {
        HeaderChainAppend {
            complete: self.complete[prev_length.complete_batches()..].to_vec(),
            incomplete: self.incomplete.clone(),
        }
    }

    pub fn apply_append(&mut self, append: HeaderChainAppend) -> (Height, AppendMsg) {
        let prev_worksum = self.worksum;
        let prev_length = self.length();
        assert!(!append.complete.is_empty() || !append.incomplete.is_empty());
        let batch_offset = BatchSlot::new(self.complete.len() as u32);
        self.complete.extend(append.complete);
        self.incomplete = append.incomplete;
        self.initialize_worksum();
        assert!(self.worksum > prev_worksum);
        let msg = AppendMsg {
            new_length: self.length().nonzero_assert(),
            worksum: self.worksum,
            grid: self.grid(batch_offset),
        };
        (prev_length, msg)
    }

    pub fn get_fork(&self, fork_height: NonzeroHeight, descriptor: Descriptor) -> HeaderChainFork {
        assert!(fork_height <= self.length());
        let shrink_length = fork_height.prev();
        HeaderChainFork {
            complete: self.complete[shrink_length.complete_batches()..].to_vec(),
            incomplete: self.incomplete.clone(),
            shrink_length,
            descriptor,
        }
    }

    pub fn apply_fork(&mut self, fork: HeaderChainFork) -> ForkMsg {
        let prev_worksum = self.worksum;
        assert!(!fork.complete.is_empty() || !fork.incomplete.is_empty());
        let n_complete = fork.shrink_length.complete_batches();
        self.complete.truncate(n_complete);
        let batch_offset = BatchSlot::new(self.complete.len() as u32);
        self.complete.extend(fork.complete);
        self.incomplete = fork.incomplete;
        self.initialize_worksum();
        assert!(self.worksum > prev_worksum);
        ForkMsg {
            descriptor: fork.descriptor,
            chain_length: self.length().nonzero_assert(),
            worksum: self.worksum,
            fork_height: (fork.shrink_length + 1).nonzero_assert(),
            grid: self.grid(batch_offset),
        }
    }

    /// Discards headers back to `new_length`. A cut inside a shared batch re-materializes that
    /// batch as the new unshared tail.
    pub fn shrink(&mut self, new_length: Height) {
        let prev_worksum = self.worksum;
        assert!(new_length < self.length());
        let n_incomplete = new_length.incomplete_batch_size();
        let n_complete = new_length.complete_batches();
        if n_complete == self.complete.len() {
            self.incomplete.shrink(n_incomplete);
        } else {
            self.incomplete = self.complete[n_complete].batch().clone();
            self.incomplete.shrink(n_incomplete);
            self.complete.truncate(n_complete);
        }
        self.initialize_worksum();
        assert!(self.worksum < prev_worksum);
    }

    pub fn clear(&mut self) {
        self.complete.clear();
        self.incomplete.clear();
        self.worksum = Worksum::zero();
    }

    /// Appends one verified header to the tail, sharing the tail into the registry when it
    /// completes.
    pub fn append_prepared(
        &mut self,
        prepared: &crate::chain::verifier::PreparedAppend,
        registry: &std::sync::Arc<crate::chain::batch_registry::BatchRegistry>,
    ) {
        self.worksum += Worksum::from_target(prepared.header.target());
        self.incomplete.push(prepared.header);
        if self.incomplete.is_complete() {
            let batch = std::mem::take(&mut self.incomplete);
            let pin = registry.share_with_work(batch, self.complete.last(), self.worksum);
            self.complete.push(pin);
        }
        debug_assert_eq!(
            self.worksum,
            self.sum_work(NonzeroHeight::assert(1), self.length() + 1)
        );
    }

    /// Cumulative worksum of the prefix up to `height`.
    pub fn total_work_at(&self, height: Height) -> Worksum {
        if height.is_zero() {
            return Worksum::zero();
        }
        assert!(height <= self.length());
        let slot = BatchSlot::of_height(height.nonzero_assert());
        let prev_work = if slot.index() == 0 {
            Worksum::zero()
        } else {
            self.complete[slot.index() - 1].total_work()
        };
        let batch = self.batch_at(slot).expect("slot within chain");
        let work = prev_work + batch.worksum(slot.offset(), height - slot.offset());
        debug_assert_eq!(work, self.sum_work(NonzeroHeight::assert(1), height + 1));
        work
    }

    /// Independent worksum computation over `[begin, end)` exploiting that all blocks between
    /// two retarget floors share one target.
    pub fn sum_work(&self, begin: NonzeroHeight, end: Height) -> Worksum {
        if begin >= end {
            return Worksum::zero();
        }
        assert!(end <= self.length() + 1);
        let mut sum = Worksum::zero();
        let mut upper = (end - 1).nonzero_assert();
        loop {
            let header = self.header_at(upper);
            let work = Worksum::from_target(header.target());
            let mut complete = false;
            let mut lower = match upper.prev().nonzero() {
                Some(below) => retarget_floor(below).height(),
                None => Height::zero(),
            };
            if lower == Height::new(1) {
                lower = Height::zero();
                complete = true;
            } else if lower < begin {
                lower = begin.prev();
                complete = true;
            }
            sum += work * (upper.height() - lower);
            if complete {
                return sum;
            }
            upper = lower.nonzero_assert();
        }
    }

    /// Highest height within `span` at which this chain carries the same header, if any.
    pub fn max_match_height(&self, span: &HeaderSpan<'_>) -> Option<NonzeroHeight> {
        let top = if self.length() < span.end_height().prev() {
            self.length().nonzero()?
        } else {
            span.end_height().prev().nonzero()?
        };
        let mut h = top;
        while h >= span.begin_height() {
            if self.header_at(h) == span.at(h).expect("height within span") {
                return Some(h);
            }
            match h.prev().nonzero() {
                Some(below) => h = below,
                None => break,
            }
        }
        None
    }

    fn initialize_worksum(&mut self) {
        let pinned_length = Height::new(self.complete.len() as u32 * HEADER_BATCH_SIZE);
        if let Some(pin) = self.complete.last() {
            assert!(pin.upper_height() == pinned_length);
        }
        self.worksum = self.incomplete.worksum(pinned_length, HEADER_BATCH_SIZE);
        if let Some(pin) = self.complete.last() {
            self.worksum += pin.total_work();
        }
        debug_assert_eq!(
            self.worksum,
            self.sum_work(NonzeroHeight::assert(1), self.length() + 1)
        );
    }
}

/// A batch positioned at an absolute slot, for height-addressed access to downloaded headers.
#[derive(Debug, Clone, Copy)]
pub struct HeaderSpan<'a> {
    slot: BatchSlot,
    batch: &'a Batch,
}

impl<'a> HeaderSpan<'a> {
    pub fn new(slot: BatchSlot, batch: &'a Batch) -> Self {
        Self { slot, batch }
    }

    pub fn begin_height(&self) -> NonzeroHeight {
        self.slot.lower()
    }

    /// One past the last covered height.
    pub fn end_height(&self) -> NonzeroHeight {
        self.slot.lower() + self.batch.len() as u32
    }

    pub fn at(&self, height: NonzeroHeight) -> Option<BlockHeader> {
        if height < self.begin_height() || height >= self.end_height() {
            return None;
        }
        self.batch.get((height - self.begin_height()) as usize).copied()
    }

    pub fn batch(&self) -> &'a Batch {
        self.batch
    }

    pub fn slot(&self) -> BatchSlot {
        self.slot
    }
}

/// Locates the first height at which two chains differ, starting the grid comparison at
/// `start_height`'s slot.
pub fn fork_height(a: &HeaderChain, b: &HeaderChain, start_height: NonzeroHeight) -> ForkHeight {
    let start_slot = BatchSlot::of_height(start_height);
    let (f, _) = binary_forksearch(
        a.grid_slots(),
        b.grid_slots(),
        start_slot.index(),
        |i| a.grid_entry(BatchSlot::new(i as u32)) == b.grid_entry(BatchSlot::new(i as u32)),
    );
    let slot = BatchSlot::new(f as u32);
    let empty = Batch::new();
    let b1 = a.batch_at(slot).unwrap_or(&empty);
    let b2 = b.batch_at(slot).unwrap_or(&empty);
    let (fork_index, forked) = binary_forksearch(b1.len(), b2.len(), 0, |i| b1.get(i) == b2.get(i));
    ForkHeight {
        height: NonzeroHeight::assert(f as u32 * HEADER_BATCH_SIZE + fork_index as u32 + 1),
        forked,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        chain::batch_registry::BatchRegistry,
        test_utils::{extendable_with_tail, fork_of},
    };

    #[test]
    fn empty_chain() {
        let chain = HeaderChain::new();
        assert_eq!(chain.length(), Height::zero());
        assert!(chain.total_work().is_zero());
        assert_eq!(chain.hash_at(Height::zero()), genesis_hash());
        assert!(chain.get_header(Height::new(1)).is_none());
    }

    #[test]
    fn length_counts_complete_and_tail() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 1, 5);
        let headers = chain.headers();
        assert_eq!(headers.length().value(), HEADER_BATCH_SIZE + 5);
        assert_eq!(headers.complete_batches().len(), 1);
        assert_eq!(headers.incomplete_batch().len(), 5);
    }

    #[test]
    fn worksum_matches_sum_work_invariant() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 1, 3);
        let headers = chain.headers();
        assert_eq!(
            headers.total_work(),
            headers.sum_work(NonzeroHeight::assert(1), headers.length() + 1)
        );
        assert_eq!(headers.total_work_at(headers.length()), headers.total_work());
    }

    #[test]
    fn hash_links_are_consistent() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 0, 10);
        let headers = chain.headers();
        for h in 1..=9u32 {
            let this = headers.hash_at(Height::new(h));
            let next = headers.header_at(NonzeroHeight::assert(h + 1));
            assert_eq!(next.prev_hash(), this);
        }
    }

    #[test]
    fn shrink_inside_shared_batch_rematerializes_tail() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 2, 0);
        let mut headers = chain.headers().clone();
        assert_eq!(registry.len(), 2);
        headers.shrink(Height::new(HEADER_BATCH_SIZE + 100));
        assert_eq!(headers.length().value(), HEADER_BATCH_SIZE + 100);
        assert_eq!(headers.complete_batches().len(), 1);
        assert_eq!(headers.incomplete_batch().len(), 100);
    }

    #[test]
    fn subchain_prefix() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 1, 50);
        let headers = chain.headers();
        let sub = HeaderChain::subchain(headers, Height::new(30));
        assert_eq!(sub.length().value(), 30);
        for h in 1..=30u32 {
            assert_eq!(
                sub.header_at(NonzeroHeight::assert(h)),
                headers.header_at(NonzeroHeight::assert(h))
            );
        }
    }

    #[test]
    fn fork_height_detects_divergence_point() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 0, 40);
        let forked = fork_of(&registry, chain.headers(), 21);
        let fh = fork_height(chain.headers(), forked.headers(), NonzeroHeight::assert(1));
        assert!(fh.forked);
        assert_eq!(fh.height.value(), 21);
    }

    #[test]
    fn fork_height_prefix_is_unforked() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 0, 40);
        let prefix = HeaderChain::subchain(chain.headers(), Height::new(25));
        let fh = fork_height(chain.headers(), &prefix, NonzeroHeight::assert(1));
        assert!(!fh.forked);
        assert_eq!(fh.height.value(), 26);
    }

    #[test]
    fn append_and_fork_messages_carry_grid_suffix() {
        let registry = BatchRegistry::new();
        let longer = extendable_with_tail(&registry, 2, 7);
        let shorter = HeaderChain::subchain(longer.headers(), Height::new(HEADER_BATCH_SIZE));

        let mut chain = shorter;
        let append = longer.headers().get_append(chain.length());
        let (prev_length, msg) = chain.apply_append(append);
        assert_eq!(prev_length.value(), HEADER_BATCH_SIZE);
        assert_eq!(msg.new_length.value(), 2 * HEADER_BATCH_SIZE + 7);
        assert_eq!(msg.grid.slots(), 1);
        assert_eq!(msg.worksum, chain.total_work());
    }
}
