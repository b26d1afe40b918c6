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

use warthog_common_types::{BatchSlot, Height, NonzeroHeight};

use crate::{
    blocks::BlockHeader,
    chain::{
        batch::Grid,
        error::{ChainError, ChainErrorKind},
        header_chain::HeaderChain,
    },
};

/// Lower-bound search for the first index where two indexed sequences disagree. `eq(i)` compares
/// position `i`; the search covers `[lower, min(len1, len2))`. Returns the first differing index
/// and whether a difference was found within the common prefix (`false` means one sequence is a
/// prefix of the other up to the searched range).
pub fn binary_forksearch(
    len1: usize,
    len2: usize,
    lower: usize,
    eq: impl Fn(usize) -> bool,
) -> (usize, bool) {
    let len = len1.min(len2);
    let mut lower = lower;
    let mut upper = len;
    while upper > lower {
        let pos = lower + (upper - lower) / 2;
        if eq(pos) {
            lower = pos + 1;
        } else {
            upper = pos;
        }
    }
    (upper, upper != len)
}

/// Which bound of a fork range an operation moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub changed_lower: bool,
    pub changed_upper: bool,
}

impl Change {
    pub fn lower() -> Self {
        Self {
            changed_lower: true,
            changed_upper: false,
        }
    }

    pub fn upper() -> Self {
        Self {
            changed_lower: false,
            changed_upper: true,
        }
    }

    pub fn none() -> Self {
        Self {
            changed_lower: false,
            changed_upper: false,
        }
    }
}

/// Closed interval `[l, u]` known to contain the first height at which the local and a peer's
/// chain differ. `u == NonzeroHeight::MAX` means no divergence has been observed yet, so the
/// peer might be a strict extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkRange {
    l: NonzeroHeight,
    u: NonzeroHeight,
}

impl Default for ForkRange {
    fn default() -> Self {
        Self {
            l: NonzeroHeight::assert(1),
            u: NonzeroHeight::MAX,
        }
    }
}

impl ForkRange {
    pub fn new(lower: NonzeroHeight, upper: NonzeroHeight) -> Self {
        assert!(upper >= lower);
        Self { l: lower, u: upper }
    }

    pub fn open(lower: NonzeroHeight) -> Self {
        Self {
            l: lower,
            u: NonzeroHeight::MAX,
        }
    }

    /// Establishes the range by comparing the peer's grid against the local chain's grid,
    /// starting at `begin`.
    pub fn from_grid_match(ours: &HeaderChain, theirs: &Grid, begin: BatchSlot) -> Self {
        let (i, forked) = binary_forksearch(ours.grid_slots(), theirs.slots(), begin.index(), |i| {
            let slot = BatchSlot::new(i as u32);
            ours.grid_entry(slot).as_ref() == theirs.at(slot)
        });
        let slot = BatchSlot::new(i as u32);
        if forked {
            Self::new(slot.lower(), slot.upper())
        } else {
            Self::open(slot.lower())
        }
    }

    pub fn lower(&self) -> NonzeroHeight {
        self.l
    }

    pub fn upper(&self) -> NonzeroHeight {
        self.u
    }

    pub fn converged(&self) -> bool {
        self.l == self.u
    }

    /// Whether a mismatch has bounded the range from above.
    pub fn forked(&self) -> bool {
        self.u != NonzeroHeight::MAX
    }

    pub fn width(&self) -> u32 {
        if self.u == NonzeroHeight::MAX {
            NonzeroHeight::MAX.value()
        } else {
            self.u - self.l
        }
    }

    /// The chains are known equal at `height`.
    pub fn on_match(&mut self, height: Height) -> Result<Change, ChainError> {
        if height < self.l {
            Ok(Change::none())
        } else if height < self.u {
            self.l = (height + 1).nonzero_assert();
            Ok(Change::lower())
        } else {
            // height is nonzero in this branch because l is nonzero
            Err(ChainErrorKind::BadMatch.at(height.nonzero_assert()))
        }
    }

    /// The chains are known different at `height`.
    pub fn on_mismatch(&mut self, height: NonzeroHeight) -> Result<Change, ChainError> {
        if height < self.l {
            Err(ChainErrorKind::BadMismatch.at(height))
        } else if height < self.u {
            self.u = height;
            Ok(Change::upper())
        } else {
            Ok(Change::none())
        }
    }

    /// Compares the peer-supplied header against the local chain at `height` and applies the
    /// outcome.
    pub fn match_header(
        &mut self,
        chain: &HeaderChain,
        height: NonzeroHeight,
        header: &BlockHeader,
    ) -> Result<Change, ChainError> {
        if chain.length() < height {
            return Ok(Change::none());
        }
        if chain.header_at(height) == *header {
            self.on_match(height.height())
        } else {
            self.on_mismatch(height)
        }
    }

    fn on_fork_height(&mut self, fork_height: NonzeroHeight) {
        if fork_height < self.l {
            self.l = fork_height;
            self.u = fork_height;
        } else if fork_height <= self.u {
            self.u = NonzeroHeight::MAX;
        }
    }

    /// The peer advertised a structural change at `fork_height`; re-localize against its new
    /// grid.
    pub fn on_fork(
        &mut self,
        fork_height: NonzeroHeight,
        their_grid: &Grid,
        ours: &HeaderChain,
    ) -> Result<(), ChainError> {
        self.on_fork_height(fork_height);
        if self.forked() {
            return Ok(());
        }
        debug_assert!(self.l <= fork_height);
        self.grid_match(BatchSlot::of_height(fork_height), their_grid, ours)
    }

    fn detect_shrink(&mut self, their_length: Height, ours: &HeaderChain) -> bool {
        let min_length = their_length.min(ours.length());
        if self.l > min_length {
            self.l = min_length.one_if_zero();
            self.u = NonzeroHeight::MAX;
            return true;
        }
        if self.forked() && self.u > min_length {
            self.u = NonzeroHeight::MAX;
            return true;
        }
        false
    }

    /// One of the chains appended; tighten using the peer's grid.
    pub fn on_append(&mut self, their_grid: &Grid, ours: &HeaderChain) -> Result<(), ChainError> {
        if self.forked() {
            return Ok(());
        }
        self.grid_match(BatchSlot::of_height(self.l), their_grid, ours)
    }

    /// One of the chains may have shortened; clamp and reopen as needed.
    pub fn on_shrink(&mut self, their_length: Height, ours: &HeaderChain) {
        self.detect_shrink(their_length, ours);
    }

    pub fn on_append_or_shrink(
        &mut self,
        their_length: Height,
        their_grid: &Grid,
        ours: &HeaderChain,
    ) -> Result<(), ChainError> {
        if self.detect_shrink(their_length, ours) {
            return Ok(());
        }
        self.on_append(their_grid, ours)
    }

    fn grid_match(&mut self, begin: BatchSlot, their_grid: &Grid, ours: &HeaderChain) -> Result<(), ChainError> {
        if begin.index() >= ours.grid_slots() || begin.index() >= their_grid.slots() {
            return Ok(());
        }
        let r = ForkRange::from_grid_match(ours, their_grid, begin);
        self.on_match(r.lower().prev())?;
        if r.forked() {
            self.on_mismatch(r.upper())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use warthog_common_types::HEADER_BATCH_SIZE;

    use super::*;
    use crate::test_utils::chain_of;

    fn nz(h: u32) -> NonzeroHeight {
        NonzeroHeight::assert(h)
    }

    #[test]
    fn forksearch_finds_first_difference() {
        let a = [1, 2, 3, 4, 5];
        let b = [1, 2, 9, 4, 5];
        assert_eq!(binary_forksearch(a.len(), b.len(), 0, |i| a[i] == b[i]), (2, true));
    }

    #[test]
    fn forksearch_prefix_reports_unforked() {
        let a = [1, 2, 3];
        let b = [1, 2, 3, 4, 5];
        assert_eq!(binary_forksearch(a.len(), b.len(), 0, |i| a[i] == b[i]), (3, false));
    }

    #[test]
    fn forksearch_respects_lower_bound() {
        let a = [9, 2, 3];
        let b = [1, 2, 3];
        // position 0 is excluded from the search, ties break toward "still matching"
        assert_eq!(binary_forksearch(a.len(), b.len(), 1, |i| a[i] == b[i]), (3, false));
    }

    #[test]
    fn shared_prefix_grids_bracket_first_differing_batch() {
        // two chains share the first 3 complete batches then diverge
        let shared = chain_of(3, 1_600_000_000);
        let mut g1 = Grid::from_entries(shared.clone());
        let mut g2 = Grid::from_entries(shared);
        let divergent = chain_of(5, 1_600_500_000);
        g1.push(divergent[3]);
        g2.push(divergent[4]);

        let (i, forked) = binary_forksearch(g1.slots(), g2.slots(), 0, |i| {
            g1.entries()[i] == g2.entries()[i]
        });
        assert_eq!((i, forked), (3, true));

        let slot = BatchSlot::new(i as u32);
        let range = ForkRange::new(slot.lower(), slot.upper());
        assert_eq!(range.lower().value(), 3 * HEADER_BATCH_SIZE + 1);
        assert_eq!(range.upper().value(), 4 * HEADER_BATCH_SIZE);
    }

    #[test]
    fn match_tightens_lower_bound() {
        let mut r = ForkRange::default();
        assert_eq!(r.on_match(Height::new(10)).unwrap(), Change::lower());
        assert_eq!(r.lower().value(), 11);
        // matches below the lower bound are stale information
        assert_eq!(r.on_match(Height::new(5)).unwrap(), Change::none());
        assert_eq!(r.lower().value(), 11);
    }

    #[test]
    fn mismatch_tightens_upper_bound() {
        let mut r = ForkRange::default();
        assert_eq!(r.on_mismatch(nz(100)).unwrap(), Change::upper());
        assert_eq!(r.upper().value(), 100);
        assert_eq!(r.on_mismatch(nz(200)).unwrap(), Change::none());
        assert_eq!(r.upper().value(), 100);
    }

    #[test]
    fn match_above_mismatch_is_an_offense() {
        let mut r = ForkRange::default();
        r.on_mismatch(nz(50)).unwrap();
        let err = r.on_match(Height::new(50)).unwrap_err();
        assert_eq!(err.kind, ChainErrorKind::BadMatch);
    }

    #[test]
    fn mismatch_below_match_is_an_offense() {
        let mut r = ForkRange::default();
        r.on_match(Height::new(50)).unwrap();
        let err = r.on_mismatch(nz(30)).unwrap_err();
        assert_eq!(err.kind, ChainErrorKind::BadMismatch);
    }

    #[test]
    fn converges_to_single_height() {
        let mut r = ForkRange::default();
        r.on_match(Height::new(41)).unwrap();
        r.on_mismatch(nz(42)).unwrap();
        assert!(r.converged());
        assert_eq!(r.lower(), r.upper());
        assert_eq!(r.lower().value(), 42);
    }

    #[test]
    fn fork_below_lower_collapses() {
        let mut r = ForkRange::default();
        r.on_match(Height::new(100)).unwrap();
        r.on_fork_height(nz(40));
        assert!(r.converged());
        assert_eq!(r.lower().value(), 40);
    }

    #[test]
    fn fork_inside_range_reopens_upper() {
        let mut r = ForkRange::default();
        r.on_match(Height::new(10)).unwrap();
        r.on_mismatch(nz(50)).unwrap();
        r.on_fork_height(nz(30));
        assert!(!r.forked());
        assert_eq!(r.lower().value(), 11);
    }

    #[test]
    fn fork_above_range_is_ignored() {
        let mut r = ForkRange::default();
        r.on_match(Height::new(10)).unwrap();
        r.on_mismatch(nz(50)).unwrap();
        r.on_fork_height(nz(90));
        assert!(r.forked());
        assert_eq!(r.upper().value(), 50);
    }

    #[test]
    fn invariant_lower_at_most_upper() {
        let mut r = ForkRange::default();
        r.on_match(Height::new(7)).unwrap();
        r.on_mismatch(nz(9)).unwrap();
        r.on_match(Height::new(8)).unwrap();
        assert!(r.lower() <= r.upper());
        assert!(r.converged());
    }
}
