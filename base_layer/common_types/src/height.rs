// Copyright 2023. The Warthog Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::{
    fmt,
    fmt::{Display, Formatter},
    ops::{Add, AddAssign, Sub},
};

use serde::{Deserialize, Serialize};

/// Number of headers per complete header batch; batches are requestable at offsets that are
/// multiples of this number.
pub const HEADER_BATCH_SIZE: u32 = 8640;

/// Maximal number of block bodies in one block batch request.
pub const BLOCK_BATCH_SIZE: u32 = 30;

/// A zero-based block index. Height zero refers to the genesis predecessor (the chain of length
/// zero); the first mined block has height one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Height(u32);

impl Height {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Number of complete header batches below this height.
    pub const fn complete_batches(self) -> usize {
        (self.0 / HEADER_BATCH_SIZE) as usize
    }

    /// Number of headers in the trailing incomplete batch.
    pub const fn incomplete_batch_size(self) -> usize {
        (self.0 % HEADER_BATCH_SIZE) as usize
    }

    pub const fn add1(self) -> NonzeroHeight {
        NonzeroHeight(self.0 + 1)
    }

    pub const fn one_if_zero(self) -> NonzeroHeight {
        if self.0 == 0 {
            NonzeroHeight(1)
        } else {
            NonzeroHeight(self.0)
        }
    }

    pub fn nonzero(self) -> Option<NonzeroHeight> {
        NonzeroHeight::new(self.0)
    }

    pub fn nonzero_assert(self) -> NonzeroHeight {
        self.nonzero().expect("height must be nonzero here")
    }

    pub fn checked_sub(self, rhs: u32) -> Option<Height> {
        self.0.checked_sub(rhs).map(Height)
    }

    pub fn saturating_sub(self, rhs: u32) -> Height {
        Height(self.0.saturating_sub(rhs))
    }
}

impl Add<u32> for Height {
    type Output = Height;

    fn add(self, rhs: u32) -> Height {
        Height(self.0 + rhs)
    }
}

impl AddAssign<u32> for Height {
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl Sub<u32> for Height {
    type Output = Height;

    fn sub(self, rhs: u32) -> Height {
        Height(self.0 - rhs)
    }
}

impl Sub<Height> for Height {
    type Output = u32;

    fn sub(self, rhs: Height) -> u32 {
        self.0 - rhs.0
    }
}

impl Display for Height {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A block index known to be at least one, i.e. the height of an actual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NonzeroHeight(u32);

impl NonzeroHeight {
    /// Sentinel for "unbounded", used by fork ranges with an open upper end.
    pub const MAX: NonzeroHeight = NonzeroHeight(u32::MAX);

    pub fn new(value: u32) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Panics if `value` is zero.
    pub fn assert(value: u32) -> Self {
        Self::new(value).expect("height must be nonzero here")
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn height(self) -> Height {
        Height(self.0)
    }

    pub const fn prev(self) -> Height {
        Height(self.0 - 1)
    }

    pub const fn complete_batches(self) -> usize {
        Height(self.0).complete_batches()
    }

    pub const fn incomplete_batch_size(self) -> usize {
        Height(self.0).incomplete_batch_size()
    }

    pub fn subtract_clamp1(self, rhs: u32) -> NonzeroHeight {
        if self.0 > rhs {
            NonzeroHeight(self.0 - rhs)
        } else {
            NonzeroHeight(1)
        }
    }

    pub fn checked_add(self, rhs: u32) -> Option<NonzeroHeight> {
        self.0.checked_add(rhs).map(NonzeroHeight)
    }
}

impl From<NonzeroHeight> for Height {
    fn from(h: NonzeroHeight) -> Self {
        h.height()
    }
}

impl Add<u32> for NonzeroHeight {
    type Output = NonzeroHeight;

    fn add(self, rhs: u32) -> NonzeroHeight {
        NonzeroHeight(self.0 + rhs)
    }
}

impl Sub<NonzeroHeight> for NonzeroHeight {
    type Output = u32;

    fn sub(self, rhs: NonzeroHeight) -> u32 {
        self.0 - rhs.0
    }
}

impl PartialEq<Height> for NonzeroHeight {
    fn eq(&self, other: &Height) -> bool {
        self.0 == other.value()
    }
}

impl PartialEq<NonzeroHeight> for Height {
    fn eq(&self, other: &NonzeroHeight) -> bool {
        self.value() == other.0
    }
}

impl PartialOrd<Height> for NonzeroHeight {
    fn partial_cmp(&self, other: &Height) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.value())
    }
}

impl PartialOrd<NonzeroHeight> for Height {
    fn partial_cmp(&self, other: &NonzeroHeight) -> Option<std::cmp::Ordering> {
        self.value().partial_cmp(&other.0)
    }
}

impl Display for NonzeroHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based index of a complete header batch within a chain. The batch covering heights
/// `[1, HEADER_BATCH_SIZE]` has slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchSlot(u32);

impl BatchSlot {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn of_height(h: NonzeroHeight) -> Self {
        Self((h.value() - 1) / HEADER_BATCH_SIZE)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Chain length right below this batch.
    pub const fn offset(self) -> Height {
        Height(self.0 * HEADER_BATCH_SIZE)
    }

    pub const fn lower(self) -> NonzeroHeight {
        NonzeroHeight(self.0 * HEADER_BATCH_SIZE + 1)
    }

    pub const fn upper(self) -> NonzeroHeight {
        NonzeroHeight((self.0 + 1) * HEADER_BATCH_SIZE)
    }
}

impl Add<u32> for BatchSlot {
    type Output = BatchSlot;

    fn add(self, rhs: u32) -> BatchSlot {
        BatchSlot(self.0 + rhs)
    }
}

impl Sub<BatchSlot> for BatchSlot {
    type Output = u32;

    fn sub(self, rhs: BatchSlot) -> u32 {
        self.0 - rhs.0
    }
}

impl Display for BatchSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zero-based index of a block-body batch within a chain, `BLOCK_BATCH_SIZE` bodies each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSlot(u32);

impl BlockSlot {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn of_height(h: NonzeroHeight) -> Self {
        Self((h.value() - 1) / BLOCK_BATCH_SIZE)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn height_offset(self) -> Height {
        Height(self.0 * BLOCK_BATCH_SIZE)
    }

    pub const fn lower_height(self) -> NonzeroHeight {
        NonzeroHeight(self.0 * BLOCK_BATCH_SIZE + 1)
    }

    pub const fn upper_height(self) -> NonzeroHeight {
        NonzeroHeight((self.0 + 1) * BLOCK_BATCH_SIZE)
    }
}

impl Add<u32> for BlockSlot {
    type Output = BlockSlot;

    fn add(self, rhs: u32) -> BlockSlot {
        BlockSlot(self.0 + rhs)
    }
}

impl Sub<BlockSlot> for BlockSlot {
    type Output = u32;

    fn sub(self, rhs: BlockSlot) -> u32 {
        self.0 - rhs.0
    }
}

impl Display for BlockSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_partitioning() {
        assert_eq!(Height::new(0).complete_batches(), 0);
        assert_eq!(Height::new(HEADER_BATCH_SIZE - 1).complete_batches(), 0);
        assert_eq!(Height::new(HEADER_BATCH_SIZE).complete_batches(), 1);
        assert_eq!(Height::new(HEADER_BATCH_SIZE).incomplete_batch_size(), 0);
        assert_eq!(Height::new(HEADER_BATCH_SIZE + 7).incomplete_batch_size(), 7);
    }

    #[test]
    fn batch_slot_bounds() {
        let s = BatchSlot::of_height(NonzeroHeight::assert(1));
        assert_eq!(s, BatchSlot::new(0));
        assert_eq!(s.lower().value(), 1);
        assert_eq!(s.upper().value(), HEADER_BATCH_SIZE);

        let s = BatchSlot::of_height(NonzeroHeight::assert(HEADER_BATCH_SIZE));
        assert_eq!(s, BatchSlot::new(0));
        let s = BatchSlot::of_height(NonzeroHeight::assert(HEADER_BATCH_SIZE + 1));
        assert_eq!(s, BatchSlot::new(1));
        assert_eq!(s.offset().value(), HEADER_BATCH_SIZE);
    }

    #[test]
    fn block_slot_bounds() {
        let s = BlockSlot::of_height(NonzeroHeight::assert(31));
        assert_eq!(s, BlockSlot::new(1));
        assert_eq!(s.lower_height().value(), 31);
        assert_eq!(s.upper_height().value(), 60);
    }

    #[test]
    fn subtract_clamps_at_one() {
        assert_eq!(NonzeroHeight::assert(10).subtract_clamp1(3).value(), 7);
        assert_eq!(NonzeroHeight::assert(10).subtract_clamp1(10).value(), 1);
        assert_eq!(NonzeroHeight::assert(10).subtract_clamp1(100).value(), 1);
    }
}
