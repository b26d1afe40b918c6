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

use warthog_common_types::{BatchSlot, Height, HEADER_BATCH_SIZE};

use crate::{
    blocks::{BlockHeader, HEADER_SIZE},
    consensus::Checkpoint,
    message::ProtocolError,
    proof_of_work::Worksum,
};

/// A contiguous run of up to `HEADER_BATCH_SIZE` headers. A *complete* batch has exactly
/// `HEADER_BATCH_SIZE` headers and is shareable through the batch registry under its last
/// header's 80 raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch {
    headers: Vec<BlockHeader>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_headers(headers: Vec<BlockHeader>) -> Result<Self, ProtocolError> {
        if headers.len() > HEADER_BATCH_SIZE as usize {
            return Err(ProtocolError::BatchOversized);
        }
        Ok(Self { headers })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() % HEADER_SIZE != 0 {
            return Err(ProtocolError::Malformed);
        }
        if bytes.len() > HEADER_SIZE * HEADER_BATCH_SIZE as usize {
            return Err(ProtocolError::BatchOversized);
        }
        let headers = bytes
            .chunks_exact(HEADER_SIZE)
            .map(|c| BlockHeader::parse_slice(c).expect("chunk is 80 bytes"))
            .collect();
        Ok(Self { headers })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.headers.len() * HEADER_SIZE);
        for h in &self.headers {
            out.extend_from_slice(h.as_bytes());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.headers.len() == HEADER_BATCH_SIZE as usize
    }

    pub fn get(&self, index: usize) -> Option<&BlockHeader> {
        self.headers.get(index)
    }

    pub fn first(&self) -> Option<&BlockHeader> {
        self.headers.first()
    }

    pub fn last(&self) -> Option<&BlockHeader> {
        self.headers.last()
    }

    pub fn headers(&self) -> &[BlockHeader] {
        &self.headers
    }

    pub fn push(&mut self, header: BlockHeader) {
        debug_assert!(self.headers.len() < HEADER_BATCH_SIZE as usize);
        self.headers.push(header);
    }

    pub fn append_batch(&mut self, other: &Batch) {
        self.headers.extend_from_slice(&other.headers);
    }

    pub fn shrink(&mut self, elements: usize) {
        debug_assert!(elements <= self.headers.len());
        self.headers.truncate(elements);
    }

    pub fn clear(&mut self) {
        self.headers.clear();
    }

    /// Each header must link to the hash of its predecessor within the batch.
    pub fn valid_inner_links(&self) -> bool {
        self.headers
            .windows(2)
            .all(|pair| pair[1].prev_hash() == pair[0].hash())
    }

    /// Sum of per-block work of the first `max_elements` headers, by each header's own target.
    /// `offset` is the chain length right below this batch, kept for parity with callers that
    /// reason in absolute heights.
    pub fn worksum(&self, _offset: Height, max_elements: u32) -> Worksum {
        self.headers
            .iter()
            .take(max_elements as usize)
            .fold(Worksum::zero(), |acc, h| acc + Worksum::from_target(h.target()))
    }

    pub fn total_worksum(&self) -> Worksum {
        self.worksum(Height::zero(), HEADER_BATCH_SIZE)
    }
}

/// One last-header per complete batch of a chain: a sparse fingerprint allowing fork discovery
/// between any two chains with one equality comparison per slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Grid {
    entries: Vec<BlockHeader>,
}

impl Grid {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<BlockHeader>) -> Self {
        Self { entries }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() % HEADER_SIZE != 0 {
            return Err(ProtocolError::Malformed);
        }
        let entries = bytes
            .chunks_exact(HEADER_SIZE)
            .map(|c| BlockHeader::parse_slice(c).expect("chunk is 80 bytes"))
            .collect();
        Ok(Self { entries })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * HEADER_SIZE);
        for h in &self.entries {
            out.extend_from_slice(h.as_bytes());
        }
        out
    }

    pub fn slots(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn slot_end(&self) -> BatchSlot {
        BatchSlot::new(self.entries.len() as u32)
    }

    pub fn at(&self, slot: BatchSlot) -> Option<&BlockHeader> {
        self.entries.get(slot.index())
    }

    pub fn entries(&self) -> &[BlockHeader] {
        &self.entries
    }

    pub fn push(&mut self, header: BlockHeader) {
        self.entries.push(header);
    }

    pub fn shrink(&mut self, slots: usize) {
        debug_assert!(slots <= self.entries.len());
        self.entries.truncate(slots);
    }

    pub fn extend(&mut self, suffix: &Grid) {
        self.entries.extend_from_slice(&suffix.entries);
    }

    /// Covered heights end: one past the last header the grid vouches for.
    pub fn covered_length(&self) -> Height {
        self.slot_end().offset()
    }

    /// The grid's entry at the last covered slot, as a chain pin.
    pub fn back_pin(&self) -> Option<ChainPin> {
        self.entries.last().map(|h| ChainPin {
            height: self.covered_length(),
            header: *h,
        })
    }

    /// A grid is checkpoint-valid when, if it covers the checkpoint slot, its entry there
    /// hashes to the checkpoint.
    pub fn valid_checkpoint(&self, checkpoint: Option<&Checkpoint>) -> bool {
        match checkpoint {
            Some(cp) => match self.at(cp.slot) {
                Some(entry) => entry.hash() == cp.header_hash,
                None => true,
            },
            None => true,
        }
    }
}

/// Assertion that a chain carries `header` as its block at height `height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPin {
    pub height: Height,
    pub header: BlockHeader,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{blocks::BlockHash, proof_of_work::Target, test_utils::chain_of};

    #[test]
    fn parse_rejects_unaligned_bytes() {
        assert!(Batch::parse(&[0u8; 79]).is_err());
        assert!(Batch::parse(&[0u8; 160]).is_ok());
        assert!(Grid::parse(&[0u8; 81]).is_err());
    }

    #[test]
    fn parse_rejects_oversized_batch() {
        let bytes = vec![0u8; HEADER_SIZE * (HEADER_BATCH_SIZE as usize + 1)];
        assert!(matches!(Batch::parse(&bytes), Err(ProtocolError::BatchOversized)));
    }

    #[test]
    fn inner_links() {
        let headers = chain_of(5, 1_700_000_000);
        let batch = Batch::from_headers(headers.clone()).unwrap();
        assert!(batch.valid_inner_links());

        let mut broken = headers;
        broken[3] = BlockHeader::new(
            BlockHash::from([1u8; 32]),
            Target::genesis(),
            BlockHash::zero(),
            1,
            1_700_000_060,
            0,
        );
        let batch = Batch::from_headers(broken).unwrap();
        assert!(!batch.valid_inner_links());
    }

    #[test]
    fn worksum_counts_each_header_once() {
        let batch = Batch::from_headers(chain_of(4, 1_700_000_000)).unwrap();
        let per_block = Worksum::from_target(Target::genesis());
        assert_eq!(batch.worksum(Height::zero(), 4), per_block * 4);
        assert_eq!(batch.worksum(Height::zero(), 2), per_block * 2);
    }

    #[test]
    fn checkpoint_validation() {
        let headers = chain_of(3, 1_700_000_000);
        let grid = Grid::from_entries(headers.clone());
        let good = Checkpoint {
            slot: BatchSlot::new(1),
            header_hash: headers[1].hash(),
        };
        let bad = Checkpoint {
            slot: BatchSlot::new(1),
            header_hash: headers[2].hash(),
        };
        let uncovered = Checkpoint {
            slot: BatchSlot::new(9),
            header_hash: headers[0].hash(),
        };
        assert!(grid.valid_checkpoint(None));
        assert!(grid.valid_checkpoint(Some(&good)));
        assert!(!grid.valid_checkpoint(Some(&bad)));
        assert!(grid.valid_checkpoint(Some(&uncovered)));
    }
}
