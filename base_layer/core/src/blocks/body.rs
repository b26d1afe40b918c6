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

use sha2::{Digest, Sha256};
use warthog_common_types::NonzeroHeight;

use crate::{
    blocks::{BlockHash, BlockHeader},
    consensus::{MAX_BLOCK_SIZE, MERKLE_PREFIX_V2_HEIGHT},
};

const MERKLE_LEAF_CHUNK: usize = 32;

/// A block body, opaque to the sync core except for its size bound and the merkle root
/// computation that ties it to a staged header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockBody {
    bytes: Vec<u8>,
}

impl BlockBody {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn within_size_limit(&self) -> bool {
        self.bytes.len() <= MAX_BLOCK_SIZE
    }

    fn merkle_leaves(&self) -> Vec<[u8; 32]> {
        if self.bytes.is_empty() {
            return vec![Sha256::digest([]).into()];
        }
        self.bytes
            .chunks(MERKLE_LEAF_CHUNK)
            .map(|chunk| Sha256::digest(chunk).into())
            .collect()
    }

    /// SHA-256 binary merkle tree over the body. The final round, where the tree collapses to
    /// one node, additionally hashes in the first ten raw body bytes (four below the legacy
    /// version gate height).
    pub fn merkle_root(&self, height: NonzeroHeight) -> BlockHash {
        let prefix_len = if height.value() >= MERKLE_PREFIX_V2_HEIGHT { 10 } else { 4 };
        let prefix = &self.bytes[..prefix_len.min(self.bytes.len())];

        let mut level = self.merkle_leaves();
        loop {
            let parents = (level.len() + 1) / 2;
            let mut next: Vec<[u8; 32]> = Vec::with_capacity(parents);
            for pair in level.chunks(2) {
                let mut hasher = Sha256::new();
                hasher.update(pair[0]);
                if pair.len() > 1 {
                    hasher.update(pair[1]);
                }
                if parents == 1 {
                    hasher.update(prefix);
                }
                next.push(hasher.finalize().into());
            }
            if next.len() == 1 {
                return BlockHash::from(next[0]);
            }
            level = next;
        }
    }
}

/// One downloaded block, bound to the height and staged header it was validated against.
#[derive(Debug, Clone)]
pub struct BlockBundle {
    pub height: NonzeroHeight,
    pub header: BlockHeader,
    pub body: BlockBody,
}

#[cfg(test)]
mod test {
    use super::*;

    fn height(h: u32) -> NonzeroHeight {
        NonzeroHeight::assert(h)
    }

    #[test]
    fn root_is_deterministic() {
        let body = BlockBody::new(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(body.merkle_root(height(1)), body.merkle_root(height(1)));
    }

    #[test]
    fn root_depends_on_content() {
        let a = BlockBody::new(vec![1u8; 100]);
        let b = BlockBody::new(vec![2u8; 100]);
        assert_ne!(a.merkle_root(height(1)), b.merkle_root(height(1)));
    }

    #[test]
    fn version_gate_changes_prefix_length() {
        let body = BlockBody::new((0u8..200).collect());
        let legacy = body.merkle_root(height(MERKLE_PREFIX_V2_HEIGHT - 1));
        let current = body.merkle_root(height(MERKLE_PREFIX_V2_HEIGHT));
        assert_ne!(legacy, current);
    }

    #[test]
    fn single_leaf_still_includes_prefix() {
        // a body smaller than one chunk collapses immediately; the prefix must still be mixed in
        let body = BlockBody::new(vec![0xAB; 8]);
        let tweaked = BlockBody::new(vec![0xAC; 8]);
        assert_ne!(body.merkle_root(height(1)), tweaked.merkle_root(height(1)));
    }

    #[test]
    fn size_limit() {
        assert!(BlockBody::new(vec![0; MAX_BLOCK_SIZE]).within_size_limit());
        assert!(!BlockBody::new(vec![0; MAX_BLOCK_SIZE + 1]).within_size_limit());
    }
}
