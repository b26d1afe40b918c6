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

use std::fmt::{self, Debug, Formatter};

use sha2::{Digest, Sha256};
use thiserror::Error;
use warthog_common_types::types::BlockHash;

use crate::proof_of_work::Target;

pub const HEADER_SIZE: usize = 80;

const OFFSET_PREV_HASH: usize = 0;
const OFFSET_TARGET: usize = 32;
const OFFSET_MERKLE_ROOT: usize = 36;
const OFFSET_VERSION: usize = 68;
const OFFSET_TIMESTAMP: usize = 72;
const OFFSET_NONCE: usize = 76;

#[derive(Debug, Error)]
#[error("block header must be exactly {HEADER_SIZE} bytes")]
pub struct HeaderParseError;

/// A fixed 80-byte block header: prev-hash (32) · target (4) · merkle-root (32) · version (4) ·
/// timestamp (4) · nonce (4), all integers big-endian. Headers chain by prev-hash equality; the
/// 80 raw bytes are also the content address under which complete batches are registered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHeader([u8; HEADER_SIZE]);

impl BlockHeader {
    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn parse_slice(bytes: &[u8]) -> Result<Self, HeaderParseError> {
        let arr: [u8; HEADER_SIZE] = bytes.try_into().map_err(|_| HeaderParseError)?;
        Ok(Self(arr))
    }

    pub fn new(
        prev_hash: BlockHash,
        target: Target,
        merkle_root: BlockHash,
        version: u32,
        timestamp: u32,
        nonce: u32,
    ) -> Self {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[OFFSET_PREV_HASH..OFFSET_TARGET].copy_from_slice(prev_hash.as_bytes());
        bytes[OFFSET_TARGET..OFFSET_MERKLE_ROOT].copy_from_slice(&target.raw().to_be_bytes());
        bytes[OFFSET_MERKLE_ROOT..OFFSET_VERSION].copy_from_slice(merkle_root.as_bytes());
        bytes[OFFSET_VERSION..OFFSET_TIMESTAMP].copy_from_slice(&version.to_be_bytes());
        bytes[OFFSET_TIMESTAMP..OFFSET_NONCE].copy_from_slice(&timestamp.to_be_bytes());
        bytes[OFFSET_NONCE..HEADER_SIZE].copy_from_slice(&nonce.to_be_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.0
    }

    pub fn prev_hash(&self) -> BlockHash {
        BlockHash::try_from_slice(&self.0[OFFSET_PREV_HASH..OFFSET_TARGET]).expect("fixed 32-byte slice")
    }

    pub fn target(&self) -> Target {
        Target::from_raw(self.read_u32(OFFSET_TARGET))
    }

    pub fn merkle_root(&self) -> BlockHash {
        BlockHash::try_from_slice(&self.0[OFFSET_MERKLE_ROOT..OFFSET_VERSION]).expect("fixed 32-byte slice")
    }

    pub fn version(&self) -> u32 {
        self.read_u32(OFFSET_VERSION)
    }

    pub fn timestamp(&self) -> u32 {
        self.read_u32(OFFSET_TIMESTAMP)
    }

    pub fn nonce(&self) -> u32 {
        self.read_u32(OFFSET_NONCE)
    }

    /// Double SHA-256 over the 80 raw bytes.
    pub fn hash(&self) -> BlockHash {
        let first = Sha256::digest(self.0);
        let second = Sha256::digest(first);
        BlockHash::try_from_slice(&second).expect("sha256 output is 32 bytes")
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_be_bytes(self.0[offset..offset + 4].try_into().expect("fixed 4-byte slice"))
    }
}

impl Debug for BlockHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("prev_hash", &self.prev_hash())
            .field("target", &self.target())
            .field("timestamp", &self.timestamp())
            .field("nonce", &self.nonce())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_header() -> BlockHeader {
        let mut prev = [7u8; 32];
        prev[0] = 1;
        BlockHeader::new(
            BlockHash::from(prev),
            Target::genesis(),
            BlockHash::from([9u8; 32]),
            2,
            1_700_000_000,
            0xdead_beef,
        )
    }

    #[test]
    fn serialize_parse_round_trip_is_identical() {
        let header = sample_header();
        let bytes = *header.as_bytes();
        let parsed = BlockHeader::parse_slice(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.as_bytes(), &bytes);
    }

    #[test]
    fn field_accessors() {
        let header = sample_header();
        assert_eq!(header.prev_hash().as_bytes()[1], 7);
        assert_eq!(header.target(), Target::genesis());
        assert_eq!(header.merkle_root(), BlockHash::from([9u8; 32]));
        assert_eq!(header.version(), 2);
        assert_eq!(header.timestamp(), 1_700_000_000);
        assert_eq!(header.nonce(), 0xdead_beef);
    }

    #[test]
    fn hash_commits_to_every_byte() {
        let header = sample_header();
        let mut bytes = *header.as_bytes();
        bytes[79] ^= 1;
        let tweaked = BlockHeader::from_bytes(bytes);
        assert_ne!(header.hash(), tweaked.hash());
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(BlockHeader::parse_slice(&[0u8; 79]).is_err());
        assert!(BlockHeader::parse_slice(&[0u8; 81]).is_err());
    }
}
