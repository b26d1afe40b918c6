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

// A small fixed set of leader nodes signs chain snapshots as a defense against deep rollbacks
// from selfish mining in the network's early phase.

use std::fmt::{self, Debug, Formatter};

use warthog_common_types::{Height, NonzeroHeight};

use crate::{
    blocks::BlockHash,
    chain::header_chain::{ChainSkeleton, HeaderChain},
    message::ProtocolError,
};

pub const SIGNATURE_SIZE: usize = 65;
pub const SNAPSHOT_WIRE_SIZE: usize = 4 + 32 + SIGNATURE_SIZE;
pub const LEADER_COUNT: u16 = 8;

/// A 65-byte recoverable signature, opaque to the sync core.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature(pub [u8; SIGNATURE_SIZE]);

impl Debug for RecoverableSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RecoverableSignature({}…)", hex::encode(&self.0[..8]))
    }
}

/// Rank of a snapshot: the signing leader's index in the fixed leader key list, then the
/// asserted height. Higher priority wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct SnapshotPriority {
    pub importance: u16,
    pub height: Height,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NonzeroSnapshotPriority {
    pub importance: u16,
    pub height: NonzeroHeight,
}

impl From<NonzeroSnapshotPriority> for SnapshotPriority {
    fn from(p: NonzeroSnapshotPriority) -> Self {
        Self {
            importance: p.importance,
            height: p.height.height(),
        }
    }
}

/// Seam to the signature identity of snapshot leaders: recovers the signing key from
/// `(hash, signature)` and maps it to its index in the fixed leader list. Unknown keys are
/// rejected.
pub trait SnapshotAuthority: Send + Sync {
    fn importance(&self, hash: &BlockHash, signature: &RecoverableSignature) -> Result<u16, ProtocolError>;
}

/// Test authority deriving the leader index from the first signature byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstByteAuthority;

impl SnapshotAuthority for FirstByteAuthority {
    fn importance(&self, _hash: &BlockHash, signature: &RecoverableSignature) -> Result<u16, ProtocolError> {
        let index = u16::from(signature.0[0]);
        if index < LEADER_COUNT {
            Ok(index)
        } else {
            Err(ProtocolError::BadLeader)
        }
    }
}

/// A leader-signed assertion that the block at `priority.height` has hash `hash`. A snapshot
/// persists until one with strictly greater priority arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedSnapshot {
    pub priority: NonzeroSnapshotPriority,
    pub hash: BlockHash,
    pub signature: RecoverableSignature,
}

impl SignedSnapshot {
    pub fn assemble(
        height: NonzeroHeight,
        hash: BlockHash,
        signature: RecoverableSignature,
        authority: &dyn SnapshotAuthority,
    ) -> Result<Self, ProtocolError> {
        let importance = authority.importance(&hash, &signature)?;
        Ok(Self {
            priority: NonzeroSnapshotPriority { importance, height },
            hash,
            signature,
        })
    }

    pub fn height(&self) -> NonzeroHeight {
        self.priority.height
    }

    /// A chain is compatible when it is shorter than the asserted height or carries the asserted
    /// hash there.
    pub fn compatible(&self, chain: &HeaderChain) -> bool {
        chain.length() < self.height() || chain.hash_at(self.height().height()) == self.hash
    }

    /// Compatibility check on a bare skeleton, walking shared parents as needed.
    pub fn compatible_skeleton(&self, skeleton: &ChainSkeleton) -> bool {
        if skeleton.length() < self.height() {
            return true;
        }
        skeleton
            .header_at(self.height())
            .map(|h| h.hash() == self.hash)
            .unwrap_or(false)
    }
}

impl PartialOrd for SignedSnapshot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.priority.partial_cmp(&other.priority)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn priority_orders_by_importance_then_height() {
        let a = SnapshotPriority {
            importance: 1,
            height: Height::new(100),
        };
        let b = SnapshotPriority {
            importance: 1,
            height: Height::new(200),
        };
        let c = SnapshotPriority {
            importance: 2,
            height: Height::new(1),
        };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn unknown_leader_rejected() {
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig[0] = LEADER_COUNT as u8;
        let err = SignedSnapshot::assemble(
            NonzeroHeight::assert(10),
            BlockHash::zero(),
            RecoverableSignature(sig),
            &FirstByteAuthority,
        )
        .unwrap_err();
        assert_eq!(err, ProtocolError::BadLeader);
    }

    #[test]
    fn known_leader_gets_index_importance() {
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig[0] = 3;
        let ss = SignedSnapshot::assemble(
            NonzeroHeight::assert(10),
            BlockHash::zero(),
            RecoverableSignature(sig),
            &FirstByteAuthority,
        )
        .unwrap();
        assert_eq!(ss.priority.importance, 3);
    }
}
