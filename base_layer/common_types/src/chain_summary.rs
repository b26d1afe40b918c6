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

use std::fmt::{Display, Error, Formatter};

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::{height::Height, types::BlockHash};

/// Snapshot of the local consensus chain tip, reported outward by the sync core after every
/// append or fork event.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChainSummary {
    /// The current chain length (height of the tip block).
    length: Height,
    /// Hash of the tip block, or the genesis hash for an empty chain.
    tip_hash: BlockHash,
    /// Cumulative inverse-target of the chain, the consensus metric for "best chain".
    worksum: U256,
    /// Timestamp of the tip block, zero for an empty chain.
    timestamp: u32,
}

impl ChainSummary {
    pub fn new(length: Height, tip_hash: BlockHash, worksum: U256, timestamp: u32) -> Self {
        Self {
            length,
            tip_hash,
            worksum,
            timestamp,
        }
    }

    pub fn length(&self) -> Height {
        self.length
    }

    pub fn tip_hash(&self) -> &BlockHash {
        &self.tip_hash
    }

    pub fn worksum(&self) -> U256 {
        self.worksum
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
}

impl Display for ChainSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        writeln!(f, "Chain length: {}", self.length)?;
        writeln!(f, "Tip hash: {}", self.tip_hash)?;
        writeln!(f, "Total work: {}", self.worksum)?;
        writeln!(f, "Tip timestamp: {}", self.timestamp)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::height::Height;

    #[test]
    fn serde_round_trip() {
        let summary = ChainSummary::new(
            Height::new(17280),
            BlockHash::from([7u8; 32]),
            U256::from(123_456_789u64),
            1_700_000_000,
        );
        let json = serde_json::to_string(&summary).unwrap();
        let back: ChainSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }
}
