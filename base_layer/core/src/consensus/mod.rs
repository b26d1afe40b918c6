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

//! Network consensus parameters and the difficulty-adjustment schedule.

use warthog_common_types::{BatchSlot, NonzeroHeight, HEADER_BATCH_SIZE};

use crate::blocks::BlockHash;

/// One coin in the smallest representable quantity.
pub const COIN_UNIT: u64 = 100_000_000;

/// Difficulty is rebalanced such that one block takes this many seconds.
pub const BLOCK_TIME: u32 = 20;

/// Max size per block body in bytes.
pub const MAX_BLOCK_SIZE: usize = 35000;

/// Tolerate block timestamps this much ahead of local time.
pub const TOLERANCE_MINUTES: u32 = 10;

/// The median of this many trailing block timestamps must strictly increase.
pub const MEDIAN_N: usize = 50;

/// Block reward halves every this many blocks (approx. every two years).
pub const HALVING_INTERVAL: u32 = (2 * 365 * 24 * 60 * 60) / BLOCK_TIME;

/// Total reward mined in every block before the first halving.
pub const GENESIS_BLOCK_REWARD: u64 = 3 * COIN_UNIT;

/// `2^(this number)` is the expected number of tries to mine the first block.
pub const GENESIS_DIFFICULTY_EXPONENT: u8 = 32;

/// Seed phrase hashed into the genesis predecessor hash.
pub const GENESIS_SEED: &str =
    "The New York Times International Edition 29/06/2023: 'Water troubles: A preview'";

const FOUR_HOURS: u32 = 4 * 60 * 60 / BLOCK_TIME;
const TEN_MONTHS: u32 = 10 * 30 * 24 * 60 * 60 / BLOCK_TIME;

/// Snaps a height down to the difficulty-adjustment boundary governing it. Within the first ten
/// months the adjustment interval is four hours of blocks (minimum height 1), afterwards one full
/// header batch.
pub fn retarget_floor(height: NonzeroHeight) -> NonzeroHeight {
    let h = height.value();
    if h < TEN_MONTHS {
        let val = (h / FOUR_HOURS) * FOUR_HOURS;
        if val == 0 {
            NonzeroHeight::assert(1)
        } else {
            NonzeroHeight::assert(val)
        }
    } else {
        NonzeroHeight::assert((h / HEADER_BATCH_SIZE) * HEADER_BATCH_SIZE)
    }
}

pub fn is_retarget_height(height: NonzeroHeight) -> bool {
    height == retarget_floor(height)
}

/// Mining reward at the given height, after halvings.
pub fn block_reward(height: NonzeroHeight) -> u64 {
    let halvings = (height.value() - 1) / HALVING_INTERVAL;
    GENESIS_BLOCK_REWARD >> halvings
}

/// Block bodies at and above this height include ten bytes of the raw body in the final merkle
/// round; below it, four (legacy format).
pub const MERKLE_PREFIX_V2_HEIGHT: u32 = 900_000;

/// A hard-coded chain checkpoint: chains whose grid covers the checkpoint slot must carry this
/// exact last header hash there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub slot: BatchSlot,
    pub header_hash: BlockHash,
}

/// Compiled-in checkpoint of the current network, if any.
pub fn checkpoint() -> Option<&'static Checkpoint> {
    None
}

const _: () = assert!(MEDIAN_N < HEADER_BATCH_SIZE as usize);
const _: () = assert!(TEN_MONTHS % HEADER_BATCH_SIZE == 0);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retarget_floor_schedule() {
        // early chain: four-hour interval, floored at 1
        assert_eq!(retarget_floor(NonzeroHeight::assert(1)).value(), 1);
        assert_eq!(retarget_floor(NonzeroHeight::assert(FOUR_HOURS - 1)).value(), 1);
        assert_eq!(retarget_floor(NonzeroHeight::assert(FOUR_HOURS)).value(), FOUR_HOURS);
        assert_eq!(
            retarget_floor(NonzeroHeight::assert(2 * FOUR_HOURS + 3)).value(),
            2 * FOUR_HOURS
        );
        // late chain: one batch per adjustment
        assert_eq!(
            retarget_floor(NonzeroHeight::assert(TEN_MONTHS + 1)).value(),
            TEN_MONTHS
        );
        assert_eq!(
            retarget_floor(NonzeroHeight::assert(TEN_MONTHS + HEADER_BATCH_SIZE)).value(),
            TEN_MONTHS + HEADER_BATCH_SIZE
        );
    }

    #[test]
    fn batch_boundary_is_retarget_height_in_both_regimes() {
        assert!(is_retarget_height(NonzeroHeight::assert(HEADER_BATCH_SIZE)));
        assert!(is_retarget_height(NonzeroHeight::assert(TEN_MONTHS + HEADER_BATCH_SIZE)));
    }

    #[test]
    fn reward_halves() {
        assert_eq!(block_reward(NonzeroHeight::assert(1)), GENESIS_BLOCK_REWARD);
        assert_eq!(block_reward(NonzeroHeight::assert(HALVING_INTERVAL)), GENESIS_BLOCK_REWARD);
        assert_eq!(
            block_reward(NonzeroHeight::assert(HALVING_INTERVAL + 1)),
            GENESIS_BLOCK_REWARD / 2
        );
    }
}
