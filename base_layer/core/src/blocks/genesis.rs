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

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use warthog_common_types::types::BlockHash;

use crate::consensus::GENESIS_SEED;

static GENESIS_HASH: Lazy<BlockHash> = Lazy::new(|| {
    let digest = Sha256::digest(GENESIS_SEED.as_bytes());
    BlockHash::try_from_slice(&digest).expect("sha256 output is 32 bytes")
});

/// Hash at height zero: the prev-hash every valid chain starts from, derived from the genesis
/// seed phrase.
pub fn genesis_hash() -> BlockHash {
    *GENESIS_HASH
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn genesis_hash_is_seed_digest() {
        let expected = Sha256::digest(GENESIS_SEED.as_bytes());
        assert_eq!(genesis_hash().as_bytes()[..], expected[..]);
    }
}
