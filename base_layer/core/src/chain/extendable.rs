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

use std::sync::Arc;

use warthog_common_types::Height;

use crate::{
    blocks::BlockHash,
    chain::{
        batch::Batch,
        batch_registry::BatchRegistry,
        error::ChainErrorKind,
        header_chain::HeaderChain,
        signed_snapshot::SignedSnapshot,
        verifier::{HeaderVerifier, PreparedAppend},
    },
    consensus::block_reward,
    proof_of_work::{PowVerifier, Target},
};

/// Everything a miner needs to extend this chain by one block.
#[derive(Debug, Clone, Copy)]
pub struct MiningData {
    pub reward: u64,
    pub prev_hash: BlockHash,
    pub target: Target,
    pub min_timestamp: u32,
}

/// A header chain paired with the verifier positioned at its tip, allowing single-header
/// appends. Complete tails are shared into the registry as they fill.
#[derive(Debug, Clone)]
pub struct ExtendableHeaderChain {
    chain: HeaderChain,
    checker: HeaderVerifier,
}

impl ExtendableHeaderChain {
    pub fn new(pow: Arc<dyn PowVerifier>) -> Self {
        Self {
            chain: HeaderChain::new(),
            checker: HeaderVerifier::new(pow),
        }
    }

    pub fn from_chain(chain: HeaderChain, pow: Arc<dyn PowVerifier>) -> Self {
        let checker = HeaderVerifier::from_chain(&chain, chain.length(), pow);
        Self { chain, checker }
    }

    pub fn headers(&self) -> &HeaderChain {
        &self.chain
    }

    pub fn into_headers(self) -> HeaderChain {
        self.chain
    }

    pub fn length(&self) -> Height {
        self.chain.length()
    }

    pub fn final_hash(&self) -> &BlockHash {
        self.checker.final_hash()
    }

    pub fn next_target(&self) -> Target {
        self.checker.next_target()
    }

    pub fn verifier(&self) -> &HeaderVerifier {
        &self.checker
    }

    pub fn prepare_append(
        &self,
        snapshot: Option<&SignedSnapshot>,
        header: &crate::blocks::BlockHeader,
    ) -> Result<PreparedAppend, ChainErrorKind> {
        self.checker.prepare_append(snapshot, header)
    }

    /// Appends a prepared header, sharing the tail into the registry when it completes.
    pub fn append(&mut self, prepared: &PreparedAppend, registry: &Arc<BatchRegistry>) {
        self.chain.append_prepared(prepared, registry);
        self.checker.append(self.chain.length().nonzero_assert(), prepared);
    }

    /// Discards headers back to `new_length` and repositions the verifier.
    pub fn shrink(&mut self, new_length: Height) {
        if new_length < self.chain.length() {
            self.chain.shrink(new_length);
        }
        self.checker = HeaderVerifier::from_chain(&self.chain, self.chain.length(), self.pow());
    }

    pub fn mining_data(&self) -> MiningData {
        MiningData {
            reward: block_reward((self.length() + 1).nonzero_assert()),
            prev_hash: *self.final_hash(),
            target: self.next_target(),
            min_timestamp: self.checker.min_valid_timestamp(),
        }
    }

    fn pow(&self) -> Arc<dyn PowVerifier> {
        self.checker.pow_handle()
    }

    /// Builds a chain from raw batches, sharing complete ones; fails at the first invalid header.
    pub fn from_batches(
        batches: Vec<Batch>,
        registry: &Arc<BatchRegistry>,
        pow: Arc<dyn PowVerifier>,
    ) -> Result<Self, crate::chain::error::ChainError> {
        let mut out = Self::new(pow);
        for batch in batches {
            for header in batch.headers() {
                let prepared = out
                    .prepare_append(None, header)
                    .map_err(|kind| kind.at((out.length() + 1).nonzero_assert()))?;
                out.append(&prepared, registry);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        consensus::{BLOCK_TIME, GENESIS_BLOCK_REWARD},
        proof_of_work::AcceptAllPow,
        test_utils::next_header,
    };
    use warthog_common_types::HEADER_BATCH_SIZE;

    #[test]
    fn appends_share_completed_batches() {
        let registry = BatchRegistry::new();
        let mut chain = ExtendableHeaderChain::new(Arc::new(AcceptAllPow));
        let mut ts = 1_600_000_000;
        for _ in 0..HEADER_BATCH_SIZE + 2 {
            ts += BLOCK_TIME;
            let header = next_header(chain.verifier(), ts, 0);
            let prepared = chain.prepare_append(None, &header).unwrap();
            chain.append(&prepared, &registry);
        }
        assert_eq!(chain.length().value(), HEADER_BATCH_SIZE + 2);
        assert_eq!(chain.headers().complete_batches().len(), 1);
        assert_eq!(chain.headers().incomplete_batch().len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn shrink_repositions_verifier() {
        let registry = BatchRegistry::new();
        let mut chain = ExtendableHeaderChain::new(Arc::new(AcceptAllPow));
        let mut ts = 1_600_000_000;
        for _ in 0..10 {
            ts += BLOCK_TIME;
            let header = next_header(chain.verifier(), ts, 0);
            let prepared = chain.prepare_append(None, &header).unwrap();
            chain.append(&prepared, &registry);
        }
        let hash_at_7 = chain.headers().hash_at(Height::new(7));
        chain.shrink(Height::new(7));
        assert_eq!(chain.length().value(), 7);
        assert_eq!(*chain.final_hash(), hash_at_7);

        // the chain extends again from the new tip
        ts += BLOCK_TIME;
        let header = next_header(chain.verifier(), ts, 0);
        let prepared = chain.prepare_append(None, &header).unwrap();
        chain.append(&prepared, &registry);
        assert_eq!(chain.length().value(), 8);
    }

    #[test]
    fn mining_data_reflects_tip() {
        let chain = ExtendableHeaderChain::new(Arc::new(AcceptAllPow));
        let md = chain.mining_data();
        assert_eq!(md.reward, GENESIS_BLOCK_REWARD);
        assert_eq!(md.prev_hash, *chain.final_hash());
        assert_eq!(md.target, Target::genesis());
    }
}
