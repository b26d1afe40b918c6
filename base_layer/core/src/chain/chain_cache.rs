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

use warthog_common_types::{Descriptor, Height, NonzeroHeight};

use crate::{
    chain::{
        batch::{ChainPin, Grid},
        header_chain::{fork_height, ForkHeight, HeaderChain, HeaderChainAppend, HeaderChainFork, HeaderSpan},
        signed_snapshot::{SignedSnapshot, SnapshotPriority},
        verifier::HeaderVerifier,
    },
    message::{AppendMsg, ForkMsg, SignedPinRollbackMsg},
    proof_of_work::{PowVerifier, Worksum},
};

/// Header chain delta produced by the external block applier when consensus advances.
#[derive(Debug, Clone)]
pub struct ConsensusAppend {
    pub delta: HeaderChainAppend,
    pub signed_snapshot: Option<SignedSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ConsensusFork {
    pub delta: HeaderChainFork,
    pub signed_snapshot: Option<SignedSnapshot>,
}

#[derive(Debug, Clone, Copy)]
pub struct RollbackDelta {
    pub shrink_length: Height,
    pub descriptor: Descriptor,
}

/// A signed snapshot took effect; with a rollback when the consensus chain contradicted it.
#[derive(Debug, Clone)]
pub struct RollbackData {
    pub signed_snapshot: SignedSnapshot,
    pub rollback: Option<RollbackDelta>,
}

/// State updates from the block applier, in the order they were produced.
#[derive(Debug, Clone)]
pub enum ConsensusUpdate {
    Append(ConsensusAppend),
    Fork(ConsensusFork),
    Rollback(RollbackData),
}

/// The committed chain as mirrored from the block applier: headers, the local descriptor, and
/// the active signed snapshot.
#[derive(Debug, Clone)]
pub struct ConsensusState {
    signed_snapshot: Option<SignedSnapshot>,
    descriptor: Descriptor,
    headers: Arc<HeaderChain>,
}

impl ConsensusState {
    pub fn new(signed_snapshot: Option<SignedSnapshot>, descriptor: Descriptor, headers: HeaderChain) -> Self {
        Self {
            signed_snapshot,
            descriptor,
            headers: Arc::new(headers),
        }
    }

    pub fn headers(&self) -> &HeaderChain {
        &self.headers
    }

    /// Keeps the current chain alive independently of later updates.
    pub fn pin(&self) -> Arc<HeaderChain> {
        self.headers.clone()
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn total_work(&self) -> Worksum {
        self.headers.total_work()
    }

    pub fn grid(&self) -> Grid {
        self.headers.grid(warthog_common_types::BatchSlot::new(0))
    }

    pub fn signed_snapshot(&self) -> Option<&SignedSnapshot> {
        self.signed_snapshot.as_ref()
    }

    pub fn snapshot_priority(&self) -> SnapshotPriority {
        self.signed_snapshot
            .as_ref()
            .map(|s| s.priority.into())
            .unwrap_or_default()
    }

    fn apply_append(&mut self, append: ConsensusAppend) -> (Height, AppendMsg) {
        let mut chain = (*self.headers).clone();
        let res = chain.apply_append(append.delta);
        self.headers = Arc::new(chain);
        if let Some(ss) = append.signed_snapshot {
            debug_assert!(ss.compatible(&self.headers));
            self.signed_snapshot = Some(ss);
        }
        res
    }

    fn apply_fork(&mut self, fork: ConsensusFork) -> ForkMsg {
        assert!(self.descriptor.next() == fork.delta.descriptor);
        self.descriptor = fork.delta.descriptor;
        let mut chain = (*self.headers).clone();
        let msg = chain.apply_fork(fork.delta);
        self.headers = Arc::new(chain);
        if let Some(ss) = fork.signed_snapshot {
            debug_assert!(ss.compatible(&self.headers));
            self.signed_snapshot = Some(ss);
        }
        msg
    }

    fn apply_rollback(&mut self, data: &RollbackData) -> Option<SignedPinRollbackMsg> {
        self.signed_snapshot = Some(data.signed_snapshot);
        let msg = data.rollback.as_ref().map(|rollback| {
            assert!(self.descriptor.next() == rollback.descriptor);
            self.descriptor = rollback.descriptor;
            let mut chain = (*self.headers).clone();
            chain.shrink(rollback.shrink_length);
            self.headers = Arc::new(chain);
            SignedPinRollbackMsg {
                snapshot: crate::message::UnverifiedSnapshot {
                    height: data.signed_snapshot.height(),
                    hash: data.signed_snapshot.hash,
                    signature: data.signed_snapshot.signature,
                },
                shrink_length: self.headers.length(),
                worksum: self.headers.total_work(),
                descriptor: self.descriptor,
            }
        });
        debug_assert!(data.signed_snapshot.compatible(&self.headers));
        msg
    }
}

/// Which cached chain a lookup matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheChain {
    Stage,
    Consensus,
}

/// A pin into the stage or consensus chain proving it carries a given header.
#[derive(Debug, Clone)]
pub struct ChainCacheMatch {
    pub kind: CacheChain,
    pub pin: Arc<HeaderChain>,
}

/// Twin-chain view of the node: the committed consensus chain and the candidate chain under
/// block download (the stage), with their cached fork height. Peers choose which of their two
/// fork ranges to update based on this quantity.
pub struct StageAndConsensus {
    consensus: ConsensusState,
    stage: Arc<HeaderChain>,
    sc_fork_height: ForkHeight,
    pow: Arc<dyn PowVerifier>,
}

impl StageAndConsensus {
    pub fn new(consensus: ConsensusState, pow: Arc<dyn PowVerifier>) -> Self {
        Self {
            consensus,
            stage: Arc::new(HeaderChain::new()),
            sc_fork_height: ForkHeight::unforked_start(),
            pow,
        }
    }

    pub fn consensus_state(&self) -> &ConsensusState {
        &self.consensus
    }

    pub fn consensus_length(&self) -> Height {
        self.consensus.headers().length()
    }

    pub fn stage_headers(&self) -> &HeaderChain {
        &self.stage
    }

    pub fn stage_pin(&self) -> Arc<HeaderChain> {
        self.stage.clone()
    }

    pub fn consensus_pin(&self) -> Arc<HeaderChain> {
        self.consensus.pin()
    }

    pub fn signed_snapshot(&self) -> Option<&SignedSnapshot> {
        self.consensus.signed_snapshot()
    }

    /// Fork height between stage and consensus chain.
    pub fn fork_height(&self) -> ForkHeight {
        self.sc_fork_height
    }

    /// Replaces the stage chain, returning the fork height between old and new stage.
    pub fn update_stage(&mut self, new_headers: HeaderChain) -> ForkHeight {
        let fh = fork_height(&self.stage, &new_headers, NonzeroHeight::assert(1));
        self.stage = Arc::new(new_headers);
        if !self.sc_fork_height.forked || fh.height <= self.sc_fork_height.height {
            self.sc_fork_height = fork_height(self.consensus.headers(), &self.stage, fh.height);
        }
        fh
    }

    pub fn stage_clear(&mut self) {
        self.stage = Arc::new(HeaderChain::new());
        self.sc_fork_height = ForkHeight::unforked_start();
    }

    pub fn update_consensus_append(&mut self, append: ConsensusAppend) -> AppendMsg {
        let (prev_length, msg) = self.consensus.apply_append(append);
        if !self.sc_fork_height.forked {
            let start = (prev_length + 1).nonzero_assert();
            self.sc_fork_height = fork_height(self.consensus.headers(), &self.stage, start);
        }
        msg
    }

    pub fn update_consensus_fork(&mut self, fork: ConsensusFork) -> ForkMsg {
        let shrink_length = fork.delta.shrink_length;
        let msg = self.consensus.apply_fork(fork);
        if !self.sc_fork_height.forked || self.sc_fork_height.height > shrink_length {
            let start = (shrink_length + 1).nonzero_assert();
            self.sc_fork_height = fork_height(self.consensus.headers(), &self.stage, start);
        }
        msg
    }

    pub fn update_consensus_rollback(&mut self, data: &RollbackData) -> Option<SignedPinRollbackMsg> {
        let msg = self.consensus.apply_rollback(data);
        if let Some(rollback) = &data.rollback {
            if self.sc_fork_height.forked && self.sc_fork_height.height > rollback.shrink_length {
                self.sc_fork_height = ForkHeight {
                    height: (rollback.shrink_length + 1).nonzero_assert(),
                    forked: false,
                };
            }
        }
        msg
    }

    /// Finds a cached chain carrying the pinned header (or, without a pin, any nonempty cached
    /// chain), preferring the stage.
    pub fn lookup(&self, pin: Option<ChainPin>) -> Option<ChainCacheMatch> {
        let pin = match pin {
            None => {
                if !self.stage.length().is_zero() {
                    return Some(ChainCacheMatch {
                        kind: CacheChain::Stage,
                        pin: self.stage_pin(),
                    });
                }
                if !self.consensus.headers().length().is_zero() {
                    return Some(ChainCacheMatch {
                        kind: CacheChain::Consensus,
                        pin: self.consensus_pin(),
                    });
                }
                return None;
            },
            Some(pin) => pin,
        };
        if self.stage.length() > pin.height && self.stage.get_header(pin.height) == Some(pin.header) {
            return Some(ChainCacheMatch {
                kind: CacheChain::Stage,
                pin: self.stage_pin(),
            });
        }
        if self.consensus.headers().length() > pin.height &&
            self.consensus.headers().get_header(pin.height) == Some(pin.header)
        {
            return Some(ChainCacheMatch {
                kind: CacheChain::Consensus,
                pin: self.consensus_pin(),
            });
        }
        None
    }

    /// A verifier positioned at the highest point where a cached chain agrees with `span`,
    /// letting final-batch verification skip already-verified prefixes.
    pub fn header_verifier(&self, span: &HeaderSpan<'_>) -> Option<HeaderVerifier> {
        let mut best: Option<(&HeaderChain, NonzeroHeight)> = None;
        for chain in [&*self.stage, self.consensus.headers()] {
            if let Some(mh) = chain.max_match_height(span) {
                if best.map(|(_, h)| h < mh).unwrap_or(true) {
                    best = Some((chain, mh));
                }
            }
        }
        best.map(|(chain, height)| {
            debug_assert!(chain.get_header(height.height()) == span.at(height));
            HeaderVerifier::from_chain(chain, height.height(), self.pow.clone())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        chain::batch_registry::BatchRegistry,
        proof_of_work::AcceptAllPow,
        test_utils::{extendable_with_tail, fork_of},
    };

    fn sac(consensus: HeaderChain) -> StageAndConsensus {
        StageAndConsensus::new(
            ConsensusState::new(None, Descriptor::new(0), consensus),
            Arc::new(AcceptAllPow),
        )
    }

    #[test]
    fn stage_update_tracks_fork_height_vs_consensus() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 0, 30);
        let mut cache = sac(chain.headers().clone());

        // stage identical to consensus: no fork
        let fh = cache.update_stage(chain.headers().clone());
        assert!(!fh.forked);
        assert!(!cache.fork_height().forked);
        assert_eq!(cache.fork_height().height.value(), 31);

        // stage forks off at 21
        let forked = fork_of(&registry, chain.headers(), 21);
        cache.update_stage(forked.headers().clone());
        assert!(cache.fork_height().forked);
        assert_eq!(cache.fork_height().height.value(), 21);
    }

    #[test]
    fn lookup_prefers_stage() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 0, 20);
        let mut cache = sac(chain.headers().clone());
        cache.update_stage(chain.headers().clone());

        let pin = ChainPin {
            height: Height::new(10),
            header: chain.headers().header_at(NonzeroHeight::assert(10)),
        };
        let found = cache.lookup(Some(pin)).unwrap();
        assert_eq!(found.kind, CacheChain::Stage);

        let missing = ChainPin {
            height: Height::new(10),
            header: chain.headers().header_at(NonzeroHeight::assert(11)),
        };
        assert!(cache.lookup(Some(missing)).is_none());
    }

    #[test]
    fn consensus_append_keeps_fork_height_current() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 0, 20);
        let prefix = HeaderChain::subchain(chain.headers(), Height::new(10));
        let mut cache = sac(prefix);
        cache.update_stage(chain.headers().clone());
        assert!(!cache.fork_height().forked);
        assert_eq!(cache.fork_height().height.value(), 11);

        let append = chain.headers().get_append(Height::new(10));
        let msg = cache.update_consensus_append(ConsensusAppend {
            delta: append,
            signed_snapshot: None,
        });
        assert_eq!(msg.new_length.value(), 20);
        assert_eq!(cache.fork_height().height.value(), 21);
    }
}
