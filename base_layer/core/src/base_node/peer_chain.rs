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

use thiserror::Error;
use warthog_common_types::{BatchSlot, Height, NonzeroHeight};

use crate::{
    chain::{
        chain_cache::{CacheChain, StageAndConsensus},
        descripted::Descripted,
        error::{ChainError, ChainErrorKind},
        fork_range::ForkRange,
        header_chain::HeaderChain,
        signed_snapshot::SnapshotPriority,
    },
    message::{AppendMsg, ForkMsg, InitMsg, ProbeRepMsg, ProbeReqMsg, ProtocolError, SignedPinRollbackMsg},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PeerChainError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Which of the local chains a probe reply matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerChainMatch {
    None,
    Consensus,
    Stage,
}

/// Mutable per-peer chain state: the latest descriptor object, the peer's advertised snapshot
/// priority, and the two fork ranges localizing where the peer diverges from the consensus chain
/// and from the stage chain.
#[derive(Debug)]
pub struct PeerChain {
    desc: Arc<Descripted>,
    consensus_fork_range: ForkRange,
    stage_fork_range: ForkRange,
    priority: SnapshotPriority,
}

impl PeerChain {
    /// Establishes peer state from an Init announcement. The grid must cover exactly the
    /// announced chain's complete batches.
    pub fn new(msg: &InitMsg, cache: &StageAndConsensus) -> Result<Self, ProtocolError> {
        if msg.chain_length.complete_batches() != msg.grid.slots() {
            return Err(ProtocolError::InitGrid);
        }
        let desc = Arc::new(Descripted::new(
            msg.descriptor,
            msg.chain_length,
            msg.worksum,
            msg.grid.clone(),
        ));
        let consensus_fork_range =
            ForkRange::from_grid_match(cache.consensus_state().headers(), &msg.grid, BatchSlot::new(0));
        let stage_fork_range = ForkRange::from_grid_match(cache.stage_headers(), &msg.grid, BatchSlot::new(0));
        Ok(Self {
            desc,
            consensus_fork_range,
            stage_fork_range,
            priority: msg.priority,
        })
    }

    pub fn descripted(&self) -> &Arc<Descripted> {
        &self.desc
    }

    pub fn consensus_fork_range(&self) -> &ForkRange {
        &self.consensus_fork_range
    }

    pub fn stage_fork_range(&self) -> &ForkRange {
        &self.stage_fork_range
    }

    pub fn fork_range(&self, kind: CacheChain) -> &ForkRange {
        match kind {
            CacheChain::Consensus => &self.consensus_fork_range,
            CacheChain::Stage => &self.stage_fork_range,
        }
    }

    pub fn fork_range_mut(&mut self, kind: CacheChain) -> &mut ForkRange {
        match kind {
            CacheChain::Consensus => &mut self.consensus_fork_range,
            CacheChain::Stage => &mut self.stage_fork_range,
        }
    }

    pub fn snapshot_priority(&self) -> SnapshotPriority {
        self.priority
    }

    pub fn set_snapshot_priority(&mut self, priority: SnapshotPriority) {
        self.priority = priority;
    }

    /// The peer extended its chain under the same descriptor.
    pub fn on_peer_append(&mut self, msg: &AppendMsg, cache: &StageAndConsensus) -> Result<(), PeerChainError> {
        self.desc.apply_append(msg)?;
        self.desc.with_grid(|grid| {
            self.consensus_fork_range
                .on_append(grid, cache.consensus_state().headers())?;
            self.stage_fork_range.on_append(grid, cache.stage_headers())?;
            Ok(())
        })
    }

    /// The peer switched to a forked chain under the next descriptor.
    pub fn on_peer_fork(&mut self, msg: &ForkMsg, cache: &StageAndConsensus) -> Result<(), PeerChainError> {
        self.desc.expire();
        if msg.descriptor != self.desc.descriptor().next() {
            return Err(ProtocolError::Descriptor.into());
        }
        let mut grid = self.desc.clone_grid();
        grid.shrink(msg.fork_height.prev().complete_batches());
        grid.extend(&msg.grid);
        if grid.slots() != msg.chain_length.complete_batches() {
            return Err(ProtocolError::GridMismatch.into());
        }
        self.desc = Arc::new(Descripted::new(
            msg.descriptor,
            msg.chain_length.height(),
            msg.worksum,
            grid,
        ));
        self.desc.with_grid(|grid| {
            self.consensus_fork_range
                .on_fork(msg.fork_height, grid, cache.consensus_state().headers())?;
            self.stage_fork_range
                .on_fork(msg.fork_height, grid, cache.stage_headers())?;
            Ok(())
        })
    }

    /// The peer rolled back under a signed snapshot, shortening its chain.
    pub fn on_peer_rollback(
        &mut self,
        msg: &SignedPinRollbackMsg,
        cache: &StageAndConsensus,
    ) -> Result<(), PeerChainError> {
        self.desc.expire();
        if msg.descriptor != self.desc.descriptor().next() {
            return Err(ProtocolError::Descriptor.into());
        }
        let mut grid = self.desc.clone_grid();
        grid.shrink(msg.shrink_length.complete_batches());
        self.desc = Arc::new(Descripted::new(
            msg.descriptor,
            msg.shrink_length,
            msg.worksum,
            grid,
        ));
        self.consensus_fork_range
            .on_shrink(msg.shrink_length, cache.consensus_state().headers());
        self.stage_fork_range.on_shrink(msg.shrink_length, cache.stage_headers());
        Ok(())
    }

    /// The local consensus chain forked.
    pub fn on_consensus_fork(
        &mut self,
        fork_height: NonzeroHeight,
        cache: &StageAndConsensus,
    ) -> Result<(), ChainError> {
        self.desc.with_grid(|grid| {
            self.consensus_fork_range
                .on_fork(fork_height, grid, cache.consensus_state().headers())
        })?;
        let match_height = cache
            .fork_height()
            .height
            .height()
            .min(self.stage_fork_range.lower().height()) -
            1;
        self.consensus_fork_range.on_match(match_height)?;
        Ok(())
    }

    /// The local consensus chain appended.
    pub fn on_consensus_append(&mut self, cache: &StageAndConsensus) -> Result<(), ChainError> {
        self.desc.with_grid(|grid| {
            self.consensus_fork_range
                .on_append(grid, cache.consensus_state().headers())
        })?;
        let match_height = cache
            .fork_height()
            .height
            .height()
            .min(self.stage_fork_range.lower().height()) -
            1;
        self.consensus_fork_range.on_match(match_height)?;
        Ok(())
    }

    /// The local consensus chain shrank under a signed snapshot.
    pub fn on_consensus_shrink(&mut self, cache: &StageAndConsensus) {
        self.consensus_fork_range
            .on_shrink(self.desc.chain_length(), cache.consensus_state().headers());
    }

    /// The stage switched to a fork of its previous self.
    pub fn on_stage_fork(&mut self, fork_height: NonzeroHeight, stage: &HeaderChain) -> Result<(), ChainError> {
        self.desc
            .with_grid(|grid| self.stage_fork_range.on_fork(fork_height, grid, stage))
    }

    /// A fresh stage was set; divergence is only possible above its length.
    pub fn on_stage_set(&mut self, length: Height) {
        self.stage_fork_range = ForkRange::open((length + 1).nonzero_assert());
    }

    pub fn on_stage_append_or_shrink(&mut self, stage: &HeaderChain) -> Result<(), ChainError> {
        let their_length = self.desc.chain_length();
        self.desc
            .with_grid(|grid| self.stage_fork_range.on_append_or_shrink(their_length, grid, stage))
    }

    /// Applies a probe reply to the relevant fork ranges. The reply's `current` header refers to
    /// the peer's current chain at the probed height.
    pub fn on_probe_reply(
        &mut self,
        req: &ProbeReqMsg,
        msg: &ProbeRepMsg,
        cache: &StageAndConsensus,
    ) -> Result<PeerChainMatch, ChainError> {
        let mut res = PeerChainMatch::None;
        let fh = cache.fork_height();
        if msg.current_descriptor != self.desc.descriptor() {
            return Err(ChainErrorKind::ProbeDescriptor
                .at(NonzeroHeight::assert(msg.current_descriptor.value() + 1)));
        }
        if self.desc.chain_length() < req.height {
            if msg.current.is_some() {
                return Err(ChainErrorKind::BadProbe.at(req.height));
            }
            return Ok(res);
        }
        let current = match &msg.current {
            Some(h) => h,
            None => return Err(ChainErrorKind::BadProbe.at(req.height)),
        };

        let consensus = cache.consensus_state().headers();
        if consensus.length() >= req.height {
            if consensus.header_at(req.height) == *current {
                res = PeerChainMatch::Consensus;
                self.consensus_fork_range.on_match(req.height.height())?;
                if fh.height <= req.height {
                    self.stage_fork_range.on_match(fh.height.prev())?;
                    if fh.height <= cache.stage_headers().length() {
                        self.stage_fork_range.on_mismatch(fh.height)?;
                    }
                }
            } else {
                self.consensus_fork_range.on_mismatch(req.height)?;
            }
        }

        if cache.stage_headers().length() >= req.height {
            if cache.stage_headers().header_at(req.height) == *current {
                res = PeerChainMatch::Stage;
                self.stage_fork_range.on_match(req.height.height())?;
                if fh.height <= req.height {
                    self.consensus_fork_range.on_match(fh.height.prev())?;
                    if fh.height <= consensus.length() {
                        self.consensus_fork_range.on_mismatch(fh.height)?;
                    }
                }
            } else {
                self.stage_fork_range.on_mismatch(req.height)?;
            }
        }
        Ok(res)
    }
}
