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

use warthog_common_types::{Height, NonzeroHeight};

use crate::{
    base_node::{event_loop::connection::ConnectionId, sync::offender::ChainOffender},
    blocks::BlockBundle,
    chain::{
        error::{ChainError, ChainErrorKind},
        header_chain::HeaderChain,
    },
};

/// Seam to the external ledger: the sync core dispatches these operations and receives the
/// results back as events.
pub trait StageOperations: Send {
    /// "Your chain must become this header chain." The applier answers with the first height at
    /// which its body store diverges.
    fn stage_set(&mut self, headers: Arc<HeaderChain>);
    /// Validated bodies for a contiguous run of staged heights.
    fn stage_add(&mut self, headers: Arc<HeaderChain>, blocks: Vec<BlockBundle>);
    /// A peer asked for block bodies; only the ledger can serve them.
    fn serve_blocks(&mut self, _conn: ConnectionId, _req: crate::message::BlockReqMsg) {}
    /// A signed snapshot with higher priority arrived; the ledger decides on a rollback and
    /// reports it back as a consensus update.
    fn on_signed_snapshot(&mut self, _snapshot: crate::chain::signed_snapshot::SignedSnapshot) {}
}

/// Applier answer to a stage-set operation.
#[derive(Debug, Clone, Copy)]
pub struct StageSetStatus {
    /// First height whose body the applier is missing; `None` aborts the stage (a signed
    /// snapshot invalidated it).
    pub first_miss_height: Option<NonzeroHeight>,
}

/// Applier answer to a stage-add operation: bodies were applied up to `next_height - 1`; an
/// error names the offending kind at `next_height`.
#[derive(Debug, Clone, Copy)]
pub struct StageAddStatus {
    pub next_height: NonzeroHeight,
    pub error: Option<ChainErrorKind>,
}

/// Per-connection fork height remembered while a stage-add is in flight, so blame for a failing
/// body lands only on the peers that vouched for data above the failure.
#[derive(Debug, Clone, Copy)]
pub struct BanEntry {
    pub fork_height: NonzeroHeight,
    pub conn: ConnectionId,
}

#[derive(Debug, Default)]
enum PendingOperation {
    #[default]
    None,
    Set {
        length: Height,
    },
    Add {
        ban_memory: Vec<BanEntry>,
    },
}

impl PendingOperation {
    fn busy(&self) -> bool {
        !matches!(self, PendingOperation::None)
    }
}

/// Tracks the two-phase conversation with the applier: the stage-set phase establishes the
/// download offset, then stage-adds stream bodies. Results that raced a stage switch are
/// invalidated through `stale_from`.
#[derive(Debug, Default)]
pub struct StageState {
    pending: PendingOperation,
    stage_set_done: bool,
    stage_set_ack: Height,
    stale_from: Option<Height>,
}

impl StageState {
    pub fn is_stage_set_phase(&self) -> bool {
        !self.stage_set_done
    }

    pub fn pending(&self) -> bool {
        self.pending.busy()
    }

    pub fn stage_set_ack(&self) -> Height {
        self.stage_set_ack
    }

    pub fn begin_stage_set(&mut self, length: Height) {
        debug_assert!(!self.pending.busy());
        self.pending = PendingOperation::Set { length };
    }

    pub fn begin_stage_add(&mut self, ban_memory: Vec<BanEntry>) {
        debug_assert!(!self.pending.busy());
        self.pending = PendingOperation::Add { ban_memory };
    }

    /// Invalidate current progress; a busy operation keeps its result from being trusted.
    pub fn clear(&mut self) {
        if self.pending.busy() {
            self.stale_from = Some(Height::new(1));
        } else {
            self.clear_non_pending();
        }
    }

    pub fn clear_non_pending(&mut self) {
        debug_assert!(!self.pending.busy());
        *self = StageState::default();
    }

    pub fn set_stale_from(&mut self, from: Height) {
        if self.stale_from.map(|s| from < s).unwrap_or(true) {
            self.stale_from = Some(from);
        }
    }

    /// Digests a stage-add result, attributing a body failure to the remembered peers whose
    /// fork height lies above it.
    pub fn on_add_result(&mut self, status: &StageAddStatus) -> Vec<ChainOffender> {
        let ban_memory = match std::mem::take(&mut self.pending) {
            PendingOperation::Add { ban_memory } => ban_memory,
            _ => {
                debug_assert!(false, "stage add result without pending stage add");
                Vec::new()
            },
        };
        self.stage_set_ack = status.next_height.prev();
        let mut offenders = Vec::new();
        if let Some(kind) = status.error {
            if kind != ChainErrorKind::LeaderMismatch {
                let error = ChainError::new(kind, status.next_height);
                for entry in &ban_memory {
                    if entry.fork_height > status.next_height {
                        offenders.push(ChainOffender::new(error, entry.conn));
                    }
                }
            }
        }
        if self
            .stale_from
            .map(|s| s < status.next_height.height())
            .unwrap_or(false)
        {
            self.clear_non_pending();
        }
        offenders
    }

    /// Digests a stage-set result; the returned height becomes the new download offset.
    pub fn on_set_result(&mut self, status: &StageSetStatus) -> Option<NonzeroHeight> {
        let length = match std::mem::take(&mut self.pending) {
            PendingOperation::Set { length } => length,
            _ => {
                debug_assert!(false, "stage set result without pending stage set");
                Height::zero()
            },
        };
        let first_miss = match status.first_miss_height {
            Some(h)
                if self
                    .stale_from
                    .map(|s| s >= h.height())
                    .unwrap_or(true) =>
            {
                h
            },
            _ => {
                self.clear_non_pending();
                return None;
            },
        };
        self.stage_set_ack = first_miss.prev();
        if first_miss <= length {
            self.stage_set_done = true;
        }
        Some(first_miss)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn nz(h: u32) -> NonzeroHeight {
        NonzeroHeight::assert(h)
    }

    #[test]
    fn set_result_ends_set_phase_when_miss_within_length() {
        let mut s = StageState::default();
        assert!(s.is_stage_set_phase());
        s.begin_stage_set(Height::new(100));
        let res = s.on_set_result(&StageSetStatus {
            first_miss_height: Some(nz(40)),
        });
        assert_eq!(res, Some(nz(40)));
        assert!(!s.is_stage_set_phase());
        assert_eq!(s.stage_set_ack(), Height::new(39));
    }

    #[test]
    fn aborted_set_clears_state() {
        let mut s = StageState::default();
        s.begin_stage_set(Height::new(100));
        let res = s.on_set_result(&StageSetStatus { first_miss_height: None });
        assert_eq!(res, None);
        assert!(s.is_stage_set_phase());
    }

    #[test]
    fn add_failure_blames_peers_above_failure_height() {
        let mut s = StageState::default();
        s.begin_stage_add(vec![
            BanEntry {
                fork_height: nz(10),
                conn: ConnectionId::new(1),
            },
            BanEntry {
                fork_height: nz(50),
                conn: ConnectionId::new(2),
            },
        ]);
        let offenders = s.on_add_result(&StageAddStatus {
            next_height: nz(20),
            error: Some(ChainErrorKind::MerkleRoot),
        });
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0].conn, ConnectionId::new(2));
        assert_eq!(offenders[0].error.height, nz(20));
    }

    #[test]
    fn leader_mismatch_blames_nobody() {
        let mut s = StageState::default();
        s.begin_stage_add(vec![BanEntry {
            fork_height: nz(50),
            conn: ConnectionId::new(2),
        }]);
        let offenders = s.on_add_result(&StageAddStatus {
            next_height: nz(20),
            error: Some(ChainErrorKind::LeaderMismatch),
        });
        assert!(offenders.is_empty());
    }

    #[test]
    fn stale_result_discards_progress() {
        let mut s = StageState::default();
        s.begin_stage_add(Vec::new());
        s.set_stale_from(Height::new(5));
        let _ = s.on_add_result(&StageAddStatus {
            next_height: nz(20),
            error: None,
        });
        // stale below the applied height: everything is discarded
        assert!(s.is_stage_set_phase());
        assert_eq!(s.stage_set_ack(), Height::zero());
    }
}
