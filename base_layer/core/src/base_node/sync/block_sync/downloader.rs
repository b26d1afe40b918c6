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

use log::*;
use warthog_common_types::Height;

use crate::{
    base_node::{
        event_loop::{
            connection::{ConnectionId, ConnectionMap},
            request::{BlockRequest, PendingRequest, ProbeRequest, RequestSender},
        },
        peer_chain::PeerChainError,
        sync::{
            block_sync::{
                focus::Focus,
                forks::Forks,
                stage::{StageAddStatus, StageSetStatus, StageState},
            },
            config::SyncConfig,
            offender::ChainOffender,
        },
    },
    blocks::BlockBundle,
    chain::{
        descripted::Descripted,
        error::{ChainError, ChainErrorKind},
        header_chain::{ForkHeight, HeaderChain},
        fork_range::ForkRange,
    },
    message::{BlockRepMsg, ProbeReqMsg, ProtocolError},
    proof_of_work::Worksum,
};

const LOG_TARGET: &str = "c::bn::block_sync";

/// The operation the event loop should dispatch to the applier next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCall {
    None,
    Set,
    Add,
}

/// Windowed block-body download over the stage header chain: requests batches by slot from any
/// peer whose fork range proves coverage, checks merkle roots against staged headers, and feeds
/// contiguous runs to the applier.
pub struct BlockDownloader {
    initialized: bool,
    headers: Arc<HeaderChain>,
    focus: Focus,
    forks: Forks,
    stage_state: StageState,
    reachable_work: Worksum,
    reachable_height: Height,
}

impl BlockDownloader {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            initialized: false,
            headers: Arc::new(HeaderChain::new()),
            focus: Focus::new(config.focus_window),
            forks: Forks::default(),
            stage_state: StageState::default(),
            reachable_work: Worksum::zero(),
            reachable_height: Height::zero(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.initialized
    }

    pub fn headers(&self) -> &Arc<HeaderChain> {
        &self.headers
    }

    pub fn reachable_length(&self) -> Option<Height> {
        self.forks.reachable_length()
    }

    /// Adopts a freshly handed-over stage chain and re-pins every connection against it.
    /// `fork_height` is the divergence from the previous stage.
    pub fn init(
        &mut self,
        leader: (ConnectionId, Arc<Descripted>),
        fork_height: ForkHeight,
        stage: Arc<HeaderChain>,
        conns: &mut ConnectionMap,
    ) -> Vec<ChainOffender> {
        debug_assert!(self.reachable_work <= stage.total_work());
        self.headers = stage;
        let mut offenders = Vec::new();

        if self.stage_state.pending() {
            self.stage_state.set_stale_from(fork_height.height.height());
        } else if fork_height.forked && fork_height.height < self.focus.height_begin() {
            self.stage_state.clear_non_pending();
            debug!(target: LOG_TARGET, "Restarting stage set phase");
        }

        self.initialized = true;
        let mut valid_leader = false;

        self.forks.clear();
        for conn in conns.ids() {
            let state = conns.get_mut(conn).expect("id just listed");
            if !state.initialized() {
                continue;
            }
            let result = if fork_height.forked {
                state.chain_mut().on_stage_fork(fork_height.height, &self.headers)
            } else {
                state.chain_mut().on_stage_append_or_shrink(&self.headers)
            };
            if let Err(e) = result {
                self.focus.erase(conn);
                offenders.push(ChainOffender::new(e, conn));
                continue;
            }
            if conn == leader.0 {
                let fr = ForkRange::open((self.headers.length() + 1).nonzero_assert());
                self.forks.assign(conn, leader.1.clone(), fr);
                valid_leader = true;
            } else {
                self.forks.link(conn, state.chain());
            }
        }
        debug_assert!(valid_leader);

        self.focus.fork(fork_height.height);
        self.update_reachable(true);
        offenders
    }

    /// Drops all download state; the stage has been invalidated.
    pub fn reset(&mut self) {
        self.headers = Arc::new(HeaderChain::new());
        self.reachable_work = Worksum::zero();
        self.reachable_height = Height::zero();
        self.forks.clear();
        self.focus.clear();
        self.initialized = false;
        self.stage_state.clear();
    }

    pub fn insert(&mut self, conn: ConnectionId, conns: &ConnectionMap) {
        if !self.initialized {
            return;
        }
        if let Some(state) = conns.get(conn) {
            if state.initialized() {
                self.forks.link(conn, state.chain());
                self.update_reachable(false);
            }
        }
    }

    pub fn erase(&mut self, conn: ConnectionId) {
        self.forks.erase(conn);
        self.focus.erase(conn);
        if self.initialized {
            self.update_reachable(false);
        }
    }

    fn check_upgrade_descripted(&mut self, conn: ConnectionId, conns: &ConnectionMap) {
        let state = match conns.get(conn) {
            Some(s) if s.initialized() => s,
            _ => return,
        };
        let current = state.chain().descripted();
        let tracked = match self.forks.descripted(conn) {
            Some(d) => d,
            None => return,
        };
        if Arc::ptr_eq(tracked, current) {
            return;
        }
        let tracked_lower = self.forks.fork_range(conn).expect("tracked above").lower();
        if tracked_lower <= state.chain().stage_fork_range().lower() {
            self.forks.link(conn, state.chain());
        }
    }

    pub fn on_append(&mut self, conn: ConnectionId, conns: &ConnectionMap) {
        if self.initialized {
            self.check_upgrade_descripted(conn, conns);
        }
    }

    pub fn on_fork(&mut self, conn: ConnectionId, conns: &ConnectionMap) {
        if self.initialized {
            self.check_upgrade_descripted(conn, conns);
        }
    }

    pub fn on_rollback(&mut self, _conn: ConnectionId) {
        // the peer's new chain is shorter; its tracked pin stays valid
    }

    pub fn on_probe_reply(
        &mut self,
        conn: ConnectionId,
        req: &ProbeReqMsg,
        requested: Option<&crate::blocks::BlockHeader>,
        conns: &ConnectionMap,
    ) -> Result<(), ChainError> {
        if !self.initialized {
            return Ok(());
        }
        let tracked = match self.forks.descripted(conn) {
            Some(d) => d.clone(),
            None => return Ok(()),
        };
        if req.descriptor != tracked.descriptor() {
            return Ok(());
        }
        debug_assert!(tracked.chain_length() >= req.height);
        match requested {
            None => {
                // chain version no longer available at the peer; fall back to its current one
                self.check_current_chain(conn, conns);
                Ok(())
            },
            Some(header) => self.forks.match_header(conn, &self.headers, req.height, header),
        }
    }

    fn check_current_chain(&mut self, conn: ConnectionId, conns: &ConnectionMap) {
        if let Some(state) = conns.get(conn) {
            if state.initialized() {
                self.forks.link(conn, state.chain());
            }
        }
    }

    pub fn on_block_expire(&mut self, conn: ConnectionId) {
        self.focus.erase(conn);
    }

    pub fn on_probe_expire(&mut self, _conn: ConnectionId) {}

    /// Validates a block batch reply against the staged headers and folds it into the focus
    /// window.
    pub fn on_block_reply(
        &mut self,
        conn: ConnectionId,
        req: &BlockRequest,
        rep: BlockRepMsg,
    ) -> Result<(), PeerChainError> {
        self.focus.erase(conn);
        if !self.initialized {
            return Ok(());
        }

        if rep.blocks.is_empty() {
            if !req.descripted.expired() {
                return Err(ChainErrorKind::Empty.at(req.msg.lower).into());
            }
            return Ok(());
        }
        if rep.blocks.len() != req.msg.count() as usize {
            return Err(ProtocolError::Malformed.into());
        }
        // discard replies overtaken by window movement or stage switches
        if req.msg.upper < self.focus.height_begin() {
            return Ok(());
        }
        if self.headers.length() < req.msg.upper {
            return Ok(());
        }
        if self.headers.hash_at(req.msg.upper.height()) != req.upper_hash {
            return Ok(());
        }

        let begin = self.focus.height_begin();
        let skip = if req.msg.lower < begin {
            (begin - req.msg.lower) as usize
        } else {
            0
        };
        let mut bundles = Vec::with_capacity(rep.blocks.len() - skip);
        for (i, body) in rep.blocks.into_iter().enumerate().skip(skip) {
            let height = req.msg.lower + i as u32;
            let header = self.headers.header_at(height);
            if !body.within_size_limit() {
                return Err(ProtocolError::Malformed.into());
            }
            if body.merkle_root(height) != header.merkle_root() {
                return Err(ChainErrorKind::MerkleRoot.at(height).into());
            }
            bundles.push(BlockBundle {
                height,
                header,
                body,
            });
        }
        self.focus.set_slot_blocks(bundles);
        Ok(())
    }

    //
    // request selection
    //

    pub fn do_probe_requests(&mut self, sender: &mut RequestSender<'_>) {
        if !self.initialized {
            return;
        }
        let focus_begin = self.focus.height_begin();
        for conn in sender.conns.ids() {
            if sender.finished() {
                return;
            }
            if !sender.job_free(conn) {
                continue;
            }
            let (fr, desc) = match (self.forks.fork_range(conn), self.forks.descripted(conn)) {
                (Some(fr), Some(d)) => (*fr, d.clone()),
                _ => continue,
            };
            let upper = if fr.forked() {
                fr.upper()
            } else {
                (self.headers.length().min(desc.chain_length()) + 1).nonzero_assert()
            };
            if upper > focus_begin {
                debug_assert!(upper >= fr.lower());
                let probe_height = fr.lower() + (upper - fr.lower()) / 2;
                if probe_height > fr.lower() {
                    sender.send(conn, PendingRequest::Probe(ProbeRequest::new(desc, probe_height)));
                }
            }
        }
    }

    fn can_do_requests(&self) -> bool {
        self.initialized &&
            !self.stage_state.is_stage_set_phase() &&
            self.reachable_length() >= Some(self.focus.height_begin().height())
    }

    pub fn do_peer_requests(&mut self, sender: &mut RequestSender<'_>) {
        if !self.can_do_requests() || sender.finished() {
            return;
        }
        debug_assert!(self.reachable_length() <= Some(self.headers.length()));

        let stage_length = self.headers.length();
        let headers = self.headers.clone();
        for open in self.focus.open_slots(stage_length) {
            if sender.finished() {
                return;
            }
            let serving = self
                .forks
                .covering(open.upper + 1)
                .find(|conn| sender.job_free(*conn) && !self.forks.descripted(*conn).expect("tracked").expired());
            let conn = match serving {
                Some(c) => c,
                None => continue,
            };
            let desc = self.forks.descripted(conn).expect("tracked").clone();
            let req = BlockRequest::new(desc, open.lower, open.upper, headers.hash_at(open.upper.height()));
            self.focus.assign(open.slot, conn);
            sender.send(conn, PendingRequest::Blocks(req));
        }
    }

    //
    // stage conversation
    //

    pub fn next_stage_call(&self) -> StageCall {
        if !self.initialized || self.stage_state.pending() {
            return StageCall::None;
        }
        if self.stage_state.is_stage_set_phase() {
            if self.stage_state.stage_set_ack() < self.headers.length() {
                return StageCall::Set;
            }
        } else if self.focus.has_data() {
            return StageCall::Add;
        }
        StageCall::None
    }

    pub fn pop_stage_set(&mut self) -> Arc<HeaderChain> {
        debug_assert_eq!(self.next_stage_call(), StageCall::Set);
        self.stage_state.begin_stage_set(self.headers.length());
        self.headers.clone()
    }

    pub fn pop_stage_add(&mut self) -> (Arc<HeaderChain>, Vec<BlockBundle>) {
        debug_assert_eq!(self.next_stage_call(), StageCall::Add);
        let ban_memory = self.forks.ban_memory(self.focus.height_begin());
        self.stage_state.begin_stage_add(ban_memory);
        (self.headers.clone(), self.focus.pop_data())
    }

    /// Returns true when the stage must be torn down (the applier aborted the set).
    pub fn on_stage_set_result(&mut self, status: &StageSetStatus) -> bool {
        match self.stage_state.on_set_result(status) {
            Some(offset) => {
                self.focus.set_offset(offset.prev());
                false
            },
            None => true,
        }
    }

    /// Offenders plus whether the stage must be torn down (a body failed validation).
    pub fn on_stage_add_result(&mut self, status: &StageAddStatus) -> (Vec<ChainOffender>, bool) {
        let offenders = self.stage_state.on_add_result(status);
        (offenders, status.error.is_some())
    }

    fn update_reachable(&mut self, reset: bool) -> bool {
        match self.forks.reachable_length() {
            None => {
                self.initialized = false;
                self.stage_state.clear();
                self.reachable_work = Worksum::zero();
                self.reachable_height = Height::zero();
                true
            },
            Some(reachable) => {
                if reset || reachable != self.reachable_height {
                    self.reachable_work = self.headers.total_work_at(reachable.min(self.headers.length()));
                    self.reachable_height = reachable;
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Everything downloadable here is already outweighed; stop.
    pub fn set_min_worksum(&mut self, ws: Worksum) {
        if !self.initialized {
            return;
        }
        if ws >= self.headers.total_work() {
            debug!(target: LOG_TARGET, "Disabling block download, stage outweighed");
            self.initialized = false;
            self.stage_state.clear();
        }
    }
}
