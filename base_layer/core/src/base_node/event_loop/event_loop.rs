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

use std::{
    sync::Arc,
    time::Instant,
};

use log::*;
use tokio::sync::mpsc;
use warthog_common_types::{Height, HEADER_BATCH_SIZE};

use crate::{
    base_node::{
        event_loop::{
            connection::{ConnectionId, ConnectionMap, ConnectionState},
            events::{CloseReason, Event, Outbound},
            request::{PendingRequest, RequestSender},
            timer::{TimerEvent, TimerSystem},
        },
        sync::{
            block_sync::{BlockDownloader, StageCall, StageOperations},
            header_sync::HeaderDownloader,
            offender::ChainOffender,
            SyncConfig,
            SyncState,
        },
    },
    chain::{
        chain_cache::{ConsensusState, ConsensusUpdate, StageAndConsensus},
        batch_registry::BatchRegistry,
        signed_snapshot::{SignedSnapshot, SnapshotAuthority},
    },
    message::{
        BatchRepMsg,
        BlockRepMsg,
        InitMsg,
        Msg,
        PingMsg,
        PongMsg,
        ProbeRepMsg,
        ProbeReqMsg,
        ProtocolError,
    },
    proof_of_work::PowVerifier,
};

const LOG_TARGET: &str = "c::bn::event_loop";

/// Posting side of the event queue, held by transport and applier threads.
#[derive(Debug, Clone)]
pub struct EventLoopHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventLoopHandle {
    pub fn post(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown);
    }
}

/// The single-threaded cooperative sync core: one worker drains the event queue, every handler
/// runs to completion, and all mutable sync state lives here. Timers interleave with messages by
/// wakeup time; within one tick, timers fire first.
pub struct EventLoop<O: Outbound, S: StageOperations> {
    config: SyncConfig,
    chains: StageAndConsensus,
    conns: ConnectionMap,
    timers: TimerSystem,
    header_download: HeaderDownloader,
    block_download: BlockDownloader,
    sync_state: SyncState,
    active_requests: usize,
    authority: Arc<dyn SnapshotAuthority>,
    outbound: O,
    stage: S,
    events: mpsc::UnboundedReceiver<Event>,
    outbox: Vec<(ConnectionId, Msg)>,
    pending_close: Vec<(ConnectionId, CloseReason)>,
}

impl<O: Outbound, S: StageOperations> EventLoop<O, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        consensus: ConsensusState,
        registry: Arc<BatchRegistry>,
        pow: Arc<dyn PowVerifier>,
        authority: Arc<dyn SnapshotAuthority>,
        outbound: O,
        stage: S,
    ) -> (Self, EventLoopHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let min_work = consensus.total_work();
        let chains = StageAndConsensus::new(consensus, pow.clone());
        let header_download = HeaderDownloader::new(registry, pow, &config, min_work);
        let block_download = BlockDownloader::new(&config);
        let this = Self {
            config,
            chains,
            conns: ConnectionMap::new(),
            timers: TimerSystem::new(),
            header_download,
            block_download,
            sync_state: SyncState::default(),
            active_requests: 0,
            authority,
            outbound,
            stage,
            events: rx,
            outbox: Vec::new(),
            pending_close: Vec::new(),
        };
        (this, EventLoopHandle { tx })
    }

    pub fn chains(&self) -> &StageAndConsensus {
        &self.chains
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Runs until shutdown, alternating between queued events and expired timers.
    pub async fn run(mut self) {
        loop {
            let wakeup = self.timers.next_wakeup();
            // within one tick, due timers fire before new message events
            tokio::select! {
                biased;
                _ = sleep_until_opt(wakeup) => {
                    self.fire_timers();
                },
                event = self.events.recv() => {
                    match event {
                        None | Some(Event::Shutdown) => {
                            debug!(target: LOG_TARGET, "Sync event loop shutting down");
                            return;
                        },
                        Some(event) => self.process(event),
                    }
                },
            }
        }
    }

    /// Processes one event to completion, then performs the post-event duties: deferred
    /// connection teardown, sync coordination, request dispatch, stage calls, and flushing
    /// outbound traffic.
    pub fn process(&mut self, event: Event) {
        trace!(target: LOG_TARGET, "Processing event: {}", event);
        match event {
            Event::Connected(conn) => self.handle_connected(conn),
            Event::Disconnected(conn) => self.erase_connection(conn),
            Event::Message(conn, msg) => {
                if let Err(reason) = self.handle_message(conn, msg) {
                    self.close(conn, reason);
                }
            },
            Event::ConsensusUpdate(update) => self.update_chain(update),
            Event::StageSetResult(status) => {
                if self.block_download.on_stage_set_result(&status) {
                    self.teardown_stage();
                }
            },
            Event::StageAddResult(status) => {
                let (offenders, reset) = self.block_download.on_stage_add_result(&status);
                self.close_offenders(offenders);
                if reset {
                    self.teardown_stage();
                }
            },
            Event::Shutdown => {},
        }
        self.after_event();
    }

    pub fn fire_timers(&mut self) {
        self.fire_timers_at(Instant::now());
    }

    pub fn fire_timers_at(&mut self, now: Instant) {
        for event in self.timers.pop_expired(now) {
            self.handle_timer(event);
        }
        self.after_event();
    }

    fn after_event(&mut self) {
        self.drain_pending_closes();
        self.coordinate_sync();
        self.do_requests();
        self.dispatch_stage_calls();
        self.update_sync_state();
        self.flush_outbox();
        self.drain_pending_closes();
    }

    //
    // connection lifecycle
    //

    fn handle_connected(&mut self, conn: ConnectionId) {
        if self.conns.insert(ConnectionState::new(conn)).is_err() {
            warn!(target: LOG_TARGET, "Duplicate connection id {}", conn);
            self.outbound.close(conn, ProtocolError::DuplicateConnection.into());
            return;
        }
        debug!(target: LOG_TARGET, "Connection {} registered", conn);
        self.send_init(conn);
        let at = Instant::now() + self.config.ping_interval;
        let key = self.timers.insert(at, TimerEvent::SendPing { conn });
        self.conns.get_mut(conn).expect("just inserted").ping_timer = Some(key);
    }

    fn send_init(&mut self, conn: ConnectionId) {
        let consensus = self.chains.consensus_state();
        let msg = InitMsg {
            descriptor: consensus.descriptor(),
            priority: consensus.snapshot_priority(),
            chain_length: consensus.headers().length(),
            worksum: consensus.total_work(),
            grid: consensus.grid(),
        };
        self.outbox.push((conn, Msg::Init(msg)));
    }

    fn close(&mut self, conn: ConnectionId, reason: CloseReason) {
        warn!(target: LOG_TARGET, "Closing connection {}: {}", conn, reason);
        self.pending_close.push((conn, reason));
    }

    fn close_offenders(&mut self, offenders: Vec<ChainOffender>) {
        for offender in offenders {
            self.close(offender.conn, offender.error.into());
        }
    }

    fn drain_pending_closes(&mut self) {
        while let Some((conn, reason)) = self.pending_close.pop() {
            if self.conns.contains(conn) {
                self.outbound.close(conn, reason);
                self.erase_connection(conn);
            }
        }
    }

    /// Removes the connection from every per-peer container and releases its request slot.
    fn erase_connection(&mut self, conn: ConnectionId) {
        let state = match self.conns.remove(conn) {
            Some(s) => s,
            None => return,
        };
        let (pending, timer) = {
            let mut job = state.job;
            job.take()
        };
        if pending.is_some() {
            debug_assert!(self.active_requests > 0);
            self.active_requests -= 1;
        }
        if let Some(key) = timer {
            self.timers.cancel(key);
        }
        if let Some(key) = state.ping_timer {
            self.timers.cancel(key);
        }
        self.header_download.erase(conn);
        self.block_download.erase(conn);
        self.header_download.reselect(&self.conns, &self.chains);
        debug!(target: LOG_TARGET, "Connection {} erased", conn);
    }

    //
    // message dispatch
    //

    fn handle_message(&mut self, conn: ConnectionId, msg: Msg) -> Result<(), CloseReason> {
        if !self.conns.contains(conn) {
            return Ok(());
        }
        let now = Instant::now();
        match &msg {
            Msg::Ping(_) => {
                let state = self.conns.get_mut(conn).expect("checked above");
                state.ratelimit.ping(now, self.config.ping_interval)?;
            },
            // structural announcements are rare by nature; appends are bounded by the strict
            // growth their descriptor object enforces
            Msg::Fork(_) | Msg::SignedPinRollback(_) | Msg::Leader(_) => {
                let state = self.conns.get_mut(conn).expect("checked above");
                state.ratelimit.update(now, self.config.message_interval)?;
            },
            _ => {},
        }

        match msg {
            Msg::Init(m) => self.handle_init(conn, m),
            Msg::Append(m) => self.handle_append(conn, m),
            Msg::Fork(m) => self.handle_fork(conn, m),
            Msg::SignedPinRollback(m) => self.handle_rollback(conn, m),
            Msg::Ping(m) => self.handle_ping(conn, m),
            Msg::Pong(m) => self.handle_pong(conn, m),
            Msg::BatchReq(m) => self.handle_batch_req(conn, m),
            Msg::BatchRep(m) => self.handle_batch_rep(conn, m),
            Msg::ProbeReq(m) => self.handle_probe_req(conn, m),
            Msg::ProbeRep(m) => self.handle_probe_rep(conn, m),
            Msg::BlockReq(m) => self.handle_block_req(conn, m),
            Msg::BlockRep(m) => self.handle_block_rep(conn, m),
            Msg::Leader(m) => self.handle_leader(conn, m),
            // mempool path, out of scope for the sync core
            Msg::TxSubscribe(_) | Msg::TxNotify(_) | Msg::TxReq(_) | Msg::TxRep(_) => Ok(()),
        }
    }

    fn handle_init(&mut self, conn: ConnectionId, msg: InitMsg) -> Result<(), CloseReason> {
        let state = self.conns.get_mut(conn).expect("caller checked");
        if state.initialized() {
            return Err(ProtocolError::Malformed.into());
        }
        let peer_chain = crate::base_node::peer_chain::PeerChain::new(&msg, &self.chains)?;
        state.chain = Some(peer_chain);
        state.their_snapshot_priority = msg.priority;
        info!(
            target: LOG_TARGET,
            "Peer {} announced chain of length {} under descriptor {}", conn, msg.chain_length, msg.descriptor
        );
        self.header_download.insert(conn, &self.conns, &self.chains);
        self.block_download.insert(conn, &self.conns);
        self.consider_send_snapshot(conn);
        Ok(())
    }

    fn handle_append(&mut self, conn: ConnectionId, msg: crate::message::AppendMsg) -> Result<(), CloseReason> {
        let state = self.conns.get_mut(conn).expect("caller checked");
        if !state.initialized() {
            return Err(ProtocolError::Malformed.into());
        }
        state.chain_mut().on_peer_append(&msg, &self.chains)?;
        self.header_download.on_append(conn, &self.conns, &self.chains);
        self.block_download.on_append(conn, &self.conns);
        Ok(())
    }

    fn handle_fork(&mut self, conn: ConnectionId, msg: crate::message::ForkMsg) -> Result<(), CloseReason> {
        let state = self.conns.get_mut(conn).expect("caller checked");
        if !state.initialized() {
            return Err(ProtocolError::Malformed.into());
        }
        state.chain_mut().on_peer_fork(&msg, &self.chains)?;
        self.header_download.on_fork(conn, &self.conns, &self.chains);
        self.block_download.on_fork(conn, &self.conns);
        Ok(())
    }

    fn handle_rollback(
        &mut self,
        conn: ConnectionId,
        msg: crate::message::SignedPinRollbackMsg,
    ) -> Result<(), CloseReason> {
        let snapshot = SignedSnapshot::assemble(
            msg.snapshot.height,
            msg.snapshot.hash,
            msg.snapshot.signature,
            &*self.authority,
        )?;
        let state = self.conns.get_mut(conn).expect("caller checked");
        if !state.initialized() {
            return Err(ProtocolError::Malformed.into());
        }
        // a rollback must be justified: the announced chain may keep nothing above the snapshot
        if msg.shrink_length > snapshot.height() {
            return Err(ProtocolError::Malformed.into());
        }
        state.chain_mut().on_peer_rollback(&msg, &self.chains)?;
        state.their_snapshot_priority = snapshot.priority.into();
        self.header_download.on_rollback(conn, &self.conns, &self.chains);
        self.block_download.on_rollback(conn);
        self.forward_snapshot(snapshot);
        Ok(())
    }

    fn handle_ping(&mut self, conn: ConnectionId, msg: PingMsg) -> Result<(), CloseReason> {
        let state = self.conns.get_mut(conn).expect("caller checked");
        state.their_snapshot_priority = msg.priority;
        self.outbox.push((conn, Msg::Pong(PongMsg {
            nonce: msg.nonce,
            addresses: Vec::new(),
            txids: Vec::new(),
        })));
        self.consider_send_snapshot(conn);
        Ok(())
    }

    fn handle_pong(&mut self, conn: ConnectionId, msg: PongMsg) -> Result<(), CloseReason> {
        let ping_period = self.config.request_timeout;
        let state = self.conns.get_mut(conn).expect("caller checked");
        if state.ping_nonce != Some(msg.nonce) {
            return Err(ProtocolError::Unrequested.into());
        }
        state.ping_nonce = None;
        if let Some(key) = state.ping_timer.take() {
            self.timers.cancel(key);
        }
        let key = self
            .timers
            .insert(Instant::now() + ping_period, TimerEvent::SendPing { conn });
        self.conns.get_mut(conn).expect("caller checked").ping_timer = Some(key);
        Ok(())
    }

    fn handle_batch_req(&mut self, conn: ConnectionId, msg: crate::message::BatchReqMsg) -> Result<(), CloseReason> {
        if u32::from(msg.length) > HEADER_BATCH_SIZE || msg.length == 0 {
            return Err(ProtocolError::Malformed.into());
        }
        let consensus = self.chains.consensus_state();
        let batch = if msg.descriptor == consensus.descriptor() {
            let end = msg.start_height + u32::from(msg.length);
            consensus.headers().get_headers(msg.start_height, end)
        } else {
            crate::chain::batch::Batch::new()
        };
        self.outbox.push((conn, Msg::BatchRep(BatchRepMsg {
            nonce: msg.nonce,
            batch,
        })));
        Ok(())
    }

    fn handle_batch_rep(&mut self, conn: ConnectionId, msg: BatchRepMsg) -> Result<(), CloseReason> {
        let request = self.pop_reply(conn, msg.nonce)?;
        let req = match request {
            PendingRequest::Headers(r) => r,
            _ => return Err(ProtocolError::Unrequested.into()),
        };
        if msg.batch.is_empty() && req.descripted.expired() {
            return Ok(());
        }
        if msg.batch.len() < req.min_return() || msg.batch.len() > req.max_return() {
            return Err(ProtocolError::BatchOversized.into());
        }
        let offenders = self
            .header_download
            .on_response(conn, req, msg.batch, &self.conns, &self.chains);
        self.close_offenders(offenders);
        Ok(())
    }

    fn handle_probe_req(&mut self, conn: ConnectionId, msg: ProbeReqMsg) -> Result<(), CloseReason> {
        let consensus = self.chains.consensus_state();
        let covered = consensus.headers().length() >= msg.height;
        let header = if covered {
            Some(consensus.headers().header_at(msg.height))
        } else {
            None
        };
        let requested = if msg.descriptor == consensus.descriptor() { header } else { None };
        self.outbox.push((conn, Msg::ProbeRep(ProbeRepMsg {
            nonce: msg.nonce,
            current_descriptor: consensus.descriptor(),
            requested,
            current: header,
        })));
        Ok(())
    }

    fn handle_probe_rep(&mut self, conn: ConnectionId, msg: ProbeRepMsg) -> Result<(), CloseReason> {
        let request = self.pop_reply(conn, msg.nonce)?;
        let req = match request {
            PendingRequest::Probe(r) => r,
            _ => return Err(ProtocolError::Unrequested.into()),
        };
        {
            let state = self.conns.get_mut(conn).expect("caller checked");
            if !state.initialized() {
                return Err(ProtocolError::Malformed.into());
            }
            state.chain_mut().on_probe_reply(&req.msg, &msg, &self.chains)?;
        }
        self.header_download.on_probe_reply(conn, &req, &msg)?;
        self.block_download
            .on_probe_reply(conn, &req.msg, msg.requested.as_ref(), &self.conns)?;
        Ok(())
    }

    fn handle_block_req(&mut self, conn: ConnectionId, msg: crate::message::BlockReqMsg) -> Result<(), CloseReason> {
        if msg.descriptor == self.chains.consensus_state().descriptor() {
            self.stage.serve_blocks(conn, msg);
        } else {
            self.outbox.push((conn, Msg::BlockRep(BlockRepMsg {
                nonce: msg.nonce,
                blocks: Vec::new(),
            })));
        }
        Ok(())
    }

    fn handle_block_rep(&mut self, conn: ConnectionId, msg: BlockRepMsg) -> Result<(), CloseReason> {
        let request = self.pop_reply(conn, msg.nonce)?;
        let req = match request {
            PendingRequest::Blocks(r) => r,
            _ => return Err(ProtocolError::Unrequested.into()),
        };
        self.block_download.on_block_reply(conn, &req, msg)?;
        Ok(())
    }

    fn handle_leader(&mut self, conn: ConnectionId, msg: crate::message::LeaderMsg) -> Result<(), CloseReason> {
        let snapshot = SignedSnapshot::assemble(
            msg.snapshot.height,
            msg.snapshot.hash,
            msg.snapshot.signature,
            &*self.authority,
        )?;
        let state = self.conns.get_mut(conn).expect("caller checked");
        state.their_snapshot_priority = snapshot.priority.into();
        self.forward_snapshot(snapshot);
        Ok(())
    }

    fn forward_snapshot(&mut self, snapshot: SignedSnapshot) {
        let current = self.chains.consensus_state().snapshot_priority();
        if current < snapshot.priority.into() {
            self.stage.on_signed_snapshot(snapshot);
        }
    }

    fn consider_send_snapshot(&mut self, conn: ConnectionId) {
        let snapshot = match self.chains.signed_snapshot() {
            Some(ss) => *ss,
            None => return,
        };
        let state = self.conns.get_mut(conn).expect("connection exists");
        if state.acknowledged_snapshot_priority < snapshot.priority.into() {
            state.acknowledged_snapshot_priority = snapshot.priority.into();
            self.outbox.push((conn, Msg::Leader(crate::message::LeaderMsg {
                snapshot: crate::message::UnverifiedSnapshot {
                    height: snapshot.height(),
                    hash: snapshot.hash,
                    signature: snapshot.signature,
                },
            })));
        }
    }

    fn pop_reply(&mut self, conn: ConnectionId, nonce: u32) -> Result<PendingRequest, CloseReason> {
        let state = self.conns.get_mut(conn).expect("caller checked");
        let (request, timer) = state.job.pop_matching(nonce)?;
        if let Some(key) = timer {
            self.timers.cancel(key);
        }
        debug_assert!(self.active_requests > 0);
        self.active_requests -= 1;
        Ok(request)
    }

    //
    // timers
    //

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::RequestExpire { conn, nonce } => {
                let expired = match self.conns.get_mut(conn) {
                    Some(state) => state.job.pop_expired(nonce),
                    None => None,
                };
                let request = match expired {
                    Some(r) => r,
                    None => return,
                };
                debug_assert!(self.active_requests > 0);
                self.active_requests -= 1;
                debug!(
                    target: LOG_TARGET,
                    "{} to connection {} expired", request.name(), conn
                );
                match &request {
                    PendingRequest::Probe(_) => {
                        self.header_download.on_probe_expire(conn);
                        self.block_download.on_probe_expire(conn);
                    },
                    PendingRequest::Headers(req) => {
                        self.header_download.on_request_expire(conn, req);
                        self.close(conn, ProtocolError::Timeout.into());
                    },
                    PendingRequest::Blocks(_) => {
                        self.block_download.on_block_expire(conn);
                        self.close(conn, ProtocolError::Timeout.into());
                    },
                }
            },
            TimerEvent::SendPing { conn } => self.send_ping(conn),
            TimerEvent::CloseNoPong { conn, nonce } => {
                let unanswered = self
                    .conns
                    .get(conn)
                    .map(|s| s.ping_nonce == Some(nonce))
                    .unwrap_or(false);
                if unanswered {
                    self.close(conn, ProtocolError::Timeout.into());
                }
            },
        }
    }

    fn send_ping(&mut self, conn: ConnectionId) {
        let priority = self.chains.consensus_state().snapshot_priority();
        let state = match self.conns.get_mut(conn) {
            Some(s) => s,
            None => return,
        };
        let nonce = rand::random();
        state.ping_nonce = Some(nonce);
        let key = self.timers.insert(
            Instant::now() + self.config.request_timeout,
            TimerEvent::CloseNoPong { conn, nonce },
        );
        self.conns.get_mut(conn).expect("present above").ping_timer = Some(key);
        self.outbox.push((conn, Msg::Ping(PingMsg {
            nonce,
            priority,
            max_addresses: 5,
            max_transactions: 100,
        })));
    }

    //
    // consensus updates from the applier
    //

    fn update_chain(&mut self, update: ConsensusUpdate) {
        match update {
            ConsensusUpdate::Append(append) => {
                let msg = self.chains.update_consensus_append(append);
                let mut offenders = Vec::new();
                for conn in self.conns.ids() {
                    let state = self.conns.get_mut(conn).expect("id just listed");
                    if !state.initialized() {
                        continue;
                    }
                    if let Err(e) = state.chain_mut().on_consensus_append(&self.chains) {
                        offenders.push(ChainOffender::new(e, conn));
                        continue;
                    }
                    self.outbox.push((conn, Msg::Append(msg.clone())));
                }
                self.close_offenders(offenders);
            },
            ConsensusUpdate::Fork(fork) => {
                let msg = self.chains.update_consensus_fork(fork);
                let fork_height = msg.fork_height;
                let mut offenders = Vec::new();
                for conn in self.conns.ids() {
                    let state = self.conns.get_mut(conn).expect("id just listed");
                    if !state.initialized() {
                        continue;
                    }
                    if let Err(e) = state.chain_mut().on_consensus_fork(fork_height, &self.chains) {
                        offenders.push(ChainOffender::new(e, conn));
                        continue;
                    }
                    self.outbox.push((conn, Msg::Fork(msg.clone())));
                }
                self.close_offenders(offenders);
            },
            ConsensusUpdate::Rollback(data) => {
                let msg = self.chains.update_consensus_rollback(&data);
                for conn in self.conns.ids() {
                    let state = self.conns.get_mut(conn).expect("id just listed");
                    if !state.initialized() {
                        continue;
                    }
                    state.chain_mut().on_consensus_shrink(&self.chains);
                    if let Some(msg) = &msg {
                        self.outbox.push((conn, Msg::SignedPinRollback(*msg)));
                    }
                }
                self.header_download.on_signed_snapshot_update(&self.conns, &self.chains);
                for conn in self.conns.ids() {
                    self.consider_send_snapshot(conn);
                }
            },
        }
        let floor = self
            .chains
            .consensus_state()
            .total_work()
            .max(self.chains.stage_headers().total_work());
        self.header_download.set_min_worksum(floor, &self.conns, &self.chains);
        self.block_download
            .set_min_worksum(self.chains.consensus_state().total_work());
    }

    fn teardown_stage(&mut self) {
        self.block_download.reset();
        self.chains.stage_clear();
        for conn in self.conns.ids() {
            let state = self.conns.get_mut(conn).expect("id just listed");
            if state.initialized() {
                state.chain_mut().on_stage_set(Height::zero());
            }
        }
    }

    //
    // coordination
    //

    fn coordinate_sync(&mut self) {
        if let Some((leader, chain)) = self.header_download.pop_data(&self.conns, &self.chains) {
            info!(
                target: LOG_TARGET,
                "Handing over candidate chain of length {} from leader {}", chain.length(), leader.0
            );
            let fork_height = self.chains.update_stage(chain);
            let offenders =
                self.block_download
                    .init(leader, fork_height, self.chains.stage_pin(), &mut self.conns);
            self.close_offenders(offenders);
        }
    }

    fn do_requests(&mut self) {
        let mut sender = RequestSender {
            conns: &mut self.conns,
            timers: &mut self.timers,
            outbox: &mut self.outbox,
            active_requests: &mut self.active_requests,
            max_requests: self.config.max_requests,
            timeout: self.config.request_timeout,
            now: Instant::now(),
        };
        let offenders = self.header_download.do_requests(&mut sender, &self.chains);
        self.block_download.do_peer_requests(&mut RequestSender {
            conns: &mut self.conns,
            timers: &mut self.timers,
            outbox: &mut self.outbox,
            active_requests: &mut self.active_requests,
            max_requests: self.config.max_requests,
            timeout: self.config.request_timeout,
            now: Instant::now(),
        });
        self.header_download.do_probe_requests(&mut RequestSender {
            conns: &mut self.conns,
            timers: &mut self.timers,
            outbox: &mut self.outbox,
            active_requests: &mut self.active_requests,
            max_requests: self.config.max_requests,
            timeout: self.config.request_timeout,
            now: Instant::now(),
        });
        self.block_download.do_probe_requests(&mut RequestSender {
            conns: &mut self.conns,
            timers: &mut self.timers,
            outbox: &mut self.outbox,
            active_requests: &mut self.active_requests,
            max_requests: self.config.max_requests,
            timeout: self.config.request_timeout,
            now: Instant::now(),
        });
        self.close_offenders(offenders);
    }

    fn dispatch_stage_calls(&mut self) {
        match self.block_download.next_stage_call() {
            StageCall::Set => {
                let headers = self.block_download.pop_stage_set();
                self.stage.stage_set(headers);
            },
            StageCall::Add => {
                let (headers, blocks) = self.block_download.pop_stage_add();
                self.stage.stage_add(headers, blocks);
            },
            StageCall::None => {},
        }
    }

    fn update_sync_state(&mut self) {
        let has_connections = self.conns.ids().iter().any(|c| {
            self.conns
                .get(*c)
                .map(|s| s.initialized())
                .unwrap_or(false)
        });
        self.sync_state.set_has_connections(has_connections);
        self.sync_state.set_header_download(self.header_download.is_active());
        self.sync_state.set_block_download(self.block_download.is_active());
        if let Some(synced) = self.sync_state.detect_change() {
            info!(target: LOG_TARGET, "Sync state changed: synced = {}", synced);
            self.outbound.sync_state(synced);
        }
    }

    fn flush_outbox(&mut self) {
        for (conn, msg) in self.outbox.drain(..) {
            self.outbound.send(conn, msg);
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}
