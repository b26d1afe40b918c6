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
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
};

use log::*;
use warthog_common_types::{BatchSlot, Descriptor, NonzeroHeight};

use crate::{
    base_node::{
        event_loop::{
            connection::{ConnectionId, ConnectionMap},
            request::{HeaderRequest, HeaderRequestKind, PendingRequest, ProbeRequest, RequestSender},
        },
        sync::{
            config::SyncConfig,
            header_sync::probe::{self, ProbeData},
            offender::ChainOffender,
        },
    },
    blocks::BlockHeader,
    chain::{
        batch::{Batch, ChainPin},
        batch_registry::{BatchRegistry, SharedBatch},
        chain_cache::StageAndConsensus,
        descripted::Descripted,
        error::ChainErrorKind,
        header_chain::{ChainSkeleton, HeaderChain, HeaderSpan},
        verifier::HeaderVerifier,
    },
    consensus,
    message::ProbeRepMsg,
    proof_of_work::{PowVerifier, Worksum},
};

const LOG_TARGET: &str = "c::bn::header_sync";

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    prev: Option<BlockHeader>,
    key: BlockHeader,
}

/// One content-addressed batch wanted by one or more leaders. The request is shared: sent to one
/// peer at a time, validated against every leader that wants it.
#[derive(Debug, Default)]
struct QueuedBatch {
    pending_on: Option<ConnectionId>,
    origin: Option<ConnectionId>,
    batch: Option<Batch>,
    leader_refs: BTreeSet<ConnectionId>,
    probe_refs: Vec<ConnectionId>,
}

/// A verified chain prefix ending in a shared batch, refcounted by the leaders building on it.
struct VerifierNode {
    refcount: usize,
    verifier: HeaderVerifier,
    pin: SharedBatch,
}

/// A peer whose claimed worksum exceeds everything currently downloadable. The descriptor object
/// is snapshotted at election time.
struct LeaderNode {
    descripted: Arc<Descripted>,
    length: NonzeroHeight,
    worksum: Worksum,
    final_batch: Option<(Batch, Worksum)>,
    queued: VecDeque<QueueEntry>,
    /// Key of the verified prefix this leader builds on; `None` means from genesis.
    verifier: Option<BlockHeader>,
    probe: ProbeData,
}

impl LeaderNode {
    fn final_slot(&self) -> BatchSlot {
        BatchSlot::of_height(self.length)
    }
}

/// A probing side-job on a non-leader connection, tied to the queued batch it disambiguates.
struct ConnectionProbe {
    probe: ProbeData,
    descripted: Arc<Descripted>,
    batch_key: BlockHeader,
}

#[derive(Default)]
struct ConnData {
    ignore_descriptor: Option<Descriptor>,
    job_batch: Option<BlockHeader>,
    probe: Option<ConnectionProbe>,
}

struct Maximizer {
    conn: ConnectionId,
    descripted: Arc<Descripted>,
    skeleton: ChainSkeleton,
    worksum: Worksum,
}

struct ReqData {
    key: BlockHeader,
    slot: BatchSlot,
    cache_match: Option<crate::chain::chain_cache::ChainCacheMatch>,
}

/// Elects leaders, pipelines shared batch requests across all peers whose grids prove they hold
/// a batch, verifies replies and tracks the heaviest verified candidate chain.
pub struct HeaderDownloader {
    registry: Arc<BatchRegistry>,
    pow: Arc<dyn PowVerifier>,
    pending_depth: usize,
    max_leaders: usize,
    connections: Vec<ConnectionId>,
    conn_data: HashMap<ConnectionId, ConnData>,
    leaders: BTreeMap<ConnectionId, LeaderNode>,
    verifiers: HashMap<BlockHeader, VerifierNode>,
    queued: HashMap<BlockHeader, QueuedBatch>,
    maximizer: Option<Maximizer>,
    min_work: Worksum,
}

impl HeaderDownloader {
    pub fn new(
        registry: Arc<BatchRegistry>,
        pow: Arc<dyn PowVerifier>,
        config: &SyncConfig,
        min_work: Worksum,
    ) -> Self {
        Self {
            registry,
            pow,
            pending_depth: config.pending_depth,
            max_leaders: config.max_leaders,
            connections: Vec::new(),
            conn_data: HashMap::new(),
            leaders: BTreeMap::new(),
            verifiers: HashMap::new(),
            queued: HashMap::new(),
            maximizer: None,
            min_work,
        }
    }

    /// Header download is active while any leader is elected.
    pub fn is_active(&self) -> bool {
        !self.leaders.is_empty()
    }

    pub fn min_work(&self) -> Worksum {
        self.min_work
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_leader(&self, conn: ConnectionId) -> bool {
        self.leaders.contains_key(&conn)
    }

    fn data_mut(&mut self, conn: ConnectionId) -> &mut ConnData {
        self.conn_data.entry(conn).or_default()
    }

    pub fn insert(&mut self, conn: ConnectionId, conns: &ConnectionMap, chains: &StageAndConsensus) {
        self.connections.push(conn);
        self.conn_data.insert(conn, ConnData::default());
        self.consider_insert_leader(conn, conns, chains);
    }

    pub fn erase(&mut self, conn: ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|c| *c != conn);
        if self.connections.len() == before {
            return false;
        }
        self.clear_connection_probe(conn, true);
        if self.maximizer.as_ref().map(|m| m.conn == conn).unwrap_or(false) {
            self.maximizer = None;
        }
        if self.is_leader(conn) {
            self.erase_leader(conn);
        }
        if let Some(key) = self.data_mut(conn).job_batch.take() {
            if let Some(qb) = self.queued.get_mut(&key) {
                if qb.pending_on == Some(conn) {
                    qb.pending_on = None;
                }
            }
        }
        self.conn_data.remove(&conn);
        true
    }

    pub fn on_append(&mut self, conn: ConnectionId, conns: &ConnectionMap, chains: &StageAndConsensus) {
        self.consider_insert_leader(conn, conns, chains);
    }

    pub fn on_fork(&mut self, conn: ConnectionId, conns: &ConnectionMap, chains: &StageAndConsensus) {
        self.consider_insert_leader(conn, conns, chains);
    }

    pub fn on_rollback(&mut self, conn: ConnectionId, conns: &ConnectionMap, chains: &StageAndConsensus) {
        if self.is_leader(conn) {
            self.erase_leader(conn);
        }
        self.consider_insert_leader(conn, conns, chains);
    }

    pub fn on_signed_snapshot_update(&mut self, conns: &ConnectionMap, chains: &StageAndConsensus) {
        if let (Some(m), Some(ss)) = (&self.maximizer, chains.signed_snapshot()) {
            if !ss.compatible_skeleton(&m.skeleton) {
                self.maximizer = None;
            }
        }
        self.prune_leaders();
        self.select_leaders(conns, chains);
    }

    pub fn set_min_worksum(&mut self, ws: Worksum, conns: &ConnectionMap, chains: &StageAndConsensus) {
        if self.min_work != ws {
            debug!(target: LOG_TARGET, "Header download min work set to {}", ws);
            self.min_work = ws;
            self.prune_leaders();
            self.select_leaders(conns, chains);
        }
    }

    /// The heaviest verified chain, once it outweighs everything already handed over. Raises the
    /// download threshold to its worksum.
    pub fn pop_data(
        &mut self,
        conns: &ConnectionMap,
        chains: &StageAndConsensus,
    ) -> Option<((ConnectionId, Arc<Descripted>), HeaderChain)> {
        if !self.has_data() {
            return None;
        }
        let m = self.maximizer.as_ref().expect("has_data checked");
        let chain = HeaderChain::from_skeleton(m.skeleton.clone());
        debug_assert_eq!(chain.total_work(), m.worksum);
        let out = ((m.conn, m.descripted.clone()), chain);
        let new_min = out.1.total_work();
        self.set_min_worksum(new_min, conns, chains);
        Some(out)
    }

    fn has_data(&self) -> bool {
        self.maximizer.as_ref().map(|m| m.worksum > self.min_work).unwrap_or(false)
    }

    //
    // leader bookkeeping
    //

    fn can_insert_leader(&self, conn: ConnectionId, conns: &ConnectionMap) -> bool {
        if self.is_leader(conn) || self.leaders.len() >= self.max_leaders {
            return false;
        }
        let state = match conns.get(conn) {
            Some(s) if s.initialized() => s,
            _ => return false,
        };
        let desc = state.chain().descripted();
        let ignored = self
            .conn_data
            .get(&conn)
            .and_then(|d| d.ignore_descriptor)
            .map(|d| d == desc.descriptor())
            .unwrap_or(false);
        desc.worksum() > self.min_work &&
            desc.with_grid(|g| g.valid_checkpoint(consensus::checkpoint())) &&
            !desc.chain_length().is_zero() &&
            !ignored
    }

    fn consider_insert_leader(
        &mut self,
        conn: ConnectionId,
        conns: &ConnectionMap,
        chains: &StageAndConsensus,
    ) -> bool {
        if !self.can_insert_leader(conn, conns) {
            return false;
        }
        let state = conns.get(conn).expect("checked in can_insert_leader");
        let desc = state.chain().descripted().clone();
        let length = desc.chain_length().nonzero_assert();
        let worksum = desc.worksum();

        let pin = match desc.with_grid(|g| self.registry.find_last(g, chains.signed_snapshot())) {
            Ok(pin) => pin,
            Err(_) => return false,
        };
        if let Some(pin) = &pin {
            debug!(
                target: LOG_TARGET,
                "Leader {} resumes from verified slot range [{},{}]",
                conn,
                pin.lower_height(),
                pin.upper_height()
            );
            if !self.valid_shared_batch(pin, chains) {
                return false;
            }
        }

        let peer_chain = state.chain();
        let probe = if peer_chain.stage_fork_range().lower() > peer_chain.consensus_fork_range().lower() {
            ProbeData::new(*peer_chain.stage_fork_range(), chains.stage_pin())
        } else {
            ProbeData::new(*peer_chain.consensus_fork_range(), chains.consensus_pin())
        };

        let verifier = pin.map(|pin| {
            let key = pin.last_header();
            self.acquire_verifier(pin);
            key
        });
        self.leaders.insert(conn, LeaderNode {
            descripted: desc,
            length,
            worksum,
            final_batch: None,
            queued: VecDeque::new(),
            verifier,
            probe,
        });
        self.queue_requests(conn);
        true
    }

    fn valid_shared_batch(&self, pin: &SharedBatch, chains: &StageAndConsensus) -> bool {
        match chains.signed_snapshot() {
            Some(ss) => pin
                .header_at_recursive(ss.height())
                .map(|h| h.hash() == ss.hash)
                .unwrap_or(true),
            None => true,
        }
    }

    fn erase_leader(&mut self, conn: ConnectionId) {
        while self
            .leaders
            .get(&conn)
            .map(|l| !l.queued.is_empty())
            .unwrap_or(false)
        {
            self.release_first_queued_batch(conn);
        }
        if let Some(leader) = self.leaders.remove(&conn) {
            if let Some(key) = leader.verifier {
                self.release_verifier(key);
            }
        }
    }

    fn prune_leaders(&mut self) {
        let doomed: Vec<ConnectionId> = self
            .leaders
            .iter()
            .filter(|(_, l)| l.worksum <= self.min_work)
            .map(|(c, _)| *c)
            .collect();
        for conn in doomed {
            self.erase_leader(conn);
        }
    }

    /// Re-runs leader election, e.g. after a connection left and freed a leader slot.
    pub fn reselect(&mut self, conns: &ConnectionMap, chains: &StageAndConsensus) {
        self.select_leaders(conns, chains);
    }

    fn select_leaders(&mut self, conns: &ConnectionMap, chains: &StageAndConsensus) {
        if self.leaders.len() >= self.max_leaders {
            return;
        }
        for conn in self.connections.clone() {
            if self.consider_insert_leader(conn, conns, chains) && self.leaders.len() >= self.max_leaders {
                return;
            }
        }
    }

    //
    // verifier refcounting
    //

    fn acquire_verifier(&mut self, pin: SharedBatch) {
        let key = pin.last_header();
        let pow = self.pow.clone();
        let node = self.verifiers.entry(key).or_insert_with(|| VerifierNode {
            refcount: 0,
            verifier: HeaderVerifier::from_shared_batch(&pin, pow),
            pin,
        });
        node.refcount += 1;
    }

    fn release_verifier(&mut self, key: BlockHeader) {
        let node = self.verifiers.get_mut(&key).expect("released verifier exists");
        debug_assert!(node.refcount > 0);
        node.refcount -= 1;
        if node.refcount == 0 {
            self.verifiers.remove(&key);
        }
    }

    fn next_slot(&self, conn: ConnectionId) -> BatchSlot {
        self.leaders
            .get(&conn)
            .and_then(|l| l.verifier)
            .map(|key| self.verifiers[&key].pin.next_slot())
            .unwrap_or(BatchSlot::new(0))
    }

    fn verified_total_work(&self, conn: ConnectionId) -> Worksum {
        self.leaders
            .get(&conn)
            .and_then(|l| l.verifier)
            .map(|key| self.verifiers[&key].pin.total_work())
            .unwrap_or_else(Worksum::zero)
    }

    //
    // queued batch bookkeeping
    //

    fn acquire_queued_batch(&mut self, prev: Option<BlockHeader>, key: BlockHeader, conn: ConnectionId) {
        let qb = self.queued.entry(key).or_default();
        qb.leader_refs.insert(conn);
        let leader = self.leaders.get_mut(&conn).expect("leader exists");
        leader.queued.push_back(QueueEntry { prev, key });
        debug_assert!(leader.queued.len() <= self.pending_depth);
    }

    fn release_first_queued_batch(&mut self, conn: ConnectionId) {
        let entry = self
            .leaders
            .get_mut(&conn)
            .expect("leader exists")
            .queued
            .pop_front()
            .expect("queue is nonempty");
        let qb = self.queued.get_mut(&entry.key).expect("queued batch exists");
        qb.leader_refs.remove(&conn);
        if qb.leader_refs.is_empty() {
            let probe_refs = std::mem::take(&mut qb.probe_refs);
            let pending_on = qb.pending_on.take();
            self.queued.remove(&entry.key);
            for cr in probe_refs {
                self.clear_connection_probe(cr, false);
            }
            if let Some(cr) = pending_on {
                self.data_mut(cr).job_batch = None;
            }
        }
    }

    fn queue_requests(&mut self, conn: ConnectionId) {
        let (desc, queued_len) = match self.leaders.get(&conn) {
            Some(l) => (l.descripted.clone(), l.queued.len()),
            None => return,
        };
        let ns = self.next_slot(conn);
        let mut s = ns + queued_len as u32;
        let slot_end = BatchSlot::new(desc.grid_slots() as u32);
        while s < slot_end && s - ns < self.pending_depth as u32 {
            let key = desc.grid_entry(s).expect("slot below grid end");
            let prev = if s.index() > 0 {
                desc.grid_entry(BatchSlot::new(s.index() as u32 - 1))
            } else {
                None
            };
            self.acquire_queued_batch(prev, key, conn);
            s = s + 1;
        }
    }

    //
    // probe bookkeeping
    //

    fn clear_connection_probe(&mut self, conn: ConnectionId, erase_from_container: bool) {
        let probe = match self.conn_data.get_mut(&conn).and_then(|d| d.probe.take()) {
            Some(p) => p,
            None => return,
        };
        if erase_from_container {
            if let Some(qb) = self.queued.get_mut(&probe.batch_key) {
                qb.probe_refs.retain(|c| *c != conn);
            }
        }
    }

    fn set_connection_probe(&mut self, conn: ConnectionId, probe: ConnectionProbe) {
        if let Some(qb) = self.queued.get_mut(&probe.batch_key) {
            qb.probe_refs.push(conn);
        }
        let data = self.data_mut(conn);
        debug_assert!(data.probe.is_none());
        data.probe = Some(probe);
    }

    //
    // request selection
    //

    pub fn do_requests(&mut self, sender: &mut RequestSender<'_>, chains: &StageAndConsensus) -> Vec<ChainOffender> {
        // exclusive final requests first so leaders are not busied with shared work
        if self.do_exclusive_final_requests(sender, chains) {
            return Vec::new();
        }
        self.do_shared_grid_requests(sender, chains)
    }

    fn do_exclusive_final_requests(&mut self, sender: &mut RequestSender<'_>, chains: &StageAndConsensus) -> bool {
        for conn in self.connections.clone() {
            if sender.finished() {
                return true;
            }
            if sender.job_free(conn) && self.is_leader(conn) {
                self.try_final_request(conn, sender, chains);
            }
        }
        sender.finished()
    }

    fn try_final_request(
        &mut self,
        conn: ConnectionId,
        sender: &mut RequestSender<'_>,
        chains: &StageAndConsensus,
    ) -> bool {
        let next_slot = self.next_slot(conn);
        let leader = self.leaders.get(&conn).expect("caller checked leadership");
        let desc = leader.descripted.clone();
        let descripted_slot = BatchSlot::new(desc.grid_slots() as u32);
        let focus_max_slot = next_slot + self.pending_depth as u32;

        let in_reach = focus_max_slot >= descripted_slot;
        let nonempty_final = desc.chain_length().incomplete_batch_size() != 0;
        if !(in_reach && nonempty_final && leader.final_batch.is_none()) {
            return false;
        }

        // adopt a tighter fork range from the live peer state when it still refers to the same
        // chain version
        if let Some(state) = sender.conns.get(conn) {
            if state.initialized() && Arc::ptr_eq(state.chain().descripted(), &desc) {
                let stage_fr = *state.chain().stage_fork_range();
                let consensus_fr = *state.chain().consensus_fork_range();
                let leader = self.leaders.get_mut(&conn).expect("leader exists");
                if leader.probe.fork_range().lower() < stage_fr.lower() {
                    leader.probe = ProbeData::new(stage_fr, chains.stage_pin());
                }
                if leader.probe.fork_range().lower() < consensus_fr.lower() {
                    leader.probe = ProbeData::new(consensus_fr, chains.consensus_pin());
                }
            }
        }

        let leader = self.leaders.get(&conn).expect("leader exists");
        debug_assert!((leader.length + 1).value() > leader.probe.fork_range().lower().value());
        if let Some(req) = probe::final_partial_batch_request(&leader.probe, &desc, leader.length, leader.worksum) {
            sender.send(conn, PendingRequest::Headers(req));
            return true;
        }
        false
    }

    fn do_shared_grid_requests(
        &mut self,
        sender: &mut RequestSender<'_>,
        chains: &StageAndConsensus,
    ) -> Vec<ChainOffender> {
        let mut offenders = Vec::new();
        let mut cursor = 0usize;
        for conn in self.leaders.keys().copied().collect::<Vec<_>>() {
            let queue_len = self.leaders.get(&conn).map(|l| l.queued.len()).unwrap_or(0);
            for i in 0..queue_len {
                if sender.finished() {
                    return offenders;
                }
                let entry = match self.leaders.get(&conn).and_then(|l| l.queued.get(i)) {
                    Some(e) => *e,
                    None => break,
                };
                let busy = self
                    .queued
                    .get(&entry.key)
                    .map(|qb| qb.pending_on.is_some() || qb.batch.is_some())
                    .unwrap_or(true);
                if busy {
                    continue;
                }
                let slot = self.next_slot(conn) + i as u32;
                let solo = queue_len == 1;
                let cache_match = if solo {
                    chains.lookup(entry.prev.map(|p| ChainPin {
                        height: slot.offset(),
                        header: p,
                    }))
                } else {
                    None
                };
                let rd = ReqData {
                    key: entry.key,
                    slot,
                    cache_match,
                };
                if let Some(cr) = self.try_send(sender, &mut offenders, &rd, &mut cursor) {
                    self.queued.get_mut(&entry.key).expect("checked above").pending_on = Some(cr);
                    self.data_mut(cr).job_batch = Some(entry.key);
                }
            }
        }
        offenders
    }

    fn try_send(
        &mut self,
        sender: &mut RequestSender<'_>,
        offenders: &mut Vec<ChainOffender>,
        rd: &ReqData,
        cursor: &mut usize,
    ) -> Option<ConnectionId> {
        let n = self.connections.len();
        if n == 0 {
            return None;
        }
        let start = *cursor % n;
        for step in 0..n {
            let idx = (start + step) % n;
            let conn = self.connections[idx];
            if !sender.job_free(conn) {
                continue;
            }
            let state = match sender.conns.get(conn) {
                Some(s) if s.initialized() => s,
                _ => continue,
            };
            let desc = state.chain().descripted().clone();
            if desc.grid_entry(rd.slot) != Some(rd.key) {
                continue;
            }

            // a solo batch with a cache match lets this connection carry a probe pin
            if let Some(cm) = &rd.cache_match {
                let probe_matches = self
                    .conn_data
                    .get(&conn)
                    .and_then(|d| d.probe.as_ref())
                    .map(|p| p.batch_key == rd.key)
                    .unwrap_or(true);
                if probe_matches {
                    let state = sender.conns.get_mut(conn).expect("present above");
                    let fr = state.chain_mut().fork_range_mut(cm.kind);
                    if let Err(e) = fr.on_match(rd.slot.offset()) {
                        offenders.push(ChainOffender::new(e, conn));
                        continue;
                    }
                    let fr = *state.chain().fork_range(cm.kind);
                    let better = self
                        .conn_data
                        .get(&conn)
                        .and_then(|d| d.probe.as_ref())
                        .map(|p| p.probe.fork_range().lower() < fr.lower())
                        .unwrap_or(true);
                    if better {
                        self.clear_connection_probe(conn, true);
                        self.set_connection_probe(conn, ConnectionProbe {
                            probe: ProbeData::new(fr, cm.pin.clone()),
                            descripted: desc.clone(),
                            batch_key: rd.key,
                        });
                    }
                }
            }

            let has_matching_probe = self
                .conn_data
                .get(&conn)
                .and_then(|d| d.probe.as_ref())
                .map(|p| p.batch_key == rd.key)
                .unwrap_or(false);
            if has_matching_probe {
                let probe = self.conn_data.get(&conn).and_then(|d| d.probe.as_ref()).expect("checked");
                debug_assert!((rd.slot.upper() + 1).value() > probe.probe.fork_range().lower().value());
                match probe::slot_batch_request(&probe.probe, &probe.descripted, rd.slot, rd.key) {
                    Some(req) => {
                        sender.send(conn, PendingRequest::Headers(req));
                        self.clear_connection_probe(conn, true);
                        *cursor = idx;
                        return Some(conn);
                    },
                    None => continue,
                }
            }
            let req = HeaderRequest::new(
                desc,
                rd.slot.lower(),
                rd.slot.upper(),
                Batch::new(),
                HeaderRequestKind::Shared { key: rd.key },
            );
            sender.send(conn, PendingRequest::Headers(req));
            *cursor = idx;
            return Some(conn);
        }
        None
    }

    pub fn do_probe_requests(&mut self, sender: &mut RequestSender<'_>) {
        for conn in self.leaders.keys().copied().collect::<Vec<_>>() {
            if sender.finished() {
                return;
            }
            if !sender.job_free(conn) {
                continue;
            }
            let leader = &self.leaders[&conn];
            let chain_length = leader.descripted.chain_length();
            if let Some(req) = probe::probe_request(&leader.probe, &leader.descripted, chain_length) {
                sender.send(conn, PendingRequest::Probe(req));
            }
        }
        let with_probe: Vec<ConnectionId> = self
            .conn_data
            .iter()
            .filter(|(_, d)| d.probe.is_some())
            .map(|(c, _)| *c)
            .collect();
        for conn in with_probe {
            if sender.finished() {
                return;
            }
            if !sender.job_free(conn) {
                continue;
            }
            let cp = self.conn_data[&conn].probe.as_ref().expect("filtered above");
            // complete batches are shared automatically; a probe can only succeed within the
            // batch covering the fork lower bound
            let max_length = BatchSlot::of_height(cp.probe.fork_range().lower()).upper();
            if let Some(req) = probe::probe_request(&cp.probe, &cp.descripted, max_length.height()) {
                sender.send(conn, PendingRequest::Probe(req));
            }
        }
    }

    //
    // replies and expiry
    //

    pub fn on_probe_reply(
        &mut self,
        conn: ConnectionId,
        req: &ProbeRequest,
        rep: &ProbeRepMsg,
    ) -> Result<(), crate::chain::error::ChainError> {
        let requested = match &rep.requested {
            Some(h) => *h,
            None => return Ok(()),
        };
        if let Some(cp) = self.conn_data.get_mut(&conn).and_then(|d| d.probe.as_mut()) {
            if cp.descripted.descriptor() == req.msg.descriptor {
                cp.probe.match_header(req.msg.height, &requested)?;
            }
        }
        if let Some(leader) = self.leaders.get_mut(&conn) {
            if leader.descripted.descriptor() == req.msg.descriptor {
                leader.probe.match_header(req.msg.height, &requested)?;
            }
        }
        Ok(())
    }

    pub fn on_probe_expire(&mut self, _conn: ConnectionId) {}

    pub fn on_request_expire(&mut self, conn: ConnectionId, _req: &HeaderRequest) {
        if let Some(key) = self.data_mut(conn).job_batch.take() {
            if let Some(qb) = self.queued.get_mut(&key) {
                if qb.pending_on == Some(conn) {
                    qb.pending_on = None;
                }
            }
        }
    }

    /// Handles a header batch reply: associates the batch with every leader whose grid wanted
    /// it, advances their verifiers, and attributes failures.
    pub fn on_response(
        &mut self,
        conn: ConnectionId,
        mut req: HeaderRequest,
        response: Batch,
        conns: &ConnectionMap,
        chains: &StageAndConsensus,
    ) -> Vec<ChainOffender> {
        self.on_request_expire(conn, &req);

        let batch_slot = req.slot();
        req.prefix.append_batch(&response);
        let batch = req.prefix;

        let mut offenders = Vec::new();
        match req.kind {
            HeaderRequestKind::Partial { claimed_work } => {
                let leader = match self.leaders.get_mut(&conn) {
                    Some(l) => l,
                    None => return Vec::new(),
                };
                if req.msg.descriptor != leader.descripted.descriptor() || batch_slot != leader.final_slot() {
                    return Vec::new();
                }
                leader.final_batch = Some((batch, claimed_work));
                if self.next_slot(conn) == batch_slot {
                    self.process_final(conn, chains, &mut offenders);
                }
            },
            HeaderRequestKind::Shared { key } => {
                if let Some(qb) = self.queued.get_mut(&key) {
                    if qb.pending_on == Some(conn) {
                        qb.pending_on = None;
                    }
                }
                if !batch.is_complete() {
                    return vec![ChainOffender::new(
                        ChainErrorKind::BatchSize.at(req.msg.start_height),
                        conn,
                    )];
                }
                if batch.last() != Some(&key) {
                    return vec![ChainOffender::new(
                        ChainErrorKind::HeaderLink.at(batch_slot.upper()),
                        conn,
                    )];
                }
                let qb = match self.queued.get_mut(&key) {
                    Some(qb) => qb,
                    None => return Vec::new(),
                };
                if qb.batch.is_some() {
                    return Vec::new();
                }
                qb.batch = Some(batch);
                qb.origin = Some(conn);
                let leaders = qb.leader_refs.clone();
                self.verify_queued(key, &leaders, chains, &mut offenders);
            },
        }

        let ret = self.filter_leadermismatch_offenders(offenders);
        self.select_leaders(conns, chains);
        ret
    }

    fn verify_queued(
        &mut self,
        key: BlockHeader,
        leaders: &BTreeSet<ConnectionId>,
        chains: &StageAndConsensus,
        offenders: &mut Vec<ChainOffender>,
    ) {
        let mut groups: BTreeMap<Option<BlockHeader>, BTreeSet<ConnectionId>> = BTreeMap::new();
        for li in leaders {
            let leader = match self.leaders.get(li) {
                Some(l) => l,
                None => continue,
            };
            if leader.queued.front().map(|e| e.key) == Some(key) {
                groups.entry(leader.verifier).or_default().insert(*li);
            }
        }
        let mut succeeded = 0u32;
        let acted = !groups.is_empty();
        for (base, group) in groups {
            if self.advance_verifier(base, &group, key, chains, offenders) {
                succeeded += 1;
            }
        }
        // only one chain can contain this batch; competing parents must fail
        debug_assert!(!acted || succeeded <= 1);
    }

    fn advance_verifier(
        &mut self,
        base: Option<BlockHeader>,
        group: &BTreeSet<ConnectionId>,
        key: BlockHeader,
        chains: &StageAndConsensus,
        offenders: &mut Vec<ChainOffender>,
    ) -> bool {
        let batch = match self.queued.get(&key).and_then(|qb| qb.batch.clone()) {
            Some(b) => b,
            None => return false,
        };
        let (parent_verifier, slot, parent_pin) = match base {
            Some(k) => {
                let vn = &self.verifiers[&k];
                (vn.verifier.clone(), vn.pin.next_slot(), Some(vn.pin.clone()))
            },
            None => (HeaderVerifier::new(self.pow.clone()), BatchSlot::new(0), None),
        };
        let span = HeaderSpan::new(slot, &batch);
        let advanced = match parent_verifier.copy_apply(chains.signed_snapshot(), span) {
            Ok(hv) => hv,
            Err(e) => {
                for li in group {
                    offenders.push(ChainOffender::new(e, *li));
                }
                return false;
            },
        };

        let shared = self.registry.share(batch.clone(), parent_pin.as_ref());
        let worksum = shared.total_work();
        let improves = self.maximizer.as_ref().map(|m| m.worksum < worksum).unwrap_or(true);
        if improves {
            let first = *group.iter().next().expect("group is nonempty");
            let descripted = self.leaders[&first].descripted.clone();
            self.maximizer = Some(Maximizer {
                conn: first,
                descripted,
                skeleton: ChainSkeleton::new(Some(shared.clone()), Batch::new()),
                worksum,
            });
        }
        self.verifiers.insert(key, VerifierNode {
            refcount: 0,
            verifier: advanced,
            pin: shared,
        });

        let mut follow: BTreeMap<BlockHeader, BTreeSet<ConnectionId>> = BTreeMap::new();
        for li in group {
            {
                let leader = self.leaders.get_mut(li).expect("leader exists");
                leader.verifier = Some(key);
            }
            self.verifiers.get_mut(&key).expect("inserted above").refcount += 1;
            if let Some(old) = base {
                self.release_verifier(old);
            }
            self.release_first_queued_batch(*li);
            self.queue_requests(*li);
            let front = self.leaders[li].queued.front().copied();
            match front {
                Some(entry) => {
                    let filled = self
                        .queued
                        .get(&entry.key)
                        .and_then(|qb| qb.batch.as_ref())
                        .map(|b| b.is_complete())
                        .unwrap_or(false);
                    if filled {
                        follow.entry(entry.key).or_default().insert(*li);
                    }
                },
                None => self.process_final(*li, chains, offenders),
            }
        }
        for (next_key, group) in follow {
            self.verify_queued(next_key, &group, chains, offenders);
        }
        true
    }

    fn process_final(&mut self, conn: ConnectionId, chains: &StageAndConsensus, offenders: &mut Vec<ChainOffender>) {
        let next_slot = self.next_slot(conn);
        let verified_work = self.verified_total_work(conn);
        let leader = match self.leaders.get(&conn) {
            Some(l) => l,
            None => return,
        };
        if leader.final_slot() != next_slot {
            return;
        }
        let (batch, claimed_work) = match &leader.final_batch {
            Some((b, w)) => (b.clone(), *w),
            None => {
                if leader.length.incomplete_batch_size() == 0 {
                    debug_assert!(verified_work > self.min_work);
                }
                return;
            },
        };
        let from_genesis = leader.verifier.is_none();
        let final_slot = leader.final_slot();
        let descripted = leader.descripted.clone();

        let span = HeaderSpan::new(final_slot, &batch);
        let parent = chains.header_verifier(&span).unwrap_or_else(|| {
            if from_genesis {
                HeaderVerifier::new(self.pow.clone())
            } else {
                let key = self.leaders[&conn].verifier.expect("not from genesis");
                self.verifiers[&key].verifier.clone()
            }
        });
        let parent_height = parent.height();
        if let Err(e) = parent.copy_apply(chains.signed_snapshot(), span) {
            offenders.push(ChainOffender::new(e, conn));
            return;
        }

        let worksum = verified_work + batch.worksum(final_slot.offset(), batch.len() as u32);
        if worksum < claimed_work {
            offenders.push(ChainOffender::new(
                ChainErrorKind::FakeWork.at((parent_height + 1).nonzero_assert()),
                conn,
            ));
            return;
        }

        let improves = self.maximizer.as_ref().map(|m| m.worksum < worksum).unwrap_or(true);
        if improves {
            let pin = if from_genesis {
                None
            } else {
                let key = self.leaders[&conn].verifier.expect("not from genesis");
                Some(self.verifiers[&key].pin.clone())
            };
            self.maximizer = Some(Maximizer {
                conn,
                descripted,
                skeleton: ChainSkeleton::new(pin, batch),
                worksum,
            });
        }
    }

    /// A snapshot mismatch demotes the one leader whose chain disagrees; it is not an offense by
    /// the serving peers.
    fn filter_leadermismatch_offenders(&mut self, offenders: Vec<ChainOffender>) -> Vec<ChainOffender> {
        let mut out = Vec::new();
        for offender in offenders {
            if offender.error.kind == ChainErrorKind::LeaderMismatch {
                if self.is_leader(offender.conn) {
                    let descriptor = self.leaders[&offender.conn].descripted.descriptor();
                    self.data_mut(offender.conn).ignore_descriptor = Some(descriptor);
                    self.erase_leader(offender.conn);
                    warn!(
                        target: LOG_TARGET,
                        "Demoted leader {} after snapshot mismatch on descriptor {}", offender.conn, descriptor
                    );
                }
            } else {
                out.push(offender);
            }
        }
        out
    }
}
