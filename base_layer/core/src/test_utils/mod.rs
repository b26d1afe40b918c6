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

//! Builders for linked header chains used across the unit tests.

use std::sync::Arc;

use warthog_common_types::{Height, HEADER_BATCH_SIZE};

use crate::{
    blocks::{genesis_hash, BlockHash, BlockHeader},
    chain::{
        batch::Batch,
        batch_registry::BatchRegistry,
        extendable::ExtendableHeaderChain,
        header_chain::HeaderChain,
        verifier::HeaderVerifier,
    },
    consensus::BLOCK_TIME,
    proof_of_work::{AcceptAllPow, Target},
};

pub const TEST_GENESIS_TIME: u32 = 1_600_000_000;

/// The header a verifier at this state would accept next, carrying the given timestamp.
pub fn next_header(v: &HeaderVerifier, timestamp: u32, nonce: u32) -> BlockHeader {
    BlockHeader::new(
        *v.final_hash(),
        v.next_target(),
        BlockHash::zero(),
        1,
        timestamp,
        nonce,
    )
}

/// `n` linked headers starting from the genesis hash, all at genesis target, spaced one block
/// time apart. Not difficulty-adjusted; meant for link and fingerprint tests.
pub fn chain_of(n: usize, start_timestamp: u32) -> Vec<BlockHeader> {
    let mut out = Vec::with_capacity(n);
    let mut prev = genesis_hash();
    for i in 0..n {
        let header = BlockHeader::new(
            prev,
            Target::genesis(),
            BlockHash::zero(),
            1,
            start_timestamp + (i as u32 + 1) * BLOCK_TIME,
            0,
        );
        prev = header.hash();
        out.push(header);
    }
    out
}

/// A complete linked batch starting from genesis.
pub fn complete_batch(start_timestamp: u32) -> Batch {
    Batch::from_headers(chain_of(HEADER_BATCH_SIZE as usize, start_timestamp)).expect("one batch")
}

/// A complete linked batch continuing after `prev`, distinguished by `salt`.
pub fn complete_batch_after(prev: &Batch, salt: u32) -> Batch {
    let mut out = Vec::with_capacity(HEADER_BATCH_SIZE as usize);
    let mut prev_hash = prev.last().expect("nonempty batch").hash();
    let base_ts = prev.last().expect("nonempty batch").timestamp();
    for i in 0..HEADER_BATCH_SIZE {
        let header = BlockHeader::new(
            prev_hash,
            Target::genesis(),
            BlockHash::zero(),
            1,
            base_ts + (i + 1) * BLOCK_TIME,
            salt,
        );
        prev_hash = header.hash();
        out.push(header);
    }
    Batch::from_headers(out).expect("one batch")
}

fn timestamp_at(height: u32) -> u32 {
    TEST_GENESIS_TIME + height * BLOCK_TIME
}

fn extend_to(chain: &mut ExtendableHeaderChain, length: u32, nonce: u32, registry: &Arc<BatchRegistry>) {
    while chain.length().value() < length {
        let h = chain.length().value() + 1;
        let header = next_header(chain.verifier(), timestamp_at(h), nonce);
        let prepared = chain
            .prepare_append(None, &header)
            .expect("generated header is valid");
        chain.append(&prepared, registry);
    }
}

/// A fully verified chain of `batches` complete batches plus `tail` extra headers, with correct
/// difficulty adjustments and block-time spacing.
pub fn extendable_with_tail(registry: &Arc<BatchRegistry>, batches: u32, tail: u32) -> ExtendableHeaderChain {
    let mut chain = ExtendableHeaderChain::new(Arc::new(AcceptAllPow));
    extend_to(&mut chain, batches * HEADER_BATCH_SIZE + tail, 0, registry);
    chain
}

/// A chain equal to `base` below `fork_height` and diverging from there on, one header longer
/// than `base`.
pub fn fork_of(registry: &Arc<BatchRegistry>, base: &HeaderChain, fork_height: u32) -> ExtendableHeaderChain {
    assert!(fork_height >= 1 && fork_height <= base.length().value());
    let prefix = HeaderChain::subchain(base, Height::new(fork_height - 1));
    let mut chain = ExtendableHeaderChain::from_chain(prefix, Arc::new(AcceptAllPow));
    extend_to(&mut chain, base.length().value() + 1, 7, registry);
    chain
}

/// A fully verified chain whose headers commit to generated bodies, for block download tests.
/// Body at height `h` is returned at index `h - 1`.
pub fn chain_with_bodies(
    registry: &Arc<BatchRegistry>,
    length: u32,
) -> (ExtendableHeaderChain, Vec<crate::blocks::BlockBody>) {
    let mut chain = ExtendableHeaderChain::new(Arc::new(AcceptAllPow));
    let mut bodies = Vec::with_capacity(length as usize);
    for h in 1..=length {
        let mut bytes = vec![0u8; 12];
        bytes[..4].copy_from_slice(&h.to_be_bytes());
        let body = crate::blocks::BlockBody::new(bytes);
        let height = warthog_common_types::NonzeroHeight::assert(h);
        let header = BlockHeader::new(
            *chain.final_hash(),
            chain.next_target(),
            body.merkle_root(height),
            1,
            timestamp_at(h),
            0,
        );
        let prepared = chain
            .prepare_append(None, &header)
            .expect("generated header is valid");
        chain.append(&prepared, registry);
        bodies.push(body);
    }
    (chain, bodies)
}

/// An Init announcement for the given chain.
pub fn init_msg(chain: &HeaderChain, descriptor: u32) -> crate::message::InitMsg {
    crate::message::InitMsg {
        descriptor: warthog_common_types::Descriptor::new(descriptor),
        priority: crate::chain::signed_snapshot::SnapshotPriority::default(),
        chain_length: chain.length(),
        worksum: chain.total_work(),
        grid: chain.grid(warthog_common_types::BatchSlot::new(0)),
    }
}

/// Registers connection `id` and initializes it with an announcement of `chain`.
pub fn init_conn(
    conns: &mut crate::base_node::event_loop::ConnectionMap,
    id: u64,
    chain: &HeaderChain,
    descriptor: u32,
    cache: &crate::chain::chain_cache::StageAndConsensus,
) -> crate::base_node::event_loop::ConnectionId {
    use crate::base_node::event_loop::{ConnectionId, ConnectionState};
    let conn = ConnectionId::new(id);
    let mut state = ConnectionState::new(conn);
    state.chain = Some(
        crate::base_node::peer_chain::PeerChain::new(&init_msg(chain, descriptor), cache)
            .expect("valid announcement"),
    );
    conns.insert(state).expect("fresh id");
    conn
}

/// Scratch state backing a [`RequestSender`] in tests.
pub struct SenderHarness {
    pub timers: crate::base_node::event_loop::TimerSystem,
    pub outbox: Vec<(crate::base_node::event_loop::ConnectionId, crate::message::Msg)>,
    pub active_requests: usize,
}

impl SenderHarness {
    pub fn new() -> Self {
        Self {
            timers: crate::base_node::event_loop::TimerSystem::new(),
            outbox: Vec::new(),
            active_requests: 0,
        }
    }

    pub fn sender<'a>(
        &'a mut self,
        conns: &'a mut crate::base_node::event_loop::ConnectionMap,
    ) -> crate::base_node::event_loop::RequestSender<'a> {
        crate::base_node::event_loop::RequestSender {
            conns,
            timers: &mut self.timers,
            outbox: &mut self.outbox,
            active_requests: &mut self.active_requests,
            max_requests: 10,
            timeout: std::time::Duration::from_secs(30),
            now: std::time::Instant::now(),
        }
    }
}
