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

use warthog_common_types::{Descriptor, NonzeroHeight, HEADER_BATCH_SIZE};

use crate::{
    base_node::{
        event_loop::{ConnectionId, ConnectionMap, PendingRequest},
        sync::{header_sync::HeaderDownloader, SyncConfig},
    },
    blocks::BlockHash,
    chain::{
        batch_registry::BatchRegistry,
        chain_cache::{ConsensusState, StageAndConsensus},
        header_chain::HeaderChain,
        signed_snapshot::{NonzeroSnapshotPriority, RecoverableSignature, SignedSnapshot},
    },
    message::Msg,
    proof_of_work::{AcceptAllPow, Worksum},
    test_utils::{extendable_with_tail, init_conn, SenderHarness},
};

fn empty_cache(snapshot: Option<SignedSnapshot>) -> StageAndConsensus {
    StageAndConsensus::new(
        ConsensusState::new(snapshot, Descriptor::new(0), HeaderChain::new()),
        Arc::new(AcceptAllPow),
    )
}

fn downloader(registry: &Arc<BatchRegistry>) -> HeaderDownloader {
    HeaderDownloader::new(
        registry.clone(),
        Arc::new(AcceptAllPow),
        &SyncConfig::default(),
        Worksum::zero(),
    )
}

fn pop_header_request(
    conns: &mut ConnectionMap,
    harness: &mut SenderHarness,
    index: usize,
) -> (ConnectionId, crate::base_node::event_loop::HeaderRequest) {
    let (conn, msg) = harness.outbox[index].clone();
    let nonce = match msg {
        Msg::BatchReq(m) => m.nonce,
        other => panic!("expected a batch request, got {}", other.name()),
    };
    let (req, _) = conns
        .get_mut(conn)
        .expect("connection exists")
        .job
        .pop_matching(nonce)
        .expect("request is pending");
    harness.active_requests -= 1;
    match req {
        PendingRequest::Headers(r) => (conn, r),
        _ => panic!("expected a header request"),
    }
}

#[test]
fn shared_batch_request_goes_to_one_peer_at_a_time() {
    // two leaders announce the same chain; the final-header batch identifier is shared
    let local_registry = BatchRegistry::new();
    let remote_registry = BatchRegistry::new();
    let remote = extendable_with_tail(&remote_registry, 1, 0);
    let cache = empty_cache(None);

    let mut conns = ConnectionMap::new();
    let a = init_conn(&mut conns, 1, remote.headers(), 1, &cache);
    let b = init_conn(&mut conns, 2, remote.headers(), 1, &cache);

    let mut dl = downloader(&local_registry);
    dl.insert(a, &conns, &cache);
    dl.insert(b, &conns, &cache);
    assert!(dl.is_leader(a) && dl.is_leader(b));

    let mut harness = SenderHarness::new();
    let offenders = dl.do_requests(&mut harness.sender(&mut conns), &cache);
    assert!(offenders.is_empty());
    // exactly one request for the shared identifier, the other peer is skipped
    assert_eq!(harness.outbox.len(), 1);

    let offenders = dl.do_requests(&mut harness.sender(&mut conns), &cache);
    assert!(offenders.is_empty());
    assert_eq!(harness.outbox.len(), 1, "in-flight batch is not re-requested");

    // the first peer times out: header request expiry closes the connection, then the
    // second peer serves the same identifier
    let (first, _req) = pop_header_request(&mut conns, &mut harness, 0);
    dl.erase(first);
    conns.remove(first);

    let offenders = dl.do_requests(&mut harness.sender(&mut conns), &cache);
    assert!(offenders.is_empty());
    assert_eq!(harness.outbox.len(), 2);
    let second = harness.outbox[1].0;
    assert_ne!(second, first);
}

#[test]
fn verified_chain_reaches_maximizer_and_pop_data() {
    let local_registry = BatchRegistry::new();
    let remote_registry = BatchRegistry::new();
    let remote = extendable_with_tail(&remote_registry, 1, 5);
    let cache = empty_cache(None);

    let mut conns = ConnectionMap::new();
    let a = init_conn(&mut conns, 1, remote.headers(), 1, &cache);
    let mut dl = downloader(&local_registry);
    dl.insert(a, &conns, &cache);
    assert!(dl.is_active());

    // exclusive final request for the 5-header tail goes out first
    let mut harness = SenderHarness::new();
    dl.do_requests(&mut harness.sender(&mut conns), &cache);
    assert_eq!(harness.outbox.len(), 1);
    let (conn, partial) = pop_header_request(&mut conns, &mut harness, 0);
    assert!(partial.is_partial());
    assert_eq!(partial.msg.start_height.value(), HEADER_BATCH_SIZE + 1);
    assert_eq!(partial.msg.length, 5);

    let tail = remote.headers().get_headers(
        NonzeroHeight::assert(HEADER_BATCH_SIZE + 1),
        NonzeroHeight::assert(HEADER_BATCH_SIZE + 6),
    );
    let offenders = dl.on_response(conn, partial, tail, &conns, &cache);
    assert!(offenders.is_empty());

    // now the shared batch for slot 0
    dl.do_requests(&mut harness.sender(&mut conns), &cache);
    assert_eq!(harness.outbox.len(), 2);
    let (conn, shared) = pop_header_request(&mut conns, &mut harness, 1);
    assert!(!shared.is_partial());
    let full = remote.headers().get_headers(
        NonzeroHeight::assert(1),
        NonzeroHeight::assert(HEADER_BATCH_SIZE + 1),
    );
    let offenders = dl.on_response(conn, shared, full, &conns, &cache);
    assert!(offenders.is_empty());

    // the complete batch was shared into the local registry
    assert_eq!(local_registry.len(), 1);

    let ((leader, _descripted), chain) = dl.pop_data(&conns, &cache).expect("candidate ready");
    assert_eq!(leader, a);
    assert_eq!(chain.length().value(), HEADER_BATCH_SIZE + 5);
    assert_eq!(chain.total_work(), remote.headers().total_work());
    assert_eq!(dl.min_work(), chain.total_work());
    // nothing heavier available now
    assert!(dl.pop_data(&conns, &cache).is_none());
}

#[test]
fn snapshot_veto_demotes_leader_without_blaming_servers() {
    // the active snapshot asserts a different hash at height 100 than the leader's chain
    let local_registry = BatchRegistry::new();
    let remote_registry = BatchRegistry::new();
    let remote = extendable_with_tail(&remote_registry, 1, 0);
    let snapshot = SignedSnapshot {
        priority: NonzeroSnapshotPriority {
            importance: 1,
            height: NonzeroHeight::assert(100),
        },
        hash: BlockHash::from([0xAB; 32]),
        signature: RecoverableSignature([0u8; 65]),
    };
    let cache = empty_cache(Some(snapshot));

    let mut conns = ConnectionMap::new();
    let a = init_conn(&mut conns, 1, remote.headers(), 3, &cache);
    let mut dl = downloader(&local_registry);
    dl.insert(a, &conns, &cache);
    assert!(dl.is_leader(a));

    let mut harness = SenderHarness::new();
    dl.do_requests(&mut harness.sender(&mut conns), &cache);
    let (conn, req) = pop_header_request(&mut conns, &mut harness, 0);
    let full = remote.headers().get_headers(
        NonzeroHeight::assert(1),
        NonzeroHeight::assert(HEADER_BATCH_SIZE + 1),
    );
    let offenders = dl.on_response(conn, req, full, &conns, &cache);

    // snapshot mismatch is not an offense of the serving peer, but the leader is demoted and
    // its chain version barred until the descriptor advances
    assert!(offenders.is_empty());
    assert!(!dl.is_leader(a));
    assert!(!dl.is_active());
    assert!(dl.pop_data(&conns, &cache).is_none());
}
