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
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use warthog_common_types::{Descriptor, NonzeroHeight, HEADER_BATCH_SIZE};

use crate::{
    base_node::{
        event_loop::{CloseReason, ConnectionId, Event, EventLoop, Outbound},
        sync::{block_sync::StageOperations, SyncConfig},
    },
    blocks::{BlockBody, BlockBundle},
    chain::{
        batch_registry::BatchRegistry,
        chain_cache::ConsensusState,
        header_chain::HeaderChain,
        signed_snapshot::{FirstByteAuthority, SignedSnapshot, SnapshotPriority},
    },
    message::{BatchRepMsg, BlockRepMsg, Msg, PingMsg, ProtocolError},
    proof_of_work::AcceptAllPow,
    test_utils::{chain_with_bodies, init_msg},
};

#[derive(Clone, Default)]
struct Recorder {
    sent: Arc<Mutex<Vec<(ConnectionId, Msg)>>>,
    closed: Arc<Mutex<Vec<(ConnectionId, CloseReason)>>>,
}

impl Recorder {
    fn drain_sent(&self) -> Vec<(ConnectionId, Msg)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    fn closed(&self) -> Vec<(ConnectionId, CloseReason)> {
        self.closed.lock().unwrap().clone()
    }
}

impl Outbound for Recorder {
    fn send(&mut self, conn: ConnectionId, msg: Msg) {
        self.sent.lock().unwrap().push((conn, msg));
    }

    fn close(&mut self, conn: ConnectionId, reason: CloseReason) {
        self.closed.lock().unwrap().push((conn, reason));
    }
}

#[derive(Clone, Default)]
struct StageRecorder {
    sets: Arc<Mutex<Vec<Arc<HeaderChain>>>>,
    adds: Arc<Mutex<Vec<Vec<BlockBundle>>>>,
    snapshots: Arc<Mutex<Vec<SignedSnapshot>>>,
}

impl StageOperations for StageRecorder {
    fn stage_set(&mut self, headers: Arc<HeaderChain>) {
        self.sets.lock().unwrap().push(headers);
    }

    fn stage_add(&mut self, _headers: Arc<HeaderChain>, blocks: Vec<BlockBundle>) {
        self.adds.lock().unwrap().push(blocks);
    }

    fn on_signed_snapshot(&mut self, snapshot: SignedSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
    }
}

type TestLoop = EventLoop<Recorder, StageRecorder>;

fn new_loop() -> (TestLoop, Recorder, StageRecorder) {
    let recorder = Recorder::default();
    let stage = StageRecorder::default();
    let (el, _handle) = EventLoop::new(
        SyncConfig::default(),
        ConsensusState::new(None, Descriptor::new(0), HeaderChain::new()),
        BatchRegistry::new(),
        Arc::new(AcceptAllPow),
        Arc::new(FirstByteAuthority),
        recorder.clone(),
        stage.clone(),
    );
    (el, recorder, stage)
}

#[test]
fn init_is_sent_on_connect() {
    let (mut el, recorder, _stage) = new_loop();
    el.process(Event::Connected(ConnectionId::new(1)));
    let sent = recorder.drain_sent();
    assert!(matches!(sent.as_slice(), [(_, Msg::Init(_))]));
}

#[test]
fn unsolicited_reply_closes_connection() {
    let (mut el, recorder, _stage) = new_loop();
    el.process(Event::Connected(ConnectionId::new(1)));
    recorder.drain_sent();
    el.process(Event::Message(
        ConnectionId::new(1),
        Msg::BatchRep(BatchRepMsg {
            nonce: 99,
            batch: crate::chain::batch::Batch::new(),
        }),
    ));
    let closed = recorder.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].1, CloseReason::Protocol(ProtocolError::Unrequested));
    assert_eq!(el.connection_count(), 0);
}

#[test]
fn ping_flood_closes_connection() {
    let (mut el, recorder, _stage) = new_loop();
    el.process(Event::Connected(ConnectionId::new(1)));
    let ping = Msg::Ping(PingMsg {
        nonce: 1,
        priority: SnapshotPriority::default(),
        max_addresses: 5,
        max_transactions: 100,
    });
    el.process(Event::Message(ConnectionId::new(1), ping.clone()));
    el.process(Event::Message(ConnectionId::new(1), ping));
    let closed = recorder.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].1, CloseReason::Protocol(ProtocolError::MsgFlood));
}

#[test]
fn header_request_expiry_closes_connection() {
    let (mut el, recorder, _stage) = new_loop();
    let remote_registry = BatchRegistry::new();
    let (remote, _bodies) = chain_with_bodies(&remote_registry, 40);
    let peer = ConnectionId::new(1);
    el.process(Event::Connected(peer));
    el.process(Event::Message(peer, Msg::Init(init_msg(remote.headers(), 1))));

    // a header batch request went out and now expires
    let sent = recorder.drain_sent();
    assert!(sent.iter().any(|(_, m)| matches!(m, Msg::BatchReq(_))));
    el.fire_timers_at(Instant::now() + Duration::from_secs(31));
    let closed = recorder.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].1, CloseReason::Protocol(ProtocolError::Timeout));
}

/// Plays the remote peer and the block applier until the loop goes quiet, collecting every
/// body the applier received.
fn drive_to_completion(
    el: &mut TestLoop,
    recorder: &Recorder,
    stage: &StageRecorder,
    remote: &HeaderChain,
    bodies: &[BlockBody],
) -> (Vec<BlockBundle>, Vec<Arc<HeaderChain>>) {
    let mut applied = Vec::new();
    let mut staged = Vec::new();
    for _ in 0..2000 {
        let mut progressed = false;

        for (conn, msg) in recorder.drain_sent() {
            match msg {
                Msg::BatchReq(m) => {
                    progressed = true;
                    let end = m.start_height + u32::from(m.length);
                    let batch = remote.get_headers(m.start_height, end);
                    el.process(Event::Message(conn, Msg::BatchRep(BatchRepMsg {
                        nonce: m.nonce,
                        batch,
                    })));
                },
                Msg::BlockReq(m) => {
                    progressed = true;
                    let blocks = (m.lower.value()..=m.upper.value())
                        .map(|h| bodies[(h - 1) as usize].clone())
                        .collect();
                    el.process(Event::Message(conn, Msg::BlockRep(BlockRepMsg {
                        nonce: m.nonce,
                        blocks,
                    })));
                },
                _ => {},
            }
        }

        for headers in std::mem::take(&mut *stage.sets.lock().unwrap()) {
            progressed = true;
            staged.push(headers);
            el.process(Event::StageSetResult(crate::base_node::sync::block_sync::StageSetStatus {
                first_miss_height: Some(NonzeroHeight::assert(applied.len() as u32 + 1)),
            }));
        }
        for blocks in std::mem::take(&mut *stage.adds.lock().unwrap()) {
            progressed = true;
            let next = blocks.last().expect("nonempty add").height + 1;
            applied.extend(blocks);
            el.process(Event::StageAddResult(crate::base_node::sync::block_sync::StageAddStatus {
                next_height: next,
                error: None,
            }));
        }

        if !progressed {
            break;
        }
    }
    (applied, staged)
}

#[test]
fn full_pipeline_downloads_and_applies_the_announced_chain() {
    let (mut el, recorder, stage) = new_loop();
    let remote_registry = BatchRegistry::new();
    let length = HEADER_BATCH_SIZE + 5;
    let (remote, bodies) = chain_with_bodies(&remote_registry, length);

    let peer = ConnectionId::new(1);
    el.process(Event::Connected(peer));
    recorder.drain_sent();
    el.process(Event::Message(peer, Msg::Init(init_msg(remote.headers(), 1))));

    let (applied, staged) = drive_to_completion(&mut el, &recorder, &stage, remote.headers(), &bodies);

    assert!(recorder.closed().is_empty(), "honest peer must not be closed");
    assert_eq!(applied.len(), length as usize);
    for (i, bundle) in applied.iter().enumerate() {
        assert_eq!(bundle.height.value(), i as u32 + 1);
        assert_eq!(bundle.body, bodies[i]);
        assert_eq!(
            bundle.header,
            remote.headers().header_at(NonzeroHeight::assert(i as u32 + 1))
        );
    }
    // the stage headers handed to the applier match the announced chain
    assert_eq!(staged[0].length().value(), length);
    assert_eq!(staged[0].total_work(), remote.headers().total_work());
}

#[tokio::test]
async fn run_loop_drains_posted_events_and_exits_on_shutdown() {
    let recorder = Recorder::default();
    let stage = StageRecorder::default();
    let (el, handle) = EventLoop::new(
        SyncConfig::default(),
        ConsensusState::new(None, Descriptor::new(0), HeaderChain::new()),
        BatchRegistry::new(),
        Arc::new(AcceptAllPow),
        Arc::new(FirstByteAuthority),
        recorder.clone(),
        stage.clone(),
    );
    let worker = tokio::spawn(el.run());

    assert!(handle.post(Event::Connected(ConnectionId::new(1))));
    handle.shutdown();
    worker.await.expect("worker exits cleanly");

    let sent = recorder.drain_sent();
    assert!(matches!(sent.as_slice(), [(_, Msg::Init(_))]));
}

#[test]
fn snapshot_from_leader_message_is_forwarded_once_better() {
    let (mut el, _recorder, stage) = new_loop();
    let peer = ConnectionId::new(1);
    el.process(Event::Connected(peer));

    let mut sig = [0u8; 65];
    sig[0] = 2;
    el.process(Event::Message(peer, Msg::Leader(crate::message::LeaderMsg {
        snapshot: crate::message::UnverifiedSnapshot {
            height: NonzeroHeight::assert(50),
            hash: crate::blocks::BlockHash::from([5u8; 32]),
            signature: crate::chain::signed_snapshot::RecoverableSignature(sig),
        },
    })));
    assert_eq!(stage.snapshots.lock().unwrap().len(), 1);
}

#[test]
fn unknown_leader_signature_closes_connection() {
    let (mut el, recorder, stage) = new_loop();
    let peer = ConnectionId::new(1);
    el.process(Event::Connected(peer));

    let mut sig = [0u8; 65];
    sig[0] = 200; // not a leader index
    el.process(Event::Message(peer, Msg::Leader(crate::message::LeaderMsg {
        snapshot: crate::message::UnverifiedSnapshot {
            height: NonzeroHeight::assert(50),
            hash: crate::blocks::BlockHash::from([5u8; 32]),
            signature: crate::chain::signed_snapshot::RecoverableSignature(sig),
        },
    })));
    assert!(stage.snapshots.lock().unwrap().is_empty());
    let closed = recorder.closed();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].1, CloseReason::Protocol(ProtocolError::BadLeader));
}
