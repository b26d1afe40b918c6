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
    time::{Duration, Instant},
};

use rand::Rng;
use warthog_common_types::{BatchSlot, BlockSlot, NonzeroHeight};

use crate::{
    base_node::event_loop::{
        connection::{ConnectionId, ConnectionMap},
        timer::{TimerEvent, TimerSystem},
    },
    blocks::{BlockHash, BlockHeader},
    chain::{batch::Batch, descripted::Descripted},
    message::{BatchReqMsg, BlockReqMsg, Msg, ProbeReqMsg},
    proof_of_work::Worksum,
};

fn fresh_nonce() -> u32 {
    rand::thread_rng().gen()
}

/// A single-header query at a height, used to shrink a fork range cheaply. Advisory: expiry is
/// absorbed instead of closing the connection.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub msg: ProbeReqMsg,
    pub descripted: Arc<Descripted>,
}

impl ProbeRequest {
    pub fn new(descripted: Arc<Descripted>, height: NonzeroHeight) -> Self {
        debug_assert!(descripted.chain_length() >= height);
        let msg = ProbeReqMsg {
            nonce: fresh_nonce(),
            descriptor: descripted.descriptor(),
            height,
        };
        Self { msg, descripted }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum HeaderRequestKind {
    /// Content-addressed complete batch, serveable by any peer whose grid carries `key`.
    Shared { key: BlockHeader },
    /// The leader's final, incomplete batch, answerable only by the leader itself.
    Partial { claimed_work: Worksum },
}

/// An outstanding header batch request, together with the locally known prefix that completes
/// the received suffix into a height-aligned batch.
#[derive(Debug, Clone)]
pub struct HeaderRequest {
    pub msg: BatchReqMsg,
    pub descripted: Arc<Descripted>,
    pub prefix: Batch,
    pub kind: HeaderRequestKind,
}

impl HeaderRequest {
    pub fn new(
        descripted: Arc<Descripted>,
        lower: NonzeroHeight,
        upper: NonzeroHeight,
        prefix: Batch,
        kind: HeaderRequestKind,
    ) -> Self {
        debug_assert!(upper >= lower);
        debug_assert_eq!(prefix.len(), (lower - BatchSlot::of_height(lower).lower()) as usize);
        let msg = BatchReqMsg {
            nonce: fresh_nonce(),
            descriptor: descripted.descriptor(),
            start_height: lower,
            length: (upper - lower + 1) as u16,
        };
        Self {
            msg,
            descripted,
            prefix,
            kind,
        }
    }

    pub fn slot(&self) -> BatchSlot {
        BatchSlot::of_height(self.msg.start_height)
    }

    pub fn min_return(&self) -> usize {
        self.msg.length as usize
    }

    pub fn max_return(&self) -> usize {
        self.msg.length as usize
    }

    pub fn is_partial(&self) -> bool {
        matches!(self.kind, HeaderRequestKind::Partial { .. })
    }
}

/// An outstanding block batch request for one focus slot.
#[derive(Debug, Clone)]
pub struct BlockRequest {
    pub msg: BlockReqMsg,
    pub descripted: Arc<Descripted>,
    pub upper_hash: BlockHash,
}

impl BlockRequest {
    pub fn new(descripted: Arc<Descripted>, lower: NonzeroHeight, upper: NonzeroHeight, upper_hash: BlockHash) -> Self {
        debug_assert!(upper >= lower);
        let msg = BlockReqMsg {
            nonce: fresh_nonce(),
            descriptor: descripted.descriptor(),
            lower,
            upper,
        };
        Self {
            msg,
            descripted,
            upper_hash,
        }
    }

    pub fn slot(&self) -> BlockSlot {
        BlockSlot::of_height(self.msg.lower)
    }
}

/// The one request a peer may have outstanding at any time.
#[derive(Debug, Clone)]
pub enum PendingRequest {
    Probe(ProbeRequest),
    Headers(HeaderRequest),
    Blocks(BlockRequest),
}

impl PendingRequest {
    pub fn nonce(&self) -> u32 {
        match self {
            PendingRequest::Probe(r) => r.msg.nonce,
            PendingRequest::Headers(r) => r.msg.nonce,
            PendingRequest::Blocks(r) => r.msg.nonce,
        }
    }

    pub fn to_msg(&self) -> Msg {
        match self {
            PendingRequest::Probe(r) => Msg::ProbeReq(r.msg),
            PendingRequest::Headers(r) => Msg::BatchReq(r.msg),
            PendingRequest::Blocks(r) => Msg::BlockReq(r.msg),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PendingRequest::Probe(_) => "probe request",
            PendingRequest::Headers(_) => "header request",
            PendingRequest::Blocks(_) => "block request",
        }
    }

    /// Probe expiry is advisory; header and block requests indicate liveness, so their expiry
    /// closes the connection.
    pub fn close_on_expiry(&self) -> bool {
        !matches!(self, PendingRequest::Probe(_))
    }
}

/// Hands requests to connections: binds the request to the peer's job slot, arms the expiry
/// timer, counts it against the global request budget, and queues the wire message.
pub struct RequestSender<'a> {
    pub conns: &'a mut ConnectionMap,
    pub timers: &'a mut TimerSystem,
    pub outbox: &'a mut Vec<(ConnectionId, Msg)>,
    pub active_requests: &'a mut usize,
    pub max_requests: usize,
    pub timeout: Duration,
    pub now: Instant,
}

impl RequestSender<'_> {
    pub fn finished(&self) -> bool {
        *self.active_requests >= self.max_requests
    }

    pub fn job_free(&self, conn: ConnectionId) -> bool {
        self.conns.get(conn).map(|c| c.job.is_free()).unwrap_or(false)
    }

    pub fn send(&mut self, conn: ConnectionId, request: PendingRequest) {
        let state = self.conns.get_mut(conn).expect("request target is connected");
        debug_assert!(state.job.is_free());
        let timer = self.timers.insert(self.now + self.timeout, TimerEvent::RequestExpire {
            conn,
            nonce: request.nonce(),
        });
        self.outbox.push((conn, request.to_msg()));
        state.job.assign(request, timer);
        *self.active_requests += 1;
    }
}
