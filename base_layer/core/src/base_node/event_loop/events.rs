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

use std::fmt::{self, Display, Formatter};

use thiserror::Error;

use crate::{
    base_node::{event_loop::connection::ConnectionId, peer_chain::PeerChainError},
    chain::{chain_cache::ConsensusUpdate, error::ChainError},
    base_node::sync::block_sync::{StageAddStatus, StageSetStatus},
    message::{Msg, ProtocolError},
};

/// Why a connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("chain offense: {0}")]
    Chain(#[from] ChainError),
}

impl From<PeerChainError> for CloseReason {
    fn from(e: PeerChainError) -> Self {
        match e {
            PeerChainError::Protocol(p) => CloseReason::Protocol(p),
            PeerChainError::Chain(c) => CloseReason::Chain(c),
        }
    }
}

impl CloseReason {
    pub fn code(&self) -> u32 {
        match self {
            CloseReason::Protocol(p) => p.code(),
            CloseReason::Chain(c) => c.kind.code(),
        }
    }
}

/// Everything the sync worker reacts to. Transport threads, the applier, and timers post these;
/// the worker drains them one at a time, each handler running to completion.
#[derive(Debug)]
pub enum Event {
    /// A connection finished its handshake.
    Connected(ConnectionId),
    /// The transport lost a connection.
    Disconnected(ConnectionId),
    /// A complete framed message arrived.
    Message(ConnectionId, Msg),
    /// The block applier advanced, forked or rolled back the consensus chain.
    ConsensusUpdate(ConsensusUpdate),
    /// The applier answered a stage-set operation.
    StageSetResult(StageSetStatus),
    /// The applier answered a stage-add operation.
    StageAddResult(StageAddStatus),
    /// Drain and exit.
    Shutdown,
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Event::Connected(c) => write!(f, "connected({c})"),
            Event::Disconnected(c) => write!(f, "disconnected({c})"),
            Event::Message(c, m) => write!(f, "message({c}, {})", m.name()),
            Event::ConsensusUpdate(_) => write!(f, "consensus update"),
            Event::StageSetResult(_) => write!(f, "stage set result"),
            Event::StageAddResult(_) => write!(f, "stage add result"),
            Event::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Seam to the transport: the sync core emits frames and close decisions, the transport owns
/// sockets and framing.
pub trait Outbound: Send {
    fn send(&mut self, conn: ConnectionId, msg: Msg);
    fn close(&mut self, conn: ConnectionId, reason: CloseReason);
    /// The node's synced flag flipped.
    fn sync_state(&mut self, _synced: bool) {}
}
