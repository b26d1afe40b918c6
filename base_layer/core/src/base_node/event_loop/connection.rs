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
    collections::HashMap,
    fmt::{self, Display, Formatter},
    time::Instant,
};

use crate::{
    base_node::{
        event_loop::{request::PendingRequest, timer::TimerKey},
        peer_chain::PeerChain,
    },
    chain::signed_snapshot::SnapshotPriority,
    message::ProtocolError,
};

/// Identifier the transport assigns to each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The per-peer job slot: at most one outstanding request at a time, with its expiry timer.
#[derive(Debug, Default)]
pub struct ConnectionJob {
    pending: Option<PendingRequest>,
    timer: Option<TimerKey>,
}

impl ConnectionJob {
    pub fn is_free(&self) -> bool {
        self.pending.is_none()
    }

    pub fn pending(&self) -> Option<&PendingRequest> {
        self.pending.as_ref()
    }

    pub fn assign(&mut self, request: PendingRequest, timer: TimerKey) {
        debug_assert!(self.pending.is_none());
        self.pending = Some(request);
        self.timer = Some(timer);
    }

    /// Matches a reply nonce against the outstanding request, freeing the slot. A reply with no
    /// or a mismatching outstanding request is unsolicited.
    pub fn pop_matching(&mut self, nonce: u32) -> Result<(PendingRequest, Option<TimerKey>), ProtocolError> {
        match &self.pending {
            Some(req) if req.nonce() == nonce => {
                let req = self.pending.take().expect("checked above");
                Ok((req, self.timer.take()))
            },
            _ => Err(ProtocolError::Unrequested),
        }
    }

    /// Frees the slot after its timer fired; the timer key is already consumed.
    pub fn pop_expired(&mut self, nonce: u32) -> Option<PendingRequest> {
        match &self.pending {
            Some(req) if req.nonce() == nonce => {
                self.timer = None;
                self.pending.take()
            },
            _ => None,
        }
    }

    pub fn take(&mut self) -> (Option<PendingRequest>, Option<TimerKey>) {
        (self.pending.take(), self.timer.take())
    }
}

/// Guard against peers sending faster than the protocol requires.
#[derive(Debug, Default)]
pub struct Ratelimit {
    last_update: Option<Instant>,
    last_ping: Option<Instant>,
}

impl Ratelimit {
    pub fn update(&mut self, now: Instant, min_interval: std::time::Duration) -> Result<(), ProtocolError> {
        Self::check(&mut self.last_update, now, min_interval)
    }

    pub fn ping(&mut self, now: Instant, min_interval: std::time::Duration) -> Result<(), ProtocolError> {
        Self::check(&mut self.last_ping, now, min_interval)
    }

    fn check(
        last: &mut Option<Instant>,
        now: Instant,
        min_interval: std::time::Duration,
    ) -> Result<(), ProtocolError> {
        if let Some(prev) = *last {
            if now < prev + min_interval {
                return Err(ProtocolError::MsgFlood);
            }
        }
        *last = Some(now);
        Ok(())
    }
}

/// Everything the event loop tracks per connection. `chain` is established by the peer's Init
/// message; until then the connection takes part in no sync activity.
#[derive(Debug)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub job: ConnectionJob,
    pub ratelimit: Ratelimit,
    pub chain: Option<PeerChain>,
    pub their_snapshot_priority: SnapshotPriority,
    pub acknowledged_snapshot_priority: SnapshotPriority,
    pub ping_nonce: Option<u32>,
    pub ping_timer: Option<TimerKey>,
}

impl ConnectionState {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            job: ConnectionJob::default(),
            ratelimit: Ratelimit::default(),
            chain: None,
            their_snapshot_priority: SnapshotPriority::default(),
            acknowledged_snapshot_priority: SnapshotPriority::default(),
            ping_nonce: None,
            ping_timer: None,
        }
    }

    pub fn initialized(&self) -> bool {
        self.chain.is_some()
    }

    pub fn chain(&self) -> &PeerChain {
        self.chain.as_ref().expect("connection is initialized")
    }

    pub fn chain_mut(&mut self) -> &mut PeerChain {
        self.chain.as_mut().expect("connection is initialized")
    }
}

/// All live connections, keyed by transport id.
#[derive(Debug, Default)]
pub struct ConnectionMap {
    map: HashMap<ConnectionId, ConnectionState>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: ConnectionState) -> Result<(), ProtocolError> {
        if self.map.contains_key(&state.id) {
            return Err(ProtocolError::DuplicateConnection);
        }
        self.map.insert(state.id, state);
        Ok(())
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionState> {
        self.map.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionState> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionState> {
        self.map.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.map.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ConnectionId, &mut ConnectionState)> {
        self.map.iter_mut()
    }
}
