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

use std::{collections::BTreeMap, time::Instant};

use crate::base_node::event_loop::connection::ConnectionId;

/// Deferred work inside the event loop, fired by wakeup time. Within one tick, timers fire
/// before new message events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// An outbound request passed its deadline.
    RequestExpire { conn: ConnectionId, nonce: u32 },
    /// Time to ping this connection again.
    SendPing { conn: ConnectionId },
    /// The peer did not answer the last ping in time.
    CloseNoPong { conn: ConnectionId, nonce: u32 },
}

impl TimerEvent {
    pub fn conn(&self) -> ConnectionId {
        match self {
            TimerEvent::RequestExpire { conn, .. } |
            TimerEvent::SendPing { conn } |
            TimerEvent::CloseNoPong { conn, .. } => *conn,
        }
    }
}

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    at: Instant,
    seq: u64,
}

/// Ordered wakeup queue driving request expiry and ping cadence.
#[derive(Debug, Default)]
pub struct TimerSystem {
    ordered: BTreeMap<TimerKey, TimerEvent>,
    seq: u64,
}

impl TimerSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, at: Instant, event: TimerEvent) -> TimerKey {
        self.seq += 1;
        let key = TimerKey { at, seq: self.seq };
        self.ordered.insert(key, event);
        key
    }

    pub fn cancel(&mut self, key: TimerKey) -> bool {
        self.ordered.remove(&key).is_some()
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.ordered.keys().next().map(|k| k.at)
    }

    pub fn pop_expired(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut expired = Vec::new();
        while let Some((&key, _)) = self.ordered.iter().next() {
            if key.at > now {
                break;
            }
            let (_, event) = self.ordered.remove_entry(&key).expect("first key exists");
            expired.push(event);
        }
        expired
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerSystem::new();
        let now = Instant::now();
        let later = now + Duration::from_secs(5);
        timers.insert(later, TimerEvent::SendPing {
            conn: ConnectionId::new(2),
        });
        timers.insert(now, TimerEvent::SendPing {
            conn: ConnectionId::new(1),
        });

        let expired = timers.pop_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].conn(), ConnectionId::new(1));
        assert_eq!(timers.next_wakeup(), Some(later));

        let expired = timers.pop_expired(later);
        assert_eq!(expired.len(), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn cancelled_timers_do_not_fire() {
        let mut timers = TimerSystem::new();
        let now = Instant::now();
        let key = timers.insert(now, TimerEvent::RequestExpire {
            conn: ConnectionId::new(1),
            nonce: 7,
        });
        assert!(timers.cancel(key));
        assert!(!timers.cancel(key));
        assert!(timers.pop_expired(now).is_empty());
    }
}
