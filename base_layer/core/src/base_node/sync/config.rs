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

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Outstanding batch requests queued per header-download leader.
    pub pending_depth: usize,
    /// Maximum number of simultaneously tracked leaders.
    pub max_leaders: usize,
    /// Width of the block-download focus window, in block slots.
    pub focus_window: usize,
    /// Upper bound on simultaneously outstanding requests across all peers.
    pub max_requests: usize,
    /// Deadline for every outbound request. Header and block requests closing on expiry; probe
    /// expiry is absorbed.
    pub request_timeout: Duration,
    /// Minimum spacing of general messages per connection.
    pub message_interval: Duration,
    /// Minimum spacing of pings per connection.
    pub ping_interval: Duration,
    /// Inbound messages buffered per connection before the flood guard closes it.
    pub inbound_queue_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pending_depth: 10,
            max_leaders: 10,
            focus_window: 10,
            max_requests: 10,
            request_timeout: Duration::from_secs(30),
            message_interval: Duration::from_secs(2 * 60),
            ping_interval: Duration::from_secs(5),
            inbound_queue_limit: 15,
        }
    }
}
