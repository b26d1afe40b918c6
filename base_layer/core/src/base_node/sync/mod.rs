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

pub mod block_sync;
pub mod config;
pub mod header_sync;
pub mod offender;

pub use config::SyncConfig;
pub use offender::ChainOffender;

/// Sync-state change detection: the node counts as synced when it has initialized connections
/// and neither download pipeline is active.
#[derive(Debug, Default)]
pub struct SyncState {
    has_initialized_connections: bool,
    block_download_active: bool,
    header_download_active: bool,
    state: bool,
}

impl SyncState {
    pub fn set_block_download(&mut self, active: bool) {
        self.block_download_active = active;
    }

    pub fn set_header_download(&mut self, active: bool) {
        self.header_download_active = active;
    }

    pub fn set_has_connections(&mut self, has_connections: bool) {
        self.has_initialized_connections = has_connections;
    }

    /// The new synced flag, when it flipped.
    pub fn detect_change(&mut self) -> Option<bool> {
        let new_state = if self.state {
            self.has_initialized_connections
        } else {
            self.has_initialized_connections && !self.block_download_active && !self.header_download_active
        };
        let changed = new_state != self.state;
        self.state = new_state;
        changed.then_some(new_state)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sync_state_transitions() {
        let mut s = SyncState::default();
        assert_eq!(s.detect_change(), None);

        s.set_has_connections(true);
        s.set_header_download(true);
        assert_eq!(s.detect_change(), None); // still downloading

        s.set_header_download(false);
        assert_eq!(s.detect_change(), Some(true));

        // an active download does not immediately unsync a synced node
        s.set_block_download(true);
        assert_eq!(s.detect_change(), None);

        s.set_has_connections(false);
        assert_eq!(s.detect_change(), Some(false));
    }
}
