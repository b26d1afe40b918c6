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
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use warthog_common_types::{Height, NonzeroHeight};

use crate::{
    base_node::{event_loop::connection::ConnectionId, peer_chain::PeerChain, sync::block_sync::stage::BanEntry},
    blocks::BlockHeader,
    chain::{descripted::Descripted, error::ChainError, fork_range::ForkRange, header_chain::HeaderChain},
};

#[derive(Debug)]
struct ForkData {
    fork_range: ForkRange,
    descripted: Arc<Descripted>,
}

/// Peers ordered by the lower bound of their fork range versus the stage chain. A peer whose
/// fork lower bound exceeds a height is proven to agree with the stage up to that height and may
/// serve its blocks.
#[derive(Debug, Default)]
pub struct Forks {
    ordered: BTreeMap<(NonzeroHeight, ConnectionId), ()>,
    data: HashMap<ConnectionId, ForkData>,
}

impl Forks {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has(&self, conn: ConnectionId) -> bool {
        self.data.contains_key(&conn)
    }

    pub fn descripted(&self, conn: ConnectionId) -> Option<&Arc<Descripted>> {
        self.data.get(&conn).map(|d| &d.descripted)
    }

    pub fn fork_range(&self, conn: ConnectionId) -> Option<&ForkRange> {
        self.data.get(&conn).map(|d| &d.fork_range)
    }

    /// Tracks `conn` under its current stage fork range and chain version.
    pub fn link(&mut self, conn: ConnectionId, peer: &PeerChain) {
        self.assign(conn, peer.descripted().clone(), *peer.stage_fork_range());
    }

    pub fn assign(&mut self, conn: ConnectionId, descripted: Arc<Descripted>, fork_range: ForkRange) {
        debug_assert!(
            fork_range.lower().value() <= descripted.chain_length().value() + 1,
            "fork lower bound beyond peer chain"
        );
        self.remove_ordered(conn);
        self.ordered.insert((fork_range.lower(), conn), ());
        self.data.insert(conn, ForkData { fork_range, descripted });
    }

    /// Applies a probe result for `conn` against the stage chain, reindexing on a lower-bound
    /// change.
    pub fn match_header(
        &mut self,
        conn: ConnectionId,
        stage: &HeaderChain,
        height: NonzeroHeight,
        header: &BlockHeader,
    ) -> Result<(), ChainError> {
        let data = match self.data.get_mut(&conn) {
            Some(d) => d,
            None => return Ok(()),
        };
        let change = data.fork_range.match_header(stage, height, header)?;
        if change.changed_lower {
            let lower = data.fork_range.lower();
            self.remove_ordered(conn);
            self.ordered.insert((lower, conn), ());
        }
        Ok(())
    }

    pub fn erase(&mut self, conn: ConnectionId) {
        self.remove_ordered(conn);
        self.data.remove(&conn);
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.data.clear();
    }

    /// Highest stage height any tracked peer can prove blocks for.
    pub fn reachable_length(&self) -> Option<Height> {
        self.ordered.keys().next_back().map(|(h, _)| h.prev())
    }

    /// Peers whose fork lower bound is at least `from`, ascending, i.e. in order of
    /// just-sufficient coverage.
    pub fn covering(&self, from: NonzeroHeight) -> impl Iterator<Item = ConnectionId> + '_ {
        self.ordered
            .range((from, ConnectionId::new(u64::MIN))..)
            .map(|((_, conn), _)| *conn)
    }

    /// Ban-memory snapshot of every peer with fork lower bound at least `from`.
    pub fn ban_memory(&self, from: NonzeroHeight) -> Vec<BanEntry> {
        self.ordered
            .range((from, ConnectionId::new(u64::MIN))..)
            .map(|((h, conn), _)| BanEntry {
                fork_height: *h,
                conn: *conn,
            })
            .collect()
    }

    fn remove_ordered(&mut self, conn: ConnectionId) {
        if let Some(d) = self.data.get(&conn) {
            self.ordered.remove(&(d.fork_range.lower(), conn));
        }
    }
}

#[cfg(test)]
mod test {
    use warthog_common_types::Descriptor;

    use super::*;
    use crate::{chain::batch::Grid, proof_of_work::Worksum};

    fn descripted(length: u32) -> Arc<Descripted> {
        Arc::new(Descripted::new(
            Descriptor::new(1),
            Height::new(length),
            Worksum::from_u256(1u64.into()),
            Grid::new(),
        ))
    }

    fn nz(h: u32) -> NonzeroHeight {
        NonzeroHeight::assert(h)
    }

    #[test]
    fn reachable_length_is_best_fork_lower() {
        let mut forks = Forks::default();
        forks.assign(ConnectionId::new(1), descripted(100), ForkRange::open(nz(31)));
        forks.assign(ConnectionId::new(2), descripted(100), ForkRange::open(nz(61)));
        assert_eq!(forks.reachable_length(), Some(Height::new(60)));
        forks.erase(ConnectionId::new(2));
        assert_eq!(forks.reachable_length(), Some(Height::new(30)));
        forks.erase(ConnectionId::new(1));
        assert_eq!(forks.reachable_length(), None);
    }

    #[test]
    fn covering_orders_by_just_sufficient_coverage() {
        let mut forks = Forks::default();
        forks.assign(ConnectionId::new(1), descripted(100), ForkRange::open(nz(31)));
        forks.assign(ConnectionId::new(2), descripted(100), ForkRange::open(nz(61)));
        forks.assign(ConnectionId::new(3), descripted(100), ForkRange::open(nz(41)));
        let order: Vec<_> = forks.covering(nz(31)).collect();
        assert_eq!(order, vec![
            ConnectionId::new(1),
            ConnectionId::new(3),
            ConnectionId::new(2)
        ]);
        let order: Vec<_> = forks.covering(nz(32)).collect();
        assert_eq!(order, vec![ConnectionId::new(3), ConnectionId::new(2)]);
    }

    #[test]
    fn reassignment_moves_ordering_key() {
        let mut forks = Forks::default();
        forks.assign(ConnectionId::new(1), descripted(100), ForkRange::open(nz(31)));
        forks.assign(ConnectionId::new(1), descripted(100), ForkRange::open(nz(71)));
        assert_eq!(forks.len(), 1);
        assert_eq!(forks.reachable_length(), Some(Height::new(70)));
    }
}
