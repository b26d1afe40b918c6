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

use std::collections::{BTreeMap, HashMap};

use warthog_common_types::{BlockSlot, Height, NonzeroHeight, BLOCK_BATCH_SIZE};

use crate::{base_node::event_loop::connection::ConnectionId, blocks::BlockBundle};

#[derive(Debug, Default)]
struct FocusNode {
    blocks: Vec<BlockBundle>,
    /// Connection currently downloading this slot.
    assigned: Option<ConnectionId>,
    /// Connections holding a link to this slot.
    refs: Vec<ConnectionId>,
}

/// An unfilled stretch of a focus slot, ready to be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSlot {
    pub slot: BlockSlot,
    pub lower: NonzeroHeight,
    pub upper: NonzeroHeight,
}

/// The sliding block-download window: up to `width` block slots starting right above the length
/// already delivered downstream. Each slot accumulates bodies from at most one peer at a time.
#[derive(Debug)]
pub struct Focus {
    map: BTreeMap<BlockSlot, FocusNode>,
    conn_slots: HashMap<ConnectionId, BlockSlot>,
    download_length: Height,
    width: usize,
}

impl Focus {
    pub fn new(width: usize) -> Self {
        Self {
            map: BTreeMap::new(),
            conn_slots: HashMap::new(),
            download_length: Height::zero(),
            width,
        }
    }

    /// Lower edge of the window: the next height to deliver.
    pub fn height_begin(&self) -> NonzeroHeight {
        (self.download_length + 1).nonzero_assert()
    }

    fn covers_next(&self, slot: BlockSlot, node: &FocusNode) -> bool {
        let next = self.download_length + 1;
        next >= slot.lower_height().height() && next <= slot.upper_height().height() && !node.blocks.is_empty()
    }

    pub fn has_data(&self) -> bool {
        self.map
            .iter()
            .next()
            .map(|(slot, node)| self.covers_next(*slot, node))
            .unwrap_or(false)
    }

    /// Delivers the contiguous run of blocks at the window front, sliding the window.
    pub fn pop_data(&mut self) -> Vec<BlockBundle> {
        debug_assert!(self.has_data());
        let mut out = Vec::new();
        loop {
            let (slot, node) = match self.map.iter_mut().next() {
                Some((s, n)) => (*s, n),
                None => break,
            };
            let next = self.download_length + 1;
            if !(next >= slot.lower_height().height() &&
                next <= slot.upper_height().height() &&
                !node.blocks.is_empty())
            {
                break;
            }
            let batch_upper = slot.upper_height();
            for block in node.blocks.drain(..) {
                self.download_length += 1;
                debug_assert!(block.height == self.download_length);
                out.push(block);
            }
            if self.download_length < batch_upper.height() {
                break;
            }
            self.map_erase(slot);
        }
        debug_assert!(!out.is_empty());
        out
    }

    /// The unfilled stretches of the window against a stage of the given length, materializing
    /// window nodes as needed.
    pub fn open_slots(&mut self, stage_length: Height) -> Vec<OpenSlot> {
        let begin = self.height_begin();
        if stage_length < begin {
            return Vec::new();
        }
        let download_slot = BlockSlot::of_height(begin);
        let max_slot = BlockSlot::of_height(stage_length.nonzero_assert());
        let bound = self.width.min((max_slot - download_slot) as usize + 1);
        let mut out = Vec::new();
        for i in 0..bound {
            let slot = download_slot + i as u32;
            let node = self.map.entry(slot).or_default();
            if node.assigned.is_some() {
                continue;
            }
            let present = node.blocks.len() as u32;
            let upper = slot.upper_height().height().min(stage_length);
            let lower_base = if slot.lower_height() > begin { slot.lower_height() } else { begin };
            let lower = lower_base + present;
            debug_assert!(lower.value() <= upper.value() + 1);
            if lower.value() == upper.value() + 1 {
                continue;
            }
            out.push(OpenSlot {
                slot,
                lower,
                upper: upper.nonzero_assert(),
            });
        }
        out
    }

    /// Binds a slot to the connection downloading it.
    pub fn assign(&mut self, slot: BlockSlot, conn: ConnectionId) {
        debug_assert!(!self.conn_slots.contains_key(&conn));
        let node = self.map.entry(slot).or_default();
        node.assigned = Some(conn);
        node.refs.push(conn);
        self.conn_slots.insert(conn, slot);
    }

    /// Unlinks a connection from its slot, reopening the slot for assignment.
    pub fn erase(&mut self, conn: ConnectionId) {
        if let Some(slot) = self.conn_slots.remove(&conn) {
            if let Some(node) = self.map.get_mut(&slot) {
                if node.assigned == Some(conn) {
                    node.assigned = None;
                }
                node.refs.retain(|c| *c != conn);
            }
        }
    }

    /// Folds received bodies into their slot. Non-contiguous data (a gap below the already
    /// buffered run) is discarded.
    pub fn set_slot_blocks(&mut self, blocks: Vec<BlockBundle>) {
        let first = match blocks.first() {
            Some(b) => b.height,
            None => return,
        };
        let slot = BlockSlot::of_height(first);
        debug_assert_eq!(slot, BlockSlot::of_height(blocks.last().expect("nonempty").height));
        let begin = self.height_begin();
        let node = self.map.entry(slot).or_default();
        let lower_base = if slot.lower_height() > begin { slot.lower_height() } else { begin };
        let missing_start = lower_base + node.blocks.len() as u32;
        if missing_start.value() < first.value() {
            return;
        }
        if node.blocks.is_empty() {
            node.blocks = blocks;
        } else {
            let skip = (missing_start - first) as usize;
            for block in blocks.into_iter().skip(skip) {
                node.blocks.push(block);
            }
        }
        debug_assert!(node.blocks.len() <= BLOCK_BATCH_SIZE as usize);
    }

    /// The stage switched to a chain forking at `fork_height`: drop everything above it.
    pub fn fork(&mut self, fork_height: NonzeroHeight) {
        let fork_slot = BlockSlot::of_height(fork_height);
        let affected: Vec<BlockSlot> = self.map.range(fork_slot..).map(|(s, _)| *s).collect();
        for slot in affected {
            if slot == fork_slot {
                let batch_begin = slot.lower_height();
                debug_assert!(batch_begin <= fork_height);
                let keep = (fork_height - batch_begin) as usize;
                let node = self.map.get_mut(&slot).expect("slot is present");
                if node.blocks.len() > keep {
                    node.blocks.truncate(keep);
                }
            } else {
                self.map_erase(slot);
            }
        }
    }

    /// Repositions the window after the applier acknowledged bodies up to `new_offset`.
    pub fn set_offset(&mut self, new_offset: Height) {
        if new_offset >= self.download_length {
            self.advance(new_offset);
            return;
        }
        self.download_length = new_offset;
        if self.map.is_empty() {
            return;
        }
        let slot = BlockSlot::of_height((new_offset + 1).nonzero_assert());
        // a node straddling the new offset held only a partial suffix; drop it
        if self.map.contains_key(&slot) {
            self.map_erase(slot);
        }
    }

    fn advance(&mut self, new_offset: Height) {
        debug_assert!(new_offset >= self.download_length);
        let target_slot = BlockSlot::of_height((new_offset + 1).nonzero_assert());
        let slots: Vec<BlockSlot> = self.map.keys().copied().collect();
        for slot in slots {
            if slot > target_slot {
                break;
            }
            if slot == target_slot {
                let node = self.map.get_mut(&slot).expect("slot is present");
                let n_erase = (new_offset + 1 - slot.lower_height().height()) as usize;
                if n_erase > node.blocks.len() {
                    node.blocks.clear();
                    self.map_erase(slot);
                } else {
                    node.blocks.drain(..n_erase);
                }
                break;
            }
            self.map_erase(slot);
        }
        self.download_length = new_offset;
    }

    pub fn clear(&mut self) {
        let slots: Vec<BlockSlot> = self.map.keys().copied().collect();
        for slot in slots {
            self.map_erase(slot);
        }
        self.download_length = Height::zero();
    }

    fn map_erase(&mut self, slot: BlockSlot) {
        if let Some(node) = self.map.remove(&slot) {
            for conn in node.refs {
                self.conn_slots.remove(&conn);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{blocks::BlockBody, test_utils::chain_of};

    fn bundles(range: std::ops::RangeInclusive<u32>) -> Vec<BlockBundle> {
        let headers = chain_of(*range.end() as usize, 1_600_000_000);
        range
            .map(|h| BlockBundle {
                height: NonzeroHeight::assert(h),
                header: headers[(h - 1) as usize],
                body: BlockBody::new(vec![h as u8]),
            })
            .collect()
    }

    #[test]
    fn window_lower_bound_tracks_download_length() {
        let mut focus = Focus::new(10);
        assert_eq!(focus.height_begin().value(), 1);
        focus.set_slot_blocks(bundles(1..=30));
        assert!(focus.has_data());
        let out = focus.pop_data();
        assert_eq!(out.len(), 30);
        assert_eq!(focus.height_begin().value(), 31);
    }

    #[test]
    fn partial_slot_delivers_and_stays() {
        let mut focus = Focus::new(10);
        focus.set_slot_blocks(bundles(1..=10));
        let out = focus.pop_data();
        assert_eq!(out.len(), 10);
        assert_eq!(focus.height_begin().value(), 11);
        assert!(!focus.has_data());
    }

    #[test]
    fn open_slots_cover_window_and_respect_stage_length() {
        let mut focus = Focus::new(3);
        let open = focus.open_slots(Height::new(70));
        assert_eq!(open.len(), 3);
        assert_eq!(open[0].lower.value(), 1);
        assert_eq!(open[0].upper.value(), 30);
        assert_eq!(open[2].lower.value(), 61);
        assert_eq!(open[2].upper.value(), 70);

        // assigned slots are not offered again
        focus.assign(open[0].slot, ConnectionId::new(1));
        let open = focus.open_slots(Height::new(70));
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].lower.value(), 31);
    }

    #[test]
    fn open_slot_resumes_after_partial_fill() {
        let mut focus = Focus::new(2);
        focus.set_slot_blocks(bundles(1..=12));
        let open = focus.open_slots(Height::new(60));
        assert_eq!(open[0].lower.value(), 13);
        assert_eq!(open[0].upper.value(), 30);
    }

    #[test]
    fn erase_frees_assignment() {
        let mut focus = Focus::new(2);
        let open = focus.open_slots(Height::new(60));
        focus.assign(open[0].slot, ConnectionId::new(9));
        assert_eq!(focus.open_slots(Height::new(60)).len(), 1);
        focus.erase(ConnectionId::new(9));
        assert_eq!(focus.open_slots(Height::new(60)).len(), 2);
    }

    #[test]
    fn fork_truncates_affected_slots() {
        let mut focus = Focus::new(4);
        focus.set_slot_blocks(bundles(1..=30));
        focus.set_slot_blocks(bundles(31..=60));
        focus.fork(NonzeroHeight::assert(16));
        // slot 0 keeps 15 blocks, slot 1 is dropped
        let out = focus.pop_data();
        assert_eq!(out.len(), 15);
        assert_eq!(focus.height_begin().value(), 16);
        assert!(!focus.has_data());
    }

    #[test]
    fn set_offset_backwards_drops_partial_slot() {
        let mut focus = Focus::new(4);
        focus.set_slot_blocks(bundles(1..=30));
        let _ = focus.pop_data();
        assert_eq!(focus.height_begin().value(), 31);
        focus.set_offset(Height::new(10));
        assert_eq!(focus.height_begin().value(), 11);
        assert!(!focus.has_data());
    }
}
