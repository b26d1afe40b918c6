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

// Deciding between a batch request and a probe: when the fork interval is still wide relative to
// what a batch download would cover, a single-header probe at the interval midpoint
// disambiguates faster and cheaper than downloading headers we may throw away.

use std::sync::Arc;

use warthog_common_types::{BatchSlot, Height, NonzeroHeight};

use crate::{
    base_node::event_loop::request::{HeaderRequest, HeaderRequestKind, ProbeRequest},
    blocks::BlockHeader,
    chain::{
        batch::Batch,
        descripted::Descripted,
        error::ChainError,
        fork_range::ForkRange,
        header_chain::HeaderChain,
    },
    proof_of_work::Worksum,
};

/// A fork range paired with a pinned local chain it was measured against, carried by probing
/// connections. The pin keeps the measured chain alive across stage switches.
#[derive(Debug, Clone)]
pub struct ProbeData {
    fork_range: ForkRange,
    chain: Arc<HeaderChain>,
}

impl ProbeData {
    pub fn new(fork_range: ForkRange, chain: Arc<HeaderChain>) -> Self {
        Self { fork_range, chain }
    }

    pub fn fork_range(&self) -> &ForkRange {
        &self.fork_range
    }

    pub fn chain(&self) -> &Arc<HeaderChain> {
        &self.chain
    }

    /// Folds a probe reply header into the tracked range.
    pub fn match_header(&mut self, height: NonzeroHeight, header: &BlockHeader) -> Result<(), ChainError> {
        self.fork_range.match_header(&self.chain, height, header)?;
        Ok(())
    }
}

fn can_download(fork_lower: NonzeroHeight, fork_upper: NonzeroHeight, bound: Height) -> bool {
    debug_assert!(fork_lower <= fork_upper);
    debug_assert!(fork_upper.height() <= bound + 1);
    let delta = fork_upper - fork_lower;
    let download_length = bound + 1 - fork_lower.height();
    debug_assert!(download_length > 0);
    download_length < 20 || delta * 2 < download_length
}

fn probe_lower(pd: &ProbeData) -> NonzeroHeight {
    pd.fork_range.lower()
}

fn probe_upper(pd: &ProbeData, max_length: Height) -> NonzeroHeight {
    debug_assert!((max_length + 1).value() >= pd.fork_range.lower().value());
    debug_assert!((pd.chain.length() + 1).value() >= pd.fork_range.lower().value());
    let mut u = (pd.chain.length().min(max_length) + 1).nonzero_assert();
    if pd.fork_range.forked() && pd.fork_range.upper() < u {
        u = pd.fork_range.upper();
    }
    u
}

/// A probe at the fork-range midpoint, unless the range is already narrow enough to download.
pub fn probe_request(pd: &ProbeData, desc: &Arc<Descripted>, max_length: Height) -> Option<ProbeRequest> {
    let l = probe_lower(pd);
    let u = probe_upper(pd, max_length);
    if can_download(l, u, max_length) {
        return None;
    }
    let height = l + (u - l) / 2;
    if height <= l {
        return None;
    }
    Some(ProbeRequest::new(desc.clone(), height))
}

/// A shared full-batch request for `slot`, when the probe interval is narrow enough.
pub fn slot_batch_request(
    pd: &ProbeData,
    desc: &Arc<Descripted>,
    slot: BatchSlot,
    final_header: BlockHeader,
) -> Option<HeaderRequest> {
    let max_length = slot.upper().height();
    let l = probe_lower(pd);
    let u = probe_upper(pd, max_length);
    if can_download(l, u, max_length) {
        return Some(HeaderRequest::new(
            desc.clone(),
            slot.lower(),
            slot.upper(),
            Batch::new(),
            HeaderRequestKind::Shared { key: final_header },
        ));
    }
    None
}

/// An exclusive request for the leader's final partial batch, prefixed with locally known
/// headers when the fork range starts inside the slot.
pub fn final_partial_batch_request(
    pd: &ProbeData,
    desc: &Arc<Descripted>,
    max_length: NonzeroHeight,
    claimed_work: Worksum,
) -> Option<HeaderRequest> {
    let slot = BatchSlot::of_height(max_length);
    if slot.upper() == max_length {
        return None;
    }
    let l = probe_lower(pd);
    let u = probe_upper(pd, max_length.height());
    if !can_download(l, u, max_length.height()) {
        return None;
    }
    if slot.lower() > l {
        // whole-slot request from the leader
        Some(HeaderRequest::new(
            desc.clone(),
            slot.lower(),
            max_length,
            Batch::new(),
            HeaderRequestKind::Partial { claimed_work },
        ))
    } else {
        // the prefix below the fork lower bound is already known locally
        let prefix = pd.chain.get_headers(slot.lower(), l);
        Some(HeaderRequest::new(
            desc.clone(),
            l,
            max_length,
            prefix,
            HeaderRequestKind::Partial { claimed_work },
        ))
    }
}

#[cfg(test)]
mod test {
    use warthog_common_types::{Descriptor, HEADER_BATCH_SIZE};

    use super::*;
    use crate::{
        chain::batch_registry::BatchRegistry,
        proof_of_work::Worksum,
        test_utils::extendable_with_tail,
    };

    fn descripted(length: u32) -> Arc<Descripted> {
        Arc::new(Descripted::new(
            Descriptor::new(1),
            Height::new(length),
            Worksum::from_u256(1u64.into()),
            crate::chain::batch::Grid::new(),
        ))
    }

    #[test]
    fn wide_range_probes_at_midpoint() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 1, 0);
        let pd = ProbeData::new(ForkRange::default(), Arc::new(chain.headers().clone()));
        let desc = descripted(HEADER_BATCH_SIZE);
        let req = probe_request(&pd, &desc, Height::new(HEADER_BATCH_SIZE)).expect("range is wide");
        // midpoint of [1, 8641]
        assert_eq!(req.msg.height.value(), 1 + (HEADER_BATCH_SIZE + 1 - 1) / 2);
    }

    #[test]
    fn narrow_range_downloads_instead_of_probing() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 1, 0);
        let mut fr = ForkRange::default();
        fr.on_match(Height::new(HEADER_BATCH_SIZE - 10)).unwrap();
        let pd = ProbeData::new(fr, Arc::new(chain.headers().clone()));
        let desc = descripted(HEADER_BATCH_SIZE);
        assert!(probe_request(&pd, &desc, Height::new(HEADER_BATCH_SIZE)).is_none());
    }

    #[test]
    fn final_partial_request_carries_local_prefix() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 0, 40);
        // fork range narrowed to [31, inf): headers 1..=30 are known shared
        let mut fr = ForkRange::default();
        fr.on_match(Height::new(30)).unwrap();
        let pd = ProbeData::new(fr, Arc::new(chain.headers().clone()));
        let desc = descripted(45);
        let req = final_partial_batch_request(&pd, &desc, NonzeroHeight::assert(45), Worksum::zero())
            .expect("downloadable");
        assert_eq!(req.prefix.len(), 30);
        assert_eq!(req.msg.start_height.value(), 31);
        assert_eq!(req.msg.length, 15);
        assert!(matches!(req.kind, HeaderRequestKind::Partial { .. }));
    }

    #[test]
    fn complete_final_slot_needs_no_partial_request() {
        let registry = BatchRegistry::new();
        let chain = extendable_with_tail(&registry, 1, 0);
        let pd = ProbeData::new(ForkRange::default(), Arc::new(chain.headers().clone()));
        let desc = descripted(HEADER_BATCH_SIZE);
        assert!(final_partial_batch_request(
            &pd,
            &desc,
            NonzeroHeight::assert(HEADER_BATCH_SIZE),
            Worksum::zero()
        )
        .is_none());
    }
}
