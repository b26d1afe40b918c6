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
    collections::VecDeque,
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use warthog_common_types::{Height, NonzeroHeight};

use crate::{
    blocks::{genesis_hash, BlockHash, BlockHeader},
    chain::{
        batch_registry::SharedBatch,
        error::{ChainError, ChainErrorKind},
        header_chain::{HeaderChain, HeaderSpan},
        signed_snapshot::SignedSnapshot,
    },
    consensus::{retarget_floor, BLOCK_TIME, MEDIAN_N, TOLERANCE_MINUTES},
    proof_of_work::{PowVerifier, Target},
};

pub(crate) fn now_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as u32
}

/// Sliding window of the last `MEDIAN_N` block timestamps; a new block's timestamp must strictly
/// exceed the lower median.
#[derive(Debug, Clone, Default)]
struct TimestampWindow {
    timestamps: VecDeque<u32>,
}

impl TimestampWindow {
    fn append(&mut self, timestamp: u32) {
        self.timestamps.push_back(timestamp);
        if self.timestamps.len() > MEDIAN_N {
            self.timestamps.pop_front();
        }
    }

    fn median(&self) -> Option<u32> {
        if self.timestamps.is_empty() {
            return None;
        }
        let mut sorted: Vec<u32> = self.timestamps.iter().copied().collect();
        sorted.sort_unstable();
        Some(sorted[(sorted.len() - 1) / 2])
    }

    fn valid(&self, timestamp: u32) -> bool {
        match self.median() {
            Some(median) => median < timestamp,
            None => true,
        }
    }

    fn min_valid(&self) -> u32 {
        self.median().map(|m| m + 1).unwrap_or(0)
    }

    fn clear(&mut self) {
        self.timestamps.clear();
    }
}

/// A header that passed [`HeaderVerifier::prepare_append`], with its hash computed once.
#[derive(Debug, Clone, Copy)]
pub struct PreparedAppend {
    pub header: BlockHeader,
    pub hash: BlockHash,
}

/// Stateful header replay: current length and tip hash, the two latest retarget anchors, the
/// target required of the next header, and the median-time window. Cheap to clone; batch
/// validation runs on a copy and only commits on success.
#[derive(Clone)]
pub struct HeaderVerifier {
    pow: Arc<dyn PowVerifier>,
    length: Height,
    final_hash: BlockHash,
    latest_retarget_height: Height,
    latest_retarget_time: u32,
    next_target: Target,
    timestamps: TimestampWindow,
}

impl fmt::Debug for HeaderVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderVerifier")
            .field("length", &self.length)
            .field("next_target", &self.next_target)
            .field("final_hash", &self.final_hash)
            .finish()
    }
}

impl HeaderVerifier {
    /// Verifier for the empty chain.
    pub fn new(pow: Arc<dyn PowVerifier>) -> Self {
        Self {
            pow,
            length: Height::zero(),
            final_hash: genesis_hash(),
            latest_retarget_height: Height::zero(),
            latest_retarget_time: 0,
            next_target: Target::genesis(),
            timestamps: TimestampWindow::default(),
        }
    }

    /// Verifier positioned after `length` headers of `chain`.
    pub fn from_chain(chain: &HeaderChain, length: Height, pow: Arc<dyn PowVerifier>) -> Self {
        let mut v = Self::new(pow);
        v.length = length;
        v.final_hash = chain.hash_at(length);

        v.timestamps.clear();
        let window_start = length.saturating_sub(MEDIAN_N as u32) + 1;
        let mut h = window_start;
        while h <= length && h >= Height::new(1) {
            v.timestamps.append(chain.header_at(h.nonzero_assert()).timestamp());
            h += 1;
        }

        if let Some(length) = length.nonzero() {
            let upper = retarget_floor(length);
            if upper.value() == 1 {
                v.next_target = Target::genesis();
                v.latest_retarget_height = Height::new(1);
                v.latest_retarget_time = chain.header_at(NonzeroHeight::assert(1)).timestamp();
            } else {
                let lower = retarget_floor((upper.prev()).nonzero_assert());
                let lower_header = chain.header_at(lower);
                let upper_header = chain.header_at(upper);
                let mut target = upper_header.target();
                target.scale(
                    upper_header.timestamp() - lower_header.timestamp(),
                    BLOCK_TIME * (upper - lower),
                );
                v.next_target = target;
                v.latest_retarget_height = upper.height();
                v.latest_retarget_time = upper_header.timestamp();
            }
        }
        v
    }

    /// Verifier positioned after the last header of a shared complete batch, reading retarget
    /// anchors through the batch's parent links.
    pub fn from_shared_batch(pin: &SharedBatch, pow: Arc<dyn PowVerifier>) -> Self {
        let mut v = Self::new(pow);
        let length = pin.upper_height().nonzero_assert();
        v.length = length.height();
        v.final_hash = pin.last_header().hash();
        let latest = retarget_floor(length);
        let latest_header = pin
            .header_at_recursive(latest)
            .expect("retarget height below batch upper height");
        v.latest_retarget_height = latest.height();
        v.latest_retarget_time = latest_header.timestamp();

        if latest.value() == 1 {
            v.next_target = Target::genesis();
        } else {
            let prev = retarget_floor(latest.prev().nonzero_assert());
            let prev_header = pin
                .header_at_recursive(prev)
                .expect("previous retarget height below batch upper height");
            let mut target = latest_header.target();
            target.scale(
                latest_header.timestamp() - prev_header.timestamp(),
                BLOCK_TIME * (latest - prev),
            );
            v.next_target = target;
        }

        let batch = pin.batch();
        debug_assert!(batch.len() > MEDIAN_N);
        for i in batch.len() - MEDIAN_N..batch.len() {
            v.timestamps.append(batch.get(i).expect("index in range").timestamp());
        }
        v
    }

    pub fn height(&self) -> Height {
        self.length
    }

    pub(crate) fn pow_handle(&self) -> Arc<dyn PowVerifier> {
        self.pow.clone()
    }

    pub fn final_hash(&self) -> &BlockHash {
        &self.final_hash
    }

    pub fn next_target(&self) -> Target {
        self.next_target
    }

    /// Smallest timestamp the next header may carry.
    pub fn min_valid_timestamp(&self) -> u32 {
        self.timestamps.min_valid().max(self.latest_retarget_time + 1)
    }

    /// Validates a header as the chain's next block. Checks, in order: previous-hash link,
    /// required target, proof of work, signed snapshot pin, strictly increasing median time,
    /// and clock drift tolerance.
    pub fn prepare_append(
        &self,
        snapshot: Option<&SignedSnapshot>,
        header: &BlockHeader,
    ) -> Result<PreparedAppend, ChainErrorKind> {
        if header.prev_hash() != self.final_hash {
            return Err(ChainErrorKind::HeaderLink);
        }
        if header.target() != self.next_target {
            return Err(ChainErrorKind::Difficulty);
        }
        let hash = header.hash();
        let height = self.length.add1();
        if !self.pow.verify(header, &hash, height, self.next_target) {
            return Err(ChainErrorKind::Pow);
        }
        if let Some(ss) = snapshot {
            if height == ss.height() && ss.hash != hash {
                return Err(ChainErrorKind::LeaderMismatch);
            }
        }
        let t = header.timestamp();
        if !self.timestamps.valid(t) || self.latest_retarget_time >= t {
            return Err(ChainErrorKind::Timestamp);
        }
        if t > now_timestamp() + TOLERANCE_MINUTES * 60 {
            return Err(ChainErrorKind::ClockTolerance);
        }
        Ok(PreparedAppend {
            header: *header,
            hash,
        })
    }

    /// Commits a prepared header, advancing the retarget anchors when the new height is a
    /// difficulty-adjustment boundary.
    pub fn append(&mut self, new_length: NonzeroHeight, prepared: &PreparedAppend) {
        assert!(new_length == self.length + 1);
        self.length = new_length.height();
        self.final_hash = prepared.hash;

        let timestamp = prepared.header.timestamp();
        debug_assert!(timestamp != 0);
        self.timestamps.append(timestamp);

        let upper = retarget_floor(new_length);
        if upper == new_length {
            if upper.value() == 1 {
                self.latest_retarget_height = Height::new(1);
                self.latest_retarget_time = timestamp;
            } else {
                debug_assert!(!self.latest_retarget_height.is_zero());
                debug_assert!(self.latest_retarget_time != 0);
                debug_assert!(self.latest_retarget_time < timestamp);
                let lower = retarget_floor(upper.prev().nonzero_assert());
                self.next_target.scale(
                    timestamp - self.latest_retarget_time,
                    BLOCK_TIME * (upper.height() - lower.height()),
                );
                self.latest_retarget_height = upper.height();
                self.latest_retarget_time = timestamp;
            }
        }
    }

    /// Replays every header of `span` above the current length on a copy, returning the advanced
    /// verifier or the error with the offending height.
    pub fn copy_apply(
        &self,
        snapshot: Option<&SignedSnapshot>,
        span: HeaderSpan<'_>,
    ) -> Result<HeaderVerifier, ChainError> {
        let mut res = self.clone();
        debug_assert!(span.begin_height() <= res.length + 1);
        let mut h = res.length.add1();
        while h < span.end_height() {
            let header = span.at(h).expect("span begins at or below verifier length");
            let prepared = res.prepare_append(snapshot, &header).map_err(|kind| kind.at(h))?;
            res.append(h, &prepared);
            h = h + 1;
        }
        Ok(res)
    }
}
