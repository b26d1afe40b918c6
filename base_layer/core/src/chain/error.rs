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

use thiserror::Error;
use warthog_common_types::NonzeroHeight;

/// Chain-level validation failures. Each kind maps to a stable numeric code carried on the wire
/// and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChainErrorKind {
    #[error("header does not link to previous hash")]
    HeaderLink,
    #[error("header target does not match required difficulty")]
    Difficulty,
    #[error("proof of work below target")]
    Pow,
    #[error("header contradicts signed chain snapshot")]
    LeaderMismatch,
    #[error("timestamp does not exceed median of recent blocks")]
    Timestamp,
    #[error("timestamp too far in the future")]
    ClockTolerance,
    #[error("header batch has invalid size")]
    BatchSize,
    #[error("block body merkle root mismatch")]
    MerkleRoot,
    #[error("claimed worksum exceeds verified worksum")]
    FakeWork,
    #[error("claimed chain length inconsistent")]
    FakeHeight,
    #[error("probe reply inconsistent with advertised chain")]
    BadProbe,
    #[error("probe reply carries stale descriptor")]
    ProbeDescriptor,
    #[error("match reported above a known mismatch")]
    BadMatch,
    #[error("mismatch reported below a known match")]
    BadMismatch,
    #[error("empty block reply for live descriptor")]
    Empty,
}

impl ChainErrorKind {
    pub fn code(self) -> u32 {
        use ChainErrorKind::*;
        match self {
            HeaderLink => 30,
            Difficulty => 31,
            Pow => 32,
            LeaderMismatch => 33,
            Timestamp => 34,
            ClockTolerance => 35,
            BatchSize => 36,
            MerkleRoot => 37,
            FakeWork => 38,
            FakeHeight => 39,
            BadProbe => 40,
            ProbeDescriptor => 41,
            BadMatch => 42,
            BadMismatch => 43,
            Empty => 44,
        }
    }

    pub fn at(self, height: NonzeroHeight) -> ChainError {
        ChainError { kind: self, height }
    }
}

/// A chain validation failure located at the first offending height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} at height {height}")]
pub struct ChainError {
    pub kind: ChainErrorKind,
    pub height: NonzeroHeight,
}

impl ChainError {
    pub fn new(kind: ChainErrorKind, height: NonzeroHeight) -> Self {
        Self { kind, height }
    }
}
