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

use primitive_types::U256;
use warthog_common_types::NonzeroHeight;

use crate::{
    blocks::{BlockHash, BlockHeader},
    proof_of_work::Target,
};

/// Seam to the proof-of-work hash primitive. The sync core consumes a boolean verdict only; the
/// inner algorithm (and any version gating by height) lives behind this trait.
pub trait PowVerifier: Send + Sync {
    fn verify(&self, header: &BlockHeader, hash: &BlockHash, height: NonzeroHeight, target: Target) -> bool;
}

/// Reference verifier: the header hash interpreted as a big-endian 256-bit integer must fall
/// below the expanded target.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Pow;

impl PowVerifier for Sha256Pow {
    fn verify(&self, _header: &BlockHeader, hash: &BlockHash, _height: NonzeroHeight, target: Target) -> bool {
        U256::from_big_endian(hash.as_bytes()) < target.expand()
    }
}

/// Test verifier that treats every header as sufficiently worked.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllPow;

impl PowVerifier for AcceptAllPow {
    fn verify(&self, _header: &BlockHeader, _hash: &BlockHash, _height: NonzeroHeight, _target: Target) -> bool {
        true
    }
}
