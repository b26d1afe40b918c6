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
    fmt::{self, Display, Formatter},
    ops::{Add, AddAssign, Mul, Sub, SubAssign},
};

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::proof_of_work::Target;

/// Cumulative inverse-target of a chain: the sum over all blocks of the expected number of hash
/// tries for that block's target. Totally ordered; this ordering is consensus-critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Worksum(U256);

impl Worksum {
    pub fn zero() -> Self {
        Self(U256::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Expected number of hash tries to find a block below `target`.
    pub fn from_target(target: Target) -> Self {
        Self(U256::MAX / target.expand())
    }

    pub fn as_u256(&self) -> U256 {
        self.0
    }

    pub fn from_u256(value: U256) -> Self {
        Self(value)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.0.to_big_endian(&mut out);
        out
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(U256::from_big_endian(&bytes))
    }
}

impl Add for Worksum {
    type Output = Worksum;

    fn add(self, rhs: Worksum) -> Worksum {
        Worksum(self.0 + rhs.0)
    }
}

impl AddAssign for Worksum {
    fn add_assign(&mut self, rhs: Worksum) {
        self.0 += rhs.0;
    }
}

impl Sub for Worksum {
    type Output = Worksum;

    fn sub(self, rhs: Worksum) -> Worksum {
        Worksum(self.0 - rhs.0)
    }
}

impl SubAssign for Worksum {
    fn sub_assign(&mut self, rhs: Worksum) {
        self.0 -= rhs.0;
    }
}

impl Mul<u32> for Worksum {
    type Output = Worksum;

    fn mul(self, rhs: u32) -> Worksum {
        Worksum(self.0 * U256::from(rhs))
    }
}

impl Display for Worksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn genesis_block_work() {
        let w = Worksum::from_target(Target::genesis());
        // expected tries for a 32-leading-zeros threshold with minimal mantissa: 2^33 - 1
        assert_eq!(w.as_u256().bits(), 33);
        assert!(!w.is_zero());
    }

    #[test]
    fn ordering_tracks_magnitude() {
        let one = Worksum::from_target(Target::genesis());
        let two = one + one;
        let many = one * 1000;
        assert!(Worksum::zero() < one);
        assert!(one < two);
        assert!(two < many);
        assert_eq!(many - one * 999, one);
    }

    #[test]
    fn be_bytes_round_trip() {
        let w = Worksum::from_target(Target::genesis()) * 12345;
        assert_eq!(Worksum::from_be_bytes(w.to_be_bytes()), w);
    }

    #[test]
    fn easier_target_contributes_less_work() {
        let mut easier = Target::genesis();
        easier.scale(2 * 14400, 14400);
        assert!(Worksum::from_target(easier) < Worksum::from_target(Target::genesis()));
    }
}
