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

use std::fmt::{self, Display, Formatter};

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::consensus::GENESIS_DIFFICULTY_EXPONENT;

const MANTISSA_MIN: u32 = 0x0080_0000;
const MANTISSA_MAX: u32 = 0x00FF_FFFF;
// Largest zero count for which the 24-bit mantissa still fits in 256 bits.
const ZEROS_MAX: u8 = 232;
const ZEROS_MIN: u8 = 1;

/// Compact 32-bit encoding of the proof-of-work threshold: the upper 8 bits count the leading
/// zero bits of the 256-bit target, the lower 24 bits are the mantissa with its top bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target(u32);

impl Target {
    /// Target of the first difficulty period.
    pub fn genesis() -> Self {
        Self::from_parts(GENESIS_DIFFICULTY_EXPONENT, MANTISSA_MIN)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    fn from_parts(zeros: u8, mantissa: u32) -> Self {
        debug_assert!((MANTISSA_MIN..=MANTISSA_MAX).contains(&mantissa));
        Self((u32::from(zeros) << 24) | (mantissa & MANTISSA_MAX))
    }

    pub fn zeros(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn mantissa(self) -> u32 {
        self.0 & MANTISSA_MAX
    }

    /// Encodings with an unset mantissa top bit or an out-of-range zero count do not correspond
    /// to any 256-bit threshold.
    pub fn is_well_formed(self) -> bool {
        self.mantissa() >= MANTISSA_MIN && (ZEROS_MIN..=ZEROS_MAX).contains(&self.zeros())
    }

    /// The full 256-bit threshold: `zeros` leading zero bits followed by the 24 mantissa bits.
    pub fn expand(self) -> U256 {
        debug_assert!(self.is_well_formed());
        U256::from(self.mantissa()) << (ZEROS_MAX - self.zeros())
    }

    /// Rescales the target by exactly `actual_elapsed / expected_elapsed`, renormalizing the
    /// mantissa. The zero count is bounded to the encoding's representable range.
    pub fn scale(&mut self, actual_elapsed: u32, expected_elapsed: u32) {
        debug_assert!(expected_elapsed > 0);
        debug_assert!(actual_elapsed > 0);
        let mut mantissa =
            u64::from(self.mantissa()) * u64::from(actual_elapsed) / u64::from(expected_elapsed);
        let mut zeros = i64::from(self.zeros());
        if mantissa == 0 {
            // ratio below the encoding's resolution: hardest representable target
            mantissa = u64::from(MANTISSA_MIN);
            zeros = i64::from(ZEROS_MAX);
        }
        while mantissa > u64::from(MANTISSA_MAX) {
            mantissa >>= 1;
            zeros -= 1;
        }
        while mantissa < u64::from(MANTISSA_MIN) {
            mantissa <<= 1;
            zeros += 1;
        }
        let zeros = zeros.clamp(i64::from(ZEROS_MIN), i64::from(ZEROS_MAX)) as u8;
        *self = Self::from_parts(zeros, mantissa as u32);
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn genesis_is_well_formed() {
        let t = Target::genesis();
        assert!(t.is_well_formed());
        assert_eq!(t.zeros(), GENESIS_DIFFICULTY_EXPONENT);
        assert_eq!(t.expand().leading_zeros(), u32::from(GENESIS_DIFFICULTY_EXPONENT));
    }

    #[test]
    fn scale_identity() {
        let mut t = Target::genesis();
        let before = t;
        t.scale(14400, 14400);
        assert_eq!(t, before);
    }

    #[test]
    fn scale_doubles_on_double_elapsed() {
        let mut t = Target::genesis();
        let before = t.expand();
        t.scale(28800, 14400);
        assert_eq!(t.zeros(), GENESIS_DIFFICULTY_EXPONENT - 1);
        assert_eq!(t.expand(), before << 1);
    }

    #[test]
    fn scale_halves_on_half_elapsed() {
        let mut t = Target::genesis();
        let before = t.expand();
        t.scale(7200, 14400);
        assert_eq!(t.expand(), before >> 1);
    }

    #[test]
    fn scale_applies_exact_ratio_beyond_fourfold() {
        let mut slow = Target::genesis();
        slow.scale(8 * 14400, 14400);
        assert_eq!(slow.expand(), Target::genesis().expand() << 3);

        let mut fast = Target::genesis();
        fast.scale(14400 / 8, 14400);
        assert_eq!(fast.expand(), Target::genesis().expand() >> 3);
    }

    #[test]
    fn scale_ratio_below_resolution_saturates_hardest() {
        let mut t = Target::genesis();
        t.scale(1, u32::MAX);
        assert!(t.is_well_formed());
        assert_eq!(t.zeros(), ZEROS_MAX);
        assert_eq!(t.mantissa(), MANTISSA_MIN);
    }

    #[test]
    fn malformed_encodings_detected() {
        assert!(!Target::from_raw(0).is_well_formed());
        assert!(!Target::from_raw(0x0000_0001).is_well_formed());
        // zero count above the representable range
        assert!(!Target::from_raw(0xFF80_0000).is_well_formed());
        assert!(Target::genesis().is_well_formed());
    }
}
