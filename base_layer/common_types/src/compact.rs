// Copyright 2023. The Warthog Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use serde::{Deserialize, Serialize};

/// 16-bit exponent-mantissa compaction of a 64-bit amount: upper 6 bits are the exponent `e`,
/// lower 10 bits the mantissa with an implicit leading bit. Decodes to
/// `(mantissa | 0x0400) << (e - 10)` (right shift for `e < 10`). Compaction rounds down, so
/// `compact(x).uncompact() <= x`, with equality for exactly representable amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct CompactUInt(u16);

impl CompactUInt {
    pub const fn from_value(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    pub fn compact(amount: u64) -> Self {
        if amount == 0 {
            return Self(0);
        }
        let mut e: u16 = 10;
        let mut m = amount;
        while m > 0x07FF {
            e += 1;
            m >>= 1;
        }
        while m < 0x0400 {
            e -= 1;
            m <<= 1;
        }
        Self((e << 10) | (m as u16 & 0x03FF))
    }

    pub fn uncompact(self) -> u64 {
        if self.0 == 0 {
            return 0;
        }
        let e = u64::from((self.0 & 0xFC00) >> 10);
        let m = u64::from(self.0 & 0x03FF) + 0x0400;
        if e < 10 {
            m >> (10 - e)
        } else {
            m << (e - 10)
        }
    }
}

#[cfg(test)]
mod test {
    use quickcheck::quickcheck;

    use super::*;

    #[test]
    fn zero() {
        assert_eq!(CompactUInt::compact(0).value(), 0);
        assert_eq!(CompactUInt::compact(0).uncompact(), 0);
    }

    #[test]
    fn exact_values() {
        for amount in [1u64, 2, 3, 1024, 2047, 2048, 4096, 3 * 100_000_000] {
            let c = CompactUInt::compact(amount);
            if amount <= 2047 {
                assert_eq!(c.uncompact(), amount);
            } else {
                assert!(c.uncompact() <= amount);
            }
        }
        // exactly representable: 11 significant bits
        let exact = 0b111_1111_1111u64 << 20;
        assert_eq!(CompactUInt::compact(exact).uncompact(), exact);
    }

    quickcheck! {
        fn uncompact_never_exceeds(amount: u64) -> bool {
            CompactUInt::compact(amount).uncompact() <= amount
        }

        fn compact_is_monotone(a: u64, b: u64) -> bool {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            CompactUInt::compact(lo) <= CompactUInt::compact(hi)
        }
    }
}
