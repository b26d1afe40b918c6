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

use std::{
    fmt,
    fmt::{Display, Formatter},
    ops::Deref,
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 32-byte SHA-256 derived digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct FixedHash(#[serde(with = "serde_bytes32")] [u8; 32]);

/// Hash of a block, i.e. the hash of its 80-byte header.
pub type BlockHash = FixedHash;

#[derive(Debug, Error)]
#[error("invalid fixed hash size or encoding")]
pub struct FixedHashSizeError;

impl FixedHash {
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, FixedHashSizeError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| FixedHashSizeError)?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, FixedHashSizeError> {
        let bytes = hex::decode(s).map_err(|_| FixedHashSizeError)?;
        Self::try_from_slice(&bytes)
    }
}

impl From<[u8; 32]> for FixedHash {
    fn from(arr: [u8; 32]) -> Self {
        Self(arr)
    }
}

impl Deref for FixedHash {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for FixedHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for FixedHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for FixedHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "FixedHash({})", self.to_hex())
    }
}

impl FromStr for FixedHash {
    type Err = FixedHashSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

mod serde_bytes32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&hex::encode(bytes))
        } else {
            s.serialize_bytes(bytes)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        use serde::de::Error;
        if d.is_human_readable() {
            let s = String::deserialize(d)?;
            let v = hex::decode(s).map_err(D::Error::custom)?;
            v.try_into().map_err(|_| D::Error::custom("expected 32 bytes"))
        } else {
            let v = Vec::<u8>::deserialize(d)?;
            v.try_into().map_err(|_| D::Error::custom("expected 32 bytes"))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let mut arr = [0u8; 32];
        arr[0] = 0xde;
        arr[31] = 0x01;
        let hash = FixedHash::from(arr);
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(FixedHash::from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn rejects_bad_slice() {
        assert!(FixedHash::try_from_slice(&[0u8; 31]).is_err());
        assert!(FixedHash::try_from_slice(&[0u8; 33]).is_err());
        assert!(FixedHash::try_from_slice(&[0u8; 32]).is_ok());
    }
}
