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

use warthog_common_types::{Descriptor, Height, NonzeroHeight};

use crate::{
    blocks::{BlockHash, BlockHeader, HEADER_SIZE},
    message::ProtocolError,
    proof_of_work::Worksum,
};

/// Big-endian cursor over a received payload. Reading past the end is a malformed message, never
/// a panic.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Malformed);
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn take_rest(&mut self) -> &'a [u8] {
        let out = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        out
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    pub fn height(&mut self) -> Result<Height, ProtocolError> {
        Ok(Height::new(self.u32()?))
    }

    pub fn nonzero_height(&mut self) -> Result<NonzeroHeight, ProtocolError> {
        NonzeroHeight::new(self.u32()?).ok_or(ProtocolError::Malformed)
    }

    pub fn descriptor(&mut self) -> Result<Descriptor, ProtocolError> {
        Ok(Descriptor::new(self.u32()?))
    }

    pub fn hash(&mut self) -> Result<BlockHash, ProtocolError> {
        let bytes = self.take(32)?;
        Ok(BlockHash::try_from_slice(bytes).expect("32 bytes"))
    }

    pub fn worksum(&mut self) -> Result<Worksum, ProtocolError> {
        let bytes: [u8; 32] = self.take(32)?.try_into().expect("32 bytes");
        Ok(Worksum::from_be_bytes(bytes))
    }

    pub fn header(&mut self) -> Result<BlockHeader, ProtocolError> {
        let bytes = self.take(HEADER_SIZE)?;
        Ok(BlockHeader::parse_slice(bytes).expect("80 bytes"))
    }
}
