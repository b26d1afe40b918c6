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

//! The framed binary peer protocol: big-endian integers throughout, a length/checksum frame
//! around every message, and the handshake exchanged before the first frame.

mod frame;
mod handshake;
mod messages;
mod reader;
mod writer;

pub use frame::{decode_frame, encode_frame};
pub use handshake::{Handshake, HANDSHAKE_TIMEOUT};
pub use messages::{
    AppendMsg,
    BatchRepMsg,
    BatchReqMsg,
    BlockRepMsg,
    BlockReqMsg,
    ForkMsg,
    InitMsg,
    LeaderMsg,
    Msg,
    PeerAddrV4,
    PingMsg,
    PongMsg,
    ProbeRepMsg,
    ProbeReqMsg,
    SignedPinRollbackMsg,
    TxidWithFee,
    UnverifiedSnapshot,
};
pub use reader::Reader;
pub use writer::Writer;

use thiserror::Error;

/// Protocol violations and transport conditions that close a connection (or, for
/// [`ProtocolError::Timeout`] on advisory probes, are absorbed by the scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("handshake failed")]
    Handshake,
    #[error("reply does not match any pending request")]
    Unrequested,
    #[error("malformed message")]
    Malformed,
    #[error("header batch exceeds batch size")]
    BatchOversized,
    #[error("message rate limit exceeded")]
    MsgFlood,
    #[error("grid inconsistent with advertised chain")]
    GridMismatch,
    #[error("descriptor did not advance as required")]
    Descriptor,
    #[error("init message grid does not cover chain length")]
    InitGrid,
    #[error("request timed out")]
    Timeout,
    #[error("duplicate connection")]
    DuplicateConnection,
    #[error("connection evicted")]
    Evicted,
    #[error("unknown leader key")]
    BadLeader,
    #[error("unknown message type")]
    UnknownMessageType,
}

impl ProtocolError {
    pub fn code(self) -> u32 {
        use ProtocolError::*;
        match self {
            Handshake => 60,
            Unrequested => 61,
            Malformed => 62,
            BatchOversized => 63,
            MsgFlood => 64,
            GridMismatch => 65,
            Descriptor => 66,
            InitGrid => 67,
            Timeout => 68,
            DuplicateConnection => 69,
            Evicted => 70,
            BadLeader => 71,
            UnknownMessageType => 72,
        }
    }
}
