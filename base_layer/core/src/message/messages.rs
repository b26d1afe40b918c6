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

use bitflags::bitflags;
use warthog_common_types::{CompactUInt, Descriptor, Height, NonzeroHeight, BLOCK_BATCH_SIZE};

use crate::{
    blocks::{BlockBody, BlockHeader},
    chain::{
        batch::{Batch, Grid},
        signed_snapshot::{RecoverableSignature, SnapshotPriority, SIGNATURE_SIZE},
    },
    consensus::MAX_BLOCK_SIZE,
    message::{ProtocolError, Reader, Writer},
};

/// A snapshot as received on the wire; the signing leader's importance is established separately
/// through the snapshot authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnverifiedSnapshot {
    pub height: NonzeroHeight,
    pub hash: crate::blocks::BlockHash,
    pub signature: RecoverableSignature,
}

impl UnverifiedSnapshot {
    fn encode(&self, w: &mut Writer) {
        w.nonzero_height(self.height).hash(&self.hash).bytes(&self.signature.0);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let height = r.nonzero_height()?;
        let hash = r.hash()?;
        let signature: [u8; SIGNATURE_SIZE] = r.take(SIGNATURE_SIZE)?.try_into().expect("65 bytes");
        Ok(Self {
            height,
            hash,
            signature: RecoverableSignature(signature),
        })
    }
}

/// IPv4 endpoint as carried in Pong address lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddrV4 {
    pub ip: [u8; 4],
    pub port: u16,
}

/// Mempool transaction id with its fee, compacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxidWithFee {
    pub txid: [u8; 16],
    pub fee: CompactUInt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitMsg {
    pub descriptor: Descriptor,
    pub priority: SnapshotPriority,
    pub chain_length: Height,
    pub worksum: crate::proof_of_work::Worksum,
    pub grid: Grid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkMsg {
    pub descriptor: Descriptor,
    pub chain_length: NonzeroHeight,
    pub worksum: crate::proof_of_work::Worksum,
    pub fork_height: NonzeroHeight,
    pub grid: Grid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendMsg {
    pub new_length: NonzeroHeight,
    pub worksum: crate::proof_of_work::Worksum,
    pub grid: Grid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignedPinRollbackMsg {
    pub snapshot: UnverifiedSnapshot,
    pub shrink_length: Height,
    pub worksum: crate::proof_of_work::Worksum,
    pub descriptor: Descriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingMsg {
    pub nonce: u32,
    pub priority: SnapshotPriority,
    pub max_addresses: u16,
    pub max_transactions: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PongMsg {
    pub nonce: u32,
    pub addresses: Vec<PeerAddrV4>,
    pub txids: Vec<TxidWithFee>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReqMsg {
    pub nonce: u32,
    pub descriptor: Descriptor,
    pub start_height: NonzeroHeight,
    pub length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRepMsg {
    pub nonce: u32,
    pub batch: Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReqMsg {
    pub nonce: u32,
    pub descriptor: Descriptor,
    pub height: NonzeroHeight,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ProbeFlags: u8 {
        const REQUESTED = 0b01;
        const CURRENT = 0b10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRepMsg {
    pub nonce: u32,
    pub current_descriptor: Descriptor,
    /// Header at the requested height, absent when the peer's chain no longer covers it.
    pub requested: Option<BlockHeader>,
    /// The peer's current tip header.
    pub current: Option<BlockHeader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockReqMsg {
    pub nonce: u32,
    pub descriptor: Descriptor,
    pub lower: NonzeroHeight,
    pub upper: NonzeroHeight,
}

impl BlockReqMsg {
    pub fn count(&self) -> u32 {
        self.upper - self.lower + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRepMsg {
    pub nonce: u32,
    pub blocks: Vec<BlockBody>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderMsg {
    pub snapshot: UnverifiedSnapshot,
}

/// All peer messages, tagged by their wire type code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    Init(InitMsg),
    Fork(ForkMsg),
    Append(AppendMsg),
    SignedPinRollback(SignedPinRollbackMsg),
    Ping(PingMsg),
    Pong(PongMsg),
    BatchReq(BatchReqMsg),
    BatchRep(BatchRepMsg),
    ProbeReq(ProbeReqMsg),
    ProbeRep(ProbeRepMsg),
    BlockReq(BlockReqMsg),
    BlockRep(BlockRepMsg),
    TxSubscribe(Vec<u8>),
    TxNotify(Vec<u8>),
    TxReq(Vec<u8>),
    TxRep(Vec<u8>),
    Leader(LeaderMsg),
}

impl Msg {
    pub fn type_code(&self) -> u8 {
        match self {
            Msg::Init(_) => 0,
            Msg::Fork(_) => 1,
            Msg::Append(_) => 2,
            Msg::SignedPinRollback(_) => 3,
            Msg::Ping(_) => 4,
            Msg::Pong(_) => 5,
            Msg::BatchReq(_) => 6,
            Msg::BatchRep(_) => 7,
            Msg::ProbeReq(_) => 8,
            Msg::ProbeRep(_) => 9,
            Msg::BlockReq(_) => 10,
            Msg::BlockRep(_) => 11,
            Msg::TxSubscribe(_) => 12,
            Msg::TxNotify(_) => 13,
            Msg::TxReq(_) => 14,
            Msg::TxRep(_) => 15,
            Msg::Leader(_) => 16,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Msg::Init(_) => "Init",
            Msg::Fork(_) => "Fork",
            Msg::Append(_) => "Append",
            Msg::SignedPinRollback(_) => "SignedPinRollback",
            Msg::Ping(_) => "Ping",
            Msg::Pong(_) => "Pong",
            Msg::BatchReq(_) => "BatchReq",
            Msg::BatchRep(_) => "BatchRep",
            Msg::ProbeReq(_) => "ProbeReq",
            Msg::ProbeRep(_) => "ProbeRep",
            Msg::BlockReq(_) => "BlockReq",
            Msg::BlockRep(_) => "BlockRep",
            Msg::TxSubscribe(_) => "TxSubscribe",
            Msg::TxNotify(_) => "TxNotify",
            Msg::TxReq(_) => "TxReq",
            Msg::TxRep(_) => "TxRep",
            Msg::Leader(_) => "Leader",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Msg::Init(m) => {
                let grid = m.grid.to_bytes();
                w.descriptor(m.descriptor)
                    .u16(m.priority.importance)
                    .height(m.priority.height)
                    .height(m.chain_length)
                    .worksum(&m.worksum)
                    .u32(grid.len() as u32)
                    .bytes(&grid);
            },
            Msg::Fork(m) => {
                w.descriptor(m.descriptor)
                    .nonzero_height(m.chain_length)
                    .worksum(&m.worksum)
                    .nonzero_height(m.fork_height)
                    .bytes(&m.grid.to_bytes());
            },
            Msg::Append(m) => {
                w.nonzero_height(m.new_length)
                    .worksum(&m.worksum)
                    .bytes(&m.grid.to_bytes());
            },
            Msg::SignedPinRollback(m) => {
                m.snapshot.encode(&mut w);
                w.height(m.shrink_length).worksum(&m.worksum).descriptor(m.descriptor);
            },
            Msg::Ping(m) => {
                w.u32(m.nonce)
                    .u16(m.priority.importance)
                    .height(m.priority.height)
                    .u16(m.max_addresses)
                    .u16(m.max_transactions);
            },
            Msg::Pong(m) => {
                w.u32(m.nonce).u16(m.addresses.len() as u16);
                for a in &m.addresses {
                    w.bytes(&a.ip).u16(a.port);
                }
                w.u16(m.txids.len() as u16);
                for t in &m.txids {
                    w.bytes(&t.txid).u16(t.fee.value());
                }
            },
            Msg::BatchReq(m) => {
                w.u32(m.nonce)
                    .descriptor(m.descriptor)
                    .nonzero_height(m.start_height)
                    .u16(m.length);
            },
            Msg::BatchRep(m) => {
                w.u32(m.nonce).bytes(&m.batch.to_bytes());
            },
            Msg::ProbeReq(m) => {
                w.u32(m.nonce).descriptor(m.descriptor).nonzero_height(m.height);
            },
            Msg::ProbeRep(m) => {
                let mut flags = ProbeFlags::empty();
                flags.set(ProbeFlags::REQUESTED, m.requested.is_some());
                flags.set(ProbeFlags::CURRENT, m.current.is_some());
                w.u32(m.nonce).descriptor(m.current_descriptor).u8(flags.bits());
                if let Some(h) = &m.requested {
                    w.header(h);
                }
                if let Some(h) = &m.current {
                    w.header(h);
                }
            },
            Msg::BlockReq(m) => {
                w.u32(m.nonce)
                    .descriptor(m.descriptor)
                    .nonzero_height(m.lower)
                    .nonzero_height(m.upper);
            },
            Msg::BlockRep(m) => {
                w.u32(m.nonce);
                for b in &m.blocks {
                    w.u32(b.len() as u32).bytes(b.bytes());
                }
            },
            Msg::TxSubscribe(raw) | Msg::TxNotify(raw) | Msg::TxReq(raw) | Msg::TxRep(raw) => {
                w.bytes(raw);
            },
            Msg::Leader(m) => {
                m.snapshot.encode(&mut w);
            },
        }
        w.finish().to_vec()
    }

    pub fn decode_payload(type_code: u8, payload: &[u8]) -> Result<Msg, ProtocolError> {
        let mut r = Reader::new(payload);
        let msg = match type_code {
            0 => {
                let descriptor = r.descriptor()?;
                let priority = SnapshotPriority {
                    importance: r.u16()?,
                    height: r.height()?,
                };
                let chain_length = r.height()?;
                let worksum = r.worksum()?;
                let grid_len = r.u32()? as usize;
                let grid = Grid::parse(r.take(grid_len)?)?;
                Msg::Init(InitMsg {
                    descriptor,
                    priority,
                    chain_length,
                    worksum,
                    grid,
                })
            },
            1 => Msg::Fork(ForkMsg {
                descriptor: r.descriptor()?,
                chain_length: r.nonzero_height()?,
                worksum: r.worksum()?,
                fork_height: r.nonzero_height()?,
                grid: Grid::parse(r.take_rest())?,
            }),
            2 => Msg::Append(AppendMsg {
                new_length: r.nonzero_height()?,
                worksum: r.worksum()?,
                grid: Grid::parse(r.take_rest())?,
            }),
            3 => Msg::SignedPinRollback(SignedPinRollbackMsg {
                snapshot: UnverifiedSnapshot::decode(&mut r)?,
                shrink_length: r.height()?,
                worksum: r.worksum()?,
                descriptor: r.descriptor()?,
            }),
            4 => Msg::Ping(PingMsg {
                nonce: r.u32()?,
                priority: SnapshotPriority {
                    importance: r.u16()?,
                    height: r.height()?,
                },
                max_addresses: r.u16()?,
                max_transactions: r.u16()?,
            }),
            5 => {
                let nonce = r.u32()?;
                let n_addresses = r.u16()? as usize;
                let mut addresses = Vec::with_capacity(n_addresses.min(1024));
                for _ in 0..n_addresses {
                    let ip: [u8; 4] = r.take(4)?.try_into().expect("4 bytes");
                    addresses.push(PeerAddrV4 { ip, port: r.u16()? });
                }
                let n_txids = r.u16()? as usize;
                let mut txids = Vec::with_capacity(n_txids.min(1024));
                for _ in 0..n_txids {
                    let txid: [u8; 16] = r.take(16)?.try_into().expect("16 bytes");
                    txids.push(TxidWithFee {
                        txid,
                        fee: CompactUInt::from_value(r.u16()?),
                    });
                }
                Msg::Pong(PongMsg {
                    nonce,
                    addresses,
                    txids,
                })
            },
            6 => Msg::BatchReq(BatchReqMsg {
                nonce: r.u32()?,
                descriptor: r.descriptor()?,
                start_height: r.nonzero_height()?,
                length: r.u16()?,
            }),
            7 => Msg::BatchRep(BatchRepMsg {
                nonce: r.u32()?,
                batch: Batch::parse(r.take_rest())?,
            }),
            8 => Msg::ProbeReq(ProbeReqMsg {
                nonce: r.u32()?,
                descriptor: r.descriptor()?,
                height: r.nonzero_height()?,
            }),
            9 => {
                let nonce = r.u32()?;
                let current_descriptor = r.descriptor()?;
                let flags = ProbeFlags::from_bits(r.u8()?).ok_or(ProtocolError::Malformed)?;
                let requested = if flags.contains(ProbeFlags::REQUESTED) {
                    Some(r.header()?)
                } else {
                    None
                };
                let current = if flags.contains(ProbeFlags::CURRENT) {
                    Some(r.header()?)
                } else {
                    None
                };
                Msg::ProbeRep(ProbeRepMsg {
                    nonce,
                    current_descriptor,
                    requested,
                    current,
                })
            },
            10 => {
                let msg = BlockReqMsg {
                    nonce: r.u32()?,
                    descriptor: r.descriptor()?,
                    lower: r.nonzero_height()?,
                    upper: r.nonzero_height()?,
                };
                if msg.upper < msg.lower || msg.count() > BLOCK_BATCH_SIZE {
                    return Err(ProtocolError::Malformed);
                }
                Msg::BlockReq(msg)
            },
            11 => {
                let nonce = r.u32()?;
                let mut blocks = Vec::new();
                while !r.is_exhausted() {
                    let len = r.u32()? as usize;
                    if len > MAX_BLOCK_SIZE {
                        return Err(ProtocolError::Malformed);
                    }
                    blocks.push(BlockBody::new(r.take(len)?.to_vec()));
                }
                Msg::BlockRep(BlockRepMsg { nonce, blocks })
            },
            12 => Msg::TxSubscribe(r.take_rest().to_vec()),
            13 => Msg::TxNotify(r.take_rest().to_vec()),
            14 => Msg::TxReq(r.take_rest().to_vec()),
            15 => Msg::TxRep(r.take_rest().to_vec()),
            16 => Msg::Leader(LeaderMsg {
                snapshot: UnverifiedSnapshot::decode(&mut r)?,
            }),
            _ => return Err(ProtocolError::UnknownMessageType),
        };
        if !r.is_exhausted() {
            return Err(ProtocolError::Malformed);
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{proof_of_work::Worksum, test_utils::chain_of};

    fn round_trip(msg: Msg) {
        let payload = msg.encode_payload();
        let decoded = Msg::decode_payload(msg.type_code(), &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn init_round_trip() {
        let entries = chain_of(2, 1_600_000_000);
        round_trip(Msg::Init(InitMsg {
            descriptor: Descriptor::new(3),
            priority: SnapshotPriority {
                importance: 2,
                height: Height::new(64),
            },
            chain_length: Height::new(17281),
            worksum: Worksum::from_u256(123_456_789u64.into()),
            grid: Grid::from_entries(entries),
        }));
    }

    #[test]
    fn probe_rep_round_trip_with_and_without_headers() {
        let headers = chain_of(2, 1_600_000_000);
        round_trip(Msg::ProbeRep(ProbeRepMsg {
            nonce: 1,
            current_descriptor: Descriptor::new(2),
            requested: Some(headers[0]),
            current: Some(headers[1]),
        }));
        round_trip(Msg::ProbeRep(ProbeRepMsg {
            nonce: 1,
            current_descriptor: Descriptor::new(2),
            requested: None,
            current: None,
        }));
    }

    #[test]
    fn block_messages_round_trip() {
        round_trip(Msg::BlockReq(BlockReqMsg {
            nonce: 9,
            descriptor: Descriptor::new(1),
            lower: NonzeroHeight::assert(31),
            upper: NonzeroHeight::assert(60),
        }));
        round_trip(Msg::BlockRep(BlockRepMsg {
            nonce: 9,
            blocks: vec![BlockBody::new(vec![1, 2, 3]), BlockBody::new(vec![])],
        }));
    }

    #[test]
    fn block_req_range_validated() {
        let msg = Msg::BlockReq(BlockReqMsg {
            nonce: 9,
            descriptor: Descriptor::new(1),
            lower: NonzeroHeight::assert(1),
            upper: NonzeroHeight::assert(1 + BLOCK_BATCH_SIZE),
        });
        let payload = msg.encode_payload();
        assert_eq!(
            Msg::decode_payload(10, &payload).unwrap_err(),
            ProtocolError::Malformed
        );
    }

    #[test]
    fn pong_round_trip() {
        round_trip(Msg::Pong(PongMsg {
            nonce: 77,
            addresses: vec![PeerAddrV4 {
                ip: [127, 0, 0, 1],
                port: 9186,
            }],
            txids: vec![TxidWithFee {
                txid: [7u8; 16],
                fee: CompactUInt::compact(1000),
            }],
        }));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let msg = Msg::Ping(PingMsg {
            nonce: 1,
            priority: SnapshotPriority::default(),
            max_addresses: 1,
            max_transactions: 1,
        });
        let mut payload = msg.encode_payload();
        payload.push(0);
        assert_eq!(
            Msg::decode_payload(4, &payload).unwrap_err(),
            ProtocolError::Malformed
        );
    }

    #[test]
    fn unknown_type_rejected() {
        assert_eq!(
            Msg::decode_payload(99, &[]).unwrap_err(),
            ProtocolError::UnknownMessageType
        );
    }
}
