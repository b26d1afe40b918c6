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

use bytes::{BufMut, BytesMut};
use sha2::{Digest, Sha256};

use crate::message::{Msg, ProtocolError, Reader};

/// Frame layout: length (4, big-endian, covers type byte + payload) · checksum (4, first four
/// bytes of SHA-256 over reserved + type + payload) · reserved (1) · type (1) · payload.
pub fn encode_frame(msg: &Msg) -> BytesMut {
    let payload = msg.encode_payload();
    let mut body = BytesMut::with_capacity(2 + payload.len());
    body.put_u8(0); // reserved
    body.put_u8(msg.type_code());
    body.put_slice(&payload);

    let digest = Sha256::digest(&body);
    let mut out = BytesMut::with_capacity(8 + body.len());
    out.put_u32((1 + payload.len()) as u32);
    out.put_slice(&digest[..4]);
    out.put_slice(&body);
    out
}

/// Decodes one complete frame. The caller is responsible for reassembling the stream into whole
/// frames using the length prefix.
pub fn decode_frame(frame: &[u8]) -> Result<Msg, ProtocolError> {
    let mut r = Reader::new(frame);
    let length = r.u32()? as usize;
    let checksum = r.take(4)?;
    let body = r.take_rest();
    // body = reserved + type + payload; the length field counts type + payload only
    if body.len() != length + 1 {
        return Err(ProtocolError::Malformed);
    }
    let digest = Sha256::digest(body);
    if digest[..4] != *checksum {
        return Err(ProtocolError::Malformed);
    }
    let mut r = Reader::new(body);
    let _reserved = r.u8()?;
    let type_code = r.u8()?;
    Msg::decode_payload(type_code, r.take_rest())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::PingMsg;

    #[test]
    fn frame_round_trip() {
        let msg = Msg::Ping(PingMsg {
            nonce: 7,
            priority: Default::default(),
            max_addresses: 5,
            max_transactions: 100,
        });
        let framed = encode_frame(&msg);
        let decoded = decode_frame(&framed).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let msg = Msg::Ping(PingMsg {
            nonce: 7,
            priority: Default::default(),
            max_addresses: 5,
            max_transactions: 100,
        });
        let mut framed = encode_frame(&msg).to_vec();
        framed[4] ^= 0xFF;
        assert_eq!(decode_frame(&framed).unwrap_err(), ProtocolError::Malformed);
    }

    #[test]
    fn corrupted_payload_rejected() {
        let msg = Msg::Ping(PingMsg {
            nonce: 7,
            priority: Default::default(),
            max_addresses: 5,
            max_transactions: 100,
        });
        let mut framed = encode_frame(&msg).to_vec();
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        assert_eq!(decode_frame(&framed).unwrap_err(), ProtocolError::Malformed);
    }
}
