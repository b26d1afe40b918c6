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

use std::time::Duration;

use crate::message::{ProtocolError, Reader, Writer};

const MAGIC_LEN: usize = 14;
const MAINNET_INITIATOR: &[u8; MAGIC_LEN] = b"WARTHOG GRUNT?";
const MAINNET_RESPONDER: &[u8; MAGIC_LEN] = b"WARTHOG GRUNT!";
const TESTNET_INITIATOR: &[u8; MAGIC_LEN] = b"TESTNET GRUNT?";
const TESTNET_RESPONDER: &[u8; MAGIC_LEN] = b"TESTNET GRUNT!";

/// Unfinished handshakes are closed after this long.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// First bytes on every connection: a 14-byte magic (question mark for the initiator,
/// exclamation for the responder), the 4-byte protocol version, and on outbound connections two
/// bytes advertising the listen port. The initiator acknowledges the responder's reply with a
/// single zero byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub initiator: bool,
    pub testnet: bool,
    pub version: u32,
    pub listen_port: Option<u16>,
}

impl Handshake {
    pub const ACK: u8 = 0;

    pub fn encode(&self) -> Vec<u8> {
        let magic = match (self.testnet, self.initiator) {
            (false, true) => MAINNET_INITIATOR,
            (false, false) => MAINNET_RESPONDER,
            (true, true) => TESTNET_INITIATOR,
            (true, false) => TESTNET_RESPONDER,
        };
        let mut w = Writer::with_capacity(MAGIC_LEN + 6);
        w.bytes(magic).u32(self.version);
        if let Some(port) = self.listen_port {
            w.u16(port);
        }
        w.finish().to_vec()
    }

    pub fn decode(bytes: &[u8], expect_initiator: bool) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes);
        let magic: [u8; MAGIC_LEN] = r
            .take(MAGIC_LEN)
            .map_err(|_| ProtocolError::Handshake)?
            .try_into()
            .expect("14 bytes");
        let (initiator, testnet) = match &magic {
            m if m == MAINNET_INITIATOR => (true, false),
            m if m == MAINNET_RESPONDER => (false, false),
            m if m == TESTNET_INITIATOR => (true, true),
            m if m == TESTNET_RESPONDER => (false, true),
            _ => return Err(ProtocolError::Handshake),
        };
        if initiator != expect_initiator {
            return Err(ProtocolError::Handshake);
        }
        let version = r.u32().map_err(|_| ProtocolError::Handshake)?;
        let listen_port = match r.remaining() {
            0 => None,
            2 => Some(r.u16().map_err(|_| ProtocolError::Handshake)?),
            _ => return Err(ProtocolError::Handshake),
        };
        Ok(Self {
            initiator,
            testnet,
            version,
            listen_port,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_initiator_with_port() {
        let hs = Handshake {
            initiator: true,
            testnet: false,
            version: 4,
            listen_port: Some(9186),
        };
        let decoded = Handshake::decode(&hs.encode(), true).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn responder_magic_differs() {
        let hs = Handshake {
            initiator: false,
            testnet: false,
            version: 4,
            listen_port: None,
        };
        assert!(Handshake::decode(&hs.encode(), true).is_err());
        assert!(Handshake::decode(&hs.encode(), false).is_ok());
    }

    #[test]
    fn testnet_magic_round_trip() {
        let hs = Handshake {
            initiator: true,
            testnet: true,
            version: 4,
            listen_port: None,
        };
        let decoded = Handshake::decode(&hs.encode(), true).unwrap();
        assert!(decoded.testnet);
    }

    #[test]
    fn garbage_rejected() {
        assert_eq!(
            Handshake::decode(b"WARTHOG OINK??\x00\x00\x00\x04", true).unwrap_err(),
            ProtocolError::Handshake
        );
    }
}
