// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Framing of everything the host sends to the chain.
//!
//! Frame layout: `55 AA <header> <length> <payload...> <checksum>`. Command frames are closed
//! by one CRC5 byte, job frames by a big-endian CRC16. The length field counts header, length,
//! payload and checksum, i.e. everything but the preamble.

use crate::crc;
use crate::error::{self, ErrorKind};

use packed_struct::prelude::*;

use std::fmt;

/// Preamble of frames sent from host to chips
pub const PREAMBLE: [u8; 2] = [0x55, 0xaa];

/// Preamble + header + length
const PROLOGUE_SIZE: usize = 4;

/// Kind of packet as encoded in the header
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq)]
pub enum PacketType {
    /// Mining job, protected by CRC16
    Job = 0x01,
    /// Control command, protected by CRC5
    Command = 0x02,
}

impl PacketType {
    /// Size of the trailing checksum
    pub fn checksum_size(&self) -> usize {
        match self {
            PacketType::Job => 2,
            PacketType::Command => 1,
        }
    }
}

/// Whether the frame targets one chip (address in payload) or the whole chain
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq)]
pub enum Group {
    Single = 0,
    All = 1,
}

/// Header byte of a frame
#[derive(PackedStruct, Clone, Copy, Debug, PartialEq)]
#[packed_struct(size_bytes = "1", bit_numbering = "msb0")]
pub struct Header {
    #[packed_field(bits = "0..=2", ty = "enum")]
    packet_type: PacketType,
    #[packed_field(bits = "3", ty = "enum")]
    group: Group,
    #[packed_field(bits = "4..=7")]
    code: Integer<u8, packed_bits::Bits::<4>>,
}

impl Header {
    pub fn new(packet_type: PacketType, group: Group, code: u8) -> Self {
        Self {
            code: code.into(),
            group,
            packet_type,
        }
    }

    /// Helper builder for control commands
    pub fn command(group: Group, code: u8) -> Self {
        Self::new(PacketType::Command, group, code)
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn group(&self) -> Group {
        self.group
    }

    pub fn code(&self) -> u8 {
        *self.code
    }

    /// Header serialized into its wire byte
    pub fn to_byte(&self) -> u8 {
        // all fields are range-checked by their types, packing cannot fail
        self.pack().expect("BUG: header packing failed")[0]
    }

    pub fn from_byte(byte: u8) -> error::Result<Self> {
        Self::unpack(&[byte]).map_err(|_| {
            ErrorKind::Frame(format!("unknown packet type in header {:#04x}", byte)).into()
        })
    }
}

/// Checksummed frame ready to be handed over to the transport
#[derive(Clone, PartialEq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Build a frame around `payload`, the payload is copied verbatim
    pub fn encode(header: Header, payload: &[u8]) -> error::Result<Self> {
        let checksum_size = header.packet_type.checksum_size();
        let total_length = PROLOGUE_SIZE + payload.len() + checksum_size;
        // the length field doesn't account for the preamble
        let length = total_length - PREAMBLE.len();
        if length > u8::max_value() as usize {
            Err(ErrorKind::Frame(format!(
                "payload of {} bytes doesn't fit into one frame",
                payload.len()
            )))?
        }

        let mut bytes = Vec::with_capacity(total_length);
        bytes.extend_from_slice(&PREAMBLE);
        bytes.push(header.to_byte());
        bytes.push(length as u8);
        bytes.extend_from_slice(payload);

        match header.packet_type {
            PacketType::Job => {
                let crc = crc::crc16_false(&bytes[PREAMBLE.len()..]);
                bytes.extend_from_slice(&crc.to_be_bytes());
            }
            PacketType::Command => {
                let crc = crc::crc5(&bytes[PREAMBLE.len()..]);
                bytes.push(crc);
            }
        }
        Ok(Self { bytes })
    }

    /// Validate raw bytes and wrap them into a frame
    ///
    /// Preamble, length field and checksum all have to match.
    pub fn decode(bytes: &[u8]) -> error::Result<Self> {
        if bytes.len() < PROLOGUE_SIZE + 1 {
            Err(ErrorKind::Frame(format!(
                "frame of {} bytes is too short",
                bytes.len()
            )))?
        }
        if bytes[..PREAMBLE.len()] != PREAMBLE {
            Err(ErrorKind::Frame(format!(
                "bad preamble {}",
                hex::encode(&bytes[..PREAMBLE.len()])
            )))?
        }
        let header = Header::from_byte(bytes[2])?;
        let checksum_size = header.packet_type.checksum_size();
        if bytes.len() < PROLOGUE_SIZE + checksum_size
            || bytes[3] as usize != bytes.len() - PREAMBLE.len()
        {
            Err(ErrorKind::Frame(format!(
                "length field {} doesn't match frame size {}",
                bytes[3],
                bytes.len()
            )))?
        }

        let checksum_offset = bytes.len() - checksum_size;
        let covered = &bytes[PREAMBLE.len()..checksum_offset];
        let valid = match header.packet_type {
            PacketType::Job => {
                let expected = u16::from_be_bytes([bytes[checksum_offset], bytes[checksum_offset + 1]]);
                crc::crc16_false(covered) == expected
            }
            PacketType::Command => crc::crc5(covered) == bytes[checksum_offset],
        };
        if !valid {
            Err(ErrorKind::Frame("checksum mismatch".to_string()))?
        }

        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub fn header(&self) -> Header {
        Header::from_byte(self.bytes[2]).expect("BUG: frame holds invalid header")
    }

    pub fn payload(&self) -> &[u8] {
        let checksum_size = self.header().packet_type.checksum_size();
        &self.bytes[PROLOGUE_SIZE..self.bytes.len() - checksum_size]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Frame({})", hex::encode(&self.bytes))
    }
}
