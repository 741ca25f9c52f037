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

//! BM1370 chip model: addressing, registers, PLL, job and result layouts.

use crate::error::{self, ErrorKind};
use crate::frame::{Group, Header, PacketType};
use crate::work::WorkUnit;

use byteorder::{ByteOrder, LittleEndian};
use packed_struct::prelude::*;

use std::fmt::Debug;

/// Chip identification as reported in register 0x00
pub const CHIP_ID: u16 = 0x1370;
/// Size of the reply to chip identification read
pub const CHIP_ID_RESPONSE_LENGTH: usize = 11;
/// Preamble of all frames sent by chips
pub const RESPONSE_PREAMBLE: [u8; 2] = [0xaa, 0x55];

/// How many (big) cores are on the chip
pub const NUM_CORES_ON_CHIP: usize = 80;
/// How many small cores each core has
pub const NUM_SMALL_CORES: usize = 16;

/// Chips can't have more distinct addresses than what fits into one byte
pub const MAX_CHIPS_ON_CHAIN: usize = 256;

/// Frequency of the oscillator feeding chip PLLs
pub const CHIP_OSC_CLK_MHZ: f32 = 25.0;
/// Clock the chips run at right after reset
pub const INITIAL_FREQUENCY_MHZ: f32 = 56.25;

/// Default mask of version bits the pool lets us roll (BIP320)
pub const DEFAULT_VERSION_MASK: u32 = 0x1fff_e000;
/// Chips report rolled version bits shifted by this amount
pub const VERSION_SHIFT: u32 = 13;

/// Command codes of control frames
pub const CMD_SET_ADDRESS: u8 = 0x00;
pub const CMD_WRITE: u8 = 0x01;
pub const CMD_READ: u8 = 0x02;
pub const CMD_INACTIVE: u8 = 0x03;
/// Command code of job frames
pub const CMD_JOB: u8 = 0x01;

/// Register map (only registers the driver touches)
pub const CHIP_ID_REG: u8 = 0x00;
pub const PLL0_PARAMETER_REG: u8 = 0x08;
pub const HASH_COUNTING_REG: u8 = 0x10;
pub const TICKET_MASK_REG: u8 = 0x14;
pub const MISC_CONTROL_REG: u8 = 0x18;
pub const FAST_UART_CONFIGURATION_REG: u8 = 0x28;
pub const CORE_REGISTER_CONTROL_REG: u8 = 0x3c;
pub const ANALOG_MUX_CONTROL_REG: u8 = 0x54;
pub const IO_DRIVER_STRENGTH_REG: u8 = 0x58;
pub const VERSION_MASK_REG: u8 = 0xa4;
pub const REG_A8: u8 = 0xa8;
pub const REG_B9: u8 = 0xb9;

/// Chip address as it goes to the wire
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChipAddress {
    All,
    One(u8),
}

impl ChipAddress {
    /// Return if address is a broadcast
    pub fn is_broadcast(&self) -> bool {
        match self {
            ChipAddress::All => true,
            ChipAddress::One(_) => false,
        }
    }

    /// Return hardware chip address or 0 if it's a broadcast
    pub fn to_hw_addr(&self) -> u8 {
        match self {
            ChipAddress::All => 0,
            ChipAddress::One(x) => *x,
        }
    }

    pub fn group(&self) -> Group {
        if self.is_broadcast() {
            Group::All
        } else {
            Group::Single
        }
    }
}

/// Split the address space evenly among `chip_count` chips.
///
/// Chip `i` (in discovery order) gets address `i * (256 / chip_count)`.
pub fn chip_addresses(chip_count: usize) -> error::Result<Vec<u8>> {
    if chip_count == 0 || chip_count > MAX_CHIPS_ON_CHAIN {
        Err(ErrorKind::Hashchip(format!(
            "cannot assign addresses to {} chips (allowed 1..={})",
            chip_count, MAX_CHIPS_ON_CHAIN
        )))?
    }
    let interval = MAX_CHIPS_ON_CHAIN / chip_count;
    Ok((0..chip_count).map(|i| (i * interval) as u8).collect())
}

/// Payload of a register write: address, register, big-endian value
#[derive(PackedStruct, Debug, PartialEq)]
#[packed_struct(endian = "msb", size_bytes = "6")]
pub struct SetConfigPayload {
    pub chip_address: u8,
    pub register: u8,
    pub value: u32,
}

impl SetConfigPayload {
    pub fn new(chip_address: ChipAddress, register: u8, value: u32) -> Self {
        Self {
            chip_address: chip_address.to_hw_addr(),
            register,
            value,
        }
    }

    pub fn header(&self, chip_address: ChipAddress) -> Header {
        Header::command(chip_address.group(), CMD_WRITE)
    }
}

/// `Register` trait represents register on chip. Register:
///
/// * supports being serialized to register format (`to_reg`)
/// * register is identified by address on chip (`REG_NUM`)
/// * is 4 bytes long (one "word")
pub trait Register: PackedStruct<ByteArray = [u8; 4]> + Send + Sync + Debug {
    const REG_NUM: u8;

    /// Take register and unpack (as big endian)
    fn from_reg(reg: u32) -> Self {
        Self::unpack(&reg.to_be_bytes()).expect("unpacking error")
    }

    /// Pack into big-endian register
    fn to_reg(&self) -> u32 {
        u32::from_be_bytes(self.pack().expect("packing error"))
    }
}

/// Chip identification register, replies to a broadcast read of register 0x00
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(endian = "msb", size_bytes = "4")]
pub struct ChipIdReg {
    pub chip_id: u16,
    pub core_num: u8,
    pub addr: u8,
}

impl Register for ChipIdReg {
    const REG_NUM: u8 = CHIP_ID_REG;
}

/// Extract chip id from one identification record sent in reply to a `ChipIdReg` read
///
/// The record starts with the response preamble followed by the big-endian chip id. Returns
/// `None` for records that are too short or don't start with the preamble.
pub fn parse_chip_id(record: &[u8]) -> Option<u16> {
    const REG_OFFSET: usize = RESPONSE_PREAMBLE.len();
    const REG_END: usize = REG_OFFSET + 4;

    if record.len() < REG_END || record[..REG_OFFSET] != RESPONSE_PREAMBLE {
        return None;
    }
    let chip_id = ChipIdReg::unpack_from_slice(&record[REG_OFFSET..REG_END]).ok()?;
    Some(chip_id.chip_id)
}

/// This register represents ASIC difficulty
///
/// The chip will provide only solutions that are <= target based on this difficulty.
/// Difficulty is rounded down to a power of two and every byte of `difficulty - 1` is
/// stored bit-reversed.
#[derive(PackedStruct, Debug, PartialEq)]
#[packed_struct(size_bytes = "4", endian = "msb")]
pub struct TicketMaskReg {
    mask: u32,
}

impl TicketMaskReg {
    /// Builds ticket mask register instance and verifies the specified difficulty is correct
    pub fn new(diff: u32) -> error::Result<Self> {
        if diff == 0 {
            Err(ErrorKind::General(
                "Asic difficulty must be at least 1!".to_string(),
            ))?
        }
        let largest_power_of_two = 1u32 << (31 - diff.leading_zeros());
        let mask = largest_power_of_two - 1;
        let mut bytes = mask.to_be_bytes();
        for byte in bytes.iter_mut() {
            *byte = byte.reverse_bits();
        }
        Ok(Self {
            mask: u32::from_be_bytes(bytes),
        })
    }
}

impl Register for TicketMaskReg {
    const REG_NUM: u8 = TICKET_MASK_REG;
}

/// Tells chips which version bits they may roll (AsicBoost)
#[derive(PackedStruct, Debug, PartialEq)]
#[packed_struct(size_bytes = "4", endian = "msb")]
pub struct VersionMaskReg {
    control: u16,
    rolled_bits: u16,
}

impl VersionMaskReg {
    const ENABLE_VERSION_ROLLING: u16 = 0x9000;

    pub fn new(version_mask: u32) -> Self {
        Self {
            control: Self::ENABLE_VERSION_ROLLING,
            rolled_bits: (version_mask >> VERSION_SHIFT) as u16,
        }
    }
}

impl Register for VersionMaskReg {
    const REG_NUM: u8 = VERSION_MASK_REG;
}

/// Structure representing settings of chip PLL divider
/// It can serialize itself right to register settings
#[derive(PackedStruct, Debug, PartialEq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "4", endian = "msb")]
pub struct PllReg {
    #[packed_field(bits = "1")]
    enabled: bool,
    /// Has to be set when VCO runs at or above `PllSolution::VCO_HIGH_MHZ`
    #[packed_field(bits = "3")]
    vco_high: bool,
    #[packed_field(bits = "8..=15")]
    fbdiv: u8,
    #[packed_field(bits = "16..=23")]
    refdiv: u8,
    /// Post divider 1 minus one
    #[packed_field(bits = "24..=27")]
    postdiv1: Integer<u8, packed_bits::Bits::<4>>,
    /// Post divider 2 minus one
    #[packed_field(bits = "28..=31")]
    postdiv2: Integer<u8, packed_bits::Bits::<4>>,
}

impl Register for PllReg {
    const REG_NUM: u8 = PLL0_PARAMETER_REG;
}

/// Settings of chip PLL divider approximating some target frequency
#[derive(Debug, Clone, PartialEq)]
pub struct PllSolution {
    /// Range: `FBDIV_MIN..=FBDIV_MAX`
    pub fbdiv: u8,
    /// 1 or 2
    pub refdiv: u8,
    /// Range: 1..=7
    pub postdiv1: u8,
    /// Range: 1..=7, also must hold: postdiv2 <= postdiv1
    pub postdiv2: u8,
    /// Frequency (MHz) the chips will actually run at
    pub frequency: f32,
}

impl PllSolution {
    pub const FBDIV_MIN: u8 = 0xa0;
    pub const FBDIV_MAX: u8 = 0xef;
    /// Solutions further than this from the target are not accepted
    pub const MAX_FREQ_ERROR_MHZ: f32 = 1.0;
    /// VCO at or above this frequency needs the high range bit
    pub const VCO_HIGH_MHZ: f32 = 2400.0;

    /// Simulate divider/PLL and calculate output frequency
    fn calc(fbdiv: u8, refdiv: u8, postdiv1: u8, postdiv2: u8) -> f32 {
        CHIP_OSC_CLK_MHZ * fbdiv as f32 / (refdiv as f32 * postdiv1 as f32 * postdiv2 as f32)
    }

    /// Find divider settings to approximate `target_freq` (MHz)
    ///
    /// Reference divider 2 is preferred over 1, then the highest post dividers. Of all
    /// combinations within `MAX_FREQ_ERROR_MHZ` the closest one wins, the first one found
    /// wins a tie.
    pub fn find(target_freq: f32) -> error::Result<Self> {
        let mut best: Option<(Self, f32)> = None;

        for refdiv in (1..=2u8).rev() {
            for postdiv1 in (1..=7u8).rev() {
                for postdiv2 in (1..=postdiv1).rev() {
                    let product = postdiv1 as f32 * postdiv2 as f32 * target_freq * refdiv as f32;
                    let fbdiv = (product as f64 / CHIP_OSC_CLK_MHZ as f64).round();
                    if !(fbdiv >= Self::FBDIV_MIN as f64 && fbdiv <= Self::FBDIV_MAX as f64) {
                        continue;
                    }
                    let fbdiv = fbdiv as u8;
                    let frequency = Self::calc(fbdiv, refdiv, postdiv1, postdiv2);
                    let error = (target_freq - frequency).abs();
                    if error >= Self::MAX_FREQ_ERROR_MHZ {
                        continue;
                    }
                    if best.as_ref().map_or(true, |(_, best_error)| error < *best_error) {
                        best = Some((
                            Self {
                                fbdiv,
                                refdiv,
                                postdiv1,
                                postdiv2,
                                frequency,
                            },
                            error,
                        ));
                    }
                }
            }
        }

        match best {
            Some((pll, _)) => Ok(pll),
            None => Err(ErrorKind::PLL(format!(
                "no divider settings for target frequency {:.2} MHz",
                target_freq
            ))
            .into()),
        }
    }

    /// Frequency of the voltage controlled oscillator before post dividers
    pub fn vco_frequency(&self) -> f32 {
        self.fbdiv as f32 * CHIP_OSC_CLK_MHZ / self.refdiv as f32
    }

    pub fn to_reg(&self) -> PllReg {
        PllReg {
            enabled: true,
            vco_high: self.vco_frequency() >= Self::VCO_HIGH_MHZ,
            fbdiv: self.fbdiv,
            refdiv: self.refdiv,
            postdiv1: (self.postdiv1 - 1).into(),
            postdiv2: (self.postdiv2 - 1).into(),
        }
    }
}

/// Size of job payload (without framing)
pub const JOB_PAYLOAD_SIZE: usize = 82;

/// Serialize `work` into the job payload the chip expects
///
/// Layout: job id, midstate count, starting nonce, nbits, ntime, merkle root, previous block
/// hash and version. Integers go out in little-endian (header) byte order, hashes are copied
/// as provided by the work source.
pub fn job_payload(job_id: u8, work: &WorkUnit) -> [u8; JOB_PAYLOAD_SIZE] {
    let mut payload = [0u8; JOB_PAYLOAD_SIZE];
    payload[0] = job_id;
    payload[1] = 0x01;
    LittleEndian::write_u32(&mut payload[2..6], work.starting_nonce);
    LittleEndian::write_u32(&mut payload[6..10], work.nbits);
    LittleEndian::write_u32(&mut payload[10..14], work.ntime);
    payload[14..46].copy_from_slice(&work.merkle_root);
    payload[46..78].copy_from_slice(&work.prev_block_hash);
    LittleEndian::write_u32(&mut payload[78..82], work.version);
    payload
}

/// Header of job frames
pub fn job_header() -> Header {
    Header::new(PacketType::Job, Group::Single, CMD_JOB)
}

/// Result record sent by a chip that found a nonce
#[derive(PackedStruct, Debug, Clone, PartialEq)]
#[packed_struct(endian = "msb", size_bytes = "11")]
pub struct AsicResult {
    pub preamble: u16,
    /// Nonce in network order
    pub nonce: u32,
    pub midstate_num: u8,
    /// Upper nibble carries job id, lower nibble the small core
    pub reply_id: u8,
    /// Rolled version bits shifted right by `VERSION_SHIFT`
    pub version: u16,
    pub crc: u8,
}

impl AsicResult {
    pub const SIZE: usize = 11;

    pub fn job_id(&self) -> u8 {
        (self.reply_id & 0xf0) >> 1
    }

    /// 7 bits for 80 cores
    pub fn core_id(&self) -> u8 {
        ((self.nonce >> 25) & 0x7f) as u8
    }

    /// 4 bits for 16 small cores
    pub fn small_core_id(&self) -> u8 {
        self.reply_id & 0x0f
    }

    pub fn version_bits(&self) -> u32 {
        (self.version as u32) << VERSION_SHIFT
    }
}

/// Fixed register values determined empirically for the S21 Pro
pub mod init_values {
    pub const REG_A8: u32 = 0x0007_0000;
    pub const REG_A8_PER_CHIP: u32 = 0x0007_01f0;
    pub const MISC_CONTROL: u32 = 0xf000_c100;
    pub const CORE_REGISTER_CONTROL: [u32; 2] = [0x8000_8b00, 0x8000_800c];
    pub const CORE_REGISTER_CONTROL_PER_CHIP: [u32; 3] = [0x8000_8b00, 0x8000_800c, 0x8000_82aa];
    pub const IO_DRIVER_STRENGTH: u32 = 0x0001_1111;
    pub const REG_B9: u32 = 0x0000_4480;
    pub const ANALOG_MUX_CONTROL: u32 = 0x0000_0002;
    pub const CORE_REGISTER_CONTROL_FINAL: u32 = 0x8000_8dee;
    pub const HASH_COUNTING: u32 = 0x0000_1eb5;
    /// Misc control with baud divisor 26 (115 749 Bd)
    pub const MISC_CONTROL_DEFAULT_BAUD: u32 = 0x0000_7a31;
    /// Fast UART with divisor 0 (1 MBd)
    pub const FAST_UART_MAX_BAUD: u32 = 0x1130_0200;
}

pub const DEFAULT_BAUD_RATE: usize = 115_749;
pub const MAX_BAUD_RATE: usize = 1_000_000;
