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

//! Checksums protecting frames sent to the chain.
//!
//! Command frames carry CRC-5-USB folded into one byte, job frames carry
//! CRC-16-CCITT-FALSE written big-endian. Both are computed over the frame with
//! preamble stripped off (header, length, payload).

use crc_all::CrcAlgo;

const CRC5_INIT: u8 = 0x1f;

const CRC5: CrcAlgo<u8> = CrcAlgo::<u8>::new(
    0x5,       // polynomial
    5,         // width
    CRC5_INIT, // init
    0,         // xorout
    false,     // reflect
);

const CRC16_INIT: u16 = 0xffff;

const CRC16: CrcAlgo<u16> = CrcAlgo::<u16>::new(
    0x1021,     // polynomial
    16,         // width
    CRC16_INIT, // init
    0,          // xorout
    false,      // reflect
);

/// Calculate 5-bit CRC (USB polynomial, no reflection) over `data`
pub fn crc5(data: &[u8]) -> u8 {
    let mut crc = CRC5_INIT;
    CRC5.update_crc(&mut crc, data);
    CRC5.finish_crc(&crc)
}

/// Calculate 16-bit "false" CRC over `data`
pub fn crc16_false(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    CRC16.update_crc(&mut crc, data);
    CRC16.finish_crc(&crc)
}
