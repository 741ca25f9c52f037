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

//! Work as handed over by the work source (stratum client, job queue...)

/// One block header template to be hashed by the chain
///
/// Hashes are kept in the byte order the chips expect, the driver copies them to the wire
/// untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkUnit {
    pub prev_block_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub version: u32,
    pub ntime: u32,
    /// Compact network target
    pub nbits: u32,
    pub starting_nonce: u32,
}

impl WorkUnit {
    pub fn new(
        prev_block_hash: [u8; 32],
        merkle_root: [u8; 32],
        version: u32,
        ntime: u32,
        nbits: u32,
        starting_nonce: u32,
    ) -> Self {
        Self {
            prev_block_hash,
            merkle_root,
            version,
            ntime,
            nbits,
            starting_nonce,
        }
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    /// Build work that differs from other prepared work only in `ntime`
    pub fn prepare(i: u32) -> WorkUnit {
        WorkUnit::new([0x11; 32], [0x22; 32], 0x2000_0000, i, 0x1701_fa38, 0)
    }
}
