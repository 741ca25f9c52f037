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

use crate::bm1370;
use crate::crc;
use crate::error::{self, ErrorKind};
use crate::frame::{Frame, Group, Header};
use crate::io::Transport;

use async_trait::async_trait;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// FakeChain is a chain transport backed by in-memory queues
///
/// Every frame sent is recorded. A chip identification read is answered with one
/// identification record per chip. Anything else to be received has to be queued with
/// `push_reply`, an empty queue times out.
pub struct FakeChain {
    /// How many chips answer the identification read
    chip_count: usize,
    /// What chip id do they answer with
    chip_id: u16,
    sent: Mutex<Vec<Vec<u8>>>,
    replies: Mutex<VecDeque<Vec<u8>>>,
    /// If set, every send fails
    send_failure: AtomicBool,
}

impl FakeChain {
    pub fn new(chip_count: usize) -> Self {
        Self {
            chip_count,
            chip_id: bm1370::CHIP_ID,
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            send_failure: AtomicBool::new(false),
        }
    }

    pub fn with_chip_id(mut self, chip_id: u16) -> Self {
        self.chip_id = chip_id;
        self
    }

    pub fn set_send_failure(&self, fail: bool) {
        self.send_failure.store(fail, Ordering::Relaxed);
    }

    /// Queue `reply` to be received
    pub fn push_reply(&self, reply: Vec<u8>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// All frames sent so far
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Sent frames decoded, panics on a malformed one
    pub fn sent_decoded(&self) -> Vec<Frame> {
        self.sent_frames()
            .iter()
            .map(|bytes| Frame::decode(bytes).expect("driver sent malformed frame"))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    fn chip_id_record(&self) -> Vec<u8> {
        let mut record = vec![0u8; bm1370::CHIP_ID_RESPONSE_LENGTH];
        record[..2].copy_from_slice(&bm1370::RESPONSE_PREAMBLE);
        record[2..4].copy_from_slice(&self.chip_id.to_be_bytes());
        let last = record.len() - 1;
        record[last] = crc::crc5(&record[2..last]);
        record
    }
}

#[async_trait]
impl Transport for FakeChain {
    async fn send(&self, data: &[u8]) -> error::Result<()> {
        if self.send_failure.load(Ordering::Relaxed) {
            Err(ErrorKind::Transport("link is down".to_string()))?
        }
        self.sent.lock().unwrap().push(data.to_vec());

        let chip_id_read = Frame::encode(
            Header::command(Group::All, bm1370::CMD_READ),
            &[0x00, bm1370::CHIP_ID_REG],
        )?;
        if data == chip_id_read.as_bytes() {
            let record = self.chip_id_record();
            let mut replies = self.replies.lock().unwrap();
            for _ in 0..self.chip_count {
                replies.push_back(record.clone());
            }
        }
        Ok(())
    }

    async fn receive(&self, buffer: &mut [u8]) -> error::Result<()> {
        let reply = self.replies.lock().unwrap().pop_front();
        let reply = match reply {
            Some(reply) => reply,
            None => Err(ErrorKind::Timeout)?,
        };
        if reply.len() != buffer.len() {
            Err(ErrorKind::Transport(format!(
                "received {} bytes, {} expected",
                reply.len(),
                buffer.len()
            )))?
        }
        buffer.copy_from_slice(&reply);
        Ok(())
    }
}
