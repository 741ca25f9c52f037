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

//! This module implements API (`Interface`) for sending commands to chips.
//!
//! There's also implementation (`InnerContext`) of that interface that sends commands over
//! the chain transport. All frames sent to the chain (commands and jobs alike) go through one
//! shared `Context` so that they never interleave on the wire.

use crate::logging::macros::*;

use async_trait::async_trait;

use crate::bm1370::{self, ChipAddress, Register, SetConfigPayload};
use crate::error::{self, ErrorKind};
use crate::frame::{Frame, Group, Header};
use crate::io::Transport;

use futures::lock::Mutex;
use packed_struct::PackedStruct;
use std::sync::Arc;

/// Interface definition for command-stack API - writing of registers
///
/// Chips don't acknowledge writes, a successful call only means the command has been handed
/// over to the transport.
#[async_trait]
pub trait Interface: Send + Sync {
    /// Write register(s)
    ///
    /// * `chip_address` can address one or more chips
    async fn write_register<'a, R: Register>(
        &'a self,
        chip_address: ChipAddress,
        value: &'a R,
    ) -> error::Result<()>;

    /// Write raw 32-bit `value` to register `reg`
    async fn write_raw(&self, chip_address: ChipAddress, reg: u8, value: u32)
        -> error::Result<()>;
}

/// `InnerContext` owns the transport and implements on top of it functions to issue
/// commands to chips.
///
/// No locking for sharing is provided.
pub struct InnerContext<T> {
    transport: Arc<T>,
}

impl<T: Transport> InnerContext<T> {
    async fn send_frame(&mut self, frame: &Frame) -> error::Result<()> {
        trace!("TX: {:?}", frame);
        self.transport.send(frame.as_bytes()).await
    }

    async fn send_command(&mut self, header: Header, payload: &[u8]) -> error::Result<()> {
        let frame = Frame::encode(header, payload)?;
        self.send_frame(&frame).await
    }

    async fn write_raw(
        &mut self,
        chip_address: ChipAddress,
        reg: u8,
        value: u32,
    ) -> error::Result<()> {
        let payload = SetConfigPayload::new(chip_address, reg, value);
        self.send_command(payload.header(chip_address), &payload.pack()?)
            .await
    }

    /// Broadcast chip identification read and count chips that answer with `chip_id`
    ///
    /// Records are received until the transport reports silence (or an error). Records
    /// with foreign chip id or without preamble are skipped.
    async fn enumerate(
        &mut self,
        expected_chip_count: usize,
        chip_id: u16,
        response_length: usize,
    ) -> error::Result<usize> {
        self.send_command(
            Header::command(Group::All, bm1370::CMD_READ),
            &[
                ChipAddress::All.to_hw_addr(),
                bm1370::ChipIdReg::REG_NUM,
            ],
        )
        .await?;

        let mut chip_count = 0;
        let mut record = vec![0u8; response_length];
        for _ in 0..=bm1370::MAX_CHIPS_ON_CHAIN {
            if let Err(e) = self.transport.receive(&mut record).await {
                debug!("Chip enumeration finished: {}", e);
                break;
            }
            match bm1370::parse_chip_id(&record) {
                Some(id) if id == chip_id => {
                    chip_count += 1;
                    trace!("Chip {} identified: {}", chip_count, hex::encode(&record));
                }
                Some(id) => warn!("Unexpected chip id {:#06x}, expected {:#06x}", id, chip_id),
                None => warn!("Garbage in chip identification: {}", hex::encode(&record)),
            }
        }

        if chip_count > bm1370::MAX_CHIPS_ON_CHAIN {
            Err(ErrorKind::Hashchip(format!(
                "too many chips on chain ({})",
                chip_count
            )))?
        }
        if chip_count != expected_chip_count {
            warn!(
                "{} chips detected, {} expected",
                chip_count, expected_chip_count
            );
        }
        Ok(chip_count)
    }

    async fn set_chip_address(&mut self, address: u8) -> error::Result<()> {
        self.send_command(
            Header::command(Group::Single, bm1370::CMD_SET_ADDRESS),
            &[address, 0x00],
        )
        .await
    }

    async fn chain_inactive(&mut self) -> error::Result<()> {
        self.send_command(
            Header::command(Group::All, bm1370::CMD_INACTIVE),
            &[0x00, 0x00],
        )
        .await
    }

    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

/// Locking wrapper on InnerContext. Implements Interface.
pub struct Context<T> {
    inner: Arc<Mutex<InnerContext<T>>>,
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl<T: Transport> Interface for Context<T> {
    async fn write_register<'a, R: Register>(
        &'a self,
        chip_address: ChipAddress,
        value: &'a R,
    ) -> error::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_raw(chip_address, R::REG_NUM, value.to_reg()).await
    }

    async fn write_raw(
        &self,
        chip_address: ChipAddress,
        reg: u8,
        value: u32,
    ) -> error::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_raw(chip_address, reg, value).await
    }
}

impl<T: Transport> Context<T> {
    /// Send already encoded frame
    pub async fn send_frame(&self, frame: &Frame) -> error::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.send_frame(frame).await
    }

    /// Find out how many chips with `chip_id` are on the chain
    pub async fn enumerate(
        &self,
        expected_chip_count: usize,
        chip_id: u16,
        response_length: usize,
    ) -> error::Result<usize> {
        let mut inner = self.inner.lock().await;
        inner
            .enumerate(expected_chip_count, chip_id, response_length)
            .await
    }

    /// Tell chips to stop forwarding commands so that they can be addressed one by one
    pub async fn chain_inactive(&self) -> error::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.chain_inactive().await
    }

    /// Assign addresses to `chip_count` chips, spread evenly over the address space
    ///
    /// Each set-address command is taken by the first chip that hasn't been addressed yet,
    /// so the assignment follows the chain order. Returns assigned addresses.
    pub async fn set_chip_addresses(&self, chip_count: usize) -> error::Result<Vec<u8>> {
        let addresses = bm1370::chip_addresses(chip_count)?;
        let mut inner = self.inner.lock().await;
        for address in addresses.iter() {
            trace!("Setting chip address {:#04x}", address);
            inner.set_chip_address(*address).await?;
        }
        Ok(addresses)
    }

    pub fn new(transport: Arc<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(InnerContext::new(transport))),
        }
    }
}
