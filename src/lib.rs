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

//! Control-plane driver for a chain of BM1370 mining chips on one serial link.
//!
//! `HashChain` brings a freshly powered chain up (enumeration, addressing, register setup,
//! difficulty and frequency ramp) and then splits into the send context (`io::WorkTx`) and the
//! receive context (`io::WorkRx`) that run concurrently.

pub mod bm1370;
pub mod command;
pub mod config;
pub mod crc;
pub mod error;
pub mod frame;
pub mod io;
pub mod logging;
pub mod ramp;
pub mod registry;
pub mod work;

#[cfg(test)]
pub mod test_utils;

use crate::bm1370::{
    init_values, ChipAddress, PllSolution, Register, TicketMaskReg, VersionMaskReg,
};
use crate::command::Interface;
use crate::config::ChainConfig;
use crate::error::ErrorKind;
use crate::io::{Transport, WorkRx, WorkTx};
use crate::ramp::{FrequencyStepping, LinearStepping};
use crate::registry::JobRegistry;

use std::sync::Arc;

/// How many times the version mask is sent before enumeration, chips right after reset
/// tend to miss the first write
const VERSION_MASK_INIT_REPEAT: usize = 3;

/// Stages of chain bring-up
#[derive(Debug, Clone, PartialEq)]
pub enum InitState {
    PoweredOn,
    VersionMaskSet,
    /// Number of chips that answered the identification read
    IdentityVerified(usize),
    ChipsAddressed,
    CoreRegistersConfigured,
    DifficultyConfigured,
    ClockRamped,
    Ready,
    Failed(String),
}

/// Hash Chain Controller provides the control plane of one chain of chips.
///
/// Main responsibilities:
/// - initialization of the chips
/// - frequency changes
/// - handing out send/receive contexts for mining
pub struct HashChain<T> {
    config: ChainConfig,
    transport: Arc<T>,
    command_context: command::Context<T>,
    registry: Arc<JobRegistry>,
    stepping: Box<dyn FrequencyStepping>,
    state: InitState,
    /// Number of chips that have been detected
    chip_count: usize,
    /// Addresses assigned to chips in chain order
    chip_addresses: Vec<u8>,
    /// Last frequency (MHz) requested from the chips
    frequency: f32,
}

impl<T: Transport> HashChain<T> {
    pub fn new(transport: Arc<T>, config: ChainConfig) -> Self {
        let stepping = LinearStepping::new(config.ramp_step, config.ramp_delay);
        Self {
            command_context: command::Context::new(transport.clone()),
            transport,
            registry: Arc::new(JobRegistry::new()),
            stepping: Box::new(stepping),
            state: InitState::PoweredOn,
            chip_count: 0,
            chip_addresses: Vec::new(),
            frequency: bm1370::INITIAL_FREQUENCY_MHZ,
            config,
        }
    }

    /// Replace the default linear frequency ramp
    pub fn with_stepping(mut self, stepping: Box<dyn FrequencyStepping>) -> Self {
        self.stepping = stepping;
        self
    }

    pub fn state(&self) -> &InitState {
        &self.state
    }

    pub fn chip_count(&self) -> usize {
        self.chip_count
    }

    pub fn chip_addresses(&self) -> &[u8] {
        &self.chip_addresses
    }

    /// Frequency (MHz) last requested from the chips
    pub fn frequency(&self) -> f32 {
        self.frequency
    }

    fn enter_state(&mut self, state: InitState) {
        debug!("Chain state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    async fn broadcast(&self, reg: u8, value: u32) -> error::Result<()> {
        self.command_context
            .write_raw(ChipAddress::All, reg, value)
            .await
    }

    /// Initializes the complete chain including enumerating all chips
    ///
    /// Chips don't acknowledge any command, the only failure detected is a chain with no
    /// chips answering the identification read.
    /// Returns: number of chips found
    pub async fn init(&mut self) -> error::Result<usize> {
        self.enter_state(InitState::PoweredOn);
        info!(
            "Initializing chain: {} chip(s) expected, {:.2} MHz, difficulty {}",
            self.config.asic_count, self.config.frequency, self.config.difficulty
        );

        for _ in 0..VERSION_MASK_INIT_REPEAT {
            self.set_version_mask(self.config.version_mask).await?;
        }
        self.enter_state(InitState::VersionMaskSet);

        info!("Starting chip enumeration");
        let chip_count = self
            .command_context
            .enumerate(
                self.config.asic_count,
                bm1370::CHIP_ID,
                bm1370::CHIP_ID_RESPONSE_LENGTH,
            )
            .await?;
        if chip_count == 0 {
            self.enter_state(InitState::Failed("no chips detected".to_string()));
            Err(ErrorKind::ChainNotReady(
                "no chips detected on the chain".to_string(),
            ))?
        }
        info!("Discovered {} chips", chip_count);
        self.chip_count = chip_count;
        self.enter_state(InitState::IdentityVerified(chip_count));

        self.set_version_mask(self.config.version_mask).await?;
        self.broadcast(bm1370::REG_A8, init_values::REG_A8).await?;
        self.broadcast(bm1370::MISC_CONTROL_REG, init_values::MISC_CONTROL)
            .await?;

        // Set all chips to be offline before address assignment, each chip then takes the first
        // address it sees and passes the rest down the chain
        self.command_context.chain_inactive().await?;
        self.chip_addresses = self.command_context.set_chip_addresses(chip_count).await?;
        self.enter_state(InitState::ChipsAddressed);

        for value in init_values::CORE_REGISTER_CONTROL.iter() {
            self.broadcast(bm1370::CORE_REGISTER_CONTROL_REG, *value)
                .await?;
        }
        self.enter_state(InitState::CoreRegistersConfigured);

        self.set_difficulty(self.config.difficulty).await?;
        self.enter_state(InitState::DifficultyConfigured);

        self.broadcast(
            bm1370::IO_DRIVER_STRENGTH_REG,
            init_values::IO_DRIVER_STRENGTH,
        )
        .await?;
        self.configure_each_chip().await?;
        self.broadcast(bm1370::REG_B9, init_values::REG_B9).await?;
        self.broadcast(
            bm1370::ANALOG_MUX_CONTROL_REG,
            init_values::ANALOG_MUX_CONTROL,
        )
        .await?;
        self.broadcast(bm1370::REG_B9, init_values::REG_B9).await?;
        self.broadcast(
            bm1370::CORE_REGISTER_CONTROL_REG,
            init_values::CORE_REGISTER_CONTROL_FINAL,
        )
        .await?;

        if self.config.frequency == 0.0 {
            info!("Skipping frequency ramp");
        } else {
            info!(
                "Ramping up frequency from {:.2} MHz to {:.2} MHz",
                self.frequency, self.config.frequency
            );
            self.set_frequency(self.config.frequency).await?;
        }
        self.enter_state(InitState::ClockRamped);

        self.broadcast(bm1370::HASH_COUNTING_REG, init_values::HASH_COUNTING)
            .await?;
        self.enter_state(InitState::Ready);
        info!("Chain initialized");

        Ok(chip_count)
    }

    /// Per-chip part of the register setup, all registers of one chip go before the next chip
    async fn configure_each_chip(&self) -> error::Result<()> {
        for address in self.chip_addresses.iter() {
            let chip_address = ChipAddress::One(*address);
            self.command_context
                .write_raw(chip_address, bm1370::REG_A8, init_values::REG_A8_PER_CHIP)
                .await?;
            self.command_context
                .write_raw(
                    chip_address,
                    bm1370::MISC_CONTROL_REG,
                    init_values::MISC_CONTROL,
                )
                .await?;
            for value in init_values::CORE_REGISTER_CONTROL_PER_CHIP.iter() {
                self.command_context
                    .write_raw(chip_address, bm1370::CORE_REGISTER_CONTROL_REG, *value)
                    .await?;
            }
        }
        Ok(())
    }

    /// Tell chips which version bits they may roll
    pub async fn set_version_mask(&self, version_mask: u32) -> error::Result<()> {
        self.command_context
            .write_register(ChipAddress::All, &VersionMaskReg::new(version_mask))
            .await
    }

    /// Set the hardware filter: chips report only nonces meeting `difficulty`
    pub async fn set_difficulty(&self, difficulty: u32) -> error::Result<()> {
        let ticket_mask = TicketMaskReg::new(difficulty)?;
        debug!("Setting ticket mask {:#010x}", ticket_mask.to_reg());
        self.command_context
            .write_register(ChipAddress::All, &ticket_mask)
            .await
    }

    /// Program PLL of all chips to approximate `frequency` in one go
    ///
    /// When there are no divider settings close enough, the clock is left as it is.
    /// Returns: settings that have been sent, `None` when nothing has been sent
    pub async fn send_hash_frequency(&mut self, frequency: f32) -> error::Result<Option<PllSolution>> {
        let pll = match PllSolution::find(frequency) {
            Ok(pll) => pll,
            Err(e) => {
                error!("Failed to find PLL settings for target frequency {:.2}: {}", frequency, e);
                return Ok(None);
            }
        };

        self.command_context
            .write_register(ChipAddress::All, &pll.to_reg())
            .await?;
        self.frequency = frequency;
        info!(
            "Setting Frequency to {:.2}MHz ({:.2})",
            frequency, pll.frequency
        );
        Ok(Some(pll))
    }

    /// Walk chips from the current frequency to `target` (MHz) as the stepping policy says
    pub async fn set_frequency(&mut self, target: f32) -> error::Result<()> {
        let delay = self.stepping.step_delay();
        for step in self.stepping.steps(self.frequency, target) {
            self.send_hash_frequency(step).await?;
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Set baud rate of chips back to the value after reset
    /// Returns: new baud rate
    pub async fn set_default_baud(&self) -> error::Result<usize> {
        self.broadcast(
            bm1370::MISC_CONTROL_REG,
            init_values::MISC_CONTROL_DEFAULT_BAUD,
        )
        .await?;
        Ok(bm1370::DEFAULT_BAUD_RATE)
    }

    /// Switch chips to the fastest baud rate, the transport has to follow
    /// Returns: new baud rate
    pub async fn set_max_baud(&self) -> error::Result<usize> {
        info!("Setting max baud of {}", bm1370::MAX_BAUD_RATE);
        self.broadcast(
            bm1370::FAST_UART_CONFIGURATION_REG,
            init_values::FAST_UART_MAX_BAUD,
        )
        .await?;
        Ok(bm1370::MAX_BAUD_RATE)
    }

    /// Hand out the send and receive contexts of an initialized chain
    pub fn split(&self) -> error::Result<(WorkTx<T>, WorkRx<T>)> {
        if self.state != InitState::Ready {
            Err(ErrorKind::ChainNotReady(format!(
                "chain is in state {:?}",
                self.state
            )))?
        }
        Ok((
            WorkTx::new(self.command_context.clone(), self.registry.clone()),
            WorkRx::new(self.transport.clone(), self.registry.clone()),
        ))
    }
}
