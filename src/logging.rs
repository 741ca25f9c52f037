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

//! Global logger shared by all modules of the driver.
//!
//! Use `use crate::logging::macros::*;` and log with `info!("...")` etc.

use std::env;

use lazy_static::lazy_static;
use slog::{o, Drain, Level, LevelFilter, Logger};

/// Override the default drain channel size as the receive path tends to burst messages
pub const ASYNC_LOGGER_DRAIN_CHANNEL_SIZE: usize = 4096;

lazy_static! {
    /// Build static reference to the logger that will be accessible from all modules
    pub static ref LOGGER: Logger = {
        let level = Level::Trace;

        // envlogger doesn't allow to set default log level, so this is a workaround
        if env::var("RUST_LOG").is_err() {
            env::set_var("RUST_LOG", "info");
        }

        let terminal_decorator = slog_term::TermDecorator::new().build();
        let terminal_drain = slog_term::FullFormat::new(terminal_decorator).build().fuse();
        let terminal_drain = LevelFilter::new(terminal_drain, level).fuse();
        let terminal_drain = slog_envlogger::new(terminal_drain);
        let terminal_drain = slog_async::Async::new(terminal_drain)
            .chan_size(ASYNC_LOGGER_DRAIN_CHANNEL_SIZE)
            .build()
            .fuse();

        Logger::root(terminal_drain, o!())
    };
}

#[macro_export]
macro_rules! trace {
    ($($args:tt)+) => {
        slog::trace!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! debug {
    ($($args:tt)+) => {
        slog::debug!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! info {
    ($($args:tt)+) => {
        slog::info!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! warn {
    ($($args:tt)+) => {
        slog::warn!($crate::logging::LOGGER, $($args)+)
    };
}

#[macro_export]
macro_rules! error {
    ($($args:tt)+) => {
        slog::error!($crate::logging::LOGGER, $($args)+)
    };
}

pub mod macros {
    pub use crate::{debug, error, info, trace, warn};
}
