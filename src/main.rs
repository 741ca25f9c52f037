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

//! Offline helper for BM1370 chains: shows what the driver would send to the chips

use bosminer_bm1370::logging::macros::*;

use bosminer_bm1370::bm1370::{self, ChipAddress, PllSolution, Register, SetConfigPayload};
use bosminer_bm1370::config;
use bosminer_bm1370::error;
use bosminer_bm1370::frame::Frame;

use packed_struct::PackedStruct;

use std::process;

/// Build broadcast write of `value` into register `R`
fn register_frame<R: Register>(value: &R) -> error::Result<Frame> {
    let payload = SetConfigPayload::new(ChipAddress::All, R::REG_NUM, value.to_reg());
    Frame::encode(payload.header(ChipAddress::All), &payload.pack()?)
}

fn pll(frequency: f32) -> error::Result<()> {
    let pll = PllSolution::find(frequency)?;
    println!("target:    {:.2} MHz", frequency);
    println!("achieved:  {:.2} MHz", pll.frequency);
    println!("fbdiv:     {:#04x}", pll.fbdiv);
    println!("refdiv:    {}", pll.refdiv);
    println!("postdiv1:  {}", pll.postdiv1);
    println!("postdiv2:  {}", pll.postdiv2);
    println!("vco:       {:.2} MHz", pll.vco_frequency());
    println!("frame:     {}", hex::encode(register_frame(&pll.to_reg())?.as_bytes()));
    Ok(())
}

fn difficulty(difficulty: u32) -> error::Result<()> {
    let reg = bm1370::TicketMaskReg::new(difficulty)?;
    println!("ticket mask: {:#010x}", reg.to_reg());
    println!("frame:       {}", hex::encode(register_frame(&reg)?.as_bytes()));
    Ok(())
}

fn check_config(config_path: &str) -> error::Result<()> {
    let backend = config::Backend::parse(config_path)?;
    println!("{:#?}", backend.resolve_chain_config());
    Ok(())
}

fn main() {
    let app = clap::App::new("bm1370-tool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Inspect BM1370 chain settings without touching the hardware")
        .subcommand(
            clap::SubCommand::with_name("pll")
                .about("Find PLL divider settings for a frequency")
                .arg(
                    clap::Arg::with_name("frequency")
                        .value_name("MHZ")
                        .help("Target chip frequency (in MHz)")
                        .required(true),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("difficulty")
                .about("Show ticket mask register for an ASIC difficulty")
                .arg(
                    clap::Arg::with_name("difficulty")
                        .value_name("DIFF")
                        .help("ASIC difficulty")
                        .required(true),
                ),
        )
        .subcommand(
            clap::SubCommand::with_name("check-config")
                .about("Parse configuration file and print resolved chain settings")
                .arg(
                    clap::Arg::with_name("config")
                        .long("config")
                        .help("Set config file path")
                        .required(false)
                        .takes_value(true),
                ),
        );

    let matches = app.get_matches();

    let result = match matches.subcommand() {
        ("pll", Some(matches)) => {
            let value = matches
                .value_of("frequency")
                .expect("BUG: missing 'frequency' argument");
            match value.parse::<f32>() {
                Ok(frequency) => pll(frequency),
                Err(_) => Err(format!("'{}' is not a float number", value).into()),
            }
        }
        ("difficulty", Some(matches)) => {
            let value = matches
                .value_of("difficulty")
                .expect("BUG: missing 'difficulty' argument");
            match value.parse::<u32>() {
                Ok(value) => difficulty(value),
                Err(_) => Err(format!("'{}' is not a number", value).into()),
            }
        }
        ("check-config", Some(matches)) => {
            let config_path = matches
                .value_of("config")
                .unwrap_or(config::DEFAULT_CONFIG_PATH);
            debug!("Checking configuration '{}'", config_path);
            check_config(config_path)
        }
        _ => {
            eprintln!("{}", matches.usage());
            process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
