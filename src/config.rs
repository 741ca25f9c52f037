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

//! This module handles BM1370 chain configuration and configuration file parsing

use crate::logging::macros::*;

use crate::bm1370;
use crate::error::{self, ErrorKind};
use crate::ramp::LinearStepping;

use serde::{Deserialize, Serialize};

use std::fs;
use std::time::Duration;

/// Expected configuration version
const FORMAT_VERSION: &'static str = "beta";

/// Expected configuration model
const FORMAT_MODEL: &'static str = "BM1370";

/// Location of default config
pub const DEFAULT_CONFIG_PATH: &'static str = "/etc/bm1370.toml";

/// Default PLL frequency for clocking the chips in MHz
pub const DEFAULT_FREQUENCY: f32 = 525.0;

/// Range of PLL frequency for clocking the chips in MHz
pub const FREQUENCY_MIN: f32 = 50.0;
pub const FREQUENCY_MAX: f32 = 1000.0;

/// Default number of chips expected on the chain
pub const DEFAULT_ASIC_COUNT: usize = 1;

/// Default ASIC difficulty
pub const DEFAULT_ASIC_DIFFICULTY: u32 = 256;

/// Default delay between frequency steps
pub const DEFAULT_RAMP_DELAY_MS: u64 = 100;

/// Chain settings resolved from configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ChainConfig {
    /// Target frequency in MHz, 0 leaves the chips at their reset frequency
    pub frequency: f32,
    /// How many chips should be on the chain
    pub asic_count: usize,
    pub difficulty: u32,
    pub version_mask: u32,
    pub ramp_step: f32,
    pub ramp_delay: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_FREQUENCY,
            asic_count: DEFAULT_ASIC_COUNT,
            difficulty: DEFAULT_ASIC_DIFFICULTY,
            version_mask: bm1370::DEFAULT_VERSION_MASK,
            ramp_step: LinearStepping::DEFAULT_STEP_MHZ,
            ramp_delay: Duration::from_millis(DEFAULT_RAMP_DELAY_MS),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Format {
    version: String,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    generator: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<u32>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            model: FORMAT_MODEL.to_string(),
            generator: None,
            timestamp: None,
        }
    }
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HashChain {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asic_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_mask: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ramp_step: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ramp_delay_ms: Option<u64>,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct Backend {
    format: Format,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_chain: Option<HashChain>,
}

impl Backend {
    /// Take configured values or defaults
    pub fn resolve_chain_config(&self) -> ChainConfig {
        let hash_chain = self.hash_chain.clone().unwrap_or_default();
        let default = ChainConfig::default();

        ChainConfig {
            frequency: hash_chain.frequency.unwrap_or(default.frequency),
            asic_count: hash_chain.asic_count.unwrap_or(default.asic_count),
            difficulty: hash_chain.difficulty.unwrap_or(default.difficulty),
            version_mask: hash_chain.version_mask.unwrap_or(default.version_mask),
            ramp_step: hash_chain.ramp_step.unwrap_or(default.ramp_step),
            ramp_delay: hash_chain
                .ramp_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(default.ramp_delay),
        }
    }

    fn check(&self) -> error::Result<()> {
        // Check compatibility of configuration format
        if self.format.model != FORMAT_MODEL {
            Err(ErrorKind::Config(format!(
                "incompatible format model '{}'",
                self.format.model
            )))?;
        }
        if self.format.version != FORMAT_VERSION {
            Err(ErrorKind::Config(format!(
                "incompatible format version '{}'",
                self.format.version
            )))?;
        }

        let hash_chain = match &self.hash_chain {
            Some(hash_chain) => hash_chain,
            None => return Ok(()),
        };
        if let Some(frequency) = hash_chain.frequency {
            if frequency != 0.0 && !(FREQUENCY_MIN..=FREQUENCY_MAX).contains(&frequency) {
                Err(ErrorKind::Config(format!(
                    "frequency {} MHz is out of range {}..{}",
                    frequency, FREQUENCY_MIN, FREQUENCY_MAX
                )))?;
            }
        }
        if let Some(asic_count) = hash_chain.asic_count {
            if !(1..=bm1370::MAX_CHIPS_ON_CHAIN).contains(&asic_count) {
                Err(ErrorKind::Config(format!(
                    "asic count {} is out of range 1..{}",
                    asic_count,
                    bm1370::MAX_CHIPS_ON_CHAIN
                )))?;
            }
        }
        if hash_chain.difficulty == Some(0) {
            Err(ErrorKind::Config("difficulty must be at least 1".to_string()))?;
        }
        if let Some(ramp_step) = hash_chain.ramp_step {
            if !(ramp_step > 0.0) {
                Err(ErrorKind::Config(format!(
                    "ramp step {} MHz must be positive",
                    ramp_step
                )))?;
            }
        }
        Ok(())
    }

    /// Parse and check configuration from TOML text
    pub fn from_str(text: &str) -> error::Result<Self> {
        let backend_config: Self = toml::from_str(text)?;
        backend_config.check()?;
        Ok(backend_config)
    }

    /// Parse and check configuration file
    pub fn parse(config_path: &str) -> error::Result<Self> {
        let text = fs::read_to_string(config_path).map_err(|e| {
            ErrorKind::Config(format!("cannot read '{}': {}", config_path, e))
        })?;
        let backend_config = Self::from_str(&text)?;
        info!("Configuration loaded from '{}'", config_path);
        Ok(backend_config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_defaults() {
        let backend = Backend::from_str(
            r#"
            [format]
            version = "beta"
            model = "BM1370"
            "#,
        )
        .expect("valid config");
        assert_eq!(backend.resolve_chain_config(), ChainConfig::default());
    }

    #[test]
    fn test_chain_values() {
        let backend = Backend::from_str(
            r#"
            [format]
            version = "beta"
            model = "BM1370"
            generator = "test"

            [hash_chain]
            frequency = 490.0
            asic_count = 2
            difficulty = 512
            ramp_delay_ms = 0
            "#,
        )
        .expect("valid config");
        let config = backend.resolve_chain_config();
        assert_eq!(config.frequency, 490.0);
        assert_eq!(config.asic_count, 2);
        assert_eq!(config.difficulty, 512);
        assert_eq!(config.version_mask, bm1370::DEFAULT_VERSION_MASK);
        assert_eq!(config.ramp_step, 6.25);
        assert_eq!(config.ramp_delay, Duration::from_millis(0));
    }

    #[test]
    fn test_zero_frequency_skips_ramp() {
        let backend = Backend::from_str(
            r#"
            format = { version = "beta", model = "BM1370" }
            hash_chain = { frequency = 0.0 }
            "#,
        )
        .expect("zero frequency is allowed");
        assert_eq!(backend.resolve_chain_config().frequency, 0.0);
    }

    #[test]
    fn test_rejected_configs() {
        let bad = [
            // wrong model
            r#"format = { version = "beta", model = "Antminer S9" }"#,
            // wrong version
            r#"format = { version = "alpha", model = "BM1370" }"#,
            // frequency out of range
            r#"format = { version = "beta", model = "BM1370" }
               hash_chain = { frequency = 5000.0 }"#,
            // no chips
            r#"format = { version = "beta", model = "BM1370" }
               hash_chain = { asic_count = 0 }"#,
            // too many chips
            r#"format = { version = "beta", model = "BM1370" }
               hash_chain = { asic_count = 300 }"#,
            r#"format = { version = "beta", model = "BM1370" }
               hash_chain = { difficulty = 0 }"#,
            r#"format = { version = "beta", model = "BM1370" }
               hash_chain = { ramp_step = -1.0 }"#,
            // unknown field
            r#"format = { version = "beta", model = "BM1370" }
               hash_chain = { voltage = 12.0 }"#,
            // missing format
            r#"hash_chain = { frequency = 500.0 }"#,
        ];
        for text in bad.iter() {
            assert!(
                Backend::from_str(text).is_err(),
                "config accepted: {}",
                text
            );
        }
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().expect("cannot create temp file");
        writeln!(
            file,
            "[format]\nversion = \"beta\"\nmodel = \"BM1370\"\n\n[hash_chain]\nasic_count = 4"
        )
        .expect("cannot write config");
        let path = file.path().to_str().expect("path is utf-8").to_string();

        let backend = Backend::parse(&path).expect("valid config file");
        assert_eq!(backend.resolve_chain_config().asic_count, 4);

        let error = Backend::parse("/nonexistent/bm1370.toml").expect_err("no such file");
        match error.kind() {
            ErrorKind::Config(_) => {}
            kind => panic!("unexpected error kind {:?}", kind),
        }
    }
}
