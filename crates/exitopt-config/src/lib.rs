// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TOML configuration of exit-history optimization.
//!
//! ```toml
//! [history]
//! exec-max-instructions = 8192
//! probe-max-instructions-without-exit = 24
//! # probe-min-instructions defaults to (probe max + 1) * 3
//!
//! [optimization]
//! enabled = true
//! enabled-inner = true
//! enabled-inner-preempt-disabled = false
//!
//! [tunables]
//! promote-threshold = 256
//! probe-retry-limit = 512
//! ```

use std::path::Path;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use exitopt::config::default_probe_min;
pub use exitopt::{ConfigError, HistoryConfig, OptimizationFlags, Tunables};

/// Exit-history configuration, as read from a file.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub history: History,

    #[serde(default)]
    pub optimization: OptimizationFlags,

    #[serde(default)]
    pub tunables: Tunables,
}

/// Bounds on history execution.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct History {
    pub exec_max_instructions: u16,
    pub probe_max_instructions_without_exit: u16,

    /// Derived from `probe_max_instructions_without_exit` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_min_instructions: Option<u16>,
}
impl Default for History {
    fn default() -> Self {
        let defaults = HistoryConfig::default();
        Self {
            exec_max_instructions: defaults.exec_max_instructions,
            probe_max_instructions_without_exit: defaults
                .probe_max_instructions_without_exit,
            probe_min_instructions: None,
        }
    }
}

impl Config {
    /// Resolve defaults and flag hierarchy, producing a validated
    /// configuration for the exit-history core.
    pub fn history_config(&self) -> Result<HistoryConfig, ConfigError> {
        let probe_max = self.history.probe_max_instructions_without_exit;
        let cfg = HistoryConfig {
            exec_max_instructions: self.history.exec_max_instructions,
            probe_max_instructions_without_exit: probe_max,
            probe_min_instructions: self
                .history
                .probe_min_instructions
                .unwrap_or_else(|| default_probe_min(probe_max)),
            optimization: self.optimization.cascaded(),
            tunables: self.tunables,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg = toml::from_str::<Config>(s)?;
        cfg.history_config()?;
        Ok(cfg)
    }
}

/// Errors which may be returned when parsing the configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ConfigError),
}

/// Parses and validates a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    contents.parse()
}
