//! Machine configuration: optional TOML file plus command-line overrides
//!
//! ```toml
//! machine = "mini-virt"
//!
//! [options]
//! cpus = 4
//! cpu_type = "cortex-a57"
//! ram_size = 4294967296
//! ```

use anyhow::{Context, Result};
use mini_virt::{CpuModel, MachineOptions};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_MACHINE: &str = "mini-virt";

/// Contents of a machine configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default = "default_machine")]
    pub machine: String,

    #[serde(default)]
    pub options: MachineOptions,
}

fn default_machine() -> String {
    DEFAULT_MACHINE.to_string()
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            machine: default_machine(),
            options: MachineOptions::default(),
        }
    }
}

/// Values given on the command line; each one wins over the file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub machine: Option<String>,
    pub cpus: Option<u32>,
    pub cpu_type: Option<CpuModel>,
    pub ram_size: Option<u64>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid machine configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("In {}", path.display()))
    }

    /// Load `path` if given, otherwise start from defaults, then apply
    /// `overrides`
    pub fn resolve(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(machine) = overrides.machine {
            self.machine = machine;
        }
        if let Some(cpus) = overrides.cpus {
            self.options.cpus = cpus;
        }
        if let Some(cpu_type) = overrides.cpu_type {
            self.options.cpu_type = Some(cpu_type);
        }
        if let Some(ram_size) = overrides.ram_size {
            self.options.ram_size = Some(ram_size);
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("empty size")]
    Empty,

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("unknown size suffix '{0}' (expected K, M, G or T)")]
    UnknownSuffix(char),

    #[error("size {0} overflows 64 bits")]
    Overflow(String),
}

/// Parse a byte count: decimal, `0x` hex, or decimal with a K/M/G/T suffix
/// (binary multiples; a trailing `B` or `iB` is accepted)
pub fn parse_size(input: &str) -> Result<u64, SizeError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(SizeError::Empty);
    }

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map_err(|_| SizeError::InvalidNumber(s.into()));
    }

    let s = s
        .strip_suffix("iB")
        .or_else(|| s.strip_suffix('B'))
        .unwrap_or(s);

    let (digits, shift) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(SizeError::UnknownSuffix(c)),
            };
            (&s[..s.len() - 1], shift)
        }
        _ => (s, 0),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| SizeError::InvalidNumber(input.trim().into()))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| SizeError::Overflow(input.trim().into()))
}
