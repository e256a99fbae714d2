//! Configuration management for notecard-proxy.
//!
//! Everything is read from environment variables once at startup. Resolution
//! itself is pure: [`Config::from_lookup`] takes a lookup function, so tests
//! can resolve a configuration without touching the process environment or
//! any hardware.

use std::{num::NonZeroU32, str::FromStr, time::Duration};
use strum::{Display, EnumString};

use crate::error::ConfigError;

pub const TRANSPORT_VAR: &str = "NOTECARD_TRANSPORT";
pub const SERIAL_DEVICE_VAR: &str = "NOTECARD_SERIAL_DEVICE";
pub const SERIAL_BAUD_VAR: &str = "NOTECARD_SERIAL_BAUD";
pub const I2C_BUS_VAR: &str = "NOTECARD_I2C_BUS";
pub const I2C_ADDRESS_VAR: &str = "NOTECARD_I2C_ADDRESS";
pub const TIMEOUT_VAR: &str = "NOTECARD_TIMEOUT_SECS";
pub const DEBUG_VAR: &str = "NOTECARD_DEBUG";

pub const DEFAULT_SERIAL_DEVICE: &str = "/dev/tty.usbmodemNOTE1";
pub const DEFAULT_SERIAL_BAUD: u32 = 9600;
pub const DEFAULT_I2C_BUS: &str = "/dev/i2c-1";
pub const DEFAULT_I2C_ADDRESS: u8 = 0x17;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

/// Physical link used to reach the Notecard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TransportKind {
    Serial,
    I2c,
}

/// Transport settings, immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub kind: TransportKind,

    /// Serial device path (serial only)
    pub serial_device: String,

    /// Serial baud rate (serial only)
    pub serial_baud: u32,

    /// I2C bus device; empty means the host's default bus
    pub i2c_bus: String,

    /// 7-bit I2C address of the Notecard
    pub i2c_address: u8,

    /// Longest time to wait for a reply before giving up on a transaction
    pub transaction_timeout: Duration,
}

impl TransportConfig {
    /// The I2C bus to open, falling back to the host default.
    pub fn i2c_bus_path(&self) -> &str {
        if self.i2c_bus.is_empty() {
            DEFAULT_I2C_BUS
        } else {
            &self.i2c_bus
        }
    }
}

/// Main configuration structure for the proxy daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub transport: TransportConfig,

    /// Log request and response bodies. Off by default since payloads may
    /// carry location and telemetry data.
    pub debug: bool,
}

impl Config {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration using `lookup` to fetch variables by name.
    ///
    /// Unset and empty variables both take their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let kind = match get(TRANSPORT_VAR) {
            None => TransportKind::I2c,
            Some(value) => TransportKind::from_str(value.trim())
                .map_err(|_| ConfigError::UnsupportedTransport(value))?,
        };

        let serial_baud = match get(SERIAL_BAUD_VAR) {
            None => DEFAULT_SERIAL_BAUD,
            Some(value) => parse_baud(&value)?,
        };

        let i2c_address = match get(I2C_ADDRESS_VAR) {
            None => DEFAULT_I2C_ADDRESS,
            Some(value) => parse_i2c_address(&value)?,
        };

        let transaction_timeout = match get(TIMEOUT_VAR) {
            None => DEFAULT_TIMEOUT,
            Some(value) => parse_timeout(&value)?,
        };

        let debug = match get(DEBUG_VAR) {
            None => false,
            Some(value) => parse_flag(DEBUG_VAR, &value)?,
        };

        Ok(Config {
            transport: TransportConfig {
                kind,
                serial_device: get(SERIAL_DEVICE_VAR)
                    .unwrap_or_else(|| DEFAULT_SERIAL_DEVICE.to_string()),
                serial_baud,
                i2c_bus: get(I2C_BUS_VAR).unwrap_or_default(),
                i2c_address,
                transaction_timeout,
            },
            debug,
        })
    }
}

fn parse_baud(value: &str) -> Result<u32, ConfigError> {
    value
        .trim()
        .parse::<NonZeroU32>()
        .map(NonZeroU32::get)
        .map_err(|source| ConfigError::InvalidBaudRate {
            value: value.to_string(),
            source,
        })
}

fn parse_i2c_address(value: &str) -> Result<u8, ConfigError> {
    let trimmed = value.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => trimmed.parse::<u8>(),
    };
    match parsed {
        Ok(addr) if addr <= 0x7f => Ok(addr),
        _ => Err(ConfigError::InvalidAddress(value.to_string())),
    }
}

fn parse_timeout(value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 && secs <= MAX_TIMEOUT.as_secs() => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::InvalidTimeout(value.to_string())),
    }
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            var,
            value: value.to_string(),
        }),
    }
}
