//! Hardware abstraction layer traits.
//!
//! The Notecard's I2C protocol is written against the [`I2c`] trait so it can
//! run on the host's i2c-dev bus in production and on an in-memory bus in
//! tests.

use async_trait::async_trait;
use std::io;

mod linux;

pub use linux::LinuxI2c;

/// Plain I2C master transfers.
///
/// Each call is a complete transfer (START, address, data, STOP) to the
/// 7-bit `address`.
#[async_trait]
pub trait I2c: Send {
    /// Write all of `data` to the peripheral.
    async fn write(&mut self, address: u8, data: &[u8]) -> io::Result<()>;

    /// Fill `buffer` with bytes read from the peripheral.
    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> io::Result<()>;
}
