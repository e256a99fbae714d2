//! I2C through the Linux i2c-dev interface (`/dev/i2c-N`).

use async_trait::async_trait;
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::fd::AsRawFd,
    path::Path,
    sync::Arc,
};

use super::I2c;
use crate::tracing::prelude::*;

// From <linux/i2c-dev.h>: use this 7-bit slave address for subsequent
// read()/write() calls on the file descriptor.
const I2C_SLAVE: u64 = 0x0703;

nix::ioctl_write_int_bad!(i2c_set_slave_address, I2C_SLAVE);

/// An open i2c-dev bus.
///
/// The blocking read()/write() calls run on tokio's blocking pool.
pub struct LinuxI2c {
    file: Arc<File>,
    selected: Option<u8>,
}

impl LinuxI2c {
    /// Open the bus device, e.g. `/dev/i2c-1`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!(bus = %path.display(), "Opened I2C bus");
        Ok(Self {
            file: Arc::new(file),
            selected: None,
        })
    }

    fn select(&mut self, address: u8) -> io::Result<()> {
        if self.selected == Some(address) {
            return Ok(());
        }
        // SAFETY: the descriptor belongs to `self.file`, which outlives the
        // call, and I2C_SLAVE takes its argument by value.
        unsafe { i2c_set_slave_address(self.file.as_raw_fd(), address as i32) }
            .map_err(io::Error::from)?;
        self.selected = Some(address);
        Ok(())
    }
}

#[async_trait]
impl I2c for LinuxI2c {
    async fn write(&mut self, address: u8, data: &[u8]) -> io::Result<()> {
        self.select(address)?;
        let file = self.file.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || (&*file).write_all(&data))
            .await
            .map_err(io::Error::other)?
    }

    async fn read(&mut self, address: u8, buffer: &mut [u8]) -> io::Result<()> {
        self.select(address)?;
        let file = self.file.clone();
        let len = buffer.len();
        let data = tokio::task::spawn_blocking(move || {
            let mut data = vec![0u8; len];
            (&*file).read_exact(&mut data).map(|_| data)
        })
        .await
        .map_err(io::Error::other)??;
        buffer.copy_from_slice(&data);
        Ok(())
    }
}
