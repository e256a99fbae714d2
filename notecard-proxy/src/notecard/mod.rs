//! Notecard device channels.
//!
//! A [`DeviceChannel`] is the single, exclusive link to the Notecard. It sends
//! one request line and returns one reply line per transaction. Two
//! transports exist: [`serial::SerialChannel`] and [`i2c::I2cChannel`].
//! [`open`] picks one from the resolved configuration and checks readiness
//! before handing it out.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;

use crate::{
    config::{TransportConfig, TransportKind},
    error::DeviceError,
    hw_trait::LinuxI2c,
    tracing::prelude::*,
};

pub mod codec;
pub mod i2c;
pub mod mock;
pub mod serial;

/// Request used to confirm the device answers before declaring readiness.
pub const STATUS_REQUEST: &[u8] = br#"{"req":"card.status"}"#;

/// Reply returned for `cmd` requests, which the Notecard never answers.
pub const EMPTY_REPLY: &[u8] = b"{}";

/// An open, exclusive link to the Notecard.
#[async_trait]
pub trait DeviceChannel: Send {
    /// Send one request and wait for its reply.
    ///
    /// `request` is forwarded as-is apart from line framing; the reply is
    /// returned without its line terminator.
    async fn transact(&mut self, request: &[u8]) -> Result<Bytes, DeviceError>;

    /// Release the underlying device. Calling it again does nothing.
    async fn close(&mut self) -> Result<(), DeviceError>;
}

#[async_trait]
impl<C: DeviceChannel + ?Sized> DeviceChannel for Box<C> {
    async fn transact(&mut self, request: &[u8]) -> Result<Bytes, DeviceError> {
        (**self).transact(request).await
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        (**self).close().await
    }
}

/// How a request is split before it goes on the wire.
///
/// The Notecard's input buffer is small; long requests have to arrive in
/// pieces with a pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPolicy {
    pub max_len: usize,
    pub delay: Duration,
}

impl SegmentPolicy {
    pub const SERIAL: SegmentPolicy = SegmentPolicy {
        max_len: 250,
        delay: Duration::from_millis(250),
    };

    pub const I2C: SegmentPolicy = SegmentPolicy {
        max_len: 250,
        delay: Duration::from_millis(250),
    };
}

/// Open the channel selected by `config`.
///
/// Serial ports are ready once opened. An I2C bus can open fine with nothing
/// listening at the address, so the I2C channel must also answer a status
/// request; see [`open_with`].
pub async fn open(config: &TransportConfig) -> Result<Box<dyn DeviceChannel>, DeviceError> {
    info!(transport = %config.kind, "Setting up Notecard");
    match config.kind {
        TransportKind::Serial => {
            let channel = serial::open_serial(
                &config.serial_device,
                config.serial_baud,
                config.transaction_timeout,
            )
            .await?;
            let channel: Box<dyn DeviceChannel> = Box::new(channel);
            open_with(TransportKind::Serial, channel).await
        }
        TransportKind::I2c => {
            let path = config.i2c_bus_path();
            let bus = LinuxI2c::open(path).map_err(|source| DeviceError::Open {
                path: path.into(),
                source,
            })?;
            let channel =
                i2c::I2cChannel::new(bus, config.i2c_address, config.transaction_timeout);
            let channel: Box<dyn DeviceChannel> = Box::new(channel);
            open_with(TransportKind::I2c, channel).await
        }
    }
}

/// Apply the readiness rule for `kind` to an already-open channel.
///
/// For I2C the channel must pass [`verify`]; if it doesn't, the channel is
/// closed and dropped and only the error comes back.
pub async fn open_with<C: DeviceChannel>(
    kind: TransportKind,
    mut channel: C,
) -> Result<C, DeviceError> {
    if kind == TransportKind::I2c {
        if let Err(e) = verify(&mut channel).await {
            if let Err(close_err) = channel.close().await {
                warn!(error = %close_err, "Failed to close Notecard after failed status check");
            }
            return Err(e);
        }
    }
    Ok(channel)
}

#[derive(Deserialize)]
struct StatusReply {
    err: Option<String>,
    status: Option<String>,
}

/// Run a `card.status` transaction and check the reply.
pub async fn verify<C: DeviceChannel + ?Sized>(channel: &mut C) -> Result<(), DeviceError> {
    let reply = channel
        .transact(STATUS_REQUEST)
        .await
        .map_err(|e| DeviceError::Verify(e.to_string()))?;

    let status: StatusReply = serde_json::from_slice(&reply)
        .map_err(|e| DeviceError::Verify(format!("unreadable card.status reply: {e}")))?;
    if let Some(err) = status.err {
        return Err(DeviceError::Verify(err));
    }

    info!(status = status.status.as_deref().unwrap_or("unknown"), "Notecard is ready");
    Ok(())
}
