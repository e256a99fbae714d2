//! Serialized access to the Notecard.
//!
//! The Notecard handles one request at a time and a transaction in progress
//! can't be interleaved with another, so every HTTP request funnels through
//! [`RequestProxy::transact`], which holds the channel lock for exactly one
//! transaction.

use bytes::Bytes;
use std::{io, sync::Arc};
use tokio::sync::Mutex;

use crate::{error::DeviceError, notecard::DeviceChannel, tracing::prelude::*};

type Slot = Arc<Mutex<Option<Box<dyn DeviceChannel>>>>;

/// Sole owner of the device channel for the life of the process.
///
/// A proxy can only be built from a channel that opened successfully, so a
/// running proxy never lacks a device. After [`close`](Self::close) the slot
/// is empty and transactions fail with [`DeviceError::Closed`].
pub struct RequestProxy {
    channel: Slot,
    debug: bool,
}

impl RequestProxy {
    /// Take ownership of an open channel. With `debug` set, request and reply
    /// bodies are logged.
    pub fn new(channel: Box<dyn DeviceChannel>, debug: bool) -> Self {
        Self {
            channel: Arc::new(Mutex::new(Some(channel))),
            debug,
        }
    }

    /// Run one transaction with exclusive use of the channel.
    ///
    /// Waits for any transaction already in flight. The transaction runs on
    /// its own task: once started it finishes and releases the lock even if
    /// the caller stops waiting for it.
    pub async fn transact(&self, request: Bytes) -> Result<Bytes, DeviceError> {
        if self.debug {
            debug!(body = %String::from_utf8_lossy(&request), "Notecard request");
        }

        let slot = self.channel.clone();
        let transaction = tokio::spawn(async move {
            match slot.lock().await.as_mut() {
                Some(channel) => channel.transact(&request).await,
                None => Err(DeviceError::Closed),
            }
        });
        let reply = transaction
            .await
            .map_err(|e| DeviceError::Io(io::Error::other(e)))??;

        if self.debug {
            debug!(body = %String::from_utf8_lossy(&reply), "Notecard reply");
        }
        Ok(reply)
    }

    /// Close the channel. Waits for an in-flight transaction to finish first.
    pub async fn close(&self) {
        let mut slot = self.channel.lock().await;
        if let Some(mut channel) = slot.take() {
            match channel.close().await {
                Ok(()) => info!("Closed Notecard channel"),
                Err(e) => warn!(error = %e, "Error while closing Notecard channel"),
            }
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.channel.lock().await.is_none()
    }
}
