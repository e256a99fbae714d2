//! Mock device channel for testing
//!
//! Stands in for a Notecard without any hardware attached. It provides:
//! - Canned replies, echo, or injected failures
//! - Simulated transaction latency
//! - A record of every transaction (request bytes, entry and exit times)
//!
//! Clones share state, so a test can hand one clone to the code under test
//! and keep another to inspect afterwards.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use super::DeviceChannel;
use crate::error::DeviceError;

/// What the mock does with each request.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return the same reply every time.
    Reply(Bytes),
    /// Return the request unchanged.
    Echo,
    /// Fail every transaction with an I/O error.
    Fail,
}

/// Entry and exit times of one transaction.
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    pub enter: Instant,
    pub exit: Instant,
}

#[derive(Debug, Default)]
struct Record {
    requests: Vec<Bytes>,
    intervals: Vec<Interval>,
    in_flight: usize,
    max_in_flight: usize,
    closed: bool,
}

/// A scripted [`DeviceChannel`].
#[derive(Debug, Clone)]
pub struct MockChannel {
    behavior: Behavior,
    latency: Duration,
    record: Arc<Mutex<Record>>,
}

impl MockChannel {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            latency: Duration::ZERO,
            record: Arc::default(),
        }
    }

    /// A mock that answers every request with `reply`.
    pub fn replying(reply: &[u8]) -> Self {
        Self::new(Behavior::Reply(Bytes::copy_from_slice(reply)))
    }

    pub fn echoing() -> Self {
        Self::new(Behavior::Echo)
    }

    pub fn failing() -> Self {
        Self::new(Behavior::Fail)
    }

    /// Hold each transaction open for `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of transactions attempted.
    pub fn calls(&self) -> usize {
        self.record.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<Bytes> {
        self.record.lock().requests.clone()
    }

    pub fn intervals(&self) -> Vec<Interval> {
        self.record.lock().intervals.clone()
    }

    /// Highest number of transactions observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.record.lock().max_in_flight
    }

    pub fn is_closed(&self) -> bool {
        self.record.lock().closed
    }
}

#[async_trait]
impl DeviceChannel for MockChannel {
    async fn transact(&mut self, request: &[u8]) -> Result<Bytes, DeviceError> {
        let enter = Instant::now();
        {
            let mut record = self.record.lock();
            if record.closed {
                return Err(DeviceError::Closed);
            }
            record.requests.push(Bytes::copy_from_slice(request));
            record.in_flight += 1;
            record.max_in_flight = record.max_in_flight.max(record.in_flight);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match &self.behavior {
            Behavior::Reply(reply) => Ok(reply.clone()),
            Behavior::Echo => Ok(Bytes::copy_from_slice(request)),
            Behavior::Fail => Err(DeviceError::Io(io::Error::other(
                "remote I/O error on /dev/i2c-1 (errno 121)",
            ))),
        };

        let mut record = self.record.lock();
        record.in_flight -= 1;
        record.intervals.push(Interval {
            enter,
            exit: Instant::now(),
        });
        result
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        self.record.lock().closed = true;
        Ok(())
    }
}
