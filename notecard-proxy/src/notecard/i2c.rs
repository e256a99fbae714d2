//! Notecard over I2C.
//!
//! The Notecard's I2C interface is a byte pipe with a two-byte header:
//!
//! - To send, write `[len, data...]`, at most [`SegmentPolicy::I2C`] bytes of
//!   data per transfer.
//! - To receive, write `[0, n]` to ask for `n` bytes, then read `n + 2` bytes:
//!   `[available, n, data...]`, where `available` is what the Notecard still
//!   holds after this chunk. Asking for zero bytes just reports `available`.
//!
//! A reply is complete once a newline has been read.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::{self, Instant};

use super::{
    codec::{self, ResponseCodec},
    DeviceChannel, SegmentPolicy, EMPTY_REPLY,
};
use crate::{error::DeviceError, hw_trait::I2c, tracing::prelude::*};

/// Largest chunk the Notecard returns per read, leaving room for the header
/// within a 255-byte transfer.
const MAX_READ_CHUNK: usize = 253;

/// Pause between polls while the Notecard has nothing for us.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time given to the Notecard to react to the reset newline.
const RESET_SETTLE: Duration = Duration::from_millis(100);

/// Stale bytes to discard before giving up on a reset.
const RESET_DRAIN_LIMIT: usize = 64 * 1024;

/// Notecard transport over an I2C bus.
pub struct I2cChannel<B> {
    bus: Option<B>,
    address: u8,
    segments: SegmentPolicy,
    timeout: Duration,
    poll_interval: Duration,
    codec: ResponseCodec,
    buffer: BytesMut,
    needs_reset: bool,
}

impl<B: I2c> I2cChannel<B> {
    /// Wrap an open bus. Nothing is sent until the first transaction, which
    /// starts by clearing out anything the Notecard still holds.
    pub fn new(bus: B, address: u8, timeout: Duration) -> Self {
        Self {
            bus: Some(bus),
            address,
            segments: SegmentPolicy::I2C,
            timeout,
            poll_interval: POLL_INTERVAL,
            codec: ResponseCodec::default(),
            buffer: BytesMut::new(),
            needs_reset: true,
        }
    }

    pub fn with_segments(mut self, segments: SegmentPolicy) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn bus(&mut self) -> Result<&mut B, DeviceError> {
        self.bus.as_mut().ok_or(DeviceError::Closed)
    }

    /// Ask for `want` bytes. Returns what the Notecard still holds afterwards
    /// along with the data.
    async fn poll_chunk(&mut self, want: usize) -> Result<(usize, Vec<u8>), DeviceError> {
        let address = self.address;
        let bus = self.bus()?;

        bus.write(address, &[0, want as u8]).await?;
        let mut chunk = vec![0u8; want + 2];
        bus.read(address, &mut chunk).await?;

        let available = chunk[0] as usize;
        let returned = chunk[1] as usize;
        if returned != want {
            return Err(DeviceError::Protocol(format!(
                "asked the Notecard for {want} bytes, got {returned}"
            )));
        }
        chunk.drain(..2);
        Ok((available, chunk))
    }

    /// Terminate any partial request and throw away pending output.
    pub async fn reset(&mut self) -> Result<(), DeviceError> {
        let address = self.address;
        self.bus()?.write(address, &[1, b'\n']).await?;
        time::sleep(RESET_SETTLE).await;

        let mut discarded = 0;
        let (mut available, _) = self.poll_chunk(0).await?;
        while available > 0 {
            if discarded > RESET_DRAIN_LIMIT {
                return Err(DeviceError::Protocol(
                    "Notecard kept sending data during reset".to_string(),
                ));
            }
            let want = available.min(MAX_READ_CHUNK);
            let (remaining, _) = self.poll_chunk(want).await?;
            discarded += want;
            available = remaining;
        }
        if discarded > 0 {
            trace!(bytes = discarded, "Discarded stale output during reset");
        }

        self.codec = ResponseCodec::default();
        self.buffer.clear();
        self.needs_reset = false;
        Ok(())
    }

    async fn send(&mut self, request: &[u8]) -> Result<(), DeviceError> {
        let address = self.address;
        let segments = self.segments;
        let max_len = segments.max_len.clamp(1, u8::MAX as usize - 1);
        let bus = self.bus()?;

        let line = codec::frame_request(request);
        for (i, segment) in line.chunks(max_len).enumerate() {
            if i > 0 {
                time::sleep(segments.delay).await;
            }
            let mut transfer = Vec::with_capacity(segment.len() + 1);
            transfer.push(segment.len() as u8);
            transfer.extend_from_slice(segment);
            bus.write(address, &transfer).await?;
        }
        Ok(())
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Bytes, DeviceError> {
        self.send(request).await?;
        if !codec::expects_reply(request) {
            return Ok(Bytes::from_static(EMPTY_REPLY));
        }
        self.receive().await
    }

    async fn receive(&mut self) -> Result<Bytes, DeviceError> {
        // No deadline if the timeout runs past what Instant can represent.
        let deadline = Instant::now().checked_add(self.timeout);
        let mut available = 0;
        loop {
            if let Some(reply) = codec::next_reply(&mut self.codec, &mut self.buffer)? {
                return Ok(reply);
            }

            let want = available.min(MAX_READ_CHUNK);
            let (remaining, data) = self.poll_chunk(want).await?;
            self.buffer.extend_from_slice(&data);
            available = remaining;

            if want == 0 && available == 0 {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Err(DeviceError::Timeout(self.timeout));
                }
                time::sleep(self.poll_interval).await;
            }
        }
    }
}

#[async_trait]
impl<B: I2c> DeviceChannel for I2cChannel<B> {
    async fn transact(&mut self, request: &[u8]) -> Result<Bytes, DeviceError> {
        if self.needs_reset {
            self.reset().await?;
        }

        // Stays set if this future is dropped mid-exchange.
        self.needs_reset = true;
        let reply = self.exchange(request).await?;
        self.needs_reset = false;
        Ok(reply)
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if self.bus.take().is_some() {
            debug!(address = self.address, "Closed I2C channel");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::{collections::VecDeque, io, sync::Arc};

    const ADDRESS: u8 = 0x17;

    /// Byte-level model of the Notecard's I2C side.
    #[derive(Default)]
    struct FakeState {
        incoming: Vec<u8>,
        outgoing: VecDeque<u8>,
        pending_read: usize,
        // Zero-length polls to answer with "nothing yet" before a reply shows.
        delay_polls: usize,
        hidden: Option<Vec<u8>>,
        requests: Vec<String>,
        writes: Vec<Vec<u8>>,
        unresponsive: bool,
        silent: bool,
    }

    #[derive(Clone, Default)]
    struct FakeBus {
        state: Arc<Mutex<FakeState>>,
        reply: Arc<Mutex<Option<fn(&str) -> String>>>,
    }

    impl FakeBus {
        fn answering(reply: fn(&str) -> String) -> Self {
            let bus = Self::default();
            *bus.reply.lock() = Some(reply);
            bus
        }
    }

    #[async_trait]
    impl I2c for FakeBus {
        async fn write(&mut self, address: u8, data: &[u8]) -> io::Result<()> {
            assert_eq!(address, ADDRESS);
            let mut state = self.state.lock();
            if state.unresponsive {
                return Err(io::Error::from_raw_os_error(121));
            }
            state.writes.push(data.to_vec());

            if data.len() == 2 && data[0] == 0 {
                state.pending_read = data[1] as usize;
                if data[1] == 0 && state.hidden.is_some() {
                    if state.delay_polls == 0 {
                        let reply = state.hidden.take().unwrap_or_default();
                        state.outgoing.extend(reply);
                    } else {
                        state.delay_polls -= 1;
                    }
                }
                return Ok(());
            }

            let len = data[0] as usize;
            assert_eq!(len, data.len() - 1, "segment length header");
            state.incoming.extend_from_slice(&data[1..]);
            while let Some(pos) = state.incoming.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.incoming.drain(..=pos).collect();
                let line = String::from_utf8(line).unwrap();
                let line = line.trim_end().to_string();
                if line.is_empty() || state.silent {
                    continue;
                }
                if let Some(reply) = *self.reply.lock() {
                    let mut out = reply(&line).into_bytes();
                    out.extend_from_slice(b"\r\n");
                    state.hidden = Some(out);
                }
                state.requests.push(line);
            }
            Ok(())
        }

        async fn read(&mut self, address: u8, buffer: &mut [u8]) -> io::Result<()> {
            assert_eq!(address, ADDRESS);
            let mut state = self.state.lock();
            if state.unresponsive {
                return Err(io::Error::from_raw_os_error(121));
            }
            let want = state.pending_read;
            assert_eq!(buffer.len(), want + 2);
            assert!(want <= state.outgoing.len(), "read past available data");
            for slot in buffer[2..].iter_mut() {
                *slot = state.outgoing.pop_front().unwrap_or(0);
            }
            buffer[0] = state.outgoing.len().min(255) as u8;
            buffer[1] = want as u8;
            Ok(())
        }
    }

    fn channel(bus: FakeBus) -> I2cChannel<FakeBus> {
        I2cChannel::new(bus, ADDRESS, Duration::from_millis(500))
            .with_segments(SegmentPolicy {
                max_len: 16,
                delay: Duration::from_millis(1),
            })
            .with_poll_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn transaction_round_trip() {
        let bus = FakeBus::answering(|_| r#"{"status":"{normal}"}"#.to_string());
        let state = bus.state.clone();
        let mut channel = channel(bus);

        let reply = channel.transact(br#"{"req":"card.status"}"#).await.unwrap();

        assert_eq!(&reply[..], br#"{"status":"{normal}"}"#);
        assert_eq!(state.lock().requests, vec![r#"{"req":"card.status"}"#]);
    }

    #[tokio::test]
    async fn long_request_is_segmented() {
        let bus = FakeBus::answering(|_| "{}".to_string());
        let state = bus.state.clone();
        let mut channel = channel(bus);
        let request = br#"{"req":"note.add","body":{"lat":42.123456789,"lon":-71.987654321}}"#;

        channel.transact(request).await.unwrap();

        let state = state.lock();
        assert_eq!(state.requests, vec![String::from_utf8(request.to_vec()).unwrap()]);
        let data_writes: Vec<_> = state
            .writes
            .iter()
            .filter(|w| !(w.len() == 2 && w[0] == 0) && w.as_slice() != &[1u8, b'\n'][..])
            .collect();
        assert!(data_writes.len() > 1);
        assert!(data_writes.iter().all(|w| w.len() <= 17));
    }

    #[tokio::test]
    async fn long_reply_is_read_in_chunks() {
        let bus = FakeBus::answering(|_| format!(r#"{{"payload":"{}"}}"#, "x".repeat(600)));
        let mut channel = channel(bus);

        let reply = channel.transact(br#"{"req":"note.get"}"#).await.unwrap();

        assert_eq!(reply.len(), 600 + r#"{"payload":""}"#.len());
        assert!(reply.ends_with(b"\"}"));
    }

    #[tokio::test]
    async fn waits_for_slow_reply() {
        let bus = FakeBus::answering(|_| r#"{"time":1700000000}"#.to_string());
        bus.state.lock().delay_polls = 5;
        let mut channel = channel(bus);

        let reply = channel.transact(br#"{"req":"card.time"}"#).await.unwrap();

        assert_eq!(&reply[..], br#"{"time":1700000000}"#);
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let bus = FakeBus::default();
        bus.state.lock().silent = true;
        let mut channel = I2cChannel::new(bus, ADDRESS, Duration::from_millis(30))
            .with_poll_interval(Duration::from_millis(5));

        let err = channel.transact(br#"{"req":"card.status"}"#).await.unwrap_err();

        assert!(matches!(err, DeviceError::Timeout(_)), "{err}");
    }

    #[tokio::test]
    async fn nack_is_an_io_error() {
        let bus = FakeBus::default();
        bus.state.lock().unresponsive = true;
        let mut channel = channel(bus);

        let err = channel.transact(br#"{"req":"card.status"}"#).await.unwrap_err();

        assert!(matches!(err, DeviceError::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn first_transaction_drains_stale_output() {
        let bus = FakeBus::answering(|_| r#"{"fresh":true}"#.to_string());
        bus.state.lock().outgoing.extend(b"{\"stale\":true}\r\n".iter().copied());
        let mut channel = channel(bus);

        let reply = channel.transact(br#"{"req":"card.status"}"#).await.unwrap();

        assert_eq!(&reply[..], br#"{"fresh":true}"#);
    }

    #[tokio::test]
    async fn cmd_request_skips_reply() {
        let bus = FakeBus::answering(|_| "{}".to_string());
        let state = bus.state.clone();
        let mut channel = channel(bus);

        let reply = channel.transact(br#"{"cmd":"hub.set","mode":"off"}"#).await.unwrap();

        assert_eq!(&reply[..], EMPTY_REPLY);
        assert_eq!(state.lock().requests.len(), 1);
    }

    #[tokio::test]
    async fn huge_timeout_does_not_overflow() {
        let bus = FakeBus::answering(|_| r#"{"time":1700000000}"#.to_string());
        bus.state.lock().delay_polls = 2;
        let mut channel = I2cChannel::new(bus, ADDRESS, Duration::MAX)
            .with_poll_interval(Duration::from_millis(1));

        let reply = channel.transact(br#"{"req":"card.time"}"#).await.unwrap();

        assert_eq!(&reply[..], br#"{"time":1700000000}"#);
    }

    #[tokio::test]
    async fn dropped_transaction_resets_before_next() {
        let bus = FakeBus::answering(|line| format!(r#"{{"echo":{line}}}"#));
        let state = bus.state.clone();
        // Hold the first reply back until the caller has given up on it.
        state.lock().delay_polls = usize::MAX;
        let mut channel = channel(bus);

        let abandoned = time::timeout(
            Duration::from_millis(20),
            channel.transact(br#"{"req":"first"}"#),
        )
        .await;
        assert!(abandoned.is_err());
        {
            // The late reply shows up after the caller is gone.
            let mut state = state.lock();
            let late = state.hidden.take().unwrap();
            state.outgoing.extend(late);
            state.delay_polls = 0;
        }

        let reply = channel.transact(br#"{"req":"second"}"#).await.unwrap();

        assert_eq!(&reply[..], br#"{"echo":{"req":"second"}}"#);
    }

    #[tokio::test]
    async fn closed_channel_rejects_transactions() {
        let mut channel = channel(FakeBus::default());
        channel.close().await.unwrap();

        let err = channel.transact(br#"{"req":"card.status"}"#).await.unwrap_err();

        assert!(matches!(err, DeviceError::Closed));
    }
}
