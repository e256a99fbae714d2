//! Notecard over a serial port.
//!
//! Requests are written as a single line, split per [`SegmentPolicy`]; the
//! reply is the next non-blank line. After any failed transaction the line is
//! reset before the next request so a late or partial reply can't be taken
//! for the answer to a new one. A transaction dropped before it finished
//! counts as failed.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{self, Instant};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;

use super::{
    codec::{self, ResponseCodec},
    DeviceChannel, SegmentPolicy, EMPTY_REPLY,
};
use crate::{error::DeviceError, tracing::prelude::*};

/// How long the line must stay quiet before a reset is considered done.
const RESET_QUIET: Duration = Duration::from_millis(250);

/// Upper bound on draining a chattering line during reset.
const RESET_LIMIT: Duration = Duration::from_secs(2);

/// Open `path` at `baud` and reset the line.
pub async fn open_serial(
    path: &str,
    baud: u32,
    timeout: Duration,
) -> Result<SerialChannel<SerialStream>, DeviceError> {
    let open_error = |source: io::Error| DeviceError::Open {
        path: path.into(),
        source,
    };

    let stream = tokio_serial::new(path, baud)
        .open_native_async()
        .map_err(|e| open_error(e.into()))?;
    debug!(port = path, baud, "Opened serial port");

    let mut channel = SerialChannel::new(stream, SegmentPolicy::SERIAL, timeout);
    channel.reset().await.map_err(|e| match e {
        DeviceError::Io(source) => open_error(source),
        other => other,
    })?;
    Ok(channel)
}

struct Link<S> {
    reader: FramedRead<ReadHalf<S>, ResponseCodec>,
    writer: WriteHalf<S>,
}

/// Notecard transport over any byte stream, normally a [`SerialStream`].
pub struct SerialChannel<S> {
    link: Option<Link<S>>,
    segments: SegmentPolicy,
    timeout: Duration,
    needs_reset: bool,
}

impl<S: AsyncRead + AsyncWrite + Send> SerialChannel<S> {
    pub fn new(stream: S, segments: SegmentPolicy, timeout: Duration) -> Self {
        let (reader, writer) = io::split(stream);
        Self {
            link: Some(Link {
                reader: FramedRead::new(reader, ResponseCodec::default()),
                writer,
            }),
            segments,
            timeout,
            needs_reset: false,
        }
    }

    fn link(&mut self) -> Result<&mut Link<S>, DeviceError> {
        self.link.as_mut().ok_or(DeviceError::Closed)
    }

    /// Terminate any partial request the Notecard holds and discard
    /// whatever it had queued for us.
    pub async fn reset(&mut self) -> Result<(), DeviceError> {
        // After a decode error FramedRead reports end-of-stream once before
        // reading again, so drain through a fresh one.
        let Link { reader, writer } = self.link.take().ok_or(DeviceError::Closed)?;
        let link = self.link.insert(Link {
            reader: FramedRead::new(reader.into_inner(), ResponseCodec::default()),
            writer,
        });
        link.writer.write_all(b"\n").await?;
        link.writer.flush().await?;

        let deadline = Instant::now() + RESET_LIMIT;
        while Instant::now() < deadline {
            match time::timeout(RESET_QUIET, link.reader.next()).await {
                Err(_) => break,
                Ok(Some(Ok(line))) => {
                    trace!(len = line.len(), "Discarded stale line during reset");
                }
                Ok(Some(Err(e))) => {
                    trace!(error = %e, "Discarded unreadable input during reset");
                }
                Ok(None) => {
                    return Err(DeviceError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    )));
                }
            }
        }

        *link.reader.decoder_mut() = ResponseCodec::default();
        link.reader.read_buffer_mut().clear();
        self.needs_reset = false;
        Ok(())
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Bytes, DeviceError> {
        let segments = self.segments;
        let timeout = self.timeout;
        let link = self.link()?;

        let line = codec::frame_request(request);
        for (i, segment) in line.chunks(segments.max_len.max(1)).enumerate() {
            if i > 0 {
                time::sleep(segments.delay).await;
            }
            link.writer.write_all(segment).await?;
        }
        link.writer.flush().await?;

        if !codec::expects_reply(request) {
            return Ok(Bytes::from_static(EMPTY_REPLY));
        }

        match time::timeout(timeout, link.reader.next()).await {
            Err(_) => Err(DeviceError::Timeout(timeout)),
            Ok(Some(Ok(reply))) => Ok(reply),
            Ok(Some(Err(e))) => Err(codec::into_device_error(e)),
            Ok(None) => Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "serial port closed",
            ))),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send> DeviceChannel for SerialChannel<S> {
    async fn transact(&mut self, request: &[u8]) -> Result<Bytes, DeviceError> {
        if self.needs_reset {
            debug!("Resetting serial line after failed transaction");
            self.reset().await?;
        }

        // Stays set if this future is dropped mid-exchange.
        self.needs_reset = true;
        let reply = self.exchange(request).await?;
        self.needs_reset = false;
        Ok(reply)
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(mut link) = self.link.take() {
            link.writer.shutdown().await?;
            debug!("Closed serial port");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn small_segments() -> SegmentPolicy {
        SegmentPolicy {
            max_len: 8,
            delay: Duration::from_millis(1),
        }
    }

    fn pair() -> (SerialChannel<DuplexStream>, BufReader<DuplexStream>) {
        let (ours, theirs) = io::duplex(4096);
        (
            SerialChannel::new(ours, small_segments(), TIMEOUT),
            BufReader::new(theirs),
        )
    }

    async fn read_line(device: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        device.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn transaction_returns_reply_line() {
        let (mut channel, mut device) = pair();

        let notecard = tokio::spawn(async move {
            let line = read_line(&mut device).await;
            device
                .get_mut()
                .write_all(b"{\"status\":\"{normal}\"}\r\n")
                .await
                .unwrap();
            line
        });

        let reply = channel.transact(br#"{"req":"card.status"}"#).await.unwrap();
        assert_eq!(&reply[..], br#"{"status":"{normal}"}"#);
        assert_eq!(notecard.await.unwrap(), "{\"req\":\"card.status\"}\n");
    }

    #[tokio::test]
    async fn segmented_request_arrives_intact() {
        let (mut channel, mut device) = pair();
        let request = br#"{"req":"note.add","body":{"temp":21.5,"id":1234567890123456789}}"#;

        let notecard = tokio::spawn(async move {
            let line = read_line(&mut device).await;
            device.get_mut().write_all(b"{}\r\n").await.unwrap();
            line
        });

        channel.transact(request).await.unwrap();
        let received = notecard.await.unwrap();
        assert_eq!(received.trim_end().as_bytes(), &request[..]);
    }

    #[tokio::test]
    async fn cmd_request_does_not_wait_for_reply() {
        let (mut channel, mut device) = pair();

        let reply = channel.transact(br#"{"cmd":"card.attn"}"#).await.unwrap();

        assert_eq!(&reply[..], EMPTY_REPLY);
        assert_eq!(read_line(&mut device).await, "{\"cmd\":\"card.attn\"}\n");
    }

    #[tokio::test]
    async fn silent_device_times_out_and_line_is_reset() {
        let (ours, theirs) = io::duplex(4096);
        let mut channel =
            SerialChannel::new(ours, small_segments(), Duration::from_millis(50));
        let mut device = BufReader::new(theirs);

        let err = channel.transact(br#"{"req":"card.time"}"#).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
        assert_eq!(read_line(&mut device).await, "{\"req\":\"card.time\"}\n");

        // The late reply to the first request must not answer the second.
        device.get_mut().write_all(b"{\"time\":1}\r\n").await.unwrap();

        let notecard = tokio::spawn(async move {
            assert_eq!(read_line(&mut device).await, "\n");
            let line = read_line(&mut device).await;
            device.get_mut().write_all(b"{\"version\":\"9\"}\r\n").await.unwrap();
            line
        });

        let reply = channel.transact(br#"{"req":"card.version"}"#).await.unwrap();
        assert_eq!(&reply[..], br#"{"version":"9"}"#);
        assert_eq!(notecard.await.unwrap(), "{\"req\":\"card.version\"}\n");
    }

    #[tokio::test]
    async fn reset_discards_stale_input() {
        let (mut channel, mut device) = pair();
        device.get_mut().write_all(b"{\"stale\":true}\r\npartial").await.unwrap();

        channel.reset().await.unwrap();
        assert_eq!(read_line(&mut device).await, "\n");

        let notecard = tokio::spawn(async move {
            read_line(&mut device).await;
            device.get_mut().write_all(b"{\"fresh\":true}\r\n").await.unwrap();
        });
        let reply = channel.transact(br#"{"req":"card.status"}"#).await.unwrap();
        assert_eq!(&reply[..], br#"{"fresh":true}"#);
        notecard.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transaction_resets_before_next() {
        let (mut channel, mut device) = pair();

        let abandoned = time::timeout(
            Duration::from_millis(50),
            channel.transact(br#"{"req":"first"}"#),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(read_line(&mut device).await, "{\"req\":\"first\"}\n");
        device.get_mut().write_all(b"{\"answer\":\"first\"}\r\n").await.unwrap();

        let notecard = tokio::spawn(async move {
            assert_eq!(read_line(&mut device).await, "\n");
            let line = read_line(&mut device).await;
            device.get_mut().write_all(b"{\"answer\":\"second\"}\r\n").await.unwrap();
            line
        });

        let reply = channel.transact(br#"{"req":"second"}"#).await.unwrap();
        assert_eq!(&reply[..], br#"{"answer":"second"}"#);
        assert_eq!(notecard.await.unwrap(), "{\"req\":\"second\"}\n");
    }

    #[tokio::test]
    async fn oversized_reply_does_not_spoil_next_transaction() {
        let (mut channel, mut device) = pair();

        let notecard = tokio::spawn(async move {
            read_line(&mut device).await;
            let flood = vec![b'x'; codec::MAX_RESPONSE_LEN + 1];
            device.get_mut().write_all(&flood).await.unwrap();
            assert_eq!(read_line(&mut device).await, "\n");
            let line = read_line(&mut device).await;
            device.get_mut().write_all(b"{\"ok\":true}\r\n").await.unwrap();
            line
        });

        let err = channel.transact(br#"{"req":"note.get"}"#).await.unwrap_err();
        assert!(matches!(err, DeviceError::ResponseTooLong(_)), "{err}");

        let reply = channel.transact(br#"{"req":"card.status"}"#).await.unwrap();
        assert_eq!(&reply[..], br#"{"ok":true}"#);
        assert_eq!(notecard.await.unwrap(), "{\"req\":\"card.status\"}\n");
    }

    #[tokio::test]
    async fn closed_channel_rejects_transactions() {
        let (mut channel, _device) = pair();
        channel.close().await.unwrap();
        channel.close().await.unwrap();

        let err = channel.transact(br#"{"req":"card.status"}"#).await.unwrap_err();
        assert!(matches!(err, DeviceError::Closed));
    }

    #[tokio::test]
    async fn missing_port_is_an_open_error() {
        let err = open_serial("/dev/does-not-exist-notecard", 9600, TIMEOUT)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::Open { .. }), "{err}");
    }
}
