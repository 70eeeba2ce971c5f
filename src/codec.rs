//! Text framing for session event streams.
//!
//! Each event is a block of `field: value` lines closed by a blank line:
//!
//! ```text
//! id: 42
//! event: data
//! data: first line
//! data: second line
//!
//! ```
//!
//! Lines starting with `:` are comments. A block made only of comments is a
//! keep-alive; it carries no event but still counts as inbound activity for
//! the heartbeat monitor. Unknown fields are ignored.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::event::{Event, EventId, EventKind};

pub mod error;

pub use error::{CodecError, FramingError, ProtocolError};

/// Smallest accepted maximum block length.
pub const MIN_FRAME_LENGTH: usize = 256;

/// Largest accepted maximum block length (16 MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Default maximum block length (64 KiB).
pub const DEFAULT_FRAME_LENGTH: usize = 64 * 1024;

pub(crate) fn clamp_frame_length(value: usize) -> usize {
    value.clamp(MIN_FRAME_LENGTH, MAX_FRAME_LENGTH)
}

/// Unit produced by the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete event.
    Event(Event),
    /// A comment-only block used to signal liveness.
    KeepAlive,
}

impl From<Event> for Frame {
    fn from(event: Event) -> Self { Self::Event(event) }
}

/// Codec for the text event stream.
#[derive(Clone, Debug)]
pub struct EventStreamCodec {
    max_frame_length: usize,
}

impl Default for EventStreamCodec {
    fn default() -> Self { Self::new(DEFAULT_FRAME_LENGTH) }
}

impl EventStreamCodec {
    /// Construct a codec accepting blocks up to `max_frame_length` bytes.
    ///
    /// The limit is clamped to [`MIN_FRAME_LENGTH`]..=[`MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: clamp_frame_length(max_frame_length),
        }
    }

    /// Maximum block length this codec accepts.
    #[must_use]
    pub fn max_frame_length(&self) -> usize { self.max_frame_length }
}

/// Locate the blank line closing the first block in `buf`.
///
/// Returns the length of the block body and the number of bytes to consume
/// including the terminator.
fn find_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    for (i, byte) in buf.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &buf[line_start..i];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return Some((line_start, i + 1));
        }
        line_start = i + 1;
    }
    None
}

fn parse_block(text: &str) -> Result<Option<Frame>, ProtocolError> {
    let mut id = None;
    let mut kind = None;
    let mut data: Option<String> = None;
    let mut saw_comment = false;
    let mut saw_field = false;

    // `data` values keep a trailing `\r`; only the other fields accept CRLF.
    for raw in text.split_terminator('\n') {
        if raw.starts_with(':') {
            saw_comment = true;
            continue;
        }
        let (field, value) = match raw.split_once(':') {
            Some(("data", value)) => ("data", value.strip_prefix(' ').unwrap_or(value)),
            Some((field, value)) => {
                let value = value.strip_suffix('\r').unwrap_or(value);
                (field, value.strip_prefix(' ').unwrap_or(value))
            }
            None => (raw.strip_suffix('\r').unwrap_or(raw), ""),
        };
        match field {
            "id" => id = Some(EventId::from(value)),
            "event" => kind = Some(value.parse::<EventKind>()?),
            "data" => match data.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(value);
                }
                None => data = Some(value.to_owned()),
            },
            _ => continue,
        }
        saw_field = true;
    }

    if !saw_field {
        return Ok(saw_comment.then_some(Frame::KeepAlive));
    }
    let id = id.ok_or(ProtocolError::MissingId)?;
    Ok(Some(Frame::Event(Event {
        id,
        kind: kind.unwrap_or(EventKind::Data),
        payload: data.unwrap_or_default(),
    })))
}

impl Decoder for EventStreamCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some((body_len, consumed)) = find_block_end(src) else {
                if src.len() > self.max_frame_length {
                    return Err(FramingError::OversizedFrame {
                        size: src.len(),
                        max: self.max_frame_length,
                    }
                    .into());
                }
                return Ok(None);
            };
            if body_len > self.max_frame_length {
                return Err(FramingError::OversizedFrame {
                    size: body_len,
                    max: self.max_frame_length,
                }
                .into());
            }
            let block = src.split_to(consumed);
            let text =
                std::str::from_utf8(&block[..body_len]).map_err(|_| FramingError::InvalidUtf8)?;
            if let Some(frame) = parse_block(text)? {
                return Ok(Some(frame));
            }
        }
    }
}

impl Encoder<Frame> for EventStreamCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::KeepAlive => dst.put_slice(b":\n\n"),
            Frame::Event(event) => encode_event(&event, self.max_frame_length, dst)?,
        }
        Ok(())
    }
}

impl Encoder<Event> for EventStreamCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Event, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_event(&item, self.max_frame_length, dst)
    }
}

/// Bytes `event` occupies on the wire, not counting the closing blank line.
///
/// This is the length the decoder compares against its limit.
fn block_len(event: &Event) -> usize {
    let data: usize = if event.payload.is_empty() {
        0
    } else {
        event
            .payload
            .split('\n')
            .map(|line| "data: ".len() + line.len() + 1)
            .sum()
    };
    "id: ".len() + event.id.as_str().len() + "\nevent: ".len() + event.kind.as_str().len() + 1 + data
}

fn encode_event(event: &Event, max: usize, dst: &mut BytesMut) -> Result<(), CodecError> {
    let id = event.id.as_str();
    if id.contains(['\n', '\r']) {
        return Err(ProtocolError::UnframeableId(id.to_owned()).into());
    }
    let size = block_len(event);
    if size > max {
        return Err(FramingError::OversizedFrame { size, max }.into());
    }
    dst.reserve(size + 1);
    dst.put_slice(b"id: ");
    dst.put_slice(id.as_bytes());
    dst.put_slice(b"\nevent: ");
    dst.put_slice(event.kind.as_str().as_bytes());
    dst.put_u8(b'\n');
    if !event.payload.is_empty() {
        for line in event.payload.split('\n') {
            dst.put_slice(b"data: ");
            dst.put_slice(line.as_bytes());
            dst.put_u8(b'\n');
        }
    }
    dst.put_u8(b'\n');
    Ok(())
}
