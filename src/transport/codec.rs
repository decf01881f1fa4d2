//! NDJSON codec for droid FIFO streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so an
//! unterminated or oversized line from a misbehaving daemon cannot exhaust
//! memory.
//!
//! # Usage
//!
//! Use [`DroidCodec`] with [`tokio_util::codec::FramedRead`] for the
//! response FIFO and [`tokio_util::codec::FramedWrite`] for the request FIFO.
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use droid_swarm::transport::codec::DroidCodec;
//!
//! let lines = FramedRead::new(response_fifo, DroidCodec::new());
//! ```

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum inbound line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without its terminator.
    Line(String),
    /// A line exceeded the length limit and is being discarded.
    Oversized,
}

/// Newline-delimited JSON codec.
///
/// # Decoder
///
/// Lines longer than the limit yield [`Frame::Oversized`] rather than an
/// error, because [`tokio_util::codec::FramedRead`] ends the stream after a
/// decoder error. The rest of the oversized line is discarded up to the next
/// newline. I/O errors map to [`AppError::Io`].
///
/// # Encoder
///
/// Strings are written as `item\n`. The length limit is not enforced on
/// outbound lines.
#[derive(Debug)]
pub struct DroidCodec(LinesCodec);

impl DroidCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max))
    }
}

impl Default for DroidCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DroidCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        into_frame(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        into_frame(self.0.decode_eof(src))
    }
}

impl Encoder<String> for DroidCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        let max = self.0.max_length();
        self.0.encode(item, dst).map_err(|e| map_codec_error(e, max))
    }
}

fn into_frame(
    decoded: std::result::Result<Option<String>, LinesCodecError>,
) -> Result<Option<Frame>> {
    match decoded {
        Ok(line) => Ok(line.map(Frame::Line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
        Err(LinesCodecError::Io(io_err)) => Err(AppError::Io(io_err.to_string())),
    }
}

fn map_codec_error(e: LinesCodecError, max: usize) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::ProtocolViolation(format!("line too long: exceeded {max} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
