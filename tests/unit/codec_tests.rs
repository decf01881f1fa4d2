//! Unit tests for the NDJSON line codec.
//!
//! Covers:
//! - complete, batched and partial lines
//! - the 1 MiB line limit and recovery after an oversized line
//! - blank lines and a final unterminated line at EOF

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use droid_swarm::transport::codec::{DroidCodec, Frame, MAX_LINE_BYTES};

// ── Framing ─────────────────────────────────────────────────────────────────

/// A newline-terminated object is returned without its terminator.
#[test]
fn single_line_is_decoded() {
    let mut codec = DroidCodec::new();
    let mut buf = BytesMut::from("{\"id\":\"req-1\",\"result\":{}}\n");

    let frame = codec.decode(&mut buf).expect("decode must succeed");
    assert_eq!(
        frame,
        Some(Frame::Line("{\"id\":\"req-1\",\"result\":{}}".to_owned()))
    );
}

/// Two lines in one buffer come out as two frames.
#[test]
fn batched_lines_are_split() {
    let mut codec = DroidCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\n{\"b\":2}\n");

    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some(Frame::Line("{\"a\":1}".into()))
    );
    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some(Frame::Line("{\"b\":2}".into()))
    );
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}

/// A fragment without a newline is held back until the rest arrives.
#[test]
fn partial_line_is_buffered() {
    let mut codec = DroidCodec::new();
    let mut buf = BytesMut::from("{\"id\":");
    assert_eq!(codec.decode(&mut buf).unwrap(), None);

    buf.extend_from_slice(b"\"req-9\"}\n");
    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        Some(Frame::Line("{\"id\":\"req-9\"}".into()))
    );
}

/// An empty line decodes as an empty frame; classification skips it later.
#[test]
fn blank_line_is_an_empty_frame() {
    let mut codec = DroidCodec::new();
    let mut buf = BytesMut::from("\n");
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Line(String::new())));
}

/// At EOF an unterminated trailing line is still delivered.
#[test]
fn unterminated_line_is_flushed_at_eof() {
    let mut codec = DroidCodec::new();
    let mut buf = BytesMut::from("{\"tail\":true}");
    assert_eq!(
        codec.decode_eof(&mut buf).unwrap(),
        Some(Frame::Line("{\"tail\":true}".into()))
    );
}

// ── Line limit ──────────────────────────────────────────────────────────────

/// A line over the limit is reported as oversized instead of failing the
/// stream, and the next line decodes normally.
#[test]
fn oversized_line_is_reported_and_skipped() {
    let mut codec = DroidCodec::with_max_length(16);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[b'x'; 40]);
    buf.extend_from_slice(b"\n{\"ok\":1}\n");

    assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Oversized));

    let mut next = codec.decode(&mut buf).unwrap();
    while next == Some(Frame::Oversized) {
        next = codec.decode(&mut buf).unwrap();
    }
    assert_eq!(next, Some(Frame::Line("{\"ok\":1}".into())));
}

/// The default limit is 1 MiB.
#[test]
fn default_limit_is_one_mebibyte() {
    assert_eq!(MAX_LINE_BYTES, 1024 * 1024);

    let mut codec = DroidCodec::default();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&vec![b'a'; MAX_LINE_BYTES]);
    buf.extend_from_slice(b"\n");
    assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Frame::Line(line)) if line.len() == MAX_LINE_BYTES));
}

// ── Encoding ────────────────────────────────────────────────────────────────

/// Outbound strings gain exactly one trailing newline.
#[test]
fn encoder_appends_newline() {
    let mut codec = DroidCodec::new();
    let mut dst = BytesMut::new();
    codec.encode("{\"id\":\"req-1\"}".to_owned(), &mut dst).unwrap();
    assert_eq!(&dst[..], b"{\"id\":\"req-1\"}\n");
}
