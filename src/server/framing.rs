//! Client frame codec.
//!
//! One codec type covers all three [`FrameMode`]s so the connection handler
//! can run a single `Framed` loop regardless of how clients delimit their
//! requests. Decoded frames have their padding removed; empty frames are
//! passed through and left for the handler to skip.
//!
//! Padded frames are fixed-size: a read of `max_frame_len` bytes or more is
//! cut at exactly `max_frame_len`, a shorter read is taken whole.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::length_delimited::LengthDelimitedCodecError;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{BridgeError, FrameMode};

const LENGTH_FIELD_LEN: usize = 4;

/// Decoder/encoder for request and response frames.
#[derive(Debug)]
pub struct FrameCodec {
    mode: FrameMode,
    max_frame_len: usize,

    // Line mode: bytes already scanned for a newline.
    next_index: usize,

    // Length-prefixed mode only.
    length: LengthDelimitedCodec,
}

impl FrameCodec {
    // ---
    pub fn new(mode: FrameMode, max_frame_len: usize) -> Self {
        // ---
        let length = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(LENGTH_FIELD_LEN)
            .max_frame_length(max_frame_len)
            .new_codec();

        Self {
            mode,
            max_frame_len,
            next_index: 0,
            length,
        }
    }

    fn decode_line(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, BridgeError> {
        // ---
        let newline = src[self.next_index..].iter().position(|b| *b == b'\n');

        match newline {
            Some(offset) => {
                let end = self.next_index + offset;
                self.next_index = 0;

                let mut line = src.split_to(end + 1);
                line.truncate(end);

                if line.len() > self.max_frame_len {
                    return Err(BridgeError::FrameTooLarge {
                        max: self.max_frame_len,
                    });
                }
                Ok(Some(trim_line(line.freeze())))
            }
            None if src.len() > self.max_frame_len => Err(BridgeError::FrameTooLarge {
                max: self.max_frame_len,
            }),
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_padded(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, BridgeError> {
        // ---
        if src.is_empty() {
            return Ok(None);
        }

        // A full buffer holds exactly one request; anything past it belongs
        // to the next request a legacy client sent without waiting.
        let frame = if src.len() >= self.max_frame_len {
            src.split_to(self.max_frame_len)
        } else {
            src.split()
        };
        Ok(Some(trim_nul(frame.freeze())))
    }

    fn decode_length(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, BridgeError> {
        // ---
        match self.length.decode(src) {
            Ok(frame) => Ok(frame.map(BytesMut::freeze)),
            Err(err) => Err(self.map_length_error(err)),
        }
    }

    fn map_length_error(&self, err: std::io::Error) -> BridgeError {
        // ---
        let too_large = err
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());

        if too_large {
            BridgeError::FrameTooLarge {
                max: self.max_frame_len,
            }
        } else {
            BridgeError::Connection(err)
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, BridgeError> {
        // ---
        match self.mode {
            FrameMode::Line => self.decode_line(src),
            FrameMode::LengthPrefixed => self.decode_length(src),
            FrameMode::Padded => self.decode_padded(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, BridgeError> {
        // ---
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        // A client that half-closes after an unterminated line still gets
        // that line treated as its last request.
        if self.mode == FrameMode::Line && !src.is_empty() {
            self.next_index = 0;
            let rest = src.split().freeze();
            return Ok(Some(trim_line(rest)));
        }

        if src.is_empty() {
            Ok(None)
        } else {
            Err(BridgeError::Connection(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )))
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = BridgeError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), BridgeError> {
        // ---
        match self.mode {
            FrameMode::LengthPrefixed => {
                let len = u32::try_from(payload.len()).map_err(|_| BridgeError::FrameTooLarge {
                    max: u32::MAX as usize,
                })?;
                dst.reserve(LENGTH_FIELD_LEN + payload.len());
                dst.put_u32(len);
                dst.extend_from_slice(&payload);
            }
            FrameMode::Line | FrameMode::Padded => {
                dst.reserve(payload.len() + 1);
                dst.extend_from_slice(&payload);
                dst.put_u8(b'\n');
            }
        }
        Ok(())
    }
}

/// Strip a trailing `\r` and NUL padding from a line.
fn trim_line(line: Bytes) -> Bytes {
    // ---
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | 0) {
        end -= 1;
    }
    line.slice(..end)
}

/// Strip leading and trailing NUL padding.
fn trim_nul(frame: Bytes) -> Bytes {
    // ---
    let start = frame.iter().position(|b| *b != 0).unwrap_or(frame.len());
    let end = frame.iter().rposition(|b| *b != 0).map_or(start, |i| i + 1);
    frame.slice(start..end)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn decode_all(codec: &mut FrameCodec, input: &[u8]) -> Vec<Bytes> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_line_frames_split_and_trimmed() {
        // ---
        let mut codec = FrameCodec::new(FrameMode::Line, 1024);
        let frames = decode_all(&mut codec, b"PING\r\nPONG\0\0\n\npartial");

        assert_eq!(frames, vec![
            Bytes::from_static(b"PING"),
            Bytes::from_static(b"PONG"),
            Bytes::new(),
        ]);
    }

    #[test]
    fn test_line_waits_for_newline_across_reads() {
        // ---
        let mut codec = FrameCodec::new(FrameMode::Line, 1024);
        let mut buf = BytesMut::from(&b"{\"amo"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"unt\":1}\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"{\"amount\":1}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_eof_flushes_unterminated_request() {
        // ---
        let mut codec = FrameCodec::new(FrameMode::Line, 1024);
        let mut buf = BytesMut::from(&b"last"[..]);
        let frame = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"last");
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_line_too_long_rejected() {
        // ---
        let mut codec = FrameCodec::new(FrameMode::Line, 8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(BridgeError::FrameTooLarge { max: 8 })
        ));
    }

    #[test]
    fn test_padded_read_is_one_frame() {
        // ---
        let mut codec = FrameCodec::new(FrameMode::Padded, 1024);
        let mut input = b"PING".to_vec();
        input.resize(1024, 0);

        let frames = decode_all(&mut codec, &input);
        assert_eq!(frames, vec![Bytes::from_static(b"PING")]);
    }

    #[test]
    fn test_padded_back_to_back_frames_split_at_frame_length() {
        // ---
        let mut codec = FrameCodec::new(FrameMode::Padded, 16);
        let mut input = b"ONE".to_vec();
        input.resize(16, 0);
        input.extend_from_slice(b"TWO");
        input.resize(32, 0);

        let frames = decode_all(&mut codec, &input);
        assert_eq!(frames, vec![Bytes::from_static(b"ONE"), Bytes::from_static(b"TWO")]);
    }

    #[test]
    fn test_length_prefixed_binary_payload() {
        // ---
        let mut codec = FrameCodec::new(FrameMode::LengthPrefixed, 1024);
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"a\nb\0c"), &mut buf)
            .unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 5]);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"a\nb\0c");
    }

    #[test]
    fn test_length_prefixed_oversize_rejected() {
        // ---
        let mut codec = FrameCodec::new(FrameMode::LengthPrefixed, 16);
        let mut buf = BytesMut::new();
        buf.put_u32(1000);
        buf.extend_from_slice(b"xx");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(BridgeError::FrameTooLarge { max: 16 })
        ));
    }

    #[test]
    fn test_line_response_newline_terminated() {
        // ---
        let mut codec = FrameCodec::new(FrameMode::Padded, 1024);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"PONG"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PONG\n");
    }
}
