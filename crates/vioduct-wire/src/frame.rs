//! Slot-tagged framing for the shared byte stream.
//!
//! Every byte on the link belongs to exactly one frame: a 4-byte header
//! (stream id, then payload length, both little-endian u16) followed by the
//! payload. A zero-length frame signals half-close for its stream.

use thiserror::Error;

/// Size of the frame header: stream id + payload length.
pub const HEADER_SIZE: usize = 4;

/// Default per-frame payload cap. Both ends of a link must agree on it.
pub const DEFAULT_FRAME_CAP: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Encode-side: the caller handed more payload than fits one frame.
    #[error("payload of {len} bytes exceeds the {cap}-byte frame cap")]
    PayloadTooLarge { len: usize, cap: usize },
    /// Decode-side: a header announced more than the cap. There is no
    /// resynchronisation point in the stream, so the link is unusable.
    #[error("frame header announces {len} bytes, cap is {cap}")]
    OversizedFrame { len: usize, cap: usize },
}

/// Append one `(slot, payload)` frame to `buf`.
///
/// The header and payload are emitted together; a single call never
/// fragments across frames.
pub fn encode_into(
    buf: &mut Vec<u8>,
    slot: u16,
    payload: &[u8],
    cap: usize,
) -> Result<(), WireError> {
    if payload.len() > cap {
        return Err(WireError::PayloadTooLarge { len: payload.len(), cap });
    }
    buf.extend_from_slice(&slot.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(())
}

/// Pull-style frame reassembler.
///
/// Feed it chunks as they come off the stream; [`next_frame`] yields one
/// complete frame at a time and `None` while the buffered bytes stop short
/// of a full frame. Frames may be split at any byte boundary across any
/// number of chunks, and one chunk may carry several frames.
///
/// [`next_frame`]: FrameDecoder::next_frame
pub struct FrameDecoder {
    cap: usize,
    buf: Vec<u8>,
    consumed: usize,
}

impl FrameDecoder {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            buf: Vec::with_capacity(HEADER_SIZE + cap),
            consumed: 0,
        }
    }

    /// Buffer another chunk read off the stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.consumed > 0 {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// The next complete frame, or `None` until more bytes arrive.
    ///
    /// The yielded payload borrow ends before the next call; the bytes are
    /// only valid for one delivery.
    pub fn next_frame(&mut self) -> Result<Option<(u16, &[u8])>, WireError> {
        let avail = &self.buf[self.consumed..];
        if avail.len() < HEADER_SIZE {
            return Ok(None);
        }
        let slot = u16::from_le_bytes([avail[0], avail[1]]);
        let len = usize::from(u16::from_le_bytes([avail[2], avail[3]]));
        if len > self.cap {
            return Err(WireError::OversizedFrame { len, cap: self.cap });
        }
        if avail.len() < HEADER_SIZE + len {
            return Ok(None);
        }
        let start = self.consumed + HEADER_SIZE;
        self.consumed = start + len;
        Ok(Some((slot, &self.buf[start..start + len])))
    }

    /// Bytes buffered but not yet yielded as part of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.consumed
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn encode(slot: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_into(&mut buf, slot, payload, DEFAULT_FRAME_CAP).unwrap();
        buf
    }

    /// Run a byte stream through a decoder in one go.
    fn decode_all(stream: &[u8]) -> Vec<(u16, Vec<u8>)> {
        let mut decoder = FrameDecoder::new(DEFAULT_FRAME_CAP);
        decoder.feed(stream);
        let mut frames = Vec::new();
        while let Some((slot, payload)) = decoder.next_frame().unwrap() {
            frames.push((slot, payload.to_vec()));
        }
        frames
    }

    #[test]
    fn roundtrip() {
        let frames = decode_all(&encode(7, b"hello"));
        assert_eq!(frames, vec![(7, b"hello".to_vec())]);
    }

    #[test]
    fn roundtrip_zero_length() {
        let frames = decode_all(&encode(63, &[]));
        assert_eq!(frames, vec![(63, Vec::new())]);
    }

    #[test]
    fn roundtrip_max_payload() {
        let payload = vec![0xa5; DEFAULT_FRAME_CAP];
        let frames = decode_all(&encode(0, &payload));
        assert_eq!(frames, vec![(0, payload)]);
    }

    #[test]
    fn encode_rejects_payload_over_cap() {
        let mut buf = Vec::new();
        let payload = vec![0; DEFAULT_FRAME_CAP + 1];
        let err = encode_into(&mut buf, 0, &payload, DEFAULT_FRAME_CAP).unwrap_err();
        assert_eq!(
            err,
            WireError::PayloadTooLarge { len: DEFAULT_FRAME_CAP + 1, cap: DEFAULT_FRAME_CAP }
        );
        assert!(buf.is_empty(), "rejected frame must not leak bytes");
    }

    #[test]
    fn decoder_rejects_header_over_cap() {
        let mut decoder = FrameDecoder::new(16);
        decoder.feed(&[0x00, 0x00, 0x11, 0x00]);
        let err = decoder.next_frame().unwrap_err();
        assert_eq!(err, WireError::OversizedFrame { len: 17, cap: 16 });
    }

    #[test]
    fn header_fields_are_little_endian() {
        let bytes = encode(0x0201, b"x");
        assert_eq!(&bytes[..4], &[0x01, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn two_frames_in_one_chunk() {
        let mut stream = encode(1, b"first");
        stream.extend_from_slice(&encode(2, b"second"));
        let frames = decode_all(&stream);
        assert_eq!(frames, vec![(1, b"first".to_vec()), (2, b"second".to_vec())]);
    }

    #[test]
    fn one_byte_at_a_time() {
        let mut stream = encode(3, b"abcdef");
        stream.extend_from_slice(&encode(7, b"PONG"));

        let mut decoder = FrameDecoder::new(DEFAULT_FRAME_CAP);
        let mut frames = Vec::new();
        for &byte in &stream {
            decoder.feed(&[byte]);
            while let Some((slot, payload)) = decoder.next_frame().unwrap() {
                frames.push((slot, payload.to_vec()));
            }
        }
        assert_eq!(frames, vec![(3, b"abcdef".to_vec()), (7, b"PONG".to_vec())]);
    }

    #[test]
    fn split_inside_header() {
        let stream = encode(0x1234, b"payload");
        let mut decoder = FrameDecoder::new(DEFAULT_FRAME_CAP);
        decoder.feed(&stream[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.feed(&stream[3..]);
        assert_eq!(decoder.next_frame().unwrap(), Some((0x1234, &b"payload"[..])));
    }

    /// Any chunking of a valid stream yields the same frame sequence as a
    /// single-shot decode.
    #[test]
    fn fragmentation_invariance() {
        let mut rng = rand::rng();
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for i in 0..24_u16 {
            let len = rng.random_range(0..=DEFAULT_FRAME_CAP);
            let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            stream.extend_from_slice(&encode(i % 64, &payload));
            expected.push((i % 64, payload));
        }
        assert_eq!(decode_all(&stream), expected);

        for _ in 0..50 {
            let mut decoder = FrameDecoder::new(DEFAULT_FRAME_CAP);
            let mut frames = Vec::new();
            let mut offset = 0;
            while offset < stream.len() {
                let chunk = rng.random_range(1..=stream.len() - offset);
                decoder.feed(&stream[offset..offset + chunk]);
                offset += chunk;
                while let Some((slot, payload)) = decoder.next_frame().unwrap() {
                    frames.push((slot, payload.to_vec()));
                }
            }
            assert_eq!(frames, expected);
            assert_eq!(decoder.pending(), 0);
        }
    }
}
