//! Incremental frame encoding and write batching
//!
//! [`encode_frame`] writes one frame's wire bytes; [`Serializer`] layers a
//! size-bounded batch buffer on top so the writer can pipeline several
//! queued frames into a single transport write.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{Frame, OpCode};
use crate::mask::{apply_mask, generate_mask};
use crate::{MEDIUM_PAYLOAD_THRESHOLD, SMALL_PAYLOAD_THRESHOLD};

/// Wire size of a frame: header plus payload
#[inline]
pub fn frame_len(payload_len: usize, masked: bool) -> usize {
    let ext = if payload_len > MEDIUM_PAYLOAD_THRESHOLD {
        8
    } else if payload_len > SMALL_PAYLOAD_THRESHOLD {
        2
    } else {
        0
    };
    2 + ext + if masked { 4 } else { 0 } + payload_len
}

/// Encode a frame into a buffer
///
/// When a mask key is given the payload is XORed in the output copy; the
/// caller's payload is never mutated, so the same `Frame` can be logged
/// or retransmitted afterwards.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();
    buf.reserve(frame_len(payload_len, mask.is_some()));

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len <= SMALL_PAYLOAD_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_PAYLOAD_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(key) = mask {
        buf.put_slice(&key);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], key);
    } else {
        buf.put_slice(payload);
    }
}

/// Batching frame encoder with a size-bounded output buffer
///
/// Frames accumulate until the next one would push the buffer past its
/// bound; the writer then issues one transport write for the whole batch.
/// A single frame larger than the bound is still accepted when the buffer
/// is empty (the bound batches small frames, it is not a frame size
/// limit). With masking enabled every frame gets a fresh random key.
#[derive(Debug)]
pub struct Serializer {
    masking: bool,
    capacity: usize,
    out: BytesMut,
}

impl Serializer {
    /// Create a serializer
    ///
    /// `masking` selects client-side behavior (every outgoing frame gets a
    /// random 4-byte key); `capacity` bounds the batch buffer.
    pub fn new(masking: bool, capacity: usize) -> Self {
        Self {
            masking,
            capacity,
            out: BytesMut::with_capacity(capacity),
        }
    }

    /// Whether encoded bytes are waiting to be written
    #[inline]
    pub fn has_pending(&self) -> bool {
        !self.out.is_empty()
    }

    /// Encoded bytes currently buffered
    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.out.len()
    }

    /// Try to add a frame to the current batch
    ///
    /// Returns `false` without encoding when the buffer is non-empty and
    /// the frame would not fit; the caller flushes and retries.
    pub fn queue(&mut self, frame: &Frame) -> bool {
        let wire_len = frame_len(frame.payload.len(), self.masking);
        if !self.out.is_empty() && self.out.len() + wire_len > self.capacity {
            return false;
        }

        let mask = if self.masking {
            Some(generate_mask())
        } else {
            None
        };
        encode_frame(&mut self.out, frame.opcode, &frame.payload, frame.fin, mask);
        true
    }

    /// Take the batched wire bytes, leaving the buffer empty
    pub fn take(&mut self) -> Bytes {
        self.out.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{FrameCollector, FrameParser};

    fn decode_one(buf: &mut BytesMut) -> Frame {
        let mut parser = FrameParser::new();
        let mut collector = FrameCollector::new();
        let header = parser.feed(buf).unwrap().expect("complete header");
        collector.begin(header.payload_len as usize);
        collector.push(buf);
        assert!(!collector.has_remaining());
        Frame::new(header.opcode, collector.take(header.mask), header.fin)
    }

    #[test]
    fn encode_small_unmasked() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"hello", true, None);
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x05);
        assert_eq!(&buf[2..], b"hello");
    }

    #[test]
    fn encode_masked_does_not_mutate_input() {
        let payload = Bytes::from_static(b"immutable");
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &payload, true, Some([9, 8, 7, 6]));

        assert_eq!(payload.as_ref(), b"immutable");
        assert_eq!(buf[1] & 0x80, 0x80);
        assert_ne!(&buf[6..], b"immutable");

        let frame = decode_one(&mut buf);
        assert_eq!(frame.payload.as_ref(), b"immutable");
    }

    #[test]
    fn round_trip_all_length_forms() {
        for (len, marker) in [(125usize, 125u8), (126, 126), (65535, 126), (65536, 127)] {
            for masked in [false, true] {
                let body: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
                let original = Frame::binary(body.clone());

                let mut ser = Serializer::new(masked, 1024);
                assert!(ser.queue(&original));
                let mut wire = BytesMut::from(ser.take().as_ref());
                assert_eq!(wire[1] & 0x7F, marker, "len {}", len);

                let decoded = decode_one(&mut wire);
                assert_eq!(decoded.opcode, original.opcode);
                assert_eq!(decoded.fin, original.fin);
                assert_eq!(decoded.payload, original.payload);
            }
        }
    }

    #[test]
    fn round_trip_large_payload() {
        let body = vec![0xABu8; 3 * 1024 * 1024];
        let mut ser = Serializer::new(true, 16 * 1024);
        assert!(ser.queue(&Frame::binary(body.clone())));
        let mut wire = BytesMut::from(ser.take().as_ref());

        let decoded = decode_one(&mut wire);
        assert_eq!(decoded.payload.as_ref(), &body[..]);
    }

    #[test]
    fn batches_frames_until_full() {
        let mut ser = Serializer::new(false, 32);

        assert!(ser.queue(&Frame::text("0123456789"))); // 12 wire bytes
        assert!(ser.queue(&Frame::text("0123456789"))); // 24
        assert!(!ser.queue(&Frame::text("0123456789"))); // would be 36

        let batch = ser.take();
        assert_eq!(batch.len(), 24);
        assert!(!ser.has_pending());

        // The rejected frame fits once the buffer drains
        assert!(ser.queue(&Frame::text("0123456789")));
    }

    #[test]
    fn oversized_frame_accepted_when_empty() {
        let mut ser = Serializer::new(false, 16);
        let big = Frame::binary(vec![0u8; 100]);
        assert!(ser.queue(&big));
        assert!(ser.pending_bytes() > 16);
    }
}
