//! Incremental frame decoding
//!
//! Two cooperating pieces: [`FrameParser`] consumes header bytes from the
//! front of a read buffer and produces a [`FrameHeader`] once one is
//! complete, and [`FrameCollector`] accumulates the payload across
//! however many reads it takes, unmasking in one pass when the body is
//! handed over. Neither requires the full frame to be resident; buffer
//! boundaries never have to align with frame boundaries.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::frame::OpCode;
use crate::mask::apply_mask;
use crate::MAX_FRAME_HEADER_SIZE;

/// A fully parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag
    pub masked: bool,
    /// Fully resolved payload length
    pub payload_len: u64,
    /// Masking key, when the mask flag is set
    pub mask: Option<[u8; 4]>,
}

/// Resumable frame header parser
///
/// `feed` may be called with arbitrary chunks; a partial header at the
/// end of a chunk is saved and parsing resumes on the next call. After a
/// header is produced the parser reports `body_ready` until [`reset`]
/// is called, which the reader does once the payload has been fully
/// collected.
///
/// [`reset`]: FrameParser::reset
#[derive(Debug)]
pub struct FrameParser {
    header_buf: [u8; MAX_FRAME_HEADER_SIZE],
    filled: usize,
    flags_checked: bool,
    header: Option<FrameHeader>,
}

impl FrameParser {
    /// Create a new parser awaiting a header
    pub fn new() -> Self {
        Self {
            header_buf: [0; MAX_FRAME_HEADER_SIZE],
            filled: 0,
            flags_checked: false,
            header: None,
        }
    }

    /// Whether a complete header has been parsed and the payload is
    /// pending collection
    #[inline]
    pub fn body_ready(&self) -> bool {
        self.header.is_some()
    }

    /// The parsed header, while the body is pending
    #[inline]
    pub fn header(&self) -> Option<&FrameHeader> {
        self.header.as_ref()
    }

    /// Return to the awaiting-header state
    ///
    /// Called after the frame body has been fully collected.
    pub fn reset(&mut self) {
        self.filled = 0;
        self.flags_checked = false;
        self.header = None;
    }

    /// Consume header bytes from the front of `src`
    ///
    /// Returns `Ok(Some(header))` when a header completes, `Ok(None)` when
    /// more bytes are needed (or a body is already pending), and an error
    /// on a protocol violation. Payload bytes are left in `src`.
    pub fn feed(&mut self, src: &mut BytesMut) -> Result<Option<FrameHeader>> {
        if self.header.is_some() {
            return Ok(None);
        }

        loop {
            if self.filled >= 2 && !self.flags_checked {
                self.check_flags()?;
                self.flags_checked = true;
            }

            let need = self.required_len();
            if self.filled < need {
                let take = (need - self.filled).min(src.len());
                if take == 0 {
                    return Ok(None);
                }
                self.header_buf[self.filled..self.filled + take].copy_from_slice(&src[..take]);
                src.advance(take);
                self.filled += take;
                // Once byte 1 is visible the required length may grow
                continue;
            }

            let header = self.finish()?;
            self.header = Some(header);
            return Ok(Some(header));
        }
    }

    /// Header size implied by the bytes accumulated so far: 2 until the
    /// length code and mask flag are visible, then the exact size
    fn required_len(&self) -> usize {
        if self.filled < 2 {
            return 2;
        }
        let b1 = self.header_buf[1];
        let ext = match b1 & 0x7F {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let mask = if b1 & 0x80 != 0 { 4 } else { 0 };
        2 + ext + mask
    }

    /// Early validation of the first two header bytes
    fn check_flags(&self) -> Result<()> {
        let b0 = self.header_buf[0];

        if b0 & 0x70 != 0 {
            return Err(Error::Protocol("reserved bits must be zero"));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("invalid opcode"))?;
        let fin = b0 & 0x80 != 0;

        if opcode.is_control() && !fin {
            return Err(Error::Protocol("fragmented control frame"));
        }

        Ok(())
    }

    /// Assemble the header once all its bytes are buffered
    fn finish(&self) -> Result<FrameHeader> {
        let b0 = self.header_buf[0];
        let b1 = self.header_buf[1];

        let fin = b0 & 0x80 != 0;
        // Validated in check_flags
        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("invalid opcode"))?;
        let masked = b1 & 0x80 != 0;

        let (payload_len, mask_offset) = match b1 & 0x7F {
            126 => {
                let len = u16::from_be_bytes([self.header_buf[2], self.header_buf[3]]) as u64;
                if len < 126 {
                    return Err(Error::Protocol("payload length not minimally encoded"));
                }
                (len, 4)
            }
            127 => {
                let len = u64::from_be_bytes(self.header_buf[2..10].try_into().unwrap());
                if len <= 0xFFFF {
                    return Err(Error::Protocol("payload length not minimally encoded"));
                }
                if len >> 63 != 0 {
                    return Err(Error::Protocol("payload length MSB must be zero"));
                }
                (len, 10)
            }
            n => (n as u64, 2),
        };

        if opcode.is_control() && payload_len > 125 {
            return Err(Error::Protocol("control frame payload exceeds 125 bytes"));
        }

        let mask = if masked {
            Some([
                self.header_buf[mask_offset],
                self.header_buf[mask_offset + 1],
                self.header_buf[mask_offset + 2],
                self.header_buf[mask_offset + 3],
            ])
        } else {
            None
        };

        Ok(FrameHeader {
            fin,
            opcode,
            masked,
            payload_len,
            mask,
        })
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates a frame payload across partial reads
///
/// Unmasking happens once in [`take`], with the mask key cycled across
/// the whole payload, so chunk boundaries cannot double-mask or reset
/// the key position.
///
/// [`take`]: FrameCollector::take
#[derive(Debug, Default)]
pub struct FrameCollector {
    target: usize,
    buf: BytesMut,
}

impl FrameCollector {
    /// Create an idle collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin collecting a payload of `len` bytes
    pub fn begin(&mut self, len: usize) {
        self.target = len;
        self.buf.clear();
        self.buf.reserve(len);
    }

    /// Consume up to the remaining byte count from the front of `src`
    pub fn push(&mut self, src: &mut BytesMut) {
        let take = (self.target - self.buf.len()).min(src.len());
        if take > 0 {
            self.buf.extend_from_slice(&src[..take]);
            src.advance(take);
        }
    }

    /// Whether more payload bytes are needed
    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.buf.len() < self.target
    }

    /// Bytes collected so far
    #[inline]
    pub fn collected(&self) -> usize {
        self.buf.len()
    }

    /// Hand over the finished payload, unmasking it, and reset
    pub fn take(&mut self, mask: Option<[u8; 4]>) -> Bytes {
        debug_assert!(!self.has_remaining());
        let mut payload = self.buf.split();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }
        self.target = 0;
        payload.freeze()
    }
}
