//! Inbound frame state machine
//!
//! [`Reader`] owns the parser and collector and turns raw read-buffer
//! bytes into complete frames: fragmented text/binary messages are
//! reassembled and delivered only once final, while control frames pass
//! through immediately even mid-fragmentation (RFC 6455 permits the
//! interleave). The reassembled-size ceiling is checked against the
//! cumulative fragment total at header time, so fragmentation cannot
//! sneak past the limit. The session layer drives this machine from the
//! transport and routes the produced frames.

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::frame::{Frame, OpCode};
use crate::parser::{FrameCollector, FrameParser};

/// Reader progress through the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Awaiting or parsing a header
    Frame,
    /// Collecting the payload
    Body,
    /// Terminal: stream ended or a fatal error occurred
    Done,
}

/// Incremental frame reader with fragment reassembly
#[derive(Debug)]
pub struct Reader {
    parser: FrameParser,
    collector: FrameCollector,
    state: ReadState,
    fragment_buf: BytesMut,
    fragment_opcode: Option<OpCode>,
    max_frame_size: usize,
}

impl Reader {
    /// Create a reader enforcing the given reassembled-message ceiling
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            parser: FrameParser::new(),
            collector: FrameCollector::new(),
            state: ReadState::Frame,
            fragment_buf: BytesMut::new(),
            fragment_opcode: None,
            max_frame_size,
        }
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Mark the reader terminal (stream end)
    pub fn finish(&mut self) {
        self.state = ReadState::Done;
    }

    /// Consume as much of `buf` as possible, appending completed frames
    ///
    /// Partial frames are held internally and resume on the next call.
    /// Any error is fatal: the reader transitions to [`ReadState::Done`]
    /// and ignores further input.
    pub fn drain(&mut self, buf: &mut BytesMut, out: &mut Vec<Frame>) -> Result<()> {
        loop {
            match self.state {
                ReadState::Done => return Ok(()),

                ReadState::Frame => {
                    let header = match self.parser.feed(buf) {
                        Ok(Some(header)) => header,
                        Ok(None) => return Ok(()),
                        Err(e) => {
                            self.state = ReadState::Done;
                            return Err(e);
                        }
                    };

                    // Cumulative check: in-progress fragments count toward
                    // the ceiling
                    if header.opcode.is_data() {
                        let projected = self.fragment_buf.len() as u64 + header.payload_len;
                        if projected > self.max_frame_size as u64 {
                            self.state = ReadState::Done;
                            return Err(Error::FrameTooBig);
                        }
                    }

                    self.collector.begin(header.payload_len as usize);
                    self.state = ReadState::Body;
                }

                ReadState::Body => {
                    self.collector.push(buf);
                    if self.collector.has_remaining() {
                        return Ok(());
                    }

                    let header = *self.parser.header().expect("body implies header");
                    let payload = self.collector.take(header.mask);
                    self.parser.reset();
                    self.state = ReadState::Frame;

                    if let Err(e) = self.dispatch(header.opcode, payload, header.fin, out) {
                        self.state = ReadState::Done;
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Route one completed wire frame: control frames out immediately,
    /// data frames through reassembly
    fn dispatch(
        &mut self,
        opcode: OpCode,
        payload: bytes::Bytes,
        fin: bool,
        out: &mut Vec<Frame>,
    ) -> Result<()> {
        match opcode {
            OpCode::Close | OpCode::Ping | OpCode::Pong => {
                out.push(Frame::new(opcode, payload, true));
                Ok(())
            }

            OpCode::Text | OpCode::Binary => {
                if self.fragment_opcode.is_some() {
                    return Err(Error::Protocol("expected continuation frame"));
                }
                if fin {
                    out.push(Frame::new(opcode, payload, true));
                } else {
                    self.fragment_opcode = Some(opcode);
                    self.fragment_buf.clear();
                    self.fragment_buf.extend_from_slice(&payload);
                }
                Ok(())
            }

            OpCode::Continuation => {
                let opcode = self
                    .fragment_opcode
                    .ok_or(Error::Protocol("unexpected continuation frame"))?;
                self.fragment_buf.extend_from_slice(&payload);
                if fin {
                    self.fragment_opcode = None;
                    out.push(Frame::new(opcode, self.fragment_buf.split().freeze(), true));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::encode_frame;

    fn wire(opcode: OpCode, payload: &[u8], fin: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, opcode, payload, fin, None);
        buf
    }

    fn drain_all(reader: &mut Reader, buf: &mut BytesMut) -> Result<Vec<Frame>> {
        let mut out = Vec::new();
        reader.drain(buf, &mut out)?;
        Ok(out)
    }

    #[test]
    fn complete_text_frame() {
        let mut reader = Reader::new(1024);
        let mut buf = wire(OpCode::Text, b"hello", true);

        let frames = drain_all(&mut reader, &mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert_eq!(frames[0].payload.as_ref(), b"hello");
        assert_eq!(reader.state(), ReadState::Frame);
    }

    #[test]
    fn fragments_reassemble_in_order() {
        let mut reader = Reader::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire(OpCode::Text, b"AB", false));
        buf.extend_from_slice(&wire(OpCode::Continuation, b"CD", false));
        buf.extend_from_slice(&wire(OpCode::Continuation, b"E", true));

        let frames = drain_all(&mut reader, &mut buf).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert_eq!(frames[0].payload.as_ref(), b"ABCDE");
        assert!(frames[0].fin);
    }

    #[test]
    fn ping_interleaves_fragments() {
        let mut reader = Reader::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire(OpCode::Text, b"AB", false));
        buf.extend_from_slice(&wire(OpCode::Ping, b"probe", true));
        buf.extend_from_slice(&wire(OpCode::Continuation, b"CD", true));

        let frames = drain_all(&mut reader, &mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, OpCode::Ping);
        assert_eq!(frames[0].payload.as_ref(), b"probe");
        assert_eq!(frames[1].opcode, OpCode::Text);
        assert_eq!(frames[1].payload.as_ref(), b"ABCD");
    }

    #[test]
    fn partial_input_resumes() {
        let mut reader = Reader::new(1024);
        let full = wire(OpCode::Binary, b"split me", true);

        for split in 1..full.len() - 1 {
            let mut reader_frames = Vec::new();
            let mut first = BytesMut::from(&full[..split]);
            let mut second = BytesMut::from(&full[split..]);

            reader.drain(&mut first, &mut reader_frames).unwrap();
            assert!(reader_frames.is_empty());
            reader.drain(&mut second, &mut reader_frames).unwrap();
            assert_eq!(reader_frames.len(), 1);
            assert_eq!(reader_frames[0].payload.as_ref(), b"split me");
        }
    }

    #[test]
    fn single_oversized_frame_is_fatal() {
        let mut reader = Reader::new(16);
        let mut buf = wire(OpCode::Binary, &[0u8; 17], true);

        assert!(matches!(
            drain_all(&mut reader, &mut buf),
            Err(Error::FrameTooBig)
        ));
        assert_eq!(reader.state(), ReadState::Done);

        // Terminal: further input is ignored
        let mut more = wire(OpCode::Text, b"hi", true);
        let frames = drain_all(&mut reader, &mut more).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn cumulative_fragments_cannot_bypass_ceiling() {
        let mut reader = Reader::new(16);
        let mut buf = BytesMut::new();
        // Each fragment is under the limit; the total is not
        buf.extend_from_slice(&wire(OpCode::Binary, &[0u8; 10], false));
        buf.extend_from_slice(&wire(OpCode::Continuation, &[0u8; 10], true));

        assert!(matches!(
            drain_all(&mut reader, &mut buf),
            Err(Error::FrameTooBig)
        ));
        assert_eq!(reader.state(), ReadState::Done);
    }

    #[test]
    fn data_frame_during_fragmentation_rejected() {
        let mut reader = Reader::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire(OpCode::Text, b"AB", false));
        buf.extend_from_slice(&wire(OpCode::Text, b"CD", true));

        assert!(matches!(
            drain_all(&mut reader, &mut buf),
            Err(Error::Protocol("expected continuation frame"))
        ));
    }

    #[test]
    fn stray_continuation_rejected() {
        let mut reader = Reader::new(1024);
        let mut buf = wire(OpCode::Continuation, b"CD", true);

        assert!(matches!(
            drain_all(&mut reader, &mut buf),
            Err(Error::Protocol("unexpected continuation frame"))
        ));
    }

    #[test]
    fn wire_order_preserved() {
        let mut reader = Reader::new(1024);
        let mut buf = BytesMut::new();
        for i in 0..10u8 {
            buf.extend_from_slice(&wire(OpCode::Binary, &[i], true));
        }

        let frames = drain_all(&mut reader, &mut buf).unwrap();
        let seen: Vec<u8> = frames.iter().map(|f| f.payload[0]).collect();
        assert_eq!(seen, (0..10).collect::<Vec<u8>>());
    }
}
