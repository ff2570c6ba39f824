//! Streaming reply parsers.
//!
//! A BFC exec either completes on the first inbound frame or lets a small
//! state machine accumulate a multi-frame reply. Parsers are a tagged
//! enum rather than trait objects; there are exactly two shapes on this
//! bus.

use sielink_core::error::{Error, Result};

use crate::frame::{BfcFrame, FrameType};

/// What a parser decided after one inbound frame.
#[derive(Debug)]
pub enum ParseStep {
    /// Keep the receiver slot; more frames are expected.
    Continue,
    /// The reply is complete.
    Done(Vec<u8>),
}

/// Reply accumulation strategy for one exec.
#[derive(Debug)]
pub enum ReplyParser {
    /// Deliver the first inbound frame's payload.
    Single,
    /// Assemble a memory-read reply (ACK frame, then data frames).
    MemoryRead(MemoryReadParser),
}

impl ReplyParser {
    /// Feed one inbound frame.
    pub fn feed(&mut self, frame: &BfcFrame) -> Result<ParseStep> {
        match self {
            ReplyParser::Single => Ok(ParseStep::Done(frame.payload.clone())),
            ReplyParser::MemoryRead(parser) => parser.feed(frame),
        }
    }
}

/// Accumulates a `read_memory` reply.
///
/// The first frame carries a two-byte ACK (`01 00` means the window is
/// valid); data then arrives as SINGLE or MULTIPLE frames, the latter
/// with one leading sequence byte to skip. The reply is complete when the
/// accumulated length reaches the requested length.
#[derive(Debug)]
pub struct MemoryReadParser {
    expected: usize,
    buffer: Vec<u8>,
    acked: bool,
}

/// The OK acknowledgement opening a memory-read reply.
const MEMORY_ACK_OK: [u8; 2] = [0x01, 0x00];

impl MemoryReadParser {
    /// A parser expecting `expected` data bytes.
    pub fn new(expected: usize) -> MemoryReadParser {
        MemoryReadParser {
            expected,
            buffer: Vec::with_capacity(expected),
            acked: false,
        }
    }

    fn feed(&mut self, frame: &BfcFrame) -> Result<ParseStep> {
        if !self.acked {
            if frame.payload.len() < 2 || frame.payload[0..2] != MEMORY_ACK_OK {
                return Err(Error::Protocol(format!(
                    "memory read refused: {:02X?}",
                    &frame.payload
                )));
            }
            self.acked = true;
            return Ok(ParseStep::Continue);
        }

        let data = match frame.frame_type {
            // MULTIPLE frames carry a sequence byte first.
            FrameType::Multiple => frame.payload.get(1..).unwrap_or(&[]),
            _ => &frame.payload[..],
        };
        self.buffer.extend_from_slice(data);

        if self.buffer.len() >= self.expected {
            if self.buffer.len() > self.expected {
                return Err(Error::Protocol(format!(
                    "memory read overran: got {} of {} bytes",
                    self.buffer.len(),
                    self.expected
                )));
            }
            return Ok(ParseStep::Done(std::mem::take(&mut self.buffer)));
        }
        Ok(ParseStep::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BfcFrame;

    fn data_frame(frame_type: FrameType, payload: Vec<u8>) -> BfcFrame {
        BfcFrame {
            dst: 0x11,
            src: 0x06,
            frame_type,
            ack: false,
            crc: true,
            payload,
        }
    }

    #[test]
    fn single_completes_immediately() {
        let mut parser = ReplyParser::Single;
        let frame = data_frame(FrameType::Single, vec![0x43, 0x11]);
        match parser.feed(&frame).unwrap() {
            ParseStep::Done(payload) => assert_eq!(payload, vec![0x43, 0x11]),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn memory_read_ack_then_single_frames() {
        let mut parser = ReplyParser::MemoryRead(MemoryReadParser::new(6));

        let ack = data_frame(FrameType::Single, vec![0x01, 0x00]);
        assert!(matches!(parser.feed(&ack).unwrap(), ParseStep::Continue));

        let first = data_frame(FrameType::Single, vec![1, 2, 3]);
        assert!(matches!(parser.feed(&first).unwrap(), ParseStep::Continue));

        let second = data_frame(FrameType::Single, vec![4, 5, 6]);
        match parser.feed(&second).unwrap() {
            ParseStep::Done(data) => assert_eq!(data, vec![1, 2, 3, 4, 5, 6]),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn memory_read_multiple_frames_skip_sequence_byte() {
        let mut parser = ReplyParser::MemoryRead(MemoryReadParser::new(4));

        let ack = data_frame(FrameType::Single, vec![0x01, 0x00]);
        parser.feed(&ack).unwrap();

        let first = data_frame(FrameType::Multiple, vec![0x00, 0xAA, 0xBB]);
        assert!(matches!(parser.feed(&first).unwrap(), ParseStep::Continue));

        let second = data_frame(FrameType::Multiple, vec![0x01, 0xCC, 0xDD]);
        match parser.feed(&second).unwrap() {
            ParseStep::Done(data) => assert_eq!(data, vec![0xAA, 0xBB, 0xCC, 0xDD]),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn memory_read_refused_ack_fails() {
        let mut parser = ReplyParser::MemoryRead(MemoryReadParser::new(4));
        let nak = data_frame(FrameType::Single, vec![0x01, 0x05]);
        assert!(matches!(parser.feed(&nak), Err(Error::Protocol(_))));
    }

    #[test]
    fn memory_read_overrun_fails() {
        let mut parser = ReplyParser::MemoryRead(MemoryReadParser::new(2));
        let ack = data_frame(FrameType::Single, vec![0x01, 0x00]);
        parser.feed(&ack).unwrap();
        let too_much = data_frame(FrameType::Single, vec![1, 2, 3]);
        assert!(matches!(parser.feed(&too_much), Err(Error::Protocol(_))));
    }
}
