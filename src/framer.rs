// src/framer.rs
//
// Streaming reassembly of wire frames from an unframed byte stream.
//
// The USB bulk pipe delivers arbitrary-sized chunks with no message
// boundaries. The framer scans a caller-held buffer for `AA AA ... 55 55`
// delimited frames and reports how many bytes belong to fully completed
// frames; the caller keeps the unconsumed suffix and re-presents it, with the
// next chunk appended, on the following call.

use crate::codec::{PACKET_HEAD, PACKET_TAIL};

/// Parse position within the byte stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    /// Scanning for the `HEAD HEAD` pair that opens a frame.
    AwaitingFrameStart,
    /// Collecting payload bytes until the `TAIL TAIL` pair.
    AccumulatingPayload,
}

/// Stateful frame extractor for the adapter's delimited wire format.
///
/// One instance lives for the duration of a connection; the payload
/// accumulator allocation is reused across calls.
pub struct StreamFramer {
    state: ParseState,
    payload: Vec<u8>,
}

impl Default for StreamFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamFramer {
    pub fn new() -> Self {
        StreamFramer {
            state: ParseState::AwaitingFrameStart,
            payload: Vec::with_capacity(64),
        }
    }

    /// Extract completed raw frames from `buffer`.
    ///
    /// Invokes `on_frame` once per completed frame, in arrival order, with the
    /// bytes between the delimiters (payload still escaped, trailing checksum
    /// included). Returns the number of leading bytes that belong to completed
    /// frames; the caller must retain everything past that cursor and present
    /// it again, prepended to the next chunk, on the next call. Because the
    /// unconsumed suffix is re-presented in full, each call parses from a
    /// clean initial state.
    ///
    /// Desync policy: when the two bytes at the scan position are not
    /// `HEAD HEAD`, scanning stops for this call instead of skipping forward.
    /// The stream stays stalled until newly arrived bytes bring a fresh
    /// header pair into the buffer. No frame length limit is enforced; an
    /// unterminated frame accumulates until its tail arrives or the
    /// connection closes.
    pub fn process(&mut self, buffer: &[u8], mut on_frame: impl FnMut(&[u8])) -> usize {
        self.state = ParseState::AwaitingFrameStart;
        self.payload.clear();

        let mut pos = 0;
        let mut consumed = 0;

        while pos < buffer.len() {
            match self.state {
                ParseState::AwaitingFrameStart => {
                    if pos + 1 >= buffer.len()
                        || buffer[pos] != PACKET_HEAD
                        || buffer[pos + 1] != PACKET_HEAD
                    {
                        break;
                    }
                    pos += 2;
                    self.state = ParseState::AccumulatingPayload;
                }
                ParseState::AccumulatingPayload => {
                    if pos + 1 < buffer.len()
                        && buffer[pos] == PACKET_TAIL
                        && buffer[pos + 1] == PACKET_TAIL
                    {
                        on_frame(&self.payload);
                        self.payload.clear();
                        pos += 2;
                        consumed = pos;
                        self.state = ParseState::AwaitingFrameStart;
                    } else {
                        self.payload.push(buffer[pos]);
                        pos += 1;
                    }
                }
            }
        }

        consumed
    }
}

// ============================================================================
// Chunk Accumulator
// ============================================================================

/// Owned byte buffer fed across read iterations.
///
/// The receive loop appends each bulk-transfer chunk, runs the framer over
/// the whole buffer, then drops the consumed prefix.
#[derive(Default)]
pub struct ChunkBuffer {
    buf: Vec<u8>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        ChunkBuffer {
            buf: Vec::with_capacity(256),
        }
    }

    /// Append a freshly read chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Drop the first `n` bytes, keeping the unconsumed suffix.
    pub fn consume(&mut self, n: usize) {
        self.buf.drain(..n.min(self.buf.len()));
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_can_frame, PACKET_HEAD, PACKET_TAIL};
    use proptest::prelude::*;

    fn collect_frames(framer: &mut StreamFramer, buffer: &[u8]) -> (Vec<Vec<u8>>, usize) {
        let mut frames = Vec::new();
        let consumed = framer.process(buffer, |raw| frames.push(raw.to_vec()));
        (frames, consumed)
    }

    #[test]
    fn test_single_complete_frame() {
        let wire = encode_can_frame(0x123, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut framer = StreamFramer::new();

        let (frames, consumed) = collect_frames(&mut framer, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], wire[2..wire.len() - 2].to_vec());
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let a = encode_can_frame(0x100, &[0; 8]);
        let b = encode_can_frame(0x200, &[1; 8]);
        let mut buffer = a.clone();
        buffer.extend_from_slice(&b);

        let mut framer = StreamFramer::new();
        let (frames, consumed) = collect_frames(&mut framer, &buffer);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], a[2..a.len() - 2].to_vec());
        assert_eq!(frames[1], b[2..b.len() - 2].to_vec());
        assert_eq!(consumed, buffer.len());
    }

    #[test]
    fn test_partial_frame_consumes_nothing() {
        let wire = encode_can_frame(0x123, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut framer = StreamFramer::new();

        let (frames, consumed) = collect_frames(&mut framer, &wire[..wire.len() - 3]);
        assert!(frames.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_split_at_every_boundary() {
        // The caller contract: unconsumed bytes are retained and re-presented
        // with the next chunk. Any split point must yield exactly one frame
        // with identical content.
        let wire = encode_can_frame(0x44332211, &[0x07, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let expected = wire[2..wire.len() - 2].to_vec();

        for split in 0..=wire.len() {
            let mut framer = StreamFramer::new();
            let mut frames = Vec::new();
            let mut buffer: Vec<u8> = Vec::new();

            buffer.extend_from_slice(&wire[..split]);
            let consumed = framer.process(&buffer, |raw| frames.push(raw.to_vec()));
            buffer.drain(..consumed);

            buffer.extend_from_slice(&wire[split..]);
            let consumed = framer.process(&buffer, |raw| frames.push(raw.to_vec()));
            buffer.drain(..consumed);

            assert_eq!(frames.len(), 1, "split at {}", split);
            assert_eq!(frames[0], expected, "split at {}", split);
            assert!(buffer.is_empty(), "split at {}", split);
        }
    }

    #[test]
    fn test_desync_stops_scanning() {
        // Garbage at the head of the buffer: the framer stops at the first
        // failed header match rather than hunting for a later header.
        let mut buffer = vec![0x01, 0x02, 0x03];
        buffer.extend_from_slice(&encode_can_frame(0x123, &[0; 8]));

        let mut framer = StreamFramer::new();
        let (frames, consumed) = collect_frames(&mut framer, &buffer);
        assert!(frames.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_lone_head_byte_holds_position() {
        // A single 0xAA with nothing after it is not yet a header pair.
        let mut framer = StreamFramer::new();
        let (frames, consumed) = collect_frames(&mut framer, &[PACKET_HEAD]);
        assert!(frames.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_checksum_equal_to_tail_truncates_frame() {
        // The unescaped checksum byte is the protocol's known desync hazard:
        // if it equals 0x55 it pairs with the first tail byte, the frame is
        // emitted without its checksum, and a stray 0x55 remains unconsumed.
        // Content byte 0x4D gives checksum 0x4D + 0x08 = 0x55.
        let mut content = [0u8; 12];
        content[0] = 0x4D;
        let wire = crate::codec::encode_frame(&content, 0x08, 0x00, 0x00, 0x00);
        assert_eq!(wire[wire.len() - 3], PACKET_TAIL); // checksum == 0x55

        let mut framer = StreamFramer::new();
        let (frames, consumed) = collect_frames(&mut framer, &wire);

        assert_eq!(frames.len(), 1);
        // Emitted frame is the escaped payload only; the checksum is swallowed by
        // the early tail match.
        assert_eq!(frames[0].len(), 16);
        // One tail byte left past the cursor.
        assert_eq!(consumed, wire.len() - 1);
    }

    #[test]
    fn test_chunk_buffer_extend_consume() {
        let mut buffer = ChunkBuffer::new();
        assert!(buffer.is_empty());

        buffer.extend(&[1, 2, 3, 4]);
        buffer.extend(&[5, 6]);
        assert_eq!(buffer.len(), 6);

        buffer.consume(4);
        assert_eq!(buffer.as_slice(), &[5, 6]);

        // Over-consume clamps instead of panicking.
        buffer.consume(10);
        assert!(buffer.is_empty());
    }

    proptest! {
        #[test]
        fn prop_any_chunking_yields_same_frames(
            id in any::<u32>(),
            data in any::<[u8; 8]>(),
            splits in proptest::collection::vec(0usize..64, 0..6),
        ) {
            let wire = encode_can_frame(id, &data);
            // A checksum equal to the tail byte truncates the frame (see
            // test_checksum_equal_to_tail_truncates_frame); exclude that
            // documented hazard from the clean-reassembly property.
            prop_assume!(wire[wire.len() - 3] != PACKET_TAIL);
            let expected = wire[2..wire.len() - 2].to_vec();

            // Turn the random split offsets into ordered cut points.
            let mut cuts: Vec<usize> = splits.iter().map(|s| s % (wire.len() + 1)).collect();
            cuts.sort_unstable();
            cuts.dedup();

            let mut framer = StreamFramer::new();
            let mut frames = Vec::new();
            let mut buffer: Vec<u8> = Vec::new();
            let mut last = 0;

            for cut in cuts.into_iter().chain(std::iter::once(wire.len())) {
                buffer.extend_from_slice(&wire[last..cut]);
                last = cut;
                let consumed = framer.process(&buffer, |raw| frames.push(raw.to_vec()));
                buffer.drain(..consumed);
            }

            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(&frames[0], &expected);
            prop_assert!(buffer.is_empty());
        }
    }
}
