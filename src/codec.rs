// src/codec.rs
//
// Wire codec for the CP210x CAN adapter byte-stream protocol.
//
// Frame format (both directions):
//   [0xAA][0xAA][escaped 16-byte logical payload][checksum][0x55][0x55]
//
// Logical payload layout (16 bytes, before escaping):
//   [content: 12 bytes][dataLen: 1][channel: 1][format: 1][type: 1]
//
// CAN data frames put a 4-byte LE arbitration ID plus 8 data bytes in the
// content field, with dataLen=0x08 and channel/format/type all zero. Control
// commands put a 4-byte LE command ID plus an optional 4-byte LE parameter
// there, with dataLen=0x04, channel=0xFF, format=0x01, type=0x01.
//
// Wire quirk, kept for compatibility: the checksum byte is appended AFTER
// escaping and is never escaped itself. A checksum that happens to equal
// HEAD, TAIL, or ESC goes out raw and can desynchronize the receive framer.

use hex::ToHex;

use crate::checksum::sum8;
use crate::{now_us, CanFrame};

// ============================================================================
// Constants
// ============================================================================

/// Frame start marker, sent twice.
pub const PACKET_HEAD: u8 = 0xAA;
/// Frame end marker, sent twice.
pub const PACKET_TAIL: u8 = 0x55;
/// Escape marker inserted before reserved bytes inside the payload.
pub const PACKET_ESC: u8 = 0xA5;

/// Logical payload size before escaping.
pub const PAYLOAD_LEN: usize = 16;
/// Content portion of the logical payload.
pub const CONTENT_LEN: usize = 12;

/// Command ID: reset the CAN controller.
pub const CMD_CAN_RESET: u32 = 0x01FF_FEC0;
/// Command ID: set the adapter's serial-side bit rate.
pub const CMD_SERIAL_BPS: u32 = 0x01FF_FE90;
/// Command ID: set the CAN bus bit rate.
pub const CMD_CAN_BAUD: u32 = 0x01FF_FED0;

/// Trailer field values for a CAN data frame: dataLen, channel, format, type.
const DATA_FRAME_TRAILER: [u8; 4] = [0x08, 0x00, 0x00, 0x00];
/// Trailer field values for a control command frame.
const CONTROL_FRAME_TRAILER: [u8; 4] = [0x04, 0xFF, 0x01, 0x01];

// ============================================================================
// Escaping
// ============================================================================

/// Escape reserved bytes: emit ESC before any byte equal to ESC, HEAD or TAIL.
///
/// Worst case doubles the input length.
pub fn escape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() * 2);
    for &byte in input {
        if byte == PACKET_ESC || byte == PACKET_HEAD || byte == PACKET_TAIL {
            out.push(PACKET_ESC);
        }
        out.push(byte);
    }
    out
}

/// Remove every ESC-valued byte, unconditionally.
///
/// This is NOT the inverse of [`escape`]: the adapter firmware drops all
/// 0xA5 bytes regardless of position, so a payload byte that equals ESC but
/// was never inserted as a marker is lost too. Kept byte-for-byte compatible
/// with the device's behavior.
pub fn unescape(input: &[u8]) -> Vec<u8> {
    input
        .iter()
        .filter(|&&byte| byte != PACKET_ESC)
        .copied()
        .collect()
}

// ============================================================================
// Frame Encoding
// ============================================================================

/// Build a complete wire frame from 12 content bytes plus the four trailer
/// fields. Always succeeds; field ranges are the caller's contract.
pub fn encode_frame(content: &[u8; CONTENT_LEN], data_len: u8, channel: u8, format: u8, kind: u8) -> Vec<u8> {
    let mut payload = [0u8; PAYLOAD_LEN];
    payload[..CONTENT_LEN].copy_from_slice(content);
    payload[12] = data_len;
    payload[13] = channel;
    payload[14] = format;
    payload[15] = kind;

    let checksum = sum8(&payload);
    let escaped = escape(&payload);

    let mut frame = Vec::with_capacity(escaped.len() + 5);
    frame.push(PACKET_HEAD);
    frame.push(PACKET_HEAD);
    frame.extend_from_slice(&escaped);
    frame.push(checksum);
    frame.push(PACKET_TAIL);
    frame.push(PACKET_TAIL);
    frame
}

/// Encode a CAN data frame for transmission.
///
/// The adapter always carries 8 data bytes on the wire; shorter CAN frames
/// must be padded by the caller, which the fixed-size parameter enforces.
pub fn encode_can_frame(arbitration_id: u32, data: &[u8; 8]) -> Vec<u8> {
    let mut content = [0u8; CONTENT_LEN];
    content[..4].copy_from_slice(&arbitration_id.to_le_bytes());
    content[4..12].copy_from_slice(data);
    encode_frame(&content, DATA_FRAME_TRAILER[0], DATA_FRAME_TRAILER[1], DATA_FRAME_TRAILER[2], DATA_FRAME_TRAILER[3])
}

// ============================================================================
// Control Commands
// ============================================================================

/// Vendor control commands sent as wire frames over the bulk OUT endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Reset the CAN controller.
    Reset,
    /// Set the adapter's serial-side bit rate (bits/second).
    SetSerialRate(u32),
    /// Set the CAN bus bit rate (bits/second).
    SetCanBitrate(u32),
}

impl ControlCommand {
    /// The 32-bit command identifier placed in the first 4 content bytes.
    pub fn command_id(&self) -> u32 {
        match self {
            ControlCommand::Reset => CMD_CAN_RESET,
            ControlCommand::SetSerialRate(_) => CMD_SERIAL_BPS,
            ControlCommand::SetCanBitrate(_) => CMD_CAN_BAUD,
        }
    }

    /// The optional 32-bit parameter placed in content bytes 4..8.
    pub fn parameter(&self) -> Option<u32> {
        match self {
            ControlCommand::Reset => None,
            ControlCommand::SetSerialRate(rate) => Some(*rate),
            ControlCommand::SetCanBitrate(rate) => Some(*rate),
        }
    }
}

/// Encode a control command as a wire frame.
pub fn encode_control_frame(command: ControlCommand) -> Vec<u8> {
    let mut content = [0u8; CONTENT_LEN];
    content[..4].copy_from_slice(&command.command_id().to_le_bytes());
    if let Some(param) = command.parameter() {
        content[4..8].copy_from_slice(&param.to_le_bytes());
    }
    encode_frame(&content, CONTROL_FRAME_TRAILER[0], CONTROL_FRAME_TRAILER[1], CONTROL_FRAME_TRAILER[2], CONTROL_FRAME_TRAILER[3])
}

// ============================================================================
// Frame Decoding
// ============================================================================

/// Decode one raw frame extracted by the framer (delimiters stripped, payload
/// still escaped, trailing raw checksum byte).
///
/// Classification inspects the last five raw bytes WITHOUT unescaping:
/// `{dataLen, channel, format, type, checksum}`. Only the CAN data pattern
/// `{0x08, 0x00, 0x00, 0x00, *}` produces a frame; everything else (control
/// acks, status replies) is dropped without an event, matching the adapter's
/// documented behavior. The checksum byte is carried but never verified.
pub fn decode_data_frame(raw: &[u8]) -> Option<CanFrame> {
    if raw.len() < 5 {
        return None;
    }

    let trailer = &raw[raw.len() - 5..];
    if trailer[..4] != DATA_FRAME_TRAILER {
        tracing::trace!(
            trailer = %trailer.encode_hex_upper::<String>(),
            "ignoring non-data frame"
        );
        return None;
    }

    let unescaped = unescape(raw);
    if unescaped.len() < 12 {
        tracing::debug!(len = unescaped.len(), "data frame too short after unescape");
        return None;
    }

    let arbitration_id = u32::from_le_bytes(unescaped[..4].try_into().ok()?);
    let data: [u8; 8] = unescaped[4..12].try_into().ok()?;

    Some(CanFrame {
        arbitration_id,
        data,
        timestamp_us: now_us(),
    })
}

// ============================================================================
// Tests
// ============================================================================
