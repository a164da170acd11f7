//! Block-read request/response framing (mode 0x3C, "ReadBlock").
//!
//! Every readable block on the PCM is addressed by a one-byte id. The
//! request is a bare four-byte frame (no payload); the response echoes the
//! id, carries a status byte, then a fixed-length data field whose size
//! depends on the block.

use std::time::Instant;

use crate::error::ObdResult;
use crate::frame::{module, priority, Frame, Mode};

use super::{match_prefix, truncated, unexpected, PrefixMatch};

/// Known block identifiers and the fixed length of the data that follows
/// their status byte. Three VIN blocks are concatenated by the caller into
/// the 17-byte VIN; the others stand alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockId {
    Vin1 = 0x01,
    Vin2 = 0x02,
    Vin3 = 0x03,
    Serial1 = 0x04,
    Serial2 = 0x05,
    Serial3 = 0x06,
    Bcc = 0x07,
    Mec = 0x08,
    HardwareId = 0x09,
    OsId = 0x0A,
    CalibrationId = 0x0B,
}

impl BlockId {
    pub const fn data_len(self) -> usize {
        match self {
            BlockId::Vin1 => 5,
            BlockId::Vin2 | BlockId::Vin3 => 6,
            BlockId::Serial1 | BlockId::Serial2 | BlockId::Serial3 => 4,
            BlockId::Bcc => 4,
            BlockId::Mec => 1,
            BlockId::HardwareId => 4,
            BlockId::OsId => 4,
            BlockId::CalibrationId => 4,
        }
    }
}

/// `[Physical0, Pcm, Tool, ReadBlock, block_id]`
pub fn build_read_block_request(block: BlockId) -> Vec<u8> {
    vec![
        priority::PHYSICAL0,
        module::PCM,
        module::TOOL,
        Mode::ReadBlock as u8,
        block as u8,
    ]
}

/// Parse a response to `build_read_block_request(block)`.
///
/// Positive shape: `[Physical0, Tool, Pcm, ReadBlock|0x40, block_id, status, data...]`
/// with `data.len() == block.data_len()`. `status != 0` is still treated as
/// success at the framing layer (callers that care about status inspect the
/// returned byte); only a missing/garbled frame or a negative response is an
/// error here.
pub fn parse_read_block_response(frame: &Frame, block: BlockId) -> ObdResult<(u8, Vec<u8>)> {
    match match_prefix(
        frame,
        priority::PHYSICAL0,
        &[],
        module::TOOL,
        module::PCM,
        Mode::ReadBlock.response(),
        Mode::ReadBlock as u8,
    ) {
        PrefixMatch::Negative(code) => return Err(crate::error::ObdError::Refused(code)),
        PrefixMatch::Neither => return Err(unexpected("not a ReadBlock response")),
        PrefixMatch::Positive => {}
    }
    let body = frame.payload();
    if body.first().copied() != Some(block as u8) {
        return Err(unexpected("ReadBlock response echoed the wrong block id"));
    }
    let want = 2 + block.data_len();
    if body.len() < want {
        return Err(truncated("ReadBlock response shorter than block.data_len()"));
    }
    let status = body[1];
    let data = body[2..want].to_vec();
    Ok((status, data))
}

fn frame_from(bytes: Vec<u8>) -> Frame {
    Frame::new(bytes, Instant::now())
}
