//! VPW bus-speed renegotiation (1x <-> 4x).
//!
//! Speed changes are broadcast and require every module on the bus to
//! consent before the tool commits to the switch: a "prepare" round asks
//! permission (each module answers individually, addressed back to the
//! tool), then a "begin" broadcast that nothing acknowledges actually
//! performs the switch.

use std::time::Instant;

use crate::error::ObdResult;
use crate::frame::{module, priority, Frame, Mode};

use super::{match_prefix, unexpected, PrefixMatch};

/// `[Physical0, Broadcast, Tool, HighSpeedPrepare]`
pub fn build_high_speed_permission_request() -> Vec<u8> {
    vec![
        priority::PHYSICAL0,
        module::BROADCAST,
        module::TOOL,
        Mode::HighSpeedPrepare as u8,
    ]
}

/// A single module's answer to the permission request: `granted` is the
/// responding module's address, carried so the caller can tell which ECU
/// refused.
pub fn parse_high_speed_permission_response(frame: &Frame) -> ObdResult<(u8, bool)> {
    match match_prefix(
        frame,
        priority::PHYSICAL0,
        &[],
        module::TOOL,
        frame.source(),
        Mode::HighSpeedPrepare.response(),
        Mode::HighSpeedPrepare as u8,
    ) {
        PrefixMatch::Negative(_) => Ok((frame.source(), false)),
        PrefixMatch::Neither => Err(unexpected("not a HighSpeedPrepare response")),
        PrefixMatch::Positive => Ok((frame.source(), true)),
    }
}

/// `[Physical0, Broadcast, Tool, HighSpeed]`. Fire-and-forget: nothing on
/// the bus acknowledges this frame, the tool simply switches its own
/// transport speed immediately after sending it.
pub fn build_begin_high_speed_request() -> Vec<u8> {
    vec![
        priority::PHYSICAL0,
        module::BROADCAST,
        module::TOOL,
        Mode::HighSpeed as u8,
    ]
}

fn frame_from(bytes: Vec<u8>) -> Frame {
    Frame::new(bytes, Instant::now())
}
