//! Fire-and-forget frames: tool-present keepalive, kernel exit, DTC clear,
//! and the "stop sending normal traffic" request issued before an upload.
//! None of these are acknowledged, so there is no corresponding parser —
//! the query engine sends them and moves on.

use crate::frame::{module, priority};

/// `[Physical0, Pcm, Tool, 0x3E, 0x00]`. Sent at least once every 800ms
/// while a kernel dialog is open to keep the PCM out of its normal
/// communication timeout.
pub fn build_tool_present_request() -> Vec<u8> {
    vec![priority::PHYSICAL0, module::PCM, module::TOOL, 0x3E, 0x00]
}

/// `[Physical0, Pcm, Tool, 0x20]`. Tells an uploaded kernel to hand control
/// back to the PCM's resident firmware.
pub fn build_exit_kernel_request() -> Vec<u8> {
    vec![priority::PHYSICAL0, module::PCM, module::TOOL, 0x20]
}

/// `[Physical0, Pcm, Tool, 0x14]`. Clears stored diagnostic trouble codes.
pub fn build_clear_dtc_request() -> Vec<u8> {
    vec![priority::PHYSICAL0, module::PCM, module::TOOL, 0x14]
}

/// `[Physical0, Pcm, Tool, 0x28]`. Asks the PCM to stop its periodic
/// broadcast traffic for the duration of the upload/read session.
pub fn build_disable_normal_message_transmission_request() -> Vec<u8> {
    vec![priority::PHYSICAL0, module::PCM, module::TOOL, 0x28]
}
