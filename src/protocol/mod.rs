//! Pure, stateless request builders and response parsers for the VPW wire
//! protocol. Nothing in this module performs I/O, blocks, or retries — that
//! is the query engine's job (`crate::query`). For every request there is
//! exactly one constructor and one parser.

mod blocks;
mod kernel;
mod misc;
mod security;
mod speed;

pub use blocks::{build_read_block_request, parse_read_block_response, BlockId};
pub use kernel::{
    build_kernel_crc_request, build_kernel_read_request, build_kernel_version_request,
    build_upload_packet, build_upload_request, parse_kernel_read_response,
    parse_kernel_version_response, parse_upload_ack, parse_upload_request_response,
    AddressWidth, CopyType, KernelQuery, UploadPacket,
};
pub use misc::{
    build_clear_dtc_request, build_disable_normal_message_transmission_request,
    build_exit_kernel_request, build_tool_present_request,
};
pub use security::{
    build_seed_request, build_unlock_request, parse_seed_response, parse_unlock_response,
    SeedResult, UnlockStatus,
};
pub use speed::{
    build_begin_high_speed_request, build_high_speed_permission_request,
    parse_high_speed_permission_response,
};

use crate::error::ObdError;
use crate::frame::Frame;

/// Shared prefix-matching logic used by every response parser: does this
/// frame look like a positive response to `request_mode`, a negative
/// response to it, or neither?
pub(crate) enum PrefixMatch {
    Positive,
    Negative(u8),
    Neither,
}

/// Check `frame`'s `(priority, destination, source, mode)` against the
/// expected positive-response quadruple, falling back to the negative
/// response shape (`priority`/`dest`/`src` matching, mode `0x7F`, byte 4
/// echoing `request_mode`).
///
/// The `extra_priorities` slice accepts additional leading-byte values as
/// "positive" matches besides `expected_priority` — used by the upload-ack
/// parser to accept the otherwise-unreachable `Physical0High` priority (see
/// the open question recorded in DESIGN.md).
pub(crate) fn match_prefix(
    frame: &Frame,
    expected_priority: u8,
    extra_priorities: &[u8],
    expected_dest: u8,
    expected_src: u8,
    positive_mode: u8,
    request_mode: u8,
) -> PrefixMatch {
    if frame.len() < 4 {
        return PrefixMatch::Neither;
    }
    let priority_ok =
        frame.priority() == expected_priority || extra_priorities.contains(&frame.priority());
    if priority_ok
        && frame.destination() == expected_dest
        && frame.source() == expected_src
        && frame.mode() == positive_mode
    {
        if frame.priority() != expected_priority {
            log::debug!(
                "accepted unusual priority 0x{:02X} for mode 0x{:02X} response",
                frame.priority(),
                positive_mode
            );
        }
        return PrefixMatch::Positive;
    }
    if priority_ok
        && frame.destination() == expected_dest
        && frame.source() == expected_src
        && frame.mode() == crate::frame::Mode::NegativeResponse as u8
        && frame.submode() == Some(request_mode)
    {
        let code = frame.payload().get(1).copied().unwrap_or(0);
        return PrefixMatch::Negative(code);
    }
    PrefixMatch::Neither
}

pub(crate) fn unexpected(what: &str) -> ObdError {
    ObdError::UnexpectedResponse(what.to_string())
}

pub(crate) fn truncated(what: &str) -> ObdError {
    ObdError::Truncated(what.to_string())
}
