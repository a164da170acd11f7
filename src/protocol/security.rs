//! Security access: seed request (submode 0x01) and unlock request
//! (submode 0x02), both under mode 0x27.

use std::time::Instant;

use crate::error::ObdResult;
use crate::frame::{module, priority, Frame, Mode};

use super::{match_prefix, truncated, unexpected, PrefixMatch};

const SEED_SUBMODE: u8 = 0x01;
const UNLOCK_SUBMODE: u8 = 0x02;

/// The PCM's verdict on an unlock attempt, echoed as the first payload byte
/// of a positive unlock response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnlockStatus {
    Allowed = 0x34,
    Denied = 0x33,
    Invalid = 0x35,
    TooMany = 0x36,
    Delay = 0x37,
}

impl UnlockStatus {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x34 => UnlockStatus::Allowed,
            0x33 => UnlockStatus::Denied,
            0x35 => UnlockStatus::Invalid,
            0x36 => UnlockStatus::TooMany,
            0x37 => UnlockStatus::Delay,
            _ => return None,
        })
    }
}

/// A seed response is either "already unlocked" (no key required) or a
/// 2-byte seed to compute a key against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedResult {
    AlreadyUnlocked,
    Seed(u16),
}

/// The byte following the submode echo when the PCM reports it is already
/// unlocked: `[…, Seed|0x40, 0x01, 0x37]`, as distinct from the two seed
/// bytes that otherwise occupy that position.
const ALREADY_UNLOCKED_SENTINEL: u8 = 0x37;

/// `[Physical0, Pcm, Tool, Seed, 0x01]`
pub fn build_seed_request() -> Vec<u8> {
    vec![
        priority::PHYSICAL0,
        module::PCM,
        module::TOOL,
        Mode::Seed as u8,
        SEED_SUBMODE,
    ]
}

/// Positive shape: `[Physical0, Tool, Pcm, Seed|0x40, 0x01, hi, lo]`, or with
/// no seed bytes at all when the PCM is already unlocked.
pub fn parse_seed_response(frame: &Frame) -> ObdResult<SeedResult> {
    match match_prefix(
        frame,
        priority::PHYSICAL0,
        &[],
        module::TOOL,
        module::PCM,
        Mode::Seed.response(),
        Mode::Seed as u8,
    ) {
        PrefixMatch::Negative(code) => return Err(crate::error::ObdError::Refused(code)),
        PrefixMatch::Neither => return Err(unexpected("not a Seed response")),
        PrefixMatch::Positive => {}
    }
    let body = frame.payload();
    if body.first().copied() != Some(SEED_SUBMODE) {
        return Err(unexpected("Seed response missing submode echo"));
    }
    match body.len() {
        2 if body[1] == ALREADY_UNLOCKED_SENTINEL => Ok(SeedResult::AlreadyUnlocked),
        3 => Ok(SeedResult::Seed(u16::from_be_bytes([body[1], body[2]]))),
        _ => Err(truncated("Seed response has an unrecognized payload length")),
    }
}

/// `[Physical0, Pcm, Tool, Seed, 0x02, key_hi, key_lo]`
pub fn build_unlock_request(key: u16) -> Vec<u8> {
    let [hi, lo] = key.to_be_bytes();
    vec![
        priority::PHYSICAL0,
        module::PCM,
        module::TOOL,
        Mode::Seed as u8,
        UNLOCK_SUBMODE,
        hi,
        lo,
    ]
}

/// Positive shape: `[Physical0, Tool, Pcm, Seed|0x40, 0x02, status]`.
pub fn parse_unlock_response(frame: &Frame) -> ObdResult<UnlockStatus> {
    match match_prefix(
        frame,
        priority::PHYSICAL0,
        &[],
        module::TOOL,
        module::PCM,
        Mode::Seed.response(),
        Mode::Seed as u8,
    ) {
        PrefixMatch::Negative(code) => return Err(crate::error::ObdError::Refused(code)),
        PrefixMatch::Neither => return Err(unexpected("not a Seed response")),
        PrefixMatch::Positive => {}
    }
    let body = frame.payload();
    if body.first().copied() != Some(UNLOCK_SUBMODE) {
        return Err(unexpected("Unlock response missing submode echo"));
    }
    let status = body
        .get(1)
        .copied()
        .ok_or_else(|| truncated("Unlock response missing status byte"))?;
    UnlockStatus::from_byte(status).ok_or_else(|| unexpected("unrecognized unlock status byte"))
}

fn frame_from(bytes: Vec<u8>) -> Frame {
    Frame::new(bytes, Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_request_shape() {
        assert_eq!(build_seed_request(), vec![0x6C, 0x10, 0xF0, 0x27, 0x01]);
    }

    #[test]
    fn parses_seed_value() {
        let f = frame_from(vec![0x6C, 0xF0, 0x10, 0x67, 0x01, 0x12, 0x34]);
        assert_eq!(parse_seed_response(&f).unwrap(), SeedResult::Seed(0x1234));
    }

    #[test]
    fn parses_already_unlocked_seed() {
        let f = frame_from(vec![0x6C, 0xF0, 0x10, 0x67, 0x01, 0x37]);
        assert_eq!(
            parse_seed_response(&f).unwrap(),
            SeedResult::AlreadyUnlocked
        );
    }

    #[test]
    fn unlock_request_shape() {
        assert_eq!(
            build_unlock_request(0xABCD),
            vec![0x6C, 0x10, 0xF0, 0x27, 0x02, 0xAB, 0xCD]
        );
    }

    #[test]
    fn parses_unlock_allowed() {
        let f = frame_from(vec![0x6C, 0xF0, 0x10, 0x67, 0x02, 0x34]);
        assert_eq!(parse_unlock_response(&f).unwrap(), UnlockStatus::Allowed);
    }

    #[test]
    fn parses_unlock_denied() {
        let f = frame_from(vec![0x6C, 0xF0, 0x10, 0x67, 0x02, 0x33]);
        assert_eq!(parse_unlock_response(&f).unwrap(), UnlockStatus::Denied);
    }
}
