//! PCM upload (kernel push) and kernel-resident memory read framing.
//!
//! Three related wire shapes live here:
//!
//! - `PcmUploadRequest` (0x34): announce an upcoming upload of `size` bytes
//!   starting at `address`. Two on-wire variants exist depending on PCM
//!   family: a short form for the P10/P12 family (8-bit size, 16-bit
//!   address) and a long form for everything else (16-bit size, 24-bit
//!   address).
//! - `PcmUpload` (0x36): one chunk of the upload itself, tagged `Copy` for
//!   every chunk but the last, `Execute` for the terminal chunk.
//! - `KernelMemoryReadShort`/`KernelMemoryReadLong` (0x35/0x37): once the
//!   kernel is running, ask it to read back a range of flash. Both request
//!   shapes are answered using the *upload* response mode (0x76), not their
//!   own — the kernel speaks the same block-read dialect it was uploaded
//!   with.

use std::time::Instant;

use crate::error::ObdResult;
use crate::frame::{self, module, priority, Frame, Mode};

use super::{match_prefix, truncated, unexpected, PrefixMatch};

/// Whether an upload chunk is an intermediate copy or the terminal,
/// execute-on-receipt chunk. `TestWrite` exercises the kernel's checksum
/// path without committing the copy, used by diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CopyType {
    Copy = 0x00,
    Execute = 0x80,
    TestWrite = 0x44,
}

/// `PcmFamily::Short` covers the P10/P12 controllers, which take an 8-bit
/// size and 16-bit address in the upload-request frame; everything else
/// uses the 16-bit size / 24-bit address long form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressWidth {
    Short,
    Long,
}

/// Build a `PcmUploadRequest` (mode 0x34) announcing `size` bytes landing at
/// `address`.
pub fn build_upload_request(width: AddressWidth, size: u32, address: u32) -> Vec<u8> {
    let mut buf = vec![
        priority::PHYSICAL0,
        module::PCM,
        module::TOOL,
        Mode::PcmUploadRequest as u8,
    ];
    match width {
        AddressWidth::Short => {
            buf.push(size as u8);
            buf.extend_from_slice(&(address as u16).to_be_bytes());
        }
        AddressWidth::Long => {
            buf.extend_from_slice(&(size as u16).to_be_bytes());
            buf.extend_from_slice(&address.to_be_bytes()[1..]);
        }
    }
    buf
}

/// Positive shape: `[Physical0, Tool, Pcm, PcmUploadRequest|0x40]` with no
/// payload. Also accepts the `Physical0High` (0x68) priority on receipt —
/// some PCMs answer this specific request at elevated priority even though
/// the upstream tool never sends at that priority itself; see DESIGN.md.
pub fn parse_upload_request_response(frame: &Frame) -> ObdResult<()> {
    match match_prefix(
        frame,
        priority::PHYSICAL0,
        &[priority::PHYSICAL0_HIGH],
        module::TOOL,
        module::PCM,
        Mode::PcmUploadRequest.response(),
        Mode::PcmUploadRequest as u8,
    ) {
        PrefixMatch::Negative(code) => Err(crate::error::ObdError::Refused(code)),
        PrefixMatch::Neither => Err(unexpected("not a PcmUploadRequest response")),
        PrefixMatch::Positive => Ok(()),
    }
}

/// One chunk of an upload: `[Block, Pcm, Tool, PcmUpload, copy_type, size_be_16, addr_be_24, data..., checksum_be_16]`.
pub struct UploadPacket<'a> {
    pub copy_type: CopyType,
    pub address: u32,
    pub data: &'a [u8],
}

/// Serialize an upload packet, appending its trailing block checksum.
pub fn build_upload_packet(packet: &UploadPacket<'_>) -> Vec<u8> {
    let mut buf = vec![
        priority::BLOCK,
        module::PCM,
        module::TOOL,
        Mode::PcmUpload as u8,
        packet.copy_type as u8,
    ];
    buf.extend_from_slice(&(packet.data.len() as u16).to_be_bytes());
    buf.extend_from_slice(&packet.address.to_be_bytes()[1..]);
    buf.extend_from_slice(packet.data);
    frame::add_block_checksum(&mut buf);
    buf
}

/// Acknowledgement of an upload packet: bare positive response, same shape
/// as the upload-request response.
pub fn parse_upload_ack(frame: &Frame) -> ObdResult<()> {
    match match_prefix(
        frame,
        priority::PHYSICAL0,
        &[priority::PHYSICAL0_HIGH],
        module::TOOL,
        module::PCM,
        Mode::PcmUpload.response(),
        Mode::PcmUpload as u8,
    ) {
        PrefixMatch::Negative(code) => Err(crate::error::ObdError::Refused(code)),
        PrefixMatch::Neither => Err(unexpected("not a PcmUpload ack")),
        PrefixMatch::Positive => Ok(()),
    }
}

/// Build a kernel memory read request. `width` selects the short (16-bit
/// address, mode 0x35) or long (32-bit address, mode 0x37) form; both carry
/// an 8-bit length in units of bytes.
pub fn build_kernel_read_request(width: AddressWidth, address: u32, length: u8) -> Vec<u8> {
    let mut buf = vec![priority::PHYSICAL0, module::PCM, module::TOOL];
    match width {
        AddressWidth::Short => {
            buf.push(Mode::KernelMemoryReadShort as u8);
            buf.extend_from_slice(&(address as u16).to_be_bytes());
        }
        AddressWidth::Long => {
            buf.push(Mode::KernelMemoryReadLong as u8);
            buf.extend_from_slice(&address.to_be_bytes());
        }
    }
    buf.push(length);
    buf
}

/// Parse a kernel memory read response. These always come back wearing the
/// upload-response mode (0x76) regardless of which read mode was sent:
/// `[Block, Tool, Pcm, PcmUpload|0x40, Normal=0x01, len_be_16, addr_be_24, data..., checksum_be_16]`
/// with `total_length >= declared_length + 12`. The RLE sub-mode (`0x02`) is
/// defined on the wire but not implemented here — rejected with a clear
/// error rather than silently misread as literal bytes.
pub fn parse_kernel_read_response(frame: &Frame, declared_length: usize) -> ObdResult<Vec<u8>> {
    let bytes = frame.as_bytes();
    if bytes.len() < declared_length + 12 {
        return Err(truncated("kernel read response shorter than declared length + 12"));
    }
    if bytes[0] != priority::BLOCK
        || bytes[1] != module::TOOL
        || bytes[2] != module::PCM
        || bytes[3] != Mode::PcmUpload.response()
    {
        return Err(unexpected("not a kernel memory read response"));
    }
    const NORMAL: u8 = 0x01;
    const RLE: u8 = 0x02;
    if bytes[4] == RLE {
        return Err(unexpected("kernel read response uses the unimplemented RLE sub-mode"));
    }
    if bytes[4] != NORMAL {
        return Err(unexpected("kernel read response sub-mode is not Normal"));
    }
    let total_length = bytes.len();
    if !frame::verify_block_checksum(&bytes[..total_length]) {
        return Err(unexpected("kernel read response failed its block checksum"));
    }
    Ok(bytes[10..10 + declared_length].to_vec())
}

const VERSION_QUERY_MODE: u8 = 0x3D;

/// Submode discriminators multiplexed under the single kernel-query mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KernelQuery {
    Version = 0x00,
    FlashType = 0x01,
    OsIdFromKernel = 0x02,
    Crc = 0x03,
}

/// `[Block, Pcm, Tool, 0x3D, query, checksum_be_16]`
pub fn build_kernel_version_request(query: KernelQuery) -> Vec<u8> {
    let mut buf = vec![
        priority::BLOCK,
        module::PCM,
        module::TOOL,
        VERSION_QUERY_MODE,
        query as u8,
    ];
    frame::add_block_checksum(&mut buf);
    buf
}

/// Ask the running kernel to compute a CRC32 over one memory range, rather
/// than the whole image: `[Block, Pcm, Tool, 0x3D, Crc, addr_be_24, len_be_24, checksum_be_16]`.
/// Parsed with [`parse_kernel_version_response`] passing [`KernelQuery::Crc`],
/// the same as every other submode under this mode.
pub fn build_kernel_crc_request(address: u32, length: u32) -> Vec<u8> {
    let mut buf = vec![
        priority::BLOCK,
        module::PCM,
        module::TOOL,
        VERSION_QUERY_MODE,
        KernelQuery::Crc as u8,
    ];
    buf.extend_from_slice(&address.to_be_bytes()[1..]);
    buf.extend_from_slice(&length.to_be_bytes()[1..]);
    frame::add_block_checksum(&mut buf);
    buf
}

/// Positive shape: `[Block, Tool, Pcm, 0x3D|0x40, query, data..., checksum_be_16]`.
pub fn parse_kernel_version_response(frame: &Frame, query: KernelQuery) -> ObdResult<Vec<u8>> {
    let bytes = frame.as_bytes();
    if bytes.len() < 7 {
        return Err(truncated("kernel query response shorter than minimum frame"));
    }
    if bytes[0] != priority::BLOCK
        || bytes[1] != module::TOOL
        || bytes[2] != module::PCM
        || bytes[3] != (VERSION_QUERY_MODE | frame::RESPONSE_FLAG)
    {
        return Err(unexpected("not a kernel query response"));
    }
    if bytes[4] != query as u8 {
        return Err(unexpected("kernel query response echoed the wrong query id"));
    }
    if !frame::verify_block_checksum(bytes) {
        return Err(unexpected("kernel query response failed its block checksum"));
    }
    Ok(bytes[5..bytes.len() - 2].to_vec())
}

fn frame_from(bytes: Vec<u8>) -> Frame {
    Frame::new(bytes, Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_request_long_form() {
        let req = build_upload_request(AddressWidth::Long, 0x0100, 0x00_1234);
        assert_eq!(req, vec![0x6C, 0x10, 0xF0, 0x34, 0x01, 0x00, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn upload_request_short_form() {
        let req = build_upload_request(AddressWidth::Short, 0x80, 0xFFC0);
        assert_eq!(req, vec![0x6C, 0x10, 0xF0, 0x34, 0x80, 0xFF, 0xC0]);
    }

    #[test]
    fn upload_request_response_accepts_elevated_priority() {
        let f = frame_from(vec![0x68, 0xF0, 0x10, 0x74]);
        assert!(parse_upload_request_response(&f).is_ok());
    }

    #[test]
    fn upload_packet_roundtrips_checksum() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        let packet = UploadPacket {
            copy_type: CopyType::Execute,
            address: 0xFF_8000,
            data: &data,
        };
        let bytes = build_upload_packet(&packet);
        assert_eq!(
            &bytes[..10],
            &[0x6D, 0x10, 0xF0, 0x36, 0x80, 0x00, 0x04, 0xFF, 0x80, 0x00]
        );
        assert!(frame::verify_block_checksum(&bytes));
    }

    #[test]
    fn kernel_read_request_shapes() {
        assert_eq!(
            build_kernel_read_request(AddressWidth::Short, 0x1000, 16),
            vec![0x6C, 0x10, 0xF0, 0x35, 0x10, 0x00, 16]
        );
        assert_eq!(
            build_kernel_read_request(AddressWidth::Long, 0x00FF_8000, 16),
            vec![0x6C, 0x10, 0xF0, 0x37, 0x00, 0xFF, 0x80, 0x00, 16]
        );
    }

    #[test]
    fn kernel_read_response_parses_declared_length() {
        let mut bytes = vec![0x6D, 0xF0, 0x10, 0x76, 0x01, 0x00, 0x04, 0xFF, 0x80, 0x00];
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        frame::add_block_checksum(&mut bytes);
        let f = frame_from(bytes);
        let data = parse_kernel_read_response(&f, 4).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn kernel_read_response_rejects_corrupted_checksum() {
        let mut bytes = vec![0x6D, 0xF0, 0x10, 0x76, 0x01, 0x00, 0x04, 0xFF, 0x80, 0x00];
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        frame::add_block_checksum(&mut bytes);
        *bytes.last_mut().unwrap() = bytes.last().unwrap().wrapping_add(1);
        let f = frame_from(bytes);
        assert!(parse_kernel_read_response(&f, 4).is_err());
    }

    #[test]
    fn kernel_read_response_rejects_unimplemented_rle_submode() {
        let mut bytes = vec![0x6D, 0xF0, 0x10, 0x76, 0x02, 0x00, 0x04, 0xFF, 0x80, 0x00];
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        frame::add_block_checksum(&mut bytes);
        let f = frame_from(bytes);
        assert!(parse_kernel_read_response(&f, 4).is_err());
    }

    #[test]
    fn kernel_version_request_roundtrips() {
        let req = build_kernel_version_request(KernelQuery::Version);
        assert!(frame::verify_block_checksum(&req));
        let mut resp = vec![0x6D, 0xF0, 0x10, 0x7D, 0x00, 1, 2, 3];
        frame::add_block_checksum(&mut resp);
        let f = frame_from(resp);
        let data = parse_kernel_version_response(&f, KernelQuery::Version).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn kernel_crc_request_carries_range() {
        let req = build_kernel_crc_request(0x00_1000, 0x00_0200);
        assert_eq!(
            &req[..8],
            &[0x6C, 0x10, 0xF0, 0x3D, KernelQuery::Crc as u8, 0x00, 0x10, 0x00]
        );
        assert_eq!(&req[8..11], &[0x00, 0x02, 0x00]);
        assert!(frame::verify_block_checksum(&req));

        let mut resp = vec![0x6D, 0xF0, 0x10, 0x7D, KernelQuery::Crc as u8];
        resp.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        frame::add_block_checksum(&mut resp);
        let f = frame_from(resp);
        let data = parse_kernel_version_response(&f, KernelQuery::Crc).unwrap();
        assert_eq!(u32::from_be_bytes([data[0], data[1], data[2], data[3]]), 0xDEAD_BEEF);
    }
}
