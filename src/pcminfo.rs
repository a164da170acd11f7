//! Static description of a PCM hardware variant. Selects addresses, chunk
//! sizes, and feature flags the kernel-orchestration layer needs; never
//! mutated once constructed (the one exception — `loader_required` being
//! cleared after a loader upload — is modeled by the caller cloning a fresh
//! `PcmInfo` rather than mutating a shared one).

/// Identifies a PCM hardware family. Only `P10`/`P12` take the short-form
/// upload-request header (see `protocol::kernel::AddressWidth`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareType {
    P01P59,
    P10,
    P12,
}

#[derive(Debug, Clone)]
pub struct PcmInfo {
    pub hardware_type: HardwareType,
    pub kernel_base_address: u32,
    pub loader_required: bool,
    pub loader_base_address: u32,
    pub image_size: u32,
    pub flash_id_support: bool,
    pub flash_crc_support: bool,
    pub kernel_max_block_size: usize,
    pub kernel_version_support: bool,
}

impl PcmInfo {
    pub const fn address_width(&self) -> crate::protocol::AddressWidth {
        match self.hardware_type {
            HardwareType::P10 | HardwareType::P12 => crate::protocol::AddressWidth::Short,
            HardwareType::P01P59 => crate::protocol::AddressWidth::Long,
        }
    }

    pub fn load_address(&self) -> u32 {
        if self.loader_required {
            self.loader_base_address
        } else {
            self.kernel_base_address
        }
    }
}

/// The variants known to the reference table. Real tooling would load this
/// from a profile document (out of scope, per §1); here it's a fixed set
/// that exercises every branch of the kernel-orchestration logic.
pub fn known_variant(name: &str) -> Option<PcmInfo> {
    Some(match name {
        "P01_P59" => PcmInfo {
            hardware_type: HardwareType::P01P59,
            kernel_base_address: 0xFF_8000,
            loader_required: false,
            loader_base_address: 0,
            image_size: 512 * 1024,
            flash_id_support: true,
            flash_crc_support: true,
            kernel_max_block_size: 2048,
            kernel_version_support: true,
        },
        "P10" => PcmInfo {
            hardware_type: HardwareType::P10,
            kernel_base_address: 0xFFC0,
            loader_required: true,
            loader_base_address: 0xFF80,
            image_size: 256 * 1024,
            flash_id_support: true,
            flash_crc_support: false,
            kernel_max_block_size: 512,
            kernel_version_support: true,
        },
        "P12" => PcmInfo {
            hardware_type: HardwareType::P12,
            kernel_base_address: 0xFFC0,
            loader_required: true,
            loader_base_address: 0xFF80,
            image_size: 256 * 1024,
            flash_id_support: false,
            flash_crc_support: false,
            kernel_max_block_size: 512,
            kernel_version_support: false,
        },
        _ => return None,
    })
}
