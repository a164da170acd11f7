//! The VPW dialog core: byte-exact J1850 VPW request/response protocol,
//! security-access handshake, kernel upload-and-execute, bulk memory read,
//! and 1x/4x speed negotiation, wrapped in a retry/timeout fabric that
//! tolerates unrelated bus traffic.
//!
//! Everything in this crate is transport-agnostic: it depends only on the
//! [`device::DevicePort`] trait. [`mock_device::MockDevice`] is the
//! in-process reference transport the test suite is built on; the `serial`
//! feature adds [`serial_device::SerialPassThruDevice`], a minimal
//! reference implementation of the same trait over a real serial port.

pub mod cancel;
pub mod clock;
pub mod device;
pub mod error;
pub mod flashchip;
pub mod frame;
pub mod kernel;
pub mod mock_device;
pub mod notifier;
pub mod pcminfo;
pub mod protocol;
pub mod query;
#[cfg(feature = "serial")]
pub mod serial_device;
pub mod status;
pub mod vehicle;

pub use cancel::CancellationToken;
pub use device::{DeviceCapabilities, DevicePort, TimeoutScenario, VpwSpeed};
pub use error::{ObdError, ObdResult};
pub use flashchip::{BlockType, FlashChip, MemoryRange};
/// The crate's own `Frame` type, re-exported at the root since it crosses
/// almost every module boundary.
pub use frame::Frame;
pub use pcminfo::{HardwareType, PcmInfo};
pub use status::StatusObserver;
pub use vehicle::{KeyAlgorithm, Vehicle};
