//! The device port abstraction every concrete VPW transport implements.
//!
//! Mirrors the shape of the teacher's `KDriveFT12`: a handful of blocking
//! operations (open, send, set speed) plus a non-blocking `receive_message`
//! backed by a queue a background receiver keeps fed. Here the "background
//! receiver" is whatever the concrete implementation wants it to be — a
//! Tokio task for a real transport, nothing at all for the mock.

use async_trait::async_trait;

use crate::error::ObdResult;
use crate::frame::Frame;

/// VPW signaling speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpwSpeed {
    Standard,
    FourX,
}

/// Named read-timeout profiles. The core only ever refers to operations by
/// scenario name; the millisecond value behind each one is a concrete
/// device's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutScenario {
    Minimum,
    ReadProperty,
    ReadMemoryBlock,
    SendKernel,
    ReadCrc,
}

/// What a concrete transport can and can't do, consulted by the vehicle API
/// and kernel orchestration to size packets and decide whether to attempt
/// 4x or flash-CRC verification at all.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCapabilities {
    pub max_send_size: usize,
    pub max_receive_size: usize,
    pub max_flash_write_send_size: usize,
    pub supports_4x: bool,
    pub supports_single_dpid_logging: bool,
    pub supports_stream_logging: bool,
    pub enable_4x_read_write: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        DeviceCapabilities {
            max_send_size: 4096,
            max_receive_size: 4096,
            max_flash_write_send_size: 4096,
            supports_4x: true,
            supports_single_dpid_logging: false,
            supports_stream_logging: false,
            enable_4x_read_write: true,
        }
    }
}

/// The operation set every concrete VPW transport must provide.
///
/// Object-safe via `async-trait` so the vehicle API can hold a
/// `Box<dyn DevicePort>` and swap transports without infecting every call
/// site with a generic parameter.
#[async_trait(?Send)]
pub trait DevicePort {
    /// Open the underlying transport, select J1850 VPW at 10.4 kbit/s,
    /// install a receive filter for the PCM's module id, and read the
    /// battery voltage as a connectivity check.
    async fn initialize(&mut self) -> ObdResult<()>;

    async fn send_message(&mut self, frame: &Frame) -> ObdResult<()>;

    /// Pop the oldest queued frame, or `None` if nothing arrived within the
    /// device's current read timeout. Never fails on a timeout.
    async fn receive_message(&mut self) -> Option<Frame>;

    async fn set_timeout(&mut self, scenario: TimeoutScenario) -> ObdResult<TimeoutScenario>;

    async fn set_vpw_speed(&mut self, speed: VpwSpeed) -> ObdResult<()>;

    async fn clear_message_queue(&mut self);

    /// Wipe both receive and transmit buffers at the hardware level, not
    /// just the in-process queue.
    async fn clear_message_buffer(&mut self) -> ObdResult<()>;

    async fn read_voltage(&mut self) -> ObdResult<f64>;

    fn capabilities(&self) -> DeviceCapabilities;

    fn current_timeout_scenario(&self) -> TimeoutScenario;
}
