//! In-process reference transport driven by a scripted frame queue — the
//! primary unit-test substrate. Modeled on the teacher's `KDriveFT12`
//! receive path, minus the serial framing and the background thread: a test
//! just hands it the frames it wants to see received.

use std::collections::VecDeque;
use std::time::Instant;

use async_trait::async_trait;

use crate::device::{DeviceCapabilities, DevicePort, TimeoutScenario, VpwSpeed};
use crate::error::ObdResult;
use crate::frame::Frame;

/// A scripted, in-process `DevicePort`.
///
/// `receive_message` pops the front of `script`; once empty it reports "no
/// frame arrived," exactly as a real device does when the bus goes quiet.
/// Every frame handed to `send_message` is appended to `sent`, so tests can
/// assert on exactly what the core transmitted and in what order.
pub struct MockDevice {
    script: VecDeque<Frame>,
    sent: Vec<Frame>,
    capabilities: DeviceCapabilities,
    current_scenario: TimeoutScenario,
    speed: VpwSpeed,
    initialized: bool,
}

impl MockDevice {
    pub fn new() -> Self {
        MockDevice {
            script: VecDeque::new(),
            sent: Vec::new(),
            capabilities: DeviceCapabilities::default(),
            current_scenario: TimeoutScenario::Minimum,
            speed: VpwSpeed::Standard,
            initialized: false,
        }
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        MockDevice {
            capabilities,
            ..MockDevice::new()
        }
    }

    /// Queue bytes to be handed back from a future `receive_message` call,
    /// in the order queued.
    pub fn push_response(&mut self, bytes: Vec<u8>) {
        self.script.push_back(Frame::new(bytes, Instant::now()));
    }

    pub fn sent_frames(&self) -> &[Frame] {
        &self.sent
    }

    pub fn speed(&self) -> VpwSpeed {
        self.speed
    }

    pub fn remaining_script_len(&self) -> usize {
        self.script.len()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        MockDevice::new()
    }
}

#[async_trait(?Send)]
impl DevicePort for MockDevice {
    async fn initialize(&mut self) -> ObdResult<()> {
        self.initialized = true;
        Ok(())
    }

    async fn send_message(&mut self, frame: &Frame) -> ObdResult<()> {
        log::debug!("mock send: {:02X?}", frame.as_bytes());
        self.sent.push(frame.clone());
        Ok(())
    }

    async fn receive_message(&mut self) -> Option<Frame> {
        let frame = self.script.pop_front();
        if let Some(f) = &frame {
            log::debug!("mock recv: {:02X?}", f.as_bytes());
        }
        frame
    }

    async fn set_timeout(&mut self, scenario: TimeoutScenario) -> ObdResult<TimeoutScenario> {
        let prev = self.current_scenario;
        self.current_scenario = scenario;
        Ok(prev)
    }

    async fn set_vpw_speed(&mut self, speed: VpwSpeed) -> ObdResult<()> {
        self.speed = speed;
        Ok(())
    }

    /// A no-op on `script`. A real device's queue holds frames a background
    /// receiver already drained off the wire before this request existed;
    /// this mock has no such background receiver — `script` stands for the
    /// wire itself, not a pre-filled buffer, so there is nothing stale to
    /// discard. Clearing it here would make every multi-round-trip
    /// operation (VIN/serial reads, unlock, kernel upload, bulk read) drop
    /// its own later responses out from under itself, since the query
    /// engine calls this at the top of every `run_query`.
    async fn clear_message_queue(&mut self) {}

    async fn clear_message_buffer(&mut self) -> ObdResult<()> {
        Ok(())
    }

    async fn read_voltage(&mut self) -> ObdResult<f64> {
        Ok(14.2)
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn current_timeout_scenario(&self) -> TimeoutScenario {
        self.current_scenario
    }
}
