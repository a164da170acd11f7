//! Tool-present heartbeat: keeps the PCM out of its normal-communication
//! timeout during a long kernel dialog without flooding the bus.

use std::time::Duration;

use crate::clock::Clock;
use crate::device::DevicePort;
use crate::error::ObdResult;
use crate::frame::Frame;
use crate::protocol;

const GATE: Duration = Duration::from_millis(800);

/// Gates a tool-present send behind an elapsed-time check so callers can
/// call `notify()` as liberally as they like without saturating the bus.
pub struct ToolPresentNotifier<C: Clock> {
    clock: C,
    last_notification: Option<std::time::Instant>,
}

impl<C: Clock> ToolPresentNotifier<C> {
    pub fn new(clock: C) -> Self {
        ToolPresentNotifier {
            clock,
            last_notification: None,
        }
    }

    /// Send a tool-present frame only if at least 800ms have elapsed since
    /// the last one (or none has been sent yet).
    pub async fn notify(&mut self, device: &mut dyn DevicePort) -> ObdResult<()> {
        let now = self.clock.now();
        let due = match self.last_notification {
            Some(last) => now.duration_since(last) >= GATE,
            None => true,
        };
        if due {
            self.force_notify(device).await?;
        }
        Ok(())
    }

    /// Send a tool-present frame unconditionally and reset the gate.
    pub async fn force_notify(&mut self, device: &mut dyn DevicePort) -> ObdResult<()> {
        let bytes = protocol::build_tool_present_request();
        let frame = Frame::new(bytes, self.clock.now());
        device.send_message(&frame).await?;
        self.last_notification = Some(self.clock.now());
        Ok(())
    }
}
