//! The single chokepoint for "send a request, await a matching response,
//! retry on timeout." Every vehicle operation that needs a response goes
//! through this; operations that don't (tool-present, exit-kernel) send
//! directly via the device port.

use crate::cancel::CancellationToken;
use crate::device::DevicePort;
use crate::error::{ObdError, ObdResult};
use crate::frame::Frame;
use crate::notifier::ToolPresentNotifier;
use crate::clock::Clock;

/// Bounds from the dialog's own retry budget: two send attempts, each
/// watching for up to 50 receive timeouts before moving to the next
/// attempt (or failing outright after the second).
const MAX_SEND_ATTEMPTS: u32 = 2;
const MAX_RECEIVE_ITERATIONS: u32 = 50;
const MAX_TIMEOUTS: u32 = 5;

/// How a filter should react to one received frame.
pub enum FilterOutcome<T> {
    /// This is the response we were waiting for.
    Matched(T),
    /// Unrelated bus traffic; keep waiting.
    Ignore,
    /// A negative response (or other definitive failure) for this request.
    Refused(u8),
}

/// Run `request_factory` -> send -> wait for `response_filter` to match,
/// retrying per the dialog's bounded-attempt budget.
///
/// `notifier`, when given, gets a `force_notify()` between receive timeouts
/// so a long wait doesn't let the PCM's own communication timeout expire
/// underneath the dialog.
pub async fn run_query<T, C: Clock>(
    device: &mut dyn DevicePort,
    cancellation: &CancellationToken,
    notifier: Option<&mut ToolPresentNotifier<C>>,
    build_request: impl Fn() -> Vec<u8>,
    mut response_filter: impl FnMut(&Frame) -> FilterOutcome<T>,
) -> ObdResult<T> {
    device.clear_message_queue().await;
    let mut notifier = notifier;

    for attempt in 0..MAX_SEND_ATTEMPTS {
        if cancellation.is_cancelled() {
            return Err(ObdError::Cancelled);
        }

        let bytes = build_request();
        let frame = Frame::new(bytes, std::time::Instant::now());
        device.send_message(&frame).await?;

        let mut timeouts = 0u32;
        for _ in 0..MAX_RECEIVE_ITERATIONS {
            if cancellation.is_cancelled() {
                return Err(ObdError::Cancelled);
            }
            match device.receive_message().await {
                Some(candidate) => match response_filter(&candidate) {
                    FilterOutcome::Matched(value) => return Ok(value),
                    FilterOutcome::Ignore => continue,
                    FilterOutcome::Refused(code) => {
                        log::debug!("query refused with code 0x{:02X}, continuing to listen", code);
                        continue;
                    }
                },
                None => {
                    timeouts += 1;
                    log::debug!(
                        "query receive timeout {}/{} (send attempt {}/{})",
                        timeouts,
                        MAX_TIMEOUTS,
                        attempt + 1,
                        MAX_SEND_ATTEMPTS
                    );
                    if let Some(n) = notifier.as_deref_mut() {
                        n.force_notify(device).await?;
                    }
                    if timeouts >= MAX_TIMEOUTS {
                        break;
                    }
                }
            }
        }
    }

    Err(ObdError::Timeout)
}
