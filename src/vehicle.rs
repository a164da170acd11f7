//! High-level operations composing the frame, protocol, device, and query
//! layers. Every operation here follows the same shape: pick a timeout
//! scenario, clear the queue, issue requests through the query engine,
//! decode the result.

use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::device::{DevicePort, TimeoutScenario, VpwSpeed};
use crate::error::{ObdError, ObdResult};
use crate::notifier::ToolPresentNotifier;
use crate::protocol::{self, BlockId};
use crate::query::{run_query, FilterOutcome};
use crate::status::StatusObserver;

/// A seed/key algorithm, indexed by a small integer id, injected rather
/// than hard-coded — unknown algorithm ids are a user-visible error, never
/// a silent no-op.
pub trait KeyAlgorithm {
    fn compute_key(&self, algorithm_id: u8, seed: u16) -> ObdResult<u16>;
}

/// The high-level vehicle session. Owns the device; dropping it disposes
/// the device (no explicit `dispose` beyond Rust's own `Drop`).
pub struct Vehicle<D: DevicePort, C: Clock, S: StatusObserver> {
    device: D,
    notifier: ToolPresentNotifier<C>,
    status: S,
}

impl<D: DevicePort, C: Clock + Clone, S: StatusObserver> Vehicle<D, C, S> {
    pub fn new(device: D, clock: C, status: S) -> Self {
        Vehicle {
            device,
            notifier: ToolPresentNotifier::new(clock),
            status,
        }
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    async fn read_block(
        &mut self,
        cancellation: &CancellationToken,
        block: BlockId,
    ) -> ObdResult<(u8, Vec<u8>)> {
        self.device.set_timeout(TimeoutScenario::ReadProperty).await?;
        run_query(
            &mut self.device,
            cancellation,
            Some(&mut self.notifier),
            || protocol::build_read_block_request(block),
            |frame| match protocol::parse_read_block_response(frame, block) {
                Ok(value) => FilterOutcome::Matched(value),
                Err(ObdError::Refused(code)) => FilterOutcome::Refused(code),
                Err(_) => FilterOutcome::Ignore,
            },
        )
        .await
    }

    /// Three sequential block reads; concatenation happens only after all
    /// three succeed, so a mid-sequence failure is visible as itself rather
    /// than a garbled VIN.
    pub async fn query_vin(&mut self, cancellation: &CancellationToken) -> ObdResult<String> {
        let (_, vin1) = self.read_block(cancellation, BlockId::Vin1).await?;
        let (_, vin2) = self.read_block(cancellation, BlockId::Vin2).await?;
        let (_, vin3) = self.read_block(cancellation, BlockId::Vin3).await?;
        let mut bytes = Vec::with_capacity(17);
        bytes.extend_from_slice(&vin1);
        bytes.extend_from_slice(&vin2);
        bytes.extend_from_slice(&vin3);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn query_serial(&mut self, cancellation: &CancellationToken) -> ObdResult<Vec<u8>> {
        let (_, s1) = self.read_block(cancellation, BlockId::Serial1).await?;
        let (_, s2) = self.read_block(cancellation, BlockId::Serial2).await?;
        let (_, s3) = self.read_block(cancellation, BlockId::Serial3).await?;
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(&s1);
        bytes.extend_from_slice(&s2);
        bytes.extend_from_slice(&s3);
        Ok(bytes)
    }

    pub async fn query_os_id(&mut self, cancellation: &CancellationToken) -> ObdResult<Vec<u8>> {
        self.read_block(cancellation, BlockId::OsId).await.map(|(_, d)| d)
    }

    pub async fn query_calibration_id(
        &mut self,
        cancellation: &CancellationToken,
    ) -> ObdResult<Vec<u8>> {
        self.read_block(cancellation, BlockId::CalibrationId)
            .await
            .map(|(_, d)| d)
    }

    pub async fn query_hardware_id(
        &mut self,
        cancellation: &CancellationToken,
    ) -> ObdResult<Vec<u8>> {
        self.read_block(cancellation, BlockId::HardwareId)
            .await
            .map(|(_, d)| d)
    }

    pub async fn query_bcc(&mut self, cancellation: &CancellationToken) -> ObdResult<Vec<u8>> {
        self.read_block(cancellation, BlockId::Bcc).await.map(|(_, d)| d)
    }

    pub async fn query_mec(&mut self, cancellation: &CancellationToken) -> ObdResult<u8> {
        let (_, data) = self.read_block(cancellation, BlockId::Mec).await?;
        Ok(data[0])
    }

    /// Seed request, then (unless already unlocked) compute a key via the
    /// injected algorithm and send unlock. Always returns a boolean, even
    /// on a negative unlock status — only protocol-level failures (no
    /// response, cancellation, transport errors) are `Err`.
    pub async fn unlock_ecu(
        &mut self,
        cancellation: &CancellationToken,
        algorithm_id: u8,
        key_algorithm: &dyn KeyAlgorithm,
    ) -> ObdResult<bool> {
        self.device.set_timeout(TimeoutScenario::Minimum).await?;
        let seed = run_query(
            &mut self.device,
            cancellation,
            Some(&mut self.notifier),
            protocol::build_seed_request,
            |frame| match protocol::parse_seed_response(frame) {
                Ok(value) => FilterOutcome::Matched(value),
                Err(ObdError::Refused(code)) => FilterOutcome::Refused(code),
                Err(_) => FilterOutcome::Ignore,
            },
        )
        .await?;

        let seed = match seed {
            protocol::SeedResult::AlreadyUnlocked => {
                self.status.add_user_message("PCM is already unlocked");
                return Ok(true);
            }
            protocol::SeedResult::Seed(seed) => seed,
        };

        let key = key_algorithm.compute_key(algorithm_id, seed).map_err(|e| {
            self.status
                .add_user_message(&format!("unsupported security algorithm: {e}"));
            e
        })?;

        let status = run_query(
            &mut self.device,
            cancellation,
            Some(&mut self.notifier),
            move || protocol::build_unlock_request(key),
            |frame| match protocol::parse_unlock_response(frame) {
                Ok(value) => FilterOutcome::Matched(value),
                Err(ObdError::Refused(code)) => FilterOutcome::Refused(code),
                Err(_) => FilterOutcome::Ignore,
            },
        )
        .await?;

        let granted = status == protocol::UnlockStatus::Allowed;
        self.status
            .add_user_message(if granted { "unlock granted" } else { "unlock denied" });
        Ok(granted)
    }

    /// Broadcast a speed-change permission request and gather every
    /// module's reply until the bus goes quiet. `Some(ids)` if every
    /// responder granted, `None` if any refused.
    pub async fn request_high_speed_permission(
        &mut self,
        cancellation: &CancellationToken,
    ) -> ObdResult<Option<Vec<u8>>> {
        self.device.clear_message_queue().await;
        let bytes = protocol::build_high_speed_permission_request();
        let frame = crate::frame::Frame::new(bytes, std::time::Instant::now());
        self.device.send_message(&frame).await?;

        let mut granters = Vec::new();
        let mut refused = false;
        loop {
            if cancellation.is_cancelled() {
                return Err(ObdError::Cancelled);
            }
            match self.device.receive_message().await {
                None => break,
                Some(candidate) => match protocol::parse_high_speed_permission_response(&candidate) {
                    Ok((module_id, true)) => granters.push(module_id),
                    Ok((_, false)) => refused = true,
                    Err(_) => continue,
                },
            }
        }
        Ok(if refused { None } else { Some(granters) })
    }

    /// Permission phase, then broadcast `begin_high_speed`, watch briefly
    /// for a late refusal, then actually switch the transport speed.
    pub async fn vehicle_set_vpw_4x(&mut self, cancellation: &CancellationToken) -> ObdResult<()> {
        let granted = self.request_high_speed_permission(cancellation).await?;
        if granted.is_none() {
            return Err(ObdError::Error(
                "one or more modules refused the 4x speed change".to_string(),
            ));
        }

        let bytes = protocol::build_begin_high_speed_request();
        let frame = crate::frame::Frame::new(bytes, std::time::Instant::now());
        self.device.send_message(&frame).await?;

        // Short window watching for a late refusal before committing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Some(candidate) = self.device.receive_message().await {
            if candidate.mode() == crate::frame::Mode::NegativeResponse as u8 {
                return Err(ObdError::Error(
                    "a module refused the speed change after begin_high_speed".to_string(),
                ));
            }
        }

        self.device.set_vpw_speed(VpwSpeed::FourX).await?;
        self.notifier.force_notify(&mut self.device).await?;
        Ok(())
    }

    /// Exit the kernel (at 4x if the transport is currently there, then at
    /// 1x as a fallback since not every module observes the speed switch),
    /// then clear DTCs twice, 250ms apart.
    pub async fn cleanup(&mut self) -> ObdResult<()> {
        let exit_bytes = protocol::build_exit_kernel_request();
        let exit_frame = crate::frame::Frame::new(exit_bytes, std::time::Instant::now());
        self.device.send_message(&exit_frame).await?;

        self.device.set_vpw_speed(VpwSpeed::Standard).await?;
        let exit_frame_1x = crate::frame::Frame::new(
            protocol::build_exit_kernel_request(),
            std::time::Instant::now(),
        );
        self.device.send_message(&exit_frame_1x).await?;

        for _ in 0..2 {
            let dtc_bytes = protocol::build_clear_dtc_request();
            let dtc_frame = crate::frame::Frame::new(dtc_bytes, std::time::Instant::now());
            self.device.send_message(&dtc_frame).await?;
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Ok(())
    }

    pub fn status(&self) -> &S {
        &self.status
    }

    pub fn notifier_mut(&mut self) -> &mut ToolPresentNotifier<C> {
        &mut self.notifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::mock_device::MockDevice;
    use crate::status::NullStatusObserver;

    struct FixedKey(u16);
    impl KeyAlgorithm for FixedKey {
        fn compute_key(&self, _algorithm_id: u8, _seed: u16) -> ObdResult<u16> {
            Ok(self.0)
        }
    }

    fn vehicle(device: MockDevice) -> Vehicle<MockDevice, FakeClock, NullStatusObserver> {
        Vehicle::new(device, FakeClock::new(), NullStatusObserver)
    }

    #[tokio::test]
    async fn query_vin_concatenates_three_blocks() {
        let mut dev = MockDevice::new();
        dev.push_response(vec![0x6C, 0xF0, 0x10, 0x7C, 0x01, 0x00, b'1', b'G', b'N', b'E', b'K']);
        dev.push_response(vec![
            0x6C, 0xF0, 0x10, 0x7C, 0x02, 0x00, b'N', b'R', b'9', b'J', b'6', b'1',
        ]);
        dev.push_response(vec![
            0x6C, 0xF0, 0x10, 0x7C, 0x03, 0x00, b'M', b'2', b'3', b'3', b'4', b'5',
        ]);
        let mut vehicle = vehicle(dev);
        let token = CancellationToken::new();
        let vin = vehicle.query_vin(&token).await.unwrap();
        assert_eq!(vin, "1GNEKNR9J61M23345");
    }

    #[tokio::test]
    async fn unlock_already_unlocked_sends_no_unlock_request() {
        let mut dev = MockDevice::new();
        dev.push_response(vec![0x6C, 0xF0, 0x10, 0x67, 0x01, 0x37]);
        let mut vehicle = vehicle(dev);
        let token = CancellationToken::new();
        let granted = vehicle
            .unlock_ecu(&token, 1, &FixedKey(0xABCD))
            .await
            .unwrap();
        assert!(granted);
        assert_eq!(vehicle.device_mut().sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn unlock_happy_path_sends_seed_then_unlock() {
        let mut dev = MockDevice::new();
        dev.push_response(vec![0x6C, 0xF0, 0x10, 0x67, 0x01, 0x12, 0x34]);
        dev.push_response(vec![0x6C, 0xF0, 0x10, 0x67, 0x02, 0x34]);
        let mut vehicle = vehicle(dev);
        let token = CancellationToken::new();
        let granted = vehicle
            .unlock_ecu(&token, 1, &FixedKey(0xABCD))
            .await
            .unwrap();
        assert!(granted);
        let sent = vehicle.device_mut().sent_frames();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].as_bytes(), &[0x6C, 0x10, 0xF0, 0x27, 0x02, 0xAB, 0xCD]);
    }

    #[tokio::test]
    async fn high_speed_permission_fails_fast_on_any_refusal() {
        let mut dev = MockDevice::new();
        dev.push_response(vec![0x6C, 0xF0, 0x10, 0xE0]);
        dev.push_response(vec![0x6C, 0xF0, 0x22, 0x7F, 0xA0, 0x31]);
        let mut vehicle = vehicle(dev);
        let token = CancellationToken::new();
        let result = vehicle.vehicle_set_vpw_4x(&token).await;
        assert!(result.is_err());
        assert_eq!(vehicle.device_mut().speed(), VpwSpeed::Standard);
        // only the permission request was sent, never begin_high_speed
        assert_eq!(vehicle.device_mut().sent_frames().len(), 1);
    }
}
