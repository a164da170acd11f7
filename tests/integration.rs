//! End-to-end exercises of whole operations against the scripted mock
//! transport, driven entirely through the public API — no module paths
//! internal to the crate. Mirrors the literal-byte scenarios covered at
//! the unit level in `vehicle.rs`/`kernel.rs`, but each test here drives a
//! complete operation (vin read, unlock, bulk read with cancellation)
//! rather than one frame exchange.

use std::cell::Cell;

use async_trait::async_trait;

use vpw_dialog::cancel::CancellationToken;
use vpw_dialog::clock::SystemClock;
use vpw_dialog::device::{DeviceCapabilities, DevicePort, TimeoutScenario, VpwSpeed};
use vpw_dialog::frame::{self, Frame};
use vpw_dialog::mock_device::MockDevice;
use vpw_dialog::pcminfo;
use vpw_dialog::status::NullStatusObserver;
use vpw_dialog::vehicle::{KeyAlgorithm, Vehicle};
use vpw_dialog::{kernel, ObdResult};

struct FixedKey(u16);
impl KeyAlgorithm for FixedKey {
    fn compute_key(&self, _algorithm_id: u8, _seed: u16) -> ObdResult<u16> {
        Ok(self.0)
    }
}

#[tokio::test]
async fn reads_vin_end_to_end() {
    let mut dev = MockDevice::new();
    dev.push_response(vec![0x6C, 0xF0, 0x10, 0x7C, 0x01, 0x00, b'1', b'G', b'N', b'E', b'K']);
    dev.push_response(vec![
        0x6C, 0xF0, 0x10, 0x7C, 0x02, 0x00, b'N', b'R', b'9', b'J', b'6', b'1',
    ]);
    dev.push_response(vec![
        0x6C, 0xF0, 0x10, 0x7C, 0x03, 0x00, b'M', b'2', b'3', b'3', b'4', b'5',
    ]);
    let mut vehicle = Vehicle::new(dev, SystemClock, NullStatusObserver);
    let token = CancellationToken::new();

    let vin = vehicle.query_vin(&token).await.unwrap();
    assert_eq!(vin, "1GNEKNR9J61M23345");
}

#[tokio::test]
async fn unlocks_via_seed_key_handshake_end_to_end() {
    let mut dev = MockDevice::new();
    dev.push_response(vec![0x6C, 0xF0, 0x10, 0x67, 0x01, 0x12, 0x34]);
    dev.push_response(vec![0x6C, 0xF0, 0x10, 0x67, 0x02, 0x34]);
    let mut vehicle = Vehicle::new(dev, SystemClock, NullStatusObserver);
    let token = CancellationToken::new();

    let granted = vehicle
        .unlock_ecu(&token, 1, &FixedKey(0xABCD))
        .await
        .unwrap();

    assert!(granted);
    let sent = vehicle.device_mut().sent_frames();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].as_bytes()[3], 0x27);
    assert_eq!(sent[1].as_bytes(), &[0x6C, 0x10, 0xF0, 0x27, 0x02, 0xAB, 0xCD]);
}

#[tokio::test]
async fn refused_high_speed_permission_leaves_the_bus_at_standard_speed() {
    let mut dev = MockDevice::new();
    dev.push_response(vec![0x6C, 0xF0, 0x22, 0x7F, 0xA0, 0x31]);
    let mut vehicle = Vehicle::new(dev, SystemClock, NullStatusObserver);
    let token = CancellationToken::new();

    let result = vehicle.vehicle_set_vpw_4x(&token).await;

    assert!(result.is_err());
    assert_eq!(vehicle.device_mut().speed(), VpwSpeed::Standard);
}

/// Forwards every call to an inner `MockDevice`, cancelling a shared token
/// once a fixed number of `receive_message` calls have gone by. Lets a
/// single-future integration test reproduce "the caller cancels mid bulk
/// read" without a second concurrent task driving the cancellation.
struct CancelAfterReceives {
    inner: MockDevice,
    token: CancellationToken,
    remaining: Cell<u32>,
}

#[async_trait(?Send)]
impl DevicePort for CancelAfterReceives {
    async fn initialize(&mut self) -> ObdResult<()> {
        self.inner.initialize().await
    }
    async fn send_message(&mut self, frame: &Frame) -> ObdResult<()> {
        self.inner.send_message(frame).await
    }
    async fn receive_message(&mut self) -> Option<Frame> {
        let frame = self.inner.receive_message().await;
        let remaining = self.remaining.get().saturating_sub(1);
        self.remaining.set(remaining);
        if remaining == 0 {
            self.token.cancel();
        }
        frame
    }
    async fn set_timeout(&mut self, scenario: TimeoutScenario) -> ObdResult<TimeoutScenario> {
        self.inner.set_timeout(scenario).await
    }
    async fn set_vpw_speed(&mut self, speed: VpwSpeed) -> ObdResult<()> {
        self.inner.set_vpw_speed(speed).await
    }
    async fn clear_message_queue(&mut self) {
        self.inner.clear_message_queue().await
    }
    async fn clear_message_buffer(&mut self) -> ObdResult<()> {
        self.inner.clear_message_buffer().await
    }
    async fn read_voltage(&mut self) -> ObdResult<f64> {
        self.inner.read_voltage().await
    }
    fn capabilities(&self) -> DeviceCapabilities {
        self.inner.capabilities()
    }
    fn current_timeout_scenario(&self) -> TimeoutScenario {
        self.inner.current_timeout_scenario()
    }
}

#[tokio::test]
async fn bulk_read_honors_cancellation_mid_operation_and_still_cleans_up() {
    let inner = MockDevice::with_capabilities(DeviceCapabilities {
        max_receive_size: 1024 + 12,
        supports_4x: false,
        ..Default::default()
    });
    let token = CancellationToken::new();
    // upload-request ack + upload-packet ack = 2 setup receives, then 2
    // successful block reads = 4 receives total before cancellation fires,
    // right after the second block completes.
    let dev = CancelAfterReceives {
        inner,
        token: token.clone(),
        remaining: Cell::new(4),
    };
    let mut vehicle = Vehicle::new(dev, SystemClock, NullStatusObserver);

    let mut info = pcminfo::known_variant("P01_P59").unwrap();
    info.image_size = 3072;
    info.kernel_max_block_size = 1024;
    info.kernel_version_support = false;
    info.flash_id_support = false;
    info.flash_crc_support = false;

    vehicle.device_mut().inner.push_response(vec![0x6C, 0xF0, 0x10, 0x74]);
    vehicle.device_mut().inner.push_response(vec![0x6C, 0xF0, 0x10, 0x76]);
    for i in 0..2u32 {
        let mut bytes = vec![0x6D, 0xF0, 0x10, 0x76, 0x01];
        bytes.extend_from_slice(&1024u16.to_be_bytes());
        bytes.extend_from_slice(&(i * 1024).to_be_bytes()[1..]);
        bytes.extend_from_slice(&vec![0u8; 1024]);
        frame::add_block_checksum(&mut bytes);
        vehicle.device_mut().inner.push_response(bytes);
    }

    let kernel_image = vec![0u8; 16];
    let clock = SystemClock;
    let result = kernel::read_contents(&mut vehicle, &token, &clock, &info, None, &kernel_image).await;

    // cancellation surfaces as `Ok(None)`, not an error -- `cleanup()` still
    // ran (it's unconditional in `read_contents`) so the bus was left idle
    // rather than abandoned mid-kernel-session.
    assert!(result.unwrap().is_none());
    // disable-normal-traffic + upload request + upload packet + 2 block
    // reads = 5; no block-read request went out beyond the second.
    assert_eq!(vehicle.device_mut().inner.sent_frames().len(), 5);
}
