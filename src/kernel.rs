//! Kernel orchestration: upload a loader and/or kernel image in
//! decreasing-address chunks, verify it booted, then drive the bulk memory
//! read through it with CRC verification. The most intricate sequence in
//! the system — see the teacher's own multi-step `KDriveFT12::connect`
//! handshake for the shape of "several sequential round-trips, each
//! individually retried, composed into one longer operation."

use std::time::Duration;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::cancel::CancellationToken;
use crate::clock::Clock;
use crate::device::{DevicePort, TimeoutScenario};
use crate::error::{ObdError, ObdResult};
use crate::flashchip::{self, FlashChip};
use crate::pcminfo::PcmInfo;
use crate::protocol::{self, AddressWidth, CopyType, KernelQuery, UploadPacket};
use crate::query::{run_query, FilterOutcome};
use crate::status::StatusObserver;
use crate::vehicle::Vehicle;

const MAX_SEND_ATTEMPTS: u32 = 10;
const UPLOAD_REQUEST_MAX_DECLARED: usize = 4096;
const PRE_SEND_DELAY: Duration = Duration::from_millis(50);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Upload `payload` to `info.load_address()` and jump to it.
///
/// Sends highest addresses first, lowest (and therefore the jump target)
/// last: the PCM copies each packet into RAM as it arrives, so withholding
/// the lowest-addressed, `Execute`-tagged packet until the end guarantees
/// no half-written code is ever jumped to.
pub async fn pcm_execute<D: DevicePort, C: Clock + Clone, S: StatusObserver>(
    vehicle: &mut Vehicle<D, C, S>,
    cancellation: &CancellationToken,
    info: &PcmInfo,
    payload: &[u8],
) -> ObdResult<()> {
    let load_address = info.load_address();
    let declared = payload.len().min(UPLOAD_REQUEST_MAX_DECLARED) as u32;

    // Quiet the PCM's own periodic broadcast traffic for the duration of the
    // upload; fire-and-forget, nothing acknowledges it.
    let quiet_bytes = protocol::build_disable_normal_message_transmission_request();
    let quiet_frame = crate::frame::Frame::new(quiet_bytes, std::time::Instant::now());
    vehicle.device_mut().send_message(&quiet_frame).await?;

    vehicle.device_mut().set_timeout(TimeoutScenario::SendKernel).await?;
    let width = info.address_width();
    run_query(
        vehicle.device_mut(),
        cancellation,
        None::<&mut crate::notifier::ToolPresentNotifier<C>>,
        move || protocol::build_upload_request(width, declared, load_address),
        |frame| match protocol::parse_upload_request_response(frame) {
            Ok(()) => FilterOutcome::Matched(()),
            Err(ObdError::Refused(code)) => FilterOutcome::Refused(code),
            Err(_) => FilterOutcome::Ignore,
        },
    )
    .await?;

    // A loader's receive buffer is small; clamp packet size when pushing the
    // kernel itself through one. Otherwise use the device's own ceiling.
    let packet_payload_size = if info.loader_required {
        512
    } else {
        vehicle.device_mut().capabilities().max_flash_write_send_size.saturating_sub(12)
    }
    .max(1);

    let chunk_count = payload.len() / packet_payload_size;
    let remainder_len = payload.len() % packet_payload_size;

    // Build (address, slice) pairs in ascending order, then send them
    // highest address first.
    let mut chunks: Vec<(u32, &[u8])> = Vec::with_capacity(chunk_count + 1);
    for i in 0..chunk_count {
        let offset = i * packet_payload_size;
        let address = load_address + offset as u32;
        chunks.push((address, &payload[offset..offset + packet_payload_size]));
    }
    if remainder_len > 0 {
        let offset = chunk_count * packet_payload_size;
        let address = load_address + offset as u32;
        chunks.push((address, &payload[offset..offset + remainder_len]));
    }

    // Sent in descending-address order; chunk 0 (the lowest address, and
    // therefore `load_address` itself) goes out last and is the only one
    // tagged `Execute`.
    for (i, (address, data)) in chunks.iter().enumerate().rev() {
        let copy_type = if i == 0 { CopyType::Execute } else { CopyType::Copy };
        write_payload(vehicle, cancellation, *address, data, copy_type).await?;
    }

    if info.kernel_version_support {
        let version = query_kernel_version(vehicle, cancellation).await?;
        if version == 0 {
            return Err(ObdError::Error(
                "kernel reported version 0 after upload; it never started".to_string(),
            ));
        }
    }

    Ok(())
}

async fn write_payload<D: DevicePort, C: Clock + Clone, S: StatusObserver>(
    vehicle: &mut Vehicle<D, C, S>,
    cancellation: &CancellationToken,
    address: u32,
    data: &[u8],
    copy_type: CopyType,
) -> ObdResult<()> {
    for attempt in 0..MAX_SEND_ATTEMPTS {
        if cancellation.is_cancelled() {
            return Err(ObdError::Cancelled);
        }
        tokio::time::sleep(PRE_SEND_DELAY).await;

        let packet = UploadPacket {
            copy_type,
            address,
            data,
        };
        let bytes = protocol::build_upload_packet(&packet);
        let frame = crate::frame::Frame::new(bytes, std::time::Instant::now());
        vehicle.device_mut().send_message(&frame).await?;

        match wait_for_upload_ack(vehicle, cancellation).await {
            Ok(()) => return Ok(()),
            Err(ObdError::Timeout) => {
                log::debug!("upload packet at 0x{:06X} timed out, attempt {}/{}", address, attempt + 1, MAX_SEND_ATTEMPTS);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(ObdError::Timeout)
}

async fn wait_for_upload_ack<D: DevicePort, C: Clock + Clone, S: StatusObserver>(
    vehicle: &mut Vehicle<D, C, S>,
    cancellation: &CancellationToken,
) -> ObdResult<()> {
    for _ in 0..50 {
        if cancellation.is_cancelled() {
            return Err(ObdError::Cancelled);
        }
        match vehicle.device_mut().receive_message().await {
            None => return Err(ObdError::Timeout),
            Some(frame) => match protocol::parse_upload_ack(&frame) {
                Ok(()) => return Ok(()),
                Err(ObdError::Refused(code)) => {
                    log::debug!("ignoring refusal 0x{:02X} while waiting for upload ack", code);
                    continue;
                }
                Err(_) => continue,
            },
        }
    }
    Err(ObdError::Timeout)
}

async fn query_kernel_version<D: DevicePort, C: Clock + Clone, S: StatusObserver>(
    vehicle: &mut Vehicle<D, C, S>,
    cancellation: &CancellationToken,
) -> ObdResult<u32> {
    let data = run_query(
        vehicle.device_mut(),
        cancellation,
        None::<&mut crate::notifier::ToolPresentNotifier<C>>,
        || protocol::build_kernel_version_request(KernelQuery::Version),
        |frame| match protocol::parse_kernel_version_response(frame, KernelQuery::Version) {
            Ok(data) if data.len() >= 4 => FilterOutcome::Matched(data),
            Ok(_) => FilterOutcome::Ignore,
            Err(ObdError::Refused(code)) => FilterOutcome::Refused(code),
            Err(_) => FilterOutcome::Ignore,
        },
    )
    .await?;
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Ask the running kernel which flash chip it's talking to, used to look up
/// the chip's registered memory ranges for postflight CRC verification.
async fn query_flash_type<D: DevicePort, C: Clock + Clone, S: StatusObserver>(
    vehicle: &mut Vehicle<D, C, S>,
    cancellation: &CancellationToken,
) -> ObdResult<u32> {
    let data = run_query(
        vehicle.device_mut(),
        cancellation,
        None::<&mut crate::notifier::ToolPresentNotifier<C>>,
        || protocol::build_kernel_version_request(KernelQuery::FlashType),
        |frame| match protocol::parse_kernel_version_response(frame, KernelQuery::FlashType) {
            Ok(data) if data.len() >= 4 => FilterOutcome::Matched(data),
            Ok(_) => FilterOutcome::Ignore,
            Err(ObdError::Refused(code)) => FilterOutcome::Refused(code),
            Err(_) => FilterOutcome::Ignore,
        },
    )
    .await?;
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

/// Read the whole of `info.image_size` bytes through an uploaded kernel,
/// with per-block retries, progress reporting, and (if supported) a
/// postflight CRC verification against the flash chip's registered
/// memory ranges. Always runs `cleanup` on the way out, including on
/// cancellation.
pub async fn read_contents<D: DevicePort, C: Clock + Clone, S: StatusObserver>(
    vehicle: &mut Vehicle<D, C, S>,
    cancellation: &CancellationToken,
    clock: &C,
    info: &PcmInfo,
    loader_image: Option<&[u8]>,
    kernel_image: &[u8],
) -> ObdResult<Option<Vec<u8>>> {
    let result = read_contents_inner(vehicle, cancellation, clock, info, loader_image, kernel_image).await;
    vehicle.cleanup().await?;
    result
}

async fn read_contents_inner<D: DevicePort, C: Clock + Clone, S: StatusObserver>(
    vehicle: &mut Vehicle<D, C, S>,
    cancellation: &CancellationToken,
    clock: &C,
    info: &PcmInfo,
    loader_image: Option<&[u8]>,
    kernel_image: &[u8],
) -> ObdResult<Option<Vec<u8>>> {
    vehicle.notifier_mut().force_notify(vehicle.device_mut()).await.ok();

    if vehicle.device_mut().capabilities().supports_4x {
        if let Err(e) = vehicle.vehicle_set_vpw_4x(cancellation).await {
            vehicle.status().add_user_message(&format!(
                "4x speed change failed, continuing at standard speed: {e}"
            ));
        }
    } else {
        vehicle
            .status()
            .add_user_message("device does not support 4x, continuing at standard speed");
    }

    let mut loader_info = info.clone();
    if loader_info.loader_required {
        if let Some(loader) = loader_image {
            pcm_execute(vehicle, cancellation, &loader_info, loader).await?;
            loader_info.loader_required = false;
        } else {
            return Err(ObdError::Error(
                "this PCM variant requires a loader but none was supplied".to_string(),
            ));
        }
    }
    pcm_execute(vehicle, cancellation, &loader_info, kernel_image).await?;

    let chip = if info.flash_id_support {
        match query_flash_type(vehicle, cancellation).await {
            Ok(id) => flashchip::lookup(id),
            Err(_) => flashchip::lookup(0),
        }
    } else {
        flashchip::lookup(0)
    };

    vehicle.device_mut().set_timeout(TimeoutScenario::ReadMemoryBlock).await?;
    let block_size = vehicle
        .device_mut()
        .capabilities()
        .max_receive_size
        .saturating_sub(12)
        .min(info.kernel_max_block_size)
        .max(1);

    let mut image = vec![0u8; info.image_size as usize];
    let started = clock.now();
    let mut total_retries: u32 = 0;
    let mut address: usize = 0;

    while address < image.len() {
        if cancellation.is_cancelled() {
            vehicle.status().add_user_message("bulk read cancelled");
            return Ok(None);
        }
        let len = block_size.min(image.len() - address);
        match try_read_block(vehicle, cancellation, address as u32, len, &mut total_retries).await? {
            Some(data) => {
                image[address..address + len].copy_from_slice(&data);
            }
            None => {
                vehicle
                    .status()
                    .add_user_message("bulk read cancelled mid-block");
                return Ok(None);
            }
        }
        address += len;

        let elapsed = clock.now().duration_since(started);
        report_progress(vehicle.status(), address, image.len(), elapsed, total_retries);
    }

    if info.flash_id_support && info.flash_crc_support {
        verify_crc(vehicle, cancellation, &chip, &image).await?;
    }

    Ok(Some(image))
}

async fn try_read_block<D: DevicePort, C: Clock + Clone, S: StatusObserver>(
    vehicle: &mut Vehicle<D, C, S>,
    cancellation: &CancellationToken,
    address: u32,
    len: usize,
    total_retries: &mut u32,
) -> ObdResult<Option<Vec<u8>>> {
    for attempt in 0..MAX_SEND_ATTEMPTS {
        if cancellation.is_cancelled() {
            return Ok(None);
        }
        if attempt > 0 {
            *total_retries += 1;
        }
        let width = if address <= 0xFF_FFFF {
            AddressWidth::Short
        } else {
            AddressWidth::Long
        };
        let result = run_query(
            vehicle.device_mut(),
            cancellation,
            None::<&mut crate::notifier::ToolPresentNotifier<C>>,
            move || protocol::build_kernel_read_request(width, address, len as u8),
            |frame| match protocol::parse_kernel_read_response(frame, len) {
                Ok(data) => FilterOutcome::Matched(data),
                Err(ObdError::Refused(code)) => FilterOutcome::Refused(code),
                Err(_) => FilterOutcome::Ignore,
            },
        )
        .await;
        match result {
            Ok(data) => return Ok(Some(data)),
            Err(ObdError::Timeout) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(ObdError::Timeout)
}

fn report_progress<S: StatusObserver>(
    status: &S,
    done: usize,
    total: usize,
    elapsed: Duration,
    retries: u32,
) {
    let fraction = done as f64 / total.max(1) as f64;
    status.status_update_progress_bar(fraction, false);
    status.status_update_percent_done(&format!("{:.1}%", fraction * 100.0));
    status.status_update_retry_count(&retries.to_string());

    let elapsed_secs = elapsed.as_secs_f64().max(0.001);
    let kbps = (done as f64 / 1024.0) / elapsed_secs;
    status.status_update_kbps(&format!("{:.1} KB/s", kbps));

    if done > 0 && done < total {
        let remaining = total - done;
        let eta_secs = (remaining as f64) / (done as f64 / elapsed_secs);
        status.status_update_time_remaining(&format!("{:.0}s", eta_secs));
    }
}

async fn verify_crc<D: DevicePort, C: Clock + Clone, S: StatusObserver>(
    vehicle: &mut Vehicle<D, C, S>,
    cancellation: &CancellationToken,
    chip: &FlashChip,
    image: &[u8],
) -> ObdResult<()> {
    for range in &chip.ranges {
        if cancellation.is_cancelled() {
            return Err(ObdError::Cancelled);
        }
        let start = range.address as usize;
        let end = start + range.length as usize;
        if end > image.len() {
            continue;
        }
        let expected = CRC32.checksum(&image[start..end]);

        vehicle.device_mut().set_timeout(TimeoutScenario::ReadCrc).await?;
        let range_address = range.address;
        let range_length = range.length;
        let data = run_query(
            vehicle.device_mut(),
            cancellation,
            None::<&mut crate::notifier::ToolPresentNotifier<C>>,
            move || protocol::build_kernel_crc_request(range_address, range_length),
            |frame| match protocol::parse_kernel_version_response(frame, KernelQuery::Crc) {
                Ok(data) if data.len() >= 4 => FilterOutcome::Matched(data),
                Ok(_) => FilterOutcome::Ignore,
                Err(ObdError::Refused(code)) => FilterOutcome::Refused(code),
                Err(_) => FilterOutcome::Ignore,
            },
        )
        .await?;
        let reported = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if reported != expected {
            return Err(ObdError::Error(format!(
                "CRC mismatch for range 0x{:06X}..0x{:06X}: kernel reported 0x{:08X}, image computes 0x{:08X}",
                start, end, reported, expected
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::mock_device::MockDevice;
    use crate::status::NullStatusObserver;

    fn test_info() -> PcmInfo {
        crate::pcminfo::known_variant("P01_P59").unwrap()
    }

    #[tokio::test]
    async fn upload_sends_highest_address_chunk_last_with_execute() {
        let dev = MockDevice::with_capabilities(crate::device::DeviceCapabilities {
            max_flash_write_send_size: 32,
            ..Default::default()
        });
        let clock = FakeClock::new();
        let mut vehicle = Vehicle::new(dev, clock, NullStatusObserver);
        let token = CancellationToken::new();
        let mut info = test_info();
        info.kernel_version_support = false;

        // one upload-request ack, then one ack per packet
        vehicle
            .device_mut()
            .push_response(vec![0x6C, 0xF0, 0x10, 0x74]);
        let payload = vec![0xAAu8; 48]; // 2 chunks of 20 bytes given a 32-12=20 packet size
        for _ in 0..3 {
            vehicle
                .device_mut()
                .push_response(vec![0x6C, 0xF0, 0x10, 0x76]);
        }

        pcm_execute(&mut vehicle, &token, &info, &payload).await.unwrap();

        let sent = vehicle.device_mut().sent_frames();
        // first sent frame is the disable-normal-traffic notice, second the
        // upload request; the rest are packets
        let packets: Vec<_> = sent[2..].to_vec();
        let last = packets.last().unwrap();
        assert_eq!(last.as_bytes()[4], CopyType::Execute as u8);
        for p in &packets[..packets.len() - 1] {
            assert_eq!(p.as_bytes()[4], CopyType::Copy as u8);
        }
        // addresses strictly decreasing across the sent packets
        let addrs: Vec<u32> = packets
            .iter()
            .map(|f| {
                let b = f.as_bytes();
                u32::from_be_bytes([0, b[7], b[8], b[9]])
            })
            .collect();
        for w in addrs.windows(2) {
            assert!(w[0] > w[1]);
        }
    }

    /// Forwards every call to an inner `MockDevice`, cancelling `token`
    /// once a fixed number of `send_message` calls have gone out. Lets a
    /// single-future test reproduce "cancel mid-operation" without a
    /// second concurrent task.
    struct CancelAfterSends {
        inner: MockDevice,
        token: CancellationToken,
        remaining_receives: std::cell::Cell<u32>,
    }

    #[async_trait::async_trait(?Send)]
    impl DevicePort for CancelAfterSends {
        async fn initialize(&mut self) -> ObdResult<()> {
            self.inner.initialize().await
        }
        async fn send_message(&mut self, frame: &crate::frame::Frame) -> ObdResult<()> {
            self.inner.send_message(frame).await
        }
        async fn receive_message(&mut self) -> Option<crate::frame::Frame> {
            let frame = self.inner.receive_message().await;
            let remaining = self.remaining_receives.get();
            let new_remaining = remaining.saturating_sub(1);
            self.remaining_receives.set(new_remaining);
            if new_remaining == 0 {
                self.token.cancel();
            }
            frame
        }
        async fn set_timeout(
            &mut self,
            scenario: TimeoutScenario,
        ) -> ObdResult<TimeoutScenario> {
            self.inner.set_timeout(scenario).await
        }
        async fn set_vpw_speed(&mut self, speed: crate::device::VpwSpeed) -> ObdResult<()> {
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
        fn capabilities(&self) -> crate::device::DeviceCapabilities {
            self.inner.capabilities()
        }
        fn current_timeout_scenario(&self) -> TimeoutScenario {
            self.inner.current_timeout_scenario()
        }
    }

    #[tokio::test]
    async fn corrupted_checksum_block_times_out_without_mutating_the_image() {
        let dev = MockDevice::new();
        let clock = FakeClock::new();
        let mut vehicle = Vehicle::new(dev, clock, NullStatusObserver);
        let token = CancellationToken::new();

        let mut bytes = vec![0x6D, 0xF0, 0x10, 0x76, 0x01];
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes()[1..]);
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        crate::frame::add_block_checksum(&mut bytes);
        *bytes.last_mut().unwrap() = bytes.last().unwrap().wrapping_add(1);
        vehicle.device_mut().push_response(bytes);

        // `try_read_block` surfaces the failure as a plain `Err`, never an
        // `Ok(Some(data))` that a caller might copy into the image buffer —
        // the checksum mismatch is indistinguishable from a non-response at
        // this layer, so the only outcomes are "good data" or "no data".
        let mut total_retries = 0u32;
        let result = try_read_block(&mut vehicle, &token, 0, 4, &mut total_retries).await;
        assert!(matches!(result, Err(ObdError::Timeout)));
    }

    #[tokio::test]
    async fn bulk_read_stops_cleanly_on_cancellation() {
        let inner = MockDevice::with_capabilities(crate::device::DeviceCapabilities {
            max_receive_size: 1024 + 12,
            supports_4x: false,
            ..Default::default()
        });
        let token = CancellationToken::new();
        // upload-request ack + upload-packet ack = 2 setup receives, then 3
        // successful block reads = 5 receives total before cancellation
        // kicks in, right after the third block completes.
        let dev = CancelAfterSends {
            inner,
            token: token.clone(),
            remaining_receives: std::cell::Cell::new(5),
        };
        let clock = FakeClock::new();
        let mut vehicle = Vehicle::new(dev, clock.clone(), NullStatusObserver);
        let mut info = test_info();
        info.image_size = 4096;
        info.kernel_max_block_size = 1024;
        info.loader_required = false;
        info.kernel_version_support = false;
        info.flash_id_support = false;
        info.flash_crc_support = false;

        vehicle.device_mut().inner.push_response(vec![0x6C, 0xF0, 0x10, 0x74]);
        vehicle.device_mut().inner.push_response(vec![0x6C, 0xF0, 0x10, 0x76]);
        for i in 0..3u32 {
            let mut bytes = vec![0x6D, 0xF0, 0x10, 0x76, 0x01];
            bytes.extend_from_slice(&1024u16.to_be_bytes());
            bytes.extend_from_slice(&(i * 1024).to_be_bytes()[1..]);
            bytes.extend_from_slice(&vec![0u8; 1024]);
            crate::frame::add_block_checksum(&mut bytes);
            vehicle.device_mut().inner.push_response(bytes);
        }

        let kernel_image = vec![0u8; 16];
        let result = read_contents(&mut vehicle, &token, &clock, &info, None, &kernel_image).await;
        assert!(result.unwrap().is_none());
        // disable-normal-traffic + upload request + upload packet + 3 block
        // reads = 6; no block-read request went out beyond the third.
        assert_eq!(vehicle.device_mut().inner.sent_frames().len(), 6);
    }
}
