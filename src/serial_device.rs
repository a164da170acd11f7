//! A minimal reference [`DevicePort`] over a real serial port.
//!
//! This is a skeleton, not a certified J2534/ELM driver: concrete vendor
//! pass-through adapters speak their own proprietary command sets over the
//! wire and are plugged in as separate implementations of `DevicePort` (see
//! `crate::device`). This transport exists to show the shape such an
//! adapter takes — background reader thread feeding a queue, synchronous
//! writes, speed renegotiation by reopening the port — grounded in the same
//! pattern the crate's own `KDriveFT12` reference transport uses for its
//! serial link: a dedicated thread drains the hardware, a channel hands
//! completed frames to the async side.
//!
//! Framing here is deliberately simple (one length-prefix byte per frame)
//! rather than the bit-level VPW framing a real interface chip performs in
//! hardware; a genuine pass-through adapter exposes already-framed VPW
//! messages over its own command protocol, which this skeleton does not
//! attempt to emulate.

use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serialport::SerialPort;
use tokio::sync::mpsc;

use crate::device::{DeviceCapabilities, DevicePort, TimeoutScenario, VpwSpeed};
use crate::error::{ObdError, ObdResult};
use crate::frame::Frame;

/// Read-timeout budget per scenario, matching the "devices supply the
/// values, the core only names the scenario" split in `device::TimeoutScenario`.
fn timeout_for(scenario: TimeoutScenario) -> Duration {
    match scenario {
        TimeoutScenario::Minimum => Duration::from_millis(100),
        TimeoutScenario::ReadProperty => Duration::from_millis(250),
        TimeoutScenario::ReadMemoryBlock => Duration::from_millis(500),
        TimeoutScenario::SendKernel => Duration::from_millis(1000),
        TimeoutScenario::ReadCrc => Duration::from_millis(2000),
    }
}

struct ReaderHandle {
    stop: std_mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// Reference serial transport: opens a port at the given path, spawns a
/// background thread that drains it into a bounded channel, and exposes
/// `DevicePort` on top of that channel.
pub struct SerialPassThruDevice {
    path: String,
    port: Box<dyn SerialPort>,
    incoming: mpsc::Receiver<Frame>,
    reader: ReaderHandle,
    capabilities: DeviceCapabilities,
    current_scenario: TimeoutScenario,
    speed: VpwSpeed,
}

impl SerialPassThruDevice {
    /// Open `path` at the standard VPW baud rate and start the background
    /// reader. The port is not yet protocol-initialized; call
    /// [`DevicePort::initialize`] before using it.
    pub fn open(path: &str) -> ObdResult<Self> {
        let (port, incoming, reader) = Self::open_at_baud(path, Self::baud_for(VpwSpeed::Standard))?;
        Ok(SerialPassThruDevice {
            path: path.to_string(),
            port,
            incoming,
            reader,
            capabilities: DeviceCapabilities {
                max_send_size: 4096,
                max_receive_size: 4096,
                max_flash_write_send_size: 4096,
                supports_4x: true,
                supports_single_dpid_logging: false,
                supports_stream_logging: false,
                enable_4x_read_write: true,
            },
            current_scenario: TimeoutScenario::Minimum,
            speed: VpwSpeed::Standard,
        })
    }

    fn baud_for(speed: VpwSpeed) -> u32 {
        match speed {
            VpwSpeed::Standard => 10_400,
            VpwSpeed::FourX => 41_600,
        }
    }

    fn open_at_baud(
        path: &str,
        baud: u32,
    ) -> ObdResult<(Box<dyn SerialPort>, mpsc::Receiver<Frame>, ReaderHandle)> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| ObdError::Error(format!("opening {path}: {e}")))?;

        let reader_port = port
            .try_clone()
            .map_err(|e| ObdError::Error(format!("cloning serial handle for {path}: {e}")))?;

        let (tx, rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let join = thread::spawn(move || Self::reader_loop(reader_port, tx, stop_rx));

        Ok((
            port,
            rx,
            ReaderHandle {
                stop: stop_tx,
                join: Some(join),
            },
        ))
    }

    /// Drains raw bytes off the port, reassembles length-prefixed frames,
    /// and forwards each to the async side. Runs until told to stop or the
    /// channel's receiver is dropped.
    fn reader_loop(
        mut port: Box<dyn SerialPort>,
        tx: mpsc::Sender<Frame>,
        stop: std_mpsc::Receiver<()>,
    ) {
        let mut buf = [0u8; 256];
        let mut pending = Vec::new();
        loop {
            if stop.try_recv().is_ok() {
                break;
            }
            match port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(frame) = Self::extract_frame(&mut pending) {
                        if tx.blocking_send(frame).is_err() {
                            return;
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    log::error!("serial read error: {e}");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// `[len, bytes...]` framing: a single length-prefix byte per frame.
    fn extract_frame(pending: &mut Vec<u8>) -> Option<Frame> {
        let len = *pending.first()? as usize;
        if pending.len() < 1 + len {
            return None;
        }
        let bytes = pending[1..1 + len].to_vec();
        pending.drain(..1 + len);
        Frame::try_new(bytes, Instant::now())
    }
}

impl Drop for SerialPassThruDevice {
    fn drop(&mut self) {
        self.reader.stop();
    }
}

#[async_trait(?Send)]
impl DevicePort for SerialPassThruDevice {
    async fn initialize(&mut self) -> ObdResult<()> {
        log::info!("initializing serial VPW transport on {}", self.path);
        self.read_voltage().await?;
        Ok(())
    }

    async fn send_message(&mut self, frame: &Frame) -> ObdResult<()> {
        let bytes = frame.as_bytes();
        if bytes.len() > 255 {
            return Err(ObdError::Error(
                "frame too long for the reference serial framing (max 255 bytes)".to_string(),
            ));
        }
        let mut out = Vec::with_capacity(bytes.len() + 1);
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
        self.port
            .write_all(&out)
            .map_err(|e| ObdError::Error(format!("serial write failed: {e}")))?;
        Ok(())
    }

    async fn receive_message(&mut self) -> Option<Frame> {
        let budget = timeout_for(self.current_scenario);
        tokio::time::timeout(budget, self.incoming.recv()).await.ok().flatten()
    }

    async fn set_timeout(&mut self, scenario: TimeoutScenario) -> ObdResult<TimeoutScenario> {
        let prev = self.current_scenario;
        self.current_scenario = scenario;
        Ok(prev)
    }

    async fn set_vpw_speed(&mut self, speed: VpwSpeed) -> ObdResult<()> {
        if speed == self.speed {
            return Ok(());
        }
        self.reader.stop();
        let (port, incoming, reader) = Self::open_at_baud(&self.path, Self::baud_for(speed))?;
        self.port = port;
        self.incoming = incoming;
        self.reader = reader;
        self.speed = speed;
        Ok(())
    }

    async fn clear_message_queue(&mut self) {
        while self.incoming.try_recv().is_ok() {}
    }

    async fn clear_message_buffer(&mut self) -> ObdResult<()> {
        self.clear_message_queue().await;
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| ObdError::Error(format!("clearing serial buffers: {e}")))
    }

    async fn read_voltage(&mut self) -> ObdResult<f64> {
        // Real pass-through adapters expose battery voltage as a vendor
        // ioctl/command; this skeleton has no such channel, so it reports
        // a fixed placeholder rather than fabricate hardware access.
        Ok(0.0)
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }

    fn current_timeout_scenario(&self) -> TimeoutScenario {
        self.current_scenario
    }
}

impl std::fmt::Display for SerialPassThruDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerialPassThruDevice({})", self.path)
    }
}
