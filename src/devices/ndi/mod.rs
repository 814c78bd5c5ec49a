//! NDI optical tracker driver
//!
//! Drives the tracker's command dialogue over a serial [`Transport`] and
//! polls pose frames on an internal acquisition thread.
//!
//! # State machine
//!
//! ```text
//! CLOSED → OPEN → INITIALIZED → CONFIGURED → TOOLS_ENABLED → TRACKING
//!    ▲                                                          │
//!    └────────────────────── disconnect ───────────────────────-┘
//! ```
//!
//! - CLOSED→OPEN: open the serial device and `INIT:`. A `RESET` reply means
//!   the device was left in high-speed mode by a previous crash; issue a
//!   hard reset and re-`INIT`.
//! - OPEN→INITIALIZED: `COMM:` with the configured baud code, 8N1, no
//!   handshake (cuts down on CRC errors and timeouts).
//! - INITIALIZED→CONFIGURED: `VSEL:` when a measurement volume is
//!   configured; on rejection the available volumes are queried with
//!   `SFLIST:03` and logged for the operator.
//! - CONFIGURED→TOOLS_ENABLED: the port enabling sequence below.
//! - TOOLS_ENABLED→TRACKING: `TSTART:` plus the acquisition thread.
//!
//! # Threading
//!
//! One acquisition thread polls `TX:` at the configured rate and publishes
//! frames into the shared [`FrameBuffer`]. The tracker core (device handle,
//! descriptor table, stray slots) sits behind one mutex; `command()` and
//! SROM upload serialize with the polling loop by taking it. Shutdown is a
//! shared `AtomicBool` observed each tick, the thread handle joined on stop.

pub mod protocol;
pub mod strays;
pub mod tools;

use crate::core::types::{
    identity_matrix, ndi_transform_to_matrix, ToolPose, ToolStatus, TrackedFrame,
};
use crate::core::{Clock, FrameBuffer};
use crate::error::{Error, Result};
use crate::transport::{device_name, SerialTransport, Transport};
use parking_lot::Mutex;
use protocol::NdiDevice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use strays::StraySlots;
use tools::{ToolDescriptor, VIRTUAL_SROM_SIZE};

/// SROM upload block size: 64 bytes, 128 hex characters per `PVWR:`
const SROM_BLOCK_SIZE: usize = 64;

/// Ports scanned when the serial port is configured as -1
const MAX_SERIAL_PORT_NUMBER: usize = 20;

/// Tracker connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Closed,
    Open,
    Initialized,
    Configured,
    ToolsEnabled,
    Tracking,
}

/// Tool LED states accepted by [`NdiTracker::set_tool_led`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    Off,
    On,
    Flash,
}

/// Driver settings distilled from configuration
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// 1-based serial port number; -1 probes ports 0..19
    pub serial_port: i32,
    pub baud_rate: u32,
    /// 0 selects the device default volume
    pub measurement_volume_number: usize,
    /// 0 disables stray tracking
    pub max_strays: usize,
    pub acquisition_rate_hz: f64,
    pub stray_reference_frame: String,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            serial_port: -1,
            baud_rate: 9600,
            measurement_volume_number: 0,
            max_strays: 0,
            acquisition_rate_hz: 50.0,
            stray_reference_frame: "Tracker".to_string(),
        }
    }
}

/// Everything the acquisition thread and the public API share.
struct TrackerCore {
    settings: TrackerSettings,
    device: Option<NdiDevice>,
    tools: Vec<ToolDescriptor>,
    strays: Option<StraySlots>,
    state: TrackerState,
    is_tracking: bool,
    last_frame_number: u32,
    version: Option<String>,
}

pub struct NdiTracker {
    core: Arc<Mutex<TrackerCore>>,
    buffer: Arc<FrameBuffer>,
    clock: Clock,
    shutdown: Arc<AtomicBool>,
    poll_handle: Option<JoinHandle<()>>,
}

impl NdiTracker {
    pub fn new(
        settings: TrackerSettings,
        tools: Vec<ToolDescriptor>,
        buffer: Arc<FrameBuffer>,
        clock: Clock,
    ) -> Self {
        let strays = if settings.max_strays > 0 {
            Some(StraySlots::new(settings.max_strays))
        } else {
            None
        };
        Self {
            core: Arc::new(Mutex::new(TrackerCore {
                settings,
                device: None,
                tools,
                strays,
                state: TrackerState::Closed,
                is_tracking: false,
                last_frame_number: 0,
                version: None,
            })),
            buffer,
            clock,
            shutdown: Arc::new(AtomicBool::new(false)),
            poll_handle: None,
        }
    }

    /// Look for a tracker on the configured port, or scan ports 0..19 when
    /// the port is -1. On success the resolved port number is stored and the
    /// device version captured via `VER:0`.
    pub fn probe(&self) -> Result<()> {
        let mut core = self.core.lock();
        if core.is_tracking {
            return Ok(());
        }

        let candidates: Vec<usize> = if core.settings.serial_port > 0 {
            vec![(core.settings.serial_port - 1) as usize]
        } else {
            (0..MAX_SERIAL_PORT_NUMBER).collect()
        };

        for index in candidates {
            let path = device_name(index);
            let transport = match SerialTransport::open(&path, 9600) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let mut device = NdiDevice::new(Box::new(transport));
            if device.command("INIT:").is_err() {
                continue;
            }
            core.settings.serial_port = index as i32 + 1;
            if let Ok(version) = device.command("VER:0") {
                core.version = Some(version);
            }
            return Ok(());
        }
        Err(Error::Other("no tracker found on any serial port".into()))
    }

    /// Open the configured serial port and run the connect sequence.
    pub fn connect(&self) -> Result<()> {
        let path = {
            let core = self.core.lock();
            if core.settings.serial_port <= 0 {
                return Err(Error::Config(
                    "serial port not resolved; run probe first or configure it".into(),
                ));
            }
            device_name((core.settings.serial_port - 1) as usize)
        };
        // The device always wakes up at 9600 baud; COMM: raises it later.
        let transport = SerialTransport::open(&path, 9600)?;
        self.connect_with(Box::new(transport))
    }

    /// Run the connect sequence over a caller-supplied transport.
    pub fn connect_with(&self, transport: Box<dyn Transport>) -> Result<()> {
        let mut core = self.core.lock();
        core.connect(transport)
    }

    /// `TSTART:` and spawn the acquisition thread.
    pub fn start_tracking(&mut self) -> Result<()> {
        {
            let mut core = self.core.lock();
            if core.is_tracking {
                return Ok(());
            }
            core.start_tracking()?;
        }

        self.shutdown.store(false, Ordering::Relaxed);
        let core = Arc::clone(&self.core);
        let buffer = Arc::clone(&self.buffer);
        let clock = self.clock;
        let shutdown = Arc::clone(&self.shutdown);
        let period = {
            let rate = self.core.lock().settings.acquisition_rate_hz;
            Duration::from_secs_f64(1.0 / rate.max(1.0))
        };

        self.poll_handle = Some(
            thread::Builder::new()
                .name("ndi-acquisition".to_string())
                .spawn(move || {
                    acquisition_loop(core, buffer, clock, shutdown, period);
                })
                .map_err(|e| Error::Other(format!("failed to spawn acquisition thread: {}", e)))?,
        );
        log::info!("Tracker acquisition started");
        Ok(())
    }

    /// Stop the acquisition thread and `TSTOP:`.
    pub fn stop_tracking(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.poll_handle.take() {
            handle.join().map_err(|_| Error::ThreadPanic)?;
        }
        let mut core = self.core.lock();
        core.stop_tracking()
    }

    /// Clear virtual ROMs, disable ports, restore default comm settings, and
    /// close the serial device.
    pub fn disconnect(&mut self) -> Result<()> {
        self.stop_tracking()?;
        let mut core = self.core.lock();
        core.disconnect()
    }

    /// Send a raw command, serialized with the polling loop.
    pub fn command(&self, command: &str) -> Result<String> {
        let mut core = self.core.lock();
        let device = core
            .device
            .as_mut()
            .ok_or_else(|| Error::Other("tracker is not connected".into()))?;
        Ok(device.command(command)?)
    }

    /// Sound the tracker beeper `n` times (clamped to 0..=9).
    ///
    /// Rejected while tracking is active; see DESIGN.md for why this guard
    /// reads inverted.
    pub fn beep(&self, n: i32) -> Result<()> {
        let mut core = self.core.lock();
        if core.is_tracking {
            return Err(Error::Other("beep failed: not connected to the device".into()));
        }
        let n = n.clamp(0, 9);
        let device = core
            .device
            .as_mut()
            .ok_or_else(|| Error::Other("tracker is not connected".into()))?;
        device.command(&format!("BEEP:{}", n))?;
        Ok(())
    }

    /// Drive one of a tool's visible LEDs.
    ///
    /// Rejected unless tracking is active; see DESIGN.md.
    pub fn set_tool_led(&self, source_id: &str, led: u8, state: LedState) -> Result<()> {
        let mut core = self.core.lock();
        if !core.is_tracking {
            return Err(Error::Other("set_tool_led failed: not recording".into()));
        }
        let handle = core
            .tools
            .iter()
            .find(|t| t.id == source_id)
            .map(|t| t.port_handle)
            .ok_or_else(|| Error::Other(format!("tool descriptor not found for {}", source_id)))?;
        if handle == 0 {
            return Err(Error::Other("set_tool_led failed: invalid port handle".into()));
        }
        let state = match state {
            LedState::Off => 'B',
            LedState::On => 'S',
            LedState::Flash => 'F',
        };
        let device = core
            .device
            .as_mut()
            .ok_or_else(|| Error::Other("tracker is not connected".into()))?;
        device.command(&format!("LED:{:02X}{}{}", handle, led + 1, state))?;
        Ok(())
    }

    pub fn state(&self) -> TrackerState {
        self.core.lock().state
    }

    pub fn version(&self) -> Option<String> {
        self.core.lock().version.clone()
    }

    /// Descriptor snapshot (id, transform name, serial number, enabled).
    pub fn tool_summaries(&self) -> Vec<(String, String, String, bool)> {
        self.core
            .lock()
            .tools
            .iter()
            .map(|t| {
                (
                    t.id.clone(),
                    t.transform_name.clone(),
                    t.serial_number.clone(),
                    t.port_enabled,
                )
            })
            .collect()
    }

    /// Run a single polling tick synchronously (test hook; the daemon uses
    /// the acquisition thread).
    pub fn poll_once(&self) -> Result<Option<TrackedFrame>> {
        let now = self.clock.now_sec();
        let mut core = self.core.lock();
        core.poll_once(now)
    }

    pub fn buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.buffer)
    }
}

impl Drop for NdiTracker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.poll_handle.take() {
            let _ = handle.join();
        }
    }
}

fn acquisition_loop(
    core: Arc<Mutex<TrackerCore>>,
    buffer: Arc<FrameBuffer>,
    clock: Clock,
    shutdown: Arc<AtomicBool>,
    period: Duration,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let tick_start = Instant::now();

        let frame = {
            let mut core = core.lock();
            core.poll_once(clock.now_sec())
        };
        match frame {
            Ok(Some(frame)) => buffer.push(frame),
            Ok(None) => {}
            Err(Error::Tracker(e)) if e.is_transient() => {
                log::warn!("Tracker tick skipped: {}", e);
            }
            Err(e) => {
                log::error!("Tracker polling failed: {}", e);
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < period {
            thread::sleep(period - elapsed);
        }
    }
    log::info!("Acquisition thread exiting");
}

impl TrackerCore {
    fn connect(&mut self, transport: Box<dyn Transport>) -> Result<()> {
        let mut device = NdiDevice::new(transport);

        // The device may have been left in high-speed mode by a prior crash;
        // INIT at 9600 then reports RESET and needs to be re-issued.
        let needs_reset = match device.command("INIT:") {
            Ok(reply) => reply.starts_with("RESET"),
            Err(_) => true,
        };
        if needs_reset {
            let _ = device.command("RESET:");
            device.command("INIT:")?;
        }
        self.state = TrackerState::Open;

        let baud = protocol::baud_code(self.settings.baud_rate).ok_or_else(|| {
            Error::Config(format!(
                "Illegal baud rate: {}. Valid values: 9600, 14400, 19200, 38400, 57600, 115200, 921600, 1228739",
                self.settings.baud_rate
            ))
        })?;
        device.command(&format!("COMM:{}0001", baud))?;
        device.set_baud_rate(self.settings.baud_rate)?;
        self.state = TrackerState::Initialized;

        if self.settings.measurement_volume_number != 0 {
            let volume = self.settings.measurement_volume_number;
            match device.command(&format!("VSEL:{}", volume)) {
                Ok(_) => {
                    if let Ok(list) = device.command("SFLIST:03") {
                        if let Err(e) = protocol::log_volume_list(&list, volume, false) {
                            log::debug!("Could not decode volume list: {}", e);
                        }
                    }
                }
                Err(e) => {
                    log::error!("Failed to set measurement volume {}: {}", volume, e);
                    match device.command("SFLIST:03") {
                        Ok(list) => {
                            if let Err(e) = protocol::log_volume_list(&list, 0, true) {
                                log::error!("Could not decode volume list: {}", e);
                            }
                        }
                        Err(e) => {
                            log::error!("Failed to retrieve list of available volumes: {}", e)
                        }
                    }
                    return Err(e.into());
                }
            }
        }
        self.state = TrackerState::Configured;

        if let Ok(version) = device.command("VER:0") {
            self.version = Some(version);
        }

        self.device = Some(device);
        if let Err(e) = self.enable_tool_ports() {
            log::error!("Failed to enable tool ports");
            return Err(e);
        }
        self.state = TrackerState::ToolsEnabled;
        Ok(())
    }

    fn device(&mut self) -> Result<&mut NdiDevice> {
        self.device
            .as_mut()
            .ok_or_else(|| Error::Other("tracker is not connected".into()))
    }

    fn start_tracking(&mut self) -> Result<()> {
        let device = self.device()?;
        if let Err(e) = device.command("TSTART:") {
            log::error!("Failed TSTART: {}", e);
            self.device = None;
            self.state = TrackerState::Closed;
            return Err(e.into());
        }
        self.is_tracking = true;
        self.state = TrackerState::Tracking;
        Ok(())
    }

    fn stop_tracking(&mut self) -> Result<()> {
        if !self.is_tracking {
            return Ok(());
        }
        let device = self.device()?;
        if let Err(e) = device.command("TSTOP:") {
            log::error!("{}", e);
        }
        self.is_tracking = false;
        self.state = TrackerState::ToolsEnabled;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.device.is_none() {
            self.state = TrackerState::Closed;
            return Ok(());
        }

        let mut tools = std::mem::take(&mut self.tools);
        for tool in &mut tools {
            self.clear_virtual_srom(tool);
        }
        self.tools = tools;

        self.disable_tool_ports();

        // return to default comm settings
        if let Some(device) = self.device.as_mut() {
            if let Err(e) = device.command("COMM:00000") {
                log::error!("{}", e);
            }
        }
        self.device = None;
        self.state = TrackerState::Closed;
        Ok(())
    }

    /// The port enabling sequence, run at connect and again when a wired
    /// tool is hot-plugged during tracking.
    ///
    /// Sub-step failures are logged and folded into an overall failure
    /// without tearing anything down; the caller decides recovery. The
    /// PHINF port-status word is kept separate from this accumulator.
    fn enable_tool_ports(&mut self) -> Result<()> {
        let mut success = true;

        // pause tracking
        if self.is_tracking {
            if let Err(e) = self.device()?.command("TSTOP:") {
                log::error!("{}", e);
                success = false;
            }
        }

        // free ports that are waiting to be freed
        let reply = self.device()?.command("PHSR:01")?;
        for (handle, _) in protocol::parse_phsr(&reply).map_err(Error::Tracker)? {
            if let Err(e) = self.device()?.command(&format!("PHF:{:02X}", handle)) {
                log::error!("{}", e);
                success = false;
            }
        }

        // Resolve handles and upload SROM images before initializing the
        // pending ports.
        let mut tools = std::mem::take(&mut self.tools);
        let mut failure = None;
        for tool in tools.iter_mut().filter(|t| t.virtual_srom.is_some()) {
            if let Err(e) = self.update_port_handle(tool) {
                log::error!("Failed to determine port handle for tool {}", tool.id);
                failure = Some(e);
                break;
            }
            if let Err(e) = self.send_srom_to_tracker(tool) {
                log::error!("Failed to send SROM to tool {}", tool.id);
                failure = Some(e);
                break;
            }
        }
        self.tools = tools;
        if let Some(e) = failure {
            return Err(e);
        }

        // Initialize ports waiting to be initialized; repeat because
        // multi-channel tools expose additional handles after init.
        loop {
            let reply = self.device()?.command("PHSR:02")?;
            let pending = protocol::parse_phsr(&reply).map_err(Error::Tracker)?;
            if pending.is_empty() {
                break;
            }
            let mut init_failed = false;
            for (handle, _) in pending {
                if let Err(e) = self.device()?.command(&format!("PINIT:{:02X}", handle)) {
                    log::error!("{}", e);
                    success = false;
                    init_failed = true;
                }
            }
            if init_failed {
                break;
            }
        }

        // enable initialized tools
        let reply = self.device()?.command("PHSR:03")?;
        for (handle, _) in protocol::parse_phsr(&reply).map_err(Error::Tracker)? {
            let info = self
                .device()?
                .command(&format!("PHINF:{:02X}0001", handle))?;
            let info = protocol::parse_phinf(&info, protocol::PHINF_TOOL_INFO)
                .map_err(Error::Tracker)?;
            let mode = info.tool_info.map(|t| t.enable_mode()).unwrap_or('D');
            if let Err(e) = self
                .device()?
                .command(&format!("PENA:{:02X}{}", handle, mode))
            {
                log::error!("{}", e);
                success = false;
            }
        }

        // Wired tools without a ROM are resolved after enabling, because
        // splitter channels only appear once the tool is enabled.
        let mut tools = std::mem::take(&mut self.tools);
        let mut failure = None;
        for tool in tools.iter_mut().filter(|t| t.is_wired_without_rom()) {
            if let Err(e) = self.update_port_handle(tool) {
                log::error!("Failed to determine port handle for tool {}", tool.id);
                failure = Some(e);
                break;
            }
        }
        self.tools = tools;
        if let Some(e) = failure {
            return Err(e);
        }

        // refresh identities for all descriptors
        let _ = self.device()?.command("PHSR:00")?;
        let mut tools = std::mem::take(&mut self.tools);
        for tool in tools.iter_mut() {
            let flags = protocol::PHINF_TOOL_INFO
                | protocol::PHINF_PART_NUMBER
                | protocol::PHINF_PORT_LOCATION;
            let Ok(device) = self.device() else {
                success = false;
                break;
            };
            let reply = match device
                .command(&format!("PHINF:{:02X}{:04X}", tool.port_handle, flags))
            {
                Ok(reply) => reply,
                Err(e) => {
                    log::error!("{}", e);
                    success = false;
                    continue;
                }
            };
            let parsed = match protocol::parse_phinf(&reply, flags) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::error!("{}", e);
                    success = false;
                    continue;
                }
            };
            if let Some(part_number) = parsed.part_number {
                tool.part_number = part_number;
            }
            if let Some(info) = parsed.tool_info {
                tool.serial_number = info.serial_number();
                tool.revision = info.revision();
                tool.manufacturer = info.manufacturer();
                tool.port_enabled = info.port_status & protocol::ENABLED != 0;
            }
            if !tool.port_enabled {
                log::error!("Failed to enable tool {}", tool.id);
                success = false;
            }
        }
        self.tools = tools;

        // resume tracking
        if self.is_tracking {
            if let Err(e) = self.device()?.command("TSTART:") {
                log::error!("Failed TSTART: {}", e);
                success = false;
            }
        }

        if success {
            Ok(())
        } else {
            Err(Error::Other("enabling tool ports failed".into()))
        }
    }

    fn disable_tool_ports(&mut self) {
        let was_tracking = self.is_tracking;
        let Some(device) = self.device.as_mut() else {
            return;
        };

        if was_tracking {
            if let Err(e) = device.command("TSTOP:") {
                log::error!("{}", e);
            }
        }

        match device.command("PHSR:04") {
            Ok(reply) => match protocol::parse_phsr(&reply) {
                Ok(handles) => {
                    for (handle, _) in handles {
                        if let Err(e) = device.command(&format!("PDIS:{:02X}", handle)) {
                            log::error!("{}", e);
                        }
                    }
                }
                Err(e) => log::error!("{}", e),
            },
            Err(e) => log::error!("{}", e),
        }

        for tool in &mut self.tools {
            tool.port_enabled = false;
        }

        if was_tracking {
            if let Err(e) = device.command("TSTART:") {
                log::error!("{}", e);
            }
        }
    }

    fn update_port_handle(&mut self, tool: &mut ToolDescriptor) -> Result<()> {
        if tool.wired_port_number >= 0 {
            let reply = self.device()?.command("PHSR:00")?;
            let handles = protocol::parse_phsr(&reply).map_err(Error::Tracker)?;
            let mut found = false;
            for (handle, status) in handles {
                if status & protocol::PHSR_TOOL_IN_PORT == 0 {
                    continue;
                }
                let reply = self
                    .device()?
                    .command(&format!("PHINF:{:02X}0021", handle))?;
                let flags = protocol::PHINF_TOOL_INFO | protocol::PHINF_PORT_LOCATION;
                let parsed = protocol::parse_phinf(&reply, flags).map_err(Error::Tracker)?;
                if let Some(location) = parsed.port_location {
                    if location.combined() == tool.wired_port_number {
                        tool.port_handle = handle;
                        found = true;
                        break;
                    }
                }
            }
            if !found {
                return Err(Error::Other(format!(
                    "Active tool not found in port {}. Make sure the tool is plugged in.",
                    tool.wired_port_number
                )));
            }
        } else {
            let reply = self.device()?.command("PHRQ:*********1****")?;
            tool.port_handle = protocol::parse_phrq(&reply).map_err(Error::Tracker)?;
        }
        Ok(())
    }

    fn send_srom_to_tracker(&mut self, tool: &ToolDescriptor) -> Result<()> {
        let Some(srom) = tool.virtual_srom.as_ref() else {
            return Ok(());
        };
        let device = self.device()?;
        for offset in (0..VIRTUAL_SROM_SIZE).step_by(SROM_BLOCK_SIZE) {
            device.command(" VER 0")?;
            device.command(&format!(
                "PVWR:{:02X}{:04X}{}",
                tool.port_handle,
                offset,
                protocol::hex_encode(&srom[offset..offset + SROM_BLOCK_SIZE])
            ))?;
        }
        Ok(())
    }

    fn clear_virtual_srom(&mut self, tool: &mut ToolDescriptor) {
        if tool.virtual_srom.is_none() {
            return;
        }
        if let Ok(device) = self.device() {
            let _ = device.command(&format!("PHF:{:02X}", tool.port_handle));
        }
        tool.port_enabled = false;
        tool.port_handle = 0;
    }

    /// One polling tick: `TX:`, status classification, stray association,
    /// hot-plug detection. Returns the frame to publish.
    fn poll_once(&mut self, timestamp: f64) -> Result<Option<TrackedFrame>> {
        if !self.is_tracking {
            return Err(Error::Other("poll called while not tracking".into()));
        }
        let with_strays = self.strays.is_some();
        let command = if with_strays { "TX:1801" } else { "TX:0801" };
        let reply = self
            .device()?
            .command(command)
            .map_err(Error::Tracker)?;
        let tx = protocol::parse_tx(&reply, with_strays).map_err(Error::Tracker)?;

        if let Some(slots) = self.strays.as_mut() {
            slots.update(&tx.strays);
        }

        // Fallback ordering key when the tracker does not report a per-tool
        // frame index.
        self.last_frame_number += 1;
        let default_frame_number = self.last_frame_number;

        let mut frame = TrackedFrame::new(timestamp);
        for tool in &self.tools {
            let mut matrix = identity_matrix();
            let mut status = ToolStatus::Ok;
            let mut frame_number = default_frame_number;

            if tool.port_handle == 0 {
                log::error!("Port handle is invalid for tool {}", tool.id);
            } else {
                let record = tx.tool(tool.port_handle);
                let (transform, port_status, tx_frame) = match record {
                    Some(r) => (r.transform, r.port_status, r.frame_number),
                    None => (None, 0, 0),
                };

                let valid = protocol::TOOL_IN_PORT | protocol::INITIALIZED | protocol::ENABLED;
                if port_status & valid != valid {
                    status = ToolStatus::Missing;
                } else {
                    if transform.is_none() {
                        status = ToolStatus::OutOfView;
                    }
                    if port_status & protocol::OUT_OF_VOLUME != 0 {
                        status = ToolStatus::OutOfVolume;
                    }
                }

                if let Some(t) = transform {
                    matrix = ndi_transform_to_matrix(&t);
                    if tx_frame != 0 {
                        frame_number = tx_frame;
                        if tx_frame > self.last_frame_number {
                            self.last_frame_number = tx_frame;
                        }
                    }
                }
            }

            frame.poses.push(ToolPose {
                name: tool.transform_name.clone(),
                matrix,
                status,
                frame_number,
            });
        }

        if let Some(slots) = self.strays.as_ref() {
            for index in 0..slots.len() {
                let (position, status) = slots.slot(index);
                let transform = [
                    1.0,
                    0.0,
                    0.0,
                    0.0,
                    position[0],
                    position[1],
                    position[2],
                    0.0,
                ];
                frame.poses.push(ToolPose {
                    name: format!(
                        "Stray{:02}To{}",
                        index + 1,
                        self.settings.stray_reference_frame
                    ),
                    matrix: ndi_transform_to_matrix(&transform),
                    status,
                    frame_number: default_frame_number,
                });
            }
        }

        // A wired tool was plugged in mid-session; make it available without
        // dropping the session.
        if tx.system_status & protocol::PORT_OCCUPIED != 0 {
            log::warn!("A wired tool has been plugged into the tracker");
            if let Err(e) = self.enable_tool_ports() {
                log::error!("Re-enabling tool ports after hot-plug failed: {}", e);
            }
        }

        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn tracker(settings: TrackerSettings, tools: Vec<ToolDescriptor>) -> NdiTracker {
        let buffer = Arc::new(FrameBuffer::new("TrackerStream"));
        NdiTracker::new(settings, tools, buffer, Clock::new())
    }

    #[test]
    fn beep_rejected_while_tracking() {
        let t = tracker(TrackerSettings::default(), Vec::new());
        t.core.lock().is_tracking = true;
        assert!(t.beep(3).is_err());
    }

    #[test]
    fn set_tool_led_rejected_while_idle() {
        let t = tracker(
            TrackerSettings::default(),
            vec![ToolDescriptor::new("Stylus", "Tracker", -1)],
        );
        assert!(t.set_tool_led("Stylus", 0, LedState::On).is_err());
    }

    #[test]
    fn connect_reissues_init_after_reset_reply() {
        let mock = MockTransport::new();
        mock.expect("INIT:", "RESET");
        mock.expect("RESET:", "OKAY");
        mock.expect("INIT:", "OKAY");
        mock.expect_always("COMM:", "OKAY");
        mock.expect_always("VER:0", "DRISHTI SIM 001");
        mock.expect_always("PHSR:", "00");
        let commands = mock.clone();

        let t = tracker(
            TrackerSettings {
                baud_rate: 115200,
                ..TrackerSettings::default()
            },
            Vec::new(),
        );
        t.connect_with(Box::new(mock)).unwrap();
        assert_eq!(t.state(), TrackerState::ToolsEnabled);

        let sent = commands.commands();
        assert_eq!(sent[0], "INIT:");
        assert_eq!(sent[1], "RESET:");
        assert_eq!(sent[2], "INIT:");
        assert_eq!(sent[3], "COMM:50001");
    }

    #[test]
    fn illegal_baud_rate_is_rejected() {
        let mock = MockTransport::new();
        mock.expect("INIT:", "OKAY");
        let t = tracker(
            TrackerSettings {
                baud_rate: 230400,
                ..TrackerSettings::default()
            },
            Vec::new(),
        );
        assert!(t.connect_with(Box::new(mock)).is_err());
    }
}
