//! NDI command dialogue: ASCII commands, CR-terminated replies, fixed-width
//! field parsing.
//!
//! Reply grammar (vendor byte framing is handled below this layer):
//!
//! - `OKAY`, `RESET...`, or `ERRORxx` (two hex digits)
//! - `PHSR`: 2-hex handle count, then per handle 2-hex handle + 3-hex status
//! - `PHRQ`: 2-hex assigned handle
//! - `PHINF`: sections in option-flag order; tool info is 31 identity chars
//!   plus 2-hex port status, part number is 20 chars, port location is
//!   14 chars
//! - `TX`: newline-separated; 2-hex handle count, one record per handle
//!   (2-hex handle, then `MISSING` or 51 chars of fixed-point fields, then
//!   8-hex port status and 8-hex frame number), optional stray line, final
//!   4-hex system status
//!
//! Quaternion components and the RMS error are signed five-digit fields
//! scaled by 1e4; positions are signed six-digit fields scaled by 1e2.

use crate::error::{Error, Result};
use crate::transport::Transport;
use std::time::{Duration, Instant};

/// Port status bits (TX records and PHINF)
pub const TOOL_IN_PORT: u32 = 0x0001;
pub const INITIALIZED: u32 = 0x0010;
pub const ENABLED: u32 = 0x0020;
pub const OUT_OF_VOLUME: u32 = 0x0200;

/// System status bits (TX trailer)
pub const PORT_OCCUPIED: u16 = 0x0040;

/// PHSR status bit: a physical tool is plugged into this port
pub const PHSR_TOOL_IN_PORT: u16 = 0x001;

/// Device error code for a corrupted command (transient)
pub const ERR_BAD_CRC: u8 = 0x04;

const REPLY_TIMEOUT: Duration = Duration::from_millis(1000);
const MAX_REPLY_LEN: usize = 4096;

/// Errors raised by the command dialogue
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum NdiError {
    /// `ERRORxx` reply from the device
    #[error("device error {code:#04x}")]
    Device { code: u8 },

    /// No CR-terminated reply within the timeout
    #[error("reply timeout")]
    Timeout,

    /// Reply received but its fields did not parse
    #[error("malformed reply: {0}")]
    Malformed(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

impl NdiError {
    /// Transient errors are warned about and the polling tick is skipped;
    /// everything else fails the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NdiError::Timeout | NdiError::Device { code: ERR_BAD_CRC }
        )
    }
}

/// Map a configured baud rate to the `COMM:` speed code.
pub fn baud_code(baud_rate: u32) -> Option<u8> {
    match baud_rate {
        9600 => Some(0),
        14400 => Some(1),
        19200 => Some(2),
        38400 => Some(3),
        57600 => Some(4),
        115200 => Some(5),
        921600 => Some(6),
        1228739 => Some(7),
        _ => None,
    }
}

/// Uppercase hex encoding used by `PVWR:` payload blocks.
pub fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// Serial channel speaking the command dialect over a [`Transport`].
pub struct NdiDevice {
    transport: Box<dyn Transport>,
}

impl NdiDevice {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send one command and wait for its CR-terminated reply.
    ///
    /// `ERRORxx` replies are converted into [`NdiError::Device`]; every other
    /// reply (including `RESET`) is handed back for the caller to interpret.
    pub fn command(&mut self, command: &str) -> std::result::Result<String, NdiError> {
        self.transport
            .write(command.as_bytes())
            .and_then(|_| self.transport.write(b"\r"))
            .and_then(|_| self.transport.flush())
            .map_err(|e| NdiError::Io(e.to_string()))?;

        let reply = self.read_reply()?;
        if let Some(code) = reply.strip_prefix("ERROR") {
            let code = u8::from_str_radix(code.trim(), 16)
                .map_err(|_| NdiError::Malformed(reply.clone()))?;
            return Err(NdiError::Device { code });
        }
        Ok(reply)
    }

    /// Reconfigure the host side of the link after a `COMM:` exchange.
    pub fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        self.transport.set_baud_rate(baud)
    }

    fn read_reply(&mut self) -> std::result::Result<String, NdiError> {
        let deadline = Instant::now() + REPLY_TIMEOUT;
        let mut reply: Vec<u8> = Vec::with_capacity(64);
        let mut byte = [0u8; 1];
        loop {
            let n = self
                .transport
                .read(&mut byte)
                .map_err(|e| NdiError::Io(e.to_string()))?;
            if n == 0 {
                if Instant::now() >= deadline {
                    return Err(NdiError::Timeout);
                }
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            if byte[0] == b'\r' {
                return String::from_utf8(reply).map_err(|e| NdiError::Malformed(e.to_string()));
            }
            reply.push(byte[0]);
            if reply.len() > MAX_REPLY_LEN {
                return Err(NdiError::Malformed("reply exceeds maximum length".into()));
            }
        }
    }
}

fn hex_field(s: &str, range: std::ops::Range<usize>) -> std::result::Result<u32, NdiError> {
    let field = s
        .get(range.clone())
        .ok_or_else(|| NdiError::Malformed(format!("field {:?} out of range", range)))?;
    u32::from_str_radix(field, 16).map_err(|_| NdiError::Malformed(format!("bad hex '{}'", field)))
}

/// Parse a sign + fixed-digit decimal field scaled by `1/scale`.
fn signed_fixed(s: &str, scale: f64) -> std::result::Result<f64, NdiError> {
    if s.len() < 2 {
        return Err(NdiError::Malformed("short numeric field".into()));
    }
    let magnitude: f64 = s[1..]
        .parse::<u64>()
        .map_err(|_| NdiError::Malformed(format!("bad number '{}'", s)))? as f64;
    match &s[0..1] {
        "+" => Ok(magnitude / scale),
        "-" => Ok(-magnitude / scale),
        _ => Err(NdiError::Malformed(format!("bad sign in '{}'", s))),
    }
}

fn slice<'a>(s: &'a str, range: std::ops::Range<usize>) -> std::result::Result<&'a str, NdiError> {
    s.get(range)
        .ok_or_else(|| NdiError::Malformed("reply truncated".into()))
}

// ---------------------------------------------------------------------------
// PHSR / PHRQ
// ---------------------------------------------------------------------------

/// Parse a `PHSR:<mode>` reply into (handle, status) pairs.
pub fn parse_phsr(reply: &str) -> std::result::Result<Vec<(u8, u16)>, NdiError> {
    let count = hex_field(reply, 0..2)? as usize;
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let base = 2 + i * 5;
        let handle = hex_field(reply, base..base + 2)? as u8;
        let status = hex_field(reply, base + 2..base + 5)? as u16;
        handles.push((handle, status));
    }
    Ok(handles)
}

/// Parse a `PHRQ:` reply into the newly assigned handle.
pub fn parse_phrq(reply: &str) -> std::result::Result<u8, NdiError> {
    Ok(hex_field(reply, 0..2)? as u8)
}

// ---------------------------------------------------------------------------
// PHINF
// ---------------------------------------------------------------------------

/// Option flags for `PHINF:<handle><flags>`
pub const PHINF_TOOL_INFO: u16 = 0x0001;
pub const PHINF_PART_NUMBER: u16 = 0x0004;
pub const PHINF_PORT_LOCATION: u16 = 0x0020;

/// Tool identity section of a PHINF reply.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// 31 identity characters
    identity: String,
    /// Port status word (2 hex chars after the identity)
    pub port_status: u32,
}

impl ToolInfo {
    pub fn device_identity(&self) -> String {
        self.identity[0..8].trim().to_string()
    }

    pub fn manufacturer(&self) -> String {
        self.identity[8..20].trim().to_string()
    }

    pub fn revision(&self) -> String {
        self.identity[20..23].trim().to_string()
    }

    pub fn serial_number(&self) -> String {
        self.identity[23..31].trim().to_string()
    }

    /// Port enable mode derived from the tool class code (identity chars
    /// 0..2): button boxes track in `B`, references in `S`, the rest in the
    /// default `D`.
    pub fn enable_mode(&self) -> char {
        match &self.identity[0..2] {
            "03" => 'B',
            "01" => 'S',
            _ => 'D',
        }
    }
}

/// Wired port location section of a PHINF reply.
#[derive(Debug, Clone, Copy)]
pub struct PortLocation {
    pub port_number: i32,
    pub channel: i32,
}

impl PortLocation {
    /// Channel-major combined identifier matched against the configured
    /// `PortName` (accommodates 5-DOF splitter tools on one connector).
    pub fn combined(&self) -> i32 {
        self.channel * 100 + self.port_number
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhinfReply {
    pub tool_info: Option<ToolInfo>,
    pub part_number: Option<String>,
    pub port_location: Option<PortLocation>,
}

/// Parse a `PHINF:<handle><flags>` reply; sections appear in flag order.
pub fn parse_phinf(reply: &str, flags: u16) -> std::result::Result<PhinfReply, NdiError> {
    let mut out = PhinfReply::default();
    let mut pos = 0usize;

    if flags & PHINF_TOOL_INFO != 0 {
        let identity = slice(reply, pos..pos + 31)?.to_string();
        let port_status = hex_field(reply, pos + 31..pos + 33)?;
        out.tool_info = Some(ToolInfo {
            identity,
            port_status,
        });
        pos += 33;
    }
    if flags & PHINF_PART_NUMBER != 0 {
        out.part_number = Some(slice(reply, pos..pos + 20)?.trim().to_string());
        pos += 20;
    }
    if flags & PHINF_PORT_LOCATION != 0 {
        let location = slice(reply, pos..pos + 14)?;
        let port_number = location[10..12]
            .parse::<i32>()
            .map_err(|_| NdiError::Malformed("bad port number".into()))?
            - 1;
        let channel = location[12..14]
            .parse::<i32>()
            .map_err(|_| NdiError::Malformed("bad port channel".into()))?;
        out.port_location = Some(PortLocation {
            port_number,
            channel,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// TX
// ---------------------------------------------------------------------------

/// Per-handle record of a TX reply.
#[derive(Debug, Clone)]
pub struct TxTool {
    /// `(qw, qx, qy, qz, tx, ty, tz, err)`, absent when the reply says MISSING
    pub transform: Option<[f64; 8]>,
    pub port_status: u32,
    pub frame_number: u32,
}

/// Parsed `TX:<flags>` reply.
#[derive(Debug, Clone)]
pub struct TxReply {
    pub tools: Vec<(u8, TxTool)>,
    /// Present only when the stray section was requested and reported
    pub strays: Vec<[f64; 3]>,
    pub system_status: u16,
}

impl TxReply {
    pub fn tool(&self, handle: u8) -> Option<&TxTool> {
        self.tools
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, t)| t)
    }
}

/// Parse a TX reply; `with_strays` selects the `TX:1801` layout.
pub fn parse_tx(reply: &str, with_strays: bool) -> std::result::Result<TxReply, NdiError> {
    let mut lines = reply.split('\n');
    let header = lines.next().ok_or_else(|| NdiError::Malformed("empty TX reply".into()))?;
    let count = hex_field(header, 0..2)? as usize;

    let mut tools = Vec::with_capacity(count);
    for _ in 0..count {
        let record = lines
            .next()
            .ok_or_else(|| NdiError::Malformed("missing TX record".into()))?;
        tools.push(parse_tx_record(record)?);
    }

    let strays = if with_strays {
        let line = lines
            .next()
            .ok_or_else(|| NdiError::Malformed("missing stray section".into()))?;
        parse_stray_section(line)?
    } else {
        Vec::new()
    };

    let trailer = lines
        .next()
        .ok_or_else(|| NdiError::Malformed("missing system status".into()))?;
    let system_status = hex_field(trailer, 0..4)? as u16;

    Ok(TxReply {
        tools,
        strays,
        system_status,
    })
}

fn parse_tx_record(record: &str) -> std::result::Result<(u8, TxTool), NdiError> {
    let handle = hex_field(record, 0..2)? as u8;
    let body = &record[2..];

    let (transform, rest) = if let Some(rest) = body.strip_prefix("MISSING") {
        (None, rest)
    } else {
        let fields = slice(body, 0..51)?;
        let mut t = [0.0f64; 8];
        for (i, value) in t.iter_mut().take(4).enumerate() {
            *value = signed_fixed(&fields[i * 6..i * 6 + 6], 1e4)?;
        }
        for (i, value) in t.iter_mut().skip(4).take(3).enumerate() {
            *value = signed_fixed(&fields[24 + i * 7..24 + (i + 1) * 7], 1e2)?;
        }
        t[7] = signed_fixed(&fields[45..51], 1e4)?;
        (Some(t), &body[51..])
    };

    let port_status = hex_field(rest, 0..8)?;
    let frame_number = hex_field(rest, 8..16)?;
    Ok((
        handle,
        TxTool {
            transform,
            port_status,
            frame_number,
        },
    ))
}

fn parse_stray_section(line: &str) -> std::result::Result<Vec<[f64; 3]>, NdiError> {
    let count = hex_field(line, 0..2)? as usize;
    let mut strays = Vec::with_capacity(count);
    for i in 0..count {
        let base = 2 + i * 21;
        let fields = slice(line, base..base + 21)?;
        strays.push([
            signed_fixed(&fields[0..7], 1e2)?,
            signed_fixed(&fields[7..14], 1e2)?,
            signed_fixed(&fields[14..21], 1e2)?,
        ]);
    }
    Ok(strays)
}

// ---------------------------------------------------------------------------
// SFLIST
// ---------------------------------------------------------------------------

/// One measurement volume from an `SFLIST:03` reply.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub shape_type: char,
    /// D1..D10 in the vendor's units divided by 100
    pub dimensions: [f64; 10],
    pub metal_resistant: char,
}

impl VolumeInfo {
    pub fn shape_name(&self) -> &'static str {
        match self.shape_type {
            '9' => "Cube volume",
            'A' => "Dome volume",
            _ => "unknown",
        }
    }

    pub fn metal_resistance_name(&self) -> &'static str {
        match self.metal_resistant {
            '0' => "no information",
            '1' => "metal resistant",
            '2' => "not metal resistant",
            _ => "unknown",
        }
    }
}

/// Parse an `SFLIST:03` reply: 1-hex volume count, then 74 chars per volume.
pub fn parse_sflist(reply: &str) -> std::result::Result<Vec<VolumeInfo>, NdiError> {
    let count = hex_field(reply, 0..1)? as usize;
    let mut volumes = Vec::with_capacity(count);
    for i in 0..count {
        let descriptor = slice(reply, 1 + i * 74..1 + (i + 1) * 74)?;
        let mut dimensions = [0.0; 10];
        for (d, value) in dimensions.iter_mut().enumerate() {
            *value = signed_fixed(&descriptor[1 + d * 7..1 + (d + 1) * 7], 1.0)? / 100.0;
        }
        volumes.push(VolumeInfo {
            shape_type: descriptor.chars().next().unwrap_or('?'),
            dimensions,
            metal_resistant: descriptor.chars().nth(72).unwrap_or('?'),
        });
    }
    Ok(volumes)
}

/// Log the available measurement volumes, either all of them (`selected` 0)
/// or the one the operator picked.
pub fn log_volume_list(reply: &str, selected: usize, warn_level: bool) -> Result<()> {
    let volumes = parse_sflist(reply).map_err(Error::Tracker)?;
    let emit = |msg: String| {
        if warn_level {
            log::warn!("{}", msg);
        } else {
            log::debug!("{}", msg);
        }
    };
    if selected == 0 {
        emit(format!(
            "Number of available measurement volumes: {}",
            volumes.len()
        ));
    }
    for (index, volume) in volumes.iter().enumerate() {
        if selected > 0 && selected != index + 1 {
            continue;
        }
        emit(format!("Measurement volume {}", index + 1));
        emit(format!(
            " Shape type: {} ({})",
            volume.shape_name(),
            volume.shape_type
        ));
        for (d, value) in volume.dimensions.iter().enumerate() {
            emit(format!(" D{} = {}", d + 1, value));
        }
        emit(format!(
            " Metal resistant: {} ({})",
            volume.metal_resistance_name(),
            volume.metal_resistant
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use approx::assert_relative_eq;

    #[test]
    fn baud_code_mapping() {
        assert_eq!(baud_code(9600), Some(0));
        assert_eq!(baud_code(115200), Some(5));
        assert_eq!(baud_code(1228739), Some(7));
        assert_eq!(baud_code(230400), None);
    }

    #[test]
    fn command_roundtrip_and_error_classification() {
        let mock = MockTransport::new();
        mock.expect("INIT:", "OKAY");
        mock.expect("TX:", "ERROR04");
        let mut device = NdiDevice::new(Box::new(mock));

        assert_eq!(device.command("INIT:").unwrap(), "OKAY");
        let err = device.command("TX:0801").unwrap_err();
        assert_eq!(err, NdiError::Device { code: ERR_BAD_CRC });
        assert!(err.is_transient());
        assert!(!NdiError::Device { code: 0x01 }.is_transient());
    }

    #[test]
    fn phsr_parses_handles_and_status() {
        let handles = parse_phsr("020A0010B801").unwrap();
        assert_eq!(handles, vec![(0x0A, 0x001), (0x0B, 0x801)]);
        assert!(handles[0].1 & PHSR_TOOL_IN_PORT != 0);
    }

    #[test]
    fn phinf_tool_info_fields() {
        // identity: type(8) + manufacturer(12) + revision(3) + serial(8),
        // then the 2-hex port status
        let info = format!(
            "{}{}{}{}{}",
            "01PROBE ", "NDI         ", "001", "A1B2C3D ", "20"
        );
        let reply = parse_phinf(&info, PHINF_TOOL_INFO).unwrap();
        let tool = reply.tool_info.unwrap();
        assert_eq!(tool.device_identity(), "01PROBE");
        assert_eq!(tool.manufacturer(), "NDI");
        assert_eq!(tool.revision(), "001");
        assert_eq!(tool.serial_number(), "A1B2C3D");
        assert_eq!(tool.port_status, 0x20);
        assert_eq!(tool.enable_mode(), 'S');
    }

    #[test]
    fn phinf_port_location_combined_id() {
        let reply = parse_phinf("", 0).unwrap();
        assert!(reply.tool_info.is_none());

        let reply = parse_phinf("00000000000201", PHINF_PORT_LOCATION).unwrap();
        let location = reply.port_location.unwrap();
        assert_eq!(location.port_number, 1);
        assert_eq!(location.channel, 1);
        assert_eq!(location.combined(), 101);
    }

    #[test]
    fn tx_reply_with_transform_and_strays() {
        let record = format!(
            "01\n0A{}{}{}{}{}",
            "+10000+00000+00000+00000",
            "+001000-002000+003050",
            "+00000",
            "00000031",
            "0000002A"
        );
        let reply = format!("{}\n01+000010+000000+001000\n0040", record);
        let tx = parse_tx(&reply, true).unwrap();

        assert_eq!(tx.tools.len(), 1);
        let (handle, tool) = &tx.tools[0];
        assert_eq!(*handle, 0x0A);
        let t = tool.transform.unwrap();
        assert_relative_eq!(t[0], 1.0);
        assert_relative_eq!(t[4], 10.0);
        assert_relative_eq!(t[5], -20.0);
        assert_relative_eq!(t[6], 30.5);
        assert_eq!(tool.port_status, TOOL_IN_PORT | INITIALIZED | ENABLED);
        assert_eq!(tool.frame_number, 42);

        assert_eq!(tx.strays.len(), 1);
        assert_relative_eq!(tx.strays[0][0], 0.1);
        assert_relative_eq!(tx.strays[0][2], 10.0);
        assert!(tx.system_status & PORT_OCCUPIED != 0);
    }

    #[test]
    fn tx_reply_missing_tool() {
        let reply = "01\n0AMISSING000000000000002A\n0000";
        let tx = parse_tx(reply, false).unwrap();
        let tool = tx.tool(0x0A).unwrap();
        assert!(tool.transform.is_none());
        assert_eq!(tool.port_status, 0);
        assert!(tx.strays.is_empty());
    }

    #[test]
    fn hex_encoding_is_uppercase() {
        assert_eq!(hex_encode(&[0x00, 0xAB, 0x10]), "00AB10");
    }

    #[test]
    fn sflist_volume_fields() {
        let mut descriptor = String::from("9");
        for d in 0..10 {
            descriptor.push_str(&format!("{}{:06}", if d % 2 == 0 { '+' } else { '-' }, (d + 1) * 100));
        }
        descriptor.push('0'); // reserved
        descriptor.push('1'); // metal resistant
        descriptor.push('0'); // padding to 74
        let reply = format!("1{}", descriptor);
        assert_eq!(reply.len(), 1 + 74);

        let volumes = parse_sflist(&reply).unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].shape_type, '9');
        assert_relative_eq!(volumes[0].dimensions[0], 1.0);
        assert_relative_eq!(volumes[0].dimensions[1], -2.0);
        assert_eq!(volumes[0].metal_resistance_name(), "metal resistant");
    }
}
