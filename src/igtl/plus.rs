//! Plus-convention message types layered on the library's `Message` trait.
//!
//! The protocol library ships the standard message set; the Plus dialect
//! adds a CLIENTINFO subscription message and the query/ack variants used by
//! the tracking-data and polydata flows (STT/STP/RTS_TDATA, GET_STATUS,
//! GET_POLYDATA, RTS_POLYDATA, RTS_COMMAND). Implementing the library trait
//! keeps their framing, CRC, and header handling in the library.
//!
//! Decoders are tolerant: truncated fields fall back to defaults rather than
//! erroring, and the dispatcher treats an empty result accordingly.

use openigtlink_rust::error::Result;
use openigtlink_rust::protocol::message::Message;

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_fixed_str(out: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + width - n, 0);
}

fn get_u16(data: &[u8], pos: usize) -> u16 {
    if pos + 2 > data.len() {
        return 0;
    }
    u16::from_be_bytes([data[pos], data[pos + 1]])
}

fn get_u32(data: &[u8], pos: usize) -> u32 {
    if pos + 4 > data.len() {
        return 0;
    }
    u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

// ---------------------------------------------------------------------------
// CLIENTINFO
// ---------------------------------------------------------------------------

/// Subscription request: which message kinds and names a client wants.
///
/// Body layout: client header version (u16), then four length-prefixed
/// string lists (message types, transform names, image names, string names),
/// then the TDATA resolution (u32) and requested flag (u8).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientInfoMessage {
    pub client_header_version: u16,
    pub message_types: Vec<String>,
    pub transform_names: Vec<String>,
    pub image_names: Vec<String>,
    pub string_names: Vec<String>,
    pub resolution: u32,
    pub tdata_requested: bool,
}

fn put_string_list(out: &mut Vec<u8>, list: &[String]) {
    put_u16(out, list.len() as u16);
    for item in list {
        put_u16(out, item.len() as u16);
        out.extend_from_slice(item.as_bytes());
    }
}

fn get_string_list(data: &[u8], pos: &mut usize) -> Vec<String> {
    let count = get_u16(data, *pos) as usize;
    *pos += 2;
    let mut list = Vec::with_capacity(count);
    for _ in 0..count {
        let len = get_u16(data, *pos) as usize;
        *pos += 2;
        if *pos + len > data.len() {
            break;
        }
        list.push(String::from_utf8_lossy(&data[*pos..*pos + len]).to_string());
        *pos += len;
    }
    list
}

impl Message for ClientInfoMessage {
    fn message_type() -> &'static str {
        "CLIENTINFO"
    }

    fn encode_content(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        put_u16(&mut out, self.client_header_version);
        put_string_list(&mut out, &self.message_types);
        put_string_list(&mut out, &self.transform_names);
        put_string_list(&mut out, &self.image_names);
        put_string_list(&mut out, &self.string_names);
        put_u32(&mut out, self.resolution);
        out.push(self.tdata_requested as u8);
        Ok(out)
    }

    fn decode_content(data: &[u8]) -> Result<Self> {
        let client_header_version = get_u16(data, 0);
        let mut pos = 2usize;
        let message_types = get_string_list(data, &mut pos);
        let transform_names = get_string_list(data, &mut pos);
        let image_names = get_string_list(data, &mut pos);
        let string_names = get_string_list(data, &mut pos);
        let resolution = get_u32(data, pos);
        let tdata_requested = data.get(pos + 4).copied().unwrap_or(0) != 0;
        Ok(Self {
            client_header_version,
            message_types,
            transform_names,
            image_names,
            string_names,
            resolution,
            tdata_requested,
        })
    }
}

// ---------------------------------------------------------------------------
// Tracking-data queries and acks
// ---------------------------------------------------------------------------

/// STT_TDATA: start streaming, with the minimum interval in milliseconds.
#[derive(Debug, Clone, Default)]
pub struct StartTrackingDataMessage {
    pub resolution: i32,
    pub coordinate_name: String,
}

impl Message for StartTrackingDataMessage {
    fn message_type() -> &'static str {
        "STT_TDATA"
    }

    fn encode_content(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(36);
        out.extend_from_slice(&self.resolution.to_be_bytes());
        put_fixed_str(&mut out, &self.coordinate_name, 32);
        Ok(out)
    }

    fn decode_content(data: &[u8]) -> Result<Self> {
        let resolution = get_u32(data, 0) as i32;
        let coordinate_name = if data.len() >= 36 {
            let raw = &data[4..36];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..end]).to_string()
        } else {
            String::new()
        };
        Ok(Self {
            resolution,
            coordinate_name,
        })
    }
}

/// STP_TDATA: stop streaming. Empty body.
#[derive(Debug, Clone, Default)]
pub struct StopTrackingDataMessage;

impl Message for StopTrackingDataMessage {
    fn message_type() -> &'static str {
        "STP_TDATA"
    }

    fn encode_content(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn decode_content(_data: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// RTS_TDATA: ack for STT/STP_TDATA; 0 means success.
#[derive(Debug, Clone, Default)]
pub struct RtsTrackingDataMessage {
    pub status: u8,
}

impl Message for RtsTrackingDataMessage {
    fn message_type() -> &'static str {
        "RTS_TDATA"
    }

    fn encode_content(&self) -> Result<Vec<u8>> {
        Ok(vec![self.status])
    }

    fn decode_content(data: &[u8]) -> Result<Self> {
        Ok(Self {
            status: data.first().copied().unwrap_or(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Status and polydata queries
// ---------------------------------------------------------------------------

/// GET_STATUS: ping; the server answers STATUS OK on the same socket.
#[derive(Debug, Clone, Default)]
pub struct GetStatusMessage;

impl Message for GetStatusMessage {
    fn message_type() -> &'static str {
        "GET_STATUS"
    }

    fn encode_content(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn decode_content(_data: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// GET_POLYDATA: the device name carries the file to load.
#[derive(Debug, Clone, Default)]
pub struct GetPolyDataMessage;

impl Message for GetPolyDataMessage {
    fn message_type() -> &'static str {
        "GET_POLYDATA"
    }

    fn encode_content(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn decode_content(_data: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// RTS_POLYDATA: failure reply when the requested file cannot be served.
#[derive(Debug, Clone, Default)]
pub struct RtsPolyDataMessage {
    pub status: u8,
}

impl Message for RtsPolyDataMessage {
    fn message_type() -> &'static str {
        "RTS_POLYDATA"
    }

    fn encode_content(&self) -> Result<Vec<u8>> {
        Ok(vec![self.status])
    }

    fn decode_content(data: &[u8]) -> Result<Self> {
        Ok(Self {
            status: data.first().copied().unwrap_or(0),
        })
    }
}

// ---------------------------------------------------------------------------
// RTS_COMMAND
// ---------------------------------------------------------------------------

/// Reply to a version-3 COMMAND, reusing the command body layout: id (u32),
/// 20-byte name, encoding (u16), content length (u32), content.
#[derive(Debug, Clone, Default)]
pub struct RtsCommandMessage {
    pub command_id: u32,
    pub command_name: String,
    pub command_content: String,
}

impl Message for RtsCommandMessage {
    fn message_type() -> &'static str {
        "RTS_COMMAND"
    }

    fn encode_content(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(30 + self.command_content.len());
        put_u32(&mut out, self.command_id);
        put_fixed_str(&mut out, &self.command_name, 20);
        put_u16(&mut out, 3); // US-ASCII
        put_u32(&mut out, self.command_content.len() as u32);
        out.extend_from_slice(self.command_content.as_bytes());
        Ok(out)
    }

    fn decode_content(data: &[u8]) -> Result<Self> {
        let command_id = get_u32(data, 0);
        let command_name = if data.len() >= 24 {
            let raw = &data[4..24];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            String::from_utf8_lossy(&raw[..end]).to_string()
        } else {
            String::new()
        };
        let length = get_u32(data, 26) as usize;
        let command_content = if data.len() >= 30 + length {
            String::from_utf8_lossy(&data[30..30 + length]).to_string()
        } else {
            String::new()
        };
        Ok(Self {
            command_id,
            command_name,
            command_content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_info_roundtrip() {
        let info = ClientInfoMessage {
            client_header_version: 2,
            message_types: vec!["TRANSFORM".into()],
            transform_names: vec!["StylusToTracker".into(), "Stray01ToTracker".into()],
            image_names: vec![],
            string_names: vec!["DeviceStatus".into()],
            resolution: 100,
            tdata_requested: true,
        };
        let bytes = info.encode_content().unwrap();
        assert_eq!(ClientInfoMessage::decode_content(&bytes).unwrap(), info);
    }

    #[test]
    fn truncated_client_info_decodes_to_defaults() {
        let info = ClientInfoMessage::decode_content(&[0x00]).unwrap();
        assert_eq!(info, ClientInfoMessage::default());
    }

    #[test]
    fn start_tracking_roundtrip() {
        let start = StartTrackingDataMessage {
            resolution: 100,
            coordinate_name: "Tracker".into(),
        };
        let bytes = start.encode_content().unwrap();
        assert_eq!(bytes.len(), 36);
        let back = StartTrackingDataMessage::decode_content(&bytes).unwrap();
        assert_eq!(back.resolution, 100);
        assert_eq!(back.coordinate_name, "Tracker");
    }

    #[test]
    fn rts_command_roundtrip() {
        let reply = RtsCommandMessage {
            command_id: 42,
            command_name: "Beep".into(),
            command_content: "<Command><Result>true</Result></Command>".into(),
        };
        let bytes = reply.encode_content().unwrap();
        let back = RtsCommandMessage::decode_content(&bytes).unwrap();
        assert_eq!(back.command_id, 42);
        assert_eq!(back.command_name, "Beep");
        assert_eq!(back.command_content, reply.command_content);
    }

    #[test]
    fn ack_status_bytes() {
        assert_eq!(
            RtsTrackingDataMessage { status: 0 }.encode_content().unwrap(),
            vec![0]
        );
        assert_eq!(
            RtsPolyDataMessage { status: 1 }.encode_content().unwrap(),
            vec![1]
        );
    }
}
