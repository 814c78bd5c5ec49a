//! OpenIGTLink integration.
//!
//! Message framing and the standard message types come from the
//! `openigtlink-rust` crate; this module is the thin seam between that
//! library and the rest of the daemon. It adds:
//!
//! - [`OutboundMessage`]: an already-encoded wire message carrying its type
//!   and device name for logging, so queues and send paths stay homogeneous,
//! - encode/decode helpers that stamp frame timestamps and map library
//!   errors into the crate error type,
//! - [`plus`]: the Plus-convention message types the library does not ship
//!   (CLIENTINFO and the query/ack variants), implemented on the library's
//!   own `Message` trait,
//! - [`factory`]: per-client packing of a tracked frame.

pub mod factory;
pub mod plus;

use crate::core::types::{identity_matrix, Matrix4x4};
use crate::error::{Error, Result};
use openigtlink_rust::protocol::message::{IgtlMessage, Message};

pub use openigtlink_rust::protocol::header::Header;

/// Wire header size in bytes
pub const HEADER_SIZE: usize = 58;

/// Highest header version this server negotiates
pub const PROTOCOL_VERSION: u16 = 3;

/// An encoded wire message queued for delivery.
///
/// Type and device name are kept alongside the bytes so disconnect logging
/// can name what failed without re-parsing.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub message_type: String,
    pub device_name: String,
    pub bytes: Vec<u8>,
}

fn wire_error(e: openigtlink_rust::error::IgtlError) -> Error {
    Error::Wire(e.to_string())
}

/// Convert UTC seconds to the header's 32.32 fixed-point timestamp.
pub fn igtl_timestamp(utc_sec: f64) -> u64 {
    if utc_sec <= 0.0 {
        return 0;
    }
    let seconds = utc_sec.floor();
    let fraction = ((utc_sec - seconds) * (1u64 << 32) as f64) as u64;
    ((seconds as u64) << 32) | (fraction & 0xFFFF_FFFF)
}

/// Encode a typed message body into a ready-to-send [`OutboundMessage`].
///
/// A positive `timestamp_utc` overrides the library's send-time stamp so
/// frame messages carry the acquisition time.
pub fn encode_message<T: Message>(
    content: T,
    message_type: &str,
    device_name: &str,
    timestamp_utc: f64,
) -> Result<OutboundMessage> {
    let mut message = IgtlMessage::new(content, device_name).map_err(wire_error)?;
    if timestamp_utc > 0.0 {
        message.header.timestamp =
            openigtlink_rust::protocol::header::Timestamp::from_u64(igtl_timestamp(timestamp_utc));
    }
    let bytes = message.encode().map_err(wire_error)?;
    Ok(OutboundMessage {
        message_type: message_type.to_string(),
        device_name: device_name.to_string(),
        bytes,
    })
}

/// Decode a complete wire message (header plus body).
pub fn decode_message<T: Message>(bytes: &[u8]) -> Result<IgtlMessage<T>> {
    IgtlMessage::decode(bytes).map_err(wire_error)
}

/// Parse just the 58-byte header, for dispatch before the body is read.
pub fn decode_header(bytes: &[u8]) -> Result<Header> {
    Header::decode(bytes).map_err(wire_error)
}

/// Row-major f64 pose to the wire's f32 matrix layout.
pub fn matrix_to_wire(m: &Matrix4x4) -> [[f32; 4]; 4] {
    let mut out = [[0.0f32; 4]; 4];
    for (i, row) in m.iter().enumerate() {
        for (j, v) in row.iter().enumerate() {
            out[i][j] = *v as f32;
        }
    }
    out
}

/// Wire matrix back into the crate's f64 pose type.
pub fn matrix_from_wire(m: &[[f32; 4]; 4]) -> Matrix4x4 {
    let mut out = identity_matrix();
    for (i, row) in m.iter().enumerate() {
        for (j, v) in row.iter().enumerate() {
            out[i][j] = *v as f64;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_32_32_fixed_point() {
        let t = igtl_timestamp(1_700_000_000.25);
        assert_eq!(t >> 32, 1_700_000_000);
        let fraction = (t & 0xFFFF_FFFF) as f64 / (1u64 << 32) as f64;
        assert!((fraction - 0.25).abs() < 1e-6);
        assert_eq!(igtl_timestamp(0.0), 0);
        // fixed point preserves ordering
        assert!(igtl_timestamp(2.0) > igtl_timestamp(1.999));
    }

    #[test]
    fn matrix_conversion_roundtrip() {
        let mut m = identity_matrix();
        m[0][3] = 12.5;
        m[1][0] = -0.25;
        let back = matrix_from_wire(&matrix_to_wire(&m));
        for i in 0..4 {
            for j in 0..4 {
                assert!((back[i][j] - m[i][j]).abs() < 1e-6);
            }
        }
    }
}
