//! Per-client receiver: reads headers, dispatches inbound messages.
//!
//! Short or zero reads are idle conditions, not disconnects; the send path
//! is the authoritative disconnect detector. An unparseable header is
//! per-client fatal: the socket is shut down so the next send removes the
//! client, and the thread exits.

use crate::error::Result;
use crate::igtl::plus::{
    ClientInfoMessage, RtsPolyDataMessage, RtsTrackingDataMessage, StartTrackingDataMessage,
};
use crate::igtl::{decode_header, decode_message, encode_message, Header, HEADER_SIZE, PROTOCOL_VERSION};
use crate::streaming::commands::{PendingCommand, COMMAND_PREFIX, DEVICE_NAME_REPLY};
use crate::streaming::server::ServerInner;
use openigtlink_rust::protocol::message::IgtlMessage;
use openigtlink_rust::protocol::types::{
    CommandMessage, PolyDataMessage, StatusMessage, StringMessage,
};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Recent command UIDs remembered per client for deduplication
const NUMBER_OF_RECENT_COMMAND_IDS_STORED: usize = 10;

const IDLE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on inbound body size; anything larger is a framing error.
const MAX_BODY_SIZE: u64 = 16 * 1024 * 1024;

enum ReadOutcome {
    Complete,
    Idle,
    Failed,
}

pub(crate) fn receiver_loop(
    inner: Arc<ServerInner>,
    client_id: u64,
    mut stream: TcpStream,
    active: Arc<AtomicBool>,
    ack: Arc<AtomicBool>,
) {
    ack.store(true, Ordering::Relaxed);
    log::debug!("Receiver thread started for client {}", client_id);

    let mut previous_command_ids: VecDeque<u32> = VecDeque::new();
    let mut header_buf = [0u8; HEADER_SIZE];

    while active.load(Ordering::Relaxed) && inner.active.load(Ordering::Relaxed) {
        match read_full(&mut stream, &mut header_buf, &active) {
            ReadOutcome::Complete => {}
            ReadOutcome::Idle | ReadOutcome::Failed => {
                thread::sleep(IDLE_DELAY);
                continue;
            }
        }

        let header = match decode_header(&header_buf) {
            Ok(header) if header.body_size <= MAX_BODY_SIZE => header,
            _ => {
                log::error!(
                    "Unable to parse message header from client {}; dropping connection",
                    client_id
                );
                let _ = stream.shutdown(Shutdown::Both);
                break;
            }
        };

        // Track the negotiated protocol version from every inbound header.
        {
            let mut clients = inner.clients.lock();
            if let Some(record) = clients.iter_mut().find(|c| c.id == client_id) {
                record.subscription.header_version =
                    PROTOCOL_VERSION.min(header.version.max(1));
            }
        }

        let mut body = vec![0u8; header.body_size as usize];
        match read_full(&mut stream, &mut body, &active) {
            ReadOutcome::Complete => {}
            ReadOutcome::Idle | ReadOutcome::Failed => {
                thread::sleep(IDLE_DELAY);
                continue;
            }
        }

        // Reassemble the full message for the library's typed decoder.
        let mut message = Vec::with_capacity(HEADER_SIZE + body.len());
        message.extend_from_slice(&header_buf);
        message.extend_from_slice(&body);

        dispatch(
            &inner,
            client_id,
            &stream,
            &header,
            &message,
            &mut previous_command_ids,
        );
    }

    ack.store(false, Ordering::Relaxed);
    log::debug!("Receiver thread stopped for client {}", client_id);
}

/// Fill `buf` completely. Zero reads and timeouts with nothing buffered are
/// idle; timeouts mid-message keep waiting until the stop flag clears.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], active: &AtomicBool) -> ReadOutcome {
    let mut filled = 0usize;
    while filled < buf.len() {
        if !active.load(Ordering::Relaxed) {
            return ReadOutcome::Idle;
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return ReadOutcome::Idle,
            Ok(n) => filled += n,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if filled == 0 {
                    return ReadOutcome::Idle;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("Socket read failed: {}", e);
                return ReadOutcome::Failed;
            }
        }
    }
    ReadOutcome::Complete
}

fn dispatch(
    inner: &Arc<ServerInner>,
    client_id: u64,
    stream: &TcpStream,
    header: &Header,
    message: &[u8],
    previous_command_ids: &mut VecDeque<u32>,
) {
    let message_type = header.type_name.as_str().unwrap_or_default().to_string();
    let device_name = header.device_name.as_str().unwrap_or_default().to_string();

    match message_type.as_str() {
        "CLIENTINFO" => match decode_message::<ClientInfoMessage>(message) {
            Ok(info) => {
                let mut clients = inner.clients.lock();
                if let Some(record) = clients.iter_mut().find(|c| c.id == client_id) {
                    record
                        .subscription
                        .apply_client_info(&info.content, PROTOCOL_VERSION);
                }
                log::debug!("Client info message received from client {}", client_id);
            }
            Err(e) => log::error!("Bad CLIENTINFO from client {}: {}", client_id, e),
        },

        "GET_STATUS" => {
            // Ping: answer immediately on this socket with the same device name.
            let status = StatusMessage {
                code: 1, // OK
                subcode: 0,
                error_name: String::new(),
                status_string: String::new(),
            };
            match encode_message(status, "STATUS", &device_name, 0.0) {
                Ok(reply) => {
                    let mut writer = stream;
                    if let Err(e) = writer.write_all(&reply.bytes) {
                        log::debug!("Failed to answer GET_STATUS for client {}: {}", client_id, e);
                    }
                }
                Err(e) => log::error!("Failed to pack GET_STATUS reply: {}", e),
            }
        }

        "STRING" if is_command_device_name(&device_name) => {
            handle_legacy_command(inner, client_id, &device_name, message, previous_command_ids);
        }

        "COMMAND" => {
            handle_v3_command(inner, client_id, &device_name, message, previous_command_ids);
        }

        "STT_TDATA" => {
            let resolution = decode_message::<StartTrackingDataMessage>(message)
                .map(|m| m.content.resolution)
                .unwrap_or(0);
            {
                let mut clients = inner.clients.lock();
                if let Some(record) = clients.iter_mut().find(|c| c.id == client_id) {
                    record.subscription.resolution = resolution.max(0) as u32;
                    record.subscription.tdata_requested = true;
                }
            }
            queue_tdata_ack(inner, client_id);
        }

        "STP_TDATA" => {
            {
                let mut clients = inner.clients.lock();
                if let Some(record) = clients.iter_mut().find(|c| c.id == client_id) {
                    record.subscription.tdata_requested = false;
                }
            }
            queue_tdata_ack(inner, client_id);
        }

        "GET_POLYDATA" => {
            handle_get_polydata(inner, client_id, &device_name);
        }

        "STATUS" => {
            // keep-alive from the client, nothing to do
        }

        other => {
            // body already read and discarded
            log::warn!(
                "Unknown OpenIGTLink message is received from client {}. Device type: {}. Device name: {}.",
                client_id,
                other,
                device_name
            );
        }
    }
}

fn queue_tdata_ack(inner: &Arc<ServerInner>, client_id: u64) {
    match encode_message(RtsTrackingDataMessage { status: 0 }, "RTS_TDATA", "", 0.0) {
        Ok(ack) => {
            let _ = inner.queue_message_response(client_id, ack);
        }
        Err(e) => log::error!("Failed to pack RTS_TDATA ack: {}", e),
    }
}

/// `CMD_<n>` device names carry the legacy command convention.
fn is_command_device_name(device_name: &str) -> bool {
    device_name
        .split('_')
        .next()
        .map(|prefix| prefix == COMMAND_PREFIX)
        .unwrap_or(false)
}

fn uid_from_command_device_name(device_name: &str) -> Option<u32> {
    device_name.split_once('_')?.1.parse().ok()
}

/// Remember the UID; true when it was already in the window.
fn is_duplicate(previous: &mut VecDeque<u32>, uid: u32) -> bool {
    if previous.contains(&uid) {
        return true;
    }
    previous.push_back(uid);
    if previous.len() > NUMBER_OF_RECENT_COMMAND_IDS_STORED {
        previous.pop_front();
    }
    false
}

fn handle_legacy_command(
    inner: &Arc<ServerInner>,
    client_id: u64,
    device_name: &str,
    message: &[u8],
    previous_command_ids: &mut VecDeque<u32>,
) {
    let content = match decode_message::<StringMessage>(message) {
        Ok(decoded) => decoded.content.string,
        Err(e) => {
            log::error!("Bad STRING command from client {}: {}", client_id, e);
            return;
        }
    };

    if device_name.is_empty() {
        inner.processor.queue_string_response(
            client_id,
            DEVICE_NAME_REPLY,
            "Unable to read DeviceName.",
        );
        return;
    }

    let Some(uid) = uid_from_command_device_name(device_name) else {
        log::error!("Unable to extract command UID from device name string.");
        inner.processor.queue_string_response(
            client_id,
            DEVICE_NAME_REPLY,
            "Malformed DeviceName. Expected CMD_cmdId (ex: CMD_001)",
        );
        return;
    };

    if is_duplicate(previous_command_ids, uid) {
        log::warn!(
            "Already received a command with id = {} from client {}. This repeated command will be ignored.",
            uid,
            client_id
        );
        return;
    }

    let command_name =
        crate::streaming::commands::xml_attribute(&content, "Name").unwrap_or_default();
    log::debug!(
        "Received command from client {}, device {} with UID {}: {}",
        client_id,
        COMMAND_PREFIX,
        uid,
        content
    );

    inner.processor.queue_command(PendingCommand {
        respond_with_command_msg: false,
        client_id,
        command_name,
        command_content: content,
        device_name: COMMAND_PREFIX.to_string(),
        uid,
    });
}

fn handle_v3_command(
    inner: &Arc<ServerInner>,
    client_id: u64,
    device_name: &str,
    message: &[u8],
    previous_command_ids: &mut VecDeque<u32>,
) {
    let command: IgtlMessage<CommandMessage> = match decode_message(message) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::error!("COMMAND message unpacking failed for client {}: {}", client_id, e);
            return;
        }
    };
    let command = command.content;

    if is_duplicate(previous_command_ids, command.command_id) {
        log::warn!(
            "Already received a command with id = {} from client {}. This repeated command will be ignored.",
            command.command_id,
            client_id
        );
        return;
    }

    log::debug!(
        "Received command {} from client {}, device {} with UID {}: {}",
        command.command_name,
        client_id,
        device_name,
        command.command_id,
        command.command
    );

    inner.processor.queue_command(PendingCommand {
        respond_with_command_msg: true,
        client_id,
        command_name: command.command_name,
        command_content: command.command,
        device_name: device_name.to_string(),
        uid: command.command_id,
    });
}

fn handle_get_polydata(inner: &Arc<ServerInner>, client_id: u64, device_name: &str) {
    // The device name carries the file to serve.
    if device_name.is_empty() {
        log::error!("GetPolyData message sent with no filename in deviceName field.");
        return;
    }

    match read_vtk_points(Path::new(device_name)) {
        Ok(points) => {
            let polydata = PolyDataMessage::new(points);
            match encode_message(polydata, "POLYDATA", "Server", 0.0) {
                Ok(reply) => {
                    let _ = inner.queue_message_response(client_id, reply);
                }
                Err(e) => log::error!("Failed to pack POLYDATA reply: {}", e),
            }
        }
        Err(e) => {
            log::error!("Failed to read polydata from {}: {}", device_name, e);
            match encode_message(RtsPolyDataMessage { status: 0 }, "RTS_POLYDATA", "", 0.0) {
                Ok(reply) => {
                    let _ = inner.queue_message_response(client_id, reply);
                }
                Err(e) => log::error!("Failed to pack RTS_POLYDATA reply: {}", e),
            }
        }
    }
}

/// Minimal reader for legacy ASCII VTK polydata: the POINTS section only.
fn read_vtk_points(path: &Path) -> Result<Vec<[f32; 3]>> {
    let text = std::fs::read_to_string(path)?;
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        if token != "POINTS" {
            continue;
        }
        let count: usize = tokens
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| crate::error::Error::Wire("bad POINTS count".into()))?;
        let _scalar_type = tokens.next();
        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            let mut point = [0.0f32; 3];
            for coordinate in point.iter_mut() {
                *coordinate = tokens
                    .next()
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| crate::error::Error::Wire("truncated POINTS data".into()))?;
            }
            points.push(point);
        }
        return Ok(points);
    }
    Err(crate::error::Error::Wire("no POINTS section found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_device_name_convention() {
        assert!(is_command_device_name("CMD_001"));
        assert!(is_command_device_name("CMD_7"));
        assert!(!is_command_device_name("ACK_7"));
        assert!(!is_command_device_name("Stylus"));

        assert_eq!(uid_from_command_device_name("CMD_007"), Some(7));
        assert_eq!(uid_from_command_device_name("CMD_x"), None);
        assert_eq!(uid_from_command_device_name("CMD"), None);
    }

    #[test]
    fn duplicate_window_holds_ten_ids() {
        let mut window = VecDeque::new();
        for uid in 0..10u32 {
            assert!(!is_duplicate(&mut window, uid));
        }
        assert!(is_duplicate(&mut window, 9));
        // Pushing an 11th evicts uid 0
        assert!(!is_duplicate(&mut window, 10));
        assert!(!is_duplicate(&mut window, 0));
    }

    #[test]
    fn vtk_points_parsing() {
        let dir = std::env::temp_dir();
        let path = dir.join("drishti_test_points.vtk");
        std::fs::write(
            &path,
            "# vtk DataFile Version 3.0\nmodel\nASCII\nDATASET POLYDATA\nPOINTS 2 float\n0 1 2\n3.5 4.5 5.5\n",
        )
        .unwrap();
        let points = read_vtk_points(&path).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1], [3.5, 4.5, 5.5]);
        std::fs::remove_file(&path).ok();
    }
}
