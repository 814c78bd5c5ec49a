//! Broadcast Server Round-Trip Tests
//!
//! Starts the server on an ephemeral port and drives it with a plain TCP
//! client speaking the wire protocol: status pings, frame broadcast,
//! command deduplication, TDATA subscription, keep-alive.
//!
//! Run with: `cargo test --test server_roundtrip`

use drishti_io::core::types::{identity_matrix, ToolPose, ToolStatus, TrackedFrame};
use drishti_io::core::{Clock, FrameBuffer};
use drishti_io::igtl::factory::ClientSubscription;
use drishti_io::igtl::plus::{
    ClientInfoMessage, GetPolyDataMessage, GetStatusMessage, RtsPolyDataMessage,
    RtsTrackingDataMessage, StartTrackingDataMessage, StopTrackingDataMessage,
};
use drishti_io::igtl::{decode_header, decode_message, encode_message, HEADER_SIZE};
use drishti_io::streaming::{
    CommandHandler, CommandResponse, IgtlServer, PendingCommand, ServerSettings,
};
use openigtlink_rust::protocol::types::{
    PolyDataMessage, StatusMessage, StringMessage, TDataMessage, TransformMessage,
};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Harness
// ============================================================================

fn echo_handler() -> Arc<dyn CommandHandler> {
    Arc::new(|cmd: &PendingCommand| CommandResponse::String {
        client_id: cmd.client_id,
        device_name: cmd.device_name.clone(),
        message: format!("executed:{}", cmd.command_name),
    })
}

fn start_server(
    configure: impl FnOnce(&mut ServerSettings),
    handler: Arc<dyn CommandHandler>,
) -> (IgtlServer, Arc<FrameBuffer>, Clock) {
    let clock = Clock::new();
    let buffer = Arc::new(FrameBuffer::new("TrackerStream"));
    let mut settings = ServerSettings {
        listening_port: 0,
        ..ServerSettings::default()
    };
    configure(&mut settings);
    let mut server = IgtlServer::new(settings, Arc::clone(&buffer), clock, handler).unwrap();
    server.start().unwrap();
    (server, buffer, clock)
}

/// One message pulled off the socket: dispatch fields plus the full bytes
/// for typed decoding.
struct ReceivedMessage {
    message_type: String,
    device_name: String,
    timestamp: u64,
    bytes: Vec<u8>,
}

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        Self { stream }
    }

    fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    fn read_exact_deadline(&mut self, buf: &mut [u8], deadline: Instant) -> bool {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return false,
                Ok(n) => filled += n,
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() > deadline {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }

    fn read_message(&mut self, deadline: Instant) -> Option<ReceivedMessage> {
        let mut header_buf = [0u8; HEADER_SIZE];
        if !self.read_exact_deadline(&mut header_buf, deadline) {
            return None;
        }
        let header = decode_header(&header_buf).unwrap();
        let mut body = vec![0u8; header.body_size as usize];
        if !self.read_exact_deadline(&mut body, deadline) {
            return None;
        }
        let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
        bytes.extend_from_slice(&header_buf);
        bytes.extend_from_slice(&body);
        Some(ReceivedMessage {
            message_type: header.type_name.as_str().unwrap_or_default().to_string(),
            device_name: header.device_name.as_str().unwrap_or_default().to_string(),
            timestamp: header.timestamp.to_u64(),
            bytes,
        })
    }

    /// Read until a message of `message_type` arrives or the timeout passes.
    fn wait_for(&mut self, message_type: &str, timeout: Duration) -> Option<ReceivedMessage> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(message) = self.read_message(deadline) {
                if message.message_type == message_type {
                    return Some(message);
                }
            }
        }
        None
    }
}

fn frame_with_pose(clock: &Clock, name: &str) -> TrackedFrame {
    let mut frame = TrackedFrame::new(clock.now_sec());
    let mut matrix = identity_matrix();
    matrix[0][3] = 1.5;
    frame.poses.push(ToolPose {
        name: name.to_string(),
        matrix,
        status: ToolStatus::Ok,
        frame_number: 1,
    });
    frame
}

// ============================================================================
// GET_STATUS ping
// ============================================================================

#[test]
fn get_status_is_answered_with_same_device_name() {
    let (mut server, _buffer, _clock) = start_server(
        |s| s.keep_alive_interval_sec = 100.0,
        echo_handler(),
    );
    let mut client = TestClient::connect(server.port());

    let ping = encode_message(GetStatusMessage, "GET_STATUS", "Pinger", 0.0).unwrap();
    client.send(&ping.bytes);

    let reply = client
        .wait_for("STATUS", Duration::from_secs(2))
        .expect("no STATUS reply");
    assert_eq!(reply.device_name, "Pinger");
    let status = decode_message::<StatusMessage>(&reply.bytes).unwrap();
    assert_eq!(status.content.code, 1);

    server.stop();
}

// ============================================================================
// Frame broadcast
// ============================================================================

#[test]
fn frames_are_broadcast_with_nondecreasing_timestamps() {
    let (mut server, buffer, clock) = start_server(
        |s| {
            s.keep_alive_interval_sec = 100.0;
            s.default_subscription = ClientSubscription {
                message_types: vec!["TRANSFORM".into()],
                transform_names: vec!["StylusToTracker".into()],
                ..ClientSubscription::default()
            };
        },
        echo_handler(),
    );
    let mut client = TestClient::connect(server.port());

    // Feed frames at 50 Hz for a while
    let feeder_buffer = Arc::clone(&buffer);
    let feeder = std::thread::spawn(move || {
        for _ in 0..60 {
            feeder_buffer.push(frame_with_pose(&clock, "StylusToTracker"));
            std::thread::sleep(Duration::from_millis(20));
        }
    });

    let mut timestamps = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline && timestamps.len() < 5 {
        if let Some(message) = client.wait_for("TRANSFORM", Duration::from_millis(500)) {
            assert_eq!(message.device_name, "StylusToTracker");
            let transform = decode_message::<TransformMessage>(&message.bytes).unwrap();
            assert!((transform.content.matrix[0][3] - 1.5).abs() < 1e-6);
            timestamps.push(message.timestamp);
        }
    }
    feeder.join().unwrap();

    assert!(
        timestamps.len() >= 2,
        "expected broadcast TRANSFORM messages, got {}",
        timestamps.len()
    );
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));

    server.stop();
}

// ============================================================================
// Command deduplication
// ============================================================================

#[test]
fn duplicate_command_uid_executes_once_and_replies_once() {
    let executions = Arc::new(AtomicUsize::new(0));
    let handler_executions = Arc::clone(&executions);
    let handler: Arc<dyn CommandHandler> = Arc::new(move |cmd: &PendingCommand| {
        handler_executions.fetch_add(1, Ordering::SeqCst);
        CommandResponse::String {
            client_id: cmd.client_id,
            device_name: cmd.device_name.clone(),
            message: "done".to_string(),
        }
    });

    let (mut server, _buffer, _clock) =
        start_server(|s| s.keep_alive_interval_sec = 100.0, handler);
    let mut client = TestClient::connect(server.port());

    let content = StringMessage {
        encoding: 0,
        string: "<Command Name=\"Beep\" />".to_string(),
    };
    let command = encode_message(content, "STRING", "CMD_7", 0.0).unwrap();
    client.send(&command.bytes);
    client.send(&command.bytes);

    // Exactly one reply for the two sends
    let first = client.wait_for("STRING", Duration::from_secs(2));
    assert!(first.is_some(), "expected a reply to the first command");
    let second = client.wait_for("STRING", Duration::from_millis(700));
    assert!(second.is_none(), "duplicate command must not be answered");
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    server.stop();
}

// ============================================================================
// TDATA subscription
// ============================================================================

#[test]
fn start_tracking_data_acks_then_streams_tdata() {
    let (mut server, buffer, clock) = start_server(
        |s| s.keep_alive_interval_sec = 100.0,
        echo_handler(),
    );
    let mut client = TestClient::connect(server.port());

    let start = StartTrackingDataMessage {
        resolution: 0,
        coordinate_name: String::new(),
    };
    client.send(&encode_message(start, "STT_TDATA", "", 0.0).unwrap().bytes);

    let ack = client
        .wait_for("RTS_TDATA", Duration::from_secs(2))
        .expect("no RTS_TDATA ack");
    let ack = decode_message::<RtsTrackingDataMessage>(&ack.bytes).unwrap();
    assert_eq!(ack.content.status, 0);

    let feeder_buffer = Arc::clone(&buffer);
    let feeder = std::thread::spawn(move || {
        for _ in 0..40 {
            feeder_buffer.push(frame_with_pose(&clock, "StylusToTracker"));
            std::thread::sleep(Duration::from_millis(20));
        }
    });

    let tdata = client
        .wait_for("TDATA", Duration::from_secs(3))
        .expect("no TDATA after subscription");
    let tdata = decode_message::<TDataMessage>(&tdata.bytes).unwrap();
    assert_eq!(tdata.content.elements.len(), 1);
    assert_eq!(tdata.content.elements[0].name, "StylusToTracker");

    // Stopping acks as well and turns the stream off
    client.send(
        &encode_message(StopTrackingDataMessage, "STP_TDATA", "", 0.0)
            .unwrap()
            .bytes,
    );
    client
        .wait_for("RTS_TDATA", Duration::from_secs(2))
        .expect("no RTS_TDATA ack for stop");

    feeder.join().unwrap();
    server.stop();
}

// ============================================================================
// PolyData
// ============================================================================

#[test]
fn get_polydata_replies_with_points_or_failure() {
    let (mut server, _buffer, _clock) = start_server(
        |s| s.keep_alive_interval_sec = 100.0,
        echo_handler(),
    );
    let mut client = TestClient::connect(server.port());

    // The filename travels in the 20-byte device name field, so keep it
    // short and relative to the working directory.
    let filename = "pd_roundtrip.vtk";
    std::fs::write(
        filename,
        "# vtk DataFile Version 3.0\nmodel\nASCII\nDATASET POLYDATA\nPOINTS 3 float\n0 0 0\n1 0 0\n0 1 0\n",
    )
    .unwrap();

    client.send(
        &encode_message(GetPolyDataMessage, "GET_POLYDATA", filename, 0.0)
            .unwrap()
            .bytes,
    );
    let reply = client
        .wait_for("POLYDATA", Duration::from_secs(2))
        .expect("no POLYDATA reply");
    let polydata = decode_message::<PolyDataMessage>(&reply.bytes).unwrap();
    assert_eq!(polydata.content.points.len(), 3);
    assert_eq!(polydata.content.points[1], [1.0, 0.0, 0.0]);
    std::fs::remove_file(filename).ok();

    // A missing file is answered with a failing RTS_POLYDATA
    client.send(
        &encode_message(GetPolyDataMessage, "GET_POLYDATA", "missing.vtk", 0.0)
            .unwrap()
            .bytes,
    );
    let rts = client
        .wait_for("RTS_POLYDATA", Duration::from_secs(2))
        .expect("no RTS_POLYDATA failure reply");
    let rts = decode_message::<RtsPolyDataMessage>(&rts.bytes).unwrap();
    assert_eq!(rts.content.status, 0);

    server.stop();
}

// ============================================================================
// Keep-alive
// ============================================================================

#[test]
fn idle_stream_sends_status_keep_alive() {
    let (mut server, _buffer, _clock) = start_server(
        |s| s.keep_alive_interval_sec = 0.2,
        echo_handler(),
    );
    let mut client = TestClient::connect(server.port());

    let status = client
        .wait_for("STATUS", Duration::from_secs(3))
        .expect("no keep-alive STATUS on idle stream");
    let status = decode_message::<StatusMessage>(&status.bytes).unwrap();
    assert_eq!(status.content.code, 1);

    server.stop();
}

// ============================================================================
// Subscription replacement
// ============================================================================

#[test]
fn client_info_replaces_subscription_atomically() {
    let (mut server, buffer, clock) = start_server(
        |s| {
            s.keep_alive_interval_sec = 100.0;
            s.default_subscription = ClientSubscription {
                message_types: vec!["TRANSFORM".into()],
                transform_names: vec!["StylusToTracker".into()],
                ..ClientSubscription::default()
            };
        },
        echo_handler(),
    );
    let mut client = TestClient::connect(server.port());

    // Re-subscribe to a different transform
    let info = ClientInfoMessage {
        client_header_version: 1,
        message_types: vec!["TRANSFORM".into()],
        transform_names: vec!["ProbeToTracker".into()],
        ..ClientInfoMessage::default()
    };
    client.send(&encode_message(info, "CLIENTINFO", "", 0.0).unwrap().bytes);
    std::thread::sleep(Duration::from_millis(200));

    let feeder_buffer = Arc::clone(&buffer);
    let feeder = std::thread::spawn(move || {
        for _ in 0..40 {
            let mut frame = frame_with_pose(&clock, "ProbeToTracker");
            frame.poses.push(ToolPose {
                name: "StylusToTracker".to_string(),
                matrix: identity_matrix(),
                status: ToolStatus::Ok,
                frame_number: 1,
            });
            feeder_buffer.push(frame);
            std::thread::sleep(Duration::from_millis(20));
        }
    });

    let transform = client
        .wait_for("TRANSFORM", Duration::from_secs(3))
        .expect("no TRANSFORM after CLIENTINFO");
    assert_eq!(transform.device_name, "ProbeToTracker");

    feeder.join().unwrap();
    server.stop();
}
