//! Data sender: the single broadcast pump.
//!
//! One cycle: drain queued message responses, drain command responses, pull
//! new frames from the buffer since the watermark, fan each frame out to
//! every client according to its subscription, and fall back to a STATUS
//! keep-alive when the stream has been quiet for too long.

use crate::core::types::TrackedFrame;
use crate::core::TransformRepository;
use crate::igtl::encode_message;
use crate::streaming::commands::create_message_from_response;
use crate::streaming::server::ServerInner;
use openigtlink_rust::protocol::types::StatusMessage;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DELAY_ON_NO_NEW_FRAMES_SEC: f64 = 0.005;
const NO_CLIENT_DELAY_SEC: f64 = 0.2;

/// When the buffer wrapped past the watermark, skip ahead this far beyond
/// the oldest frame instead of replaying ancient data.
const SAMPLING_SKIPPING_MARGIN_SEC: f64 = 0.1;

struct SenderState {
    last_sent_timestamp: f64,
    last_processing_time_per_frame_ms: f64,
    elapsed_since_last_packet_sec: f64,
    repository: TransformRepository,
}

pub(crate) fn sender_loop(inner: Arc<ServerInner>, ack: Arc<AtomicBool>) {
    ack.store(true, Ordering::Relaxed);

    let mut state = SenderState {
        last_sent_timestamp: inner.buffer.newest_timestamp().unwrap_or(0.0),
        last_processing_time_per_frame_ms: -1.0,
        elapsed_since_last_packet_sec: 0.0,
        repository: TransformRepository::new(),
    };

    while inner.active.load(Ordering::Relaxed) {
        let clients_connected = !inner.clients.lock().is_empty();
        if !clients_connected {
            thread::sleep(Duration::from_secs_f64(NO_CLIENT_DELAY_SEC));
            // next client starts from the live edge of the stream
            state.last_sent_timestamp = 0.0;
            continue;
        }

        send_message_responses(&inner);
        send_command_responses(&inner);
        send_latest_frames(&inner, &mut state);
    }

    ack.store(false, Ordering::Relaxed);
    log::debug!("Data sender thread stopped");
}

/// Drain the per-client reply queue (command acks, TDATA acks, POLYDATA
/// replies). Queue contents are taken under the queue lock alone, then
/// delivered under the clients lock.
fn send_message_responses(inner: &ServerInner) {
    let queued = std::mem::take(&mut *inner.response_queue.lock());
    if queued.is_empty() {
        return;
    }

    let clients = inner.clients.lock();
    for (client_id, messages) in queued {
        let Some(record) = clients.iter().find(|c| c.id == client_id) else {
            log::warn!(
                "Message reply cannot be sent to client {}, probably client has been disconnected.",
                client_id
            );
            continue;
        };
        for message in messages {
            let mut writer = &record.stream;
            if let Err(e) = writer.write_all(&message.bytes) {
                log::debug!(
                    "Failed to send {} reply to client {}: {}",
                    message.message_type,
                    client_id,
                    e
                );
            }
        }
    }
}

/// Serialize and deliver completed command responses, each only to the
/// client that issued the command.
fn send_command_responses(inner: &ServerInner) {
    for response in inner.processor.pop_responses() {
        let Some(message) = create_message_from_response(&response) else {
            continue;
        };

        let clients = inner.clients.lock();
        let Some(record) = clients.iter().find(|c| c.id == response.client_id()) else {
            log::warn!(
                "Command reply cannot be sent to client {}, probably client has been disconnected",
                response.client_id()
            );
            continue;
        };
        log::debug!(
            "Send command reply to client {}: {}",
            record.id,
            message.device_name
        );
        let mut writer = &record.stream;
        if let Err(e) = writer.write_all(&message.bytes) {
            log::debug!("Failed to send command reply: {}", e);
        }
    }
}

fn send_latest_frames(inner: &ServerInner, state: &mut SenderState) {
    let start_time = inner.clock.now_sec();

    // processing under 1 ms/frame is treated as 1 ms to avoid divide-by-zero
    if state.last_processing_time_per_frame_ms < 1.0 {
        state.last_processing_time_per_frame_ms = 1.0;
    }
    let budget = inner.settings.max_time_spent_with_processing_ms
        / state.last_processing_time_per_frame_ms;
    let frames_to_get = (budget as usize)
        .max(1)
        .min(inner.settings.max_number_of_igtl_messages_to_send);

    let mut frames: Vec<TrackedFrame> = Vec::new();
    if inner.buffer.is_empty() {
        if inner.settings.log_warning_on_no_data_available {
            if inner.has_grace_period_expired() {
                log::warn!("No data is broadcasted, as no data is available yet.");
            } else {
                log::debug!("No data is broadcasted, as no data is available yet.");
            }
        }
    } else {
        if let Some(oldest) = inner.buffer.oldest_timestamp() {
            if state.last_sent_timestamp < oldest {
                log::info!(
                    "Broadcasting resumed. No data was available between {:.3}-{:.3}s, therefore no data were broadcasted during this period.",
                    state.last_sent_timestamp,
                    oldest
                );
                state.last_sent_timestamp = oldest + SAMPLING_SKIPPING_MARGIN_SEC;
            }
        }
        frames = inner
            .buffer
            .frames_since(state.last_sent_timestamp, frames_to_get);
    }

    if frames.is_empty() {
        thread::sleep(Duration::from_secs_f64(DELAY_ON_NO_NEW_FRAMES_SEC));
        state.elapsed_since_last_packet_sec += inner.clock.now_sec() - start_time;

        if state.elapsed_since_last_packet_sec > inner.settings.keep_alive_interval_sec {
            keep_alive(inner);
            state.elapsed_since_last_packet_sec = 0.0;
        }
        return;
    }

    for frame in &frames {
        send_tracked_frame(inner, state, frame);
        state.elapsed_since_last_packet_sec = 0.0;
        state.last_sent_timestamp = frame.timestamp;
    }

    let cycle_ms = (inner.clock.now_sec() - start_time) * 1000.0;
    state.last_processing_time_per_frame_ms = cycle_ms / frames.len() as f64;
}

/// Fan one frame out to every client. Clients whose socket is gone after
/// the configured retries are disconnected after the registry lock is
/// released.
fn send_tracked_frame(inner: &ServerInner, state: &mut SenderState, frame: &TrackedFrame) {
    state.repository.set_transforms(frame);
    let timestamp_utc = inner.clock.to_utc(frame.timestamp);

    let mut disconnected: Vec<u64> = Vec::new();
    {
        let mut clients = inner.clients.lock();
        for record in clients.iter_mut() {
            let packed = crate::igtl::factory::pack_tracked_frame(
                &record.subscription,
                frame,
                timestamp_utc,
                &state.repository,
                inner.settings.send_valid_transforms_only,
                inner.buffer.channel_id(),
            );

            for message in packed {
                if !send_with_retry(
                    &record.stream,
                    &message.bytes,
                    inner.settings.number_of_retry_attempts,
                    inner.settings.delay_between_retry_attempts_sec,
                ) {
                    disconnected.push(record.id);
                    log::info!(
                        "Client disconnected - could not send {} message to client (device name: {}  Timestamp: {:.6}).",
                        message.message_type,
                        message.device_name,
                        timestamp_utc
                    );
                    break;
                }
                record.subscription.last_tdata_sent_timestamp = timestamp_utc;
            }
        }
    }

    for id in disconnected {
        inner.disconnect_client(id);
    }
}

/// Broadcast a no-op STATUS message so idle clients can tell the link is
/// alive; a client whose socket is gone is disconnected here as well.
pub(crate) fn keep_alive(inner: &ServerInner) {
    log::trace!("Keep alive packet sent to clients...");

    let status = StatusMessage {
        code: 1, // OK
        subcode: 0,
        error_name: String::new(),
        status_string: String::new(),
    };
    let message = match encode_message(status, "STATUS", "", 0.0) {
        Ok(message) => message,
        Err(e) => {
            log::error!("Failed to pack keep-alive STATUS: {}", e);
            return;
        }
    };

    let mut disconnected: Vec<u64> = Vec::new();
    {
        let clients = inner.clients.lock();
        for record in clients.iter() {
            if !send_with_retry(
                &record.stream,
                &message.bytes,
                inner.settings.number_of_retry_attempts,
                inner.settings.delay_between_retry_attempts_sec,
            ) {
                disconnected.push(record.id);
                log::debug!(
                    "Client {} disconnected - could not send STATUS keep-alive",
                    record.id
                );
            }
        }
    }

    for id in disconnected {
        inner.disconnect_client(id);
    }
}

/// Write the whole message, retrying on failure. Returns false when the
/// client should be treated as disconnected.
fn send_with_retry(stream: &TcpStream, bytes: &[u8], attempts: u32, delay_sec: f64) -> bool {
    for attempt in 0..attempts.max(1) {
        let mut writer = stream;
        match writer.write_all(bytes) {
            Ok(()) => return true,
            Err(e) => {
                log::debug!("Send attempt {} failed: {}", attempt + 1, e);
                thread::sleep(Duration::from_secs_f64(delay_sec));
            }
        }
    }
    false
}
