//! Per-client message packing.
//!
//! Given a client's subscription and the latest tracked frame, produce the
//! wire messages that client should receive: one TRANSFORM per subscribed
//! transform name, plus a TDATA bundle when the client requested streaming
//! tracking data and its resolution interval has elapsed.

use super::plus::ClientInfoMessage;
use super::{encode_message, matrix_to_wire, OutboundMessage};
use crate::core::types::TrackedFrame;
use crate::core::TransformRepository;
use openigtlink_rust::protocol::types::{
    TDataMessage, TrackingDataElement, TrackingInstrumentType, TransformMessage,
};

/// What one client asked to receive, plus negotiated wire parameters.
#[derive(Debug, Clone)]
pub struct ClientSubscription {
    pub message_types: Vec<String>,
    pub transform_names: Vec<String>,
    pub image_names: Vec<String>,
    pub string_names: Vec<String>,
    /// Minimum milliseconds between TDATA messages (0 = every frame)
    pub resolution: u32,
    pub tdata_requested: bool,
    /// `min(server, client)` header version
    pub header_version: u16,
    /// UTC timestamp of the last message sent to this client
    pub last_tdata_sent_timestamp: f64,
}

impl Default for ClientSubscription {
    fn default() -> Self {
        Self {
            message_types: Vec::new(),
            transform_names: Vec::new(),
            image_names: Vec::new(),
            string_names: Vec::new(),
            resolution: 0,
            tdata_requested: false,
            header_version: 1,
            last_tdata_sent_timestamp: 0.0,
        }
    }
}

impl ClientSubscription {
    /// Replace the subscription from a CLIENTINFO body, negotiating the
    /// header version down to what both sides support.
    pub fn apply_client_info(&mut self, info: &ClientInfoMessage, server_version: u16) {
        self.message_types = info.message_types.clone();
        self.transform_names = info.transform_names.clone();
        self.image_names = info.image_names.clone();
        self.string_names = info.string_names.clone();
        self.resolution = info.resolution;
        self.tdata_requested = info.tdata_requested;
        self.header_version = server_version.min(info.client_header_version.max(1));
    }

    fn wants(&self, message_type: &str) -> bool {
        self.message_types.iter().any(|t| t == message_type)
    }
}

/// Pack the messages one client should receive for one frame. Bodies that
/// fail to encode are logged and skipped, the rest still go out.
pub fn pack_tracked_frame(
    subscription: &ClientSubscription,
    frame: &TrackedFrame,
    timestamp_utc: f64,
    repository: &TransformRepository,
    valid_transforms_only: bool,
    channel_id: &str,
) -> Vec<OutboundMessage> {
    let mut out = Vec::new();

    if subscription.wants("TRANSFORM") {
        for name in &subscription.transform_names {
            let Some((matrix, status)) = repository.get(name) else {
                continue;
            };
            if valid_transforms_only && !status.is_valid() {
                continue;
            }
            let mut transform = TransformMessage::identity();
            transform.matrix = matrix_to_wire(matrix);
            match encode_message(transform, "TRANSFORM", name, timestamp_utc) {
                Ok(message) => out.push(message),
                Err(e) => log::warn!("Failed to pack TRANSFORM for {}: {}", name, e),
            }
        }
    }

    if subscription.tdata_requested {
        let since_last_ms = (timestamp_utc - subscription.last_tdata_sent_timestamp) * 1000.0;
        if since_last_ms >= subscription.resolution as f64 {
            let elements: Vec<TrackingDataElement> = frame
                .poses
                .iter()
                .filter(|p| !valid_transforms_only || p.status.is_valid())
                .map(|p| {
                    let wire = matrix_to_wire(&p.matrix);
                    TrackingDataElement::new(
                        p.name.clone(),
                        TrackingInstrumentType::Tracker,
                        [wire[0], wire[1], wire[2]],
                    )
                })
                .collect();
            if !elements.is_empty() {
                let tdata = TDataMessage::new(elements);
                match encode_message(tdata, "TDATA", channel_id, timestamp_utc) {
                    Ok(message) => out.push(message),
                    Err(e) => log::warn!("Failed to pack TDATA: {}", e),
                }
            }
        }
    }

    out
}
