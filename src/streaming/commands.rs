//! Command processor bridge.
//!
//! Receivers enqueue deduplicated commands here; a worker thread executes
//! them against the tracker and parks the responses. The data sender drains
//! the responses at the start of every broadcast cycle, so a command reply
//! always precedes any frame acquired after the command finished.

use crate::devices::NdiTracker;
use crate::error::{Error, Result};
use crate::igtl::plus::RtsCommandMessage;
use crate::igtl::{encode_message, OutboundMessage};
use crossbeam_channel::{bounded, Receiver, Sender};
use openigtlink_rust::protocol::types::{
    ImageMessage, ImageMetaElement, ImgMetaMessage, StringMessage,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Device name prefix of the legacy string-command convention (`CMD_<n>`)
pub const COMMAND_PREFIX: &str = "CMD";

/// Device name used for replies that cannot be tied to a command UID
pub const DEVICE_NAME_REPLY: &str = "ACK";

/// A command lifted off the wire, queued for execution.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// true for v3 COMMAND messages, false for legacy STRING commands
    pub respond_with_command_msg: bool,
    pub client_id: u64,
    pub command_name: String,
    pub command_content: String,
    pub device_name: String,
    pub uid: u32,
}

/// Execution result, tagged with the client that gets the reply.
pub enum CommandResponse {
    String {
        client_id: u64,
        device_name: String,
        message: String,
    },
    Command {
        client_id: u64,
        respond_with_command_msg: bool,
        original_id: u32,
        device_name: String,
        command_name: String,
        success: bool,
        result_message: String,
        error_message: String,
        parameters: Vec<(String, String)>,
    },
    Image {
        client_id: u64,
        image_name: String,
        image: ImageMessage,
    },
    ImageMeta {
        client_id: u64,
        elements: Vec<ImageMetaElement>,
    },
}

impl CommandResponse {
    pub fn client_id(&self) -> u64 {
        match self {
            CommandResponse::String { client_id, .. }
            | CommandResponse::Command { client_id, .. }
            | CommandResponse::Image { client_id, .. }
            | CommandResponse::ImageMeta { client_id, .. } => *client_id,
        }
    }
}

/// Executes queued commands; implemented by the daemon against the tracker
/// and by tests with a closure.
pub trait CommandHandler: Send + Sync + 'static {
    fn execute(&self, command: &PendingCommand) -> CommandResponse;
}

impl<F> CommandHandler for F
where
    F: Fn(&PendingCommand) -> CommandResponse + Send + Sync + 'static,
{
    fn execute(&self, command: &PendingCommand) -> CommandResponse {
        self(command)
    }
}

pub struct CommandProcessor {
    queue_tx: Option<Sender<PendingCommand>>,
    responses: Arc<Mutex<Vec<CommandResponse>>>,
    worker: Option<JoinHandle<()>>,
}

impl CommandProcessor {
    pub fn new(handler: Arc<dyn CommandHandler>) -> Result<Self> {
        let (queue_tx, queue_rx) = bounded::<PendingCommand>(64);
        let responses: Arc<Mutex<Vec<CommandResponse>>> = Arc::new(Mutex::new(Vec::new()));

        let worker_responses = Arc::clone(&responses);
        let worker = thread::Builder::new()
            .name("command-worker".to_string())
            .spawn(move || worker_loop(queue_rx, handler, worker_responses))
            .map_err(|e| Error::Other(format!("failed to spawn command worker: {}", e)))?;

        Ok(Self {
            queue_tx: Some(queue_tx),
            responses,
            worker: Some(worker),
        })
    }

    /// Queue a command for asynchronous execution.
    pub fn queue_command(&self, command: PendingCommand) {
        if let Some(tx) = &self.queue_tx {
            if tx.send(command).is_err() {
                log::error!("Command worker is gone; dropping command");
            }
        }
    }

    /// Park an immediate string reply (used for malformed requests that
    /// never reach the worker).
    pub fn queue_string_response(&self, client_id: u64, device_name: &str, message: &str) {
        self.responses.lock().push(CommandResponse::String {
            client_id,
            device_name: device_name.to_string(),
            message: message.to_string(),
        });
    }

    /// Take all completed responses.
    pub fn pop_responses(&self) -> Vec<CommandResponse> {
        std::mem::take(&mut *self.responses.lock())
    }
}

impl Drop for CommandProcessor {
    fn drop(&mut self) {
        // Closing the channel stops the worker.
        self.queue_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    queue_rx: Receiver<PendingCommand>,
    handler: Arc<dyn CommandHandler>,
    responses: Arc<Mutex<Vec<CommandResponse>>>,
) {
    loop {
        match queue_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(command) => {
                log::debug!(
                    "Executing command '{}' (uid {}) from client {}",
                    command.command_name,
                    command.uid,
                    command.client_id
                );
                let response = handler.execute(&command);
                responses.lock().push(response);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("Command worker exiting");
}

fn string_reply(device_name: &str, text: &str) -> Result<OutboundMessage> {
    let message = StringMessage {
        encoding: 0,
        string: text.to_string(),
    };
    encode_message(message, "STRING", device_name, 0.0)
}

/// Serialize a response into its wire message, reusing the original UID and
/// device name. Legacy commands answer as STRING, v3 as RTS_COMMAND.
pub fn create_message_from_response(response: &CommandResponse) -> Option<OutboundMessage> {
    let packed = match response {
        CommandResponse::String {
            device_name,
            message,
            ..
        } => string_reply(device_name, message),

        CommandResponse::Command {
            respond_with_command_msg,
            original_id,
            device_name,
            command_name,
            success,
            result_message,
            error_message,
            parameters,
            ..
        } => {
            if !*respond_with_command_msg {
                let reply = format!(
                    "<CommandReply Status=\"{}\" Message=\"{}\" />",
                    if *success { "SUCCESS" } else { "FAIL" },
                    xml_escape(result_message)
                );
                string_reply(&format!("{}_{}", DEVICE_NAME_REPLY, original_id), &reply)
            } else {
                let mut content = format!(
                    "<Command><Result>{}</Result>",
                    if *success { "true" } else { "false" }
                );
                if !*success {
                    content.push_str(&format!("<Error>{}</Error>", xml_escape(error_message)));
                }
                content.push_str(&format!(
                    "<Message>{}</Message>",
                    xml_escape(result_message)
                ));
                for (key, value) in parameters {
                    content.push_str(&format!(
                        "<Parameter Name=\"{}\" Value=\"{}\" />",
                        xml_escape(key),
                        xml_escape(value)
                    ));
                }
                content.push_str("</Command>");

                let reply = RtsCommandMessage {
                    command_id: *original_id,
                    command_name: command_name.clone(),
                    command_content: content,
                };
                encode_message(reply, "RTS_COMMAND", device_name, 0.0)
            }
        }

        CommandResponse::Image {
            image_name, image, ..
        } => {
            let name = if image_name.is_empty() {
                "ServerImage"
            } else {
                image_name
            };
            encode_message(image.clone(), "IMAGE", name, 0.0)
        }

        CommandResponse::ImageMeta { elements, .. } => {
            let meta = ImgMetaMessage {
                images: elements.clone(),
            };
            encode_message(meta, "IMGMETA", "ServerImageMetaData", 0.0)
        }
    };

    match packed {
        Ok(message) => Some(message),
        Err(e) => {
            log::error!("Failed to serialize command response: {}", e);
            None
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Pull a `Name="value"` attribute out of a command's XML content without a
/// full XML parser (configuration XML handling is out of scope).
pub fn xml_attribute(content: &str, attribute: &str) -> Option<String> {
    let needle = format!("{}=\"", attribute);
    let start = content.find(&needle)? + needle.len();
    let end = content[start..].find('"')? + start;
    Some(content[start..end].to_string())
}

/// Built-in command set executed against the tracker: `Beep`, `SetToolLED`,
/// and `GetDeviceIds`. Unknown commands report failure.
pub struct TrackerCommandHandler {
    tracker: Arc<Mutex<NdiTracker>>,
}

impl TrackerCommandHandler {
    pub fn new(tracker: Arc<Mutex<NdiTracker>>) -> Self {
        Self { tracker }
    }

    fn run(&self, command: &PendingCommand) -> std::result::Result<String, String> {
        match command.command_name.as_str() {
            "Beep" => {
                let count = xml_attribute(&command.command_content, "NumberOfBeeps")
                    .and_then(|v| v.parse::<i32>().ok())
                    .unwrap_or(1);
                self.tracker
                    .lock()
                    .beep(count)
                    .map_err(|e| e.to_string())?;
                Ok(format!("Beeped {} time(s)", count))
            }
            "SetToolLED" => {
                let source = xml_attribute(&command.command_content, "SourceId")
                    .ok_or("SetToolLED requires a SourceId attribute")?;
                let led = xml_attribute(&command.command_content, "Led")
                    .and_then(|v| v.parse::<u8>().ok())
                    .unwrap_or(0);
                let state = match xml_attribute(&command.command_content, "State").as_deref() {
                    Some("ON") => crate::devices::ndi::LedState::On,
                    Some("FLASH") => crate::devices::ndi::LedState::Flash,
                    _ => crate::devices::ndi::LedState::Off,
                };
                self.tracker
                    .lock()
                    .set_tool_led(&source, led, state)
                    .map_err(|e| e.to_string())?;
                Ok(format!("LED updated on {}", source))
            }
            "GetDeviceIds" => {
                let ids: Vec<String> = self
                    .tracker
                    .lock()
                    .tool_summaries()
                    .into_iter()
                    .map(|(id, _, _, _)| id)
                    .collect();
                Ok(ids.join(","))
            }
            other => Err(format!("Unknown command: {}", other)),
        }
    }
}

impl CommandHandler for TrackerCommandHandler {
    fn execute(&self, command: &PendingCommand) -> CommandResponse {
        let result = self.run(command);
        CommandResponse::Command {
            client_id: command.client_id,
            respond_with_command_msg: command.respond_with_command_msg,
            original_id: command.uid,
            device_name: command.device_name.clone(),
            command_name: command.command_name.clone(),
            success: result.is_ok(),
            result_message: result.as_ref().cloned().unwrap_or_default(),
            error_message: result.err().unwrap_or_default(),
            parameters: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::igtl::decode_message;
    use openigtlink_rust::protocol::message::IgtlMessage;

    #[test]
    fn xml_attribute_extraction() {
        let content = "<Command Name=\"Beep\" NumberOfBeeps=\"3\" />";
        assert_eq!(xml_attribute(content, "Name").as_deref(), Some("Beep"));
        assert_eq!(xml_attribute(content, "NumberOfBeeps").as_deref(), Some("3"));
        assert_eq!(xml_attribute(content, "Missing"), None);
    }

    #[test]
    fn worker_executes_and_parks_response() {
        let processor = CommandProcessor::new(Arc::new(|cmd: &PendingCommand| {
            CommandResponse::String {
                client_id: cmd.client_id,
                device_name: cmd.device_name.clone(),
                message: format!("done:{}", cmd.command_name),
            }
        }))
        .unwrap();
        processor.queue_command(PendingCommand {
            respond_with_command_msg: false,
            client_id: 7,
            command_name: "Beep".into(),
            command_content: String::new(),
            device_name: "CMD".into(),
            uid: 1,
        });

        let mut responses = Vec::new();
        for _ in 0..50 {
            responses = processor.pop_responses();
            if !responses.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].client_id(), 7);
    }

    #[test]
    fn legacy_reply_is_string_with_ack_device() {
        let response = CommandResponse::Command {
            client_id: 1,
            respond_with_command_msg: false,
            original_id: 9,
            device_name: "CMD".into(),
            command_name: "Beep".into(),
            success: true,
            result_message: "ok".into(),
            error_message: String::new(),
            parameters: Vec::new(),
        };
        let msg = create_message_from_response(&response).unwrap();
        assert_eq!(msg.message_type, "STRING");
        assert_eq!(msg.device_name, "ACK_9");

        let decoded: IgtlMessage<StringMessage> = decode_message(&msg.bytes).unwrap();
        assert!(decoded.content.string.contains("Status=\"SUCCESS\""));
    }

    #[test]
    fn image_response_packs_image_message() {
        let image = ImageMessage::new(
            openigtlink_rust::protocol::types::ImageScalarType::Uint8,
            [2, 2, 1],
            vec![0; 4],
        )
        .unwrap();
        let response = CommandResponse::Image {
            client_id: 1,
            image_name: String::new(),
            image,
        };
        let msg = create_message_from_response(&response).unwrap();
        assert_eq!(msg.message_type, "IMAGE");
        assert_eq!(msg.device_name, "ServerImage");

        let element = ImageMetaElement::new("CT-01", "", "CT");
        let meta = CommandResponse::ImageMeta {
            client_id: 1,
            elements: vec![element],
        };
        let msg = create_message_from_response(&meta).unwrap();
        assert_eq!(msg.message_type, "IMGMETA");
    }

    #[test]
    fn v3_reply_is_rts_command_with_parameters() {
        let response = CommandResponse::Command {
            client_id: 1,
            respond_with_command_msg: true,
            original_id: 11,
            device_name: "Client".into(),
            command_name: "GetDeviceIds".into(),
            success: false,
            result_message: String::new(),
            error_message: "no such device".into(),
            parameters: vec![("Detail".into(), "none".into())],
        };
        let msg = create_message_from_response(&response).unwrap();
        assert_eq!(msg.message_type, "RTS_COMMAND");

        let decoded: IgtlMessage<RtsCommandMessage> = decode_message(&msg.bytes).unwrap();
        assert_eq!(decoded.content.command_id, 11);
        assert!(decoded.content.command_content.contains("<Result>false</Result>"));
        assert!(decoded.content.command_content.contains("no such device"));
        assert!(decoded
            .content
            .command_content
            .contains("Parameter Name=\"Detail\""));
    }
}
