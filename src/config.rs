//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! listening_port = 18944
//! output_channel_id = "TrackerStream"
//! max_number_of_strays = 0
//!
//! [server.default_subscription]
//! message_types = ["TRANSFORM"]
//! transform_names = ["StylusToTracker"]
//!
//! [tracker]
//! serial_port = -1          # probe ports 0..19
//! baud_rate = 115200
//! measurement_volume_number = 0
//! acquisition_rate_hz = 50.0
//!
//! [[tracker.tools]]
//! id = "Stylus"
//! rom_file = "Stylus.rom"   # wireless tool: 1024-byte definition image
//!
//! [[tracker.tools]]
//! id = "Reference"
//! port_name = 0             # wired tool on the first port
//! ```
//!
//! See `drishti.toml` for a complete example. When stray tracking is
//! enabled, `StrayNNTo<StrayReferenceFrame>` transform names (two-digit,
//! zero-padded) are appended to the default subscription automatically.

use crate::devices::ndi::tools::{ToolDescriptor, WIRELESS_PORT};
use crate::devices::ndi::TrackerSettings;
use crate::error::{Error, Result};
use crate::igtl::factory::ClientSubscription;
use crate::streaming::ServerSettings;
use serde::Deserialize;
use std::fs;
use std::path::Path;

const VALID_BAUD_RATES: [u32; 8] = [
    9600, 14400, 19200, 38400, 57600, 115200, 921600, 1228739,
];

/// Server section
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP port clients connect to
    ///
    /// **Required**: Yes (0 picks an ephemeral port, useful for tests)
    pub listening_port: u16,

    /// Acquisition channel to broadcast
    ///
    /// **Default**: empty (first available channel)
    #[serde(default)]
    pub output_channel_id: String,

    /// Window after startup during which "no data" is logged at debug
    /// instead of warning severity
    #[serde(default)]
    pub missing_input_grace_period_sec: f64,

    /// Per-cycle frame budget: frames pulled = clamp(this / per-frame ms)
    #[serde(default = "default_max_processing_ms")]
    pub max_time_spent_with_processing_ms: f64,

    #[serde(default = "default_max_messages")]
    pub max_number_of_igtl_messages_to_send: usize,

    #[serde(default = "default_retry_attempts")]
    pub number_of_retry_attempts: u32,

    #[serde(default = "default_retry_delay")]
    pub delay_between_retry_attempts_sec: f64,

    /// Idle interval after which a no-op STATUS is broadcast
    ///
    /// **Default**: half the client socket timeout
    #[serde(default = "default_keep_alive")]
    pub keep_alive_interval_sec: f64,

    /// Broadcast only transforms whose status is OK
    #[serde(default = "default_true")]
    pub send_valid_transforms_only: bool,

    /// Verify the CRC of inbound messages. The protocol library always
    /// verifies on decode; this key is accepted for compatibility.
    #[serde(default)]
    pub igtl_message_crc_check_enabled: bool,

    #[serde(default = "default_true")]
    pub log_warning_on_no_data_available: bool,

    #[serde(default = "default_socket_timeout")]
    pub client_send_timeout_sec: f64,

    #[serde(default = "default_socket_timeout")]
    pub client_receive_timeout_sec: f64,

    /// What a client receives before it sends its own CLIENTINFO
    #[serde(default)]
    pub default_subscription: SubscriptionConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub message_types: Vec<String>,
    #[serde(default)]
    pub transform_names: Vec<String>,
    #[serde(default)]
    pub image_names: Vec<String>,
    #[serde(default)]
    pub string_names: Vec<String>,
}

/// Tracker section
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// 1-based serial port number; -1 probes ports 0..19
    #[serde(default = "default_serial_port")]
    pub serial_port: i32,

    /// Line speed negotiated via `COMM:` after connecting at 9600
    ///
    /// **Valid values**: 9600, 14400, 19200, 38400, 57600, 115200, 921600,
    /// 1228739
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Measurement volume to select with `VSEL:` (0 = device default)
    #[serde(default)]
    pub measurement_volume_number: usize,

    /// Stray marker slots; 0 disables stray tracking entirely
    #[serde(default)]
    pub max_number_of_strays: usize,

    /// Reference frame in synthesized stray transform names
    #[serde(default = "default_stray_reference_frame")]
    pub stray_reference_frame: String,

    /// Reference frame appended to tool ids in transform names
    #[serde(default = "default_stray_reference_frame")]
    pub tool_reference_frame: String,

    /// Polling rate of the acquisition thread
    #[serde(default = "default_acquisition_rate")]
    pub acquisition_rate_hz: f64,

    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

/// One tool data source
#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    /// Stable source identifier
    pub id: String,
    /// Combined port/channel number for wired tools
    #[serde(default)]
    pub port_name: Option<i32>,
    /// 1024-byte ROM image, resolved relative to the config file
    #[serde(default)]
    pub rom_file: Option<String>,
}

fn default_max_processing_ms() -> f64 {
    50.0
}
fn default_max_messages() -> usize {
    100
}
fn default_retry_attempts() -> u32 {
    10
}
fn default_retry_delay() -> f64 {
    0.05
}
fn default_keep_alive() -> f64 {
    crate::streaming::CLIENT_SOCKET_TIMEOUT_SEC / 2.0
}
fn default_true() -> bool {
    true
}
fn default_socket_timeout() -> f64 {
    crate::streaming::CLIENT_SOCKET_TIMEOUT_SEC
}
fn default_serial_port() -> i32 {
    -1
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_stray_reference_frame() -> String {
    "Tracker".to_string()
}
fn default_acquisition_rate() -> f64 {
    50.0
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub tracker: TrackerConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Validation
    ///
    /// - `baud_rate` must be one of the supported rates
    /// - every tool needs an `id` and at least one of `port_name`/`rom_file`
    /// - `max_number_of_strays` is capped at 99 (two-digit slot names)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !VALID_BAUD_RATES.contains(&self.tracker.baud_rate) {
            return Err(Error::Config(format!(
                "Illegal baud rate: {}. Valid values: 9600, 14400, 19200, 38400, 57600, 115200, 921600, 1228739",
                self.tracker.baud_rate
            )));
        }
        if self.tracker.max_number_of_strays > 99 {
            return Err(Error::Config(
                "max_number_of_strays must be at most 99".to_string(),
            ));
        }
        if self.tracker.acquisition_rate_hz <= 0.0 {
            return Err(Error::Config(
                "acquisition_rate_hz must be positive".to_string(),
            ));
        }
        for tool in &self.tracker.tools {
            if tool.id.is_empty() {
                return Err(Error::Config("tool id must not be empty".to_string()));
            }
            if tool.port_name.is_none() && tool.rom_file.is_none() {
                return Err(Error::Config(format!(
                    "tool {} needs a port_name (wired) or a rom_file (wireless)",
                    tool.id
                )));
            }
            if let Some(port) = tool.port_name {
                if port < 0 {
                    return Err(Error::Config(format!(
                        "tool {}: port_name must be an integer >= 0",
                        tool.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            serial_port: self.tracker.serial_port,
            baud_rate: self.tracker.baud_rate,
            measurement_volume_number: self.tracker.measurement_volume_number,
            max_strays: self.tracker.max_number_of_strays,
            acquisition_rate_hz: self.tracker.acquisition_rate_hz,
            stray_reference_frame: self.tracker.stray_reference_frame.clone(),
        }
    }

    /// Build the descriptor table, loading ROM images relative to
    /// `config_dir`.
    pub fn tool_descriptors(&self, config_dir: &Path) -> Result<Vec<ToolDescriptor>> {
        let mut descriptors = Vec::with_capacity(self.tracker.tools.len());
        for tool in &self.tracker.tools {
            if tool.port_name.is_some() && tool.rom_file.is_some() {
                log::warn!(
                    "port_name and rom_file are both specified for tool {}. Assuming broken wired rom, using virtual rom instead",
                    tool.id
                );
            }
            let mut descriptor = ToolDescriptor::new(
                &tool.id,
                &self.tracker.tool_reference_frame,
                tool.port_name.unwrap_or(WIRELESS_PORT),
            );
            if let Some(rom_file) = &tool.rom_file {
                descriptor.read_srom_from_file(&config_dir.join(rom_file))?;
            }
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    /// Server settings with the default subscription assembled; stray
    /// transform names are synthesized when stray tracking is enabled.
    pub fn server_settings(&self) -> ServerSettings {
        let sub = &self.server.default_subscription;
        let mut transform_names = sub.transform_names.clone();
        for index in 0..self.tracker.max_number_of_strays {
            transform_names.push(format!(
                "Stray{:02}To{}",
                index + 1,
                self.tracker.stray_reference_frame
            ));
        }

        ServerSettings {
            listening_port: self.server.listening_port,
            output_channel_id: self.server.output_channel_id.clone(),
            missing_input_grace_period_sec: self.server.missing_input_grace_period_sec,
            max_time_spent_with_processing_ms: self.server.max_time_spent_with_processing_ms,
            max_number_of_igtl_messages_to_send: self.server.max_number_of_igtl_messages_to_send,
            number_of_retry_attempts: self.server.number_of_retry_attempts,
            delay_between_retry_attempts_sec: self.server.delay_between_retry_attempts_sec,
            keep_alive_interval_sec: self.server.keep_alive_interval_sec,
            send_valid_transforms_only: self.server.send_valid_transforms_only,
            igtl_message_crc_check_enabled: self.server.igtl_message_crc_check_enabled,
            log_warning_on_no_data_available: self.server.log_warning_on_no_data_available,
            client_send_timeout_sec: self.server.client_send_timeout_sec,
            client_receive_timeout_sec: self.server.client_receive_timeout_sec,
            default_subscription: ClientSubscription {
                message_types: sub.message_types.clone(),
                transform_names,
                image_names: sub.image_names.clone(),
                string_names: sub.string_names.clone(),
                ..ClientSubscription::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Result<Config> {
        let config: Config = basic_toml::from_str(toml)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    const MINIMAL: &str = r#"
        [server]
        listening_port = 18944

        [tracker]
        baud_rate = 115200
        max_number_of_strays = 3

        [[tracker.tools]]
        id = "Stylus"
        port_name = 0
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.server.listening_port, 18944);
        assert_eq!(config.server.number_of_retry_attempts, 10);
        assert!((config.server.keep_alive_interval_sec - 0.25).abs() < 1e-9);
        assert_eq!(config.tracker.serial_port, -1);
        assert!((config.tracker.acquisition_rate_hz - 50.0).abs() < 1e-9);
    }

    #[test]
    fn stray_transforms_are_synthesized() {
        let config = parse(MINIMAL).unwrap();
        let settings = config.server_settings();
        let names = &settings.default_subscription.transform_names;
        assert!(names.contains(&"Stray01ToTracker".to_string()));
        assert!(names.contains(&"Stray03ToTracker".to_string()));
        assert!(!names.contains(&"Stray04ToTracker".to_string()));
    }

    #[test]
    fn invalid_baud_rate_rejected() {
        let toml = r#"
            [server]
            listening_port = 18944

            [tracker]
            baud_rate = 230400
        "#;
        assert!(parse(toml).is_err());
    }

    #[test]
    fn tool_without_port_or_rom_rejected() {
        let toml = r#"
            [server]
            listening_port = 18944

            [tracker]
            [[tracker.tools]]
            id = "Stylus"
        "#;
        assert!(parse(toml).is_err());
    }
}
