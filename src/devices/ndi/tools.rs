//! Tool descriptor table.
//!
//! One descriptor per configured data source. Wireless tools (and wired
//! tools with an overridden ROM) carry a 1024-byte virtual SROM image that
//! is uploaded to the tracker during port enabling.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Size of a tool definition image
pub const VIRTUAL_SROM_SIZE: usize = 1024;

/// Wired port sentinel for wireless tools
pub const WIRELESS_PORT: i32 = -1;

#[derive(Clone)]
pub struct ToolDescriptor {
    /// Stable source identifier from configuration (e.g. `Stylus`)
    pub id: String,
    /// Transform name presented downstream (e.g. `StylusToTracker`)
    pub transform_name: String,
    /// Virtual ROM image, present for wireless tools and ROM overrides
    pub virtual_srom: Option<Box<[u8; VIRTUAL_SROM_SIZE]>>,
    /// Combined port/channel number for wired tools, -1 for wireless
    pub wired_port_number: i32,
    /// Tracker-assigned handle; 0 means unassigned
    pub port_handle: u8,
    pub port_enabled: bool,
    /// Identity fields refreshed from PHINF after enabling
    pub serial_number: String,
    pub revision: String,
    pub manufacturer: String,
    pub part_number: String,
}

impl ToolDescriptor {
    pub fn new(id: &str, reference_frame: &str, wired_port_number: i32) -> Self {
        Self {
            id: id.to_string(),
            transform_name: format!("{}To{}", id, reference_frame),
            virtual_srom: None,
            wired_port_number,
            port_handle: 0,
            port_enabled: false,
            serial_number: String::new(),
            revision: String::new(),
            manufacturer: String::new(),
            part_number: String::new(),
        }
    }

    /// Load the 1024-byte ROM image; shorter files are zero-padded, like the
    /// original reader.
    pub fn read_srom_from_file(&mut self, path: &Path) -> Result<()> {
        let mut file = File::open(path).map_err(|e| {
            Error::Config(format!("couldn't open srom file {}: {}", path.display(), e))
        })?;
        let mut image = Box::new([0u8; VIRTUAL_SROM_SIZE]);
        let mut filled = 0usize;
        while filled < VIRTUAL_SROM_SIZE {
            let n = file.read(&mut image[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.virtual_srom = Some(image);
        Ok(())
    }

    /// Whether this descriptor still needs a handle resolved after enabling
    /// (wired tool without a virtual ROM; splitter channels appear only
    /// post-enable).
    pub fn is_wired_without_rom(&self) -> bool {
        self.wired_port_number >= 0 && self.virtual_srom.is_none()
    }
}
