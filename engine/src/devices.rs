//! Descriptors for the supported Overbridge devices: USB coordinates,
//! channel counts, and per-track port names.

use serde::Deserialize;

/// The fixed Overbridge sample rate.
pub const SAMPLE_RATE: u32 = 48_000;

/// Frames per protocol block; transfers carry a whole number of blocks.
pub const FRAMES_PER_BLOCK: usize = 7;

pub const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Host-to-device track names; the device consumes this many channels.
    pub inputs: Vec<String>,
    /// Device-to-host track names; the device produces this many channels.
    pub outputs: Vec<String>,
}

impl DeviceDescriptor {
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Bytes per interleaved device-to-host frame.
    pub fn o2h_frame_size(&self) -> usize {
        self.outputs.len() * SAMPLE_BYTES
    }

    /// Bytes per interleaved host-to-device frame.
    pub fn h2o_frame_size(&self) -> usize {
        self.inputs.len() * SAMPLE_BYTES
    }
}

static DEVICES_JSON: &str = include_str!("devices.json");

pub fn all() -> Result<Vec<DeviceDescriptor>, String> {
    serde_json::from_str(DEVICES_JSON).map_err(|e| format!("Invalid device table: {e}"))
}

pub fn by_name(name: &str) -> Result<DeviceDescriptor, String> {
    all()?
        .into_iter()
        .find(|d| d.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| format!("Unknown device '{name}'"))
}

pub fn by_id(vendor_id: u16, product_id: u16) -> Result<DeviceDescriptor, String> {
    all()?
        .into_iter()
        .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
        .ok_or_else(|| format!("Unknown device {vendor_id:04x}:{product_id:04x}"))
}
