//! Output backends the dispatch thread forwards packed messages to.
//!
//! A backend is bound to one dispatch session and owned by its consumer
//! thread for that session's whole lifetime. Switching backends means
//! closing the session and starting a new one.

mod midi_out;
mod synth;

pub use midi_out::MidiOutBackend;
pub use synth::{AdsrConfig, SynthBackend};

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: String,
}

pub trait Backend: Send {
    fn name(&self) -> &str;

    /// Opens the device matched by `device` (an index or a name fragment),
    /// or the backend's default when `None`.
    fn initialize(&mut self, device: Option<&str>) -> Result<(), BackendError>;

    /// Forwards one packed channel message. Must not block: a slow send
    /// stalls every message queued behind it.
    fn send(&mut self, packed: u32);

    fn shutdown(&mut self);

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Midi { port: Option<String> },
    Synth,
    Null,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Midi { port: None }
    }
}

impl BackendKind {
    pub fn device(&self) -> Option<&str> {
        match self {
            BackendKind::Midi { port } => port.as_deref(),
            BackendKind::Synth | BackendKind::Null => None,
        }
    }
}

pub fn create(kind: &BackendKind) -> Box<dyn Backend> {
    match kind {
        BackendKind::Midi { .. } => Box::new(MidiOutBackend::new("smfplay")),
        BackendKind::Synth => Box::new(SynthBackend::new(AdsrConfig::default())),
        BackendKind::Null => Box::new(NullBackend),
    }
}

/// Picks a device by index or by case-insensitive name fragment.
pub fn select_device<'a>(
    devices: &'a [DeviceDescriptor],
    selector: Option<&str>,
) -> Option<&'a DeviceDescriptor> {
    let Some(selector) = selector else {
        return devices.first();
    };
    if let Ok(index) = selector.trim().parse::<usize>() {
        return devices.iter().find(|d| d.index == index);
    }
    let needle = selector.to_lowercase();
    devices
        .iter()
        .find(|d| d.name.to_lowercase().contains(&needle))
}

/// Discards everything.
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn initialize(&mut self, _device: Option<&str>) -> Result<(), BackendError> {
        Ok(())
    }

    fn send(&mut self, _packed: u32) {}

    fn shutdown(&mut self) {}

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        vec![DeviceDescriptor {
            index: 0,
            name: "null".into(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<DeviceDescriptor> {
        ["Midi Through Port-0", "FluidSynth virt port", "USB Keys"]
            .iter()
            .enumerate()
            .map(|(index, name)| DeviceDescriptor {
                index,
                name: name.to_string(),
            })
            .collect()
    }

    #[test]
    fn selects_first_device_by_default() {
        let devices = devices();
        assert_eq!(select_device(&devices, None).unwrap().index, 0);
    }

    #[test]
    fn selects_device_by_index_or_name() {
        let devices = devices();
        assert_eq!(select_device(&devices, Some("2")).unwrap().name, "USB Keys");
        assert_eq!(select_device(&devices, Some("fluid")).unwrap().index, 1);
        assert!(select_device(&devices, Some("7")).is_none());
        assert!(select_device(&devices, Some("nothing")).is_none());
    }
}
