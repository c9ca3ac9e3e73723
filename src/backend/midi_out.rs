use midir::{MidiOutput, MidiOutputConnection};
use tracing::{info, trace};

use super::{Backend, DeviceDescriptor, select_device};
use crate::error::BackendError;
use crate::events::unpack;

/// Native MIDI output port through `midir`.
pub struct MidiOutBackend {
    client_name: String,
    connection: Option<MidiOutputConnection>,
}

impl MidiOutBackend {
    pub fn new(client_name: &str) -> Self {
        Self {
            client_name: client_name.to_string(),
            connection: None,
        }
    }

    fn client(&self) -> Result<MidiOutput, BackendError> {
        MidiOutput::new(&self.client_name).map_err(|e| BackendError::Unavailable(e.to_string()))
    }
}

impl Backend for MidiOutBackend {
    fn name(&self) -> &str {
        "midi"
    }

    fn initialize(&mut self, device: Option<&str>) -> Result<(), BackendError> {
        self.shutdown();

        let output = self.client()?;
        let ports = output.ports();
        let devices = describe(&output, &ports);
        if devices.is_empty() {
            return Err(BackendError::Unavailable("no MIDI output ports".into()));
        }
        let chosen = select_device(&devices, device)
            .ok_or_else(|| BackendError::DeviceNotFound(device.unwrap_or_default().to_string()))?;
        let port = &ports[chosen.index];

        let connection = output
            .connect(port, "smfplay-out")
            .map_err(|e| BackendError::Midi(e.to_string()))?;
        info!(port = %chosen.name, "midi output connected");
        self.connection = Some(connection);
        Ok(())
    }

    fn send(&mut self, packed: u32) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let (bytes, len) = unpack(packed);
        if let Err(e) = connection.send(&bytes[..len]) {
            trace!(error = %e, packed, "midi send failed");
        }
    }

    fn shutdown(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            info!("midi output closed");
        }
    }

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        match self.client() {
            Ok(output) => {
                let ports = output.ports();
                describe(&output, &ports)
            }
            Err(_) => Vec::new(),
        }
    }
}

fn describe(output: &MidiOutput, ports: &[midir::MidiOutputPort]) -> Vec<DeviceDescriptor> {
    ports
        .iter()
        .enumerate()
        .map(|(index, port)| DeviceDescriptor {
            index,
            name: output
                .port_name(port)
                .unwrap_or_else(|_| format!("port {index}")),
        })
        .collect()
}
