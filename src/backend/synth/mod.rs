mod voice;

pub use voice::{AdsrConfig, EnvelopeStage, Voice, midi_to_freq};

use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::channel::{self, Sender};
use ringbuf::{
    HeapCons, HeapProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use tracing::{error, info};

use super::{Backend, DeviceDescriptor};
use crate::error::BackendError;
use crate::events;

const MAX_VOICES: usize = 64;
const MESSAGE_QUEUE: usize = 4096;
const MASTER_GAIN: f32 = 0.15;
const PERCUSSION_CHANNEL: u8 = 9;

/// Built-in sine synthesizer on the default audio output.
///
/// The cpal stream lives on its own thread because streams cannot be moved
/// between threads on every platform. Messages reach the audio callback
/// through a ring buffer.
pub struct SynthBackend {
    adsr: AdsrConfig,
    producer: Option<HeapProd<u32>>,
    stop_tx: Option<Sender<()>>,
    output_thread: Option<JoinHandle<()>>,
}

impl SynthBackend {
    pub fn new(adsr: AdsrConfig) -> Self {
        Self {
            adsr,
            producer: None,
            stop_tx: None,
            output_thread: None,
        }
    }
}

impl Backend for SynthBackend {
    fn name(&self) -> &str {
        "synth"
    }

    fn initialize(&mut self, _device: Option<&str>) -> Result<(), BackendError> {
        self.shutdown();

        let ring_buffer = HeapRb::<u32>::new(MESSAGE_QUEUE);
        let (producer, consumer) = ring_buffer.split();
        let (ready_tx, ready_rx) = channel::bounded::<Result<(), BackendError>>(1);
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let adsr = self.adsr;

        let handle = thread::Builder::new()
            .name("synth-output".into())
            .spawn(move || match build_stream(consumer, adsr) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(BackendError::Audio("synth output thread exited".into())));
        if let Err(e) = ready {
            let _ = handle.join();
            return Err(e);
        }

        self.producer = Some(producer);
        self.stop_tx = Some(stop_tx);
        self.output_thread = Some(handle);
        Ok(())
    }

    fn send(&mut self, packed: u32) {
        if let Some(producer) = self.producer.as_mut() {
            let _ = producer.try_push(packed);
        }
    }

    fn shutdown(&mut self) {
        self.producer = None;
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.output_thread.take() {
            let _ = handle.join();
            info!("synth output closed");
        }
    }

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        vec![DeviceDescriptor {
            index: 0,
            name: "default audio output".into(),
        }]
    }
}

impl Drop for SynthBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SynthState {
    consumer: HeapCons<u32>,
    voices: Vec<Voice>,
    adsr: AdsrConfig,
    sample_rate: f32,
    num_channels: usize,
}

fn build_stream(consumer: HeapCons<u32>, adsr: AdsrConfig) -> Result<cpal::Stream, BackendError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| BackendError::Audio("no output device".into()))?;
    let config = device
        .default_output_config()
        .map_err(|e| BackendError::Audio(e.to_string()))?;
    let stream_config: cpal::StreamConfig = config.into();

    let num_channels = stream_config.channels as usize;
    let sample_rate = stream_config.sample_rate as f32;
    info!(num_channels, sample_rate, "synth output opened");

    let mut state = SynthState {
        consumer,
        voices: vec![Voice::idle(); MAX_VOICES],
        adsr,
        sample_rate,
        num_channels,
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                audio_callback(data, &mut state);
            },
            |err| error!(error = %err, "audio stream error"),
            None,
        )
        .map_err(|e| BackendError::Audio(e.to_string()))?;
    stream
        .play()
        .map_err(|e| BackendError::Audio(e.to_string()))?;
    Ok(stream)
}

fn audio_callback(data: &mut [f32], state: &mut SynthState) {
    while let Some(packed) = state.consumer.try_pop() {
        apply_message(&mut state.voices, packed);
    }

    let channels = state.num_channels.max(1);
    for frame in data.chunks_mut(channels) {
        let mut sample = 0.0;
        for voice in &mut state.voices {
            sample += voice.next_sample(&state.adsr, state.sample_rate);
        }
        frame.fill(sample * MASTER_GAIN);
    }
}

fn apply_message(voices: &mut [Voice], packed: u32) {
    let status = events::status(packed);
    let channel = status & 0x0F;
    let note = events::data1(packed);
    let velocity = events::data2(packed);

    match status & 0xF0 {
        0x90 if velocity > 0 => {
            if channel == PERCUSSION_CHANNEL {
                return;
            }
            if let Some(voice) = voices.iter_mut().find(|v| v.is_idle()) {
                voice.start(channel, note, velocity);
            }
        }
        0x80 | 0x90 => {
            if let Some(voice) = voices.iter_mut().find(|v| v.is_held(channel, note)) {
                voice.release();
            }
        }
        // All Notes Off / All Sound Off
        0xB0 if note == 123 || note == 120 => {
            for voice in voices.iter_mut().filter(|v| v.channel == channel) {
                voice.release();
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_messages_start_and_release_voices() {
        let mut voices = vec![Voice::idle(); 4];
        apply_message(&mut voices, events::pack(0x92, 60, 100));
        assert!(voices[0].is_held(2, 60));

        apply_message(&mut voices, events::pack(0x92, 60, 0));
        assert_eq!(voices[0].stage(), EnvelopeStage::Release);
    }

    #[test]
    fn percussion_channel_is_silent() {
        let mut voices = vec![Voice::idle(); 2];
        apply_message(&mut voices, events::pack(0x99, 36, 100));
        assert!(voices.iter().all(Voice::is_idle));
    }

    #[test]
    fn all_notes_off_releases_channel() {
        let mut voices = vec![Voice::idle(); 4];
        apply_message(&mut voices, events::pack(0x90, 60, 100));
        apply_message(&mut voices, events::pack(0x90, 64, 100));
        apply_message(&mut voices, events::pack(0x91, 67, 100));
        apply_message(&mut voices, events::pack(0xB0, 123, 0));
        assert_eq!(voices[0].stage(), EnvelopeStage::Release);
        assert_eq!(voices[1].stage(), EnvelopeStage::Release);
        assert!(voices[2].is_held(1, 67));
    }
}
