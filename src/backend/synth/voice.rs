use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdsrConfig {
    /// Seconds
    pub attack: f32,
    /// Seconds
    pub decay: f32,
    /// 0.0 -> 1.0
    pub sustain: f32,
    /// Seconds
    pub release: f32,
}

impl Default for AdsrConfig {
    fn default() -> Self {
        Self {
            attack: 0.005,
            decay: 0.15,
            sustain: 0.6,
            release: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnvelopeStage {
    Attack,
    Decay,
    Sustain,
    Release,
    Idle,
}

pub fn midi_to_freq(note: u8) -> f32 {
    440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0)
}

/// One sounding note of the built-in synth.
#[derive(Debug, Clone)]
pub struct Voice {
    pub channel: u8,
    pub note: u8,
    gain: f32,
    freq: f32,
    phase: f32,
    stage: EnvelopeStage,
    level: f32,
    /// Envelope level when the release started.
    release_from: f32,
    /// Seconds spent in the current stage.
    time: f32,
}

impl Voice {
    pub fn idle() -> Self {
        Self {
            channel: 0,
            note: 0,
            gain: 0.0,
            freq: 0.0,
            phase: 0.0,
            stage: EnvelopeStage::Idle,
            level: 0.0,
            release_from: 0.0,
            time: 0.0,
        }
    }

    pub fn start(&mut self, channel: u8, note: u8, velocity: u8) {
        self.channel = channel;
        self.note = note;
        self.gain = velocity as f32 / 127.0;
        self.freq = midi_to_freq(note);
        self.phase = 0.0;
        self.stage = EnvelopeStage::Attack;
        self.time = 0.0;
    }

    pub fn release(&mut self) {
        if matches!(self.stage, EnvelopeStage::Release | EnvelopeStage::Idle) {
            return;
        }
        self.release_from = self.level;
        self.stage = EnvelopeStage::Release;
        self.time = 0.0;
    }

    pub fn is_idle(&self) -> bool {
        self.stage == EnvelopeStage::Idle
    }

    pub fn is_held(&self, channel: u8, note: u8) -> bool {
        self.channel == channel
            && self.note == note
            && !matches!(self.stage, EnvelopeStage::Release | EnvelopeStage::Idle)
    }

    pub fn stage(&self) -> EnvelopeStage {
        self.stage
    }

    pub fn next_sample(&mut self, adsr: &AdsrConfig, sample_rate: f32) -> f32 {
        if self.stage == EnvelopeStage::Idle {
            return 0.0;
        }
        let dt = 1.0 / sample_rate;
        self.level = self.envelope(adsr);
        self.advance(adsr, dt);

        let sample = (self.phase * 2.0 * std::f32::consts::PI).sin();
        self.phase += self.freq / sample_rate;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }
        sample * self.level * self.gain
    }

    fn envelope(&self, adsr: &AdsrConfig) -> f32 {
        match self.stage {
            EnvelopeStage::Attack => progress(self.time, adsr.attack),
            EnvelopeStage::Decay => 1.0 - (1.0 - adsr.sustain) * progress(self.time, adsr.decay),
            EnvelopeStage::Sustain => adsr.sustain,
            EnvelopeStage::Release => {
                self.release_from * (1.0 - progress(self.time, adsr.release))
            }
            EnvelopeStage::Idle => 0.0,
        }
    }

    fn advance(&mut self, adsr: &AdsrConfig, dt: f32) {
        self.time += dt;
        let (limit, next) = match self.stage {
            EnvelopeStage::Attack => (adsr.attack, EnvelopeStage::Decay),
            EnvelopeStage::Decay => (adsr.decay, EnvelopeStage::Sustain),
            EnvelopeStage::Release => (adsr.release, EnvelopeStage::Idle),
            EnvelopeStage::Sustain | EnvelopeStage::Idle => return,
        };
        if self.time >= limit {
            self.stage = next;
            self.time = 0.0;
        }
    }
}

fn progress(time: f32, length: f32) -> f32 {
    if length == 0.0 {
        1.0
    } else {
        (time / length).min(1.0)
    }
}
