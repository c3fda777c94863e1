// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! One playing articulation: play position, pitch ratio, ADSR envelope, and
//! the preload-then-ring sample source.
//!
//! A voice renders from its record's preload buffer until the play position
//! crosses the preload boundary, then draws source frames from its ring
//! buffer, which the disk streamer fills starting at that boundary. The ring
//! handoff uses a stream epoch: note-on bumps `epoch`, and the voice ignores
//! the ring until the streamer has reset it for the new stream and published
//! the matching `armed_epoch`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::ring_buffer::RingBuffer;
use crate::audio::MAX_CHANNELS;
use crate::instrument::InstrumentMap;

/// Length of the click-free fade applied before a voice slot is reused.
pub const QUICK_FADE_SECONDS: f32 = 0.010;

/// ADSR stage times are clamped to at least this.
pub const MIN_STAGE_SECONDS: f32 = 0.001;

/// Amplitude envelope parameters, in seconds and level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdsrParams {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for AdsrParams {
    fn default() -> Self {
        Self {
            attack: 0.01,
            decay: 0.1,
            sustain: 0.7,
            release: 0.3,
        }
    }
}

/// The envelope stage machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdsrStage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Voice state shared between the audio thread and the disk streamer.
///
/// The audio thread writes everything except `armed_epoch` and the ring's
/// producer side; the streamer writes those.
pub struct VoiceShared {
    active: AtomicBool,
    needs_data: AtomicBool,
    /// Bumped by the audio thread on every note-on.
    epoch: AtomicU64,
    /// The epoch the ring currently carries stream data for. Published by
    /// the streamer after it has reset the ring for a new stream.
    armed_epoch: AtomicU64,
    /// Index of the playing articulation record in the current map.
    record_index: AtomicUsize,
    /// The source frame the ring stream starts at (the preload boundary the
    /// voice observed at note-on).
    stream_start: AtomicU64,
    ring: RingBuffer,
}

impl VoiceShared {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            needs_data: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            armed_epoch: AtomicU64::new(0),
            record_index: AtomicUsize::new(0),
            stream_start: AtomicU64::new(0),
            ring: RingBuffer::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn needs_data(&self) -> bool {
        self.needs_data.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn record_index(&self) -> usize {
        self.record_index.load(Ordering::Acquire)
    }

    pub fn stream_start(&self) -> u64 {
        self.stream_start.load(Ordering::Acquire)
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Streamer side: marks the ring as carrying data for `epoch`.
    pub fn arm(&self, epoch: u64) {
        self.armed_epoch.store(epoch, Ordering::Release);
    }
}

impl Default for VoiceShared {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl VoiceShared {
    /// Publishes a stream request the way a starting voice does (test only).
    pub(crate) fn request_stream(&self, record_index: usize, stream_start: u64) -> u64 {
        self.record_index.store(record_index, Ordering::Release);
        self.stream_start.store(stream_start, Ordering::Release);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.needs_data.store(true, Ordering::Release);
        self.active.store(true, Ordering::Release);
        epoch
    }

    /// The epoch the ring is currently armed for (test only).
    pub(crate) fn armed_epoch(&self) -> u64 {
        self.armed_epoch.load(Ordering::Acquire)
    }
}

/// Result of fetching one source frame.
enum Fetch {
    Frame([f32; MAX_CHANNELS]),
    /// The ring could not supply the frame yet.
    Starved,
    /// The stream ended before the requested frame.
    Ended,
}

/// One voice slot. Owned and mutated by the audio thread; the disk streamer
/// sees it only through [`VoiceShared`].
pub struct Voice {
    shared: Arc<VoiceShared>,

    map: Option<Arc<InstrumentMap>>,
    map_generation: u64,
    record_index: usize,
    /// The sounding MIDI note, which may differ from the record's source
    /// note due to fallback or sample offset.
    midi_note: u8,
    velocity_gain: f32,
    pitch_ratio: f64,
    /// Fractional play position in source frames.
    position: f64,

    stage: AdsrStage,
    env_level: f32,
    env_increment: f32,
    adsr: AdsrParams,

    start_counter: u64,
    quick_fade: bool,
    fade_gain: f32,
    fade_step: f32,

    /// Interpolation window: `frame_a` is source frame `window_base`,
    /// `frame_b` the one after (clamped at the last frame). -1 = unprimed.
    window_base: i64,
    frame_a: [f32; MAX_CHANNELS],
    frame_b: [f32; MAX_CHANNELS],

    stream_epoch: u64,
    active: bool,
    channels: usize,
    total_frames: u64,
    preload_frames: u64,
    /// The host rate the voice was started at; envelope increments are
    /// derived from it.
    sample_rate: f32,
}

impl Voice {
    pub fn new(shared: Arc<VoiceShared>) -> Self {
        Self {
            shared,
            map: None,
            map_generation: 0,
            record_index: 0,
            midi_note: 0,
            velocity_gain: 0.0,
            pitch_ratio: 1.0,
            position: 0.0,
            stage: AdsrStage::Idle,
            env_level: 0.0,
            env_increment: 0.0,
            adsr: AdsrParams::default(),
            start_counter: 0,
            quick_fade: false,
            fade_gain: 1.0,
            fade_step: 0.0,
            window_base: -1,
            frame_a: [0.0; MAX_CHANNELS],
            frame_b: [0.0; MAX_CHANNELS],
            stream_epoch: 0,
            active: false,
            channels: 1,
            total_frames: 0,
            preload_frames: 0,
            sample_rate: 44100.0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn midi_note(&self) -> u8 {
        self.midi_note
    }

    pub fn start_counter(&self) -> u64 {
        self.start_counter
    }

    pub fn stage(&self) -> AdsrStage {
        self.stage
    }

    pub fn is_quick_fading(&self) -> bool {
        self.quick_fade
    }

    pub fn map_generation(&self) -> u64 {
        self.map_generation
    }

    pub fn pitch_ratio(&self) -> f64 {
        self.pitch_ratio
    }

    pub fn set_adsr(&mut self, adsr: AdsrParams) {
        self.adsr = adsr;
    }

    /// Arms the voice on an articulation and publishes the stream request to
    /// the disk thread.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        map: Arc<InstrumentMap>,
        map_generation: u64,
        record_index: usize,
        midi_note: u8,
        velocity: u8,
        sample_rate: f32,
        adsr: AdsrParams,
        start_counter: u64,
    ) {
        let record = match map.record(record_index) {
            Some(record) => record,
            None => return,
        };

        self.pitch_ratio = (record.sample_rate() as f64 / sample_rate as f64)
            * 2f64.powf((midi_note as f64 - record.key().note as f64) / 12.0);
        self.channels = record.channels() as usize;
        self.total_frames = record.total_frames();
        self.preload_frames = record.preload_frames().min(self.total_frames);
        self.velocity_gain = velocity as f32 / 127.0;
        self.midi_note = midi_note;
        self.position = 0.0;
        self.window_base = -1;

        self.sample_rate = sample_rate;
        self.stage = AdsrStage::Attack;
        self.env_level = 0.0;
        self.env_increment = 1.0 / (adsr.attack.max(MIN_STAGE_SECONDS) * sample_rate);
        self.adsr = adsr;

        self.quick_fade = false;
        self.fade_gain = 1.0;
        self.fade_step = 0.0;
        self.start_counter = start_counter;
        self.record_index = record_index;
        self.map_generation = map_generation;
        self.map = Some(map);
        self.active = true;

        // Publish the stream request. The streamer acquires the epoch, so the
        // record index and stream start stored before the bump are visible.
        let shared = &self.shared;
        shared.record_index.store(record_index, Ordering::Release);
        shared
            .stream_start
            .store(self.preload_frames, Ordering::Release);
        self.stream_epoch = shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        shared.needs_data.store(
            self.preload_frames < self.total_frames,
            Ordering::Release,
        );
        shared.active.store(true, Ordering::Release);
    }

    /// Switches the envelope to release over the given time.
    pub fn begin_release(&mut self, seconds: f32, sample_rate: f32) {
        if !self.active || self.stage == AdsrStage::Idle {
            return;
        }
        self.stage = AdsrStage::Release;
        self.env_increment =
            -(self.env_level.max(0.0)) / (seconds.max(MIN_STAGE_SECONDS) * sample_rate);
    }

    /// Starts the 10 ms click-free ramp used before a slot is reused.
    pub fn start_quick_fade(&mut self, sample_rate: f32) {
        if !self.active || self.quick_fade {
            return;
        }
        self.quick_fade = true;
        self.fade_step = 1.0 / (QUICK_FADE_SECONDS * sample_rate);
    }

    /// Immediately deactivates the voice. Last-resort stealing and reload
    /// quiescing only; normal teardown goes through release or quick fade.
    pub fn stop(&mut self) {
        self.deactivate();
    }

    fn deactivate(&mut self) {
        self.active = false;
        self.stage = AdsrStage::Idle;
        self.env_level = 0.0;
        self.map = None;
        self.shared.active.store(false, Ordering::Release);
        self.shared.needs_data.store(false, Ordering::Release);
    }

    fn advance_envelope(&mut self) {
        match self.stage {
            AdsrStage::Idle => {}
            AdsrStage::Attack => {
                self.env_level += self.env_increment;
                if self.env_level >= 1.0 {
                    self.env_level = 1.0;
                    self.stage = AdsrStage::Decay;
                    self.env_increment = (self.adsr.sustain - 1.0)
                        / (self.adsr.decay.max(MIN_STAGE_SECONDS) * self.sample_rate);
                }
            }
            AdsrStage::Decay => {
                self.env_level += self.env_increment;
                if self.env_level <= self.adsr.sustain {
                    self.env_level = self.adsr.sustain;
                    self.stage = AdsrStage::Sustain;
                    self.env_increment = 0.0;
                }
            }
            AdsrStage::Sustain => {
                self.env_level = self.adsr.sustain;
            }
            AdsrStage::Release => {
                self.env_level += self.env_increment;
                if self.env_level <= 0.0 {
                    self.env_level = 0.0;
                    self.stage = AdsrStage::Idle;
                }
            }
        }
    }

    /// Fetches one source frame, strictly sequentially past the preload
    /// boundary so ring consumption stays aligned with the stream.
    fn fetch(&mut self, frame_index: u64, preload: &[f32]) -> Fetch {
        if frame_index < self.preload_frames {
            let base = frame_index as usize * self.channels;
            if preload.len() < base + self.channels {
                // The preload was released beneath us by a limit change.
                return Fetch::Starved;
            }
            let mut frame = [0.0; MAX_CHANNELS];
            frame[..self.channels].copy_from_slice(&preload[base..base + self.channels]);
            return Fetch::Frame(frame);
        }

        let shared = &self.shared;
        if shared.armed_epoch.load(Ordering::Acquire) != self.stream_epoch {
            return Fetch::Starved;
        }
        let mut frame = [0.0; MAX_CHANNELS];
        if shared.ring.read(&mut frame[..self.channels], 1) == 1 {
            Fetch::Frame(frame)
        } else if shared.ring.end_of_stream() {
            Fetch::Ended
        } else {
            Fetch::Starved
        }
    }

    /// Advances the interpolation window so `frame_a` is the frame at
    /// `pos0`. Returns `None` on starvation or stream end.
    fn ensure_window(&mut self, pos0: u64, preload: &[f32]) -> Option<bool> {
        if self.window_base < 0 {
            match self.fetch(0, preload) {
                Fetch::Frame(frame) => {
                    self.frame_a = frame;
                    self.window_base = 0;
                }
                Fetch::Starved => return Some(false),
                Fetch::Ended => return None,
            }
            if self.total_frames > 1 {
                match self.fetch(1, preload) {
                    Fetch::Frame(frame) => self.frame_b = frame,
                    Fetch::Starved => {
                        self.window_base = -1;
                        return Some(false);
                    }
                    Fetch::Ended => return None,
                }
            } else {
                self.frame_b = self.frame_a;
            }
        }

        while (self.window_base as u64) < pos0 {
            let next = self.window_base as u64 + 2;
            let frame = if next <= self.total_frames - 1 {
                match self.fetch(next, preload) {
                    Fetch::Frame(frame) => frame,
                    Fetch::Starved => return Some(false),
                    Fetch::Ended => return None,
                }
            } else {
                // Clamp at the last source frame.
                self.frame_b
            };
            self.frame_a = self.frame_b;
            self.frame_b = frame;
            self.window_base += 1;
        }
        Some(true)
    }

    /// Renders into an interleaved stereo segment, mix-adding. Returns true
    /// if the voice starved for source data at any point in the segment.
    pub fn render(&mut self, out: &mut [f32]) -> bool {
        if !self.active {
            return false;
        }
        let map = match &self.map {
            Some(map) => map.clone(),
            None => {
                self.deactivate();
                return false;
            }
        };
        let record = match map.record(self.record_index) {
            Some(record) => record,
            None => {
                self.deactivate();
                return false;
            }
        };
        let preload_guard = record.preload().read();

        let frames = out.len() / MAX_CHANNELS;
        let mut starved = false;

        for frame in 0..frames {
            self.advance_envelope();
            if self.stage == AdsrStage::Idle {
                self.deactivate();
                break;
            }
            if self.total_frames < 2
                || self.position >= (self.total_frames - 1) as f64
            {
                self.deactivate();
                break;
            }

            let pos0 = self.position as u64;
            let frac = (self.position - pos0 as f64) as f32;

            match self.ensure_window(pos0, &preload_guard) {
                Some(true) => {}
                Some(false) => {
                    // Starved: emit silence, hold the position until the
                    // streamer catches up.
                    starved = true;
                    continue;
                }
                None => {
                    self.deactivate();
                    break;
                }
            }

            let gain = self.env_level * self.fade_gain * self.velocity_gain;
            for ch in 0..MAX_CHANNELS {
                let source_channel = ch.min(self.channels - 1);
                let a = self.frame_a[source_channel];
                let b = self.frame_b[source_channel];
                out[frame * MAX_CHANNELS + ch] += (a + (b - a) * frac) * gain;
            }

            if self.quick_fade {
                self.fade_gain -= self.fade_step;
                if self.fade_gain <= 0.0 {
                    self.deactivate();
                    break;
                }
            }

            self.position += self.pitch_ratio;
        }

        if self.active {
            let streaming = self.preload_frames < self.total_frames;
            self.shared.needs_data.store(
                streaming && self.shared.ring.needs_data(),
                Ordering::Release,
            );
        }
        starved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::map::ArticulationRecord;
    use crate::instrument::parser::ParsedName;
    use std::path::PathBuf;

    const SR: f32 = 48000.0;

    /// A map with one fully-resident C4 record containing a mono ramp.
    fn ramp_map(frames: u64, sample_rate: u32) -> Arc<InstrumentMap> {
        let key = ParsedName {
            note: 60,
            velocity: 127,
            round_robin: 1,
        };
        let record = ArticulationRecord::new(
            key,
            PathBuf::from("C4_127_01.wav"),
            sample_rate,
            1,
            frames,
            frames * 4,
        );
        let data: Vec<f32> = (0..frames).map(|i| i as f32 * 1e-6).collect();
        record.set_preload(data, frames);
        Arc::new(InstrumentMap::build(vec![record]))
    }

    fn started_voice(map: Arc<InstrumentMap>, adsr: AdsrParams) -> Voice {
        let mut voice = Voice::new(Arc::new(VoiceShared::new()));
        voice.start(map, 1, 0, 60, 127, SR, adsr, 1);
        voice
    }

    #[test]
    fn test_adsr_stage_progression() {
        let map = ramp_map(SR as u64 * 2, SR as u32);
        let adsr = AdsrParams {
            attack: 0.01,
            decay: 0.02,
            sustain: 0.5,
            release: 0.05,
        };
        let mut voice = started_voice(map, adsr);
        assert_eq!(voice.stage(), AdsrStage::Attack);

        let mut out = vec![0.0f32; 512 * 2];
        // Attack is 480 frames; one block finishes it and starts the decay.
        voice.render(&mut out);
        assert_eq!(voice.stage(), AdsrStage::Decay);

        // Decay is 960 frames.
        for _ in 0..4 {
            out.fill(0.0);
            voice.render(&mut out);
        }
        assert_eq!(voice.stage(), AdsrStage::Sustain);
        assert!((voice.env_level - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_release_reaches_idle_in_time() {
        let map = ramp_map(SR as u64 * 4, SR as u32);
        let mut voice = started_voice(map, AdsrParams::default());

        let mut out = vec![0.0f32; 512 * 2];
        for _ in 0..8 {
            out.fill(0.0);
            voice.render(&mut out);
        }

        let release = 0.05f32;
        voice.begin_release(release, SR);

        // Must reach Idle within release seconds plus one block.
        let budget_frames = (release * SR) as usize + 512;
        let mut rendered = 0;
        while voice.is_active() && rendered <= budget_frames {
            out.fill(0.0);
            voice.render(&mut out);
            rendered += 512;
        }
        assert!(!voice.is_active(), "voice still active after {} frames", rendered);
        assert_eq!(voice.stage(), AdsrStage::Idle);
    }

    #[test]
    fn test_quick_fade_deactivates_within_ten_ms() {
        let map = ramp_map(SR as u64, SR as u32);
        let mut voice = started_voice(map, AdsrParams::default());

        let mut out = vec![0.0f32; 64 * 2];
        voice.render(&mut out);
        voice.start_quick_fade(SR);

        let budget = (QUICK_FADE_SECONDS * SR) as usize + 64;
        let mut rendered = 0;
        while voice.is_active() && rendered <= budget {
            out.fill(0.0);
            voice.render(&mut out);
            rendered += 64;
        }
        assert!(!voice.is_active());
    }

    #[test]
    fn test_output_follows_source_through_interpolation() {
        let frames = 10000u64;
        let map = ramp_map(frames, SR as u32);
        // Flat envelope so the output equals the source.
        let adsr = AdsrParams {
            attack: 0.001,
            decay: 0.001,
            sustain: 1.0,
            release: 0.3,
        };
        let mut voice = started_voice(map, adsr);

        let mut out = vec![0.0f32; 256 * 2];
        // Skip the attack.
        voice.render(&mut out);

        out.fill(0.0);
        voice.render(&mut out);
        // Pitch ratio 1, mono source: both channels carry the ramp exactly.
        for frame in 0..256 {
            let expected = (256 + frame) as f32 * 1e-6;
            assert!((out[frame * 2] - expected).abs() < 1e-7, "frame {}", frame);
            assert_eq!(out[frame * 2], out[frame * 2 + 1]);
        }
    }

    #[test]
    fn test_output_length_follows_pitch_ratio() {
        // A 44.1 kHz source on a 48 kHz host, same source/target note.
        let source_frames = 44100u64;
        let map = ramp_map(source_frames, 44100);
        let adsr = AdsrParams {
            attack: 0.001,
            decay: 0.001,
            sustain: 1.0,
            release: 0.3,
        };
        let mut voice = started_voice(map, adsr);
        assert!((voice.pitch_ratio() - 44100.0 / 48000.0).abs() < 1e-9);

        // Render one frame at a time for an exact output length.
        let mut out = [0.0f32; 2];
        let mut emitted = 0u64;
        while voice.is_active() {
            out.fill(0.0);
            voice.render(&mut out);
            if voice.is_active() {
                emitted += 1;
            }
        }

        let expected = (source_frames as f64 / voice.pitch_ratio()) as i64;
        assert!(
            (emitted as i64 - expected).abs() <= 1,
            "emitted {} expected {}",
            emitted,
            expected
        );
    }

    #[test]
    fn test_unarmed_ring_starves_instead_of_garbage() {
        // A record whose preload covers only part of the source: once the
        // position crosses the boundary with no streamer attached, the voice
        // emits silence and reports starvation.
        let key = ParsedName {
            note: 60,
            velocity: 127,
            round_robin: 1,
        };
        let record = ArticulationRecord::new(
            key,
            PathBuf::from("C4_127_01.wav"),
            SR as u32,
            1,
            100000,
            400000,
        );
        record.set_preload(vec![0.25; 1000], 1000);
        let map = Arc::new(InstrumentMap::build(vec![record]));

        let mut voice = started_voice(map, AdsrParams::default());
        let mut out = vec![0.0f32; 512 * 2];
        let mut starved = false;
        for _ in 0..4 {
            out.fill(0.0);
            starved |= voice.render(&mut out);
        }
        assert!(starved);
        assert!(voice.is_active());
        // The starved tail is silent.
        assert_eq!(out[511 * 2], 0.0);
    }
}
