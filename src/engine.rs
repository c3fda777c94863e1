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

//! The sampler engine: MIDI dispatch, voice allocation and stealing, block
//! rendering, and the host-facing control surface.
//!
//! The engine is split along its thread boundary:
//! - [`SamplerEngine`] is the audio-side object. The host calls
//!   [`SamplerEngine::process_block`] from its audio callback with the
//!   block's MIDI events and an interleaved stereo output buffer.
//! - [`EngineControls`] is a cloneable handle for every other thread:
//!   parameter setters, library loading, persisted state, and the
//!   observation snapshot polled by UIs.
//!
//! All runtime knobs are atomic scalars snapshotted once per block; the
//! audio thread takes no lock beyond the uncontended map-snapshot read.

pub mod streamer;
pub mod voice;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::instrument::loader::{self, LoadingState};
use crate::instrument::InstrumentMap;
use crate::midi::{MidiEvent, CC_SUSTAIN};
use streamer::DiskStreamer;
use voice::{AdsrParams, Voice, VoiceShared};

/// Size of the voice pool.
pub const MAX_VOICES: usize = 180;

/// At most this many voices may sound the same MIDI note at once.
pub const MAX_VOICES_PER_NOTE: usize = 4;

/// How long a reload waits for the audio thread to acknowledge the freeze.
/// A host that stopped calling `process_block` must not wedge a load.
const QUIESCE_TIMEOUT: Duration = Duration::from_millis(200);

/// An f32 stored in an atomic u32 as its bit pattern.
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

/// All runtime knobs, each an atomic scalar. Setters clamp; the audio
/// thread snapshots once per block.
struct EngineParams {
    attack: AtomicF32,
    decay: AtomicF32,
    sustain: AtomicF32,
    release: AtomicF32,
    same_note_release: AtomicF32,
    transpose: AtomicU32,
    sample_offset: AtomicU32,
    velocity_layer_limit: AtomicUsize,
    round_robin_limit: AtomicUsize,
    preload_kb: AtomicUsize,
}

impl EngineParams {
    fn new() -> Self {
        let adsr = AdsrParams::default();
        Self {
            attack: AtomicF32::new(adsr.attack),
            decay: AtomicF32::new(adsr.decay),
            sustain: AtomicF32::new(adsr.sustain),
            release: AtomicF32::new(adsr.release),
            same_note_release: AtomicF32::new(0.1),
            transpose: AtomicU32::new(0i32 as u32),
            sample_offset: AtomicU32::new(0i32 as u32),
            velocity_layer_limit: AtomicUsize::new(127),
            round_robin_limit: AtomicUsize::new(127),
            preload_kb: AtomicUsize::new(64),
        }
    }

    fn adsr(&self) -> AdsrParams {
        AdsrParams {
            attack: self.attack.load(),
            decay: self.decay.load(),
            sustain: self.sustain.load(),
            release: self.release.load(),
        }
    }

    fn transpose(&self) -> i32 {
        self.transpose.load(Ordering::Acquire) as i32
    }

    fn sample_offset(&self) -> i32 {
        self.sample_offset.load(Ordering::Acquire) as i32
    }
}

/// State shared between the audio side, the control handle, and the worker
/// threads.
struct EngineShared {
    /// The published instrument map. The audio thread clones the Arc once
    /// per block; writers swap it only while voices are quiesced.
    map: RwLock<Arc<InstrumentMap>>,
    /// Bumped on every map swap; voices started against an older map are
    /// stopped on the next block.
    map_generation: AtomicU64,
    params: EngineParams,
    voice_shared: Vec<Arc<VoiceShared>>,
    streamer: Mutex<Option<DiskStreamer>>,
    loader: Mutex<Option<JoinHandle<()>>>,
    loading_state: AtomicU8,
    loaded_folder: Mutex<Option<PathBuf>>,
    /// Reload handshake: the loader raises `freeze`, the audio thread stops
    /// all voices and bumps `quiesce_gen` to acknowledge.
    freeze: std::sync::atomic::AtomicBool,
    quiesce_gen: AtomicU64,
    underruns: AtomicU64,
    /// Disk throughput in bytes per second, written by the streamer.
    throughput_bps: Arc<AtomicU64>,
}

impl EngineShared {
    fn new() -> Self {
        let voice_shared = (0..MAX_VOICES)
            .map(|_| Arc::new(VoiceShared::new()))
            .collect();
        Self {
            map: RwLock::new(Arc::new(InstrumentMap::empty())),
            map_generation: AtomicU64::new(0),
            params: EngineParams::new(),
            voice_shared,
            streamer: Mutex::new(None),
            loader: Mutex::new(None),
            loading_state: AtomicU8::new(LoadingState::Idle as u8),
            loaded_folder: Mutex::new(None),
            freeze: std::sync::atomic::AtomicBool::new(false),
            quiesce_gen: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            throughput_bps: Arc::new(AtomicU64::new(0)),
        }
    }

    fn start_streamer(&self) {
        let mut guard = self.streamer.lock();
        if guard.is_none() {
            *guard = Some(DiskStreamer::start(
                self.voice_shared.clone(),
                self.map.read().clone(),
                self.throughput_bps.clone(),
            ));
        }
    }

    fn stop_streamer(&self) {
        if let Some(streamer) = self.streamer.lock().take() {
            streamer.stop();
        }
    }

    /// Re-runs selective preloading against the current knobs.
    fn reconcile_preload(&self) {
        let map = self.map.read().clone();
        map.reconcile_preload(
            self.params.preload_kb.load(Ordering::Acquire),
            self.params.velocity_layer_limit.load(Ordering::Acquire),
            self.params.round_robin_limit.load(Ordering::Acquire),
        );
    }

    fn shutdown(&self) {
        // The loader restarts the streamer when it finishes, so it has to be
        // joined first.
        if let Some(handle) = self.loader.lock().take() {
            let _ = handle.join();
        }
        self.stop_streamer();
    }
}

/// One MIDI event with its offset in frames from the start of the block.
/// Events must be in timestamp order, as delivered by the host.
#[derive(Debug, Clone, Copy)]
pub struct BlockEvent {
    pub offset: u32,
    pub event: MidiEvent,
}

/// A read-only snapshot of the engine's observable state, polled by UIs.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub loading_state: LoadingState,
    pub loaded_folder: Option<PathBuf>,
    pub total_file_size: u64,
    pub preload_memory_bytes: u64,
    pub active_voices: usize,
    /// Voices currently asking the disk streamer for data.
    pub streaming_voices: usize,
    pub disk_throughput_mbps: f32,
    pub underruns: u64,
}

/// The audio-side sampler engine. See the module docs for the thread split.
pub struct SamplerEngine {
    shared: Arc<EngineShared>,
    voices: Vec<Voice>,
    current_rr: u16,
    start_counter: u64,
    sustain_pedal: bool,
    /// Notes whose note-off arrived while the pedal was down.
    sustained: [bool; 128],
    sample_rate: f32,
}

impl SamplerEngine {
    pub fn new() -> Self {
        let shared = Arc::new(EngineShared::new());
        let voices = shared
            .voice_shared
            .iter()
            .map(|vs| Voice::new(vs.clone()))
            .collect();
        Self {
            shared,
            voices,
            current_rr: 1,
            start_counter: 0,
            sustain_pedal: false,
            sustained: [false; 128],
            sample_rate: 0.0,
        }
    }

    /// A control handle for the host/UI thread. Cloneable and thread-safe.
    pub fn controls(&self) -> EngineControls {
        EngineControls {
            shared: self.shared.clone(),
        }
    }

    /// Must be called before processing. Stores the host rate and starts
    /// the disk streamer.
    pub fn prepare(&mut self, sample_rate: u32, _max_block_frames: usize) {
        self.sample_rate = sample_rate as f32;
        self.current_rr = 1;
        self.sustain_pedal = false;
        self.sustained = [false; 128];
        self.shared.start_streamer();
    }

    /// Renders one block into an interleaved stereo buffer, applying the
    /// block's events at their frame offsets in order.
    pub fn process_block(&mut self, events: &[BlockEvent], out: &mut [f32]) {
        out.fill(0.0);

        let shared = &self.shared;
        if shared.freeze.load(Ordering::Acquire) {
            // Reload quiesce: stop everything, acknowledge, output silence.
            for voice in self.voices.iter_mut() {
                voice.stop();
            }
            shared.quiesce_gen.fetch_add(1, Ordering::AcqRel);
            return;
        }
        if self.sample_rate <= 0.0 {
            return;
        }

        let map = shared.map.read().clone();
        let generation = shared.map_generation.load(Ordering::Acquire);
        for voice in self.voices.iter_mut() {
            if voice.is_active() && voice.map_generation() != generation {
                voice.stop();
            }
        }

        let adsr = shared.params.adsr();
        for voice in self.voices.iter_mut() {
            voice.set_adsr(adsr);
        }

        let frames = out.len() / 2;
        let mut cursor = 0usize;
        for block_event in events {
            let offset = (block_event.offset as usize).min(frames);
            if offset > cursor {
                Self::render_segment(
                    &mut self.voices,
                    &mut out[cursor * 2..offset * 2],
                    &self.shared.underruns,
                );
                cursor = offset;
            }
            self.apply_event(&map, generation, adsr, block_event.event);
        }
        if cursor < frames {
            Self::render_segment(
                &mut self.voices,
                &mut out[cursor * 2..frames * 2],
                &self.shared.underruns,
            );
        }
    }

    fn render_segment(voices: &mut [Voice], out: &mut [f32], underruns: &AtomicU64) {
        for voice in voices.iter_mut() {
            if voice.is_active() && voice.render(out) {
                underruns.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn apply_event(
        &mut self,
        map: &Arc<InstrumentMap>,
        generation: u64,
        adsr: AdsrParams,
        event: MidiEvent,
    ) {
        match event {
            MidiEvent::NoteOn { note, velocity } if velocity > 0 => {
                self.note_on(map, generation, adsr, note, velocity);
            }
            // Note-on with velocity 0 is a note-off per the MIDI convention.
            MidiEvent::NoteOn { note, .. } | MidiEvent::NoteOff { note } => {
                self.note_off(adsr, note);
            }
            MidiEvent::Controller { controller, value } if controller == CC_SUSTAIN => {
                self.sustain_pedal_change(adsr, value >= 64);
            }
            MidiEvent::Controller { .. } => {}
        }
    }

    fn note_on(
        &mut self,
        map: &Arc<InstrumentMap>,
        generation: u64,
        adsr: AdsrParams,
        note: u8,
        velocity: u8,
    ) {
        let params = &self.shared.params;
        // Transpose shifts the sounding note; sample offset shifts only the
        // articulation the audio is sourced from.
        let sounding = (note as i32 + params.transpose()).clamp(0, 127) as u8;
        let lookup = (sounding as i32 + params.sample_offset()).clamp(0, 127) as u8;

        let velocity_layer_limit = params.velocity_layer_limit.load(Ordering::Acquire).max(1);
        let round_robin_limit = params
            .round_robin_limit
            .load(Ordering::Acquire)
            .clamp(1, map.max_round_robins().max(1) as usize) as u16;

        let record_index =
            match map.find_index(lookup, velocity, self.current_rr, velocity_layer_limit) {
                Some(index) => index,
                None => return,
            };

        self.sustained[sounding as usize] = false;

        // Polyphonic same-note handling: the old vibration decays on its own
        // release while the new attack begins.
        let same_note_release = params.same_note_release.load();
        for voice in self.voices.iter_mut() {
            if voice.is_active() && voice.midi_note() == sounding && !voice.is_quick_fading() {
                voice.begin_release(same_note_release, self.sample_rate);
            }
        }

        // Per-note cap: quick-fade the oldest voice on this note.
        let note_count = self
            .voices
            .iter()
            .filter(|v| v.is_active() && v.midi_note() == sounding)
            .count();
        if note_count >= MAX_VOICES_PER_NOTE {
            if let Some(oldest) = self.oldest_active_on_note(sounding) {
                self.voices[oldest].start_quick_fade(self.sample_rate);
            }
        }

        let slot = match self.allocate_voice() {
            Some(slot) => slot,
            None => return,
        };

        self.start_counter += 1;
        self.voices[slot].start(
            map.clone(),
            generation,
            record_index,
            sounding,
            velocity,
            self.sample_rate,
            adsr,
            self.start_counter,
        );

        self.current_rr = (self.current_rr % round_robin_limit) + 1;
    }

    /// Picks a slot for a new voice: any inactive slot, else quick-fade the
    /// globally oldest and retry, else force-stop the oldest and reuse it.
    fn allocate_voice(&mut self) -> Option<usize> {
        if let Some(slot) = self.find_inactive() {
            return Some(slot);
        }
        if let Some(oldest) = self.oldest_active() {
            self.voices[oldest].start_quick_fade(self.sample_rate);
        }
        if let Some(slot) = self.find_inactive() {
            return Some(slot);
        }
        // Last resort: an audible cut beats a dropped note.
        let oldest = self.oldest_active()?;
        self.voices[oldest].stop();
        Some(oldest)
    }

    fn find_inactive(&self) -> Option<usize> {
        self.voices.iter().position(|v| !v.is_active())
    }

    fn oldest_active(&self) -> Option<usize> {
        self.voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_active())
            .min_by_key(|(_, v)| v.start_counter())
            .map(|(index, _)| index)
    }

    fn oldest_active_on_note(&self, note: u8) -> Option<usize> {
        self.voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_active() && v.midi_note() == note && !v.is_quick_fading())
            .min_by_key(|(_, v)| v.start_counter())
            .map(|(index, _)| index)
    }

    fn note_off(&mut self, adsr: AdsrParams, note: u8) {
        let sounding =
            (note as i32 + self.shared.params.transpose()).clamp(0, 127) as u8;

        if self.sustain_pedal {
            // Held by the pedal: remember and release on the up-edge.
            self.sustained[sounding as usize] = true;
            return;
        }

        for voice in self.voices.iter_mut() {
            if voice.is_active() && voice.midi_note() == sounding {
                voice.begin_release(adsr.release, self.sample_rate);
            }
        }
    }

    fn sustain_pedal_change(&mut self, adsr: AdsrParams, down: bool) {
        if down {
            self.sustain_pedal = true;
            return;
        }
        if !self.sustain_pedal {
            return;
        }
        self.sustain_pedal = false;

        for note in 0..128usize {
            if !self.sustained[note] {
                continue;
            }
            self.sustained[note] = false;
            for voice in self.voices.iter_mut() {
                if voice.is_active() && voice.midi_note() == note as u8 {
                    voice.begin_release(adsr.release, self.sample_rate);
                }
            }
        }
    }
}

impl Default for SamplerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SamplerEngine {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for SamplerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerEngine")
            .field(
                "active_voices",
                &self.voices.iter().filter(|v| v.is_active()).count(),
            )
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

/// Cloneable control handle for the host/UI thread. All setters clamp their
/// inputs and never fail.
#[derive(Clone)]
pub struct EngineControls {
    shared: Arc<EngineShared>,
}

impl EngineControls {
    /// Loads an instrument library folder on a background thread. A load
    /// already in flight is joined first; the new map replaces the old one
    /// atomically once every voice has been quiesced.
    pub fn load_folder(&self, folder: impl Into<PathBuf>) {
        let folder = folder.into();

        // LoadCancelled semantics: the first run completes, the second
        // replaces the map. Holding the lock across the join serializes
        // concurrent callers.
        let mut loader_guard = self.shared.loader.lock();
        if let Some(handle) = loader_guard.take() {
            let _ = handle.join();
        }

        *self.shared.loaded_folder.lock() = Some(folder.clone());
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("msampler-loader".into())
            .spawn(move || load_library(&shared, &folder))
            .expect("failed to spawn loader thread");
        *loader_guard = Some(handle);
    }

    pub fn set_adsr(&self, attack: f32, decay: f32, sustain: f32, release: f32) {
        let params = &self.shared.params;
        params.attack.store(attack.max(voice::MIN_STAGE_SECONDS));
        params.decay.store(decay.max(voice::MIN_STAGE_SECONDS));
        params.sustain.store(sustain.clamp(0.0, 1.0));
        params.release.store(release.max(voice::MIN_STAGE_SECONDS));
    }

    pub fn set_same_note_release(&self, seconds: f32) {
        self.shared
            .params
            .same_note_release
            .store(seconds.clamp(0.01, 5.0));
    }

    pub fn set_transpose(&self, semitones: i32) {
        self.shared
            .params
            .transpose
            .store(semitones.clamp(-12, 12) as u32, Ordering::Release);
    }

    pub fn set_sample_offset(&self, semitones: i32) {
        self.shared
            .params
            .sample_offset
            .store(semitones.clamp(-12, 12) as u32, Ordering::Release);
    }

    pub fn set_preload_size_kb(&self, kb: u32) {
        self.shared
            .params
            .preload_kb
            .store(kb.clamp(32, 1024) as usize, Ordering::Release);
        self.shared.reconcile_preload();
    }

    pub fn set_velocity_layer_limit(&self, limit: u32) {
        self.shared
            .params
            .velocity_layer_limit
            .store(limit.max(1) as usize, Ordering::Release);
        self.shared.reconcile_preload();
    }

    pub fn set_round_robin_limit(&self, limit: u32) {
        self.shared
            .params
            .round_robin_limit
            .store(limit.max(1) as usize, Ordering::Release);
        self.shared.reconcile_preload();
    }

    /// The observation snapshot polled by UIs.
    pub fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        let map = shared.map.read().clone();
        let active_voices = shared
            .voice_shared
            .iter()
            .filter(|vs| vs.is_active())
            .count();
        let streaming_voices = shared
            .voice_shared
            .iter()
            .filter(|vs| vs.is_active() && vs.needs_data())
            .count();

        EngineStats {
            loading_state: LoadingState::from_u8(shared.loading_state.load(Ordering::Acquire)),
            loaded_folder: shared.loaded_folder.lock().clone(),
            total_file_size: map.total_file_size(),
            preload_memory_bytes: map.preload_memory_bytes(),
            active_voices,
            streaming_voices,
            disk_throughput_mbps: shared.throughput_bps.load(Ordering::Acquire) as f32 / 1e6,
            underruns: shared.underruns.load(Ordering::Acquire),
        }
    }

    pub fn reset_underruns(&self) {
        self.shared.underruns.store(0, Ordering::Release);
    }

    /// Applies a persisted state record. Idempotent; a folder that no longer
    /// exists is skipped by the loader.
    pub fn apply_config(&self, config: &EngineConfig) {
        self.set_adsr(
            config.attack(),
            config.decay(),
            config.sustain(),
            config.release(),
        );
        self.set_same_note_release(config.same_note_release());
        self.set_transpose(config.transpose());
        self.set_sample_offset(config.sample_offset());
        self.set_velocity_layer_limit(config.velocity_layer_limit());
        self.set_round_robin_limit(config.round_robin_limit());
        self.set_preload_size_kb(config.preload_size_kb());

        if let Some(folder) = config.sample_folder() {
            self.load_folder(folder.to_path_buf());
        }
    }

    /// Captures the current state for host persistence.
    pub fn capture_config(&self) -> EngineConfig {
        let params = &self.shared.params;
        EngineConfig::new(
            self.shared.loaded_folder.lock().clone(),
            params.attack.load(),
            params.decay.load(),
            params.sustain.load(),
            params.release.load(),
            params.preload_kb.load(Ordering::Acquire) as u32,
            params.transpose(),
            params.sample_offset(),
            params.velocity_layer_limit.load(Ordering::Acquire) as u32,
            params.round_robin_limit.load(Ordering::Acquire) as u32,
            params.same_note_release.load(),
        )
    }

    /// Stops the worker threads. Called by hosts on teardown; dropping the
    /// engine does the same.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

/// The loader-thread body: quiesce, scan, swap, restart.
fn load_library(shared: &Arc<EngineShared>, folder: &std::path::Path) {
    if !folder.is_dir() {
        // A restored folder that no longer exists; any previously loaded
        // library stays as it is.
        warn!(folder = %folder.display(), "Sample folder does not exist, skipping load");
        return;
    }

    shared
        .loading_state
        .store(LoadingState::Loading as u8, Ordering::Release);

    // No disk read may span the swap.
    shared.stop_streamer();

    // Freeze the audio thread and wait for its acknowledgment: one block
    // rendered with the freeze flag set has stopped every voice.
    shared.freeze.store(true, Ordering::Release);
    let observed = shared.quiesce_gen.load(Ordering::Acquire);
    let deadline = Instant::now() + QUIESCE_TIMEOUT;
    while shared.quiesce_gen.load(Ordering::Acquire) == observed && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }

    let params = &shared.params;
    let map = loader::scan_folder(
        folder,
        params.preload_kb.load(Ordering::Acquire),
        params.velocity_layer_limit.load(Ordering::Acquire),
        params.round_robin_limit.load(Ordering::Acquire),
    );

    *shared.map.write() = Arc::new(map);
    shared.map_generation.fetch_add(1, Ordering::AcqRel);
    shared.freeze.store(false, Ordering::Release);

    shared.start_streamer();
    shared
        .loading_state
        .store(LoadingState::Loaded as u8, Ordering::Release);
    info!(folder = %folder.display(), "Instrument ready");
}

#[cfg(test)]
impl EngineControls {
    /// Installs a prebuilt map directly, bypassing the folder scan.
    pub(crate) fn install_map(&self, map: InstrumentMap) {
        *self.shared.map.write() = Arc::new(map);
        self.shared.map_generation.fetch_add(1, Ordering::AcqRel);
        self.shared
            .loading_state
            .store(LoadingState::Loaded as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::map::ArticulationRecord;
    use crate::instrument::parser;
    use crate::testutil::{eventually, write_ramp_wav};
    use std::path::Path;
    use tempfile::tempdir;
    use super::voice::AdsrStage;

    const SR: u32 = 44100;

    /// A fully-resident mono record whose preload is a tiny ramp.
    fn ramp_record(name: &str, frames: u64) -> ArticulationRecord {
        let key = parser::parse_name(Path::new(name)).unwrap();
        let record =
            ArticulationRecord::new(key, PathBuf::from(name), SR, 1, frames, frames * 4);
        let data = (0..frames).map(|i| i as f32 * 1e-6).collect();
        record.set_preload(data, frames);
        record
    }

    /// A fully-resident mono record holding a constant value.
    fn constant_record(name: &str, frames: u64, value: f32) -> ArticulationRecord {
        let key = parser::parse_name(Path::new(name)).unwrap();
        let record =
            ArticulationRecord::new(key, PathBuf::from(name), SR, 1, frames, frames * 4);
        record.set_preload(vec![value; frames as usize], frames);
        record
    }

    fn engine_with_records(records: Vec<ArticulationRecord>) -> SamplerEngine {
        let mut engine = SamplerEngine::new();
        engine.prepare(SR, 512);
        engine.controls().install_map(InstrumentMap::build(records));
        engine
    }

    fn note_on(note: u8, velocity: u8) -> BlockEvent {
        BlockEvent {
            offset: 0,
            event: MidiEvent::NoteOn { note, velocity },
        }
    }

    fn note_off(note: u8) -> BlockEvent {
        BlockEvent {
            offset: 0,
            event: MidiEvent::NoteOff { note },
        }
    }

    fn cc(controller: u8, value: u8) -> BlockEvent {
        BlockEvent {
            offset: 0,
            event: MidiEvent::Controller { controller, value },
        }
    }

    fn active_count(engine: &SamplerEngine) -> usize {
        engine.voices.iter().filter(|v| v.is_active()).count()
    }

    #[test]
    fn test_note_on_allocates_and_unmapped_is_noop() {
        let mut engine = engine_with_records(vec![ramp_record("C4_127_01.wav", 10000)]);
        let mut out = vec![0.0f32; 256 * 2];

        // Note 70 has no articulation and no fallback above it.
        engine.process_block(&[note_on(70, 100)], &mut out);
        assert_eq!(active_count(&engine), 0);

        engine.process_block(&[note_on(60, 100)], &mut out);
        assert_eq!(active_count(&engine), 1);
        assert_eq!(engine.voices[0].midi_note(), 60);
        assert_eq!(engine.voices[0].stage(), AdsrStage::Attack);
        // The output is non-silent once the attack has risen.
        assert!(out.iter().any(|s| s.abs() > 0.0));
    }

    #[test]
    fn test_same_note_retrigger_is_polyphonic() {
        let mut engine = engine_with_records(vec![ramp_record("C4_127_01.wav", 10000)]);
        let mut out = vec![0.0f32; 220 * 2];

        engine.process_block(&[note_on(60, 100)], &mut out);
        // Roughly 5 ms later the same note strikes again.
        out.fill(0.0);
        engine.process_block(&[note_on(60, 100)], &mut out);

        assert_eq!(active_count(&engine), 2);
        // The old vibration decays while the new attack begins.
        assert_eq!(engine.voices[0].stage(), AdsrStage::Release);
        assert_eq!(engine.voices[1].stage(), AdsrStage::Attack);
    }

    #[test]
    fn test_per_note_voice_cap() {
        let mut engine = engine_with_records(vec![ramp_record("C4_127_01.wav", 16000)]);
        let mut out = vec![0.0f32; 64 * 2];

        let burst: Vec<BlockEvent> = (0..8).map(|_| note_on(60, 100)).collect();
        engine.process_block(&burst, &mut out);

        // Once the quick fades have run out (10 ms), at most the per-note
        // cap remains.
        for _ in 0..10 {
            out.fill(0.0);
            engine.process_block(&[], &mut out);
        }
        let on_note = engine
            .voices
            .iter()
            .filter(|v| v.is_active() && v.midi_note() == 60)
            .count();
        assert!(on_note <= MAX_VOICES_PER_NOTE, "{} voices on note", on_note);
        assert!(on_note > 0);
    }

    #[test]
    fn test_global_voice_cap() {
        // Notes 0..59 all fall back to the C4 record, each sounding its own
        // pitch, so the per-note cap never interferes.
        let mut engine = engine_with_records(vec![ramp_record("C4_127_01.wav", 16000)]);
        let mut out = vec![0.0f32; 32 * 2];

        let mut burst = Vec::new();
        for _ in 0..4 {
            for note in 0..60u8 {
                burst.push(note_on(note, 100));
            }
        }
        engine.process_block(&burst, &mut out);
        assert_eq!(active_count(&engine), MAX_VOICES);

        // More strikes never push past the pool.
        engine.process_block(&burst, &mut out);
        assert_eq!(active_count(&engine), MAX_VOICES);
    }

    #[test]
    fn test_sustain_pedal_defers_release() {
        let mut engine = engine_with_records(vec![ramp_record("C4_127_01.wav", 44100)]);
        let mut out = vec![0.0f32; 128 * 2];

        engine.process_block(&[note_on(60, 100)], &mut out);
        engine.process_block(&[cc(64, 127)], &mut out);
        engine.process_block(&[note_off(60)], &mut out);
        // Held by the pedal: no release yet.
        assert_ne!(engine.voices[0].stage(), AdsrStage::Release);

        engine.process_block(&[cc(64, 0)], &mut out);
        assert_eq!(engine.voices[0].stage(), AdsrStage::Release);
    }

    #[test]
    fn test_note_off_under_pedal_only_marks_released_notes() {
        let mut engine = engine_with_records(vec![ramp_record("C4_127_01.wav", 44100)]);
        let mut out = vec![0.0f32; 128 * 2];

        engine.process_block(&[note_on(59, 100), note_on(60, 100)], &mut out);
        engine.process_block(&[cc(64, 127)], &mut out);
        // Only note 60 is released under the pedal; 59 stays held by key.
        engine.process_block(&[note_off(60)], &mut out);
        engine.process_block(&[cc(64, 0)], &mut out);

        for voice in engine.voices.iter().filter(|v| v.is_active()) {
            match voice.midi_note() {
                59 => assert_ne!(voice.stage(), AdsrStage::Release),
                60 => assert_eq!(voice.stage(), AdsrStage::Release),
                other => panic!("unexpected voice on note {}", other),
            }
        }
    }

    #[test]
    fn test_velocity_zero_note_on_is_note_off() {
        let mut engine = engine_with_records(vec![ramp_record("C4_127_01.wav", 44100)]);
        let mut out = vec![0.0f32; 128 * 2];

        engine.process_block(&[note_on(60, 100)], &mut out);
        engine.process_block(&[note_on(60, 0)], &mut out);
        assert_eq!(engine.voices[0].stage(), AdsrStage::Release);
        // Velocity 0 never starts a voice.
        assert_eq!(active_count(&engine), 1);
    }

    #[test]
    fn test_transpose_shifts_sounding_note() {
        let mut engine = engine_with_records(vec![
            ramp_record("C4_127_01.wav", 10000),
            ramp_record("D4_127_01.wav", 10000),
        ]);
        engine.controls().set_transpose(2);

        let mut out = vec![0.0f32; 128 * 2];
        engine.process_block(&[note_on(58, 100)], &mut out);

        // 58 + 2 sounds C4 from its own articulation: no pitch shift.
        assert_eq!(engine.voices[0].midi_note(), 60);
        assert!((engine.voices[0].pitch_ratio() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_offset_borrows_neighboring_articulation() {
        let mut engine = engine_with_records(vec![
            ramp_record("C4_127_01.wav", 10000),
            ramp_record("D4_127_01.wav", 10000),
        ]);
        engine.controls().set_sample_offset(2);

        let mut out = vec![0.0f32; 128 * 2];
        engine.process_block(&[note_on(60, 100)], &mut out);

        // The sound comes from the D4 file, pitch-corrected down two
        // semitones to sound C4.
        assert_eq!(engine.voices[0].midi_note(), 60);
        let expected = 2f64.powf(-2.0 / 12.0);
        assert!((engine.voices[0].pitch_ratio() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_intra_block_event_offset() {
        let mut engine = engine_with_records(vec![constant_record("C4_127_01.wav", 44100, 0.25)]);
        let mut out = vec![0.0f32; 512 * 2];

        engine.process_block(
            &[BlockEvent {
                offset: 256,
                event: MidiEvent::NoteOn {
                    note: 60,
                    velocity: 100,
                },
            }],
            &mut out,
        );

        // Silence until the event's frame, sound after.
        assert!(out[..256 * 2].iter().all(|s| *s == 0.0));
        assert!(out[256 * 2..].iter().any(|s| s.abs() > 0.0));
    }

    #[test]
    fn test_setters_clamp() {
        let engine = SamplerEngine::new();
        let controls = engine.controls();

        controls.set_adsr(-1.0, 0.0, 7.0, -0.5);
        controls.set_transpose(100);
        controls.set_sample_offset(-100);
        controls.set_preload_size_kb(1);
        controls.set_same_note_release(99.0);
        controls.set_velocity_layer_limit(0);
        controls.set_round_robin_limit(0);

        let config = controls.capture_config();
        assert_eq!(config.attack(), voice::MIN_STAGE_SECONDS);
        assert_eq!(config.sustain(), 1.0);
        assert_eq!(config.release(), voice::MIN_STAGE_SECONDS);
        assert_eq!(config.transpose(), 12);
        assert_eq!(config.sample_offset(), -12);
        assert_eq!(config.preload_size_kb(), 32);
        assert_eq!(config.same_note_release(), 5.0);
        assert_eq!(config.velocity_layer_limit(), 1);
        assert_eq!(config.round_robin_limit(), 1);
    }

    #[test]
    fn test_stats_defaults() {
        let engine = SamplerEngine::new();
        let stats = engine.controls().stats();
        assert_eq!(stats.loading_state, LoadingState::Idle);
        assert_eq!(stats.loaded_folder, None);
        assert_eq!(stats.active_voices, 0);
        assert_eq!(stats.streaming_voices, 0);
        assert_eq!(stats.underruns, 0);
        assert_eq!(stats.total_file_size, 0);
    }

    #[test]
    fn test_streaming_playback_end_to_end() {
        let dir = tempdir().unwrap();
        // Three seconds of mono ramp: far more than the 64 KB preload.
        let frames = 132300usize;
        write_ramp_wav(&dir.path().join("C4_127_01.wav"), SR, 1, frames);

        let mut engine = SamplerEngine::new();
        engine.prepare(SR, 512);
        let controls = engine.controls();
        // Flat envelope so output equals source.
        controls.set_adsr(0.001, 0.001, 1.0, 0.05);
        controls.load_folder(dir.path());

        eventually(
            || controls.stats().loading_state == LoadingState::Loaded,
            "library never finished loading",
        );

        let mut out = vec![0.0f32; 512 * 2];
        let mut collected: Vec<f32> = Vec::new();

        engine.process_block(&[note_on(60, 127)], &mut out);
        collected.extend(out.iter().step_by(2));

        // Pace the callback loop so the block cadence stays well above the
        // streamer tick.
        for _ in 0..120 {
            std::thread::sleep(Duration::from_millis(2));
            out.fill(0.0);
            engine.process_block(&[], &mut out);
            collected.extend(out.iter().step_by(2));
        }

        // Past the attack, the left channel reproduces the source ramp
        // exactly: preload first, then streamed frames, no seams.
        for (frame, sample) in collected.iter().enumerate().skip(1000) {
            let expected = frame as f32 * 1e-6;
            assert!(
                (sample - expected).abs() < 1e-7,
                "frame {}: got {} expected {}",
                frame,
                sample,
                expected
            );
        }

        let stats = controls.stats();
        assert_eq!(stats.underruns, 0, "streaming underran");
        assert_eq!(stats.active_voices, 1);
        assert!(stats.total_file_size > 0);
        assert!(stats.preload_memory_bytes > 0);

        controls.shutdown();
    }

    #[test]
    fn test_restore_with_missing_folder_skips_load() {
        let engine = SamplerEngine::new();
        let controls = engine.controls();

        let config = EngineConfig::from_yaml(
            "sampleFolder: /nonexistent/instrument\nattack: 0.02\ntranspose: 3\n",
        )
        .unwrap();

        // Applying twice is idempotent and never fails.
        controls.apply_config(&config);
        controls.apply_config(&config);
        controls.shutdown();

        let stats = controls.stats();
        assert_eq!(stats.loading_state, LoadingState::Idle);
        assert_eq!(
            stats.loaded_folder,
            Some(PathBuf::from("/nonexistent/instrument"))
        );
        let captured = controls.capture_config();
        assert_eq!(captured.attack(), 0.02);
        assert_eq!(captured.transpose(), 3);
    }

    #[test]
    fn test_reload_quiesces_voices() {
        let dir = tempdir().unwrap();
        write_ramp_wav(&dir.path().join("C4_127_01.wav"), SR, 1, 44100);

        let mut engine = SamplerEngine::new();
        engine.prepare(SR, 512);
        let controls = engine.controls();
        controls.load_folder(dir.path());
        eventually(
            || controls.stats().loading_state == LoadingState::Loaded,
            "first load never finished",
        );

        let mut out = vec![0.0f32; 256 * 2];
        engine.process_block(&[note_on(60, 100)], &mut out);
        assert_eq!(active_count(&engine), 1);

        // Reload while the note rings. Keep the callback running so the
        // freeze handshake is acknowledged promptly.
        controls.load_folder(dir.path());
        let start = Instant::now();
        while controls.stats().loading_state != LoadingState::Loaded {
            assert!(start.elapsed() < Duration::from_secs(10), "reload stalled");
            engine.process_block(&[], &mut out);
            std::thread::sleep(Duration::from_millis(1));
        }

        engine.process_block(&[], &mut out);
        assert_eq!(active_count(&engine), 0);
        assert_eq!(controls.stats().active_voices, 0);

        // The reloaded map is playable again.
        engine.process_block(&[note_on(60, 100)], &mut out);
        assert_eq!(active_count(&engine), 1);

        controls.shutdown();
    }
}
