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

//! The instrument map: the immutable note → velocity-layer → round-robin
//! index built at load time, plus the selective-preload machinery.
//!
//! The map itself never changes after publication. The per-record preload
//! buffers are the one exception: they are swapped behind per-record locks
//! when the preload size or the selective-preload limits change.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::audio::reader;
use crate::instrument::parser::ParsedName;

/// One velocity layer of a note. `velocity_value` comes from the file name;
/// the range is derived once all of the note's layers are known and covers
/// `[range_start, range_end]` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocityLayer {
    pub velocity_value: u8,
    pub range_start: u8,
    pub range_end: u8,
}

/// Per-note mapping: the note's own velocity layers (possibly empty) and the
/// fallback note used to source audio when it has none.
#[derive(Debug, Default)]
pub struct NoteMapping {
    /// Sorted by `velocity_value` ascending.
    pub layers: Vec<VelocityLayer>,
    /// The smallest MIDI note strictly above this one with its own layers.
    pub fallback: Option<u8>,
    /// Indices into the record vector for this note's articulations.
    pub records: Vec<usize>,
}

/// One articulation: a single audio file keyed by (note, velocity layer,
/// round robin), with the head of the file preloaded for zero-latency attack.
pub struct ArticulationRecord {
    key: ParsedName,
    /// Zero-based position of this record's layer in its note's sorted
    /// layer list. Assigned during map construction.
    velocity_layer_index: u16,
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    total_frames: u64,
    file_size: u64,
    /// Interleaved f32 head of the file. Swapped, never grown in place.
    preload: RwLock<Vec<f32>>,
    preloaded: AtomicBool,
    /// The source frame at which the preload ends and streaming begins.
    preload_frames: AtomicU64,
}

impl ArticulationRecord {
    pub fn new(
        key: ParsedName,
        path: PathBuf,
        sample_rate: u32,
        channels: u16,
        total_frames: u64,
        file_size: u64,
    ) -> Self {
        Self {
            key,
            velocity_layer_index: 0,
            path,
            sample_rate,
            channels,
            total_frames,
            file_size,
            preload: RwLock::new(Vec::new()),
            preloaded: AtomicBool::new(false),
            preload_frames: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> ParsedName {
        self.key
    }

    pub fn velocity_layer_index(&self) -> u16 {
        self.velocity_layer_index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn preloaded(&self) -> bool {
        self.preloaded.load(Ordering::Acquire)
    }

    /// The source frame at which streaming takes over from the preload.
    pub fn preload_frames(&self) -> u64 {
        self.preload_frames.load(Ordering::Acquire)
    }

    /// The preload buffer. Voices take short read guards while rendering;
    /// the reconcile pass takes the write side only to swap buffers.
    pub fn preload(&self) -> &RwLock<Vec<f32>> {
        &self.preload
    }

    /// Installs a preload buffer covering the first `frames` source frames.
    pub fn set_preload(&self, data: Vec<f32>, frames: u64) {
        *self.preload.write() = data;
        self.preload_frames.store(frames, Ordering::Release);
        self.preloaded.store(true, Ordering::Release);
    }

    fn clear_preload(&self) {
        // Unpreload the flag first so selection stops returning this record
        // before its buffer goes away.
        self.preloaded.store(false, Ordering::Release);
        self.preload_frames.store(0, Ordering::Release);
        *self.preload.write() = Vec::new();
    }

    /// Whether this record belongs to the preloaded set under the given
    /// selective-preload limits.
    pub fn should_preload(&self, velocity_layer_limit: usize, round_robin_limit: usize) -> bool {
        (self.velocity_layer_index as usize) < velocity_layer_limit
            && self.key.round_robin >= 1
            && (self.key.round_robin as usize) <= round_robin_limit
    }

    /// How many frames the preload should cover for a given preload size.
    pub fn preload_target_frames(&self, preload_kb: usize) -> u64 {
        let frames = (preload_kb * 1024) / (self.channels as usize * 4);
        (frames as u64).min(self.total_frames)
    }
}

impl std::fmt::Debug for ArticulationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArticulationRecord")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("preloaded", &self.preloaded())
            .finish()
    }
}

/// The immutable bundle published after every (re)load.
pub struct InstrumentMap {
    /// One entry per MIDI note 0..=127.
    notes: Vec<NoteMapping>,
    records: Vec<ArticulationRecord>,
    max_round_robins: u16,
    max_velocity_layers: u16,
    total_file_size: u64,
    /// RAM currently held by preload buffers, updated by reconcile passes.
    preload_memory: AtomicU64,
    /// Serializes reconcile passes from the UI and loader threads.
    reconcile_lock: Mutex<()>,
}

impl InstrumentMap {
    /// An empty map: every note unplayable.
    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    /// Builds the map from parsed articulation records.
    ///
    /// Duplicate (note, velocity, round robin) keys keep the last record in
    /// input order and log a warning naming both files.
    pub fn build(records: Vec<ArticulationRecord>) -> Self {
        // Last write wins for duplicate keys.
        let mut keep = vec![true; records.len()];
        let mut by_key = std::collections::HashMap::new();
        for (index, record) in records.iter().enumerate() {
            let key = (
                record.key.note,
                record.key.velocity,
                record.key.round_robin,
            );
            if let Some(previous) = by_key.insert(key, index) {
                keep[previous] = false;
                warn!(
                    kept = %record.path.display(),
                    dropped = %records[previous].path.display(),
                    "Duplicate articulation key, last file wins"
                );
            }
        }
        let mut records: Vec<ArticulationRecord> = records
            .into_iter()
            .zip(keep)
            .filter_map(|(record, keep)| keep.then_some(record))
            .collect();

        // Velocity-layer lattice per note.
        let mut notes: Vec<NoteMapping> = (0..128).map(|_| NoteMapping::default()).collect();
        for record in &records {
            let mapping = &mut notes[record.key.note as usize];
            if !mapping
                .layers
                .iter()
                .any(|l| l.velocity_value == record.key.velocity)
            {
                mapping.layers.push(VelocityLayer {
                    velocity_value: record.key.velocity,
                    range_start: 1,
                    range_end: record.key.velocity,
                });
            }
        }

        // Sort layers and derive the contiguous velocity ranges.
        for mapping in notes.iter_mut() {
            mapping.layers.sort_by_key(|l| l.velocity_value);
            let mut previous = 0u8;
            for layer in mapping.layers.iter_mut() {
                layer.range_start = previous + 1;
                layer.range_end = layer.velocity_value;
                previous = layer.velocity_value;
            }
        }

        // Fallbacks: the nearest higher note with its own layers.
        for note in 0..128usize {
            if notes[note].layers.is_empty() {
                notes[note].fallback = (note + 1..128)
                    .find(|&higher| !notes[higher].layers.is_empty())
                    .map(|higher| higher as u8);
            }
        }

        // Per-record layer indices and per-note record lists.
        for (index, record) in records.iter_mut().enumerate() {
            let mapping = &mut notes[record.key.note as usize];
            record.velocity_layer_index = mapping
                .layers
                .iter()
                .position(|l| l.velocity_value == record.key.velocity)
                .unwrap_or(0) as u16;
            mapping.records.push(index);
        }

        let max_round_robins = records.iter().map(|r| r.key.round_robin).max().unwrap_or(0);
        let max_velocity_layers = notes.iter().map(|m| m.layers.len()).max().unwrap_or(0) as u16;
        let total_file_size = records.iter().map(|r| r.file_size).sum();

        Self {
            notes,
            records,
            max_round_robins,
            max_velocity_layers,
            total_file_size,
            preload_memory: AtomicU64::new(0),
            reconcile_lock: Mutex::new(()),
        }
    }

    pub fn records(&self) -> &[ArticulationRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Option<&ArticulationRecord> {
        self.records.get(index)
    }

    pub fn note(&self, note: u8) -> &NoteMapping {
        &self.notes[note as usize]
    }

    pub fn max_round_robins(&self) -> u16 {
        self.max_round_robins
    }

    pub fn max_velocity_layers(&self) -> u16 {
        self.max_velocity_layers
    }

    pub fn total_file_size(&self) -> u64 {
        self.total_file_size
    }

    pub fn preload_memory_bytes(&self) -> u64 {
        self.preload_memory.load(Ordering::Acquire)
    }

    /// Resolves the note audio is sourced from: the note itself if it has own
    /// layers, otherwise its fallback.
    fn source_note(&self, note: u8) -> Option<u8> {
        let mapping = &self.notes[note as usize];
        if !mapping.layers.is_empty() {
            Some(note)
        } else {
            mapping.fallback
        }
    }

    /// Selects the articulation record for a note-on.
    ///
    /// The incoming velocity is remapped evenly across the first
    /// `velocity_layer_limit` layers of the source note, so lowering the
    /// limit at runtime still covers the whole 1..=127 range with the
    /// remaining quieter layers. Among the records of the selected layer,
    /// a preloaded record with the requested round robin is preferred;
    /// otherwise the first preloaded record of the layer is used.
    pub fn find_index(
        &self,
        note: u8,
        velocity: u8,
        round_robin: u16,
        velocity_layer_limit: usize,
    ) -> Option<usize> {
        let source = self.source_note(note)?;
        let mapping = &self.notes[source as usize];
        let layers_total = mapping.layers.len();
        if layers_total == 0 {
            return None;
        }

        let effective_layers = velocity_layer_limit.clamp(1, layers_total);
        let layer_index =
            (((velocity.max(1) - 1) as usize * effective_layers) / 127).min(effective_layers - 1);
        let target_velocity = mapping.layers[layer_index].velocity_value;

        let mut first_match = None;
        for &index in &mapping.records {
            let record = &self.records[index];
            if record.key.velocity != target_velocity || !record.preloaded() {
                continue;
            }
            if record.key.round_robin == round_robin {
                return Some(index);
            }
            if first_match.is_none() {
                first_match = Some(index);
            }
        }
        first_match
    }

    /// Like [`InstrumentMap::find_index`] but returns the record.
    pub fn find(
        &self,
        note: u8,
        velocity: u8,
        round_robin: u16,
        velocity_layer_limit: usize,
    ) -> Option<&ArticulationRecord> {
        self.find_index(note, velocity, round_robin, velocity_layer_limit)
            .map(|index| &self.records[index])
    }

    /// Brings every record's preload in line with the given limits and
    /// preload size: loads heads that should be resident, frees heads that
    /// should not, and refreshes the aggregate memory counter.
    ///
    /// Runs on the UI or loader thread; disk reads happen outside any
    /// per-record write lock, which is taken only to swap buffers.
    pub fn reconcile_preload(
        &self,
        preload_kb: usize,
        velocity_layer_limit: usize,
        round_robin_limit: usize,
    ) {
        let _guard = self.reconcile_lock.lock();

        for record in &self.records {
            let want = record.should_preload(velocity_layer_limit, round_robin_limit);
            let target_frames = record.preload_target_frames(preload_kb);

            if want {
                let current = record.preload_frames();
                if record.preloaded() && current == target_frames {
                    continue;
                }
                match load_preload(record, target_frames) {
                    Ok((data, frames)) => record.set_preload(data, frames),
                    Err(e) => {
                        warn!(
                            path = %record.path.display(),
                            error = %e,
                            "Failed to preload sample"
                        );
                    }
                }
            } else if record.preloaded() {
                record.clear_preload();
                debug!(path = %record.path.display(), "Preload released");
            }
        }

        let total: u64 = self
            .records
            .iter()
            .map(|r| (r.preload.read().len() * std::mem::size_of::<f32>()) as u64)
            .sum();
        self.preload_memory.store(total, Ordering::Release);
    }

    // UI queries below. These answer against the note's source (fallback
    // resolved) so a keyboard widget can show what actually sounds.

    /// True when the note has own layers or a playable fallback.
    pub fn is_note_available(&self, note: u8) -> bool {
        self.source_note(note).is_some()
    }

    /// True when the note has its own samples rather than a fallback.
    pub fn note_has_own_samples(&self, note: u8) -> bool {
        !self.notes[note as usize].layers.is_empty()
    }

    /// The velocity values of the note's layers after fallback resolution.
    pub fn velocity_layers(&self, note: u8) -> Vec<u8> {
        match self.source_note(note) {
            Some(source) => self.notes[source as usize]
                .layers
                .iter()
                .map(|l| l.velocity_value)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn lowest_available_note(&self) -> Option<u8> {
        (0..128u8).find(|&n| self.note_has_own_samples(n))
    }

    pub fn highest_available_note(&self) -> Option<u8> {
        (0..128u8).rev().find(|&n| self.note_has_own_samples(n))
    }

    /// The zero-based layer index the range table assigns to a velocity.
    /// The range table feeds the UI; playback selection uses the even
    /// remap in [`InstrumentMap::find_index`].
    pub fn velocity_layer_index(&self, note: u8, velocity: u8) -> Option<usize> {
        let source = self.source_note(note)?;
        self.notes[source as usize]
            .layers
            .iter()
            .position(|l| velocity >= l.range_start && velocity <= l.range_end)
    }
}

/// Reads the head of a record's file for preloading. Returns the interleaved
/// data and the number of frames it covers.
pub(crate) fn load_preload(
    record: &ArticulationRecord,
    target_frames: u64,
) -> Result<(Vec<f32>, u64), crate::audio::ReaderError> {
    let mut file_reader = reader::open(&record.path)?;
    let channels = record.channels as usize;
    let mut data = vec![0.0f32; target_frames as usize * channels];
    let got = file_reader.read_into(&mut data, 0, target_frames as u32) as u64;
    data.truncate(got as usize * channels);
    Ok((data, got))
}
