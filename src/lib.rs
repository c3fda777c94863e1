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

//! A MIDI-driven, disk-streaming polyphonic sampler engine.
//!
//! The engine plays instrument libraries laid out as a flat directory of
//! audio files named `<Note>_<Velocity>_<RR>[_<suffix>…].<ext>`. Each file is
//! one articulation: a single (pitch, velocity layer, round robin) rendering.
//! Only the head of each file is kept in RAM; the rest is streamed from disk
//! on demand, so instruments far larger than memory remain playable.
//!
//! This crate provides:
//! - Filename parsing and the velocity-layer / round-robin instrument map
//! - Voice management with per-note polyphony, stealing, and ADSR envelopes
//! - A background disk streamer feeding per-voice lock-free ring buffers
//! - A persisted key-value state record for host integration
//!
//! The host owns the audio callback and the MIDI transport: it calls
//! [`SamplerEngine::process_block`] with the block's events and an output
//! buffer, and drives everything else through [`EngineControls`].

pub mod audio;
pub mod config;
pub mod engine;
pub mod instrument;
pub mod midi;
#[cfg(test)]
mod testutil;

pub use audio::reader::AudioFileReader;
pub use config::EngineConfig;
pub use engine::{BlockEvent, EngineControls, EngineStats, SamplerEngine};
pub use instrument::loader::LoadingState;
pub use midi::MidiEvent;
