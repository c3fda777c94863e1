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

//! The engine's MIDI event surface.
//!
//! The MIDI transport belongs to the host; the engine consumes a small event
//! enum. [`MidiEvent::from_raw`] adapts raw wire bytes for hosts that deliver
//! them unparsed.

use midly::live::LiveEvent;
use midly::MidiMessage;
use tracing::debug;

/// The MIDI controller number for the sustain pedal.
pub const CC_SUSTAIN: u8 = 64;

/// A MIDI event the engine reacts to. Anything else is ignored at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    /// Note on. A velocity of 0 is handled as a note off, per the MIDI
    /// convention.
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    Controller { controller: u8, value: u8 },
}

impl MidiEvent {
    /// Parses a raw MIDI message. Returns `None` for unparseable bytes and
    /// for message types the engine does not react to.
    pub fn from_raw(raw: &[u8]) -> Option<MidiEvent> {
        let event = match LiveEvent::parse(raw) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = ?e, "Failed to parse MIDI event");
                return None;
            }
        };

        let LiveEvent::Midi { message, .. } = event else {
            return None;
        };

        match message {
            MidiMessage::NoteOn { key, vel } => Some(MidiEvent::NoteOn {
                note: u8::from(key),
                velocity: u8::from(vel),
            }),
            MidiMessage::NoteOff { key, .. } => Some(MidiEvent::NoteOff {
                note: u8::from(key),
            }),
            MidiMessage::Controller { controller, value } => Some(MidiEvent::Controller {
                controller: u8::from(controller),
                value: u8::from(value),
            }),
            _ => None,
        }
    }
}
