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

//! The persisted key-value state record.
//!
//! Hosts read and write this record verbatim (typically inside their own
//! project/session state). Restoring it through
//! [`EngineControls::apply_config`](crate::engine::EngineControls::apply_config)
//! is idempotent and safe when the sample folder no longer exists.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Engine state as persisted by the host. Unknown keys are ignored on read;
/// missing keys take their defaults.
#[derive(Deserialize, Clone, Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Folder to auto-load on restore.
    sample_folder: Option<PathBuf>,

    /// ADSR parameters, in seconds (sustain is a 0..1 level).
    attack: f32,
    decay: f32,
    sustain: f32,
    release: f32,

    /// Per-sample preload size in KB (32..1024).
    #[serde(rename = "preloadSizeKB")]
    preload_size_kb: u32,

    /// Semitone output shift (-12..12).
    transpose: i32,

    /// Semitone source shift (-12..12): audio is borrowed from a neighboring
    /// articulation and pitch-corrected back.
    sample_offset: i32,

    /// Number of velocity layers kept active and preloaded.
    velocity_layer_limit: u32,

    /// Number of round-robin positions kept active and preloaded.
    round_robin_limit: u32,

    /// Release time in seconds for voices superseded by a same-note
    /// retrigger (0.01..5.0).
    same_note_release: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_folder: None,
            attack: 0.01,
            decay: 0.1,
            sustain: 0.7,
            release: 0.3,
            preload_size_kb: 64,
            transpose: 0,
            sample_offset: 0,
            velocity_layer_limit: 127,
            round_robin_limit: 127,
            same_note_release: 0.1,
        }
    }
}

impl EngineConfig {
    /// Assembles a record from current engine state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sample_folder: Option<PathBuf>,
        attack: f32,
        decay: f32,
        sustain: f32,
        release: f32,
        preload_size_kb: u32,
        transpose: i32,
        sample_offset: i32,
        velocity_layer_limit: u32,
        round_robin_limit: u32,
        same_note_release: f32,
    ) -> Self {
        Self {
            sample_folder,
            attack,
            decay,
            sustain,
            release,
            preload_size_kb,
            transpose,
            sample_offset,
            velocity_layer_limit,
            round_robin_limit,
            same_note_release,
        }
    }

    pub fn sample_folder(&self) -> Option<&Path> {
        self.sample_folder.as_deref()
    }

    pub fn attack(&self) -> f32 {
        self.attack
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    pub fn sustain(&self) -> f32 {
        self.sustain
    }

    pub fn release(&self) -> f32 {
        self.release
    }

    pub fn preload_size_kb(&self) -> u32 {
        self.preload_size_kb
    }

    pub fn transpose(&self) -> i32 {
        self.transpose
    }

    pub fn sample_offset(&self) -> i32 {
        self.sample_offset
    }

    pub fn velocity_layer_limit(&self) -> u32 {
        self.velocity_layer_limit
    }

    pub fn round_robin_limit(&self) -> u32 {
        self.round_robin_limit
    }

    pub fn same_note_release(&self) -> f32 {
        self.same_note_release
    }

    /// Serializes the record for host persistence.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Restores a record written by [`EngineConfig::to_yaml`].
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_values() {
        let config = EngineConfig::new(
            Some(PathBuf::from("/samples/grand")),
            0.02,
            0.2,
            0.5,
            0.8,
            256,
            -3,
            2,
            4,
            2,
            0.25,
        );

        let yaml = config.to_yaml().unwrap();
        let restored = EngineConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_key_names_match_host_contract() {
        let yaml = EngineConfig::default().to_yaml().unwrap();
        for key in [
            "sampleFolder",
            "attack",
            "decay",
            "sustain",
            "release",
            "preloadSizeKB",
            "transpose",
            "sampleOffset",
            "velocityLayerLimit",
            "roundRobinLimit",
            "sameNoteRelease",
        ] {
            assert!(yaml.contains(key), "missing key {} in:\n{}", key, yaml);
        }
    }

    #[test]
    fn test_missing_keys_take_defaults() {
        let config = EngineConfig::from_yaml("attack: 0.5\ntranspose: 3\n").unwrap();
        assert_eq!(config.attack(), 0.5);
        assert_eq!(config.transpose(), 3);
        assert_eq!(config.decay(), 0.1);
        assert_eq!(config.preload_size_kb(), 64);
        assert_eq!(config.sample_folder(), None);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = EngineConfig::from_yaml("attack: 0.5\nfutureKnob: 12\n").unwrap();
        assert_eq!(config.attack(), 0.5);
    }
}
