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

//! The library load pipeline: a non-recursive folder scan, a parallel
//! metadata pass, and a parallel preload pass, producing a finished
//! [`InstrumentMap`] ready to be swapped in.

use std::fs;
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::audio::reader;
use crate::instrument::map::{self, ArticulationRecord, InstrumentMap};
use crate::instrument::parser;

/// Where a library load currently stands. Exposed to hosts for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadingState {
    Idle = 0,
    Loading = 1,
    Loaded = 2,
}

impl LoadingState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LoadingState::Loading,
            2 => LoadingState::Loaded,
            _ => LoadingState::Idle,
        }
    }
}

/// Scans a folder and builds the instrument map, preloading the records the
/// current limits select. Files with unparseable names or unreadable content
/// are skipped.
pub fn scan_folder(
    folder: &Path,
    preload_kb: usize,
    velocity_layer_limit: usize,
    round_robin_limit: usize,
) -> InstrumentMap {
    let started = Instant::now();

    let mut paths = match fs::read_dir(folder) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect::<Vec<_>>(),
        Err(e) => {
            warn!(folder = %folder.display(), error = %e, "Failed to read sample folder");
            Vec::new()
        }
    };
    // Directory order is not stable; sort so duplicate-key resolution and
    // record indices are deterministic.
    paths.sort();

    let candidates = paths.len();
    let records: Vec<ArticulationRecord> = paths
        .par_iter()
        .filter_map(|path| {
            let key = match parser::parse_name(path) {
                Some(key) => key,
                None => {
                    debug!(path = %path.display(), "Skipping file with unrecognized name");
                    return None;
                }
            };
            let file_reader = match reader::open(path) {
                Ok(file_reader) => file_reader,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable file");
                    return None;
                }
            };
            let file_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            Some(ArticulationRecord::new(
                key,
                path.clone(),
                file_reader.sample_rate(),
                file_reader.channels(),
                file_reader.total_frames(),
                file_size,
            ))
        })
        .collect();

    let map = InstrumentMap::build(records);

    // Preload pass: read every selected record's head in parallel, then let
    // reconcile settle the aggregate memory counter.
    map.records().par_iter().for_each(|record| {
        if !record.should_preload(velocity_layer_limit, round_robin_limit) {
            return;
        }
        let target = record.preload_target_frames(preload_kb);
        match map::load_preload(record, target) {
            Ok((data, frames)) => record.set_preload(data, frames),
            Err(e) => {
                warn!(path = %record.path().display(), error = %e, "Failed to preload sample");
            }
        }
    });
    map.reconcile_preload(preload_kb, velocity_layer_limit, round_robin_limit);

    info!(
        folder = %folder.display(),
        candidates,
        articulations = map.records().len(),
        round_robins = map.max_round_robins(),
        total_mb = map.total_file_size() / (1024 * 1024),
        preload_kb = map.preload_memory_bytes() / 1024,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Instrument library loaded"
    );

    map
}
