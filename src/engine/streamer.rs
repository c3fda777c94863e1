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

//! The background disk streamer.
//!
//! A single thread services the ring buffers of every active voice. Each
//! tick it snapshots the voices that need data, sorts them by urgency
//! (fewest readable frames first), and reads up to one chunk per voice from
//! disk. Readers are opened lazily on this thread and cached per voice slot
//! until the slot starts a new stream.
//!
//! The streamer is stopped before an instrument reload and restarted with
//! the new map, so a disk read never spans a map swap.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::audio::reader::{self, AudioFileReader};
use crate::audio::ring_buffer::CHUNK_FRAMES;
use crate::audio::MAX_CHANNELS;
use crate::engine::voice::VoiceShared;
use crate::instrument::InstrumentMap;

/// How long the streamer sleeps between service passes.
const TICK: Duration = Duration::from_millis(2);

/// Per-slot streaming state, owned by the streamer thread. The path and
/// format info are captured at arm time so no map access happens during
/// disk reads.
struct Slot {
    /// The stream epoch this slot is serving. 0 matches no armed stream.
    epoch: u64,
    path: PathBuf,
    channels: usize,
    reader: Option<Box<dyn AudioFileReader>>,
    /// The next source frame to fetch from disk.
    next_fetch: u64,
    total_frames: u64,
    /// Set when the slot's file could not be opened or read; the stream is
    /// ended so the voice does not wait forever.
    failed: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            epoch: 0,
            path: PathBuf::new(),
            channels: 1,
            reader: None,
            next_fetch: 0,
            total_frames: 0,
            failed: false,
        }
    }
}

/// Handle to the running streamer thread.
pub(crate) struct DiskStreamer {
    shutdown_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl DiskStreamer {
    /// Spawns the streamer over the given voices and map snapshot.
    /// `throughput_bps` receives the measured disk throughput in bytes per
    /// second once a second.
    pub fn start(
        voices: Vec<Arc<VoiceShared>>,
        map: Arc<InstrumentMap>,
        throughput_bps: Arc<AtomicU64>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("msampler-streamer".into())
            .spawn(move || run(voices, map, throughput_bps, shutdown_rx))
            .expect("failed to spawn disk streamer thread");

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Signals the thread and joins it.
    pub fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    voices: Vec<Arc<VoiceShared>>,
    map: Arc<InstrumentMap>,
    throughput_bps: Arc<AtomicU64>,
    shutdown_rx: Receiver<()>,
) {
    debug!(voices = voices.len(), "Disk streamer started");

    let mut slots: Vec<Slot> = (0..voices.len()).map(|_| Slot::new()).collect();
    let mut scratch = vec![0.0f32; CHUNK_FRAMES * MAX_CHANNELS];
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;

    loop {
        match shutdown_rx.recv_timeout(TICK) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        window_bytes += tick(&voices, &map, &mut slots, &mut scratch);

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let bps = (window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            throughput_bps.store(bps, Ordering::Release);
            window_start = Instant::now();
            window_bytes = 0;
        }
    }

    throughput_bps.store(0, Ordering::Release);
    debug!("Disk streamer stopped");
}

/// One service pass. Returns the bytes read from disk.
fn tick(
    voices: &[Arc<VoiceShared>],
    map: &Arc<InstrumentMap>,
    slots: &mut [Slot],
    scratch: &mut [f32],
) -> u64 {
    // Snapshot: arm new streams and collect voices that want data, most
    // urgent (fewest readable frames) first.
    let mut candidates: Vec<(usize, usize)> = Vec::with_capacity(voices.len());
    for (index, shared) in voices.iter().enumerate() {
        if !shared.is_active() {
            continue;
        }

        let epoch = shared.epoch();
        let slot = &mut slots[index];
        if slot.epoch != epoch {
            arm_slot(slot, shared, map, epoch);
        }
        if slot.failed || shared.ring().end_of_stream() {
            continue;
        }
        if shared.needs_data() && shared.ring().needs_data() {
            candidates.push((index, shared.ring().available_to_read()));
        }
    }
    candidates.sort_by_key(|&(_, available)| available);

    let mut bytes = 0u64;
    for (index, _) in candidates {
        bytes += service(&mut slots[index], &voices[index], scratch);
    }
    bytes
}

/// Begins a new stream for a slot: resets the ring (the voice is not reading
/// it until the armed epoch matches) and points the fetch cursor at the
/// voice's preload boundary.
fn arm_slot(slot: &mut Slot, shared: &VoiceShared, map: &Arc<InstrumentMap>, epoch: u64) {
    slot.epoch = epoch;
    slot.reader = None;
    slot.failed = false;

    let record_index = shared.record_index();
    let record = match map.record(record_index) {
        Some(record) => record,
        None => {
            // A stale index from before a reload; the engine stops such
            // voices on its next block.
            slot.failed = true;
            return;
        }
    };

    slot.path = record.path().to_path_buf();
    slot.channels = record.channels() as usize;
    slot.next_fetch = shared.stream_start();
    slot.total_frames = record.total_frames();

    shared.ring().reset(slot.channels);
    if slot.next_fetch >= slot.total_frames {
        shared.ring().set_end_of_stream();
    }
    shared.arm(epoch);
}

/// Reads up to one chunk from the slot's file into the voice's ring buffer.
/// Returns the bytes transferred.
fn service(slot: &mut Slot, shared: &VoiceShared, scratch: &mut [f32]) -> u64 {
    if slot.reader.is_none() {
        // Lazily opened on first service so note-on never touches the disk.
        match reader::open(&slot.path) {
            Ok(file_reader) => slot.reader = Some(file_reader),
            Err(e) => {
                warn!(path = %slot.path.display(), error = %e, "Failed to open sample for streaming");
                slot.failed = true;
                shared.ring().set_end_of_stream();
                return 0;
            }
        }
    }

    let remaining = slot.total_frames.saturating_sub(slot.next_fetch);
    let want = CHUNK_FRAMES
        .min(remaining as usize)
        .min(shared.ring().available_to_write());
    if want == 0 {
        if remaining == 0 {
            shared.ring().set_end_of_stream();
        }
        return 0;
    }

    let file_reader = slot.reader.as_mut().expect("reader opened above");
    let got = file_reader.read_into(
        &mut scratch[..want * slot.channels],
        slot.next_fetch,
        want as u32,
    ) as usize;

    if got > 0 {
        shared.ring().write(scratch, got);
        slot.next_fetch += got as u64;
    }
    if got < want || slot.next_fetch >= slot.total_frames {
        // Short reads mean the file ended early or went unreadable; either
        // way the stream is over.
        shared.ring().set_end_of_stream();
        if got < want && slot.next_fetch < slot.total_frames {
            warn!(
                path = %slot.path.display(),
                expected = slot.total_frames,
                delivered = slot.next_fetch,
                "Sample stream ended early"
            );
        }
    }

    (got * slot.channels * std::mem::size_of::<f32>()) as u64
}
