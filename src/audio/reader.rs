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
use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

use super::error::ReaderError;
use super::MAX_CHANNELS;

/// Random-access reader over one sample file.
///
/// Implementations deliver interleaved f32 frames, truncated to at most
/// [`MAX_CHANNELS`] channels. A reader instance is used from one thread at a
/// time; the disk streamer owns one per streaming voice.
pub trait AudioFileReader: Send {
    /// The native sample rate of the file.
    fn sample_rate(&self) -> u32;

    /// The delivered channel count (1 or 2).
    fn channels(&self) -> u16;

    /// The total length of the file in frames.
    fn total_frames(&self) -> u64;

    /// Seeks to `start_frame` and reads up to `frames` frames into `dst` as
    /// interleaved f32. Returns the number of frames actually read; fewer
    /// than requested means end of stream or a read failure.
    fn read_into(&mut self, dst: &mut [f32], start_frame: u64, frames: u32) -> u32;
}

/// Opens a symphonia-backed reader for the given path.
pub fn open(path: &Path) -> Result<Box<dyn AudioFileReader>, ReaderError> {
    Ok(Box::new(SymphoniaReader::open(path)?))
}

/// An [`AudioFileReader`] that decodes WAV, AIFF, FLAC, and MP3 via symphonia.
pub struct SymphoniaReader {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    source_channels: usize,
    out_channels: u16,
    total_frames: u64,
    /// Source frame index of the next frame to be emitted.
    pos: u64,
    /// Decoded frames not yet emitted, interleaved at `out_channels`.
    pending: Vec<f32>,
    pending_offset: usize,
}

impl SymphoniaReader {
    /// Opens the file and probes its format. Only metadata is read here; no
    /// audio is decoded until the first `read_into`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ReaderError> {
        let path_ref = path.as_ref();
        let display = path_ref.display().to_string();

        let file = File::open(path_ref).map_err(|e| {
            ReaderError::IoError(std::io::Error::new(e.kind(), format!("{}: {}", display, e)))
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path_ref.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts: FormatOptions = Default::default();
        let probed = get_probe()
            .format(&hint, mss, &fmt_opts, &meta_opts)
            .map_err(|e| ReaderError::UnsupportedFormat(display.clone(), e.to_string()))?;

        let format_reader = probed.format;
        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| ReaderError::NoAudioTrack(display.clone()))?;

        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params.sample_rate.ok_or_else(|| {
            ReaderError::UnsupportedFormat(display.clone(), "sample rate not specified".into())
        })?;
        let source_channels = params
            .channels
            .map(|c| c.count())
            .filter(|&c| c > 0)
            .ok_or_else(|| {
                ReaderError::UnsupportedFormat(display.clone(), "channels not specified".into())
            })?;
        let total_frames = params.n_frames.ok_or_else(|| {
            ReaderError::UnsupportedFormat(display.clone(), "frame count not specified".into())
        })?;

        let decoder_opts: DecoderOptions = Default::default();
        let decoder = get_codecs()
            .make(params, &decoder_opts)
            .map_err(|e| ReaderError::UnsupportedFormat(display, e.to_string()))?;

        Ok(Self {
            format_reader,
            decoder,
            track_id,
            sample_rate,
            source_channels,
            out_channels: source_channels.min(MAX_CHANNELS) as u16,
            total_frames,
            pos: 0,
            pending: Vec::new(),
            pending_offset: 0,
        })
    }

    /// Seeks the decode stream so the next emitted frame is `frame`. Pre-roll
    /// frames delivered by the demuxer before the target are trimmed in the
    /// decode loop using packet timestamps.
    fn seek(&mut self, frame: u64) -> Result<(), ReaderError> {
        self.pending.clear();
        self.pending_offset = 0;

        self.format_reader.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: frame,
                track_id: self.track_id,
            },
        )?;
        self.decoder.reset();
        self.pos = frame;
        Ok(())
    }

    /// Reads and decodes the next packet for our track. Returns the decoded
    /// frames (interleaved at `out_channels`) and the packet timestamp, or
    /// `None` at end of stream.
    fn decode_next(&mut self) -> Result<Option<(Vec<f32>, u64)>, ReaderError> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                // Some decoders report EOF as a decode error.
                Err(SymphoniaError::DecodeError(_)) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let ts = packet.ts();

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    match self.decoder.decode(&packet) {
                        Ok(decoded) => decoded,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            };

            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let mut sample_buffer = SampleBuffer::<f32>::new(frames as u64, spec);
            sample_buffer.copy_interleaved_ref(decoded);
            let samples = sample_buffer.samples();

            let out = if self.source_channels <= MAX_CHANNELS {
                samples.to_vec()
            } else {
                // Keep the front channel pair of each frame.
                let mut out = Vec::with_capacity(frames * MAX_CHANNELS);
                for frame in 0..frames {
                    let base = frame * self.source_channels;
                    out.extend_from_slice(&samples[base..base + MAX_CHANNELS]);
                }
                out
            };

            return Ok(Some((out, ts)));
        }
    }
}

impl AudioFileReader for SymphoniaReader {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.out_channels
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn read_into(&mut self, dst: &mut [f32], start_frame: u64, frames: u32) -> u32 {
        if start_frame >= self.total_frames {
            return 0;
        }

        if start_frame != self.pos && self.seek(start_frame).is_err() {
            return 0;
        }

        let channels = self.out_channels as usize;
        let want = (frames as usize).min(dst.len() / channels);
        let mut filled = 0usize;

        while filled < want {
            if self.pending_offset >= self.pending.len() {
                match self.decode_next() {
                    Ok(Some((samples, ts))) => {
                        let n = (samples.len() / channels) as u64;
                        if ts.saturating_add(n) <= self.pos {
                            // Entirely pre-roll from an inexact seek.
                            continue;
                        }
                        let skip = self.pos.saturating_sub(ts) as usize;
                        self.pending = samples;
                        self.pending_offset = skip * channels;
                        continue;
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            let available = (self.pending.len() - self.pending_offset) / channels;
            let take = available.min(want - filled);
            let src = &self.pending[self.pending_offset..self.pending_offset + take * channels];
            dst[filled * channels..(filled + take) * channels].copy_from_slice(src);
            self.pending_offset += take * channels;
            filled += take;
            self.pos += take as u64;
        }

        filled as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_ramp_wav;
    use tempfile::tempdir;

    #[test]
    fn test_open_reports_metadata() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("C4_064_01.wav");
        write_ramp_wav(&path, 44100, 2, 1000);

        let reader = SymphoniaReader::open(&path).unwrap();
        assert_eq!(reader.sample_rate(), 44100);
        assert_eq!(reader.channels(), 2);
        assert_eq!(reader.total_frames(), 1000);
    }

    #[test]
    fn test_sequential_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("C4_064_01.wav");
        write_ramp_wav(&path, 44100, 1, 2000);

        let mut reader = SymphoniaReader::open(&path).unwrap();
        let mut dst = vec![0.0f32; 512];

        let got = reader.read_into(&mut dst, 0, 512);
        assert_eq!(got, 512);
        for (i, sample) in dst.iter().enumerate() {
            assert_eq!(*sample, i as f32 * 1e-6);
        }

        let got = reader.read_into(&mut dst, 512, 512);
        assert_eq!(got, 512);
        for (i, sample) in dst.iter().enumerate() {
            assert_eq!(*sample, (512 + i) as f32 * 1e-6);
        }
    }

    #[test]
    fn test_seek_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("C4_064_01.wav");
        write_ramp_wav(&path, 44100, 2, 4000);

        let mut reader = SymphoniaReader::open(&path).unwrap();
        let mut dst = vec![0.0f32; 256 * 2];

        let got = reader.read_into(&mut dst, 3000, 256);
        assert_eq!(got, 256);
        for i in 0..256 {
            assert_eq!(dst[i * 2], (3000 + i) as f32 * 1e-6);
            assert_eq!(dst[i * 2 + 1], -((3000 + i) as f32 * 1e-6));
        }

        // Seeking backwards works too.
        let got = reader.read_into(&mut dst, 100, 256);
        assert_eq!(got, 256);
        assert_eq!(dst[0], 100.0 * 1e-6);
    }

    #[test]
    fn test_read_clamps_at_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("C4_064_01.wav");
        write_ramp_wav(&path, 44100, 1, 1000);

        let mut reader = SymphoniaReader::open(&path).unwrap();
        let mut dst = vec![0.0f32; 512];

        let got = reader.read_into(&mut dst, 900, 512);
        assert_eq!(got, 100);
        assert_eq!(reader.read_into(&mut dst, 1000, 512), 0);
        assert_eq!(reader.read_into(&mut dst, 5000, 512), 0);
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.wav");
        assert!(SymphoniaReader::open(&path).is_err());
    }
}
