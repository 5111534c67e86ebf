//! Ogg Opus container writing.
//!
//! The muxer accepts one audio track. Its parameters come from the encoder's
//! first format report, so [`ContainerMuxer::start`] writes the stream headers
//! and only then are packets accepted.

use ogg::{PacketWriteEndInfo, PacketWriter};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::codec::{EncodedPacket, TrackFormat};
use crate::error::RecordingError;

/// Granule positions in Ogg Opus always count 48kHz samples.
const GRANULE_RATE: u64 = 48_000;

const VENDOR: &str = concat!("audiopirate-client ", env!("CARGO_PKG_VERSION"));

/// Container writer driven by the recording pipeline.
pub trait ContainerMuxer: Send {
    /// Registers the single audio track and returns its index.
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, RecordingError>;

    /// Writes headers; packets are rejected before this.
    fn start(&mut self) -> Result<(), RecordingError>;

    fn write_sample(&mut self, track: usize, packet: &EncodedPacket) -> Result<(), RecordingError>;

    /// Finalizes and closes the output. Idempotent.
    fn finish(&mut self) -> Result<(), RecordingError>;
}

/// Ogg Opus (RFC 7845) file writer.
pub struct OggOpusMuxer {
    // ---
    path: PathBuf,
    writer: Option<PacketWriter<'static, BufWriter<File>>>,
    serial: u32,
    track: Option<TrackFormat>,
    started: bool,

    /// Samples at 48kHz written so far, excluding pre-skip
    granule: u64,

    /// Last packet is held back so it can carry the end-of-stream flag
    pending: Option<(Vec<u8>, u64)>,
}

impl OggOpusMuxer {
    // ---
    /// Creates (or truncates) the output file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, RecordingError> {
        // ---
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;

        Ok(Self {
            path,
            writer: Some(PacketWriter::new(BufWriter::new(file))),
            serial: rand::random(),
            track: None,
            started: false,
            granule: 0,
            pending: None,
        })
    }

    fn writer(&mut self) -> Result<&mut PacketWriter<'static, BufWriter<File>>, RecordingError> {
        // ---
        self.writer
            .as_mut()
            .ok_or_else(|| RecordingError::Muxer("muxer already finished".into()))
    }

    fn write_packet(
        &mut self,
        data: Vec<u8>,
        end: PacketWriteEndInfo,
        granule: u64,
    ) -> Result<(), RecordingError> {
        // ---
        let serial = self.serial;
        self.writer()?.write_packet(data, serial, end, granule)?;
        Ok(())
    }
}

fn opus_head(format: &TrackFormat) -> Vec<u8> {
    // ---
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1); // version
    head.push(format.channels as u8);
    head.extend_from_slice(&format.pre_skip.to_le_bytes());
    head.extend_from_slice(&format.input_sample_rate.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

fn opus_tags() -> Vec<u8> {
    // ---
    let mut tags = Vec::with_capacity(16 + VENDOR.len());
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
    tags.extend_from_slice(VENDOR.as_bytes());
    tags.extend_from_slice(&0u32.to_le_bytes()); // no user comments
    tags
}

impl ContainerMuxer for OggOpusMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize, RecordingError> {
        // ---
        if self.started || self.track.is_some() {
            return Err(RecordingError::Muxer(
                "Ogg Opus output holds a single track".into(),
            ));
        }
        if format.sample_rate == 0 || GRANULE_RATE % format.sample_rate as u64 != 0 {
            return Err(RecordingError::Muxer(format!(
                "sample rate {} does not divide 48kHz",
                format.sample_rate
            )));
        }

        self.track = Some(*format);
        Ok(0)
    }

    fn start(&mut self) -> Result<(), RecordingError> {
        // ---
        let format = self
            .track
            .ok_or_else(|| RecordingError::Muxer("start before a track was added".into()))?;
        if self.started {
            return Ok(());
        }

        self.write_packet(opus_head(&format), PacketWriteEndInfo::EndPage, 0)?;
        self.write_packet(opus_tags(), PacketWriteEndInfo::EndPage, 0)?;
        self.started = true;

        debug!("Muxer started: {}", self.path.display());
        Ok(())
    }

    fn write_sample(&mut self, track: usize, packet: &EncodedPacket) -> Result<(), RecordingError> {
        // ---
        let format = match (self.started, self.track) {
            (true, Some(format)) => format,
            _ => {
                return Err(RecordingError::Muxer(
                    "sample written before muxer start".into(),
                ))
            }
        };
        if track != 0 {
            return Err(RecordingError::Muxer(format!("no track {track}")));
        }

        self.granule += packet.frames as u64 * (GRANULE_RATE / format.sample_rate as u64);
        let absgp = format.pre_skip as u64 + self.granule;

        if let Some((data, gp)) = self.pending.replace((packet.data.clone(), absgp)) {
            self.write_packet(data, PacketWriteEndInfo::NormalPacket, gp)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), RecordingError> {
        // ---
        if self.writer.is_none() {
            return Ok(());
        }

        if !self.started {
            // Nothing playable was produced; leave no empty file behind
            self.writer = None;
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("Failed to remove empty recording {}: {}", self.path.display(), e);
            }
            return Err(RecordingError::NothingRecorded);
        }

        let (data, gp) = match self.pending.take() {
            Some(last) => last,
            None => (Vec::new(), self.track.map_or(0, |t| t.pre_skip as u64) + self.granule),
        };
        self.write_packet(data, PacketWriteEndInfo::EndStream, gp)?;

        if let Some(writer) = self.writer.take() {
            writer.into_inner().flush()?;
        }
        Ok(())
    }
}

impl Drop for OggOpusMuxer {
    fn drop(&mut self) {
        // ---
        if self.writer.is_some() {
            if let Err(e) = self.finish() {
                debug!("Muxer dropped without finishing: {}", e);
            }
        }
    }
}
