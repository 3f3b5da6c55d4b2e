use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use rayon::prelude::*;

use crate::error::MidiError;
use crate::midi::track_data::{Track, TrackData};

/// A parsed Standard MIDI File: per-track messages with tick deltas.
#[derive(Debug, Clone, PartialEq)]
pub struct MidiFile {
    pub ticks_per_beat: u16,
    pub tracks: Vec<Track>,
}

impl MidiFile {
    pub fn new(ticks_per_beat: u16, tracks: Vec<Track>) -> Self {
        Self {
            ticks_per_beat,
            tracks,
        }
    }

    /// Parse a MIDI file already held in memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MidiError> {
        read_midi(bytes)
    }
}

/// Load a MIDI file from disk.
pub fn load_midi_file<P: AsRef<Path>>(filename: P) -> Result<MidiFile, MidiError> {
    let file = File::open(&filename)?;
    read_midi(BufReader::new(file))
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), MidiError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => MidiError::Truncated {
            expected: buf.len(),
            found: 0,
        },
        _ => MidiError::Io(err),
    })
}

fn read_midi<R: Read>(mut reader: R) -> Result<MidiFile, MidiError> {
    // Read and verify the header
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).map_err(|_| MidiError::NotMidi)?;
    if &header != b"MThd" {
        return Err(MidiError::NotMidi);
    }

    // Header length (big-endian)
    let mut buf4 = [0u8; 4];
    read_exact_or_truncated(&mut reader, &mut buf4)?;
    let header_len = u32::from_be_bytes(buf4);
    if header_len != 6 {
        return Err(MidiError::BadHeaderLength(header_len));
    }

    // Format (unused) and track count
    let mut buf2 = [0u8; 2];
    read_exact_or_truncated(&mut reader, &mut buf2)?;
    read_exact_or_truncated(&mut reader, &mut buf2)?;
    let num_tracks = u16::from_be_bytes(buf2) as usize;

    // Time division
    read_exact_or_truncated(&mut reader, &mut buf2)?;
    let time_div = u16::from_be_bytes(buf2);
    if (time_div & 0x8000) != 0 {
        return Err(MidiError::SmpteUnsupported);
    }

    let mut chunks = Vec::with_capacity(num_tracks);
    for _ in 0..num_tracks {
        if reader.read_exact(&mut header).is_err() || &header != b"MTrk" {
            // Missing or unknown chunk: keep what we have.
            break;
        }

        read_exact_or_truncated(&mut reader, &mut buf4)?;
        let length = u32::from_be_bytes(buf4) as usize;

        let mut data = Vec::with_capacity(length);
        let found = reader.by_ref().take(length as u64).read_to_end(&mut data)?;
        if found < length {
            return Err(MidiError::Truncated {
                expected: length,
                found,
            });
        }
        chunks.push(data);
    }

    let tracks: Vec<Track> = chunks.into_par_iter().map(TrackData::decode).collect();
    log::debug!("Loaded {} tracks, time division {}", tracks.len(), time_div);

    Ok(MidiFile::new(time_div, tracks))
}
