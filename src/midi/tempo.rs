use crate::midi::loader::MidiFile;
use crate::midi::track_data::MessageKind;

/// Microseconds per quarter note when a file never sets one (120 BPM).
pub const DEFAULT_TEMPO: u32 = 500_000;
pub const DEFAULT_BPM: u32 = 120;

/// First tempo found scanning tracks in order, or the default.
pub fn resolve_tempo(file: &MidiFile) -> u32 {
    file.tracks
        .iter()
        .flat_map(|track| track.messages.iter())
        .find_map(|msg| match msg.kind {
            MessageKind::SetTempo(t) if t > 0 => Some(t),
            _ => None,
        })
        .unwrap_or(DEFAULT_TEMPO)
}

pub fn bpm(tempo: u32) -> u32 {
    if tempo == 0 {
        return DEFAULT_BPM;
    }
    match (60_000_000.0 / tempo as f64).round() as u32 {
        0 => DEFAULT_BPM,
        bpm => bpm,
    }
}

/// Convert an absolute tick to seconds at a fixed tempo.
pub fn ticks_to_seconds(ticks: u64, ticks_per_beat: u16, tempo: u32) -> f64 {
    if ticks_per_beat == 0 {
        return 0.0;
    }
    (ticks as f64 * tempo as f64) / (1_000_000.0 * ticks_per_beat as f64)
}
