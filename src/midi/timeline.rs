use std::collections::{HashMap, HashSet};

use rayon::prelude::*;

use crate::midi::loader::MidiFile;
use crate::midi::tempo::ticks_to_seconds;
use crate::midi::track_data::MessageKind;
use crate::sheet::Token;

/// Pitch range the sheet can express; everything is clamped into it.
pub const MIN_PITCH: u8 = 36;
pub const MAX_PITCH: u8 = 100;
/// `key = pitch - KEY_OFFSET`, so the lowest pitch maps to key 1.
pub const KEY_OFFSET: i32 = 35;

/// A note message at its absolute position within one track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    pub tick: u64,
    /// Seconds at the tempo that was current when the message was scanned.
    pub seconds: f64,
    pub track: u32,
    pub pitch: u8,
    pub velocity: u8,
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteInterval {
    pub start: f64,
    pub end: f64,
    pub pitch: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    pub tokens: Vec<Token>,
    pub total_seconds: f64,
}

/// Drop repeated track indices, keeping the first occurrence of each.
pub fn unique_tracks(selected: &[u32]) -> Vec<u32> {
    let mut seen = HashSet::new();
    selected.iter().copied().filter(|t| seen.insert(*t)).collect()
}

/// Collect the note messages of the selected tracks, stably sorted by tick.
///
/// Each track starts at `file_tempo` and follows its own tempo changes.
/// A NoteOn with velocity 0 is reported as an off. A track listed twice
/// is scanned once.
pub fn scan_notes(file: &MidiFile, selected: &[u32], file_tempo: u32) -> Vec<NoteEvent> {
    let ticks_per_beat = file.ticks_per_beat;

    let per_track: Vec<Vec<NoteEvent>> = unique_tracks(selected)
        .into_par_iter()
        .filter_map(|index| file.tracks.get(index as usize).map(|track| (index, track)))
        .map(|(index, track)| {
            let mut tick: u64 = 0;
            let mut tempo = file_tempo;
            let mut events = Vec::new();

            for msg in &track.messages {
                tick += u64::from(msg.delta);
                let (pitch, velocity, on) = match msg.kind {
                    MessageKind::SetTempo(t) => {
                        if t > 0 {
                            tempo = t;
                        }
                        continue;
                    }
                    MessageKind::NoteOn { pitch, velocity, .. } => (pitch, velocity, velocity > 0),
                    MessageKind::NoteOff { pitch, .. } => (pitch, 0, false),
                    MessageKind::Other => continue,
                };
                events.push(NoteEvent {
                    tick,
                    seconds: ticks_to_seconds(tick, ticks_per_beat, tempo),
                    track: index,
                    pitch,
                    velocity,
                    on,
                });
            }
            events
        })
        .collect();

    let mut events: Vec<NoteEvent> = per_track.into_iter().flatten().collect();
    events.sort_by_key(|e| e.tick);
    events
}

pub fn shift_and_clamp(pitch: u8, shift: i32) -> u8 {
    (i32::from(pitch) + shift).clamp(i32::from(MIN_PITCH), i32::from(MAX_PITCH)) as u8
}

/// Pair ons and offs per pitch within each track.
///
/// A second NoteOn on a pitch that is still sounding closes the first one.
/// Notes still open at the end close at the latest event time of the scan.
/// The result is stably sorted by start time.
pub fn pair_intervals(events: &[NoteEvent], shift: i32) -> Vec<NoteInterval> {
    let max_time = events.iter().map(|e| e.seconds).fold(0.0, f64::max);

    let mut tracks: Vec<u32> = events.iter().map(|e| e.track).collect();
    tracks.sort_unstable();
    tracks.dedup();

    let mut intervals = Vec::new();
    for track in tracks {
        // pitch -> (start, order of the on within the track)
        let mut open: HashMap<u8, f64> = HashMap::new();
        let mut open_order: Vec<u8> = Vec::new();

        for event in events.iter().filter(|e| e.track == track) {
            let pitch = shift_and_clamp(event.pitch, shift);
            if event.on {
                if let Some(start) = open.insert(pitch, event.seconds) {
                    intervals.push(NoteInterval { start, end: event.seconds, pitch });
                } else {
                    open_order.push(pitch);
                }
            } else if let Some(start) = open.remove(&pitch) {
                open_order.retain(|&p| p != pitch);
                intervals.push(NoteInterval { start, end: event.seconds, pitch });
            }
        }

        for pitch in open_order {
            if let Some(start) = open.remove(&pitch) {
                intervals.push(NoteInterval { start, end: max_time, pitch });
            }
        }
    }

    intervals.sort_by(|a, b| a.start.total_cmp(&b.start));
    intervals
}

fn to_ms(seconds: f64) -> i64 {
    (seconds * 1000.0) as i64
}

/// Serialize intervals into rest/note tokens.
///
/// Rests measure the gap between consecutive note starts. A trailing rest
/// covers whatever the longest note holds past the end of the last one.
/// Two `Note { key: 0, duration_ms: 0 }` terminators are always appended.
pub fn emit_tokens(intervals: &[NoteInterval]) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(intervals.len() * 2 + 2);

    let mut last_time = 0.0;
    for interval in intervals {
        if interval.start > last_time {
            let gap = to_ms(interval.start - last_time);
            if gap > 0 {
                tokens.push(Token::Rest { ms: gap });
            }
        }
        let duration = (interval.end - interval.start).max(0.0);
        tokens.push(Token::Note {
            key: i32::from(interval.pitch) - KEY_OFFSET,
            duration_ms: to_ms(duration) as i32,
        });
        last_time = interval.start;
    }

    if let Some(last) = intervals.last() {
        let max_end = intervals.iter().map(|i| i.end).fold(0.0, f64::max);
        let last_end = last.end.max(last.start);
        if max_end > last_end {
            let tail = to_ms(max_end - last_end);
            if tail > 0 {
                tokens.push(Token::Rest { ms: tail });
            }
        }
    }

    tokens.push(Token::TERMINATOR);
    tokens.push(Token::TERMINATOR);
    tokens
}

/// Convert the selected tracks into a token stream and its total span.
///
/// An empty selection gives an empty stream, without terminators.
pub fn build_timeline(file: &MidiFile, selected: &[u32], shift: i32, file_tempo: u32) -> Timeline {
    if selected.is_empty() {
        return Timeline::default();
    }

    let events = scan_notes(file, selected, file_tempo);
    let intervals = pair_intervals(&events, shift);
    let total_seconds = intervals.iter().map(|i| i.end).fold(0.0, f64::max);

    log::debug!(
        "Timeline: {} note events, {} intervals, {:.3}s",
        events.len(),
        intervals.len(),
        total_seconds
    );

    Timeline {
        tokens: emit_tokens(&intervals),
        total_seconds,
    }
}
