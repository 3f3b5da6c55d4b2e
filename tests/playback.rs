use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use midisheet_rs::error::{PlaybackError, SinkError};
use midisheet_rs::midi::loader::MidiFile;
use midisheet_rs::midi::player::{JOIN_TIMEOUT, PlaybackState, Player};
use midisheet_rs::midi::track_data::{MessageKind, Track, TrackMessage};
use midisheet_rs::sink::{CC_PAN, CC_VOLUME, NoteSink, RecordingSink, SinkCall};

// One tick is one millisecond.
const TICKS_PER_BEAT: u16 = 1000;
const TEMPO: u32 = 1_000_000;

fn on(delta: u32, pitch: u8) -> TrackMessage {
    TrackMessage::new(delta, MessageKind::NoteOn { channel: 0, pitch, velocity: 100 })
}

fn off(delta: u32, pitch: u8) -> TrackMessage {
    TrackMessage::new(delta, MessageKind::NoteOff { channel: 0, pitch })
}

fn file(tracks: Vec<Vec<TrackMessage>>) -> MidiFile {
    let mut tracks: Vec<Track> = tracks.into_iter().map(Track::new).collect();
    tracks[0]
        .messages
        .insert(0, TrackMessage::new(0, MessageKind::SetTempo(TEMPO)));
    MidiFile::new(TICKS_PER_BEAT, tracks)
}

fn recording_player(file: MidiFile) -> (Player, RecordingSink) {
    let sink = RecordingSink::new();
    let opener_sink = sink.clone();
    let player = Player::new(
        Arc::new(file),
        Box::new(move || -> Result<Box<dyn NoteSink>, SinkError> {
            Ok(Box::new(opener_sink.clone()))
        }),
    );
    (player, sink)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn note_on(pitch: u8, channel: u8) -> SinkCall {
    SinkCall::NoteOn { pitch, velocity: 100, channel }
}

fn count_note_ons(calls: &[SinkCall]) -> usize {
    calls
        .iter()
        .filter(|c| matches!(c, SinkCall::NoteOn { .. }))
        .count()
}

#[test]
fn empty_selection_is_rejected() {
    let (mut player, sink) = recording_player(file(vec![vec![on(0, 60), off(10, 60)]]));

    assert!(matches!(player.start(&[]), Err(PlaybackError::NoTracksSelected)));
    assert_eq!(player.state(), PlaybackState::Idle);
    assert!(sink.calls().is_empty());
}

#[test]
fn plays_to_the_end_and_silences_everything() {
    let (mut player, sink) = recording_player(file(vec![vec![
        on(0, 60),
        off(30, 60),
        on(10, 62),
        off(20, 62),
    ]]));

    player.start(&[0]).unwrap();
    assert!(wait_until(Duration::from_secs(3), || player.state() == PlaybackState::Stopped));

    let calls = sink.calls();
    assert_eq!(
        calls[..6],
        [
            SinkCall::ControlChange { channel: 0, controller: CC_VOLUME, value: 127 },
            SinkCall::ControlChange { channel: 0, controller: CC_PAN, value: 64 },
            note_on(60, 0),
            SinkCall::NoteOff { pitch: 60, channel: 0 },
            note_on(62, 0),
            SinkCall::NoteOff { pitch: 62, channel: 0 },
        ]
    );
    let note_offs = calls
        .iter()
        .filter(|c| matches!(c, SinkCall::NoteOff { .. }))
        .count();
    assert_eq!(note_offs, 2 + 16 * 128);
    assert_eq!(calls.last(), Some(&SinkCall::Close));
    assert_eq!(player.status().dispatched, 4);

    player.stop();
    assert_eq!(player.state(), PlaybackState::Stopped);
    assert_eq!(player.status().position_seconds, 0.0);
    // nothing more is written once the worker closed the sink itself
    assert_eq!(sink.calls().len(), calls.len());
}

#[test]
fn muting_releases_held_notes_first() {
    let (mut player, sink) = recording_player(file(vec![
        vec![on(0, 60), on(0, 64), off(5000, 60), off(0, 64)],
        vec![on(0, 70), off(5000, 70)],
    ]));

    player.start(&[0, 1]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || count_note_ons(&sink.calls()) == 3));

    player.set_track_mute(0, true);
    let muted_cc = SinkCall::ControlChange { channel: 0, controller: CC_VOLUME, value: 0 };
    let last_release = SinkCall::NoteOff { pitch: 64, channel: 0 };
    assert!(wait_until(Duration::from_secs(2), || sink.calls().contains(&last_release)));

    let calls = sink.calls();
    let cc = calls.iter().position(|c| *c == muted_cc).unwrap();
    assert_eq!(
        calls[cc + 1..],
        [
            SinkCall::NoteOff { pitch: 60, channel: 0 },
            SinkCall::NoteOff { pitch: 64, channel: 0 },
        ]
    );
    assert!(player.is_muted(0));

    player.stop();
}

#[test]
fn muted_before_start_never_sounds() {
    let (mut player, sink) = recording_player(file(vec![
        vec![on(0, 60), off(20, 60)],
        vec![on(0, 70), off(20, 70)],
    ]));

    player.set_track_mute(0, true);
    player.start(&[0, 1]).unwrap();
    assert!(wait_until(Duration::from_secs(3), || player.state() == PlaybackState::Stopped));

    let calls = sink.calls();
    assert!(calls.contains(&SinkCall::ControlChange { channel: 0, controller: CC_VOLUME, value: 0 }));
    assert!(!calls.contains(&note_on(60, 0)));
    assert!(calls.contains(&note_on(70, 1)));
}

#[test]
fn seek_past_the_end_stops_without_dispatching() {
    let (mut player, sink) = recording_player(file(vec![vec![on(0, 60), off(2000, 60), on(0, 61), off(10, 61)]]));

    player.start(&[0]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || count_note_ons(&sink.calls()) == 1));
    let before = sink.calls().len();

    player.seek(60.0);
    assert_eq!(player.state(), PlaybackState::Stopped);

    thread::sleep(Duration::from_millis(50));
    let after = &sink.calls()[before..];
    assert_eq!(count_note_ons(after), 0);
    assert!(after.contains(&SinkCall::NoteOff { pitch: 60, channel: 0 }));
    assert_eq!(after.last(), Some(&SinkCall::Close));
}

#[test]
fn seek_skips_to_the_requested_time() {
    let (mut player, sink) = recording_player(file(vec![vec![
        on(0, 60),
        off(100, 60),
        on(900, 62),
        off(100, 62),
        on(1900, 64),
        off(100, 64),
    ]]));

    player.start(&[0]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || count_note_ons(&sink.calls()) == 1));

    player.seek(2.9);
    assert_eq!(player.state(), PlaybackState::Playing);
    assert!(wait_until(Duration::from_secs(2), || sink.calls().contains(&note_on(64, 0))));
    assert!(!sink.calls().contains(&note_on(62, 0)));
    assert!(player.status().position_seconds >= 2.9);

    player.stop();
}

#[test]
fn pause_freezes_the_clock() {
    let (mut player, sink) = recording_player(file(vec![vec![
        on(0, 60),
        off(50, 60),
        on(350, 62),
        off(50, 62),
    ]]));

    player.start(&[0]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || count_note_ons(&sink.calls()) == 1));

    player.pause();
    assert_eq!(player.state(), PlaybackState::Paused);
    thread::sleep(Duration::from_millis(700));
    assert_eq!(count_note_ons(&sink.calls()), 1);

    let resumed = Instant::now();
    player.resume();
    assert_eq!(player.state(), PlaybackState::Playing);
    assert!(wait_until(Duration::from_secs(2), || count_note_ons(&sink.calls()) == 2));
    // the paused time does not count towards the second note
    assert!(resumed.elapsed() >= Duration::from_millis(200));

    player.stop();
}

#[test]
fn shift_change_keeps_held_notes_consistent() {
    let (mut player, sink) = recording_player(file(vec![vec![
        on(0, 60),
        off(300, 60),
        on(100, 60),
        off(50, 60),
    ]]));

    player.start(&[0]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || sink.calls().contains(&note_on(60, 0))));

    player.set_shift(5);
    assert!(wait_until(Duration::from_secs(3), || player.state() == PlaybackState::Stopped));

    let calls = sink.calls();
    let notes: Vec<SinkCall> = calls
        .iter()
        .copied()
        .filter(|c| matches!(c, SinkCall::NoteOn { .. } | SinkCall::NoteOff { .. }))
        .take(4)
        .collect();
    assert_eq!(
        notes,
        vec![
            note_on(60, 0),
            SinkCall::NoteOff { pitch: 60, channel: 0 },
            note_on(65, 0),
            SinkCall::NoteOff { pitch: 65, channel: 0 },
        ]
    );
    assert_eq!(player.shift(), 5);
}

#[test]
fn missing_sink_plays_silently() {
    let mut player = Player::new(
        Arc::new(file(vec![vec![on(0, 60), off(2000, 60)]])),
        Box::new(|| -> Result<Box<dyn NoteSink>, SinkError> {
            Err(SinkError::Unavailable("no synthesizer".into()))
        }),
    );

    player.start(&[0]).unwrap();
    assert_eq!(player.state(), PlaybackState::Playing);
    player.stop();
    assert_eq!(player.state(), PlaybackState::Stopped);
}

#[test]
fn stop_rewinds_and_sweeps_all_channels() {
    let (mut player, sink) = recording_player(file(vec![vec![on(0, 60), off(1000, 60)]]));

    player.start(&[0]).unwrap();
    thread::sleep(Duration::from_millis(300));
    let status = player.status();
    assert!(status.position_seconds > 0.1);
    assert_eq!(status.total_seconds, 1.0);

    player.stop();
    assert_eq!(player.status().position_seconds, 0.0);

    let calls = sink.calls();
    for channel in 0..16 {
        assert!(calls.contains(&SinkCall::NoteOff { pitch: 127, channel }));
    }
    assert_eq!(calls.last(), Some(&SinkCall::Close));

    // starting again plays from the top
    player.start(&[0]).unwrap();
    assert!(wait_until(Duration::from_secs(2), || count_note_ons(&sink.calls()) == 2));
    player.stop();
}

#[test]
fn repeated_track_plays_once() {
    let (mut player, sink) = recording_player(file(vec![vec![on(0, 60), off(20, 60)]]));

    player.start(&[0, 0]).unwrap();
    assert!(wait_until(Duration::from_secs(3), || player.state() == PlaybackState::Stopped));

    let calls = sink.calls();
    assert_eq!(count_note_ons(&calls), 1);
    let volume_changes = calls
        .iter()
        .filter(|c| matches!(c, SinkCall::ControlChange { controller: CC_VOLUME, .. }))
        .count();
    assert_eq!(volume_changes, 1);
}

#[test]
fn seek_after_the_end_starts_from_there() {
    let (mut player, sink) = recording_player(file(vec![vec![
        on(0, 60),
        off(30, 60),
        on(100, 62),
        off(20, 62),
    ]]));

    player.start(&[0]).unwrap();
    assert!(wait_until(Duration::from_secs(3), || player.state() == PlaybackState::Stopped));
    assert_eq!(count_note_ons(&sink.calls()), 2);

    player.seek(0.1);
    assert_eq!(player.status().position_seconds, 0.1);
    player.start(&[0]).unwrap();
    assert!(wait_until(Duration::from_secs(3), || player.state() == PlaybackState::Stopped));

    let calls = sink.calls();
    let count = |pitch| calls.iter().filter(|c| **c == note_on(pitch, 0)).count();
    assert_eq!(count(60), 1);
    assert_eq!(count(62), 2);
}

/// Blocks inside `note_on`, like a driver that stalls.
struct StallingSink;

impl NoteSink for StallingSink {
    fn note_on(&mut self, _pitch: u8, _velocity: u8, _channel: u8) {
        thread::sleep(Duration::from_secs(2));
    }
    fn note_off(&mut self, _pitch: u8, _channel: u8) {}
    fn control_change(&mut self, _channel: u8, _controller: u8, _value: u8) {}
    fn close(&mut self) {}
}

#[test]
fn stop_gives_up_on_a_stalled_worker() {
    let opened = Arc::new(AtomicUsize::new(0));
    let sink = RecordingSink::new();
    let (opener_count, opener_sink) = (Arc::clone(&opened), sink.clone());
    let mut player = Player::new(
        Arc::new(file(vec![vec![on(0, 60), off(5000, 60)]])),
        Box::new(move || -> Result<Box<dyn NoteSink>, SinkError> {
            if opener_count.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Box::new(StallingSink))
            } else {
                Ok(Box::new(opener_sink.clone()))
            }
        }),
    );

    player.start(&[0]).unwrap();
    // let the worker get stuck in the first note
    thread::sleep(Duration::from_millis(100));

    let stopping = Instant::now();
    player.stop();
    let took = stopping.elapsed();
    assert!(took >= JOIN_TIMEOUT);
    assert!(took < JOIN_TIMEOUT + Duration::from_millis(400), "stop took {:?}", took);
    assert_eq!(player.state(), PlaybackState::Stopped);

    // the next session gets a fresh sink
    player.start(&[0]).unwrap();
    assert_eq!(player.state(), PlaybackState::Playing);
    assert!(wait_until(Duration::from_secs(2), || sink.calls().contains(&note_on(60, 0))));
    assert_eq!(opened.load(Ordering::SeqCst), 2);

    player.stop();
}
