//! Real-time playback of note events against a [`NoteSink`].
//!
//! A single worker thread owns the sink and all per-session playback state.
//! The issuing side only writes single-field atomics (pause, shift, stop) and
//! sends mute commands over a channel; the worker applies them between
//! dispatch passes. Whenever a worker is replaced or stopped, the issuer waits
//! for it to hand the sink back (bounded by [`JOIN_TIMEOUT`]) before anything
//! else writes to the sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{PlaybackError, SinkError};
use crate::midi::loader::MidiFile;
use crate::midi::stats::EventRate;
use crate::midi::tempo::resolve_tempo;
use crate::midi::timeline::{NoteEvent, scan_notes, unique_tracks};
use crate::sink::{CC_PAN, CC_VOLUME, CHANNELS, NoteSink, NullSink};

pub const JOIN_TIMEOUT: Duration = Duration::from_millis(500);
pub const PAUSE_QUANTUM: Duration = Duration::from_millis(10);
pub const DISPATCH_QUANTUM: Duration = Duration::from_millis(1);
pub const PROGRESS_PERIOD: Duration = Duration::from_millis(100);

/// Progress frames kept by the event-rate counter (one second).
const RATE_FRAMES: usize = 10;

pub type SinkOpener = Box<dyn Fn() -> Result<Box<dyn NoteSink>, SinkError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub position_seconds: f64,
    pub total_seconds: f64,
    pub dispatched: u64,
    pub events_per_second: u32,
}

/// Written by the issuer, read by the worker.
#[derive(Default)]
struct Controls {
    paused: AtomicBool,
    shift: AtomicI32,
}

/// Per-worker flags. A fresh set is made for every worker so a worker that
/// outlives its join timeout cannot touch the next one's state.
struct RunState {
    /// Written by the issuer.
    stop: AtomicBool,
    /// The rest are written by the worker.
    finished: AtomicBool,
    position_bits: AtomicU64,
    dispatched: AtomicU64,
    rate: EventRate,
}

impl RunState {
    fn new(position: f64) -> Self {
        Self {
            stop: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            position_bits: AtomicU64::new(position.to_bits()),
            dispatched: AtomicU64::new(0),
            rate: EventRate::new(RATE_FRAMES),
        }
    }

    fn position(&self) -> f64 {
        f64::from_bits(self.position_bits.load(Ordering::Acquire))
    }

    fn publish(&self, position: f64) {
        self.position_bits.store(position.to_bits(), Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Mute { track: u32, muted: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveNote {
    /// Pitch as written in the file.
    source: u8,
    /// Pitch actually sent, with the shift that was live at note-on.
    sounding: u8,
}

/// What a worker hands back when it exits on a stop signal.
struct WorkerExit {
    /// `None` once the worker has already silenced and closed it.
    sink: Option<Box<dyn NoteSink>>,
    /// `(channel, sounding pitch)` of notes still held.
    held: Vec<(u8, u8)>,
}

struct WorkerHandle {
    run: Arc<RunState>,
    commands: Sender<Command>,
    exit: Receiver<WorkerExit>,
    thread: JoinHandle<()>,
}

struct Session {
    events: Arc<Vec<NoteEvent>>,
    channels: Arc<HashMap<u32, u8>>,
    total_seconds: f64,
    /// `None` after a worker could not be reclaimed or respawned.
    worker: Option<WorkerHandle>,
    dispatched_before: u64,
}

/// Assign channels to tracks round-robin over the 16 sink channels.
///
/// More than 16 tracks wrap around and share channels.
pub fn assign_channels(tracks: &[u32]) -> HashMap<u32, u8> {
    tracks
        .iter()
        .enumerate()
        .map(|(i, &track)| (track, (i % CHANNELS as usize) as u8))
        .collect()
}

/// Index of the first event at or after `seconds`, or `events.len()`.
pub fn first_index_at(events: &[NoteEvent], seconds: f64) -> usize {
    events
        .iter()
        .position(|e| e.seconds >= seconds)
        .unwrap_or(events.len())
}

fn all_notes_off(sink: &mut dyn NoteSink) {
    for channel in 0..CHANNELS {
        for pitch in 0..=127u8 {
            sink.note_off(pitch, channel);
        }
    }
}

fn wait_for_exit(worker: WorkerHandle) -> Option<WorkerExit> {
    worker.run.stop.store(true, Ordering::Release);
    match worker.exit.recv_timeout(JOIN_TIMEOUT) {
        Ok(exit) => {
            if worker.thread.join().is_err() {
                log::error!("Playback thread panicked");
            }
            Some(exit)
        }
        Err(RecvTimeoutError::Timeout) => {
            log::warn!(
                "Playback thread did not stop within {:?}; continuing without it",
                JOIN_TIMEOUT
            );
            None
        }
        Err(RecvTimeoutError::Disconnected) => {
            // The worker died without handing anything back.
            if worker.thread.join().is_err() {
                log::error!("Playback thread panicked");
            }
            None
        }
    }
}

/// Plays the selected tracks of a file in wall-clock time.
pub struct Player {
    file: Arc<MidiFile>,
    file_tempo: u32,
    open_sink: SinkOpener,
    sink_warned: bool,
    controls: Arc<Controls>,
    muted: HashMap<u32, bool>,
    position: f64,
    ended: bool,
    session: Option<Session>,
}

impl Player {
    pub fn new(file: Arc<MidiFile>, open_sink: SinkOpener) -> Self {
        let file_tempo = resolve_tempo(&file);
        Self {
            file,
            file_tempo,
            open_sink,
            sink_warned: false,
            controls: Arc::new(Controls::default()),
            muted: HashMap::new(),
            position: 0.0,
            ended: false,
            session: None,
        }
    }

    pub fn state(&self) -> PlaybackState {
        match &self.session {
            None if self.ended => PlaybackState::Stopped,
            None => PlaybackState::Idle,
            Some(session) => match &session.worker {
                Some(worker) if !worker.run.finished.load(Ordering::Acquire) => {
                    if self.controls.paused.load(Ordering::Acquire) {
                        PlaybackState::Paused
                    } else {
                        PlaybackState::Playing
                    }
                }
                _ => PlaybackState::Stopped,
            },
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        let (position_seconds, total_seconds, dispatched, events_per_second) = match &self.session {
            Some(session) => match &session.worker {
                Some(worker) => (
                    worker.run.position(),
                    session.total_seconds,
                    session.dispatched_before + worker.run.dispatched.load(Ordering::Relaxed),
                    worker.run.rate.total(),
                ),
                None => (self.position, session.total_seconds, session.dispatched_before, 0),
            },
            None => (self.position, 0.0, 0, 0),
        };

        PlaybackStatus {
            state: self.state(),
            position_seconds,
            total_seconds,
            dispatched,
            events_per_second,
        }
    }

    pub fn shift(&self) -> i32 {
        self.controls.shift.load(Ordering::Relaxed)
    }

    pub fn is_muted(&self, track: u32) -> bool {
        self.muted.get(&track).copied().unwrap_or(false)
    }

    fn open_sink(&mut self) -> Box<dyn NoteSink> {
        match (self.open_sink)() {
            Ok(sink) => sink,
            Err(err) => {
                if !self.sink_warned {
                    self.sink_warned = true;
                    log::warn!("{err}; playing silently. Install a MIDI synthesizer to hear playback.");
                } else {
                    log::debug!("{err}; using silent output");
                }
                Box::new(NullSink)
            }
        }
    }

    /// Start playing the selected tracks from the current position.
    ///
    /// Resumes instead when paused; does nothing when already playing.
    pub fn start(&mut self, selected: &[u32]) -> Result<(), PlaybackError> {
        match self.state() {
            PlaybackState::Paused => {
                self.resume();
                return Ok(());
            }
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Stopped if self.session.is_some() => {
                // Finished naturally; start over from the top.
                self.teardown();
                self.position = 0.0;
            }
            _ => {}
        }

        if selected.is_empty() {
            log::warn!("Please select at least one track");
            return Err(PlaybackError::NoTracksSelected);
        }
        let selected = unique_tracks(selected);

        let events = scan_notes(&self.file, &selected, self.file_tempo);
        if events.is_empty() {
            log::info!("Selected tracks contain no notes");
            self.ended = true;
            return Ok(());
        }

        let total_seconds = events.iter().map(|e| e.seconds).fold(0.0, f64::max);
        let channels = assign_channels(&selected);
        if selected.len() > CHANNELS as usize {
            log::warn!(
                "{} tracks selected; channels are shared beyond {}",
                selected.len(),
                CHANNELS
            );
        }

        let mut sink = self.open_sink();
        for &track in &selected {
            let channel = channels[&track];
            let volume = if self.is_muted(track) { 0 } else { 127 };
            sink.control_change(channel, CC_VOLUME, volume);
            sink.control_change(channel, CC_PAN, 64);
        }

        self.controls.paused.store(false, Ordering::Release);
        self.ended = false;

        let mut session = Session {
            events: Arc::new(events),
            channels: Arc::new(channels),
            total_seconds,
            worker: None,
            dispatched_before: 0,
        };
        let index = first_index_at(&session.events, self.position);
        log::info!(
            "Playing {} events on {} tracks from {:.2}s",
            session.events.len() - index,
            selected.len(),
            self.position
        );

        let worker = match self.spawn_worker(&session, sink, index, self.position) {
            Ok(worker) => worker,
            Err(err) => {
                self.ended = true;
                return Err(err);
            }
        };
        session.worker = Some(worker);
        self.session = Some(session);
        Ok(())
    }

    fn spawn_worker(
        &self,
        session: &Session,
        sink: Box<dyn NoteSink>,
        index: usize,
        position: f64,
    ) -> Result<WorkerHandle, PlaybackError> {
        let run = Arc::new(RunState::new(position));
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);

        let worker = Worker {
            events: Arc::clone(&session.events),
            channels: Arc::clone(&session.channels),
            index,
            offset: position,
            sink,
            muted: self.muted.clone(),
            active: HashMap::new(),
            controls: Arc::clone(&self.controls),
            run: Arc::clone(&run),
            commands: commands_rx,
            exit: exit_tx,
        };

        let thread = thread::Builder::new()
            .name("playback".into())
            .spawn(move || worker.run())?;

        Ok(WorkerHandle {
            run,
            commands: commands_tx,
            exit: exit_rx,
            thread,
        })
    }

    pub fn pause(&mut self) {
        if self.state() == PlaybackState::Playing {
            self.controls.paused.store(true, Ordering::Release);
            log::debug!("Paused");
        }
    }

    pub fn resume(&mut self) {
        if self.state() == PlaybackState::Paused {
            self.controls.paused.store(false, Ordering::Release);
            log::debug!("Resumed");
        }
    }

    pub fn toggle_pause(&mut self) {
        match self.state() {
            PlaybackState::Playing => self.pause(),
            PlaybackState::Paused => self.resume(),
            _ => {}
        }
    }

    /// Jump to `seconds`. Outside of playback this only moves the start
    /// position. Seeking past the last event stops playback.
    pub fn seek(&mut self, seconds: f64) {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };

        let live = matches!(self.state(), PlaybackState::Playing | PlaybackState::Paused);
        if !live {
            // A session that ran to the end would make the next start rewind.
            if self.session.is_some() {
                self.teardown();
            }
            self.position = seconds;
            return;
        }
        let Some(mut session) = self.session.take() else {
            return;
        };

        let mut sink = None;
        if let Some(worker) = session.worker.take() {
            session.dispatched_before += worker.run.dispatched.load(Ordering::Relaxed);
            if let Some(exit) = wait_for_exit(worker) {
                sink = exit.sink.map(|mut sink| {
                    for (channel, pitch) in exit.held {
                        sink.note_off(pitch, channel);
                    }
                    sink
                });
            }
        }
        self.position = seconds;

        let index = first_index_at(&session.events, seconds);
        if index >= session.events.len() {
            log::info!("Seek to {:.2}s is past the end; stopping", seconds);
            if let Some(mut sink) = sink {
                all_notes_off(sink.as_mut());
                sink.close();
            }
            self.session = Some(session);
            self.teardown();
            self.position = 0.0;
            return;
        }

        let sink = match sink {
            Some(sink) => sink,
            // The old worker kept the sink; it may leak until that thread exits.
            None => self.open_sink(),
        };
        log::debug!("Seek to {:.2}s (event {})", seconds, index);

        match self.spawn_worker(&session, sink, index, seconds) {
            Ok(worker) => session.worker = Some(worker),
            Err(err) => {
                log::error!("{err}");
                self.ended = true;
                return;
            }
        }
        self.session = Some(session);
    }

    /// Stop playback, silence every note on every channel and rewind.
    pub fn stop(&mut self) {
        if self.session.is_some() {
            self.teardown();
        }
        self.position = 0.0;
    }

    fn teardown(&mut self) {
        self.controls.paused.store(false, Ordering::Release);
        self.ended = true;

        let Some(mut session) = self.session.take() else {
            return;
        };
        let Some(worker) = session.worker.take() else {
            return;
        };
        match wait_for_exit(worker) {
            Some(WorkerExit {
                sink: Some(mut sink),
                ..
            }) => {
                all_notes_off(sink.as_mut());
                sink.close();
                log::info!("Playback stopped");
            }
            Some(WorkerExit { sink: None, .. }) => log::debug!("Playback already finished"),
            None => {}
        }
    }

    /// Mute or unmute a track. While playing, the track's channel volume is
    /// changed at once and muting silences the notes it is holding.
    pub fn set_track_mute(&mut self, track: u32, muted: bool) {
        self.muted.insert(track, muted);
        if let Some(worker) = self.session.as_ref().and_then(|s| s.worker.as_ref()) {
            if worker.commands.send(Command::Mute { track, muted }).is_err() {
                log::debug!("Playback worker is gone; mute applies next time");
            }
        }
    }

    /// Transpose notes started from now on. Held notes end at the pitch
    /// they started with.
    pub fn set_shift(&mut self, semitones: i32) {
        self.controls.shift.store(semitones, Ordering::Release);
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    events: Arc<Vec<NoteEvent>>,
    channels: Arc<HashMap<u32, u8>>,
    index: usize,
    /// Playback position the worker started at.
    offset: f64,
    sink: Box<dyn NoteSink>,
    muted: HashMap<u32, bool>,
    active: HashMap<u32, Vec<ActiveNote>>,
    controls: Arc<Controls>,
    run: Arc<RunState>,
    commands: Receiver<Command>,
    exit: Sender<WorkerExit>,
}

impl Worker {
    fn run(mut self) {
        let origin = Instant::now();
        let mut paused_total = Duration::ZERO;
        let mut paused_since: Option<Instant> = None;
        let mut last_publish = Instant::now();

        loop {
            if self.run.stop.load(Ordering::Acquire) {
                return self.hand_back();
            }

            if self.controls.paused.load(Ordering::Acquire) {
                paused_since.get_or_insert_with(Instant::now);
                if !self.wait_for_commands(PAUSE_QUANTUM) {
                    return self.hand_back();
                }
                continue;
            }
            if let Some(since) = paused_since.take() {
                paused_total += since.elapsed();
            }

            if !self.wait_for_commands(Duration::ZERO) {
                return self.hand_back();
            }

            let elapsed = self.offset + origin.elapsed().saturating_sub(paused_total).as_secs_f64();
            let mut dispatched = 0;
            while let Some(event) = self.events.get(self.index).copied() {
                if event.seconds > elapsed {
                    break;
                }
                self.dispatch(&event);
                self.index += 1;
                dispatched += 1;
            }
            if dispatched > 0 {
                self.run.dispatched.fetch_add(dispatched, Ordering::Relaxed);
                self.run.rate.increment(dispatched as u32);
            }

            if last_publish.elapsed() >= PROGRESS_PERIOD {
                self.run.publish(elapsed);
                self.run.rate.next_frame();
                log::debug!(
                    "{:.2}s, {} events/s",
                    elapsed,
                    self.run.rate.total()
                );
                last_publish = Instant::now();
            }

            if self.index >= self.events.len() {
                self.run.publish(elapsed);
                return self.finish();
            }

            if !self.wait_for_commands(DISPATCH_QUANTUM) {
                return self.hand_back();
            }
        }
    }

    /// Sleep up to `timeout`, applying commands as they arrive.
    /// Returns `false` once the issuer is gone.
    fn wait_for_commands(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let result = if timeout.is_zero() {
                self.commands.try_recv().map_err(|err| match err {
                    crossbeam_channel::TryRecvError::Empty => RecvTimeoutError::Timeout,
                    crossbeam_channel::TryRecvError::Disconnected => RecvTimeoutError::Disconnected,
                })
            } else {
                self.commands.recv_deadline(deadline)
            };
            match result {
                Ok(command) => self.apply(command),
                Err(RecvTimeoutError::Timeout) => return true,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
            if self.run.stop.load(Ordering::Acquire) {
                return true;
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Mute { track, muted } => {
                self.muted.insert(track, muted);
                let Some(&channel) = self.channels.get(&track) else {
                    return;
                };
                self.sink
                    .control_change(channel, CC_VOLUME, if muted { 0 } else { 127 });
                if muted {
                    for note in self.active.remove(&track).unwrap_or_default() {
                        self.sink.note_off(note.sounding, channel);
                    }
                }
                log::debug!("Track {} {}", track, if muted { "muted" } else { "unmuted" });
            }
        }
    }

    fn dispatch(&mut self, event: &NoteEvent) {
        if self.muted.get(&event.track).copied().unwrap_or(false) {
            return;
        }
        let Some(&channel) = self.channels.get(&event.track) else {
            return;
        };

        if event.on {
            let shift = self.controls.shift.load(Ordering::Acquire);
            let sounding = (i32::from(event.pitch) + shift).clamp(0, 127) as u8;
            self.sink.note_on(sounding, event.velocity, channel);
            self.active.entry(event.track).or_default().push(ActiveNote {
                source: event.pitch,
                sounding,
            });
        } else if let Some(notes) = self.active.get_mut(&event.track) {
            if let Some(pos) = notes.iter().position(|n| n.source == event.pitch) {
                let note = notes.remove(pos);
                self.sink.note_off(note.sounding, channel);
            }
        }
    }

    fn held_notes(&self) -> Vec<(u8, u8)> {
        let mut held = Vec::new();
        for (track, notes) in &self.active {
            if let Some(&channel) = self.channels.get(track) {
                held.extend(notes.iter().map(|n| (channel, n.sounding)));
            }
        }
        held
    }

    /// Stopped from outside: give the sink back untouched.
    fn hand_back(self) {
        let held = self.held_notes();
        let _ = self.exit.send(WorkerExit {
            sink: Some(self.sink),
            held,
        });
    }

    /// Ran out of events: silence and close the sink ourselves.
    fn finish(mut self) {
        all_notes_off(self.sink.as_mut());
        self.sink.close();
        self.run.finished.store(true, Ordering::Release);
        log::info!("Playback finished");
        let _ = self.exit.send(WorkerExit {
            sink: None,
            held: Vec::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seconds: f64) -> NoteEvent {
        NoteEvent {
            tick: 0,
            seconds,
            track: 0,
            pitch: 60,
            velocity: 100,
            on: true,
        }
    }

    #[test]
    fn channels_wrap_after_sixteen_tracks() {
        let tracks: Vec<u32> = (0..18).collect();
        let channels = assign_channels(&tracks);
        assert_eq!(channels[&0], 0);
        assert_eq!(channels[&15], 15);
        assert_eq!(channels[&16], 0);
        assert_eq!(channels[&17], 1);

        let sparse = assign_channels(&[3, 9]);
        assert_eq!(sparse[&3], 0);
        assert_eq!(sparse[&9], 1);
    }

    #[test]
    fn seek_index_is_first_event_at_or_after() {
        let events = [event(0.0), event(0.5), event(0.5), event(2.0)];
        assert_eq!(first_index_at(&events, 0.0), 0);
        assert_eq!(first_index_at(&events, 0.3), 1);
        assert_eq!(first_index_at(&events, 0.5), 1);
        assert_eq!(first_index_at(&events, 2.0), 3);
        assert_eq!(first_index_at(&events, 2.1), 4);
        assert_eq!(first_index_at(&[], 1.0), 0);
    }
}
