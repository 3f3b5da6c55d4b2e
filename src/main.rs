use std::error::Error;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use thousands::Separable;

use midisheet_rs::error::SinkError;
use midisheet_rs::midi::loader::{MidiFile, load_midi_file};
use midisheet_rs::midi::player::{PlaybackState, Player, SinkOpener};
use midisheet_rs::midi::tempo::{bpm, resolve_tempo};
use midisheet_rs::midi::timeline::{build_timeline, unique_tracks};
use midisheet_rs::midi::utils::format_time;
use midisheet_rs::sheet::codec::{CODE_WIDTH, decode, encode};
use midisheet_rs::sheet::verify::verify;
use midisheet_rs::sheet::{Token, dump_tokens};
use midisheet_rs::sink::{KdmapiSink, NoteSink, NullSink};

#[derive(Debug, Parser)]
#[command(name = "midisheet", about = "Pack MIDI notes into a compact sheet and play them back")]
struct Cli {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the tracks and tempo of a MIDI file.
    Info { file: PathBuf },

    /// Convert tracks into the packed sheet and check the round trip.
    Convert {
        file: PathBuf,

        /// Track indices to include (default: all).
        #[arg(short, long, value_delimiter = ',')]
        tracks: Vec<u32>,

        /// Transpose by this many semitones.
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        shift: i32,

        /// Write the plain token dump here.
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Write the packed blocks here, one per line (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decode packed blocks (one per line) back into a token dump.
    Decode {
        blocks: PathBuf,

        /// Number of tokens to read (default: everything).
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Play tracks through the KDMAPI synthesizer.
    ///
    /// Commands on stdin: `p` pause/resume, `s <sec>` seek, `m <track>` toggle
    /// mute, `t <semitones>` transpose, `q` stop.
    Play {
        file: PathBuf,

        #[arg(short, long, value_delimiter = ',')]
        tracks: Vec<u32>,

        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        shift: i32,

        /// Do not open a synthesizer.
        #[arg(long)]
        null_sink: bool,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::Level::Info,
        1 => log::Level::Debug,
        _ => log::Level::Trace,
    };
    simple_logger::init_with_level(level)?;

    match cli.command {
        Command::Info { file } => info(&file),
        Command::Convert {
            file,
            tracks,
            shift,
            dump,
            output,
        } => convert(&file, tracks, shift, dump.as_deref(), output.as_deref()),
        Command::Decode { blocks, count } => decode_blocks(&blocks, count),
        Command::Play {
            file,
            tracks,
            shift,
            null_sink,
        } => play(&file, tracks, shift, null_sink),
    }
}

fn load(path: &Path) -> Result<MidiFile, Box<dyn Error>> {
    let start = Instant::now();
    let file = load_midi_file(path).map_err(|err| format!("{}: {}", path.display(), err))?;
    log::debug!("Loaded {} in {:.2?}", path.display(), start.elapsed());
    Ok(file)
}

/// Keep valid indices once each; an empty selection means every track.
fn select_tracks(file: &MidiFile, requested: Vec<u32>) -> Vec<u32> {
    if requested.is_empty() {
        return (0..file.tracks.len() as u32).collect();
    }
    unique_tracks(&requested)
        .into_iter()
        .filter(|&t| {
            let valid = (t as usize) < file.tracks.len();
            if !valid {
                log::warn!("Ignoring track {}: file has {} tracks", t, file.tracks.len());
            }
            valid
        })
        .collect()
}

fn info(path: &Path) -> Result<(), Box<dyn Error>> {
    let file = load(path)?;
    let tempo = resolve_tempo(&file);

    println!(
        "Tracks: {}, Ticks per beat: {}, Tempo: {} ({} BPM)",
        file.tracks.len(),
        file.ticks_per_beat,
        tempo.separate_with_commas(),
        bpm(tempo)
    );
    for (i, track) in file.tracks.iter().enumerate() {
        println!(
            "  [{}] {:<24} {} notes",
            i,
            track.name.as_deref().unwrap_or("(unnamed)"),
            track.note_count().separate_with_commas()
        );
    }
    Ok(())
}

fn convert(
    path: &Path,
    tracks: Vec<u32>,
    shift: i32,
    dump: Option<&Path>,
    output: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let file = load(path)?;
    let selected = select_tracks(&file, tracks);
    let tempo = resolve_tempo(&file);

    let start = Instant::now();
    let timeline = build_timeline(&file, &selected, shift, tempo);
    if timeline.tokens.is_empty() {
        log::warn!("Nothing to convert: no tracks selected");
        return Ok(());
    }
    let blocks = encode(&timeline.tokens);

    let notes = timeline.tokens.iter().filter(|t| t.is_note()).count();
    println!(
        "Converted MIDI Summary:\n\
     - Tokens: {}\n\
     - Notes: {}\n\
     - Rests: {}\n\
     - Blocks: {}\n\
     - Tempo: {} BPM\n\
     - Total Duration: {}\n\
     - Convert Time: {:.2?}",
        timeline.tokens.len().separate_with_commas(),
        notes.separate_with_commas(),
        (timeline.tokens.len() - notes).separate_with_commas(),
        blocks.len().separate_with_commas(),
        bpm(tempo),
        format_time(timeline.total_seconds),
        start.elapsed()
    );

    let decoded = decode(&blocks, timeline.tokens.len());
    let check = verify(&timeline.tokens, &decoded);
    if check.is_acceptable() {
        log::info!("Round trip match rate: {:.2}%", check.match_rate * 100.0);
    } else {
        log::warn!(
            "Low round trip match rate: {:.2}%, first differences at {:?}",
            check.match_rate * 100.0,
            &check.mismatched[..check.mismatched.len().min(10)]
        );
    }

    if let Some(dump) = dump {
        fs::write(dump, dump_tokens(&timeline.tokens))?;
        log::info!("Token dump written to {}", dump.display());
    }

    let packed = blocks.join("\n");
    match output {
        Some(output) => {
            fs::write(output, packed)?;
            log::info!("Blocks written to {}", output.display());
        }
        None => println!("{}", packed),
    }
    Ok(())
}

fn decode_blocks(path: &Path, count: Option<usize>) -> Result<(), Box<dyn Error>> {
    let text = fs::read_to_string(path)?;
    let blocks: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let count = count.unwrap_or_else(|| {
        blocks.iter().map(|b| b.chars().count()).sum::<usize>() / CODE_WIDTH
    });

    let tokens: Vec<Token> = decode(&blocks, count);
    println!("{}", dump_tokens(&tokens));
    Ok(())
}

enum UserCommand {
    TogglePause,
    Seek(f64),
    ToggleMute(u32),
    Shift(i32),
    Quit,
}

fn parse_user_command(line: &str) -> Option<UserCommand> {
    let mut parts = line.split_whitespace();
    let command = match (parts.next()?, parts.next()) {
        ("p", None) => UserCommand::TogglePause,
        ("q", None) => UserCommand::Quit,
        ("s", Some(arg)) => UserCommand::Seek(arg.parse().ok()?),
        ("m", Some(arg)) => UserCommand::ToggleMute(arg.parse().ok()?),
        ("t", Some(arg)) => UserCommand::Shift(arg.parse().ok()?),
        _ => return None,
    };
    Some(command)
}

fn play(path: &Path, tracks: Vec<u32>, shift: i32, null_sink: bool) -> Result<(), Box<dyn Error>> {
    let file = Arc::new(load(path)?);
    let selected = select_tracks(&file, tracks);

    let opener: SinkOpener = if null_sink {
        Box::new(|| -> Result<Box<dyn NoteSink>, SinkError> { Ok(Box::new(NullSink)) })
    } else {
        Box::new(|| -> Result<Box<dyn NoteSink>, SinkError> {
            Ok(Box::new(KdmapiSink::open()?))
        })
    };

    let mut player = Player::new(file, opener);
    player.set_shift(shift);
    player.start(&selected)?;

    let (lines_tx, lines_rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines().map_while(Result::ok) {
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut last_report = Instant::now();
    loop {
        match player.state() {
            PlaybackState::Stopped | PlaybackState::Idle => break,
            _ => {}
        }

        match lines_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => match parse_user_command(&line) {
                Some(UserCommand::TogglePause) => player.toggle_pause(),
                Some(UserCommand::Seek(seconds)) => player.seek(seconds),
                Some(UserCommand::ToggleMute(track)) => {
                    let muted = !player.is_muted(track);
                    player.set_track_mute(track, muted);
                    log::info!("Track {} {}", track, if muted { "muted" } else { "unmuted" });
                }
                Some(UserCommand::Shift(semitones)) => {
                    player.set_shift(semitones);
                    log::info!("Transpose {} semitones", semitones);
                }
                Some(UserCommand::Quit) => break,
                None => log::warn!("Unknown command `{}`", line.trim()),
            },
            Err(RecvTimeoutError::Timeout) => {}
            // stdin closed: keep playing until the end
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(100)),
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            let status = player.status();
            log::info!(
                "{} / {} ({} events)",
                format_time(status.position_seconds),
                format_time(status.total_seconds),
                status.dispatched.separate_with_commas()
            );
            last_report = Instant::now();
        }
    }

    player.stop();
    Ok(())
}
