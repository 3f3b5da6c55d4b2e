use std::io;

/// Failures while reading a Standard MIDI File.
#[derive(Debug, thiserror::Error)]
pub enum MidiError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Not a MIDI file")]
    NotMidi,

    #[error("Invalid header length: {0}")]
    BadHeaderLength(u32),

    #[error("SMPTE timing is not supported")]
    SmpteUnsupported,

    #[error("Truncated chunk: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
}

/// The output synthesizer could not be reached.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Output sink unavailable: {0}")]
    Unavailable(String),
}

/// A line of the plain-text token dump that is neither `-<ms>` nor `<key>.<ms>`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid token `{0}`")]
pub struct TokenParseError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Please select at least one track")]
    NoTracksSelected,

    #[error("Failed to spawn playback thread: {0}")]
    Spawn(#[from] io::Error),
}
