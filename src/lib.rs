//! Convert MIDI note data into a compact fixed-alphabet sheet and play it
//! back live through a MIDI synthesizer.

pub mod error;
pub mod kdmapi;
pub mod midi;
pub mod sheet;
pub mod sink;
