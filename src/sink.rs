//! Destinations for note messages.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::SinkError;
use crate::kdmapi::{KDMAPI, KDMAPIStream};

pub const CHANNELS: u8 = 16;
pub const CC_VOLUME: u8 = 7;
pub const CC_PAN: u8 = 10;

/// A synthesizer that accepts note and controller messages.
///
/// All calls are best effort: implementations log failures and carry on.
pub trait NoteSink: Send {
    fn note_on(&mut self, pitch: u8, velocity: u8, channel: u8);
    fn note_off(&mut self, pitch: u8, channel: u8);
    fn control_change(&mut self, channel: u8, controller: u8, value: u8);
    fn close(&mut self);
}

/// Pack a short MIDI message the way `SendDirectData` expects it.
pub fn pack_short(status: u8, data1: u8, data2: u8) -> u32 {
    u32::from(status) | (u32::from(data1 & 0x7F) << 8) | (u32::from(data2 & 0x7F) << 16)
}

/// Hand one packed message to `send`, logging a non-zero result.
/// Returns whether the driver accepted it.
fn deliver(message: u32, send: impl FnOnce(u32) -> u32) -> bool {
    let result = send(message);
    if result != 0 {
        log::debug!("SendDirectData({:#010x}) failed with {}", message, result);
    }
    result == 0
}

/// Sends messages through the OmniMIDI/KDMAPI driver.
pub struct KdmapiSink {
    stream: Option<KDMAPIStream>,
}

impl KdmapiSink {
    pub fn open() -> Result<Self, SinkError> {
        let binds = KDMAPI
            .as_ref()
            .map_err(|err| SinkError::Unavailable(err.clone()))?;
        if !binds.is_kdmapi_available() {
            return Err(SinkError::Unavailable("KDMAPI reports it is not available".into()));
        }
        let stream = binds.open_stream()?;
        Ok(Self {
            stream: Some(stream),
        })
    }

    fn send(&self, status: u8, data1: u8, data2: u8) {
        if let Some(stream) = &self.stream {
            deliver(pack_short(status, data1, data2), |message| {
                stream.send_direct_data(message)
            });
        }
    }
}

impl NoteSink for KdmapiSink {
    fn note_on(&mut self, pitch: u8, velocity: u8, channel: u8) {
        self.send(0x90 | (channel & 0x0F), pitch, velocity);
    }

    fn note_off(&mut self, pitch: u8, channel: u8) {
        self.send(0x80 | (channel & 0x0F), pitch, 0);
    }

    fn control_change(&mut self, channel: u8, controller: u8, value: u8) {
        self.send(0xB0 | (channel & 0x0F), controller, value);
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.reset();
            log::debug!("KDMAPI stream closed");
        }
    }
}

impl Drop for KdmapiSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Discards everything. Used when no synthesizer can be opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NoteSink for NullSink {
    fn note_on(&mut self, _pitch: u8, _velocity: u8, _channel: u8) {}
    fn note_off(&mut self, _pitch: u8, _channel: u8) {}
    fn control_change(&mut self, _channel: u8, _controller: u8, _value: u8) {}
    fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCall {
    NoteOn { pitch: u8, velocity: u8, channel: u8 },
    NoteOff { pitch: u8, channel: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    Close,
}

/// Keeps every call in a shared list; clones share the same list.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    calls: Arc<Mutex<Vec<SinkCall>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push(&self, call: SinkCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl NoteSink for RecordingSink {
    fn note_on(&mut self, pitch: u8, velocity: u8, channel: u8) {
        self.push(SinkCall::NoteOn { pitch, velocity, channel });
    }

    fn note_off(&mut self, pitch: u8, channel: u8) {
        self.push(SinkCall::NoteOff { pitch, channel });
    }

    fn control_change(&mut self, channel: u8, controller: u8, value: u8) {
        self.push(SinkCall::ControlChange { channel, controller, value });
    }

    fn close(&mut self) {
        self.push(SinkCall::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_status_and_data() {
        assert_eq!(pack_short(0x93, 60, 100), 0x0064_3C93);
        assert_eq!(pack_short(0xB0, CC_VOLUME, 0), 0x0000_07B0);
        // data bytes are 7 bit
        assert_eq!(pack_short(0x80, 0xFF, 0xFF), 0x007F_7F80);
    }

    #[test]
    fn rejected_messages_are_reported() {
        let message = pack_short(0x90, 60, 100);
        assert!(deliver(message, |m| if m == message { 0 } else { 1 }));
        // MMSYSERR_NOTENABLED
        assert!(!deliver(message, |_| 11));
    }

    #[test]
    fn recording_sink_clones_share_calls() {
        let sink = RecordingSink::new();
        let mut writer: Box<dyn NoteSink> = Box::new(sink.clone());
        writer.note_on(60, 100, 2);
        writer.control_change(2, CC_VOLUME, 0);
        writer.close();

        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::NoteOn { pitch: 60, velocity: 100, channel: 2 },
                SinkCall::ControlChange { channel: 2, controller: CC_VOLUME, value: 0 },
                SinkCall::Close,
            ]
        );
    }
}
