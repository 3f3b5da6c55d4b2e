/// What a single track message means to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    /// Microseconds per quarter note (meta FF 51).
    SetTempo(u32),
    Other,
}

/// A message with the tick delta since the previous message of the same track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackMessage {
    pub delta: u32,
    pub kind: MessageKind,
}

impl TrackMessage {
    pub fn new(delta: u32, kind: MessageKind) -> Self {
        Self { delta, kind }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Track {
    pub name: Option<String>,
    pub messages: Vec<TrackMessage>,
}

impl Track {
    pub fn new(messages: Vec<TrackMessage>) -> Self {
        Self {
            name: None,
            messages,
        }
    }

    pub fn note_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| matches!(m.kind, MessageKind::NoteOn { velocity, .. } if velocity > 0))
            .count()
    }
}

/// One undecoded event as it appears in the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawEvent {
    Channel { status: u8, d1: u8, d2: u8 },
    /// Payload is left in `long_msg`.
    Meta(u8),
    SysEx,
}

/// Cursor over the raw bytes of one `MTrk` chunk.
pub struct TrackData {
    data: Vec<u8>,
    long_msg: Vec<u8>,
    offset: usize,
    last_status: Option<u8>,
    ended: bool,
}

impl TrackData {
    pub fn new(data: Vec<u8>) -> Self {
        TrackData {
            data,
            long_msg: Vec::with_capacity(256),
            offset: 0,
            last_status: None,
            ended: false,
        }
    }

    /// Decode a whole chunk into a track.
    pub fn decode(data: Vec<u8>) -> Track {
        let mut reader = TrackData::new(data);
        let mut track = Track::default();

        while let Some((delta, event)) = reader.next_event() {
            let kind = match event {
                RawEvent::Channel { status, d1, d2 } => {
                    let channel = status & 0x0F;
                    match status & 0xF0 {
                        0x90 => MessageKind::NoteOn {
                            channel,
                            pitch: d1 & 0x7F,
                            velocity: d2 & 0x7F,
                        },
                        0x80 => MessageKind::NoteOff {
                            channel,
                            pitch: d1 & 0x7F,
                        },
                        _ => MessageKind::Other,
                    }
                }
                // Tempo change (FF 51): microseconds per quarter note
                RawEvent::Meta(0x51) if reader.long_msg.len() >= 3 => {
                    let t = (u32::from(reader.long_msg[0]) << 16)
                        | (u32::from(reader.long_msg[1]) << 8)
                        | u32::from(reader.long_msg[2]);
                    MessageKind::SetTempo(t)
                }
                // Track name (FF 03)
                RawEvent::Meta(0x03) => {
                    if track.name.is_none() {
                        let name = String::from_utf8_lossy(&reader.long_msg).trim().to_string();
                        if !name.is_empty() {
                            track.name = Some(name);
                        }
                    }
                    MessageKind::Other
                }
                RawEvent::Meta(_) | RawEvent::SysEx => MessageKind::Other,
            };
            track.messages.push(TrackMessage::new(delta, kind));
        }

        track
    }

    fn read_byte(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.offset)?;
        self.offset += 1;
        Some(byte)
    }

    /// Decode a variable-length MIDI value from the data stream.
    pub fn decode_variable_length(&mut self) -> u32 {
        let mut result = 0u32;
        while let Some(byte) = self.read_byte() {
            result = (result << 7) | u32::from(byte & 0x7F);
            if (byte & 0x80) == 0 {
                break;
            }
        }
        result
    }

    /// Read the next status byte, falling back to running status for data bytes.
    fn read_status(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.offset)?;
        if byte >= 0x80 {
            self.offset += 1;
            // Only channel messages may be continued with running status.
            if byte < 0xF0 {
                self.last_status = Some(byte);
            } else if byte != 0xFF {
                self.last_status = None;
            }
            Some(byte)
        } else {
            // A data byte with no running status is invalid; it is consumed
            // as an unknown event so the cursor keeps moving.
            if self.last_status.is_none() {
                self.offset += 1;
            }
            Some(self.last_status.unwrap_or(0))
        }
    }

    /// Copy a length-prefixed meta/sysex payload into `long_msg`.
    fn read_long(&mut self) {
        let len = self.decode_variable_length() as usize;
        let end = self.offset.saturating_add(len).min(self.data.len());
        self.long_msg.clear();
        self.long_msg.extend_from_slice(&self.data[self.offset..end]);
        self.offset = end;
    }

    /// Advance past the next event, returning it with its tick delta.
    /// Stops at End of Track (FF 2F) or at the end of the chunk.
    fn next_event(&mut self) -> Option<(u32, RawEvent)> {
        if self.ended || self.offset >= self.data.len() {
            return None;
        }

        let delta = self.decode_variable_length();
        let status = self.read_status()?;

        let event = match status {
            0x80..=0xBF | 0xE0..=0xEF => {
                let d1 = self.read_byte().unwrap_or(0);
                let d2 = self.read_byte().unwrap_or(0);
                RawEvent::Channel { status, d1, d2 }
            }
            // 1-byte messages (program change & channel pressure)
            0xC0..=0xDF => {
                let d1 = self.read_byte().unwrap_or(0);
                RawEvent::Channel { status, d1, d2: 0 }
            }
            0xFF => {
                let meta_type = self.read_byte().unwrap_or(0);
                self.read_long();
                if meta_type == 0x2F {
                    self.ended = true;
                }
                RawEvent::Meta(meta_type)
            }
            0xF0 | 0xF7 => {
                self.read_long();
                RawEvent::SysEx
            }
            _ => RawEvent::SysEx,
        };

        Some((delta, event))
    }
}
