//! Wire framing: outbound chunking and inbound line reassembly.
//!
//! Protocol frames are newline-terminated text of arbitrary length, while a
//! BLE link can only move `MTU - 3` bytes per write and may deliver inbound
//! notifications at arbitrary byte boundaries. This module owns both
//! directions of that mismatch.

use std::time::Duration;

use tracing::warn;

/// Payload bound before MTU negotiation (ATT default MTU 23 minus header).
pub const DEFAULT_PAYLOAD_SIZE: usize = 20;

/// Delay between successive chunk writes of one command. The firmware's
/// receive buffer is small; the protocol asks for 20-50 ms of flow control.
pub const CHUNK_PACING: Duration = Duration::from_millis(30);

/// Normalize a command for the wire: exactly one trailing newline,
/// appended if absent, never duplicated.
pub fn normalize_command(command: &str) -> String {
    if command.ends_with('\n') {
        command.to_string()
    } else {
        format!("{command}\n")
    }
}

/// Split wire bytes into ordered chunks of at most `max_payload` bytes.
/// Concatenating the chunks reconstructs the input exactly.
pub fn chunks(wire: &[u8], max_payload: usize) -> std::slice::Chunks<'_, u8> {
    wire.chunks(max_payload.max(1))
}

/// Reassembles newline-delimited frames from a byte stream delivered in
/// arbitrary-sized pieces.
///
/// The buffer is owned by exactly one reader loop; `feed` calls for a given
/// transport are serialized by construction.
#[derive(Debug, Default)]
pub struct LineReassembler {
    buffer: String,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delivery and drain every complete frame it finishes.
    ///
    /// Frames are returned in arrival order with the delimiter stripped; an
    /// unterminated tail is retained for the next call. A delivery that is
    /// not valid UTF-8 is dropped whole so one bad notification cannot
    /// desynchronize the rest of the session.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.buffer.push_str(text),
            Err(e) => {
                warn!("discarding non-UTF-8 delivery of {} bytes: {e}", bytes.len());
                return Vec::new();
            }
        }

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let frame: String = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            frames.push(frame);
        }
        frames
    }

    /// The unterminated tail currently buffered.
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_appends_exactly_one_newline() {
        assert_eq!(normalize_command("CMD:SYNC"), "CMD:SYNC\n");
        assert_eq!(normalize_command("CMD:SYNC\n"), "CMD:SYNC\n");
    }

    #[test]
    fn chunks_reconstruct_wire_bytes_exactly() {
        let wire = normalize_command("TRACK:SETUP=0,5.0,51.500000,-0.120000,51.500100,-0.119900");
        for payload in [1usize, 3, 19, 20, 21, 244, 1024] {
            let pieces: Vec<&[u8]> = chunks(wire.as_bytes(), payload).collect();
            assert!(pieces.iter().all(|c| c.len() <= payload));
            let rebuilt: Vec<u8> = pieces.concat();
            assert_eq!(rebuilt, wire.as_bytes());
        }
    }

    #[test]
    fn zero_payload_is_clamped_instead_of_panicking() {
        let pieces: Vec<&[u8]> = chunks(b"OK\n", 0).collect();
        assert_eq!(pieces.len(), 3);
    }

    #[test]
    fn whole_frames_in_one_delivery() {
        let mut r = LineReassembler::new();
        let frames = r.feed(b"OK:SAVED\nSYS:SD=1,BAT=3.7\n");
        assert_eq!(frames, vec!["OK:SAVED".to_string(), "SYS:SD=1,BAT=3.7".to_string()]);
        assert_eq!(r.pending(), "");
    }

    #[test]
    fn frame_split_across_deliveries() {
        let mut r = LineReassembler::new();
        assert!(r.feed(b"TLM:42.5,7,1,0,").is_empty());
        assert!(r.feed(b"65430,51.5,-0.12").is_empty());
        let frames = r.feed(b"\nOK:");
        assert_eq!(frames, vec!["TLM:42.5,7,1,0,65430,51.5,-0.12".to_string()]);
        assert_eq!(r.pending(), "OK:");
    }

    #[test]
    fn any_split_yields_same_frames_as_one_delivery() {
        let stream = b"TLM:1,2,0,-1,0,0.0,0.0\nVOL:15\nSYS:SD=1,BAT=3.9\nOK:SAVED\n";

        let mut whole = LineReassembler::new();
        let expected = whole.feed(stream);

        // Every split point, fed as two deliveries.
        for cut in 1..stream.len() {
            let mut r = LineReassembler::new();
            let mut got = r.feed(&stream[..cut]);
            got.extend(r.feed(&stream[cut..]));
            assert_eq!(got, expected, "split at {cut}");
            assert_eq!(r.pending(), "");
        }

        // Byte-at-a-time delivery.
        let mut r = LineReassembler::new();
        let mut got = Vec::new();
        for b in stream.iter() {
            got.extend(r.feed(std::slice::from_ref(b)));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn invalid_utf8_delivery_is_dropped_without_poisoning_the_stream() {
        let mut r = LineReassembler::new();
        assert!(r.feed(b"SYS:").is_empty());
        assert!(r.feed(&[0xFF, 0xFE]).is_empty());
        let frames = r.feed(b"SD=1\n");
        assert_eq!(frames, vec!["SYS:SD=1".to_string()]);
    }

    #[test]
    fn empty_frame_is_emitted() {
        let mut r = LineReassembler::new();
        assert_eq!(r.feed(b"\n"), vec![String::new()]);
    }
}
