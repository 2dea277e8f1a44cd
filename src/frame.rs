//! The GDAT wire format: packet framing, checksums and payload decode.
//!
//! A `.gdat` byte stream begins with an ASCII preamble
//! (`/PLM_YYYY-MM-DD-HH-MM-SS.gdat:`, the RTC at session start) followed by
//! a series of framed packets. Unescaped, and including the start
//! delimiter, a packet is laid out big-endian:
//!
//! ```text
//! offset  0    1 2 3 4      5 6    7 .. n   n+1
//! field   SD   TIMESTAMP    ID     DATA     CKSUM
//!         u8   u32          u16    typed    u8
//! ```
//!
//! `SD` (0x7E) marks the start of a packet. On the wire every body byte
//! equal to `SD` or `ESC` (0x7D) is escaped as `ESC, byte ^ 0x20`, so a
//! 0x7E byte can only ever appear as a frame start; the leading `SD` is
//! never escaped. The checksum is the low byte of the sum of the unescaped
//! packet, including the start delimiter and excluding the checksum byte
//! itself.
//!
//! [`FrameDecoder`] is sans-I/O: bytes are [pushed](FrameDecoder::push) in
//! arbitrary chunks and validated [`Record`]s are
//! [pulled](FrameDecoder::pull) out. Chunk boundaries never affect the
//! decoded output.

use std::collections::VecDeque;
use std::sync::Arc;

use byteorder::{ByteOrder, BE};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::schema::Schema;

/// Start delimiter; marks the beginning of a packet.
pub const SD: u8 = 0x7E;
/// Escape byte; XOR-encodes a following 0x7E or 0x7D.
pub const ESC: u8 = 0x7D;
/// The value XORed into an escaped byte.
pub const ESC_XOR: u8 = 0x20;

/// Smallest valid unescaped packet: delimiter, timestamp, id, one data
/// byte and the checksum.
const MIN_PACKET: usize = 9;

/// A decoded telemetry sample: which parameter, when, and what value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub id: u16,
    /// Milliseconds since session start.
    pub t_ms: u32,
    pub value: f64,
}

/// Per-packet failures. These are data-quality issues: the decoder counts
/// them, drops the packet and resynchronises on the next start delimiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("packet too short ({0} bytes)")]
    TooShort(usize),
    #[error("checksum mismatch (expected {expected:#04x}, found {found:#04x})")]
    Checksum { expected: u8, found: u8 },
    #[error("id {0} is not in the schema")]
    UnknownId(u16),
    #[error("payload of id {id} is {found} bytes, expected {expected}")]
    PayloadSize { id: u16, expected: usize, found: usize },
}

/// Running counters over a decoded stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Packets that validated and decoded.
    pub packets: u64,
    /// Packets discarded for any [`FrameError`].
    pub errors: u64,
}

enum State {
    /// Discarding bytes until a start delimiter.
    Idle,
    /// Accumulating unescaped body bytes.
    Body,
    /// The previous byte was `ESC`; the next byte is XOR-decoded.
    BodyEsc,
}

/// Streaming GDAT packet decoder.
///
/// Corrupt packets are delimited by the next start delimiter, so no
/// explicit resynchronisation is needed: every byte outside SD framing is
/// consumed by the state machine.
pub struct FrameDecoder {
    schema: Arc<Schema>,
    state: State,
    frame: Vec<u8>,
    records: VecDeque<Record>,
    stats: FrameStats,
}

impl FrameDecoder {
    pub fn new(schema: Arc<Schema>) -> FrameDecoder {
        FrameDecoder {
            schema,
            state: State::Idle,
            frame: Vec::new(),
            records: VecDeque::new(),
            stats: FrameStats::default(),
        }
    }

    /// Pushes a chunk of raw stream bytes into the decoder.
    pub fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push_byte(b);
        }
    }

    fn push_byte(&mut self, b: u8) {
        match self.state {
            State::Idle => {
                if b == SD {
                    self.begin_frame();
                }
            }
            State::Body => match b {
                SD => {
                    self.finalize();
                    self.begin_frame();
                }
                ESC => self.state = State::BodyEsc,
                b => self.frame.push(b),
            },
            State::BodyEsc => {
                self.frame.push(b ^ ESC_XOR);
                self.state = State::Body;
            }
        }
    }

    fn begin_frame(&mut self) {
        self.frame.clear();
        self.frame.push(SD);
        self.state = State::Body;
    }

    /// Finalises the packet in flight, if any. Call once at the end of a
    /// bounded stream (a file); an unterminated trailing packet would
    /// otherwise wait forever for the next start delimiter.
    pub fn finish(&mut self) {
        if let State::Body | State::BodyEsc = self.state {
            self.finalize();
        }
        self.frame.clear();
        self.state = State::Idle;
    }

    fn finalize(&mut self) {
        match decode_packet(&self.frame, &self.schema) {
            Ok(record) => {
                self.stats.packets += 1;
                self.records.push_back(record);
            }
            Err(e) => {
                self.stats.errors += 1;
                debug!("dropped packet: {}", e);
            }
        }
    }

    /// Pulls the next validated record, if any.
    pub fn pull(&mut self) -> Option<Record> {
        self.records.pop_front()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }
}

/// Checksum over an unescaped packet prefix: the low byte of the wrapping
/// byte sum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Validates and decodes one unescaped packet (including the leading SD).
fn decode_packet(packet: &[u8], schema: &Schema) -> Result<Record, FrameError> {
    if packet.len() < MIN_PACKET {
        return Err(FrameError::TooShort(packet.len()));
    }
    let (body, cksum) = packet.split_at(packet.len() - 1);
    let expected = checksum(body);
    if expected != cksum[0] {
        return Err(FrameError::Checksum {
            expected,
            found: cksum[0],
        });
    }

    let t_ms = BE::read_u32(&body[1..5]);
    let id = BE::read_u16(&body[5..7]);
    let param = schema.get(id).ok_or(FrameError::UnknownId(id))?;

    let payload = &body[7..];
    if payload.len() != param.wire_type.size() {
        return Err(FrameError::PayloadSize {
            id,
            expected: param.wire_type.size(),
            found: payload.len(),
        });
    }

    Ok(Record {
        id,
        t_ms,
        value: param.wire_type.decode(payload),
    })
}

/// Builds an escaped on-wire packet from its components. `payload` is the
/// big-endian typed value bytes.
pub fn encode_packet(t_ms: u32, id: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8 + payload.len());
    packet.push(SD);
    packet.extend_from_slice(&t_ms.to_be_bytes());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(payload);
    packet.push(checksum(&packet));

    // escape everything after the leading delimiter
    let mut wire = Vec::with_capacity(packet.len() + 2);
    wire.push(SD);
    for &b in &packet[1..] {
        if b == SD || b == ESC {
            wire.push(ESC);
            wire.push(b ^ ESC_XOR);
        } else {
            wire.push(b);
        }
    }
    wire
}

/// Splits a `.gdat` file image into its ASCII preamble and the packet
/// stream that follows. Without the `.gdat:` marker the whole image is
/// treated as preamble and no packets are returned.
pub fn split_preamble(bytes: &[u8]) -> (&[u8], &[u8]) {
    const MARKER: &[u8] = b".gdat:";
    match bytes
        .windows(MARKER.len())
        .position(|window| window == MARKER)
    {
        Some(at) => (&bytes[..at], &bytes[at + MARKER.len()..]),
        None => (bytes, &[]),
    }
}

/// Decodes the session start time from the preamble. Returns the Unix
/// epoch (and logs a warning) if the preamble does not parse.
pub fn get_t0(preamble: &[u8]) -> DateTime<Utc> {
    let text = String::from_utf8_lossy(preamble);
    for format in &["/PLM_%Y-%m-%d-%H-%M-%S", "/%Y-%m-%d-%H-%M-%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, format) {
            return Utc.from_utc_datetime(&naive);
        }
    }
    warn!("failed to parse session timestamp {:?}", text);
    DateTime::<Utc>::UNIX_EPOCH
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NetworkConfig, Schema};
    use chrono::Datelike;

    fn schema() -> Arc<Schema> {
        let config: NetworkConfig = serde_norway::from_str(
            r#"
parameters:
  status: { id: 1, type: UNSIGNED8, motec_name: Status }
  rpm: { id: 2, type: UNSIGNED16, motec_name: Engine RPM, unit: rpm }
  pressure: { id: 3, type: FLOATING, motec_name: Oil Pressure, unit: kPa }
"#,
        )
        .unwrap();
        Arc::new(Schema::from_config(&config))
    }

    #[test]
    fn literal_escaped_packet() {
        // data byte 0x7E must arrive escaped on the wire
        let wire: &[u8] = &[0x7E, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x7D, 0x5E, 0xFE];

        let mut decoder = FrameDecoder::new(schema());
        decoder.push(wire);
        decoder.finish();

        assert_eq!(
            decoder.pull(),
            Some(Record {
                id: 1,
                t_ms: 1,
                value: 126.0
            })
        );
        assert_eq!(decoder.stats(), FrameStats { packets: 1, errors: 0 });
    }

    #[test]
    fn encode_escapes_and_checksums() {
        let wire = encode_packet(1, 1, &[0x7E]);
        assert_eq!(wire, [0x7E, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x7D, 0x5E, 0xFE]);

        // an escape byte in the payload is escaped too
        let wire = encode_packet(0, 1, &[0x7D]);
        assert!(wire[7..9] == [0x7D, 0x5D]);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut decoder = FrameDecoder::new(schema());
        decoder.push(&encode_packet(125, 2, &0x7E7Du16.to_be_bytes()));
        decoder.push(&encode_packet(135, 3, &1.5f32.to_be_bytes()));
        decoder.finish();

        assert_eq!(
            decoder.pull(),
            Some(Record {
                id: 2,
                t_ms: 125,
                value: 0x7E7D as f64
            })
        );
        assert_eq!(
            decoder.pull(),
            Some(Record {
                id: 3,
                t_ms: 135,
                value: 1.5
            })
        );
        assert_eq!(decoder.pull(), None);
    }

    #[test]
    fn chunking_does_not_affect_output() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"garbage before first delimiter");
        for t in 0..50u32 {
            stream.extend_from_slice(&encode_packet(t * 10, 2, &(t as u16 * 3).to_be_bytes()));
        }

        let mut whole = FrameDecoder::new(schema());
        whole.push(&stream);
        whole.finish();

        let mut bytewise = FrameDecoder::new(schema());
        for &b in &stream {
            bytewise.push(&[b]);
        }
        bytewise.finish();

        let a: Vec<_> = std::iter::from_fn(|| whole.pull()).collect();
        let b: Vec<_> = std::iter::from_fn(|| bytewise.pull()).collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 50);
        assert_eq!(whole.stats(), bytewise.stats());
    }

    #[test]
    fn corrupt_packet_resyncs_on_next_delimiter() {
        let mut stream = encode_packet(10, 1, &[42]);
        stream[6] ^= 0xFF; // flip the id low byte; checksum now fails
        stream.extend_from_slice(&encode_packet(20, 1, &[43]));

        let mut decoder = FrameDecoder::new(schema());
        decoder.push(&stream);
        decoder.finish();

        assert_eq!(
            decoder.pull(),
            Some(Record {
                id: 1,
                t_ms: 20,
                value: 43.0
            })
        );
        assert_eq!(decoder.pull(), None);
        assert_eq!(decoder.stats(), FrameStats { packets: 1, errors: 1 });
    }

    #[test]
    fn schema_and_length_errors_are_counted() {
        let mut decoder = FrameDecoder::new(schema());
        // unknown id
        decoder.push(&encode_packet(0, 999, &[1]));
        // payload too long for U8
        decoder.push(&encode_packet(0, 1, &[1, 2]));
        // a bare delimiter opens an empty packet, closed by the next one
        decoder.push(&[SD]);
        decoder.push(&encode_packet(5, 1, &[7]));
        decoder.finish();

        assert_eq!(
            decoder.pull(),
            Some(Record {
                id: 1,
                t_ms: 5,
                value: 7.0
            })
        );
        assert_eq!(decoder.pull(), None);
        assert_eq!(decoder.stats(), FrameStats { packets: 1, errors: 3 });
    }

    #[test]
    fn preamble_split_and_t0() {
        let image = b"/PLM_2023-09-09-13-30-00.gdat:\x7Etail";
        let (preamble, data) = split_preamble(image);
        assert_eq!(preamble, b"/PLM_2023-09-09-13-30-00");
        assert_eq!(data, b"\x7Etail");

        let t0 = get_t0(preamble);
        assert_eq!((t0.year(), t0.month(), t0.day()), (2023, 9, 9));

        let t0 = get_t0(b"/2024-01-02-03-04-05");
        assert_eq!((t0.year(), t0.month(), t0.day()), (2024, 1, 2));

        // unparsable preamble falls back to the epoch
        assert_eq!(get_t0(b"bogus"), DateTime::<Utc>::UNIX_EPOCH);
    }
}
