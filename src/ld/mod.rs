//! The LD log container.
//!
//! An `.ld` file is six regions linked by absolute file offsets: header,
//! event, venue, vehicle and weather records, an array of channel
//! metadata entries forming a doubly linked list, and the packed sample
//! data. The layout here reproduces logs from a MoTeC EDL3 v5.6; the
//! magic constants are reverse-engineered, not interpreted.
//!
//! All fixed-layout records are little-endian. String fields are
//! fixed-width, NUL-padded UTF-8. Fields are placed by explicit offset
//! into zeroed region buffers, so each offset below is both the
//! documentation and the implementation of the layout.

mod reader;
mod writer;

pub use reader::{read, FormatError, LdChannel, LdFile, ReadError};
pub use writer::write;

use byteorder::{ByteOrder, LE};
use chrono::{DateTime, Utc};

use crate::scale::Scaling;

pub(crate) const HEADER_SIZE: usize = 0x6E2;
pub(crate) const EVENT_SIZE: usize = 0xC54;
pub(crate) const VENUE_SIZE: usize = 0xC1E;
pub(crate) const VEHICLE_SIZE: usize = 0xCF4;
pub(crate) const WEATHER_SIZE: usize = 0x800;
pub(crate) const CH_META_SIZE: usize = 0x7C;

/// `sof` marker at offset 0 of every file.
pub(crate) const SOF: u64 = 0x40;
/// Channel metadata marker for 4-byte (i32) samples.
pub(crate) const CH_MAGIC_I32: u32 = 0x0005_AA55;
/// Marker used by older files carrying 2-byte (i16) samples.
pub(crate) const CH_MAGIC_I16: u32 = 0x0003_0001;

/// Header field offsets. Unlisted gaps are reserved and left zeroed.
pub(crate) mod hdr {
    pub const SOF: usize = 0x00; // u64, 0x40
    pub const META_PTR: usize = 0x08; // u32
    pub const DATA_PTR: usize = 0x0C; // u32
    pub const EVENT_PTR: usize = 0x24; // u32
    pub const MAGIC1: usize = 0x40; // u16, 0x0000
    pub const MAGIC2: usize = 0x42; // u16, 0x4240
    pub const MAGIC3: usize = 0x44; // u16, 0x000F
    pub const DEVICE_SERIAL: usize = 0x46; // u32, 21115
    pub const DEVICE_TYPE: usize = 0x4A; // 8s, "ADL"
    pub const DEVICE_VERSION: usize = 0x52; // u16, 560
    pub const MAGIC4: usize = 0x54; // u16, 0x0080
    pub const NUM_CHANNELS: usize = 0x56; // u16
    pub const NUM_CHANNELS2: usize = 0x58; // u16
    pub const MAGIC5: usize = 0x5A; // u32, 0x00050014
    pub const DATE: usize = 0x5E; // 32s
    pub const TIME: usize = 0x7E; // 32s
    pub const DRIVER: usize = 0x9E; // 64s
    pub const VEHICLE_ID: usize = 0xDE; // 64s
    pub const ENGINE_ID: usize = 0x11E; // 64s
    pub const VENUE: usize = 0x15E; // 64s
    pub const MAGIC6: usize = 0x5DE; // u32, 0x02B09201
    pub const SESSION: usize = 0x5E4; // 64s
    pub const SHORT_COMMENT: usize = 0x624; // 64s
    pub const MAGIC7: usize = 0x66C; // u16, 0x0045
    pub const TEAM: usize = 0x694; // 32s
}

/// Event record field offsets.
pub(crate) mod evt {
    pub const EVENT: usize = 0x00; // 64s
    pub const SESSION: usize = 0x40; // 64s
    pub const LONG_COMMENT: usize = 0x80; // 1024s
    pub const VENUE_PTR: usize = 0x480; // u32
    pub const WEATHER_PTR: usize = 0x484; // u32
}

/// Venue record field offsets.
pub(crate) mod ven {
    pub const VENUE: usize = 0x00; // 64s
    pub const VENUE_LENGTH: usize = 0x42; // u32, mm
    pub const VEHICLE_PTR: usize = 0x44A; // u32
    pub const VENUE_CATEGORY: usize = 0x44E; // 32s
}

/// Vehicle record field offsets.
pub(crate) mod veh {
    pub const VEHICLE_ID: usize = 0x00; // 64s
    pub const VEHICLE_DESC: usize = 0x40; // 64s
    pub const ENGINE_ID: usize = 0x80; // 64s
    pub const VEHICLE_WEIGHT: usize = 0xC0; // u16, kg
    pub const FUEL_TANK: usize = 0xC2; // u16, dL
    pub const VEHICLE_TYPE: usize = 0xC4; // 32s
    pub const DRIVER_TYPE: usize = 0xE4; // 32s
    pub const DIFF_RATIO: usize = 0x104; // u16
    pub const GEAR1: usize = 0x106; // u16 x 10
    pub const VEHICLE_TRACK: usize = 0x11A; // u16, mm
    pub const VEHICLE_WHEELBASE: usize = 0x11C; // u32, mm
    pub const VEHICLE_COMMENT: usize = 0x120; // 1024s
    pub const VEHICLE_NUMBER: usize = 0x524; // 32s
}

/// Weather record field offsets.
pub(crate) mod wx {
    pub const SKY: usize = 0x00; // 64s
    pub const AIR_TEMP: usize = 0x40; // 16s
    pub const AIR_TEMP_UNIT: usize = 0x50; // 8s
    pub const TRACK_TEMP: usize = 0x58; // 16s
    pub const TRACK_TEMP_UNIT: usize = 0x68; // 8s
    pub const PRESSURE: usize = 0x70; // 16s
    pub const PRESSURE_UNIT: usize = 0x80; // 8s
    pub const HUMIDITY: usize = 0x88; // 16s
    pub const HUMIDITY_UNIT: usize = 0x98; // 8s
    pub const WIND_SPEED: usize = 0xA0; // 16s
    pub const WIND_SPEED_UNIT: usize = 0xB0; // 8s
    pub const WIND_DIRECTION: usize = 0xB8; // 64s
    pub const WEATHER_COMMENT: usize = 0xF8; // 1024s
}

/// Channel metadata field offsets, relative to the entry.
pub(crate) mod cm {
    pub const PREV_PTR: usize = 0x00; // u32
    pub const NEXT_PTR: usize = 0x04; // u32
    pub const DATA_PTR: usize = 0x08; // u32
    pub const SAMPLE_COUNT: usize = 0x0C; // u32
    pub const MAGIC: usize = 0x10; // u32
    pub const SIZE: usize = 0x14; // u16, bytes per sample
    pub const SAMPLE_RATE: usize = 0x16; // u16, Hz
    pub const OFFSET: usize = 0x18; // i16
    pub const SCALAR: usize = 0x1A; // i16
    pub const DIVISOR: usize = 0x1C; // i16
    pub const SHIFT: usize = 0x1E; // i16
    pub const NAME: usize = 0x20; // 32s
    pub const SHORT_NAME: usize = 0x40; // 8s
    pub const UNIT: usize = 0x48; // 12s
}

/// Header string fields. The device identity constants are fixed by the
/// format and written unconditionally.
#[derive(Debug, Clone)]
pub struct Header {
    pub date: String,
    pub time: String,
    pub driver: String,
    pub vehicle_id: String,
    pub engine_id: String,
    pub venue: String,
    pub session: String,
    pub short_comment: String,
    pub team: String,
}

impl Default for Header {
    fn default() -> Header {
        Header {
            date: String::new(),
            time: String::new(),
            driver: "Driver".into(),
            vehicle_id: "VehicleID".into(),
            engine_id: "EngineID".into(),
            venue: "Venue".into(),
            session: "Session".into(),
            short_comment: "ShortComment".into(),
            team: "Team".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event: String,
    pub session: String,
    pub long_comment: String,
}

impl Default for Event {
    fn default() -> Event {
        Event {
            event: "Event".into(),
            session: "Session".into(),
            long_comment: "LongComment".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Venue {
    pub venue: String,
    /// Track length, mm.
    pub venue_length: u32,
    pub venue_category: String,
}

impl Default for Venue {
    fn default() -> Venue {
        Venue {
            venue: "Venue".into(),
            venue_length: 420_000,
            venue_category: "Category".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Vehicle {
    pub vehicle_id: String,
    pub vehicle_desc: String,
    pub engine_id: String,
    /// kg.
    pub vehicle_weight: u16,
    /// Deciliters.
    pub fuel_tank: u16,
    pub vehicle_type: String,
    pub driver_type: String,
    pub diff_ratio: u16,
    pub gears: [u16; 10],
    /// mm.
    pub vehicle_track: u16,
    /// mm.
    pub vehicle_wheelbase: u32,
    pub vehicle_comment: String,
    pub vehicle_number: String,
}

impl Default for Vehicle {
    fn default() -> Vehicle {
        Vehicle {
            vehicle_id: "VehicleID".into(),
            vehicle_desc: "VehicleDescription".into(),
            engine_id: "EngineID".into(),
            vehicle_weight: 100,
            fuel_tank: 2000,
            vehicle_type: "VehicleType".into(),
            driver_type: "DriveType".into(),
            diff_ratio: 41248,
            gears: [1000, 2000, 3000, 4000, 5000, 6000, 7000, 8000, 9000, 10000],
            vehicle_track: 300,
            vehicle_wheelbase: 400,
            vehicle_comment: "VehicleComment".into(),
            vehicle_number: "VehicleNumber".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Weather {
    pub sky: String,
    pub air_temp: String,
    pub air_temp_unit: String,
    pub track_temp: String,
    pub track_temp_unit: String,
    pub pressure: String,
    pub pressure_unit: String,
    pub humidity: String,
    pub humidity_unit: String,
    pub wind_speed: String,
    pub wind_speed_unit: String,
    pub wind_direction: String,
    pub weather_comment: String,
}

impl Default for Weather {
    fn default() -> Weather {
        Weather {
            sky: "Sunny".into(),
            air_temp: "200".into(),
            air_temp_unit: "C".into(),
            track_temp: "100".into(),
            track_temp_unit: "C".into(),
            pressure: "3".into(),
            pressure_unit: "bar".into(),
            humidity: "40".into(),
            humidity_unit: "%".into(),
            wind_speed: "50".into(),
            wind_speed_unit: "km/h".into(),
            wind_direction: "WindDirection".into(),
            weather_comment: "WeatherComment".into(),
        }
    }
}

/// Session metadata for the five fixed regions. The non-channel content
/// of these regions is vendor placeholder material; only the date/time
/// pair is derived from the recording.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub header: Header,
    pub event: Event,
    pub venue: Venue,
    pub vehicle: Vehicle,
    pub weather: Weather,
}

impl Metadata {
    /// Placeholder metadata stamped with the session start time.
    pub fn with_t0(t0: DateTime<Utc>) -> Metadata {
        let mut metadata = Metadata::default();
        metadata.header.date = t0.format("%d/%m/%Y").to_string();
        metadata.header.time = t0.format("%H:%M:%S").to_string();
        metadata
    }
}

/// One channel metadata entry, as stored in the file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMeta {
    pub prev_ptr: u32,
    pub next_ptr: u32,
    pub data_ptr: u32,
    pub sample_count: u32,
    /// Bytes per sample: 4 in files written here, 2 in older files.
    pub size: u16,
    /// Hz.
    pub sample_rate: u16,
    pub scaling: Scaling,
    pub name: String,
    pub short_name: String,
    pub unit: String,
}

pub(crate) fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    LE::write_u16(&mut buf[at..at + 2], value);
}

pub(crate) fn put_i16(buf: &mut [u8], at: usize, value: i16) {
    LE::write_i16(&mut buf[at..at + 2], value);
}

pub(crate) fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    LE::write_u32(&mut buf[at..at + 4], value);
}

pub(crate) fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    LE::write_u64(&mut buf[at..at + 8], value);
}

/// Places a NUL-padded string field, truncating at `width` bytes. The
/// destination buffer is pre-zeroed, so only the content bytes move.
pub(crate) fn put_str(buf: &mut [u8], at: usize, width: usize, value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    buf[at..at + n].copy_from_slice(&bytes[..n]);
}

pub(crate) fn get_u16(buf: &[u8], at: usize) -> u16 {
    LE::read_u16(&buf[at..at + 2])
}

pub(crate) fn get_i16(buf: &[u8], at: usize) -> i16 {
    LE::read_i16(&buf[at..at + 2])
}

pub(crate) fn get_u32(buf: &[u8], at: usize) -> u32 {
    LE::read_u32(&buf[at..at + 4])
}

pub(crate) fn get_u64(buf: &[u8], at: usize) -> u64 {
    LE::read_u64(&buf[at..at + 8])
}

/// Reads a fixed-width string field: up to the first NUL, lossily decoded
/// and trimmed.
pub(crate) fn get_str(buf: &[u8], at: usize, width: usize) -> String {
    let field = &buf[at..at + width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn region_sizes_add_up() {
        // the first channel meta entry of every reference log sits at
        // 0x3448
        assert_eq!(
            HEADER_SIZE + EVENT_SIZE + VENUE_SIZE + VEHICLE_SIZE + WEATHER_SIZE,
            0x3448
        );
    }

    #[test]
    fn string_fields_are_nul_padded_and_truncated() {
        let mut buf = [0u8; 8];
        put_str(&mut buf, 0, 8, "OK");
        assert_eq!(buf, [b'O', b'K', 0, 0, 0, 0, 0, 0]);
        assert_eq!(get_str(&buf, 0, 8), "OK");

        let mut buf = [0u8; 8];
        put_str(&mut buf, 0, 8, "test123456");
        assert_eq!(&buf, b"test1234");
    }

    #[test]
    fn metadata_stamps_session_start() {
        let t0 = Utc.with_ymd_and_hms(2023, 9, 9, 13, 30, 0).unwrap();
        let metadata = Metadata::with_t0(t0);
        assert_eq!(metadata.header.date, "09/09/2023");
        assert_eq!(metadata.header.time, "13:30:00");
    }
}
