//! Reading LD files.
//!
//! The format carries no checksum; the reader relies on pointer sanity.
//! A corrupt header is fatal, but corruption discovered while walking the
//! channel list degrades to a partial result: channels recovered so far
//! are returned and a warning names what was skipped.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{ReadBytesExt, LE};
use tracing::warn;

use super::{cm, evt, hdr, veh, ven, wx};
use super::{
    get_i16, get_str, get_u16, get_u32, get_u64, ChannelMeta, Event, Header, Metadata, Vehicle,
    Venue, Weather, CH_MAGIC_I16, CH_MAGIC_I32, CH_META_SIZE, EVENT_SIZE, HEADER_SIZE, SOF,
    VEHICLE_SIZE, VENUE_SIZE, WEATHER_SIZE,
};
use crate::scale::Scaling;

/// The file does not look like an LD log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("bad start-of-file marker {found:#x} (expected {:#x})", SOF)]
    BadSof { found: u64 },
    #[error("{region} region at {at:#x}+{size:#x} runs past the end of the file ({len:#x})")]
    OutOfBounds {
        region: &'static str,
        at: u64,
        size: usize,
        len: u64,
    },
}

/// Errors surfaced while reading an LD file.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed LD file: {0}")]
    Format(#[from] FormatError),
}

/// One channel recovered from a file: its metadata entry and the decoded
/// physical values.
#[derive(Debug, Clone)]
pub struct LdChannel {
    pub meta: ChannelMeta,
    pub values: Vec<f64>,
}

/// Everything recovered from an LD file.
#[derive(Debug, Clone)]
pub struct LdFile {
    pub device_serial: u32,
    pub device_type: String,
    pub device_version: u16,
    pub num_channels: u16,
    pub meta_ptr: u32,
    pub data_ptr: u32,
    pub metadata: Metadata,
    pub channels: Vec<LdChannel>,
}

/// Reads and validates an LD file.
pub fn read<R: Read + Seek>(source: &mut R) -> Result<LdFile, ReadError> {
    let len = source.seek(SeekFrom::End(0))?;

    let buf = region(source, len, 0, HEADER_SIZE, "header")??;
    let sof = get_u64(&buf, hdr::SOF);
    if sof != SOF {
        return Err(FormatError::BadSof { found: sof }.into());
    }

    let meta_ptr = get_u32(&buf, hdr::META_PTR);
    let data_ptr = get_u32(&buf, hdr::DATA_PTR);
    let event_ptr = get_u32(&buf, hdr::EVENT_PTR);
    let num_channels = get_u16(&buf, hdr::NUM_CHANNELS);

    let mut file = LdFile {
        device_serial: get_u32(&buf, hdr::DEVICE_SERIAL),
        device_type: get_str(&buf, hdr::DEVICE_TYPE, 8),
        device_version: get_u16(&buf, hdr::DEVICE_VERSION),
        num_channels,
        meta_ptr,
        data_ptr,
        metadata: Metadata {
            header: Header {
                date: get_str(&buf, hdr::DATE, 32),
                time: get_str(&buf, hdr::TIME, 32),
                driver: get_str(&buf, hdr::DRIVER, 64),
                vehicle_id: get_str(&buf, hdr::VEHICLE_ID, 64),
                engine_id: get_str(&buf, hdr::ENGINE_ID, 64),
                venue: get_str(&buf, hdr::VENUE, 64),
                session: get_str(&buf, hdr::SESSION, 64),
                short_comment: get_str(&buf, hdr::SHORT_COMMENT, 64),
                team: get_str(&buf, hdr::TEAM, 32),
            },
            ..Metadata::default()
        },
        channels: Vec::new(),
    };

    // the pointer chain to the other fixed regions
    let mut venue_ptr = 0;
    let mut weather_ptr = 0;
    if event_ptr == 0 {
        warn!("event_ptr missing");
    } else {
        let buf = region(source, len, event_ptr as u64, EVENT_SIZE, "event")??;
        file.metadata.event = Event {
            event: get_str(&buf, evt::EVENT, 64),
            session: get_str(&buf, evt::SESSION, 64),
            long_comment: get_str(&buf, evt::LONG_COMMENT, 1024),
        };
        venue_ptr = get_u32(&buf, evt::VENUE_PTR);
        weather_ptr = get_u32(&buf, evt::WEATHER_PTR);
    }

    let mut vehicle_ptr = 0;
    if venue_ptr == 0 {
        warn!("venue_ptr missing");
    } else {
        let buf = region(source, len, venue_ptr as u64, VENUE_SIZE, "venue")??;
        file.metadata.venue = Venue {
            venue: get_str(&buf, ven::VENUE, 64),
            venue_length: get_u32(&buf, ven::VENUE_LENGTH),
            venue_category: get_str(&buf, ven::VENUE_CATEGORY, 32),
        };
        vehicle_ptr = get_u32(&buf, ven::VEHICLE_PTR);
    }

    if vehicle_ptr == 0 {
        warn!("vehicle_ptr missing");
    } else {
        let buf = region(source, len, vehicle_ptr as u64, VEHICLE_SIZE, "vehicle")??;
        let mut gears = [0u16; 10];
        for (i, gear) in gears.iter_mut().enumerate() {
            *gear = get_u16(&buf, veh::GEAR1 + 2 * i);
        }
        file.metadata.vehicle = Vehicle {
            vehicle_id: get_str(&buf, veh::VEHICLE_ID, 64),
            vehicle_desc: get_str(&buf, veh::VEHICLE_DESC, 64),
            engine_id: get_str(&buf, veh::ENGINE_ID, 64),
            vehicle_weight: get_u16(&buf, veh::VEHICLE_WEIGHT),
            fuel_tank: get_u16(&buf, veh::FUEL_TANK),
            vehicle_type: get_str(&buf, veh::VEHICLE_TYPE, 32),
            driver_type: get_str(&buf, veh::DRIVER_TYPE, 32),
            diff_ratio: get_u16(&buf, veh::DIFF_RATIO),
            gears,
            vehicle_track: get_u16(&buf, veh::VEHICLE_TRACK),
            vehicle_wheelbase: get_u32(&buf, veh::VEHICLE_WHEELBASE),
            vehicle_comment: get_str(&buf, veh::VEHICLE_COMMENT, 1024),
            vehicle_number: get_str(&buf, veh::VEHICLE_NUMBER, 32),
        };
    }

    if weather_ptr == 0 {
        warn!("weather_ptr missing");
    } else {
        let buf = region(source, len, weather_ptr as u64, WEATHER_SIZE, "weather")??;
        file.metadata.weather = Weather {
            sky: get_str(&buf, wx::SKY, 64),
            air_temp: get_str(&buf, wx::AIR_TEMP, 16),
            air_temp_unit: get_str(&buf, wx::AIR_TEMP_UNIT, 8),
            track_temp: get_str(&buf, wx::TRACK_TEMP, 16),
            track_temp_unit: get_str(&buf, wx::TRACK_TEMP_UNIT, 8),
            pressure: get_str(&buf, wx::PRESSURE, 16),
            pressure_unit: get_str(&buf, wx::PRESSURE_UNIT, 8),
            humidity: get_str(&buf, wx::HUMIDITY, 16),
            humidity_unit: get_str(&buf, wx::HUMIDITY_UNIT, 8),
            wind_speed: get_str(&buf, wx::WIND_SPEED, 16),
            wind_speed_unit: get_str(&buf, wx::WIND_SPEED_UNIT, 8),
            wind_direction: get_str(&buf, wx::WIND_DIRECTION, 64),
            weather_comment: get_str(&buf, wx::WEATHER_COMMENT, 1024),
        };
    }

    walk_channels(source, len, meta_ptr, &mut file)?;

    if file.channels.len() != num_channels as usize {
        warn!(
            "num_channels ({}) does not match number of channels found ({})",
            num_channels,
            file.channels.len()
        );
    }
    Ok(file)
}

/// Follows the channel metadata linked list from `meta_ptr` until a zero
/// `next_ptr`. Corruption inside the walk ends it with a warning rather
/// than an error.
fn walk_channels<R: Read + Seek>(
    source: &mut R,
    len: u64,
    meta_ptr: u32,
    file: &mut LdFile,
) -> Result<(), ReadError> {
    if meta_ptr == 0 {
        warn!("meta_ptr missing");
        return Ok(());
    }

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut visited: HashSet<u32> = HashSet::new();
    let mut next = meta_ptr;
    while next != 0 {
        if !visited.insert(next) {
            warn!("channel list loops back to {:#x}; stopping", next);
            break;
        }
        let buf = match region(source, len, next as u64, CH_META_SIZE, "channel meta")? {
            Ok(buf) => buf,
            Err(e) => {
                warn!("{}; stopping channel walk", e);
                break;
            }
        };

        let magic = get_u32(&buf, cm::MAGIC);
        if magic != CH_MAGIC_I32 && magic != CH_MAGIC_I16 {
            warn!("channel entry at {:#x} has unknown magic {:#010x}", next, magic);
        }

        let meta = ChannelMeta {
            prev_ptr: get_u32(&buf, cm::PREV_PTR),
            next_ptr: get_u32(&buf, cm::NEXT_PTR),
            data_ptr: get_u32(&buf, cm::DATA_PTR),
            sample_count: get_u32(&buf, cm::SAMPLE_COUNT),
            size: get_u16(&buf, cm::SIZE),
            sample_rate: get_u16(&buf, cm::SAMPLE_RATE),
            scaling: Scaling {
                offset: get_i16(&buf, cm::OFFSET),
                scalar: get_i16(&buf, cm::SCALAR) as u16,
                divisor: get_i16(&buf, cm::DIVISOR) as u16,
                shift: get_i16(&buf, cm::SHIFT) as i8,
            },
            name: get_str(&buf, cm::NAME, 32),
            short_name: get_str(&buf, cm::SHORT_NAME, 8),
            unit: get_str(&buf, cm::UNIT, 12),
        };
        next = meta.next_ptr;

        if !seen_names.insert(meta.name.clone()) {
            warn!("found duplicate channel name: {:?}", meta.name);
            continue;
        }
        match channel_values(source, len, &meta)? {
            Some(values) => file.channels.push(LdChannel { meta, values }),
            None => continue,
        }
    }
    Ok(())
}

/// Reads and decodes one channel's sample block. `None` (with a warning)
/// when the entry cannot be honoured.
fn channel_values<R: Read + Seek>(
    source: &mut R,
    len: u64,
    meta: &ChannelMeta,
) -> Result<Option<Vec<f64>>, ReadError> {
    if meta.size != 2 && meta.size != 4 {
        warn!("{:?} has unknown data size ({})", meta.name, meta.size);
        return Ok(None);
    }
    if meta.scaling.divisor == 0 {
        warn!("{:?} has a zero divisor", meta.name);
        return Ok(None);
    }
    let block = meta.sample_count as usize * meta.size as usize;
    if let Err(e) = bounds(len, meta.data_ptr as u64, block, "channel data") {
        warn!("{:?}: {}", meta.name, e);
        return Ok(None);
    }

    source.seek(SeekFrom::Start(meta.data_ptr as u64))?;
    let mut values = Vec::with_capacity(meta.sample_count as usize);
    for _ in 0..meta.sample_count {
        let encoded = match meta.size {
            2 => source.read_i16::<LE>()? as i32,
            _ => source.read_i32::<LE>()?,
        };
        values.push(meta.scaling.decode(encoded));
    }
    Ok(Some(values))
}

fn bounds(len: u64, at: u64, size: usize, region: &'static str) -> Result<(), FormatError> {
    if at + size as u64 > len {
        return Err(FormatError::OutOfBounds {
            region,
            at,
            size,
            len,
        });
    }
    Ok(())
}

/// Reads `size` bytes at `at`. The outer error is I/O, the inner a bounds
/// failure, so callers can degrade gracefully on the latter.
fn region<R: Read + Seek>(
    source: &mut R,
    len: u64,
    at: u64,
    size: usize,
    name: &'static str,
) -> Result<Result<Vec<u8>, FormatError>, std::io::Error> {
    if let Err(e) = bounds(len, at, size, name) {
        return Ok(Err(e));
    }
    source.seek(SeekFrom::Start(at))?;
    let mut buf = vec![0u8; size];
    source.read_exact(&mut buf)?;
    Ok(Ok(buf))
}
