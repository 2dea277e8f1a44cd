//! Writing LD files.
//!
//! All region offsets are computable up front from the channel count and
//! sample counts, so the file is produced in one sequential pass: the
//! five fixed regions, the channel metadata array (with its pointer chain
//! precomputed), then each channel's packed samples.

use std::io::{self, Write};

use byteorder::{WriteBytesExt, LE};

use super::{cm, evt, hdr, veh, ven, wx};
use super::{
    put_i16, put_str, put_u16, put_u32, put_u64, Metadata, CH_MAGIC_I32, CH_META_SIZE, EVENT_SIZE,
    HEADER_SIZE, SOF, VEHICLE_SIZE, VENUE_SIZE, WEATHER_SIZE,
};
use crate::channel::EncodedChannel;

/// Bytes per sample in files produced here.
const SAMPLE_SIZE: usize = 4;

/// Writes a complete LD file from finalised channels and session
/// metadata.
pub fn write<W: Write>(
    sink: &mut W,
    metadata: &Metadata,
    channels: &[EncodedChannel],
) -> io::Result<()> {
    let meta_offset = HEADER_SIZE + EVENT_SIZE + VENUE_SIZE + VEHICLE_SIZE + WEATHER_SIZE;
    let data_offset = meta_offset + channels.len() * CH_META_SIZE;

    sink.write_all(&header_region(metadata, channels.len(), meta_offset, data_offset))?;
    sink.write_all(&event_region(metadata))?;
    sink.write_all(&venue_region(metadata))?;
    sink.write_all(&vehicle_region(metadata))?;
    sink.write_all(&weather_region(metadata))?;

    let mut data_at = data_offset;
    for (i, channel) in channels.iter().enumerate() {
        let prev_ptr = match i {
            0 => 0,
            _ => meta_offset + CH_META_SIZE * (i - 1),
        };
        let next_ptr = if i + 1 == channels.len() {
            0
        } else {
            meta_offset + CH_META_SIZE * (i + 1)
        };
        sink.write_all(&meta_entry(channel, prev_ptr, next_ptr, data_at))?;
        data_at += channel.samples.len() * SAMPLE_SIZE;
    }

    for channel in channels {
        for &sample in &channel.samples {
            sink.write_i32::<LE>(sample)?;
        }
    }
    Ok(())
}

fn header_region(
    metadata: &Metadata,
    num_channels: usize,
    meta_offset: usize,
    data_offset: usize,
) -> Vec<u8> {
    let header = &metadata.header;
    let mut buf = vec![0u8; HEADER_SIZE];
    put_u64(&mut buf, hdr::SOF, SOF);
    put_u32(&mut buf, hdr::META_PTR, meta_offset as u32);
    put_u32(&mut buf, hdr::DATA_PTR, data_offset as u32);
    put_u32(&mut buf, hdr::EVENT_PTR, HEADER_SIZE as u32);
    put_u16(&mut buf, hdr::MAGIC1, 0x0000);
    put_u16(&mut buf, hdr::MAGIC2, 0x4240);
    put_u16(&mut buf, hdr::MAGIC3, 0x000F);
    put_u32(&mut buf, hdr::DEVICE_SERIAL, 21115);
    put_str(&mut buf, hdr::DEVICE_TYPE, 8, "ADL");
    put_u16(&mut buf, hdr::DEVICE_VERSION, 560);
    put_u16(&mut buf, hdr::MAGIC4, 0x0080);
    put_u16(&mut buf, hdr::NUM_CHANNELS, num_channels as u16);
    put_u16(&mut buf, hdr::NUM_CHANNELS2, num_channels as u16);
    put_u32(&mut buf, hdr::MAGIC5, 0x0005_0014);
    put_str(&mut buf, hdr::DATE, 32, &header.date);
    put_str(&mut buf, hdr::TIME, 32, &header.time);
    put_str(&mut buf, hdr::DRIVER, 64, &header.driver);
    put_str(&mut buf, hdr::VEHICLE_ID, 64, &header.vehicle_id);
    put_str(&mut buf, hdr::ENGINE_ID, 64, &header.engine_id);
    put_str(&mut buf, hdr::VENUE, 64, &header.venue);
    put_u32(&mut buf, hdr::MAGIC6, 0x02B0_9201);
    put_str(&mut buf, hdr::SESSION, 64, &header.session);
    put_str(&mut buf, hdr::SHORT_COMMENT, 64, &header.short_comment);
    put_u16(&mut buf, hdr::MAGIC7, 0x0045);
    put_str(&mut buf, hdr::TEAM, 32, &header.team);
    buf
}

fn event_region(metadata: &Metadata) -> Vec<u8> {
    let event = &metadata.event;
    let mut buf = vec![0u8; EVENT_SIZE];
    put_str(&mut buf, evt::EVENT, 64, &event.event);
    put_str(&mut buf, evt::SESSION, 64, &event.session);
    put_str(&mut buf, evt::LONG_COMMENT, 1024, &event.long_comment);
    put_u32(&mut buf, evt::VENUE_PTR, (HEADER_SIZE + EVENT_SIZE) as u32);
    put_u32(
        &mut buf,
        evt::WEATHER_PTR,
        (HEADER_SIZE + EVENT_SIZE + VENUE_SIZE + VEHICLE_SIZE) as u32,
    );
    buf
}

fn venue_region(metadata: &Metadata) -> Vec<u8> {
    let venue = &metadata.venue;
    let mut buf = vec![0u8; VENUE_SIZE];
    put_str(&mut buf, ven::VENUE, 64, &venue.venue);
    put_u32(&mut buf, ven::VENUE_LENGTH, venue.venue_length);
    put_u32(
        &mut buf,
        ven::VEHICLE_PTR,
        (HEADER_SIZE + EVENT_SIZE + VENUE_SIZE) as u32,
    );
    put_str(&mut buf, ven::VENUE_CATEGORY, 32, &venue.venue_category);
    buf
}

fn vehicle_region(metadata: &Metadata) -> Vec<u8> {
    let vehicle = &metadata.vehicle;
    let mut buf = vec![0u8; VEHICLE_SIZE];
    put_str(&mut buf, veh::VEHICLE_ID, 64, &vehicle.vehicle_id);
    put_str(&mut buf, veh::VEHICLE_DESC, 64, &vehicle.vehicle_desc);
    put_str(&mut buf, veh::ENGINE_ID, 64, &vehicle.engine_id);
    put_u16(&mut buf, veh::VEHICLE_WEIGHT, vehicle.vehicle_weight);
    put_u16(&mut buf, veh::FUEL_TANK, vehicle.fuel_tank);
    put_str(&mut buf, veh::VEHICLE_TYPE, 32, &vehicle.vehicle_type);
    put_str(&mut buf, veh::DRIVER_TYPE, 32, &vehicle.driver_type);
    put_u16(&mut buf, veh::DIFF_RATIO, vehicle.diff_ratio);
    for (i, &gear) in vehicle.gears.iter().enumerate() {
        put_u16(&mut buf, veh::GEAR1 + 2 * i, gear);
    }
    put_u16(&mut buf, veh::VEHICLE_TRACK, vehicle.vehicle_track);
    put_u32(&mut buf, veh::VEHICLE_WHEELBASE, vehicle.vehicle_wheelbase);
    put_str(&mut buf, veh::VEHICLE_COMMENT, 1024, &vehicle.vehicle_comment);
    put_str(&mut buf, veh::VEHICLE_NUMBER, 32, &vehicle.vehicle_number);
    buf
}

fn weather_region(metadata: &Metadata) -> Vec<u8> {
    let weather = &metadata.weather;
    let mut buf = vec![0u8; WEATHER_SIZE];
    put_str(&mut buf, wx::SKY, 64, &weather.sky);
    put_str(&mut buf, wx::AIR_TEMP, 16, &weather.air_temp);
    put_str(&mut buf, wx::AIR_TEMP_UNIT, 8, &weather.air_temp_unit);
    put_str(&mut buf, wx::TRACK_TEMP, 16, &weather.track_temp);
    put_str(&mut buf, wx::TRACK_TEMP_UNIT, 8, &weather.track_temp_unit);
    put_str(&mut buf, wx::PRESSURE, 16, &weather.pressure);
    put_str(&mut buf, wx::PRESSURE_UNIT, 8, &weather.pressure_unit);
    put_str(&mut buf, wx::HUMIDITY, 16, &weather.humidity);
    put_str(&mut buf, wx::HUMIDITY_UNIT, 8, &weather.humidity_unit);
    put_str(&mut buf, wx::WIND_SPEED, 16, &weather.wind_speed);
    put_str(&mut buf, wx::WIND_SPEED_UNIT, 8, &weather.wind_speed_unit);
    put_str(&mut buf, wx::WIND_DIRECTION, 64, &weather.wind_direction);
    put_str(&mut buf, wx::WEATHER_COMMENT, 1024, &weather.weather_comment);
    buf
}

fn meta_entry(
    channel: &EncodedChannel,
    prev_ptr: usize,
    next_ptr: usize,
    data_ptr: usize,
) -> Vec<u8> {
    let mut buf = vec![0u8; CH_META_SIZE];
    put_u32(&mut buf, cm::PREV_PTR, prev_ptr as u32);
    put_u32(&mut buf, cm::NEXT_PTR, next_ptr as u32);
    put_u32(&mut buf, cm::DATA_PTR, data_ptr as u32);
    put_u32(&mut buf, cm::SAMPLE_COUNT, channel.samples.len() as u32);
    put_u32(&mut buf, cm::MAGIC, CH_MAGIC_I32);
    put_u16(&mut buf, cm::SIZE, SAMPLE_SIZE as u16);
    put_u16(&mut buf, cm::SAMPLE_RATE, channel.sample_rate);
    put_i16(&mut buf, cm::OFFSET, channel.scaling.offset);
    put_i16(&mut buf, cm::SCALAR, channel.scaling.scalar as i16);
    put_i16(&mut buf, cm::DIVISOR, channel.scaling.divisor as i16);
    put_i16(&mut buf, cm::SHIFT, channel.scaling.shift as i16);
    put_str(&mut buf, cm::NAME, 32, &channel.name);
    // short_name is left empty, as the reference logger does
    put_str(&mut buf, cm::UNIT, 12, &channel.unit);
    buf
}
