//! End-to-end conversion: a synthetic GDAT session through the pipeline
//! into LD bytes and back out through the reader.

use std::io::Cursor;

use byteorder::{ByteOrder, LE};
use gdat::frame::encode_packet;
use gdat::schema::NetworkConfig;
use gdat::{ld, Pipeline, Schema};

const CONFIG: &str = r#"
parameters:
  engine_rpm:
    id: 1
    type: UNSIGNED16
    motec_name: Engine RPM
    unit: rpm
  oil_pressure:
    id: 2
    type: FLOATING
    motec_name: Oil Pressure
    unit: kPa
"#;

fn schema() -> Schema {
    let config: NetworkConfig = serde_norway::from_str(CONFIG).unwrap();
    Schema::from_config(&config)
}

fn rpm_at(t: u32) -> u16 {
    3000 + (t / 10 % 800) as u16
}

fn pressure_at(t: u32) -> f32 {
    t as f32 * 0.5 - 10.0
}

/// 51 raw points per channel at a 10 ms cadence, so both channels resample
/// to 50 samples at 100 Hz. One corrupt packet is spliced into the middle.
fn session_image() -> Vec<u8> {
    let mut image = b"/PLM_2023-09-09-13-30-00.gdat:".to_vec();
    for i in 0..=50u32 {
        let t = i * 10;
        image.extend_from_slice(&encode_packet(t, 1, &rpm_at(t).to_be_bytes()));
        image.extend_from_slice(&encode_packet(t, 2, &pressure_at(t).to_be_bytes()));
        if i == 25 {
            let mut bad = encode_packet(t, 1, &rpm_at(t).to_be_bytes());
            let at = bad.len() - 1;
            bad[at] ^= 0x01; // break the checksum
            image.extend_from_slice(&bad);
        }
    }
    image
}

fn convert_to_ld() -> Vec<u8> {
    let mut pipeline = Pipeline::new(schema());
    pipeline.load(&session_image());

    let converted = pipeline.finish();
    assert_eq!(converted.stats.packets, 102);
    assert_eq!(converted.stats.errors, 1);
    assert_eq!(converted.channels.len(), 2);

    let mut bytes = Vec::new();
    ld::write(
        &mut bytes,
        &ld::Metadata::with_t0(converted.t0),
        &converted.channels,
    )
    .unwrap();
    bytes
}

#[test]
fn round_trip_preserves_channels_within_the_error_budget() {
    let bytes = convert_to_ld();
    let file = ld::read(&mut Cursor::new(&bytes)).unwrap();

    assert_eq!(file.num_channels, 2);
    assert_eq!(file.channels.len(), 2);
    assert_eq!(file.metadata.header.date, "09/09/2023");
    assert_eq!(file.metadata.header.time, "13:30:00");

    let rpm = &file.channels[0];
    assert_eq!(rpm.meta.name, "Engine RPM");
    assert_eq!(rpm.meta.unit, "rpm");
    assert_eq!(rpm.meta.sample_rate, 100);
    assert_eq!(rpm.meta.sample_count, 50);
    assert_eq!(rpm.meta.size, 4);

    let pressure = &file.channels[1];
    assert_eq!(pressure.meta.name, "Oil Pressure");
    assert_eq!(pressure.meta.unit, "kPa");
    assert_eq!(pressure.meta.sample_rate, 100);
    assert_eq!(pressure.meta.sample_count, 50);

    // each uniform tick coincides with a raw sample, so the decoded value
    // must sit within the encoding error budget of the raw one
    for (i, &value) in rpm.values.iter().enumerate() {
        let expected = rpm_at(i as u32 * 10) as f64;
        let err = (value - expected).abs() / expected.abs().max(1e-9);
        assert!(err <= 0.10, "rpm tick {}: {} vs {}", i, value, expected);
    }
    for (i, &value) in pressure.values.iter().enumerate() {
        let expected = pressure_at(i as u32 * 10) as f64;
        let err = (value - expected).abs() / expected.abs().max(1e-9);
        assert!(
            err <= 0.10,
            "pressure tick {}: {} vs {}",
            i,
            value,
            expected
        );
    }
}

#[test]
fn every_file_pointer_resolves_in_bounds() {
    let bytes = convert_to_ld();
    let len = bytes.len() as u32;
    let u32_at = |at: usize| LE::read_u32(&bytes[at..at + 4]);

    // header: meta/data/event pointers
    let meta_ptr = u32_at(0x08);
    let data_ptr = u32_at(0x0C);
    let event_ptr = u32_at(0x24);
    assert_eq!(event_ptr, 0x6E2);
    assert_eq!(meta_ptr, 0x3448);
    assert!(meta_ptr < data_ptr && data_ptr <= len);

    // event -> venue/weather, venue -> vehicle
    let venue_ptr = u32_at(event_ptr as usize + 0x480);
    let weather_ptr = u32_at(event_ptr as usize + 0x484);
    assert_eq!(venue_ptr, 0x1336);
    assert_eq!(weather_ptr, 0x2C48);
    let vehicle_ptr = u32_at(venue_ptr as usize + 0x44A);
    assert_eq!(vehicle_ptr, 0x1F54);

    // channel list: prev/next/data pointers all land inside the file
    let mut at = meta_ptr;
    let mut prev = 0u32;
    let mut walked = 0;
    while at != 0 {
        assert!(at + 0x7C <= len);
        assert_eq!(u32_at(at as usize), prev, "prev_ptr of entry {}", walked);

        let ch_data = u32_at(at as usize + 0x08);
        let count = u32_at(at as usize + 0x0C);
        assert!(ch_data >= data_ptr);
        assert!(ch_data + count * 4 <= len);

        prev = at;
        at = u32_at(at as usize + 0x04);
        walked += 1;
    }
    assert_eq!(walked, 2);

    // the data region is packed back to back up to the end of the file
    assert_eq!(data_ptr + 2 * 50 * 4, len);
}

#[test]
fn conversion_is_insensitive_to_transport_chunking() {
    use gdat::{FrameDecoder, Record};
    use std::sync::Arc;

    let image = session_image();
    let (_, data) = gdat::frame::split_preamble(&image);
    let schema = Arc::new(schema());

    let mut whole = FrameDecoder::new(schema.clone());
    whole.push(data);
    whole.finish();
    let from_whole: Vec<Record> = std::iter::from_fn(|| whole.pull()).collect();

    for chunk_size in [1, 2, 3, 7, 64, 999] {
        let mut chunked = FrameDecoder::new(schema.clone());
        for chunk in data.chunks(chunk_size) {
            chunked.push(chunk);
        }
        chunked.finish();
        let records: Vec<Record> = std::iter::from_fn(|| chunked.pull()).collect();
        assert_eq!(records, from_whole, "chunk size {}", chunk_size);
    }
}
