use std::fs::{self, File};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use gdat::chrono::{DateTime, Utc};
use gdat::{frame, ld, resample, scale, Channel, ChannelStore, FrameDecoder, Pipeline, Schema};
use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Convert GDAT telemetry logs into MoTeC-compatible LD files, and inspect the results."
)]
enum Opt {
    /// Convert a .gdat log into an .ld file.
    Convert {
        #[structopt(name = "CONFIG", parse(from_os_str), help = "Network configuration (.yaml).")]
        config: PathBuf,

        #[structopt(name = "INPUT", parse(from_os_str), help = "Recorded session (.gdat).")]
        input: PathBuf,

        #[structopt(
            name = "OUTPUT",
            parse(from_os_str),
            help = "Output path; defaults to the input with an .ld extension."
        )]
        output: Option<PathBuf>,

        #[structopt(long, help = "Overwrite the output file if it exists.")]
        force: bool,
    },

    /// Print per-channel diagnostics for a .gdat log without converting
    /// it.
    Info {
        #[structopt(name = "CONFIG", parse(from_os_str), help = "Network configuration (.yaml).")]
        config: PathBuf,

        #[structopt(name = "INPUT", parse(from_os_str), help = "Recorded session (.gdat).")]
        input: PathBuf,
    },

    /// Print the recorded datapoints nearest a timestamp on one channel
    /// of a .gdat log.
    Query {
        #[structopt(name = "CONFIG", parse(from_os_str), help = "Network configuration (.yaml).")]
        config: PathBuf,

        #[structopt(name = "INPUT", parse(from_os_str), help = "Recorded session (.gdat).")]
        input: PathBuf,

        #[structopt(name = "ID", help = "Parameter id of the channel.")]
        id: u16,

        #[structopt(name = "SECONDS", help = "Session time to look up, in seconds.")]
        time: f64,
    },

    /// Print the metadata and channel table of an .ld file.
    Inspect {
        #[structopt(name = "FILE", parse(from_os_str))]
        file: PathBuf,
    },
}

// Conversion exit codes, also relied on by wrapper scripts.
const EXIT_BAD_SCHEMA: i32 = 1;
const EXIT_BAD_INPUT: i32 = 2;
const EXIT_REFUSE_OVERWRITE: i32 = 3;
const EXIT_NO_CHANNELS: i32 = 4;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let code = match Opt::from_args() {
        Opt::Convert {
            config,
            input,
            output,
            force,
        } => convert(&config, &input, output, force),
        Opt::Info { config, input } => info_gdat(&config, &input),
        Opt::Query {
            config,
            input,
            id,
            time,
        } => query(&config, &input, id, time),
        Opt::Inspect { file } => match inspect(&file) {
            Ok(()) => 0,
            Err(e) => {
                error!("{:#}", e);
                1
            }
        },
    };
    process::exit(code);
}

fn convert(config: &PathBuf, input: &PathBuf, output: Option<PathBuf>, force: bool) -> i32 {
    let schema = match Schema::load(config) {
        Ok(schema) => schema,
        Err(e) => {
            error!("failed to load {:?}: {}", config, e);
            return EXIT_BAD_SCHEMA;
        }
    };
    info!("loaded {} parameters from {:?}", schema.len(), config);

    if input.extension().and_then(|ext| ext.to_str()) != Some("gdat") {
        error!("expected a path to a .gdat file, got {:?}", input);
        return EXIT_BAD_INPUT;
    }
    let image = match fs::read(input) {
        Ok(image) => image,
        Err(e) => {
            error!("failed to read {:?}: {}", input, e);
            return EXIT_BAD_INPUT;
        }
    };

    let output = output.unwrap_or_else(|| input.with_extension("ld"));
    if output.exists() && !force {
        error!("{:?} already exists (use --force to overwrite)", output);
        return EXIT_REFUSE_OVERWRITE;
    }

    let mut pipeline = Pipeline::new(schema);
    pipeline.load(&image);
    let converted = pipeline.finish();
    if converted.raw_channels > 0 && converted.channels.is_empty() {
        error!("no channel could be encoded; nothing to write");
        return EXIT_NO_CHANNELS;
    }

    let metadata = ld::Metadata::with_t0(converted.t0);
    let result = File::create(&output)
        .and_then(|mut out| ld::write(&mut out, &metadata, &converted.channels));
    match result {
        Ok(()) => {
            info!(
                "wrote {} channels to {:?}",
                converted.channels.len(),
                output
            );
            0
        }
        Err(e) => {
            error!("failed to write {:?}: {}", output, e);
            1
        }
    }
}

/// Loads the schema and decodes a session into finalised channels,
/// returning the conversion exit code on failure.
fn load_session(
    config: &PathBuf,
    input: &PathBuf,
) -> Result<(Arc<Schema>, DateTime<Utc>, Vec<Channel>), i32> {
    let schema = match Schema::load(config) {
        Ok(schema) => Arc::new(schema),
        Err(e) => {
            error!("failed to load {:?}: {}", config, e);
            return Err(EXIT_BAD_SCHEMA);
        }
    };
    info!("loaded {} parameters from {:?}", schema.len(), config);

    if input.extension().and_then(|ext| ext.to_str()) != Some("gdat") {
        error!("expected a path to a .gdat file, got {:?}", input);
        return Err(EXIT_BAD_INPUT);
    }
    let image = match fs::read(input) {
        Ok(image) => image,
        Err(e) => {
            error!("failed to read {:?}: {}", input, e);
            return Err(EXIT_BAD_INPUT);
        }
    };

    let (preamble, data) = frame::split_preamble(&image);
    let t0 = frame::get_t0(preamble);

    let mut decoder = FrameDecoder::new(schema.clone());
    decoder.push(data);
    decoder.finish();
    let mut store = ChannelStore::new(schema.clone());
    while let Some(record) = decoder.pull() {
        store.append(record);
    }
    let stats = decoder.stats();
    info!("{} packets, {} errors", stats.packets, stats.errors);

    Ok((schema, t0, store.finalize()))
}

fn info_gdat(config: &PathBuf, input: &PathBuf) -> i32 {
    let (schema, t0, channels) = match load_session(config, input) {
        Ok(session) => session,
        Err(code) => return code,
    };

    println!("t0: {}", t0.format("%a %b %e %H:%M:%S %Y"));
    println!(
        "{:>5} {:<32} {:<12} {:<6} {:>8} {:>8} {:>8} {:>12} {:>12} {:>7} {:>8} {:>5} {:>6} {:>7} {:>6}",
        "id",
        "name",
        "unit",
        "type",
        "n_points",
        "t_min",
        "t_max",
        "v_min",
        "v_max",
        "freq_hz",
        "samples",
        "shift",
        "scalar",
        "divisor",
        "offset"
    );
    for channel in &channels {
        let resampled = resample::resample(channel);
        let wire_type = schema
            .get(channel.id)
            .map(|param| format!("{:?}", param.wire_type))
            .unwrap_or_default();
        // encoding diagnostics; a dash marks a channel conversion would drop
        let scaling = match scale::solve(channel.abs_max()) {
            Ok(scaling) => (
                scaling.shift.to_string(),
                scaling.scalar.to_string(),
                scaling.divisor.to_string(),
                scaling.offset.to_string(),
            ),
            Err(_) => ("-".into(), "-".into(), "-".into(), "-".into()),
        };
        println!(
            "{:>5} {:<32} {:<12} {:<6} {:>8} {:>8} {:>8} {:>12} {:>12} {:>7} {:>8} {:>5} {:>6} {:>7} {:>6}",
            channel.id,
            channel.name,
            channel.unit,
            wire_type,
            channel.n_points(),
            channel.t_min,
            channel.t_max,
            channel.v_min,
            channel.v_max,
            resampled.freq_hz,
            resampled.sample_count,
            scaling.0,
            scaling.1,
            scaling.2,
            scaling.3
        );
    }
    println!("\n{} channels", channels.len());
    0
}

fn query(config: &PathBuf, input: &PathBuf, id: u16, seconds: f64) -> i32 {
    let (_, _, channels) = match load_session(config, input) {
        Ok(session) => session,
        Err(code) => return code,
    };
    let channel = match channels.iter().find(|channel| channel.id == id) {
        Some(channel) => channel,
        None => {
            error!("{} is not a channel in this session", id);
            return 1;
        }
    };

    let t = seconds * 1000.0;
    let points = channel.points();
    let at = points.partition_point(|point| (point.t_ms as f64) < t);

    println!("{} ({})", channel.name, channel.unit);
    println!("points near t = {}ms ...", t);
    if at > 0 {
        let point = points[at - 1];
        println!("t = {}ms, v = {}", point.t_ms, point.value);
    }
    if at < points.len() {
        let point = points[at];
        println!("t = {}ms, v = {}", point.t_ms, point.value);
    }
    0
}

fn inspect(path: &PathBuf) -> Result<()> {
    let mut file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let ld = ld::read(&mut file).with_context(|| format!("failed to parse {:?}", path))?;

    println!("HEADER ====================");
    println!(
        "device: {} {} v{}",
        ld.device_type, ld.device_serial, ld.device_version
    );
    println!("date: {}  time: {}", ld.metadata.header.date, ld.metadata.header.time);
    println!("driver: {}", ld.metadata.header.driver);
    println!("vehicle: {}", ld.metadata.header.vehicle_id);
    println!("venue: {}", ld.metadata.header.venue);
    println!("session: {}", ld.metadata.header.session);
    println!("num_channels: {}", ld.num_channels);

    println!("\nEVENT ====================");
    println!("event: {}", ld.metadata.event.event);
    println!("comment: {}", ld.metadata.event.long_comment);

    println!("\nVENUE ====================");
    println!(
        "venue: {} ({} mm, {})",
        ld.metadata.venue.venue, ld.metadata.venue.venue_length, ld.metadata.venue.venue_category
    );

    println!("\nVEHICLE ====================");
    println!(
        "vehicle: {} ({}, {} kg)",
        ld.metadata.vehicle.vehicle_id,
        ld.metadata.vehicle.vehicle_desc,
        ld.metadata.vehicle.vehicle_weight
    );

    println!("\nWEATHER ====================");
    println!(
        "sky: {}, air {} {}, track {} {}",
        ld.metadata.weather.sky,
        ld.metadata.weather.air_temp,
        ld.metadata.weather.air_temp_unit,
        ld.metadata.weather.track_temp,
        ld.metadata.weather.track_temp_unit
    );

    println!("\nCHANNELS ====================");
    println!(
        "{:<32} {:<12} {:>8} {:>10} {:>6} {:>6} {:>7} {:>5}",
        "name", "unit", "rate", "samples", "shift", "scalar", "divisor", "size"
    );
    for channel in &ld.channels {
        println!(
            "{:<32} {:<12} {:>8} {:>10} {:>6} {:>6} {:>7} {:>5}",
            channel.meta.name,
            channel.meta.unit,
            channel.meta.sample_rate,
            channel.meta.sample_count,
            channel.meta.scaling.shift,
            channel.meta.scaling.scalar,
            channel.meta.scaling.divisor,
            channel.meta.size
        );
    }
    println!("\nfound {} channels", ld.channels.len());
    Ok(())
}
