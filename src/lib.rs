//! # `gdat`
//!
//! A decoder for the GDAT telemetry byte stream and a writer/reader for
//! the MoTeC-compatible LD timeseries log it converts into.
//!
//! A `.gdat` session is an ASCII preamble followed by escaped, checksummed
//! packets carrying `(timestamp, parameter id, typed value)` samples from
//! an embedded CAN-derived network. This crate covers the full path from
//! those bytes to an analysis-ready log:
//!
//! - [`frame`]: packet framing; escape/unescape, checksum validation and
//!   a streaming, chunk-agnostic state machine;
//! - [`schema`]: the parameter dictionary the payloads are decoded with;
//! - [`channel`], [`resample`], [`scale`]: per-parameter timeseries
//!   assembly, uniform-cadence resampling and the fixed-point scaling
//!   that fits each channel into bounded integers;
//! - [`ld`]: the LD container; pointer-linked regions, written and read
//!   field by field;
//! - [`live`], [`pipeline`]: a background ingest task with a
//!   latest-value view, and the [`Pipeline`] object that owns a session.
//!
//! Offline conversion is a few lines:
//!
//! ```no_run
//! use gdat::{ld, Pipeline, Schema};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = Schema::load("go4-23c.yaml")?;
//! let mut pipeline = Pipeline::new(schema);
//! pipeline.load(&std::fs::read("statefair.gdat")?);
//!
//! let converted = pipeline.finish();
//! let mut out = std::fs::File::create("statefair.ld")?;
//! ld::write(
//!     &mut out,
//!     &ld::Metadata::with_t0(converted.t0),
//!     &converted.channels,
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod frame;
pub mod ld;
pub mod live;
pub mod pipeline;
pub mod resample;
pub mod scale;
pub mod schema;

pub use channel::{Channel, ChannelStore, EncodedChannel, Sample};
pub use frame::{FrameDecoder, FrameError, FrameStats, Record};
pub use live::{Ingest, IngestOptions, LiveView};
pub use pipeline::{Converted, Pipeline};
pub use scale::{ScaleError, Scaling};
pub use schema::{Parameter, Schema, SchemaError, WireType};

/// Re-export for downstream timestamp handling.
pub use chrono;
