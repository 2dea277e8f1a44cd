//! The conversion pipeline.
//!
//! A [`Pipeline`] owns everything a session needs: the schema, the
//! channel store, the latest-value view and, in live operation, the
//! ingest task. There is no hidden shared state. Feed it bytes (or a
//! reader) and [`finish`](Pipeline::finish) it into encoded channels for
//! the LD writer.

use std::io::Read;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{mpsc, Arc};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::channel::{Channel, ChannelStore, EncodedChannel};
use crate::frame::{self, FrameDecoder, FrameStats, Record};
use crate::live::{Ingest, IngestOptions, LiveView};
use crate::resample;
use crate::scale;
use crate::schema::Schema;

/// The terminal product of a session: what the LD writer consumes.
#[derive(Debug)]
pub struct Converted {
    /// Session start, from the stream preamble.
    pub t0: DateTime<Utc>,
    /// Channels that survived resampling and encoding, in id order.
    pub channels: Vec<EncodedChannel>,
    /// Channels that held data before encoding.
    pub raw_channels: usize,
    /// Stream counters accumulated over the session.
    pub stats: FrameStats,
}

/// Owns one session's ingest state from bytes to encoded channels.
pub struct Pipeline {
    schema: Arc<Schema>,
    store: ChannelStore,
    view: Arc<LiveView>,
    ingest: Option<(Ingest, Receiver<Record>)>,
    t0: DateTime<Utc>,
    stats: FrameStats,
}

impl Pipeline {
    pub fn new(schema: Schema) -> Pipeline {
        let schema = Arc::new(schema);
        Pipeline {
            store: ChannelStore::new(schema.clone()),
            view: Arc::new(LiveView::new(&schema)),
            ingest: None,
            t0: DateTime::<Utc>::UNIX_EPOCH,
            stats: FrameStats::default(),
            schema,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The latest-value view; shareable with readers on other threads.
    pub fn view(&self) -> Arc<LiveView> {
        self.view.clone()
    }

    /// Session start decoded from the preamble; the Unix epoch until a
    /// preamble has been seen.
    pub fn t0(&self) -> DateTime<Utc> {
        self.t0
    }

    /// Channels holding data so far.
    pub fn channel_count(&self) -> usize {
        self.store.len()
    }

    /// Decodes a complete `.gdat` file image (preamble and packet
    /// stream) into the store.
    pub fn load(&mut self, image: &[u8]) {
        let (preamble, data) = frame::split_preamble(image);
        self.t0 = frame::get_t0(preamble);
        info!("read {} bytes of data", data.len());

        let mut decoder = FrameDecoder::new(self.schema.clone());
        decoder.push(data);
        decoder.finish();
        while let Some(record) = decoder.pull() {
            self.view.update(record.id, record.value);
            self.store.append(record);
        }

        let stats = decoder.stats();
        info!("{} packets, {} errors", stats.packets, stats.errors);
        self.stats.packets += stats.packets;
        self.stats.errors += stats.errors;
    }

    /// Starts a background ingest task over `reader`. Records flow into
    /// the store on every [`drain`](Pipeline::drain) call; the live view
    /// updates as packets validate.
    pub fn start<R>(&mut self, reader: R, options: IngestOptions)
    where
        R: Read + Send + 'static,
    {
        if self.ingest.is_some() {
            warn!("ingest task already running");
            return;
        }
        let (tx, rx) = mpsc::channel();
        let ingest = Ingest::spawn(
            reader,
            self.schema.clone(),
            self.view.clone(),
            tx,
            options,
        );
        self.ingest = Some((ingest, rx));
    }

    /// Moves records produced so far from the ingest task into the
    /// store. Returns how many arrived.
    pub fn drain(&mut self) -> usize {
        let rx = match &self.ingest {
            Some((_, rx)) => rx,
            None => return 0,
        };
        let mut moved = 0;
        loop {
            match rx.try_recv() {
                Ok(record) => {
                    self.store.append(record);
                    moved += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        moved
    }

    /// Stops the ingest task, drains whatever it produced and folds its
    /// counters into the session stats.
    pub fn stop(&mut self) -> Option<FrameStats> {
        let (ingest, rx) = self.ingest.take()?;
        let stats = ingest.shutdown();
        for record in rx.try_iter() {
            self.store.append(record);
        }
        self.stats.packets += stats.packets;
        self.stats.errors += stats.errors;
        Some(stats)
    }

    /// Finalises the store and encodes every surviving channel:
    /// sort, resample onto a uniform axis, solve the fixed-point scale,
    /// quantise. Channels the solver cannot fit are dropped with a
    /// warning.
    pub fn finish(mut self) -> Converted {
        self.stop();
        let channels = self.store.finalize();
        let raw_channels = channels.len();
        let encoded: Vec<EncodedChannel> = channels.iter().filter_map(encode_channel).collect();
        info!("created {} channels", encoded.len());

        Converted {
            t0: self.t0,
            channels: encoded,
            raw_channels,
            stats: self.stats,
        }
    }
}

fn encode_channel(channel: &Channel) -> Option<EncodedChannel> {
    let resampled = resample::resample(channel);
    let (scaling, samples) = scale::encode_samples(
        &channel.name,
        channel.id,
        channel.abs_max(),
        &resampled.values,
    )?;
    Some(EncodedChannel {
        id: channel.id,
        name: channel.name.clone(),
        unit: channel.unit.clone(),
        sample_rate: resampled.freq_hz,
        scaling,
        samples,
    })
}
