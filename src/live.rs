//! Live operation: a background ingest task and the latest-value view.
//!
//! One task owns the byte stream: it reads blocks, runs the frame
//! decoder, refreshes the [`LiveView`] and forwards every validated
//! [`Record`] over a channel for whoever assembles the session (the
//! channel store, a metrics consumer). Cancellation is cooperative: the
//! stop flag is checked before each block read, and bytes still buffered
//! in the decoder at shutdown are discarded.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::frame::{FrameDecoder, FrameStats, Record};
use crate::schema::Schema;

/// The latest observed value of every parameter in the schema.
///
/// One atomic slot per id, fixed at construction, so the single writer
/// (the ingest task) never contends with readers and readers never lock
/// the sample arrays. Readers observe monotonic per-id updates; there is
/// no cross-id ordering guarantee.
pub struct LiveView {
    slots: HashMap<u16, AtomicU64>,
}

impl LiveView {
    pub fn new(schema: &Schema) -> LiveView {
        LiveView {
            slots: schema
                .iter()
                .map(|param| (param.id, AtomicU64::new(0f64.to_bits())))
                .collect(),
        }
    }

    /// The most recent value seen for `id`; zero until the first packet.
    /// `None` for ids outside the schema.
    pub fn latest(&self, id: u16) -> Option<f64> {
        self.slots
            .get(&id)
            .map(|slot| f64::from_bits(slot.load(Ordering::Relaxed)))
    }

    pub(crate) fn update(&self, id: u16, value: f64) {
        if let Some(slot) = self.slots.get(&id) {
            slot.store(value.to_bits(), Ordering::Relaxed);
        }
    }
}

/// [`Ingest`] configuration.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Bytes to request per read.
    pub block_size: usize,
    /// Whether to keep reading after a (temporary) EOF condition, as a
    /// serial port with a receive timeout reports. When unset the task
    /// ends at the first empty read.
    pub ignore_eof: bool,
}

impl Default for IngestOptions {
    fn default() -> IngestOptions {
        IngestOptions {
            block_size: 1000,
            ignore_eof: false,
        }
    }
}

/// Handle to a running ingest task.
pub struct Ingest {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<FrameStats>,
}

impl Ingest {
    /// Spawns the ingest loop over `reader`. Validated records update
    /// `view` in packet arrival order and are forwarded to `records`;
    /// the task ends when the stream does, when the receiver is dropped,
    /// or when [`Ingest::shutdown`] is called.
    pub fn spawn<R>(
        reader: R,
        schema: Arc<Schema>,
        view: Arc<LiveView>,
        records: Sender<Record>,
        options: IngestOptions,
    ) -> Ingest
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || ingest_loop(reader, schema, view, records, options, flag));
        Ingest { stop, handle }
    }

    /// Requests a stop and waits for the task, returning its final
    /// stream counters.
    pub fn shutdown(self) -> FrameStats {
        self.stop.store(true, Ordering::Relaxed);
        match self.handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                warn!("ingest task panicked");
                FrameStats::default()
            }
        }
    }
}

fn ingest_loop<R: Read>(
    mut reader: R,
    schema: Arc<Schema>,
    view: Arc<LiveView>,
    records: Sender<Record>,
    options: IngestOptions,
    stop: Arc<AtomicBool>,
) -> FrameStats {
    let mut decoder = FrameDecoder::new(schema);
    let mut block = vec![0u8; options.block_size.max(1)];

    loop {
        if stop.load(Ordering::Relaxed) {
            // outstanding buffered bytes are discarded, not flushed
            break;
        }
        match reader.read(&mut block) {
            Ok(0) if options.ignore_eof => continue,
            Ok(0) => break,
            Ok(n) => {
                decoder.push(&block[..n]);
                while let Some(record) = decoder.pull() {
                    view.update(record.id, record.value);
                    if records.send(record).is_err() {
                        debug!("record receiver dropped; stopping ingest");
                        return decoder.stats();
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(e) => {
                warn!("ingest read failed: {}", e);
                break;
            }
        }
    }
    decoder.stats()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_packet;
    use crate::schema::{NetworkConfig, Schema};
    use std::sync::mpsc;

    fn schema() -> Arc<Schema> {
        let config: NetworkConfig = serde_norway::from_str(
            r#"
parameters:
  rpm: { id: 2, type: UNSIGNED16, motec_name: Engine RPM, unit: rpm }
  temp: { id: 7, type: SIGNED16, motec_name: Coolant Temp, unit: C }
"#,
        )
        .unwrap();
        Arc::new(Schema::from_config(&config))
    }

    #[test]
    fn view_tracks_schema_ids_only() {
        let schema = schema();
        let view = LiveView::new(&schema);

        assert_eq!(view.latest(2), Some(0.0));
        assert_eq!(view.latest(99), None);

        view.update(2, 8000.0);
        view.update(99, 1.0);
        assert_eq!(view.latest(2), Some(8000.0));
    }

    #[test]
    fn ingest_runs_a_stream_to_completion() {
        let schema = schema();
        let view = Arc::new(LiveView::new(&schema));
        let (tx, rx) = mpsc::channel();

        let mut stream = Vec::new();
        for t in 0..20u32 {
            stream.extend_from_slice(&encode_packet(t * 10, 2, &(t as u16 * 100).to_be_bytes()));
        }
        // closing delimiter so the last packet is not left in flight at EOF
        stream.push(crate::frame::SD);

        let ingest = Ingest::spawn(
            std::io::Cursor::new(stream),
            schema,
            view.clone(),
            tx,
            IngestOptions {
                block_size: 7,
                ..IngestOptions::default()
            },
        );

        // the sender is dropped when the task ends at EOF
        let received: Vec<Record> = rx.iter().collect();
        let stats = ingest.shutdown();

        assert_eq!(received.len(), 20);
        assert_eq!(stats.packets, 20);
        // the dangling delimiter stays buffered and is discarded, not counted
        assert_eq!(stats.errors, 0);
        assert_eq!(view.latest(2), Some(1900.0));
        assert_eq!(view.latest(7), Some(0.0));
    }

    #[test]
    fn shutdown_stops_an_endless_stream() {
        // a reader that never runs dry
        struct Steady;
        impl Read for Steady {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let packet = encode_packet(1, 7, &1i16.to_be_bytes());
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
        }

        let schema = schema();
        let view = Arc::new(LiveView::new(&schema));
        let (tx, rx) = mpsc::channel();
        let ingest = Ingest::spawn(Steady, schema, view, tx, IngestOptions::default());

        // wait for proof of life, then stop
        let first = rx.recv().unwrap();
        assert_eq!(first.id, 7);
        let stats = ingest.shutdown();
        assert!(stats.packets >= 1);
    }
}
