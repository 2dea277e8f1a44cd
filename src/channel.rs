//! Per-parameter timeseries assembly.
//!
//! A [`Channel`] owns one parameter's raw samples for a session, together
//! with the statistics derived when the store is finalised. The encoded
//! form that ultimately lands in an LD file is [`EncodedChannel`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::frame::Record;
use crate::scale::Scaling;
use crate::schema::{Parameter, Schema};

/// One raw datapoint of a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Milliseconds since session start.
    pub t_ms: u32,
    pub value: f64,
}

/// One parameter's timeseries across a session.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: u16,
    pub name: String,
    pub unit: String,
    points: Vec<Sample>,
    pub t_min: u32,
    pub t_max: u32,
    pub v_min: f64,
    pub v_max: f64,
}

impl Channel {
    fn new(param: &Parameter) -> Channel {
        Channel {
            id: param.id,
            name: param.name.clone(),
            unit: param.unit.clone(),
            points: Vec::new(),
            t_min: 0,
            t_max: 0,
            v_min: 0.0,
            v_max: 0.0,
        }
    }

    pub fn n_points(&self) -> usize {
        self.points.len()
    }

    /// Raw samples; sorted by timestamp once the store is finalised.
    pub fn points(&self) -> &[Sample] {
        &self.points
    }

    /// The largest value magnitude seen on this channel.
    pub fn abs_max(&self) -> f64 {
        self.v_min.abs().max(self.v_max.abs())
    }

    /// Stable timestamp sort, so equal-timestamp samples retain arrival
    /// order, followed by the derived statistics.
    fn finalize(&mut self) {
        self.points.sort_by_key(|sample| sample.t_ms);
        if let (Some(first), Some(last)) = (self.points.first(), self.points.last()) {
            self.t_min = first.t_ms;
            self.t_max = last.t_ms;
        }
        self.v_min = f64::INFINITY;
        self.v_max = f64::NEG_INFINITY;
        for sample in &self.points {
            self.v_min = self.v_min.min(sample.value);
            self.v_max = self.v_max.max(sample.value);
        }
    }
}

/// A channel ready for the LD writer: uniform cadence, integer-encoded.
#[derive(Debug, Clone)]
pub struct EncodedChannel {
    pub id: u16,
    pub name: String,
    pub unit: String,
    /// Uniform sample rate, Hz.
    pub sample_rate: u16,
    pub scaling: Scaling,
    pub samples: Vec<i32>,
}

/// Maps parameter ids to their channels. Channels are created lazily on
/// the first record for an id; iteration order is ascending id.
pub struct ChannelStore {
    schema: Arc<Schema>,
    channels: BTreeMap<u16, Channel>,
}

impl ChannelStore {
    pub fn new(schema: Arc<Schema>) -> ChannelStore {
        ChannelStore {
            schema,
            channels: BTreeMap::new(),
        }
    }

    /// Appends one decoded record in arrival order. Amortised O(1).
    pub fn append(&mut self, record: Record) {
        if !self.channels.contains_key(&record.id) {
            match self.schema.get(record.id) {
                Some(param) => {
                    self.channels.insert(record.id, Channel::new(param));
                }
                // the frame decoder rejects unknown ids before this point
                None => return,
            }
        }
        if let Some(channel) = self.channels.get_mut(&record.id) {
            channel.points.push(Sample {
                t_ms: record.t_ms,
                value: record.value,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, id: u16) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Sorts every channel, computes its statistics and drops channels
    /// without data. Consumes the store: from here on the channels belong
    /// to the conversion pipeline.
    pub fn finalize(self) -> Vec<Channel> {
        let mut channels = Vec::with_capacity(self.channels.len());
        for (_, mut channel) in self.channels {
            if channel.points.is_empty() {
                debug!("removing empty channel: {} ({})", channel.name, channel.id);
                continue;
            }
            channel.finalize();
            channels.push(channel);
        }
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NetworkConfig;

    fn store() -> ChannelStore {
        let config: NetworkConfig = serde_norway::from_str(
            r#"
parameters:
  rpm: { id: 2, type: UNSIGNED16, motec_name: Engine RPM, unit: rpm }
  temp: { id: 7, type: SIGNED16, motec_name: Coolant Temp, unit: C }
"#,
        )
        .unwrap();
        ChannelStore::new(Arc::new(Schema::from_config(&config)))
    }

    fn record(id: u16, t_ms: u32, value: f64) -> Record {
        Record { id, t_ms, value }
    }

    #[test]
    fn finalize_sorts_and_derives_stats() {
        let mut store = store();
        store.append(record(2, 30, 13.0));
        store.append(record(2, 10, 11.0));
        store.append(record(2, 0, -10.0));
        store.append(record(2, 20, 12.0));

        let channels = store.finalize();
        assert_eq!(channels.len(), 1);

        let ch = &channels[0];
        assert_eq!(ch.name, "Engine RPM");
        assert_eq!(ch.n_points(), 4);
        assert_eq!(
            ch.points().iter().map(|p| p.t_ms).collect::<Vec<_>>(),
            [0, 10, 20, 30]
        );
        assert_eq!((ch.t_min, ch.t_max), (0, 30));
        assert_eq!((ch.v_min, ch.v_max), (-10.0, 13.0));
        assert_eq!(ch.abs_max(), 13.0);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut store = store();
        store.append(record(7, 5, 1.0));
        store.append(record(7, 5, 2.0));
        store.append(record(7, 0, 0.0));
        store.append(record(7, 5, 3.0));

        let channels = store.finalize();
        let values: Vec<f64> = channels[0].points().iter().map(|p| p.value).collect();
        assert_eq!(values, [0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn channels_without_data_are_dropped() {
        let mut store = store();
        store.append(record(7, 0, 1.0));
        // id 2 never appears; id 9 is not in the schema
        store.append(record(9, 0, 1.0));

        let channels = store.finalize();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, 7);
    }
}
