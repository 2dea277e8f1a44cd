//! Uniform time-axis synthesis.
//!
//! Raw channels arrive at whatever cadence the bus produced; the LD format
//! wants evenly spaced samples at an integral frequency. The resampler
//! elects a cadence from the observed timestamp deltas and fills the
//! uniform axis with the last recorded value at or before each tick. The
//! last-known fill is deliberate: it preserves step-like bus signals that
//! linear interpolation would smear.

use std::collections::BTreeMap;

use crate::channel::Channel;

/// A channel fitted to a uniform time axis. Tick `i` is at
/// `i * delta_ms` milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Resampled {
    pub delta_ms: u16,
    pub freq_hz: u16,
    pub sample_count: u32,
    pub values: Vec<f64>,
}

impl Resampled {
    /// Timestamp of uniform tick `i`.
    pub fn tick_ms(&self, i: u32) -> u32 {
        i * self.delta_ms as u32
    }
}

/// Fits a finalised channel (sorted, at least one point) to a uniform
/// axis.
pub fn resample(channel: &Channel) -> Resampled {
    let delta_ms = elect_delta(channel);
    let sample_count = channel.t_max / delta_ms as u32;
    let points = channel.points();

    let mut values = Vec::with_capacity(sample_count as usize);
    let mut at = 0;
    for i in 0..sample_count {
        let tick = i as u64 * delta_ms as u64;
        // advance to the last point with a timestamp at or before this tick
        while at + 1 < points.len() && tick >= points[at + 1].t_ms as u64 {
            at += 1;
        }
        values.push(points[at].value);
    }

    Resampled {
        delta_ms,
        freq_hz: (1000 / delta_ms as u32) as u16,
        sample_count,
        values,
    }
}

/// Elects the uniform tick spacing for a channel.
///
/// Single-point channels default to 1 Hz. Otherwise the most common
/// successive delta in `1..=100` ms wins (ties to the smaller delta,
/// an empty filter to 100 ms), rounded up to the next divisor of 1000 so
/// the frequency is integral.
fn elect_delta(channel: &Channel) -> u16 {
    if channel.n_points() == 1 {
        return 1000;
    }

    let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
    for pair in channel.points().windows(2) {
        let delta = pair[1].t_ms - pair[0].t_ms;
        if (1..=100).contains(&delta) {
            *counts.entry(delta).or_insert(0) += 1;
        }
    }

    let mut delta = 100;
    let mut best = 0;
    for (&d, &count) in &counts {
        // strictly greater, so the smallest of the modes wins
        if count > best {
            best = count;
            delta = d;
        }
    }

    while 1000 % delta != 0 {
        delta += 1;
    }
    delta as u16
}
