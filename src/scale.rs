//! Fixed-point scaling: fitting a float channel into i32 samples.
//!
//! The LD format stores each sample as a bounded signed integer together
//! with a `(shift, scalar, divisor)` tuple that maps it back to a
//! physical value:
//!
//! ```text
//! value         = encoded * 10^-shift * scalar / divisor
//! encoded_value = value / 10^-shift / scalar * divisor
//! ```
//!
//! `scalar` and `divisor` must fit in 12 bits (0x7FF). The solver maps a
//! channel's largest magnitude to the decade boundary `8 * 10^x`; mapping
//! to `8 * 10^x` rather than `10^x` leaves headroom in the mantissa and
//! makes the rational approximation overflow its denominator bound far
//! less often.

use std::convert::TryFrom;

use tracing::warn;

/// Upper bound for both `scalar` and `divisor` (12 bits, required by the
/// LD channel metadata record).
pub const FRACTION_MAX: u16 = 0x7FF;

/// The integer-encoding tuple of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scaling {
    pub shift: i8,
    pub scalar: u16,
    pub divisor: u16,
    pub offset: i16,
}

impl Scaling {
    /// Encodes a physical value. Inverse of [`Scaling::decode`].
    pub fn encode(&self, value: f64) -> i32 {
        let enc = (value / self.scalar as f64 - self.offset as f64)
            * 10f64.powi(self.shift as i32)
            * self.divisor as f64;
        enc.round() as i32
    }

    /// Reconstructs the physical value of an encoded sample.
    pub fn decode(&self, encoded: i32) -> f64 {
        (encoded as f64 / self.divisor as f64 * 10f64.powi(-(self.shift as i32))
            + self.offset as f64)
            * self.scalar as f64
    }
}

/// The channel cannot be represented within the format's scaling bounds.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScaleError {
    #[error("no 12-bit fraction fits a channel with magnitude {abs_max}")]
    Unrepresentable { abs_max: f64 },
    #[error("channel magnitude {abs_max} is not a finite number")]
    NotFinite { abs_max: f64 },
}

/// Chooses a [`Scaling`] for a channel with the given largest magnitude.
pub fn solve(abs_max: f64) -> Result<Scaling, ScaleError> {
    if !abs_max.is_finite() {
        return Err(ScaleError::NotFinite { abs_max });
    }
    if abs_max == 0.0 {
        return Ok(Scaling {
            shift: 9,
            scalar: 1,
            divisor: 1,
            offset: 0,
        });
    }

    // the decade whose boundary 8*10^x brackets abs_max; x >= -3 keeps
    // the shift at 9 or below so small signals cannot overflow i32
    let x = ((abs_max / 8.0).log10().floor() as i32).max(-3);
    let scale = 8.0 * 10f64.powi(x) / abs_max;

    let shift = match i8::try_from(6 - x) {
        Ok(shift) => shift,
        Err(_) => return Err(ScaleError::Unrepresentable { abs_max }),
    };
    if scale > FRACTION_MAX as f64 + 1.0 {
        // even divisor = 1 would need a scalar beyond 12 bits
        return Err(ScaleError::Unrepresentable { abs_max });
    }

    let (scalar, divisor) = match limit_denominator(scale, FRACTION_MAX as u64) {
        Some(fraction) => fraction,
        None => return Err(ScaleError::Unrepresentable { abs_max }),
    };
    if scalar > FRACTION_MAX as u64 {
        return Err(ScaleError::Unrepresentable { abs_max });
    }

    Ok(Scaling {
        shift,
        scalar: scalar as u16,
        divisor: divisor as u16,
        offset: 0,
    })
}

/// Encodes a resampled channel, or reports why it cannot be represented.
pub fn encode_samples(name: &str, id: u16, abs_max: f64, values: &[f64]) -> Option<(Scaling, Vec<i32>)> {
    match solve(abs_max) {
        Ok(scaling) => {
            let samples = values.iter().map(|&v| scaling.encode(v)).collect();
            Some((scaling, samples))
        }
        Err(e) => {
            warn!("failed to encode channel: {} ({}): {}", name, id, e);
            None
        }
    }
}

/// The exact rational expansion of a positive finite float:
/// `x = numerator / denominator` with the denominator a power of two and
/// the fraction in lowest terms. `None` for values too large to matter
/// here (the solver bounds `x` well below that).
fn as_ratio(x: f64) -> Option<(u128, u128)> {
    let bits = x.to_bits();
    let exponent = ((bits >> 52) & 0x7FF) as i32;
    let fraction = bits & ((1u64 << 52) - 1);
    let (mantissa, exponent) = if exponent == 0 {
        (fraction, -1074)
    } else {
        (fraction | (1 << 52), exponent - 1075)
    };

    if exponent >= 0 {
        if exponent > 64 {
            return None;
        }
        Some(((mantissa as u128) << exponent, 1))
    } else {
        let shift = (-exponent) as u32;
        let cancelled = mantissa.trailing_zeros().min(shift);
        let mantissa = mantissa >> cancelled;
        let shift = shift - cancelled;
        if shift > 127 {
            return None;
        }
        Some((mantissa as u128, 1u128 << shift))
    }
}

/// Deterministic best rational approximation with a bounded denominator,
/// over the exact binary expansion of `x`: the continued-fraction walk
/// with the final convergent/semiconvergent comparison (the same rule as
/// CPython's `Fraction.limit_denominator`, so results match the reference
/// tooling bit for bit).
fn limit_denominator(x: f64, max_denominator: u64) -> Option<(u64, u64)> {
    if !x.is_finite() || x <= 0.0 {
        return None;
    }
    let (numerator, denominator) = as_ratio(x)?;
    if denominator <= max_denominator as u128 {
        return Some((u64::try_from(numerator).ok()?, denominator as u64));
    }

    let (mut p0, mut q0, mut p1, mut q1): (u128, u128, u128, u128) = (0, 1, 1, 0);
    let (mut n, mut d) = (numerator, denominator);
    loop {
        if d == 0 {
            break;
        }
        let a = n / d;
        let q2 = q0 + a * q1;
        if q2 > max_denominator as u128 {
            break;
        }
        let p2 = p0 + a * p1;
        p0 = p1;
        q0 = q1;
        p1 = p2;
        q1 = q2;
        let r = n - a * d;
        n = d;
        d = r;
    }

    let k = (max_denominator as u128 - q0) / q1;
    let semi = (p0 + k * p1, q0 + k * q1);
    let conv = (p1, q1);

    // |conv - x| <= |semi - x|, cross-multiplied to stay in integers
    let err = |(p, q): (u128, u128)| -> u128 {
        let lhs = p * denominator;
        let rhs = numerator * q;
        if lhs > rhs {
            lhs - rhs
        } else {
            rhs - lhs
        }
    };
    let best = if err(conv) * semi.1 <= err(semi) * conv.1 {
        conv
    } else {
        semi
    };
    Some((u64::try_from(best.0).ok()?, best.1 as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_signal() {
        assert_eq!(
            solve(0.0).unwrap(),
            Scaling {
                shift: 9,
                scalar: 1,
                divisor: 1,
                offset: 0
            }
        );
    }

    #[test]
    fn decade_pick_and_fraction() {
        // abs_max = 3275: x = floor(log10(3275 / 8)) = 2, shift = 4,
        // scale = 800/3275 which reduces exactly to 32/131
        let scaling = solve(3275.0).unwrap();
        assert_eq!(scaling.shift, 4);
        assert_eq!(scaling.scalar, 32);
        assert_eq!(scaling.divisor, 131);

        let enc = scaling.encode(3275.0);
        let dec = scaling.decode(enc);
        assert!(((dec - 3275.0) / 3275.0).abs() <= 0.10);
    }

    #[test]
    fn encode_stays_within_i32() {
        for &abs_max in &[0.5, 1.0, 7.99, 8.0, 1234.5, 1e6, 3.2e7, 1e12] {
            let scaling = solve(abs_max).unwrap();
            assert!(scaling.scalar >= 1 && scaling.scalar <= FRACTION_MAX);
            assert!(scaling.divisor >= 1 && scaling.divisor <= FRACTION_MAX);

            for &v in &[abs_max, -abs_max, abs_max / 3.0, 0.0] {
                let enc = scaling.encode(v);
                let dec = scaling.decode(enc);
                let err = (dec - v).abs() / v.abs().max(1e-9);
                assert!(
                    err <= 0.10,
                    "abs_max {}: {} decoded to {} (err {})",
                    abs_max,
                    v,
                    dec,
                    err
                );
            }
        }
    }

    #[test]
    fn tiny_magnitudes_clamp_the_decade() {
        // abs_max below 8e-3 clamps x to -3 and the required scale
        // explodes; small-but-sane magnitudes still solve
        let scaling = solve(0.005).unwrap();
        assert_eq!(scaling.shift, 9);

        let v = 0.005;
        let dec = scaling.decode(scaling.encode(v));
        assert!(((dec - v) / v).abs() <= 0.10);
    }

    #[test]
    fn unrepresentable_magnitude_fails() {
        // scale = 8e-3 / abs_max is far beyond 0x7FF
        assert!(matches!(
            solve(1e-9),
            Err(ScaleError::Unrepresentable { .. })
        ));
        assert!(matches!(solve(f64::NAN), Err(ScaleError::NotFinite { .. })));
        assert!(matches!(
            solve(f64::INFINITY),
            Err(ScaleError::NotFinite { .. })
        ));
    }

    #[test]
    fn limit_denominator_matches_reference() {
        // spot values checked against CPython's Fraction.limit_denominator
        assert_eq!(limit_denominator(std::f64::consts::PI, 0x7FF), Some((355, 113)));
        assert_eq!(limit_denominator(0.5, 0x7FF), Some((1, 2)));
        assert_eq!(limit_denominator(800.0 / 3275.0, 0x7FF), Some((32, 131)));
        assert_eq!(limit_denominator(1.0, 0x7FF), Some((1, 1)));
        assert_eq!(limit_denominator(2.0, 0x7FF), Some((2, 1)));
        // 1/3 is not exactly representable; the nearest double still
        // approximates back to 1/3
        assert_eq!(limit_denominator(1.0 / 3.0, 0x7FF), Some((1, 3)));
    }

    #[test]
    fn limit_denominator_is_deterministic() {
        let x = 0.244_274_809_160_305_34;
        let first = limit_denominator(x, 0x7FF);
        for _ in 0..100 {
            assert_eq!(limit_denominator(x, 0x7FF), first);
        }
    }
}
