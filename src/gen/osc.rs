//! Phase-accumulating table oscillator.
//!
//! Phase is a 32-bit unsigned integer covering one wave cycle; the
//! per-sample increment is `coeff * freq` where `coeff = 2^32 / srate`.
//! Phase modulation adds a signed offset to the lookup position only,
//! leaving the accumulator untouched.

use crate::program::wave::{self, WaveLut};

/// Oscillator state: the phase accumulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Osc {
    pub phase: u32,
}

/// Per-sample phase increment coefficient for a sample rate.
pub fn coeff(srate: u32) -> f64 {
    4294967296.0 / srate as f64
}

/// Convert a phase fraction (0.0 = 0 deg., 1.0 = 360 deg.) to the
/// 32-bit form used by the oscillator.
pub fn phase_int(p: f32) -> u32 {
    (p as f64 * 4294967296.0).round() as u64 as u32
}

fn phase_inc(coeff: f64, freq: f32) -> u32 {
    (coeff * freq as f64).round() as i64 as u32
}

impl Osc {
    /// Produce output in the -1.0 to 1.0 range, advancing phase.
    #[inline]
    pub fn run(&mut self, lut: &WaveLut, coeff: f64, freq: f32, pm: i32) -> f32 {
        let phase = self.phase.wrapping_add(pm as u32);
        let s = wave::get_lerp(lut, phase);
        self.phase = self.phase.wrapping_add(phase_inc(coeff, freq));
        s
    }

    /// Produce output in the 0.0 to 1.0 range, for envelope use.
    #[inline]
    pub fn run_envo(&mut self, lut: &WaveLut, coeff: f64, freq: f32, pm: i32) -> f32 {
        self.run(lut, coeff, freq, pm) * 0.5 + 0.5
    }

    /// Number of samples in one wave cycle at `freq`.
    pub fn cycle_len(coeff: f64, freq: f32) -> u32 {
        let inc = phase_inc(coeff, freq);
        if inc == 0 {
            return 0;
        }
        (4294967296.0 / inc as f64).round() as u32
    }

    /// Offset of `pos` relative to the nearest earlier wave cycle
    /// boundary. Subtracting it from a duration makes the sound end at
    /// a cycle's end, reducing clicks.
    pub fn cycle_offs(coeff: f64, freq: f32, pos: u32) -> i32 {
        let inc = phase_inc(coeff, freq);
        if inc == 0 {
            return 0;
        }
        let phs = inc.wrapping_mul(pos);
        (phs.wrapping_sub(wave::SCALE) / inc) as i32
    }
}
