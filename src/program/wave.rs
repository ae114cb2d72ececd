//! Wave lookup tables.
//!
//! Eight periodic functions sampled into 2048-entry f32 tables, built once
//! into an immutable, process-wide table set and borrowed by each
//! generator. Oscillators index the tables with the top bits of a 32-bit
//! phase and interpolate linearly between entries.

use std::f64::consts::PI;
use std::sync::OnceLock;

pub const LEN_BITS: u32 = 11;
pub const LEN: usize = 1 << LEN_BITS; // 2048
pub const LEN_MASK: usize = LEN - 1;

pub const SCALE_BITS: u32 = 32 - LEN_BITS;
pub const SCALE: u32 = 1 << SCALE_BITS;
pub const SCALE_MASK: u32 = SCALE - 1;

/// Wave types, a closed set selected by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wave {
    #[default]
    Sin,
    Tri,
    Sqr,
    Saw,
    Sab,
    Shw,
    Ssr,
    Shr,
}

impl Wave {
    pub const TYPES: usize = 8;
    pub const NAMES: [&'static str; Self::TYPES] =
        ["sin", "tri", "sqr", "saw", "sab", "shw", "ssr", "shr"];

    pub const ALL: [Wave; Self::TYPES] = [
        Wave::Sin,
        Wave::Tri,
        Wave::Sqr,
        Wave::Saw,
        Wave::Sab,
        Wave::Shw,
        Wave::Ssr,
        Wave::Shr,
    ];

    pub fn from_name(name: &str) -> Option<Wave> {
        Self::NAMES
            .iter()
            .position(|&n| n == name)
            .map(|i| Self::ALL[i])
    }

    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }
}

pub type WaveLut = [f32; LEN];

/// The full set of tables, one per wave type.
pub struct WaveTables {
    luts: [WaveLut; Wave::TYPES],
}

static TABLES: OnceLock<WaveTables> = OnceLock::new();

impl WaveTables {
    /// The shared table set, built on first use.
    pub fn global() -> &'static WaveTables {
        TABLES.get_or_init(WaveTables::build)
    }

    pub fn lut(&self, wave: Wave) -> &WaveLut {
        &self.luts[wave as usize]
    }

    fn build() -> WaveTables {
        const HALF: usize = LEN >> 1;
        let mut luts = [[0.0f32; LEN]; Wave::TYPES];
        let len_scale = 1.0 / HALF as f64;
        let asin_0_5 = 0.5f64.asin();
        // first half
        for i in 0..HALF {
            let x = i as f64 * len_scale;
            let x_rev = (HALF - i) as f64 * len_scale;

            let sin_x = (PI * x).sin();
            luts[Wave::Sin as usize][i] = sin_x as f32;

            luts[Wave::Tri as usize][i] = if i < (HALF >> 1) {
                (2.0 * x) as f32
            } else {
                (2.0 * x_rev) as f32
            };

            luts[Wave::Sqr as usize][i] = 1.0;

            luts[Wave::Saw as usize][i] = x_rev as f32;

            let mut sab_x = ((PI * x) * 0.5 + asin_0_5).sin();
            sab_x = sab_x.abs() - 0.5;
            sab_x += sab_x;
            luts[Wave::Sab as usize][i] = sab_x as f32;

            let mut shw_x = ((PI * x) + asin_0_5).sin();
            if shw_x > 0.0 {
                shw_x -= 0.5;
                shw_x += shw_x;
                luts[Wave::Shw as usize][i] = shw_x as f32;
                let shr_x = if shw_x > 0.0 { shw_x.sqrt() } else { shw_x };
                luts[Wave::Shr as usize][i] = shr_x as f32;
            } else {
                luts[Wave::Shw as usize][i] = -1.0;
                luts[Wave::Shr as usize][i] = -1.0;
            }

            luts[Wave::Ssr as usize][i] = sin_x.sqrt() as f32;
        }
        // second half
        for i in HALF..LEN {
            let x = i as f64 * len_scale;

            luts[Wave::Sin as usize][i] = -luts[Wave::Sin as usize][i - HALF];
            luts[Wave::Tri as usize][i] = -luts[Wave::Tri as usize][i - HALF];
            luts[Wave::Sqr as usize][i] = -1.0;
            luts[Wave::Saw as usize][i] = -luts[Wave::Saw as usize][(LEN - 1) - i];

            let mut sab_x = ((PI * x) * 0.5 + asin_0_5).sin();
            sab_x = sab_x.abs() - 0.5;
            sab_x += sab_x;
            luts[Wave::Sab as usize][i] = sab_x as f32;

            let mut shw_x = ((PI * x) + asin_0_5).sin();
            if shw_x > 0.0 {
                shw_x -= 0.5;
                shw_x += shw_x;
                luts[Wave::Shw as usize][i] = shw_x as f32;
                let shr_x = if shw_x > 0.0 {
                    shw_x.sqrt()
                } else {
                    -((-shw_x).sqrt())
                };
                luts[Wave::Shr as usize][i] = shr_x as f32;
            } else {
                luts[Wave::Shw as usize][i] = -1.0;
                luts[Wave::Shr as usize][i] = -1.0;
            }

            luts[Wave::Ssr as usize][i] = -luts[Wave::Ssr as usize][i - HALF];
        }
        WaveTables { luts }
    }
}

/// Look up a value for a 32-bit phase with linear interpolation.
#[inline]
pub fn get_lerp(lut: &WaveLut, phase: u32) -> f32 {
    let ind = (phase >> SCALE_BITS) as usize;
    let s = lut[ind];
    s + (lut[(ind + 1) & LEN_MASK] - s) * ((phase & SCALE_MASK) as f32 * (1.0 / SCALE as f32))
}
