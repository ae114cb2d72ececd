//! Value ramps — scalar parameters with an optional timed trajectory.
//!
//! A ramp holds a state value `v0` and, when a goal is enabled, a target
//! `vt` reached over `time_ms` along a shape function. Values flagged as
//! ratios are multipliers on a parent frequency rather than absolute Hz;
//! [`Ramp::run`] resolves them through a multiplier buffer.

/// Ramp shape functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RampShape {
    /// Constant at `v0` for the whole time.
    Hold,
    /// Straight line.
    #[default]
    Lin,
    /// Exponential-like; picks `Esd` or `Lsd` by direction.
    Exp,
    /// Logarithmic-like; picks `Esd` or `Lsd` by direction.
    Log,
    /// Exponentially saturates and decays, like a capacitor.
    Esd,
    /// Logarithmic counterpart of `Esd`.
    Lsd,
}

impl RampShape {
    pub const NAMES: [&'static str; 6] = ["hold", "lin", "exp", "log", "esd", "lsd"];

    pub fn from_name(name: &str) -> Option<RampShape> {
        match name {
            "hold" => Some(RampShape::Hold),
            "lin" => Some(RampShape::Lin),
            "exp" => Some(RampShape::Exp),
            "log" => Some(RampShape::Log),
            "esd" => Some(RampShape::Esd),
            "lsd" => Some(RampShape::Lsd),
            _ => None,
        }
    }
}

/// A scalar parameter with optional timed transition.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Ramp {
    pub v0: f32,
    pub vt: f32,
    pub time_ms: u32,
    pub shape: RampShape,
    /// `v0` has been assigned.
    pub state: bool,
    /// A goal `vt` is enabled.
    pub goal: bool,
    /// `v0` is a multiplier on a parent frequency.
    pub state_ratio: bool,
    /// `vt` is a multiplier on a parent frequency.
    pub goal_ratio: bool,
    /// `time_ms` was given explicitly rather than defaulted.
    pub time_set: bool,
}

fn fill_hold(buf: &mut [f32], v0: f32, _vt: f32, _pos: u32, _time: u32) {
    buf.fill(v0);
}

fn fill_lin(buf: &mut [f32], v0: f32, vt: f32, pos: u32, time: u32) {
    let inv_time = 1.0 / time as f32;
    for (j, b) in buf.iter_mut().enumerate() {
        let i = pos + j as u32;
        *b = v0 + (vt - v0) * (i as f32 * inv_time);
    }
}

// Ear-tuned polynomial pair for the saturating shapes.
fn fill_esd(buf: &mut [f32], v0: f32, vt: f32, pos: u32, time: u32) {
    let inv_time = 1.0 / time as f32;
    for (j, b) in buf.iter_mut().enumerate() {
        let i = pos + j as u32;
        let mut m = 1.0 - i as f32 * inv_time;
        let mp2 = m * m;
        let mp3 = mp2 * m;
        m = mp3 + (mp2 * mp3 - mp2) * (m * (629.0 / 1792.0) + mp2 * (1163.0 / 1792.0));
        *b = vt + (v0 - vt) * m;
    }
}

fn fill_lsd(buf: &mut [f32], v0: f32, vt: f32, pos: u32, time: u32) {
    let inv_time = 1.0 / time as f32;
    for (j, b) in buf.iter_mut().enumerate() {
        let i = pos + j as u32;
        let mut m = i as f32 * inv_time;
        let mp2 = m * m;
        let mp3 = mp2 * m;
        m = mp3 + (mp2 * mp3 - mp2) * (m * (629.0 / 1792.0) + mp2 * (1163.0 / 1792.0));
        *b = v0 + (vt - v0) * m;
    }
}

fn fill(shape: RampShape, buf: &mut [f32], v0: f32, vt: f32, pos: u32, time: u32) {
    match shape {
        RampShape::Hold => fill_hold(buf, v0, vt, pos, time),
        RampShape::Lin => fill_lin(buf, v0, vt, pos, time),
        RampShape::Exp => {
            if v0 > vt {
                fill_esd(buf, v0, vt, pos, time)
            } else {
                fill_lsd(buf, v0, vt, pos, time)
            }
        }
        RampShape::Log => {
            if v0 < vt {
                fill_esd(buf, v0, vt, pos, time)
            } else {
                fill_lsd(buf, v0, vt, pos, time)
            }
        }
        RampShape::Esd => fill_esd(buf, v0, vt, pos, time),
        RampShape::Lsd => fill_lsd(buf, v0, vt, pos, time),
    }
}

pub fn ms_in_samples(ms: u32, srate: u32) -> u32 {
    ((ms as u64 * srate as u64 + 500) / 1000) as u32
}

impl Ramp {
    /// Whether the ramp holds any assignment at all.
    pub fn is_enabled(&self) -> bool {
        self.state || self.goal
    }

    /// Copy changes from `src`, preserving non-overridden parts of state.
    pub fn copy(&mut self, src: &Ramp) {
        if src.state {
            self.v0 = src.v0;
            self.state = true;
            self.state_ratio = src.state_ratio;
        }
        if src.goal {
            self.vt = src.vt;
            self.time_ms = src.time_ms;
            self.shape = src.shape;
            self.goal = true;
            self.goal_ratio = src.goal_ratio;
            self.time_set = src.time_set;
        }
    }

    fn fill_state(&self, buf: &mut [f32], mulbuf: Option<&[f32]>) {
        match (self.state_ratio, mulbuf) {
            (true, Some(mul)) => {
                for (b, m) in buf.iter_mut().zip(mul) {
                    *b = self.v0 * m;
                }
            }
            _ => buf.fill(self.v0),
        }
    }

    /// Fill `buf` with values for the ramp, advancing `pos`.
    ///
    /// When a goal is enabled it is ramped towards; once reached, `vt`
    /// becomes the new state. Ratio values are multiplied through
    /// `mulbuf`. Returns true while the goal is not yet reached.
    pub fn run(
        &mut self,
        pos: &mut u32,
        buf: &mut [f32],
        srate: u32,
        mulbuf: Option<&[f32]>,
    ) -> bool {
        if !self.goal {
            self.fill_state(buf, mulbuf);
            return false;
        }
        let time = ms_in_samples(self.time_ms, srate);
        // align the state form with the goal form before mixing them
        if self.goal_ratio {
            if !self.state_ratio {
                if let Some(mul) = mulbuf {
                    if !mul.is_empty() && mul[0] != 0.0 {
                        self.v0 /= mul[0];
                    }
                }
                self.state_ratio = true;
            }
        } else if self.state_ratio {
            if let Some(mul) = mulbuf {
                if !mul.is_empty() {
                    self.v0 *= mul[0];
                }
            }
            self.state_ratio = false;
        }
        let len = ((time - *pos) as usize).min(buf.len());
        fill(self.shape, &mut buf[..len], self.v0, self.vt, *pos, time);
        if self.goal_ratio {
            if let Some(mul) = mulbuf {
                for (b, m) in buf[..len].iter_mut().zip(mul) {
                    *b *= m;
                }
            }
        }
        *pos += len as u32;
        if *pos == time {
            // goal reached; becomes the new state
            self.v0 = self.vt;
            self.state_ratio = self.goal_ratio;
            self.goal = false;
            self.goal_ratio = false;
            let rest = buf.len() - len;
            if rest > 0 {
                let mul_rest = mulbuf.map(|m| &m[len..]);
                let (_, tail) = buf.split_at_mut(len);
                match (self.state_ratio, mul_rest) {
                    (true, Some(mul)) => {
                        for (b, m) in tail.iter_mut().zip(mul) {
                            *b = self.v0 * m;
                        }
                    }
                    _ => tail.fill(self.v0),
                }
            }
            return false;
        }
        true
    }

    /// Advance the ramp by `skip_len` samples without generating values.
    pub fn skip(&mut self, pos: &mut u32, skip_len: u32, srate: u32) -> bool {
        if !self.goal {
            return false;
        }
        let time = ms_in_samples(self.time_ms, srate);
        let len = (time - *pos).min(skip_len);
        *pos += len;
        if *pos == time {
            self.v0 = self.vt;
            self.state_ratio = self.goal_ratio;
            self.goal = false;
            self.goal_ratio = false;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_ramp(v: f32) -> Ramp {
        Ramp {
            v0: v,
            state: true,
            ..Ramp::default()
        }
    }

    fn goal_ramp(v0: f32, vt: f32, time_ms: u32, shape: RampShape) -> Ramp {
        Ramp {
            v0,
            vt,
            time_ms,
            shape,
            state: true,
            goal: true,
            time_set: true,
            ..Ramp::default()
        }
    }

    #[test]
    fn no_goal_outputs_constant() {
        let mut r = state_ramp(3.0);
        let mut pos = 0;
        let mut buf = [0.0f32; 16];
        let more = r.run(&mut pos, &mut buf, 1000, None);
        assert!(!more);
        assert!(buf.iter().all(|&v| v == 3.0));
    }

    #[test]
    fn lin_reaches_goal_at_time() {
        let mut r = goal_ramp(0.0, 1.0, 100, RampShape::Lin);
        let mut pos = 0;
        // 100 ms at 1000 Hz = 100 samples
        let mut buf = vec![0.0f32; 100];
        let more = r.run(&mut pos, &mut buf, 1000, None);
        assert!(!more);
        assert!((buf[50] - 0.5).abs() < 0.02);
        assert!(!r.goal);
        assert_eq!(r.v0, 1.0);
    }

    #[test]
    fn lin_partial_then_rest() {
        let mut r = goal_ramp(0.0, 1.0, 100, RampShape::Lin);
        let mut pos = 0;
        let mut buf = vec![0.0f32; 60];
        assert!(r.run(&mut pos, &mut buf, 1000, None));
        assert_eq!(pos, 60);
        let mut buf2 = vec![0.0f32; 60];
        assert!(!r.run(&mut pos, &mut buf2, 1000, None));
        // tail after goal holds the final value
        assert!(buf2[40..].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn hold_keeps_v0_then_jumps() {
        let mut r = goal_ramp(0.25, 1.0, 50, RampShape::Hold);
        let mut pos = 0;
        let mut buf = vec![0.0f32; 100];
        r.run(&mut pos, &mut buf, 1000, None);
        assert_eq!(buf[0], 0.25);
        assert_eq!(buf[49], 0.25);
        assert_eq!(buf[50], 1.0);
    }

    #[test]
    fn esd_and_lsd_hit_endpoints() {
        for shape in [RampShape::Esd, RampShape::Lsd, RampShape::Exp, RampShape::Log] {
            let mut r = goal_ramp(1.0, 2.0, 100, shape);
            let mut pos = 0;
            let mut buf = vec![0.0f32; 100];
            r.run(&mut pos, &mut buf, 1000, None);
            assert!((buf[0] - 1.0).abs() < 0.1, "{shape:?} start {}", buf[0]);
            assert!((buf[99] - 2.0).abs() < 0.1, "{shape:?} end {}", buf[99]);
            // goal becomes the exact new state once reached
            assert_eq!(r.v0, 2.0, "{shape:?}");
            // the curve stays within its endpoints
            for &v in &buf {
                assert!(
                    (0.999..=2.001).contains(&v),
                    "{shape:?} out of range {v}"
                );
            }
        }
    }

    #[test]
    fn ratio_state_multiplies_parent() {
        let mut r = state_ramp(2.0);
        r.state_ratio = true;
        let mut pos = 0;
        let mut buf = [0.0f32; 4];
        let mul = [100.0f32, 200.0, 300.0, 400.0];
        r.run(&mut pos, &mut buf, 1000, Some(&mul));
        assert_eq!(buf, [200.0, 400.0, 600.0, 800.0]);
    }

    #[test]
    fn goal_ratio_converts_state() {
        let mut r = goal_ramp(100.0, 2.0, 10, RampShape::Lin);
        r.goal_ratio = true;
        let mut pos = 0;
        let mut buf = [0.0f32; 10];
        let mul = [100.0f32; 10];
        r.run(&mut pos, &mut buf, 1000, Some(&mul));
        // v0 100 Hz over parent 100 Hz = ratio 1 ramping to 2
        assert!((buf[0] - 100.0).abs() < 1.0);
        assert!((buf[9] - 190.0).abs() < 11.0);
    }

    #[test]
    fn copy_merges_partial_state() {
        let mut dst = goal_ramp(1.0, 5.0, 100, RampShape::Lin);
        let src = state_ramp(3.0);
        dst.copy(&src);
        assert_eq!(dst.v0, 3.0);
        assert!(dst.goal, "goal preserved by state-only copy");
        assert_eq!(dst.vt, 5.0);
    }

    #[test]
    fn copy_merges_partial_goal() {
        let mut dst = state_ramp(1.0);
        let mut src = Ramp::default();
        src.goal = true;
        src.vt = 4.0;
        src.time_ms = 250;
        dst.copy(&src);
        assert_eq!(dst.v0, 1.0);
        assert!(dst.goal);
        assert_eq!(dst.time_ms, 250);
    }

    #[test]
    fn skip_advances_to_goal() {
        let mut r = goal_ramp(0.0, 1.0, 100, RampShape::Lin);
        let mut pos = 0;
        assert!(r.skip(&mut pos, 50, 1000));
        assert!(!r.skip(&mut pos, 50, 1000));
        assert_eq!(r.v0, 1.0);
    }

    #[test]
    fn shape_names_resolve() {
        for name in RampShape::NAMES {
            assert!(RampShape::from_name(name).is_some(), "{name}");
        }
        assert!(RampShape::from_name("nope").is_none());
    }

    #[test]
    fn ms_in_samples_rounds() {
        assert_eq!(ms_in_samples(1000, 44100), 44100);
        assert_eq!(ms_in_samples(500, 44100), 22050);
        assert_eq!(ms_in_samples(1, 44100), 44);
    }
}
