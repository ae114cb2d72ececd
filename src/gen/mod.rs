//! Audio generator — interprets a program into 16-bit stereo PCM.
//!
//! The generator walks the event timeline with one run node per event:
//! a negative `pos` counts down the event's wait, and block lengths are
//! clamped so event boundaries land on exact samples. Preparing a node
//! copies its updates into flat per-operator and per-voice state, snaps
//! updated carrier durations to wave-cycle boundaries, and deactivates
//! the voice's previous node. Rendering evaluates each active voice's
//! modulation tree recursively over scratch buffers sized by a depth
//! analysis before use.

pub mod osc;

use crate::program::ramp::{ms_in_samples, Ramp};
use crate::program::wave::{Wave, WaveTables};
use crate::program::{OpTime, Program};
use osc::Osc;

/// Samples per render block.
pub const BUF_LEN: usize = 256;
type Buf = [f32; BUF_LEN];

/// Sentinel for an unbounded (linked) duration.
const TIME_INF: u32 = u32::MAX;

#[derive(Default)]
struct OperatorNode {
    osc: Osc,
    /// Remaining samples, or [`TIME_INF`].
    time: u32,
    silence: u32,
    wave: Wave,
    freq: Ramp,
    freq_pos: u32,
    freq2: Ramp,
    amp: Ramp,
    amp_pos: u32,
    amp2: Ramp,
    fmods: Vec<usize>,
    pmods: Vec<usize>,
    amods: Vec<usize>,
}

#[derive(Default)]
struct VoiceNode {
    carriers: Vec<usize>,
    pan: Ramp,
    pan_pos: u32,
}

/// Per-event execution record.
struct RunNode {
    /// Negative: remaining wait in samples. Non-negative: samples
    /// rendered since activation.
    pos: i64,
    /// Samples to render once prepared; [`TIME_INF`] for unbounded.
    duration: u32,
    prepared: bool,
    active: bool,
    event: usize,
    /// Previous run node for the same voice.
    ref_prev: Option<usize>,
}

pub struct Generator<'a> {
    program: &'a Program,
    srate: u32,
    coeff: f64,
    tables: &'static WaveTables,
    bufs: Vec<Buf>,
    run_nodes: Vec<RunNode>,
    runn_i: usize,
    voices: Vec<VoiceNode>,
    operators: Vec<OperatorNode>,
    amp_scale: f32,
    delay_offs: i64,
    time_offs_set: bool,
}

impl<'a> Generator<'a> {
    pub fn new(program: &'a Program, srate: u32) -> Self {
        let mut run_nodes = Vec::with_capacity(program.events.len());
        let mut last_for_voice: Vec<Option<usize>> = vec![None; program.voice_count as usize];
        for (i, ev) in program.events.iter().enumerate() {
            let vid = ev.voice.0 as usize;
            let ref_prev = last_for_voice[vid];
            last_for_voice[vid] = Some(i);
            run_nodes.push(RunNode {
                pos: -(ms_in_samples(ev.wait_ms, srate) as i64),
                duration: 0,
                prepared: false,
                active: false,
                event: i,
                ref_prev,
            });
        }
        // Without an explicit script amp multiplier, output amplitude
        // is divided across the program's voices.
        let mut amp_scale = 1.0f32;
        if !program.options.ampmult_set && program.voice_count > 0 {
            amp_scale /= program.voice_count as f32;
        }
        Self {
            program,
            srate,
            coeff: osc::coeff(srate),
            tables: WaveTables::global(),
            bufs: Vec::new(),
            run_nodes,
            runn_i: 0,
            voices: (0..program.voice_count)
                .map(|_| VoiceNode::default())
                .collect(),
            operators: (0..program.op_count)
                .map(|_| OperatorNode::default())
                .collect(),
            amp_scale,
            delay_offs: 0,
            time_offs_set: false,
        }
    }

    pub fn srate(&self) -> u32 {
        self.srate
    }

    /// Scratch buffers needed to evaluate the tree rooted at `op_i`.
    /// Modulator references that would close a cycle are dropped here,
    /// with a warning, so the recursive evaluator never revisits a node.
    fn calc_bufs(&mut self, op_i: usize, stack: &mut Vec<usize>) -> usize {
        stack.push(op_i);
        let mut fm_pm = 0usize;
        let mut am = 0usize;
        for kind in 0..3usize {
            let mut list = match kind {
                0 => std::mem::take(&mut self.operators[op_i].fmods),
                1 => std::mem::take(&mut self.operators[op_i].pmods),
                _ => std::mem::take(&mut self.operators[op_i].amods),
            };
            list.retain(|m| {
                if stack.contains(m) {
                    eprintln!(
                        "warning: {}: skipping operator {}; circular references unsupported",
                        self.program.name, m
                    );
                    false
                } else {
                    true
                }
            });
            for &m in &list {
                let need = self.calc_bufs(m, stack);
                if kind < 2 {
                    fm_pm = fm_pm.max(need);
                } else {
                    am = am.max(need);
                }
            }
            match kind {
                0 => self.operators[op_i].fmods = list,
                1 => self.operators[op_i].pmods = list,
                _ => self.operators[op_i].amods = list,
            }
        }
        stack.pop();
        let mut need = 2 + fm_pm;
        if am > 0 {
            need = need.max(3 + am);
        }
        need.max(2)
    }

    fn upsize_bufs(&mut self, carriers: &[usize]) {
        let mut need = 0;
        let mut stack = Vec::new();
        for &c in carriers {
            need = need.max(self.calc_bufs(c, &mut stack));
        }
        if need > self.bufs.len() {
            self.bufs.resize(need, [0.0; BUF_LEN]);
        }
    }

    /// Apply an event's updates and activate its voice.
    fn prepare_node(&mut self, i: usize) {
        let ev_i = self.run_nodes[i].event;
        let ev = &self.program.events[ev_i];
        let vid = ev.voice.0 as usize;
        let mut adjusted: Vec<usize> = Vec::new();
        for u in &ev.ops {
            let oi = u.id.0 as usize;
            let on = &mut self.operators[oi];
            let mut adjtime = false;
            if let Some(t) = u.time {
                on.time = match t {
                    OpTime::Ms(ms) => ms_in_samples(ms, self.srate),
                    OpTime::Infinite => TIME_INF,
                };
                if on.time != TIME_INF {
                    adjtime = true;
                }
            }
            if let Some(ms) = u.silence_ms {
                on.silence = ms_in_samples(ms, self.srate);
            }
            if let Some(w) = u.wave {
                on.wave = w;
            }
            if let Some(f) = &u.freq {
                on.freq.copy(f);
                on.freq_pos = 0;
                adjtime = true;
            }
            if let Some(f2) = &u.freq2 {
                on.freq2.copy(f2);
            }
            if let Some(a) = &u.amp {
                on.amp.copy(a);
                on.amp_pos = 0;
            }
            if let Some(a2) = &u.amp2 {
                on.amp2.copy(a2);
            }
            if let Some(p) = u.phase {
                on.osc.phase = osc::phase_int(p);
            }
            if let Some(v) = &u.fmods {
                on.fmods = v.iter().map(|m| m.0 as usize).collect();
            }
            if let Some(v) = &u.pmods {
                on.pmods = v.iter().map(|m| m.0 as usize).collect();
            }
            if let Some(v) = &u.amods {
                on.amods = v.iter().map(|m| m.0 as usize).collect();
            }
            if adjtime {
                adjusted.push(oi);
            }
        }
        if let Some(vu) = &ev.voice_update {
            let vn = &mut self.voices[vid];
            if let Some(p) = &vu.pan {
                vn.pan.copy(p);
                vn.pan_pos = 0;
            }
            if let Some(c) = &vu.carriers {
                vn.carriers = c.iter().map(|m| m.0 as usize).collect();
            }
        }
        // Click reduction: snap updated carrier durations so they end at
        // a wave cycle's end. The smallest snap shifts later waits too.
        for &oi in &adjusted {
            if !self.voices[vid].carriers.contains(&oi) {
                continue;
            }
            let on = &mut self.operators[oi];
            if on.time == TIME_INF || on.time == 0 {
                continue;
            }
            let pos_offs = Osc::cycle_offs(self.coeff, on.freq.v0, on.time);
            on.time = (on.time as i64 - pos_offs as i64).max(0) as u32;
            if !self.time_offs_set || self.delay_offs > pos_offs as i64 {
                self.delay_offs = pos_offs as i64;
                self.time_offs_set = true;
            }
        }
        let carriers = self.voices[vid].carriers.clone();
        self.upsize_bufs(&carriers);
        let mut dur: u32 = 0;
        let mut any_inf = false;
        for &c in &carriers {
            match self.operators[c].time {
                TIME_INF => any_inf = true,
                t => dur = dur.max(t),
            }
        }
        let ref_prev = self.run_nodes[i].ref_prev;
        let rn = &mut self.run_nodes[i];
        rn.duration = if any_inf { TIME_INF } else { dur };
        rn.pos = 0;
        rn.active = !carriers.is_empty() && rn.duration > 0;
        rn.prepared = true;
        // Ensure the previous node for the voice is disabled; prevents
        // overlapping generation when timing is tweaked.
        if let Some(rp) = ref_prev {
            self.run_nodes[rp].active = false;
        }
    }

    fn mix_output(&mut self, vid: usize, out: &mut [i16], out_off: usize, n: usize) {
        let scale = self.amp_scale;
        let sbuf = &self.bufs[0];
        let vn = &mut self.voices[vid];
        if vn.pan.goal {
            let mut pan_buf = [0.0f32; BUF_LEN];
            let VoiceNode { pan, pan_pos, .. } = vn;
            pan.run(pan_pos, &mut pan_buf[..n], self.srate, None);
            for k in 0..n {
                let s = sbuf[k] * scale;
                let r = (pan_buf[k] + 1.0) * 0.5;
                mix_sample(out, out_off + k, s * (1.0 - r), s * r);
            }
        } else {
            let r = (vn.pan.v0 + 1.0) * 0.5;
            for k in 0..n {
                let s = sbuf[k] * scale;
                mix_sample(out, out_off + k, s * (1.0 - r), s * r);
            }
        }
    }

    /// Render up to `len` frames for an active node's voice.
    fn run_voice_node(&mut self, i: usize, out: &mut [i16], len: usize) -> usize {
        let duration = self.run_nodes[i].duration;
        let pos = self.run_nodes[i].pos.max(0) as u32;
        let vid = self.program.events[self.run_nodes[i].event].voice.0 as usize;
        let remaining = if duration == TIME_INF {
            len
        } else {
            ((duration - pos.min(duration)) as usize).min(len)
        };
        let mut time = remaining;
        let ret = time;
        let carriers = self.voices[vid].carriers.clone();
        let mut out_off = 0usize;
        while time > 0 {
            let n = time.min(BUF_LEN);
            time -= n;
            let mut acc = false;
            for &c in &carriers {
                if self.operators[c].time == 0 {
                    continue;
                }
                run_block(
                    &mut self.operators,
                    self.tables,
                    self.coeff,
                    self.srate,
                    &mut self.bufs,
                    n,
                    c,
                    None,
                    false,
                    acc,
                );
                acc = true;
            }
            if acc {
                self.mix_output(vid, out, out_off, n);
            }
            out_off += n;
        }
        let rn = &mut self.run_nodes[i];
        rn.pos += ret as i64;
        if rn.duration != TIME_INF && rn.pos >= rn.duration as i64 {
            rn.active = false;
        }
        ret
    }

    /// Generate up to `buf.len() / 2` interleaved stereo frames.
    ///
    /// Returns the number of frames that may carry signal and whether
    /// the program has finished.
    pub fn run(&mut self, buf: &mut [i16]) -> (usize, bool) {
        let total = buf.len() / 2;
        buf.fill(0);
        let mut len = total;
        let mut offset = 0usize;
        let mut max_written = 0usize;
        loop {
            let mut skip_len = 0usize;
            // event pump: prepare due nodes, clamp the block to the next
            // pending wait so boundaries are sample-exact
            for i in self.runn_i..self.run_nodes.len() {
                if self.run_nodes[i].pos < 0 {
                    let mut delay = -self.run_nodes[i].pos;
                    if self.time_offs_set {
                        // delay change == previous time change
                        delay -= self.delay_offs;
                    }
                    let delay = delay.max(0) as usize;
                    if delay <= len {
                        skip_len = len - delay;
                        len = delay;
                    }
                    break;
                }
                if !self.run_nodes[i].prepared {
                    self.prepare_node(i);
                }
            }
            for i in self.runn_i..self.run_nodes.len() {
                if self.run_nodes[i].pos < 0 {
                    let delay = (-self.run_nodes[i].pos) as usize;
                    if self.time_offs_set {
                        self.run_nodes[i].pos += self.delay_offs;
                        self.delay_offs = 0;
                        self.time_offs_set = false;
                    }
                    if delay >= len {
                        self.run_nodes[i].pos += len as i64;
                        break; // end for now; delays accumulate across nodes
                    }
                    offset += delay;
                    len -= delay;
                    self.run_nodes[i].pos = 0;
                } else if !self.run_nodes[i].prepared {
                    self.prepare_node(i);
                }
                if self.run_nodes[i].active {
                    let out = &mut buf[offset * 2..(offset + len) * 2];
                    let gen = self.run_voice_node(i, out, len);
                    max_written = max_written.max(offset + gen);
                }
            }
            if skip_len > 0 {
                offset += len;
                len = skip_len;
                continue;
            }
            break;
        }
        // advance past finished nodes; the program has ended when every
        // node is consumed and none is still active
        loop {
            if self.runn_i == self.run_nodes.len() {
                return (max_written, true);
            }
            let rn = &self.run_nodes[self.runn_i];
            if !rn.prepared || rn.active {
                break;
            }
            self.runn_i += 1;
        }
        (total, false)
    }
}

#[inline]
fn mix_sample(out: &mut [i16], idx: usize, l: f32, r: f32) {
    let li = (l * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
    let ri = (r * 32767.0).round().clamp(-32768.0, 32767.0) as i16;
    out[idx * 2] = out[idx * 2].saturating_add(li);
    out[idx * 2 + 1] = out[idx * 2 + 1].saturating_add(ri);
}

#[inline]
fn pm_to_i32(s: f32) -> i32 {
    (((s * 32767.0) as i32) as u32).wrapping_shl(16) as i32
}

/// Recursive block evaluator, signed-sample variant (carriers and phase
/// modulators); `wave_env` switches to the [0, 1] envelope variant used
/// for frequency and amplitude modulators. Siblings in a modulator list
/// accumulate: sums for signals, products for envelopes.
#[allow(clippy::too_many_arguments)]
fn run_block(
    ops: &mut [OperatorNode],
    tables: &'static WaveTables,
    coeff: f64,
    srate: u32,
    bufs: &mut [Buf],
    mut len: usize,
    op_i: usize,
    parent_freq: Option<&[f32]>,
    wave_env: bool,
    acc: bool,
) -> usize {
    let mut n = std::mem::take(&mut ops[op_i]);
    let (head, rest) = bufs.split_at_mut(2);
    let (sb, fb) = head.split_at_mut(1);
    let sbuf = &mut sb[0];
    let freq = &mut fb[0];
    let mut off = 0usize;
    // silence: zero-fill and delay processing for its duration
    let mut zero_len = 0usize;
    if n.silence > 0 {
        zero_len = (n.silence as usize).min(len);
        if !acc {
            sbuf[..zero_len].fill(0.0);
        }
        len -= zero_len;
        if n.time != TIME_INF {
            n.time -= zero_len as u32;
        }
        n.silence -= zero_len as u32;
        if len == 0 {
            ops[op_i] = n;
            return zero_len;
        }
        off = zero_len;
    }
    // limit to the operator's remaining time
    let mut skip_len = 0usize;
    if n.time != TIME_INF && (n.time as usize) < len {
        skip_len = len - n.time as usize;
        len = n.time as usize;
    }
    if len == 0 {
        if !acc && skip_len > 0 {
            sbuf[off..off + skip_len].fill(0.0);
        }
        ops[op_i] = n;
        return zero_len;
    }
    // frequency (or ratio) parameter, with frequency modulation if
    // modulators are linked
    n.freq.run(&mut n.freq_pos, &mut freq[..len], srate, parent_freq);
    if !n.pmods.is_empty() || !n.fmods.is_empty() || !n.amods.is_empty() {
        debug_assert!(rest.len() >= 2, "scratch buffers undersized");
    }
    if !n.fmods.is_empty() {
        for (k, &m) in n.fmods.iter().enumerate() {
            run_block(
                ops,
                tables,
                coeff,
                srate,
                rest,
                len,
                m,
                Some(&freq[..len]),
                true,
                k > 0,
            );
        }
        let dynf = if n.freq2.state || !n.freq2.goal {
            n.freq2.v0
        } else {
            n.freq2.vt
        };
        let fmbuf = &rest[0];
        match (n.freq2.state_ratio, parent_freq) {
            (true, Some(par)) => {
                for i in 0..len {
                    freq[i] += (dynf * par[i] - freq[i]) * fmbuf[i];
                }
            }
            _ => {
                for i in 0..len {
                    freq[i] += (dynf - freq[i]) * fmbuf[i];
                }
            }
        }
    }
    // phase modulator chain, evaluated as signed samples
    let mut has_pm = false;
    if !n.pmods.is_empty() {
        for (k, &m) in n.pmods.iter().enumerate() {
            run_block(
                ops,
                tables,
                coeff,
                srate,
                rest,
                len,
                m,
                Some(&freq[..len]),
                false,
                k > 0,
            );
        }
        has_pm = true;
    }
    let lut = tables.lut(n.wave);
    if !wave_env {
        // amplitude parameter, with amplitude modulation if modulators
        // are linked; the phase-offset buffer at the front of `rest`
        // stays untouched while they render behind it
        let mut amp_buf = [0.0f32; BUF_LEN];
        if !n.amods.is_empty() {
            {
                let (_, am_rest) = rest.split_at_mut(1);
                for (k, &m) in n.amods.iter().enumerate() {
                    run_block(
                        ops,
                        tables,
                        coeff,
                        srate,
                        am_rest,
                        len,
                        m,
                        Some(&freq[..len]),
                        true,
                        k > 0,
                    );
                }
            }
            let dynamp = if n.amp2.state || !n.amp2.goal {
                n.amp2.v0
            } else {
                n.amp2.vt
            };
            let amp0 = n.amp.v0;
            let dynamp_diff = dynamp - amp0;
            let am = &rest[1];
            for i in 0..len {
                amp_buf[i] = amp0 + am[i] * dynamp_diff;
            }
        } else {
            n.amp.run(&mut n.amp_pos, &mut amp_buf[..len], srate, None);
        }
        for i in 0..len {
            let pm = if has_pm { pm_to_i32(rest[0][i]) } else { 0 };
            let s = n.osc.run(lut, coeff, freq[i], pm) * amp_buf[i];
            if acc {
                sbuf[off + i] += s;
            } else {
                sbuf[off + i] = s;
            }
        }
    } else {
        for i in 0..len {
            let pm = if has_pm { pm_to_i32(rest[0][i]) } else { 0 };
            let s = n.osc.run_envo(lut, coeff, freq[i], pm);
            if acc {
                sbuf[off + i] *= s;
            } else {
                sbuf[off + i] = s;
            }
        }
    }
    // update remaining time, zero the rest of the buffer if unfilled
    if n.time != TIME_INF {
        if !acc && skip_len > 0 {
            sbuf[off + len..off + len + skip_len].fill(0.0);
        }
        n.time -= len as u32;
    }
    ops[op_i] = n;
    zero_len + len
}
