//! The audio program — a linear, time-ordered event stream.
//!
//! Each event carries a relative wait, an optional voice update (pan,
//! carrier graph) and any number of operator updates holding only the
//! parameters that change. Stable operator and voice IDs let the
//! generator keep flat state arrays. A program is immutable once built
//! and may be shared between generators.

pub mod build;
pub mod ramp;
pub mod wave;

use crate::dsl::ast::ScriptOptions;
use ramp::Ramp;
use wave::Wave;

/// Identifies an operator in the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(pub u32);

/// Identifies a voice in the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VoiceId(pub u32);

/// An operator duration: a finite span or linked/infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpTime {
    Ms(u32),
    Infinite,
}

/// Parameter changes for one operator; `None` leaves a parameter as is.
#[derive(Debug, Clone)]
pub struct OpUpdate {
    pub id: OpId,
    pub time: Option<OpTime>,
    pub silence_ms: Option<u32>,
    pub wave: Option<Wave>,
    pub freq: Option<Ramp>,
    pub freq2: Option<Ramp>,
    pub amp: Option<Ramp>,
    pub amp2: Option<Ramp>,
    pub phase: Option<f32>,
    pub fmods: Option<Vec<OpId>>,
    pub pmods: Option<Vec<OpId>>,
    pub amods: Option<Vec<OpId>>,
}

/// Parameter changes for a voice.
#[derive(Debug, Clone)]
pub struct VoiceUpdate {
    pub pan: Option<Ramp>,
    /// Carrier operators for a (re)defined operator graph.
    pub carriers: Option<Vec<OpId>>,
}

/// One program event.
#[derive(Debug, Clone)]
pub struct ProgramEvent {
    /// Delay relative to the previous event.
    pub wait_ms: u32,
    pub voice: VoiceId,
    pub voice_update: Option<VoiceUpdate>,
    pub ops: Vec<OpUpdate>,
}

/// A compiled script, ready for interpretation.
#[derive(Debug)]
pub struct Program {
    pub name: String,
    pub options: ScriptOptions,
    pub events: Vec<ProgramEvent>,
    pub voice_count: u32,
    pub op_count: u32,
    /// Upper bound of the program's sounding length.
    pub duration_ms: u32,
}

impl Program {
    /// One-line info summary, printed for `-p`.
    pub fn info(&self) -> String {
        format!(
            "program '{}': {} events, {} voices, {} operators, {:.3} s",
            self.name,
            self.events.len(),
            self.voice_count,
            self.op_count,
            self.duration_ms as f64 / 1000.0
        )
    }
}
