//! Script graph — the lowered, time-resolved form of a parse graph.
//!
//! Events are flat and in final order (composites spliced in), each with
//! the operator updates it carries, a carrier list when it introduces a
//! new operator graph, and per-operator modulation adjacency.

use super::ast::{OpParams, ScriptOptions, Time};
use crate::program::ramp::Ramp;
use crate::program::wave::Wave;

pub type SEvId = usize;
pub type SOpId = usize;

/// Operator data for one update.
#[derive(Debug, Clone, Default)]
pub struct ScriptOp {
    pub event: SEvId,
    /// Preceding update node for the same operator.
    pub op_prev: Option<SOpId>,
    /// A later update refers back to this node.
    pub later_used: bool,
    /// Member of a voice carrier list.
    pub carrier: bool,
    pub nested: bool,
    pub params: OpParams,
    pub time: Time,
    pub silence_ms: u32,
    pub wave: Wave,
    pub freq: Ramp,
    pub freq2: Ramp,
    pub amp: Ramp,
    pub amp2: Ramp,
    pub phase: f32,
    /// Modulator lists set on this update; `None` leaves the previous
    /// list in place.
    pub fmods: Option<Vec<SOpId>>,
    pub pmods: Option<Vec<SOpId>>,
    pub amods: Option<Vec<SOpId>>,
}

/// Event data, including the voice parameters that travel with it.
#[derive(Debug, Clone, Default)]
pub struct ScriptEvent {
    pub wait_ms: u32,
    /// Preceding event for the same voice.
    pub vo_prev: Option<SEvId>,
    pub voice_later_used: bool,
    /// This event (re)defines the voice's operator graph.
    pub new_graph: bool,
    pub pan: Ramp,
    /// The pan parameter is set by this event.
    pub pan_set: bool,
    /// All operator updates in this event.
    pub updates: Vec<SOpId>,
    /// Carrier operators for the (re)defined graph.
    pub carriers: Vec<SOpId>,
}

/// The lowered script: flat event list plus operator arena.
#[derive(Debug, Default)]
pub struct ScriptGraph {
    pub name: String,
    pub options: ScriptOptions,
    pub events: Vec<ScriptEvent>,
    pub ops: Vec<ScriptOp>,
}
