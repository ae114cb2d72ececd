//! Parse graph — the parser's output data.
//!
//! Events and operators live in index arenas; events chain through `next`
//! links, composite sub-events hang off their main event, and operator
//! references are grouped into typed lists (the voice graph per event,
//! modulator lists per nest scope).

use std::rc::Rc;

use crate::program::ramp::Ramp;
use crate::program::wave::Wave;

pub type EvId = usize;
pub type OpId = usize;
pub type ListId = usize;

/// What an operator list links into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListKind {
    /// Carriers directly linked from an event.
    #[default]
    Graph,
    /// Frequency modulators.
    FMod,
    /// Phase modulators.
    PMod,
    /// Amplitude modulators.
    AMod,
}

/// How an operator is referenced from a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefMode {
    /// A newly added operator.
    Add,
    /// An update of an already-listed operator.
    Update,
}

#[derive(Debug, Clone, Copy)]
pub struct OpRef {
    pub op: OpId,
    pub mode: RefMode,
}

#[derive(Debug, Clone, Default)]
pub struct OpList {
    pub kind: ListKind,
    pub refs: Vec<OpRef>,
}

/// Operator time with SET/LINKED tracking.
#[derive(Debug, Clone, Copy, Default)]
pub struct Time {
    pub ms: u32,
    pub set: bool,
    /// Duration inherited from the enclosing carrier.
    pub linked: bool,
}

/// Which operator parameters an update assigns.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpParams {
    pub time: bool,
    pub silence: bool,
    pub wave: bool,
    pub freq: bool,
    pub freq2: bool,
    pub amp: bool,
    pub amp2: bool,
    pub phase: bool,
    pub adjcs: bool,
}

impl OpParams {
    pub fn all() -> OpParams {
        OpParams {
            time: true,
            silence: true,
            wave: true,
            freq: true,
            freq2: true,
            amp: true,
            amp2: true,
            phase: true,
            adjcs: true,
        }
    }
}

/// Node for operator data.
#[derive(Debug, Clone, Default)]
pub struct ParseOp {
    pub event: EvId,
    /// Preceding node for the same operator.
    pub prev: Option<OpId>,
    /// Next operator bound into the same multiple-operator node.
    pub next_bound: Option<OpId>,
    pub label: Option<Rc<str>>,
    pub nested: bool,
    pub multiple: bool,
    pub has_composite: bool,
    pub silence_added: bool,
    pub params: OpParams,
    pub time: Time,
    pub silence_ms: u32,
    pub wave: Wave,
    pub freq: Ramp,
    pub freq2: Ramp,
    pub amp: Ramp,
    pub amp2: Ramp,
    pub phase: f32,
    /// Modulator lists opened on this node, in source order.
    pub nest_lists: Vec<ListId>,
}

/// Node for event data, including its voice parameters.
#[derive(Debug, Clone, Default)]
pub struct ParseEvent {
    pub next: Option<EvId>,
    /// Start of the group this event terminates, if any.
    pub group_from: Option<EvId>,
    /// Head of the composite chain attached to this event.
    pub composite: Option<EvId>,
    pub wait_ms: u32,
    /// Add the duration of this event's operator to the next event's wait.
    pub add_wait_duration: bool,
    /// Preceding event for the same voice.
    pub vo_prev: Option<EvId>,
    pub pan: Ramp,
    pub op_list: OpList,
}

/// Options set for a script, affecting parsing; the final state is
/// included in the parse result.
#[derive(Debug, Clone, Copy)]
pub struct ScriptOptions {
    /// Amplitude multiplier for non-modulator operators.
    pub ampmult: f32,
    /// The script assigned `ampmult` itself; when left at the default,
    /// output amplitude is divided across voices instead.
    pub ampmult_set: bool,
    /// A4 tuning for frequency as note.
    pub a4_freq: f32,
    pub def_time_ms: u32,
    pub def_freq: f32,
    pub def_relfreq: f32,
    pub def_chanmix: f32,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            ampmult: 1.0,
            ampmult_set: false,
            a4_freq: 444.0,
            def_time_ms: 1000,
            def_freq: 444.0,
            def_relfreq: 1.0,
            def_chanmix: 0.0,
        }
    }
}

/// The parser's result: arenas plus the head of the event chain.
#[derive(Debug, Default)]
pub struct ParseGraph {
    pub name: String,
    pub options: ScriptOptions,
    pub events: Vec<ParseEvent>,
    pub ops: Vec<ParseOp>,
    pub lists: Vec<OpList>,
    pub first_event: Option<EvId>,
}
