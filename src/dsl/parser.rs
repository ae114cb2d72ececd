//! Recursive-descent parser for the SAU script language.
//!
//! Parses a byte stream into a [`ParseGraph`] of events and operator
//! references. Scopes nest: TOP (a script line), BLOCK (`[...]`), BIND
//! (`@[...]`) and NEST (`~[...]` / `+[...]` modulator lists); each level
//! keeps its own [`ParseLevel`] record. Syntax errors are reported as
//! warnings and the offending construct is skipped; parsing always
//! produces a graph.

use std::collections::HashMap;
use std::rc::Rc;

use super::ast::*;
use super::note;
use super::scanner::{Scanner, WsMode, EOF, LNBRK, SPACE};
use crate::program::ramp::{Ramp, RampShape};
use crate::program::wave::Wave;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Top,
    Block,
    Bind,
    Nest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    None,
    Defaults,
    InEvent,
}

/// Named constants allowed inside a numeric expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumConst {
    None,
    Note,
    ChanMix,
}

// numeric expression precedence levels
const NUMEXP_SUB: u8 = 0;
const NUMEXP_ADT: u8 = 1;
const NUMEXP_MLT: u8 = 2;
const NUMEXP_POW: u8 = 3;
const NUMEXP_NUM: u8 = 4;

// deferred sub-parser flags for the parse_level loop
const HANDLE_DEFER: u8 = 1 << 0;
const DEFERRED_STEP: u8 = 1 << 1;
const DEFERRED_SETTINGS: u8 = 1 << 2;

/// Per-scope parse state.
struct ParseLevel {
    scope: Scope,
    location: Loc,
    list_kind: ListKind,
    last_list_kind: ListKind,
    nested_scope: bool,
    bind_multiple: bool,
    active_ev: bool,
    active_op: bool,
    event: Option<EvId>,
    last_event: Option<EvId>,
    op_ref: Option<OpId>,
    parent_op: Option<OpId>,
    first_op: Option<OpId>,
    last_op: Option<OpId>,
    list: Option<ListId>,
    set_label: Option<String>,
    group_from: Option<EvId>,
    composite: Option<EvId>,
    next_wait_ms: u32,
    /// A `\t` wait is pending: the previous event's duration is added
    /// to the next event's wait during lowering.
    wait_duration_pending: bool,
}

impl ParseLevel {
    fn new(scope: Scope, list_kind: ListKind) -> Self {
        Self {
            scope,
            location: Loc::None,
            list_kind,
            last_list_kind: list_kind,
            nested_scope: false,
            bind_multiple: false,
            active_ev: false,
            active_op: false,
            event: None,
            last_event: None,
            op_ref: None,
            parent_op: None,
            first_op: None,
            last_op: None,
            list: None,
            set_label: None,
            group_from: None,
            composite: None,
            next_wait_ms: 0,
            wait_duration_pending: false,
        }
    }
}

pub struct Parser {
    sc: Scanner,
    opts: ScriptOptions,
    events: Vec<ParseEvent>,
    ops: Vec<ParseOp>,
    lists: Vec<OpList>,
    first_event: Option<EvId>,
    cur_event: Option<EvId>,
    labels: HashMap<Rc<str>, OpId>,
}

impl Parser {
    pub fn new(source: &str, name: &str) -> Self {
        Self {
            sc: Scanner::new(source, name),
            opts: ScriptOptions::default(),
            events: Vec::new(),
            ops: Vec::new(),
            lists: Vec::new(),
            first_event: None,
            cur_event: None,
            labels: HashMap::new(),
        }
    }

    /// Parse the whole source into a graph.
    pub fn parse(mut self) -> ParseGraph {
        self.parse_level(None, ListKind::Graph, Scope::Top);
        ParseGraph {
            name: self.sc.name().to_string(),
            options: self.opts,
            events: self.events,
            ops: self.ops,
            lists: self.lists,
            first_event: self.first_event,
        }
    }

    /*
     * Scanning helpers
     */

    fn handle_unknown(&mut self, c: u8) -> bool {
        if c == EOF {
            return false;
        }
        if (b'!'..=b'~').contains(&c) {
            self.sc.warning(&format!("invalid character '{}'", c as char));
        } else {
            self.sc.warning(&format!("invalid character (value 0x{c:02X})"));
        }
        true
    }

    fn warn_eof_without_closing(&mut self, c: u8) {
        self.sc
            .warning(&format!("end of file without closing '{}'", c as char));
    }

    fn warn_closing_without_opening(&mut self, close_c: u8, open_c: u8) {
        self.sc.warning(&format!(
            "closing '{}' without opening '{}'",
            close_c as char, open_c as char
        ));
    }

    fn scan_chanmix_const(&mut self) -> Option<f64> {
        self.sc.skip_space();
        let save = self.sc.frame();
        match self.sc.getc_raw() {
            b'C' => Some(0.0),
            b'L' => Some(-1.0),
            b'R' => Some(1.0),
            _ => {
                self.sc.restore(save);
                None
            }
        }
    }

    fn read_num_operand(&mut self, nc: NumConst) -> Option<f64> {
        match nc {
            NumConst::Note => {
                let a4 = self.opts.a4_freq;
                if let Some(v) = note::scan_note(&mut self.sc, a4) {
                    return Some(v);
                }
            }
            NumConst::ChanMix => {
                if let Some(v) = self.scan_chanmix_const() {
                    return Some(v);
                }
            }
            NumConst::None => {}
        }
        self.sc.getd()
    }

    fn scan_num_r(&mut self, nc: NumConst, pri: u8, level: u32, has_inf: &mut bool) -> f64 {
        if level == 1 {
            self.sc.set_ws_mode(WsMode::None);
        }
        let mut c = self.sc.getc();
        if level == 0 && c == SPACE {
            c = self.sc.getc();
        }
        let mut minus = false;
        if level > 0 && (c == b'+' || c == b'-') {
            if c == b'-' {
                minus = true;
            }
            c = self.sc.getc();
        }
        let mut num;
        if c == b'(' {
            num = self.scan_num_r(nc, NUMEXP_SUB, level + 1, has_inf);
        } else {
            self.sc.ungetc();
            num = match self.read_num_operand(nc) {
                Some(v) => v,
                None => return f64::NAN,
            };
        }
        if num.is_nan() {
            return f64::NAN;
        }
        if minus {
            num = -num;
        }
        if level == 0 || pri == NUMEXP_NUM {
            return num; // defer all
        }
        loop {
            if num.is_infinite() {
                *has_inf = true;
            }
            let c = self.sc.getc();
            match c {
                b'(' if pri < NUMEXP_MLT => {
                    num *= self.scan_num_r(nc, NUMEXP_SUB, level + 1, has_inf);
                }
                b')' => {
                    if pri != NUMEXP_SUB {
                        self.sc.ungetc();
                    }
                    return num;
                }
                b'^' if pri < NUMEXP_POW => {
                    let r = self.scan_num_r(nc, NUMEXP_POW, level, has_inf);
                    num = (num.ln() * r).exp();
                }
                b'*' if pri < NUMEXP_MLT => {
                    num *= self.scan_num_r(nc, NUMEXP_MLT, level, has_inf);
                }
                b'/' if pri < NUMEXP_MLT => {
                    num /= self.scan_num_r(nc, NUMEXP_MLT, level, has_inf);
                }
                b'+' if pri < NUMEXP_ADT => {
                    num += self.scan_num_r(nc, NUMEXP_ADT, level, has_inf);
                }
                b'-' if pri < NUMEXP_ADT => {
                    num -= self.scan_num_r(nc, NUMEXP_ADT, level, has_inf);
                }
                _ => {
                    if pri == NUMEXP_SUB {
                        self.sc
                            .warning("numerical expression has '(' without closing ')'");
                    }
                    self.sc.ungetc();
                    return num;
                }
            }
            if num.is_nan() {
                return num;
            }
        }
    }

    fn scan_num(&mut self, nc: NumConst) -> Option<f32> {
        let start = self.sc.frame();
        let ws = self.sc.ws_mode();
        let mut has_inf = false;
        let num = self.scan_num_r(nc, NUMEXP_NUM, 0, &mut has_inf);
        self.sc.set_ws_mode(ws); // restore if changed
        if num.is_nan() {
            return None;
        }
        if num.is_infinite() {
            has_inf = true;
        }
        if has_inf {
            self.sc
                .warning_at(&start, "discarding expression with infinite number");
            return None;
        }
        Some(num as f32)
    }

    fn scan_time_val(&mut self) -> Option<u32> {
        let start = self.sc.frame();
        let v = self.scan_num(NumConst::None)?;
        if v < 0.0 {
            self.sc.warning_at(&start, "discarding negative time value");
            return None;
        }
        Some((v as f64 * 1000.0).round() as u32)
    }

    fn scan_label(&mut self, op: u8) -> Option<String> {
        let sym = self.sc.get_symstr();
        if sym.is_none() {
            self.sc
                .warning(&format!("ignoring {} without label name", op as char));
        }
        sym
    }

    fn scan_name(&mut self, names: &[&str], what: &str) -> Option<usize> {
        let start = self.sc.frame();
        let Some(sym) = self.sc.get_symstr() else {
            self.sc.warning(&format!("{what} type value missing"));
            return None;
        };
        match names.iter().position(|&n| n == sym) {
            Some(i) => Some(i),
            None => {
                self.sc.warning_at(
                    &start,
                    &format!(
                        "invalid {what} type value; available are: {}",
                        names.join(", ")
                    ),
                );
                None
            }
        }
    }

    fn scan_wavetype(&mut self) -> Option<Wave> {
        self.scan_name(&Wave::NAMES, "wave").map(|i| Wave::ALL[i])
    }

    fn scan_ramp_state(&mut self, nc: NumConst, ramp: &mut Ramp, mult: bool) -> bool {
        let Some(v) = self.scan_num(nc) else {
            return false;
        };
        ramp.v0 = v;
        ramp.state_ratio = mult;
        ramp.state = true;
        true
    }

    fn scan_ramp(&mut self, nc: NumConst, ramp: &mut Ramp, mult: bool) -> bool {
        if !self.sc.tryc(b'{') {
            return self.scan_ramp_state(nc, ramp, mult);
        }
        let mut goal = false;
        let mut time_set = ramp.time_set;
        let mut vt = 0.0f32;
        let mut time_ms = self.opts.def_time_ms;
        let mut shape = ramp.shape;
        if ramp.goal {
            // allow partial change of an earlier goal
            if ramp.goal_ratio == mult {
                goal = true;
                vt = ramp.vt;
            }
            time_ms = ramp.time_ms;
        }
        loop {
            let c = self.sc.getc();
            match c {
                SPACE | LNBRK => {}
                b'c' => {
                    if let Some(i) = self.scan_name(&RampShape::NAMES, "ramp") {
                        shape = RampShape::from_name(RampShape::NAMES[i]).unwrap_or(shape);
                    }
                }
                b't' => {
                    if let Some(ms) = self.scan_time_val() {
                        time_ms = ms;
                        time_set = true;
                    }
                }
                b'v' => {
                    if let Some(v) = self.scan_num(nc) {
                        vt = v;
                        goal = true;
                    }
                }
                b'}' => break,
                _ => {
                    if !self.handle_unknown(c) {
                        self.warn_eof_without_closing(b'}');
                        break;
                    }
                }
            }
        }
        if !goal {
            self.sc.warning("ignoring value ramp with no target value");
            return false;
        }
        ramp.vt = vt;
        ramp.time_ms = time_ms;
        ramp.shape = shape;
        ramp.goal = true;
        ramp.goal_ratio = mult;
        ramp.time_set = time_set;
        true
    }

    /*
     * Node- and scope-handling
     */

    fn new_list(&mut self, kind: ListKind) -> ListId {
        let id = self.lists.len();
        self.lists.push(OpList {
            kind,
            refs: Vec::new(),
        });
        id
    }

    /// Add an operator reference to the current target list: the event's
    /// graph list for graph refs and updates, the scope's modulator list
    /// for newly added nested operators.
    fn list_operator(&mut self, pl: &mut ParseLevel, op: OpId, mode: RefMode) -> ListKind {
        let kind;
        if pl.list_kind == ListKind::Graph || mode == RefMode::Update {
            let e = pl.event.expect("operator listed without event");
            self.events[e].op_list.refs.push(OpRef { op, mode });
            kind = ListKind::Graph;
        } else {
            let li = pl.list.expect("nested scope without list");
            self.lists[li].refs.push(OpRef { op, mode });
            kind = self.lists[li].kind;
        }
        pl.op_ref = Some(op);
        if pl.first_op.is_none() {
            pl.first_op = Some(op);
        }
        pl.last_list_kind = pl.list_kind;
        kind
    }

    fn end_operator(&mut self, pl: &mut ParseLevel) {
        if !pl.active_op {
            return;
        }
        pl.active_op = false;
        let op = pl.op_ref.expect("active operator without ref");
        let prev = self.ops[op].prev;
        let prev_wave = prev.map(|p| self.ops[p].wave);
        let ampmult = self.opts.ampmult;
        let o = &mut self.ops[op];
        if o.freq.is_enabled() {
            o.params.freq = true;
        }
        if o.freq2.is_enabled() {
            o.params.freq2 = true;
        }
        if o.amp.is_enabled() {
            o.params.amp = true;
            if !o.nested {
                o.amp.v0 *= ampmult;
                o.amp.vt *= ampmult;
            }
        }
        if o.amp2.is_enabled() {
            o.params.amp2 = true;
            if !o.nested {
                o.amp2.v0 *= ampmult;
                o.amp2.vt *= ampmult;
            }
        }
        match prev_wave {
            None => {
                // reset all operator state for the initial node
                o.params = OpParams::all();
            }
            Some(w) => {
                if o.wave != w {
                    o.params.wave = true;
                }
                if o.silence_ms != 0 {
                    o.params.silence = true;
                }
            }
        }
        pl.op_ref = None;
        pl.last_op = Some(op);
    }

    fn end_event(&mut self, pl: &mut ParseLevel) {
        if !pl.active_ev {
            return;
        }
        pl.active_ev = false;
        let e = pl.event.expect("active event without id");
        self.end_operator(pl);
        pl.last_event = Some(e);
        pl.event = None;
    }

    fn begin_event(&mut self, pl: &mut ParseLevel, pve: Option<EvId>, is_composite: bool) {
        self.end_event(pl);
        let e = self.events.len();
        self.events.push(ParseEvent::default());
        pl.event = Some(e);
        self.events[e].wait_ms = pl.next_wait_ms;
        pl.next_wait_ms = 0;
        if let Some(pve) = pve {
            if is_composite {
                if pl.composite.is_none() {
                    self.events[pve].composite = Some(e);
                    pl.composite = Some(pve);
                } else {
                    self.events[pve].next = Some(e);
                }
            }
            self.events[e].vo_prev = Some(pve);
        } else {
            // new voice with initial parameter values
            self.events[e].pan.v0 = self.opts.def_chanmix;
            self.events[e].pan.state = true;
        }
        if pl.group_from.is_none() {
            pl.group_from = Some(e);
        }
        if !is_composite {
            if pl.wait_duration_pending {
                if let Some(prev) = self.cur_event {
                    self.events[prev].add_wait_duration = true;
                }
                pl.wait_duration_pending = false;
            }
            match self.cur_event {
                None => self.first_event = Some(e),
                Some(cur) => self.events[cur].next = Some(e),
            }
            self.cur_event = Some(e);
            pl.composite = None;
        }
        pl.active_ev = true;
    }

    /// Begin a new operator node - in the present event, or in a new
    /// event begun for it.
    fn begin_operator(
        &mut self,
        pl: &mut ParseLevel,
        prev: Option<OpId>,
        ref_mode: RefMode,
        is_composite: bool,
    ) {
        if pl.event.is_none()
            || pl.location != Loc::InEvent
            || pl.next_wait_ms != 0
            || pl.wait_duration_pending
            || is_composite
        {
            let pve = prev.map(|p| self.ops[p].event);
            self.begin_event(pl, pve, is_composite);
        }
        let e = pl.event.expect("begin_operator without event");
        self.end_operator(pl);
        let op = self.ops.len();
        self.ops.push(ParseOp::default());
        if !is_composite {
            if let Some(lo) = pl.last_op {
                self.ops[lo].next_bound = Some(op);
            }
        }
        let listed_kind = self.list_operator(pl, op, ref_mode);
        // initialize node
        self.ops[op].event = e;
        self.ops[op].time.ms = self.opts.def_time_ms; // time is not copied
        if let Some(pop) = prev {
            let (pop_nested, pop_multiple, pop_wave, pop_phase) = {
                let p = &self.ops[pop];
                (p.nested, p.multiple, p.wave, p.phase)
            };
            self.ops[op].prev = Some(pop);
            self.ops[op].nested = pop_nested;
            self.ops[op].multiple = pop_multiple;
            if is_composite {
                self.ops[pop].has_composite = true;
            } else {
                self.ops[op].time.set = true;
            }
            self.ops[op].wave = pop_wave;
            self.ops[op].phase = pop_phase;
            if pl.bind_multiple {
                let mut max_time = 0;
                let mut m = Some(pop);
                while let Some(mi) = m {
                    max_time = max_time.max(self.ops[mi].time.ms);
                    m = self.ops[mi].next_bound;
                }
                self.ops[op].multiple = true;
                self.ops[op].time.ms = max_time;
                pl.bind_multiple = false;
            }
        } else {
            // new operator with initial parameter values
            if listed_kind == ListKind::Graph {
                self.ops[op].freq.v0 = self.opts.def_freq;
            } else {
                self.ops[op].nested = true;
                self.ops[op].freq.v0 = self.opts.def_relfreq;
                self.ops[op].freq.state_ratio = true;
            }
            self.ops[op].freq.state = true;
            self.ops[op].amp.v0 = 1.0;
            self.ops[op].amp.state = true;
        }
        // Assign label. Without a new label, a previous node's label (for
        // a non-composite) moves to the new node.
        if let Some(name) = pl.set_label.take() {
            let rc: Rc<str> = name.into();
            self.ops[op].label = Some(rc.clone());
            self.labels.insert(rc, op);
        } else if !is_composite {
            if let Some(pop) = prev {
                if let Some(rc) = self.ops[pop].label.clone() {
                    self.ops[op].label = Some(rc.clone());
                    self.labels.insert(rc, op);
                }
            }
        }
        pl.active_op = true;
    }

    fn begin_scope(
        &mut self,
        parent: Option<&ParseLevel>,
        list_kind: ListKind,
        scope: Scope,
    ) -> ParseLevel {
        let mut pl = ParseLevel::new(scope, list_kind);
        let Some(par) = parent else {
            pl.list = Some(self.new_list(list_kind));
            return pl;
        };
        pl.nested_scope = par.nested_scope;
        pl.bind_multiple = par.bind_multiple;
        pl.location = par.location;
        pl.event = par.event;
        pl.op_ref = par.op_ref;
        pl.parent_op = par.parent_op;
        match scope {
            Scope::Block => {
                pl.group_from = par.group_from;
                pl.list = par.list;
            }
            Scope::Bind => {
                pl.group_from = par.group_from;
                pl.list = Some(self.new_list(list_kind));
            }
            Scope::Nest => {
                pl.nested_scope = true;
                pl.parent_op = par.op_ref;
                pl.list = Some(self.new_list(list_kind));
            }
            Scope::Top => {}
        }
        pl
    }

    fn end_scope(&mut self, pl: &mut ParseLevel, mut parent: Option<&mut ParseLevel>) {
        self.end_operator(pl);
        if pl.set_label.is_some() {
            self.sc
                .warning("ignoring label assignment without operator");
            pl.set_label = None;
        }
        match pl.scope {
            Scope::Top => {
                // end of script: end the last event and terminate the
                // final group
                self.end_event(pl);
                let group_to = pl.composite.or(pl.last_event);
                if let Some(gt) = group_to {
                    self.events[gt].group_from = pl.group_from;
                }
            }
            Scope::Block => {
                let par = parent.as_deref_mut().expect("block scope without parent");
                if par.group_from.is_none() {
                    par.group_from = pl.group_from;
                }
                if pl.active_ev {
                    self.end_event(par);
                    par.active_ev = true;
                    par.event = pl.event;
                }
                if pl.last_event.is_some() {
                    par.last_event = pl.last_event;
                }
            }
            Scope::Bind => {
                let par = parent.as_deref_mut().expect("bind scope without parent");
                if par.group_from.is_none() {
                    par.group_from = pl.group_from;
                }
                // Begin a multiple-operator node in the parent scope for
                // the operators of this scope, if any are present.
                if let Some(first) = pl.first_op {
                    par.bind_multiple = true;
                    let saved = par.list_kind;
                    par.list_kind = par.last_list_kind;
                    self.begin_operator(par, Some(first), RefMode::Update, false);
                    par.list_kind = saved;
                }
            }
            Scope::Nest => {
                if let Some(pop) = pl.parent_op {
                    let li = pl.list.expect("nest scope without list");
                    self.ops[pop].nest_lists.push(li);
                }
            }
        }
    }

    /*
     * Main parser functions
     */

    fn parse_waittime(&mut self, pl: &mut ParseLevel) -> bool {
        if self.sc.tryc(b't') {
            if pl.event.is_none() && pl.last_event.is_none() {
                self.sc
                    .warning("add wait for last duration before any parts given");
                return false;
            }
            pl.wait_duration_pending = true;
            true
        } else {
            match self.scan_time_val() {
                Some(ms) => {
                    pl.next_wait_ms += ms;
                    true
                }
                None => false,
            }
        }
    }

    fn parse_settings(&mut self, pl: &mut ParseLevel) -> bool {
        pl.location = Loc::Defaults;
        loop {
            let c = self.sc.getc();
            match c {
                SPACE => {}
                b'a' => {
                    if let Some(v) = self.scan_num(NumConst::None) {
                        self.opts.ampmult = v;
                        self.opts.ampmult_set = true;
                    }
                }
                b'c' => {
                    if let Some(v) = self.scan_num(NumConst::ChanMix) {
                        self.opts.def_chanmix = v;
                    }
                }
                b'f' => {
                    if let Some(v) = self.scan_num(NumConst::Note) {
                        self.opts.def_freq = v;
                    }
                }
                b'n' => {
                    if let Some(v) = self.scan_num(NumConst::None) {
                        if v < 1.0 {
                            self.sc
                                .warning("ignoring tuning frequency (Hz) below 1.0");
                        } else {
                            self.opts.a4_freq = v;
                        }
                    }
                }
                b'r' => {
                    if let Some(v) = self.scan_num(NumConst::None) {
                        self.opts.def_relfreq = v;
                    }
                }
                b't' => {
                    if let Some(ms) = self.scan_time_val() {
                        self.opts.def_time_ms = ms;
                    }
                }
                _ => {
                    self.sc.ungetc();
                    return true; // let parse_level take care of it
                }
            }
        }
    }

    fn parse_ev_amp(&mut self, pl: &mut ParseLevel) -> bool {
        let op = pl.op_ref.expect("amp step without operator");
        let mut amp = self.ops[op].amp;
        self.scan_ramp(NumConst::None, &mut amp, false);
        self.ops[op].amp = amp;
        if self.sc.tryc(b',') {
            let mut amp2 = self.ops[op].amp2;
            self.scan_ramp(NumConst::None, &mut amp2, false);
            self.ops[op].amp2 = amp2;
        }
        if self.sc.tryc(b'~') && self.sc.tryc(b'[') {
            self.ops[op].params.adjcs = true;
            self.parse_level(Some(pl), ListKind::AMod, Scope::Nest);
        }
        false
    }

    fn parse_ev_chanmix(&mut self, pl: &mut ParseLevel) -> bool {
        let op = pl.op_ref.expect("chanmix step without operator");
        if self.ops[op].nested {
            return true; // reject
        }
        let e = pl.event.expect("chanmix step without event");
        let mut pan = self.events[e].pan;
        self.scan_ramp(NumConst::ChanMix, &mut pan, false);
        self.events[e].pan = pan;
        false
    }

    fn parse_ev_freq(&mut self, pl: &mut ParseLevel, rel_freq: bool) -> bool {
        let op = pl.op_ref.expect("freq step without operator");
        if rel_freq && !self.ops[op].nested {
            return true; // reject
        }
        let nc = if rel_freq {
            NumConst::None
        } else {
            NumConst::Note
        };
        let mut freq = self.ops[op].freq;
        self.scan_ramp(nc, &mut freq, rel_freq);
        self.ops[op].freq = freq;
        if self.sc.tryc(b',') {
            let mut freq2 = self.ops[op].freq2;
            self.scan_ramp(nc, &mut freq2, rel_freq);
            self.ops[op].freq2 = freq2;
        }
        if self.sc.tryc(b'~') && self.sc.tryc(b'[') {
            self.ops[op].params.adjcs = true;
            self.parse_level(Some(pl), ListKind::FMod, Scope::Nest);
        }
        false
    }

    fn parse_ev_phase(&mut self, pl: &mut ParseLevel) -> bool {
        let op = pl.op_ref.expect("phase step without operator");
        if let Some(v) = self.scan_num(NumConst::None) {
            let mut p = v % 1.0;
            if p < 0.0 {
                p += 1.0;
            }
            self.ops[op].phase = p;
            self.ops[op].params.phase = true;
        }
        if self.sc.tryc(b'+') && self.sc.tryc(b'[') {
            self.ops[op].params.adjcs = true;
            self.parse_level(Some(pl), ListKind::PMod, Scope::Nest);
        }
        false
    }

    fn parse_step(&mut self, pl: &mut ParseLevel) -> bool {
        if pl.op_ref.is_none() {
            eprintln!("error: parser: parse_step() called without operator");
            return false;
        }
        pl.location = Loc::InEvent;
        loop {
            let c = self.sc.getc();
            match c {
                SPACE => {}
                b'\\' => {
                    if self.parse_waittime(pl) {
                        let prev = pl.op_ref;
                        self.begin_operator(pl, prev, RefMode::Update, false);
                    }
                }
                b'a' => {
                    if self.parse_ev_amp(pl) {
                        self.sc.ungetc();
                        return true;
                    }
                }
                b'c' => {
                    if self.parse_ev_chanmix(pl) {
                        self.sc.ungetc();
                        return true;
                    }
                }
                b'f' => {
                    if self.parse_ev_freq(pl, false) {
                        self.sc.ungetc();
                        return true;
                    }
                }
                b'p' => {
                    if self.parse_ev_phase(pl) {
                        self.sc.ungetc();
                        return true;
                    }
                }
                b'r' => {
                    if self.parse_ev_freq(pl, true) {
                        self.sc.ungetc();
                        return true;
                    }
                }
                b's' => {
                    let op = pl.op_ref.expect("silence step without operator");
                    if let Some(ms) = self.scan_time_val() {
                        self.ops[op].silence_ms = ms;
                    }
                }
                b't' => {
                    let op = pl.op_ref.expect("time step without operator");
                    if self.sc.tryc(b'*') {
                        // later fitted or kept to default
                        self.ops[op].time = Time {
                            ms: self.opts.def_time_ms,
                            set: false,
                            linked: false,
                        };
                    } else if self.sc.tryc(b'i') {
                        if !self.ops[op].nested {
                            self.sc.warning(
                                "ignoring 'ti' (infinite time) for non-nested operator",
                            );
                            continue;
                        }
                        self.ops[op].time.set = true;
                        self.ops[op].time.linked = true;
                    } else {
                        let Some(ms) = self.scan_time_val() else {
                            continue;
                        };
                        self.ops[op].time = Time {
                            ms,
                            set: true,
                            linked: false,
                        };
                    }
                    self.ops[op].params.time = true;
                }
                b'w' => {
                    let op = pl.op_ref.expect("wave step without operator");
                    if let Some(w) = self.scan_wavetype() {
                        self.ops[op].wave = w;
                    }
                }
                _ => {
                    self.sc.ungetc();
                    return true; // let parse_level take care of it
                }
            }
        }
    }

    fn parse_level(
        &mut self,
        mut parent: Option<&mut ParseLevel>,
        list_kind: ListKind,
        new_scope: Scope,
    ) -> bool {
        let mut pl = self.begin_scope(parent.as_deref(), list_kind, new_scope);
        let mut flags: u8 = 0;
        let mut endscope = false;
        let mut eof_unclosed = false;
        'main: loop {
            let c = self.sc.getc();
            match c {
                SPACE => {}
                LNBRK => {
                    if pl.scope == Scope::Top {
                        // on the top level, each line has a new "subscope"
                        flags = 0;
                        pl.location = Loc::None;
                        pl.first_op = None;
                    }
                }
                b'\'' => {
                    // label assignment (set to what follows)
                    if pl.set_label.is_some() {
                        self.sc
                            .warning("ignoring label assignment to label assignment");
                    } else if let Some(name) = self.scan_label(b'\'') {
                        pl.set_label = Some(name);
                    }
                }
                b';' => {
                    if pl.location == Loc::Defaults || pl.event.is_none() {
                        self.handle_unknown(c);
                    } else {
                        let prev = pl.op_ref;
                        self.begin_operator(&mut pl, prev, RefMode::Update, true);
                        flags = if self.parse_step(&mut pl) {
                            HANDLE_DEFER | DEFERRED_STEP
                        } else {
                            0
                        };
                    }
                }
                b'@' => {
                    if self.sc.tryc(b'[') {
                        self.end_operator(&mut pl);
                        let lk = pl.list_kind;
                        if self.parse_level(Some(&mut pl), lk, Scope::Bind) {
                            break 'main;
                        }
                        // multiple-operator node now open
                        flags = if self.parse_step(&mut pl) {
                            HANDLE_DEFER | DEFERRED_STEP
                        } else {
                            0
                        };
                    } else {
                        // label reference (get and use value)
                        if pl.set_label.is_some() {
                            self.sc
                                .warning("ignoring label assignment to label reference");
                            pl.set_label = None;
                        }
                        pl.location = Loc::None;
                        if let Some(name) = self.scan_label(b'@') {
                            match self.labels.get(name.as_str()).copied() {
                                None => {
                                    self.sc
                                        .warning("ignoring reference to undefined label");
                                }
                                Some(r) => {
                                    self.begin_operator(&mut pl, Some(r), RefMode::Update, false);
                                    flags = if self.parse_step(&mut pl) {
                                        HANDLE_DEFER | DEFERRED_STEP
                                    } else {
                                        0
                                    };
                                }
                            }
                        }
                    }
                }
                b'O' => {
                    if let Some(wave) = self.scan_wavetype() {
                        self.begin_operator(&mut pl, None, RefMode::Add, false);
                        let op = pl.op_ref.expect("operator just begun");
                        self.ops[op].wave = wave;
                        flags = if self.parse_step(&mut pl) {
                            HANDLE_DEFER | DEFERRED_STEP
                        } else {
                            0
                        };
                    }
                }
                b'S' => {
                    flags = if self.parse_settings(&mut pl) {
                        HANDLE_DEFER | DEFERRED_SETTINGS
                    } else {
                        0
                    };
                }
                b'[' => {
                    let lk = pl.list_kind;
                    if self.parse_level(Some(&mut pl), lk, Scope::Block) {
                        break 'main;
                    }
                }
                b'\\' => {
                    if pl.location == Loc::Defaults || (pl.nested_scope && pl.event.is_some()) {
                        self.handle_unknown(c);
                    } else {
                        self.parse_waittime(&mut pl);
                    }
                }
                b']' => {
                    if pl.scope == Scope::Nest {
                        self.end_operator(&mut pl);
                    }
                    if pl.scope != Scope::Top {
                        endscope = true;
                        break 'main;
                    }
                    self.warn_closing_without_opening(b']', b'[');
                }
                b'|' => {
                    if pl.location == Loc::Defaults || (pl.nested_scope && pl.event.is_some()) {
                        self.handle_unknown(c);
                    } else if pl.event.is_none() {
                        self.sc
                            .warning("end of sequence before any parts given");
                    } else {
                        if pl.group_from.is_some() {
                            let group_to = pl.composite.unwrap_or_else(|| {
                                pl.event.expect("grouping without event")
                            });
                            self.events[group_to].group_from = pl.group_from;
                            pl.group_from = None;
                        }
                        self.end_event(&mut pl);
                        flags &= !DEFERRED_STEP;
                        pl.location = Loc::None;
                    }
                }
                b'}' => {
                    self.warn_closing_without_opening(b'}', b'{');
                }
                _ => {
                    if !self.handle_unknown(c) {
                        eof_unclosed = new_scope != Scope::Top;
                        break 'main;
                    }
                }
            }
            // return to sub-parsing routines
            if flags != 0 && (flags & HANDLE_DEFER) == 0 {
                let test = flags;
                flags = 0;
                if (test & DEFERRED_STEP) != 0 {
                    if self.parse_step(&mut pl) {
                        flags = HANDLE_DEFER | DEFERRED_STEP;
                    }
                } else if (test & DEFERRED_SETTINGS) != 0 && self.parse_settings(&mut pl) {
                    flags = HANDLE_DEFER | DEFERRED_SETTINGS;
                }
            }
            flags &= !HANDLE_DEFER;
        }
        if eof_unclosed {
            self.warn_eof_without_closing(b']');
        }
        self.end_scope(&mut pl, parent.as_deref_mut());
        // should return from the calling scope if/when the parent scope
        // is ended
        endscope && pl.scope != new_scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> ParseGraph {
        Parser::new(src, "test").parse()
    }

    fn chain(g: &ParseGraph) -> Vec<EvId> {
        let mut v = Vec::new();
        let mut e = g.first_event;
        while let Some(i) = e {
            v.push(i);
            e = g.events[i].next;
        }
        v
    }

    #[test]
    fn empty_script() {
        let g = parse("");
        assert!(g.first_event.is_none());
        assert!(g.events.is_empty());
    }

    #[test]
    fn settings_only() {
        let g = parse("S a0.5 f220 t2 r2 c1 n440");
        assert!(g.first_event.is_none());
        assert_eq!(g.options.ampmult, 0.5);
        assert!(g.options.ampmult_set);
        assert_eq!(g.options.def_freq, 220.0);
        assert_eq!(g.options.def_time_ms, 2000);
        assert_eq!(g.options.def_relfreq, 2.0);
        assert_eq!(g.options.def_chanmix, 1.0);
        assert_eq!(g.options.a4_freq, 440.0);
    }

    #[test]
    fn low_tuning_ignored() {
        let g = parse("S n0.5");
        assert_eq!(g.options.a4_freq, 444.0);
    }

    #[test]
    fn ampmult_tracked_only_when_assigned() {
        let g = parse("Osin t1");
        assert!(!g.options.ampmult_set);
        // assigning the default value still counts as set
        let g = parse("S a1");
        assert!(g.options.ampmult_set);
    }

    #[test]
    fn single_operator() {
        let g = parse("Osin f440 t0.5");
        assert_eq!(chain(&g).len(), 1);
        assert_eq!(g.ops.len(), 1);
        let op = &g.ops[0];
        assert_eq!(op.wave, Wave::Sin);
        assert_eq!(op.freq.v0, 440.0);
        assert!(op.freq.state);
        assert_eq!(op.time.ms, 500);
        assert!(op.time.set);
        assert!(!op.nested);
        // first node carries all parameters
        assert!(op.params.freq && op.params.time && op.params.wave);
    }

    #[test]
    fn operator_defaults() {
        let g = parse("Osin");
        let op = &g.ops[0];
        assert_eq!(op.freq.v0, 444.0);
        assert_eq!(op.time.ms, 1000);
        assert!(!op.time.set);
        assert_eq!(op.amp.v0, 1.0);
    }

    #[test]
    fn ampmult_applied_to_carrier() {
        let g = parse("S a0.5\nOsin a1");
        assert_eq!(g.ops[0].amp.v0, 0.5);
    }

    #[test]
    fn wait_creates_second_event() {
        let g = parse("Osin t1 \\0.25 f220");
        let evs = chain(&g);
        assert_eq!(evs.len(), 2);
        assert_eq!(g.events[evs[1]].wait_ms, 250);
        // second node updates the same operator
        assert_eq!(g.ops.len(), 2);
        assert_eq!(g.ops[1].prev, Some(0));
    }

    #[test]
    fn wait_for_duration_flags_event() {
        let g = parse("Osin t0.5 \\t Osin t0.5");
        let evs = chain(&g);
        assert_eq!(evs.len(), 2);
        assert!(g.events[evs[0]].add_wait_duration);
    }

    #[test]
    fn two_ops_one_line_share_event() {
        let g = parse("Osin t1 Osin t2");
        let evs = chain(&g);
        assert_eq!(evs.len(), 1);
        assert_eq!(g.events[evs[0]].op_list.refs.len(), 2);
    }

    #[test]
    fn lines_make_new_voices() {
        let g = parse("Osin t1\nOsin t1");
        let evs = chain(&g);
        assert_eq!(evs.len(), 2);
        assert!(g.events[evs[0]].vo_prev.is_none());
        assert!(g.events[evs[1]].vo_prev.is_none());
    }

    #[test]
    fn composite_chain() {
        let g = parse("Osin f440 t0.1; t0.1 f880; t0.1 f1320");
        let evs = chain(&g);
        assert_eq!(evs.len(), 1);
        let main = evs[0];
        let c1 = g.events[main].composite.expect("composite chain");
        let c2 = g.events[c1].next.expect("second composite");
        assert!(g.events[c2].next.is_none());
        assert!(g.ops[0].has_composite);
        // composite steps chain the same operator
        assert_eq!(g.ops[1].prev, Some(0));
        assert_eq!(g.ops[2].prev, Some(1));
    }

    #[test]
    fn nest_scope_adds_modulator_list() {
        let g = parse("Osin f137 p+[Osin f32]");
        assert_eq!(g.ops.len(), 2);
        let car = &g.ops[0];
        assert_eq!(car.nest_lists.len(), 1);
        let li = car.nest_lists[0];
        assert_eq!(g.lists[li].kind, ListKind::PMod);
        assert_eq!(g.lists[li].refs.len(), 1);
        let m = &g.ops[g.lists[li].refs[0].op];
        assert!(m.nested);
        assert!(car.params.adjcs);
    }

    #[test]
    fn fm_and_am_lists() {
        let g = parse("Osin f100~[Osin f3] a0.5~[Osin f7]");
        let car = &g.ops[0];
        assert_eq!(car.nest_lists.len(), 2);
        assert_eq!(g.lists[car.nest_lists[0]].kind, ListKind::FMod);
        assert_eq!(g.lists[car.nest_lists[1]].kind, ListKind::AMod);
    }

    #[test]
    fn nested_operator_uses_relfreq_default() {
        let g = parse("Osin f100 p+[Osin]");
        let m = &g.ops[1];
        assert!(m.nested);
        assert_eq!(m.freq.v0, 1.0);
        assert!(m.freq.state_ratio);
    }

    #[test]
    fn relfreq_rejected_on_carrier() {
        // 'r' on a non-nested operator is invalid and skipped
        let g = parse("Osin r2 t1");
        assert!(!g.ops[0].freq.state_ratio);
        // the r and 2 were not consumed as a step; time still parsed
        assert_eq!(g.ops[0].time.ms, 1000);
    }

    #[test]
    fn label_definition_and_reference() {
        let g = parse("'x Osin f100 t1\n@x f200");
        assert_eq!(g.ops.len(), 2);
        assert_eq!(g.ops[0].label.as_deref(), Some("x"));
        assert_eq!(g.ops[1].prev, Some(0));
        assert_eq!(g.ops[1].freq.v0, 200.0);
        // update node keeps default time but marked set
        assert!(g.ops[1].time.set);
    }

    #[test]
    fn undefined_label_ignored() {
        let g = parse("@nope f100");
        assert!(g.ops.is_empty());
    }

    #[test]
    fn infinite_time_on_nested_only() {
        let g = parse("Osin ti");
        assert!(!g.ops[0].time.linked, "ti rejected on carrier");
        let g = parse("Osin p+[Osin ti]");
        assert!(g.ops[1].time.linked);
        assert!(g.ops[1].time.set);
    }

    #[test]
    fn time_reset_clears_set() {
        let g = parse("Osin t2 t*");
        assert!(!g.ops[0].time.set);
        assert_eq!(g.ops[0].time.ms, 1000);
    }

    #[test]
    fn silence_parsed() {
        let g = parse("Osin s0.25 t1");
        assert_eq!(g.ops[0].silence_ms, 250);
        assert!(g.ops[0].params.silence);
    }

    #[test]
    fn phase_wraps_into_unit() {
        let g = parse("Osin p1.25");
        assert!((g.ops[0].phase - 0.25).abs() < 1e-6);
        let g = parse("Osin p(0-0.25)");
        assert!((g.ops[0].phase - 0.75).abs() < 1e-6);
    }

    #[test]
    fn ramp_body_parsed() {
        let g = parse("Osin f{v880 t0.5 c lin} t1");
        let f = &g.ops[0].freq;
        assert!(f.goal);
        assert_eq!(f.vt, 880.0);
        assert_eq!(f.time_ms, 500);
        assert!(f.time_set);
        assert_eq!(f.shape, RampShape::Lin);
    }

    #[test]
    fn ramp_without_goal_discarded() {
        let g = parse("Osin f{t0.5} t1");
        assert!(!g.ops[0].freq.goal);
        // state from the default initial value remains
        assert!(g.ops[0].freq.state);
    }

    #[test]
    fn second_ramp_after_comma() {
        let g = parse("Osin f100,200 t1");
        assert_eq!(g.ops[0].freq.v0, 100.0);
        assert_eq!(g.ops[0].freq2.v0, 200.0);
        assert!(g.ops[0].freq2.state);
    }

    #[test]
    fn numeric_expressions() {
        let g = parse("Osin f(100+10*2)");
        assert_eq!(g.ops[0].freq.v0, 120.0);
        let g = parse("Osin f(2^3*2)");
        assert_eq!(g.ops[0].freq.v0, 16.0);
        let g = parse("Osin f((1+1)*50)");
        assert_eq!(g.ops[0].freq.v0, 100.0);
    }

    #[test]
    fn division_by_zero_discarded() {
        let g = parse("Osin f(1/0)");
        // infinite result discarded; default kept
        assert_eq!(g.ops[0].freq.v0, 444.0);
    }

    #[test]
    fn note_constant_in_freq() {
        let g = parse("Osin fA4");
        assert!((g.ops[0].freq.v0 - 444.0).abs() < 1e-3);
    }

    #[test]
    fn chanmix_constants() {
        let g = parse("Osin cL t1");
        assert_eq!(g.events[0].pan.v0, -1.0);
        let g = parse("Osin cR t1");
        assert_eq!(g.events[0].pan.v0, 1.0);
    }

    #[test]
    fn chanmix_rejected_on_nested() {
        let g = parse("Osin f100 p+[Osin cL]");
        // pan unchanged from voice default
        assert_eq!(g.events[0].pan.v0, 0.0);
    }

    #[test]
    fn group_marks_events() {
        let g = parse("Osin t1 | Osin t2");
        let evs = chain(&g);
        assert_eq!(evs.len(), 2);
        assert_eq!(g.events[evs[0]].group_from, Some(evs[0]));
        // final group terminated by end of script
        assert_eq!(g.events[evs[1]].group_from, Some(evs[1]));
    }

    #[test]
    fn negative_time_discarded() {
        let g = parse("Osin t(0-1)");
        assert!(!g.ops[0].time.set);
        assert_eq!(g.ops[0].time.ms, 1000);
    }

    #[test]
    fn unknown_wave_skips_operator() {
        let g = parse("Ofoo t1");
        assert!(g.ops.is_empty());
    }

    #[test]
    fn unclosed_scope_survives() {
        let g = parse("Osin f100 p+[Osin f10");
        assert_eq!(g.ops.len(), 2);
        assert_eq!(g.ops[0].nest_lists.len(), 1);
    }

    #[test]
    fn bind_scope_makes_multiple_node() {
        let g = parse("@[Osin t1 Osin t2] f100");
        // two bound ops plus the multiple-operator update node
        assert_eq!(g.ops.len(), 3);
        let multi = &g.ops[2];
        assert!(multi.multiple);
        assert_eq!(multi.time.ms, 2000);
        assert_eq!(g.ops[0].next_bound, Some(1));
    }

    #[test]
    fn comment_and_quit() {
        let g = parse("Osin t1 #! comment f9999\nOsin t2");
        assert_eq!(g.ops.len(), 2);
        let g = parse("Osin t1\n#Q\nOsin t2");
        assert_eq!(g.ops.len(), 1);
    }

    #[test]
    fn composite_label_stays_on_main() {
        let g = parse("'x Osin t0.2; t0.2\n@x f99");
        // the reference resolves to the main chain, not the composite step
        assert_eq!(g.ops.len(), 3);
        assert_eq!(g.ops[2].freq.v0, 99.0);
        assert_eq!(g.ops[2].prev, Some(0));
    }
}
