//! Parse graph lowering — timing inference, grouping, composite
//! flattening, and conversion into a [`ScriptGraph`].
//!
//! Four ordered passes run over the parse graph: the time pass resolves
//! default and linked durations, the composite pass spreads timing down
//! composite chains, the group pass synchronises `|`-terminated groups,
//! and the flatten pass splices composite chains into the main event
//! sequence. Conversion then produces flat per-event update lists with
//! carrier lists and modulation adjacency.

use super::ast::*;
use super::error::CompileError;
use super::script::*;

/// Lower a parse graph into a script graph.
pub fn lower(mut graph: ParseGraph) -> Result<ScriptGraph, CompileError> {
    // timing and grouping, in event order
    let mut e = graph.first_event;
    while let Some(ei) = e {
        time_event(&mut graph, ei);
        if graph.events[ei].group_from.is_some() {
            group_events(&mut graph, ei);
        }
        e = graph.events[ei].next;
    }
    let mut lw = Lowering::new(&mut graph);
    // Convert events, flattening the remaining list while proceeding.
    // Flattening must follow the timing pass; otherwise events cannot
    // always be arranged in the correct order.
    let mut pe = lw.graph.first_event;
    while let Some(ei) = pe {
        lw.add_event(ei)?;
        if lw.graph.events[ei].composite.is_some() {
            flatten_events(lw.graph, ei);
        }
        pe = lw.graph.events[ei].next;
    }
    Ok(ScriptGraph {
        name: lw.graph.name.clone(),
        options: lw.graph.options,
        events: lw.out_events,
        ops: lw.out_ops,
    })
}

fn time_ramp(ramp: &mut crate::program::ramp::Ramp, default_time_ms: u32) {
    if !ramp.time_set {
        ramp.time_ms = default_time_ms;
    }
}

fn time_operator(g: &mut ParseGraph, op: OpId) {
    let e = g.ops[op].event;
    if g.ops[op].nested && !g.ops[op].time.set {
        if !g.ops[op].has_composite {
            g.ops[op].time.linked = true;
        }
        g.ops[op].time.set = true;
    }
    if !g.ops[op].time.linked {
        let o = &mut g.ops[op];
        let d = o.time.ms;
        time_ramp(&mut o.freq, d);
        time_ramp(&mut o.freq2, d);
        time_ramp(&mut o.amp, d);
        time_ramp(&mut o.amp2, d);
        if !o.silence_added {
            o.time.ms += o.silence_ms;
            o.silence_added = true;
        }
    }
    if g.events[e].add_wait_duration {
        if let Some(next) = g.events[e].next {
            g.events[next].wait_ms += g.ops[op].time.ms;
        }
        g.events[e].add_wait_duration = false;
    }
    let lists = g.ops[op].nest_lists.clone();
    for li in lists {
        let refs: Vec<OpId> = g.lists[li].refs.iter().map(|r| r.op).collect();
        for r in refs {
            time_operator(g, r);
        }
    }
}

fn time_event(g: &mut ParseGraph, e: EvId) {
    // Adjust default ramp durations, handle silence, and the case of
    // adding the present duration to the next event's wait.
    let refs: Vec<OpId> = g.events[e].op_list.refs.iter().map(|r| r.op).collect();
    for op in refs {
        time_operator(g, op);
    }
    // Timing for composites - done before the event list is flattened.
    if let Some(first_ce) = g.events[e].composite {
        let mut ce = first_ce;
        let Some(&first_ref) = g.events[ce].op_list.refs.first().map(|r| &r.op) else {
            return;
        };
        let mut ce_op = first_ref;
        let Some(mut ce_op_prev) = g.ops[ce_op].prev else {
            return;
        };
        let e_op = ce_op_prev;
        g.ops[e_op].time.set = true; // always used from now on
        loop {
            g.events[ce].wait_ms += g.ops[ce_op_prev].time.ms;
            if !g.ops[ce_op].time.set {
                g.ops[ce_op].time.set = true;
                if g.ops[ce_op].nested && !g.ops[ce_op].has_composite {
                    g.ops[ce_op].time.linked = true;
                } else {
                    g.ops[ce_op].time.ms = g.ops[ce_op_prev]
                        .time
                        .ms
                        .saturating_sub(g.ops[ce_op_prev].silence_ms);
                }
            }
            time_event(g, ce);
            if g.ops[ce_op].time.linked {
                g.ops[e_op].time.linked = true;
            } else if !g.ops[e_op].time.linked {
                g.ops[e_op].time.ms += g.ops[ce_op].time.ms
                    + g.events[ce]
                        .wait_ms
                        .saturating_sub(g.ops[ce_op_prev].time.ms);
            }
            g.ops[ce_op].params.time = false;
            ce_op_prev = ce_op;
            match g.events[ce].next {
                None => break,
                Some(n) => {
                    ce = n;
                    match g.events[ce].op_list.refs.first() {
                        None => break,
                        Some(r) => ce_op = r.op,
                    }
                }
            }
        }
    }
}

/// Adjust timing for an event group; the script syntax for time grouping
/// is only allowed on the top operator level, so only those events are
/// involved.
fn group_events(g: &mut ParseGraph, to: EvId) {
    let e_after = g.events[to].next;
    let mut wait: u32 = 0;
    let mut waitcount: u32 = 0;
    let mut e = g.events[to].group_from;
    while e != e_after {
        let Some(ei) = e else { break };
        let refs = g.events[ei].op_list.refs.clone();
        for (k, r) in refs.iter().enumerate() {
            let op = r.op;
            if g.events[ei].next == e_after && k == refs.len() - 1 && !g.ops[op].time.set {
                // default for the last node in the group
                g.ops[op].time.set = true;
            }
            if wait < g.ops[op].time.ms {
                wait = g.ops[op].time.ms;
            }
        }
        e = g.events[ei].next;
        if let Some(en) = e {
            waitcount += g.events[en].wait_ms;
        }
    }
    let mut e = g.events[to].group_from;
    while e != e_after {
        let Some(ei) = e else { break };
        let refs = g.events[ei].op_list.refs.clone();
        for r in refs {
            let op = r.op;
            if !g.ops[op].time.set {
                // fill in a sensible default time
                g.ops[op].time.ms = wait + waitcount;
                g.ops[op].time.set = true;
            }
        }
        e = g.events[ei].next;
        if let Some(en) = e {
            waitcount -= g.events[en].wait_ms;
        }
    }
    g.events[to].group_from = None;
    if let Some(ea) = e_after {
        g.events[ea].wait_ms += wait;
    }
}

/// Splice the composite chain of `e` into the ordinary event sequence,
/// positioned by accumulated waits.
fn flatten_events(g: &mut ParseGraph, e: EvId) {
    let mut ce_opt = g.events[e].composite;
    let mut se_opt = g.events[e].next;
    let mut se_prev = e;
    let mut wait_ms: u32 = 0;
    let mut added_wait_ms: u32 = 0;
    while let Some(ce) = ce_opt {
        let Some(se) = se_opt else {
            // no more events in the ordinary sequence; append the rest
            g.events[se_prev].next = Some(ce);
            break;
        };
        // If several events pass in the ordinary sequence before the
        // next composite is inserted, skip ahead.
        wait_ms += g.events[se].wait_ms;
        if let Some(se_next) = g.events[se].next {
            if wait_ms + g.events[se_next].wait_ms <= g.events[ce].wait_ms + added_wait_ms {
                se_prev = se;
                se_opt = Some(se_next);
                continue;
            }
        }
        // Insert the next composite before or after the next ordinary
        // event.
        let ce_next = g.events[ce].next;
        if g.events[se].wait_ms >= g.events[ce].wait_ms + added_wait_ms {
            g.events[se].wait_ms -= g.events[ce].wait_ms + added_wait_ms;
            added_wait_ms = 0;
            wait_ms = 0;
            g.events[se_prev].next = Some(ce);
            se_prev = ce;
            g.events[se_prev].next = Some(se);
        } else {
            let se_next = g.events[se].next;
            g.events[ce].wait_ms = g.events[ce].wait_ms.saturating_sub(wait_ms);
            added_wait_ms += g.events[ce].wait_ms;
            wait_ms = 0;
            g.events[se].next = Some(ce);
            g.events[ce].next = se_next;
            se_prev = ce;
            se_opt = se_next;
        }
        ce_opt = ce_next;
    }
    g.events[e].composite = None;
}

/*
 * Conversion to script data.
 */

struct Lowering<'a> {
    graph: &'a mut ParseGraph,
    out_events: Vec<ScriptEvent>,
    out_ops: Vec<ScriptOp>,
    conv_op: Vec<Option<SOpId>>,
    conv_ev: Vec<Option<SEvId>>,
    ignored: Vec<bool>,
    /// Operator context: chain id per parse op, newest parse op per chain.
    op_ctx: Vec<Option<usize>>,
    op_newest: Vec<OpId>,
    /// Voice context: chain id per parse event, newest event per chain.
    ev_ctx: Vec<Option<usize>>,
    ev_newest: Vec<EvId>,
    cur_se: SEvId,
}

impl<'a> Lowering<'a> {
    fn new(graph: &'a mut ParseGraph) -> Self {
        let n_ops = graph.ops.len();
        let n_evs = graph.events.len();
        Self {
            graph,
            out_events: Vec::new(),
            out_ops: Vec::new(),
            conv_op: vec![None; n_ops],
            conv_ev: vec![None; n_evs],
            ignored: vec![false; n_ops],
            op_ctx: vec![None; n_ops],
            op_newest: Vec::new(),
            ev_ctx: vec![None; n_evs],
            ev_newest: Vec::new(),
            cur_se: 0,
        }
    }

    /// Convert one operator reference into script operator data for the
    /// current event. Nodes whose chain was never established (follow-ons
    /// of unhandled nodes) are marked ignored.
    fn add_opdata(&mut self, r: &OpRef, from_graph_list: bool) {
        let pod = r.op;
        // operator context for the node's update chain
        let ctx = match self.graph.ops[pod].prev {
            None => {
                self.op_newest.push(pod);
                self.op_newest.len() - 1
            }
            Some(prev) => match self.op_ctx[prev] {
                None => {
                    // follow-on node for a node not handled
                    self.ignored[pod] = true;
                    return;
                }
                Some(c) => c,
            },
        };
        let so = self.out_ops.len();
        let p = &self.graph.ops[pod];
        let mut od = ScriptOp {
            event: self.cur_se,
            nested: p.nested,
            params: p.params,
            time: p.time,
            silence_ms: p.silence_ms,
            wave: p.wave,
            freq: p.freq,
            freq2: p.freq2,
            amp: p.amp,
            amp2: p.amp2,
            phase: p.phase,
            ..ScriptOp::default()
        };
        if self.graph.ops[pod].prev.is_some() {
            let newest = self.op_newest[ctx];
            if let Some(od_prev) = self.conv_op[newest] {
                od.op_prev = Some(od_prev);
                self.out_ops[od_prev].later_used = true;
            }
        }
        if from_graph_list && r.mode == RefMode::Add {
            self.out_events[self.cur_se].new_graph = true;
            od.carrier = true;
        }
        self.out_ops.push(od);
        self.conv_op[pod] = Some(so);
        self.op_newest[ctx] = pod;
        self.op_ctx[pod] = Some(ctx);
        self.out_events[self.cur_se].updates.push(so);
    }

    /// Recursively create operator data nodes, visiting new operator
    /// nodes as they branch out.
    fn add_ops(&mut self, refs: &[OpRef], from_graph_list: bool) {
        for r in refs {
            let pod = r.op;
            if self.graph.ops[pod].multiple {
                // multiple-operator nodes are not handled
                self.ignored[pod] = true;
                continue;
            }
            self.add_opdata(r, from_graph_list);
            if self.ignored[pod] {
                continue;
            }
            let lists = self.graph.ops[pod].nest_lists.clone();
            for li in lists {
                let refs2 = self.graph.lists[li].refs.clone();
                self.add_ops(&refs2, false);
            }
        }
    }

    /// Recursively fill in lists for the operator graph, visiting all
    /// linked operator nodes as they branch out.
    fn link_ops(&mut self, refs: &[OpRef], is_carriers: bool) -> Result<Vec<SOpId>, CompileError> {
        let mut out = Vec::new();
        for r in refs {
            let pod = r.op;
            if self.ignored[pod] {
                continue;
            }
            let Some(so) = self.conv_op[pod] else {
                return Err(CompileError::build("converted node missing at some level"));
            };
            out.push(so);
            if is_carriers {
                self.out_ops[so].carrier = true;
            }
            let lists = self.graph.ops[pod].nest_lists.clone();
            for li in lists {
                let kind = self.graph.lists[li].kind;
                let refs2 = self.graph.lists[li].refs.clone();
                let sub = self.link_ops(&refs2, false)?;
                let slot = match kind {
                    ListKind::FMod => &mut self.out_ops[so].fmods,
                    ListKind::PMod => &mut self.out_ops[so].pmods,
                    ListKind::AMod => &mut self.out_ops[so].amods,
                    ListKind::Graph => continue,
                };
                slot.get_or_insert_with(Vec::new).extend(sub);
            }
        }
        Ok(out)
    }

    /// Convert one event and all its operator data.
    fn add_event(&mut self, pe: EvId) -> Result<(), CompileError> {
        let se = self.out_events.len();
        self.out_events.push(ScriptEvent::default());
        self.conv_ev[pe] = Some(se);
        self.cur_se = se;
        self.out_events[se].wait_ms = self.graph.events[pe].wait_ms;
        // voice context
        match self.graph.events[pe].vo_prev {
            None => {
                self.ev_newest.push(pe);
                self.ev_ctx[pe] = Some(self.ev_newest.len() - 1);
                self.out_events[se].new_graph = true;
            }
            Some(pv) => {
                let c = self.ev_ctx[pv]
                    .ok_or_else(|| CompileError::build("voice chain missing at some level"))?;
                let newest = self.ev_newest[c];
                if let Some(vo_prev) = self.conv_ev[newest] {
                    self.out_events[se].vo_prev = Some(vo_prev);
                    self.out_events[vo_prev].voice_later_used = true;
                }
                self.ev_newest[c] = pe;
                self.ev_ctx[pe] = Some(c);
            }
        }
        self.out_events[se].pan = self.graph.events[pe].pan;
        self.out_events[se].pan_set = self.graph.events[pe].pan.is_enabled()
            || self.graph.events[pe].vo_prev.is_none();
        let refs = self.graph.events[pe].op_list.refs.clone();
        self.add_ops(&refs, true);
        let new_graph = self.out_events[se].new_graph;
        let linked = self.link_ops(&refs, new_graph)?;
        if new_graph {
            self.out_events[se].carriers = linked;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::Parser;
    use super::*;

    fn lower_src(src: &str) -> ScriptGraph {
        lower(Parser::new(src, "test").parse()).expect("lowering failed")
    }

    #[test]
    fn empty_script_lowers_to_nothing() {
        let s = lower_src("");
        assert!(s.events.is_empty());
        assert!(s.ops.is_empty());
    }

    #[test]
    fn single_operator_event() {
        let s = lower_src("Osin f440 t0.5");
        assert_eq!(s.events.len(), 1);
        assert_eq!(s.ops.len(), 1);
        let e = &s.events[0];
        assert!(e.new_graph);
        assert_eq!(e.carriers, vec![0]);
        assert!(s.ops[0].carrier);
        assert!(e.pan_set);
        assert_eq!(s.ops[0].time.ms, 500);
    }

    #[test]
    fn ramp_default_time_is_op_time() {
        let s = lower_src("Osin f{v880} t0.5");
        assert_eq!(s.ops[0].freq.time_ms, 500);
        // explicit ramp times are kept
        let s = lower_src("Osin f{v880 t0.2} t0.5");
        assert_eq!(s.ops[0].freq.time_ms, 200);
    }

    #[test]
    fn silence_extends_time_once() {
        let s = lower_src("Osin s0.25 t1");
        assert_eq!(s.ops[0].time.ms, 1250);
    }

    #[test]
    fn nested_without_time_becomes_linked() {
        let s = lower_src("Osin f100 t1 p+[Osin f10]");
        let m = s
            .ops
            .iter()
            .find(|o| o.nested)
            .expect("nested op present");
        assert!(m.time.linked);
        assert!(m.time.set);
    }

    #[test]
    fn nested_with_time_not_linked() {
        let s = lower_src("Osin f100 t1 p+[Osin f10 t0.5]");
        let m = s.ops.iter().find(|o| o.nested).unwrap();
        assert!(!m.time.linked);
        assert_eq!(m.time.ms, 500);
    }

    #[test]
    fn modulator_adjacency_recorded() {
        let s = lower_src("Osin f137 t1 p+[Osin f32 p+[Osin f42]]");
        assert_eq!(s.ops.len(), 3);
        assert_eq!(s.ops[0].pmods.as_deref(), Some(&[1][..]));
        assert_eq!(s.ops[1].pmods.as_deref(), Some(&[2][..]));
        assert!(s.ops[2].pmods.is_none());
        // only the top operator is a carrier
        assert!(s.ops[0].carrier);
        assert!(!s.ops[1].carrier && !s.ops[2].carrier);
    }

    #[test]
    fn fm_and_am_adjacency() {
        let s = lower_src("Osin f100~[Osin f3] a1~[Osin f7] t1");
        assert_eq!(s.ops[0].fmods.as_deref(), Some(&[1][..]));
        assert_eq!(s.ops[0].amods.as_deref(), Some(&[2][..]));
        assert!(s.ops[0].pmods.is_none());
    }

    #[test]
    fn composite_timing_and_flattening() {
        let s = lower_src("Osin f440 t0.1; t0.1 f880; t0.1 f1320");
        // main + two composite steps, spliced into the main sequence
        assert_eq!(s.events.len(), 3);
        assert_eq!(s.events[0].wait_ms, 0);
        assert_eq!(s.events[1].wait_ms, 100);
        assert_eq!(s.events[2].wait_ms, 100);
        // the main operator's time covers the whole gesture
        assert_eq!(s.ops[0].time.ms, 300);
        // composite steps do not carry a time parameter update
        assert!(s.ops[0].params.time);
        assert!(!s.ops[1].params.time);
        assert!(!s.ops[2].params.time);
        // update chain is intact
        assert_eq!(s.ops[1].op_prev, Some(0));
        assert_eq!(s.ops[2].op_prev, Some(1));
        assert!(s.ops[0].later_used && s.ops[1].later_used);
    }

    #[test]
    fn composite_step_inherits_prev_duration() {
        let s = lower_src("Osin f440 t0.2; f880");
        // unset step takes previous duration
        assert_eq!(s.ops[1].time.ms, 200);
        assert_eq!(s.ops[0].time.ms, 400);
    }

    #[test]
    fn flatten_without_composites_is_identity() {
        let s = lower_src("Osin t0.5 \\0.5 f220");
        assert_eq!(s.events.len(), 2);
        assert_eq!(s.events[0].wait_ms, 0);
        assert_eq!(s.events[1].wait_ms, 500);
    }

    #[test]
    fn group_fills_unset_times_with_max() {
        let s = lower_src("Osin t2 Osin Osin t1");
        // middle operator had no explicit time; takes the group max
        assert_eq!(s.ops[1].time.ms, 2000);
        assert_eq!(s.ops[0].time.ms, 2000);
        assert_eq!(s.ops[2].time.ms, 1000);
    }

    #[test]
    fn group_wait_absorbed_by_next_event() {
        let s = lower_src("Osin t1 Osin t0.5 |\nOsin t1");
        assert_eq!(s.events.len(), 2);
        assert_eq!(s.events[1].wait_ms, 1000);
    }

    #[test]
    fn wait_duration_added_to_next_event() {
        let s = lower_src("Osin f200 t0.5 \\t Osin f400 t0.5");
        assert_eq!(s.events.len(), 2);
        assert_eq!(s.events[1].wait_ms, 500);
        // the second event holds the new carrier
        assert!(s.events[1].new_graph);
    }

    #[test]
    fn retiming_is_idempotent() {
        let mut g = Parser::new("Osin s0.25 t1", "test").parse();
        time_event(&mut g, 0);
        let t1 = g.ops[0].time.ms;
        time_event(&mut g, 0);
        assert_eq!(g.ops[0].time.ms, t1, "silence must be added only once");
    }

    #[test]
    fn update_chain_via_label() {
        let s = lower_src("'x Osin f100 t1\n@x f200");
        assert_eq!(s.events.len(), 2);
        assert_eq!(s.ops[1].op_prev, Some(0));
        assert!(s.ops[0].later_used);
        // the update event continues the voice
        assert_eq!(s.events[1].vo_prev, Some(0));
        assert!(s.events[0].voice_later_used);
        assert!(!s.events[1].new_graph);
    }

    #[test]
    fn multiple_node_ignored() {
        let s = lower_src("@[Osin t1 Osin t2] f100");
        // the bound operators convert; the multiple node does not
        assert_eq!(s.ops.len(), 2);
    }

    #[test]
    fn follow_on_of_ignored_node_ignored() {
        let s = lower_src("'x @[Osin t1] \n@x f100");
        // no panic; the multiple node and anything referring to it is
        // dropped, the bound operator remains
        assert!(s.ops.len() <= 2);
    }

    #[test]
    fn voices_with_gap_get_chain() {
        let s = lower_src("Osin t1\n\\2 Osin t1");
        assert_eq!(s.events.len(), 2);
        assert_eq!(s.events[1].wait_ms, 2000);
        assert!(s.events[1].vo_prev.is_none(), "separate voices");
    }

    #[test]
    fn carriers_unique_and_flagged() {
        let s = lower_src("Osin t1 Osin t1");
        let e = &s.events[0];
        assert_eq!(e.carriers.len(), 2);
        let mut sorted = e.carriers.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 2, "carriers appear exactly once");
        for &c in &e.carriers {
            assert!(s.ops[c].carrier);
        }
    }
}
