//! Script graph to program conversion.
//!
//! Allocates voice and operator IDs incrementally: a voice whose sound
//! has ended and which no later event uses is reused for new voices;
//! operator IDs grow monotonically along update chains. Emits one
//! program event per script event with only the changed parameters.

use super::{OpId, OpTime, OpUpdate, Program, ProgramEvent, VoiceId, VoiceUpdate};
use crate::dsl::error::CompileError;
use crate::dsl::script::{ScriptEvent, ScriptGraph, SEvId};

struct VoState {
    last_ev: SEvId,
    duration_ms: u32,
}

/// Longest finite duration among the carriers of an event's graph.
/// Carried-over updates that set no time contribute nothing; their
/// operator's remaining time is already accounted for.
fn voice_duration(s: &ScriptGraph, e: &ScriptEvent) -> u32 {
    e.carriers
        .iter()
        .map(|&c| {
            let op = &s.ops[c];
            if op.time.linked || !op.params.time {
                0
            } else {
                op.time.ms
            }
        })
        .max()
        .unwrap_or(0)
}

/// Build a program from lowered script data.
pub fn build_program(s: &ScriptGraph) -> Result<Program, CompileError> {
    let mut va: Vec<VoState> = Vec::new();
    let mut ev_voice: Vec<u32> = vec![0; s.events.len()];
    let mut op_ids: Vec<Option<u32>> = vec![None; s.ops.len()];
    let mut op_count: u32 = 0;
    let mut events = Vec::with_capacity(s.events.len());
    let mut cum_wait_ms: u64 = 0;
    let mut duration_ms: u64 = 0;

    for (ei, e) in s.events.iter().enumerate() {
        // expire voice durations across the wait
        for vs in va.iter_mut() {
            if vs.duration_ms < e.wait_ms {
                vs.duration_ms = 0;
            } else {
                vs.duration_ms -= e.wait_ms;
            }
        }
        // voice id: continue the chain, reuse an expired voice, or add
        let vo_id = match e.vo_prev {
            Some(pv) => ev_voice[pv] as usize,
            None => match va
                .iter()
                .position(|vs| !s.events[vs.last_ev].voice_later_used && vs.duration_ms == 0)
            {
                Some(id) => id,
                None => {
                    va.push(VoState {
                        last_ev: ei,
                        duration_ms: 0,
                    });
                    va.len() - 1
                }
            },
        };
        ev_voice[ei] = vo_id as u32;
        va[vo_id].last_ev = ei;
        cum_wait_ms += e.wait_ms as u64;

        // allocate ids for every update first, so modulator lists can
        // refer to operators converted later in the same event
        for &so in &e.updates {
            let op = &s.ops[so];
            let id = match op.op_prev {
                Some(p) => op_ids[p]
                    .ok_or_else(|| CompileError::build("operator chain missing at some level"))?,
                None => {
                    let id = op_count;
                    op_count += 1;
                    id
                }
            };
            op_ids[so] = Some(id);
        }

        // operator updates
        let mut ops = Vec::with_capacity(e.updates.len());
        for &so in &e.updates {
            let op = &s.ops[so];
            let id = op_ids[so].expect("id allocated above");
            let to_ids =
                |v: &Option<Vec<usize>>| -> Result<Option<Vec<OpId>>, CompileError> {
                    v.as_ref()
                        .map(|ids| {
                            ids.iter()
                                .map(|&m| {
                                    op_ids[m].map(OpId).ok_or_else(|| {
                                        CompileError::build(
                                            "modulator converted before its operator",
                                        )
                                    })
                                })
                                .collect()
                        })
                        .transpose()
                };
            ops.push(OpUpdate {
                id: OpId(id),
                time: op.params.time.then(|| {
                    if op.time.linked {
                        OpTime::Infinite
                    } else {
                        OpTime::Ms(op.time.ms)
                    }
                }),
                silence_ms: op.params.silence.then_some(op.silence_ms),
                wave: op.params.wave.then_some(op.wave),
                freq: op.params.freq.then_some(op.freq),
                freq2: op.params.freq2.then_some(op.freq2),
                amp: op.params.amp.then_some(op.amp),
                amp2: op.params.amp2.then_some(op.amp2),
                phase: op.params.phase.then_some(op.phase),
                fmods: to_ids(&op.fmods)?,
                pmods: to_ids(&op.pmods)?,
                amods: to_ids(&op.amods)?,
            });
        }

        // voice update
        let voice_update = if e.pan_set || e.new_graph {
            let carriers = if e.new_graph {
                let dur = voice_duration(s, e);
                va[vo_id].duration_ms = dur;
                duration_ms = duration_ms.max(cum_wait_ms + dur as u64);
                Some(
                    e.carriers
                        .iter()
                        .map(|&c| {
                            op_ids[c].map(OpId).ok_or_else(|| {
                                CompileError::build("carrier missing operator id")
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                )
            } else {
                None
            };
            Some(VoiceUpdate {
                pan: e.pan_set.then_some(e.pan),
                carriers,
            })
        } else {
            None
        };

        events.push(ProgramEvent {
            wait_ms: e.wait_ms,
            voice: VoiceId(vo_id as u32),
            voice_update,
            ops,
        });
    }

    Ok(Program {
        name: s.name.clone(),
        options: s.options,
        events,
        voice_count: va.len() as u32,
        op_count,
        duration_ms: duration_ms.min(u32::MAX as u64) as u32,
    })
}
