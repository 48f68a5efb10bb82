//! Fork/join instrumentation.
//!
//! Per sync region the function gets one `i32` tracking flag slot in the
//! entry block: set to one at every fork of the region, passed by pointer
//! to the fork and join hooks, and reset to zero on every path after the
//! join — normal and exceptional.
//!
//! Per fork, hooks cover the fork instruction itself, the entry of the
//! spawned block, every exit of the spawned task (normal reattaches and
//! exceptional rethrows, including rethrows buried in unwind subgraphs
//! shared by several tasks, handled by reverse-post-order merge
//! propagation) and the continuation on both the normal and, when present,
//! the unwind path — redirected through the task's intermediate resume
//! point when it uses one.
use std::collections::{BTreeMap, BTreeSet};

use loomir::{
    analysis::{FlowGraph, LoopForest, TaskId, TaskTree, cfg::post_order_within},
    builder::{Cursor, split_critical_edge},
    modules::{
        Function,
        control_flow::{RegionId, Terminator},
        operand::{Label, Name, Operand},
    },
    types::Ty,
};

use crate::{
    hooks::MergeOutcome,
    instrument::FuncCtx,
    props::{ContinuationProp, TaskProp},
    tables::EventCategory,
};

use super::loops::parallel_loop_task;

/// Allocate one tracking flag slot per sync region used by the function,
/// initialized to zero in the entry block.
pub fn region_flags(
    f: &mut Function,
    detaches: &[Label],
    syncs: &[Label],
) -> BTreeMap<RegionId, Name> {
    let mut regions: Vec<RegionId> = Vec::new();
    for label in detaches.iter().chain(syncs) {
        if let Some(region) = f.block(*label).terminator.region() {
            if !regions.contains(&region) {
                regions.push(region);
            }
        }
    }

    let mut flags = BTreeMap::new();
    let mut cur = Cursor::at_block_start(f, Label::ENTRY);
    for region in regions {
        let slot = cur.alloca(Ty::I32);
        cur.store(Ty::I32, Operand::Reg(slot), Operand::i32(0));
        flags.insert(region, slot);
    }
    flags
}

/// Whether this fork spawns one iteration of a parallel loop body: the
/// task of the forked block matches the task associated with a parallel
/// loop at this location.
fn spawns_parallel_loop_body(
    f: &Function,
    forest: &LoopForest,
    tasks: &TaskTree,
    detach_block: Label,
) -> bool {
    let Some(loop_id) = forest.loop_of(detach_block) else { return false };
    let spawned = tasks.task_of_detach(detach_block);
    spawned.is_some() && parallel_loop_task(f, forest, tasks, loop_id) == spawned
}

/// Instrument one fork and the spawned task's boundaries.
pub fn instrument_detach(
    ctx: &mut FuncCtx<'_>,
    f: &mut Function,
    forest: &LoopForest,
    tasks: &TaskTree,
    label: Label,
    flags: &BTreeMap<RegionId, Name>,
) {
    let Terminator::Detach { task: detached, cont, unwind, region } = f.block(label).terminator
    else {
        return;
    };
    let Some(child) = tasks.task_of_detach(label) else { return };
    let flag = flags[&region];
    let parallel_body = spawns_parallel_loop_body(f, forest, tasks, label);

    // ID computations go to the entry of the task containing the fork,
    // which dominates the fork, the spawned task and both continuations.
    let parent_entry = tasks.get(tasks.task_for(label)).entry;

    let fork_local = ctx.tables.fed[EventCategory::Fork].add_term(f, label);
    let task_local = ctx.tables.fed[EventCategory::Task].add_block(f, detached);
    let mut cur = Cursor::at_block_start(f, parent_entry);
    let fork_id = ctx.tables.fed[EventCategory::Fork].local_to_global(fork_local, &mut cur);
    let task_id = ctx.tables.fed[EventCategory::Task].local_to_global(task_local, &mut cur);

    let fork_hook = ctx.hooks.fork(ctx.m);
    let task_hook = ctx.hooks.task_entry(ctx.m);
    let task_exit_hook = ctx.hooks.task_exit(ctx.m);
    let continue_hook = ctx.hooks.fork_continue(ctx.m);

    // The fork itself: set the region flag, then the fork hook.
    let mut cur = Cursor::before_terminator(f, label);
    cur.store(Ty::I32, Operand::Reg(flag), Operand::i32(1));
    cur.call_ext(fork_hook, vec![fork_id.clone(), Operand::Reg(flag)]);

    // Entry of the spawned task.
    let mut task_prop = TaskProp::default();
    if parallel_body {
        task_prop |= TaskProp::PARALLEL_LOOP_BODY;
    }
    let mut cur = Cursor::at_block_start(f, detached);
    cur.call_ext(
        task_hook,
        vec![task_id.clone(), fork_id.clone(), task_prop.operand()],
    );

    // Normal and plain exceptional task exits.
    let exit_prop = task_prop;
    let mut exits = tasks.reattach_exits(f, child);
    exits.extend(tasks.rethrow_exits(f, child));
    for exit in exits {
        let exit_local = ctx.tables.fed[EventCategory::TaskExit].add_term(f, exit);
        let mut cur = Cursor::before_terminator(f, exit);
        let exit_id = ctx.tables.fed[EventCategory::TaskExit].local_to_global(exit_local, &mut cur);
        cur.call_ext(
            task_exit_hook,
            vec![exit_id, task_id.clone(), fork_id.clone(), exit_prop.operand()],
        );
    }

    // Task exits buried in shared unwind subgraphs.
    for entry in tasks.shared_exits(f, child) {
        propagate_shared_exit(
            ctx,
            f,
            tasks,
            child,
            entry,
            task_exit_hook,
            vec![task_id.clone(), fork_id.clone(), exit_prop.operand()],
        );
    }

    // Continuation on the normal path. A critical continue edge is split
    // first so the hook observes only this fork's completion.
    let graph = FlowGraph::of(f);
    let cont_block = if graph.in_degree(cont) > 1 {
        split_critical_edge(f, label, cont)
    } else {
        cont
    };
    let cont_local = ctx.tables.fed[EventCategory::ForkContinuation].add_block(f, cont_block);
    let mut cur = Cursor::at_block_start(f, cont_block);
    let cont_id =
        ctx.tables.fed[EventCategory::ForkContinuation].local_to_global(cont_local, &mut cur);
    cur.call_ext(
        continue_hook,
        vec![cont_id, fork_id.clone(), ContinuationProp::default().operand()],
    );

    // Continuation on the unwind path, if the fork has one. When the task
    // maintains its own frame, the hook belongs after the intermediate
    // resume point instead of the detach's own unwind edge.
    if let Some(unwind) = unwind {
        let (unwind_block, from) = match tasks.taskframe_resume(f, child) {
            Some((resume_block, resume_dest)) => (resume_dest, resume_block),
            None => (unwind, label),
        };
        let unwind_local = ctx.tables.fed[EventCategory::ForkContinuation].add_block(f, unwind_block);
        let mut cur = Cursor::at_block_start(f, parent_entry);
        let unwind_id =
            ctx.tables.fed[EventCategory::ForkContinuation].local_to_global(unwind_local, &mut cur);
        let mut unwind_prop = ContinuationProp::default();
        unwind_prop |= ContinuationProp::UNWIND;
        let args = vec![
            (unwind_id.clone(), Ty::I64),
            (fork_id.clone(), Ty::I64),
            (unwind_prop.operand(), Ty::I64),
        ];
        let defaults = vec![Operand::i64(-1), Operand::i64(-1), Operand::i64(0)];
        ctx.selectors.insert_hook_at_successor(
            f,
            unwind_block,
            from,
            continue_hook,
            args.clone(),
            defaults.clone(),
        );
        // Rethrows of the same region reaching the unwind destination bind
        // the same selector.
        let graph = FlowGraph::of(f);
        for pred in graph.preds(unwind_block).to_vec() {
            if pred == from {
                continue;
            }
            if let Terminator::DetachedRethrow { region: r, .. } = f.block(pred).terminator {
                if r == region {
                    ctx.selectors.insert_hook_at_successor(
                        f,
                        unwind_block,
                        pred,
                        continue_hook,
                        args.clone(),
                        defaults.clone(),
                    );
                }
            }
        }
    }
}

/// Merge-propagate task-exit instrumentation across a chain of shared
/// unwind blocks.
///
/// The shared subgraph reachable from `entry` is walked in post order and
/// replayed in reverse: each shared block's selector is seeded from real
/// predecessor arguments when the predecessor belongs to the originating
/// task, or from the already-merged bindings of an earlier shared block.
/// Hook calls are emitted (at lowering) only at blocks that end in a
/// rethrow and received at least one non-default binding.
fn propagate_shared_exit(
    ctx: &mut FuncCtx<'_>,
    f: &mut Function,
    tasks: &TaskTree,
    child: TaskId,
    entry: Label,
    task_exit_hook: loomir::modules::operand::ExtId,
    args: Vec<Operand>,
) {
    let shared = tasks.shared_members().clone();
    let order = post_order_within(f, entry, &shared);
    let defaults = vec![Operand::i64(-1), Operand::i64(-1), Operand::i64(0)];
    let tys = vec![Ty::I64, Ty::I64, Ty::I64];

    let mut visited: BTreeSet<Label> = BTreeSet::new();
    for block in order.iter().rev() {
        ctx.selectors.ensure_rethrow_node(
            f,
            *block,
            task_exit_hook,
            EventCategory::TaskExit,
            tys.clone(),
            defaults.clone(),
        );
        let graph = FlowGraph::of(f);
        for pred in graph.preds(*block).to_vec() {
            let is_task_exit_edge = matches!(
                f.block(pred).terminator,
                Terminator::DetachedRethrow { .. } | Terminator::TaskFrameResume { .. }
            );
            if is_task_exit_edge && tasks.task_for(pred) == child {
                ctx.selectors.bind_args(*block, task_exit_hook, pred, args.clone());
            } else if shared.contains(&pred) && visited.contains(&pred) {
                ctx.selectors.bind_chained(*block, task_exit_hook, pred);
            }
        }
        visited.insert(*block);
    }
}

/// Instrument one join.
pub fn instrument_sync(
    ctx: &mut FuncCtx<'_>,
    f: &mut Function,
    label: Label,
    flags: &BTreeMap<RegionId, Name>,
) {
    let Terminator::Sync { cont, region } = f.block(label).terminator else { return };
    let flag = flags[&region];

    let before_hook = ctx.hooks.before_join(ctx.m);
    let after_hook = ctx.hooks.after_join(ctx.m);

    let join_local = ctx.tables.fed[EventCategory::Join].add_term(f, label);
    let mut cur = Cursor::before_terminator(f, label);
    let join_id = ctx.tables.fed[EventCategory::Join].local_to_global(join_local, &mut cur);
    cur.call_ext(before_hook, vec![join_id.clone(), Operand::Reg(flag)]);

    // The join's successors: directly the continuation, or — when the join
    // is in explicit-exception-edge form — the two successors of the
    // trailing sync-unwind block.
    let mut targets: Vec<(Label, Label)> = Vec::new();
    match f.block(cont).terminator {
        Terminator::SyncUnwind { region: r, normal, unwind } if r == region => {
            targets.push((normal, cont));
            targets.push((unwind, cont));
        }
        _ => targets.push((cont, label)),
    }

    for (target, from) in targets {
        let outcome = ctx.selectors.insert_hook_at_successor(
            f,
            target,
            from,
            after_hook,
            vec![(join_id.clone(), Ty::I64), (Operand::Reg(flag), Ty::Ptr)],
            vec![Operand::i64(-1), Operand::Null],
        );
        match outcome {
            MergeOutcome::Direct(iref) => {
                // Reset the region flag right after the after-join hook.
                let block = f
                    .block_of(iref)
                    .expect("hook call was inserted into a block");
                let mut cur = Cursor::after(f, block, iref);
                cur.store(Ty::I32, Operand::Reg(flag), Operand::i32(0));
            }
            MergeOutcome::Created => {
                ctx.selectors.add_post_reset(target, after_hook, flag);
            }
            MergeOutcome::Rebound => {}
        }
    }
}
