//! Loop instrumentation.
//!
//! Loops are walked depth-first over the precomputed forest; a loop's ID is
//! assigned before recursing into its children, so outer loops receive
//! smaller IDs than the loops they contain. Each loop gets a before-loop
//! hook in its preheader (carrying the runtime trip count when one can be
//! derived from the exit condition, the −1 sentinel otherwise), a
//! body-entry hook at the header, one body-exit hook per exiting block
//! (tagged when the block is the latch) and one after-loop hook per unique
//! exit block.
use loomir::{
    analysis::{LoopForest, LoopId, TaskId, TaskTree},
    builder::Cursor,
    modules::{
        Function,
        control_flow::Terminator,
        instructions::{BinOpKind, CmpOp, Instr},
        operand::{Label, Operand},
    },
    types::Ty,
};

use crate::{
    instrument::FuncCtx,
    props::{LoopExitProp, LoopProp},
    tables::EventCategory,
};

/// The task spawned as this loop's body, when the loop is in canonical
/// parallel form: the header forks the body task and continues to the
/// latch within the loop.
pub fn parallel_loop_task(
    f: &Function,
    forest: &LoopForest,
    tasks: &TaskTree,
    id: LoopId,
) -> Option<TaskId> {
    let l = forest.get(id);
    let Terminator::Detach { task, cont, .. } = &f.block(l.header).terminator else {
        return None;
    };
    if !l.blocks.contains(task) || !l.blocks.contains(cont) {
        return None;
    }
    tasks.task_of_detach(l.header)
}

/// Derive a runtime trip count from the loop's exit condition, emitting
/// its computation in the preheader. Recognized form: a unique latch whose
/// conditional exit compares a slot-based counter (initialized in the
/// preheader, stepped by a constant in the loop) against a loop-invariant
/// bound, in 64-bit arithmetic. Returns `None` when no count can be
/// derived.
fn derive_trip_count(
    f: &mut Function,
    forest: &LoopForest,
    id: LoopId,
    preheader: Label,
) -> Option<Operand> {
    let l = forest.get(id);
    let latch = forest.unique_latch(id)?;
    let Terminator::CondBr { cond, then_to, else_to } = &f.block(latch).terminator else {
        return None;
    };
    // One arm continues to the header, the other leaves the loop.
    let (continue_to, exit_to) = (*then_to, *else_to);
    let exits_on_false = continue_to == l.header && !l.blocks.contains(&exit_to);
    let exits_on_true = exit_to == l.header && !l.blocks.contains(&continue_to);
    if !exits_on_false && !exits_on_true {
        return None;
    }

    let cond = cond.as_reg()?;
    let cmp = match f.instr(f.def_of(cond)?) {
        Instr::Cmp(cmp) => cmp.clone(),
        _ => return None,
    };
    if cmp.ty != Ty::I64 {
        return None;
    }
    // The comparison must hold the continue condition; an exit-on-true
    // latch inverts it, which this pattern does not cover.
    if exits_on_true {
        return None;
    }

    let next = cmp.lhs.as_reg()?;
    let bound = cmp.rhs.clone();
    if !is_loop_invariant(f, forest, id, &bound) {
        return None;
    }

    // next = add (load slot), #step
    let Instr::BinOp(step_op) = f.instr(f.def_of(next)?) else { return None };
    if step_op.kind != BinOpKind::Add {
        return None;
    }
    let iv = step_op.lhs.as_reg()?;
    let step = match step_op.rhs {
        Operand::Imm(imm) if imm.value > 0 => imm.value,
        _ => return None,
    };
    let slot = match f.instr(f.def_of(iv)?) {
        Instr::Load(load) => load.addr.clone(),
        _ => return None,
    };

    // The slot's initial value is its last store in the preheader.
    let init = last_store_to(f, preheader, &slot)?;

    // trips = (bound - init [+ adjust]) / step
    let adjust = match cmp.op {
        CmpOp::Ne => 0,
        CmpOp::Ult | CmpOp::Slt => step - 1,
        CmpOp::Ule | CmpOp::Sle => step,
        CmpOp::Eq => return None,
    };
    let mut cur = Cursor::before_terminator(f, preheader);
    let mut count = cur.sub(Ty::I64, bound, init);
    if adjust != 0 {
        count = cur.add(Ty::I64, Operand::Reg(count), Operand::i64(adjust));
    }
    if step != 1 {
        count = cur.binop(BinOpKind::UDiv, Ty::I64, Operand::Reg(count), Operand::i64(step));
    }
    Some(Operand::Reg(count))
}

fn is_loop_invariant(f: &Function, forest: &LoopForest, id: LoopId, op: &Operand) -> bool {
    match op {
        Operand::Imm(_) | Operand::Null | Operand::Global(_) => true,
        Operand::Reg(name) => match f.def_of(*name) {
            // Parameters and other block-less definitions are invariant.
            None => true,
            Some(iref) => match f.block_of(iref) {
                Some(block) => !forest.get(id).blocks.contains(&block),
                None => true,
            },
        },
        Operand::Func(_) => true,
    }
}

fn last_store_to(f: &Function, block: Label, slot: &Operand) -> Option<Operand> {
    f.block(block)
        .seq
        .iter()
        .rev()
        .find_map(|iref| match f.instr(*iref) {
            Instr::Store(store) if store.addr == *slot => Some(store.value.clone()),
            _ => None,
        })
}

/// Instrument every loop in the forest, outermost first.
pub fn instrument_loops(
    ctx: &mut FuncCtx<'_>,
    f: &mut Function,
    forest: &LoopForest,
    tasks: &TaskTree,
) {
    for root in forest.roots() {
        instrument_loop(ctx, f, forest, tasks, *root);
    }
}

fn instrument_loop(
    ctx: &mut FuncCtx<'_>,
    f: &mut Function,
    forest: &LoopForest,
    tasks: &TaskTree,
    id: LoopId,
) {
    let header = forest.get(id).header;

    // Assign this loop's ID before recursing: IDs follow depth-first
    // preorder, outer loops before their children.
    let local = ctx.tables.fed[EventCategory::Loop].add_block(f, header);

    for child in forest.get(id).children.clone() {
        instrument_loop(ctx, f, forest, tasks, child);
    }

    let Some(preheader) = forest.preheader(f, id) else {
        log::warn!(
            "loop at {} in '{}' has no preheader after simplification; not instrumented",
            header,
            f.name
        );
        return;
    };

    let exiting = forest.exiting_edges(f, id);
    let mut prop = LoopProp::default();
    if parallel_loop_task(f, forest, tasks, id).is_some() {
        prop |= LoopProp::FORK_JOIN_BODY;
    }
    if exiting.len() == 1 {
        prop |= LoopProp::UNIQUE_EXITING_EDGE;
    }

    let before_hook = ctx.hooks.before_loop(ctx.m);
    let body_entry_hook = ctx.hooks.loopbody_entry(ctx.m);
    let body_exit_hook = ctx.hooks.loopbody_exit(ctx.m);
    let after_hook = ctx.hooks.after_loop(ctx.m);

    // Before-loop hook in the preheader, with the derived trip count or
    // the unknown sentinel.
    let trip = match derive_trip_count(f, forest, id, preheader) {
        Some(trip) => trip,
        None => {
            log::debug!("no derivable trip count for loop at {} in '{}'", header, f.name);
            Operand::i64(-1)
        }
    };
    let mut cur = Cursor::before_terminator(f, preheader);
    let loop_id = ctx.tables.fed[EventCategory::Loop].local_to_global(local, &mut cur);
    cur.call_ext(before_hook, vec![loop_id, trip, prop.operand()]);

    // Body-entry hook at the header.
    let mut cur = Cursor::at_block_start(f, header);
    let loop_id = ctx.tables.fed[EventCategory::Loop].local_to_global(local, &mut cur);
    cur.call_ext(body_entry_hook, vec![loop_id, prop.operand()]);

    // One body-exit hook per exiting block, latch-tagged. A block carrying
    // several exiting edges still fires once, at the block's end.
    let mut exiting_blocks: Vec<Label> = Vec::new();
    for (from, _) in &exiting {
        if !exiting_blocks.contains(from) {
            exiting_blocks.push(*from);
        }
    }
    for from in exiting_blocks {
        let mut exit_prop = LoopExitProp::default();
        if forest.is_latch(id, from) {
            exit_prop |= LoopExitProp::LATCH;
        }
        let exit_local = ctx.tables.fed[EventCategory::LoopExit].add_term(f, from);
        let mut cur = Cursor::before_terminator(f, from);
        let exit_id = ctx.tables.fed[EventCategory::LoopExit].local_to_global(exit_local, &mut cur);
        let loop_id = ctx.tables.fed[EventCategory::Loop].local_to_global(local, &mut cur);
        cur.call_ext(body_exit_hook, vec![exit_id, loop_id, exit_prop.operand()]);
    }

    // One after-loop hook per unique exit block.
    for exit in forest.exit_blocks(f, id) {
        let mut cur = Cursor::at_block_start(f, exit);
        let loop_id = ctx.tables.fed[EventCategory::Loop].local_to_global(local, &mut cur);
        cur.call_ext(after_hook, vec![loop_id, prop.operand()]);
    }
}
