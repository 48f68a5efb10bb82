//! Local-allocation, heap-allocation and free instrumentation.
//!
//! Heap allocations extract `(size, count, alignment, old pointer)` per
//! allocation-function kind; calls whose size arguments cannot be
//! extracted are excluded, not errors. Invoked allocations hook both
//! destinations — the unwind destination receives a null result pointer
//! through a join-point merge, since the allocation's result is not valid
//! there.
use loomir::{
    alloc::{AllocFnKind, classify_alloc, classify_free},
    analysis::FlowGraph,
    builder::{Cursor, split_critical_edge},
    modules::{
        Function, InstrRef,
        control_flow::Terminator,
        instructions::{Callee, Instr},
        operand::{Label, Operand},
    },
    types::Ty,
};

use crate::{
    hooks::default_id_args,
    instrument::FuncCtx,
    props::{AllocFnProp, AllocaProp, FreeProp},
    tables::EventCategory,
};

/// Extracted heap-allocation arguments, per kind.
pub struct AllocArgs {
    pub size: Operand,
    pub count: Operand,
    pub align: Operand,
    pub old_ptr: Operand,
}

/// Per-kind argument extraction. `None` means the call's size/alignment
/// cannot be statically extracted and the site is excluded.
pub fn alloc_args(kind: AllocFnKind, args: &[Operand]) -> Option<AllocArgs> {
    let one = Operand::i64(1);
    let zero = Operand::i64(0);
    match kind {
        AllocFnKind::Malloc | AllocFnKind::New | AllocFnKind::NewArray => Some(AllocArgs {
            size: args.first()?.clone(),
            count: one,
            align: zero,
            old_ptr: Operand::Null,
        }),
        AllocFnKind::Calloc => Some(AllocArgs {
            size: args.get(1)?.clone(),
            count: args.first()?.clone(),
            align: zero,
            old_ptr: Operand::Null,
        }),
        AllocFnKind::Realloc => Some(AllocArgs {
            size: args.get(1)?.clone(),
            count: one,
            align: zero,
            old_ptr: args.first()?.clone(),
        }),
        AllocFnKind::AlignedAlloc => Some(AllocArgs {
            size: args.get(1)?.clone(),
            count: one,
            align: args.first()?.clone(),
            old_ptr: Operand::Null,
        }),
    }
}

fn direct_callee_kind(
    ctx: &FuncCtx<'_>,
    callee: &Callee,
) -> Option<(String, AllocFnKind)> {
    let Callee::Func(func) = callee else { return None };
    let name = ctx.m.symbol_name(*func)?;
    classify_alloc(name).map(|kind| (name.to_string(), kind))
}

/// Instrument one stack allocation.
pub fn instrument_alloca(ctx: &mut FuncCtx<'_>, f: &mut Function, label: Label, iref: InstrRef) {
    let Instr::Alloca(alloca) = f.instr(iref) else { return };
    let dest = alloca.dest;
    let elem_size = alloca.ty.alloc_size() as i64;
    let count = alloca.count.clone();
    let is_static = label == Label::ENTRY
        && matches!(count, None | Some(Operand::Imm(_)));

    let mut prop = AllocaProp::default();
    prop.set(AllocaProp::STATIC, is_static);

    let before = ctx.hooks.before_local_alloc(ctx.m);
    let after = ctx.hooks.after_local_alloc(ctx.m);
    let local = ctx.tables.fed[EventCategory::LocalAlloc].add_instr(f, iref, None);

    let mut cur = Cursor::before(f, label, iref);
    let id = ctx.tables.fed[EventCategory::LocalAlloc].local_to_global(local, &mut cur);
    let size = match count {
        Some(count) => Operand::Reg(cur.mul(Ty::I64, Operand::i64(elem_size), count)),
        None => Operand::i64(elem_size),
    };
    cur.call_ext(before, vec![id.clone(), size.clone(), prop.operand()]);

    let mut cur = Cursor::after(f, label, iref);
    cur.call_ext(after, vec![id, Operand::Reg(dest), size, prop.operand()]);
}

/// Instrument an ordinary heap-allocation call.
pub fn instrument_alloc_call(ctx: &mut FuncCtx<'_>, f: &mut Function, label: Label, iref: InstrRef) {
    let Instr::Call(call) = f.instr(iref) else { return };
    let Some((name, kind)) = direct_callee_kind(ctx, &call.callee) else { return };
    let Some(extracted) = alloc_args(kind, &call.args) else {
        log::debug!("allocation '{}' has unextractable size arguments; skipping", name);
        return;
    };
    let dest = call.dest;

    let mut prop = AllocFnProp::default();
    prop.set_kind(kind);
    let before = ctx.hooks.before_heap_alloc(ctx.m);
    let after = ctx.hooks.after_heap_alloc(ctx.m);
    let local = ctx.tables.fed[EventCategory::HeapAlloc].add_instr(f, iref, Some(&name));

    let mut cur = Cursor::before(f, label, iref);
    let id = ctx.tables.fed[EventCategory::HeapAlloc].local_to_global(local, &mut cur);
    cur.call_ext(
        before,
        vec![
            id.clone(),
            extracted.size.clone(),
            extracted.count.clone(),
            extracted.align.clone(),
            extracted.old_ptr.clone(),
            prop.operand(),
        ],
    );

    let new_ptr = dest.map(Operand::Reg).unwrap_or(Operand::Null);
    let mut cur = Cursor::after(f, label, iref);
    cur.call_ext(
        after,
        vec![
            id,
            new_ptr,
            extracted.size,
            extracted.count,
            extracted.align,
            extracted.old_ptr,
            prop.operand(),
        ],
    );
}

/// Instrument a heap allocation in invoke form: direct after-hook on the
/// normal destination (splitting the edge when it is critical), merged
/// after-hook with a null result on the unwind destination.
pub fn instrument_alloc_invoke(ctx: &mut FuncCtx<'_>, f: &mut Function, label: Label) {
    let Terminator::Invoke { dest, callee, args, normal, unwind } = &f.block(label).terminator
    else {
        return;
    };
    let Some((name, kind)) = direct_callee_kind(ctx, callee) else { return };
    let Some(extracted) = alloc_args(kind, args) else {
        log::debug!("allocation '{}' has unextractable size arguments; skipping", name);
        return;
    };
    let (dest, normal, unwind) = (*dest, *normal, *unwind);

    let mut prop = AllocFnProp::default();
    prop.set_kind(kind);
    let before = ctx.hooks.before_heap_alloc(ctx.m);
    let after = ctx.hooks.after_heap_alloc(ctx.m);
    let local = ctx.tables.fed[EventCategory::HeapAlloc].add_term(f, label);

    let mut cur = Cursor::before_terminator(f, label);
    let id = ctx.tables.fed[EventCategory::HeapAlloc].local_to_global(local, &mut cur);
    cur.call_ext(
        before,
        vec![
            id.clone(),
            extracted.size.clone(),
            extracted.count.clone(),
            extracted.align.clone(),
            extracted.old_ptr.clone(),
            prop.operand(),
        ],
    );

    // Normal destination: the result pointer is live there.
    let graph = FlowGraph::of(f);
    let normal_block = if graph.in_degree(normal) > 1 {
        split_critical_edge(f, label, normal)
    } else {
        normal
    };
    let new_ptr = dest.map(Operand::Reg).unwrap_or(Operand::Null);
    let mut cur = Cursor::at_block_start(f, normal_block);
    cur.call_ext(
        after,
        vec![
            id.clone(),
            new_ptr,
            extracted.size.clone(),
            extracted.count.clone(),
            extracted.align.clone(),
            extracted.old_ptr.clone(),
            prop.operand(),
        ],
    );

    // Unwind destination: the result is not valid there.
    ctx.selectors.insert_hook_at_successor(
        f,
        unwind,
        label,
        after,
        vec![
            (id, Ty::I64),
            (Operand::Null, Ty::Ptr),
            (extracted.size, Ty::I64),
            (extracted.count, Ty::I64),
            (extracted.align, Ty::I64),
            (extracted.old_ptr, Ty::Ptr),
            (prop.operand(), Ty::I64),
        ],
        {
            let mut defaults = default_id_args(1);
            defaults.push(Operand::Null);
            defaults.extend(default_id_args(3));
            defaults.push(Operand::Null);
            defaults.push(Operand::i64(0));
            defaults
        },
    );
}

/// Instrument a free/delete call.
pub fn instrument_free(ctx: &mut FuncCtx<'_>, f: &mut Function, label: Label, iref: InstrRef) {
    let Instr::Call(call) = f.instr(iref) else { return };
    let Callee::Func(func) = &call.callee else { return };
    let Some(name) = ctx.m.symbol_name(*func).map(str::to_owned) else { return };
    let Some(kind) = classify_free(&name) else { return };
    let Some(ptr) = call.args.first().cloned() else { return };

    let mut prop = FreeProp::default();
    prop.set_kind(kind);
    let before = ctx.hooks.before_free(ctx.m);
    let after = ctx.hooks.after_free(ctx.m);
    let local = ctx.tables.fed[EventCategory::Free].add_instr(f, iref, Some(&name));

    let mut cur = Cursor::before(f, label, iref);
    let id = ctx.tables.fed[EventCategory::Free].local_to_global(local, &mut cur);
    cur.call_ext(before, vec![id.clone(), ptr.clone(), prop.operand()]);

    let mut cur = Cursor::after(f, label, iref);
    cur.call_ext(after, vec![id, ptr, prop.operand()]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calloc_swaps_count_and_size() {
        let args = vec![Operand::i64(10), Operand::i64(4)];
        let extracted = alloc_args(AllocFnKind::Calloc, &args).expect("extractable");
        assert_eq!(extracted.size, Operand::i64(4));
        assert_eq!(extracted.count, Operand::i64(10));
    }

    #[test]
    fn missing_size_argument_is_unextractable() {
        assert!(alloc_args(AllocFnKind::Malloc, &[]).is_none());
        assert!(alloc_args(AllocFnKind::AlignedAlloc, &[Operand::i64(16)]).is_none());
    }
}
