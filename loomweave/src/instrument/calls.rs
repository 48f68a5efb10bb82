//! Callsite instrumentation and interposition.
//!
//! Ordinary calls get before/after hooks carrying the callsite ID, the
//! callee's function ID (loaded from a weak per-callee global written at
//! load time, or the unknown sentinel for indirect calls), and the call
//! properties. Invokes hook both the normal and the unwind destination
//! through join-point merges. Interposition rewrites a call's target to a
//! generated thunk symbol — a link-time redirection only.
use loomir::{
    builder::Cursor,
    modules::{
        ExternalFunction, Function, Global, InstrRef, Linkage, Module,
        control_flow::Terminator,
        instructions::{Callee, Instr},
        operand::{FuncRef, GlobalId, Label, Operand},
    },
    types::Ty,
};

use crate::{
    config::InstrPoint,
    hooks::default_id_args,
    instrument::FuncCtx,
    props::CallProp,
    tables::{EventCategory, UNKNOWN_ID},
};

/// The weak per-callee ID cell, initialized to the unknown sentinel and
/// filled in by the generated callsite initializer at load time.
pub fn func_id_global(m: &mut Module, callee: &str) -> GlobalId {
    let name = format!("__loom_func_id_{}", callee);
    match m.global_by_name(&name) {
        Some((gid, _)) => gid,
        None => m.add_global(Global {
            name,
            ty: Ty::I64,
            init: loomir::modules::consts::Const::i64(UNKNOWN_ID),
            constant: false,
            thread_local: false,
            linkage: Linkage::Weak,
        }),
    }
}

fn callee_name(m: &Module, f: &Function, callee: &Callee) -> Option<String> {
    match callee {
        Callee::Func(FuncRef::Internal(uuid)) if *uuid == f.uuid => Some(f.name.clone()),
        Callee::Func(func) => m.symbol_name(*func).map(str::to_owned),
        Callee::Indirect(_) => None,
    }
}

fn instrument_points(ctx: &FuncCtx<'_>, callee: Option<&str>) -> (bool, bool) {
    match callee {
        Some(name) => (
            ctx.profile.instrument_point(name, InstrPoint::BeforeCall),
            ctx.profile.instrument_point(name, InstrPoint::AfterCall),
        ),
        // Unknown targets cannot be filtered by name.
        None => (true, true),
    }
}

/// Instrument an ordinary (non-exceptional) call.
pub fn instrument_call(ctx: &mut FuncCtx<'_>, f: &mut Function, label: Label, iref: InstrRef) {
    let Instr::Call(call) = f.instr(iref) else { return };
    let callee = call.callee.clone();
    let name = callee_name(ctx.m, f, &callee);
    let (before, after) = instrument_points(ctx, name.as_deref());
    if !before && !after {
        return;
    }

    let local = ctx.tables.fed[EventCategory::Callsite].add_instr(f, iref, name.as_deref());
    let mut prop = CallProp::default();
    prop.set(CallProp::INDIRECT, callee.is_indirect());

    let before_hook = ctx.hooks.before_call(ctx.m);
    let after_hook = ctx.hooks.after_call(ctx.m);

    let mut cur = Cursor::before(f, label, iref);
    let id = ctx.tables.fed[EventCategory::Callsite].local_to_global(local, &mut cur);
    let func_id = match &name {
        Some(name) => {
            let gid = func_id_global(ctx.m, name);
            Operand::Reg(cur.load(Ty::I64, Operand::Global(gid)))
        }
        None => Operand::i64(UNKNOWN_ID),
    };
    if before {
        cur.call_ext(before_hook, vec![id.clone(), func_id.clone(), prop.operand()]);
    }
    if after {
        let mut cur = Cursor::after(f, label, iref);
        cur.call_ext(after_hook, vec![id, func_id, prop.operand()]);
    }
}

/// Instrument a call in explicit-exception-edge form. The after hook fires
/// on both destinations, merged at each join.
pub fn instrument_invoke(ctx: &mut FuncCtx<'_>, f: &mut Function, label: Label) {
    let Terminator::Invoke { callee, normal, unwind, .. } = &f.block(label).terminator else {
        return;
    };
    let (callee, normal, unwind) = (callee.clone(), *normal, *unwind);
    let name = callee_name(ctx.m, f, &callee);
    let (before, after) = instrument_points(ctx, name.as_deref());
    if !before && !after {
        return;
    }

    let local = ctx.tables.fed[EventCategory::Callsite].add_term(f, label);
    let mut prop = CallProp::default();
    prop.set(CallProp::INDIRECT, callee.is_indirect());

    let before_hook = ctx.hooks.before_call(ctx.m);
    let after_hook = ctx.hooks.after_call(ctx.m);

    let mut cur = Cursor::before_terminator(f, label);
    let id = ctx.tables.fed[EventCategory::Callsite].local_to_global(local, &mut cur);
    let func_id = match &name {
        Some(name) => {
            let gid = func_id_global(ctx.m, name);
            Operand::Reg(cur.load(Ty::I64, Operand::Global(gid)))
        }
        None => Operand::i64(UNKNOWN_ID),
    };
    if before {
        cur.call_ext(before_hook, vec![id.clone(), func_id.clone(), prop.operand()]);
    }
    if after {
        let args = vec![
            (id.clone(), Ty::I64),
            (func_id.clone(), Ty::I64),
            (prop.operand(), Ty::I64),
        ];
        ctx.selectors.insert_hook_at_successor(
            f,
            normal,
            label,
            after_hook,
            args.clone(),
            default_id_args(3),
        );
        ctx.selectors.insert_hook_at_successor(
            f,
            unwind,
            label,
            after_hook,
            args,
            default_id_args(3),
        );
    }
}

/// Redirect the call's target through an interposition thunk when the
/// profile requests it for this callee name.
pub fn interpose_call(ctx: &mut FuncCtx<'_>, f: &mut Function, label: Label, iref: Option<InstrRef>) {
    let callee = match iref {
        Some(iref) => match f.instr(iref) {
            Instr::Call(call) => call.callee.clone(),
            _ => return,
        },
        None => match &f.block(label).terminator {
            Terminator::Invoke { callee, .. } => callee.clone(),
            _ => return,
        },
    };
    let Some(name) = callee_name(ctx.m, f, &callee) else { return };
    if !ctx.profile.interpose(&name) {
        return;
    }

    let params = match &callee {
        Callee::Func(FuncRef::External(ext)) => {
            ctx.m.external(*ext).map(|e| e.params.clone()).unwrap_or_default()
        }
        Callee::Func(FuncRef::Internal(uuid)) => ctx
            .m
            .function(*uuid)
            .map(|g| g.params.iter().map(|(_, ty)| ty.clone()).collect())
            .unwrap_or_default(),
        Callee::Indirect(_) => return,
    };
    let return_ty = match &callee {
        Callee::Func(FuncRef::External(ext)) => {
            ctx.m.external(*ext).and_then(|e| e.return_ty.clone())
        }
        Callee::Func(FuncRef::Internal(uuid)) => {
            ctx.m.function(*uuid).and_then(|g| g.return_ty.clone())
        }
        Callee::Indirect(_) => None,
    };
    let thunk = ctx.m.get_or_insert_external(ExternalFunction {
        name: format!("__loom_interpose_{}", name),
        params,
        return_ty,
        nounwind: false,
    });
    let new_callee = Callee::Func(FuncRef::External(thunk));
    match iref {
        Some(iref) => {
            if let Instr::Call(call) = f.instr_mut(iref) {
                call.callee = new_callee;
            }
        }
        None => {
            if let Terminator::Invoke { callee, .. } = &mut f.block_mut(label).terminator {
                *callee = new_callee;
            }
        }
    }
}
