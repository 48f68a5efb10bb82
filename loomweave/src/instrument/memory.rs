//! Load/store instrumentation and per-access property computation.
//!
//! Properties are computed for every access in a single pass per block
//! before any mutation: alignment class, vtable access, constant-data
//! target, stack locality, escape, thread locality, and — for loads — the
//! "written earlier in this block" bit, tracked with one scan per block
//! over the write targets seen so far.
use std::collections::BTreeSet;

use loomir::{
    builder::Cursor,
    modules::{
        Function, InstrRef,
        instructions::{Instr, MemAnnot},
        operand::{Label, Name, Operand},
    },
};

use crate::{instrument::FuncCtx, props::LoadStoreProp, tables::EventCategory};

/// What an address ultimately refers to, as far as a local chase can tell.
enum UnderlyingObject {
    Stack(Name),
    Global(loomir::modules::operand::GlobalId),
    Unknown,
}

/// Chase an address operand through local arithmetic to its base object.
fn underlying_object(f: &Function, addr: &Operand) -> UnderlyingObject {
    let mut current = addr.clone();
    for _ in 0..16 {
        match current {
            Operand::Global(gid) => return UnderlyingObject::Global(gid),
            Operand::Reg(name) => match f.def_of(name).map(|iref| f.instr(iref)) {
                Some(Instr::Alloca(_)) => return UnderlyingObject::Stack(name),
                Some(Instr::BinOp(binop)) => current = binop.lhs.clone(),
                _ => return UnderlyingObject::Unknown,
            },
            _ => return UnderlyingObject::Unknown,
        }
    }
    UnderlyingObject::Unknown
}

/// Stack slots whose address leaves the function: passed to a call, stored
/// as a value, or returned.
fn escaped_allocas(f: &Function) -> BTreeSet<Name> {
    let allocas: BTreeSet<Name> = f
        .body
        .values()
        .flat_map(|bb| bb.seq.iter())
        .filter_map(|iref| match f.instr(*iref) {
            Instr::Alloca(alloca) => Some(alloca.dest),
            _ => None,
        })
        .collect();

    let mut escaped = BTreeSet::new();
    let mut note = |op: &Operand| {
        if let Some(name) = op.as_reg() {
            if allocas.contains(&name) {
                escaped.insert(name);
            }
        }
    };
    for bb in f.body.values() {
        for iref in &bb.seq {
            match f.instr(*iref) {
                Instr::Call(call) => call.args.iter().for_each(&mut note),
                Instr::Store(store) => note(&store.value),
                Instr::MemIntr(intr) => note(&intr.src),
                _ => {}
            }
        }
        match &bb.terminator {
            loomir::modules::control_flow::Terminator::Invoke { args, .. } => {
                args.iter().for_each(&mut note)
            }
            loomir::modules::control_flow::Terminator::Ret { value: Some(value) } => note(value),
            _ => {}
        }
    }
    escaped
}

fn base_properties(
    m: &loomir::modules::Module,
    f: &Function,
    escaped: &BTreeSet<Name>,
    addr: &Operand,
    align: u32,
    annot: MemAnnot,
) -> LoadStoreProp {
    let mut prop = LoadStoreProp::default();
    prop.set_alignment(align);
    prop.set(LoadStoreProp::VTABLE_ACCESS, annot.contains(MemAnnot::VTABLE));
    match underlying_object(f, addr) {
        UnderlyingObject::Stack(name) => {
            prop.set(LoadStoreProp::STACK_LOCAL, true);
            prop.set(LoadStoreProp::MAY_ESCAPE, escaped.contains(&name));
        }
        UnderlyingObject::Global(gid) => {
            prop.set(LoadStoreProp::MAY_ESCAPE, true);
            if let Some(global) = m.global(gid) {
                prop.set(LoadStoreProp::CONSTANT_TARGET, global.constant);
                prop.set(LoadStoreProp::THREAD_LOCAL, global.thread_local);
            }
        }
        UnderlyingObject::Unknown => {
            prop.set(LoadStoreProp::MAY_ESCAPE, true);
        }
    }
    prop
}

/// Compute properties for every non-atomic load and store, in program
/// order, before any mutation.
pub fn collect_load_store_properties(
    m: &loomir::modules::Module,
    f: &Function,
    blocks: &[Label],
) -> Vec<(Label, InstrRef, LoadStoreProp)> {
    let escaped = escaped_allocas(f);
    let mut out = Vec::new();
    for label in blocks {
        let mut written: Vec<Operand> = Vec::new();
        for iref in &f.block(*label).seq {
            match f.instr(*iref) {
                Instr::Load(load) if load.ordering.is_none() => {
                    let mut prop =
                        base_properties(m, f, &escaped, &load.addr, load.align, load.annot);
                    prop.set(
                        LoadStoreProp::WRITTEN_EARLIER,
                        written.contains(&load.addr),
                    );
                    out.push((*label, *iref, prop));
                }
                Instr::Store(store) if store.ordering.is_none() => {
                    let prop =
                        base_properties(m, f, &escaped, &store.addr, store.align, store.annot);
                    if !written.contains(&store.addr) {
                        written.push(store.addr.clone());
                    }
                    out.push((*label, *iref, prop));
                }
                _ => {}
            }
        }
    }
    out
}

/// Insert before/after hooks around one load or store.
///
/// Accesses whose width is not a whole number of bytes are excluded, not
/// errors.
pub fn instrument_load_or_store(
    ctx: &mut FuncCtx<'_>,
    f: &mut Function,
    label: Label,
    iref: InstrRef,
    prop: LoadStoreProp,
) {
    let (is_store, addr, ty) = match f.instr(iref) {
        Instr::Load(load) => (false, load.addr.clone(), load.ty.clone()),
        Instr::Store(store) => (true, store.addr.clone(), store.ty.clone()),
        _ => return,
    };
    let Some(num_bytes) = ty.byte_width() else {
        log::debug!(
            "skipping {} of non-byte-width type {} in '{}'",
            if is_store { "store" } else { "load" },
            ty,
            f.name
        );
        return;
    };

    let (category, before, after) = if is_store {
        (
            EventCategory::Store,
            ctx.hooks.before_store(ctx.m),
            ctx.hooks.after_store(ctx.m),
        )
    } else {
        (
            EventCategory::Load,
            ctx.hooks.before_load(ctx.m),
            ctx.hooks.after_load(ctx.m),
        )
    };

    let local = ctx.tables.fed[category].add_instr(f, iref, None);
    let mut cur = Cursor::before(f, label, iref);
    let id = ctx.tables.fed[category].local_to_global(local, &mut cur);
    let args = vec![
        id,
        addr,
        Operand::i32(num_bytes as i32),
        prop.operand(),
    ];
    cur.call_ext(before, args.clone());

    let mut cur = Cursor::after(f, label, iref);
    cur.call_ext(after, args);
}
