//! Shared helpers for the instrumentation test suites.
#![allow(dead_code)]
use loomir::modules::{
    Function, Module,
    instructions::{Callee, Instr},
    operand::{FuncRef, Label, Operand},
};
use loomweave::{Instrumenter, InstrumentOptions, InstrumentProfile};

/// Run the instrumenter with default options and a permissive profile.
pub fn instrument(m: &mut Module) {
    Instrumenter::new(InstrumentOptions::default(), InstrumentProfile::permissive())
        .run(m)
        .expect("instrumentation succeeds");
}

fn callee_ext_name<'m>(m: &'m Module, f: &Function, iref: loomir::modules::InstrRef) -> Option<&'m str> {
    match f.instr(iref) {
        Instr::Call(call) => match &call.callee {
            Callee::Func(FuncRef::External(ext)) => m.external(*ext).map(|e| e.name.as_str()),
            _ => None,
        },
        _ => None,
    }
}

/// Count calls to the named external function within `f`.
pub fn calls_to(m: &Module, f: &Function, name: &str) -> usize {
    f.body
        .values()
        .flat_map(|bb| bb.seq.iter())
        .filter(|iref| callee_ext_name(m, f, **iref) == Some(name))
        .count()
}

/// Names of the external functions called in `block`, in order.
pub fn calls_in_block(m: &Module, f: &Function, block: Label) -> Vec<String> {
    f.block(block)
        .seq
        .iter()
        .filter_map(|iref| callee_ext_name(m, f, *iref).map(str::to_owned))
        .collect()
}

/// Every local-ID constant added to a load of the named base cell, over
/// the whole module, sorted. Each instrumented site synthesizes its own
/// base-load plus local-id addition, so the sorted constants of a category
/// expose its ID space.
pub fn id_constants_for(m: &Module, base_cell: &str) -> Vec<i64> {
    let Some((gid, _)) = m.global_by_name(base_cell) else { return Vec::new() };
    let mut constants = Vec::new();
    for f in m.functions.values() {
        // Names holding a load of the base cell.
        let base_regs: Vec<_> = f
            .body
            .values()
            .flat_map(|bb| bb.seq.iter())
            .filter_map(|iref| match f.instr(*iref) {
                Instr::Load(load) if load.addr == Operand::Global(gid) => Some(load.dest),
                _ => None,
            })
            .collect();
        for bb in f.body.values() {
            for iref in &bb.seq {
                if let Instr::BinOp(binop) = f.instr(*iref) {
                    if let (Operand::Reg(lhs), Operand::Imm(imm)) = (&binop.lhs, &binop.rhs) {
                        if base_regs.contains(lhs) {
                            constants.push(imm.value);
                        }
                    }
                }
            }
        }
    }
    constants.sort_unstable();
    constants
}

/// The immediate value of argument `index` of every call to `hook` in `f`,
/// in block/sequence order.
pub fn nth_call_arg_imm(m: &Module, f: &Function, hook: &str, index: usize) -> Vec<i64> {
    f.body
        .values()
        .flat_map(|bb| bb.seq.iter())
        .filter(|iref| callee_ext_name(m, f, **iref) == Some(hook))
        .filter_map(|iref| match f.instr(*iref) {
            Instr::Call(call) => match call.args.get(index) {
                Some(Operand::Imm(imm)) => Some(imm.value),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// The local-ID constant feeding argument `index` of the given hook call
/// within `block`, resolved through the synthesized base-load-plus-add
/// expression.
pub fn call_id_constant(m: &Module, f: &Function, block: Label, hook: &str, index: usize) -> Option<i64> {
    let iref = f
        .block(block)
        .seq
        .iter()
        .copied()
        .find(|iref| callee_ext_name(m, f, *iref) == Some(hook))?;
    let Instr::Call(call) = f.instr(iref) else { return None };
    let reg = call.args.get(index)?.as_reg()?;
    match f.instr(f.def_of(reg)?) {
        Instr::BinOp(binop) => match binop.rhs {
            Operand::Imm(imm) => Some(imm.value),
            _ => None,
        },
        _ => None,
    }
}
