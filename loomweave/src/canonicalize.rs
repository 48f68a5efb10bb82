//! CFG canonicalization.
//!
//! Three preparation passes run before any hook is inserted:
//!
//! 1. [`promote_calls_to_invokes`] rewrites ordinary calls that may raise
//!    into explicit-exception-edge form, so unwind paths have well-defined
//!    insertion points.
//! 2. [`split_blocks_at_calls`] splits blocks after calls, giving every
//!    "after this call" position a unique address.
//! 3. [`setup_blocks`] makes every join block's predecessors homogeneous
//!    with respect to the control-transfer mechanism that produced them,
//!    by splitting off per-mechanism predecessor blocks in a fixed order.
use std::collections::BTreeSet;

use loomir::{
    alloc::classify_alloc,
    builder::{split_block, split_predecessors},
    modules::{
        Function, Module,
        control_flow::Terminator,
        instructions::{Callee, Instr},
        operand::{FuncRef, Label},
    },
};

/// Control-transfer mechanism of a predecessor, for join homogeneity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferKind {
    Ordinary,
    Invoke,
    /// Fork-family edges: `Detach`, `Reattach`, `DetachedRethrow`.
    Fork,
    Join,
    JoinUnwind,
    /// Invoke of a heap-allocation function.
    Allocation,
    TaskFrameResume,
}

/// Classify the mechanism a predecessor's terminator transfers control by.
pub fn transfer_kind(m: &Module, term: &Terminator) -> TransferKind {
    match term {
        Terminator::Detach { .. }
        | Terminator::Reattach { .. }
        | Terminator::DetachedRethrow { .. } => TransferKind::Fork,
        Terminator::TaskFrameResume { .. } => TransferKind::TaskFrameResume,
        Terminator::Sync { .. } => TransferKind::Join,
        Terminator::SyncUnwind { .. } => TransferKind::JoinUnwind,
        Terminator::Invoke { callee, .. } => match callee {
            Callee::Func(func) => match m.symbol_name(*func) {
                Some(name) if classify_alloc(name).is_some() => TransferKind::Allocation,
                _ => TransferKind::Invoke,
            },
            Callee::Indirect(_) => TransferKind::Invoke,
        },
        _ => TransferKind::Ordinary,
    }
}

/// Whether an instruction is a call into the instrumentation runtime (a
/// hook or table initializer). Placeholder calls never count as real
/// callsites and never terminate blocks.
pub fn is_placeholder_call(m: &Module, instr: &Instr) -> bool {
    match instr {
        Instr::Call(call) => match &call.callee {
            Callee::Func(FuncRef::External(ext)) => m
                .external(*ext)
                .is_some_and(|e| e.name.starts_with("__loom")),
            _ => false,
        },
        _ => false,
    }
}

fn callee_may_throw(m: &Module, f: &Function, callee: &Callee) -> bool {
    match callee {
        Callee::Func(FuncRef::External(ext)) => {
            m.external(*ext).is_none_or(|e| !e.nounwind)
        }
        Callee::Func(FuncRef::Internal(uuid)) => {
            if *uuid == f.uuid {
                !f.nounwind
            } else {
                m.function(*uuid).is_none_or(|g| !g.nounwind)
            }
        }
        Callee::Indirect(_) => true,
    }
}

/// Promote ordinary calls that may raise into `Invoke` form.
///
/// Each promoted call becomes the terminator of its block, resuming
/// normally in a split-off continuation block and unwinding into one
/// shared cleanup block that resumes the exception. Returns the number of
/// promoted calls.
pub fn promote_calls_to_invokes(m: &Module, f: &mut Function) -> usize {
    if f.nounwind {
        return 0;
    }

    let mut cleanup: Option<Label> = None;
    let mut promoted = 0;
    let mut worklist: Vec<Label> = f.labels();

    while let Some(label) = worklist.pop() {
        let found = f.block(label).seq.iter().enumerate().find_map(|(index, iref)| {
            match f.instr(*iref) {
                Instr::Call(call)
                    if !is_placeholder_call(m, f.instr(*iref))
                        && callee_may_throw(m, f, &call.callee) =>
                {
                    Some((index, *iref))
                }
                _ => None,
            }
        });
        let Some((index, iref)) = found else { continue };

        let normal = split_block(f, label, index + 1);
        let unwind = *cleanup.get_or_insert_with(|| {
            f.add_block(Terminator::Resume { value: None })
        });
        let Some(Instr::Call(call)) = f.remove(label, iref) else {
            unreachable!("worklist entry is a call");
        };
        f.set_terminator(
            label,
            Terminator::Invoke {
                dest: call.dest,
                callee: call.callee,
                args: call.args,
                normal,
                unwind,
            },
        );
        promoted += 1;
        // The split-off continuation may hold further promotable calls.
        worklist.push(normal);
    }
    promoted
}

/// Split blocks after ordinary calls so that every call terminates its
/// block. Skips placeholder calls, calls that cannot return, and calls
/// already in terminating position. Returns the number of splits.
pub fn split_blocks_at_calls(m: &Module, f: &mut Function) -> usize {
    let mut splits = 0;
    for label in f.labels() {
        // Descending positions keep earlier indices valid across splits.
        let positions: Vec<usize> = f
            .block(label)
            .seq
            .iter()
            .enumerate()
            .filter_map(|(index, iref)| match f.instr(*iref) {
                Instr::Call(call)
                    if !is_placeholder_call(m, f.instr(*iref)) && !call.no_return =>
                {
                    Some(index)
                }
                _ => None,
            })
            .collect();
        for index in positions.into_iter().rev() {
            if index + 1 < f.block(label).seq.len() {
                split_block(f, label, index + 1);
                splits += 1;
            }
        }
    }
    splits
}

/// Fixed bucket splitting order: fork-family predecessors are handled last
/// to preserve the deadness invariants on blocks following fork-unwind
/// edges.
const SPLIT_ORDER: [TransferKind; 6] = [
    TransferKind::Join,
    TransferKind::JoinUnwind,
    TransferKind::Allocation,
    TransferKind::Invoke,
    TransferKind::TaskFrameResume,
    TransferKind::Fork,
];

/// Join blocks that need homogeneous predecessors: unwind-edge targets,
/// invoke normal destinations and join successors.
fn blocks_to_setup(f: &Function) -> BTreeSet<Label> {
    let mut targets = BTreeSet::new();
    for bb in f.body.values() {
        targets.extend(bb.terminator.unwind_successors());
        match &bb.terminator {
            Terminator::Invoke { normal, .. } => {
                targets.insert(*normal);
            }
            Terminator::Sync { cont, .. } => {
                targets.insert(*cont);
            }
            Terminator::SyncUnwind { normal, .. } => {
                targets.insert(*normal);
            }
            _ => {}
        }
    }
    targets
}

/// Make every join block's predecessors homogeneous in their control
/// transfer mechanism. Returns the number of blocks inserted.
pub fn setup_blocks(m: &Module, f: &mut Function) -> usize {
    let mut inserted = 0;
    for target in blocks_to_setup(f) {
        inserted += setup_block(m, f, target);
    }
    inserted
}

fn setup_block(m: &Module, f: &mut Function, target: Label) -> usize {
    // Distinct predecessors, bucketed by transfer mechanism.
    let mut preds: Vec<Label> = Vec::new();
    for (label, bb) in &f.body {
        if bb.terminator.successors().contains(&target) && !preds.contains(label) {
            preds.push(*label);
        }
    }
    if preds.len() <= 1 {
        return 0;
    }

    let bucket_of = |m: &Module, f: &Function, pred: Label| {
        transfer_kind(m, &f.block(pred).terminator)
    };
    let mut kinds: BTreeSet<TransferKind> = preds.iter().map(|p| bucket_of(m, f, *p)).collect();
    let mut inserted = 0;

    for kind in SPLIT_ORDER {
        if kinds.len() <= 1 {
            break;
        }
        let bucket: Vec<Label> = preds
            .iter()
            .copied()
            .filter(|p| bucket_of(m, f, *p) == kind)
            .collect();
        if bucket.is_empty() {
            continue;
        }
        split_predecessors(f, target, &bucket);
        preds.retain(|p| !bucket.contains(p));
        kinds.remove(&kind);
        inserted += 1;
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomir::{
        builder::Cursor,
        modules::{
            ExternalFunction,
            control_flow::RegionId,
            instructions::Call,
            operand::Operand,
        },
        types::Ty,
    };

    fn ext_call(m: &mut Module, name: &str, nounwind: bool) -> Callee {
        let ext = m.get_or_insert_external(ExternalFunction {
            name: name.into(),
            params: Vec::new(),
            return_ty: None,
            nounwind,
        });
        Callee::Func(FuncRef::External(ext))
    }

    #[test]
    fn promote_rewrites_throwing_calls_only() {
        let mut m = Module::new("unit");
        let throwing = ext_call(&mut m, "may_throw", false);
        let safe = ext_call(&mut m, "safe", true);
        let mut f = Function::new("f");
        f.push(
            Label::ENTRY,
            Instr::Call(Call {
                dest: None,
                callee: throwing,
                args: Vec::new(),
                return_ty: None,
                no_return: false,
            }),
        );
        f.push(
            Label::ENTRY,
            Instr::Call(Call {
                dest: None,
                callee: safe,
                args: Vec::new(),
                return_ty: None,
                no_return: false,
            }),
        );
        f.set_terminator(Label::ENTRY, Terminator::Ret { value: None });

        let promoted = promote_calls_to_invokes(&m, &mut f);
        assert_eq!(promoted, 1);
        assert!(matches!(f.block(Label::ENTRY).terminator, Terminator::Invoke { .. }));
        // The nounwind call survives as an ordinary call in the split tail.
        let Terminator::Invoke { normal, unwind, .. } = f.block(Label::ENTRY).terminator else {
            unreachable!();
        };
        assert_eq!(f.block(normal).seq.len(), 1);
        assert!(matches!(f.block(unwind).terminator, Terminator::Resume { .. }));
        m.add_function(f);
        m.verify().expect("promoted module verifies");
    }

    #[test]
    fn split_at_calls_gives_each_call_a_block_end() {
        let mut m = Module::new("unit");
        let safe = ext_call(&mut m, "safe", true);
        let mut f = Function::new("f");
        let mut cur = Cursor::at_block_start(&mut f, Label::ENTRY);
        cur.emit(Instr::Call(Call {
            dest: None,
            callee: safe.clone(),
            args: Vec::new(),
            return_ty: None,
            no_return: false,
        }));
        cur.add(Ty::I64, Operand::i64(1), Operand::i64(2));
        f.set_terminator(Label::ENTRY, Terminator::Ret { value: None });

        let splits = split_blocks_at_calls(&m, &mut f);
        assert_eq!(splits, 1);
        assert_eq!(f.block(Label::ENTRY).seq.len(), 1);
    }

    #[test]
    fn mixed_join_preds_are_split_by_mechanism() {
        let mut m = Module::new("unit");
        let mut f = Function::new("f");
        let region = RegionId(0);
        let join = f.add_block(Terminator::Ret { value: None });
        let sync_pred = f.add_block(Terminator::Sync { cont: join, region });
        let plain_pred = f.add_block(Terminator::Br { target: join });
        f.set_terminator(
            Label::ENTRY,
            Terminator::CondBr { cond: Operand::i64(1), then_to: sync_pred, else_to: plain_pred },
        );

        let inserted = setup_blocks(&m, &mut f);
        assert_eq!(inserted, 1);
        // The sync predecessor now reaches the join through its own block.
        let Terminator::Sync { cont, .. } = f.block(sync_pred).terminator else {
            unreachable!();
        };
        assert_ne!(cont, join);
        assert!(matches!(
            f.block(cont).terminator,
            Terminator::Br { target } if target == join
        ));
        // The ordinary predecessor still branches straight to the join.
        assert!(matches!(
            f.block(plain_pred).terminator,
            Terminator::Br { target } if target == join
        ));
    }
}
