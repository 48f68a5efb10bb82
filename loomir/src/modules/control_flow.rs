//! Control-flow terminator instructions.
//!
//! Besides the ordinary branch/return family this IR models structured
//! fork/join concurrency directly in its terminators: `Detach` spawns a
//! child task, `Reattach` returns the task to its continuation, `Sync`
//! joins every task forked in the same region, and the unwind-path forms
//! (`SyncUnwind`, `DetachedRethrow`, `TaskFrameResume`) give exception
//! propagation across task boundaries explicit, instrumentable edges.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use strum::{EnumDiscriminants, EnumIs};

use crate::modules::{
    instructions::Callee,
    operand::{Label, Name, Operand},
};

/// Identifier of a fork/join synchronization region.
///
/// A region groups the forks that a join waits on. Regions are scoped to a
/// single function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RegionId(pub u32);

/// Control flow terminator instructions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, EnumIs, EnumDiscriminants)]
#[strum_discriminants(name(TermKind))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Terminator {
    /// Unconditional jump.
    Br { target: Label },
    /// Two-way conditional branch on an `i1` operand.
    CondBr {
        cond: Operand,
        then_to: Label,
        else_to: Label,
    },
    /// Return from function, optionally with a value.
    Ret { value: Option<Operand> },
    /// Control never reaches this point.
    Unreachable,
    /// Call with explicit exception edges: control resumes at `normal` on
    /// ordinary return and at `unwind` when the callee raises.
    Invoke {
        dest: Option<Name>,
        callee: Callee,
        args: Vec<Operand>,
        normal: Label,
        unwind: Label,
    },
    /// Propagate an in-flight exception out of the function.
    Resume { value: Option<Operand> },
    /// Fork: spawn a child task executing `task`, continuing at `cont`.
    /// When the spawned task can raise, `unwind` names the handler edge.
    Detach {
        task: Label,
        cont: Label,
        unwind: Option<Label>,
        region: RegionId,
    },
    /// Normal task exit: return control to the fork's continuation.
    Reattach { cont: Label, region: RegionId },
    /// Join: wait for every task forked in `region`, then continue.
    Sync { cont: Label, region: RegionId },
    /// Join in explicit-exception-edge form: the join itself may observe a
    /// raised exception from one of the joined tasks.
    SyncUnwind {
        region: RegionId,
        normal: Label,
        unwind: Label,
    },
    /// Exceptional task exit: rethrow an exception raised inside a spawned
    /// task to the enclosing scope's handler.
    DetachedRethrow { region: RegionId, unwind: Label },
    /// Intermediate resume point for tasks that maintain a separate frame;
    /// forwards the in-flight exception to the frame owner's handler.
    TaskFrameResume { unwind: Label },
}

impl Terminator {
    pub fn kind(&self) -> TermKind {
        self.into()
    }

    /// All successor labels, in edge order.
    pub fn successors(&self) -> SmallVec<[Label; 2]> {
        match self {
            Terminator::Br { target } => SmallVec::from_slice(&[*target]),
            Terminator::CondBr { then_to, else_to, .. } => {
                SmallVec::from_slice(&[*then_to, *else_to])
            }
            Terminator::Ret { .. } | Terminator::Unreachable | Terminator::Resume { .. } => {
                SmallVec::new()
            }
            Terminator::Invoke { normal, unwind, .. } => SmallVec::from_slice(&[*normal, *unwind]),
            Terminator::Detach { task, cont, unwind, .. } => {
                let mut out = SmallVec::from_slice(&[*task, *cont]);
                if let Some(unwind) = unwind {
                    out.push(*unwind);
                }
                out
            }
            Terminator::Reattach { cont, .. } => SmallVec::from_slice(&[*cont]),
            Terminator::Sync { cont, .. } => SmallVec::from_slice(&[*cont]),
            Terminator::SyncUnwind { normal, unwind, .. } => {
                SmallVec::from_slice(&[*normal, *unwind])
            }
            Terminator::DetachedRethrow { unwind, .. } => SmallVec::from_slice(&[*unwind]),
            Terminator::TaskFrameResume { unwind } => SmallVec::from_slice(&[*unwind]),
        }
    }

    /// Mutable references to all successor labels, in edge order.
    pub fn successors_mut(&mut self) -> SmallVec<[&mut Label; 2]> {
        match self {
            Terminator::Br { target } => SmallVec::from_iter([target]),
            Terminator::CondBr { then_to, else_to, .. } => SmallVec::from_iter([then_to, else_to]),
            Terminator::Ret { .. } | Terminator::Unreachable | Terminator::Resume { .. } => {
                SmallVec::new()
            }
            Terminator::Invoke { normal, unwind, .. } => SmallVec::from_iter([normal, unwind]),
            Terminator::Detach { task, cont, unwind, .. } => {
                let mut out = SmallVec::from_iter([task, cont]);
                if let Some(unwind) = unwind {
                    out.push(unwind);
                }
                out
            }
            Terminator::Reattach { cont, .. } => SmallVec::from_iter([cont]),
            Terminator::Sync { cont, .. } => SmallVec::from_iter([cont]),
            Terminator::SyncUnwind { normal, unwind, .. } => SmallVec::from_iter([normal, unwind]),
            Terminator::DetachedRethrow { unwind, .. } => SmallVec::from_iter([unwind]),
            Terminator::TaskFrameResume { unwind } => SmallVec::from_iter([unwind]),
        }
    }

    /// Successor labels reached only when an exception is in flight.
    pub fn unwind_successors(&self) -> SmallVec<[Label; 2]> {
        match self {
            Terminator::Invoke { unwind, .. }
            | Terminator::SyncUnwind { unwind, .. }
            | Terminator::DetachedRethrow { unwind, .. }
            | Terminator::TaskFrameResume { unwind } => SmallVec::from_slice(&[*unwind]),
            Terminator::Detach { unwind: Some(unwind), .. } => SmallVec::from_slice(&[*unwind]),
            _ => SmallVec::new(),
        }
    }

    /// Replace every successor edge pointing at `old` with `new`.
    pub fn retarget(&mut self, old: Label, new: Label) {
        for succ in self.successors_mut() {
            if *succ == old {
                *succ = new;
            }
        }
    }

    /// The sync region this terminator participates in, if any.
    pub fn region(&self) -> Option<RegionId> {
        match self {
            Terminator::Detach { region, .. }
            | Terminator::Reattach { region, .. }
            | Terminator::Sync { region, .. }
            | Terminator::SyncUnwind { region, .. }
            | Terminator::DetachedRethrow { region, .. } => Some(*region),
            _ => None,
        }
    }

    /// Input operands of the terminator.
    pub fn operands(&self) -> SmallVec<[&Operand; 2]> {
        match self {
            Terminator::CondBr { cond, .. } => SmallVec::from_iter([cond]),
            Terminator::Ret { value } | Terminator::Resume { value } => {
                SmallVec::from_iter(value.iter())
            }
            Terminator::Invoke { callee, args, .. } => {
                let mut out: SmallVec<[&Operand; 2]> = SmallVec::new();
                if let Callee::Indirect(target) = callee {
                    out.push(target);
                }
                out.extend(args.iter());
                out
            }
            _ => SmallVec::new(),
        }
    }

    /// Mutable references to the terminator's input operands.
    pub fn operands_mut(&mut self) -> SmallVec<[&mut Operand; 2]> {
        match self {
            Terminator::CondBr { cond, .. } => SmallVec::from_iter([cond]),
            Terminator::Ret { value } | Terminator::Resume { value } => {
                SmallVec::from_iter(value.iter_mut())
            }
            Terminator::Invoke { callee, args, .. } => {
                let mut out: SmallVec<[&mut Operand; 2]> = SmallVec::new();
                if let Callee::Indirect(target) = callee {
                    out.push(target);
                }
                out.extend(args.iter_mut());
                out
            }
            _ => SmallVec::new(),
        }
    }

    /// The destination name defined by this terminator (invokes only).
    pub fn destination(&self) -> Option<Name> {
        match self {
            Terminator::Invoke { dest, .. } => *dest,
            _ => None,
        }
    }
}
