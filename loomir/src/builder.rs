//! Function mutation helpers.
//!
//! [`Cursor`] is an insertion point inside a basic block, used to emit
//! instructions one after another the way an IR builder does. The free
//! functions implement the standard block transforms (split a block at an
//! instruction, split off a subset of predecessors, split a critical edge)
//! while keeping every existing instruction handle valid.
use crate::{
    modules::{
        BasicBlock, Function, InstrRef,
        control_flow::Terminator,
        instructions::{
            Alloca, BinOp, BinOpKind, Call, Callee, Cmp, CmpOp, Instr, Load, MemAnnot, Store,
        },
        operand::{ExtId, FuncRef, Label, Name, Operand},
    },
    types::Ty,
};

/// An insertion point inside a block of a function.
///
/// The cursor owns a mutable borrow of the function for its lifetime; each
/// `emit` inserts at the cursor and advances past the inserted instruction.
pub struct Cursor<'f> {
    f: &'f mut Function,
    block: Label,
    index: usize,
}

impl<'f> Cursor<'f> {
    /// Position at the start of `block`.
    pub fn at_block_start(f: &'f mut Function, block: Label) -> Cursor<'f> {
        Cursor { f, block, index: 0 }
    }

    /// Position immediately before the terminator of `block`.
    pub fn before_terminator(f: &'f mut Function, block: Label) -> Cursor<'f> {
        let index = f.block(block).seq.len();
        Cursor { f, block, index }
    }

    /// Position immediately before `iref` in `block`.
    pub fn before(f: &'f mut Function, block: Label, iref: InstrRef) -> Cursor<'f> {
        let index = f.position(block, iref).expect("instruction lives in the given block");
        Cursor { f, block, index }
    }

    /// Position immediately after `iref` in `block`.
    pub fn after(f: &'f mut Function, block: Label, iref: InstrRef) -> Cursor<'f> {
        let index = f.position(block, iref).expect("instruction lives in the given block");
        Cursor { f, block, index: index + 1 }
    }

    pub fn block(&self) -> Label {
        self.block
    }

    pub fn func(&mut self) -> &mut Function {
        self.f
    }

    /// Insert `instr` at the cursor and advance past it.
    pub fn emit(&mut self, instr: Instr) -> InstrRef {
        let iref = self.f.insert(self.block, self.index, instr);
        self.index += 1;
        iref
    }

    pub fn fresh_name(&mut self) -> Name {
        self.f.fresh_name()
    }

    pub fn load(&mut self, ty: Ty, addr: Operand) -> Name {
        let dest = self.f.fresh_name();
        self.emit(Instr::Load(Load {
            dest,
            ty,
            addr,
            align: 0,
            ordering: None,
            volatile: false,
            annot: MemAnnot::empty(),
        }));
        dest
    }

    pub fn store(&mut self, ty: Ty, addr: Operand, value: Operand) -> InstrRef {
        self.emit(Instr::Store(Store {
            ty,
            addr,
            value,
            align: 0,
            ordering: None,
            volatile: false,
            annot: MemAnnot::empty(),
        }))
    }

    pub fn binop(&mut self, kind: BinOpKind, ty: Ty, lhs: Operand, rhs: Operand) -> Name {
        let dest = self.f.fresh_name();
        self.emit(Instr::BinOp(BinOp { dest, kind, ty, lhs, rhs }));
        dest
    }

    pub fn add(&mut self, ty: Ty, lhs: Operand, rhs: Operand) -> Name {
        self.binop(BinOpKind::Add, ty, lhs, rhs)
    }

    pub fn sub(&mut self, ty: Ty, lhs: Operand, rhs: Operand) -> Name {
        self.binop(BinOpKind::Sub, ty, lhs, rhs)
    }

    pub fn mul(&mut self, ty: Ty, lhs: Operand, rhs: Operand) -> Name {
        self.binop(BinOpKind::Mul, ty, lhs, rhs)
    }

    pub fn cmp(&mut self, op: CmpOp, ty: Ty, lhs: Operand, rhs: Operand) -> Name {
        let dest = self.f.fresh_name();
        self.emit(Instr::Cmp(Cmp { dest, op, ty, lhs, rhs }));
        dest
    }

    pub fn alloca(&mut self, ty: Ty) -> Name {
        let dest = self.f.fresh_name();
        self.emit(Instr::Alloca(Alloca { dest, ty, count: None, align: 0, var_name: None }));
        dest
    }

    /// Emit a void call to an external function.
    pub fn call_ext(&mut self, ext: ExtId, args: Vec<Operand>) -> InstrRef {
        self.emit(Instr::Call(Call {
            dest: None,
            callee: Callee::Func(FuncRef::External(ext)),
            args,
            return_ty: None,
            no_return: false,
        }))
    }
}

/// Split `block` before the instruction at `index`.
///
/// The new block receives the tail of the sequence plus the old terminator;
/// `block` is re-terminated with a branch to the new block. Returns the new
/// label.
pub fn split_block(f: &mut Function, block: Label, index: usize) -> Label {
    let new_label = f.fresh_label();
    let bb = f.block_mut(block);
    let tail = bb.seq.split_off(index);
    let terminator = std::mem::replace(&mut bb.terminator, Terminator::Br { target: new_label });
    f.body.insert(new_label, BasicBlock { seq: tail, terminator });
    new_label
}

/// Split the given predecessors off `target` into a fresh block.
///
/// Each listed predecessor's edges into `target` are retargeted at a new
/// block that falls through to `target`. If `target` holds nothing but an
/// `unreachable` terminator the new block is itself terminated with
/// `unreachable` rather than a branch, preserving the deadness of paths
/// that can never complete (fork-unwind placeholder blocks rely on this).
pub fn split_predecessors(f: &mut Function, target: Label, preds: &[Label]) -> Label {
    let target_is_dead = {
        let bb = f.block(target);
        bb.seq.is_empty() && matches!(bb.terminator, Terminator::Unreachable)
    };
    let terminator = if target_is_dead {
        Terminator::Unreachable
    } else {
        Terminator::Br { target }
    };
    let new_label = f.fresh_label();
    f.body.insert(new_label, BasicBlock { seq: Vec::new(), terminator });
    for pred in preds {
        f.block_mut(*pred).terminator.retarget(target, new_label);
    }
    new_label
}

/// Split the edge `from -> to` by interposing a fresh block.
pub fn split_critical_edge(f: &mut Function, from: Label, to: Label) -> Label {
    let new_label = f.fresh_label();
    f.body.insert(
        new_label,
        BasicBlock { seq: Vec::new(), terminator: Terminator::Br { target: to } },
    );
    f.block_mut(from).terminator.retarget(to, new_label);
    new_label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_block_moves_tail_and_terminator() {
        let mut f = Function::new("f");
        let mut cur = Cursor::at_block_start(&mut f, Label::ENTRY);
        let a = cur.add(Ty::I64, Operand::i64(1), Operand::i64(2));
        let b = cur.add(Ty::I64, Operand::Reg(a), Operand::i64(3));
        f.set_terminator(Label::ENTRY, Terminator::Ret { value: Some(Operand::Reg(b)) });

        let tail = split_block(&mut f, Label::ENTRY, 1);
        assert_eq!(f.block(Label::ENTRY).seq.len(), 1);
        assert_eq!(f.block(tail).seq.len(), 1);
        assert!(matches!(
            f.block(Label::ENTRY).terminator,
            Terminator::Br { target } if target == tail
        ));
        assert!(matches!(f.block(tail).terminator, Terminator::Ret { .. }));
    }

    #[test]
    fn split_predecessors_retargets_only_listed_preds() {
        let mut f = Function::new("f");
        let join = f.add_block(Terminator::Ret { value: None });
        let p1 = f.add_block(Terminator::Br { target: join });
        let p2 = f.add_block(Terminator::Br { target: join });
        f.set_terminator(
            Label::ENTRY,
            Terminator::CondBr { cond: Operand::i64(1), then_to: p1, else_to: p2 },
        );

        let split = split_predecessors(&mut f, join, &[p1]);
        assert!(matches!(
            f.block(p1).terminator,
            Terminator::Br { target } if target == split
        ));
        assert!(matches!(
            f.block(p2).terminator,
            Terminator::Br { target } if target == join
        ));
        assert!(matches!(
            f.block(split).terminator,
            Terminator::Br { target } if target == join
        ));
    }

    #[test]
    fn split_predecessors_of_dead_block_stays_unreachable() {
        let mut f = Function::new("f");
        let dead = f.add_block(Terminator::Unreachable);
        let p1 = f.add_block(Terminator::Br { target: dead });
        let p2 = f.add_block(Terminator::Br { target: dead });
        f.set_terminator(
            Label::ENTRY,
            Terminator::CondBr { cond: Operand::i64(0), then_to: p1, else_to: p2 },
        );

        let split = split_predecessors(&mut f, dead, &[p1]);
        assert!(matches!(f.block(split).terminator, Terminator::Unreachable));
    }
}
