//! Non-terminator instruction kinds.
//!
//! Each instruction is a small data structure with public fields. The
//! [`Instr`] enum is the tagged union stored in basic blocks; the generated
//! `InstrKind` discriminant (via `strum`) supports fast classification
//! without matching on payloads.
use auto_enums::auto_enum;
use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, EnumIs, EnumTryAs};

use crate::{
    modules::operand::{FuncRef, Name, Operand},
    types::Ty,
};

/// Common interface implemented by every instruction node.
///
/// Provides lightweight iteration over an instruction's input operands and
/// exposes its optional destination SSA name.
pub trait Instruction {
    /// Iterate over all input operands for this instruction.
    fn operands(&self) -> impl Iterator<Item = &Operand>;

    /// Mutably iterate over all input operands for this instruction.
    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand>;

    /// Return the destination SSA name if the instruction produces a result.
    fn destination(&self) -> Option<Name> {
        None
    }

    /// Convenience iterator over referenced SSA names. Immediates, globals
    /// and function references are ignored.
    fn name_dependencies(&self) -> impl Iterator<Item = Name> {
        self.operands().filter_map(|op| op.as_reg())
    }
}

/// Two-operand integer arithmetic used both by source programs and by
/// synthesized identifier and trip-count computations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BinOp {
    pub dest: Name,
    pub kind: BinOpKind,
    pub ty: Ty,
    pub lhs: Operand,
    pub rhs: Operand,
}

impl Instruction for BinOp {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        [&self.lhs, &self.rhs].into_iter()
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        [&mut self.lhs, &mut self.rhs].into_iter()
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }
}

/// Integer comparison predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CmpOp {
    Eq,
    Ne,
    Ult,
    Ule,
    Slt,
    Sle,
}

/// Integer comparison producing an `i1` result.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Cmp {
    pub dest: Name,
    pub op: CmpOp,
    pub ty: Ty,
    pub lhs: Operand,
    pub rhs: Operand,
}

impl Instruction for Cmp {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        [&self.lhs, &self.rhs].into_iter()
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        [&mut self.lhs, &mut self.rhs].into_iter()
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }
}

/// Ordering for atomic memory operations, following the C++ memory model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MemoryOrdering {
    Monotonic,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}

bitflags! {
    /// Source-level annotations on a memory access that cannot be recovered
    /// from the IR itself (the front end records them).
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct MemAnnot: u8 {
        /// The access reads a virtual-dispatch table.
        const VTABLE = 1 << 0;
    }
}

/// Load from memory into a destination SSA name.
///
/// If an `ordering` is present the load is atomic with that ordering.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Load {
    pub dest: Name,
    pub ty: Ty,
    pub addr: Operand,
    pub align: u32,
    pub ordering: Option<MemoryOrdering>,
    pub volatile: bool,
    pub annot: MemAnnot,
}

impl Instruction for Load {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        std::iter::once(&self.addr)
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        std::iter::once(&mut self.addr)
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }
}

/// Store a value to memory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Store {
    pub ty: Ty,
    pub addr: Operand,
    pub value: Operand,
    pub align: u32,
    pub ordering: Option<MemoryOrdering>,
    pub volatile: bool,
    pub annot: MemAnnot,
}

impl Instruction for Store {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        [&self.addr, &self.value].into_iter()
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        [&mut self.addr, &mut self.value].into_iter()
    }
}

/// Atomic read-modify-write operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RmwOp {
    Xchg,
    Add,
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AtomicRmw {
    pub dest: Name,
    pub op: RmwOp,
    pub ty: Ty,
    pub addr: Operand,
    pub value: Operand,
    pub ordering: MemoryOrdering,
}

impl Instruction for AtomicRmw {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        [&self.addr, &self.value].into_iter()
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        [&mut self.addr, &mut self.value].into_iter()
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }
}

/// Memory fence with the given ordering.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Fence {
    pub ordering: MemoryOrdering,
}

impl Instruction for Fence {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        std::iter::empty()
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        std::iter::empty()
    }
}

/// Stack allocation of one or `count` elements of `ty`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Alloca {
    pub dest: Name,
    pub ty: Ty,
    /// Runtime element count for array allocations; `None` allocates one.
    pub count: Option<Operand>,
    pub align: u32,
    /// Variable name recorded by the front end, when known.
    pub var_name: Option<String>,
}

impl Instruction for Alloca {
    #[auto_enum(Iterator)]
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        match &self.count {
            Some(count) => std::iter::once(count),
            None => std::iter::empty(),
        }
    }

    #[auto_enum(Iterator)]
    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        match &mut self.count {
            Some(count) => std::iter::once(count),
            None => std::iter::empty(),
        }
    }

    fn destination(&self) -> Option<Name> {
        Some(self.dest)
    }
}

/// A call target: a known function symbol or a computed address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Callee {
    Func(FuncRef),
    Indirect(Operand),
}

/// Ordinary (non-exceptional) function call.
///
/// Calls that may raise are represented with the `Invoke` terminator
/// instead; the instrumenter promotes between the two forms.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Call {
    pub dest: Option<Name>,
    pub callee: Callee,
    pub args: Vec<Operand>,
    pub return_ty: Option<Ty>,
    /// The callee is known never to return normally.
    pub no_return: bool,
}

impl Instruction for Call {
    #[auto_enum(Iterator)]
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        match &self.callee {
            Callee::Indirect(target) => std::iter::once(target).chain(self.args.iter()),
            Callee::Func(_) => self.args.iter(),
        }
    }

    #[auto_enum(Iterator)]
    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        match &mut self.callee {
            Callee::Indirect(target) => std::iter::once(target).chain(self.args.iter_mut()),
            Callee::Func(_) => self.args.iter_mut(),
        }
    }

    fn destination(&self) -> Option<Name> {
        self.dest
    }
}

/// Memory copy/fill intrinsic forms.
///
/// These are rewritten to ordinary calls by the instrumenter so that later
/// stages need no special-casing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MemIntrKind {
    Cpy,
    Move,
    Set,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemIntr {
    pub kind: MemIntrKind,
    pub dst: Operand,
    /// Source pointer for `Cpy`/`Move`, fill byte value for `Set`.
    pub src: Operand,
    pub len: Operand,
}

impl Instruction for MemIntr {
    fn operands(&self) -> impl Iterator<Item = &Operand> {
        [&self.dst, &self.src, &self.len].into_iter()
    }

    fn operands_mut(&mut self) -> impl Iterator<Item = &mut Operand> {
        [&mut self.dst, &mut self.src, &mut self.len].into_iter()
    }
}

/// Discriminated union covering all non-terminator instruction kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, EnumIs, EnumTryAs, EnumDiscriminants)]
#[strum_discriminants(name(InstrKind))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Instr {
    BinOp(BinOp),
    Cmp(Cmp),
    Load(Load),
    Store(Store),
    AtomicRmw(AtomicRmw),
    Fence(Fence),
    Alloca(Alloca),
    Call(Call),
    MemIntr(MemIntr),
}

macro_rules! for_each_instr {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Instr::BinOp($inner) => $body,
            Instr::Cmp($inner) => $body,
            Instr::Load($inner) => $body,
            Instr::Store($inner) => $body,
            Instr::AtomicRmw($inner) => $body,
            Instr::Fence($inner) => $body,
            Instr::Alloca($inner) => $body,
            Instr::Call($inner) => $body,
            Instr::MemIntr($inner) => $body,
        }
    };
}

impl Instr {
    pub fn kind(&self) -> InstrKind {
        self.into()
    }

    pub fn operands(&self) -> Box<dyn Iterator<Item = &Operand> + '_> {
        for_each_instr!(self, inner => Box::new(inner.operands()))
    }

    pub fn operands_mut(&mut self) -> Box<dyn Iterator<Item = &mut Operand> + '_> {
        for_each_instr!(self, inner => Box::new(inner.operands_mut()))
    }

    pub fn destination(&self) -> Option<Name> {
        for_each_instr!(self, inner => inner.destination())
    }

    /// True for loads and stores that carry an atomic ordering, and for all
    /// read-modify-write and fence instructions.
    pub fn is_atomic_access(&self) -> bool {
        match self {
            Instr::Load(load) => load.ordering.is_some(),
            Instr::Store(store) => store.ordering.is_some(),
            Instr::AtomicRmw(_) | Instr::Fence(_) => true,
            _ => false,
        }
    }
}

macro_rules! define_instr_from {
    ($typ:ty, $variant:ident) => {
        impl From<$typ> for Instr {
            fn from(inst: $typ) -> Self {
                Instr::$variant(inst)
            }
        }
    };
}

define_instr_from!(BinOp, BinOp);
define_instr_from!(Cmp, Cmp);
define_instr_from!(Load, Load);
define_instr_from!(Store, Store);
define_instr_from!(AtomicRmw, AtomicRmw);
define_instr_from!(Fence, Fence);
define_instr_from!(Alloca, Alloca);
define_instr_from!(Call, Call);
define_instr_from!(MemIntr, MemIntr);
