//! Shared operand types for instructions.
//!
//! An instruction operand can be a reference to another SSA value (`Reg`),
//! a typed integer immediate (`Imm`), the null pointer, the address of a
//! module global, or a function reference usable as a call target or a
//! first-class value.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::EnumIs;
use uuid::Uuid;

/// SSA value identifier used to name the destination or reference another
/// instruction's result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Name(pub u32);

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// A code label naming a basic block.
///
/// Labels never cross function boundaries; they are only valid within the
/// function that defines them, and are never reused once allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Label(pub u32);

impl Label {
    /// The function entry block. Always present in a well-formed function.
    pub const ENTRY: Label = Label(0);

    pub fn is_entry(&self) -> bool {
        *self == Label::ENTRY
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if f.alternate() {
            write!(f, "label %bb{}", self.0)
        } else {
            write!(f, "%bb{}", self.0)
        }
    }
}

/// Identifier of a module-level global variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GlobalId(pub u32);

/// Identifier of an external function declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ExtId(pub u32);

/// A reference to a function symbol, internal or external.
///
/// Internal functions are defined within the current module and keyed by
/// their UUID; external functions are declared but defined elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FuncRef {
    Internal(Uuid),
    External(ExtId),
}

/// A typed integer immediate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Imm {
    pub value: i64,
    pub bits: u32,
}

impl Imm {
    pub fn i1(value: bool) -> Imm {
        Imm { value: value as i64, bits: 1 }
    }

    pub fn i32(value: i32) -> Imm {
        Imm { value: value as i64, bits: 32 }
    }

    pub fn i64(value: i64) -> Imm {
        Imm { value, bits: 64 }
    }
}

/// Instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Operand {
    /// Reference to a previously defined SSA value.
    Reg(Name),
    /// Immediate integer literal.
    Imm(Imm),
    /// The null pointer constant.
    Null,
    /// Address of a module global.
    Global(GlobalId),
    /// Function reference (call target or first-class function pointer).
    Func(FuncRef),
}

impl Operand {
    pub fn i32(value: i32) -> Operand {
        Operand::Imm(Imm::i32(value))
    }

    pub fn i64(value: i64) -> Operand {
        Operand::Imm(Imm::i64(value))
    }

    /// The SSA name referenced by this operand, if it is a register.
    pub fn as_reg(&self) -> Option<Name> {
        match self {
            Operand::Reg(name) => Some(*name),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Reg(name) => write!(f, "{}", name),
            Operand::Imm(imm) => write!(f, "i{} {}", imm.bits, imm.value),
            Operand::Null => write!(f, "null"),
            Operand::Global(gid) => write!(f, "@g{}", gid.0),
            Operand::Func(FuncRef::Internal(uuid)) => write!(f, "@{}", uuid),
            Operand::Func(FuncRef::External(ext)) => write!(f, "@ext{}", ext.0),
        }
    }
}
