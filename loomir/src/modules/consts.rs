//! Constant values for global initializers.
//!
//! Globals are initialized with structured constants: scalars, C strings,
//! packed structs/arrays, and address references to other globals or
//! functions. The instrumentation tables are serialized into this
//! representation and can be read back from it.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::EnumIs;

use crate::{
    modules::operand::{FuncRef, GlobalId, Imm},
    types::Ty,
};

/// A constant initializer value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Const {
    /// Typed integer constant.
    Int(Imm),
    /// NUL-terminated byte string.
    CStr(String),
    /// Null pointer.
    Null,
    /// Zero value of the given type.
    Zero(Ty),
    /// Packed structure of constants.
    Struct(Vec<Const>),
    /// Homogeneous array of constants.
    Array(Vec<Const>),
    /// Address of another global.
    GlobalRef(GlobalId),
    /// Address of a function.
    FuncRef(FuncRef),
}

impl Const {
    pub fn i32(value: i32) -> Const {
        Const::Int(Imm::i32(value))
    }

    pub fn i64(value: i64) -> Const {
        Const::Int(Imm::i64(value))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Const::Int(imm) => Some(imm.value),
            Const::Zero(Ty::Int(_)) => Some(0),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Const]> {
        match self {
            Const::Array(elems) => Some(elems),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&[Const]> {
        match self {
            Const::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_global_ref(&self) -> Option<GlobalId> {
        match self {
            Const::GlobalRef(gid) => Some(*gid),
            _ => None,
        }
    }
}
