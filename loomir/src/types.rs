//! Types module
//!
//! A small structural type system: integers of arbitrary bit width, the two
//! IEEE floating-point widths, an opaque pointer type, and packed arrays and
//! structures built from them. Types are plain values, cheap to clone and
//! compare, and carry their own size oracle: [`Ty::bit_width`] gives the
//! stored width in bits and [`Ty::byte_width`] reports the width in whole
//! bytes when the type has one.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::EnumIs;

/// A structural type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Ty {
    /// Integer of the given bit width (`i1`, `i8`, `i32`, ...).
    Int(u32),
    /// 32-bit IEEE float.
    F32,
    /// 64-bit IEEE float.
    F64,
    /// Opaque pointer. All pointers share one representation.
    Ptr,
    /// Fixed-length array of a single element type.
    Array(Box<Ty>, u64),
    /// Packed structure: an ordered list of member types.
    Struct(Vec<Ty>),
}

impl Ty {
    pub const I1: Ty = Ty::Int(1);
    pub const I8: Ty = Ty::Int(8);
    pub const I32: Ty = Ty::Int(32);
    pub const I64: Ty = Ty::Int(64);

    /// Stored width of a value of this type, in bits.
    ///
    /// Aggregates use a packed layout: an array is `len` times the
    /// byte-rounded element size, a struct the sum of its byte-rounded
    /// members.
    pub fn bit_width(&self) -> u64 {
        match self {
            Ty::Int(bits) => *bits as u64,
            Ty::F32 => 32,
            Ty::F64 => 64,
            Ty::Ptr => 64,
            Ty::Array(elem, len) => elem.alloc_size() * 8 * len,
            Ty::Struct(members) => members.iter().map(|m| m.alloc_size() * 8).sum(),
        }
    }

    /// Width in whole bytes, or `None` when the bit width is not a multiple
    /// of eight (such accesses are excluded from memory instrumentation).
    pub fn byte_width(&self) -> Option<u32> {
        let bits = self.bit_width();
        if bits % 8 == 0 {
            Some((bits / 8) as u32)
        } else {
            None
        }
    }

    /// Allocation size in bytes, rounded up to the next whole byte.
    pub fn alloc_size(&self) -> u64 {
        self.bit_width().div_ceil(8)
    }
}

impl std::fmt::Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ty::Int(bits) => write!(f, "i{}", bits),
            Ty::F32 => write!(f, "f32"),
            Ty::F64 => write!(f, "f64"),
            Ty::Ptr => write!(f, "ptr"),
            Ty::Array(elem, len) => write!(f, "[{} x {}]", len, elem),
            Ty::Struct(members) => {
                write!(f, "{{")?;
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", m)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_width_rejects_sub_byte_types() {
        assert_eq!(Ty::Int(1).byte_width(), None);
        assert_eq!(Ty::Int(7).byte_width(), None);
        assert_eq!(Ty::Int(8).byte_width(), Some(1));
        assert_eq!(Ty::I64.byte_width(), Some(8));
        assert_eq!(Ty::Ptr.byte_width(), Some(8));
    }

    #[test]
    fn aggregate_sizes_are_packed() {
        let pair = Ty::Struct(vec![Ty::I32, Ty::I8]);
        assert_eq!(pair.alloc_size(), 5);
        let arr = Ty::Array(Box::new(Ty::I32), 4);
        assert_eq!(arr.alloc_size(), 16);
        // Sub-byte elements round up to a whole byte per element.
        let bits = Ty::Array(Box::new(Ty::I1), 3);
        assert_eq!(bits.alloc_size(), 3);
    }
}
