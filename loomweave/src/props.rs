//! Property encoders: fixed-width per-event flag words.
//!
//! Every hook receives one 64-bit property word whose layout is frozen per
//! event kind. Pure flag words use `bitflags`; the kinds that carry a
//! multi-bit field (alignment class, allocation-function kind) pack it into
//! the low bits with the flags above.
use bitflags::bitflags;
use loomir::{
    alloc::{AllocFnKind, FreeFnKind},
    modules::operand::Operand,
};

/// Convert a property word to the operand passed to a hook.
fn word_operand(bits: u64) -> Operand {
    Operand::i64(bits as i64)
}

bitflags! {
    /// Function-entry properties.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct FuncProp: u64 {
        /// The function contains at least one fork.
        const MAY_SPAWN = 1 << 0;
    }
}

bitflags! {
    /// Function-exit properties.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct FuncExitProp: u64 {
        const MAY_SPAWN = 1 << 0;
        /// The exit propagates an exception rather than returning.
        const EH_RETURN = 1 << 1;
    }
}

bitflags! {
    /// Basic-block properties.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct BlockProp: u64 {
        /// The block is entered through unwind edges only.
        const LANDING_PAD = 1 << 0;
    }
}

bitflags! {
    /// Loop properties.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct LoopProp: u64 {
        /// The loop body is spawned as parallel tasks.
        const FORK_JOIN_BODY = 1 << 0;
        /// Exactly one edge leaves the loop.
        const UNIQUE_EXITING_EDGE = 1 << 1;
    }
}

bitflags! {
    /// Loop-exit properties.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct LoopExitProp: u64 {
        /// The exiting block is the loop's back edge source.
        const LATCH = 1 << 0;
    }
}

bitflags! {
    /// Callsite properties.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct CallProp: u64 {
        /// The call target is a computed address.
        const INDIRECT = 1 << 0;
    }
}

bitflags! {
    /// Local (stack) allocation properties.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct AllocaProp: u64 {
        /// Entry-block allocation of a statically known size.
        const STATIC = 1 << 0;
    }
}

bitflags! {
    /// Task and task-exit properties.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct TaskProp: u64 {
        /// The task is one iteration of a parallel loop body.
        const PARALLEL_LOOP_BODY = 1 << 0;
    }
}

bitflags! {
    /// Fork-continuation properties.
    #[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
    pub struct ContinuationProp: u64 {
        /// The continuation is reached along the unwind path.
        const UNWIND = 1 << 0;
    }
}

macro_rules! prop_operand {
    ($($ty:ty),+ $(,)?) => {
        $(impl $ty {
            pub fn operand(&self) -> Operand {
                word_operand(self.bits())
            }
        })+
    };
}

prop_operand!(
    FuncProp,
    FuncExitProp,
    BlockProp,
    LoopProp,
    LoopExitProp,
    CallProp,
    AllocaProp,
    TaskProp,
    ContinuationProp,
);

/// Load/store properties.
///
/// Layout: bits 0..8 hold the alignment class (log2 of the alignment plus
/// one, zero when unknown); flags follow above.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LoadStoreProp {
    bits: u64,
}

impl LoadStoreProp {
    const ALIGN_MASK: u64 = 0xff;
    pub const VTABLE_ACCESS: u64 = 1 << 8;
    pub const CONSTANT_TARGET: u64 = 1 << 9;
    pub const STACK_LOCAL: u64 = 1 << 10;
    pub const MAY_ESCAPE: u64 = 1 << 11;
    pub const THREAD_LOCAL: u64 = 1 << 12;
    /// Loads only: an earlier instruction in the same block wrote this
    /// address.
    pub const WRITTEN_EARLIER: u64 = 1 << 13;

    /// Record the access alignment in bytes (must be a power of two; zero
    /// means unknown).
    pub fn set_alignment(&mut self, align: u32) {
        let class = if align == 0 { 0 } else { align.trailing_zeros() as u64 + 1 };
        self.bits = (self.bits & !Self::ALIGN_MASK) | (class & Self::ALIGN_MASK);
    }

    pub fn alignment(&self) -> u32 {
        let class = self.bits & Self::ALIGN_MASK;
        if class == 0 { 0 } else { 1 << (class - 1) }
    }

    pub fn set(&mut self, flag: u64, value: bool) {
        if value {
            self.bits |= flag;
        } else {
            self.bits &= !flag;
        }
    }

    pub fn contains(&self, flag: u64) -> bool {
        self.bits & flag != 0
    }

    pub fn operand(&self) -> Operand {
        word_operand(self.bits)
    }
}

/// Heap-allocation properties: the allocation-function kind in the low
/// byte.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct AllocFnProp {
    bits: u64,
}

impl AllocFnProp {
    pub fn set_kind(&mut self, kind: AllocFnKind) {
        self.bits = (self.bits & !0xff) | kind.encode() as u64;
    }

    pub fn operand(&self) -> Operand {
        word_operand(self.bits)
    }
}

/// Free properties: the free-function kind in the low byte.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FreeProp {
    bits: u64,
}

impl FreeProp {
    pub fn set_kind(&mut self, kind: FreeFnKind) {
        self.bits = (self.bits & !0xff) | kind.encode() as u64;
    }

    pub fn operand(&self) -> Operand {
        word_operand(self.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_round_trips_through_the_class_field() {
        let mut prop = LoadStoreProp::default();
        prop.set_alignment(8);
        assert_eq!(prop.alignment(), 8);
        prop.set_alignment(1);
        assert_eq!(prop.alignment(), 1);
        prop.set_alignment(0);
        assert_eq!(prop.alignment(), 0);
    }

    #[test]
    fn flags_do_not_disturb_the_alignment_field() {
        let mut prop = LoadStoreProp::default();
        prop.set_alignment(16);
        prop.set(LoadStoreProp::WRITTEN_EARLIER, true);
        prop.set(LoadStoreProp::STACK_LOCAL, true);
        assert_eq!(prop.alignment(), 16);
        assert!(prop.contains(LoadStoreProp::WRITTEN_EARLIER));
        prop.set(LoadStoreProp::WRITTEN_EARLIER, false);
        assert!(!prop.contains(LoadStoreProp::WRITTEN_EARLIER));
        assert_eq!(prop.alignment(), 16);
    }
}
