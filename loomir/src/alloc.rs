//! Standard-library allocation and free classification.
//!
//! The name-based oracle that classifies call targets into the malloc/new
//! family and the free/delete family, used by the instrumentation engine to
//! route allocation calls to their own event category and to extract size
//! and alignment arguments per kind.
use strum::EnumIs;

/// Heap-allocation function kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIs)]
pub enum AllocFnKind {
    Malloc,
    Calloc,
    Realloc,
    AlignedAlloc,
    /// `operator new` and its nothrow/aligned variants.
    New,
    /// `operator new[]` and its variants.
    NewArray,
}

impl AllocFnKind {
    /// Stable encoding used in property words.
    pub fn encode(self) -> u8 {
        match self {
            AllocFnKind::Malloc => 0,
            AllocFnKind::Calloc => 1,
            AllocFnKind::Realloc => 2,
            AllocFnKind::AlignedAlloc => 3,
            AllocFnKind::New => 4,
            AllocFnKind::NewArray => 5,
        }
    }
}

/// Deallocation function kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIs)]
pub enum FreeFnKind {
    Free,
    /// `operator delete` and its variants.
    Delete,
    /// `operator delete[]` and its variants.
    DeleteArray,
}

impl FreeFnKind {
    pub fn encode(self) -> u8 {
        match self {
            FreeFnKind::Free => 0,
            FreeFnKind::Delete => 1,
            FreeFnKind::DeleteArray => 2,
        }
    }
}

/// Classify a callee name as a heap-allocation function.
pub fn classify_alloc(name: &str) -> Option<AllocFnKind> {
    match name {
        "malloc" | "valloc" => Some(AllocFnKind::Malloc),
        "calloc" => Some(AllocFnKind::Calloc),
        "realloc" | "reallocf" => Some(AllocFnKind::Realloc),
        "aligned_alloc" | "memalign" | "posix_memalign" => Some(AllocFnKind::AlignedAlloc),
        // Itanium-mangled operator new / new[] (plain, nothrow, aligned).
        "_Znwm" | "_ZnwmRKSt9nothrow_t" | "_ZnwmSt11align_val_t" => Some(AllocFnKind::New),
        "_Znam" | "_ZnamRKSt9nothrow_t" | "_ZnamSt11align_val_t" => Some(AllocFnKind::NewArray),
        _ => None,
    }
}

/// Classify a callee name as a deallocation function.
pub fn classify_free(name: &str) -> Option<FreeFnKind> {
    match name {
        "free" | "cfree" => Some(FreeFnKind::Free),
        // Itanium-mangled operator delete / delete[] (plain, sized, aligned).
        "_ZdlPv" | "_ZdlPvm" | "_ZdlPvSt11align_val_t" => Some(FreeFnKind::Delete),
        "_ZdaPv" | "_ZdaPvm" | "_ZdaPvSt11align_val_t" => Some(FreeFnKind::DeleteArray),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_malloc_family() {
        assert_eq!(classify_alloc("malloc"), Some(AllocFnKind::Malloc));
        assert_eq!(classify_alloc("calloc"), Some(AllocFnKind::Calloc));
        assert_eq!(classify_alloc("_Znwm"), Some(AllocFnKind::New));
        assert_eq!(classify_alloc("printf"), None);
    }

    #[test]
    fn classifies_the_free_family() {
        assert_eq!(classify_free("free"), Some(FreeFnKind::Free));
        assert_eq!(classify_free("_ZdaPv"), Some(FreeFnKind::DeleteArray));
        assert_eq!(classify_free("malloc"), None);
    }
}
