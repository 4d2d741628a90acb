//! Registry of intercepted allocation entry points
//!
//! Maps a raw symbol name to the handler that fires at call entry and/or at
//! return. Deallocation style functions are reported at entry, where the
//! pointer is a parameter; allocation style functions are reported at
//! return, where the pointer is the return value.

/// Handlers fired when the tracee enters a hooked function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryHook {
    Free,
    Delete,
    DeleteArray,
    Realloc,
    Munmap,
    Mremap,
}

/// Handlers fired when a hooked function returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitHook {
    Malloc,
    Calloc,
    ReallocArray,
    Realloc,
    PosixMemalign,
    Mmap,
    Mmap64,
    Memalign,
    AlignedAlloc,
    Valloc,
    Pvalloc,
    Mremap,
    New,
    NewArray,
}

/// One row of the interception table
#[derive(Debug, PartialEq, Eq)]
pub struct Intercept {
    /// Human readable name
    pub demangled: &'static str,
    /// Raw symbol name as found in the dynamic symbol table
    pub name: &'static str,
    /// Lower bound on the backtrace depth for this entry point
    pub min_depth: u8,
    /// Name is mangled per the C++ ABI
    pub cpp: bool,
    pub on_entry: Option<EntryHook>,
    pub on_exit: Option<ExitHook>,
}

const fn is_mangled(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() >= 2 && b[0] == b'_' && b[1] == b'Z'
}

impl Intercept {
    const fn new(
        demangled: &'static str,
        name: &'static str,
        min_depth: u8,
        on_entry: Option<EntryHook>,
        on_exit: Option<ExitHook>,
    ) -> Self {
        assert!(
            on_entry.is_some() || on_exit.is_some(),
            "intercept without entry or exit handler"
        );
        Self {
            demangled,
            name,
            min_depth,
            cpp: is_mangled(name),
            on_entry,
            on_exit,
        }
    }

    /// Backtrace depth for this entry point given the configured depth
    pub fn depth(&self, bt_depth: u8) -> u8 {
        bt_depth.max(self.min_depth)
    }
}

/// Matched symbol handed to a handler
#[derive(Debug, Clone, Copy)]
pub struct LibrarySymbol {
    /// Entry address of the symbol in the tracee
    pub addr: u64,
    pub intercept: &'static Intercept,
}

impl LibrarySymbol {
    pub fn new(addr: u64, intercept: &'static Intercept) -> Self {
        Self { addr, intercept }
    }
}

use EntryHook as In;
use ExitHook as Out;

const fn entry(d: &'static str, n: &'static str, level: u8, hook: EntryHook) -> Intercept {
    Intercept::new(d, n, level, Some(hook), None)
}

const fn exit(d: &'static str, n: &'static str, level: u8, hook: ExitHook) -> Intercept {
    Intercept::new(d, n, level, None, Some(hook))
}

const fn both(d: &'static str, n: &'static str, level: u8, i: EntryHook, o: ExitHook) -> Intercept {
    Intercept::new(d, n, level, Some(i), Some(o))
}

static INTERCEPTS: [Intercept; 47] = [
    exit("malloc", "malloc", 0, Out::Malloc),
    entry("free", "free", 0, In::Free),
    both("realloc", "realloc", 0, In::Realloc, Out::Realloc),
    exit("calloc", "calloc", 0, Out::Calloc),
    exit("posix_memalign", "posix_memalign", 0, Out::PosixMemalign),
    exit("mmap", "mmap", 0, Out::Mmap),
    exit("mmap64", "mmap64", 1, Out::Mmap64),
    entry("munmap", "munmap", 0, In::Munmap),
    exit("memalign", "memalign", 0, Out::Memalign),
    exit("aligned_alloc", "aligned_alloc", 1, Out::AlignedAlloc),
    exit("valloc", "valloc", 1, Out::Valloc),
    exit("pvalloc", "pvalloc", 1, Out::Pvalloc),
    both("mremap", "mremap", 0, In::Mremap, Out::Mremap),
    entry("cfree", "cfree", 1, In::Free),
    exit("reallocarray", "reallocarray", 0, Out::ReallocArray),
    // operator new, 32-bit size_t
    exit("new(unsigned int)", "_Znwj", 1, Out::New),
    exit("new[](unsigned int)", "_Znaj", 1, Out::NewArray),
    exit("new(unsigned int, std::nothrow_t const&)", "_ZnwjRKSt9nothrow_t", 1, Out::New),
    exit("new[](unsigned int, std::nothrow_t const&)", "_ZnajRKSt9nothrow_t", 1, Out::NewArray),
    // operator new, 64-bit size_t
    exit("new(unsigned long)", "_Znwm", 1, Out::New),
    exit("new[](unsigned long)", "_Znam", 1, Out::NewArray),
    exit("new(unsigned long, std::nothrow_t const&)", "_ZnwmRKSt9nothrow_t", 1, Out::New),
    exit("new[](unsigned long, std::nothrow_t const&)", "_ZnamRKSt9nothrow_t", 1, Out::NewArray),
    // aligned operator new
    exit("new(unsigned int, std::align_val_t, std::nothrow_t const&)", "_ZnwjSt11align_val_tRKSt9nothrow_t", 1, Out::New),
    exit("new[](unsigned int, std::align_val_t, std::nothrow_t const&)", "_ZnajSt11align_val_tRKSt9nothrow_t", 1, Out::NewArray),
    exit("new(unsigned int, std::align_val_t)", "_ZnwjSt11align_val_t", 1, Out::New),
    exit("new[](unsigned int, std::align_val_t)", "_ZnajSt11align_val_t", 1, Out::NewArray),
    exit("new(unsigned long, std::align_val_t, std::nothrow_t const&)", "_ZnwmSt11align_val_tRKSt9nothrow_t", 1, Out::New),
    exit("new[](unsigned long, std::align_val_t, std::nothrow_t const&)", "_ZnamSt11align_val_tRKSt9nothrow_t", 1, Out::NewArray),
    exit("new(unsigned long, std::align_val_t)", "_ZnwmSt11align_val_t", 1, Out::New),
    exit("new[](unsigned long, std::align_val_t)", "_ZnamSt11align_val_t", 1, Out::NewArray),
    // operator delete
    entry("delete(void*)", "_ZdlPv", 1, In::Delete),
    entry("delete[](void*)", "_ZdaPv", 1, In::DeleteArray),
    entry("delete(void*, std::nothrow_t const&)", "_ZdlPvRKSt9nothrow_t", 1, In::Delete),
    entry("delete[](void*, std::nothrow_t const&)", "_ZdaPvRKSt9nothrow_t", 1, In::DeleteArray),
    entry("delete(void*, unsigned int)", "_ZdlPvj", 1, In::Delete),
    entry("delete[](void*, unsigned int)", "_ZdaPvj", 1, In::DeleteArray),
    entry("delete(void*, unsigned long)", "_ZdlPvm", 1, In::Delete),
    entry("delete[](void*, unsigned long)", "_ZdaPvm", 1, In::DeleteArray),
    // aligned operator delete
    entry("delete(void*, std::align_val_t)", "_ZdlPvSt11align_val_t", 1, In::Delete),
    entry("delete[](void*, std::align_val_t)", "_ZdaPvSt11align_val_t", 1, In::DeleteArray),
    entry("delete(void*, std::align_val_t, std::nothrow_t const&)", "_ZdlPvSt11align_val_tRKSt9nothrow_t", 1, In::Delete),
    entry("delete[](void*, std::align_val_t, std::nothrow_t const&)", "_ZdaPvSt11align_val_tRKSt9nothrow_t", 1, In::DeleteArray),
    entry("delete(void*, unsigned int, std::align_val_t)", "_ZdlPvjSt11align_val_t", 1, In::Delete),
    entry("delete[](void*, unsigned int, std::align_val_t)", "_ZdaPvjSt11align_val_t", 1, In::DeleteArray),
    entry("delete(void*, unsigned long, std::align_val_t)", "_ZdlPvmSt11align_val_t", 1, In::Delete),
    entry("delete[](void*, unsigned long, std::align_val_t)", "_ZdaPvmSt11align_val_t", 1, In::DeleteArray),
];

/// All rows of the table
pub fn intercepts() -> &'static [Intercept] {
    &INTERCEPTS
}

/// Find the row for `symbol_name`
///
/// Exact, case sensitive match. With `cpp_filtering` set, rows for mangled
/// C++ operators are skipped.
pub fn lookup(symbol_name: &str, cpp_filtering: bool) -> Option<&'static Intercept> {
    INTERCEPTS
        .iter()
        .filter(|f| !(cpp_filtering && f.cpp))
        .find(|f| f.name == symbol_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_lookup_malloc() {
        let f = lookup("malloc", false).unwrap();
        assert_eq!(f.on_exit, Some(ExitHook::Malloc));
        assert_eq!(f.on_entry, None);
        assert!(!f.cpp);
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        assert!(lookup("Malloc", false).is_none());
        assert!(lookup("MALLOC", false).is_none());
    }

    #[test]
    fn test_lookup_has_no_prefix_matching() {
        assert!(lookup("mall", false).is_none());
        assert!(lookup("malloc_usable_size", false).is_none());
        assert!(lookup("", false).is_none());
    }

    #[test]
    fn test_cpp_filtering_hides_operators() {
        assert!(lookup("_Znwm", false).is_some());
        assert!(lookup("_Znwm", true).is_none());
        assert!(lookup("_ZdaPv", true).is_none());
        // plain C entry points stay visible
        assert!(lookup("free", true).is_some());
    }

    #[test]
    fn test_every_row_has_a_handler() {
        for f in intercepts() {
            assert!(f.on_entry.is_some() || f.on_exit.is_some(), "{}", f.name);
        }
    }

    #[test]
    fn test_names_are_unique() {
        let names: HashSet<_> = intercepts().iter().map(|f| f.name).collect();
        assert_eq!(names.len(), intercepts().len());
    }

    #[test]
    fn test_mangled_rows_are_operators() {
        for f in intercepts().iter().filter(|f| f.cpp) {
            assert!(f.demangled.starts_with("new") || f.demangled.starts_with("delete"));
            assert_eq!(f.min_depth, 1);
        }
    }

    #[test]
    fn test_deallocators_fire_at_entry() {
        for name in ["free", "cfree", "munmap", "_ZdlPv", "_ZdaPvm"] {
            let f = lookup(name, false).unwrap();
            assert!(f.on_entry.is_some(), "{name}");
            assert!(f.on_exit.is_none(), "{name}");
        }
    }

    #[test]
    fn test_two_phase_rows() {
        for name in ["realloc", "mremap"] {
            let f = lookup(name, false).unwrap();
            assert!(f.on_entry.is_some() && f.on_exit.is_some());
        }
    }

    #[test]
    fn test_depth_override() {
        let new = lookup("_Znwm", false).unwrap();
        assert_eq!(new.depth(0), 1);
        assert_eq!(new.depth(12), 12);

        let malloc = lookup("malloc", false).unwrap();
        assert_eq!(malloc.depth(0), 0);
    }
}
