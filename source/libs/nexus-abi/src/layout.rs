// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! User address-space layout shared by the kernel and the user runtime.
//!
//! ```text
//!  KERNBASE  0xf000_0000  ---- kernel; never mappable from user space
//!  UTOP      0xeec0_0000  ---- exception stack page sits just below
//!  USTACKTOP UTOP - 2 pages
//!  UTEXT     0x0080_0000  ---- program text/data start
//!  PFTEMP    0x007f_f000  ---- scratch page used by the COW fault handler
//!  UTEMP     0x0040_0000
//! ```

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;
/// Page-table entries per page-table region.
pub const NPTENTRIES: usize = 1024;
/// log2 of the bytes covered by one page-table region.
pub const PT_SHIFT: u32 = 22;
/// Bytes covered by one page-table region.
pub const PT_SIZE: usize = PAGE_SIZE * NPTENTRIES;

/// Start of kernel space.
pub const KERNBASE: usize = 0xf000_0000;
/// Read-only environment table mapped into every user address space.
pub const UENVS: usize = 0xeec0_0000;
/// Top of user-mappable memory.
pub const UTOP: usize = UENVS;
/// Top of the one-page exception stack.
pub const UXSTACKTOP: usize = UTOP;
/// Top of the normal user stack (one guard page below the exception stack).
pub const USTACKTOP: usize = UTOP - 2 * PAGE_SIZE;
/// Start of program text.
pub const UTEXT: usize = 2 * PT_SIZE;
/// Temporary mapping area.
pub const UTEMP: usize = PT_SIZE;
/// Scratch slot the fault handler stages page copies in.
pub const PFTEMP: usize = UTEMP + PT_SIZE - PAGE_SIZE;
/// Base of the page exception stack.
pub const EXCEPTION_STACK: usize = UXSTACKTOP - PAGE_SIZE;
/// Read-only page-table view (recursive mapping) on the OS backend.
pub const UVPT: usize = 0xef40_0000;

/// Address passed to IPC calls when no page should be transferred.
///
/// Zero is a valid user address, so the sentinel must lie at or above [`UTOP`].
pub const NO_PAGE: usize = KERNBASE;

/// Page number containing `va`.
pub const fn page_number(va: usize) -> usize {
    va >> PAGE_SHIFT
}

/// Index of the page-table region containing `va`.
pub const fn pt_index(va: usize) -> usize {
    va >> PT_SHIFT
}

/// Virtual address of page number `pn`.
pub const fn page_address(pn: usize) -> usize {
    pn << PAGE_SHIFT
}

/// Rounds `va` down to its page boundary.
pub const fn round_down(va: usize) -> usize {
    va & !(PAGE_SIZE - 1)
}

/// Returns `true` when `va` is page aligned.
pub const fn is_page_aligned(va: usize) -> bool {
    va & (PAGE_SIZE - 1) == 0
}

/// Returns `true` when `va` names a page a user environment may map.
pub const fn is_user_page(va: usize) -> bool {
    va < UTOP && is_page_aligned(va)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_and_exception_stack_stay_out_of_the_fork_range() {
        assert!(PFTEMP < UTEXT);
        assert!(is_user_page(PFTEMP));
        assert_eq!(EXCEPTION_STACK, UTOP - PAGE_SIZE);
        assert!(USTACKTOP < EXCEPTION_STACK);
    }

    #[test]
    fn no_page_sentinel_is_not_mappable() {
        assert_ne!(NO_PAGE, 0);
        assert!(!is_user_page(NO_PAGE));
    }

    #[test]
    fn fork_range_is_region_aligned() {
        assert_eq!(UTEXT % PT_SIZE, 0);
        assert_eq!(UTOP % PT_SIZE, 0);
        assert_eq!(pt_index(UTEXT) * NPTENTRIES, page_number(UTEXT));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_down(UTEXT + 17), UTEXT);
        assert_eq!(page_address(page_number(UTEXT + PAGE_SIZE + 1)), UTEXT + PAGE_SIZE);
    }
}
