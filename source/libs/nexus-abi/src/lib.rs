// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(
    not(all(feature = "os", target_arch = "riscv64", target_os = "none")),
    forbid(unsafe_code)
)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Kernel ABI consumed by the user-level fork, fault and IPC runtime
//! OWNERS: @runtime
//! PUBLIC API: EnvId, Pte, PageFlags, FaultCode, UTrapframe, EnvInfo, Spawned, AbiError;
//!   traits Syscalls, VmView, EnvTable, UserMemory, Kernel; layout constants
//! DEPENDS_ON: no_std, bitflags, riscv ecall asm (feature `os`)
//! INVARIANTS: COW lives in a software-available PTE bit; `NO_PAGE` is never a user address;
//!   env ids encode their table slot in the low `LOG2NENV` bits

use core::fmt;

pub mod layout;
#[cfg(feature = "os")]
pub mod os;

pub use layout::*;

/// Result returned by kernel calls.
pub type SysResult<T> = core::result::Result<T, AbiError>;

/// Kernel environment identifier.
pub type EnvId = u32;

/// Identifier the kernel resolves to the calling environment.
pub const ENV_SELF: EnvId = 0;
/// log2 of the environment table size.
pub const LOG2NENV: u32 = 10;
/// Number of slots in the environment table.
pub const NENV: usize = 1 << LOG2NENV;
/// Shift of the generation counter inside an [`EnvId`].
pub const ENVGENSHIFT: u32 = 12;

/// Environment-table slot addressed by `id`.
pub const fn envx(id: EnvId) -> usize {
    id as usize & (NENV - 1)
}

bitflags::bitflags! {
    /// Page-table entry permission and status bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Mapping is present.
        const PRESENT = 1 << 0;
        /// Mapping is writable.
        const WRITABLE = 1 << 1;
        /// Mapping is reachable from user mode.
        const USER = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by hardware on access.
        const ACCESSED = 1 << 5;
        /// Set by hardware on write.
        const DIRTY = 1 << 6;
        /// Large page.
        const HUGE = 1 << 7;
        /// Global mapping.
        const GLOBAL = 1 << 8;
        /// Bits left to software.
        const AVAIL = 0xe00;
        /// Copy-on-write marker (one of the software bits).
        const COW = 0x800;
    }
}

impl PageFlags {
    /// Present, user, read-only.
    pub const UR: Self = Self::PRESENT.union(Self::USER);
    /// Present, user, writable.
    pub const URW: Self = Self::UR.union(Self::WRITABLE);
    /// Present, user, copy-on-write.
    pub const UCOW: Self = Self::UR.union(Self::COW);
    /// Bits a user environment may pass to mapping syscalls.
    pub const SYSCALL: Self = Self::URW.union(Self::AVAIL);

    /// Returns `true` for a permission set the mapping syscalls accept.
    pub const fn is_valid_syscall_perm(self) -> bool {
        self.contains(Self::UR) && Self::SYSCALL.contains(self)
    }

    /// Returns `true` when a write fault on this mapping may be resolved by copying.
    pub const fn is_cow(self) -> bool {
        self.contains(Self::UCOW)
    }
}

/// A page-table entry as seen through the read-only view: frame number plus flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pte(u32);

impl Pte {
    /// An absent entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry from a physical page number and flags.
    pub const fn new(ppn: u32, flags: PageFlags) -> Self {
        Self((ppn << PAGE_SHIFT) | (flags.bits() & 0xfff))
    }

    /// Reconstructs an entry from its raw encoding.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw encoding.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Physical page number.
    pub const fn ppn(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    /// Permission and status bits.
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & 0xfff)
    }

    /// Returns `true` when the present bit is set.
    pub const fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }
}

bitflags::bitflags! {
    /// Page-fault error code reported with a [`UTrapframe`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct FaultCode: u32 {
        /// Fault was a protection violation (page present); clear for not-present.
        const PROTECTION = 1 << 0;
        /// Faulting access was a write.
        const WRITE = 1 << 1;
        /// Fault happened in user mode.
        const USER = 1 << 2;
    }
}

/// Fault record the kernel pushes on the exception stack before entering the upcall.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Error code.
    pub err: FaultCode,
    /// Program counter at the time of the fault.
    pub pc: usize,
    /// Stack pointer at the time of the fault.
    pub sp: usize,
}

impl UTrapframe {
    /// Record for a fault at `fault_va` with `err`; registers are left zero.
    pub const fn new(fault_va: usize, err: FaultCode) -> Self {
        Self { fault_va, err, pc: 0, sp: 0 }
    }
}

/// Scheduling state of an environment.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvStatus {
    /// Slot unused.
    Free = 0,
    /// Being torn down.
    Dying = 1,
    /// Ready to run.
    Runnable = 2,
    /// Currently on a CPU.
    Running = 3,
    /// Exists but is not scheduled (fresh child, blocked receiver).
    NotRunnable = 4,
}

impl EnvStatus {
    /// Decodes a raw status word.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Dying),
            2 => Some(Self::Runnable),
            3 => Some(Self::Running),
            4 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

/// Role tag of an environment.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvType {
    /// Ordinary user program.
    User = 0,
    /// File-system server.
    Fs = 1,
    /// Network server.
    Ns = 2,
}

impl EnvType {
    /// Decodes a raw type tag.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::User),
            1 => Some(Self::Fs),
            2 => Some(Self::Ns),
            _ => None,
        }
    }
}

/// Snapshot of one live environment-table record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvInfo {
    /// Identifier.
    pub id: EnvId,
    /// Identifier of the creating environment (0 for boot environments).
    pub parent: EnvId,
    /// Role tag.
    pub env_type: EnvType,
    /// Scheduling state.
    pub status: EnvStatus,
    /// Blocked in `ipc_recv`.
    pub ipc_recving: bool,
    /// Value of the last delivered message.
    pub ipc_value: u32,
    /// Sender of the last delivered message.
    pub ipc_from: EnvId,
    /// Permission of the page transferred by the last message, empty if none.
    pub ipc_perm: PageFlags,
}

/// Outcome of [`Syscalls::exofork`]: the call returns once in each environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Spawned {
    /// Running in the freshly created child.
    Child,
    /// Running in the parent; carries the child's id.
    Parent(EnvId),
}

/// Errors reported by kernel calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiError {
    /// Unspecified kernel failure.
    Unspecified,
    /// Environment does not exist or the caller may not touch it.
    BadEnv,
    /// Invalid argument (address, permission, status).
    Inval,
    /// Out of physical memory.
    NoMem,
    /// Environment table is full.
    NoFreeEnv,
    /// Memory fault while accessing an argument.
    Fault,
    /// Target environment is not blocked in `ipc_recv`.
    IpcNotRecv,
    /// The call is not available on this backend.
    Unsupported,
}

impl AbiError {
    /// Kernel status code (positive; the kernel returns its negation).
    pub const fn code(self) -> i32 {
        match self {
            Self::Unspecified => 1,
            Self::BadEnv => 2,
            Self::Inval => 3,
            Self::NoMem => 4,
            Self::NoFreeEnv => 5,
            Self::Fault => 6,
            Self::IpcNotRecv => 7,
            Self::Unsupported => 38,
        }
    }

    /// Decodes a positive kernel status code.
    pub const fn from_code(code: i32) -> Self {
        match code {
            2 => Self::BadEnv,
            3 => Self::Inval,
            4 => Self::NoMem,
            5 => Self::NoFreeEnv,
            6 => Self::Fault,
            7 => Self::IpcNotRecv,
            38 => Self::Unsupported,
            _ => Self::Unspecified,
        }
    }
}

impl fmt::Display for AbiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => write!(f, "unspecified kernel error"),
            Self::BadEnv => write!(f, "bad environment"),
            Self::Inval => write!(f, "invalid parameter"),
            Self::NoMem => write!(f, "out of memory"),
            Self::NoFreeEnv => write!(f, "out of environments"),
            Self::Fault => write!(f, "segmentation fault"),
            Self::IpcNotRecv => write!(f, "env is not recving"),
            Self::Unsupported => write!(f, "syscall unsupported on this backend"),
        }
    }
}

impl core::error::Error for AbiError {}

/// Primitive calls the kernel offers to user environments.
///
/// `env` arguments accept [`ENV_SELF`] for the caller. Mapping calls require the target to be
/// the caller or one of its direct children.
pub trait Syscalls {
    /// Identifier of the calling environment.
    ///
    /// Fails with [`AbiError::BadEnv`] once the caller has been destroyed.
    fn getenvid(&self) -> SysResult<EnvId>;

    /// Gives up the rest of the time slice.
    fn yield_(&self);

    /// Creates a not-runnable clone of the caller's register state.
    fn exofork(&self) -> SysResult<Spawned>;

    /// Sets `env` to [`EnvStatus::Runnable`] or [`EnvStatus::NotRunnable`].
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()>;

    /// Sets the user entry point the kernel jumps to when `env` takes a page fault.
    fn env_set_pgfault_upcall(&self, env: EnvId, entry: usize) -> SysResult<()>;

    /// Destroys `env` and releases its pages.
    fn env_destroy(&self, env: EnvId) -> SysResult<()>;

    /// Maps a fresh zeroed page at `va` in `env`, replacing any mapping there.
    fn page_alloc(&self, env: EnvId, va: usize, perm: PageFlags) -> SysResult<()>;

    /// Maps the page at `src_va` in `src_env` at `dst_va` in `dst_env` with `perm`.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: usize,
        dst_env: EnvId,
        dst_va: usize,
        perm: PageFlags,
    ) -> SysResult<()>;

    /// Removes the mapping at `va` in `env`; unmapping nothing succeeds.
    fn page_unmap(&self, env: EnvId, va: usize) -> SysResult<()>;

    /// Delivers `value` (and the page at `src_va` unless it is [`NO_PAGE`]) if `to` is
    /// blocked in [`Syscalls::ipc_recv`]; fails with [`AbiError::IpcNotRecv`] otherwise.
    fn ipc_try_send(&self, to: EnvId, value: u32, src_va: usize, perm: PageFlags) -> SysResult<()>;

    /// Blocks until a message arrives; a transferred page is mapped at `dst_va` unless it
    /// is [`NO_PAGE`]. Results are deposited in the caller's environment record.
    fn ipc_recv(&self, dst_va: usize) -> SysResult<()>;
}

/// Read-only view of the caller's own page tables.
pub trait VmView {
    /// Entry for the page-table region `pdx`; present when the region has a page table.
    fn uvpd(&self, pdx: usize) -> Pte;

    /// Entry for page number `pn`. Only meaningful when its region is present.
    fn uvpt(&self, pn: usize) -> Pte;
}

/// Read-only view of the kernel's environment table.
pub trait EnvTable {
    /// Live record in slot `index`, `None` for free slots or indices past [`NENV`].
    fn env_at(&self, index: usize) -> Option<EnvInfo>;
}

/// Access to the caller's own memory.
pub trait UserMemory {
    /// Copies one page from `src_va` to `dst_va` in the caller's address space.
    fn copy_page(&self, dst_va: usize, src_va: usize) -> SysResult<()>;
}

/// Everything the user runtime needs from the kernel.
pub trait Kernel: Syscalls + VmView + EnvTable + UserMemory {}

impl<T: Syscalls + VmView + EnvTable + UserMemory + ?Sized> Kernel for T {}
