// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User-level copy-on-write fork
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests + integration tests against nexus-sim (incl. proptest)
//!
//! PUBLIC API:
//!   - Process: per-environment runtime context (identity, upcall entry, fault handler)
//!   - Process::fork(): duplicate the caller with copy-on-write sharing
//!   - Process::set_fault_handler()/dispatch_fault(): user-level page-fault handling
//!   - Process::duppage(): share one page with a child
//!   - ForkError/Step: fatal conditions naming the step that failed
//!
//! DEPENDENCIES:
//!   - nexus-abi: kernel traits and address-space layout
//!   - nexus-ipc: message passing on behalf of the process
//!   - thiserror/log: error derive and diagnostics
//!
//! INVARIANTS:
//!   - A child page is mapped before the parent's own mapping is downgraded
//!   - The exception stack is never shared; each child gets a fresh one
//!   - The scratch slot is unmapped again before a fault handler returns

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod duppage;
mod fork;
mod pgfault;

use core::fmt;

pub use pgfault::cow_fault;

use nexus_abi::{AbiError, EnvId, EnvType, FaultCode, Kernel, UTrapframe};
use nexus_ipc::{IpcError, KernelYield, Page, Received, Retry};

/// Result alias for fork and fault handling.
pub type Result<T> = core::result::Result<T, ForkError>;

/// User-level page-fault handler.
pub type FaultHandler<K> = fn(&Process<K>, &UTrapframe) -> Result<()>;

/// Kernel call a fatal failure happened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Allocating the caller's exception stack.
    ExceptionStack,
    /// Registering the caller's fault upcall.
    RegisterUpcall,
    /// Creating the child environment.
    Spawn,
    /// Sharing the page at `va` with the child.
    Duplicate {
        /// Page address.
        va: usize,
    },
    /// Allocating the child's exception stack.
    ChildStack,
    /// Registering the child's fault upcall.
    ChildUpcall,
    /// Marking the child runnable.
    ChildStatus,
    /// Asking the kernel for the caller's identity.
    Identity,
    /// Allocating the scratch page during a fault.
    ScratchAlloc,
    /// Copying the faulting page into the scratch page.
    ScratchCopy,
    /// Moving the scratch page over the faulting page.
    ScratchMap,
    /// Releasing the scratch slot.
    ScratchUnmap,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExceptionStack => write!(f, "exception stack allocation"),
            Self::RegisterUpcall => write!(f, "fault upcall registration"),
            Self::Spawn => write!(f, "exofork"),
            Self::Duplicate { va } => write!(f, "duplicating page {va:#x}"),
            Self::ChildStack => write!(f, "child exception stack allocation"),
            Self::ChildUpcall => write!(f, "child fault upcall registration"),
            Self::ChildStatus => write!(f, "marking child runnable"),
            Self::Identity => write!(f, "identity lookup"),
            Self::ScratchAlloc => write!(f, "scratch page allocation"),
            Self::ScratchCopy => write!(f, "scratch page copy"),
            Self::ScratchMap => write!(f, "scratch page remap"),
            Self::ScratchUnmap => write!(f, "scratch page unmap"),
        }
    }
}

/// Why a page fault cannot be resolved by copying.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCause {
    /// The access was a read.
    NotWrite,
    /// No page table covers the address.
    NoPageTable,
    /// The page is absent or not marked copy-on-write.
    NotCopyOnWrite,
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotWrite => write!(f, "not a write"),
            Self::NoPageTable => write!(f, "no page table"),
            Self::NotCopyOnWrite => write!(f, "page not copy-on-write"),
        }
    }
}

/// Fatal conditions of fork and fault handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ForkError {
    /// A page fault the copy-on-write handler does not own.
    #[error("unexpected page fault at {va:#x} ({err:?}): {cause}")]
    Fault {
        /// Faulting address.
        va: usize,
        /// Error code delivered with the fault.
        err: FaultCode,
        /// What disqualified it.
        cause: FaultCause,
    },
    /// A kernel call failed.
    #[error("{step} failed: {err}")]
    Syscall {
        /// Where it failed.
        step: Step,
        /// Kernel status.
        err: AbiError,
    },
    /// A fault arrived before any handler was registered.
    #[error("page fault at {va:#x} with no handler registered")]
    NoHandler {
        /// Faulting address.
        va: usize,
    },
    /// Shared-memory fork.
    #[error("sfork is not implemented")]
    Unimplemented,
}

pub(crate) fn at(step: Step) -> impl FnOnce(AbiError) -> ForkError {
    move |err| ForkError::Syscall { step, err }
}

/// How a page ended up shared between parent and child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sharing {
    /// Read-only in both; the parent's mapping was left alone.
    ReadOnly,
    /// Copy-on-write in both.
    CopyOnWrite,
}

/// Logs `err` and aborts the environment.
pub fn fatal(err: &ForkError) -> ! {
    log::error!("fork: fatal: {err}");
    panic!("{err}")
}

/// Runtime context of one environment.
///
/// Holds what a C runtime would keep in globals: the cached identity, the fault upcall
/// entry address, the registered fault handler and the send retry policy.
pub struct Process<K> {
    kernel: K,
    this_env: EnvId,
    upcall: usize,
    handler: Option<FaultHandler<K>>,
    send_retry: Retry,
}

impl<K: Kernel> Process<K> {
    /// Context for the environment behind `kernel`; faults enter user space at `upcall`.
    pub fn new(kernel: K, upcall: usize) -> Result<Self> {
        let this_env = kernel.getenvid().map_err(at(Step::Identity))?;
        Ok(Self { kernel, this_env, upcall, handler: None, send_retry: Retry::Forever })
    }

    /// Uses `policy` for [`Process::ipc_send`].
    pub fn with_send_retry(mut self, policy: Retry) -> Self {
        self.send_retry = policy;
        self
    }

    /// Cached identity.
    pub fn this_env(&self) -> EnvId {
        self.this_env
    }

    /// Kernel handle.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Fault upcall entry address.
    pub fn upcall(&self) -> usize {
        self.upcall
    }

    /// Asks the kernel who we are and caches the answer.
    pub fn refresh_identity(&mut self) -> Result<EnvId> {
        self.this_env = self.kernel.getenvid().map_err(at(Step::Identity))?;
        Ok(self.this_env)
    }

    /// The context as a freshly forked child finds it in its copy of memory: everything,
    /// including the now stale identity, carried over to run on `kernel`.
    pub fn snapshot_with(&self, kernel: K) -> Self {
        Self {
            kernel,
            this_env: self.this_env,
            upcall: self.upcall,
            handler: self.handler,
            send_retry: self.send_retry,
        }
    }

    /// Sends one message using the context's retry policy.
    pub fn ipc_send(
        &self,
        to: EnvId,
        value: u32,
        page: Option<Page>,
    ) -> core::result::Result<(), IpcError> {
        nexus_ipc::send_with(
            &self.kernel,
            &KernelYield(&self.kernel),
            self.send_retry,
            to,
            value,
            page,
        )
    }

    /// Receives one message addressed to this environment.
    ///
    /// Fails with [`AbiError::BadEnv`] without consuming anything if the cached identity
    /// is stale; a forked child must [`Process::refresh_identity`] first, as
    /// [`Process::fork`] does.
    pub fn ipc_recv(&self, dst: Option<usize>) -> core::result::Result<Received, AbiError> {
        nexus_ipc::recv(&self.kernel, self.this_env, dst)
    }

    /// First live environment with role `env_type`.
    pub fn find_env(&self, env_type: EnvType) -> Option<EnvId> {
        nexus_ipc::find_env(&self.kernel, env_type)
    }
}
