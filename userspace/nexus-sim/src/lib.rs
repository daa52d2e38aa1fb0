// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process emulation of the kernel surface for host-based testing
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - struct SimKernel: shared emulated kernel (environment table, frames, IPC)
//!   - struct SimEnv: handle through which one environment issues syscalls
//!   - SimEnv::store()/load(): user-mode memory accesses with fault delivery
//!   - SimKernel::fail_nth(): deterministic syscall failure injection
//!
//! SECURITY INVARIANTS:
//!   - Mapping syscalls only reach the caller or its direct children
//!   - Writable mappings can only be derived from writable mappings
//!   - Frames are reference counted and released with their last mapping
//!
//! ERROR CONDITIONS:
//!   - AbiError::BadEnv: unknown environment or insufficient permission
//!   - AbiError::Inval: misaligned/out-of-range address, bad permission, missing source page
//!   - AbiError::NoMem: frame limit reached
//!   - AbiError::IpcNotRecv: IPC target is not blocked in a receive
//!
//! DEPENDENCIES:
//!   - parking_lot::{Mutex, Condvar}: state lock and receive wake-ups
//!
//! FEATURES:
//!   - `exofork` returning once per environment (`Spawned::Parent` then `Spawned::Child`)
//!   - Blocking rendezvous receive, non-blocking try-send
//!   - Page-fault delivery through a caller-supplied upcall

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod frames;
mod state;

use std::fmt;
use std::sync::Arc;

use nexus_abi::{
    page_number, AbiError, EnvId, EnvInfo, EnvStatus, EnvTable, EnvType, PageFlags, Pte,
    Spawned, SysResult, Syscalls, UTrapframe, UserMemory, VmView, NENV, PAGE_SIZE,
};
use parking_lot::{Condvar, Mutex};

use crate::state::State;

/// Syscalls that accept injected failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// [`Syscalls::exofork`].
    Exofork,
    /// [`Syscalls::env_set_status`].
    EnvSetStatus,
    /// [`Syscalls::env_set_pgfault_upcall`].
    EnvSetPgfaultUpcall,
    /// [`Syscalls::env_destroy`].
    EnvDestroy,
    /// [`Syscalls::page_alloc`].
    PageAlloc,
    /// [`Syscalls::page_map`].
    PageMap,
    /// [`Syscalls::page_unmap`].
    PageUnmap,
    /// [`Syscalls::ipc_try_send`].
    IpcTrySend,
    /// [`Syscalls::ipc_recv`].
    IpcRecv,
}

/// A user-mode access that could not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SimFault {
    /// No upcall or no exception stack; a kernel would destroy the environment.
    #[error("unhandled page fault: {0:?}")]
    Unhandled(UTrapframe),
    /// The upcall reported failure.
    #[error("fault handler failed: {0:?}")]
    HandlerFailed(UTrapframe),
    /// The access faulted again after the upcall returned.
    #[error("access still faults after the handler ran: {0:?}")]
    Repeated(UTrapframe),
    /// The accessing environment no longer exists.
    #[error("environment {0:#x} is gone")]
    NoSuchEnv(EnvId),
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

/// Emulated kernel shared by every [`SimEnv`] handle.
#[derive(Clone)]
pub struct SimKernel {
    shared: Arc<Shared>,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    /// Creates a kernel with unlimited frames.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a kernel that fails allocations with [`AbiError::NoMem`] past `limit` frames.
    pub fn with_frame_limit(limit: usize) -> Self {
        Self::build(Some(limit))
    }

    fn build(limit: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared { state: Mutex::new(State::new(limit)), wakeup: Condvar::new() }),
        }
    }

    /// Creates a runnable boot environment with an empty address space.
    pub fn spawn_root(&self, env_type: EnvType) -> SysResult<SimEnv> {
        let mut state = self.shared.state.lock();
        let index = state.alloc_env(0, env_type, EnvStatus::Runnable)?;
        let id = state.slots[index].info.id;
        log::debug!("sim: boot env {id:#x} ({env_type:?})");
        Ok(self.env(id))
    }

    /// Handle acting as environment `id`.
    pub fn env(&self, id: EnvId) -> SimEnv {
        SimEnv { shared: Arc::clone(&self.shared), id }
    }

    /// Entry mapping `va` in `env`, as the kernel sees it.
    pub fn pte(&self, env: EnvId, va: usize) -> Pte {
        let state = self.shared.state.lock();
        state.caller(env).map_or(Pte::EMPTY, |index| state.uvpt(index, page_number(va)))
    }

    /// Status of `env`, `None` once destroyed.
    pub fn status(&self, env: EnvId) -> Option<EnvStatus> {
        let state = self.shared.state.lock();
        state.caller(env).ok().map(|index| state.slots[index].info.status)
    }

    /// Upcall entry registered for `env`.
    pub fn upcall(&self, env: EnvId) -> Option<usize> {
        let state = self.shared.state.lock();
        state.caller(env).ok().and_then(|index| state.slots[index].upcall)
    }

    /// Frames currently referenced by at least one mapping.
    pub fn frames_in_use(&self) -> usize {
        self.shared.state.lock().frames.live()
    }

    /// Number of mappings referencing frame `ppn`.
    pub fn frame_refs(&self, ppn: u32) -> usize {
        self.shared.state.lock().frames.refs(ppn)
    }

    /// Makes the `nth` next call of `op` (1 = the very next one) fail with `err`.
    pub fn fail_nth(&self, op: Op, nth: usize, err: AbiError) {
        self.shared.state.lock().inject(op, nth, err);
    }
}

/// One environment's view of the emulated kernel.
#[derive(Clone)]
pub struct SimEnv {
    shared: Arc<Shared>,
    id: EnvId,
}

impl fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEnv").field("id", &format_args!("{:#x}", self.id)).finish()
    }
}

impl SimEnv {
    /// Identifier of this environment.
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// The kernel this handle belongs to.
    pub fn kernel(&self) -> SimKernel {
        SimKernel { shared: Arc::clone(&self.shared) }
    }

    /// Number of times this environment yielded.
    pub fn yield_count(&self) -> u64 {
        let state = self.shared.state.lock();
        state.caller(self.id).map_or(0, |index| state.slots[index].yields)
    }

    /// Stores `bytes` at `va` as user code would.
    ///
    /// A store that traps is delivered to `upcall` when the environment has an upcall and
    /// an exception stack, then retried once. `upcall` runs without the kernel lock held.
    pub fn store(
        &self,
        va: usize,
        bytes: &[u8],
        upcall: &mut dyn FnMut(&UTrapframe) -> bool,
    ) -> Result<(), SimFault> {
        let mut offset = 0;
        while offset < bytes.len() {
            let addr = va + offset;
            let len = (PAGE_SIZE - addr % PAGE_SIZE).min(bytes.len() - offset);
            let chunk = &bytes[offset..offset + len];
            let mut delivered = false;
            loop {
                let attempt = {
                    let mut state = self.shared.state.lock();
                    let caller = state.caller(self.id).map_err(|_| SimFault::NoSuchEnv(self.id))?;
                    state.user_write(caller, addr, chunk)
                };
                let trap = match attempt {
                    Ok(()) => break,
                    Err(trap) => trap,
                };
                if delivered {
                    return Err(SimFault::Repeated(trap.utf));
                }
                if !trap.deliverable {
                    return Err(SimFault::Unhandled(trap.utf));
                }
                if !upcall(&trap.utf) {
                    return Err(SimFault::HandlerFailed(trap.utf));
                }
                delivered = true;
            }
            offset += len;
        }
        Ok(())
    }

    /// Loads `len` bytes at `va` as user code would; read faults are never resolved.
    pub fn load(&self, va: usize, len: usize) -> Result<Vec<u8>, SimFault> {
        let state = self.shared.state.lock();
        let caller = state.caller(self.id).map_err(|_| SimFault::NoSuchEnv(self.id))?;
        let mut out = vec![0; len];
        let mut offset = 0;
        while offset < len {
            let addr = va + offset;
            let chunk = (PAGE_SIZE - addr % PAGE_SIZE).min(len - offset);
            state
                .user_read(caller, addr, &mut out[offset..offset + chunk])
                .map_err(SimFault::Unhandled)?;
            offset += chunk;
        }
        Ok(out)
    }

    fn call<T>(&self, op: Op, f: impl FnOnce(&mut State, usize) -> SysResult<T>) -> SysResult<T> {
        let mut state = self.shared.state.lock();
        let result = match state.caller(self.id) {
            Ok(caller) => state.check_injected(op).and_then(|()| f(&mut *state, caller)),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            log::debug!("sim: env {:#x} {op:?} rejected: {err}", self.id);
        }
        result
    }
}

impl Syscalls for SimEnv {
    fn getenvid(&self) -> SysResult<EnvId> {
        self.shared.state.lock().caller(self.id).map(|_| self.id)
    }

    fn yield_(&self) {
        {
            let mut state = self.shared.state.lock();
            if let Ok(index) = state.caller(self.id) {
                state.slots[index].yields += 1;
            }
        }
        std::thread::yield_now();
    }

    fn exofork(&self) -> SysResult<Spawned> {
        self.call(Op::Exofork, |state, caller| state.exofork(caller))
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        self.call(Op::EnvSetStatus, |state, caller| state.env_set_status(caller, env, status))
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, entry: usize) -> SysResult<()> {
        self.call(Op::EnvSetPgfaultUpcall, |state, caller| {
            state.env_set_pgfault_upcall(caller, env, entry)
        })
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        let result = self.call(Op::EnvDestroy, |state, caller| state.env_destroy(caller, env));
        self.shared.wakeup.notify_all();
        result
    }

    fn page_alloc(&self, env: EnvId, va: usize, perm: PageFlags) -> SysResult<()> {
        self.call(Op::PageAlloc, |state, caller| state.page_alloc(caller, env, va, perm))
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: usize,
        dst_env: EnvId,
        dst_va: usize,
        perm: PageFlags,
    ) -> SysResult<()> {
        self.call(Op::PageMap, |state, caller| {
            state.page_map(caller, (src_env, src_va), (dst_env, dst_va), perm)
        })
    }

    fn page_unmap(&self, env: EnvId, va: usize) -> SysResult<()> {
        self.call(Op::PageUnmap, |state, caller| state.page_unmap(caller, env, va))
    }

    fn ipc_try_send(&self, to: EnvId, value: u32, src_va: usize, perm: PageFlags) -> SysResult<()> {
        let result = self.call(Op::IpcTrySend, |state, caller| {
            state.ipc_try_send(caller, to, value, src_va, perm)
        });
        if result.is_ok() {
            self.shared.wakeup.notify_all();
        }
        result
    }

    fn ipc_recv(&self, dst_va: usize) -> SysResult<()> {
        let mut state = self.shared.state.lock();
        let caller = state.caller(self.id)?;
        state.check_injected(Op::IpcRecv)?;
        state.begin_recv(caller, dst_va)?;
        loop {
            if state.caller(self.id).is_err() {
                return Err(AbiError::BadEnv);
            }
            if !state.slots[caller].info.ipc_recving {
                return Ok(());
            }
            self.shared.wakeup.wait(&mut state);
        }
    }
}

impl VmView for SimEnv {
    fn uvpd(&self, pdx: usize) -> Pte {
        let state = self.shared.state.lock();
        state.caller(self.id).map_or(Pte::EMPTY, |caller| state.uvpd(caller, pdx))
    }

    fn uvpt(&self, pn: usize) -> Pte {
        let state = self.shared.state.lock();
        state.caller(self.id).map_or(Pte::EMPTY, |caller| state.uvpt(caller, pn))
    }
}

impl EnvTable for SimEnv {
    fn env_at(&self, index: usize) -> Option<EnvInfo> {
        if index >= NENV {
            return None;
        }
        let state = self.shared.state.lock();
        let slot = &state.slots[index];
        slot.is_live().then_some(slot.info)
    }
}

impl UserMemory for SimEnv {
    fn copy_page(&self, dst_va: usize, src_va: usize) -> SysResult<()> {
        let mut state = self.shared.state.lock();
        let caller = state.caller(self.id)?;
        state.copy_page(caller, dst_va, src_va)
    }
}
