// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel-side bookkeeping of the emulator: environment slots, page tables and the
//! syscall semantics that operate on them. Everything here runs under the state lock.

use std::collections::BTreeMap;

use nexus_abi::{
    envx, is_page_aligned, is_user_page, page_number, AbiError, EnvId, EnvInfo, EnvStatus,
    EnvType, FaultCode, PageFlags, Pte, Spawned, SysResult, UTrapframe, ENVGENSHIFT, ENV_SELF,
    EXCEPTION_STACK, NENV, NPTENTRIES, PAGE_SIZE, UTOP,
};

use crate::frames::FrameTable;
use crate::Op;

pub(crate) struct Slot {
    pub(crate) info: EnvInfo,
    pub(crate) pages: BTreeMap<usize, Pte>,
    pub(crate) upcall: Option<usize>,
    pub(crate) ipc_dstva: usize,
    /// Set on a fresh child: its first `exofork` is the clone's resumed return.
    pub(crate) resume_as_child: bool,
    pub(crate) yields: u64,
    last_id: EnvId,
}

impl Slot {
    fn free(last_id: EnvId) -> Self {
        Self {
            info: EnvInfo {
                id: 0,
                parent: 0,
                env_type: EnvType::User,
                status: EnvStatus::Free,
                ipc_recving: false,
                ipc_value: 0,
                ipc_from: 0,
                ipc_perm: PageFlags::empty(),
            },
            pages: BTreeMap::new(),
            upcall: None,
            ipc_dstva: 0,
            resume_as_child: false,
            yields: 0,
            last_id,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.info.status != EnvStatus::Free
    }
}

struct Injection {
    op: Op,
    remaining: usize,
    err: AbiError,
}

/// A user access that trapped.
pub(crate) struct Trap {
    pub(crate) utf: UTrapframe,
    /// An upcall and a writable exception stack are in place.
    pub(crate) deliverable: bool,
}

pub(crate) struct State {
    pub(crate) slots: Vec<Slot>,
    pub(crate) frames: FrameTable,
    injections: Vec<Injection>,
}

impl State {
    pub(crate) fn new(frame_limit: Option<usize>) -> Self {
        Self {
            slots: (0..NENV).map(|_| Slot::free(0)).collect(),
            frames: FrameTable::new(frame_limit),
            injections: Vec::new(),
        }
    }

    pub(crate) fn inject(&mut self, op: Op, nth: usize, err: AbiError) {
        self.injections.push(Injection { op, remaining: nth.max(1), err });
    }

    /// Consumes one pending injection for `op`, failing the call when its count runs out.
    pub(crate) fn check_injected(&mut self, op: Op) -> SysResult<()> {
        let Some(pos) = self.injections.iter().position(|inj| inj.op == op) else {
            return Ok(());
        };
        let injection = &mut self.injections[pos];
        injection.remaining -= 1;
        if injection.remaining == 0 {
            let err = injection.err;
            self.injections.remove(pos);
            return Err(err);
        }
        Ok(())
    }

    /// Slot of the live environment `id`.
    pub(crate) fn caller(&self, id: EnvId) -> SysResult<usize> {
        let index = envx(id);
        match self.slots.get(index) {
            Some(slot) if slot.is_live() && slot.info.id == id => Ok(index),
            _ => Err(AbiError::BadEnv),
        }
    }

    /// Resolves `env` on behalf of `caller`; with `checkperm` only the caller itself or its
    /// direct children are accepted.
    fn resolve(&self, caller: usize, env: EnvId, checkperm: bool) -> SysResult<usize> {
        if env == ENV_SELF {
            return Ok(caller);
        }
        let index = self.caller(env)?;
        if checkperm && index != caller && self.slots[index].info.parent != self.slots[caller].info.id
        {
            return Err(AbiError::BadEnv);
        }
        Ok(index)
    }

    pub(crate) fn alloc_env(
        &mut self,
        parent: EnvId,
        env_type: EnvType,
        status: EnvStatus,
    ) -> SysResult<usize> {
        let index = self.slots.iter().position(|slot| !slot.is_live()).ok_or(AbiError::NoFreeEnv)?;
        let mask = !(NENV as u32 - 1);
        let mut generation = self.slots[index].last_id.wrapping_add(1 << ENVGENSHIFT) & mask;
        if generation == 0 || generation > i32::MAX as u32 {
            generation = 1 << ENVGENSHIFT;
        }
        let id = generation | index as u32;
        let slot = &mut self.slots[index];
        *slot = Slot::free(id);
        slot.info.id = id;
        slot.info.parent = parent;
        slot.info.env_type = env_type;
        slot.info.status = status;
        Ok(index)
    }

    fn install(&mut self, index: usize, va: usize, pte: Pte) {
        self.frames.incref(pte.ppn());
        if let Some(old) = self.slots[index].pages.insert(page_number(va), pte) {
            self.frames.decref(old.ppn());
        }
    }

    fn release(&mut self, index: usize) {
        let pages = std::mem::take(&mut self.slots[index].pages);
        for pte in pages.values() {
            self.frames.decref(pte.ppn());
        }
        let last_id = self.slots[index].info.id;
        self.slots[index] = Slot::free(last_id);
    }

    pub(crate) fn exofork(&mut self, caller: usize) -> SysResult<Spawned> {
        if std::mem::take(&mut self.slots[caller].resume_as_child) {
            return Ok(Spawned::Child);
        }
        let parent = self.slots[caller].info.id;
        let child = self.alloc_env(parent, EnvType::User, EnvStatus::NotRunnable)?;
        self.slots[child].resume_as_child = true;
        Ok(Spawned::Parent(self.slots[child].info.id))
    }

    pub(crate) fn env_set_status(
        &mut self,
        caller: usize,
        env: EnvId,
        status: EnvStatus,
    ) -> SysResult<()> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(AbiError::Inval);
        }
        let index = self.resolve(caller, env, true)?;
        self.slots[index].info.status = status;
        Ok(())
    }

    pub(crate) fn env_set_pgfault_upcall(
        &mut self,
        caller: usize,
        env: EnvId,
        entry: usize,
    ) -> SysResult<()> {
        let index = self.resolve(caller, env, true)?;
        self.slots[index].upcall = Some(entry);
        Ok(())
    }

    pub(crate) fn env_destroy(&mut self, caller: usize, env: EnvId) -> SysResult<()> {
        let index = self.resolve(caller, env, true)?;
        self.release(index);
        Ok(())
    }

    pub(crate) fn page_alloc(
        &mut self,
        caller: usize,
        env: EnvId,
        va: usize,
        perm: PageFlags,
    ) -> SysResult<()> {
        let index = self.resolve(caller, env, true)?;
        check_va(va)?;
        check_perm(perm)?;
        let ppn = self.frames.alloc()?;
        self.install(index, va, Pte::new(ppn, perm));
        Ok(())
    }

    pub(crate) fn page_map(
        &mut self,
        caller: usize,
        (src_env, src_va): (EnvId, usize),
        (dst_env, dst_va): (EnvId, usize),
        perm: PageFlags,
    ) -> SysResult<()> {
        let src = self.resolve(caller, src_env, true)?;
        let dst = self.resolve(caller, dst_env, true)?;
        check_va(src_va)?;
        check_va(dst_va)?;
        let pte = *self.slots[src].pages.get(&page_number(src_va)).ok_or(AbiError::Inval)?;
        check_perm(perm)?;
        if perm.contains(PageFlags::WRITABLE) && !pte.flags().contains(PageFlags::WRITABLE) {
            return Err(AbiError::Inval);
        }
        self.install(dst, dst_va, Pte::new(pte.ppn(), perm));
        Ok(())
    }

    pub(crate) fn page_unmap(&mut self, caller: usize, env: EnvId, va: usize) -> SysResult<()> {
        let index = self.resolve(caller, env, true)?;
        check_va(va)?;
        if let Some(old) = self.slots[index].pages.remove(&page_number(va)) {
            self.frames.decref(old.ppn());
        }
        Ok(())
    }

    pub(crate) fn ipc_try_send(
        &mut self,
        caller: usize,
        to: EnvId,
        value: u32,
        src_va: usize,
        perm: PageFlags,
    ) -> SysResult<()> {
        let target = self.resolve(caller, to, false)?;
        if !self.slots[target].info.ipc_recving {
            return Err(AbiError::IpcNotRecv);
        }
        let mut delivered = PageFlags::empty();
        if src_va < UTOP {
            if !is_page_aligned(src_va) {
                return Err(AbiError::Inval);
            }
            check_perm(perm)?;
            let pte =
                *self.slots[caller].pages.get(&page_number(src_va)).ok_or(AbiError::Inval)?;
            if perm.contains(PageFlags::WRITABLE) && !pte.flags().contains(PageFlags::WRITABLE) {
                return Err(AbiError::Inval);
            }
            let dst_va = self.slots[target].ipc_dstva;
            if dst_va < UTOP {
                self.install(target, dst_va, Pte::new(pte.ppn(), perm));
                delivered = perm;
            }
        }
        let from = self.slots[caller].info.id;
        let info = &mut self.slots[target].info;
        info.ipc_recving = false;
        info.ipc_from = from;
        info.ipc_value = value;
        info.ipc_perm = delivered;
        info.status = EnvStatus::Runnable;
        Ok(())
    }

    /// Marks `caller` as blocked in a receive; the wait itself happens outside.
    pub(crate) fn begin_recv(&mut self, caller: usize, dst_va: usize) -> SysResult<()> {
        if dst_va < UTOP && !is_page_aligned(dst_va) {
            return Err(AbiError::Inval);
        }
        let slot = &mut self.slots[caller];
        slot.ipc_dstva = dst_va;
        slot.info.ipc_recving = true;
        slot.info.status = EnvStatus::NotRunnable;
        Ok(())
    }

    pub(crate) fn uvpd(&self, caller: usize, pdx: usize) -> Pte {
        let first = pdx.saturating_mul(NPTENTRIES);
        let end = first.saturating_add(NPTENTRIES);
        match self.slots[caller].pages.range(first..end).next() {
            Some(_) => Pte::new(0, PageFlags::URW),
            None => Pte::EMPTY,
        }
    }

    pub(crate) fn uvpt(&self, caller: usize, pn: usize) -> Pte {
        self.slots[caller].pages.get(&pn).copied().unwrap_or(Pte::EMPTY)
    }

    pub(crate) fn copy_page(&mut self, caller: usize, dst_va: usize, src_va: usize) -> SysResult<()> {
        check_va(dst_va)?;
        check_va(src_va)?;
        let pages = &self.slots[caller].pages;
        let src = pages.get(&page_number(src_va)).copied().unwrap_or(Pte::EMPTY);
        let dst = pages.get(&page_number(dst_va)).copied().unwrap_or(Pte::EMPTY);
        if !src.flags().contains(PageFlags::UR) || !dst.flags().contains(PageFlags::URW) {
            return Err(AbiError::Fault);
        }
        self.frames.copy(dst.ppn(), src.ppn())
    }

    /// Emulates a user-mode store of `chunk` at `va`; `chunk` must not cross a page.
    pub(crate) fn user_write(&mut self, caller: usize, va: usize, chunk: &[u8]) -> Result<(), Trap> {
        let pte = self.uvpt(caller, page_number(va));
        if !pte.flags().contains(PageFlags::URW) {
            let mut err = FaultCode::WRITE | FaultCode::USER;
            if pte.is_present() {
                err |= FaultCode::PROTECTION;
            }
            let deliverable = self.slots[caller].upcall.is_some()
                && self.uvpt(caller, page_number(EXCEPTION_STACK)).flags().contains(PageFlags::URW);
            return Err(Trap { utf: UTrapframe::new(va, err), deliverable });
        }
        let offset = va % PAGE_SIZE;
        if let Some(bytes) = self.frames.bytes_mut(pte.ppn()) {
            bytes[offset..offset + chunk.len()].copy_from_slice(chunk);
        }
        Ok(())
    }

    /// Emulates a user-mode load of `out.len()` bytes at `va`; must not cross a page.
    pub(crate) fn user_read(&self, caller: usize, va: usize, out: &mut [u8]) -> Result<(), UTrapframe> {
        let pte = self.uvpt(caller, page_number(va));
        if !pte.flags().contains(PageFlags::UR) {
            return Err(UTrapframe::new(va, FaultCode::USER));
        }
        let offset = va % PAGE_SIZE;
        if let Some(bytes) = self.frames.bytes(pte.ppn()) {
            out.copy_from_slice(&bytes[offset..offset + out.len()]);
        }
        Ok(())
    }
}

fn check_va(va: usize) -> SysResult<()> {
    if is_user_page(va) {
        Ok(())
    } else {
        Err(AbiError::Inval)
    }
}

fn check_perm(perm: PageFlags) -> SysResult<()> {
    if perm.is_valid_syscall_perm() {
        Ok(())
    } else {
        Err(AbiError::Inval)
    }
}
